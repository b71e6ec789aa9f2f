use crmgate_core::domain::records::{text, CrmRecord, FromCrmRecord, QueuedCase, SupportCase};
use crmgate_core::{
    summarize_queue, CallScope, Filter, OrderBy, QuerySpec, SessionContext, ToolError, ToolResponse, WritePlan,
    WriteRequest,
};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::{is_skippable, payload, write_payload, CrmToolService};
use crate::params::{CreateCaseParams, GetCaseParams, GetCaseQueueSummaryParams, UpdateCaseParams};
use crate::validation::{optional_record_id, optional_text, record_id, required_text};

const RECENT_COMMENT_LIMIT: u32 = 5;

/// Open cases read for one queue summary.
const QUEUE_SCAN_LIMIT: u32 = 500;

#[derive(Debug, Serialize)]
struct CaseDetail {
    case: SupportCase,
}

#[derive(Debug, Serialize)]
struct CaseCreated {
    case_id: String,
    success: bool,
    message: String,
}

#[derive(Debug, Serialize)]
struct CaseUpdated {
    success: bool,
    message: String,
    updated_fields: Vec<&'static str>,
}

impl CrmToolService {
    pub async fn get_case(&self, session: &SessionContext, params: GetCaseParams) -> ToolResponse {
        let run = self.begin("get_case", session);
        let outcome = self.case_detail(&run.scope, params).await;
        run.finish(outcome)
    }

    async fn case_detail(&self, scope: &CallScope<'_>, params: GetCaseParams) -> Result<Value, ToolError> {
        let (filter, label) = if let Some(case_id) = optional_record_id("case_id", params.case_id.as_deref())? {
            (Filter::eq("Id", case_id), format!("ID '{case_id}'"))
        } else if let Some(case_number) = optional_text(params.case_number.as_deref()) {
            (Filter::eq("CaseNumber", case_number), format!("number '{case_number}'"))
        } else {
            return Err(ToolError::invalid_input("Either case_id or case_number is required."));
        };

        let spec = QuerySpec::new(SupportCase::OBJECT, SupportCase::FIELDS).filter(Some(filter)).limit(1);
        let result = self.executor.fetch::<SupportCase>(scope, spec).await?;
        let Some(mut case) = result.records.into_iter().next() else {
            return Err(ToolError::not_found(format!("Case with {label} not found.")));
        };

        case.recent_comments = self.recent_comments(scope, &case.id).await?;
        payload(&CaseDetail { case })
    }

    /// Newest comments first. Comment visibility varies by org, so a
    /// refused read leaves the list empty.
    async fn recent_comments(&self, scope: &CallScope<'_>, case_id: &str) -> Result<Vec<String>, ToolError> {
        let spec = QuerySpec::new("CaseComment", &["CommentBody"])
            .filter(Some(Filter::eq("ParentId", case_id)))
            .order_by(OrderBy::desc("CreatedDate"))
            .limit(RECENT_COMMENT_LIMIT);
        match self.executor.fetch_raw(scope, spec).await {
            Ok(result) => Ok(result.records.iter().filter_map(|row| text(row, "CommentBody")).collect()),
            Err(error) if is_skippable(&error) => {
                debug!(event_name = "tool.case_comments_skipped", error = %error, "case comments unavailable");
                Ok(Vec::new())
            }
            Err(error) => Err(error.into()),
        }
    }

    pub async fn create_case(&self, session: &SessionContext, params: CreateCaseParams) -> ToolResponse {
        let run = self.begin("create_case", session);
        let outcome = self.open_case(&run.scope, params).await;
        run.finish(outcome)
    }

    async fn open_case(&self, scope: &CallScope<'_>, params: CreateCaseParams) -> Result<Value, ToolError> {
        let subject = required_text("subject", &params.subject)?;
        let priority = required_text("priority", &params.priority)?;
        let account_id = optional_record_id("account_id", params.account_id.as_deref())?;
        let contact_id = optional_record_id("contact_id", params.contact_id.as_deref())?;
        let case_type = optional_text(params.case_type.as_deref());

        let mut fields = CrmRecord::new();
        fields.insert("Subject".into(), subject.into());
        fields.insert("Priority".into(), priority.into());
        if let Some(description) = optional_text(params.description.as_deref()) {
            fields.insert("Description".into(), description.into());
        }
        if let Some(case_type) = case_type {
            fields.insert("Type".into(), case_type.into());
        }
        if let Some(account_id) = account_id {
            fields.insert("AccountId".into(), account_id.into());
        }
        if let Some(contact_id) = contact_id {
            fields.insert("ContactId".into(), contact_id.into());
        }

        let mut summary = format!("Create a {priority} priority case '{subject}'");
        if let Some(case_type) = case_type {
            summary.push_str(&format!(" of type {case_type}"));
        }
        if let Some(account_id) = account_id {
            summary.push_str(&format!(" on account {account_id}"));
        }

        let plan = WritePlan::new("create_case", SupportCase::OBJECT, summary)
            .create(SupportCase::OBJECT, fields)
            .key("Subject", subject)
            .key("AccountId", account_id.unwrap_or_default())
            .key("ContactId", contact_id.unwrap_or_default());
        let outcome = self.writes.submit(scope, WriteRequest::from_flag(plan, params.confirmed)).await?;

        write_payload(outcome, |receipt| CaseCreated {
            case_id: receipt.result.record_id.clone(),
            success: true,
            message: format!("Case '{subject}' created successfully."),
        })
    }

    pub async fn update_case(&self, session: &SessionContext, params: UpdateCaseParams) -> ToolResponse {
        let run = self.begin("update_case", session);
        let outcome = self.revise_case(&run.scope, params).await;
        run.finish(outcome)
    }

    async fn revise_case(&self, scope: &CallScope<'_>, params: UpdateCaseParams) -> Result<Value, ToolError> {
        let case_id = record_id("case_id", &params.case_id)?;

        let changes = [
            ("Priority", optional_text(params.priority.as_deref())),
            ("Status", optional_text(params.status.as_deref())),
            ("Type", optional_text(params.case_type.as_deref())),
        ];
        let comment = optional_text(params.comment.as_deref());

        let mut fields = CrmRecord::new();
        let mut updated_fields = Vec::new();
        for (name, value) in changes {
            if let Some(value) = value {
                fields.insert(name.into(), value.into());
                updated_fields.push(name);
            }
        }
        if fields.is_empty() && comment.is_none() {
            return Err(ToolError::invalid_input("At least one field to update or a comment is required."));
        }

        let mut described: Vec<String> = changes
            .iter()
            .filter_map(|(name, value)| value.map(|value| format!("{name} to {value}")))
            .collect();
        if comment.is_some() {
            described.push("add a comment".to_string());
        }
        let summary = format!("Update case {case_id}: {}", described.join(", "));

        let mut plan = WritePlan::new("update_case", SupportCase::OBJECT, summary).key("CaseId", case_id);
        for (name, value) in changes {
            if let Some(value) = value {
                plan = plan.key(name, value);
            }
        }
        if !fields.is_empty() {
            plan = plan.update(SupportCase::OBJECT, case_id, fields);
        }
        if let Some(comment) = comment {
            let mut body = CrmRecord::new();
            body.insert("ParentId".into(), case_id.into());
            body.insert("CommentBody".into(), comment.into());
            plan = plan.create("CaseComment", body).key("Comment", comment);
            updated_fields.push("Comment");
        }
        let outcome = self.writes.submit(scope, WriteRequest::from_flag(plan, params.confirmed)).await?;

        write_payload(outcome, |_| CaseUpdated {
            success: true,
            message: format!("Case {case_id} updated successfully."),
            updated_fields,
        })
    }

    pub async fn get_case_queue_summary(
        &self,
        session: &SessionContext,
        params: GetCaseQueueSummaryParams,
    ) -> ToolResponse {
        let run = self.begin("get_case_queue_summary", session);
        let outcome = self.queue_summary(&run.scope, params).await;
        run.finish(outcome)
    }

    async fn queue_summary(&self, scope: &CallScope<'_>, params: GetCaseQueueSummaryParams) -> Result<Value, ToolError> {
        let owner_id = optional_record_id("owner_id", params.owner_id.as_deref())?;

        let mut predicates = vec![Filter::eq("IsClosed", false)];
        if let Some(owner_id) = owner_id {
            predicates.push(Filter::eq("OwnerId", owner_id));
        }
        if let Some(queue_name) = optional_text(params.queue_name.as_deref()) {
            predicates.push(Filter::eq("Owner.Name", queue_name));
        }
        let spec = QuerySpec::new(QueuedCase::OBJECT, QueuedCase::FIELDS)
            .filter(Filter::all(predicates))
            .order_by(OrderBy::asc("CreatedDate"))
            .limit(QUEUE_SCAN_LIMIT);
        let result = self.executor.fetch::<QueuedCase>(scope, spec).await?;

        payload(&summarize_queue(&result.records, self.clock.now(), result.has_more))
    }
}
