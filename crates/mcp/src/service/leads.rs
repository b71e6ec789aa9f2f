use crmgate_core::domain::records::{CrmRecord, FromCrmRecord, Lead, TeamMember};
use crmgate_core::{
    CallScope, Filter, OrderBy, QuerySpec, SessionContext, ToolError, ToolResponse, WritePlan, WriteRequest,
};
use serde::Serialize;
use serde_json::Value;

use super::{payload, write_payload, CrmToolService};
use crate::params::{GetLeadsParams, GetTeamMembersParams, UpdateLeadStatusParams};
use crate::validation::{optional_record_id, optional_text, record_id, required_text};

const TEAM_LIMIT: u32 = 200;

#[derive(Debug, Serialize)]
struct LeadList {
    leads: Vec<Lead>,
    total_count: usize,
    has_more: bool,
}

#[derive(Debug, Serialize)]
struct LeadUpdated {
    success: bool,
    message: String,
    updated_fields: [&'static str; 1],
}

#[derive(Debug, Serialize)]
struct Team {
    team_members: Vec<TeamMember>,
    count: usize,
    has_more: bool,
}

impl CrmToolService {
    pub async fn get_leads(&self, session: &SessionContext, params: GetLeadsParams) -> ToolResponse {
        let run = self.begin("get_leads", session);
        let outcome = self.open_leads(&run.scope, params).await;
        run.finish(outcome)
    }

    async fn open_leads(&self, scope: &CallScope<'_>, params: GetLeadsParams) -> Result<Value, ToolError> {
        let owner_id = optional_record_id("owner_id", params.owner_id.as_deref())?;

        let mut predicates = vec![Filter::eq("IsConverted", false)];
        if let Some(owner_id) = owner_id {
            predicates.push(Filter::eq("OwnerId", owner_id));
        }
        if let Some(status) = optional_text(params.status.as_deref()) {
            predicates.push(Filter::eq("Status", status));
        }
        if let Some(source) = optional_text(params.lead_source.as_deref()) {
            predicates.push(Filter::eq("LeadSource", source));
        }
        let spec = QuerySpec::new(Lead::OBJECT, Lead::FIELDS)
            .filter(Filter::all(predicates))
            .order_by(OrderBy::desc("CreatedDate"))
            .limit(self.list_limit(params.limit));
        let result = self.executor.fetch::<Lead>(scope, spec).await?;

        payload(&LeadList { total_count: result.total_count, has_more: result.has_more, leads: result.records })
    }

    pub async fn update_lead_status(&self, session: &SessionContext, params: UpdateLeadStatusParams) -> ToolResponse {
        let run = self.begin("update_lead_status", session);
        let outcome = self.set_lead_status(&run.scope, params).await;
        run.finish(outcome)
    }

    async fn set_lead_status(&self, scope: &CallScope<'_>, params: UpdateLeadStatusParams) -> Result<Value, ToolError> {
        let lead_id = record_id("lead_id", &params.lead_id)?;
        let status = required_text("status", &params.status)?;

        let mut fields = CrmRecord::new();
        fields.insert("Status".into(), status.into());
        let plan = WritePlan::new("update_lead_status", Lead::OBJECT, format!("Set lead {lead_id} status to '{status}'"))
            .update(Lead::OBJECT, lead_id, fields)
            .key("LeadId", lead_id)
            .key("Status", status);
        let outcome = self.writes.submit(scope, WriteRequest::from_flag(plan, params.confirmed)).await?;

        write_payload(outcome, |_| LeadUpdated {
            success: true,
            message: format!("Lead {lead_id} status updated to '{status}'."),
            updated_fields: ["Status"],
        })
    }

    pub async fn get_team_members(&self, session: &SessionContext, params: GetTeamMembersParams) -> ToolResponse {
        let run = self.begin("get_team_members", session);
        let outcome = self.team(&run.scope, params).await;
        run.finish(outcome)
    }

    async fn team(&self, scope: &CallScope<'_>, params: GetTeamMembersParams) -> Result<Value, ToolError> {
        let manager_id = record_id("manager_id", &params.manager_id)?;
        let team = self.direct_reports(scope, manager_id, TEAM_LIMIT).await?;
        payload(&Team { count: team.total_count, has_more: team.has_more, team_members: team.records })
    }
}
