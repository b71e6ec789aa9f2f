use std::cmp::Reverse;

use chrono::{Duration, NaiveDate};
use crmgate_core::domain::records::{Activity, ActivityKind, CrmRecord};
use crmgate_core::gateway::CompareOp;
use crmgate_core::{
    CallScope, Filter, OrderBy, QueryError, QuerySpec, SessionContext, ToolError, ToolResponse, WritePlan,
    WriteRequest,
};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::{is_skippable, payload, write_payload, CrmToolService};
use crate::params::{CreateTaskParams, GetRecentActivitiesParams};
use crate::validation::{clamp_limit, optional_date, optional_record_id, optional_text, record_id, required_text};

const DEFAULT_LOOKBACK_DAYS: u32 = 30;
const MAX_LOOKBACK_DAYS: u32 = 90;

#[derive(Debug, Serialize)]
struct ActivityList {
    activities: Vec<Activity>,
    total_count: usize,
}

#[derive(Debug, Serialize)]
struct TaskCreated {
    task_id: String,
    success: bool,
    message: String,
}

impl CrmToolService {
    pub async fn get_recent_activities(
        &self,
        session: &SessionContext,
        params: GetRecentActivitiesParams,
    ) -> ToolResponse {
        let run = self.begin("get_recent_activities", session);
        let outcome = self.recent_activities(&run.scope, params).await;
        run.finish(outcome)
    }

    async fn recent_activities(
        &self,
        scope: &CallScope<'_>,
        params: GetRecentActivitiesParams,
    ) -> Result<Value, ToolError> {
        let related_to_id = record_id("related_to_id", &params.related_to_id)?;
        let days = clamp_limit(params.days, DEFAULT_LOOKBACK_DAYS, MAX_LOOKBACK_DAYS);
        let limit = self.list_limit(params.limit);
        let cutoff = (self.clock.now() - Duration::days(i64::from(days))).date_naive();

        let mut activities = self.activities_of(scope, ActivityKind::Task, related_to_id, cutoff, limit).await?;
        let remaining = limit.saturating_sub(activities.len() as u32);
        if remaining > 0 {
            activities.extend(self.activities_of(scope, ActivityKind::Event, related_to_id, cutoff, remaining).await?);
        }

        // Undated activities go last.
        activities.sort_by_key(|activity| (activity.date.is_none(), Reverse(activity.date)));

        payload(&ActivityList { total_count: activities.len(), activities })
    }

    /// Tasks or events tied to the record through either relation. Some orgs
    /// hide one of the two objects; that half is then left out.
    async fn activities_of(
        &self,
        scope: &CallScope<'_>,
        kind: ActivityKind,
        related_to_id: &str,
        cutoff: NaiveDate,
        limit: u32,
    ) -> Result<Vec<Activity>, ToolError> {
        let filter = Filter::all(vec![
            Filter::Or(vec![Filter::eq("WhatId", related_to_id), Filter::eq("WhoId", related_to_id)]),
            Filter::compare("ActivityDate", CompareOp::Gte, cutoff),
        ]);
        let spec = QuerySpec::new(kind.object(), kind.fields())
            .filter(filter)
            .order_by(OrderBy::desc("ActivityDate"))
            .limit(limit);

        let rows = match self.executor.fetch_raw(scope, spec).await {
            Ok(result) => result.records,
            Err(error) if is_skippable(&error) => {
                debug!(
                    event_name = "tool.activities_skipped",
                    object = kind.object(),
                    error = %error,
                    "activity object unavailable"
                );
                return Ok(Vec::new());
            }
            Err(error) => return Err(error.into()),
        };

        let activities = rows
            .iter()
            .map(|row| Activity::from_record(kind, row))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| QueryError::Normalize { object: kind.object(), source })?;
        Ok(activities)
    }

    pub async fn create_task(&self, session: &SessionContext, params: CreateTaskParams) -> ToolResponse {
        let run = self.begin("create_task", session);
        let outcome = self.open_task(&run.scope, params).await;
        run.finish(outcome)
    }

    async fn open_task(&self, scope: &CallScope<'_>, params: CreateTaskParams) -> Result<Value, ToolError> {
        let subject = required_text("subject", &params.subject)?;
        let priority = required_text("priority", &params.priority)?;
        let due_date = optional_date("due_date", params.due_date.as_deref())?;
        let what_id = optional_record_id("related_to_id", params.related_to_id.as_deref())?;
        let who_id = optional_record_id("who_id", params.who_id.as_deref())?;
        let due = due_date.map(|date| date.format("%Y-%m-%d").to_string());

        let mut fields = CrmRecord::new();
        fields.insert("Subject".into(), subject.into());
        fields.insert("Priority".into(), priority.into());
        fields.insert("Status".into(), "Not Started".into());
        if let Some(description) = optional_text(params.description.as_deref()) {
            fields.insert("Description".into(), description.into());
        }
        if let Some(due) = &due {
            fields.insert("ActivityDate".into(), due.as_str().into());
        }
        if let Some(what_id) = what_id {
            fields.insert("WhatId".into(), what_id.into());
        }
        if let Some(who_id) = who_id {
            fields.insert("WhoId".into(), who_id.into());
        }

        let mut summary = format!("Create a {priority} priority task '{subject}'");
        if let Some(due) = &due {
            summary.push_str(&format!(" due {due}"));
        }
        if let Some(what_id) = what_id {
            summary.push_str(&format!(" on {what_id}"));
        }

        let plan = WritePlan::new("create_task", ActivityKind::Task.object(), summary)
            .create(ActivityKind::Task.object(), fields)
            .key("Subject", subject)
            .key("WhatId", what_id.unwrap_or_default())
            .key("WhoId", who_id.unwrap_or_default())
            .key("ActivityDate", due.clone().unwrap_or_default());
        let outcome = self.writes.submit(scope, WriteRequest::from_flag(plan, params.confirmed)).await?;

        write_payload(outcome, |receipt| TaskCreated {
            task_id: receipt.result.record_id.clone(),
            success: true,
            message: format!("Task '{subject}' created successfully."),
        })
    }
}
