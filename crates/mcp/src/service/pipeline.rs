use crmgate_core::domain::records::{FromCrmRecord, Opportunity, TeamMember};
use crmgate_core::gateway::CompareOp;
use crmgate_core::risk::AssessedOpportunity;
use crmgate_core::{
    CallScope, Filter, OrderBy, PipelineSummary, QueryResult, QuerySpec, SessionContext, ToolError, ToolResponse,
};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{payload, CrmToolService};
use crate::params::{GetDealActivityGapsParams, GetOpportunitiesParams, GetPipelineSummaryParams};
use crate::validation::{clamp_limit, optional_date, optional_record_id, optional_text};

/// Open deals read for a pipeline rollup.
const PIPELINE_SCAN_LIMIT: u32 = 200;

/// Direct reports read when scoping a rollup to a manager.
const TEAM_SCAN_LIMIT: u32 = 200;

const DEFAULT_GAP_LIMIT: u32 = 20;

#[derive(Debug, Serialize)]
struct OpportunityList {
    opportunities: Vec<AssessedOpportunity>,
    total_count: usize,
    total_value: Decimal,
    has_more: bool,
}

#[derive(Debug, Serialize)]
struct PipelineReport {
    #[serde(flatten)]
    summary: PipelineSummary,
    /// The open-deal scan or the direct-report scan hit its cap; totals cover
    /// only the deals read.
    has_more: bool,
}

impl CrmToolService {
    pub async fn get_opportunities(&self, session: &SessionContext, params: GetOpportunitiesParams) -> ToolResponse {
        let run = self.begin("get_opportunities", session);
        let outcome = self.list_opportunities(&run.scope, params).await;
        run.finish(outcome)
    }

    async fn list_opportunities(
        &self,
        scope: &CallScope<'_>,
        params: GetOpportunitiesParams,
    ) -> Result<Value, ToolError> {
        let owner_id = optional_record_id("owner_id", params.owner_id.as_deref())?;
        let account_id = optional_record_id("account_id", params.account_id.as_deref())?;
        let from = optional_date("close_date_from", params.close_date_from.as_deref())?;
        let to = optional_date("close_date_to", params.close_date_to.as_deref())?;
        if let (Some(from), Some(to)) = (from, to) {
            if from > to {
                return Err(ToolError::invalid_input("close_date_from must not be after close_date_to."));
            }
        }

        let mut predicates = Vec::new();
        if !params.include_closed {
            predicates.push(Filter::eq("IsClosed", false));
        }
        if let Some(owner_id) = owner_id {
            predicates.push(Filter::eq("OwnerId", owner_id));
        }
        if let Some(account_id) = account_id {
            predicates.push(Filter::eq("AccountId", account_id));
        }
        if let Some(stage) = optional_text(params.stage.as_deref()) {
            predicates.push(Filter::eq("StageName", stage));
        }
        if let Some(from) = from {
            predicates.push(Filter::compare("CloseDate", CompareOp::Gte, from));
        }
        if let Some(to) = to {
            predicates.push(Filter::compare("CloseDate", CompareOp::Lte, to));
        }

        let spec = QuerySpec::new(Opportunity::OBJECT, Opportunity::FIELDS)
            .filter(Filter::all(predicates))
            .order_by(OrderBy::asc("CloseDate"))
            .limit(self.list_limit(params.limit));
        let result = self.executor.fetch::<Opportunity>(scope, spec).await?;

        let total_value = result.records.iter().filter_map(|deal| deal.amount).sum();
        let opportunities = self.risk.assess(result.records, self.clock.now());
        payload(&OpportunityList {
            total_count: opportunities.len(),
            total_value,
            has_more: result.has_more,
            opportunities,
        })
    }

    pub async fn get_pipeline_summary(
        &self,
        session: &SessionContext,
        params: GetPipelineSummaryParams,
    ) -> ToolResponse {
        let run = self.begin("get_pipeline_summary", session);
        let outcome = self.pipeline_summary(&run.scope, params).await;
        run.finish(outcome)
    }

    async fn pipeline_summary(
        &self,
        scope: &CallScope<'_>,
        params: GetPipelineSummaryParams,
    ) -> Result<Value, ToolError> {
        let owner_id = optional_record_id("owner_id", params.owner_id.as_deref())?;
        let manager_id = optional_record_id("manager_id", params.manager_id.as_deref())?;
        let by_owner = owner_id.is_none() && manager_id.is_some();

        let mut team_truncated = false;
        let owner_filter = match (owner_id, manager_id) {
            (Some(owner_id), _) => Some(Filter::eq("OwnerId", owner_id)),
            (None, Some(manager_id)) => {
                let team = self.direct_reports(scope, manager_id, TEAM_SCAN_LIMIT).await?;
                if team.has_more {
                    warn!(
                        event_name = "pipeline.team_truncated",
                        manager_id,
                        read = team.total_count,
                        "manager has more direct reports than one rollup covers"
                    );
                }
                team_truncated = team.has_more;
                let reports = team.records;
                if reports.is_empty() {
                    debug!(event_name = "pipeline.no_direct_reports", manager_id, "manager has no active reports");
                    let empty = self.risk.summarize(Vec::new(), self.clock.now(), true);
                    return payload(&PipelineReport { summary: empty, has_more: false });
                }
                Some(Filter::is_in("OwnerId", reports.into_iter().map(|member| member.id).collect()))
            }
            (None, None) => None,
        };

        let predicates = std::iter::once(Filter::eq("IsClosed", false)).chain(owner_filter).collect();
        let spec = QuerySpec::new(Opportunity::OBJECT, Opportunity::FIELDS)
            .filter(Filter::all(predicates))
            .order_by(OrderBy::asc("CloseDate"))
            .limit(PIPELINE_SCAN_LIMIT);
        let result = self.executor.fetch::<Opportunity>(scope, spec).await?;

        let summary = self.risk.summarize(result.records, self.clock.now(), by_owner);
        payload(&PipelineReport { summary, has_more: result.has_more || team_truncated })
    }

    pub(super) async fn direct_reports(
        &self,
        scope: &CallScope<'_>,
        manager_id: &str,
        limit: u32,
    ) -> Result<QueryResult<TeamMember>, ToolError> {
        let spec = QuerySpec::new(TeamMember::OBJECT, TeamMember::FIELDS)
            .filter(Filter::all(vec![Filter::eq("ManagerId", manager_id), Filter::eq("IsActive", true)]))
            .order_by(OrderBy::asc("Name"))
            .limit(limit);
        Ok(self.executor.fetch::<TeamMember>(scope, spec).await?)
    }

    pub async fn get_deal_activity_gaps(
        &self,
        session: &SessionContext,
        params: GetDealActivityGapsParams,
    ) -> ToolResponse {
        let run = self.begin("get_deal_activity_gaps", session);
        let outcome = self.activity_gaps(&run.scope, params).await;
        run.finish(outcome)
    }

    async fn activity_gaps(&self, scope: &CallScope<'_>, params: GetDealActivityGapsParams) -> Result<Value, ToolError> {
        let owner_id = optional_record_id("owner_id", params.owner_id.as_deref())?;
        if params.days_threshold == Some(0) {
            return Err(ToolError::invalid_input("days_threshold must be at least 1."));
        }
        let limit = clamp_limit(params.limit, DEFAULT_GAP_LIMIT, self.limits.max_tool_limit);

        let predicates = std::iter::once(Filter::eq("IsClosed", false))
            .chain(owner_id.map(|owner_id| Filter::eq("OwnerId", owner_id)))
            .collect();
        // Deals that need no follow-up are dropped, so read past the limit.
        let spec = QuerySpec::new(Opportunity::OBJECT, Opportunity::FIELDS)
            .filter(Filter::all(predicates))
            .order_by(OrderBy::asc("CloseDate"))
            .limit(limit * 2);
        let result = self.executor.fetch::<Opportunity>(scope, spec).await?;

        let mut report =
            self.risk.activity_gaps(result.records, self.clock.now(), params.days_threshold, limit as usize);
        report.has_more |= result.has_more;
        payload(&report)
    }
}
