//! Tool implementations.
//!
//! Every tool opens one call scope for its external calls, runs its body, and
//! closes with [`ToolRun::finish`], which attaches any rate warning to the
//! envelope and logs the call.

use std::sync::Arc;
use std::time::Instant;

use chrono::Duration;

use crmgate_core::clock::Clock;
use crmgate_core::config::{AppConfig, KnowledgeConfig, QueryConfig};
use crmgate_core::errors::new_correlation_id;
use crmgate_core::writeback::WriteReceipt;
use crmgate_core::{
    CallError, CallScope, DisambiguationResolver, GovernedGateway, QueryError, QueryExecutor,
    RiskAnalysisEngine, SessionContext, StoreError, ToolError, ToolErrorCode, ToolResponse, Warning,
    WriteBackGate, WriteOutcome,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::validation::clamp_limit;

mod accounts;
mod activity;
mod knowledge;
mod leads;
mod pipeline;
mod support;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub dedup_purged: u64,
    pub sessions_evicted: u64,
}

pub struct CrmToolService {
    gateway: GovernedGateway,
    executor: QueryExecutor,
    resolver: DisambiguationResolver,
    risk: RiskAnalysisEngine,
    writes: WriteBackGate,
    clock: Arc<dyn Clock>,
    limits: QueryConfig,
    knowledge: KnowledgeConfig,
}

impl CrmToolService {
    pub fn new(gateway: GovernedGateway, writes: WriteBackGate, clock: Arc<dyn Clock>, config: &AppConfig) -> Self {
        Self {
            gateway,
            executor: QueryExecutor::new(config.query.max_rows),
            resolver: DisambiguationResolver::new(config.query.disambiguation_preview),
            risk: RiskAnalysisEngine::new(config.risk.clone()),
            writes,
            clock,
            limits: config.query.clone(),
            knowledge: config.knowledge.clone(),
        }
    }

    pub fn gateway(&self) -> &GovernedGateway {
        &self.gateway
    }

    /// Drops the session's rate counter once its connection is gone.
    pub async fn end_session(&self, session: &SessionContext) -> Result<(), StoreError> {
        self.gateway.governor().end_session(&session.session_id).await?;
        info!(event_name = "session.ended", session_id = %session.session_id, "session closed");
        Ok(())
    }

    /// Drops lapsed dedup entries and the counters of sessions idle for
    /// longer than `idle_for`.
    pub async fn sweep(&self, idle_for: Duration) -> Result<SweepReport, StoreError> {
        let dedup_purged = self.writes.purge_expired().await?;
        let sessions_evicted = self.gateway.governor().evict_idle(idle_for).await?;
        if dedup_purged > 0 || sessions_evicted > 0 {
            info!(event_name = "maintenance.swept", dedup_purged, sessions_evicted, "expired state removed");
        }
        Ok(SweepReport { dedup_purged, sessions_evicted })
    }

    fn begin<'a>(&'a self, tool: &'static str, session: &'a SessionContext) -> ToolRun<'a> {
        ToolRun { tool, scope: self.gateway.scope(session), started: Instant::now() }
    }

    fn list_limit(&self, requested: Option<u32>) -> u32 {
        clamp_limit(requested, self.limits.default_limit, self.limits.max_tool_limit)
    }
}

pub(crate) struct ToolRun<'a> {
    tool: &'static str,
    scope: CallScope<'a>,
    started: Instant,
}

impl ToolRun<'_> {
    fn finish(self, outcome: Result<Value, ToolError>) -> ToolResponse {
        let warning = self.scope.take_warning().map(Warning::from);
        let elapsed_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let session_id = &self.scope.session().session_id;
        match &outcome {
            Ok(_) => info!(
                event_name = "tool.completed",
                session_id = %session_id,
                tool = self.tool,
                external_calls = self.scope.external_calls(),
                rate_warning = warning.is_some(),
                elapsed_ms,
                "tool call completed"
            ),
            Err(error) => warn!(
                event_name = "tool.failed",
                session_id = %session_id,
                tool = self.tool,
                code = %error.code,
                correlation_id = error.correlation_id().unwrap_or("-"),
                external_calls = self.scope.external_calls(),
                elapsed_ms,
                "tool call failed"
            ),
        }
        ToolResponse::from_result(outcome).with_warning(warning)
    }
}

pub(crate) fn payload<T: Serialize>(value: &T) -> Result<Value, ToolError> {
    serde_json::to_value(value).map_err(|error| {
        let correlation_id = new_correlation_id();
        tracing::error!(
            event_name = "tool.serialize_failed",
            correlation_id = %correlation_id,
            error = %error,
            "tool payload could not be serialized"
        );
        ToolError::masked(ToolErrorCode::SfApiError, correlation_id)
    })
}

/// A preview goes back as-is. An executed write and its suppressed replay are
/// described identically by `done`.
pub(crate) fn write_payload<T: Serialize>(
    outcome: WriteOutcome,
    done: impl FnOnce(&WriteReceipt) -> T,
) -> Result<Value, ToolError> {
    match outcome {
        WriteOutcome::Preview(preview) => payload(&preview),
        WriteOutcome::Executed(receipt) | WriteOutcome::DuplicateSuppressed(receipt) => payload(&done(&receipt)),
    }
}

/// Gateway failures an optional enrichment step may skip. Quota, credential and
/// store failures still end the call.
pub(crate) fn is_skippable(error: &QueryError) -> bool {
    matches!(error, QueryError::Call(CallError::Gateway(error)) if error.allows_fallback())
}
