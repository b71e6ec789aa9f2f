use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::records::{CrmRecord, FromCrmRecord, NormalizeError};
use crate::errors::{new_correlation_id, ToolError, ToolErrorCode};
use crate::gateway::{validate_field_name, Filter, OrderBy, QuerySpec, SearchRequest};
use crate::guard::{CallError, CallScope};

/// Hard ceiling on rows returned by a single read, whatever the caller asks for.
pub const MAX_QUERY_ROWS: u32 = 2000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategy {
    /// Ranked full-text search.
    FullText,
    /// Substring match used when full-text search is unavailable.
    PatternMatch,
}

/// Records plus the metadata needed to tell a complete answer from a clipped one.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueryResult<T> {
    pub records: Vec<T>,
    pub total_count: usize,
    /// More rows matched than were returned.
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<SearchStrategy>,
}

impl<T> QueryResult<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> QueryResult<U> {
        QueryResult {
            records: self.records.into_iter().map(f).collect(),
            total_count: self.total_count,
            has_more: self.has_more,
            strategy: self.strategy,
        }
    }

    pub fn try_map<U, E>(self, f: impl FnMut(T) -> Result<U, E>) -> Result<QueryResult<U>, E> {
        Ok(QueryResult {
            records: self.records.into_iter().map(f).collect::<Result<_, _>>()?,
            total_count: self.total_count,
            has_more: self.has_more,
            strategy: self.strategy,
        })
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum QueryError {
    #[error("invalid query: {0}")]
    Invalid(String),
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("malformed {object} record: {source}")]
    Normalize { object: &'static str, source: NormalizeError },
}

impl From<QueryError> for ToolError {
    fn from(error: QueryError) -> Self {
        match error {
            QueryError::Invalid(message) => ToolError::invalid_input(message),
            QueryError::Call(error) => error.into(),
            QueryError::Normalize { object, source } => {
                let correlation_id = new_correlation_id();
                tracing::error!(
                    event_name = "query.normalize_failed",
                    correlation_id = %correlation_id,
                    object,
                    error = %source,
                    "CRM returned a record that could not be normalized"
                );
                ToolError::masked(ToolErrorCode::SfApiError, correlation_id)
            }
        }
    }
}

/// Free-text lookup with a substring fallback on `fallback_field`.
#[derive(Clone, Debug, PartialEq)]
pub struct TextSearch {
    pub term: String,
    pub object: String,
    pub fields: Vec<String>,
    pub fallback_field: String,
    pub filter: Option<Filter>,
    pub order_by: Vec<OrderBy>,
    pub limit: u32,
}

impl TextSearch {
    pub fn new<T: FromCrmRecord>(term: &str, fallback_field: &str) -> Self {
        Self {
            term: term.trim().to_string(),
            object: T::OBJECT.to_string(),
            fields: T::FIELDS.iter().map(|field| field.to_string()).collect(),
            fallback_field: fallback_field.to_string(),
            filter: None,
            order_by: Vec::new(),
            limit: 1,
        }
    }

    pub fn filter(mut self, filter: Option<Filter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }
}

/// Bounded reads. Every result states whether rows were left behind.
#[derive(Clone, Debug)]
pub struct QueryExecutor {
    max_rows: u32,
}

impl Default for QueryExecutor {
    fn default() -> Self {
        Self::new(MAX_QUERY_ROWS)
    }
}

impl QueryExecutor {
    pub fn new(max_rows: u32) -> Self {
        Self { max_rows: max_rows.clamp(1, MAX_QUERY_ROWS) }
    }

    pub fn max_rows(&self) -> u32 {
        self.max_rows
    }

    pub async fn fetch_raw(
        &self,
        scope: &CallScope<'_>,
        spec: QuerySpec,
    ) -> Result<QueryResult<CrmRecord>, QueryError> {
        validate_query(&spec.object, &spec.fields, spec.filter.as_ref(), &spec.order_by, spec.limit)?;
        let limit = self.effective_limit(spec.limit);
        let object = spec.object.clone();

        // One extra row tells us whether the window was clipped.
        let probe = QuerySpec { limit: limit + 1, ..spec };
        let records = scope.query(&probe).await?;
        let result = clip(records, limit, None);
        debug!(
            event_name = "query.fetched",
            object = %object,
            returned = result.total_count,
            has_more = result.has_more,
            "bounded query completed"
        );
        Ok(result)
    }

    pub async fn fetch<T: FromCrmRecord>(
        &self,
        scope: &CallScope<'_>,
        spec: QuerySpec,
    ) -> Result<QueryResult<T>, QueryError> {
        self.fetch_raw(scope, spec).await?.try_map(|record| normalize::<T>(&record))
    }

    /// Full-text search first; on failure, a pattern match on the fallback field.
    /// Quota and permission failures are returned as-is.
    pub async fn search_text<T: FromCrmRecord>(
        &self,
        scope: &CallScope<'_>,
        search: TextSearch,
    ) -> Result<QueryResult<T>, QueryError> {
        if search.term.is_empty() {
            return Err(QueryError::Invalid("search term must not be empty".to_string()));
        }
        validate_field_name(&search.fallback_field).map_err(QueryError::Invalid)?;
        validate_query(&search.object, &search.fields, search.filter.as_ref(), &search.order_by, search.limit)?;
        let limit = self.effective_limit(search.limit);

        let request = SearchRequest {
            term: search.term.clone(),
            object: search.object.clone(),
            fields: search.fields.clone(),
            filter: search.filter.clone(),
            order_by: search.order_by.clone(),
            limit: limit + 1,
        };
        let (records, strategy) = match scope.search(&request).await {
            Ok(records) => (records, SearchStrategy::FullText),
            Err(CallError::Gateway(error)) if error.allows_fallback() => {
                info!(
                    event_name = "query.search.fallback",
                    object = %search.object,
                    error = %error,
                    "full-text search unavailable; using pattern match"
                );
                let mut predicates: Vec<Filter> = search.filter.into_iter().collect();
                predicates.push(Filter::contains(&search.fallback_field, search.term));
                let spec = QuerySpec {
                    object: search.object,
                    fields: search.fields,
                    filter: Filter::all(predicates),
                    order_by: search.order_by,
                    limit: limit + 1,
                };
                (scope.query(&spec).await?, SearchStrategy::PatternMatch)
            }
            Err(error) => return Err(error.into()),
        };

        clip(records, limit, Some(strategy)).try_map(|record| normalize::<T>(&record))
    }

    fn effective_limit(&self, requested: u32) -> u32 {
        requested.min(self.max_rows)
    }
}

fn clip(
    mut records: Vec<CrmRecord>,
    limit: u32,
    strategy: Option<SearchStrategy>,
) -> QueryResult<CrmRecord> {
    let has_more = records.len() > limit as usize;
    records.truncate(limit as usize);
    QueryResult { total_count: records.len(), records, has_more, strategy }
}

fn normalize<T: FromCrmRecord>(record: &CrmRecord) -> Result<T, QueryError> {
    T::from_record(record).map_err(|source| QueryError::Normalize { object: T::OBJECT, source })
}

fn validate_query(
    object: &str,
    fields: &[String],
    filter: Option<&Filter>,
    order_by: &[OrderBy],
    limit: u32,
) -> Result<(), QueryError> {
    validate_field_name(object).map_err(QueryError::Invalid)?;
    if object.contains('.') {
        return Err(QueryError::Invalid(format!("`{object}` is not an object name")));
    }
    if fields.is_empty() {
        return Err(QueryError::Invalid("at least one field must be selected".to_string()));
    }
    fields.iter().try_for_each(|field| validate_field_name(field)).map_err(QueryError::Invalid)?;
    if let Some(filter) = filter {
        filter.validate().map_err(QueryError::Invalid)?;
    }
    order_by.iter().try_for_each(|order| validate_field_name(&order.field)).map_err(QueryError::Invalid)?;
    if limit == 0 {
        return Err(QueryError::Invalid("limit must be at least 1".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use secrecy::SecretString;
    use serde_json::json;

    use super::{QueryError, QueryExecutor, SearchStrategy, TextSearch, MAX_QUERY_ROWS};
    use crate::auth::{AuthContext, AuthContextResolver};
    use crate::clock::ManualClock;
    use crate::config::RateLimitConfig;
    use crate::domain::records::Account;
    use crate::domain::session::{SessionContext, UserId};
    use crate::errors::{ToolError, ToolErrorCode};
    use crate::gateway::{Filter, GatewayError, QuerySpec};
    use crate::governor::{InMemoryRateCounterStore, SessionRateGovernor};
    use crate::guard::{CallError, GovernedGateway};
    use crate::sandbox::{GatewayCall, SandboxGateway, SandboxRefresher};

    async fn guard(sandbox: Arc<SandboxGateway>) -> GovernedGateway {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()));
        let auth = Arc::new(AuthContextResolver::new(Arc::new(SandboxRefresher::new()), clock.clone()));
        auth.register(AuthContext {
            user_id: UserId("005A".to_string()),
            access_token: SecretString::from("token"),
            instance_url: "https://sandbox".to_string(),
            expires_at: None,
            refresh_token: None,
        })
        .await;
        let governor = Arc::new(SessionRateGovernor::new(
            Arc::new(InMemoryRateCounterStore::new()),
            RateLimitConfig::default(),
            clock,
        ));
        GovernedGateway::new(sandbox, auth, governor, Duration::from_secs(5))
    }

    fn seed_accounts(sandbox: &SandboxGateway, count: usize) {
        for n in 0..count {
            sandbox.insert("Account", json!({ "Id": format!("001{n:015}"), "Name": format!("Acme {n}") }));
        }
    }

    #[tokio::test]
    async fn clipped_results_report_has_more() {
        let sandbox = Arc::new(SandboxGateway::new());
        seed_accounts(&sandbox, 7);
        let guard = guard(sandbox.clone()).await;
        let session = SessionContext::for_user("005A");
        let scope = guard.scope(&session);

        let result = QueryExecutor::new(5)
            .fetch::<Account>(&scope, QuerySpec::new("Account", &["Id", "Name"]).limit(25))
            .await
            .unwrap();

        assert_eq!(result.total_count, 5);
        assert_eq!(result.records.len(), 5);
        assert!(result.has_more);
        assert_eq!(sandbox.calls(), vec![GatewayCall::Query { object: "Account".to_string(), limit: 6 }]);
    }

    #[tokio::test]
    async fn complete_results_do_not_claim_more() {
        let sandbox = Arc::new(SandboxGateway::new());
        seed_accounts(&sandbox, 3);
        let guard = guard(sandbox).await;
        let session = SessionContext::for_user("005A");
        let scope = guard.scope(&session);

        let result = QueryExecutor::default()
            .fetch::<Account>(&scope, QuerySpec::new("Account", &["Id", "Name"]).limit(3))
            .await
            .unwrap();

        assert_eq!(result.total_count, 3);
        assert!(!result.has_more);
    }

    #[tokio::test]
    async fn malformed_queries_are_rejected_before_any_call() {
        let sandbox = Arc::new(SandboxGateway::new());
        let guard = guard(sandbox.clone()).await;
        let session = SessionContext::for_user("005A");
        let scope = guard.scope(&session);
        let executor = QueryExecutor::default();

        let bad_field = QuerySpec::new("Account", &["Id", "Name FROM User"]).limit(5);
        let bad_filter = QuerySpec::new("Account", &["Id"]).filter(Some(Filter::And(Vec::new()))).limit(5);
        let zero_limit = QuerySpec::new("Account", &["Id"]).limit(0);

        for spec in [bad_field, bad_filter, zero_limit] {
            let error = executor.fetch_raw(&scope, spec).await.unwrap_err();
            assert!(matches!(error, QueryError::Invalid(_)));
            assert_eq!(ToolError::from(error).code, ToolErrorCode::InvalidInput);
        }
        assert_eq!(sandbox.call_count(), 0);
    }

    #[tokio::test]
    async fn search_falls_back_to_pattern_match() {
        let sandbox = Arc::new(SandboxGateway::new());
        seed_accounts(&sandbox, 2);
        sandbox.disable_search(GatewayError::FeatureUnavailable("search".to_string()));
        let guard = guard(sandbox.clone()).await;
        let session = SessionContext::for_user("005A");
        let scope = guard.scope(&session);

        let result = QueryExecutor::default()
            .search_text::<Account>(&scope, TextSearch::new::<Account>("acme 1", "Name").limit(10))
            .await
            .unwrap();

        assert_eq!(result.strategy, Some(SearchStrategy::PatternMatch));
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].name, "Acme 1");
        assert_eq!(sandbox.call_count(), 2);
    }

    #[tokio::test]
    async fn search_reports_full_text_strategy() {
        let sandbox = Arc::new(SandboxGateway::new());
        seed_accounts(&sandbox, 2);
        let guard = guard(sandbox).await;
        let session = SessionContext::for_user("005A");
        let scope = guard.scope(&session);

        let result = QueryExecutor::default()
            .search_text::<Account>(&scope, TextSearch::new::<Account>("Acme", "Name").limit(10))
            .await
            .unwrap();

        assert_eq!(result.strategy, Some(SearchStrategy::FullText));
        assert_eq!(result.total_count, 2);
    }

    #[tokio::test]
    async fn org_quota_exhaustion_is_not_masked_by_fallback() {
        let sandbox = Arc::new(SandboxGateway::new());
        sandbox.disable_search(GatewayError::QuotaExhausted);
        let guard = guard(sandbox.clone()).await;
        let session = SessionContext::for_user("005A");
        let scope = guard.scope(&session);

        let error = QueryExecutor::default()
            .search_text::<Account>(&scope, TextSearch::new::<Account>("Acme", "Name").limit(10))
            .await
            .unwrap_err();

        assert_eq!(error, QueryError::Call(CallError::Gateway(GatewayError::QuotaExhausted)));
        assert_eq!(sandbox.call_count(), 1);
    }

    #[tokio::test]
    async fn malformed_records_surface_as_masked_api_errors() {
        let sandbox = Arc::new(SandboxGateway::new());
        sandbox.insert("Account", json!({ "Id": "001000000000000001" }));
        let guard = guard(sandbox).await;
        let session = SessionContext::for_user("005A");
        let scope = guard.scope(&session);

        let error = QueryExecutor::default()
            .fetch::<Account>(&scope, QuerySpec::new("Account", &["Id", "Name"]).limit(5))
            .await
            .unwrap_err();

        let tool_error = ToolError::from(error);
        assert_eq!(tool_error.code, ToolErrorCode::SfApiError);
        assert!(tool_error.correlation_id().is_some());
    }

    #[test]
    fn ceiling_cannot_be_raised_past_the_hard_maximum() {
        assert_eq!(QueryExecutor::new(50_000).max_rows(), MAX_QUERY_ROWS);
        assert_eq!(QueryExecutor::new(0).max_rows(), 1);
    }
}
