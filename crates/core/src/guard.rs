use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::auth::{AccessCredential, AuthContextResolver, AuthError};
use crate::domain::records::CrmRecord;
use crate::domain::session::SessionContext;
use crate::errors::{StoreError, ToolError};
use crate::gateway::{CrmGateway, GatewayError, QuerySpec, SearchRequest};
use crate::governor::{RateAdvisory, RateDecision, SessionRateGovernor};

/// Why a governed call did not produce a gateway result.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum CallError {
    #[error("rate limit reached for the {} window", .0.window.as_str())]
    RateLimited(RateAdvisory),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<CallError> for ToolError {
    fn from(error: CallError) -> Self {
        match error {
            CallError::RateLimited(advisory) => advisory.into(),
            CallError::Auth(error) => error.into(),
            CallError::Gateway(error) => error.into(),
            CallError::Store(error) => error.into(),
        }
    }
}

/// Every external CRM call passes through here: credential resolution, quota
/// admission, then one bounded gateway round trip.
pub struct GovernedGateway {
    gateway: Arc<dyn CrmGateway>,
    auth: Arc<AuthContextResolver>,
    governor: Arc<SessionRateGovernor>,
    call_timeout: Duration,
}

impl GovernedGateway {
    pub fn new(
        gateway: Arc<dyn CrmGateway>,
        auth: Arc<AuthContextResolver>,
        governor: Arc<SessionRateGovernor>,
        call_timeout: Duration,
    ) -> Self {
        Self { gateway, auth, governor, call_timeout }
    }

    /// Opens the call scope of one tool invocation.
    pub fn scope<'a>(&'a self, session: &'a SessionContext) -> CallScope<'a> {
        CallScope { guard: self, session, warning: Mutex::new(None), calls: AtomicU32::new(0) }
    }

    pub fn auth(&self) -> &Arc<AuthContextResolver> {
        &self.auth
    }

    pub fn governor(&self) -> &Arc<SessionRateGovernor> {
        &self.governor
    }
}

/// Calls made on behalf of a single tool invocation. Collects the rate warning
/// that the response envelope reports.
pub struct CallScope<'a> {
    guard: &'a GovernedGateway,
    session: &'a SessionContext,
    warning: Mutex<Option<RateAdvisory>>,
    calls: AtomicU32,
}

impl CallScope<'_> {
    pub fn session(&self) -> &SessionContext {
        self.session
    }

    pub async fn query(&self, spec: &QuerySpec) -> Result<Vec<CrmRecord>, CallError> {
        self.call("query", |gateway, credential| {
            let spec = spec.clone();
            async move { gateway.query(&credential, &spec).await }
        })
        .await
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<CrmRecord>, CallError> {
        self.call("search", |gateway, credential| {
            let request = request.clone();
            async move { gateway.search(&credential, &request).await }
        })
        .await
    }

    pub async fn create(&self, object: &str, fields: &CrmRecord) -> Result<String, CallError> {
        self.call("create", |gateway, credential| {
            let object = object.to_string();
            let fields = fields.clone();
            async move { gateway.create(&credential, &object, &fields).await }
        })
        .await
    }

    pub async fn update(&self, object: &str, record_id: &str, fields: &CrmRecord) -> Result<(), CallError> {
        self.call("update", |gateway, credential| {
            let object = object.to_string();
            let record_id = record_id.to_string();
            let fields = fields.clone();
            async move { gateway.update(&credential, &object, &record_id, &fields).await }
        })
        .await
    }

    /// Most recent warning raised during this scope, if any.
    pub fn take_warning(&self) -> Option<RateAdvisory> {
        match self.warning.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Number of calls that were admitted and dispatched to the gateway.
    pub fn external_calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }

    fn note_warning(&self, advisory: RateAdvisory) {
        match self.warning.lock() {
            Ok(mut slot) => *slot = Some(advisory),
            Err(poisoned) => *poisoned.into_inner() = Some(advisory),
        }
    }

    async fn admit(&self) -> Result<AccessCredential, CallError> {
        // Credential first: a refresh is not a CRM data call and is not metered.
        let credential = self.guard.auth.resolve(&self.session.user_id).await?;
        let cost = self.guard.governor.cost_per_call();
        match self.guard.governor.check_and_record(&self.session.session_id, cost).await? {
            RateDecision::Allow => {}
            RateDecision::AllowWithWarning(advisory) => self.note_warning(advisory),
            RateDecision::Deny(advisory) => return Err(CallError::RateLimited(advisory)),
        }
        Ok(credential)
    }

    /// Runs the call on its own task: a caller that goes away stops waiting but the
    /// in-flight request is left to finish.
    async fn call<T, F, Fut>(&self, operation: &'static str, invoke: F) -> Result<T, CallError>
    where
        F: Fn(Arc<dyn CrmGateway>, AccessCredential) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>> + Send + 'static,
        T: Send + 'static,
    {
        let mut reauthenticated = false;
        loop {
            let credential = self.admit().await?;
            self.calls.fetch_add(1, Ordering::Relaxed);

            let started = Instant::now();
            let task = tokio::spawn(invoke(Arc::clone(&self.guard.gateway), credential));
            let outcome = match tokio::time::timeout(self.guard.call_timeout, task).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_error)) => Err(GatewayError::Transport(format!("call task failed: {join_error}"))),
                Err(_) => Err(GatewayError::Timeout(self.guard.call_timeout)),
            };
            debug!(
                event_name = "crm.call",
                session_id = %self.session.session_id,
                operation,
                elapsed_ms = started.elapsed().as_millis() as u64,
                ok = outcome.is_ok(),
                "crm call finished"
            );

            match outcome {
                Err(GatewayError::SessionExpired) if !reauthenticated => {
                    reauthenticated = true;
                    warn!(
                        event_name = "auth.session_expired",
                        user_id = %self.session.user_id,
                        operation,
                        "CRM rejected the access token; refreshing once"
                    );
                    self.guard.auth.invalidate(&self.session.user_id).await;
                }
                Err(GatewayError::SessionExpired) => {
                    self.guard.auth.revoke(&self.session.user_id).await;
                    return Err(CallError::Auth(AuthError::SessionRejected));
                }
                other => return other.map_err(CallError::Gateway),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use secrecy::SecretString;
    use serde_json::json;

    use super::{CallError, GovernedGateway};
    use crate::auth::{AuthContext, AuthContextResolver, AuthError};
    use crate::clock::ManualClock;
    use crate::config::RateLimitConfig;
    use crate::domain::session::{SessionContext, UserId};
    use crate::errors::{ToolError, ToolErrorCode};
    use crate::gateway::{GatewayError, QuerySpec};
    use crate::governor::{InMemoryRateCounterStore, SessionRateGovernor};
    use crate::sandbox::{SandboxGateway, SandboxRefresher};

    struct Harness {
        sandbox: Arc<SandboxGateway>,
        refresher: Arc<SandboxRefresher>,
        guard: GovernedGateway,
        session: SessionContext,
    }

    async fn harness(quota: RateLimitConfig, timeout: Duration) -> Harness {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()));
        let sandbox = Arc::new(SandboxGateway::new());
        sandbox.insert("Account", json!({ "Id": "001000000000001AAA", "Name": "Acme Corp" }));
        let refresher = Arc::new(SandboxRefresher::new());
        let auth = Arc::new(AuthContextResolver::new(refresher.clone(), clock.clone()));
        auth.register(AuthContext {
            user_id: UserId("005A".to_string()),
            access_token: SecretString::from("token-0"),
            instance_url: "https://example.my.salesforce.com".to_string(),
            expires_at: None,
            refresh_token: Some(SecretString::from("refresh")),
        })
        .await;
        let governor =
            Arc::new(SessionRateGovernor::new(Arc::new(InMemoryRateCounterStore::new()), quota, clock));
        let guard = GovernedGateway::new(sandbox.clone(), auth, governor, timeout);
        Harness { sandbox, refresher, guard, session: SessionContext::for_user("005A") }
    }

    fn quota(per_minute_limit: u64) -> RateLimitConfig {
        RateLimitConfig { per_minute_limit, ..RateLimitConfig::default() }
    }

    fn accounts() -> QuerySpec {
        QuerySpec::new("Account", &["Id", "Name"]).limit(10)
    }

    #[tokio::test]
    async fn denied_calls_never_reach_the_gateway() {
        let h = harness(quota(1), Duration::from_secs(5)).await;
        let scope = h.guard.scope(&h.session);

        assert!(scope.query(&accounts()).await.is_ok());
        let denied = scope.query(&accounts()).await;

        assert!(matches!(denied, Err(CallError::RateLimited(_))));
        assert_eq!(h.sandbox.call_count(), 1);
        assert_eq!(scope.external_calls(), 1);
        let error = ToolError::from(denied.unwrap_err());
        assert_eq!(error.code, ToolErrorCode::RateLimitExceeded);
    }

    #[tokio::test]
    async fn warning_is_captured_for_the_envelope() {
        let h = harness(quota(10), Duration::from_secs(5)).await;
        let scope = h.guard.scope(&h.session);
        for _ in 0..8 {
            scope.query(&accounts()).await.unwrap();
        }

        let warning = scope.take_warning().expect("warning at 80%");
        assert_eq!(warning.calls_made, 8);
        assert!(scope.take_warning().is_none());
    }

    #[tokio::test]
    async fn expired_session_is_refreshed_once_and_retried() {
        let h = harness(quota(100), Duration::from_secs(5)).await;
        h.sandbox.expire_token("token-0");
        let scope = h.guard.scope(&h.session);

        let records = scope.query(&accounts()).await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(h.refresher.refresh_count(), 1);
        assert_eq!(h.sandbox.call_count(), 2);
    }

    #[tokio::test]
    async fn second_rejection_surfaces_auth_error() {
        let h = harness(quota(100), Duration::from_secs(5)).await;
        h.sandbox.expire_token("token-0");
        h.sandbox.expire_token("sandbox-token-1");
        let scope = h.guard.scope(&h.session);

        let error = scope.query(&accounts()).await.unwrap_err();

        assert_eq!(error, CallError::Auth(AuthError::SessionRejected));
        assert!(!h.guard.auth().is_authenticated(&h.session.user_id).await);
    }

    #[tokio::test]
    async fn slow_calls_time_out_as_gateway_errors() {
        let h = harness(quota(100), Duration::from_millis(20)).await;
        h.sandbox.set_latency(Duration::from_millis(500));
        let scope = h.guard.scope(&h.session);

        let error = scope.query(&accounts()).await.unwrap_err();

        assert!(matches!(error, CallError::Gateway(GatewayError::Timeout(_))));
        assert_eq!(ToolError::from(error).code, ToolErrorCode::SfApiError);
    }
}
