use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::domain::session::UserId;
use crate::errors::{ToolError, ToolErrorCode};

/// What downstream calls need to talk to the CRM on a user's behalf.
#[derive(Clone, Debug)]
pub struct AccessCredential {
    pub access_token: SecretString,
    pub instance_url: String,
}

/// A user's delegated credential as cached by the resolver.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub user_id: UserId,
    pub access_token: SecretString,
    pub instance_url: String,
    /// `None` when the issuer did not say; such tokens are only replaced after the
    /// CRM rejects them.
    pub expires_at: Option<DateTime<Utc>>,
    pub refresh_token: Option<SecretString>,
}

impl AuthContext {
    pub fn credential(&self) -> AccessCredential {
        AccessCredential {
            access_token: self.access_token.clone(),
            instance_url: self.instance_url.clone(),
        }
    }

    fn needs_refresh(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        self.expires_at.map(|expires_at| expires_at - skew <= now).unwrap_or(false)
    }
}

#[derive(Clone, Debug)]
pub struct RefreshedToken {
    pub access_token: SecretString,
    /// Some issuers rotate the refresh token; absent means keep the old one.
    pub refresh_token: Option<SecretString>,
    pub instance_url: Option<String>,
    pub expires_in: Option<Duration>,
}

/// Narrow refresh interface to the identity provider.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &SecretString) -> Result<RefreshedToken, AuthError>;
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("no credential is registered for user `{0}`")]
    NotAuthenticated(UserId),
    #[error("credential for user `{0}` expired and no refresh grant is available")]
    RefreshUnavailable(UserId),
    #[error("token refresh was rejected: {0}")]
    RefreshRejected(String),
    #[error("token refresh could not complete: {0}")]
    RefreshFailed(String),
    #[error("the CRM rejected the refreshed session")]
    SessionRejected,
}

impl From<AuthError> for ToolError {
    fn from(error: AuthError) -> Self {
        let tool_error = ToolError::from_code(ToolErrorCode::AuthError);
        match error {
            AuthError::RefreshFailed(_) => tool_error.with_detail("retryable", true),
            _ => tool_error.with_detail("action", "reauthenticate"),
        }
    }
}

type Slot = Arc<Mutex<Option<AuthContext>>>;

/// Owns one credential slot per user. A slot's mutex is held across refresh, so
/// concurrent callers for the same user wait for the in-flight refresh instead of
/// starting their own.
pub struct AuthContextResolver {
    slots: RwLock<HashMap<UserId, Slot>>,
    refresher: Arc<dyn TokenRefresher>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
    refresh_skew: Duration,
}

impl AuthContextResolver {
    pub fn new(refresher: Arc<dyn TokenRefresher>, clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            refresher,
            clock,
            default_ttl: Duration::hours(2),
            refresh_skew: Duration::seconds(60),
        }
    }

    /// Lifetime assumed for refreshed tokens whose response carries no expiry.
    pub fn with_token_lifetime(mut self, default_ttl: Duration, refresh_skew: Duration) -> Self {
        self.default_ttl = default_ttl;
        self.refresh_skew = refresh_skew;
        self
    }

    /// Installs or replaces the user's credential wholesale.
    pub async fn register(&self, context: AuthContext) {
        let user_id = context.user_id.clone();
        let slot = {
            let mut slots = self.slots.write().await;
            slots.entry(user_id).or_insert_with(|| Arc::new(Mutex::new(None))).clone()
        };
        *slot.lock().await = Some(context);
    }

    pub async fn resolve(&self, user_id: &UserId) -> Result<AccessCredential, AuthError> {
        let slot = self.slot(user_id).await?;
        let mut guard = slot.lock().await;
        let now = self.clock.now();

        let Some(context) = guard.as_ref() else {
            return Err(AuthError::NotAuthenticated(user_id.clone()));
        };
        if !context.needs_refresh(now, self.refresh_skew) {
            return Ok(context.credential());
        }

        let Some(refresh_token) = context.refresh_token.clone() else {
            *guard = None;
            warn!(
                event_name = "auth.credential.revoked",
                user_id = %user_id,
                "credential expired without a refresh grant"
            );
            return Err(AuthError::RefreshUnavailable(user_id.clone()));
        };

        match self.refresher.refresh(&refresh_token).await {
            Ok(token) => {
                let expires_at = token
                    .expires_in
                    .and_then(|expires_in| now.checked_add_signed(expires_in))
                    .or_else(|| now.checked_add_signed(self.default_ttl))
                    .unwrap_or(now);
                let refreshed = AuthContext {
                    user_id: user_id.clone(),
                    access_token: token.access_token,
                    instance_url: token.instance_url.unwrap_or_else(|| context.instance_url.clone()),
                    expires_at: Some(expires_at),
                    refresh_token: Some(token.refresh_token.unwrap_or(refresh_token)),
                };
                let credential = refreshed.credential();
                *guard = Some(refreshed);
                info!(event_name = "auth.token.refreshed", user_id = %user_id, "refreshed access token");
                Ok(credential)
            }
            Err(error @ AuthError::RefreshFailed(_)) => {
                warn!(
                    event_name = "auth.token.refresh_failed",
                    user_id = %user_id,
                    error = %error,
                    "token refresh failed; keeping refresh grant"
                );
                Err(error)
            }
            Err(error) => {
                *guard = None;
                warn!(
                    event_name = "auth.credential.revoked",
                    user_id = %user_id,
                    error = %error,
                    "token refresh rejected"
                );
                Err(error)
            }
        }
    }

    /// Forces the next `resolve` to refresh. Used when the CRM rejects a token
    /// the resolver still considered valid.
    pub async fn invalidate(&self, user_id: &UserId) {
        if let Ok(slot) = self.slot(user_id).await {
            if let Some(context) = slot.lock().await.as_mut() {
                context.expires_at = Some(self.clock.now() - Duration::seconds(1));
            }
        }
    }

    pub async fn revoke(&self, user_id: &UserId) {
        if let Ok(slot) = self.slot(user_id).await {
            *slot.lock().await = None;
            warn!(event_name = "auth.credential.revoked", user_id = %user_id, "credential revoked");
        }
    }

    pub async fn is_authenticated(&self, user_id: &UserId) -> bool {
        match self.slot(user_id).await {
            Ok(slot) => slot.lock().await.is_some(),
            Err(_) => false,
        }
    }

    async fn slot(&self, user_id: &UserId) -> Result<Slot, AuthError> {
        self.slots
            .read()
            .await
            .get(user_id)
            .cloned()
            .ok_or_else(|| AuthError::NotAuthenticated(user_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use secrecy::{ExposeSecret, SecretString};

    use super::{AuthContext, AuthContextResolver, AuthError, RefreshedToken, TokenRefresher};
    use crate::clock::ManualClock;
    use crate::domain::session::UserId;
    use crate::errors::{ToolError, ToolErrorCode};

    struct CountingRefresher {
        calls: AtomicUsize,
        outcome: Result<(), AuthError>,
    }

    impl CountingRefresher {
        fn succeeding() -> Self {
            Self { calls: AtomicUsize::new(0), outcome: Ok(()) }
        }

        fn failing(error: AuthError) -> Self {
            Self { calls: AtomicUsize::new(0), outcome: Err(error) }
        }
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(&self, _refresh_token: &SecretString) -> Result<RefreshedToken, AuthError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.outcome.clone()?;
            Ok(RefreshedToken {
                access_token: SecretString::from(format!("fresh-{call}")),
                refresh_token: None,
                instance_url: None,
                expires_in: Some(Duration::hours(1)),
            })
        }
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().unwrap_or_default(),
        ))
    }

    fn context(user: &str, expires_in: Option<Duration>, clock: &ManualClock) -> AuthContext {
        use crate::clock::Clock;
        AuthContext {
            user_id: UserId(user.to_string()),
            access_token: SecretString::from("initial"),
            instance_url: "https://acme.my.salesforce.com".to_string(),
            expires_at: expires_in.map(|ttl| clock.now() + ttl),
            refresh_token: Some(SecretString::from("refresh-grant")),
        }
    }

    #[tokio::test]
    async fn valid_credential_is_returned_without_refresh() {
        let clock = clock();
        let refresher = Arc::new(CountingRefresher::succeeding());
        let resolver = AuthContextResolver::new(refresher.clone(), clock.clone());
        resolver.register(context("005A", Some(Duration::hours(1)), &clock)).await;

        let credential = resolver.resolve(&UserId("005A".to_string())).await;

        assert_eq!(credential.map(|c| c.access_token.expose_secret().to_string()).ok(), Some("initial".to_string()));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let clock = clock();
        let refresher = Arc::new(CountingRefresher::succeeding());
        let resolver = Arc::new(AuthContextResolver::new(refresher.clone(), clock.clone()));
        resolver.register(context("005A", Some(Duration::seconds(30)), &clock)).await;
        let user = UserId("005A".to_string());

        let (first, second) = tokio::join!(resolver.resolve(&user), resolver.resolve(&user));

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        let first = first.map(|c| c.access_token.expose_secret().to_string()).ok();
        let second = second.map(|c| c.access_token.expose_secret().to_string()).ok();
        assert_eq!(first, Some("fresh-1".to_string()));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn rejected_refresh_revokes_the_slot() {
        let clock = clock();
        let refresher =
            Arc::new(CountingRefresher::failing(AuthError::RefreshRejected("invalid_grant".to_string())));
        let resolver = AuthContextResolver::new(refresher.clone(), clock.clone());
        resolver.register(context("005A", Some(Duration::seconds(10)), &clock)).await;
        let user = UserId("005A".to_string());

        let error = resolver.resolve(&user).await.err();
        assert!(matches!(error, Some(AuthError::RefreshRejected(_))));
        assert!(!resolver.is_authenticated(&user).await);

        let again = resolver.resolve(&user).await.err();
        assert!(matches!(again, Some(AuthError::NotAuthenticated(_))));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_refresh_failure_keeps_the_grant() {
        let clock = clock();
        let refresher =
            Arc::new(CountingRefresher::failing(AuthError::RefreshFailed("connection reset".to_string())));
        let resolver = AuthContextResolver::new(refresher, clock.clone());
        resolver.register(context("005A", Some(Duration::seconds(10)), &clock)).await;

        let user = UserId("005A".to_string());
        assert!(resolver.resolve(&user).await.is_err());
        assert!(resolver.is_authenticated(&user).await);
    }

    #[tokio::test]
    async fn invalidated_token_without_expiry_is_refreshed() {
        let clock = clock();
        let refresher = Arc::new(CountingRefresher::succeeding());
        let resolver = AuthContextResolver::new(refresher.clone(), clock.clone());
        resolver.register(context("005A", None, &clock)).await;
        let user = UserId("005A".to_string());

        resolver.invalidate(&user).await;
        let token = resolver.resolve(&user).await.map(|c| c.access_token.expose_secret().to_string());

        assert_eq!(token.ok(), Some("fresh-1".to_string()));
    }

    #[tokio::test]
    async fn unknown_user_is_not_authenticated() {
        let resolver = AuthContextResolver::new(Arc::new(CountingRefresher::succeeding()), clock());
        let error = resolver.resolve(&UserId("nobody".to_string())).await.err();

        assert!(matches!(error, Some(AuthError::NotAuthenticated(_))));
        let tool_error = error.map(ToolError::from);
        assert_eq!(tool_error.map(|e| e.code), Some(ToolErrorCode::AuthError));
    }
}
