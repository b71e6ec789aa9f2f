use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Duration;
use crmgate_core::auth::{AuthContext, AuthContextResolver, AuthError, RefreshedToken, TokenRefresher};
use crmgate_core::clock::{Clock, SystemClock};
use crmgate_core::config::{AppConfig, ConfigError, LogFormat, LoggingConfig, StoreBackend};
use crmgate_core::domain::session::{SessionContext, SessionId, UserId};
use crmgate_core::gateway::{CrmGateway, GatewayError};
use crmgate_core::{
    GovernedGateway, IdempotencyStore, InMemoryIdempotencyStore, InMemoryRateCounterStore, RateCounterStore,
    SessionRateGovernor, WriteBackGate,
};
use crmgate_db::{open_store, OpenStoreError, SqlIdempotencyStore, SqlRateCounterStore};
use crmgate_salesforce::{OAuthRefresher, SalesforceGateway};
use secrecy::SecretString;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::service::CrmToolService;

pub struct Application {
    pub config: AppConfig,
    pub service: Arc<CrmToolService>,
    /// Session of the single agent connection this process serves.
    pub session: SessionContext,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] OpenStoreError),
    #[error("salesforce client setup failed: {0}")]
    Gateway(#[source] GatewayError),
    #[error("oauth client setup failed: {0}")]
    Refresher(#[source] AuthError),
}

/// Durable state behind the governor and the write-back gate.
pub struct Stores {
    pub rate_counters: Arc<dyn RateCounterStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            rate_counters: Arc::new(InMemoryRateCounterStore::new()),
            idempotency: Arc::new(InMemoryIdempotencyStore::new()),
        }
    }
}

/// Logs go to stderr; stdout carries the protocol. `RUST_LOG` wins over the
/// configured level when set.
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stderr);

    let installed = match config.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if installed.is_err() {
        tracing::debug!(event_name = "system.logging.already_installed", "global subscriber was already set");
    }
}

pub async fn bootstrap(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        store_backend = config.store.backend.as_str(),
        instance_url = %config.salesforce.instance_url,
        "starting crmgate bootstrap"
    );

    let stores = open_stores(&config).await?;
    let gateway = SalesforceGateway::from_config(&config.salesforce).map_err(BootstrapError::Gateway)?;
    let refresher: Arc<dyn TokenRefresher> = match OAuthRefresher::from_config(&config.salesforce)
        .map_err(BootstrapError::Refresher)?
    {
        Some(refresher) => Arc::new(refresher),
        None => Arc::new(NoRefreshGrant),
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let service = assemble(&config, Arc::new(gateway), refresher, stores, clock).await;
    let session = SessionContext::new(SessionId::generate(), UserId(config.salesforce.user_id.clone()));

    info!(
        event_name = "system.bootstrap.ready",
        session_id = %session.session_id,
        user_id = %session.user_id,
        "crmgate ready"
    );
    Ok(Application { config, service: Arc::new(service), session })
}

pub async fn open_stores(config: &AppConfig) -> Result<Stores, BootstrapError> {
    match config.store.backend {
        StoreBackend::Memory => Ok(Stores::in_memory()),
        StoreBackend::Sqlite => {
            let pool = open_store(&config.database).await?;
            info!(event_name = "system.bootstrap.store_opened", database_url = %config.database.url, "sqlite store opened");
            Ok(Stores {
                rate_counters: Arc::new(SqlRateCounterStore::new(pool.clone())),
                idempotency: Arc::new(SqlIdempotencyStore::new(pool)),
            })
        }
    }
}

/// Wires the mediation layer around `gateway` and registers the configured
/// user's credential.
pub async fn assemble(
    config: &AppConfig,
    gateway: Arc<dyn CrmGateway>,
    refresher: Arc<dyn TokenRefresher>,
    stores: Stores,
    clock: Arc<dyn Clock>,
) -> CrmToolService {
    let salesforce = &config.salesforce;
    let auth = AuthContextResolver::new(refresher, clock.clone()).with_token_lifetime(
        Duration::seconds(salesforce.token_ttl_secs as i64),
        Duration::seconds(salesforce.refresh_skew_secs as i64),
    );
    auth.register(initial_context(config, clock.as_ref())).await;

    let governor = SessionRateGovernor::new(stores.rate_counters, config.rate_limit.clone(), clock.clone());
    let guarded = GovernedGateway::new(
        gateway,
        Arc::new(auth),
        Arc::new(governor),
        StdDuration::from_secs(salesforce.timeout_secs),
    );
    let writes = WriteBackGate::new(
        stores.idempotency,
        clock.clone(),
        Duration::seconds(config.write_back.dedup_window_secs as i64),
        StdDuration::from_secs(config.write_back.inflight_wait_secs),
    );
    CrmToolService::new(guarded, writes, clock, config)
}

/// Counters of a session idle this long cover no open window.
pub const SESSION_IDLE_CUTOFF_HOURS: i64 = 24;

/// Sweeps expired dedup entries and idle session counters every `every`
/// until the handle is aborted.
pub fn spawn_maintenance(service: Arc<CrmToolService>, every: StdDuration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(error) = service.sweep(Duration::hours(SESSION_IDLE_CUTOFF_HOURS)).await {
                warn!(event_name = "maintenance.sweep_failed", error = %error, "could not sweep expired state");
            }
        }
    })
}

/// Without an access token the credential starts out expired, so the first
/// call refreshes it.
fn initial_context(config: &AppConfig, clock: &dyn Clock) -> AuthContext {
    let salesforce = &config.salesforce;
    let (access_token, expires_at) = match (&salesforce.access_token, salesforce.has_access_token()) {
        (Some(token), true) => (token.clone(), None),
        _ => (SecretString::from(String::new()), Some(clock.now())),
    };
    AuthContext {
        user_id: UserId(salesforce.user_id.clone()),
        access_token,
        instance_url: salesforce.instance_url.trim_end_matches('/').to_string(),
        expires_at,
        refresh_token: salesforce.has_refresh_grant().then(|| salesforce.refresh_token.clone()).flatten(),
    }
}

/// Stands in when the config carries no refresh grant. The resolver only asks
/// it when a refresh token is present, which the config rules out.
struct NoRefreshGrant;

#[async_trait]
impl TokenRefresher for NoRefreshGrant {
    async fn refresh(&self, _refresh_token: &SecretString) -> Result<RefreshedToken, AuthError> {
        Err(AuthError::RefreshRejected("no refresh grant is configured".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use crmgate_core::clock::ManualClock;
    use crmgate_core::config::AppConfig;
    use secrecy::{ExposeSecret, SecretString};

    use super::initial_context;

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.salesforce.instance_url = "https://acme.my.salesforce.com/".to_string();
        config
    }

    #[test]
    fn configured_access_token_is_used_until_rejected() {
        let mut config = config();
        config.salesforce.access_token = Some(SecretString::from("00Dtoken".to_string()));
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());

        let context = initial_context(&config, &clock);
        assert_eq!(context.access_token.expose_secret(), "00Dtoken");
        assert_eq!(context.expires_at, None);
        assert_eq!(context.instance_url, "https://acme.my.salesforce.com");
        assert!(context.refresh_token.is_none());
    }

    #[test]
    fn refresh_grant_alone_starts_expired() {
        let mut config = config();
        config.salesforce.refresh_token = Some(SecretString::from("refresh".to_string()));
        config.salesforce.client_id = Some("client".to_string());
        config.salesforce.client_secret = Some(SecretString::from("secret".to_string()));
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let clock = ManualClock::new(now);

        let context = initial_context(&config, &clock);
        assert_eq!(context.expires_at, Some(now));
        assert!(context.refresh_token.is_some());
    }
}
