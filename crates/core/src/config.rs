use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::query::MAX_QUERY_ROWS;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub store: StoreConfig,
    pub salesforce: SalesforceConfig,
    pub rate_limit: RateLimitConfig,
    pub write_back: WriteBackConfig,
    pub query: QueryConfig,
    pub risk: RiskThresholdConfig,
    pub knowledge: KnowledgeConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub backend: StoreBackend,
}

#[derive(Clone, Debug)]
pub struct SalesforceConfig {
    pub instance_url: String,
    pub api_version: String,
    pub user_id: String,
    pub access_token: Option<SecretString>,
    pub refresh_token: Option<SecretString>,
    pub client_id: Option<String>,
    pub client_secret: Option<SecretString>,
    /// Defaults to `{instance_url}/services/oauth2/token`.
    pub token_url: Option<String>,
    pub timeout_secs: u64,
    pub token_ttl_secs: u64,
    pub refresh_skew_secs: u64,
}

/// Quota ceilings enforced per session by the rate governor.
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitConfig {
    pub daily_limit: u64,
    pub per_minute_limit: u64,
    pub warning_ratio: f64,
    pub cost_per_call: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteBackConfig {
    pub dedup_window_secs: u64,
    /// How long a confirmed write waits on an identical in-flight write before giving up.
    pub inflight_wait_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryConfig {
    pub max_rows: u32,
    pub disambiguation_preview: u32,
    pub default_limit: u32,
    pub max_tool_limit: u32,
}

/// Admin-tunable risk parameters. Loaded once at startup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RiskThresholdConfig {
    pub stage_stagnation_days: u32,
    pub inactivity_days: u32,
    pub overdue_enabled: bool,
    /// Win probability percentage (0-100).
    pub low_probability_threshold: f64,
    pub late_stages: Vec<String>,
    pub minimum_amount_for_risk: Decimal,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KnowledgeConfig {
    pub enabled: bool,
    pub language: String,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub store_backend: Option<StoreBackend>,
    pub salesforce_instance_url: Option<String>,
    pub salesforce_access_token: Option<String>,
    pub rate_daily_limit: Option<u64>,
    pub rate_per_minute_limit: Option<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://crmgate.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            store: StoreConfig { backend: StoreBackend::Memory },
            salesforce: SalesforceConfig {
                instance_url: String::new(),
                api_version: "62.0".to_string(),
                user_id: "integration-user".to_string(),
                access_token: None,
                refresh_token: None,
                client_id: None,
                client_secret: None,
                token_url: None,
                timeout_secs: 30,
                token_ttl_secs: 7200, // 2 hours
                refresh_skew_secs: 60,
            },
            rate_limit: RateLimitConfig::default(),
            write_back: WriteBackConfig::default(),
            query: QueryConfig::default(),
            risk: RiskThresholdConfig::default(),
            knowledge: KnowledgeConfig { enabled: true, language: "en_US".to_string() },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { daily_limit: 100_000, per_minute_limit: 100, warning_ratio: 0.80, cost_per_call: 1 }
    }
}

impl Default for WriteBackConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: 300, // 5 minutes
            inflight_wait_secs: 30,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_rows: MAX_QUERY_ROWS,
            disambiguation_preview: 5,
            default_limit: 25,
            max_tool_limit: 50,
        }
    }
}

impl Default for RiskThresholdConfig {
    fn default() -> Self {
        Self {
            stage_stagnation_days: 30,
            inactivity_days: 14,
            overdue_enabled: true,
            low_probability_threshold: 30.0,
            late_stages: vec!["Negotiation/Review".to_string(), "Proposal/Price Quote".to_string()],
            minimum_amount_for_risk: Decimal::from(10_000),
        }
    }
}

impl SalesforceConfig {
    pub fn resolved_token_url(&self) -> String {
        self.token_url.clone().unwrap_or_else(|| {
            format!("{}/services/oauth2/token", self.instance_url.trim_end_matches('/'))
        })
    }

    pub fn has_refresh_grant(&self) -> bool {
        let present = |value: &Option<SecretString>| {
            value.as_ref().map(|secret| !secret.expose_secret().trim().is_empty()).unwrap_or(false)
        };
        present(&self.refresh_token)
            && present(&self.client_secret)
            && self.client_id.as_ref().map(|id| !id.trim().is_empty()).unwrap_or(false)
    }

    pub fn has_access_token(&self) -> bool {
        self.access_token
            .as_ref()
            .map(|token| !token.expose_secret().trim().is_empty())
            .unwrap_or(false)
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(ConfigError::Validation(format!(
                "unsupported store backend `{other}` (expected memory|sqlite)"
            ))),
        }
    }
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sqlite => "sqlite",
        }
    }
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("crmgate.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(store) = patch.store {
            if let Some(backend) = store.backend {
                self.store.backend = backend;
            }
        }

        if let Some(salesforce) = patch.salesforce {
            let target = &mut self.salesforce;
            if let Some(instance_url) = salesforce.instance_url {
                target.instance_url = instance_url;
            }
            if let Some(api_version) = salesforce.api_version {
                target.api_version = api_version;
            }
            if let Some(user_id) = salesforce.user_id {
                target.user_id = user_id;
            }
            if let Some(access_token) = salesforce.access_token {
                target.access_token = Some(secret_value(access_token));
            }
            if let Some(refresh_token) = salesforce.refresh_token {
                target.refresh_token = Some(secret_value(refresh_token));
            }
            if let Some(client_id) = salesforce.client_id {
                target.client_id = Some(client_id);
            }
            if let Some(client_secret) = salesforce.client_secret {
                target.client_secret = Some(secret_value(client_secret));
            }
            if let Some(token_url) = salesforce.token_url {
                target.token_url = Some(token_url);
            }
            if let Some(timeout_secs) = salesforce.timeout_secs {
                target.timeout_secs = timeout_secs;
            }
            if let Some(token_ttl_secs) = salesforce.token_ttl_secs {
                target.token_ttl_secs = token_ttl_secs;
            }
            if let Some(refresh_skew_secs) = salesforce.refresh_skew_secs {
                target.refresh_skew_secs = refresh_skew_secs;
            }
        }

        if let Some(rate_limit) = patch.rate_limit {
            if let Some(daily_limit) = rate_limit.daily_limit {
                self.rate_limit.daily_limit = daily_limit;
            }
            if let Some(per_minute_limit) = rate_limit.per_minute_limit {
                self.rate_limit.per_minute_limit = per_minute_limit;
            }
            if let Some(warning_ratio) = rate_limit.warning_ratio {
                self.rate_limit.warning_ratio = warning_ratio;
            }
            if let Some(cost_per_call) = rate_limit.cost_per_call {
                self.rate_limit.cost_per_call = cost_per_call;
            }
        }

        if let Some(write_back) = patch.write_back {
            if let Some(dedup_window_secs) = write_back.dedup_window_secs {
                self.write_back.dedup_window_secs = dedup_window_secs;
            }
            if let Some(inflight_wait_secs) = write_back.inflight_wait_secs {
                self.write_back.inflight_wait_secs = inflight_wait_secs;
            }
        }

        if let Some(query) = patch.query {
            if let Some(max_rows) = query.max_rows {
                self.query.max_rows = max_rows;
            }
            if let Some(disambiguation_preview) = query.disambiguation_preview {
                self.query.disambiguation_preview = disambiguation_preview;
            }
            if let Some(default_limit) = query.default_limit {
                self.query.default_limit = default_limit;
            }
            if let Some(max_tool_limit) = query.max_tool_limit {
                self.query.max_tool_limit = max_tool_limit;
            }
        }

        if let Some(risk) = patch.risk {
            if let Some(days) = risk.stage_stagnation_days {
                self.risk.stage_stagnation_days = days;
            }
            if let Some(days) = risk.inactivity_days {
                self.risk.inactivity_days = days;
            }
            if let Some(enabled) = risk.overdue_enabled {
                self.risk.overdue_enabled = enabled;
            }
            if let Some(threshold) = risk.low_probability_threshold {
                self.risk.low_probability_threshold = threshold;
            }
            if let Some(late_stages) = risk.late_stages {
                self.risk.late_stages = late_stages;
            }
            if let Some(amount) = risk.minimum_amount_for_risk {
                self.risk.minimum_amount_for_risk = amount;
            }
        }

        if let Some(knowledge) = patch.knowledge {
            if let Some(enabled) = knowledge.enabled {
                self.knowledge.enabled = enabled;
            }
            if let Some(language) = knowledge.language {
                self.knowledge.language = language;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("CRMGATE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("CRMGATE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_num("CRMGATE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("CRMGATE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_num("CRMGATE_DATABASE_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("CRMGATE_STORE_BACKEND") {
            self.store.backend = value.parse()?;
        }

        let salesforce = &mut self.salesforce;
        if let Some(value) = read_env("CRMGATE_SALESFORCE_INSTANCE_URL") {
            salesforce.instance_url = value;
        }
        if let Some(value) = read_env("CRMGATE_SALESFORCE_API_VERSION") {
            salesforce.api_version = value;
        }
        if let Some(value) = read_env("CRMGATE_SALESFORCE_USER_ID") {
            salesforce.user_id = value;
        }
        if let Some(value) = read_env("CRMGATE_SALESFORCE_ACCESS_TOKEN") {
            salesforce.access_token = Some(secret_value(value));
        }
        if let Some(value) = read_env("CRMGATE_SALESFORCE_REFRESH_TOKEN") {
            salesforce.refresh_token = Some(secret_value(value));
        }
        if let Some(value) = read_env("CRMGATE_SALESFORCE_CLIENT_ID") {
            salesforce.client_id = Some(value);
        }
        if let Some(value) = read_env("CRMGATE_SALESFORCE_CLIENT_SECRET") {
            salesforce.client_secret = Some(secret_value(value));
        }
        if let Some(value) = read_env("CRMGATE_SALESFORCE_TOKEN_URL") {
            salesforce.token_url = Some(value);
        }
        if let Some(value) = read_env("CRMGATE_SALESFORCE_TIMEOUT_SECS") {
            salesforce.timeout_secs = parse_num("CRMGATE_SALESFORCE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CRMGATE_RATE_LIMIT_DAILY_LIMIT") {
            self.rate_limit.daily_limit = parse_num("CRMGATE_RATE_LIMIT_DAILY_LIMIT", &value)?;
        }
        if let Some(value) = read_env("CRMGATE_RATE_LIMIT_PER_MINUTE_LIMIT") {
            self.rate_limit.per_minute_limit =
                parse_num("CRMGATE_RATE_LIMIT_PER_MINUTE_LIMIT", &value)?;
        }
        if let Some(value) = read_env("CRMGATE_RATE_LIMIT_WARNING_RATIO") {
            self.rate_limit.warning_ratio = parse_num("CRMGATE_RATE_LIMIT_WARNING_RATIO", &value)?;
        }

        if let Some(value) = read_env("CRMGATE_WRITE_BACK_DEDUP_WINDOW_SECS") {
            self.write_back.dedup_window_secs =
                parse_num("CRMGATE_WRITE_BACK_DEDUP_WINDOW_SECS", &value)?;
        }
        if let Some(value) = read_env("CRMGATE_QUERY_MAX_ROWS") {
            self.query.max_rows = parse_num("CRMGATE_QUERY_MAX_ROWS", &value)?;
        }

        if let Some(value) = read_env("CRMGATE_RISK_STAGE_STAGNATION_DAYS") {
            self.risk.stage_stagnation_days =
                parse_num("CRMGATE_RISK_STAGE_STAGNATION_DAYS", &value)?;
        }
        if let Some(value) = read_env("CRMGATE_RISK_INACTIVITY_DAYS") {
            self.risk.inactivity_days = parse_num("CRMGATE_RISK_INACTIVITY_DAYS", &value)?;
        }
        if let Some(value) = read_env("CRMGATE_RISK_OVERDUE_ENABLED") {
            self.risk.overdue_enabled = parse_num("CRMGATE_RISK_OVERDUE_ENABLED", &value)?;
        }
        if let Some(value) = read_env("CRMGATE_RISK_LOW_PROBABILITY_THRESHOLD") {
            self.risk.low_probability_threshold =
                parse_num("CRMGATE_RISK_LOW_PROBABILITY_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("CRMGATE_RISK_LATE_STAGES") {
            self.risk.late_stages = value
                .split(',')
                .map(str::trim)
                .filter(|stage| !stage.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = read_env("CRMGATE_RISK_MINIMUM_AMOUNT_FOR_RISK") {
            self.risk.minimum_amount_for_risk =
                parse_num("CRMGATE_RISK_MINIMUM_AMOUNT_FOR_RISK", &value)?;
        }

        if let Some(value) = read_env("CRMGATE_KNOWLEDGE_ENABLED") {
            self.knowledge.enabled = parse_num("CRMGATE_KNOWLEDGE_ENABLED", &value)?;
        }
        if let Some(value) = read_env("CRMGATE_KNOWLEDGE_LANGUAGE") {
            self.knowledge.language = value;
        }

        let log_level =
            read_env("CRMGATE_LOGGING_LEVEL").or_else(|| read_env("CRMGATE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("CRMGATE_LOGGING_FORMAT").or_else(|| read_env("CRMGATE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(backend) = overrides.store_backend {
            self.store.backend = backend;
        }
        if let Some(instance_url) = overrides.salesforce_instance_url {
            self.salesforce.instance_url = instance_url;
        }
        if let Some(access_token) = overrides.salesforce_access_token {
            self.salesforce.access_token = Some(secret_value(access_token));
        }
        if let Some(daily_limit) = overrides.rate_daily_limit {
            self.rate_limit.daily_limit = daily_limit;
        }
        if let Some(per_minute_limit) = overrides.rate_per_minute_limit {
            self.rate_limit.per_minute_limit = per_minute_limit;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_salesforce(&self.salesforce)?;
        validate_rate_limit(&self.rate_limit)?;
        validate_write_back(&self.write_back)?;
        validate_query(&self.query)?;
        validate_risk(&self.risk)?;
        validate_knowledge(&self.knowledge)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("crmgate.toml"), PathBuf::from("config/crmgate.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validation(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation(message.into())
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)",
        ));
    }
    if database.max_connections == 0 {
        return Err(validation("database.max_connections must be greater than zero"));
    }
    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(validation("database.timeout_secs must be in range 1..=300"));
    }
    Ok(())
}

/// Longest credential lifetime accepted from config or a token endpoint.
pub const MAX_TOKEN_TTL_SECS: u64 = 30 * 86_400;

fn validate_salesforce(salesforce: &SalesforceConfig) -> Result<(), ConfigError> {
    let url = salesforce.instance_url.trim();
    if url.is_empty() {
        return Err(validation(
            "salesforce.instance_url is required (e.g. https://yourorg.my.salesforce.com)",
        ));
    }
    if !url.starts_with("https://") && !url.starts_with("http://") {
        return Err(validation("salesforce.instance_url must start with http:// or https://"));
    }

    let version_ok = salesforce
        .api_version
        .split_once('.')
        .map(|(major, minor)| {
            !major.is_empty()
                && !minor.is_empty()
                && major.chars().all(|c| c.is_ascii_digit())
                && minor.chars().all(|c| c.is_ascii_digit())
        })
        .unwrap_or(false);
    if !version_ok {
        return Err(validation("salesforce.api_version must look like `62.0`"));
    }

    if salesforce.user_id.trim().is_empty() {
        return Err(validation("salesforce.user_id must not be empty"));
    }

    if !salesforce.has_access_token() && !salesforce.has_refresh_grant() {
        return Err(validation(
            "either salesforce.access_token or salesforce.refresh_token with client_id and client_secret must be set",
        ));
    }

    if salesforce.timeout_secs == 0 || salesforce.timeout_secs > 300 {
        return Err(validation("salesforce.timeout_secs must be in range 1..=300"));
    }
    if salesforce.token_ttl_secs < 60 || salesforce.token_ttl_secs > MAX_TOKEN_TTL_SECS {
        return Err(validation("salesforce.token_ttl_secs must be in range 60..=2592000 (30 days)"));
    }
    if salesforce.refresh_skew_secs >= salesforce.token_ttl_secs {
        return Err(validation("salesforce.refresh_skew_secs must be below token_ttl_secs"));
    }
    Ok(())
}

fn validate_rate_limit(rate_limit: &RateLimitConfig) -> Result<(), ConfigError> {
    if rate_limit.daily_limit == 0 || rate_limit.per_minute_limit == 0 {
        return Err(validation("rate_limit ceilings must be greater than zero"));
    }
    if rate_limit.per_minute_limit > rate_limit.daily_limit {
        return Err(validation("rate_limit.per_minute_limit must not exceed daily_limit"));
    }
    if !(rate_limit.warning_ratio > 0.0 && rate_limit.warning_ratio < 1.0) {
        return Err(validation("rate_limit.warning_ratio must be between 0 and 1 (exclusive)"));
    }
    if rate_limit.cost_per_call == 0 {
        return Err(validation("rate_limit.cost_per_call must be at least 1"));
    }
    Ok(())
}

fn validate_write_back(write_back: &WriteBackConfig) -> Result<(), ConfigError> {
    if write_back.dedup_window_secs < 60 || write_back.dedup_window_secs > 86_400 {
        return Err(validation("write_back.dedup_window_secs must be in range 60..=86400"));
    }
    if write_back.inflight_wait_secs == 0 || write_back.inflight_wait_secs > 300 {
        return Err(validation("write_back.inflight_wait_secs must be in range 1..=300"));
    }
    Ok(())
}

fn validate_query(query: &QueryConfig) -> Result<(), ConfigError> {
    if query.max_rows == 0 || query.max_rows > MAX_QUERY_ROWS {
        return Err(validation(format!("query.max_rows must be in range 1..={MAX_QUERY_ROWS}")));
    }
    if query.max_tool_limit == 0 || query.max_tool_limit > query.max_rows {
        return Err(validation("query.max_tool_limit must be in range 1..=query.max_rows"));
    }
    if query.default_limit == 0 || query.default_limit > query.max_tool_limit {
        return Err(validation("query.default_limit must be in range 1..=query.max_tool_limit"));
    }
    if query.disambiguation_preview == 0 || query.disambiguation_preview > query.max_tool_limit {
        return Err(validation(
            "query.disambiguation_preview must be in range 1..=query.max_tool_limit",
        ));
    }
    Ok(())
}

fn validate_risk(risk: &RiskThresholdConfig) -> Result<(), ConfigError> {
    if risk.stage_stagnation_days == 0 || risk.inactivity_days == 0 {
        return Err(validation("risk day thresholds must be greater than zero"));
    }
    if !(0.0..=100.0).contains(&risk.low_probability_threshold) {
        return Err(validation("risk.low_probability_threshold must be in range 0..=100"));
    }
    if risk.minimum_amount_for_risk.is_sign_negative() {
        return Err(validation("risk.minimum_amount_for_risk must not be negative"));
    }
    if risk.late_stages.iter().any(|stage| stage.trim().is_empty()) {
        return Err(validation("risk.late_stages must not contain empty stage names"));
    }
    Ok(())
}

fn validate_knowledge(knowledge: &KnowledgeConfig) -> Result<(), ConfigError> {
    let valid = !knowledge.language.is_empty()
        && knowledge.language.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(validation("knowledge.language must be a locale code such as en_US"));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(validation("logging.level must be one of trace|debug|info|warn|error")),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    store: Option<StorePatch>,
    salesforce: Option<SalesforcePatch>,
    rate_limit: Option<RateLimitPatch>,
    write_back: Option<WriteBackPatch>,
    query: Option<QueryPatch>,
    risk: Option<RiskPatch>,
    knowledge: Option<KnowledgePatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct StorePatch {
    backend: Option<StoreBackend>,
}

#[derive(Debug, Default, Deserialize)]
struct SalesforcePatch {
    instance_url: Option<String>,
    api_version: Option<String>,
    user_id: Option<String>,
    access_token: Option<String>,
    refresh_token: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    token_url: Option<String>,
    timeout_secs: Option<u64>,
    token_ttl_secs: Option<u64>,
    refresh_skew_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RateLimitPatch {
    daily_limit: Option<u64>,
    per_minute_limit: Option<u64>,
    warning_ratio: Option<f64>,
    cost_per_call: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct WriteBackPatch {
    dedup_window_secs: Option<u64>,
    inflight_wait_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct QueryPatch {
    max_rows: Option<u32>,
    disambiguation_preview: Option<u32>,
    default_limit: Option<u32>,
    max_tool_limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RiskPatch {
    stage_stagnation_days: Option<u32>,
    inactivity_days: Option<u32>,
    overdue_enabled: Option<bool>,
    low_probability_threshold: Option<f64>,
    late_stages: Option<Vec<String>>,
    minimum_amount_for_risk: Option<Decimal>,
}

#[derive(Debug, Default, Deserialize)]
struct KnowledgePatch {
    enabled: Option<bool>,
    language: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use rust_decimal::Decimal;
    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat, StoreBackend};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    const BASE_VARS: [&str; 2] = ["CRMGATE_SALESFORCE_INSTANCE_URL", "CRMGATE_SALESFORCE_ACCESS_TOKEN"];

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn set_base_vars() {
        env::set_var("CRMGATE_SALESFORCE_INSTANCE_URL", "https://acme.my.salesforce.com");
        env::set_var("CRMGATE_SALESFORCE_ACCESS_TOKEN", "00Dxx!token-from-env");
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_match_documented_thresholds() {
        let config = AppConfig::default();

        assert_eq!(config.rate_limit.daily_limit, 100_000);
        assert_eq!(config.rate_limit.warning_ratio, 0.80);
        assert_eq!(config.write_back.dedup_window_secs, 300);
        assert_eq!(config.query.max_rows, 2000);
        assert_eq!(config.query.disambiguation_preview, 5);
        assert_eq!(config.risk.inactivity_days, 14);
        assert_eq!(config.risk.stage_stagnation_days, 30);
        assert_eq!(config.risk.minimum_amount_for_risk, Decimal::from(10_000));
        assert!(config.risk.late_stages.iter().any(|stage| stage == "Negotiation/Review"));
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_SF_REFRESH_TOKEN", "5Aep-refresh-from-env");
        env::set_var("TEST_SF_CLIENT_SECRET", "consumer-secret-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("crmgate.toml");
            fs::write(
                &path,
                r#"
[salesforce]
instance_url = "https://acme.my.salesforce.com"
client_id = "3MVG9-consumer-key"
client_secret = "${TEST_SF_CLIENT_SECRET}"
refresh_token = "${TEST_SF_REFRESH_TOKEN}"

[risk]
inactivity_days = 21
late_stages = ["Negotiation/Review"]
minimum_amount_for_risk = 5000
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            let refresh = config
                .salesforce
                .refresh_token
                .as_ref()
                .map(|token| token.expose_secret().to_string())
                .unwrap_or_default();
            ensure(refresh == "5Aep-refresh-from-env", "refresh token should come from env")?;
            ensure(config.salesforce.has_refresh_grant(), "refresh grant should be complete")?;
            ensure(config.risk.inactivity_days == 21, "risk inactivity days should load from file")?;
            ensure(config.risk.late_stages.len() == 1, "late stages should be replaced by file")?;
            ensure(
                config.risk.minimum_amount_for_risk == Decimal::from(5000),
                "minimum amount should load from file",
            )?;
            Ok(())
        })();

        clear_vars(&["TEST_SF_REFRESH_TOKEN", "TEST_SF_CLIENT_SECRET"]);
        result
    }

    #[test]
    fn missing_interpolation_variable_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("crmgate.toml");
        fs::write(&path, "[salesforce]\naccess_token = \"${CRMGATE_TEST_UNSET_VAR}\"\n")
            .map_err(|err| err.to_string())?;

        let error = AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
            .err()
            .ok_or_else(|| "expected interpolation failure".to_string())?;
        ensure(
            matches!(error, ConfigError::MissingEnvInterpolation { ref var } if var == "CRMGATE_TEST_UNSET_VAR"),
            "error should name the missing variable",
        )
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        set_base_vars();
        env::set_var("CRMGATE_LOG_LEVEL", "warn");
        env::set_var("CRMGATE_LOG_FORMAT", "json");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Json),
                "json logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&BASE_VARS);
        clear_vars(&["CRMGATE_LOG_LEVEL", "CRMGATE_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        set_base_vars();
        env::set_var("CRMGATE_RATE_LIMIT_PER_MINUTE_LIMIT", "40");
        env::set_var("CRMGATE_STORE_BACKEND", "sqlite");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("crmgate.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[rate_limit]
per_minute_limit = 10
daily_limit = 5000

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.rate_limit.per_minute_limit == 40, "env should win over file")?;
            ensure(config.rate_limit.daily_limit == 5000, "file should win over defaults")?;
            ensure(config.store.backend == StoreBackend::Sqlite, "store backend from env")?;
            Ok(())
        })();

        clear_vars(&BASE_VARS);
        clear_vars(&["CRMGATE_RATE_LIMIT_PER_MINUTE_LIMIT", "CRMGATE_STORE_BACKEND"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("CRMGATE_SALESFORCE_INSTANCE_URL", "https://acme.my.salesforce.com");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("salesforce.access_token")
            );
            ensure(has_message, "validation failure should mention the missing credential")
        })();

        clear_vars(&BASE_VARS);
        result
    }

    #[test]
    fn invalid_numeric_env_override_is_rejected() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        set_base_vars();
        env::set_var("CRMGATE_RATE_LIMIT_DAILY_LIMIT", "lots");

        let result = match AppConfig::load(LoadOptions::default()) {
            Err(ConfigError::InvalidEnvOverride { key, .. }) => {
                ensure(key == "CRMGATE_RATE_LIMIT_DAILY_LIMIT", "error should name the key")
            }
            Err(other) => Err(format!("unexpected error: {other}")),
            Ok(_) => Err("expected invalid env override".to_string()),
        };

        clear_vars(&BASE_VARS);
        clear_vars(&["CRMGATE_RATE_LIMIT_DAILY_LIMIT"]);
        result
    }

    #[test]
    fn warning_ratio_must_be_fractional() {
        let mut config = AppConfig::default();
        config.salesforce.instance_url = "https://acme.my.salesforce.com".to_string();
        config.salesforce.access_token = Some("token".to_string().into());
        config.rate_limit.warning_ratio = 1.2;

        let error = config.validate().err();
        assert!(matches!(
            error,
            Some(ConfigError::Validation(ref message)) if message.contains("warning_ratio")
        ));
    }

    #[test]
    fn token_lifetime_is_bounded() {
        let mut config = AppConfig::default();
        config.salesforce.instance_url = "https://acme.my.salesforce.com".to_string();
        config.salesforce.access_token = Some("token".to_string().into());

        config.salesforce.token_ttl_secs = u64::MAX;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation(ref message)) if message.contains("salesforce.token_ttl_secs")
        ));

        config.salesforce.token_ttl_secs = 30 * 86_400;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn query_ceiling_cannot_be_raised_past_hard_limit() {
        let mut config = AppConfig::default();
        config.salesforce.instance_url = "https://acme.my.salesforce.com".to_string();
        config.salesforce.access_token = Some("token".to_string().into());
        config.query.max_rows = 5000;

        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation(ref message)) if message.contains("query.max_rows")
        ));
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        set_base_vars();
        env::set_var("CRMGATE_SALESFORCE_CLIENT_SECRET", "super-secret-consumer-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("token-from-env"), "debug output should not contain token")?;
            ensure(
                !debug.contains("super-secret-consumer-value"),
                "debug output should not contain client secret",
            )?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(&BASE_VARS);
        clear_vars(&["CRMGATE_SALESFORCE_CLIENT_SECRET"]);
        result
    }

    #[test]
    fn token_url_defaults_to_instance_endpoint() {
        let mut config = AppConfig::default();
        config.salesforce.instance_url = "https://acme.my.salesforce.com/".to_string();
        assert_eq!(
            config.salesforce.resolved_token_url(),
            "https://acme.my.salesforce.com/services/oauth2/token"
        );
    }
}
