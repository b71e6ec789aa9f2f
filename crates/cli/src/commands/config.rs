use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crmgate_core::config::AppConfig;
use secrecy::{ExposeSecret, SecretString};
use toml::Value;

use crate::commands::{load_config, CommandResult};

/// One rendered setting: dotted key, display value, and the env var that can override it.
struct Setting {
    key: &'static str,
    value: String,
    env_key: &'static str,
}

impl Setting {
    fn new(key: &'static str, value: impl Into<String>, env_key: &'static str) -> Self {
        Self { key, value: value.into(), env_key }
    }
}

pub fn run() -> CommandResult {
    let config = match load_config("config") {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for setting in settings(&config) {
        let source = field_source(
            setting.key,
            setting.env_key,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(format!("- {} = {} (source: {source})", setting.key, setting.value));
    }

    CommandResult { exit_code: 0, output: lines.join("\n") }
}

fn settings(config: &AppConfig) -> Vec<Setting> {
    let salesforce = &config.salesforce;
    vec![
        Setting::new("database.url", &config.database.url, "CRMGATE_DATABASE_URL"),
        Setting::new(
            "database.max_connections",
            config.database.max_connections.to_string(),
            "CRMGATE_DATABASE_MAX_CONNECTIONS",
        ),
        Setting::new("database.timeout_secs", config.database.timeout_secs.to_string(), "CRMGATE_DATABASE_TIMEOUT_SECS"),
        Setting::new("store.backend", config.store.backend.as_str(), "CRMGATE_STORE_BACKEND"),
        Setting::new("salesforce.instance_url", &salesforce.instance_url, "CRMGATE_SALESFORCE_INSTANCE_URL"),
        Setting::new("salesforce.api_version", &salesforce.api_version, "CRMGATE_SALESFORCE_API_VERSION"),
        Setting::new("salesforce.user_id", &salesforce.user_id, "CRMGATE_SALESFORCE_USER_ID"),
        Setting::new(
            "salesforce.access_token",
            redact_secret(salesforce.access_token.as_ref()),
            "CRMGATE_SALESFORCE_ACCESS_TOKEN",
        ),
        Setting::new(
            "salesforce.refresh_token",
            redact_secret(salesforce.refresh_token.as_ref()),
            "CRMGATE_SALESFORCE_REFRESH_TOKEN",
        ),
        Setting::new(
            "salesforce.client_id",
            salesforce.client_id.as_deref().unwrap_or("<unset>"),
            "CRMGATE_SALESFORCE_CLIENT_ID",
        ),
        Setting::new(
            "salesforce.client_secret",
            redact_secret(salesforce.client_secret.as_ref()),
            "CRMGATE_SALESFORCE_CLIENT_SECRET",
        ),
        Setting::new("salesforce.token_url", salesforce.resolved_token_url(), "CRMGATE_SALESFORCE_TOKEN_URL"),
        Setting::new("salesforce.timeout_secs", salesforce.timeout_secs.to_string(), "CRMGATE_SALESFORCE_TIMEOUT_SECS"),
        Setting::new("rate_limit.daily_limit", config.rate_limit.daily_limit.to_string(), "CRMGATE_RATE_LIMIT_DAILY_LIMIT"),
        Setting::new(
            "rate_limit.per_minute_limit",
            config.rate_limit.per_minute_limit.to_string(),
            "CRMGATE_RATE_LIMIT_PER_MINUTE_LIMIT",
        ),
        Setting::new(
            "rate_limit.warning_ratio",
            config.rate_limit.warning_ratio.to_string(),
            "CRMGATE_RATE_LIMIT_WARNING_RATIO",
        ),
        Setting::new(
            "write_back.dedup_window_secs",
            config.write_back.dedup_window_secs.to_string(),
            "CRMGATE_WRITE_BACK_DEDUP_WINDOW_SECS",
        ),
        Setting::new("query.max_rows", config.query.max_rows.to_string(), "CRMGATE_QUERY_MAX_ROWS"),
        Setting::new(
            "risk.stage_stagnation_days",
            config.risk.stage_stagnation_days.to_string(),
            "CRMGATE_RISK_STAGE_STAGNATION_DAYS",
        ),
        Setting::new("risk.inactivity_days", config.risk.inactivity_days.to_string(), "CRMGATE_RISK_INACTIVITY_DAYS"),
        Setting::new("risk.overdue_enabled", config.risk.overdue_enabled.to_string(), "CRMGATE_RISK_OVERDUE_ENABLED"),
        Setting::new(
            "risk.low_probability_threshold",
            config.risk.low_probability_threshold.to_string(),
            "CRMGATE_RISK_LOW_PROBABILITY_THRESHOLD",
        ),
        Setting::new("risk.late_stages", config.risk.late_stages.join(", "), "CRMGATE_RISK_LATE_STAGES"),
        Setting::new(
            "risk.minimum_amount_for_risk",
            config.risk.minimum_amount_for_risk.to_string(),
            "CRMGATE_RISK_MINIMUM_AMOUNT_FOR_RISK",
        ),
        Setting::new("knowledge.enabled", config.knowledge.enabled.to_string(), "CRMGATE_KNOWLEDGE_ENABLED"),
        Setting::new("knowledge.language", &config.knowledge.language, "CRMGATE_KNOWLEDGE_LANGUAGE"),
        Setting::new("logging.level", &config.logging.level, "CRMGATE_LOGGING_LEVEL"),
        Setting::new("logging.format", format!("{:?}", config.logging.format), "CRMGATE_LOGGING_FORMAT"),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("crmgate.toml"), PathBuf::from("config/crmgate.toml")].into_iter().find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: &str,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if env::var_os(env_key).is_some() {
        return format!("env ({env_key})");
    }

    if config_file_doc.is_some_and(|doc| contains_path(doc, key_path)) {
        let file_path = config_file_path
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "config file".to_string());
        return format!("file ({file_path})");
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

/// Never shows secret material, only whether it is present.
fn redact_secret(secret: Option<&SecretString>) -> &'static str {
    match secret {
        Some(secret) if !secret.expose_secret().trim().is_empty() => "<redacted>",
        Some(_) => "<empty>",
        None => "<unset>",
    }
}
