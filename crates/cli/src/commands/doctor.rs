use crmgate_core::config::{AppConfig, LoadOptions, StoreBackend};
use crmgate_db::{connect_with_settings, migrations};
use crmgate_salesforce::{OAuthRefresher, SalesforceGateway};
use serde::Serialize;

use crate::commands::CommandResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

impl DoctorCheck {
    fn pass(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Pass, details: details.into() }
    }

    fn fail(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Fail, details: details.into() }
    }

    fn skipped(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Skipped, details: details.into() }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

/// Exit code 0 when every non-skipped check passes, 6 otherwise.
pub fn run(json_output: bool) -> CommandResult {
    let report = build_report(AppConfig::load(LoadOptions::default()));
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { 6 };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

fn build_report<E: std::fmt::Display>(loaded: Result<AppConfig, E>) -> DoctorReport {
    let checks = match loaded {
        Ok(config) => vec![
            DoctorCheck::pass("config_validation", "configuration loaded and validated"),
            check_credential_mode(&config),
            check_store(&config),
        ],
        Err(error) => vec![
            DoctorCheck::fail("config_validation", error.to_string()),
            DoctorCheck::skipped("credential_mode", "skipped because configuration did not load"),
            DoctorCheck::skipped("store_connectivity", "skipped because configuration did not load"),
        ],
    };

    let healthy = checks.iter().all(|check| check.status != CheckStatus::Fail);
    let overall_status = if healthy { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if healthy {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

/// Confirms which credential flow the server will use and that its clients build.
fn check_credential_mode(config: &AppConfig) -> DoctorCheck {
    const NAME: &str = "credential_mode";
    let salesforce = &config.salesforce;

    if let Err(error) = SalesforceGateway::from_config(salesforce) {
        return DoctorCheck::fail(NAME, format!("salesforce client could not be built: {error}"));
    }
    let refresher = match OAuthRefresher::from_config(salesforce) {
        Ok(refresher) => refresher,
        Err(error) => return DoctorCheck::fail(NAME, format!("oauth client could not be built: {error}")),
    };

    match (salesforce.has_access_token(), refresher.is_some()) {
        (true, true) => DoctorCheck::pass(NAME, "access token with refresh grant"),
        (true, false) => DoctorCheck::pass(NAME, "static access token (no refresh grant; expiry ends the session)"),
        (false, true) => DoctorCheck::pass(
            NAME,
            format!("refresh grant only (first call refreshes against {})", salesforce.resolved_token_url()),
        ),
        (false, false) => DoctorCheck::fail(NAME, "no access token and no refresh grant configured"),
    }
}

fn check_store(config: &AppConfig) -> DoctorCheck {
    const NAME: &str = "store_connectivity";
    if config.store.backend == StoreBackend::Memory {
        return DoctorCheck::skipped(NAME, "store.backend is memory; counters and dedup keys live in process");
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => return DoctorCheck::fail(NAME, format!("failed to initialize async runtime: {error}")),
    };

    let result = runtime.block_on(async {
        let pool = connect_with_settings(
            &config.database.url,
            config.database.max_connections,
            config.database.timeout_secs,
        )
        .await
        .map_err(|error| format!("failed to connect to database: {error}"))?;

        let applied = migrations::applied_count(&pool).await.ok();
        pool.close().await;
        Ok::<(usize, Option<i64>), String>((migrations::known_count(), applied))
    });

    match result {
        Ok((known, Some(applied))) if applied as usize >= known => {
            DoctorCheck::pass(NAME, format!("connected using `{}`; schema is current", config.database.url))
        }
        Ok((known, Some(applied))) => DoctorCheck::fail(
            NAME,
            format!("{} of {known} migrations applied; run `crmgate migrate`", applied.max(0)),
        ),
        Ok((_, None)) => DoctorCheck::fail(NAME, "schema not initialized; run `crmgate migrate`"),
        Err(error) => DoctorCheck::fail(NAME, error),
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = vec![report.summary.clone()];

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use crmgate_core::config::AppConfig;
    use secrecy::SecretString;

    use super::{build_report, render_human, CheckStatus};

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.salesforce.instance_url = "https://acme.my.salesforce.com".to_string();
        config.salesforce.access_token = Some(SecretString::from("00Dtoken".to_string()));
        config
    }

    #[test]
    fn memory_backend_with_access_token_is_ready() {
        let report = build_report::<String>(Ok(config()));

        assert_eq!(report.overall_status, CheckStatus::Pass);
        assert_eq!(report.checks[1].status, CheckStatus::Pass);
        assert!(report.checks[1].details.starts_with("static access token"));
        assert_eq!(report.checks[2].status, CheckStatus::Skipped);
    }

    #[test]
    fn config_failure_skips_dependent_checks() {
        let report = build_report::<String>(Err("salesforce.instance_url is required".to_string()));

        assert_eq!(report.overall_status, CheckStatus::Fail);
        assert!(report.checks[1..].iter().all(|check| check.status == CheckStatus::Skipped));
        let rendered = render_human(&report);
        assert!(rendered.contains("- [fail] config_validation: salesforce.instance_url is required"));
    }
}
