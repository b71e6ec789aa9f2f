//! Offline risk evaluation over exported opportunities.
//!
//! The input is a JSON array of Opportunity records as the CRM returns them
//! (`Id`, `StageName`, `CloseDate`, `Owner.Name`, ...), or a query response
//! object with a `records` array. Thresholds come from the effective config.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use crmgate_core::config::RiskThresholdConfig;
use crmgate_core::domain::records::{FromCrmRecord, Opportunity};
use crmgate_core::risk::AssessedOpportunity;
use crmgate_core::{PipelineSummary, RiskAnalysisEngine};
use serde::Serialize;
use serde_json::Value;

use crate::commands::{load_config, CommandResult};

#[derive(Debug, Serialize)]
struct RiskPreview {
    thresholds: RiskThresholdConfig,
    evaluated: usize,
    /// Input rows that could not be read as opportunities, by position.
    rejected: Vec<RejectedRow>,
    flagged: Vec<AssessedOpportunity>,
    summary: PipelineSummary,
}

#[derive(Debug, Serialize)]
struct RejectedRow {
    index: usize,
    reason: String,
}

pub fn run(input: &Path) -> CommandResult {
    let config = match load_config("risk-preview") {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    let preview = match read_records(input) {
        Ok(records) => preview(records, config.risk, Utc::now()),
        Err(error) => {
            return CommandResult::failure("risk-preview", "input", format!("{error:#}"), 7);
        }
    };

    match serde_json::to_string_pretty(&preview) {
        Ok(output) => CommandResult { exit_code: 0, output },
        Err(error) => CommandResult::failure("risk-preview", "serialization", error.to_string(), 8),
    }
}

fn read_records(path: &Path) -> Result<Vec<Value>> {
    let raw = fs::read_to_string(path).with_context(|| format!("could not read `{}`", path.display()))?;
    let document: Value =
        serde_json::from_str(&raw).with_context(|| format!("`{}` is not valid JSON", path.display()))?;

    match document {
        Value::Array(records) => Ok(records),
        Value::Object(mut response) => match response.remove("records") {
            Some(Value::Array(records)) => Ok(records),
            _ => bail!("expected a JSON array of records or an object with a `records` array"),
        },
        _ => bail!("expected a JSON array of records or an object with a `records` array"),
    }
}

fn preview(records: Vec<Value>, thresholds: RiskThresholdConfig, now: DateTime<Utc>) -> RiskPreview {
    let mut deals = Vec::with_capacity(records.len());
    let mut rejected = Vec::new();
    for (index, record) in records.into_iter().enumerate() {
        let parsed = match record {
            Value::Object(record) => Opportunity::from_record(&record).map_err(|error| error.to_string()),
            other => Err(format!("expected an object, found {}", kind_of(&other))),
        };
        match parsed {
            Ok(deal) => deals.push(deal),
            Err(reason) => rejected.push(RejectedRow { index, reason }),
        }
    }

    let engine = RiskAnalysisEngine::new(thresholds.clone());
    let flagged = engine
        .assess(deals.clone(), now)
        .into_iter()
        .filter(|assessed| !assessed.risk_flags.is_empty())
        .collect();

    RiskPreview {
        thresholds,
        evaluated: deals.len(),
        rejected,
        flagged,
        summary: engine.summarize(deals, now, true),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
