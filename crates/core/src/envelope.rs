use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{ToolError, ToolErrorCode};
use crate::governor::RateAdvisory;

/// Advisory attached to an otherwise successful payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    pub code: ToolErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
}

impl From<RateAdvisory> for Warning {
    fn from(advisory: RateAdvisory) -> Self {
        let mut details = Map::new();
        details.insert("window".to_string(), Value::from(advisory.window.as_str()));
        details.insert("calls_made".to_string(), Value::from(advisory.calls_made));
        details.insert("limit".to_string(), Value::from(advisory.limit));
        details.insert("usage_percent".to_string(), Value::from(advisory.usage_percent));
        Self { code: ToolErrorCode::RateLimitWarning, message: advisory.message(), details: Some(details) }
    }
}

/// Uniform result of every tool call: a payload or an error, never both.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    warning: Option<Warning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ToolError>,
}

impl ToolResponse {
    pub fn success(payload: Value) -> Self {
        Self { payload: Some(payload), warning: None, error: None }
    }

    pub fn failure(error: ToolError) -> Self {
        Self { payload: None, warning: None, error: Some(error) }
    }

    pub fn from_result(result: Result<Value, ToolError>) -> Self {
        match result {
            Ok(payload) => Self::success(payload),
            Err(error) => Self::failure(error),
        }
    }

    /// Attaches `warning` to a successful response. Failures carry no warnings.
    pub fn with_warning(mut self, warning: Option<Warning>) -> Self {
        if self.payload.is_some() {
            self.warning = warning;
        }
        self
    }

    pub fn is_success(&self) -> bool {
        self.payload.is_some()
    }

    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    pub fn warning(&self) -> Option<&Warning> {
        self.warning.as_ref()
    }

    pub fn error(&self) -> Option<&ToolError> {
        self.error.as_ref()
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({ "error": { "code": "SF_API_ERROR", "message": ToolErrorCode::SfApiError.user_message() } })
        })
    }
}
