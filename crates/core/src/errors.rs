use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Fixed error vocabulary understood by the agent runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolErrorCode {
    NotFound,
    PermissionDenied,
    RateLimitWarning,
    RateLimitExceeded,
    InvalidInput,
    SfApiError,
    AuthError,
    FeatureDisabled,
}

impl ToolErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::RateLimitWarning => "RATE_LIMIT_WARNING",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::InvalidInput => "INVALID_INPUT",
            Self::SfApiError => "SF_API_ERROR",
            Self::AuthError => "AUTH_ERROR",
            Self::FeatureDisabled => "FEATURE_DISABLED",
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::NotFound => "No matching record was found.",
            Self::PermissionDenied => {
                "You don't have access to this record. Ask your administrator if you need it."
            }
            Self::RateLimitWarning => {
                "API usage is close to its limit. Keep requests focused for a while."
            }
            Self::RateLimitExceeded => {
                "The API usage limit has been reached. Please wait before trying again."
            }
            Self::InvalidInput => "The request could not be processed. Check inputs and try again.",
            Self::SfApiError => "The CRM service is temporarily unavailable. Please retry shortly.",
            Self::AuthError => "Your CRM session has expired. Please sign in again to continue.",
            Self::FeatureDisabled => {
                "This feature is not enabled for your organization. Contact your administrator."
            }
        }
    }

    /// Whether the agent may reasonably re-issue the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SfApiError | Self::RateLimitExceeded)
    }
}

impl fmt::Display for ToolErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single error shape that crosses the tool boundary.
#[derive(Clone, Debug, Error, PartialEq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct ToolError {
    pub code: ToolErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
}

impl ToolError {
    pub fn new(code: ToolErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: None }
    }

    /// Error carrying only the non-technical default message for `code`.
    pub fn from_code(code: ToolErrorCode) -> Self {
        Self::new(code, code.user_message())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ToolErrorCode::InvalidInput, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ToolErrorCode::NotFound, message)
    }

    /// Hides internal detail behind the default message and a correlation id that
    /// operators can match against logs.
    pub fn masked(code: ToolErrorCode, correlation_id: impl Into<String>) -> Self {
        Self::from_code(code).with_detail("correlation_id", correlation_id.into())
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.get_or_insert_with(Map::new).insert(key.to_string(), value.into());
        self
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.details.as_ref().and_then(|details| details.get("correlation_id")).and_then(Value::as_str)
    }
}

/// Failure of an injected session or idempotency store.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
}

impl From<StoreError> for ToolError {
    fn from(error: StoreError) -> Self {
        let correlation_id = new_correlation_id();
        tracing::error!(
            event_name = "store.failure",
            correlation_id = %correlation_id,
            error = %error,
            "mediation store failed"
        );
        ToolError::masked(ToolErrorCode::SfApiError, correlation_id)
    }
}

pub fn new_correlation_id() -> String {
    format!("req-{}", uuid::Uuid::new_v4().simple())
}
