use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::auth::AccessCredential;
use crate::domain::records::CrmRecord;
use crate::errors::{new_correlation_id, ToolError, ToolErrorCode};

/// Request/response surface of the external CRM. Implementations perform exactly
/// one remote round trip per call and never retry on their own.
#[async_trait]
pub trait CrmGateway: Send + Sync {
    async fn query(
        &self,
        credential: &AccessCredential,
        spec: &QuerySpec,
    ) -> Result<Vec<CrmRecord>, GatewayError>;

    /// Ranked full-text search.
    async fn search(
        &self,
        credential: &AccessCredential,
        request: &SearchRequest,
    ) -> Result<Vec<CrmRecord>, GatewayError>;

    /// Returns the new record id.
    async fn create(
        &self,
        credential: &AccessCredential,
        object: &str,
        fields: &CrmRecord,
    ) -> Result<String, GatewayError>;

    async fn update(
        &self,
        credential: &AccessCredential,
        object: &str,
        record_id: &str,
        fields: &CrmRecord,
    ) -> Result<(), GatewayError>;
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("session expired or invalid")]
    SessionExpired,
    #[error("insufficient access: {0}")]
    PermissionDenied(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("organization request limit exceeded")]
    QuotaExhausted,
    #[error("malformed request: {0}")]
    InvalidRequest(String),
    #[error("capability unavailable: {0}")]
    FeatureUnavailable(String),
    #[error("external call timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("CRM API error {status} {code}: {message}")]
    Api { status: u16, code: String, message: String },
}

impl GatewayError {
    /// Failures a degraded lookup path may still work around.
    pub fn allows_fallback(&self) -> bool {
        !matches!(self, Self::QuotaExhausted | Self::SessionExpired | Self::PermissionDenied(_))
    }
}

impl From<GatewayError> for ToolError {
    fn from(error: GatewayError) -> Self {
        match error {
            GatewayError::PermissionDenied(detail) => {
                tracing::info!(event_name = "crm.permission_denied", detail = %detail);
                ToolError::from_code(ToolErrorCode::PermissionDenied)
            }
            GatewayError::NotFound(_) => ToolError::from_code(ToolErrorCode::NotFound),
            GatewayError::QuotaExhausted => ToolError::new(
                ToolErrorCode::RateLimitExceeded,
                "The organization's CRM API limit has been reached. Please try again later.",
            )
            .with_detail("scope", "organization"),
            GatewayError::InvalidRequest(detail) => {
                tracing::warn!(event_name = "crm.invalid_request", detail = %detail);
                ToolError::invalid_input(
                    "The CRM rejected one of the provided values. Check inputs and try again.",
                )
            }
            GatewayError::FeatureUnavailable(_) => ToolError::from_code(ToolErrorCode::FeatureDisabled),
            GatewayError::SessionExpired => {
                ToolError::from_code(ToolErrorCode::AuthError).with_detail("action", "reauthenticate")
            }
            other => {
                let correlation_id = new_correlation_id();
                tracing::error!(
                    event_name = "crm.call_failed",
                    correlation_id = %correlation_id,
                    error = %other,
                    "external CRM call failed"
                );
                ToolError::masked(ToolErrorCode::SfApiError, correlation_id)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FilterValue {
    Text(String),
    Bool(bool),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
    Integer(i64),
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<bool> for FilterValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for FilterValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<DateTime<Utc>> for FilterValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<NaiveDate> for FilterValue {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

/// Typed filter predicate. Adapters render it with their own escaping; callers
/// never splice raw query text.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    Compare { field: String, op: CompareOp, value: FilterValue },
    /// Case-insensitive substring match.
    Contains { field: String, term: String },
    In { field: String, values: Vec<String> },
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<FilterValue>) -> Self {
        Self::Compare { field: field.to_string(), op: CompareOp::Eq, value: value.into() }
    }

    pub fn compare(field: &str, op: CompareOp, value: impl Into<FilterValue>) -> Self {
        Self::Compare { field: field.to_string(), op, value: value.into() }
    }

    pub fn contains(field: &str, term: impl Into<String>) -> Self {
        Self::Contains { field: field.to_string(), term: term.into() }
    }

    pub fn is_in(field: &str, values: Vec<String>) -> Self {
        Self::In { field: field.to_string(), values }
    }

    /// Conjunction that collapses to its only member.
    pub fn all(mut filters: Vec<Filter>) -> Option<Self> {
        match filters.len() {
            0 => None,
            1 => filters.pop(),
            _ => Some(Self::And(filters)),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Compare { field, .. } => validate_field_name(field),
            Self::Contains { field, term } => {
                validate_field_name(field)?;
                if term.trim().is_empty() {
                    return Err(format!("search term for `{field}` must not be empty"));
                }
                Ok(())
            }
            Self::In { field, values } => {
                validate_field_name(field)?;
                if values.is_empty() {
                    return Err(format!("value list for `{field}` must not be empty"));
                }
                Ok(())
            }
            Self::And(filters) | Self::Or(filters) => {
                if filters.is_empty() {
                    return Err("compound filter must contain at least one predicate".to_string());
                }
                filters.iter().try_for_each(Filter::validate)
            }
        }
    }
}

pub fn validate_field_name(name: &str) -> Result<(), String> {
    let valid = !name.is_empty()
        && name.split('.').all(|segment| {
            let mut chars = segment.chars();
            matches!(chars.next(), Some(first) if first.is_ascii_alphabetic())
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(format!("`{name}` is not a valid field name"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn asc(field: &str) -> Self {
        Self { field: field.to_string(), direction: SortDirection::Asc }
    }

    pub fn desc(field: &str) -> Self {
        Self { field: field.to_string(), direction: SortDirection::Desc }
    }
}

/// One bounded structured read.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QuerySpec {
    pub object: String,
    pub fields: Vec<String>,
    pub filter: Option<Filter>,
    pub order_by: Vec<OrderBy>,
    pub limit: u32,
}

impl QuerySpec {
    pub fn new(object: &str, fields: &[&str]) -> Self {
        Self {
            object: object.to_string(),
            fields: fields.iter().map(|field| field.to_string()).collect(),
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

/// Ranked full-text lookup scoped to one object.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SearchRequest {
    pub term: String,
    pub object: String,
    pub fields: Vec<String>,
    pub filter: Option<Filter>,
    pub order_by: Vec<OrderBy>,
    pub limit: u32,
}

impl SearchRequest {
    pub fn new(term: &str, object: &str, fields: &[&str]) -> Self {
        Self {
            term: term.to_string(),
            object: object.to_string(),
            fields: fields.iter().map(|field| field.to_string()).collect(),
            filter: None,
            order_by: Vec::new(),
            limit: 1,
        }
    }
}
