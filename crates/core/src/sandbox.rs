//! In-process CRM used by tests and local demos. Evaluates typed filters over
//! seeded records, and can inject faults, latency and token expiry.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::auth::{AccessCredential, AuthError, RefreshedToken, TokenRefresher};
use crate::domain::records::{field, parse_crm_timestamp, CrmRecord};
use crate::gateway::{
    CompareOp, CrmGateway, Filter, FilterValue, GatewayError, OrderBy, QuerySpec, SearchRequest,
    SortDirection,
};

#[derive(Clone, Debug, PartialEq)]
pub enum GatewayCall {
    Query { object: String, limit: u32 },
    Search { object: String, term: String },
    Create { object: String, fields: CrmRecord },
    Update { object: String, record_id: String, fields: CrmRecord },
}

impl GatewayCall {
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Create { .. } | Self::Update { .. })
    }
}

#[derive(Default)]
struct SandboxState {
    objects: HashMap<String, Vec<CrmRecord>>,
    calls: Vec<GatewayCall>,
    faults: VecDeque<GatewayError>,
    search_fault: Option<GatewayError>,
    expired_tokens: HashSet<String>,
    latency: Option<Duration>,
    next_id: u64,
}

#[derive(Default)]
pub struct SandboxGateway {
    state: Mutex<SandboxState>,
}

impl SandboxGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds one record. Non-object values are ignored.
    pub fn insert(&self, object: &str, record: Value) {
        if let Value::Object(record) = record {
            self.state().objects.entry(object.to_string()).or_default().push(record);
        }
    }

    pub fn records(&self, object: &str) -> Vec<CrmRecord> {
        self.state().objects.get(object).cloned().unwrap_or_default()
    }

    /// Queues an error for the next call of any kind.
    pub fn fail_next(&self, error: GatewayError) {
        self.state().faults.push_back(error);
    }

    /// Makes every full-text search fail with `error`.
    pub fn disable_search(&self, error: GatewayError) {
        self.state().search_fault = Some(error);
    }

    pub fn expire_token(&self, token: &str) {
        self.state().expired_tokens.insert(token.to_string());
    }

    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = Some(latency);
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    pub fn write_count(&self) -> usize {
        self.state().calls.iter().filter(|call| call.is_write()).count()
    }

    fn state(&self) -> MutexGuard<'_, SandboxState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn begin(&self, credential: &AccessCredential, call: GatewayCall) -> Result<(), GatewayError> {
        let (latency, outcome) = {
            let mut state = self.state();
            let is_search = matches!(call, GatewayCall::Search { .. });
            state.calls.push(call);
            let outcome = if state.expired_tokens.contains(credential.access_token.expose_secret()) {
                Err(GatewayError::SessionExpired)
            } else if let Some(fault) = state.faults.pop_front() {
                Err(fault)
            } else if let Some(fault) = state.search_fault.clone().filter(|_| is_search) {
                Err(fault)
            } else {
                Ok(())
            };
            (state.latency, outcome)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        outcome
    }

    fn select(&self, object: &str, filter: Option<&Filter>, order_by: &[OrderBy], limit: u32) -> Vec<CrmRecord> {
        self.select_where(object, order_by, limit, |record| filter.map_or(true, |f| matches_filter(record, f)))
    }

    fn select_where(
        &self,
        object: &str,
        order_by: &[OrderBy],
        limit: u32,
        predicate: impl Fn(&CrmRecord) -> bool,
    ) -> Vec<CrmRecord> {
        let mut rows: Vec<CrmRecord> = self
            .state()
            .objects
            .get(object)
            .map(|records| records.iter().filter(|record| predicate(*record)).cloned().collect())
            .unwrap_or_default();
        rows.sort_by(|left, right| {
            order_by
                .iter()
                .map(|order| {
                    let ordering = compare_json(field(left, &order.field), field(right, &order.field));
                    match order.direction {
                        SortDirection::Asc => ordering,
                        SortDirection::Desc => ordering.reverse(),
                    }
                })
                .find(|ordering| *ordering != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });
        rows.truncate(limit as usize);
        rows
    }
}

#[async_trait]
impl CrmGateway for SandboxGateway {
    async fn query(
        &self,
        credential: &AccessCredential,
        spec: &QuerySpec,
    ) -> Result<Vec<CrmRecord>, GatewayError> {
        self.begin(credential, GatewayCall::Query { object: spec.object.clone(), limit: spec.limit })
            .await?;
        Ok(self.select(&spec.object, spec.filter.as_ref(), &spec.order_by, spec.limit))
    }

    async fn search(
        &self,
        credential: &AccessCredential,
        request: &SearchRequest,
    ) -> Result<Vec<CrmRecord>, GatewayError> {
        self.begin(
            credential,
            GatewayCall::Search { object: request.object.clone(), term: request.term.clone() },
        )
        .await?;
        let term = request.term.to_lowercase();
        Ok(self.select_where(&request.object, &request.order_by, request.limit, |record| {
            let hit = request.fields.iter().any(|name| {
                field(record, name)
                    .and_then(Value::as_str)
                    .is_some_and(|value| value.to_lowercase().contains(&term))
            });
            hit && request.filter.as_ref().map_or(true, |filter| matches_filter(record, filter))
        }))
    }

    async fn create(
        &self,
        credential: &AccessCredential,
        object: &str,
        fields: &CrmRecord,
    ) -> Result<String, GatewayError> {
        self.begin(credential, GatewayCall::Create { object: object.to_string(), fields: fields.clone() })
            .await?;
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("{}{:015}", id_prefix(object), state.next_id);
        let mut record = fields.clone();
        record.insert("Id".to_string(), Value::from(id.clone()));
        state.objects.entry(object.to_string()).or_default().push(record);
        Ok(id)
    }

    async fn update(
        &self,
        credential: &AccessCredential,
        object: &str,
        record_id: &str,
        fields: &CrmRecord,
    ) -> Result<(), GatewayError> {
        self.begin(
            credential,
            GatewayCall::Update {
                object: object.to_string(),
                record_id: record_id.to_string(),
                fields: fields.clone(),
            },
        )
        .await?;
        let mut state = self.state();
        let record = state
            .objects
            .get_mut(object)
            .and_then(|records| {
                records.iter_mut().find(|record| record.get("Id").and_then(Value::as_str) == Some(record_id))
            })
            .ok_or_else(|| GatewayError::NotFound(format!("{object} {record_id}")))?;
        for (name, value) in fields {
            record.insert(name.clone(), value.clone());
        }
        Ok(())
    }
}

fn id_prefix(object: &str) -> String {
    let mut prefix: String =
        object.chars().filter(char::is_ascii_alphanumeric).take(3).collect::<String>().to_ascii_uppercase();
    while prefix.len() < 3 {
        prefix.push('X');
    }
    prefix
}

fn matches_filter(record: &CrmRecord, filter: &Filter) -> bool {
    match filter {
        Filter::Compare { field: name, op, value } => match field(record, name) {
            Some(actual) if !actual.is_null() => compare_filter_value(actual, value)
                .map(|ordering| match op {
                    CompareOp::Eq => ordering == Ordering::Equal,
                    CompareOp::Ne => ordering != Ordering::Equal,
                    CompareOp::Lt => ordering == Ordering::Less,
                    CompareOp::Lte => ordering != Ordering::Greater,
                    CompareOp::Gt => ordering == Ordering::Greater,
                    CompareOp::Gte => ordering != Ordering::Less,
                })
                .unwrap_or(false),
            _ => *op == CompareOp::Ne,
        },
        Filter::Contains { field: name, term } => field(record, name)
            .and_then(Value::as_str)
            .is_some_and(|value| value.to_lowercase().contains(&term.to_lowercase())),
        Filter::In { field: name, values } => field(record, name)
            .and_then(Value::as_str)
            .is_some_and(|value| values.iter().any(|candidate| candidate == value)),
        Filter::And(filters) => filters.iter().all(|filter| matches_filter(record, filter)),
        Filter::Or(filters) => filters.iter().any(|filter| matches_filter(record, filter)),
    }
}

fn compare_filter_value(actual: &Value, expected: &FilterValue) -> Option<Ordering> {
    match expected {
        FilterValue::Text(expected) => actual.as_str().map(|actual| actual.cmp(expected.as_str())),
        FilterValue::Bool(expected) => actual.as_bool().map(|actual| actual.cmp(expected)),
        FilterValue::Integer(expected) => actual.as_f64().and_then(|actual| actual.partial_cmp(&(*expected as f64))),
        FilterValue::Date(expected) => actual
            .as_str()
            .and_then(|raw| NaiveDate::parse_from_str(raw.get(..10).unwrap_or(raw), "%Y-%m-%d").ok())
            .map(|actual| actual.cmp(expected)),
        FilterValue::Timestamp(expected) => {
            actual.as_str().and_then(parse_crm_timestamp).map(|actual| actual.cmp(expected))
        }
    }
}

fn compare_json(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    match (left.filter(|v| !v.is_null()), right.filter(|v| !v.is_null())) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(left), Some(right)) => match (left.as_f64(), right.as_f64()) {
            (Some(l), Some(r)) => l.partial_cmp(&r).unwrap_or(Ordering::Equal),
            _ => left.to_string().cmp(&right.to_string()),
        },
    }
}

/// Issues `sandbox-token-N` on each refresh, or a configured failure.
#[derive(Default)]
pub struct SandboxRefresher {
    issued: AtomicUsize,
    failure: Mutex<Option<AuthError>>,
}

impl SandboxRefresher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, error: AuthError) {
        match self.failure.lock() {
            Ok(mut slot) => *slot = Some(error),
            Err(poisoned) => *poisoned.into_inner() = Some(error),
        }
    }

    pub fn refresh_count(&self) -> usize {
        self.issued.load(AtomicOrdering::SeqCst)
    }
}

#[async_trait]
impl TokenRefresher for SandboxRefresher {
    async fn refresh(&self, _refresh_token: &SecretString) -> Result<RefreshedToken, AuthError> {
        let failure = match self.failure.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(error) = failure {
            return Err(error);
        }
        let issued = self.issued.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        Ok(RefreshedToken {
            access_token: SecretString::from(format!("sandbox-token-{issued}")),
            refresh_token: None,
            instance_url: None,
            expires_in: Some(chrono::Duration::hours(1)),
        })
    }
}
