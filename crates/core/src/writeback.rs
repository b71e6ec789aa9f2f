//! Two-phase write-back: a proposed write only previews, a confirmed write is
//! deduplicated on its business fields and then executed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::domain::idempotency::{DedupKey, IdempotencyRecord, IdempotencyState, ResultRef};
use crate::domain::records::{is_record_id, CrmRecord};
use crate::errors::{StoreError, ToolError, ToolErrorCode};
use crate::gateway::validate_field_name;
use crate::guard::{CallError, CallScope};

/// One external write.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Mutation {
    Create { object: String, fields: CrmRecord },
    Update { object: String, record_id: String, fields: CrmRecord },
}

impl Mutation {
    fn object(&self) -> &str {
        match self {
            Self::Create { object, .. } | Self::Update { object, .. } => object.as_str(),
        }
    }

    fn fields(&self) -> &CrmRecord {
        match self {
            Self::Create { fields, .. } | Self::Update { fields, .. } => fields,
        }
    }
}

/// What a write tool intends to do. The first mutation's result identifies the
/// write; only the last mutation may be a create.
#[derive(Clone, Debug, PartialEq)]
pub struct WritePlan {
    pub operation: String,
    pub object_type: String,
    pub mutations: Vec<Mutation>,
    /// Fields that make two requests "the same write".
    pub business_key: Vec<(String, String)>,
    /// Human-readable description used in the confirmation prompt.
    pub summary: String,
}

impl WritePlan {
    pub fn new(operation: &str, object_type: &str, summary: impl Into<String>) -> Self {
        Self {
            operation: operation.to_string(),
            object_type: object_type.to_string(),
            mutations: Vec::new(),
            business_key: Vec::new(),
            summary: summary.into(),
        }
    }

    pub fn create(mut self, object: &str, fields: CrmRecord) -> Self {
        self.mutations.push(Mutation::Create { object: object.to_string(), fields });
        self
    }

    pub fn update(mut self, object: &str, record_id: &str, fields: CrmRecord) -> Self {
        self.mutations.push(Mutation::Update {
            object: object.to_string(),
            record_id: record_id.to_string(),
            fields,
        });
        self
    }

    pub fn key(mut self, name: &str, value: impl Into<String>) -> Self {
        self.business_key.push((name.to_string(), value.into()));
        self
    }

    fn validate(&self) -> Result<(), WriteError> {
        if self.mutations.is_empty() {
            return Err(WriteError::Invalid("nothing to write".to_string()));
        }
        let last = self.mutations.len() - 1;
        for (index, mutation) in self.mutations.iter().enumerate() {
            validate_field_name(mutation.object()).map_err(WriteError::Invalid)?;
            if mutation.fields().is_empty() {
                return Err(WriteError::Invalid(format!("no fields given for {}", mutation.object())));
            }
            for name in mutation.fields().keys() {
                validate_field_name(name).map_err(WriteError::Invalid)?;
            }
            match mutation {
                Mutation::Update { record_id, .. } if !is_record_id(record_id) => {
                    return Err(WriteError::Invalid(format!("`{record_id}` is not a valid record id")));
                }
                Mutation::Create { .. } if index != last => {
                    return Err(WriteError::Invalid("a create must be the final mutation".to_string()));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum WriteRequest {
    Proposed(WritePlan),
    Confirmed(WritePlan),
}

impl WriteRequest {
    pub fn from_flag(plan: WritePlan, confirmed: bool) -> Self {
        if confirmed {
            Self::Confirmed(plan)
        } else {
            Self::Proposed(plan)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WritePreview {
    pub requires_confirmation: bool,
    pub operation: String,
    pub message: String,
    pub changes: Vec<Mutation>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WriteReceipt {
    pub operation: String,
    pub result: ResultRef,
    /// Every record touched, in execution order. Empty for suppressed duplicates.
    pub affected: Vec<ResultRef>,
    pub duplicate_suppressed: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum WriteOutcome {
    Preview(WritePreview),
    Executed(WriteReceipt),
    DuplicateSuppressed(WriteReceipt),
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum WriteError {
    #[error("invalid write: {0}")]
    Invalid(String),
    #[error("write failed after {completed} of its mutations: {source}")]
    Call { source: CallError, completed: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("an identical write is still in flight")]
    InFlight,
}

impl From<WriteError> for ToolError {
    fn from(error: WriteError) -> Self {
        match error {
            WriteError::Invalid(message) => ToolError::invalid_input(message),
            WriteError::Call { source, .. } => source.into(),
            WriteError::Store(error) => error.into(),
            WriteError::InFlight => ToolError::new(
                ToolErrorCode::SfApiError,
                "An identical request is still being processed. Please retry shortly.",
            )
            .with_detail("retryable", true),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Reservation {
    Acquired,
    Duplicate(IdempotencyRecord),
    InFlight,
}

/// Dedup ledger. `reserve` must be atomic per key across all callers sharing
/// the store.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Claims `record.dedup_key` unless an unexpired record already holds it.
    async fn reserve(&self, record: IdempotencyRecord, now: DateTime<Utc>) -> Result<Reservation, StoreError>;

    async fn complete(&self, key: &DedupKey, result: &ResultRef, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Drops a pending claim so a retry can run.
    async fn release(&self, key: &DedupKey) -> Result<(), StoreError>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    records: Mutex<HashMap<DedupKey, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn reserve(&self, record: IdempotencyRecord, now: DateTime<Utc>) -> Result<Reservation, StoreError> {
        let mut records = self.records.lock().await;
        records.retain(|_, existing| !existing.is_expired(now));
        if let Some(existing) = records.get(&record.dedup_key) {
            return Ok(match existing.state {
                IdempotencyState::Completed => Reservation::Duplicate(existing.clone()),
                IdempotencyState::Pending => Reservation::InFlight,
            });
        }
        records.insert(record.dedup_key.clone(), record);
        Ok(Reservation::Acquired)
    }

    async fn complete(&self, key: &DedupKey, result: &ResultRef, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(key)
            .ok_or_else(|| StoreError::Corrupt(format!("no reservation for {}", key.as_str())))?;
        record.state = IdempotencyState::Completed;
        record.result_ref = Some(result.clone());
        record.recorded_at = now;
        Ok(())
    }

    async fn release(&self, key: &DedupKey) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if records.get(key).is_some_and(|record| record.state == IdempotencyState::Pending) {
            records.remove(key);
        }
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        Ok((before - records.len()) as u64)
    }
}

pub struct WriteBackGate {
    store: Arc<dyn IdempotencyStore>,
    clock: Arc<dyn Clock>,
    dedup_window: Duration,
    inflight_wait: StdDuration,
    poll_interval: StdDuration,
}

impl WriteBackGate {
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        clock: Arc<dyn Clock>,
        dedup_window: Duration,
        inflight_wait: StdDuration,
    ) -> Self {
        Self { store, clock, dedup_window, inflight_wait, poll_interval: StdDuration::from_millis(100) }
    }

    pub fn with_poll_interval(mut self, poll_interval: StdDuration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Drops ledger entries whose window has lapsed. Returns how many went.
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        self.store.purge_expired(self.clock.now()).await
    }

    pub async fn submit(&self, scope: &CallScope<'_>, request: WriteRequest) -> Result<WriteOutcome, WriteError> {
        match request {
            WriteRequest::Proposed(plan) => {
                plan.validate()?;
                Ok(WriteOutcome::Preview(WritePreview {
                    requires_confirmation: true,
                    message: format!(
                        "Please confirm: {}. Call again with confirmed=true to proceed.",
                        plan.summary.trim_end_matches('.')
                    ),
                    operation: plan.operation,
                    changes: plan.mutations,
                }))
            }
            WriteRequest::Confirmed(plan) => self.execute(scope, plan).await,
        }
    }

    async fn execute(&self, scope: &CallScope<'_>, plan: WritePlan) -> Result<WriteOutcome, WriteError> {
        plan.validate()?;
        let now = self.clock.now();
        let key = DedupKey::derive(&plan.object_type, &plan.business_key);
        let pending =
            IdempotencyRecord::pending(key.clone(), &plan.object_type, &plan.operation, now, self.dedup_window);

        if let Some(existing) = self.reserve(pending).await? {
            let result = existing.result_ref.ok_or_else(|| {
                StoreError::Corrupt(format!("completed write {} has no result", key.as_str()))
            })?;
            info!(
                event_name = "writeback.duplicate_suppressed",
                operation = %plan.operation,
                dedup_key = %key.as_str(),
                record_id = %result.record_id,
                "identical write already completed"
            );
            return Ok(WriteOutcome::DuplicateSuppressed(WriteReceipt {
                operation: plan.operation,
                result,
                affected: Vec::new(),
                duplicate_suppressed: true,
            }));
        }

        let mut affected = Vec::with_capacity(plan.mutations.len());
        for mutation in &plan.mutations {
            let outcome = match mutation {
                Mutation::Create { object, fields } => scope
                    .create(object, fields)
                    .await
                    .map(|record_id| ResultRef { object_type: object.clone(), record_id }),
                Mutation::Update { object, record_id, fields } => scope
                    .update(object, record_id, fields)
                    .await
                    .map(|()| ResultRef { object_type: object.clone(), record_id: record_id.clone() }),
            };
            match outcome {
                Ok(result) => affected.push(result),
                Err(source) => {
                    self.release(&key).await;
                    warn!(
                        event_name = "writeback.failed",
                        operation = %plan.operation,
                        completed = affected.len(),
                        error = %source,
                        "write failed; reservation released"
                    );
                    return Err(WriteError::Call { source, completed: affected.len() });
                }
            }
        }

        let result = affected
            .first()
            .cloned()
            .ok_or_else(|| WriteError::Invalid("nothing to write".to_string()))?;
        if let Err(store_error) = self.store.complete(&key, &result, self.clock.now()).await {
            // The write happened; a lost ledger entry only weakens dedup until expiry.
            error!(
                event_name = "writeback.ledger_failed",
                dedup_key = %key.as_str(),
                error = %store_error,
                "could not mark write as completed"
            );
        }
        info!(
            event_name = "writeback.executed",
            operation = %plan.operation,
            object = %result.object_type,
            record_id = %result.record_id,
            mutations = affected.len(),
            "write executed"
        );
        Ok(WriteOutcome::Executed(WriteReceipt {
            operation: plan.operation,
            result,
            affected,
            duplicate_suppressed: false,
        }))
    }

    /// `None` once the key is ours; the completed record for a duplicate.
    async fn reserve(&self, pending: IdempotencyRecord) -> Result<Option<IdempotencyRecord>, WriteError> {
        let deadline = tokio::time::Instant::now() + self.inflight_wait;
        loop {
            match self.store.reserve(pending.clone(), self.clock.now()).await? {
                Reservation::Acquired => return Ok(None),
                Reservation::Duplicate(existing) => return Ok(Some(existing)),
                Reservation::InFlight if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(self.poll_interval).await;
                }
                Reservation::InFlight => return Err(WriteError::InFlight),
            }
        }
    }

    async fn release(&self, key: &DedupKey) {
        if let Err(store_error) = self.store.release(key).await {
            error!(
                event_name = "writeback.release_failed",
                dedup_key = %key.as_str(),
                error = %store_error,
                "could not release write reservation"
            );
        }
    }
}
