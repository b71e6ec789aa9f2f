use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crmgate_core::domain::idempotency::{DedupKey, IdempotencyRecord, IdempotencyState, ResultRef};
use crmgate_core::errors::StoreError;
use crmgate_core::writeback::{IdempotencyStore, Reservation};
use sqlx::{sqlite::SqliteRow, Row};

use super::{encode_timestamp, parse_timestamp, RepositoryError};
use crate::DbPool;

/// Dedup ledger shared by every process pointed at the same database file.
pub struct SqlIdempotencyStore {
    pool: DbPool,
}

impl SqlIdempotencyStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn try_claim(&self, record: &IdempotencyRecord, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        // Inserts a fresh claim, or takes over a row whose window has lapsed.
        let claimed = sqlx::query(
            "INSERT INTO idempotency_record (
                dedup_key, object_type, operation, state,
                result_object_type, result_record_id, recorded_at, expires_at
            ) VALUES (?, ?, ?, ?, NULL, NULL, ?, ?)
            ON CONFLICT(dedup_key) DO UPDATE SET
                object_type = excluded.object_type,
                operation = excluded.operation,
                state = excluded.state,
                result_object_type = NULL,
                result_record_id = NULL,
                recorded_at = excluded.recorded_at,
                expires_at = excluded.expires_at
            WHERE idempotency_record.expires_at <= ?",
        )
        .bind(record.dedup_key.as_str())
        .bind(&record.object_type)
        .bind(&record.operation)
        .bind(record.state.as_str())
        .bind(encode_timestamp(record.recorded_at))
        .bind(encode_timestamp(record.expires_at))
        .bind(encode_timestamp(now))
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(claimed == 1)
    }

    async fn find(&self, key: &DedupKey) -> Result<Option<IdempotencyRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                dedup_key,
                object_type,
                operation,
                state,
                result_object_type,
                result_record_id,
                recorded_at,
                expires_at
            FROM idempotency_record
            WHERE dedup_key = ?",
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(record_from_row).transpose()
    }
}

#[async_trait]
impl IdempotencyStore for SqlIdempotencyStore {
    async fn reserve(&self, record: IdempotencyRecord, now: DateTime<Utc>) -> Result<Reservation, StoreError> {
        if self.try_claim(&record, now).await? {
            return Ok(Reservation::Acquired);
        }

        // Lost the claim. A holder that released in between reads as in-flight, so
        // the caller simply polls again.
        let reservation = match self.find(&record.dedup_key).await? {
            Some(existing) if existing.state == IdempotencyState::Completed => {
                Reservation::Duplicate(existing)
            }
            _ => Reservation::InFlight,
        };
        Ok(reservation)
    }

    async fn complete(&self, key: &DedupKey, result: &ResultRef, now: DateTime<Utc>) -> Result<(), StoreError> {
        let updated = sqlx::query(
            "UPDATE idempotency_record
            SET state = ?, result_object_type = ?, result_record_id = ?, recorded_at = ?
            WHERE dedup_key = ?",
        )
        .bind(IdempotencyState::Completed.as_str())
        .bind(&result.object_type)
        .bind(&result.record_id)
        .bind(encode_timestamp(now))
        .bind(key.as_str())
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?
        .rows_affected();

        if updated == 0 {
            return Err(StoreError::Corrupt(format!("no reservation for {}", key.as_str())));
        }
        Ok(())
    }

    async fn release(&self, key: &DedupKey) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM idempotency_record WHERE dedup_key = ? AND state = ?")
            .bind(key.as_str())
            .bind(IdempotencyState::Pending.as_str())
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::from)?;
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let purged = sqlx::query("DELETE FROM idempotency_record WHERE expires_at <= ?")
            .bind(encode_timestamp(now))
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::from)?
            .rows_affected();
        if purged > 0 {
            tracing::debug!(event_name = "idempotency.purged", purged, "expired dedup records removed");
        }
        Ok(purged)
    }
}

fn record_from_row(row: SqliteRow) -> Result<IdempotencyRecord, RepositoryError> {
    let state_raw = row.try_get::<String, _>("state")?;
    let state = IdempotencyState::parse(&state_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown idempotency state `{state_raw}`")))?;

    let result_ref = match (
        row.try_get::<Option<String>, _>("result_object_type")?,
        row.try_get::<Option<String>, _>("result_record_id")?,
    ) {
        (Some(object_type), Some(record_id)) => Some(ResultRef { object_type, record_id }),
        (None, None) => None,
        _ => return Err(RepositoryError::Decode("half-written result reference".to_string())),
    };

    Ok(IdempotencyRecord {
        dedup_key: DedupKey(row.try_get("dedup_key")?),
        object_type: row.try_get("object_type")?,
        operation: row.try_get("operation")?,
        state,
        result_ref,
        recorded_at: parse_timestamp("recorded_at", row.try_get("recorded_at")?)?,
        expires_at: parse_timestamp("expires_at", row.try_get("expires_at")?)?,
    })
}
