use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crmgate_core::config::RateLimitConfig;
use crmgate_core::domain::session::{Session, SessionId};
use crmgate_core::errors::StoreError;
use crmgate_core::governor::{RateCounter, RateCounterStore, RateDecision, SessionUsage};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

use super::{encode_timestamp, encode_u64, parse_timestamp, parse_u64, RepositoryError};
use crate::DbPool;

/// Session counters in SQLite. Each admission is a read-admit-write cycle inside
/// `BEGIN IMMEDIATE`, so concurrent callers on one session serialize on the
/// database write lock.
pub struct SqlRateCounterStore {
    pool: DbPool,
}

impl SqlRateCounterStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateCounterStore for SqlRateCounterStore {
    async fn admit(
        &self,
        session: &SessionId,
        cost: u64,
        now: DateTime<Utc>,
        quota: &RateLimitConfig,
    ) -> Result<RateDecision, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(RepositoryError::from)?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await.map_err(RepositoryError::from)?;

        match admit_in_tx(&mut *conn, session, cost, now, quota).await {
            Ok(decision) => {
                sqlx::query("COMMIT").execute(&mut *conn).await.map_err(RepositoryError::from)?;
                Ok(decision)
            }
            Err(error) => {
                if let Err(rollback_error) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    tracing::warn!(
                        event_name = "rate_counter.rollback_failed",
                        session_id = %session,
                        error = %rollback_error,
                        "rollback after failed admission did not succeed"
                    );
                }
                Err(error.into())
            }
        }
    }

    async fn usage(&self, session: &SessionId) -> Result<Option<SessionUsage>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(RepositoryError::from)?;
        Ok(load_usage(&mut *conn, session).await?)
    }

    async fn end_session(&self, session: &SessionId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM session_rate_counter WHERE session_id = ?")
            .bind(&session.0)
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::from)?;
        Ok(())
    }

    async fn evict_idle(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let evicted = sqlx::query("DELETE FROM session_rate_counter WHERE last_activity_at < ?")
            .bind(encode_timestamp(cutoff))
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::from)?
            .rows_affected();
        Ok(evicted)
    }
}

async fn admit_in_tx(
    conn: &mut SqliteConnection,
    session: &SessionId,
    cost: u64,
    now: DateTime<Utc>,
    quota: &RateLimitConfig,
) -> Result<RateDecision, RepositoryError> {
    let mut usage =
        load_usage(conn, session).await?.unwrap_or_else(|| SessionUsage::start(session.clone(), now));
    let decision = usage.admit(cost, now, quota);
    save_usage(conn, &usage).await?;
    Ok(decision)
}

async fn load_usage(
    conn: &mut SqliteConnection,
    session: &SessionId,
) -> Result<Option<SessionUsage>, RepositoryError> {
    let row = sqlx::query(
        "SELECT
            session_id,
            created_at,
            last_activity_at,
            call_count,
            minute_window_start,
            minute_calls,
            day_window_start,
            day_calls
        FROM session_rate_counter
        WHERE session_id = ?",
    )
    .bind(&session.0)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(usage_from_row).transpose()
}

async fn save_usage(conn: &mut SqliteConnection, usage: &SessionUsage) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO session_rate_counter (
            session_id, created_at, last_activity_at, call_count,
            minute_window_start, minute_calls, day_window_start, day_calls
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(session_id) DO UPDATE SET
            last_activity_at = excluded.last_activity_at,
            call_count = excluded.call_count,
            minute_window_start = excluded.minute_window_start,
            minute_calls = excluded.minute_calls,
            day_window_start = excluded.day_window_start,
            day_calls = excluded.day_calls",
    )
    .bind(&usage.session.id.0)
    .bind(encode_timestamp(usage.session.created_at))
    .bind(encode_timestamp(usage.session.last_activity_at))
    .bind(encode_u64("call_count", usage.session.call_count)?)
    .bind(encode_timestamp(usage.counter.minute_window_start))
    .bind(encode_u64("minute_calls", usage.counter.minute_calls)?)
    .bind(encode_timestamp(usage.counter.day_window_start))
    .bind(encode_u64("day_calls", usage.counter.day_calls)?)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn usage_from_row(row: SqliteRow) -> Result<SessionUsage, RepositoryError> {
    Ok(SessionUsage {
        session: Session {
            id: SessionId(row.try_get("session_id")?),
            created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
            last_activity_at: parse_timestamp("last_activity_at", row.try_get("last_activity_at")?)?,
            call_count: parse_u64("call_count", row.try_get("call_count")?)?,
        },
        counter: RateCounter {
            minute_window_start: parse_timestamp("minute_window_start", row.try_get("minute_window_start")?)?,
            minute_calls: parse_u64("minute_calls", row.try_get("minute_calls")?)?,
            day_window_start: parse_timestamp("day_window_start", row.try_get("day_window_start")?)?,
            day_calls: parse_u64("day_calls", row.try_get("day_calls")?)?,
        },
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, Duration, Utc};
    use crmgate_core::config::RateLimitConfig;
    use crmgate_core::domain::session::SessionId;
    use crmgate_core::governor::{QuotaWindow, RateCounterStore, RateDecision};

    use super::SqlRateCounterStore;
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }

    fn quota(per_minute: u64, daily: u64) -> RateLimitConfig {
        RateLimitConfig { per_minute_limit: per_minute, daily_limit: daily, ..RateLimitConfig::default() }
    }

    #[tokio::test]
    async fn admissions_persist_across_store_instances() {
        let pool = setup_pool().await;
        let session = SessionId("session-1".to_string());
        let now = parse_ts("2026-03-02T10:00:05Z");

        let first = SqlRateCounterStore::new(pool.clone());
        for _ in 0..3 {
            first.admit(&session, 1, now, &quota(10, 100)).await.expect("admit");
        }

        let second = SqlRateCounterStore::new(pool);
        let usage = second.usage(&session).await.expect("usage").expect("session row");
        assert_eq!(usage.session.call_count, 3);
        assert_eq!(usage.counter.minute_calls, 3);
        assert_eq!(usage.counter.day_calls, 3);
        assert_eq!(usage.counter.minute_window_start, parse_ts("2026-03-02T10:00:00Z"));
    }

    #[tokio::test]
    async fn minute_ceiling_denies_until_next_window() {
        let store = SqlRateCounterStore::new(setup_pool().await);
        let session = SessionId("session-2".to_string());
        let now = parse_ts("2026-03-02T10:00:05Z");

        for _ in 0..2 {
            store.admit(&session, 1, now, &quota(2, 100)).await.expect("admit");
        }
        let RateDecision::Deny(advisory) = store.admit(&session, 1, now, &quota(2, 100)).await.expect("admit")
        else {
            panic!("expected denial");
        };
        assert_eq!(advisory.window, QuotaWindow::Minute);

        let next_minute = now + Duration::minutes(1);
        let decision = store.admit(&session, 1, next_minute, &quota(2, 100)).await.expect("admit");
        assert!(!matches!(decision, RateDecision::Deny(_)));
        let usage = store.usage(&session).await.expect("usage").expect("row");
        assert_eq!(usage.counter.minute_calls, 1);
        assert_eq!(usage.counter.day_calls, 3);
    }

    #[tokio::test]
    async fn end_session_and_idle_eviction_remove_rows() {
        let store = SqlRateCounterStore::new(setup_pool().await);
        let early = parse_ts("2026-03-02T09:00:00Z");
        let late = parse_ts("2026-03-02T10:00:00Z");
        let idle = SessionId("idle".to_string());
        let active = SessionId("active".to_string());
        let ended = SessionId("ended".to_string());

        store.admit(&idle, 1, early, &quota(10, 100)).await.expect("admit");
        store.admit(&active, 1, late, &quota(10, 100)).await.expect("admit");
        store.admit(&ended, 1, late, &quota(10, 100)).await.expect("admit");

        store.end_session(&ended).await.expect("end");
        let evicted = store.evict_idle(late - Duration::minutes(30)).await.expect("evict");

        assert_eq!(evicted, 1);
        assert!(store.usage(&idle).await.expect("usage").is_none());
        assert!(store.usage(&ended).await.expect("usage").is_none());
        assert!(store.usage(&active).await.expect("usage").is_some());
    }

    #[tokio::test]
    async fn concurrent_admissions_never_exceed_ceiling() {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("rate.db").display());
        let pool = connect_with_settings(&url, 4, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");
        let store = Arc::new(SqlRateCounterStore::new(pool));
        let session = SessionId("shared".to_string());
        let now = parse_ts("2026-03-02T10:00:05Z");

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let store = store.clone();
                let session = session.clone();
                tokio::spawn(async move { store.admit(&session, 1, now, &quota(10, 1000)).await })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if !matches!(handle.await.expect("join").expect("admit"), RateDecision::Deny(_)) {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
        let usage = store.usage(&session).await.expect("usage").expect("row");
        assert_eq!(usage.counter.minute_calls, 10);
    }
}
