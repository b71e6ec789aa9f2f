//! Per-session API consumption against daily and per-minute ceilings.
//!
//! Windows are aligned to wall-clock minutes and UTC days. The counter logic is a
//! pure function over [`SessionUsage`]; stores only have to make the
//! read-admit-write cycle atomic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::RateLimitConfig;
use crate::domain::session::{Session, SessionId};
use crate::errors::{StoreError, ToolError, ToolErrorCode};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaWindow {
    Minute,
    Day,
}

impl QuotaWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Day => "day",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "minute" => Some(Self::Minute),
            "day" => Some(Self::Day),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Minute => "per-minute",
            Self::Day => "daily",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateCounter {
    pub minute_window_start: DateTime<Utc>,
    pub minute_calls: u64,
    pub day_window_start: DateTime<Utc>,
    pub day_calls: u64,
}

impl RateCounter {
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            minute_window_start: minute_start(now),
            minute_calls: 0,
            day_window_start: day_start(now),
            day_calls: 0,
        }
    }

    /// Resets windows whose wall-clock boundary has passed. A clock that moves
    /// backwards never reopens an old window.
    fn roll(&mut self, now: DateTime<Utc>) {
        let minute = minute_start(now);
        if minute > self.minute_window_start {
            self.minute_window_start = minute;
            self.minute_calls = 0;
        }
        let day = day_start(now);
        if day > self.day_window_start {
            self.day_window_start = day;
            self.day_calls = 0;
        }
    }
}

fn minute_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(Duration::minutes(1)).unwrap_or(now)
}

fn day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(Duration::days(1)).unwrap_or(now)
}

/// Quota position of one window at decision time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateAdvisory {
    pub window: QuotaWindow,
    pub calls_made: u64,
    pub limit: u64,
    pub usage_percent: f64,
}

impl RateAdvisory {
    fn new(window: QuotaWindow, calls_made: u64, limit: u64) -> Self {
        let usage_percent = if limit == 0 { 100.0 } else { calls_made as f64 * 100.0 / limit as f64 };
        Self { window, calls_made, limit, usage_percent }
    }

    pub fn message(&self) -> String {
        format!("API usage at {:.0}% of the {} limit.", self.usage_percent, self.window.label())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RateDecision {
    Allow,
    AllowWithWarning(RateAdvisory),
    Deny(RateAdvisory),
}

impl From<RateAdvisory> for ToolError {
    fn from(advisory: RateAdvisory) -> Self {
        let message = match advisory.window {
            QuotaWindow::Minute => {
                "The API usage limit for this minute has been reached. Please wait a moment and try again."
            }
            QuotaWindow::Day => {
                "Today's API usage limit has been reached. Please try again tomorrow or contact your administrator."
            }
        };
        ToolError::new(ToolErrorCode::RateLimitExceeded, message)
            .with_detail("window", advisory.window.as_str())
            .with_detail("calls_made", advisory.calls_made)
            .with_detail("limit", advisory.limit)
            .with_detail("usage_percent", advisory.usage_percent)
    }
}

/// Everything tracked for one live session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUsage {
    pub session: Session,
    pub counter: RateCounter,
}

impl SessionUsage {
    pub fn start(id: SessionId, now: DateTime<Utc>) -> Self {
        Self { session: Session::start(id, now), counter: RateCounter::starting_at(now) }
    }

    /// Denies when `cost` would push any window past its ceiling; otherwise records
    /// the call and warns once the fullest window reaches `warning_ratio`.
    pub fn admit(&mut self, cost: u64, now: DateTime<Utc>, quota: &RateLimitConfig) -> RateDecision {
        self.counter.roll(now);

        let windows = [
            (QuotaWindow::Minute, self.counter.minute_calls, quota.per_minute_limit),
            (QuotaWindow::Day, self.counter.day_calls, quota.daily_limit),
        ];
        if let Some((window, used, limit)) =
            windows.into_iter().find(|(_, used, limit)| used.saturating_add(cost) > *limit)
        {
            return RateDecision::Deny(RateAdvisory::new(window, used, limit));
        }

        self.counter.minute_calls += cost;
        self.counter.day_calls += cost;
        self.session.call_count += 1;
        if now > self.session.last_activity_at {
            self.session.last_activity_at = now;
        }

        let fullest = [
            RateAdvisory::new(QuotaWindow::Minute, self.counter.minute_calls, quota.per_minute_limit),
            RateAdvisory::new(QuotaWindow::Day, self.counter.day_calls, quota.daily_limit),
        ]
        .into_iter()
        .max_by(|a, b| a.usage_percent.total_cmp(&b.usage_percent));

        match fullest {
            Some(advisory) if advisory.usage_percent >= quota.warning_ratio * 100.0 => {
                RateDecision::AllowWithWarning(advisory)
            }
            _ => RateDecision::Allow,
        }
    }
}

/// Backing store for session counters. `admit` must be atomic per session.
#[async_trait]
pub trait RateCounterStore: Send + Sync {
    async fn admit(
        &self,
        session: &SessionId,
        cost: u64,
        now: DateTime<Utc>,
        quota: &RateLimitConfig,
    ) -> Result<RateDecision, StoreError>;

    async fn usage(&self, session: &SessionId) -> Result<Option<SessionUsage>, StoreError>;

    async fn end_session(&self, session: &SessionId) -> Result<(), StoreError>;

    /// Drops sessions with no activity since `cutoff`; returns how many.
    async fn evict_idle(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryRateCounterStore {
    sessions: Mutex<HashMap<SessionId, SessionUsage>>,
}

impl InMemoryRateCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateCounterStore for InMemoryRateCounterStore {
    async fn admit(
        &self,
        session: &SessionId,
        cost: u64,
        now: DateTime<Utc>,
        quota: &RateLimitConfig,
    ) -> Result<RateDecision, StoreError> {
        let mut sessions = self.sessions.lock().await;
        let usage =
            sessions.entry(session.clone()).or_insert_with(|| SessionUsage::start(session.clone(), now));
        Ok(usage.admit(cost, now, quota))
    }

    async fn usage(&self, session: &SessionId) -> Result<Option<SessionUsage>, StoreError> {
        Ok(self.sessions.lock().await.get(session).cloned())
    }

    async fn end_session(&self, session: &SessionId) -> Result<(), StoreError> {
        self.sessions.lock().await.remove(session);
        Ok(())
    }

    async fn evict_idle(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, usage| !usage.session.is_idle_since(cutoff));
        Ok((before - sessions.len()) as u64)
    }
}

/// The one place external-call volume is admitted.
pub struct SessionRateGovernor {
    store: Arc<dyn RateCounterStore>,
    quota: RateLimitConfig,
    clock: Arc<dyn Clock>,
}

impl SessionRateGovernor {
    pub fn new(store: Arc<dyn RateCounterStore>, quota: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { store, quota, clock }
    }

    pub fn cost_per_call(&self) -> u32 {
        self.quota.cost_per_call
    }

    pub async fn check_and_record(
        &self,
        session: &SessionId,
        cost: u32,
    ) -> Result<RateDecision, StoreError> {
        let decision = self.store.admit(session, u64::from(cost), self.clock.now(), &self.quota).await?;
        match &decision {
            RateDecision::Deny(advisory) => warn!(
                event_name = "rate.denied",
                session_id = %session,
                window = advisory.window.as_str(),
                calls_made = advisory.calls_made,
                limit = advisory.limit,
                "rate ceiling reached; external call blocked"
            ),
            RateDecision::AllowWithWarning(advisory) => debug!(
                event_name = "rate.warning",
                session_id = %session,
                window = advisory.window.as_str(),
                usage_percent = advisory.usage_percent,
                "rate usage above warning threshold"
            ),
            RateDecision::Allow => {}
        }
        Ok(decision)
    }

    pub async fn usage(&self, session: &SessionId) -> Result<Option<SessionUsage>, StoreError> {
        self.store.usage(session).await
    }

    pub async fn end_session(&self, session: &SessionId) -> Result<(), StoreError> {
        self.store.end_session(session).await
    }

    pub async fn evict_idle(&self, idle_for: Duration) -> Result<u64, StoreError> {
        self.store.evict_idle(self.clock.now() - idle_for).await
    }
}
