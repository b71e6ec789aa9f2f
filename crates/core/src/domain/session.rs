use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// CRM user on whose behalf calls are made.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of the caller for one tool invocation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionContext {
    pub session_id: SessionId,
    pub user_id: UserId,
}

impl SessionContext {
    pub fn new(session_id: SessionId, user_id: UserId) -> Self {
        Self { session_id, user_id }
    }

    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self { session_id: SessionId::generate(), user_id: UserId(user_id.into()) }
    }
}

/// One agent conversation thread. Lives only as long as the thread.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub call_count: u64,
}

impl Session {
    pub fn start(id: SessionId, now: DateTime<Utc>) -> Self {
        Self { id, created_at: now, last_activity_at: now, call_count: 0 }
    }

    pub fn is_idle_since(&self, cutoff: DateTime<Utc>) -> bool {
        self.last_activity_at < cutoff
    }
}
