use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Identifier derived from a write's business fields. How long it blocks a
/// repeat is decided by the record's `expires_at`, not by the key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey(pub String);

impl DedupKey {
    /// Field order does not matter; values are compared after whitespace and case folding.
    pub fn derive(object_type: &str, business_fields: &[(String, String)]) -> Self {
        let mut fields: Vec<(String, String)> = business_fields
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), normalize_value(value)))
            .collect();
        fields.sort();

        let mut hasher = blake3::Hasher::new();
        hasher.update(object_type.as_bytes());
        for (name, value) in &fields {
            hasher.update(b"\x1f");
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }

        Self(format!("{}:{}", object_type.to_ascii_lowercase(), hasher.finalize().to_hex()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn normalize_value(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyState {
    /// Claimed by a write that has not finished yet.
    Pending,
    Completed,
}

impl IdempotencyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Reference to the record a write produced or touched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRef {
    pub object_type: String,
    pub record_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub dedup_key: DedupKey,
    pub object_type: String,
    pub operation: String,
    pub state: IdempotencyState,
    pub result_ref: Option<ResultRef>,
    pub recorded_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn pending(
        dedup_key: DedupKey,
        object_type: impl Into<String>,
        operation: impl Into<String>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            dedup_key,
            object_type: object_type.into(),
            operation: operation.into(),
            state: IdempotencyState::Pending,
            result_ref: None,
            recorded_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{DedupKey, IdempotencyRecord, IdempotencyState};

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn dedup_key_ignores_field_order_and_whitespace() {
        let first =
            DedupKey::derive("Case", &fields(&[("Subject", "Login  broken"), ("AccountId", "001000000000001AAA")]));
        let second =
            DedupKey::derive("Case", &fields(&[("AccountId", "001000000000001AAA"), ("Subject", " login broken ")]));

        assert_eq!(first, second);
        assert!(first.as_str().starts_with("case:"));
    }

    #[test]
    fn dedup_key_changes_with_object_and_fields() {
        let base = DedupKey::derive("Case", &fields(&[("Subject", "x")]));

        assert_ne!(base, DedupKey::derive("Task", &fields(&[("Subject", "x")])));
        assert_ne!(base, DedupKey::derive("Case", &fields(&[("Subject", "y")])));
    }

    #[test]
    fn record_window_runs_from_the_claim() {
        let claimed_at = Utc.with_ymd_and_hms(2026, 3, 2, 10, 4, 55).single().unwrap_or_default();
        let record = IdempotencyRecord::pending(
            DedupKey::derive("Task", &fields(&[("Subject", "Call CFO")])),
            "Task",
            "create_task",
            claimed_at,
            Duration::minutes(5),
        );

        assert!(!record.is_expired(claimed_at + Duration::seconds(10)));
        assert!(!record.is_expired(claimed_at + Duration::seconds(299)));
        assert!(record.is_expired(claimed_at + Duration::minutes(5)));
    }

    #[test]
    fn idempotency_state_round_trips_from_storage_encoding() {
        for state in [IdempotencyState::Pending, IdempotencyState::Completed] {
            assert_eq!(IdempotencyState::parse(state.as_str()), Some(state));
        }
    }
}
