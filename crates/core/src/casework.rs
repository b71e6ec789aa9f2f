use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::domain::records::QueuedCase;

/// Open cases older than this breach the support SLA.
pub const SLA_BREACH_AGE_DAYS: i64 = 14;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AgingDistribution {
    #[serde(rename = "0-24h")]
    pub under_one_day: usize,
    #[serde(rename = "1-3d")]
    pub one_to_three_days: usize,
    #[serde(rename = "3-7d")]
    pub three_to_seven_days: usize,
    #[serde(rename = "7-14d")]
    pub one_to_two_weeks: usize,
    #[serde(rename = "14d+")]
    pub over_two_weeks: usize,
}

impl AgingDistribution {
    fn record(&mut self, age: Duration) {
        let bucket = if age <= Duration::hours(24) {
            &mut self.under_one_day
        } else if age <= Duration::days(3) {
            &mut self.one_to_three_days
        } else if age <= Duration::days(7) {
            &mut self.three_to_seven_days
        } else if age <= Duration::days(SLA_BREACH_AGE_DAYS) {
            &mut self.one_to_two_weeks
        } else {
            &mut self.over_two_weeks
        };
        *bucket += 1;
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CaseQueueSummary {
    pub total_open: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<String, usize>,
    pub aging_distribution: AgingDistribution,
    pub sla_compliance_pct: f64,
    pub sla_breached_count: usize,
    /// The queue read was clipped, so counts cover only the oldest cases.
    pub has_more: bool,
}

/// Aggregates open cases as of `now`. An empty queue is fully compliant.
pub fn summarize_queue(cases: &[QueuedCase], now: DateTime<Utc>, has_more: bool) -> CaseQueueSummary {
    let mut by_status = BTreeMap::new();
    let mut by_priority = BTreeMap::new();
    let mut aging_distribution = AgingDistribution::default();

    for case in cases {
        *by_status.entry(case.status.clone()).or_insert(0) += 1;
        *by_priority.entry(case.priority.clone()).or_insert(0) += 1;
        aging_distribution.record(now - case.created_date);
    }

    let total_open = cases.len();
    let sla_breached_count = aging_distribution.over_two_weeks;
    let sla_compliance_pct = if total_open == 0 {
        100.0
    } else {
        let compliant = (total_open - sla_breached_count) as f64 * 100.0 / total_open as f64;
        (compliant * 10.0).round() / 10.0
    };

    CaseQueueSummary {
        total_open,
        by_status,
        by_priority,
        aging_distribution,
        sla_compliance_pct,
        sla_breached_count,
        has_more,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use serde_json::json;

    use super::summarize_queue;
    use crate::domain::records::QueuedCase;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    fn case(id: &str, status: &str, priority: &str, age: Duration) -> QueuedCase {
        QueuedCase {
            id: id.to_string(),
            status: status.to_string(),
            priority: priority.to_string(),
            created_date: now() - age,
            owner_name: Some("Tier 1 Support".to_string()),
        }
    }

    #[test]
    fn cases_land_in_aging_buckets() {
        let cases = vec![
            case("1", "New", "High", Duration::hours(2)),
            case("2", "New", "Medium", Duration::hours(24)),
            case("3", "Working", "Medium", Duration::hours(30)),
            case("4", "Working", "Low", Duration::days(5)),
            case("5", "Escalated", "High", Duration::days(10)),
            case("6", "Working", "High", Duration::days(20)),
        ];

        let summary = summarize_queue(&cases, now(), false);
        let encoded = serde_json::to_value(&summary.aging_distribution).unwrap();

        assert_eq!(encoded, json!({ "0-24h": 2, "1-3d": 1, "3-7d": 1, "7-14d": 1, "14d+": 1 }));
        assert_eq!(summary.by_status["Working"], 3);
        assert_eq!(summary.by_priority["High"], 3);
        assert_eq!(summary.sla_breached_count, 1);
        assert_eq!(summary.sla_compliance_pct, 83.3);
    }

    #[test]
    fn empty_queue_is_fully_compliant() {
        let summary = summarize_queue(&[], now(), false);
        assert_eq!(summary.total_open, 0);
        assert_eq!(summary.sla_compliance_pct, 100.0);
    }
}
