//! Deterministic deal-risk evaluation. Pure over `(records, thresholds, now)`:
//! no I/O and no wall-clock reads.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::config::RiskThresholdConfig;
use crate::domain::records::Opportunity;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFlagKind {
    Overdue,
    Stale,
    Stuck,
    LowProbabilityLateStage,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RiskEvidence {
    Overdue { days_overdue: i64 },
    /// `None` when no activity was ever logged.
    Inactivity { days_since_activity: Option<i64> },
    Stagnation { approx_days_in_stage: i64 },
    Probability { probability: f64, threshold: f64 },
}

/// A named risk with the numbers that triggered it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RiskFlag {
    pub kind: RiskFlagKind,
    #[serde(flatten)]
    pub evidence: RiskEvidence,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AssessedOpportunity {
    #[serde(flatten)]
    pub opportunity: Opportunity,
    pub risk_flags: Vec<RiskFlag>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StageRollup {
    pub count: usize,
    pub value: Decimal,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct OwnerRollup {
    pub deal_count: usize,
    pub total_value: Decimal,
    pub at_risk_count: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PipelineSummary {
    pub total_deals: usize,
    pub total_value: Decimal,
    pub by_stage: BTreeMap<String, StageRollup>,
    pub at_risk_deals: Vec<AssessedOpportunity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_breakdown: Option<BTreeMap<String, OwnerRollup>>,
    pub as_of: NaiveDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Urgent,
    High,
    Medium,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ActivityGap {
    #[serde(flatten)]
    pub opportunity: Opportunity,
    pub risk_flags: Vec<RiskFlag>,
    pub days_since_activity: Option<i64>,
    pub days_to_close: i64,
    pub urgency: Urgency,
    pub recommended_action: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GapCounts {
    pub overdue: usize,
    pub inactive: usize,
    pub approaching: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ActivityGapReport {
    pub deals: Vec<ActivityGap>,
    pub total_count: usize,
    pub summary: GapCounts,
    pub threshold_days: u32,
    /// More deals need follow-up than were returned, or the scan feeding the
    /// report was itself clipped.
    pub has_more: bool,
}

/// Deals closing within this many days count as approaching.
const APPROACHING_WINDOW_DAYS: i64 = 7;

const UNASSIGNED_OWNER: &str = "Unassigned";

#[derive(Clone, Debug)]
pub struct RiskAnalysisEngine {
    config: RiskThresholdConfig,
}

impl RiskAnalysisEngine {
    pub fn new(config: RiskThresholdConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskThresholdConfig {
        &self.config
    }

    /// Flags for one deal. Deals below the minimum amount (missing amount counts
    /// as zero) are never flagged.
    pub fn evaluate(&self, deal: &Opportunity, now: DateTime<Utc>) -> Vec<RiskFlag> {
        if !self.is_material(deal) {
            return Vec::new();
        }
        let today = now.date_naive();
        let mut flags = Vec::new();

        if self.config.overdue_enabled && deal.close_date < today {
            flags.push(RiskFlag {
                kind: RiskFlagKind::Overdue,
                evidence: RiskEvidence::Overdue { days_overdue: (today - deal.close_date).num_days() },
            });
        }

        let days_since_activity = days_since_activity(deal, today);
        let stale = days_since_activity.map_or(true, |days| days > i64::from(self.config.inactivity_days));
        if stale {
            flags.push(RiskFlag {
                kind: RiskFlagKind::Stale,
                evidence: RiskEvidence::Inactivity { days_since_activity },
            });
            // Stage entry time is not reported, so the quiet period stands in for it.
            let stage_age = days_since_activity
                .or_else(|| deal.created_date.map(|created| (today - created.date_naive()).num_days()));
            if let Some(days) = stage_age.filter(|days| *days > i64::from(self.config.stage_stagnation_days)) {
                flags.push(RiskFlag {
                    kind: RiskFlagKind::Stuck,
                    evidence: RiskEvidence::Stagnation { approx_days_in_stage: days },
                });
            }
        }

        if self.config.late_stages.iter().any(|stage| stage == &deal.stage) {
            if let Some(probability) =
                deal.probability.filter(|probability| *probability < self.config.low_probability_threshold)
            {
                flags.push(RiskFlag {
                    kind: RiskFlagKind::LowProbabilityLateStage,
                    evidence: RiskEvidence::Probability {
                        probability,
                        threshold: self.config.low_probability_threshold,
                    },
                });
            }
        }

        flags
    }

    pub fn assess(&self, deals: Vec<Opportunity>, now: DateTime<Utc>) -> Vec<AssessedOpportunity> {
        deals
            .into_iter()
            .map(|opportunity| AssessedOpportunity { risk_flags: self.evaluate(&opportunity, now), opportunity })
            .collect()
    }

    /// Aggregates every deal (flagged or not) and lists the flagged ones.
    pub fn summarize(
        &self,
        deals: Vec<Opportunity>,
        now: DateTime<Utc>,
        include_owner_breakdown: bool,
    ) -> PipelineSummary {
        let mut total_value = Decimal::ZERO;
        let mut by_stage: BTreeMap<String, StageRollup> = BTreeMap::new();
        let mut owners: BTreeMap<String, OwnerRollup> = BTreeMap::new();
        let mut at_risk_deals = Vec::new();
        let total_deals = deals.len();

        for assessed in self.assess(deals, now) {
            let amount = assessed.opportunity.amount.unwrap_or(Decimal::ZERO);
            total_value += amount;

            let stage = by_stage.entry(assessed.opportunity.stage.clone()).or_default();
            stage.count += 1;
            stage.value += amount;

            if include_owner_breakdown {
                let owner_name =
                    assessed.opportunity.owner_name.clone().unwrap_or_else(|| UNASSIGNED_OWNER.to_string());
                let owner = owners.entry(owner_name).or_default();
                owner.deal_count += 1;
                owner.total_value += amount;
                if !assessed.risk_flags.is_empty() {
                    owner.at_risk_count += 1;
                }
            }

            if !assessed.risk_flags.is_empty() {
                at_risk_deals.push(assessed);
            }
        }

        PipelineSummary {
            total_deals,
            total_value,
            by_stage,
            at_risk_deals,
            owner_breakdown: include_owner_breakdown.then_some(owners),
            as_of: now.date_naive(),
        }
    }

    /// Orders open deals for follow-up: overdue first, then longest silence,
    /// then deals closing within a week. Deals in none of those groups are left out.
    pub fn activity_gaps(
        &self,
        deals: Vec<Opportunity>,
        now: DateTime<Utc>,
        threshold_days: Option<u32>,
        limit: usize,
    ) -> ActivityGapReport {
        let threshold_days = threshold_days.unwrap_or(self.config.inactivity_days);
        let today = now.date_naive();
        let mut overdue = Vec::new();
        let mut inactive = Vec::new();
        let mut approaching = Vec::new();

        for deal in deals {
            let days_since_activity = days_since_activity(&deal, today);
            let days_to_close = (deal.close_date - today).num_days();
            let (urgency, recommended_action, bucket) = if days_to_close < 0 {
                (
                    Urgency::Urgent,
                    format!(
                        "Overdue by {} days. Re-engage the decision maker or revise the close date.",
                        -days_to_close
                    ),
                    &mut overdue,
                )
            } else {
                match days_since_activity {
                    None => (Urgency::High, "No recorded activity. Initiate outreach.".to_string(), &mut inactive),
                    Some(days) if days > i64::from(threshold_days) => (
                        Urgency::High,
                        format!("No activity in {days} days. Schedule a follow-up."),
                        &mut inactive,
                    ),
                    Some(_) if days_to_close <= APPROACHING_WINDOW_DAYS => (
                        Urgency::Medium,
                        format!("Closing in {days_to_close} days. Verify next steps."),
                        &mut approaching,
                    ),
                    Some(_) => continue,
                }
            };
            bucket.push(ActivityGap {
                risk_flags: self.evaluate(&deal, now),
                opportunity: deal,
                days_since_activity,
                days_to_close,
                urgency,
                recommended_action,
            });
        }

        // Never-touched deals rank as the longest gap.
        inactive.sort_by_key(|gap| std::cmp::Reverse(gap.days_since_activity.unwrap_or(i64::MAX)));

        let summary =
            GapCounts { overdue: overdue.len(), inactive: inactive.len(), approaching: approaching.len() };
        let candidates = summary.overdue + summary.inactive + summary.approaching;
        let deals: Vec<ActivityGap> =
            overdue.into_iter().chain(inactive).chain(approaching).take(limit).collect();
        ActivityGapReport {
            total_count: deals.len(),
            has_more: candidates > deals.len(),
            deals,
            summary,
            threshold_days,
        }
    }

    fn is_material(&self, deal: &Opportunity) -> bool {
        deal.amount.unwrap_or(Decimal::ZERO) >= self.config.minimum_amount_for_risk
    }
}

fn days_since_activity(deal: &Opportunity, today: NaiveDate) -> Option<i64> {
    deal.last_activity_date.map(|last| (today - last).num_days())
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
    use rust_decimal::Decimal;
    use serde_json::json;

    use super::{RiskAnalysisEngine, RiskEvidence, RiskFlagKind, Urgency};
    use crate::config::RiskThresholdConfig;
    use crate::domain::records::Opportunity;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 15, 0, 0).unwrap()
    }

    fn today() -> NaiveDate {
        now().date_naive()
    }

    fn deal(id: &str, amount: Option<i64>, stage: &str) -> Opportunity {
        Opportunity {
            id: id.to_string(),
            name: format!("Deal {id}"),
            amount: amount.map(Decimal::from),
            stage: stage.to_string(),
            close_date: today() + Duration::days(30),
            probability: Some(60.0),
            owner_id: Some("005A".to_string()),
            owner_name: Some("Dana Ortiz".to_string()),
            account_name: Some("Acme".to_string()),
            last_activity_date: Some(today() - Duration::days(2)),
            created_date: Some(now() - Duration::days(10)),
        }
    }

    fn kinds(engine: &RiskAnalysisEngine, deal: &Opportunity) -> Vec<RiskFlagKind> {
        engine.evaluate(deal, now()).into_iter().map(|flag| flag.kind).collect()
    }

    #[test]
    fn healthy_deal_has_no_flags() {
        let engine = RiskAnalysisEngine::new(RiskThresholdConfig::default());
        assert!(kinds(&engine, &deal("a", Some(50_000), "Prospecting")).is_empty());
    }

    #[test]
    fn overdue_quiet_deal_is_overdue_and_stale() {
        let engine = RiskAnalysisEngine::new(RiskThresholdConfig::default());
        let mut quiet = deal("a", Some(50_000), "Prospecting");
        quiet.close_date = today() - Duration::days(3);
        quiet.last_activity_date = Some(today() - Duration::days(20));

        let flags = engine.evaluate(&quiet, now());

        assert_eq!(flags.iter().map(|flag| flag.kind).collect::<Vec<_>>(), vec![
            RiskFlagKind::Overdue,
            RiskFlagKind::Stale
        ]);
        assert_eq!(flags[0].evidence, RiskEvidence::Overdue { days_overdue: 3 });
        assert_eq!(flags[1].evidence, RiskEvidence::Inactivity { days_since_activity: Some(20) });
    }

    #[test]
    fn close_date_today_is_not_overdue() {
        let engine = RiskAnalysisEngine::new(RiskThresholdConfig::default());
        let mut due = deal("a", Some(50_000), "Prospecting");
        due.close_date = today();
        assert!(!kinds(&engine, &due).contains(&RiskFlagKind::Overdue));
    }

    #[test]
    fn overdue_check_can_be_disabled() {
        let config = RiskThresholdConfig { overdue_enabled: false, ..RiskThresholdConfig::default() };
        let engine = RiskAnalysisEngine::new(config);
        let mut late = deal("a", Some(50_000), "Prospecting");
        late.close_date = today() - Duration::days(1);
        assert!(kinds(&engine, &late).is_empty());
    }

    #[test]
    fn missing_activity_is_stale() {
        let engine = RiskAnalysisEngine::new(RiskThresholdConfig::default());
        let mut untouched = deal("a", Some(50_000), "Prospecting");
        untouched.last_activity_date = None;

        let flags = engine.evaluate(&untouched, now());
        assert_eq!(flags[0].evidence, RiskEvidence::Inactivity { days_since_activity: None });
    }

    #[test]
    fn long_silence_is_stuck_as_well_as_stale() {
        let engine = RiskAnalysisEngine::new(RiskThresholdConfig::default());
        let mut silent = deal("a", Some(50_000), "Prospecting");
        silent.last_activity_date = Some(today() - Duration::days(45));

        assert_eq!(kinds(&engine, &silent), vec![RiskFlagKind::Stale, RiskFlagKind::Stuck]);
    }

    #[test]
    fn stuck_uses_created_date_when_never_touched() {
        let engine = RiskAnalysisEngine::new(RiskThresholdConfig::default());
        let mut old = deal("a", Some(50_000), "Prospecting");
        old.last_activity_date = None;
        old.created_date = Some(now() - Duration::days(90));

        let flags = engine.evaluate(&old, now());
        assert_eq!(flags[1].evidence, RiskEvidence::Stagnation { approx_days_in_stage: 90 });

        old.created_date = None;
        assert_eq!(kinds(&engine, &old), vec![RiskFlagKind::Stale]);
    }

    #[test]
    fn low_probability_only_counts_in_late_stages() {
        let engine = RiskAnalysisEngine::new(RiskThresholdConfig::default());
        let mut late = deal("a", Some(50_000), "Negotiation/Review");
        late.probability = Some(20.0);
        let mut early = deal("b", Some(50_000), "Prospecting");
        early.probability = Some(20.0);

        assert_eq!(kinds(&engine, &late), vec![RiskFlagKind::LowProbabilityLateStage]);
        assert!(kinds(&engine, &early).is_empty());
    }

    #[test]
    fn small_or_unpriced_deals_are_never_flagged() {
        let engine = RiskAnalysisEngine::new(RiskThresholdConfig::default());
        let mut small = deal("a", Some(9_999), "Negotiation/Review");
        small.close_date = today() - Duration::days(30);
        small.last_activity_date = None;
        let mut unpriced = small.clone();
        unpriced.amount = None;

        assert!(kinds(&engine, &small).is_empty());
        assert!(kinds(&engine, &unpriced).is_empty());

        let mut at_threshold = deal("c", Some(10_000), "Prospecting");
        at_threshold.close_date = today() - Duration::days(1);
        assert_eq!(kinds(&engine, &at_threshold), vec![RiskFlagKind::Overdue]);
    }

    #[test]
    fn summary_counts_every_deal_but_lists_only_flagged_ones() {
        let engine = RiskAnalysisEngine::new(RiskThresholdConfig::default());
        let mut overdue_small = deal("small", Some(2_000), "Prospecting");
        overdue_small.close_date = today() - Duration::days(5);
        let mut overdue_big = deal("big", Some(80_000), "Negotiation/Review");
        overdue_big.close_date = today() - Duration::days(5);
        overdue_big.owner_name = None;
        let healthy = deal("ok", Some(40_000), "Prospecting");

        let summary = engine.summarize(vec![overdue_small, overdue_big, healthy], now(), true);

        assert_eq!(summary.total_deals, 3);
        assert_eq!(summary.total_value, Decimal::from(122_000));
        assert_eq!(summary.by_stage["Prospecting"].count, 2);
        assert_eq!(summary.by_stage["Negotiation/Review"].value, Decimal::from(80_000));
        assert_eq!(summary.at_risk_deals.len(), 1);
        assert_eq!(summary.at_risk_deals[0].opportunity.id, "big");

        let owners = summary.owner_breakdown.unwrap();
        assert_eq!(owners["Unassigned"].at_risk_count, 1);
        assert_eq!(owners["Dana Ortiz"].deal_count, 2);
    }

    #[test]
    fn evaluation_is_deterministic() {
        let engine = RiskAnalysisEngine::new(RiskThresholdConfig::default());
        let mut quiet = deal("a", Some(50_000), "Negotiation/Review");
        quiet.last_activity_date = Some(today() - Duration::days(40));
        quiet.probability = Some(10.0);

        assert_eq!(engine.evaluate(&quiet, now()), engine.evaluate(&quiet, now()));
    }

    #[test]
    fn flags_serialize_with_their_evidence() {
        let engine = RiskAnalysisEngine::new(RiskThresholdConfig::default());
        let mut late = deal("a", Some(50_000), "Prospecting");
        late.close_date = today() - Duration::days(4);

        let encoded = serde_json::to_value(engine.evaluate(&late, now())).unwrap();
        assert_eq!(encoded, json!([{ "kind": "overdue", "days_overdue": 4 }]));
    }

    #[test]
    fn activity_gaps_rank_overdue_then_silence_then_approaching() {
        let engine = RiskAnalysisEngine::new(RiskThresholdConfig::default());
        let mut closing = deal("closing", Some(50_000), "Prospecting");
        closing.close_date = today() + Duration::days(3);
        let mut quiet = deal("quiet", Some(50_000), "Prospecting");
        quiet.last_activity_date = Some(today() - Duration::days(20));
        let mut quieter = deal("quieter", Some(50_000), "Prospecting");
        quieter.last_activity_date = Some(today() - Duration::days(60));
        let mut overdue = deal("overdue", Some(50_000), "Prospecting");
        overdue.close_date = today() - Duration::days(2);
        let fine = deal("fine", Some(50_000), "Prospecting");

        let report = engine.activity_gaps(vec![closing, quiet, quieter, overdue, fine], now(), None, 20);

        let order: Vec<_> = report.deals.iter().map(|gap| gap.opportunity.id.as_str()).collect();
        assert_eq!(order, vec!["overdue", "quieter", "quiet", "closing"]);
        assert_eq!(report.deals[0].urgency, Urgency::Urgent);
        assert_eq!(report.deals[3].urgency, Urgency::Medium);
        assert_eq!(report.summary.inactive, 2);
        assert_eq!(report.threshold_days, 14);
        assert!(!report.has_more);
        assert!(report.deals[0].recommended_action.starts_with("Overdue by 2 days"));
    }

    #[test]
    fn activity_gap_limit_trims_after_ranking() {
        let engine = RiskAnalysisEngine::new(RiskThresholdConfig::default());
        let mut overdue = deal("overdue", Some(50_000), "Prospecting");
        overdue.close_date = today() - Duration::days(2);
        let mut never = deal("never", Some(50_000), "Prospecting");
        never.last_activity_date = None;

        let report = engine.activity_gaps(vec![never, overdue], now(), Some(7), 1);

        assert_eq!(report.total_count, 1);
        assert_eq!(report.deals[0].opportunity.id, "overdue");
        assert_eq!(report.summary.inactive, 1);
        assert_eq!(report.threshold_days, 7);
        assert!(report.has_more);
    }
}
