//! SLA-breach compensation detector.
//!
//! Audits case timelines against the marketplace's published service levels
//! and prices the delay. The policy table is data: response/investigation/
//! decision/reimbursement windows plus the per-day compensation formula and
//! its cap, keyed by case type.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::HashMap;

use crate::inputs::{CaseTimeline, DetectionInput};
use crate::models::{Anomaly, RuleContext, RuleType, Severity};
use crate::rules::helpers::dedupe_hash;
use crate::rules::{DetectionRule, RulePriority};

/// Confidence floor for surfacing a breach at all.
const SHOW_THRESHOLD: f64 = 0.55;
/// Confidence at which we recommend filing rather than reviewing.
const FILE_THRESHOLD: f64 = 0.75;
/// Breaches priced below this are noise.
const MIN_COMPENSATION: f64 = 5.0;
/// Same breach type this many times in one run flags a systemic pattern.
const PATTERN_THRESHOLD: usize = 5;

#[derive(Debug, Clone)]
struct SlaPolicy {
    first_response_hours: i64,
    investigation_days: i64,
    decision_days: i64,
    reimbursement_days: i64,
    compensation_per_day: f64,
    max_compensation_days: i64,
    policy_reference: &'static str,
}

fn policy_for(case_type: &str) -> SlaPolicy {
    match case_type {
        "lost_inventory" | "damaged_inventory" => SlaPolicy {
            first_response_hours: 48,
            investigation_days: 7,
            decision_days: 14,
            reimbursement_days: 5,
            compensation_per_day: 0.50,
            max_compensation_days: 30,
            policy_reference: "FBA Inventory Reimbursement Policy, response terms",
        },
        "fee_dispute" => SlaPolicy {
            first_response_hours: 24,
            investigation_days: 5,
            decision_days: 10,
            reimbursement_days: 7,
            compensation_per_day: 0.40,
            max_compensation_days: 20,
            policy_reference: "Selling Fees Adjustment Policy, review terms",
        },
        "atoz_claim" => SlaPolicy {
            first_response_hours: 24,
            investigation_days: 3,
            decision_days: 7,
            reimbursement_days: 3,
            compensation_per_day: 0.75,
            max_compensation_days: 14,
            policy_reference: "A-to-z Guarantee, seller response terms",
        },
        "chargeback" => SlaPolicy {
            first_response_hours: 24,
            investigation_days: 5,
            decision_days: 10,
            reimbursement_days: 7,
            compensation_per_day: 0.60,
            max_compensation_days: 21,
            policy_reference: "Chargeback Dispute Policy, resolution terms",
        },
        _ => SlaPolicy {
            first_response_hours: 72,
            investigation_days: 10,
            decision_days: 21,
            reimbursement_days: 7,
            compensation_per_day: 0.30,
            max_compensation_days: 30,
            policy_reference: "Seller Support service terms",
        },
    }
}

fn severity_for(compensation: f64, days_overdue: i64) -> Severity {
    if compensation >= 500.0 || days_overdue >= 30 {
        Severity::Critical
    } else if compensation >= 100.0 || days_overdue >= 14 {
        Severity::High
    } else if compensation >= 25.0 || days_overdue >= 7 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// One evaluated window inside a case timeline.
struct WindowBreach {
    breach_type: &'static str,
    hours_overdue: i64,
    days_overdue: i64,
    compensation: f64,
    clear_timestamps: bool,
}

fn ceil_div(num: i64, den: i64) -> i64 {
    (num + den - 1) / den
}

fn evaluate_windows(
    case: &CaseTimeline,
    policy: &SlaPolicy,
    now: DateTime<Utc>,
) -> Vec<WindowBreach> {
    let mut breaches = Vec::new();

    let base_per_100 = case.claim_amount / 100.0;
    let reimbursement_base = case.reimbursement_amount.unwrap_or(case.claim_amount) / 50.0;

    // (type, start, end, sla_hours, compensation base)
    let windows: [(
        &'static str,
        Option<DateTime<Utc>>,
        Option<DateTime<Utc>>,
        i64,
        f64,
    ); 4] = [
        (
            "first_response_exceeded",
            Some(case.created_at),
            case.first_response_at,
            policy.first_response_hours,
            base_per_100,
        ),
        (
            "investigation_exceeded",
            case.investigation_started_at,
            case.investigation_completed_at,
            policy.investigation_days * 24,
            base_per_100,
        ),
        (
            "decision_exceeded",
            Some(case.created_at),
            case.decision_at,
            policy.decision_days * 24,
            base_per_100,
        ),
        (
            "reimbursement_exceeded",
            case.decision_at,
            case.resolved_at,
            policy.reimbursement_days * 24,
            reimbursement_base,
        ),
    ];

    for (breach_type, start, end, sla_hours, base) in windows {
        let Some(start) = start else { continue };
        let clear_timestamps = end.is_some();
        let effective_end = end.unwrap_or(now);

        let elapsed_hours = (effective_end - start).num_hours();
        if elapsed_hours <= sla_hours {
            continue;
        }

        let hours_overdue = elapsed_hours - sla_hours;
        let days_overdue = ceil_div(hours_overdue, 24);
        let billable = days_overdue.min(policy.max_compensation_days);
        let compensation = billable as f64 * policy.compensation_per_day * base;

        breaches.push(WindowBreach {
            breach_type,
            hours_overdue,
            days_overdue,
            compensation,
            clear_timestamps,
        });
    }

    breaches
}

pub struct SlaBreachDetector;

impl DetectionRule for SlaBreachDetector {
    fn rule_type(&self) -> RuleType {
        RuleType::SlaBreach
    }

    fn priority(&self) -> RulePriority {
        RulePriority::Medium
    }

    fn apply(&self, input: &DetectionInput, _ctx: &RuleContext) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();
        let mut breach_counts: HashMap<&'static str, usize> = HashMap::new();

        for case in &input.case_timelines {
            let policy = policy_for(&case.case_type);

            for breach in evaluate_windows(case, &policy, input.captured_at) {
                let prior_same_type = *breach_counts.get(breach.breach_type).unwrap_or(&0);
                breach_counts
                    .entry(breach.breach_type)
                    .and_modify(|c| *c += 1)
                    .or_insert(1);

                if breach.compensation < MIN_COMPENSATION {
                    continue;
                }

                let mut confidence: f64 = 0.0;
                if breach.clear_timestamps {
                    confidence += 0.30;
                }
                if !policy.policy_reference.is_empty() {
                    confidence += 0.25;
                }
                if breach.days_overdue >= 3 {
                    confidence += 0.20;
                }
                if prior_same_type >= 2 {
                    confidence += 0.15;
                }
                if !case.seller_caused_delay {
                    confidence += 0.10;
                }
                confidence = confidence.min(1.0);

                if confidence < SHOW_THRESHOLD {
                    continue;
                }

                let action = if confidence >= FILE_THRESHOLD {
                    "file"
                } else {
                    "review"
                };

                let core_fields = json!({
                    "case_id": case.case_id,
                    "breach_type": breach.breach_type,
                });

                anomalies.push(
                    Anomaly::new(
                        &input.seller_id,
                        &input.sync_id,
                        RuleType::SlaBreach,
                        severity_for(breach.compensation, breach.days_overdue),
                        confidence,
                        format!(
                            "SLA breach on case {}: {} by {}d, est ${:.2} compensation",
                            case.case_id,
                            breach.breach_type,
                            breach.days_overdue,
                            breach.compensation
                        ),
                        json!({
                            "case_id": case.case_id,
                            "case_type": case.case_type,
                            "breach_type": breach.breach_type,
                            "hours_overdue": breach.hours_overdue,
                            "days_overdue": breach.days_overdue,
                            "compensation": breach.compensation,
                            "currency": case.currency,
                            "policy_reference": policy.policy_reference,
                            "action": action,
                        }),
                        dedupe_hash(&input.seller_id, RuleType::SlaBreach, &core_fields),
                        breach.compensation,
                    )
                    .with_related_events(vec![case.case_id.clone()]),
                );
            }
        }

        // Five of the same breach type in one run is systemic, not incidental.
        for anomaly in &mut anomalies {
            let breach_type = anomaly.evidence["breach_type"]
                .as_str()
                .unwrap_or("")
                .to_string();
            let count = breach_counts.get(breach_type.as_str()).copied().unwrap_or(0);
            if count >= PATTERN_THRESHOLD {
                anomaly.evidence["action"] = json!("flag_pattern");
            }
        }

        anomalies
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeline(case_id: &str, claim_amount: f64, first_response_hours: i64) -> CaseTimeline {
        let created = Utc::now() - Duration::days(10);
        CaseTimeline {
            case_id: case_id.into(),
            case_type: "lost_inventory".into(),
            created_at: created,
            first_response_at: Some(created + Duration::hours(first_response_hours)),
            investigation_started_at: None,
            investigation_completed_at: None,
            decision_at: None,
            resolved_at: None,
            claim_amount,
            reimbursement_amount: None,
            currency: "USD".into(),
            seller_caused_delay: false,
        }
    }

    fn input_with(case_timelines: Vec<CaseTimeline>) -> DetectionInput {
        DetectionInput {
            seller_id: "seller-1".into(),
            sync_id: "sync-1".into(),
            case_timelines,
            captured_at: Utc::now(),
            ..Default::default()
        }
    }

    #[test]
    fn test_small_compensation_suppressed() {
        // 72h response vs 48h SLA: 24h / 1d overdue.
        // min(1, 30) * 0.50 * (500/100) = $2.50 < $5 floor.
        let anomalies =
            SlaBreachDetector.apply(&input_with(vec![timeline("C1", 500.0, 72)]), &RuleContext::new("seller-1"));
        assert!(anomalies.is_empty());
    }

    #[test]
    fn test_compensation_surfaces_above_floor() {
        // Same breach at $1200: 0.50 * 12 = $6.00.
        let anomalies =
            SlaBreachDetector.apply(&input_with(vec![timeline("C2", 1200.0, 72)]), &RuleContext::new("seller-1"));
        assert_eq!(anomalies.len(), 1);

        let a = &anomalies[0];
        assert_eq!(a.evidence["breach_type"], "first_response_exceeded");
        assert_eq!(a.evidence["hours_overdue"], 24);
        assert_eq!(a.evidence["days_overdue"], 1);
        assert!((a.estimated_value - 6.0).abs() < 1e-9);
        assert_eq!(a.severity, Severity::Low);
        // clear timestamps + documented policy + no seller delay = 0.65
        assert!((a.score - 0.65).abs() < 1e-9);
        assert_eq!(a.evidence["action"], "review");
    }

    #[test]
    fn test_on_time_response_clean() {
        let anomalies =
            SlaBreachDetector.apply(&input_with(vec![timeline("C3", 1200.0, 24)]), &RuleContext::new("seller-1"));
        assert!(anomalies.is_empty());
    }

    #[test]
    fn test_long_overdue_raises_confidence_and_severity() {
        // 48h SLA, responded after 20 days: ~18d overdue.
        let anomalies =
            SlaBreachDetector.apply(&input_with(vec![timeline("C4", 2000.0, 480)]), &RuleContext::new("seller-1"));
        assert_eq!(anomalies.len(), 1);
        let a = &anomalies[0];
        // 0.30 + 0.25 + 0.20 + 0.10 = 0.85 -> file
        assert!((a.score - 0.85).abs() < 1e-9);
        assert_eq!(a.evidence["action"], "file");
        assert_eq!(a.severity, Severity::High);
    }

    #[test]
    fn test_compensation_days_are_capped() {
        // 100 days late on a $1000 claim: billable days cap at 30.
        let anomalies =
            SlaBreachDetector.apply(&input_with(vec![timeline("C5", 1000.0, 2448)]), &RuleContext::new("seller-1"));
        let a = &anomalies[0];
        // 30 * 0.50 * 10 = $150
        assert!((a.estimated_value - 150.0).abs() < 1e-9);
        assert_eq!(a.severity, Severity::Critical); // 100d overdue
    }

    #[test]
    fn test_pattern_flagged_at_five_same_type() {
        let cases: Vec<CaseTimeline> = (0..5)
            .map(|i| timeline(&format!("C{i}"), 1200.0, 72))
            .collect();
        let anomalies = SlaBreachDetector.apply(&input_with(cases), &RuleContext::new("seller-1"));
        assert_eq!(anomalies.len(), 5);
        assert!(anomalies
            .iter()
            .all(|a| a.evidence["action"] == "flag_pattern"));
    }

    #[test]
    fn test_reimbursement_window_uses_reimbursement_base() {
        let created = Utc::now() - Duration::days(30);
        let decision = created + Duration::days(5);
        let case = CaseTimeline {
            case_id: "C6".into(),
            case_type: "lost_inventory".into(),
            created_at: created,
            first_response_at: Some(created + Duration::hours(10)),
            investigation_started_at: None,
            investigation_completed_at: None,
            decision_at: Some(decision),
            resolved_at: Some(decision + Duration::days(9)), // 5d SLA, 4d overdue
            claim_amount: 400.0,
            reimbursement_amount: Some(400.0),
            currency: "USD".into(),
            seller_caused_delay: false,
        };

        let anomalies =
            SlaBreachDetector.apply(&input_with(vec![case]), &RuleContext::new("seller-1"));
        assert_eq!(anomalies.len(), 1);
        let a = &anomalies[0];
        assert_eq!(a.evidence["breach_type"], "reimbursement_exceeded");
        // 4 * 0.50 * (400/50) = $16
        assert!((a.estimated_value - 16.0).abs() < 1e-9);
    }
}
