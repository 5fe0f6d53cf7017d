//! Warehouse-fault damaged inventory detector.
//!
//! Walks the inventory ledger for damage dispositions where the warehouse is
//! at fault (reason codes E, M, Q, K, H), old enough that a reimbursement
//! should have landed, and checks none did.

use chrono::Duration;
use serde_json::json;

use crate::inputs::{DetectionInput, LedgerEvent};
use crate::models::{Anomaly, RuleContext, RuleType, Severity};
use crate::rules::helpers::dedupe_hash;
use crate::rules::{DetectionRule, RulePriority};

/// Reason codes where the marketplace, not the seller, owes the units.
const AT_FAULT_REASON_CODES: [&str; 5] = ["E", "M", "Q", "K", "H"];

const MIN_AGE_DAYS: i64 = 45;
const REIMBURSEMENT_WINDOW_DAYS: i64 = 45;
const QUANTITY_TOLERANCE: i64 = 1;
const FALLBACK_UNIT_VALUE: f64 = 15.0;
const MIN_TOTAL_VALUE: f64 = 5.0;
const CONFIDENCE: f64 = 0.95;

fn severity_for_value(total_value: f64) -> Severity {
    if total_value >= 500.0 {
        Severity::Critical
    } else if total_value >= 100.0 {
        Severity::High
    } else if total_value >= 25.0 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Anomaly subtype by where the damage happened.
fn subtype_for_reason(reason_code: &str) -> &'static str {
    match reason_code {
        "M" => "damaged_inbound",
        "K" => "damaged_removal",
        _ => "damaged_warehouse",
    }
}

fn reimbursed(input: &DetectionInput, event: &LedgerEvent, quantity: i64) -> bool {
    input.reimbursements.iter().any(|r| {
        r.fnsku.as_deref() == Some(event.fnsku.as_str())
            && r.event_date > event.event_date
            && r.event_date - event.event_date <= Duration::days(REIMBURSEMENT_WINDOW_DAYS)
            && (r.quantity - quantity).abs() <= QUANTITY_TOLERANCE
    })
}

pub struct DamagedInventoryDetector;

impl DetectionRule for DamagedInventoryDetector {
    fn rule_type(&self) -> RuleType {
        RuleType::DamagedInventory
    }

    fn priority(&self) -> RulePriority {
        RulePriority::High
    }

    fn apply(&self, input: &DetectionInput, _ctx: &RuleContext) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();
        let age_cutoff = input.captured_at - Duration::days(MIN_AGE_DAYS);

        for event in &input.ledger {
            if !AT_FAULT_REASON_CODES.contains(&event.reason_code.as_str()) {
                continue;
            }
            if event.event_date > age_cutoff {
                continue;
            }

            let quantity = event.quantity.abs();
            if quantity == 0 {
                continue;
            }
            if reimbursed(input, event, quantity) {
                continue;
            }

            let unit_value = event.unit_value.unwrap_or(FALLBACK_UNIT_VALUE);
            let total_value = quantity as f64 * unit_value;
            if total_value < MIN_TOTAL_VALUE {
                continue;
            }

            let subtype = subtype_for_reason(&event.reason_code);
            let core_fields = json!({
                "fnsku": event.fnsku,
                "reason_code": event.reason_code,
                "event_id": event.event_id,
                "quantity": quantity,
            });

            anomalies.push(
                Anomaly::new(
                    &input.seller_id,
                    &input.sync_id,
                    RuleType::DamagedInventory,
                    severity_for_value(total_value),
                    CONFIDENCE,
                    format!(
                        "Unreimbursed {subtype}: {quantity} units of {} (reason {}), est ${total_value:.2}",
                        event.fnsku, event.reason_code
                    ),
                    json!({
                        "subtype": subtype,
                        "fnsku": event.fnsku,
                        "sku": event.sku,
                        "reason_code": event.reason_code,
                        "quantity": quantity,
                        "unit_value": unit_value,
                        "total_value": total_value,
                        "event_date": event.event_date,
                        "disposition": event.disposition,
                    }),
                    dedupe_hash(&input.seller_id, RuleType::DamagedInventory, &core_fields),
                    total_value,
                )
                .with_related_events(vec![event.event_id.clone()]),
            );
        }

        anomalies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inputs::ReimbursementEvent;
    use chrono::Utc;

    fn ledger_event(id: &str, reason: &str, quantity: i64, age_days: i64) -> LedgerEvent {
        LedgerEvent {
            event_id: id.into(),
            fnsku: "X0FNSKU01".into(),
            sku: Some("SKU001".into()),
            reason_code: reason.into(),
            quantity,
            unit_value: Some(20.0),
            event_date: Utc::now() - Duration::days(age_days),
            disposition: Some("DAMAGED".into()),
        }
    }

    fn input_with(ledger: Vec<LedgerEvent>) -> DetectionInput {
        DetectionInput {
            seller_id: "seller-1".into(),
            sync_id: "sync-1".into(),
            ledger,
            captured_at: Utc::now(),
            ..Default::default()
        }
    }

    #[test]
    fn test_at_fault_unreimbursed_event_fires() {
        let anomalies =
            DamagedInventoryDetector.apply(&input_with(vec![ledger_event("L1", "E", -3, 60)]), &RuleContext::new("seller-1"));
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].evidence["subtype"], "damaged_warehouse");
        assert_eq!(anomalies[0].estimated_value, 60.0);
        assert_eq!(anomalies[0].score, CONFIDENCE);
    }

    #[test]
    fn test_subtype_by_reason_code() {
        assert_eq!(subtype_for_reason("M"), "damaged_inbound");
        assert_eq!(subtype_for_reason("K"), "damaged_removal");
        assert_eq!(subtype_for_reason("E"), "damaged_warehouse");
        assert_eq!(subtype_for_reason("H"), "damaged_warehouse");
    }

    #[test]
    fn test_seller_fault_codes_skipped() {
        let anomalies = DamagedInventoryDetector.apply(
            &input_with(vec![ledger_event("L2", "D", -3, 60)]),
            &RuleContext::new("seller-1"),
        );
        assert!(anomalies.is_empty());
    }

    #[test]
    fn test_recent_events_wait_out_the_window() {
        let anomalies = DamagedInventoryDetector.apply(
            &input_with(vec![ledger_event("L3", "E", -3, 20)]),
            &RuleContext::new("seller-1"),
        );
        assert!(anomalies.is_empty());
    }

    #[test]
    fn test_reimbursement_within_tolerance_suppresses() {
        let ev = ledger_event("L4", "Q", -4, 60);
        let mut input = input_with(vec![ev.clone()]);
        input.reimbursements.push(ReimbursementEvent {
            event_id: "R1".into(),
            order_id: None,
            case_id: None,
            fnsku: Some("X0FNSKU01".into()),
            amount: 60.0,
            quantity: 3, // within +/-1 of 4
            event_date: ev.event_date + Duration::days(10),
        });
        assert!(DamagedInventoryDetector
            .apply(&input, &RuleContext::new("seller-1"))
            .is_empty());
    }

    #[test]
    fn test_trivial_value_skipped() {
        let mut ev = ledger_event("L5", "E", -1, 60);
        ev.unit_value = Some(2.0); // $2 total, below the $5 floor
        assert!(DamagedInventoryDetector
            .apply(&input_with(vec![ev]), &RuleContext::new("seller-1"))
            .is_empty());
    }

    #[test]
    fn test_unknown_unit_value_falls_back() {
        let mut ev = ledger_event("L6", "E", -2, 60);
        ev.unit_value = None;
        let anomalies =
            DamagedInventoryDetector.apply(&input_with(vec![ev]), &RuleContext::new("seller-1"));
        assert_eq!(anomalies[0].evidence["unit_value"], FALLBACK_UNIT_VALUE);
        assert_eq!(anomalies[0].estimated_value, 30.0);
    }
}
