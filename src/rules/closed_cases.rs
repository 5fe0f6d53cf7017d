//! Closed-case auditor.
//!
//! Re-reads cases the marketplace already closed and hunts for money left on
//! the table: underpaid approvals, zero-dollar resolutions worth reopening,
//! and approvals that never turned into a reimbursement event.
//!
//! Reimbursements are matched by order_id first, falling back to case_id only
//! when the event carries no order_id. Never matched on amount alone.

use chrono::Duration;
use serde_json::json;

use crate::inputs::{ClosedCase, DetectionInput};
use crate::models::{Anomaly, RuleContext, RuleType, Severity};
use crate::rules::helpers::dedupe_hash;
use crate::rules::{DetectionRule, RulePriority};

const LOOKBACK_DAYS: i64 = 180;
const REOPEN_WINDOW_DAYS: i64 = 90;
const FOLLOW_THROUGH_GRACE_DAYS: i64 = 14;

const UNDERPAYMENT_MIN_GAP: f64 = 10.0;
const UNDERPAYMENT_MIN_GAP_PCT: f64 = 20.0;
const ZERO_RESOLUTION_MIN_CLAIM: f64 = 25.0;
const REOPEN_MIN_CLAIM: f64 = 50.0;

const UNDERPAYMENT_CONFIDENCE: f64 = 0.85;
const ZERO_RESOLUTION_CONFIDENCE: f64 = 0.75;
const FOLLOW_THROUGH_CONFIDENCE: f64 = 0.90;

/// Severity from the recoverable gap and its share of the original claim.
fn severity_for_gap(gap: f64, gap_pct: f64) -> Severity {
    if gap >= 500.0 || gap_pct >= 80.0 {
        Severity::Critical
    } else if gap >= 100.0 || gap_pct >= 50.0 {
        Severity::High
    } else if gap >= 25.0 || gap_pct >= 30.0 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

pub struct ClosedCaseAuditor;

impl ClosedCaseAuditor {
    fn audit_underpayment(&self, input: &DetectionInput, case: &ClosedCase) -> Option<Anomaly> {
        if case.approved_amount <= 0.0 || case.approved_amount >= case.estimated_value {
            return None;
        }
        let gap = case.estimated_value - case.approved_amount;
        let gap_pct = gap / case.estimated_value * 100.0;
        if gap_pct < UNDERPAYMENT_MIN_GAP_PCT || gap < UNDERPAYMENT_MIN_GAP {
            return None;
        }

        let reopenable = input.captured_at - case.closed_at <= Duration::days(REOPEN_WINDOW_DAYS);
        let core_fields = json!({
            "case_id": case.case_id,
            "audit_type": "underpayment",
            "gap": gap,
        });

        Some(
            Anomaly::new(
                &input.seller_id,
                &input.sync_id,
                RuleType::ClosedCaseAudit,
                severity_for_gap(gap, gap_pct),
                UNDERPAYMENT_CONFIDENCE,
                format!(
                    "Case {} underpaid: approved ${:.2} of ${:.2} estimated (gap {:.0}%)",
                    case.case_id, case.approved_amount, case.estimated_value, gap_pct
                ),
                json!({
                    "audit_type": "underpayment",
                    "case_id": case.case_id,
                    "order_id": case.order_id,
                    "case_type": case.case_type,
                    "estimated_value": case.estimated_value,
                    "approved_amount": case.approved_amount,
                    "gap": gap,
                    "gap_pct": gap_pct,
                    "reopen_recommended": reopenable,
                }),
                dedupe_hash(&input.seller_id, RuleType::ClosedCaseAudit, &core_fields),
                gap,
            )
            .with_related_events(vec![case.case_id.clone()]),
        )
    }

    fn audit_zero_resolution(&self, input: &DetectionInput, case: &ClosedCase) -> Option<Anomaly> {
        let denied_or_closed = matches!(case.status.as_str(), "denied" | "closed");
        if !denied_or_closed || case.approved_amount != 0.0 {
            return None;
        }
        if case.estimated_value < ZERO_RESOLUTION_MIN_CLAIM {
            return None;
        }

        let within_reopen =
            input.captured_at - case.closed_at <= Duration::days(REOPEN_WINDOW_DAYS);
        let reopen_recommended = within_reopen && case.estimated_value >= REOPEN_MIN_CLAIM;

        let core_fields = json!({
            "case_id": case.case_id,
            "audit_type": "zero_resolution",
            "gap": case.estimated_value,
        });

        Some(
            Anomaly::new(
                &input.seller_id,
                &input.sync_id,
                RuleType::ClosedCaseAudit,
                severity_for_gap(case.estimated_value, 100.0),
                ZERO_RESOLUTION_CONFIDENCE,
                format!(
                    "Case {} resolved at $0 against a ${:.2} claim",
                    case.case_id, case.estimated_value
                ),
                json!({
                    "audit_type": "zero_resolution",
                    "case_id": case.case_id,
                    "order_id": case.order_id,
                    "case_type": case.case_type,
                    "estimated_value": case.estimated_value,
                    "status": case.status,
                    "reopen_recommended": reopen_recommended,
                }),
                dedupe_hash(&input.seller_id, RuleType::ClosedCaseAudit, &core_fields),
                case.estimated_value,
            )
            .with_related_events(vec![case.case_id.clone()]),
        )
    }

    fn audit_follow_through(&self, input: &DetectionInput, case: &ClosedCase) -> Option<Anomaly> {
        if case.approved_amount <= 0.0 {
            return None;
        }
        let approved_at = case.approved_at?;
        if input.captured_at - approved_at < Duration::days(FOLLOW_THROUGH_GRACE_DAYS) {
            return None;
        }

        let paid = input.reimbursements.iter().any(|ev| match &ev.order_id {
            Some(order) => case.order_id.as_deref() == Some(order.as_str()),
            None => ev.case_id.as_deref() == Some(case.case_id.as_str()),
        });
        if paid {
            return None;
        }

        let core_fields = json!({
            "case_id": case.case_id,
            "audit_type": "missing_follow_through",
            "gap": case.approved_amount,
        });

        Some(
            Anomaly::new(
                &input.seller_id,
                &input.sync_id,
                RuleType::ClosedCaseAudit,
                severity_for_gap(case.approved_amount, 100.0),
                FOLLOW_THROUGH_CONFIDENCE,
                format!(
                    "Case {} approved ${:.2} over {}d ago with no reimbursement event",
                    case.case_id, case.approved_amount, FOLLOW_THROUGH_GRACE_DAYS
                ),
                json!({
                    "audit_type": "missing_follow_through",
                    "case_id": case.case_id,
                    "order_id": case.order_id,
                    "case_type": case.case_type,
                    "approved_amount": case.approved_amount,
                    "approved_at": approved_at,
                }),
                dedupe_hash(&input.seller_id, RuleType::ClosedCaseAudit, &core_fields),
                case.approved_amount,
            )
            .with_related_events(vec![case.case_id.clone()]),
        )
    }
}

impl DetectionRule for ClosedCaseAuditor {
    fn rule_type(&self) -> RuleType {
        RuleType::ClosedCaseAudit
    }

    fn priority(&self) -> RulePriority {
        RulePriority::Normal
    }

    fn apply(&self, input: &DetectionInput, _ctx: &RuleContext) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();
        let cutoff = input.captured_at - Duration::days(LOOKBACK_DAYS);

        for case in &input.cases {
            let closed = matches!(case.status.as_str(), "closed" | "resolved" | "denied");
            if !closed || case.closed_at < cutoff {
                continue;
            }

            if let Some(a) = self.audit_underpayment(input, case) {
                anomalies.push(a);
            }
            if let Some(a) = self.audit_zero_resolution(input, case) {
                anomalies.push(a);
            }
            if let Some(a) = self.audit_follow_through(input, case) {
                anomalies.push(a);
            }
        }

        anomalies
    }
}
