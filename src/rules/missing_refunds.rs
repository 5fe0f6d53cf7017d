//! Refund-without-return detector.
//!
//! A buyer refund that is at least 30 days old with no physical return
//! received within the 45-day return window is reimbursable.

use chrono::Duration;
use serde_json::json;

use crate::inputs::DetectionInput;
use crate::models::{Anomaly, RuleContext, RuleType, WhitelistScope};
use crate::rules::helpers::{calculate_severity, clamp_score, dedupe_hash, is_whitelisted};
use crate::rules::{DetectionRule, RulePriority};

const MIN_REFUND_AGE_DAYS: i64 = 30;
const RETURN_WINDOW_DAYS: i64 = 45;
const MIN_REFUND_AMOUNT: f64 = 5.0;

pub struct MissingRefundsRule;

impl DetectionRule for MissingRefundsRule {
    fn rule_type(&self) -> RuleType {
        RuleType::MissingRefunds
    }

    fn priority(&self) -> RulePriority {
        RulePriority::Normal
    }

    fn apply(&self, input: &DetectionInput, ctx: &RuleContext) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();
        let now = input.captured_at;

        for refund in &input.refunds {
            if refund.amount < MIN_REFUND_AMOUNT {
                continue;
            }
            if now - refund.refund_date < Duration::days(MIN_REFUND_AGE_DAYS) {
                continue;
            }
            if let Some(sku) = &refund.sku {
                if is_whitelisted(ctx, WhitelistScope::Sku, sku) {
                    continue;
                }
            }
            if let Some(asin) = &refund.asin {
                if is_whitelisted(ctx, WhitelistScope::Asin, asin) {
                    continue;
                }
            }

            let returned = input.returns.iter().any(|r| {
                r.order_id == refund.order_id
                    && r.return_date >= refund.refund_date
                    && r.return_date - refund.refund_date <= Duration::days(RETURN_WINDOW_DAYS)
            });
            if returned {
                continue;
            }

            let score = clamp_score(0.5 + refund.amount / 500.0);
            let core_fields = json!({
                "order_id": refund.order_id,
                "sku": refund.sku,
                "amount": refund.amount,
            });

            anomalies.push(
                Anomaly::new(
                    &input.seller_id,
                    &input.sync_id,
                    RuleType::MissingRefunds,
                    calculate_severity(score),
                    score,
                    format!(
                        "Refund without return: order {} refunded ${:.2}, no return received in {}d",
                        refund.order_id, refund.amount, RETURN_WINDOW_DAYS
                    ),
                    json!({
                        "order_id": refund.order_id,
                        "sku": refund.sku,
                        "asin": refund.asin,
                        "amount": refund.amount,
                        "refund_date": refund.refund_date,
                        "return_window_days": RETURN_WINDOW_DAYS,
                    }),
                    dedupe_hash(&input.seller_id, RuleType::MissingRefunds, &core_fields),
                    refund.amount,
                )
                .with_related_events(vec![refund.order_id.clone()]),
            );
        }

        anomalies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inputs::{RefundRecord, ReturnRecord};
    use chrono::Utc;

    fn input_with(refunds: Vec<RefundRecord>, returns: Vec<ReturnRecord>) -> DetectionInput {
        DetectionInput {
            seller_id: "seller-1".into(),
            sync_id: "sync-1".into(),
            refunds,
            returns,
            captured_at: Utc::now(),
            ..Default::default()
        }
    }

    fn refund(order_id: &str, amount: f64, age_days: i64) -> RefundRecord {
        RefundRecord {
            order_id: order_id.into(),
            sku: Some("SKU001".into()),
            asin: None,
            amount,
            refund_date: Utc::now() - Duration::days(age_days),
        }
    }

    #[test]
    fn test_unreturned_refund_fires() {
        let ctx = RuleContext::new("seller-1");
        let anomalies =
            MissingRefundsRule.apply(&input_with(vec![refund("111-001", 42.0, 60)], vec![]), &ctx);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].estimated_value, 42.0);
    }

    #[test]
    fn test_matching_return_suppresses() {
        let ctx = RuleContext::new("seller-1");
        let r = refund("111-001", 42.0, 60);
        let ret = ReturnRecord {
            order_id: "111-001".into(),
            sku: Some("SKU001".into()),
            quantity: 1,
            return_date: r.refund_date + Duration::days(10),
        };
        assert!(MissingRefundsRule
            .apply(&input_with(vec![r], vec![ret]), &ctx)
            .is_empty());
    }

    #[test]
    fn test_return_outside_window_still_fires() {
        let ctx = RuleContext::new("seller-1");
        let r = refund("111-001", 42.0, 90);
        let ret = ReturnRecord {
            order_id: "111-001".into(),
            sku: None,
            quantity: 1,
            return_date: r.refund_date + Duration::days(60),
        };
        assert_eq!(
            MissingRefundsRule
                .apply(&input_with(vec![r], vec![ret]), &ctx)
                .len(),
            1
        );
    }

    #[test]
    fn test_young_or_small_refunds_skipped() {
        let ctx = RuleContext::new("seller-1");
        // Too recent
        assert!(MissingRefundsRule
            .apply(&input_with(vec![refund("111-001", 42.0, 10)], vec![]), &ctx)
            .is_empty());
        // Below minimum amount
        assert!(MissingRefundsRule
            .apply(&input_with(vec![refund("111-002", 3.0, 60)], vec![]), &ctx)
            .is_empty());
    }
}
