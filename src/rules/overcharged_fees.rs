//! Overcharged-fees detector.
//!
//! Compares each charged fee to the expected amount from the fee schedule.

use serde_json::json;

use crate::inputs::DetectionInput;
use crate::models::{Anomaly, RuleContext, RuleType, WhitelistScope};
use crate::rules::helpers::{
    any_threshold_triggers, calculate_severity, clamp_score, dedupe_hash, is_whitelisted,
};
use crate::rules::{DetectionRule, RulePriority};

/// Minimum overcharge when no threshold is configured for the seller.
const DEFAULT_MIN_OVERCHARGE: f64 = 1.0;

pub struct OverchargedFeesRule;

impl DetectionRule for OverchargedFeesRule {
    fn rule_type(&self) -> RuleType {
        RuleType::OverchargedFees
    }

    fn priority(&self) -> RulePriority {
        RulePriority::High
    }

    fn apply(&self, input: &DetectionInput, ctx: &RuleContext) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();
        let thresholds = ctx.thresholds_for(RuleType::OverchargedFees);

        for fee in &input.fees {
            if let Some(sku) = &fee.sku {
                if is_whitelisted(ctx, WhitelistScope::Sku, sku) {
                    continue;
                }
            }
            if let Some(asin) = &fee.asin {
                if is_whitelisted(ctx, WhitelistScope::Asin, asin) {
                    continue;
                }
            }

            let overcharge = fee.actual - fee.expected;
            if overcharge <= 0.0 {
                continue;
            }

            let triggered = if thresholds.is_empty() {
                overcharge >= DEFAULT_MIN_OVERCHARGE
            } else {
                any_threshold_triggers(overcharge, &thresholds)
            };
            if !triggered {
                continue;
            }

            let ratio = if fee.expected > 0.0 {
                overcharge / fee.expected
            } else {
                1.0
            };
            let score = clamp_score(ratio);

            let core_fields = json!({
                "fee_type": fee.fee_type,
                "sku": fee.sku,
                "order_id": fee.order_id,
                "expected": fee.expected,
                "actual": fee.actual,
            });

            anomalies.push(
                Anomaly::new(
                    &input.seller_id,
                    &input.sync_id,
                    RuleType::OverchargedFees,
                    calculate_severity(score),
                    score,
                    format!(
                        "Fee overcharge detected: {} charged ${:.2}, expected ${:.2}",
                        fee.fee_type, fee.actual, fee.expected
                    ),
                    json!({
                        "fee_type": fee.fee_type,
                        "sku": fee.sku,
                        "asin": fee.asin,
                        "order_id": fee.order_id,
                        "expected": fee.expected,
                        "actual": fee.actual,
                        "overcharge": overcharge,
                        "overcharge_ratio": ratio,
                    }),
                    dedupe_hash(&input.seller_id, RuleType::OverchargedFees, &core_fields),
                    overcharge,
                )
                .with_related_events(fee.order_id.iter().cloned().collect()),
            );
        }

        anomalies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inputs::FeeItem;
    use crate::models::{Threshold, ThresholdOperator};

    fn fee(expected: f64, actual: f64) -> FeeItem {
        FeeItem {
            fee_type: "fba_fulfillment".into(),
            sku: Some("SKU001".into()),
            asin: None,
            order_id: Some("111-222".into()),
            expected,
            actual,
        }
    }

    fn input_with(fees: Vec<FeeItem>) -> DetectionInput {
        DetectionInput {
            seller_id: "seller-1".into(),
            sync_id: "sync-1".into(),
            fees,
            ..Default::default()
        }
    }

    #[test]
    fn test_overcharge_at_threshold_fires() {
        let mut ctx = RuleContext::new("seller-1");
        ctx.thresholds = vec![Threshold {
            id: None,
            rule_type: RuleType::OverchargedFees,
            seller_id: None,
            operator: ThresholdOperator::Gte,
            value: 2.0,
            active: true,
        }];

        let anomalies = OverchargedFeesRule.apply(&input_with(vec![fee(5.0, 7.0)]), &ctx);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].estimated_value, 2.0);
        assert_eq!(anomalies[0].related_event_ids, vec!["111-222".to_string()]);
    }

    #[test]
    fn test_undercharge_ignored() {
        let ctx = RuleContext::new("seller-1");
        assert!(OverchargedFeesRule
            .apply(&input_with(vec![fee(5.0, 4.0)]), &ctx)
            .is_empty());
    }

    #[test]
    fn test_below_threshold_does_not_fire() {
        let mut ctx = RuleContext::new("seller-1");
        ctx.thresholds = vec![Threshold {
            id: None,
            rule_type: RuleType::OverchargedFees,
            seller_id: None,
            operator: ThresholdOperator::Gte,
            value: 2.0,
            active: true,
        }];
        assert!(OverchargedFeesRule
            .apply(&input_with(vec![fee(5.0, 6.5)]), &ctx)
            .is_empty());
    }

    #[test]
    fn test_default_minimum_when_unconfigured() {
        let ctx = RuleContext::new("seller-1");
        assert!(OverchargedFeesRule
            .apply(&input_with(vec![fee(5.0, 5.5)]), &ctx)
            .is_empty());
        assert_eq!(
            OverchargedFeesRule
                .apply(&input_with(vec![fee(5.0, 6.5)]), &ctx)
                .len(),
            1
        );
    }
}
