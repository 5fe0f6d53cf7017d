//! Lost-units detector.
//!
//! Flags warehouse inventory the marketplace reports as lost and never
//! reimbursed. Fires on either the percentage-of-total or the absolute-value
//! threshold.

use serde_json::json;

use crate::inputs::DetectionInput;
use crate::models::{Anomaly, RuleContext, RuleType};
use crate::rules::helpers::{
    any_threshold_triggers, calculate_severity, clamp_score, dedupe_hash, item_whitelisted,
};
use crate::rules::{DetectionRule, RulePriority};

pub struct LostUnitsRule;

impl DetectionRule for LostUnitsRule {
    fn rule_type(&self) -> RuleType {
        RuleType::LostUnits
    }

    fn priority(&self) -> RulePriority {
        RulePriority::High
    }

    fn apply(&self, input: &DetectionInput, ctx: &RuleContext) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();

        // Zero totals means no denominator; nothing can trigger.
        if input.total_units <= 0.0 {
            return anomalies;
        }

        let thresholds = ctx.thresholds_for(RuleType::LostUnits);

        for item in &input.inventory {
            if item_whitelisted(ctx, &item.sku, &item.asin, item.vendor.as_deref()) {
                continue;
            }

            let lost_pct = f64::from(item.units) / input.total_units;
            let lost_value = item.value;

            let triggered = any_threshold_triggers(lost_pct, &thresholds)
                || any_threshold_triggers(lost_value, &thresholds);
            if !triggered {
                continue;
            }

            let value_ratio = if input.total_value > 0.0 {
                lost_value / input.total_value
            } else {
                0.0
            };
            let score = clamp_score(lost_pct * 10.0 + value_ratio);

            let core_fields = json!({
                "sku": item.sku,
                "asin": item.asin,
                "units": item.units,
                "value": item.value,
                "vendor": item.vendor,
            });

            anomalies.push(Anomaly::new(
                &input.seller_id,
                &input.sync_id,
                RuleType::LostUnits,
                calculate_severity(score),
                score,
                format!(
                    "Lost units detected: {} units ({}) worth ${:.2}",
                    item.units, item.sku, item.value
                ),
                json!({
                    "sku": item.sku,
                    "asin": item.asin,
                    "vendor": item.vendor,
                    "units": item.units,
                    "value": item.value,
                    "lost_pct": lost_pct,
                    "total_units": input.total_units,
                    "total_value": input.total_value,
                }),
                dedupe_hash(&input.seller_id, RuleType::LostUnits, &core_fields),
                item.value,
            ));
        }

        anomalies
    }
}
