//! Damaged-stock detector.
//!
//! Whitelist checks are damage-type independent: an exempted SKU stays exempt
//! whatever the damage code says.

use serde_json::json;

use crate::inputs::DetectionInput;
use crate::models::{Anomaly, RuleContext, RuleType};
use crate::rules::helpers::{
    any_threshold_triggers, calculate_severity, clamp_score, dedupe_hash, item_whitelisted,
};
use crate::rules::{DetectionRule, RulePriority};

pub struct DamagedStockRule;

impl DetectionRule for DamagedStockRule {
    fn rule_type(&self) -> RuleType {
        RuleType::DamagedStock
    }

    fn priority(&self) -> RulePriority {
        RulePriority::Medium
    }

    fn apply(&self, input: &DetectionInput, ctx: &RuleContext) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();
        let thresholds = ctx.thresholds_for(RuleType::DamagedStock);

        for item in &input.damaged {
            if item_whitelisted(ctx, &item.sku, &item.asin, item.vendor.as_deref()) {
                continue;
            }

            let triggered = any_threshold_triggers(f64::from(item.units), &thresholds)
                || any_threshold_triggers(item.value, &thresholds);
            if !triggered {
                continue;
            }

            let unit_ratio = if input.total_units > 0.0 {
                f64::from(item.units) / input.total_units
            } else {
                0.0
            };
            let value_ratio = if input.total_value > 0.0 {
                item.value / input.total_value
            } else {
                0.0
            };
            let score = clamp_score(unit_ratio + value_ratio);

            let core_fields = json!({
                "sku": item.sku,
                "asin": item.asin,
                "units": item.units,
                "value": item.value,
                "vendor": item.vendor,
                "damage_type": item.damage_type,
            });

            anomalies.push(Anomaly::new(
                &input.seller_id,
                &input.sync_id,
                RuleType::DamagedStock,
                calculate_severity(score),
                score,
                format!(
                    "Damaged stock detected: {} units ({}) worth ${:.2}, damage type {}",
                    item.units, item.sku, item.value, item.damage_type
                ),
                json!({
                    "sku": item.sku,
                    "asin": item.asin,
                    "vendor": item.vendor,
                    "units": item.units,
                    "value": item.value,
                    "damage_type": item.damage_type,
                    "damage_reason": item.damage_reason,
                    "total_units": input.total_units,
                    "total_value": input.total_value,
                }),
                dedupe_hash(&input.seller_id, RuleType::DamagedStock, &core_fields),
                item.value,
            ));
        }

        anomalies
    }
}
