//! Warehouse-transfer loss detector.
//!
//! Inventory moved between fulfillment centers either arrives short or sits
//! in transit far past the normal window. Both are claimable.

use chrono::Duration;
use serde_json::json;

use crate::inputs::DetectionInput;
use crate::models::{Anomaly, RuleContext, RuleType, Severity};
use crate::rules::helpers::{clamp_score, dedupe_hash};
use crate::rules::{DetectionRule, RulePriority};

const LOOKBACK_DAYS: i64 = 90;
const MIN_LOSS_VALUE: f64 = 10.0;
const DELAY_THRESHOLD_DAYS: i64 = 14;
const CRITICAL_DELAY_DAYS: i64 = 30;

fn severity_for_loss(loss_value: f64) -> Severity {
    if loss_value >= 500.0 {
        Severity::Critical
    } else if loss_value >= 100.0 {
        Severity::High
    } else if loss_value >= 25.0 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

pub struct TransferLossDetector;

impl DetectionRule for TransferLossDetector {
    fn rule_type(&self) -> RuleType {
        RuleType::TransferLoss
    }

    fn priority(&self) -> RulePriority {
        RulePriority::Normal
    }

    fn apply(&self, input: &DetectionInput, _ctx: &RuleContext) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();
        let now = input.captured_at;
        let cutoff = now - Duration::days(LOOKBACK_DAYS);

        for transfer in &input.transfers {
            if transfer.shipped_at < cutoff {
                continue;
            }

            let missing = transfer.quantity_missing();
            let loss_value = missing as f64 * transfer.unit_value;

            if missing > 0 && loss_value >= MIN_LOSS_VALUE {
                let subtype = if transfer.quantity_received == 0 {
                    "total_loss"
                } else {
                    "partial_loss"
                };
                let action = if loss_value >= 50.0 {
                    "file_claim"
                } else {
                    "investigate"
                };
                let score = clamp_score(0.5 + loss_value / 1000.0);

                let core_fields = json!({
                    "transfer_id": transfer.transfer_id,
                    "subtype": subtype,
                });

                anomalies.push(
                    Anomaly::new(
                        &input.seller_id,
                        &input.sync_id,
                        RuleType::TransferLoss,
                        severity_for_loss(loss_value),
                        score,
                        format!(
                            "Transfer {} lost {} units ({} -> {}), est ${:.2}",
                            transfer.transfer_id,
                            missing,
                            transfer.from_fc,
                            transfer.to_fc,
                            loss_value
                        ),
                        json!({
                            "subtype": subtype,
                            "transfer_id": transfer.transfer_id,
                            "from_fc": transfer.from_fc,
                            "to_fc": transfer.to_fc,
                            "quantity_shipped": transfer.quantity_shipped,
                            "quantity_received": transfer.quantity_received,
                            "quantity_missing": missing,
                            "unit_value": transfer.unit_value,
                            "loss_value": loss_value,
                            "action": action,
                        }),
                        dedupe_hash(&input.seller_id, RuleType::TransferLoss, &core_fields),
                        loss_value,
                    )
                    .with_related_events(vec![transfer.transfer_id.clone()]),
                );
            }

            let days_in_transit = transfer.days_in_transit(now);
            if transfer.status == "in_transit" && days_in_transit > DELAY_THRESHOLD_DAYS {
                let severity = if days_in_transit > CRITICAL_DELAY_DAYS {
                    Severity::Critical
                } else {
                    Severity::Medium
                };
                let at_risk = transfer.quantity_shipped as f64 * transfer.unit_value;
                let score = clamp_score(0.5 + days_in_transit as f64 / 60.0);

                let core_fields = json!({
                    "transfer_id": transfer.transfer_id,
                    "subtype": "excessive_delay",
                });

                anomalies.push(
                    Anomaly::new(
                        &input.seller_id,
                        &input.sync_id,
                        RuleType::TransferLoss,
                        severity,
                        score,
                        format!(
                            "Transfer {} in transit {}d ({} -> {}), ${:.2} at risk",
                            transfer.transfer_id,
                            days_in_transit,
                            transfer.from_fc,
                            transfer.to_fc,
                            at_risk
                        ),
                        json!({
                            "subtype": "excessive_delay",
                            "transfer_id": transfer.transfer_id,
                            "from_fc": transfer.from_fc,
                            "to_fc": transfer.to_fc,
                            "days_in_transit": days_in_transit,
                            "quantity_shipped": transfer.quantity_shipped,
                            "value_at_risk": at_risk,
                            "action": "investigate",
                        }),
                        dedupe_hash(&input.seller_id, RuleType::TransferLoss, &core_fields),
                        at_risk,
                    )
                    .with_related_events(vec![transfer.transfer_id.clone()]),
                );
            }
        }

        anomalies
    }
}
