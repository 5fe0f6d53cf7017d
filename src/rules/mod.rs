//! Rule Engine
//!
//! Each detector is a pure function over (input, context): no I/O, no clock
//! reads beyond the snapshot's capture time, no input mutation. Two
//! applications over byte-equivalent inputs produce the same anomalies in the
//! same order with identical dedupe hashes.

pub mod closed_cases;
pub mod damaged_inventory;
pub mod damaged_stock;
pub mod helpers;
pub mod lost_units;
pub mod missing_refunds;
pub mod overcharged_fees;
pub mod sla_breach;
pub mod transfer_loss;

use serde::{Deserialize, Serialize};

use crate::inputs::DetectionInput;
use crate::models::{Anomaly, RuleContext, RuleType};

/// Scheduling weight of a rule inside one detection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RulePriority {
    Low,
    Normal,
    Medium,
    High,
}

impl RulePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            RulePriority::Low => "low",
            RulePriority::Normal => "normal",
            RulePriority::Medium => "medium",
            RulePriority::High => "high",
        }
    }
}

/// A single detector.
pub trait DetectionRule: Send + Sync {
    fn rule_type(&self) -> RuleType;
    fn priority(&self) -> RulePriority;
    fn apply(&self, input: &DetectionInput, ctx: &RuleContext) -> Vec<Anomaly>;
}

/// The fixed rule registry. Registration order is the persistence and SSE
/// emission order within a job, so it stays a data table here rather than
/// anything discovered at runtime.
pub fn default_registry() -> Vec<Box<dyn DetectionRule>> {
    vec![
        Box::new(lost_units::LostUnitsRule),
        Box::new(damaged_stock::DamagedStockRule),
        Box::new(overcharged_fees::OverchargedFeesRule),
        Box::new(missing_refunds::MissingRefundsRule),
        Box::new(closed_cases::ClosedCaseAuditor),
        Box::new(damaged_inventory::DamagedInventoryDetector),
        Box::new(sla_breach::SlaBreachDetector),
        Box::new(transfer_loss::TransferLossDetector),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_order_is_stable() {
        let rules = default_registry();
        let order: Vec<RuleType> = rules.iter().map(|r| r.rule_type()).collect();
        assert_eq!(
            order,
            vec![
                RuleType::LostUnits,
                RuleType::DamagedStock,
                RuleType::OverchargedFees,
                RuleType::MissingRefunds,
                RuleType::ClosedCaseAudit,
                RuleType::DamagedInventory,
                RuleType::SlaBreach,
                RuleType::TransferLoss,
            ]
        );
    }
}
