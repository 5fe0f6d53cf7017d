//! Typed detection inputs.
//!
//! The upstream ingestion system stores one snapshot JSON per (seller, sync).
//! This module is the adapter layer: it deserializes that snapshot into closed
//! record types, and rules consume only these. Shape mismatches surface as
//! `Validation` errors before any rule runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DetectionError;

/// One inventory position reported lost by the warehouse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryItem {
    pub sku: String,
    pub asin: String,
    #[serde(default)]
    pub vendor: Option<String>,
    pub units: u32,
    pub value: f64,
}

/// One damaged inventory position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DamagedItem {
    pub sku: String,
    pub asin: String,
    #[serde(default)]
    pub vendor: Option<String>,
    pub units: u32,
    pub value: f64,
    pub damage_type: String,
    #[serde(default)]
    pub damage_reason: Option<String>,
}

/// A charged fee with the expected amount from the fee schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeItem {
    pub fee_type: String,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub asin: Option<String>,
    #[serde(default)]
    pub order_id: Option<String>,
    pub expected: f64,
    pub actual: f64,
}

/// A refund issued to a buyer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRecord {
    pub order_id: String,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub asin: Option<String>,
    pub amount: f64,
    pub refund_date: DateTime<Utc>,
}

/// A physical return received back into the warehouse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReturnRecord {
    pub order_id: String,
    #[serde(default)]
    pub sku: Option<String>,
    pub quantity: u32,
    pub return_date: DateTime<Utc>,
}

/// A closed/resolved/denied marketplace case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedCase {
    pub case_id: String,
    #[serde(default)]
    pub order_id: Option<String>,
    pub case_type: String,
    pub status: String,
    pub estimated_value: f64,
    pub approved_amount: f64,
    pub closed_at: DateTime<Utc>,
    #[serde(default)]
    pub approved_at: Option<DateTime<Utc>>,
}

/// One inventory-ledger adjustment event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub event_id: String,
    pub fnsku: String,
    #[serde(default)]
    pub sku: Option<String>,
    pub reason_code: String,
    pub quantity: i64,
    #[serde(default)]
    pub unit_value: Option<f64>,
    pub event_date: DateTime<Utc>,
    #[serde(default)]
    pub disposition: Option<String>,
}

/// A reimbursement the marketplace has already paid out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReimbursementEvent {
    pub event_id: String,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub case_id: Option<String>,
    #[serde(default)]
    pub fnsku: Option<String>,
    pub amount: f64,
    #[serde(default)]
    pub quantity: i64,
    pub event_date: DateTime<Utc>,
}

/// Timeline of one support case, for SLA auditing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseTimeline {
    pub case_id: String,
    pub case_type: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub first_response_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub investigation_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub investigation_completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub decision_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    pub claim_amount: f64,
    #[serde(default)]
    pub reimbursement_amount: Option<f64>,
    #[serde(default = "default_currency")]
    pub currency: String,
    /// True when the seller held up the case (late responses, missing docs).
    #[serde(default)]
    pub seller_caused_delay: bool,
}

fn default_currency() -> String {
    "USD".to_string()
}

/// A warehouse-to-warehouse inventory transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRecord {
    pub transfer_id: String,
    pub from_fc: String,
    pub to_fc: String,
    pub quantity_shipped: i64,
    #[serde(default)]
    pub quantity_received: i64,
    pub unit_value: f64,
    pub shipped_at: DateTime<Utc>,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
    pub status: String,
}

impl TransferRecord {
    pub fn quantity_missing(&self) -> i64 {
        (self.quantity_shipped - self.quantity_received).max(0)
    }

    pub fn days_in_transit(&self, now: DateTime<Utc>) -> i64 {
        let end = self.received_at.unwrap_or(now);
        (end - self.shipped_at).num_days()
    }
}

/// The complete typed snapshot one detection pass runs over.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionInput {
    pub seller_id: String,
    pub sync_id: String,
    #[serde(default)]
    pub inventory: Vec<InventoryItem>,
    /// Seller-wide unit count, denominator for loss percentages.
    #[serde(default)]
    pub total_units: f64,
    /// Seller-wide inventory value, denominator for value ratios.
    #[serde(default)]
    pub total_value: f64,
    #[serde(default)]
    pub damaged: Vec<DamagedItem>,
    #[serde(default)]
    pub fees: Vec<FeeItem>,
    #[serde(default)]
    pub refunds: Vec<RefundRecord>,
    #[serde(default)]
    pub returns: Vec<ReturnRecord>,
    #[serde(default)]
    pub cases: Vec<ClosedCase>,
    #[serde(default)]
    pub case_timelines: Vec<CaseTimeline>,
    #[serde(default)]
    pub ledger: Vec<LedgerEvent>,
    #[serde(default)]
    pub reimbursements: Vec<ReimbursementEvent>,
    #[serde(default)]
    pub transfers: Vec<TransferRecord>,
    #[serde(default = "Utc::now")]
    pub captured_at: DateTime<Utc>,
}

impl DetectionInput {
    /// Adapt a raw ingestion snapshot into the typed input the rules consume.
    pub fn from_snapshot(
        seller_id: &str,
        sync_id: &str,
        snapshot: serde_json::Value,
    ) -> Result<Self, DetectionError> {
        let mut input: DetectionInput = serde_json::from_value(snapshot)
            .map_err(|e| DetectionError::Validation(format!("snapshot for {sync_id}: {e}")))?;
        input.seller_id = seller_id.to_string();
        input.sync_id = sync_id.to_string();
        Ok(input)
    }

    /// Raw snapshot form, re-serialized for evidence packaging.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
