//! Commission / Invoice Engine
//!
//! Consumes confirmed reimbursement matches, groups them per seller per
//! billing period (calendar month), and bills a commission on recovered
//! funds. Invoices open with a 24-hour dispute window; disputing a line
//! recomputes the invoice without it, finalizing locks the lines as invoiced.
//!
//! Matching precedence: a reimbursement event is matched by order_id first,
//! falling back to case_id only when the event carries no order_id. Amount
//! alone never matches.

use chrono::{DateTime, Datelike, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::DetectionError;
use crate::inputs::ReimbursementEvent;
use crate::models::{CommissionInvoice, InvoiceStatus, MatchStatus};
use crate::storage::{AnomalyRecord, ResultsStore};

const DISPUTE_WINDOW_HOURS: i64 = 24;

pub struct CommissionEngine {
    store: Arc<ResultsStore>,
    rate: f64,
}

/// Billing period key for a payout date, `YYYY-MM`.
pub fn billing_period(date: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", date.year(), date.month())
}

/// The period the daily billing sweep invoices: the month before `now`.
pub fn previous_billing_period(now: DateTime<Utc>) -> String {
    let (year, month) = if now.month() == 1 {
        (now.year() - 1, 12)
    } else {
        (now.year(), now.month() - 1)
    };
    format!("{year:04}-{month:02}")
}

impl CommissionEngine {
    pub fn new(store: Arc<ResultsStore>, rate: f64) -> Self {
        Self { store, rate }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Match reimbursement events against a seller's persisted findings and
    /// record the confirmed matches. Returns how many matched.
    pub fn record_matches(
        &self,
        seller_id: &str,
        events: &[ReimbursementEvent],
        findings: &[AnomalyRecord],
    ) -> Result<usize, DetectionError> {
        let mut recorded = 0;

        for event in events {
            let matched = findings.iter().find(|record| {
                let related = &record.anomaly.related_event_ids;
                match &event.order_id {
                    Some(order_id) => related.iter().any(|id| id == order_id),
                    None => event
                        .case_id
                        .as_ref()
                        .is_some_and(|case_id| related.iter().any(|id| id == case_id)),
                }
            });

            let Some(record) = matched else { continue };

            self.store.record_match(
                seller_id,
                event.order_id.as_deref(),
                event.case_id.as_deref(),
                Some(record.id),
                event.amount,
                &billing_period(event.event_date),
                event.event_date,
            )?;
            recorded += 1;
        }

        if recorded > 0 {
            debug!(seller = seller_id, recorded, "reimbursement matches recorded");
        }
        Ok(recorded)
    }

    /// Generate the period invoice from unbilled confirmed matches. Returns
    /// None when there is nothing to bill.
    pub fn generate_invoice(
        &self,
        seller_id: &str,
        period: &str,
    ) -> Result<Option<CommissionInvoice>, DetectionError> {
        let matches = self.store.unbilled_matches(seller_id, period)?;
        if matches.is_empty() {
            return Ok(None);
        }

        let subtotal: f64 = matches.iter().map(|m| m.amount).sum();
        let commission = subtotal * self.rate;
        let number = self.store.next_invoice_number(seller_id)?;
        let dispute_deadline = Utc::now() + Duration::hours(DISPUTE_WINDOW_HOURS);

        let invoice_id = self.store.create_invoice(
            seller_id,
            number,
            period,
            subtotal,
            self.rate,
            commission,
            dispute_deadline,
        )?;
        self.store
            .attach_matches(invoice_id, &matches.iter().map(|m| m.id).collect::<Vec<_>>())?;

        info!(
            seller = seller_id,
            invoice = number,
            period,
            subtotal,
            commission,
            "🧾 Commission invoice generated"
        );

        self.store
            .invoice(invoice_id)?
            .ok_or_else(|| DetectionError::Storage("invoice vanished after insert".into()))
            .map(Some)
    }

    /// Dispute one line while the window is open. The invoice is recomputed
    /// without disputed lines.
    pub fn dispute_line(&self, invoice_id: i64, match_id: i64) -> Result<(), DetectionError> {
        let invoice = self
            .store
            .invoice(invoice_id)?
            .ok_or_else(|| DetectionError::Validation(format!("unknown invoice {invoice_id}")))?;

        if invoice.status == InvoiceStatus::Finalized {
            return Err(DetectionError::Validation(
                "invoice already finalized".to_string(),
            ));
        }
        if Utc::now() > invoice.dispute_deadline {
            return Err(DetectionError::Validation(
                "dispute window has closed".to_string(),
            ));
        }

        let lines = self.store.matches_for_invoice(invoice_id)?;
        if !lines.iter().any(|m| m.id == match_id) {
            return Err(DetectionError::Validation(format!(
                "match {match_id} is not on invoice {invoice_id}"
            )));
        }

        self.store.set_match_status(match_id, MatchStatus::Disputed)?;

        let subtotal: f64 = self
            .store
            .matches_for_invoice(invoice_id)?
            .iter()
            .filter(|m| m.status != MatchStatus::Disputed)
            .map(|m| m.amount)
            .sum();
        self.store.update_invoice_totals(
            invoice_id,
            subtotal,
            subtotal * invoice.commission_rate,
            InvoiceStatus::Disputed,
        )?;

        Ok(())
    }

    /// Daily sweep: invoice every seller with unbilled matches for the given
    /// period, then finalize invoices whose dispute window has closed.
    /// Returns (invoices generated, invoices finalized).
    pub fn run_billing_sweep(&self, period: &str) -> Result<(usize, usize), DetectionError> {
        let mut generated = 0;
        for seller in self.store.sellers_with_unbilled_matches(period)? {
            if self.generate_invoice(&seller, period)?.is_some() {
                generated += 1;
            }
        }

        let mut finalized = 0;
        for invoice_id in self.store.invoices_due_finalization()? {
            self.finalize_invoice(invoice_id)?;
            finalized += 1;
        }

        Ok((generated, finalized))
    }

    /// Finalize after the dispute window: marks the underlying confirmed
    /// matches as invoiced.
    pub fn finalize_invoice(&self, invoice_id: i64) -> Result<CommissionInvoice, DetectionError> {
        let invoice = self
            .store
            .invoice(invoice_id)?
            .ok_or_else(|| DetectionError::Validation(format!("unknown invoice {invoice_id}")))?;

        if Utc::now() <= invoice.dispute_deadline {
            return Err(DetectionError::Validation(
                "dispute window still open".to_string(),
            ));
        }

        self.store.finalize_invoice(invoice_id)?;
        self.store
            .invoice(invoice_id)?
            .ok_or_else(|| DetectionError::Storage("invoice vanished after finalize".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Anomaly, RuleType, Severity};
    use chrono::TimeZone;
    use serde_json::json;

    fn store_with_finding(order_id: &str) -> (Arc<ResultsStore>, AnomalyRecord) {
        let store = Arc::new(ResultsStore::in_memory().unwrap());
        let anomaly = Anomaly::new(
            "seller-1",
            "sync-1",
            RuleType::OverchargedFees,
            Severity::Medium,
            0.7,
            "Fee overcharge detected".into(),
            json!({}),
            "hash-1".into(),
            25.0,
        )
        .with_related_events(vec![order_id.to_string()]);
        store.insert_anomaly(&anomaly, None).unwrap();
        let record = store
            .anomalies_for_sync("seller-1", "sync-1")
            .unwrap()
            .remove(0);
        (store, record)
    }

    fn event(order_id: Option<&str>, case_id: Option<&str>, amount: f64) -> ReimbursementEvent {
        ReimbursementEvent {
            event_id: "R1".into(),
            order_id: order_id.map(str::to_string),
            case_id: case_id.map(str::to_string),
            fnsku: None,
            amount,
            quantity: 1,
            event_date: Utc::now(),
        }
    }

    #[test]
    fn test_matching_precedence_order_id_first() {
        let (store, record) = store_with_finding("order-9");
        let engine = CommissionEngine::new(store.clone(), 0.20);

        // order_id present and matching -> matched even with a bogus case_id
        let n = engine
            .record_matches("seller-1", &[event(Some("order-9"), Some("case-x"), 40.0)], &[record.clone()])
            .unwrap();
        assert_eq!(n, 1);

        // order_id present but unmatched: no case_id fallback
        let n = engine
            .record_matches("seller-1", &[event(Some("order-nope"), Some("order-9"), 40.0)], &[record.clone()])
            .unwrap();
        assert_eq!(n, 0);

        // no order_id: case_id fallback applies
        let n = engine
            .record_matches("seller-1", &[event(None, Some("order-9"), 40.0)], &[record])
            .unwrap();
        assert_eq!(n, 1);
    }

    #[test]
    fn test_invoice_generation_and_numbering() {
        let (store, record) = store_with_finding("order-9");
        let engine = CommissionEngine::new(store.clone(), 0.20);
        let period = billing_period(Utc::now());

        engine
            .record_matches("seller-1", &[event(Some("order-9"), None, 250.0)], &[record])
            .unwrap();

        let invoice = engine.generate_invoice("seller-1", &period).unwrap().unwrap();
        assert_eq!(invoice.invoice_number, 1);
        assert_eq!(invoice.subtotal, 250.0);
        assert_eq!(invoice.commission_amount, 50.0);
        assert_eq!(invoice.status, InvoiceStatus::Open);

        // Matches are now attached: a second invoice has nothing to bill.
        assert!(engine.generate_invoice("seller-1", &period).unwrap().is_none());
    }

    #[test]
    fn test_dispute_recomputes_invoice() {
        let (store, record) = store_with_finding("order-9");
        let engine = CommissionEngine::new(store.clone(), 0.20);
        let period = billing_period(Utc::now());

        engine
            .record_matches(
                "seller-1",
                &[
                    event(Some("order-9"), None, 100.0),
                    event(Some("order-9"), None, 60.0),
                ],
                &[record],
            )
            .unwrap();
        let invoice = engine.generate_invoice("seller-1", &period).unwrap().unwrap();
        assert_eq!(invoice.subtotal, 160.0);

        let lines = store.matches_for_invoice(invoice.id).unwrap();
        engine.dispute_line(invoice.id, lines[0].id).unwrap();

        let recomputed = store.invoice(invoice.id).unwrap().unwrap();
        assert_eq!(recomputed.subtotal, 60.0);
        assert_eq!(recomputed.commission_amount, 12.0);
        assert_eq!(recomputed.status, InvoiceStatus::Disputed);
    }

    #[test]
    fn test_previous_billing_period() {
        let mid_year = Utc
            .with_ymd_and_hms(2026, 7, 15, 12, 0, 0)
            .unwrap();
        assert_eq!(previous_billing_period(mid_year), "2026-06");

        let january = Utc.with_ymd_and_hms(2026, 1, 3, 0, 0, 0).unwrap();
        assert_eq!(previous_billing_period(january), "2025-12");
    }

    #[test]
    fn test_billing_sweep_invoices_unbilled_sellers() {
        let (store, record) = store_with_finding("order-9");
        let engine = CommissionEngine::new(store.clone(), 0.20);
        let period = billing_period(Utc::now());

        engine
            .record_matches("seller-1", &[event(Some("order-9"), None, 100.0)], &[record])
            .unwrap();

        let (generated, finalized) = engine.run_billing_sweep(&period).unwrap();
        assert_eq!(generated, 1);
        assert_eq!(finalized, 0); // dispute window still open

        // Nothing left to bill on the next sweep.
        let (generated, _) = engine.run_billing_sweep(&period).unwrap();
        assert_eq!(generated, 0);
    }

    #[test]
    fn test_finalize_waits_for_dispute_window() {
        let (store, record) = store_with_finding("order-9");
        let engine = CommissionEngine::new(store.clone(), 0.20);
        let period = billing_period(Utc::now());

        engine
            .record_matches("seller-1", &[event(Some("order-9"), None, 100.0)], &[record])
            .unwrap();
        let invoice = engine.generate_invoice("seller-1", &period).unwrap().unwrap();

        // Window still open: the engine refuses.
        assert!(engine.finalize_invoice(invoice.id).is_err());

        // Store-level finalization flips the lines to invoiced.
        store.finalize_invoice(invoice.id).unwrap();
        let lines = store.matches_for_invoice(invoice.id).unwrap();
        assert!(lines.iter().all(|m| m.status == MatchStatus::Invoiced));
    }
}
