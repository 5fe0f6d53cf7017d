//! Deadline math and alert leveling.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::models::RuleType;
use crate::policy::holidays::us_federal_holidays;
use crate::storage::ResultsStore;

/// Filing claim categories with marketplace policy windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimType {
    LostInventory,
    DamagedInventory,
    InboundShipment,
    FeeOvercharge,
    CustomerReturn,
    RemovalOrder,
    AtozClaim,
    Chargeback,
    General,
}

impl ClaimType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimType::LostInventory => "lost_inventory",
            ClaimType::DamagedInventory => "damaged_inventory",
            ClaimType::InboundShipment => "inbound_shipment",
            ClaimType::FeeOvercharge => "fee_overcharge",
            ClaimType::CustomerReturn => "customer_return",
            ClaimType::RemovalOrder => "removal_order",
            ClaimType::AtozClaim => "atoz_claim",
            ClaimType::Chargeback => "chargeback",
            ClaimType::General => "general",
        }
    }

    /// Which filing window applies to a detection rule's findings.
    pub fn for_rule(rule_type: RuleType) -> Self {
        match rule_type {
            RuleType::LostUnits | RuleType::TransferLoss => ClaimType::LostInventory,
            RuleType::DamagedStock | RuleType::DamagedInventory => ClaimType::DamagedInventory,
            RuleType::OverchargedFees => ClaimType::FeeOvercharge,
            RuleType::MissingRefunds => ClaimType::CustomerReturn,
            RuleType::ClosedCaseAudit | RuleType::SlaBreach => ClaimType::General,
        }
    }
}

/// Per-claim-type window configuration. A data table, editable without
/// touching the arithmetic below.
#[derive(Debug, Clone, Copy)]
pub struct ClaimPolicy {
    pub standard_days: i64,
    pub grace_period_days: i64,
    pub business_days_only: bool,
    pub urgent_threshold_days: i64,
    pub safe_threshold_days: i64,
}

pub fn policy_for(claim_type: ClaimType) -> ClaimPolicy {
    match claim_type {
        ClaimType::LostInventory | ClaimType::DamagedInventory => ClaimPolicy {
            standard_days: 60,
            grace_period_days: 3,
            business_days_only: false,
            urgent_threshold_days: 7,
            safe_threshold_days: 21,
        },
        ClaimType::InboundShipment => ClaimPolicy {
            standard_days: 270,
            grace_period_days: 7,
            business_days_only: false,
            urgent_threshold_days: 14,
            safe_threshold_days: 60,
        },
        ClaimType::FeeOvercharge | ClaimType::RemovalOrder => ClaimPolicy {
            standard_days: 90,
            grace_period_days: 5,
            business_days_only: false,
            urgent_threshold_days: 10,
            safe_threshold_days: 30,
        },
        ClaimType::CustomerReturn => ClaimPolicy {
            standard_days: 45,
            grace_period_days: 2,
            business_days_only: false,
            urgent_threshold_days: 5,
            safe_threshold_days: 15,
        },
        ClaimType::AtozClaim => ClaimPolicy {
            standard_days: 7,
            grace_period_days: 0,
            business_days_only: true,
            urgent_threshold_days: 2,
            safe_threshold_days: 4,
        },
        ClaimType::Chargeback => ClaimPolicy {
            standard_days: 15,
            grace_period_days: 1,
            business_days_only: true,
            urgent_threshold_days: 3,
            safe_threshold_days: 7,
        },
        ClaimType::General => ClaimPolicy {
            standard_days: 60,
            grace_period_days: 3,
            business_days_only: false,
            urgent_threshold_days: 7,
            safe_threshold_days: 21,
        },
    }
}

/// Policy text cited in filing packets.
pub fn policy_citation(claim_type: ClaimType) -> &'static str {
    match claim_type {
        ClaimType::LostInventory => "FBA Inventory Reimbursement Policy — lost inventory, 60-day window",
        ClaimType::DamagedInventory => "FBA Inventory Reimbursement Policy — damaged inventory, 60-day window",
        ClaimType::InboundShipment => "FBA Inbound Shipment Reconciliation — 270-day window",
        ClaimType::FeeOvercharge => "Selling Fees Adjustment Policy — 90-day window",
        ClaimType::CustomerReturn => "Customer Return Reimbursement Policy — 45-day window",
        ClaimType::RemovalOrder => "Removal Order Reimbursement Policy — 90-day window",
        ClaimType::AtozClaim => "A-to-z Guarantee — 7 business day response window",
        ClaimType::Chargeback => "Chargeback Dispute Policy — 15 business day window",
        ClaimType::General => "Seller Support service terms — 60-day window",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilingRecommendation {
    FileNow,
    FileSoon,
    SafeToWait,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Critical,
    Warning,
    Info,
    None,
}

impl AlertLevel {
    pub fn message(&self) -> Option<&'static str> {
        match self {
            AlertLevel::Critical => Some("file immediately"),
            AlertLevel::Warning => Some("prioritize"),
            AlertLevel::Info => Some("deadline approaching"),
            AlertLevel::None => None,
        }
    }
}

/// The computed filing window for one claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyWindow {
    pub claim_type: ClaimType,
    pub discovery_date: DateTime<Utc>,
    pub deadline_date: DateTime<Utc>,
    pub days_remaining: i64,
    pub business_days_remaining: i64,
    pub is_expired: bool,
    pub is_urgent: bool,
    pub is_safe: bool,
    pub grace_period_days: i64,
    pub filing_recommendation: FilingRecommendation,
    pub should_file_by: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimWindowStatus {
    pub claim_id: String,
    pub seller_id: String,
    pub alert_level: AlertLevel,
    pub alert_message: Option<String>,
    pub window: PolicyWindow,
}

/// Pending claims bucketed by how close the deadline is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpiringClaims {
    pub urgent: Vec<ClaimWindowStatus>,
    pub expiring_soon: Vec<ClaimWindowStatus>,
    pub expired: Vec<ClaimWindowStatus>,
    pub safe: Vec<ClaimWindowStatus>,
}

fn is_business_day(date: NaiveDate, holidays: &[NaiveDate]) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !holidays.contains(&date)
}

/// Advance through `days` business days from `start` (exclusive of start).
fn add_business_days(start: NaiveDate, days: i64, holidays: &[NaiveDate]) -> NaiveDate {
    let mut date = start;
    let mut remaining = days;
    while remaining > 0 {
        date += Duration::days(1);
        if is_business_day(date, holidays) {
            remaining -= 1;
        }
    }
    date
}

/// Business days strictly between `from` and `to`.
fn business_days_between(from: NaiveDate, to: NaiveDate, holidays: &[NaiveDate]) -> i64 {
    if to <= from {
        return 0;
    }
    let mut count = 0;
    let mut date = from + Duration::days(1);
    while date <= to {
        if is_business_day(date, holidays) {
            count += 1;
        }
        date += Duration::days(1);
    }
    count
}

fn ceil_days(duration: Duration) -> i64 {
    let secs = duration.num_seconds();
    if secs >= 0 {
        (secs + 86_399) / 86_400
    } else {
        -((-secs) / 86_400)
    }
}

/// Pure window computation at an explicit `now`, so tests pin the clock.
pub fn window_at(
    claim_type: ClaimType,
    discovery_date: DateTime<Utc>,
    now: DateTime<Utc>,
    holidays: &[NaiveDate],
) -> PolicyWindow {
    let policy = policy_for(claim_type);

    let deadline_date = if policy.business_days_only {
        let target = add_business_days(discovery_date.date_naive(), policy.standard_days, holidays);
        discovery_date + Duration::days((target - discovery_date.date_naive()).num_days())
    } else {
        discovery_date + Duration::days(policy.standard_days)
    };

    let days_remaining = ceil_days(deadline_date - now);
    let business_days_remaining =
        business_days_between(now.date_naive(), deadline_date.date_naive(), holidays);

    let is_expired = now > deadline_date;
    let is_urgent = !is_expired && days_remaining <= policy.urgent_threshold_days;
    let is_safe = !is_expired && days_remaining > policy.safe_threshold_days;

    let filing_recommendation = if is_expired {
        FilingRecommendation::Expired
    } else if is_urgent {
        FilingRecommendation::FileNow
    } else if days_remaining <= policy.safe_threshold_days {
        FilingRecommendation::FileSoon
    } else {
        FilingRecommendation::SafeToWait
    };

    let should_file_by = deadline_date - Duration::days(if is_safe { 7 } else { 3 });

    PolicyWindow {
        claim_type,
        discovery_date,
        deadline_date,
        days_remaining,
        business_days_remaining,
        is_expired,
        is_urgent,
        is_safe,
        grace_period_days: policy.grace_period_days,
        filing_recommendation,
        should_file_by,
    }
}

/// Alert ladder over a computed window.
pub fn alert_level(window: &PolicyWindow) -> AlertLevel {
    let policy = policy_for(window.claim_type);
    if window.is_expired {
        AlertLevel::Critical
    } else if window.days_remaining <= policy.urgent_threshold_days {
        AlertLevel::Critical
    } else if window.days_remaining <= policy.safe_threshold_days {
        AlertLevel::Warning
    } else if window.days_remaining <= 30 {
        AlertLevel::Info
    } else {
        AlertLevel::None
    }
}

/// Store-backed tracker: computes windows for pending anomalies and drives
/// expiration alerts.
pub struct PolicyTracker {
    store: Arc<ResultsStore>,
    holidays: Vec<NaiveDate>,
}

impl PolicyTracker {
    pub fn new(store: Arc<ResultsStore>) -> Self {
        Self {
            store,
            holidays: us_federal_holidays(),
        }
    }

    pub fn with_holidays(store: Arc<ResultsStore>, holidays: Vec<NaiveDate>) -> Self {
        Self { store, holidays }
    }

    pub fn calculate_policy_window(
        &self,
        claim_type: ClaimType,
        discovery_date: DateTime<Utc>,
    ) -> PolicyWindow {
        window_at(claim_type, discovery_date, Utc::now(), &self.holidays)
    }

    pub fn status_for(
        &self,
        claim_id: &str,
        seller_id: &str,
        claim_type: ClaimType,
        discovery_date: DateTime<Utc>,
    ) -> ClaimWindowStatus {
        let window = self.calculate_policy_window(claim_type, discovery_date);
        let level = alert_level(&window);
        ClaimWindowStatus {
            claim_id: claim_id.to_string(),
            seller_id: seller_id.to_string(),
            alert_level: level,
            alert_message: level.message().map(str::to_string),
            window,
        }
    }

    /// Scan all pending anomalies for a seller and bucket them by urgency.
    pub fn check_expiring_claims(
        &self,
        seller_id: &str,
    ) -> Result<ExpiringClaims, crate::error::DetectionError> {
        let pending = self.store.pending_claims(seller_id)?;
        let now = Utc::now();
        let mut buckets = ExpiringClaims::default();

        for claim in pending {
            let claim_type = ClaimType::for_rule(claim.rule_type);
            let window = window_at(claim_type, claim.discovery_date, now, &self.holidays);
            let level = alert_level(&window);
            let policy = policy_for(claim_type);

            let status = ClaimWindowStatus {
                claim_id: claim.id.to_string(),
                seller_id: seller_id.to_string(),
                alert_level: level,
                alert_message: level.message().map(str::to_string),
                window,
            };

            if status.window.is_expired {
                buckets.expired.push(status);
            } else if status.window.is_urgent {
                buckets.urgent.push(status);
            } else if status.window.days_remaining <= policy.safe_threshold_days {
                buckets.expiring_soon.push(status);
            } else {
                buckets.safe.push(status);
            }
        }

        buckets
            .urgent
            .sort_by_key(|s| s.window.days_remaining);
        buckets
            .expiring_soon
            .sort_by_key(|s| s.window.days_remaining);

        debug!(
            seller = seller_id,
            urgent = buckets.urgent.len(),
            expiring_soon = buckets.expiring_soon.len(),
            expired = buckets.expired.len(),
            "expiring-claims sweep"
        );

        Ok(buckets)
    }

    /// Mark urgent/expired claims alerted and flip expired ones to terminal.
    /// Returns how many alerts were recorded.
    pub fn send_expiration_alerts(
        &self,
        seller_id: &str,
    ) -> Result<usize, crate::error::DetectionError> {
        let buckets = self.check_expiring_claims(seller_id)?;
        let pending = self.store.pending_claims(seller_id)?;

        let unalerted: Vec<i64> = buckets
            .urgent
            .iter()
            .chain(buckets.expired.iter())
            .filter_map(|s| s.claim_id.parse::<i64>().ok())
            .filter(|id| {
                pending
                    .iter()
                    .find(|c| c.id == *id)
                    .is_some_and(|c| !c.alert_sent)
            })
            .collect();

        let expired_ids: Vec<i64> = buckets
            .expired
            .iter()
            .filter_map(|s| s.claim_id.parse::<i64>().ok())
            .collect();

        if !unalerted.is_empty() {
            self.store.mark_alert_sent(&unalerted)?;
        }
        if !expired_ids.is_empty() {
            self.store.mark_expired(&expired_ids)?;
        }

        if !unalerted.is_empty() || !expired_ids.is_empty() {
            info!(
                seller = seller_id,
                alerts = unalerted.len(),
                expired = expired_ids.len(),
                "⏰ Expiration alerts recorded"
            );
        }

        Ok(unalerted.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        chrono::NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
            .and_utc()
    }

    #[test]
    fn test_calendar_deadline() {
        let discovery = utc(2025, 1, 10);
        let w = window_at(ClaimType::LostInventory, discovery, utc(2025, 1, 20), &[]);
        assert_eq!(w.deadline_date, discovery + Duration::days(60));
        assert_eq!(w.days_remaining, 50);
        assert!(!w.is_expired);
        assert!(w.is_safe);
        assert_eq!(w.filing_recommendation, FilingRecommendation::SafeToWait);
        assert_eq!(w.should_file_by, w.deadline_date - Duration::days(7));
    }

    #[test]
    fn test_business_day_deadline_skips_weekends() {
        // Friday 2025-01-10 + 7 business days = Tuesday 2025-01-21
        // (skipping two weekends), one more with MLK day observed.
        let discovery = utc(2025, 1, 10);
        let holidays = vec![NaiveDate::from_ymd_opt(2025, 1, 20).unwrap()];
        let w = window_at(ClaimType::AtozClaim, discovery, utc(2025, 1, 11), &holidays);
        assert_eq!(
            w.deadline_date.date_naive(),
            NaiveDate::from_ymd_opt(2025, 1, 22).unwrap()
        );
    }

    #[test]
    fn test_expired_window() {
        let discovery = utc(2025, 1, 1);
        let w = window_at(ClaimType::CustomerReturn, discovery, utc(2025, 3, 10), &[]);
        assert!(w.is_expired);
        assert!(w.days_remaining < 0);
        assert_eq!(w.filing_recommendation, FilingRecommendation::Expired);
        assert_eq!(alert_level(&w), AlertLevel::Critical);
    }

    #[test]
    fn test_alert_ladder() {
        let discovery = utc(2025, 1, 1);
        // lost_inventory: deadline Mar 2. urgent<=7, safe<=21.
        let urgent = window_at(ClaimType::LostInventory, discovery, utc(2025, 2, 25), &[]);
        assert!(urgent.is_urgent);
        assert_eq!(alert_level(&urgent), AlertLevel::Critical);
        assert_eq!(urgent.filing_recommendation, FilingRecommendation::FileNow);
        assert_eq!(urgent.should_file_by, urgent.deadline_date - Duration::days(3));

        let warning = window_at(ClaimType::LostInventory, discovery, utc(2025, 2, 15), &[]);
        assert_eq!(alert_level(&warning), AlertLevel::Warning);
        assert_eq!(warning.filing_recommendation, FilingRecommendation::FileSoon);

        let info = window_at(ClaimType::LostInventory, discovery, utc(2025, 2, 1), &[]);
        assert_eq!(alert_level(&info), AlertLevel::Info);

        let none = window_at(ClaimType::InboundShipment, discovery, utc(2025, 1, 5), &[]);
        assert_eq!(alert_level(&none), AlertLevel::None);
    }

    #[test]
    fn test_business_days_remaining_excludes_weekend() {
        // Mon 2025-01-06 -> Fri 2025-01-10 deadline: 4 business days out.
        let discovery = utc(2024, 11, 26); // customer_return 45d -> 2025-01-10
        let w = window_at(ClaimType::CustomerReturn, discovery, utc(2025, 1, 6), &[]);
        assert_eq!(w.deadline_date.date_naive(), NaiveDate::from_ymd_opt(2025, 1, 10).unwrap());
        assert_eq!(w.business_days_remaining, 4);
    }

    #[test]
    fn test_tracker_buckets_and_alerts() {
        use crate::models::{Anomaly, Severity};
        use serde_json::json;

        let store = Arc::new(ResultsStore::in_memory().unwrap());
        let insert = |hash: &str, age_days: i64| {
            let anomaly = Anomaly::new(
                "seller-1",
                "sync-1",
                RuleType::LostUnits, // 60-day window
                Severity::Medium,
                0.7,
                format!("finding {hash}"),
                json!({}),
                hash.to_string(),
                50.0,
            )
            .with_discovery_date(Utc::now() - Duration::days(age_days));
            store.insert_anomaly(&anomaly, None).unwrap();
        };

        insert("urgent-claim", 55); // ~5 days remaining
        insert("safe-claim", 1); // ~59 days remaining
        insert("expired-claim", 70); // 10 days past deadline

        let tracker = PolicyTracker::with_holidays(store.clone(), vec![]);
        let buckets = tracker.check_expiring_claims("seller-1").unwrap();
        assert_eq!(buckets.urgent.len(), 1);
        assert_eq!(buckets.expired.len(), 1);
        assert_eq!(buckets.safe.len(), 1);
        assert!(buckets.expiring_soon.is_empty());
        assert!(buckets.urgent[0].window.days_remaining <= 7);

        // Urgent + expired get alerted, expired flips terminal.
        let alerts = tracker.send_expiration_alerts("seller-1").unwrap();
        assert_eq!(alerts, 2);
        let remaining = store.pending_claims("seller-1").unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining
            .iter()
            .all(|c| c.alert_sent || c.summary.contains("safe-claim")));

        // A second sweep sends nothing new.
        assert_eq!(tracker.send_expiration_alerts("seller-1").unwrap(), 0);
    }

    #[test]
    fn test_rule_to_claim_type_mapping() {
        assert_eq!(ClaimType::for_rule(RuleType::LostUnits), ClaimType::LostInventory);
        assert_eq!(
            ClaimType::for_rule(RuleType::DamagedStock),
            ClaimType::DamagedInventory
        );
        assert_eq!(
            ClaimType::for_rule(RuleType::OverchargedFees),
            ClaimType::FeeOvercharge
        );
        assert_eq!(ClaimType::for_rule(RuleType::SlaBreach), ClaimType::General);
    }
}
