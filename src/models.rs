use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Detection rule families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    LostUnits,
    DamagedStock,
    OverchargedFees,
    MissingRefunds,
    ClosedCaseAudit,
    DamagedInventory,
    SlaBreach,
    TransferLoss,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::LostUnits => "lost_units",
            RuleType::DamagedStock => "damaged_stock",
            RuleType::OverchargedFees => "overcharged_fees",
            RuleType::MissingRefunds => "missing_refunds",
            RuleType::ClosedCaseAudit => "closed_case_audit",
            RuleType::DamagedInventory => "damaged_inventory",
            RuleType::SlaBreach => "sla_breach",
            RuleType::TransferLoss => "transfer_loss",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "lost_units" => Some(RuleType::LostUnits),
            "damaged_stock" => Some(RuleType::DamagedStock),
            "overcharged_fees" => Some(RuleType::OverchargedFees),
            "missing_refunds" => Some(RuleType::MissingRefunds),
            "closed_case_audit" => Some(RuleType::ClosedCaseAudit),
            "damaged_inventory" => Some(RuleType::DamagedInventory),
            "sla_breach" => Some(RuleType::SlaBreach),
            "transfer_loss" => Some(RuleType::TransferLoss),
            _ => None,
        }
    }
}

/// Anomaly severity. Monotonic in (score, estimated value).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

/// Lifecycle status of a persisted anomaly.
/// Resolved and Expired are terminal; the store refuses further transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyStatus {
    Pending,
    Reviewed,
    Disputed,
    Resolved,
    Expired,
}

impl AnomalyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyStatus::Pending => "pending",
            AnomalyStatus::Reviewed => "reviewed",
            AnomalyStatus::Disputed => "disputed",
            AnomalyStatus::Resolved => "resolved",
            AnomalyStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AnomalyStatus::Pending),
            "reviewed" => Some(AnomalyStatus::Reviewed),
            "disputed" => Some(AnomalyStatus::Disputed),
            "resolved" => Some(AnomalyStatus::Resolved),
            "expired" => Some(AnomalyStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AnomalyStatus::Resolved | AnomalyStatus::Expired)
    }
}

/// A single detection result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub seller_id: String,
    pub sync_id: String,
    pub rule_type: RuleType,
    pub severity: Severity,
    pub score: f64,
    pub summary: String,
    pub evidence: serde_json::Value,
    pub related_event_ids: Vec<String>,
    pub dedupe_hash: String,
    pub estimated_value: f64,
    pub discovery_date: DateTime<Utc>,
    pub deadline_date: Option<DateTime<Utc>>,
    pub days_remaining: Option<i64>,
    pub expired: bool,
    pub alert_sent: bool,
    pub status: AnomalyStatus,
}

impl Anomaly {
    /// A fresh pending anomaly as produced by a rule, before the orchestrator
    /// attaches evidence and deadline metadata.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        seller_id: &str,
        sync_id: &str,
        rule_type: RuleType,
        severity: Severity,
        score: f64,
        summary: String,
        evidence: serde_json::Value,
        dedupe_hash: String,
        estimated_value: f64,
    ) -> Self {
        Self {
            seller_id: seller_id.to_string(),
            sync_id: sync_id.to_string(),
            rule_type,
            severity,
            score,
            summary,
            evidence,
            related_event_ids: Vec::new(),
            dedupe_hash,
            estimated_value,
            discovery_date: Utc::now(),
            deadline_date: None,
            days_remaining: None,
            expired: false,
            alert_sent: false,
            status: AnomalyStatus::Pending,
        }
    }

    pub fn with_related_events(mut self, ids: Vec<String>) -> Self {
        self.related_event_ids = ids;
        self
    }

    pub fn with_discovery_date(mut self, date: DateTime<Utc>) -> Self {
        self.discovery_date = date;
        self
    }
}

/// Comparison operator for detection thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThresholdOperator {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
}

impl ThresholdOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdOperator::Lt => "LT",
            ThresholdOperator::Lte => "LTE",
            ThresholdOperator::Gt => "GT",
            ThresholdOperator::Gte => "GTE",
            ThresholdOperator::Eq => "EQ",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LT" => Some(ThresholdOperator::Lt),
            "LTE" => Some(ThresholdOperator::Lte),
            "GT" => Some(ThresholdOperator::Gt),
            "GTE" => Some(ThresholdOperator::Gte),
            "EQ" => Some(ThresholdOperator::Eq),
            _ => None,
        }
    }
}

/// A detection threshold. `seller_id = None` means global; a seller-specific
/// entry overrides the global one for the same rule type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Threshold {
    pub id: Option<i64>,
    pub rule_type: RuleType,
    pub seller_id: Option<String>,
    pub operator: ThresholdOperator,
    pub value: f64,
    pub active: bool,
}

impl Threshold {
    /// Whether the observed metric trips this threshold.
    ///
    /// LT/LTE express a floor: the rule fires once the metric is no longer
    /// below the bound. GT/GTE express a ceiling crossed upward.
    pub fn triggers(&self, observed: f64) -> bool {
        if !self.active {
            return false;
        }
        match self.operator {
            ThresholdOperator::Lt => observed >= self.value,
            ThresholdOperator::Lte => observed > self.value,
            ThresholdOperator::Gt => observed > self.value,
            ThresholdOperator::Gte => observed >= self.value,
            ThresholdOperator::Eq => (observed - self.value).abs() < f64::EPSILON,
        }
    }
}

/// Scope of a whitelist exemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WhitelistScope {
    Sku,
    Asin,
    Vendor,
    Marketplace,
}

impl WhitelistScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            WhitelistScope::Sku => "SKU",
            WhitelistScope::Asin => "ASIN",
            WhitelistScope::Vendor => "VENDOR",
            WhitelistScope::Marketplace => "MARKETPLACE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SKU" => Some(WhitelistScope::Sku),
            "ASIN" => Some(WhitelistScope::Asin),
            "VENDOR" => Some(WhitelistScope::Vendor),
            "MARKETPLACE" => Some(WhitelistScope::Marketplace),
            _ => None,
        }
    }
}

/// A per-seller exemption: matching items never trigger anomalies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhitelistItem {
    pub id: Option<i64>,
    pub seller_id: String,
    pub scope: WhitelistScope,
    pub value: String,
    pub active: bool,
}

/// Thresholds and whitelist applicable to one seller's detection pass.
#[derive(Debug, Clone, Default)]
pub struct RuleContext {
    pub seller_id: String,
    pub thresholds: Vec<Threshold>,
    pub whitelist: Vec<WhitelistItem>,
}

impl RuleContext {
    pub fn new(seller_id: &str) -> Self {
        Self {
            seller_id: seller_id.to_string(),
            thresholds: Vec::new(),
            whitelist: Vec::new(),
        }
    }

    /// Active thresholds for a rule type. Seller-specific entries override
    /// global ones: when at least one seller-scoped threshold exists, global
    /// thresholds for the same rule type are not consulted.
    pub fn thresholds_for(&self, rule_type: RuleType) -> Vec<&Threshold> {
        let active: Vec<&Threshold> = self
            .thresholds
            .iter()
            .filter(|t| t.active && t.rule_type == rule_type)
            .collect();

        let seller_scoped: Vec<&Threshold> = active
            .iter()
            .copied()
            .filter(|t| t.seller_id.as_deref() == Some(self.seller_id.as_str()))
            .collect();

        if !seller_scoped.is_empty() {
            seller_scoped
        } else {
            active
                .into_iter()
                .filter(|t| t.seller_id.is_none())
                .collect()
        }
    }
}

/// Queue priority. Ordering: Critical > High > Normal > Low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl JobPriority {
    pub fn rank(&self) -> i64 {
        match self {
            JobPriority::Low => 0,
            JobPriority::Normal => 1,
            JobPriority::High => 2,
            JobPriority::Critical => 3,
        }
    }

    pub fn from_rank(rank: i64) -> Self {
        match rank {
            0 => JobPriority::Low,
            1 => JobPriority::Normal,
            2 => JobPriority::High,
            _ => JobPriority::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
            JobPriority::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(JobPriority::Low),
            "normal" => Some(JobPriority::Normal),
            "high" => Some(JobPriority::High),
            "critical" => Some(JobPriority::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// A queued detection run for one (seller, sync) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionJob {
    pub id: String,
    pub user_id: String,
    pub store_id: Option<String>,
    pub sync_id: String,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
}

impl DetectionJob {
    /// At-most-one active job per user (and optional store).
    pub fn idempotency_key(user_id: &str, store_id: Option<&str>) -> String {
        match store_id {
            Some(store) => format!("sync-{user_id}-{store}"),
            None => format!("sync-{user_id}"),
        }
    }
}

/// Request to enqueue a detection run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub user_id: String,
    #[serde(default)]
    pub store_id: Option<String>,
    pub sync_id: String,
    #[serde(default)]
    pub priority: Option<JobPriority>,
}

/// Queue depth metrics, shaped for the admin API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueAlerts {
    pub high_failure_rate: bool,
    pub backlog_building: bool,
    pub workers_overloaded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub status: String,
    pub metrics: QueueMetrics,
    pub alerts: QueueAlerts,
}

/// Structured bundle handed to the downstream claim-filer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilingPacket {
    pub case_id: Option<String>,
    pub anomaly_type: String,
    pub key_dates: serde_json::Value,
    pub policy_citation: String,
    pub expected_value: f64,
    pub talking_points: Vec<String>,
    pub suggested_attachments: Vec<String>,
}

/// Lifecycle of a reimbursement match in the commission pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Confirmed,
    Invoiced,
    Disputed,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Confirmed => "confirmed",
            MatchStatus::Invoiced => "invoiced",
            MatchStatus::Disputed => "disputed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "confirmed" => Some(MatchStatus::Confirmed),
            "invoiced" => Some(MatchStatus::Invoiced),
            "disputed" => Some(MatchStatus::Disputed),
            _ => None,
        }
    }
}

/// A marketplace payout matched back to a claim we surfaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReimbursementMatch {
    pub id: i64,
    pub seller_id: String,
    pub order_id: Option<String>,
    pub case_id: Option<String>,
    pub anomaly_id: Option<i64>,
    pub amount: f64,
    /// Billing period, `YYYY-MM`.
    pub period: String,
    pub status: MatchStatus,
    pub invoice_id: Option<i64>,
    pub matched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Open,
    Finalized,
    Disputed,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Open => "open",
            InvoiceStatus::Finalized => "finalized",
            InvoiceStatus::Disputed => "disputed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(InvoiceStatus::Open),
            "finalized" => Some(InvoiceStatus::Finalized),
            "disputed" => Some(InvoiceStatus::Disputed),
            _ => None,
        }
    }
}

/// One billing period's commission invoice for a seller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommissionInvoice {
    pub id: i64,
    pub seller_id: String,
    /// Monotonically increasing per seller.
    pub invoice_number: i64,
    pub period: String,
    pub subtotal: f64,
    pub commission_rate: f64,
    pub commission_amount: f64,
    pub status: InvoiceStatus,
    pub generated_at: DateTime<Utc>,
    pub dispute_deadline: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub jwt_secret: String,
    pub blob_bucket: Option<String>,
    pub blob_local_root: String,
    pub sse_allowed_origins: Vec<String>,
    pub sse_demo_mode: bool,
    pub commission_rate: f64,
    pub backpressure_threshold: u64,
    pub max_concurrency: u64,
    pub max_attempts: u32,
    pub downstream_filing_url: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path = std::env::var("DB_PATH").unwrap_or_else(|_| "./recoup.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .unwrap_or(3000);

        let jwt_secret = std::env::var("JWT_SECRET")
            .unwrap_or_else(|_| "dev-secret-change-in-production-minimum-32-characters".to_string());

        let blob_bucket = std::env::var("BLOB_BUCKET").ok().filter(|s| !s.is_empty());

        let blob_local_root =
            std::env::var("BLOB_LOCAL_ROOT").unwrap_or_else(|_| "./evidence-store".to_string());

        let sse_allowed_origins = std::env::var("SSE_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://localhost:5173".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let sse_demo_mode = std::env::var("SSE_DEMO_MODE")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(false);

        let commission_rate = std::env::var("COMMISSION_RATE")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|r| (0.0..=1.0).contains(r))
            .unwrap_or(0.20);

        let backpressure_threshold = std::env::var("QUEUE_BACKPRESSURE_THRESHOLD")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(20);

        let max_concurrency = std::env::var("MAX_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(5);

        let max_attempts = std::env::var("QUEUE_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|&v| v > 0)
            .unwrap_or(3);

        let downstream_filing_url = std::env::var("DOWNSTREAM_FILING_URL")
            .ok()
            .filter(|s| !s.is_empty());

        Ok(Self {
            database_path,
            port,
            jwt_secret,
            blob_bucket,
            blob_local_root,
            sse_allowed_origins,
            sse_demo_mode,
            commission_rate,
            backpressure_threshold,
            max_concurrency,
            max_attempts,
            downstream_filing_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_lt_polarity() {
        let t = Threshold {
            id: None,
            rule_type: RuleType::LostUnits,
            seller_id: None,
            operator: ThresholdOperator::Lt,
            value: 0.01,
            active: true,
        };
        // LT is a floor: firing means the metric is NOT below the bound.
        assert!(!t.triggers(0.005));
        assert!(t.triggers(0.01));
        assert!(t.triggers(0.5));
    }

    #[test]
    fn test_inactive_threshold_never_triggers() {
        let t = Threshold {
            id: None,
            rule_type: RuleType::LostUnits,
            seller_id: None,
            operator: ThresholdOperator::Gte,
            value: 1.0,
            active: false,
        };
        assert!(!t.triggers(100.0));
    }

    #[test]
    fn test_seller_threshold_overrides_global() {
        let mut ctx = RuleContext::new("seller-1");
        ctx.thresholds = vec![
            Threshold {
                id: None,
                rule_type: RuleType::LostUnits,
                seller_id: None,
                operator: ThresholdOperator::Lt,
                value: 0.01,
                active: true,
            },
            Threshold {
                id: None,
                rule_type: RuleType::LostUnits,
                seller_id: Some("seller-1".to_string()),
                operator: ThresholdOperator::Lt,
                value: 0.05,
                active: true,
            },
        ];

        let applicable = ctx.thresholds_for(RuleType::LostUnits);
        assert_eq!(applicable.len(), 1);
        assert_eq!(applicable[0].value, 0.05);
        assert_eq!(applicable[0].seller_id.as_deref(), Some("seller-1"));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(JobPriority::Critical > JobPriority::High);
        assert!(JobPriority::High > JobPriority::Normal);
        assert!(JobPriority::Normal > JobPriority::Low);
        assert_eq!(
            JobPriority::from_rank(JobPriority::High.rank()),
            JobPriority::High
        );
    }

    #[test]
    fn test_idempotency_key() {
        assert_eq!(DetectionJob::idempotency_key("u1", None), "sync-u1");
        assert_eq!(DetectionJob::idempotency_key("u1", Some("s9")), "sync-u1-s9");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(AnomalyStatus::Resolved.is_terminal());
        assert!(AnomalyStatus::Expired.is_terminal());
        assert!(!AnomalyStatus::Pending.is_terminal());
        assert!(!AnomalyStatus::Disputed.is_terminal());
    }
}
