use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::{debug, warn};

use crate::error::DetectionError;
use crate::models::{
    Anomaly, AnomalyStatus, CommissionInvoice, InvoiceStatus, MatchStatus, ReimbursementMatch,
    RuleContext, RuleType, Severity, Threshold, ThresholdOperator, WhitelistItem, WhitelistScope,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS detection_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    seller_id TEXT NOT NULL,
    sync_id TEXT NOT NULL,
    anomaly_type TEXT NOT NULL,
    dedupe_hash TEXT NOT NULL,
    severity TEXT NOT NULL,
    score REAL NOT NULL,
    summary TEXT NOT NULL,
    evidence_json TEXT NOT NULL,
    related_event_ids TEXT NOT NULL DEFAULT '[]',
    blob_url TEXT,
    estimated_value REAL NOT NULL DEFAULT 0,
    discovery_date INTEGER NOT NULL,
    deadline_date INTEGER,
    days_remaining INTEGER,
    expired INTEGER NOT NULL DEFAULT 0,
    alert_sent INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(seller_id, sync_id, anomaly_type, dedupe_hash)
);

CREATE INDEX IF NOT EXISTS idx_results_seller_status
    ON detection_results(seller_id, status, discovery_date);

CREATE TABLE IF NOT EXISTS detection_thresholds (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_type TEXT NOT NULL,
    seller_id TEXT,
    operator TEXT NOT NULL,
    value REAL NOT NULL,
    active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS detection_whitelist (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    seller_id TEXT NOT NULL,
    scope TEXT NOT NULL,
    value TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1
);

-- Written by the upstream ingestion system; read-only for the core.
CREATE TABLE IF NOT EXISTS sync_snapshots (
    seller_id TEXT NOT NULL,
    sync_id TEXT NOT NULL,
    snapshot_json TEXT NOT NULL,
    captured_at INTEGER NOT NULL,
    PRIMARY KEY (seller_id, sync_id)
);

CREATE TABLE IF NOT EXISTS reimbursement_matches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    seller_id TEXT NOT NULL,
    order_id TEXT,
    case_id TEXT,
    anomaly_id INTEGER,
    amount REAL NOT NULL,
    period TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'confirmed',
    invoice_id INTEGER,
    matched_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_matches_billing
    ON reimbursement_matches(seller_id, period, status);

CREATE TABLE IF NOT EXISTS margin_invoices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    seller_id TEXT NOT NULL,
    invoice_number INTEGER NOT NULL,
    period TEXT NOT NULL,
    subtotal REAL NOT NULL,
    commission_rate REAL NOT NULL,
    commission_amount REAL NOT NULL,
    status TEXT NOT NULL DEFAULT 'open',
    generated_at INTEGER NOT NULL,
    dispute_deadline INTEGER NOT NULL,
    finalized_at INTEGER,
    UNIQUE(seller_id, invoice_number)
);
"#;

/// Result of an anomaly insert: a replay of an already-persisted finding is a
/// no-op, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    DuplicateReplay,
}

/// A stored anomaly row.
#[derive(Debug, Clone)]
pub struct AnomalyRecord {
    pub id: i64,
    pub anomaly: Anomaly,
    pub blob_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The slice of a pending anomaly the policy tracker needs.
#[derive(Debug, Clone)]
pub struct PendingClaim {
    pub id: i64,
    pub rule_type: RuleType,
    pub discovery_date: DateTime<Utc>,
    pub alert_sent: bool,
    pub estimated_value: f64,
    pub summary: String,
}

pub struct ResultsStore {
    conn: Mutex<Connection>,
}

impl ResultsStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DetectionError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store (for testing).
    pub fn in_memory() -> Result<Self, DetectionError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ------------------------------------------------------------------
    // detection_results
    // ------------------------------------------------------------------

    /// Persist a finalized anomaly. A duplicate
    /// (seller, sync, anomaly_type, dedupe_hash) is an idempotent replay.
    pub fn insert_anomaly(
        &self,
        anomaly: &Anomaly,
        blob_url: Option<&str>,
    ) -> Result<InsertOutcome, DetectionError> {
        let conn = self.conn.lock();
        let now = Utc::now().timestamp_millis();

        let result = conn.execute(
            "INSERT INTO detection_results
             (seller_id, sync_id, anomaly_type, dedupe_hash, severity, score, summary,
              evidence_json, related_event_ids, blob_url, estimated_value, discovery_date,
              deadline_date, days_remaining, expired, alert_sent, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?18)",
            params![
                anomaly.seller_id,
                anomaly.sync_id,
                anomaly.rule_type.as_str(),
                anomaly.dedupe_hash,
                anomaly.severity.as_str(),
                anomaly.score,
                anomaly.summary,
                anomaly.evidence.to_string(),
                serde_json::to_string(&anomaly.related_event_ids)?,
                blob_url,
                anomaly.estimated_value,
                anomaly.discovery_date.timestamp_millis(),
                anomaly.deadline_date.map(|d| d.timestamp_millis()),
                anomaly.days_remaining,
                anomaly.expired as i64,
                anomaly.alert_sent as i64,
                anomaly.status.as_str(),
                now,
            ],
        );

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted(conn.last_insert_rowid())),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                debug!(
                    seller = %anomaly.seller_id,
                    hash = %anomaly.dedupe_hash,
                    "duplicate anomaly replay, skipping"
                );
                Ok(InsertOutcome::DuplicateReplay)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn anomalies_for_sync(
        &self,
        seller_id: &str,
        sync_id: &str,
    ) -> Result<Vec<AnomalyRecord>, DetectionError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM detection_results WHERE seller_id = ?1 AND sync_id = ?2 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![seller_id, sync_id], Self::row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn pending_claims(&self, seller_id: &str) -> Result<Vec<PendingClaim>, DetectionError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, anomaly_type, discovery_date, alert_sent, estimated_value, summary
             FROM detection_results
             WHERE seller_id = ?1 AND status = 'pending'
             ORDER BY discovery_date ASC",
        )?;
        let rows = stmt.query_map(params![seller_id], |row| {
            let rule: String = row.get(1)?;
            let discovery: i64 = row.get(2)?;
            Ok(PendingClaim {
                id: row.get(0)?,
                rule_type: RuleType::parse(&rule).unwrap_or(RuleType::LostUnits),
                discovery_date: Utc
                    .timestamp_millis_opt(discovery)
                    .single()
                    .unwrap_or_else(Utc::now),
                alert_sent: row.get::<_, i64>(3)? != 0,
                estimated_value: row.get(4)?,
                summary: row.get(5)?,
            })
        })?;
        let mut claims = Vec::new();
        for row in rows {
            claims.push(row?);
        }
        Ok(claims)
    }

    pub fn mark_alert_sent(&self, ids: &[i64]) -> Result<usize, DetectionError> {
        let conn = self.conn.lock();
        let now = Utc::now().timestamp_millis();
        let mut updated = 0;
        for id in ids {
            updated += conn.execute(
                "UPDATE detection_results SET alert_sent = 1, updated_at = ?1 WHERE id = ?2",
                params![now, id],
            )?;
        }
        Ok(updated)
    }

    /// Flip claims to the terminal expired state. Already-terminal rows are
    /// left untouched.
    pub fn mark_expired(&self, ids: &[i64]) -> Result<usize, DetectionError> {
        let conn = self.conn.lock();
        let now = Utc::now().timestamp_millis();
        let mut updated = 0;
        for id in ids {
            updated += conn.execute(
                "UPDATE detection_results
                 SET status = 'expired', expired = 1, updated_at = ?1
                 WHERE id = ?2 AND status NOT IN ('resolved','expired')",
                params![now, id],
            )?;
        }
        Ok(updated)
    }

    /// Status transition with the terminal-state guard. Returns false when the
    /// row is already resolved/expired (or missing).
    pub fn update_status(&self, id: i64, status: AnomalyStatus) -> Result<bool, DetectionError> {
        let conn = self.conn.lock();
        let now = Utc::now().timestamp_millis();
        let rows = conn.execute(
            "UPDATE detection_results SET status = ?1, updated_at = ?2
             WHERE id = ?3 AND status NOT IN ('resolved','expired')",
            params![status.as_str(), now, id],
        )?;
        Ok(rows > 0)
    }

    pub fn sellers_with_pending(&self) -> Result<Vec<String>, DetectionError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT seller_id FROM detection_results WHERE status = 'pending'",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut sellers = Vec::new();
        for row in rows {
            sellers.push(row?);
        }
        Ok(sellers)
    }

    // ------------------------------------------------------------------
    // thresholds / whitelist
    // ------------------------------------------------------------------

    pub fn insert_threshold(&self, threshold: &Threshold) -> Result<i64, DetectionError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO detection_thresholds (rule_type, seller_id, operator, value, active)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                threshold.rule_type.as_str(),
                threshold.seller_id,
                threshold.operator.as_str(),
                threshold.value,
                threshold.active as i64,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_whitelist_item(&self, item: &WhitelistItem) -> Result<i64, DetectionError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO detection_whitelist (seller_id, scope, value, active)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                item.seller_id,
                item.scope.as_str(),
                item.value,
                item.active as i64,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Active thresholds (seller-specific and global) plus the seller's active
    /// whitelist, in insertion order.
    pub fn load_context(&self, seller_id: &str) -> Result<RuleContext, DetectionError> {
        let conn = self.conn.lock();
        let mut ctx = RuleContext::new(seller_id);

        let mut stmt = conn.prepare(
            "SELECT id, rule_type, seller_id, operator, value, active
             FROM detection_thresholds
             WHERE active = 1 AND (seller_id IS NULL OR seller_id = ?1)
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![seller_id], |row| {
            let rule: String = row.get(1)?;
            let op: String = row.get(3)?;
            Ok(Threshold {
                id: Some(row.get(0)?),
                rule_type: RuleType::parse(&rule).unwrap_or(RuleType::LostUnits),
                seller_id: row.get(2)?,
                operator: ThresholdOperator::parse(&op).unwrap_or(ThresholdOperator::Gte),
                value: row.get(4)?,
                active: row.get::<_, i64>(5)? != 0,
            })
        })?;
        for row in rows {
            ctx.thresholds.push(row?);
        }

        let mut stmt = conn.prepare(
            "SELECT id, seller_id, scope, value, active
             FROM detection_whitelist
             WHERE active = 1 AND seller_id = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![seller_id], |row| {
            let scope: String = row.get(2)?;
            Ok(WhitelistItem {
                id: Some(row.get(0)?),
                seller_id: row.get(1)?,
                scope: WhitelistScope::parse(&scope).unwrap_or(WhitelistScope::Sku),
                value: row.get(3)?,
                active: row.get::<_, i64>(4)? != 0,
            })
        })?;
        for row in rows {
            ctx.whitelist.push(row?);
        }

        Ok(ctx)
    }

    // ------------------------------------------------------------------
    // sync snapshots (ingestion-owned; upsert exists for tests and seeding)
    // ------------------------------------------------------------------

    pub fn upsert_snapshot(
        &self,
        seller_id: &str,
        sync_id: &str,
        snapshot: &serde_json::Value,
    ) -> Result<(), DetectionError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sync_snapshots (seller_id, sync_id, snapshot_json, captured_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(seller_id, sync_id) DO UPDATE SET
                 snapshot_json = excluded.snapshot_json,
                 captured_at = excluded.captured_at",
            params![
                seller_id,
                sync_id,
                snapshot.to_string(),
                Utc::now().timestamp_millis()
            ],
        )?;
        Ok(())
    }

    pub fn load_snapshot(
        &self,
        seller_id: &str,
        sync_id: &str,
    ) -> Result<Option<serde_json::Value>, DetectionError> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT snapshot_json FROM sync_snapshots WHERE seller_id = ?1 AND sync_id = ?2",
                params![seller_id, sync_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // reimbursement matches / commission invoices
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn record_match(
        &self,
        seller_id: &str,
        order_id: Option<&str>,
        case_id: Option<&str>,
        anomaly_id: Option<i64>,
        amount: f64,
        period: &str,
        matched_at: DateTime<Utc>,
    ) -> Result<i64, DetectionError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO reimbursement_matches
             (seller_id, order_id, case_id, anomaly_id, amount, period, status, matched_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'confirmed', ?7)",
            params![
                seller_id,
                order_id,
                case_id,
                anomaly_id,
                amount,
                period,
                matched_at.timestamp_millis()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Confirmed matches in a billing period not yet attached to an invoice.
    pub fn unbilled_matches(
        &self,
        seller_id: &str,
        period: &str,
    ) -> Result<Vec<ReimbursementMatch>, DetectionError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM reimbursement_matches
             WHERE seller_id = ?1 AND period = ?2 AND status = 'confirmed' AND invoice_id IS NULL
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![seller_id, period], Self::row_to_match)?;
        let mut matches = Vec::new();
        for row in rows {
            matches.push(row?);
        }
        Ok(matches)
    }

    pub fn matches_for_invoice(
        &self,
        invoice_id: i64,
    ) -> Result<Vec<ReimbursementMatch>, DetectionError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM reimbursement_matches WHERE invoice_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![invoice_id], Self::row_to_match)?;
        let mut matches = Vec::new();
        for row in rows {
            matches.push(row?);
        }
        Ok(matches)
    }

    pub fn attach_matches(&self, invoice_id: i64, match_ids: &[i64]) -> Result<(), DetectionError> {
        let conn = self.conn.lock();
        for id in match_ids {
            conn.execute(
                "UPDATE reimbursement_matches SET invoice_id = ?1 WHERE id = ?2",
                params![invoice_id, id],
            )?;
        }
        Ok(())
    }

    pub fn set_match_status(
        &self,
        match_id: i64,
        status: MatchStatus,
    ) -> Result<bool, DetectionError> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE reimbursement_matches SET status = ?1 WHERE id = ?2",
            params![status.as_str(), match_id],
        )?;
        Ok(rows > 0)
    }

    pub fn sellers_with_unbilled_matches(
        &self,
        period: &str,
    ) -> Result<Vec<String>, DetectionError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT seller_id FROM reimbursement_matches
             WHERE period = ?1 AND status = 'confirmed' AND invoice_id IS NULL",
        )?;
        let rows = stmt.query_map(params![period], |row| row.get::<_, String>(0))?;
        let mut sellers = Vec::new();
        for row in rows {
            sellers.push(row?);
        }
        Ok(sellers)
    }

    /// Open (or disputed) invoices whose dispute window has closed.
    pub fn invoices_due_finalization(&self) -> Result<Vec<i64>, DetectionError> {
        let conn = self.conn.lock();
        let now = Utc::now().timestamp_millis();
        let mut stmt = conn.prepare(
            "SELECT id FROM margin_invoices
             WHERE status IN ('open','disputed') AND dispute_deadline < ?1",
        )?;
        let rows = stmt.query_map(params![now], |row| row.get::<_, i64>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub fn next_invoice_number(&self, seller_id: &str) -> Result<i64, DetectionError> {
        let conn = self.conn.lock();
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(invoice_number) FROM margin_invoices WHERE seller_id = ?1",
            params![seller_id],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0) + 1)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_invoice(
        &self,
        seller_id: &str,
        invoice_number: i64,
        period: &str,
        subtotal: f64,
        commission_rate: f64,
        commission_amount: f64,
        dispute_deadline: DateTime<Utc>,
    ) -> Result<i64, DetectionError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO margin_invoices
             (seller_id, invoice_number, period, subtotal, commission_rate, commission_amount,
              status, generated_at, dispute_deadline)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'open', ?7, ?8)",
            params![
                seller_id,
                invoice_number,
                period,
                subtotal,
                commission_rate,
                commission_amount,
                Utc::now().timestamp_millis(),
                dispute_deadline.timestamp_millis()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn invoice(&self, id: i64) -> Result<Option<CommissionInvoice>, DetectionError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM margin_invoices WHERE id = ?1",
            params![id],
            Self::row_to_invoice,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn update_invoice_totals(
        &self,
        id: i64,
        subtotal: f64,
        commission_amount: f64,
        status: InvoiceStatus,
    ) -> Result<(), DetectionError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE margin_invoices
             SET subtotal = ?1, commission_amount = ?2, status = ?3
             WHERE id = ?4",
            params![subtotal, commission_amount, status.as_str(), id],
        )?;
        Ok(())
    }

    /// Finalize an invoice and flip its confirmed lines to invoiced.
    pub fn finalize_invoice(&self, id: i64) -> Result<bool, DetectionError> {
        let conn = self.conn.lock();
        let now = Utc::now().timestamp_millis();
        let rows = conn.execute(
            "UPDATE margin_invoices
             SET status = 'finalized', finalized_at = ?1
             WHERE id = ?2 AND status != 'finalized'",
            params![now, id],
        )?;
        if rows == 0 {
            return Ok(false);
        }
        conn.execute(
            "UPDATE reimbursement_matches SET status = 'invoiced'
             WHERE invoice_id = ?1 AND status = 'confirmed'",
            params![id],
        )?;
        Ok(true)
    }

    // ------------------------------------------------------------------

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<AnomalyRecord> {
        let millis = |v: Option<i64>| -> Option<DateTime<Utc>> {
            v.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        };
        let rule: String = row.get("anomaly_type")?;
        let severity: String = row.get("severity")?;
        let status: String = row.get("status")?;
        let evidence: String = row.get("evidence_json")?;
        let related: String = row.get("related_event_ids")?;
        let discovery: i64 = row.get("discovery_date")?;
        let created: i64 = row.get("created_at")?;

        Ok(AnomalyRecord {
            id: row.get("id")?,
            anomaly: Anomaly {
                seller_id: row.get("seller_id")?,
                sync_id: row.get("sync_id")?,
                rule_type: RuleType::parse(&rule).unwrap_or(RuleType::LostUnits),
                severity: Severity::parse(&severity).unwrap_or(Severity::Low),
                score: row.get("score")?,
                summary: row.get("summary")?,
                evidence: serde_json::from_str(&evidence).unwrap_or(serde_json::Value::Null),
                related_event_ids: serde_json::from_str(&related).unwrap_or_default(),
                dedupe_hash: row.get("dedupe_hash")?,
                estimated_value: row.get("estimated_value")?,
                discovery_date: millis(Some(discovery)).unwrap_or_else(Utc::now),
                deadline_date: millis(row.get("deadline_date")?),
                days_remaining: row.get("days_remaining")?,
                expired: row.get::<_, i64>("expired")? != 0,
                alert_sent: row.get::<_, i64>("alert_sent")? != 0,
                status: AnomalyStatus::parse(&status).unwrap_or(AnomalyStatus::Pending),
            },
            blob_url: row.get("blob_url")?,
            created_at: millis(Some(created)).unwrap_or_else(Utc::now),
        })
    }

    fn row_to_match(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReimbursementMatch> {
        let status: String = row.get("status")?;
        let matched: i64 = row.get("matched_at")?;
        Ok(ReimbursementMatch {
            id: row.get("id")?,
            seller_id: row.get("seller_id")?,
            order_id: row.get("order_id")?,
            case_id: row.get("case_id")?,
            anomaly_id: row.get("anomaly_id")?,
            amount: row.get("amount")?,
            period: row.get("period")?,
            status: MatchStatus::parse(&status).unwrap_or(MatchStatus::Confirmed),
            invoice_id: row.get("invoice_id")?,
            matched_at: Utc
                .timestamp_millis_opt(matched)
                .single()
                .unwrap_or_else(Utc::now),
        })
    }

    fn row_to_invoice(row: &rusqlite::Row<'_>) -> rusqlite::Result<CommissionInvoice> {
        let millis = |v: Option<i64>| -> Option<DateTime<Utc>> {
            v.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        };
        let status: String = row.get("status")?;
        let generated: i64 = row.get("generated_at")?;
        let deadline: i64 = row.get("dispute_deadline")?;
        Ok(CommissionInvoice {
            id: row.get("id")?,
            seller_id: row.get("seller_id")?,
            invoice_number: row.get("invoice_number")?,
            period: row.get("period")?,
            subtotal: row.get("subtotal")?,
            commission_rate: row.get("commission_rate")?,
            commission_amount: row.get("commission_amount")?,
            status: InvoiceStatus::parse(&status).unwrap_or(InvoiceStatus::Open),
            generated_at: millis(Some(generated)).unwrap_or_else(Utc::now),
            dispute_deadline: millis(Some(deadline)).unwrap_or_else(Utc::now),
            finalized_at: millis(row.get("finalized_at")?),
        })
    }

    /// Backing-store probe shared with the queue-health endpoint.
    pub fn healthy(&self) -> bool {
        let conn = self.conn.lock();
        let ok = conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok();
        if !ok {
            warn!("results store health probe failed");
        }
        ok
    }
}
