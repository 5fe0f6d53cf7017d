//! Detection Queue
//!
//! SQLite-backed prioritized job queue coordinating per-seller detection runs.
//! Status transitions are atomic under the connection lock; an idempotency key
//! guarantees at most one active job per user (and optional store).
//!
//! Dispatch rules:
//! - CRITICAL > HIGH > NORMAL > LOW, FIFO within a priority.
//! - Above the backpressure threshold only CRITICAL/HIGH jobs dispatch.
//! - At the concurrency cap `next()` returns nothing.
//! - Failures requeue with exponential backoff (5s, 10s, 20s) until
//!   max attempts, stalled jobs are reclassified by the reaper.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{
    DetectionJob, EnqueueRequest, JobPriority, JobStatus, QueueAlerts, QueueMetrics, QueueStats,
};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;
PRAGMA busy_timeout = 5000;

CREATE TABLE IF NOT EXISTS detection_jobs (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    store_id TEXT,
    sync_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    priority INTEGER NOT NULL DEFAULT 1,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    idempotency_key TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    next_attempt_at INTEGER,
    started_at INTEGER
);

-- At most one active job per idempotency key.
CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_active_key
    ON detection_jobs(idempotency_key) WHERE status IN ('pending','processing');

CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_user_sync
    ON detection_jobs(user_id, sync_id);

CREATE INDEX IF NOT EXISTS idx_jobs_dispatch
    ON detection_jobs(status, priority DESC, created_at ASC);
"#;

#[derive(Debug, Clone)]
pub enum QueueError {
    Storage(String),
    NotFound(String),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Storage(msg) => write!(f, "queue storage error: {msg}"),
            QueueError::NotFound(id) => write!(f, "job not found: {id}"),
        }
    }
}

impl std::error::Error for QueueError {}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        QueueError::Storage(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub backpressure_threshold: u64,
    pub max_concurrency: u64,
    pub max_attempts: u32,
    pub base_backoff_secs: u64,
    pub stall_timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backpressure_threshold: 20,
            max_concurrency: 5,
            max_attempts: 3,
            base_backoff_secs: 5,
            stall_timeout_secs: 300,
        }
    }
}

/// Outcome of an enqueue call: duplicates hand back the existing job instead
/// of creating a second one.
#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    Created(DetectionJob),
    Duplicate(DetectionJob),
}

impl EnqueueOutcome {
    pub fn job(&self) -> &DetectionJob {
        match self {
            EnqueueOutcome::Created(j) | EnqueueOutcome::Duplicate(j) => j,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, EnqueueOutcome::Duplicate(_))
    }
}

pub struct DetectionQueue {
    conn: Mutex<Connection>,
    config: QueueConfig,
}

impl DetectionQueue {
    pub fn new<P: AsRef<Path>>(path: P, config: QueueConfig) -> Result<Self, QueueError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            config,
        })
    }

    /// In-memory queue (for testing).
    pub fn in_memory(config: QueueConfig) -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            config,
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueue a detection run. A duplicate of an active (or already recorded)
    /// (user, sync) job returns the existing row untouched.
    pub fn enqueue(&self, req: &EnqueueRequest) -> Result<EnqueueOutcome, QueueError> {
        let conn = self.conn.lock();
        let now = Utc::now().timestamp_millis();
        let id = Uuid::new_v4().to_string();
        let priority = req.priority.unwrap_or(JobPriority::Normal);
        let key = DetectionJob::idempotency_key(&req.user_id, req.store_id.as_deref());

        let inserted = conn.execute(
            "INSERT INTO detection_jobs
             (id, user_id, store_id, sync_id, status, priority, attempts, idempotency_key, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, 0, ?6, ?7, ?7)",
            params![id, req.user_id, req.store_id, req.sync_id, priority.rank(), key, now],
        );

        match inserted {
            Ok(_) => {
                metrics::increment_counter!("recoup_queue_enqueued_total");
                debug!(job = %id, user = %req.user_id, sync = %req.sync_id, "job enqueued");
                let job = Self::fetch(&conn, &id)?
                    .ok_or_else(|| QueueError::NotFound(id.clone()))?;
                Ok(EnqueueOutcome::Created(job))
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                // Active job for this key, or a replay of the same sync.
                let existing = conn
                    .query_row(
                        "SELECT id FROM detection_jobs
                         WHERE (idempotency_key = ?1 AND status IN ('pending','processing'))
                            OR (user_id = ?2 AND sync_id = ?3)
                         LIMIT 1",
                        params![key, req.user_id, req.sync_id],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                let Some(existing_id) = existing else {
                    return Err(QueueError::Storage(
                        "constraint violation without a matching job".to_string(),
                    ));
                };
                let job = Self::fetch(&conn, &existing_id)?
                    .ok_or_else(|| QueueError::NotFound(existing_id))?;
                debug!(job = %job.id, "duplicate enqueue, returning existing job");
                Ok(EnqueueOutcome::Duplicate(job))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Claim the next dispatchable job, if any. Atomically transitions it to
    /// processing.
    pub fn next(&self) -> Result<Option<DetectionJob>, QueueError> {
        let conn = self.conn.lock();
        let now = Utc::now().timestamp_millis();

        let processing: i64 = conn.query_row(
            "SELECT COUNT(*) FROM detection_jobs WHERE status = 'processing'",
            [],
            |row| row.get(0),
        )?;
        if processing >= self.config.max_concurrency as i64 {
            return Ok(None);
        }

        let pending: i64 = conn.query_row(
            "SELECT COUNT(*) FROM detection_jobs WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;

        // Under backpressure only CRITICAL/HIGH dispatch.
        let min_rank = if pending + processing > self.config.backpressure_threshold as i64 {
            JobPriority::High.rank()
        } else {
            JobPriority::Low.rank()
        };

        let candidate = conn
            .query_row(
                "SELECT id FROM detection_jobs
                 WHERE status = 'pending'
                   AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
                   AND priority >= ?2
                 ORDER BY priority DESC, created_at ASC, rowid ASC
                 LIMIT 1",
                params![now, min_rank],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        let Some(id) = candidate else {
            return Ok(None);
        };

        conn.execute(
            "UPDATE detection_jobs
             SET status = 'processing', started_at = ?1, updated_at = ?1
             WHERE id = ?2",
            params![now, id],
        )?;

        metrics::increment_counter!("recoup_queue_dispatched_total");
        Self::fetch(&conn, &id)
    }

    pub fn mark_completed(&self, id: &str) -> Result<(), QueueError> {
        let conn = self.conn.lock();
        let now = Utc::now().timestamp_millis();
        let rows = conn.execute(
            "UPDATE detection_jobs SET status = 'completed', updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        if rows == 0 {
            return Err(QueueError::NotFound(id.to_string()));
        }
        metrics::increment_counter!("recoup_queue_completed_total");
        Ok(())
    }

    /// Record a failure. Requeues with exponential backoff while attempts
    /// remain, otherwise the job lands in the terminal failed state.
    pub fn mark_failed(&self, id: &str, error: &str) -> Result<JobStatus, QueueError> {
        let conn = self.conn.lock();
        let now = Utc::now().timestamp_millis();

        let attempts: u32 = conn
            .query_row(
                "SELECT attempts FROM detection_jobs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        let attempts = attempts + 1;
        let status = if attempts < self.config.max_attempts {
            let backoff_secs = self.config.base_backoff_secs * (1 << (attempts - 1));
            let next_attempt = now + (backoff_secs as i64) * 1000;
            conn.execute(
                "UPDATE detection_jobs
                 SET status = 'pending', attempts = ?1, last_error = ?2,
                     next_attempt_at = ?3, started_at = NULL, updated_at = ?4
                 WHERE id = ?5",
                params![attempts, error, next_attempt, now, id],
            )?;
            debug!(job = %id, attempts, backoff_secs, "job requeued after failure");
            JobStatus::Pending
        } else {
            conn.execute(
                "UPDATE detection_jobs
                 SET status = 'failed', attempts = ?1, last_error = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![attempts, error, now, id],
            )?;
            warn!(job = %id, attempts, error, "job failed terminally");
            metrics::increment_counter!("recoup_queue_failed_total");
            JobStatus::Failed
        };

        Ok(status)
    }

    /// Manual admin retry of a terminally failed job.
    pub fn retry(&self, id: &str) -> Result<bool, QueueError> {
        let conn = self.conn.lock();
        let now = Utc::now().timestamp_millis();
        let rows = conn.execute(
            "UPDATE detection_jobs
             SET status = 'pending', next_attempt_at = NULL, attempts = 0,
                 last_error = NULL, updated_at = ?1
             WHERE id = ?2 AND status = 'failed'",
            params![now, id],
        )?;
        Ok(rows > 0)
    }

    /// Reclassify jobs stuck in processing past the stall timeout. They flow
    /// through the normal failure path, so attempts and backoff still apply.
    pub fn reap_stalled(&self) -> Result<usize, QueueError> {
        let stalled: Vec<String> = {
            let conn = self.conn.lock();
            let cutoff =
                Utc::now().timestamp_millis() - (self.config.stall_timeout_secs as i64) * 1000;
            let mut stmt = conn.prepare(
                "SELECT id FROM detection_jobs
                 WHERE status = 'processing' AND started_at IS NOT NULL AND started_at < ?1",
            )?;
            let ids = stmt
                .query_map(params![cutoff], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        for id in &stalled {
            let error = format!(
                "stalled: processing exceeded {}s",
                self.config.stall_timeout_secs
            );
            self.mark_failed(id, &error)?;
        }

        if !stalled.is_empty() {
            info!(count = stalled.len(), "🧹 Reaped stalled jobs");
        }
        Ok(stalled.len())
    }

    pub fn get(&self, id: &str) -> Result<Option<DetectionJob>, QueueError> {
        let conn = self.conn.lock();
        Self::fetch(&conn, id)
    }

    pub fn jobs(
        &self,
        status: Option<JobStatus>,
        limit: u64,
    ) -> Result<Vec<DetectionJob>, QueueError> {
        let conn = self.conn.lock();
        let limit = limit.min(50) as i64;

        let mut jobs = Vec::new();
        match status {
            Some(s) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM detection_jobs WHERE status = ?1
                     ORDER BY created_at DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![s.as_str(), limit], Self::row_to_job)?;
                for row in rows {
                    jobs.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM detection_jobs ORDER BY created_at DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit], Self::row_to_job)?;
                for row in rows {
                    jobs.push(row?);
                }
            }
        }
        Ok(jobs)
    }

    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        let conn = self.conn.lock();
        let now = Utc::now().timestamp_millis();

        let count = |sql: &str, args: &[&dyn rusqlite::ToSql]| -> Result<u64, QueueError> {
            let n: i64 = conn.query_row(sql, args, |row| row.get(0))?;
            Ok(n.max(0) as u64)
        };

        let delayed = count(
            "SELECT COUNT(*) FROM detection_jobs
             WHERE status = 'pending' AND next_attempt_at IS NOT NULL AND next_attempt_at > ?1",
            &[&now],
        )?;
        let pending = count(
            "SELECT COUNT(*) FROM detection_jobs WHERE status = 'pending'",
            &[],
        )?;
        let active = count(
            "SELECT COUNT(*) FROM detection_jobs WHERE status = 'processing'",
            &[],
        )?;
        let completed = count(
            "SELECT COUNT(*) FROM detection_jobs WHERE status = 'completed'",
            &[],
        )?;
        let failed = count(
            "SELECT COUNT(*) FROM detection_jobs WHERE status = 'failed'",
            &[],
        )?;

        let waiting = pending - delayed;
        let finished = completed + failed;
        let alerts = QueueAlerts {
            high_failure_rate: failed > 0 && failed * 5 >= finished,
            backlog_building: waiting > self.config.backpressure_threshold,
            workers_overloaded: active >= self.config.max_concurrency,
        };
        let degraded =
            alerts.high_failure_rate || alerts.backlog_building || alerts.workers_overloaded;

        metrics::gauge!("recoup_queue_waiting", waiting as f64);
        metrics::gauge!("recoup_queue_active", active as f64);

        Ok(QueueStats {
            status: if degraded { "degraded" } else { "ok" }.to_string(),
            metrics: QueueMetrics {
                waiting,
                active,
                completed,
                failed,
                delayed,
            },
            alerts,
        })
    }

    /// Backing-store probe. When this fails the orchestrator documents inline
    /// processing as the fallback.
    pub fn healthy(&self) -> bool {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }

    fn fetch(conn: &Connection, id: &str) -> Result<Option<DetectionJob>, QueueError> {
        conn.query_row(
            "SELECT * FROM detection_jobs WHERE id = ?1",
            params![id],
            Self::row_to_job,
        )
        .optional()
        .map_err(Into::into)
    }

    fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<DetectionJob> {
        let millis = |v: Option<i64>| -> Option<DateTime<Utc>> {
            v.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        };
        let status: String = row.get("status")?;
        let priority: i64 = row.get("priority")?;
        let created: i64 = row.get("created_at")?;
        let updated: i64 = row.get("updated_at")?;

        Ok(DetectionJob {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            store_id: row.get("store_id")?,
            sync_id: row.get("sync_id")?,
            status: JobStatus::parse(&status).unwrap_or(JobStatus::Pending),
            priority: JobPriority::from_rank(priority),
            attempts: row.get("attempts")?,
            last_error: row.get("last_error")?,
            created_at: millis(Some(created)).unwrap_or_else(Utc::now),
            updated_at: millis(Some(updated)).unwrap_or_else(Utc::now),
            next_attempt_at: millis(row.get("next_attempt_at")?),
            started_at: millis(row.get("started_at")?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> DetectionQueue {
        DetectionQueue::in_memory(QueueConfig::default()).unwrap()
    }

    fn request(user: &str, sync: &str, priority: JobPriority) -> EnqueueRequest {
        EnqueueRequest {
            user_id: user.to_string(),
            store_id: None,
            sync_id: sync.to_string(),
            priority: Some(priority),
        }
    }

    #[test]
    fn test_enqueue_and_claim() {
        let q = queue();
        let outcome = q.enqueue(&request("u1", "y1", JobPriority::Normal)).unwrap();
        assert!(!outcome.is_duplicate());

        let job = q.next().unwrap().expect("job should dispatch");
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.user_id, "u1");
        assert!(job.started_at.is_some());
    }

    #[test]
    fn test_duplicate_enqueue_returns_existing() {
        let q = queue();
        let first = q.enqueue(&request("u1", "y1", JobPriority::Normal)).unwrap();
        let second = q.enqueue(&request("u1", "y2", JobPriority::Normal)).unwrap();
        assert!(second.is_duplicate());
        assert_eq!(first.job().id, second.job().id);

        // Distinct store gets its own key.
        let mut with_store = request("u1", "y3", JobPriority::Normal);
        with_store.store_id = Some("s1".to_string());
        assert!(!q.enqueue(&with_store).unwrap().is_duplicate());
    }

    #[test]
    fn test_priority_order_with_fifo_ties() {
        let q = queue();
        q.enqueue(&request("u1", "y1", JobPriority::Normal)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        q.enqueue(&request("u2", "y2", JobPriority::Critical)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        q.enqueue(&request("u3", "y3", JobPriority::Critical)).unwrap();

        assert_eq!(q.next().unwrap().unwrap().user_id, "u2"); // oldest critical
        assert_eq!(q.next().unwrap().unwrap().user_id, "u3");
        assert_eq!(q.next().unwrap().unwrap().user_id, "u1");
    }

    #[test]
    fn test_backpressure_restricts_to_high_priority() {
        let mut config = QueueConfig::default();
        config.backpressure_threshold = 20;
        config.max_concurrency = 50;
        let q = DetectionQueue::in_memory(config).unwrap();

        for i in 0..20 {
            q.enqueue(&request(&format!("u{i}"), &format!("y{i}"), JobPriority::Normal))
                .unwrap();
        }
        q.enqueue(&request("u-critical", "y-critical", JobPriority::Critical))
            .unwrap();

        // 21 pending > 20: only the critical job may dispatch.
        let job = q.next().unwrap().unwrap();
        assert_eq!(job.user_id, "u-critical");

        // Depth is still 21 (20 pending + 1 processing): no normal dispatch.
        assert!(q.next().unwrap().is_none());

        // Finishing the critical job drops depth to 20: normals flow again.
        q.mark_completed(&job.id).unwrap();
        assert!(q.next().unwrap().is_some());
    }

    #[test]
    fn test_concurrency_cap() {
        let mut config = QueueConfig::default();
        config.max_concurrency = 2;
        let q = DetectionQueue::in_memory(config).unwrap();

        for i in 0..3 {
            q.enqueue(&request(&format!("u{i}"), &format!("y{i}"), JobPriority::Normal))
                .unwrap();
        }

        assert!(q.next().unwrap().is_some());
        assert!(q.next().unwrap().is_some());
        assert!(q.next().unwrap().is_none()); // cap reached
    }

    #[test]
    fn test_retry_backoff_then_terminal_failure() {
        let q = queue();
        q.enqueue(&request("u1", "y1", JobPriority::Normal)).unwrap();
        let job = q.next().unwrap().unwrap();

        // First failure: requeued with a future next_attempt_at.
        assert_eq!(q.mark_failed(&job.id, "boom").unwrap(), JobStatus::Pending);
        let requeued = q.get(&job.id).unwrap().unwrap();
        assert_eq!(requeued.attempts, 1);
        assert!(requeued.next_attempt_at.unwrap() > Utc::now());

        // Backoff delays dispatch.
        assert!(q.next().unwrap().is_none());

        // Second and third failures exhaust the attempts.
        assert_eq!(q.mark_failed(&job.id, "boom").unwrap(), JobStatus::Pending);
        assert_eq!(q.mark_failed(&job.id, "boom").unwrap(), JobStatus::Failed);

        let failed = q.get(&job.id).unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempts, 3);
        assert_eq!(failed.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_admin_retry_resets_failed_job() {
        let q = queue();
        q.enqueue(&request("u1", "y1", JobPriority::Normal)).unwrap();
        let job = q.next().unwrap().unwrap();
        for _ in 0..3 {
            q.mark_failed(&job.id, "boom").unwrap();
        }

        assert!(q.retry(&job.id).unwrap());
        let reset = q.get(&job.id).unwrap().unwrap();
        assert_eq!(reset.status, JobStatus::Pending);
        assert_eq!(reset.attempts, 0);

        // Retry of a non-failed job is a no-op.
        assert!(!q.retry(&job.id).unwrap());
    }

    #[test]
    fn test_stall_reaper_requeues() {
        let mut config = QueueConfig::default();
        config.stall_timeout_secs = 0;
        let q = DetectionQueue::in_memory(config).unwrap();

        q.enqueue(&request("u1", "y1", JobPriority::Normal)).unwrap();
        let job = q.next().unwrap().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(q.reap_stalled().unwrap(), 1);

        let reaped = q.get(&job.id).unwrap().unwrap();
        assert_eq!(reaped.status, JobStatus::Pending);
        assert!(reaped.last_error.unwrap().contains("stalled"));
    }

    #[test]
    fn test_stats_and_alerts() {
        let q = queue();
        for i in 0..3 {
            q.enqueue(&request(&format!("u{i}"), &format!("y{i}"), JobPriority::Normal))
                .unwrap();
        }
        let job = q.next().unwrap().unwrap();
        q.mark_completed(&job.id).unwrap();

        let stats = q.stats().unwrap();
        assert_eq!(stats.metrics.waiting, 2);
        assert_eq!(stats.metrics.active, 0);
        assert_eq!(stats.metrics.completed, 1);
        assert_eq!(stats.status, "ok");
        assert!(!stats.alerts.backlog_building);
    }

    #[test]
    fn test_healthy_probe() {
        assert!(queue().healthy());
    }
}
