//! Relational storage owned by the core.
//!
//! One SQLite database holds detection results, thresholds, whitelist,
//! ingestion snapshots (written upstream, read here), reimbursement matches,
//! and commission invoices. WAL mode, prepared statements, and a
//! coarse-grained per-connection lock, sized for per-seller write volumes.

mod context_cache;
mod results;

pub use context_cache::ContextCache;
pub use results::{AnomalyRecord, InsertOutcome, PendingClaim, ResultsStore};
