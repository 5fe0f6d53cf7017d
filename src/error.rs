//! Error taxonomy for the detection pipeline.
//!
//! Queue, evidence, and storage code return these sums instead of throwing;
//! the orchestrator converts between them at the persistence boundary and
//! `anyhow` takes over at the application edge.

use std::fmt;

/// Every failure class the core distinguishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectionError {
    /// Input payload missing or type-wrong. Never retried; client fault.
    Validation(String),
    /// Bearer/cookie absent or unverifiable. Terminal on SSE.
    Auth(String),
    /// Blob upload network failure, queue backend unreachable. Retried by the
    /// queue's attempt policy.
    TransientExternal(String),
    /// Persistent database refusal. Duplicate detection_results inserts are
    /// downgraded to a no-op before this is raised.
    Storage(String),
    /// Processing state exceeded the stall timeout.
    StalledJob { job_id: String },
    /// A rule panicked; caught at the orchestrator boundary.
    RuleBug { rule: String, message: String },
    /// Filing-packet handoff failed. Logged, never fails the detection job.
    Downstream(String),
    /// Cooperative cancellation observed at an I/O point.
    Cancelled,
}

impl DetectionError {
    /// Short machine-readable code, used in SSE `error` payloads.
    pub fn code(&self) -> &'static str {
        match self {
            DetectionError::Validation(_) => "validation_error",
            DetectionError::Auth(_) => "auth_error",
            DetectionError::TransientExternal(_) => "transient_external",
            DetectionError::Storage(_) => "storage_error",
            DetectionError::StalledJob { .. } => "stalled_job",
            DetectionError::RuleBug { .. } => "rule_bug",
            DetectionError::Downstream(_) => "downstream_error",
            DetectionError::Cancelled => "cancelled",
        }
    }

    /// Whether the queue's retry policy should get another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DetectionError::TransientExternal(_) | DetectionError::StalledJob { .. }
        )
    }
}

impl fmt::Display for DetectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionError::Validation(msg) => write!(f, "validation error: {msg}"),
            DetectionError::Auth(msg) => write!(f, "auth error: {msg}"),
            DetectionError::TransientExternal(msg) => write!(f, "transient external error: {msg}"),
            DetectionError::Storage(msg) => write!(f, "storage error: {msg}"),
            DetectionError::StalledJob { job_id } => {
                write!(f, "job {job_id} stalled in processing")
            }
            DetectionError::RuleBug { rule, message } => {
                write!(f, "rule {rule} failed: {message}")
            }
            DetectionError::Downstream(msg) => write!(f, "downstream handoff failed: {msg}"),
            DetectionError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for DetectionError {}

impl From<rusqlite::Error> for DetectionError {
    fn from(e: rusqlite::Error) -> Self {
        DetectionError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for DetectionError {
    fn from(e: serde_json::Error) -> Self {
        DetectionError::Validation(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DetectionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(DetectionError::Cancelled.code(), "cancelled");
        assert_eq!(
            DetectionError::Validation("x".into()).code(),
            "validation_error"
        );
        assert_eq!(
            DetectionError::RuleBug {
                rule: "lost_units".into(),
                message: "boom".into()
            }
            .code(),
            "rule_bug"
        );
    }

    #[test]
    fn test_retryability() {
        assert!(DetectionError::TransientExternal("net".into()).is_retryable());
        assert!(!DetectionError::Validation("bad".into()).is_retryable());
        assert!(!DetectionError::Cancelled.is_retryable());
    }
}
