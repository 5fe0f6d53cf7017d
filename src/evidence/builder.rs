//! Deterministic evidence builder.

use chrono::Utc;
use serde_json::json;
use std::fmt;
use std::sync::Arc;

use crate::evidence::blob::{BlobError, BlobStore};
use crate::evidence::canonical::{redact, snapshot_hash};
use crate::models::{Anomaly, Threshold, WhitelistItem};
use crate::rules::RulePriority;

#[derive(Debug, Clone)]
pub enum EvidenceError {
    UploadFailed(String),
    Serialization(String),
}

impl fmt::Display for EvidenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvidenceError::UploadFailed(msg) => write!(f, "evidence upload failed: {msg}"),
            EvidenceError::Serialization(msg) => write!(f, "evidence serialization failed: {msg}"),
        }
    }
}

impl std::error::Error for EvidenceError {}

impl From<BlobError> for EvidenceError {
    fn from(e: BlobError) -> Self {
        match e {
            BlobError::UploadFailed(msg) => EvidenceError::UploadFailed(msg),
        }
    }
}

/// Canonical evidence for one anomaly, already uploaded. Immutable once
/// written.
#[derive(Debug, Clone)]
pub struct EvidenceArtifact {
    pub evidence_json: serde_json::Value,
    pub blob_url: String,
    pub dedupe_hash: String,
}

pub struct EvidenceBuilder {
    blob: Arc<dyn BlobStore>,
}

impl EvidenceBuilder {
    pub fn new(blob: Arc<dyn BlobStore>) -> Self {
        Self { blob }
    }

    /// Package and upload evidence for one anomaly.
    ///
    /// The snapshot hash is computed over the canonical serialization before
    /// the document is pretty-printed for storage; the two never mix. The
    /// builder does not retry failed uploads.
    pub async fn build(
        &self,
        anomaly: &Anomaly,
        rule_priority: RulePriority,
        input_snapshot: &serde_json::Value,
        thresholds: &[Threshold],
        whitelist: &[WhitelistItem],
    ) -> Result<EvidenceArtifact, EvidenceError> {
        let input_snapshot_hash = snapshot_hash(input_snapshot);

        let threshold_applied = thresholds.iter().find(|t| {
            t.rule_type == anomaly.rule_type
                && (t.seller_id.as_deref() == Some(anomaly.seller_id.as_str())
                    || t.seller_id.is_none())
        });
        let whitelist_applied = whitelist
            .iter()
            .find(|w| w.active && w.seller_id == anomaly.seller_id);

        let mut input_data = input_snapshot.clone();
        redact(&mut input_data);

        let mut metadata = json!({
            "rule_type": anomaly.rule_type,
            "seller_id": anomaly.seller_id,
            "sync_id": anomaly.sync_id,
            "timestamp": Utc::now(),
            "input_snapshot_hash": input_snapshot_hash,
            "computations": {
                "severity": anomaly.severity,
                "score": anomaly.score,
                "rule_priority": rule_priority,
            },
        });
        if let Some(t) = threshold_applied {
            metadata["threshold_applied"] = serde_json::to_value(t)
                .map_err(|e| EvidenceError::Serialization(e.to_string()))?;
        }
        if let Some(w) = whitelist_applied {
            metadata["whitelist_applied"] = serde_json::to_value(w)
                .map_err(|e| EvidenceError::Serialization(e.to_string()))?;
        }

        let evidence_json = json!({
            "metadata": metadata,
            "anomaly": anomaly,
            "input_data": input_data,
        });

        // Pretty print is storage formatting only; every hash above was taken
        // over the stable serialization.
        let body = serde_json::to_vec_pretty(&evidence_json)
            .map_err(|e| EvidenceError::Serialization(e.to_string()))?;

        let path = format!(
            "evidence/{}/{}/{}/{}.json",
            anomaly.seller_id,
            anomaly.sync_id,
            anomaly.rule_type.as_str(),
            anomaly.dedupe_hash
        );
        let side_metadata = [
            ("seller-id".to_string(), anomaly.seller_id.clone()),
            ("sync-id".to_string(), anomaly.sync_id.clone()),
            ("rule-type".to_string(), anomaly.rule_type.as_str().to_string()),
            ("dedupe-hash".to_string(), anomaly.dedupe_hash.clone()),
        ];

        let blob_url = self
            .blob
            .put(&path, body, "application/json", &side_metadata)
            .await?;

        Ok(EvidenceArtifact {
            evidence_json,
            blob_url,
            dedupe_hash: anomaly.dedupe_hash.clone(),
        })
    }
}
