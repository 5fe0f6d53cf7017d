//! Evidence packaging.
//!
//! Every anomaly is persisted next to a canonical JSON artifact in the blob
//! store. Hashes are computed over a stable serialization before upload, so
//! the same finding always lands at the same content-addressed path.

pub mod blob;
pub mod builder;
pub mod canonical;

pub use blob::{BlobError, BlobStore, FsBlobStore, S3BlobStore};
pub use builder::{EvidenceArtifact, EvidenceBuilder, EvidenceError};
