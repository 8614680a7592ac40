//! Error taxonomy of the attribution engine.
//!
//! Only [`ScanError::CaptureUnreadable`] fails a whole run; every other
//! variant is a per-creative soft error that ends up as one diagnostic row.

use std::path::PathBuf;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ScanError {
    #[error("Capture unreadable: {}: {reason}", path.display())]
    CaptureUnreadable { path: PathBuf, reason: String },

    #[error("No requests found as source for {tld} content_id={content_id}")]
    CorrelationMiss { tld: String, content_id: String },

    #[error("{network} decode failed: {reason}")]
    DecodeFailure { network: String, reason: String },

    #[error("Cipher decode failed: {0}")]
    CryptoDecodeFailure(String),

    #[error("Multiple advertiser ids found: {}", ids.join(", "))]
    AmbiguousAttribution { ids: Vec<String> },

    #[error("Incorrect advertiser id, identified publisher {store_id} as advertiser")]
    SelfAttribution { store_id: String },

    #[error("{0}")]
    Unattributed(String),

    #[error("Storage failure: {0}")]
    StorageFailure(String),
}

impl ScanError {
    pub fn decode(network: &str, reason: impl Into<String>) -> Self {
        ScanError::DecodeFailure {
            network: network.to_string(),
            reason: reason.into(),
        }
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        ScanError::StorageFailure(format!("{err:#}"))
    }

    /// Short machine-friendly name of the variant, used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            ScanError::CaptureUnreadable { .. } => "capture_unreadable",
            ScanError::CorrelationMiss { .. } => "correlation_miss",
            ScanError::DecodeFailure { .. } => "decode_failure",
            ScanError::CryptoDecodeFailure(_) => "crypto_decode_failure",
            ScanError::AmbiguousAttribution { .. } => "ambiguous_attribution",
            ScanError::SelfAttribution { .. } => "self_attribution",
            ScanError::Unattributed(_) => "unattributed",
            ScanError::StorageFailure(_) => "storage_failure",
        }
    }
}
