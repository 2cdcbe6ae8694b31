use std::path::PathBuf;
use thiserror::Error;

/// Scan-wide failures. Per-port problems never show up here; they are
/// recorded as [`crate::types::PortState`] values on the probe result.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("invalid port spec `{spec}`: {reason}")]
    InvalidPorts { spec: String, reason: String },

    #[error("invalid target `{target}`: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("no scannable host in target spec `{0}`")]
    Unresolvable(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("cannot write report to {}: {source}", path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, ScanError>;

impl ScanError {
    pub(crate) fn ports(spec: &str, reason: impl Into<String>) -> Self {
        ScanError::InvalidPorts {
            spec: spec.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn target(target: &str, reason: impl Into<String>) -> Self {
        ScanError::InvalidTarget {
            target: target.to_string(),
            reason: reason.into(),
        }
    }
}
