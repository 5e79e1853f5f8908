//! Scanner error types.

use std::path::PathBuf;

use stackgrid_core::ServiceType;
use thiserror::Error;

/// Errors that abort a single scan. An empty result is not an error.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("invalid listing entry '{path}': {reason}")]
    InvalidEntry { path: String, reason: String },

    #[error("invalid signature pattern for {service_type}: {source}")]
    InvalidSignature {
        service_type: ServiceType,
        #[source]
        source: regex::Error,
    },
}

pub type ScanResult<T> = Result<T, ScanError>;
