//! Graph error types.

use stackgrid_core::NodeId;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("cyclic dependency: {}", path.join(" -> "))]
    CyclicDependency { path: Vec<NodeId> },

    #[error("unknown node: {0}")]
    UnknownNode(String),
}

pub type GraphResult<T> = Result<T, GraphError>;

/// Why a detection run did not complete.
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error(transparent)]
    Scan(#[from] stackgrid_scanner::ScanError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("detection cancelled")]
    Cancelled,
}
