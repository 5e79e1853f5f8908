//! Orchestrator error types.

use stackgrid_core::{ServiceStatus, TransitionError};
use stackgrid_graph::GraphError;
use stackgrid_state::StateError;
use thiserror::Error;

/// Errors returned by orchestrator operations.
///
/// Phase failures are also recorded on the node (`build_failed`,
/// `deployment_failed`, `start_failed`, or a fault state) before they are
/// returned.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("dependency {dependency} of {node} not ready after {attempts} checks")]
    DependencyNotReady {
        node: String,
        dependency: String,
        attempts: u32,
    },

    #[error("build failed for {node}: {reason}")]
    BuildFailed { node: String, reason: String },

    #[error("deployment failed for {node}: {reason}")]
    DeploymentFailed { node: String, reason: String },

    #[error("start failed for {node}: {reason}")]
    StartFailed { node: String, reason: String },

    #[error("resource limit exceeded for {node}: {reason}")]
    ResourceLimitExceeded { node: String, reason: String },

    #[error("configuration error for {node}: {reason}")]
    ConfigurationError { node: String, reason: String },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("cannot {operation} {node} while {status}")]
    StateMismatch {
        node: String,
        status: ServiceStatus,
        operation: &'static str,
    },

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("replica count {requested} outside [{min}, {max}]")]
    InvalidReplicas { requested: u32, min: u32, max: u32 },

    #[error("operation on {0} cancelled")]
    Cancelled(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("no graph registered for workspace {0}")]
    GraphNotFound(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl OrchestratorError {
    /// Whether running the same operation again may succeed without
    /// anything else changing first.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::DependencyNotReady { .. }
                | OrchestratorError::DeploymentFailed { .. }
                | OrchestratorError::StartFailed { .. }
                | OrchestratorError::Timeout(_)
                | OrchestratorError::Cancelled(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_split() {
        let not_ready = OrchestratorError::DependencyNotReady {
            node: "web".into(),
            dependency: "db".into(),
            attempts: 3,
        };
        assert!(not_ready.is_retryable());
        assert!(OrchestratorError::Timeout("start".into()).is_retryable());

        let config = OrchestratorError::ConfigurationError {
            node: "web".into(),
            reason: "bad port".into(),
        };
        assert!(!config.is_retryable());
        let mismatch = OrchestratorError::StateMismatch {
            node: "web".into(),
            status: ServiceStatus::Running,
            operation: "deploy",
        };
        assert!(!mismatch.is_retryable());
        assert!(mismatch.to_string().contains("running"));
    }
}
