//! Health monitor errors.

use stackgrid_state::StateError;
use thiserror::Error;

pub type HealthResult<T> = Result<T, HealthError>;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error(transparent)]
    State(#[from] StateError),
}
