//! Readiness sources queried before a dependent service is started.

use std::future::Future;
use std::pin::Pin;

use stackgrid_state::StateStore;
use tracing::warn;

/// Boxed future alias for the object-safe async traits in this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Answers "may dependents of this node start now?".
pub trait ReadinessSource: Send + Sync {
    fn is_ready<'a>(&'a self, workspace: &'a str, node_id: &'a str) -> BoxFuture<'a, bool>;

    /// Drop whatever is held for a workspace that was torn down.
    fn forget_workspace<'a>(&'a self, _workspace: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async {})
    }
}

/// Readiness from the persisted status alone: ready while live.
#[derive(Clone)]
pub struct LivenessReadiness {
    state: StateStore,
}

impl LivenessReadiness {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }
}

impl ReadinessSource for LivenessReadiness {
    fn is_ready<'a>(&'a self, workspace: &'a str, node_id: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            match self.state.get_node(workspace, node_id) {
                Ok(node) => node.is_some_and(|n| n.status.is_live()),
                Err(e) => {
                    warn!(%workspace, node = %node_id, error = %e, "readiness lookup failed");
                    false
                }
            }
        })
    }
}
