//! Execution backend seam.
//!
//! The orchestrator never builds images or runs containers itself; it
//! drives an [`ExecutionBackend`]. [`DryRunBackend`] simulates one in
//! memory for planning and tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stackgrid_core::ServiceNode;
use stackgrid_health::BoxFuture;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Parameters of one deploy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployRequest {
    pub environment: BTreeMap<String, String>,
    pub build_args: BTreeMap<String, String>,
    /// Rebuild even when the node already has an image.
    pub force_rebuild: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Ask the process to exit.
    Term,
    /// Force it.
    Kill,
}

/// What the backend reports about a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Starting,
    Running,
    Exited { code: i32 },
    Killed,
    Missing,
}

impl ContainerState {
    pub fn is_gone(&self) -> bool {
        matches!(
            self,
            ContainerState::Exited { .. } | ContainerState::Killed | ContainerState::Missing
        )
    }
}

/// Backend failures, classified by how the orchestrator records them.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("{0}")]
    Failed(String),

    #[error("resource limit: {0}")]
    ResourceLimit(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("configuration: {0}")]
    Configuration(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Builds images and runs containers for service nodes.
pub trait ExecutionBackend: Send + Sync {
    /// Build the node's image and return its reference.
    fn build<'a>(&'a self, node: &'a ServiceNode, request: &'a DeployRequest) -> BoxFuture<'a, BackendResult<String>>;

    /// Create and start a container from the node's image.
    fn start<'a>(&'a self, node: &'a ServiceNode, request: &'a DeployRequest) -> BoxFuture<'a, BackendResult<String>>;

    fn stop<'a>(&'a self, container_ref: &'a str, signal: StopSignal) -> BoxFuture<'a, BackendResult<()>>;

    fn inspect<'a>(&'a self, container_ref: &'a str) -> BoxFuture<'a, BackendResult<ContainerState>>;

    fn scale<'a>(&'a self, container_ref: &'a str, replicas: u32) -> BoxFuture<'a, BackendResult<()>> {
        let _ = (container_ref, replicas);
        Box::pin(async { Ok(()) })
    }
}

// ── Dry run ────────────────────────────────────────────────────────

#[derive(Debug)]
struct DryContainer {
    node: String,
    state: ContainerState,
    replicas: u32,
}

#[derive(Default)]
struct DryState {
    containers: HashMap<String, DryContainer>,
    next_id: u64,
    calls: Vec<String>,
}

/// In-memory backend. Every call succeeds immediately unless a failure
/// was scripted for the node by name.
#[derive(Default)]
pub struct DryRunBackend {
    state: Mutex<DryState>,
    build_delay: Option<Duration>,
    fail_build: HashSet<String>,
    fail_start: HashSet<String>,
    exit_on_start: HashSet<String>,
    ignore_term: HashSet<String>,
    resource_limited: HashSet<String>,
}

impl DryRunBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every build take `delay`.
    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = Some(delay);
        self
    }

    pub fn failing_build(mut self, name: &str) -> Self {
        self.fail_build.insert(name.to_string());
        self
    }

    pub fn failing_start(mut self, name: &str) -> Self {
        self.fail_start.insert(name.to_string());
        self
    }

    /// The container starts but exits immediately.
    pub fn exiting_on_start(mut self, name: &str) -> Self {
        self.exit_on_start.insert(name.to_string());
        self
    }

    /// TERM is swallowed; only KILL stops the container.
    pub fn ignoring_term(mut self, name: &str) -> Self {
        self.ignore_term.insert(name.to_string());
        self
    }

    pub fn resource_limited(mut self, name: &str) -> Self {
        self.resource_limited.insert(name.to_string());
        self
    }

    /// Simulate an external crash of a running container.
    pub async fn crash(&self, container_ref: &str, code: i32) {
        let mut state = self.state.lock().await;
        if let Some(c) = state.containers.get_mut(container_ref) {
            c.state = ContainerState::Exited { code };
        }
    }

    /// Calls received so far, e.g. `"build web"`, `"stop web term"`.
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    pub async fn replicas(&self, container_ref: &str) -> Option<u32> {
        self.state
            .lock()
            .await
            .containers
            .get(container_ref)
            .map(|c| c.replicas)
    }
}

impl ExecutionBackend for DryRunBackend {
    fn build<'a>(&'a self, node: &'a ServiceNode, request: &'a DeployRequest) -> BoxFuture<'a, BackendResult<String>> {
        Box::pin(async move {
            self.state.lock().await.calls.push(format!("build {}", node.name));
            if let Some(delay) = self.build_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_build.contains(&node.name) {
                return Err(BackendError::Failed(format!("build of {} exited with 1", node.name)));
            }
            debug!(node = %node.name, args = request.build_args.len(), "dry-run build");
            Ok(format!("stackgrid/{}:{}", node.name, node.revision))
        })
    }

    fn start<'a>(&'a self, node: &'a ServiceNode, _request: &'a DeployRequest) -> BoxFuture<'a, BackendResult<String>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.calls.push(format!("start {}", node.name));
            if self.resource_limited.contains(&node.name) {
                return Err(BackendError::ResourceLimit(format!(
                    "{} bytes requested",
                    node.resource_limits.memory_bytes
                )));
            }
            if self.fail_start.contains(&node.name) {
                return Err(BackendError::Failed(format!("no such image for {}", node.name)));
            }
            state.next_id += 1;
            let container_ref = format!("dry-{}-{}", node.name, state.next_id);
            let initial = if self.exit_on_start.contains(&node.name) {
                ContainerState::Exited { code: 1 }
            } else {
                ContainerState::Running
            };
            state.containers.insert(
                container_ref.clone(),
                DryContainer {
                    node: node.name.clone(),
                    state: initial,
                    replicas: node.replicas,
                },
            );
            Ok(container_ref)
        })
    }

    fn stop<'a>(&'a self, container_ref: &'a str, signal: StopSignal) -> BoxFuture<'a, BackendResult<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let Some(container) = state.containers.get_mut(container_ref) else {
                return Ok(());
            };
            let name = container.node.clone();
            match signal {
                StopSignal::Term if self.ignore_term.contains(&name) => {}
                StopSignal::Term => container.state = ContainerState::Exited { code: 0 },
                StopSignal::Kill => container.state = ContainerState::Killed,
            }
            let label = match signal {
                StopSignal::Term => "term",
                StopSignal::Kill => "kill",
            };
            state.calls.push(format!("stop {name} {label}"));
            Ok(())
        })
    }

    fn inspect<'a>(&'a self, container_ref: &'a str) -> BoxFuture<'a, BackendResult<ContainerState>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .containers
                .get(container_ref)
                .map(|c| c.state)
                .unwrap_or(ContainerState::Missing))
        })
    }

    fn scale<'a>(&'a self, container_ref: &'a str, replicas: u32) -> BoxFuture<'a, BackendResult<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            match state.containers.get_mut(container_ref) {
                Some(c) => {
                    c.replicas = replicas;
                    let name = c.node.clone();
                    state.calls.push(format!("scale {name} {replicas}"));
                    Ok(())
                }
                None => Err(BackendError::Failed(format!("no container {container_ref}"))),
            }
        })
    }
}
