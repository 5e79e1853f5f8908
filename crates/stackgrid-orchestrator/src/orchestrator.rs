//! Orchestrator: drives service nodes through their lifecycle.
//!
//! Every operation takes the node's lease, re-reads the node from the
//! state store, validates the requested operation against the current
//! status, and then walks the transition table one persisted step at a
//! time. Steps that end an operation emit a [`TransitionEvent`].

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use stackgrid_core::config::{OrchestratorConfig, parse_duration};
use stackgrid_core::ids::epoch_secs;
use stackgrid_core::{
    DependencyEdge, Fault, HealthLevel, InPlaceOp, LifecycleEvent, ServiceNode, ServiceStatus,
};
use stackgrid_graph::ServiceGraph;
use stackgrid_health::{HealthSignal, ReadinessSource};
use stackgrid_state::StateStore;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendError, ContainerState, DeployRequest, ExecutionBackend, StopSignal};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{EventSink, LogSink, TransitionEvent};
use crate::lease::{CancelRegistry, LeaseTable};

/// Deploy phases, for mapping backend failures onto states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Build,
    Deploy,
    Start,
}

#[derive(Clone)]
pub struct Orchestrator {
    state: StateStore,
    backend: Arc<dyn ExecutionBackend>,
    readiness: Arc<dyn ReadinessSource>,
    events: Arc<dyn EventSink>,
    leases: Arc<LeaseTable>,
    cancels: Arc<CancelRegistry>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        state: StateStore,
        backend: Arc<dyn ExecutionBackend>,
        readiness: Arc<dyn ReadinessSource>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            state,
            backend,
            readiness,
            events: Arc::new(LogSink),
            leases: Arc::new(LeaseTable::new()),
            cancels: Arc::new(CancelRegistry::new()),
            config,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    // ── Registration ──────────────────────────────────────────────

    /// Persist a graph version with its nodes and edges, and move newly
    /// detected nodes to `deployable` (or `configuration_error`).
    ///
    /// Nodes already on record keep their stored lifecycle state. Stored
    /// edges are replaced by the graph's, so dependencies dropped from this
    /// version no longer gate deploys.
    pub async fn register_graph(&self, graph: &ServiceGraph) -> OrchestratorResult<Vec<ServiceNode>> {
        let snapshot = graph.to_snapshot();
        self.state.put_graph(&snapshot)?;
        for edge in graph.edges() {
            self.state.put_edge(edge)?;
        }
        let current: HashSet<&str> = graph.edges().iter().map(|e| e.id.as_str()).collect();
        for stale in self.state.list_edges(graph.workspace())? {
            if !current.contains(stale.id.as_str()) {
                self.state.delete_edge(graph.workspace(), &stale.id)?;
                debug!(
                    edge = %stale.id,
                    dependent = %stale.dependent_service_id,
                    required = %stale.required_service_id,
                    "dependency dropped from graph"
                );
            }
        }

        let mut registered = Vec::with_capacity(graph.len());
        for node in graph.nodes() {
            let key = node.table_key();
            let _lease = self.leases.acquire(&key).await;
            let mut current = match self.state.get_node(&node.workspace, &node.id)? {
                Some(stored) => stored,
                None => {
                    self.state.put_node(node)?;
                    self.load(&node.workspace, &node.id)?
                }
            };
            if current.status == ServiceStatus::Detecting {
                self.step(&mut current, LifecycleEvent::Detected)?;
            }
            if current.status == ServiceStatus::Detected {
                match validate_node(&current) {
                    Ok(()) => self.step(&mut current, LifecycleEvent::Validated)?,
                    Err(reason) => {
                        warn!(node = %key, %reason, "invalid service configuration");
                        self.step(&mut current, LifecycleEvent::Fault(Fault::ConfigurationError))?;
                    }
                }
            }
            registered.push(current);
        }
        info!(
            workspace = %graph.workspace(),
            version = graph.version(),
            nodes = registered.len(),
            "graph registered"
        );
        Ok(registered)
    }

    // ── Deploy ────────────────────────────────────────────────────

    /// Build, deploy, and start a node once its required dependencies are ready.
    pub async fn deploy(
        &self,
        workspace: &str,
        node_id: &str,
        request: &DeployRequest,
    ) -> OrchestratorResult<ServiceNode> {
        let key = format!("{workspace}/{node_id}");
        let _lease = self.leases.acquire(&key).await;
        let cancel = self.cancels.arm(&key).await;
        let result = self.deploy_locked(workspace, node_id, request, &cancel).await;
        self.cancels.disarm(&key).await;
        result
    }

    async fn deploy_locked(
        &self,
        workspace: &str,
        node_id: &str,
        request: &DeployRequest,
        cancel: &AtomicBool,
    ) -> OrchestratorResult<ServiceNode> {
        let mut node = self.load(workspace, node_id)?;
        if node.status.is_serving() || !(node.status.accepts_deploy() || node.status.accepts_redeploy()) {
            return Err(mismatch(&node, "deploy"));
        }

        self.wait_for_dependencies(&node, cancel).await?;
        if node.status.accepts_redeploy() {
            self.step(&mut node, LifecycleEvent::Redeploy)?;
        }
        self.checkpoint(&mut node, cancel, None).await?;

        info!(workspace = %workspace, node = %node.name, "deploy started");
        self.step(&mut node, LifecycleEvent::BuildStarted)?;
        let cached = node.image_ref.clone().filter(|_| !request.force_rebuild);
        let image = match cached {
            Some(image) => {
                debug!(node = %node.name, %image, "reusing image");
                image
            }
            None => match self.backend.build(&node, request).await {
                Ok(image) => image,
                Err(e) => return Err(self.abort(&mut node, Phase::Build, e)),
            },
        };
        self.checkpoint(&mut node, cancel, None).await?;
        self.step_with(&mut node, LifecycleEvent::BuildSucceeded, |n| {
            n.image_ref = Some(image);
        })?;

        self.checkpoint(&mut node, cancel, None).await?;
        self.step(&mut node, LifecycleEvent::ImagePulled)?;

        self.checkpoint(&mut node, cancel, None).await?;
        let container = match self.backend.start(&node, request).await {
            Ok(container) => container,
            Err(e) => return Err(self.abort(&mut node, Phase::Deploy, e)),
        };
        let container_ref = container.clone();
        self.step_with(&mut node, LifecycleEvent::Deployed, |n| {
            n.container_ref = Some(container_ref);
            n.environment_variables
                .extend(request.environment.iter().map(|(k, v)| (k.clone(), v.clone())));
        })?;

        self.checkpoint(&mut node, cancel, Some(&container)).await?;
        if let Err(e) = self.await_running(&container).await {
            self.kill_quietly(&container).await;
            return Err(self.abort(&mut node, Phase::Start, e));
        }
        self.checkpoint(&mut node, cancel, Some(&container)).await?;

        let now = epoch_secs();
        self.step_with(&mut node, LifecycleEvent::Started, |n| n.deployed_at = Some(now))?;
        info!(workspace = %workspace, node = %node.name, container = %container, "deploy completed");
        Ok(node)
    }

    /// Resume a stopped node from its existing image.
    pub async fn start(&self, workspace: &str, node_id: &str) -> OrchestratorResult<ServiceNode> {
        let key = format!("{workspace}/{node_id}");
        let _lease = self.leases.acquire(&key).await;
        let cancel = self.cancels.arm(&key).await;
        let result = self.start_locked(workspace, node_id, &cancel).await;
        self.cancels.disarm(&key).await;
        result
    }

    async fn start_locked(&self, workspace: &str, node_id: &str, cancel: &AtomicBool) -> OrchestratorResult<ServiceNode> {
        let mut node = self.load(workspace, node_id)?;
        if node.status != ServiceStatus::Stopped {
            return Err(mismatch(&node, "start"));
        }
        if node.image_ref.is_none() {
            return Err(OrchestratorError::ConfigurationError {
                node: node.name.clone(),
                reason: "no image to resume from".to_string(),
            });
        }

        self.wait_for_dependencies(&node, cancel).await?;
        self.checkpoint(&mut node, cancel, None).await?;
        self.step(&mut node, LifecycleEvent::Resume)?;

        let request = DeployRequest::default();
        let container = match self.backend.start(&node, &request).await {
            Ok(container) => container,
            Err(e) => return Err(self.abort(&mut node, Phase::Start, e)),
        };
        if let Err(e) = self.await_running(&container).await {
            self.kill_quietly(&container).await;
            return Err(self.abort(&mut node, Phase::Start, e));
        }
        self.checkpoint(&mut node, cancel, Some(&container)).await?;

        let container_ref = container.clone();
        self.step_with(&mut node, LifecycleEvent::Started, |n| n.container_ref = Some(container_ref))?;
        info!(workspace = %workspace, node = %node.name, %container, "service resumed");
        Ok(node)
    }

    // ── Stop ──────────────────────────────────────────────────────

    /// Stop a node. Graceful stops send TERM and wait up to `timeout_seconds`
    /// for the container to exit, then escalate to KILL (`killed`).
    ///
    /// Emits exactly one transition event, from the status before the stop
    /// to `stopped` or `killed`.
    pub async fn stop(
        &self,
        workspace: &str,
        node_id: &str,
        graceful: bool,
        timeout_seconds: u64,
    ) -> OrchestratorResult<ServiceNode> {
        let key = format!("{workspace}/{node_id}");
        let interrupted = self.cancels.cancel(&key).await;
        if interrupted {
            debug!(node = %key, "stop cancelled an in-flight operation");
        }
        let _lease = self.leases.acquire(&key).await;

        let mut node = self.load(workspace, node_id)?;
        match node.status {
            ServiceStatus::Stopped | ServiceStatus::Killed | ServiceStatus::Terminated => {
                debug!(node = %key, status = %node.status, "already stopped");
                return Ok(node);
            }
            s if !s.is_serving() => {
                if interrupted {
                    return Ok(node);
                }
                return Err(mismatch(&node, "stop"));
            }
            _ => {}
        }

        let previous = node.status;
        let container = node.container_ref.clone();

        if !graceful {
            if let Some(c) = &container {
                self.kill_quietly(c).await;
            }
            self.apply(&mut node, LifecycleEvent::Killed, |n| n.container_ref = None)?;
            self.emit(&node, previous);
            info!(node = %node.name, "service killed");
            return Ok(node);
        }

        self.apply(&mut node, LifecycleEvent::StopRequested, |_| {})?;
        let exited = match &container {
            Some(c) => self.terminate(c, Duration::from_secs(timeout_seconds)).await,
            None => true,
        };

        if exited {
            self.apply(&mut node, LifecycleEvent::StopCompleted, |n| n.container_ref = None)?;
            info!(node = %node.name, "service stopped");
        } else {
            warn!(node = %node.name, timeout_seconds, "graceful stop timed out, killing");
            if let Some(c) = &container {
                self.kill_quietly(c).await;
            }
            self.apply(&mut node, LifecycleEvent::Killed, |n| n.container_ref = None)?;
        }
        self.emit(&node, previous);
        Ok(node)
    }

    // ── In-place operations ───────────────────────────────────────

    pub async fn scale(&self, workspace: &str, node_id: &str, replicas: u32) -> OrchestratorResult<ServiceNode> {
        let key = format!("{workspace}/{node_id}");
        let _lease = self.leases.acquire(&key).await;
        let mut node = self.load(workspace, node_id)?;

        if !matches!(
            node.status,
            ServiceStatus::Running | ServiceStatus::Healthy | ServiceStatus::Degraded
        ) {
            return Err(mismatch(&node, "scale"));
        }
        let (min, max) = (node.scaling_config.min_replicas, node.scaling_config.max_replicas);
        if replicas < min || replicas > max {
            return Err(OrchestratorError::InvalidReplicas { requested: replicas, min, max });
        }

        self.step(&mut node, LifecycleEvent::InPlaceStarted(InPlaceOp::Scale))?;
        let outcome = match &node.container_ref {
            Some(c) => self.backend.scale(c, replicas).await,
            None => Err(BackendError::Failed("no container to scale".to_string())),
        };
        match outcome {
            Ok(()) => {
                self.step_with(&mut node, LifecycleEvent::InPlaceSucceeded, |n| n.replicas = replicas)?;
                info!(node = %node.name, replicas, "service scaled");
                Ok(node)
            }
            Err(e) => {
                error!(node = %node.name, error = %e, "scale failed");
                self.step(&mut node, LifecycleEvent::InPlaceFailed)?;
                Err(OrchestratorError::DeploymentFailed {
                    node: node.name.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Stop and start the node's container in place (`restarting → running`).
    pub async fn restart(&self, workspace: &str, node_id: &str) -> OrchestratorResult<ServiceNode> {
        let key = format!("{workspace}/{node_id}");
        let _lease = self.leases.acquire(&key).await;
        let mut node = self.load(workspace, node_id)?;
        if !node.status.is_serving() {
            return Err(mismatch(&node, "restart"));
        }

        self.step(&mut node, LifecycleEvent::InPlaceStarted(InPlaceOp::Restart))?;
        if let Some(c) = node.container_ref.clone() {
            let timeout = Duration::from_secs(self.config.stop_timeout_seconds);
            if !self.terminate(&c, timeout).await {
                self.kill_quietly(&c).await;
            }
        }

        let started = match self.backend.start(&node, &DeployRequest::default()).await {
            Ok(c) => match self.await_running(&c).await {
                Ok(()) => Ok(c),
                Err(e) => {
                    self.kill_quietly(&c).await;
                    Err(e)
                }
            },
            Err(e) => Err(e),
        };
        match started {
            Ok(container) => {
                self.step_with(&mut node, LifecycleEvent::InPlaceSucceeded, |n| {
                    n.container_ref = Some(container);
                })?;
                info!(node = %node.name, "service restarted");
                Ok(node)
            }
            Err(e) => {
                error!(node = %node.name, error = %e, "restart failed");
                self.step_with(&mut node, LifecycleEvent::InPlaceFailed, |n| n.container_ref = None)?;
                Err(OrchestratorError::StartFailed {
                    node: node.name.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    // ── Observation ───────────────────────────────────────────────

    /// Inspect the node's container and record an external exit as
    /// `crashed` or `killed`. Returns the node as stored afterwards.
    pub async fn observe(&self, workspace: &str, node_id: &str) -> OrchestratorResult<ServiceNode> {
        let key = format!("{workspace}/{node_id}");
        let _lease = self.leases.acquire(&key).await;
        let mut node = self.load(workspace, node_id)?;

        let watched = node.status.is_serving() || node.status.is_in_place() || node.status == ServiceStatus::Starting;
        let Some(container) = node.container_ref.clone().filter(|_| watched) else {
            return Ok(node);
        };

        let observed = match self.backend.inspect(&container).await {
            Ok(state) => state,
            Err(e) => {
                warn!(node = %key, error = %e, "inspect failed");
                return Ok(node);
            }
        };
        let event = match observed {
            ContainerState::Exited { code } => {
                warn!(node = %node.name, code, "service exited unexpectedly");
                LifecycleEvent::Crashed
            }
            ContainerState::Missing => {
                warn!(node = %node.name, "container disappeared");
                LifecycleEvent::Crashed
            }
            ContainerState::Killed => {
                warn!(node = %node.name, "service killed externally");
                LifecycleEvent::Killed
            }
            ContainerState::Running | ContainerState::Starting => return Ok(node),
        };
        self.step_with(&mut node, event, |n| n.container_ref = None)?;
        Ok(node)
    }

    /// Observe every node of a workspace; returns the nodes whose status changed.
    pub async fn reconcile(&self, workspace: &str) -> OrchestratorResult<Vec<ServiceNode>> {
        let mut changed = Vec::new();
        for before in self.state.list_nodes(workspace)? {
            let after = self.observe(workspace, &before.id).await?;
            if after.status != before.status {
                changed.push(after);
            }
        }
        Ok(changed)
    }

    // ── Health feedback ───────────────────────────────────────────

    /// Apply a health level change. Signals that do not apply to the node's
    /// current status are ignored. Returns the new status when it changed.
    pub async fn apply_health(&self, signal: &HealthSignal) -> OrchestratorResult<Option<ServiceStatus>> {
        let key = format!("{}/{}", signal.workspace, signal.node_id);
        let _lease = self.leases.acquire(&key).await;
        let mut node = self.load(&signal.workspace, &signal.node_id)?;

        let event = match signal.level {
            HealthLevel::Healthy => LifecycleEvent::HealthPassed,
            HealthLevel::Degraded => LifecycleEvent::HealthDegraded,
            HealthLevel::Unhealthy => LifecycleEvent::HealthFailed,
        };
        if node.status.on(event).is_err() {
            debug!(node = %key, status = %node.status, level = ?signal.level, "health signal ignored");
            return Ok(None);
        }
        self.step(&mut node, event)?;
        Ok(Some(node.status))
    }

    /// Follow a health signal stream until it closes.
    pub fn spawn_health_follower(&self, mut signals: broadcast::Receiver<HealthSignal>) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            loop {
                match signals.recv().await {
                    Ok(signal) => {
                        if let Err(e) = orchestrator.apply_health(&signal).await {
                            error!(node = %signal.node_id, error = %e, "failed to apply health signal");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "health follower lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("health follower exiting");
        })
    }

    // ── Teardown ──────────────────────────────────────────────────

    /// Kill every container, move nodes through `terminating → terminated`,
    /// and delete the workspace's records. Returns the number of records removed.
    pub async fn teardown(&self, workspace: &str) -> OrchestratorResult<usize> {
        for stored in self.state.list_nodes(workspace)? {
            let key = stored.table_key();
            let interrupted = self.cancels.cancel(&key).await;
            if interrupted {
                debug!(node = %key, "teardown cancelled an in-flight operation");
            }
            let _lease = self.leases.acquire(&key).await;
            let mut node = self.load(workspace, &stored.id)?;
            if node.status.is_final() {
                continue;
            }
            if node.status != ServiceStatus::Terminating {
                self.step(&mut node, LifecycleEvent::Terminate)?;
            }
            if let Some(c) = node.container_ref.clone() {
                self.kill_quietly(&c).await;
            }
            self.step_with(&mut node, LifecycleEvent::TerminationCompleted, |n| n.container_ref = None)?;
        }
        let removed = self.state.delete_workspace(workspace)?;
        self.leases.forget_prefix(&format!("{workspace}/")).await;
        self.readiness.forget_workspace(workspace).await;
        info!(%workspace, removed, "workspace torn down");
        Ok(removed)
    }

    // ── Internals ─────────────────────────────────────────────────

    fn load(&self, workspace: &str, node_id: &str) -> OrchestratorResult<ServiceNode> {
        self.state
            .get_node(workspace, node_id)?
            .ok_or_else(|| OrchestratorError::NodeNotFound(format!("{workspace}/{node_id}")))
    }

    /// Persist `event`'s transition (plus `mutate`) without emitting.
    fn apply<F>(&self, node: &mut ServiceNode, event: LifecycleEvent, mutate: F) -> OrchestratorResult<ServiceStatus>
    where
        F: FnOnce(&mut ServiceNode),
    {
        let previous = node.status;
        let next = previous.on(event)?;
        *node = self.state.update_node(&node.workspace, &node.id, |n| {
            n.status = next;
            mutate(n);
        })?;
        debug!(node = %node.name, from = %previous, to = %next, revision = node.revision, "transition");
        Ok(previous)
    }

    fn step_with<F>(&self, node: &mut ServiceNode, event: LifecycleEvent, mutate: F) -> OrchestratorResult<()>
    where
        F: FnOnce(&mut ServiceNode),
    {
        let previous = self.apply(node, event, mutate)?;
        self.emit(node, previous);
        Ok(())
    }

    fn step(&self, node: &mut ServiceNode, event: LifecycleEvent) -> OrchestratorResult<()> {
        self.step_with(node, event, |_| {})
    }

    fn emit(&self, node: &ServiceNode, previous: ServiceStatus) {
        self.events.emit(TransitionEvent {
            workspace: node.workspace.clone(),
            node_id: node.id.clone(),
            previous_status: previous,
            new_status: node.status,
            timestamp: epoch_secs(),
        });
    }

    /// Refuse further progress once `stop` has raised the cancel flag.
    async fn checkpoint(
        &self,
        node: &mut ServiceNode,
        cancel: &AtomicBool,
        container: Option<&str>,
    ) -> OrchestratorResult<()> {
        if !cancel.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(c) = container {
            self.kill_quietly(c).await;
        }
        if node.status.on(LifecycleEvent::Cancelled).is_ok() {
            self.step_with(node, LifecycleEvent::Cancelled, |n| n.container_ref = None)?;
        }
        info!(node = %node.name, status = %node.status, "operation cancelled");
        Err(OrchestratorError::Cancelled(node.table_key()))
    }

    /// Record a phase failure on the node and return the matching error.
    fn abort(&self, node: &mut ServiceNode, phase: Phase, err: BackendError) -> OrchestratorError {
        let name = node.name.clone();
        let (event, error) = match err {
            BackendError::ResourceLimit(reason) => (
                LifecycleEvent::Fault(Fault::ResourceLimitExceeded),
                OrchestratorError::ResourceLimitExceeded { node: name, reason },
            ),
            BackendError::Configuration(reason) => (
                LifecycleEvent::Fault(Fault::ConfigurationError),
                OrchestratorError::ConfigurationError { node: name, reason },
            ),
            BackendError::Timeout(reason) => (
                LifecycleEvent::Fault(Fault::Timeout),
                OrchestratorError::Timeout(format!("{name}: {reason}")),
            ),
            BackendError::Failed(reason) => match phase {
                Phase::Build => (
                    LifecycleEvent::BuildFailed,
                    OrchestratorError::BuildFailed { node: name, reason },
                ),
                Phase::Deploy => (
                    LifecycleEvent::DeployFailed,
                    OrchestratorError::DeploymentFailed { node: name, reason },
                ),
                Phase::Start => (
                    LifecycleEvent::StartFailed,
                    OrchestratorError::StartFailed { node: name, reason },
                ),
            },
        };
        error!(node = %node.name, ?phase, error = %error, "deploy phase failed");
        match self.step_with(node, event, |n| n.container_ref = None) {
            Ok(()) => error,
            Err(e) => e,
        }
    }

    /// Poll until the container reports running, fails, or the start deadline passes.
    async fn await_running(&self, container: &str) -> Result<(), BackendError> {
        let deadline = Instant::now() + Duration::from_secs(self.config.start_timeout_seconds);
        loop {
            match self.backend.inspect(container).await? {
                ContainerState::Running => return Ok(()),
                ContainerState::Starting => {}
                gone => return Err(BackendError::Failed(format!("container {container} {gone:?}"))),
            }
            if Instant::now() >= deadline {
                return Err(BackendError::Timeout(format!("container {container} did not start")));
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    /// Send TERM and poll until the container is gone or `timeout` passes.
    async fn terminate(&self, container: &str, timeout: Duration) -> bool {
        if let Err(e) = self.backend.stop(container, StopSignal::Term).await {
            warn!(%container, error = %e, "TERM failed");
            return false;
        }
        let deadline = Instant::now() + timeout;
        loop {
            match self.backend.inspect(container).await {
                Ok(state) if state.is_gone() => return true,
                Ok(_) => {}
                Err(e) => warn!(%container, error = %e, "inspect failed while stopping"),
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.poll_interval().min(deadline - now)).await;
        }
    }

    async fn kill_quietly(&self, container: &str) {
        if let Err(e) = self.backend.stop(container, StopSignal::Kill).await {
            warn!(%container, error = %e, "KILL failed");
        }
    }

    // ── Dependency wait ───────────────────────────────────────────

    async fn wait_for_dependencies(&self, node: &ServiceNode, cancel: &AtomicBool) -> OrchestratorResult<()> {
        let edges: Vec<DependencyEdge> = self
            .state
            .list_edges(&node.workspace)?
            .into_iter()
            .filter(|e| e.dependent_service_id == node.id)
            .collect();

        for edge in &edges {
            if edge.is_required {
                self.wait_required(node, edge, cancel).await?;
            } else {
                self.wait_optional(node, edge).await;
            }
        }
        Ok(())
    }

    /// `retry_count + 1` readiness queries, sleeping
    /// `timeout_seconds × backoff_multiplier^attempt` between them.
    async fn wait_required(&self, node: &ServiceNode, edge: &DependencyEdge, cancel: &AtomicBool) -> OrchestratorResult<()> {
        let dependency = &edge.required_service_id;
        let attempts = edge.retry_count + 1;
        for attempt in 0..attempts {
            if self.readiness.is_ready(&node.workspace, dependency).await {
                debug!(node = %node.name, %dependency, attempt, "dependency ready");
                return Ok(());
            }
            if attempt + 1 == attempts {
                break;
            }
            let wait = backoff(edge.timeout_seconds, self.config.backoff_multiplier, attempt);
            debug!(node = %node.name, %dependency, attempt, ?wait, "dependency not ready, waiting");
            tokio::time::sleep(wait).await;
            if cancel.load(Ordering::SeqCst) {
                return Err(OrchestratorError::Cancelled(node.table_key()));
            }
        }
        error!(node = %node.name, %dependency, attempts, "required dependency not ready");
        Err(OrchestratorError::DependencyNotReady {
            node: node.name.clone(),
            dependency: dependency.clone(),
            attempts,
        })
    }

    async fn wait_optional(&self, node: &ServiceNode, edge: &DependencyEdge) {
        let dependency = &edge.required_service_id;
        if self.readiness.is_ready(&node.workspace, dependency).await {
            return;
        }
        tokio::time::sleep(Duration::from_secs(edge.timeout_seconds)).await;
        if !self.readiness.is_ready(&node.workspace, dependency).await {
            warn!(node = %node.name, %dependency, "optional dependency not ready, proceeding");
        }
    }
}

fn mismatch(node: &ServiceNode, operation: &'static str) -> OrchestratorError {
    OrchestratorError::StateMismatch {
        node: node.name.clone(),
        status: node.status,
        operation,
    }
}

fn backoff(timeout_seconds: u64, multiplier: f64, attempt: u32) -> Duration {
    let factor = multiplier.max(1.0).powi(attempt as i32);
    Duration::from_secs_f64(timeout_seconds as f64 * factor)
}

/// Configuration checks run when a node is registered.
pub fn validate_node(node: &ServiceNode) -> Result<(), String> {
    if node.port_mappings.iter().any(|p| p.container_port == 0) {
        return Err("container port 0".to_string());
    }
    let scaling = &node.scaling_config;
    if scaling.min_replicas == 0 || scaling.min_replicas > scaling.max_replicas {
        return Err(format!(
            "scaling range [{}, {}] is empty",
            scaling.min_replicas, scaling.max_replicas
        ));
    }
    if node.replicas < scaling.min_replicas || node.replicas > scaling.max_replicas {
        return Err(format!("replicas {} outside scaling range", node.replicas));
    }
    if node.startup_order > 100 {
        return Err(format!("startup_order {} above 100", node.startup_order));
    }
    if let Some(hc) = &node.health_check_config {
        if !hc.path.starts_with('/') {
            return Err(format!("health check path {:?} must start with '/'", hc.path));
        }
        for (field, value) in [("interval", &hc.interval), ("timeout", &hc.timeout)] {
            if parse_duration(value).is_none() {
                return Err(format!("health check {field} {value:?} is not a duration"));
            }
        }
    }
    Ok(())
}
