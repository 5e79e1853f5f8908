//! End-to-end lifecycle scenarios against the dry-run backend.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use stackgrid_core::config::{HealthSettings, OrchestratorConfig};
use stackgrid_core::{
    DependencyEdge, DependencyType, HealthCheckConfig, HealthLevel, ServiceNode, ServiceStatus,
    ServiceType,
};
use stackgrid_graph::ServiceGraph;
use stackgrid_health::{
    BoxFuture, HealthMonitor, HealthSignal, LivenessReadiness, ProbeResult, Prober, ReadinessSource,
};
use stackgrid_orchestrator::{
    ChannelSink, DeployRequest, DryRunBackend, Orchestrator, OrchestratorError, TransitionEvent,
};
use stackgrid_state::{StateError, StateStore};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

const WS: &str = "shop";

// ── Harness ────────────────────────────────────────────────────────

struct Harness {
    state: StateStore,
    backend: Arc<DryRunBackend>,
    orchestrator: Orchestrator,
    events: mpsc::UnboundedReceiver<TransitionEvent>,
    db: ServiceNode,
    web: ServiceNode,
}

impl Harness {
    async fn new(backend: DryRunBackend) -> Self {
        let state = StateStore::open_in_memory().unwrap();
        let readiness = Arc::new(LivenessReadiness::new(state.clone()));
        Self::with_readiness(state, backend, readiness).await
    }

    async fn with_readiness(
        state: StateStore,
        backend: DryRunBackend,
        readiness: Arc<dyn ReadinessSource>,
    ) -> Self {
        let backend = Arc::new(backend);
        let (sink, events) = ChannelSink::new();
        let config = OrchestratorConfig {
            poll_interval: "100ms".into(),
            ..OrchestratorConfig::default()
        };
        let orchestrator = Orchestrator::new(state.clone(), backend.clone(), readiness, config)
            .with_events(Arc::new(sink));

        let (graph, db, web) = web_requires_db();
        orchestrator.register_graph(&graph).await.unwrap();

        let mut harness = Self {
            state,
            backend,
            orchestrator,
            events,
            db,
            web,
        };
        harness.drain();
        harness
    }

    fn drain(&mut self) -> Vec<TransitionEvent> {
        std::iter::from_fn(|| self.events.try_recv().ok()).collect()
    }

    fn status(&self, node: &ServiceNode) -> ServiceStatus {
        self.state.get_node(WS, &node.id).unwrap().unwrap().status
    }

    async fn deploy(&self, node: &ServiceNode) -> Result<ServiceNode, OrchestratorError> {
        self.orchestrator
            .deploy(WS, &node.id, &DeployRequest::default())
            .await
    }
}

/// web requires db (timeout 1s, two retries); db has an HTTP check.
fn web_requires_db() -> (ServiceGraph, ServiceNode, ServiceNode) {
    let mut db = ServiceNode::skeleton(WS, "db", "db", ServiceType::Postgres);
    let mut check = HealthCheckConfig::http("/health");
    check.interval = "1s".into();
    db.health_check_config = Some(check);
    let web = ServiceNode::skeleton(WS, "web", "web", ServiceType::Node);

    let mut edge = DependencyEdge::new(WS, &web.id, &db.id, DependencyType::Requires);
    edge.timeout_seconds = 1;
    edge.retry_count = 2;

    let graph = ServiceGraph::new(WS)
        .with_node(db.clone())
        .unwrap()
        .with_node(web.clone())
        .unwrap()
        .with_edge(edge)
        .unwrap();
    (graph, db, web)
}

fn assert_chained(events: &[TransitionEvent]) {
    for pair in events.windows(2) {
        if pair[0].node_id == pair[1].node_id {
            assert_eq!(pair[0].new_status, pair[1].previous_status, "{events:#?}");
        }
    }
}

/// Probe that always answers the same and records when it was asked.
struct RecordingProber {
    result: ProbeResult,
    at: Mutex<Vec<Instant>>,
}

impl Prober for RecordingProber {
    fn probe<'a>(&'a self, _: &'a ServiceNode, _: &'a HealthCheckConfig) -> BoxFuture<'a, ProbeResult> {
        self.at.lock().unwrap().push(Instant::now());
        let result = self.result;
        Box::pin(async move { result })
    }
}

/// Harness whose readiness comes from a health monitor with an always
/// healthy probe.
async fn monitored() -> (Harness, HealthMonitor) {
    let state = StateStore::open_in_memory().unwrap();
    let prober = Arc::new(RecordingProber {
        result: ProbeResult::Healthy,
        at: Mutex::new(Vec::new()),
    });
    let monitor = HealthMonitor::new(state.clone(), prober, HealthSettings::default());
    let h = Harness::with_readiness(state, DryRunBackend::new(), Arc::new(monitor.clone())).await;
    (h, monitor)
}

/// Check `node` once and apply whatever level change that produced.
async fn check_and_apply(
    h: &Harness,
    monitor: &HealthMonitor,
    signals: &mut broadcast::Receiver<HealthSignal>,
    node: &ServiceNode,
) -> ServiceStatus {
    monitor.check(WS, &node.id).await.unwrap();
    while let Ok(signal) = signals.try_recv() {
        h.orchestrator.apply_health(&signal).await.unwrap();
    }
    h.status(node)
}

// ── Registration ───────────────────────────────────────────────────

#[tokio::test]
async fn registration_makes_nodes_deployable() {
    let h = Harness::new(DryRunBackend::new()).await;
    assert_eq!(h.status(&h.db), ServiceStatus::Deployable);
    assert_eq!(h.status(&h.web), ServiceStatus::Deployable);
    assert_eq!(h.state.list_edges(WS).unwrap().len(), 1);
    assert!(h.state.latest_graph(WS).unwrap().is_some());
}

#[tokio::test]
async fn invalid_node_is_a_configuration_error() {
    let state = StateStore::open_in_memory().unwrap();
    let orchestrator = Orchestrator::new(
        state.clone(),
        Arc::new(DryRunBackend::new()),
        Arc::new(LivenessReadiness::new(state.clone())),
        OrchestratorConfig::default(),
    );
    let mut web = ServiceNode::skeleton(WS, "web", "web", ServiceType::Node);
    web.replicas = 0;
    let graph = ServiceGraph::new(WS).with_node(web.clone()).unwrap();

    let nodes = orchestrator.register_graph(&graph).await.unwrap();
    assert_eq!(nodes[0].status, ServiceStatus::ConfigurationError);
}

#[tokio::test]
async fn nested_workspace_names_are_refused() {
    let h = Harness::new(DryRunBackend::new()).await;
    let nested = format!("{WS}/eu");
    let web = ServiceNode::skeleton(&nested, "web", "web", ServiceType::Node);
    let graph = ServiceGraph::new(&nested).with_node(web).unwrap();

    let err = h.orchestrator.register_graph(&graph).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::State(StateError::InvalidWorkspace(_))));
    assert!(h.orchestrator.teardown(&nested).await.is_err());

    assert_eq!(h.state.list_nodes(WS).unwrap().len(), 2);
    assert_eq!(h.state.latest_graph(WS).unwrap().unwrap().workspace, WS);
}

#[tokio::test]
async fn workspace_named_after_another_is_separate() {
    let h = Harness::new(DryRunBackend::new()).await;
    let sibling = format!("{WS}ping");
    let web = ServiceNode::skeleton(&sibling, "web", "web", ServiceType::Node);
    let graph = ServiceGraph::new(&sibling).with_node(web).unwrap();
    h.orchestrator.register_graph(&graph).await.unwrap();

    assert_eq!(h.state.list_nodes(WS).unwrap().len(), 2);
    assert_eq!(h.state.latest_graph(WS).unwrap().unwrap().workspace, WS);

    h.orchestrator.teardown(WS).await.unwrap();
    let left = h.state.list_nodes(&sibling).unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].status, ServiceStatus::Deployable);
    assert!(h.state.latest_graph(&sibling).unwrap().is_some());
}

#[tokio::test]
async fn dropped_dependency_no_longer_gates_deploy() {
    let h = Harness::new(DryRunBackend::new()).await;
    let mut snapshot = h.state.latest_graph(WS).unwrap().unwrap();
    snapshot.version += 1;
    snapshot.edges.clear();
    let without_edge = ServiceGraph::from_snapshot(snapshot).unwrap();
    h.orchestrator.register_graph(&without_edge).await.unwrap();
    assert!(h.state.list_edges(WS).unwrap().is_empty());

    // db was never deployed.
    let web = h.deploy(&h.web).await.unwrap();
    assert_eq!(web.status, ServiceStatus::Running);
    assert_eq!(h.status(&h.db), ServiceStatus::Deployable);
}

// ── Deploy ─────────────────────────────────────────────────────────

#[tokio::test]
async fn deploy_walks_every_phase() {
    let mut h = Harness::new(DryRunBackend::new()).await;
    let db = h.deploy(&h.db).await.unwrap();

    assert_eq!(db.status, ServiceStatus::Running);
    assert!(db.image_ref.is_some());
    assert!(db.container_ref.is_some());
    assert!(db.deployed_at.is_some());

    let statuses: Vec<_> = h.drain().into_iter().map(|e| e.new_status).collect();
    assert_eq!(
        statuses,
        [
            ServiceStatus::Building,
            ServiceStatus::ImagePulling,
            ServiceStatus::Deploying,
            ServiceStatus::Starting,
            ServiceStatus::Running,
        ]
    );
}

#[tokio::test]
async fn deploy_on_running_is_rejected() {
    let h = Harness::new(DryRunBackend::new()).await;
    h.deploy(&h.db).await.unwrap();
    let calls = h.backend.calls().await;

    let err = h.deploy(&h.db).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::StateMismatch { status: ServiceStatus::Running, .. }
    ));
    assert_eq!(h.backend.calls().await, calls);

    h.state
        .update_node(WS, &h.db.id, |n| n.status = ServiceStatus::Healthy)
        .unwrap();
    assert!(matches!(
        h.deploy(&h.db).await,
        Err(OrchestratorError::StateMismatch { .. })
    ));
}

#[tokio::test]
async fn build_failure_stops_before_later_phases() {
    let h = Harness::new(DryRunBackend::new().failing_build("db")).await;
    let err = h.deploy(&h.db).await.unwrap_err();

    assert!(matches!(err, OrchestratorError::BuildFailed { .. }));
    assert!(!err.is_retryable());
    assert_eq!(h.status(&h.db), ServiceStatus::BuildFailed);
    assert_eq!(h.backend.calls().await, ["build db"]);
}

#[tokio::test]
async fn container_exiting_on_start_is_start_failed() {
    let h = Harness::new(DryRunBackend::new().exiting_on_start("db")).await;
    let err = h.deploy(&h.db).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::StartFailed { .. }));
    assert_eq!(h.status(&h.db), ServiceStatus::StartFailed);
}

#[tokio::test]
async fn resource_limit_is_a_fault_state() {
    let h = Harness::new(DryRunBackend::new().resource_limited("db")).await;
    let err = h.deploy(&h.db).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::ResourceLimitExceeded { .. }));
    assert_eq!(h.status(&h.db), ServiceStatus::ResourceLimitExceeded);
}

#[tokio::test]
async fn failed_node_redeploys_through_deployable() {
    let mut h = Harness::new(DryRunBackend::new().failing_build("db")).await;
    h.deploy(&h.db).await.unwrap_err();
    h.drain();

    h.deploy(&h.db).await.unwrap_err();
    let statuses: Vec<_> = h.drain().into_iter().map(|e| e.new_status).collect();
    assert_eq!(
        statuses,
        [
            ServiceStatus::Deployable,
            ServiceStatus::Building,
            ServiceStatus::BuildFailed
        ]
    );
}

#[tokio::test]
async fn dependent_deploys_once_dependency_is_live() {
    let h = Harness::new(DryRunBackend::new()).await;
    h.deploy(&h.db).await.unwrap();
    let web = h.deploy(&h.web).await.unwrap();
    assert_eq!(web.status, ServiceStatus::Running);
}

/// Scenario C: the required dependency keeps failing its checks.
#[tokio::test(start_paused = true)]
async fn dependency_not_ready_after_retry_budget() {
    let state = StateStore::open_in_memory().unwrap();
    let prober = Arc::new(RecordingProber {
        result: ProbeResult::Unhealthy,
        at: Mutex::new(Vec::new()),
    });
    let monitor = HealthMonitor::new(state.clone(), prober.clone(), HealthSettings::default());
    let h = Harness::with_readiness(state, DryRunBackend::new(), Arc::new(monitor)).await;

    // db is up but unhealthy.
    h.state
        .update_node(WS, &h.db.id, |n| n.status = ServiceStatus::Running)
        .unwrap();

    let started = Instant::now();
    let err = h.deploy(&h.web).await.unwrap_err();
    let elapsed = started.elapsed();

    match &err {
        OrchestratorError::DependencyNotReady { attempts, dependency, .. } => {
            assert_eq!(*attempts, 3);
            assert_eq!(dependency, &h.db.id);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_retryable());

    let probes = prober.at.lock().unwrap().clone();
    assert_eq!(probes.len(), 3);
    for pair in probes.windows(2) {
        assert_eq!(pair[1] - pair[0], Duration::from_secs(1));
    }
    assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(3));

    assert_eq!(h.status(&h.web), ServiceStatus::Deployable);
    assert!(h.backend.calls().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn optional_dependency_waits_once_then_proceeds() {
    let mut h = Harness::new(DryRunBackend::new()).await;
    let cache = ServiceNode::skeleton(WS, "cache", "cache", ServiceType::Redis);
    h.state.put_node(&cache).unwrap();
    let mut edge = DependencyEdge::new(WS, &h.db.id, &cache.id, DependencyType::ConnectsTo);
    edge.timeout_seconds = 4;
    h.state.put_edge(&edge).unwrap();

    let started = Instant::now();
    let db = h.deploy(&h.db).await.unwrap();
    assert_eq!(db.status, ServiceStatus::Running);
    assert!(started.elapsed() >= Duration::from_secs(4));
    h.drain();
}

#[tokio::test]
async fn force_rebuild_controls_image_reuse() {
    let h = Harness::new(DryRunBackend::new()).await;
    h.deploy(&h.db).await.unwrap();
    h.orchestrator.stop(WS, &h.db.id, true, 5).await.unwrap();

    h.deploy(&h.db).await.unwrap();
    let builds = |calls: Vec<String>| calls.iter().filter(|c| c.starts_with("build")).count();
    assert_eq!(builds(h.backend.calls().await), 1);

    h.orchestrator.stop(WS, &h.db.id, false, 0).await.unwrap();
    let request = DeployRequest {
        force_rebuild: true,
        ..DeployRequest::default()
    };
    h.orchestrator.deploy(WS, &h.db.id, &request).await.unwrap();
    assert_eq!(builds(h.backend.calls().await), 2);
}

// ── Stop and start ─────────────────────────────────────────────────

#[tokio::test]
async fn graceful_stop_emits_one_event() {
    let mut h = Harness::new(DryRunBackend::new()).await;
    h.deploy(&h.db).await.unwrap();
    h.drain();

    let db = h.orchestrator.stop(WS, &h.db.id, true, 5).await.unwrap();
    assert_eq!(db.status, ServiceStatus::Stopped);
    assert!(db.container_ref.is_none());

    let events = h.drain();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].previous_status, ServiceStatus::Running);
    assert_eq!(events[0].new_status, ServiceStatus::Stopped);

    // Stopping again is a no-op.
    h.orchestrator.stop(WS, &h.db.id, true, 5).await.unwrap();
    assert!(h.drain().is_empty());
}

/// Scenario D: TERM is ignored, the deadline passes, KILL follows.
#[tokio::test(start_paused = true)]
async fn graceful_stop_timeout_escalates_to_killed() {
    let mut h = Harness::new(DryRunBackend::new().ignoring_term("db")).await;
    h.deploy(&h.db).await.unwrap();
    h.drain();

    let started = Instant::now();
    let db = h.orchestrator.stop(WS, &h.db.id, true, 5).await.unwrap();
    assert_eq!(db.status, ServiceStatus::Killed);
    assert!(started.elapsed() >= Duration::from_secs(5));

    let events = h.drain();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].previous_status, ServiceStatus::Running);
    assert_eq!(events[0].new_status, ServiceStatus::Killed);

    let calls = h.backend.calls().await;
    assert!(calls.contains(&"stop db term".to_string()));
    assert!(calls.contains(&"stop db kill".to_string()));
}

#[tokio::test]
async fn forced_stop_kills_directly() {
    let h = Harness::new(DryRunBackend::new()).await;
    h.deploy(&h.db).await.unwrap();
    let db = h.orchestrator.stop(WS, &h.db.id, false, 5).await.unwrap();
    assert_eq!(db.status, ServiceStatus::Killed);
    assert!(!h.backend.calls().await.contains(&"stop db term".to_string()));
}

#[tokio::test]
async fn stop_on_deployable_is_rejected() {
    let h = Harness::new(DryRunBackend::new()).await;
    let err = h.orchestrator.stop(WS, &h.db.id, true, 5).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::StateMismatch { .. }));
}

#[tokio::test]
async fn start_resumes_without_rebuilding() {
    let h = Harness::new(DryRunBackend::new()).await;
    h.deploy(&h.db).await.unwrap();
    h.orchestrator.stop(WS, &h.db.id, true, 5).await.unwrap();

    let db = h.orchestrator.start(WS, &h.db.id).await.unwrap();
    assert_eq!(db.status, ServiceStatus::Running);
    let calls = h.backend.calls().await;
    assert_eq!(calls.iter().filter(|c| c.starts_with("build")).count(), 1);
    assert_eq!(calls.iter().filter(|c| c.starts_with("start")).count(), 2);

    assert!(matches!(
        h.orchestrator.start(WS, &h.db.id).await,
        Err(OrchestratorError::StateMismatch { .. })
    ));
}

/// Scenario E: a stop racing an in-flight deploy cancels it at the next
/// phase boundary; the node's history is one unbroken chain.
#[tokio::test(start_paused = true)]
async fn concurrent_deploy_and_stop_are_linearized() {
    let mut h = Harness::new(DryRunBackend::new().with_build_delay(Duration::from_secs(5))).await;

    let orchestrator = h.orchestrator.clone();
    let db_id = h.db.id.clone();
    let deploy = tokio::spawn(async move {
        orchestrator
            .deploy(WS, &db_id, &DeployRequest::default())
            .await
    });

    // Let the deploy get into its build.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.status(&h.db), ServiceStatus::Building);

    let stopped = h.orchestrator.stop(WS, &h.db.id, true, 5).await.unwrap();
    assert_eq!(stopped.status, ServiceStatus::Stopped);

    let result = deploy.await.unwrap();
    assert!(matches!(result, Err(OrchestratorError::Cancelled(_))));

    let events = h.drain();
    assert_chained(&events);
    assert_eq!(events.first().unwrap().previous_status, ServiceStatus::Deployable);
    assert_eq!(events.last().unwrap().new_status, ServiceStatus::Stopped);
    assert!(!h.backend.calls().await.iter().any(|c| c.starts_with("start")));
}

#[tokio::test(start_paused = true)]
async fn stop_after_deploy_completes_stops_the_service() {
    let mut h = Harness::new(DryRunBackend::new()).await;

    let orchestrator = h.orchestrator.clone();
    let db_id = h.db.id.clone();
    let deploy = tokio::spawn(async move {
        orchestrator
            .deploy(WS, &db_id, &DeployRequest::default())
            .await
    });
    deploy.await.unwrap().unwrap();

    let db = h.orchestrator.stop(WS, &h.db.id, true, 5).await.unwrap();
    assert_eq!(db.status, ServiceStatus::Stopped);
    assert_chained(&h.drain());
}

// ── In-place operations ────────────────────────────────────────────

#[tokio::test]
async fn scale_within_bounds() {
    let mut h = Harness::new(DryRunBackend::new()).await;
    let db = h.deploy(&h.db).await.unwrap();
    h.drain();

    let scaled = h.orchestrator.scale(WS, &h.db.id, 3).await.unwrap();
    assert_eq!(scaled.status, ServiceStatus::Running);
    assert_eq!(scaled.replicas, 3);
    let container = db.container_ref.unwrap();
    assert_eq!(h.backend.replicas(&container).await, Some(3));

    let statuses: Vec<_> = h.drain().into_iter().map(|e| e.new_status).collect();
    assert_eq!(statuses, [ServiceStatus::Scaling, ServiceStatus::Running]);

    assert!(matches!(
        h.orchestrator.scale(WS, &h.db.id, 10).await,
        Err(OrchestratorError::InvalidReplicas { requested: 10, .. })
    ));
}

#[tokio::test]
async fn scale_requires_a_serving_node() {
    let h = Harness::new(DryRunBackend::new()).await;
    assert!(matches!(
        h.orchestrator.scale(WS, &h.db.id, 2).await,
        Err(OrchestratorError::StateMismatch { .. })
    ));
}

#[tokio::test]
async fn restart_replaces_the_container() {
    let h = Harness::new(DryRunBackend::new()).await;
    let before = h.deploy(&h.db).await.unwrap();
    let after = h.orchestrator.restart(WS, &h.db.id).await.unwrap();

    assert_eq!(after.status, ServiceStatus::Running);
    assert_ne!(after.container_ref, before.container_ref);
}

// ── Observation and health ─────────────────────────────────────────

#[tokio::test]
async fn observed_exit_is_a_crash() {
    let h = Harness::new(DryRunBackend::new()).await;
    let db = h.deploy(&h.db).await.unwrap();
    h.backend.crash(db.container_ref.as_deref().unwrap(), 137).await;

    let changed = h.orchestrator.reconcile(WS).await.unwrap();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].status, ServiceStatus::Crashed);

    // A crashed node redeploys from its image.
    let db = h.deploy(&h.db).await.unwrap();
    assert_eq!(db.status, ServiceStatus::Running);
}

#[tokio::test]
async fn health_levels_drive_status() {
    let h = Harness::new(DryRunBackend::new()).await;
    h.deploy(&h.db).await.unwrap();

    let steps = [
        (HealthLevel::Unhealthy, Some(ServiceStatus::Unhealthy)),
        (HealthLevel::Degraded, Some(ServiceStatus::Degraded)),
        (HealthLevel::Healthy, Some(ServiceStatus::Healthy)),
        (HealthLevel::Healthy, None),
    ];
    for (level, expected) in steps {
        let signal = HealthSignal {
            workspace: WS.into(),
            node_id: h.db.id.clone(),
            level,
            checked_at: 0,
        };
        assert_eq!(h.orchestrator.apply_health(&signal).await.unwrap(), expected, "{level:?}");
    }

    // Signals for stopped nodes are dropped.
    h.orchestrator.stop(WS, &h.db.id, true, 5).await.unwrap();
    let late = HealthSignal {
        workspace: WS.into(),
        node_id: h.db.id.clone(),
        level: HealthLevel::Unhealthy,
        checked_at: 0,
    };
    assert_eq!(h.orchestrator.apply_health(&late).await.unwrap(), None);
}

#[tokio::test]
async fn health_returns_after_each_new_serving_period() {
    let (h, monitor) = monitored().await;
    let mut signals = monitor.subscribe();
    h.deploy(&h.db).await.unwrap();
    assert_eq!(check_and_apply(&h, &monitor, &mut signals, &h.db).await, ServiceStatus::Healthy);

    h.orchestrator.stop(WS, &h.db.id, true, 5).await.unwrap();
    h.orchestrator.start(WS, &h.db.id).await.unwrap();
    assert_eq!(h.status(&h.db), ServiceStatus::Running);
    assert_eq!(check_and_apply(&h, &monitor, &mut signals, &h.db).await, ServiceStatus::Healthy);

    h.orchestrator.restart(WS, &h.db.id).await.unwrap();
    assert_eq!(h.status(&h.db), ServiceStatus::Running);
    assert_eq!(check_and_apply(&h, &monitor, &mut signals, &h.db).await, ServiceStatus::Healthy);

    let crashed = h.state.get_node(WS, &h.db.id).unwrap().unwrap();
    h.backend.crash(crashed.container_ref.as_deref().unwrap(), 137).await;
    h.orchestrator.reconcile(WS).await.unwrap();
    h.deploy(&h.db).await.unwrap();
    assert_eq!(check_and_apply(&h, &monitor, &mut signals, &h.db).await, ServiceStatus::Healthy);
}

#[tokio::test]
async fn health_follower_applies_signals() {
    let h = Harness::new(DryRunBackend::new()).await;
    h.deploy(&h.db).await.unwrap();

    let (tx, rx) = broadcast::channel(8);
    let follower = h.orchestrator.spawn_health_follower(rx);
    tx.send(HealthSignal {
        workspace: WS.into(),
        node_id: h.db.id.clone(),
        level: HealthLevel::Healthy,
        checked_at: 0,
    })
    .unwrap();
    drop(tx);
    follower.await.unwrap();

    assert_eq!(h.status(&h.db), ServiceStatus::Healthy);
}

// ── Workspace-wide ─────────────────────────────────────────────────

#[tokio::test]
async fn rollout_deploys_tier_by_tier() {
    let h = Harness::new(DryRunBackend::new()).await;
    let report = h.orchestrator.deploy_graph(WS, &DeployRequest::default()).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.tiers, [vec!["db".to_string()], vec!["web".to_string()]]);
    assert_eq!(report.deployed, ["db", "web"]);
    assert_eq!(h.status(&h.web), ServiceStatus::Running);

    // A second rollout leaves serving nodes alone.
    let again = h.orchestrator.deploy_graph(WS, &DeployRequest::default()).await.unwrap();
    assert_eq!(again.unchanged, ["db", "web"]);
    assert!(again.deployed.is_empty());
}

#[tokio::test]
async fn rollout_skips_dependents_of_failures() {
    let h = Harness::new(DryRunBackend::new().failing_build("db")).await;
    let report = h.orchestrator.deploy_graph(WS, &DeployRequest::default()).await.unwrap();

    assert!(!report.is_success());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "db");
    assert_eq!(report.skipped, ["web"]);
    assert_eq!(h.status(&h.web), ServiceStatus::Deployable);
}

#[tokio::test]
async fn rollout_without_graph_is_an_error() {
    let state = StateStore::open_in_memory().unwrap();
    let orchestrator = Orchestrator::new(
        state.clone(),
        Arc::new(DryRunBackend::new()),
        Arc::new(LivenessReadiness::new(state)),
        OrchestratorConfig::default(),
    );
    assert!(matches!(
        orchestrator.deploy_graph("nowhere", &DeployRequest::default()).await,
        Err(OrchestratorError::GraphNotFound(_))
    ));
}

#[tokio::test]
async fn teardown_terminates_and_forgets() {
    let mut h = Harness::new(DryRunBackend::new()).await;
    h.orchestrator.deploy_graph(WS, &DeployRequest::default()).await.unwrap();
    h.drain();

    let removed = h.orchestrator.teardown(WS).await.unwrap();
    assert!(removed >= 4);
    assert!(h.state.list_nodes(WS).unwrap().is_empty());
    assert!(h.state.latest_graph(WS).unwrap().is_none());

    let events = h.drain();
    assert_chained(&events);
    assert_eq!(
        events.iter().filter(|e| e.new_status == ServiceStatus::Terminated).count(),
        2
    );
    assert_eq!(
        h.backend.calls().await.iter().filter(|c| c.ends_with("kill")).count(),
        2
    );
}

#[tokio::test]
async fn teardown_drops_health_state() {
    let (h, monitor) = monitored().await;
    let db = h.deploy(&h.db).await.unwrap();
    monitor.start_monitor(&db).await;
    monitor.check(WS, &db.id).await.unwrap();
    assert_eq!(monitor.tracked_nodes().await, 1);

    h.orchestrator.teardown(WS).await.unwrap();
    assert!(!monitor.is_monitoring(WS, &db.id).await);
    assert_eq!(monitor.tracked_nodes().await, 0);
}
