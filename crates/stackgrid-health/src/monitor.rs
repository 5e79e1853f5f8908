//! Health monitor: checks nodes on demand or on a per-node timer.
//!
//! Every check stamps `last_health_check_at` with an atomic
//! read-modify-write, so it never overwrites a concurrent lifecycle
//! transition. Level changes are broadcast as [`HealthSignal`]s; applying
//! them to the node's status is the orchestrator's job.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use stackgrid_core::config::{HealthSettings, parse_duration};
use stackgrid_core::ids::epoch_secs;
use stackgrid_core::{HealthLevel, HealthStatus, NodeId, ServiceNode};
use stackgrid_state::StateStore;
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::checker::HealthTracker;
use crate::error::{HealthError, HealthResult};
use crate::prober::Prober;
use crate::readiness::{BoxFuture, ReadinessSource};

const SIGNAL_CAPACITY: usize = 256;

/// A debounced health level change for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSignal {
    pub workspace: String,
    pub node_id: NodeId,
    pub level: HealthLevel,
    pub checked_at: u64,
}

/// Debounce state for one serving period of a node. A node that comes
/// back with a different container starts again from no level.
struct Tracked {
    container: Option<String>,
    tracker: HealthTracker,
}

/// Per-node monitor state.
struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

struct Inner {
    state: StateStore,
    prober: Arc<dyn Prober>,
    settings: HealthSettings,
    /// `{workspace}/{id}` → tracker of the current serving period.
    trackers: Mutex<HashMap<String, Tracked>>,
    /// `{workspace}/{id}` → most recent check result.
    last: RwLock<HashMap<String, HealthStatus>>,
    monitors: RwLock<HashMap<String, MonitorSlot>>,
    signals: broadcast::Sender<HealthSignal>,
}

/// Health checks and readiness for all nodes of a state store.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<Inner>,
}

impl HealthMonitor {
    pub fn new(state: StateStore, prober: Arc<dyn Prober>, settings: HealthSettings) -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state,
                prober,
                settings,
                trackers: Mutex::new(HashMap::new()),
                last: RwLock::new(HashMap::new()),
                monitors: RwLock::new(HashMap::new()),
                signals,
            }),
        }
    }

    /// Receive level changes from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthSignal> {
        self.inner.signals.subscribe()
    }

    /// Check one node now.
    ///
    /// Nodes that are not live report `unknown` and lose their debounced
    /// level, so the next serving period publishes its own. Live nodes
    /// without a check configuration are healthy by liveness alone.
    pub async fn check(&self, workspace: &str, node_id: &str) -> HealthResult<HealthStatus> {
        let Some(node) = self.inner.state.get_node(workspace, node_id)? else {
            let key = format!("{workspace}/{node_id}");
            self.inner.trackers.lock().await.remove(&key);
            self.inner.last.write().await.remove(&key);
            return Err(HealthError::NodeNotFound(key));
        };
        let key = node.table_key();

        let status = if !node.status.is_live() {
            self.inner.trackers.lock().await.remove(&key);
            HealthStatus::Unknown
        } else {
            match &node.health_check_config {
                None => HealthStatus::Healthy,
                Some(config) => {
                    let result = self.inner.prober.probe(&node, config).await;
                    let (previous, level) = {
                        let mut trackers = self.inner.trackers.lock().await;
                        let replaced = trackers
                            .get(&key)
                            .is_some_and(|t| t.container != node.container_ref);
                        if replaced {
                            debug!(node = %key, container = ?node.container_ref, "new container, health level reset");
                            trackers.remove(&key);
                        }
                        let tracked = trackers.entry(key.clone()).or_insert_with(|| Tracked {
                            container: node.container_ref.clone(),
                            tracker: HealthTracker::new(config, &self.inner.settings),
                        });
                        let previous = tracked.tracker.level();
                        (previous, tracked.tracker.record(result))
                    };
                    if level != previous {
                        if let Some(level) = level {
                            self.publish(&node, level);
                        }
                    }
                    result.status()
                }
            }
        };

        if status != HealthStatus::Unknown {
            let now = epoch_secs();
            self.inner
                .state
                .update_node(workspace, node_id, |n| n.last_health_check_at = Some(now))?;
        }
        self.inner.last.write().await.insert(key, status);
        debug!(%workspace, node = %node_id, ?status, "health checked");
        Ok(status)
    }

    fn publish(&self, node: &ServiceNode, level: HealthLevel) {
        let signal = HealthSignal {
            workspace: node.workspace.clone(),
            node_id: node.id.clone(),
            level,
            checked_at: epoch_secs(),
        };
        info!(workspace = %node.workspace, node = %node.name, ?level, "health level changed");
        // No subscribers is fine.
        let _ = self.inner.signals.send(signal);
    }

    /// Result of the most recent check, `unknown` if never checked.
    pub async fn last_status(&self, workspace: &str, node_id: &str) -> HealthStatus {
        self.inner
            .last
            .read()
            .await
            .get(&format!("{workspace}/{node_id}"))
            .copied()
            .unwrap_or(HealthStatus::Unknown)
    }

    /// Current debounced level, if one has settled.
    pub async fn level(&self, workspace: &str, node_id: &str) -> Option<HealthLevel> {
        self.inner
            .trackers
            .lock()
            .await
            .get(&format!("{workspace}/{node_id}"))
            .and_then(|t| t.tracker.level())
    }

    /// Start a periodic check task for `node`, replacing any existing one.
    pub async fn start_monitor(&self, node: &ServiceNode) {
        let key = node.table_key();
        let base = node
            .health_check_config
            .as_ref()
            .and_then(|c| parse_duration(&c.interval))
            .or_else(|| parse_duration(&self.inner.settings.interval))
            .unwrap_or(Duration::from_secs(10));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = self.clone();
        let workspace = node.workspace.clone();
        let node_id = node.id.clone();
        let handle = tokio::spawn(async move {
            monitor.run_loop(&workspace, &node_id, base, shutdown_rx).await;
        });

        let mut monitors = self.inner.monitors.write().await;
        if let Some(old) = monitors.insert(key.clone(), MonitorSlot { handle, shutdown_tx }) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }
        info!(node = %key, interval = ?base, "health monitor started");
    }

    pub async fn stop_monitor(&self, workspace: &str, node_id: &str) {
        let key = format!("{workspace}/{node_id}");
        let slot = self.inner.monitors.write().await.remove(&key);
        if let Some(slot) = slot {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(node = %key, "health monitor stopped");
        }
        self.inner.trackers.lock().await.remove(&key);
    }

    /// Stop all monitors (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut monitors = self.inner.monitors.write().await;
        for (key, slot) in monitors.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(node = %key, "health monitor stopped");
        }
        info!("all health monitors stopped");
    }

    /// Stop the monitors of a workspace and drop everything recorded for
    /// its nodes. Returns the number of monitors stopped.
    pub async fn forget_workspace(&self, workspace: &str) -> usize {
        let prefix = format!("{workspace}/");
        let stopped: Vec<(String, MonitorSlot)> = {
            let mut monitors = self.inner.monitors.write().await;
            let keys: Vec<String> = monitors.keys().filter(|k| k.starts_with(&prefix)).cloned().collect();
            keys.into_iter()
                .filter_map(|k| monitors.remove(&k).map(|slot| (k, slot)))
                .collect()
        };
        for (key, slot) in &stopped {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(node = %key, "health monitor stopped");
        }
        self.inner.trackers.lock().await.retain(|k, _| !k.starts_with(&prefix));
        self.inner.last.write().await.retain(|k, _| !k.starts_with(&prefix));
        info!(%workspace, monitors = stopped.len(), "workspace health state dropped");
        stopped.len()
    }

    /// Nodes with a debounce tracker or a recorded result.
    pub async fn tracked_nodes(&self) -> usize {
        let trackers = self.inner.trackers.lock().await;
        let last = self.inner.last.read().await;
        last.keys().chain(trackers.keys()).collect::<HashSet<_>>().len()
    }

    pub async fn active_monitors(&self) -> Vec<String> {
        self.inner.monitors.read().await.keys().cloned().collect()
    }

    pub async fn is_monitoring(&self, workspace: &str, node_id: &str) -> bool {
        self.inner
            .monitors
            .read()
            .await
            .contains_key(&format!("{workspace}/{node_id}"))
    }

    async fn next_interval(&self, key: &str, base: Duration) -> Duration {
        self.inner
            .trackers
            .lock()
            .await
            .get(key)
            .map(|t| t.tracker.next_interval())
            .unwrap_or(base)
    }

    async fn run_loop(&self, workspace: &str, node_id: &str, base: Duration, mut shutdown: watch::Receiver<bool>) {
        let key = format!("{workspace}/{node_id}");
        debug!(node = %key, "health loop starting");
        loop {
            let interval = self.next_interval(&key, base).await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.check(workspace, node_id).await {
                        Ok(_) => {}
                        Err(HealthError::NodeNotFound(_)) => {
                            debug!(node = %key, "node removed, health loop exiting");
                            break;
                        }
                        Err(e) => error!(node = %key, error = %e, "health check failed"),
                    }
                }
                _ = shutdown.changed() => {
                    debug!(node = %key, "health loop shutting down");
                    break;
                }
            }
        }
    }
}

impl ReadinessSource for HealthMonitor {
    /// Ready when a fresh check comes back healthy.
    fn is_ready<'a>(&'a self, workspace: &'a str, node_id: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            match self.check(workspace, node_id).await {
                Ok(status) => status == HealthStatus::Healthy,
                Err(e) => {
                    warn!(%workspace, node = %node_id, error = %e, "readiness check failed");
                    false
                }
            }
        })
    }

    fn forget_workspace<'a>(&'a self, workspace: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            HealthMonitor::forget_workspace(self, workspace).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::ProbeResult;
    use stackgrid_core::{HealthCheckConfig, ServiceStatus, ServiceType};
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Replays scripted results, then repeats the last one.
    struct ScriptedProber {
        results: StdMutex<VecDeque<ProbeResult>>,
        last: StdMutex<ProbeResult>,
    }

    impl ScriptedProber {
        fn new(results: &[ProbeResult]) -> Arc<Self> {
            Arc::new(Self {
                results: StdMutex::new(results.iter().copied().collect()),
                last: StdMutex::new(ProbeResult::Healthy),
            })
        }
    }

    impl Prober for ScriptedProber {
        fn probe<'a>(&'a self, _: &'a ServiceNode, _: &'a HealthCheckConfig) -> BoxFuture<'a, ProbeResult> {
            let next = self.results.lock().unwrap().pop_front();
            let mut last = self.last.lock().unwrap();
            if let Some(r) = next {
                *last = r;
            }
            let result = *last;
            Box::pin(async move { result })
        }
    }

    fn running_node(state: &StateStore, retries: u32) -> ServiceNode {
        let mut node = ServiceNode::skeleton("ws", "web", "web", ServiceType::Node);
        node.status = ServiceStatus::Running;
        let mut config = HealthCheckConfig::http("/health");
        config.interval = "1s".into();
        config.retries = retries;
        node.health_check_config = Some(config);
        state.put_node(&node).unwrap();
        node
    }

    fn monitor(state: &StateStore, prober: Arc<dyn Prober>) -> HealthMonitor {
        let settings = HealthSettings {
            recovery_threshold: 2,
            ..HealthSettings::default()
        };
        HealthMonitor::new(state.clone(), prober, settings)
    }

    #[tokio::test]
    async fn check_stamps_timestamp_and_records_status() {
        let state = StateStore::open_in_memory().unwrap();
        let node = running_node(&state, 3);
        let monitor = monitor(&state, ScriptedProber::new(&[ProbeResult::Healthy]));

        assert_eq!(monitor.last_status("ws", &node.id).await, HealthStatus::Unknown);
        assert_eq!(monitor.check("ws", &node.id).await.unwrap(), HealthStatus::Healthy);
        assert_eq!(monitor.last_status("ws", &node.id).await, HealthStatus::Healthy);

        let stored = state.get_node("ws", &node.id).unwrap().unwrap();
        assert!(stored.last_health_check_at.is_some());
        assert_eq!(stored.status, ServiceStatus::Running);
    }

    #[tokio::test]
    async fn non_live_node_is_unknown() {
        let state = StateStore::open_in_memory().unwrap();
        let mut node = running_node(&state, 3);
        node.status = ServiceStatus::Stopped;
        state.put_node(&node).unwrap();
        let monitor = monitor(&state, ScriptedProber::new(&[ProbeResult::Healthy]));

        assert_eq!(monitor.check("ws", &node.id).await.unwrap(), HealthStatus::Unknown);
        assert!(!monitor.is_ready("ws", &node.id).await);
    }

    #[tokio::test]
    async fn unconfigured_live_node_is_healthy_by_liveness() {
        let state = StateStore::open_in_memory().unwrap();
        let mut node = ServiceNode::skeleton("ws", "cache", "cache", ServiceType::Redis);
        node.status = ServiceStatus::Running;
        node.health_check_config = None;
        state.put_node(&node).unwrap();
        let monitor = monitor(&state, ScriptedProber::new(&[ProbeResult::Failed]));

        assert!(monitor.is_ready("ws", &node.id).await);
    }

    #[tokio::test]
    async fn missing_node_is_an_error() {
        let state = StateStore::open_in_memory().unwrap();
        let monitor = monitor(&state, ScriptedProber::new(&[]));
        let err = monitor.check("ws", "svc-nope").await.unwrap_err();
        assert!(matches!(err, HealthError::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn level_changes_are_broadcast() {
        use ProbeResult::*;
        let state = StateStore::open_in_memory().unwrap();
        let node = running_node(&state, 2);
        let monitor = monitor(
            &state,
            ScriptedProber::new(&[Healthy, Failed, Failed, Healthy, Healthy]),
        );
        let mut rx = monitor.subscribe();

        for _ in 0..5 {
            monitor.check("ws", &node.id).await.unwrap();
        }

        let levels: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|s| s.level)
            .collect();
        assert_eq!(
            levels,
            [
                HealthLevel::Healthy,
                HealthLevel::Unhealthy,
                HealthLevel::Degraded,
                HealthLevel::Healthy
            ]
        );
        assert_eq!(monitor.level("ws", &node.id).await, Some(HealthLevel::Healthy));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_task_checks_periodically() {
        let state = StateStore::open_in_memory().unwrap();
        let node = running_node(&state, 1);
        let monitor = monitor(&state, ScriptedProber::new(&[ProbeResult::Healthy]));
        let mut rx = monitor.subscribe();

        monitor.start_monitor(&node).await;
        assert!(monitor.is_monitoring("ws", &node.id).await);

        let signal = rx.recv().await.unwrap();
        assert_eq!(signal.node_id, node.id);
        assert_eq!(signal.level, HealthLevel::Healthy);

        monitor.stop_monitor("ws", &node.id).await;
        assert!(!monitor.is_monitoring("ws", &node.id).await);
    }

    fn set_status(state: &StateStore, node: &ServiceNode, status: ServiceStatus, container: Option<&str>) {
        state
            .update_node("ws", &node.id, |n| {
                n.status = status;
                n.container_ref = container.map(String::from);
            })
            .unwrap();
    }

    fn levels(rx: &mut broadcast::Receiver<HealthSignal>) -> Vec<HealthLevel> {
        std::iter::from_fn(|| rx.try_recv().ok()).map(|s| s.level).collect()
    }

    #[tokio::test]
    async fn restarted_node_reports_healthy_again() {
        let state = StateStore::open_in_memory().unwrap();
        let node = running_node(&state, 3);
        set_status(&state, &node, ServiceStatus::Running, Some("c-1"));
        let monitor = monitor(&state, ScriptedProber::new(&[ProbeResult::Healthy]));
        let mut rx = monitor.subscribe();

        monitor.check("ws", &node.id).await.unwrap();
        set_status(&state, &node, ServiceStatus::Healthy, Some("c-1"));
        monitor.check("ws", &node.id).await.unwrap();
        assert_eq!(levels(&mut rx), [HealthLevel::Healthy]);

        // Stopped and started again: checked while down.
        set_status(&state, &node, ServiceStatus::Stopped, None);
        assert_eq!(monitor.check("ws", &node.id).await.unwrap(), HealthStatus::Unknown);
        assert_eq!(monitor.level("ws", &node.id).await, None);
        set_status(&state, &node, ServiceStatus::Running, Some("c-2"));
        monitor.check("ws", &node.id).await.unwrap();
        assert_eq!(levels(&mut rx), [HealthLevel::Healthy]);

        // Restarted in place: never checked while down, but the container changed.
        set_status(&state, &node, ServiceStatus::Running, Some("c-3"));
        monitor.check("ws", &node.id).await.unwrap();
        assert_eq!(levels(&mut rx), [HealthLevel::Healthy]);

        // Same container, same level: nothing new.
        monitor.check("ws", &node.id).await.unwrap();
        assert!(levels(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn forgetting_a_workspace_drops_its_nodes() {
        let state = StateStore::open_in_memory().unwrap();
        let node = running_node(&state, 3);
        let mut other = ServiceNode::skeleton("ws2", "web", "web", ServiceType::Node);
        other.status = ServiceStatus::Running;
        other.health_check_config = node.health_check_config.clone();
        state.put_node(&other).unwrap();
        let monitor = monitor(&state, ScriptedProber::new(&[ProbeResult::Healthy]));

        assert!(monitor.is_ready("ws", &node.id).await);
        assert!(monitor.is_ready("ws2", &other.id).await);
        monitor.start_monitor(&node).await;
        assert_eq!(monitor.tracked_nodes().await, 2);

        assert_eq!(monitor.forget_workspace("ws").await, 1);
        assert!(!monitor.is_monitoring("ws", &node.id).await);
        assert_eq!(monitor.tracked_nodes().await, 1);
        assert_eq!(monitor.last_status("ws", &node.id).await, HealthStatus::Unknown);
        assert_eq!(monitor.last_status("ws2", &other.id).await, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn removed_node_is_forgotten_on_check() {
        let state = StateStore::open_in_memory().unwrap();
        let node = running_node(&state, 3);
        let monitor = monitor(&state, ScriptedProber::new(&[ProbeResult::Healthy]));

        monitor.check("ws", &node.id).await.unwrap();
        assert_eq!(monitor.tracked_nodes().await, 1);
        state.delete_node("ws", &node.id).unwrap();

        assert!(monitor.check("ws", &node.id).await.is_err());
        assert_eq!(monitor.tracked_nodes().await, 0);
    }

    #[tokio::test]
    async fn stop_all_and_replace() {
        let state = StateStore::open_in_memory().unwrap();
        let node = running_node(&state, 3);
        let monitor = monitor(&state, ScriptedProber::new(&[]));

        monitor.start_monitor(&node).await;
        monitor.start_monitor(&node).await;
        assert_eq!(monitor.active_monitors().await.len(), 1);

        monitor.stop_all().await;
        assert!(monitor.active_monitors().await.is_empty());
    }
}
