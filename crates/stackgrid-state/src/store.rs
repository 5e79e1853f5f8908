//! StateStore: redb-backed persistence for stackgrid.
//!
//! Typed operations over service nodes, dependency edges, detection runs,
//! and graph snapshots. Every node write bumps the node's `revision` inside
//! the same write transaction, and [`StateStore::update_node`] is an atomic
//! read-modify-write, so concurrent writers never lose each other's fields.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use stackgrid_core::ids::check_workspace_name;
use stackgrid_core::{DependencyEdge, GraphSnapshot, ServiceNode, TopologyDetectionRun};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn check_workspace(workspace: &str) -> StateResult<()> {
    check_workspace_name(workspace).map_err(StateError::InvalidWorkspace)
}

/// Key prefix of a workspace. Names containing `/` are refused so that no
/// workspace's prefix can match another workspace's keys.
fn workspace_prefix(workspace: &str) -> StateResult<String> {
    check_workspace(workspace)?;
    Ok(format!("{workspace}/"))
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for table in ALL_TABLES {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON access ────────────────────────────────────────

    fn put_json<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// All values whose key starts with `prefix`, in key order.
    fn list_json<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.range(prefix..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix) {
                break;
            }
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    fn remove(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Service nodes ──────────────────────────────────────────────

    /// Insert or replace a node. The stored revision is one past the
    /// previously stored one, which is returned.
    pub fn put_node(&self, node: &ServiceNode) -> StateResult<u64> {
        check_workspace(&node.workspace)?;
        let key = node.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let revision;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            let previous = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    let stored: ServiceNode =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    stored.revision
                }
                None => 0,
            };
            revision = previous + 1;
            let mut next = node.clone();
            next.revision = revision;
            let value = serde_json::to_vec(&next).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, revision, "node stored");
        Ok(revision)
    }

    pub fn get_node(&self, workspace: &str, id: &str) -> StateResult<Option<ServiceNode>> {
        self.get_json(NODES, &format!("{workspace}/{id}"))
    }

    pub fn list_nodes(&self, workspace: &str) -> StateResult<Vec<ServiceNode>> {
        self.list_json(NODES, &workspace_prefix(workspace)?)
    }

    /// Apply `f` to the stored node and write it back in one transaction.
    pub fn update_node<F>(&self, workspace: &str, id: &str, f: F) -> StateResult<ServiceNode>
    where
        F: FnOnce(&mut ServiceNode),
    {
        let key = format!("{workspace}/{id}");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let node;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            let mut current: ServiceNode = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                None => return Err(StateError::NotFound(key)),
            };
            let revision = current.revision + 1;
            f(&mut current);
            current.revision = revision;
            let value = serde_json::to_vec(&current).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            node = current;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, revision = node.revision, status = %node.status, "node updated");
        Ok(node)
    }

    pub fn delete_node(&self, workspace: &str, id: &str) -> StateResult<bool> {
        self.remove(NODES, &format!("{workspace}/{id}"))
    }

    // ── Dependency edges ───────────────────────────────────────────

    /// Insert a new edge. An edge for the same (dependent, required) pair
    /// already on record is a conflict.
    pub fn insert_edge(&self, edge: &DependencyEdge) -> StateResult<()> {
        let prefix = workspace_prefix(&edge.workspace)?;
        let key = edge.table_key();
        let value = serde_json::to_vec(edge).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(EDGES).map_err(map_err!(Table))?;
            let mut duplicate = None;
            for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
                let (k, v) = entry.map_err(map_err!(Read))?;
                if !k.value().starts_with(prefix.as_str()) {
                    break;
                }
                let stored: DependencyEdge =
                    serde_json::from_slice(v.value()).map_err(map_err!(Deserialize))?;
                if stored.pair() == edge.pair() {
                    duplicate = Some(stored.id);
                    break;
                }
            }
            if let Some(id) = duplicate {
                return Err(StateError::Conflict(format!(
                    "edge {} -> {} already exists as {id}",
                    edge.dependent_service_id, edge.required_service_id
                )));
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "edge inserted");
        Ok(())
    }

    /// Insert or replace an edge by id.
    pub fn put_edge(&self, edge: &DependencyEdge) -> StateResult<()> {
        check_workspace(&edge.workspace)?;
        self.put_json(EDGES, &edge.table_key(), edge)
    }

    pub fn get_edge(&self, workspace: &str, id: &str) -> StateResult<Option<DependencyEdge>> {
        self.get_json(EDGES, &format!("{workspace}/{id}"))
    }

    pub fn list_edges(&self, workspace: &str) -> StateResult<Vec<DependencyEdge>> {
        self.list_json(EDGES, &workspace_prefix(workspace)?)
    }

    pub fn delete_edge(&self, workspace: &str, id: &str) -> StateResult<bool> {
        self.remove(EDGES, &format!("{workspace}/{id}"))
    }

    // ── Detection runs ─────────────────────────────────────────────

    pub fn put_run(&self, run: &TopologyDetectionRun) -> StateResult<()> {
        check_workspace(&run.workspace)?;
        self.put_json(RUNS, &run.table_key(), run)?;
        debug!(run = %run.id, status = ?run.status, "detection run stored");
        Ok(())
    }

    pub fn get_run(&self, workspace: &str, id: &str) -> StateResult<Option<TopologyDetectionRun>> {
        self.get_json(RUNS, &format!("{workspace}/{id}"))
    }

    /// Runs of a workspace, oldest first.
    pub fn list_runs(&self, workspace: &str) -> StateResult<Vec<TopologyDetectionRun>> {
        let mut runs: Vec<TopologyDetectionRun> = self.list_json(RUNS, &workspace_prefix(workspace)?)?;
        runs.sort_by(|a, b| {
            a.detection_timestamp
                .cmp(&b.detection_timestamp)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(runs)
    }

    // ── Graph snapshots ────────────────────────────────────────────

    /// Store a graph version. Versions are immutable once written.
    pub fn put_graph(&self, snapshot: &GraphSnapshot) -> StateResult<()> {
        check_workspace(&snapshot.workspace)?;
        let key = snapshot.table_key();
        if self.get_json::<GraphSnapshot>(GRAPHS, &key)?.is_some_and(|s| s != *snapshot) {
            return Err(StateError::Conflict(format!("graph version {key} already stored")));
        }
        self.put_json(GRAPHS, &key, snapshot)?;
        debug!(%key, nodes = snapshot.nodes.len(), edges = snapshot.edges.len(), "graph stored");
        Ok(())
    }

    pub fn get_graph(&self, workspace: &str, version: u64) -> StateResult<Option<GraphSnapshot>> {
        self.get_json(GRAPHS, &format!("{workspace}/{version:020}"))
    }

    /// Highest stored graph version of a workspace.
    pub fn latest_graph(&self, workspace: &str) -> StateResult<Option<GraphSnapshot>> {
        let prefix = workspace_prefix(workspace)?;
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GRAPHS).map_err(map_err!(Table))?;
        let mut latest = None;
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(prefix.as_str()) {
                break;
            }
            latest = Some(value.value().to_vec());
        }
        latest
            .map(|bytes| serde_json::from_slice(&bytes).map_err(map_err!(Deserialize)))
            .transpose()
    }

    // ── Workspaces ─────────────────────────────────────────────────

    /// Remove every record of a workspace. Returns the number deleted.
    pub fn delete_workspace(&self, workspace: &str) -> StateResult<usize> {
        let prefix = workspace_prefix(workspace)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut deleted = 0;
        for def in ALL_TABLES {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let keys: Vec<String> = {
                let mut keys = Vec::new();
                for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
                    let (key, _) = entry.map_err(map_err!(Read))?;
                    if !key.value().starts_with(prefix.as_str()) {
                        break;
                    }
                    keys.push(key.value().to_string());
                }
                keys
            };
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            deleted += keys.len();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%workspace, deleted, "workspace deleted");
        Ok(deleted)
    }
}
