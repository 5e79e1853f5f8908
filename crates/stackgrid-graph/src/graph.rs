//! Immutable, versioned service graph.
//!
//! Nodes live in an arena indexed by id; edges refer to nodes by id. Every
//! mutation returns a new graph with `version + 1` and leaves the receiver
//! untouched, so a rejected edge can never leave a half-applied graph behind.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use stackgrid_core::ids::epoch_secs;
use stackgrid_core::{DependencyEdge, GraphSnapshot, NodeId, ServiceNode};

use crate::analyzer;
use crate::error::{GraphError, GraphResult};

/// Largest accepted `startup_order` hint.
pub const MAX_STARTUP_ORDER: u8 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "GraphSnapshot", try_from = "GraphSnapshot")]
pub struct ServiceGraph {
    workspace: String,
    version: u64,
    nodes: Vec<ServiceNode>,
    index: HashMap<NodeId, usize>,
    edges: Vec<DependencyEdge>,
    created_at: u64,
}

impl ServiceGraph {
    /// An empty graph at version 0.
    pub fn new(workspace: &str) -> Self {
        Self {
            workspace: workspace.to_string(),
            version: 0,
            nodes: Vec::new(),
            index: HashMap::new(),
            edges: Vec::new(),
            created_at: epoch_secs(),
        }
    }

    /// Rebuild a graph from its serialized form, re-checking every invariant.
    pub fn from_snapshot(snapshot: GraphSnapshot) -> GraphResult<Self> {
        let mut graph = Self {
            workspace: snapshot.workspace,
            version: snapshot.version,
            nodes: Vec::with_capacity(snapshot.nodes.len()),
            index: HashMap::with_capacity(snapshot.nodes.len()),
            edges: Vec::with_capacity(snapshot.edges.len()),
            created_at: snapshot.created_at,
        };

        let mut names = HashSet::new();
        for node in snapshot.nodes {
            graph.check_node(&node)?;
            if graph.index.contains_key(&node.id) {
                return Err(GraphError::Validation(format!("duplicate node id {}", node.id)));
            }
            if !names.insert(node.name.clone()) {
                return Err(GraphError::Validation(format!("duplicate service name {}", node.name)));
            }
            graph.index.insert(node.id.clone(), graph.nodes.len());
            graph.nodes.push(node);
        }

        let mut pairs = HashSet::new();
        for edge in snapshot.edges {
            graph.check_edge(&edge)?;
            if !pairs.insert((edge.dependent_service_id.clone(), edge.required_service_id.clone())) {
                return Err(GraphError::Validation(format!(
                    "duplicate edge {} -> {}",
                    edge.dependent_service_id, edge.required_service_id
                )));
            }
            graph.edges.push(edge);
        }

        let ids: Vec<NodeId> = graph.nodes.iter().map(|n| n.id.clone()).collect();
        if let Some(path) = analyzer::find_cycle_in(&ids, &graph.edges) {
            return Err(GraphError::CyclicDependency { path });
        }
        Ok(graph)
    }

    pub fn to_snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            workspace: self.workspace.clone(),
            version: self.version,
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
            created_at: self.created_at,
        }
    }

    // ── Accessors ─────────────────────────────────────────────────

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn nodes(&self) -> &[ServiceNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&ServiceNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn node_by_name(&self, name: &str) -> Option<&ServiceNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn node_by_folder(&self, folder: &str) -> Option<&ServiceNode> {
        self.nodes.iter().find(|n| n.folder_path == folder)
    }

    pub fn edge_between(&self, dependent: &str, required: &str) -> Option<&DependencyEdge> {
        self.edges.iter().find(|e| e.pair() == (dependent, required))
    }

    pub fn required_edges(&self) -> impl Iterator<Item = &DependencyEdge> {
        self.edges.iter().filter(|e| e.is_required)
    }

    /// Edges leaving `id`: the services it needs.
    pub fn dependencies_of<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a DependencyEdge> {
        self.edges.iter().filter(move |e| e.dependent_service_id == id)
    }

    /// Edges entering `id`: the services that need it.
    pub fn dependents_of<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a DependencyEdge> {
        self.edges.iter().filter(move |e| e.required_service_id == id)
    }

    // ── Versioned mutation ────────────────────────────────────────

    /// Add `node`, or replace the node with the same id.
    pub fn with_node(&self, node: ServiceNode) -> GraphResult<Self> {
        self.check_node(&node)?;
        if let Some(other) = self.node_by_name(&node.name).filter(|o| o.id != node.id) {
            return Err(GraphError::Validation(format!(
                "service name {} already used by {}",
                node.name, other.id
            )));
        }

        let mut next = self.next_version();
        let slot = next.index.get(&node.id).copied();
        match slot {
            Some(i) => next.nodes[i] = node,
            None => {
                next.index.insert(node.id.clone(), next.nodes.len());
                next.nodes.push(node);
            }
        }
        Ok(next)
    }

    /// Add `edge`. A second edge for the same pair is merged into the first:
    /// required wins, the larger timeout and retry budget win. Conflicting
    /// dependency types and required cycles are rejected.
    pub fn with_edge(&self, edge: DependencyEdge) -> GraphResult<Self> {
        self.check_edge(&edge)?;

        let existing = self
            .edges
            .iter()
            .position(|e| e.pair() == edge.pair());

        let merged = match existing {
            Some(i) => {
                let current = &self.edges[i];
                if current.dependency_type != edge.dependency_type {
                    return Err(GraphError::Validation(format!(
                        "conflicting dependency types for {} -> {}: {} vs {}",
                        edge.dependent_service_id,
                        edge.required_service_id,
                        current.dependency_type,
                        edge.dependency_type
                    )));
                }
                merge_edges(current, edge)
            }
            None => edge,
        };

        let newly_required = merged.is_required && existing.is_none_or(|i| !self.edges[i].is_required);
        if newly_required {
            if let Some(path) =
                self.required_path(&merged.required_service_id, &merged.dependent_service_id)
            {
                let mut cycle = vec![merged.dependent_service_id.clone()];
                cycle.extend(path);
                return Err(GraphError::CyclicDependency { path: cycle });
            }
        }

        let mut next = self.next_version();
        match existing {
            Some(i) => next.edges[i] = merged,
            None => next.edges.push(merged),
        }
        Ok(next)
    }

    /// Remove a node and every edge touching it.
    pub fn without_node(&self, id: &str) -> GraphResult<Self> {
        if !self.contains(id) {
            return Err(GraphError::UnknownNode(id.to_string()));
        }
        let mut next = self.next_version();
        next.nodes.retain(|n| n.id != id);
        next.edges
            .retain(|e| e.dependent_service_id != id && e.required_service_id != id);
        next.index = next
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();
        Ok(next)
    }

    fn next_version(&self) -> Self {
        let mut next = self.clone();
        next.version = self.version + 1;
        next.created_at = epoch_secs();
        next
    }

    fn check_node(&self, node: &ServiceNode) -> GraphResult<()> {
        if node.workspace != self.workspace {
            return Err(GraphError::Validation(format!(
                "node {} belongs to workspace {}, not {}",
                node.id, node.workspace, self.workspace
            )));
        }
        if node.name.is_empty() {
            return Err(GraphError::Validation(format!("node {} has an empty name", node.id)));
        }
        if node.startup_order > MAX_STARTUP_ORDER {
            return Err(GraphError::Validation(format!(
                "node {}: startup_order {} exceeds {MAX_STARTUP_ORDER}",
                node.name, node.startup_order
            )));
        }
        Ok(())
    }

    fn check_edge(&self, edge: &DependencyEdge) -> GraphResult<()> {
        if edge.workspace != self.workspace {
            return Err(GraphError::Validation(format!(
                "edge {} belongs to workspace {}, not {}",
                edge.id, edge.workspace, self.workspace
            )));
        }
        for id in [&edge.dependent_service_id, &edge.required_service_id] {
            if !self.contains(id) {
                return Err(GraphError::UnknownNode(id.clone()));
            }
        }
        if edge.dependent_service_id == edge.required_service_id {
            return Err(GraphError::Validation(format!(
                "service {} cannot depend on itself",
                edge.dependent_service_id
            )));
        }
        if edge.startup_order > MAX_STARTUP_ORDER {
            return Err(GraphError::Validation(format!(
                "edge {}: startup_order {} exceeds {MAX_STARTUP_ORDER}",
                edge.id, edge.startup_order
            )));
        }
        Ok(())
    }

    /// Shortest path `from .. to` over required edges, both ends included.
    fn required_path(&self, from: &str, to: &str) -> Option<Vec<NodeId>> {
        let mut parent: HashMap<&str, &str> = HashMap::new();
        let mut queue = VecDeque::from([from]);
        let mut seen = HashSet::from([from]);

        while let Some(current) = queue.pop_front() {
            if current == to {
                let mut path = vec![current.to_string()];
                let mut cursor = current;
                while let Some(&p) = parent.get(cursor) {
                    path.push(p.to_string());
                    cursor = p;
                }
                path.reverse();
                return Some(path);
            }
            for e in self.required_edges().filter(|e| e.dependent_service_id == current) {
                let next = e.required_service_id.as_str();
                if seen.insert(next) {
                    parent.insert(next, current);
                    queue.push_back(next);
                }
            }
        }
        None
    }
}

fn merge_edges(current: &DependencyEdge, incoming: DependencyEdge) -> DependencyEdge {
    DependencyEdge {
        id: current.id.clone(),
        is_required: current.is_required || incoming.is_required,
        timeout_seconds: current.timeout_seconds.max(incoming.timeout_seconds),
        retry_count: current.retry_count.max(incoming.retry_count),
        startup_order: current.startup_order.max(incoming.startup_order),
        connection_string_template: current
            .connection_string_template
            .clone()
            .or(incoming.connection_string_template),
        environment_variable: current
            .environment_variable
            .clone()
            .or(incoming.environment_variable),
        health_check_path: current.health_check_path.clone().or(incoming.health_check_path),
        ..incoming
    }
}

impl From<ServiceGraph> for GraphSnapshot {
    fn from(graph: ServiceGraph) -> Self {
        GraphSnapshot {
            workspace: graph.workspace,
            version: graph.version,
            nodes: graph.nodes,
            edges: graph.edges,
            created_at: graph.created_at,
        }
    }
}

impl TryFrom<GraphSnapshot> for ServiceGraph {
    type Error = GraphError;

    fn try_from(snapshot: GraphSnapshot) -> GraphResult<Self> {
        Self::from_snapshot(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackgrid_core::{DependencyType, ServiceType};

    fn node(name: &str, t: ServiceType) -> ServiceNode {
        ServiceNode::skeleton("ws", name, name, t)
    }

    fn edge(g: &ServiceGraph, from: &str, to: &str, t: DependencyType) -> DependencyEdge {
        let a = g.node_by_name(from).unwrap();
        let b = g.node_by_name(to).unwrap();
        DependencyEdge::new("ws", &a.id, &b.id, t)
    }

    fn web_db() -> ServiceGraph {
        ServiceGraph::new("ws")
            .with_node(node("web", ServiceType::Node))
            .unwrap()
            .with_node(node("db", ServiceType::Postgres))
            .unwrap()
    }

    #[test]
    fn mutations_bump_version_and_leave_original() {
        let g0 = ServiceGraph::new("ws");
        let g1 = g0.with_node(node("web", ServiceType::Node)).unwrap();
        assert_eq!(g0.version(), 0);
        assert!(g0.is_empty());
        assert_eq!(g1.version(), 1);
        assert_eq!(g1.len(), 1);
    }

    #[test]
    fn cycle_is_rejected_and_graph_unchanged() {
        let g = web_db();
        let e = edge(&g, "web", "db", DependencyType::Requires);
        let g = g.with_edge(e).unwrap();

        let back = edge(&g, "db", "web", DependencyType::Requires);
        let err = g.with_edge(back).unwrap_err();
        let db = g.node_by_name("db").unwrap().id.clone();
        let web = g.node_by_name("web").unwrap().id.clone();
        assert_eq!(err, GraphError::CyclicDependency { path: vec![db.clone(), web, db] });
        assert_eq!(g.edges().len(), 1);
    }

    #[test]
    fn optional_back_edge_is_allowed() {
        let g = web_db();
        let g = g.with_edge(edge(&g, "web", "db", DependencyType::Requires)).unwrap();
        let g = g.with_edge(edge(&g, "db", "web", DependencyType::CommunicatesWith)).unwrap();
        assert_eq!(g.edges().len(), 2);
    }

    #[test]
    fn duplicate_pair_merges() {
        let g = web_db();
        let mut a = edge(&g, "web", "db", DependencyType::ConnectsTo);
        a.timeout_seconds = 5;
        a.retry_count = 7;
        let mut b = a.clone();
        b.is_required = true;
        b.timeout_seconds = 60;
        b.retry_count = 1;

        let g = g.with_edge(a).unwrap().with_edge(b).unwrap();
        assert_eq!(g.edges().len(), 1);
        let e = &g.edges()[0];
        assert!(e.is_required);
        assert_eq!(e.timeout_seconds, 60);
        assert_eq!(e.retry_count, 7);
    }

    #[test]
    fn conflicting_types_are_rejected() {
        let g = web_db();
        let g = g.with_edge(edge(&g, "web", "db", DependencyType::Requires)).unwrap();
        let err = g.with_edge(edge(&g, "web", "db", DependencyType::WaitsFor)).unwrap_err();
        assert!(matches!(err, GraphError::Validation(_)));
    }

    #[test]
    fn self_and_unknown_edges_are_rejected() {
        let g = web_db();
        let web = g.node_by_name("web").unwrap().id.clone();
        let selfie = DependencyEdge::new("ws", &web, &web, DependencyType::Requires);
        assert!(matches!(g.with_edge(selfie), Err(GraphError::Validation(_))));

        let ghost = DependencyEdge::new("ws", &web, "svc-missing", DependencyType::Requires);
        assert!(matches!(g.with_edge(ghost), Err(GraphError::UnknownNode(_))));
    }

    #[test]
    fn names_are_unique() {
        let g = web_db();
        let mut clash = node("web", ServiceType::Go);
        clash.id = "svc-other".into();
        assert!(g.with_node(clash).is_err());
    }

    #[test]
    fn cross_workspace_nodes_are_rejected() {
        let g = ServiceGraph::new("ws");
        let foreign = ServiceNode::skeleton("other", "web", "web", ServiceType::Node);
        assert!(g.with_node(foreign).is_err());
    }

    #[test]
    fn snapshot_round_trip_revalidates() {
        let g = web_db();
        let g = g.with_edge(edge(&g, "web", "db", DependencyType::Requires)).unwrap();
        let json = serde_json::to_string(&g).unwrap();
        let back: ServiceGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(back, g);

        // A hand-edited snapshot with a cycle does not load.
        let mut snap = g.to_snapshot();
        let mut rev = snap.edges[0].clone();
        std::mem::swap(&mut rev.dependent_service_id, &mut rev.required_service_id);
        snap.edges.push(rev);
        assert!(matches!(
            ServiceGraph::from_snapshot(snap),
            Err(GraphError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn without_node_drops_its_edges() {
        let g = web_db();
        let g = g.with_edge(edge(&g, "web", "db", DependencyType::Requires)).unwrap();
        let db = g.node_by_name("db").unwrap().id.clone();
        let g = g.without_node(&db).unwrap();
        assert!(g.edges().is_empty());
        assert!(g.node_by_name("web").is_some());
        assert!(g.node(&db).is_none());
    }
}
