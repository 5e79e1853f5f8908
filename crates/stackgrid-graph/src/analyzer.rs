//! Dependency analyzer.
//!
//! Pure functions over a [`ServiceGraph`]: cycle detection, startup
//! ordering and tiers, roots and leaves, and a complexity score that feeds
//! the recommended deployment strategy. Only required edges constrain
//! ordering; optional edges contribute their `startup_order` hint.

use std::collections::{BTreeMap, HashMap, VecDeque};

use stackgrid_core::{DependencyEdge, DeploymentStrategy, NodeId};

use crate::error::{GraphError, GraphResult};
use crate::graph::ServiceGraph;

// ── Cycles ────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Open,
    Done,
}

/// First required cycle found, as `[a, b, .., a]`. Nodes are visited in id
/// order so the result is deterministic.
pub fn find_cycle_in(ids: &[NodeId], edges: &[DependencyEdge]) -> Option<Vec<NodeId>> {
    let mut adj: HashMap<&str, Vec<&str>> = HashMap::new();
    for e in edges.iter().filter(|e| e.is_required) {
        adj.entry(e.dependent_service_id.as_str())
            .or_default()
            .push(e.required_service_id.as_str());
    }
    for targets in adj.values_mut() {
        targets.sort_unstable();
    }

    let mut sorted: Vec<&str> = ids.iter().map(String::as_str).collect();
    sorted.sort_unstable();

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut stack = Vec::new();
    for id in sorted {
        if !marks.contains_key(id) {
            if let Some(cycle) = visit(id, &adj, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

fn visit<'a>(
    id: &'a str,
    adj: &HashMap<&'a str, Vec<&'a str>>,
    marks: &mut HashMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<NodeId>> {
    marks.insert(id, Mark::Open);
    stack.push(id);
    for &next in adj.get(id).into_iter().flatten() {
        match marks.get(next).copied() {
            Some(Mark::Open) => {
                let start = stack.iter().position(|&s| s == next)?;
                let mut cycle: Vec<NodeId> = stack[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(next.to_string());
                return Some(cycle);
            }
            Some(Mark::Done) => {}
            None => {
                if let Some(cycle) = visit(next, adj, marks, stack) {
                    return Some(cycle);
                }
            }
        }
    }
    stack.pop();
    marks.insert(id, Mark::Done);
    None
}

pub fn find_cycle(graph: &ServiceGraph) -> Option<Vec<NodeId>> {
    let ids: Vec<NodeId> = graph.nodes().iter().map(|n| n.id.clone()).collect();
    find_cycle_in(&ids, graph.edges())
}

/// True iff some required path returns to its origin.
pub fn detect_cycle(graph: &ServiceGraph) -> bool {
    find_cycle(graph).is_some()
}

// ── Ordering ──────────────────────────────────────────────────────

/// Per-node placement computed in dependency order.
struct Layout<'a> {
    /// Effective startup hint.
    hint: HashMap<&'a str, u8>,
    /// Required-dependency depth among nodes with the same hint.
    depth: HashMap<&'a str, usize>,
    /// Longest required chain ending at the node, counted in nodes.
    chain: HashMap<&'a str, usize>,
}

fn layout(graph: &ServiceGraph) -> GraphResult<Layout<'_>> {
    let mut pending: HashMap<&str, usize> = graph.nodes().iter().map(|n| (n.id.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for e in graph.required_edges() {
        *pending.entry(e.dependent_service_id.as_str()).or_default() += 1;
        dependents
            .entry(e.required_service_id.as_str())
            .or_default()
            .push(e.dependent_service_id.as_str());
    }

    let mut ready: Vec<&str> = pending
        .iter()
        .filter(|&(_, &n)| n == 0)
        .map(|(&id, _)| id)
        .collect();
    ready.sort_unstable();
    let mut queue: VecDeque<&str> = ready.into();

    let mut layout = Layout {
        hint: HashMap::new(),
        depth: HashMap::new(),
        chain: HashMap::new(),
    };

    while let Some(id) = queue.pop_front() {
        let Some(node) = graph.node(id) else {
            return Err(GraphError::UnknownNode(id.to_string()));
        };

        let mut hint = node.startup_order;
        let mut required = Vec::new();
        for e in graph.dependencies_of(id) {
            hint = hint.max(e.startup_order);
            if e.is_required {
                required.push(e.required_service_id.as_str());
            }
        }
        for dep in &required {
            hint = hint.max(layout.hint.get(dep).copied().unwrap_or(0));
        }

        let depth = required
            .iter()
            .filter(|dep| layout.hint.get(*dep) == Some(&hint))
            .map(|dep| layout.depth.get(dep).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        let chain = 1 + required
            .iter()
            .map(|dep| layout.chain.get(dep).copied().unwrap_or(0))
            .max()
            .unwrap_or(0);

        layout.hint.insert(id, hint);
        layout.depth.insert(id, depth);
        layout.chain.insert(id, chain);

        let mut unlocked = Vec::new();
        for &d in dependents.get(id).into_iter().flatten() {
            if let Some(n) = pending.get_mut(d) {
                *n -= 1;
                if *n == 0 {
                    unlocked.push(d);
                }
            }
        }
        unlocked.sort_unstable();
        queue.extend(unlocked);
    }

    if layout.hint.len() != graph.len() {
        return Err(GraphError::CyclicDependency {
            path: find_cycle(graph).unwrap_or_default(),
        });
    }
    Ok(layout)
}

/// Effective startup hint per node: its own `startup_order`, raised by the
/// hints on its outgoing edges and by the effective hint of every required
/// dependency.
pub fn effective_startup_order(graph: &ServiceGraph) -> GraphResult<BTreeMap<NodeId, u8>> {
    let layout = layout(graph)?;
    Ok(layout
        .hint
        .into_iter()
        .map(|(id, h)| (id.to_string(), h))
        .collect())
}

/// Nodes grouped into tiers that may start in parallel. No required edge
/// connects two members of the same tier, and every required dependency
/// sits in an earlier tier than its dependent.
pub fn startup_tiers(graph: &ServiceGraph) -> GraphResult<Vec<Vec<NodeId>>> {
    let layout = layout(graph)?;

    let mut tiers: BTreeMap<(u8, usize), Vec<&str>> = BTreeMap::new();
    for node in graph.nodes() {
        let id = node.id.as_str();
        let key = (
            layout.hint.get(id).copied().unwrap_or(0),
            layout.depth.get(id).copied().unwrap_or(0),
        );
        tiers.entry(key).or_default().push(id);
    }

    Ok(tiers
        .into_values()
        .map(|mut tier| {
            tier.sort_by_key(|id| (tier_rank(graph, id), graph.node(id).map(|n| n.name.as_str())));
            tier.into_iter().map(String::from).collect()
        })
        .collect())
}

/// 0 for nodes some `requires`/`depends_on` edge points at, 1 otherwise.
fn tier_rank(graph: &ServiceGraph, id: &str) -> u8 {
    if graph
        .dependents_of(id)
        .any(|e| e.dependency_type.is_required_typed())
    {
        0
    } else {
        1
    }
}

/// All nodes in startup order.
pub fn topological_order(graph: &ServiceGraph) -> GraphResult<Vec<NodeId>> {
    Ok(startup_tiers(graph)?.into_iter().flatten().collect())
}

/// Nodes without required dependencies, by name.
pub fn root_services(graph: &ServiceGraph) -> Vec<NodeId> {
    by_name(graph, |id| !graph.dependencies_of(id).any(|e| e.is_required))
}

/// Nodes no required edge points at, by name.
pub fn leaf_services(graph: &ServiceGraph) -> Vec<NodeId> {
    by_name(graph, |id| !graph.dependents_of(id).any(|e| e.is_required))
}

fn by_name(graph: &ServiceGraph, keep: impl Fn(&str) -> bool) -> Vec<NodeId> {
    let mut nodes: Vec<_> = graph.nodes().iter().filter(|n| keep(&n.id)).collect();
    nodes.sort_by(|a, b| a.name.cmp(&b.name));
    nodes.into_iter().map(|n| n.id.clone()).collect()
}

/// Longest chain of required edges, counted in nodes. 0 for an empty graph.
pub fn max_chain_depth(graph: &ServiceGraph) -> usize {
    match layout(graph) {
        Ok(layout) => layout.chain.values().copied().max().unwrap_or(0),
        Err(_) => 0,
    }
}

// ── Complexity ────────────────────────────────────────────────────

/// Tunable weights for [`complexity_score_with`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComplexityWeights {
    pub node: f64,
    pub edge: f64,
    pub depth: f64,
}

impl Default for ComplexityWeights {
    fn default() -> Self {
        Self {
            node: 1.0,
            edge: 1.5,
            depth: 3.0,
        }
    }
}

/// Score at or above which a rollout is staged.
pub const STAGED_SCORE: f64 = 30.0;
/// Required chain length at or above which a rollout is staged.
pub const STAGED_DEPTH: usize = 4;

pub fn complexity_score(graph: &ServiceGraph) -> f64 {
    complexity_score_with(graph, &ComplexityWeights::default())
}

/// Monotonic in node count, edge count, and max required chain depth.
pub fn complexity_score_with(graph: &ServiceGraph, weights: &ComplexityWeights) -> f64 {
    graph.len() as f64 * weights.node
        + graph.edges().len() as f64 * weights.edge
        + max_chain_depth(graph) as f64 * weights.depth
}

/// Advisory rollout shape for the graph.
pub fn recommend_strategy(graph: &ServiceGraph) -> GraphResult<DeploymentStrategy> {
    if graph.len() <= 1 {
        return Ok(DeploymentStrategy::Single);
    }
    if complexity_score(graph) >= STAGED_SCORE || max_chain_depth(graph) >= STAGED_DEPTH {
        return Ok(DeploymentStrategy::Staged);
    }
    let tiers = startup_tiers(graph)?;
    if tiers.iter().all(|t| t.len() == 1) {
        Ok(DeploymentStrategy::Sequential)
    } else {
        Ok(DeploymentStrategy::ParallelTiers)
    }
}
