//! Service graph builder.
//!
//! Turns scanner candidates into service nodes, folds in declared
//! dependencies, and infers `connects_to` edges from environment variable
//! names such as `DATABASE_URL` or `<NAME>_SERVICE_URL`.

use std::collections::{BTreeMap, HashSet};

use stackgrid_core::config::{DependencyConfig, ServiceOverride, StackConfig};
use stackgrid_core::{
    DependencyEdge, DependencyType, HealthCheckConfig, LifecycleEvent, ServiceCandidate,
    ServiceNode, ServiceType,
};
use tracing::{debug, info, warn};

use crate::error::{GraphError, GraphResult};
use crate::graph::ServiceGraph;

/// Variable-name suffixes that mark a connection setting, longest first.
const CONNECTION_SUFFIXES: &[&str] = &[
    "_CONNECTION_STRING",
    "_SERVICE_URL",
    "_ADDRESS",
    "_ADDR",
    "_HOST",
    "_URL",
    "_URI",
    "_DSN",
];

/// An explicitly declared dependency. Endpoints are service names or folder paths.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeDeclaration {
    pub from: String,
    pub to: String,
    pub kind: DependencyType,
    pub required: Option<bool>,
    pub startup_order: Option<u8>,
    pub timeout_seconds: Option<u64>,
    pub retry_count: Option<u32>,
    pub environment_variable: Option<String>,
    pub health_check_path: Option<String>,
}

impl EdgeDeclaration {
    pub fn new(from: &str, to: &str, kind: DependencyType) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            kind,
            required: None,
            startup_order: None,
            timeout_seconds: None,
            retry_count: None,
            environment_variable: None,
            health_check_path: None,
        }
    }
}

impl TryFrom<&DependencyConfig> for EdgeDeclaration {
    type Error = GraphError;

    fn try_from(d: &DependencyConfig) -> GraphResult<Self> {
        let kind = DependencyType::parse(&d.kind).ok_or_else(|| {
            GraphError::Validation(format!("dependency {} -> {}: unknown kind '{}'", d.from, d.to, d.kind))
        })?;
        Ok(Self {
            from: d.from.clone(),
            to: d.to.clone(),
            kind,
            required: d.required,
            startup_order: d.startup_order,
            timeout_seconds: d.timeout_seconds,
            retry_count: d.retry_count,
            environment_variable: d.environment_variable.clone(),
            health_check_path: d.health_check_path.clone(),
        })
    }
}

/// Per-folder outcome of candidate selection.
#[derive(Debug, Clone, Default)]
pub struct Selection<'a> {
    pub accepted: Vec<&'a ServiceCandidate>,
    /// Overlapping candidates that lost to the accepted one in their folder.
    pub shadowed: Vec<&'a ServiceCandidate>,
}

#[derive(Debug, Clone)]
pub struct GraphBuilder {
    workspace: String,
    min_confidence: f64,
    default_timeout_seconds: u64,
    default_retry_count: u32,
    health: Option<HealthCheckConfig>,
    overrides: BTreeMap<String, ServiceOverride>,
}

impl GraphBuilder {
    pub fn new(workspace: &str) -> Self {
        Self {
            workspace: workspace.to_string(),
            min_confidence: 0.3,
            default_timeout_seconds: DependencyEdge::DEFAULT_TIMEOUT_SECONDS,
            default_retry_count: DependencyEdge::DEFAULT_RETRY_COUNT,
            health: None,
            overrides: BTreeMap::new(),
        }
    }

    /// Builder carrying the scan threshold, dependency defaults, health
    /// settings, and per-service overrides of `config`.
    pub fn from_config(workspace: &str, config: &StackConfig) -> Self {
        Self {
            workspace: workspace.to_string(),
            min_confidence: config.scan.min_confidence,
            default_timeout_seconds: config.orchestrator.dependency_timeout_seconds,
            default_retry_count: config.orchestrator.dependency_retries,
            health: Some(HealthCheckConfig {
                path: "/health".to_string(),
                interval: config.health.interval.clone(),
                timeout: config.health.timeout.clone(),
                retries: config.health.unhealthy_threshold,
            }),
            overrides: config.services.clone(),
        }
    }

    pub fn min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    /// Build a graph from `candidates` and explicit edge declarations.
    pub fn build(
        &self,
        candidates: &[ServiceCandidate],
        explicit: &[EdgeDeclaration],
    ) -> GraphResult<ServiceGraph> {
        let selection = self.select(candidates);
        for c in &selection.shadowed {
            debug!(
                folder = %c.folder_path,
                service_type = %c.inferred_type,
                confidence = c.confidence,
                "overlapping candidate not promoted"
            );
        }

        let mut graph = ServiceGraph::new(&self.workspace);
        let mut taken = HashSet::new();
        for candidate in &selection.accepted {
            let name = unique_name(&self.base_name(&candidate.folder_path), &mut taken);
            graph = graph.with_node(self.node_for(candidate, &name)?)?;
        }

        for decl in explicit {
            graph = graph.with_edge(self.declared_edge(&graph, decl)?)?;
        }

        graph = self.infer_edges(graph)?;

        info!(
            workspace = %self.workspace,
            nodes = graph.len(),
            edges = graph.edges().len(),
            version = graph.version(),
            "service graph built"
        );
        Ok(graph)
    }

    /// Pick one candidate per folder: the most confident at or above the
    /// threshold, preferring a specific service type over a bare container,
    /// ties broken by type name.
    pub fn select<'a>(&self, candidates: &'a [ServiceCandidate]) -> Selection<'a> {
        let mut by_folder: BTreeMap<&str, Vec<&'a ServiceCandidate>> = BTreeMap::new();
        for c in candidates {
            by_folder.entry(c.folder_path.as_str()).or_default().push(c);
        }

        let mut selection = Selection::default();
        for (_, mut group) in by_folder {
            group.sort_by(|a, b| {
                let generic = |c: &ServiceCandidate| c.inferred_type == ServiceType::Container;
                generic(*a)
                    .cmp(&generic(*b))
                    .then(b.confidence.total_cmp(&a.confidence))
                    .then(a.inferred_type.as_str().cmp(b.inferred_type.as_str()))
            });
            let mut accepted = false;
            for c in group {
                if !accepted && c.confidence >= self.min_confidence {
                    selection.accepted.push(c);
                    accepted = true;
                } else {
                    selection.shadowed.push(c);
                }
            }
        }
        selection
    }

    fn base_name(&self, folder: &str) -> String {
        let base = match folder {
            "." | "" => self.workspace.as_str(),
            _ => folder.rsplit('/').next().unwrap_or(folder),
        };
        slugify(base)
    }

    fn node_for(&self, candidate: &ServiceCandidate, name: &str) -> GraphResult<ServiceNode> {
        let mut node = ServiceNode::skeleton(
            &self.workspace,
            name,
            &candidate.folder_path,
            candidate.inferred_type,
        );
        if let (Some(check), Some(defaults)) = (node.health_check_config.as_mut(), &self.health) {
            *check = HealthCheckConfig {
                path: check.path.clone(),
                ..defaults.clone()
            };
        }
        node.environment_variables = candidate.declared_env.clone();
        node.deployment_config
            .labels
            .insert("stackgrid.candidate".to_string(), candidate.id.clone());

        if let Some(o) = self.overrides.get(name) {
            apply_override(&mut node, o, self.health.as_ref());
        }

        node.status = node
            .status
            .on(LifecycleEvent::Detected)
            .map_err(|e| GraphError::Validation(e.to_string()))?;
        Ok(node)
    }

    fn declared_edge(&self, graph: &ServiceGraph, decl: &EdgeDeclaration) -> GraphResult<DependencyEdge> {
        let dependent = resolve(graph, &decl.from, decl)?;
        let required = resolve(graph, &decl.to, decl)?;

        let mut edge = DependencyEdge::new(&self.workspace, &dependent.id, &required.id, decl.kind);
        if let Some(r) = decl.required {
            edge.is_required = r;
        }
        edge.startup_order = decl.startup_order.unwrap_or(0);
        edge.timeout_seconds = decl.timeout_seconds.unwrap_or(self.default_timeout_seconds);
        edge.retry_count = decl.retry_count.unwrap_or(self.default_retry_count);
        edge.environment_variable = decl.environment_variable.clone();
        edge.health_check_path = decl
            .health_check_path
            .clone()
            .or_else(|| required.health_check_config.as_ref().map(|h| h.path.clone()));
        edge.connection_string_template = Some(required.service_type.connection_template());
        Ok(edge)
    }

    /// Infer `connects_to` edges from each node's environment. Inferred
    /// edges never replace a declared one, and an inferred edge that would
    /// close a required cycle is dropped.
    fn infer_edges(&self, mut graph: ServiceGraph) -> GraphResult<ServiceGraph> {
        let mut sources: Vec<(String, String, Vec<String>)> = graph
            .nodes()
            .iter()
            .map(|n| (n.id.clone(), n.name.clone(), n.environment_variables.keys().cloned().collect()))
            .collect();
        sources.sort_by(|a, b| a.1.cmp(&b.1));

        for (id, name, vars) in sources {
            for var in vars {
                let Some(target) = connection_target(&graph, &id, &var) else {
                    continue;
                };
                if graph.edge_between(&id, &target).is_some() {
                    continue;
                }
                let Some(required) = graph.node(&target) else {
                    continue;
                };

                let mut edge = DependencyEdge::new(&self.workspace, &id, &target, DependencyType::ConnectsTo);
                edge.is_required = required.service_type.is_datastore();
                edge.connection_string_template = Some(required.service_type.connection_template());
                edge.environment_variable = Some(var.clone());
                edge.health_check_path = required.health_check_config.as_ref().map(|h| h.path.clone());
                edge.timeout_seconds = self.default_timeout_seconds;
                edge.retry_count = self.default_retry_count;
                let required_name = required.name.clone();

                match graph.with_edge(edge) {
                    Ok(next) => {
                        debug!(from = %name, to = %required_name, var = %var, "inferred dependency");
                        graph = next;
                    }
                    Err(GraphError::CyclicDependency { path }) => {
                        warn!(
                            from = %name,
                            to = %required_name,
                            var = %var,
                            cycle = %path.join(" -> "),
                            "dropping inferred dependency that would create a cycle"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(graph)
    }
}

fn resolve<'g>(graph: &'g ServiceGraph, endpoint: &str, decl: &EdgeDeclaration) -> GraphResult<&'g ServiceNode> {
    graph
        .node_by_name(endpoint)
        .or_else(|| graph.node_by_folder(endpoint))
        .ok_or_else(|| {
            GraphError::Validation(format!(
                "dependency {} -> {}: no service named '{endpoint}'",
                decl.from, decl.to
            ))
        })
}

fn apply_override(node: &mut ServiceNode, o: &ServiceOverride, health: Option<&HealthCheckConfig>) {
    if let Some(port) = o.port {
        match node.port_mappings.first_mut() {
            Some(m) => m.container_port = port,
            None => node.port_mappings.push(stackgrid_core::PortMapping {
                container_port: port,
                host_port: None,
                protocol: "tcp".to_string(),
            }),
        }
    }
    if let Some(path) = &o.health_path {
        let base = health
            .cloned()
            .unwrap_or_else(|| HealthCheckConfig::http(path));
        node.health_check_config = Some(HealthCheckConfig {
            path: path.clone(),
            ..base
        });
    }
    if o.disable_health_check {
        node.health_check_config = None;
    }
    if let Some(order) = o.startup_order {
        node.startup_order = order;
    }
    if let Some(max) = o.max_replicas {
        node.scaling_config.max_replicas = max;
    }
    if let Some(replicas) = o.replicas {
        node.replicas = replicas;
        node.scaling_config.min_replicas = node.scaling_config.min_replicas.min(replicas);
        node.scaling_config.max_replicas = node.scaling_config.max_replicas.max(replicas);
    }
    node.environment_variables
        .extend(o.environment.iter().map(|(k, v)| (k.clone(), v.clone())));
}

/// Which node, if any, a variable like `REDIS_URL` or `API_SERVICE_URL` points at.
fn connection_target(graph: &ServiceGraph, from: &str, var: &str) -> Option<String> {
    let upper = var.to_ascii_uppercase();
    let prefix = CONNECTION_SUFFIXES
        .iter()
        .find_map(|s| upper.strip_suffix(s))
        .filter(|p| !p.is_empty())?;

    // A service name wins over a type convention.
    if let Some(n) = graph
        .nodes()
        .iter()
        .find(|n| n.id != from && env_key(&n.name) == prefix)
    {
        return Some(n.id.clone());
    }

    let matches: Vec<_> = graph
        .nodes()
        .iter()
        .filter(|n| n.id != from && n.service_type.env_prefixes().iter().any(|p| *p == prefix))
        .collect();
    match matches.as_slice() {
        [one] => Some(one.id.clone()),
        [] => None,
        _ => {
            debug!(var = %var, candidates = matches.len(), "ambiguous connection variable");
            None
        }
    }
}

fn env_key(name: &str) -> String {
    name.to_ascii_uppercase().replace('-', "_")
}

/// Lowercase, ASCII alphanumerics and single dashes.
pub fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "service".to_string()
    } else {
        trimmed.to_string()
    }
}

fn unique_name(base: &str, taken: &mut HashSet<String>) -> String {
    let mut name = base.to_string();
    let mut n = 2;
    while taken.contains(&name) {
        name = format!("{base}-{n}");
        n += 1;
    }
    taken.insert(name.clone());
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer;
    use stackgrid_core::ServiceStatus;

    fn cand(folder: &str, t: ServiceType, confidence: f64, env: &[(&str, &str)]) -> ServiceCandidate {
        ServiceCandidate {
            id: format!("cand-{folder}-{t}"),
            folder_path: folder.to_string(),
            inferred_type: t,
            confidence,
            matched_signals: vec![],
            detected_at: 0,
            declared_env: env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    fn builder() -> GraphBuilder {
        GraphBuilder::new("shop")
    }

    #[test]
    fn one_node_per_folder() {
        let cands = [
            cand("db", ServiceType::Container, 1.0, &[]),
            cand("db", ServiceType::Postgres, 0.7, &[]),
            cand("db", ServiceType::Mysql, 0.1, &[]),
            cand("web", ServiceType::Node, 0.9, &[]),
        ];
        let g = builder().build(&cands, &[]).unwrap();
        assert_eq!(g.len(), 2);
        assert_eq!(g.node_by_name("db").unwrap().service_type, ServiceType::Postgres);
        assert!(g.nodes().iter().all(|n| n.status == ServiceStatus::Detected));
    }

    #[test]
    fn ties_break_by_type_name() {
        let cands = [
            cand("svc", ServiceType::Python, 0.5, &[]),
            cand("svc", ServiceType::Go, 0.5, &[]),
        ];
        let g = builder().build(&cands, &[]).unwrap();
        assert_eq!(g.nodes()[0].service_type, ServiceType::Go);
    }

    #[test]
    fn below_threshold_folders_are_skipped() {
        let g = builder()
            .min_confidence(0.6)
            .build(&[cand("x", ServiceType::Node, 0.5, &[])], &[])
            .unwrap();
        assert!(g.is_empty());
    }

    #[test]
    fn names_are_slugged_and_deduplicated() {
        let cands = [
            cand("apps/My API", ServiceType::Go, 0.9, &[]),
            cand("services/my_api", ServiceType::Go, 0.9, &[]),
            cand(".", ServiceType::Node, 0.9, &[]),
        ];
        let g = builder().build(&cands, &[]).unwrap();
        let mut names: Vec<_> = g.nodes().iter().map(|n| n.name.as_str()).collect();
        names.sort();
        assert_eq!(names, ["my-api", "my-api-2", "shop"]);
    }

    #[test]
    fn declared_edges_resolve_by_name_or_folder() {
        let cands = [
            cand("apps/web", ServiceType::Node, 0.9, &[]),
            cand("infra/db", ServiceType::Postgres, 0.9, &[]),
        ];
        let mut decl = EdgeDeclaration::new("web", "infra/db", DependencyType::Requires);
        decl.timeout_seconds = Some(1);
        decl.retry_count = Some(2);
        let g = builder().build(&cands, &[decl]).unwrap();

        let e = &g.edges()[0];
        assert!(e.is_required);
        assert_eq!((e.timeout_seconds, e.retry_count), (1, 2));
        assert_eq!(e.connection_string_template.as_deref(), Some("postgres://{host}:{port}/app"));
    }

    #[test]
    fn declared_edges_to_unknown_services_fail() {
        let cands = [cand("web", ServiceType::Node, 0.9, &[])];
        let decl = EdgeDeclaration::new("web", "ghost", DependencyType::Requires);
        assert!(matches!(builder().build(&cands, &[decl]), Err(GraphError::Validation(_))));

        let selfie = EdgeDeclaration::new("web", "web", DependencyType::Requires);
        assert!(matches!(builder().build(&cands, &[selfie]), Err(GraphError::Validation(_))));
    }

    #[test]
    fn declared_cycles_fail() {
        let cands = [
            cand("a", ServiceType::Go, 0.9, &[]),
            cand("b", ServiceType::Go, 0.9, &[]),
        ];
        let decls = [
            EdgeDeclaration::new("a", "b", DependencyType::Requires),
            EdgeDeclaration::new("b", "a", DependencyType::DependsOn),
        ];
        assert!(matches!(
            builder().build(&cands, &decls),
            Err(GraphError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn env_vars_infer_connections() {
        let cands = [
            cand(
                "web",
                ServiceType::Node,
                0.9,
                &[
                    ("DATABASE_URL", "postgres://db/app"),
                    ("REDIS_URL", "redis://cache"),
                    ("API_SERVICE_URL", "http://api"),
                    ("PORT", "3000"),
                ],
            ),
            cand("db", ServiceType::Postgres, 0.9, &[]),
            cand("cache", ServiceType::Redis, 0.9, &[]),
            cand("api", ServiceType::Go, 0.9, &[]),
        ];
        let g = builder().build(&cands, &[]).unwrap();
        let web = g.node_by_name("web").unwrap().id.clone();
        let to = |name: &str| g.edge_between(&web, &g.node_by_name(name).unwrap().id).unwrap();

        assert!(to("db").is_required);
        assert_eq!(to("db").environment_variable.as_deref(), Some("DATABASE_URL"));
        assert!(to("cache").is_required);
        assert!(!to("api").is_required);
        assert!(to("api").dependency_type == DependencyType::ConnectsTo);
        assert_eq!(g.edges().len(), 3);

        let order = analyzer::topological_order(&g).unwrap();
        assert_eq!(order.last(), Some(&web));
    }

    #[test]
    fn declared_edges_take_precedence_over_inference() {
        let cands = [
            cand("web", ServiceType::Node, 0.9, &[("DATABASE_URL", "x")]),
            cand("db", ServiceType::Postgres, 0.9, &[]),
        ];
        let decl = EdgeDeclaration::new("web", "db", DependencyType::WaitsFor);
        let g = builder().build(&cands, &[decl]).unwrap();
        assert_eq!(g.edges().len(), 1);
        assert_eq!(g.edges()[0].dependency_type, DependencyType::WaitsFor);
    }

    #[test]
    fn inferred_cycles_are_dropped() {
        // Two datastores pointing at each other by name.
        let cands = [
            cand("primary", ServiceType::Postgres, 0.9, &[("REPLICA_HOST", "replica")]),
            cand("replica", ServiceType::Postgres, 0.9, &[("PRIMARY_HOST", "primary")]),
        ];
        let g = builder().build(&cands, &[]).unwrap();
        assert_eq!(g.edges().len(), 1);
        assert!(!analyzer::detect_cycle(&g));
    }

    #[test]
    fn ambiguous_type_conventions_are_ignored() {
        let cands = [
            cand("web", ServiceType::Node, 0.9, &[("DATABASE_URL", "x")]),
            cand("pg", ServiceType::Postgres, 0.9, &[]),
            cand("mysql", ServiceType::Mysql, 0.9, &[]),
        ];
        let g = builder().build(&cands, &[]).unwrap();
        assert!(g.edges().is_empty());
    }

    #[test]
    fn overrides_and_config_apply() {
        let config: StackConfig = toml::from_str(
            r#"
[orchestrator]
dependency_timeout_seconds = 7

[health]
interval = "3s"
unhealthy_threshold = 5

[services.web]
port = 9000
health_path = "/ready"
startup_order = 20
replicas = 2
environment = { MODE = "prod" }

[services.db]
disable_health_check = true
"#,
        )
        .unwrap();
        let cands = [
            cand("web", ServiceType::Node, 0.9, &[("DATABASE_URL", "x")]),
            cand("db", ServiceType::Postgres, 0.9, &[]),
        ];
        let g = GraphBuilder::from_config("shop", &config).build(&cands, &[]).unwrap();
        let web = g.node_by_name("web").unwrap();
        assert_eq!(web.primary_port(), Some(9000));
        let check = web.health_check_config.as_ref().unwrap();
        assert_eq!((check.path.as_str(), check.interval.as_str(), check.retries), ("/ready", "3s", 5));
        assert_eq!(web.startup_order, 20);
        assert_eq!(web.replicas, 2);
        assert_eq!(web.environment_variables["MODE"], "prod");
        assert_eq!(g.edges()[0].timeout_seconds, 7);
    }

    #[test]
    fn slugify_examples() {
        assert_eq!(slugify("My Service!"), "my-service");
        assert_eq!(slugify("__"), "service");
        assert_eq!(slugify("api_v2"), "api-v2");
    }
}
