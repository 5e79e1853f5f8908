use std::path::Path;

use serde::Serialize;
use stackgrid_core::DeploymentStrategy;
use stackgrid_graph::{ServiceGraph, analyzer};

use crate::OutputFormat;

#[derive(Debug, Serialize)]
struct GraphView {
    workspace: String,
    version: u64,
    services: Vec<ServiceView>,
    dependencies: Vec<EdgeView>,
    /// Startup tiers by service name.
    tiers: Vec<Vec<String>>,
    roots: Vec<String>,
    leaves: Vec<String>,
    max_chain_depth: usize,
    complexity: f64,
    strategy: DeploymentStrategy,
}

#[derive(Debug, Serialize)]
struct ServiceView {
    name: String,
    folder: String,
    service_type: String,
    port: Option<u16>,
    startup_order: u8,
}

#[derive(Debug, Serialize)]
struct EdgeView {
    from: String,
    to: String,
    kind: String,
    required: bool,
    env: Option<String>,
}

pub fn graph(path: &Path, format: OutputFormat) -> anyhow::Result<()> {
    let (_, _, graph) = super::detect_graph(path)?;
    let view = view(&graph)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&view)?),
        OutputFormat::Text => print!("{}", render(&view)),
    }
    Ok(())
}

fn name_of(graph: &ServiceGraph, id: &str) -> String {
    graph
        .node(id)
        .map(|n| n.name.clone())
        .unwrap_or_else(|| id.to_string())
}

fn view(graph: &ServiceGraph) -> anyhow::Result<GraphView> {
    let names = |ids: Vec<String>| ids.iter().map(|id| name_of(graph, id)).collect::<Vec<_>>();

    let mut services: Vec<ServiceView> = graph
        .nodes()
        .iter()
        .map(|n| ServiceView {
            name: n.name.clone(),
            folder: n.folder_path.clone(),
            service_type: n.service_type.as_str().to_string(),
            port: n.primary_port(),
            startup_order: n.startup_order,
        })
        .collect();
    services.sort_by(|a, b| a.name.cmp(&b.name));

    let mut dependencies: Vec<EdgeView> = graph
        .edges()
        .iter()
        .map(|e| EdgeView {
            from: name_of(graph, &e.dependent_service_id),
            to: name_of(graph, &e.required_service_id),
            kind: e.dependency_type.as_str().to_string(),
            required: e.is_required,
            env: e.environment_variable.clone(),
        })
        .collect();
    dependencies.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));

    Ok(GraphView {
        workspace: graph.workspace().to_string(),
        version: graph.version(),
        services,
        dependencies,
        tiers: analyzer::startup_tiers(graph)?.into_iter().map(names).collect(),
        roots: names(analyzer::root_services(graph)),
        leaves: names(analyzer::leaf_services(graph)),
        max_chain_depth: analyzer::max_chain_depth(graph),
        complexity: analyzer::complexity_score(graph),
        strategy: analyzer::recommend_strategy(graph)?,
    })
}

fn render(view: &GraphView) -> String {
    let mut out = String::new();
    out.push_str(&format!("workspace {} (graph v{})\n\n", view.workspace, view.version));

    out.push_str("Services:\n");
    for s in &view.services {
        let port = s.port.map(|p| format!(":{p}")).unwrap_or_default();
        out.push_str(&format!(
            "  {:<16} {:<10} {}{}  order={}\n",
            s.name, s.service_type, s.folder, port, s.startup_order
        ));
    }

    if !view.dependencies.is_empty() {
        out.push_str("\nDependencies:\n");
        for d in &view.dependencies {
            let marker = if d.required { "→" } else { "⇢" };
            let env = d.env.as_deref().map(|e| format!("  via {e}")).unwrap_or_default();
            out.push_str(&format!("  {} {marker} {} ({}){env}\n", d.from, d.to, d.kind));
        }
    }

    out.push_str("\nStartup tiers:\n");
    for (i, tier) in view.tiers.iter().enumerate() {
        out.push_str(&format!("  {i}: {}\n", tier.join(", ")));
    }
    out.push_str(&format!(
        "\nStrategy: {} (complexity {:.1}, depth {})\n",
        view.strategy.label(),
        view.complexity,
        view.max_chain_depth
    ));
    out
}
