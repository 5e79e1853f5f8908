use std::path::Path;
use std::sync::Arc;

use stackgrid_graph::ServiceGraph;
use stackgrid_health::LivenessReadiness;
use stackgrid_orchestrator::{DeployRequest, DryRunBackend, Orchestrator, RolloutReport};
use stackgrid_state::StateStore;

use crate::OutputFormat;

pub async fn plan(path: &Path, fail_build: &[String], format: OutputFormat) -> anyhow::Result<()> {
    let (config, _, graph) = super::detect_graph(path)?;
    let report = rehearse(&graph, config.orchestrator.clone(), fail_build).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print!("{}", render(&report)),
    }
    Ok(())
}

/// Roll the graph out against an in-memory store and the dry-run backend.
///
/// Dependency waits are zeroed: nothing real is starting, so there is
/// nothing to wait for.
async fn rehearse(
    graph: &ServiceGraph,
    config: stackgrid_core::config::OrchestratorConfig,
    fail_build: &[String],
) -> anyhow::Result<RolloutReport> {
    let mut snapshot = graph.to_snapshot();
    for edge in &mut snapshot.edges {
        edge.timeout_seconds = 0;
    }
    let graph = ServiceGraph::from_snapshot(snapshot)?;

    let state = StateStore::open_in_memory()?;
    let backend = fail_build
        .iter()
        .fold(DryRunBackend::new(), |backend, name| backend.failing_build(name));
    let orchestrator = Orchestrator::new(
        state.clone(),
        Arc::new(backend),
        Arc::new(LivenessReadiness::new(state)),
        config,
    );

    orchestrator.register_graph(&graph).await?;
    Ok(orchestrator
        .deploy_graph(graph.workspace(), &DeployRequest::default())
        .await?)
}

fn render(report: &RolloutReport) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "rollout plan for {} (graph v{})\n\n",
        report.workspace, report.graph_version
    ));
    for (i, tier) in report.tiers.iter().enumerate() {
        out.push_str(&format!("tier {i}:\n"));
        for name in tier {
            let line = if report.deployed.contains(name) {
                format!("  ✓ {name}\n")
            } else if let Some((_, reason)) = report.failed.iter().find(|(n, _)| n == name) {
                format!("  ✗ {name}: {reason}\n")
            } else if report.skipped.contains(name) {
                format!("  - {name} (skipped)\n")
            } else {
                format!("  = {name} (unchanged)\n")
            };
            out.push_str(&line);
        }
    }
    out.push_str(&format!(
        "\n{} deployed, {} failed, {} skipped\n",
        report.deployed.len(),
        report.failed.len(),
        report.skipped.len()
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackgrid_core::config::OrchestratorConfig;
    use stackgrid_core::{DependencyEdge, DependencyType, ServiceNode, ServiceType};

    fn graph() -> ServiceGraph {
        let db = ServiceNode::skeleton("shop", "db", "db", ServiceType::Postgres);
        let web = ServiceNode::skeleton("shop", "web", "web", ServiceType::Node);
        let edge = DependencyEdge::new("shop", &web.id, &db.id, DependencyType::Requires);
        ServiceGraph::new("shop")
            .with_node(db)
            .unwrap()
            .with_node(web)
            .unwrap()
            .with_edge(edge)
            .unwrap()
    }

    #[tokio::test]
    async fn rehearsal_deploys_every_tier() {
        let report = rehearse(&graph(), OrchestratorConfig::default(), &[]).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.deployed, ["db", "web"]);
        assert!(render(&report).contains("✓ web"));
    }

    #[tokio::test]
    async fn failed_build_skips_dependents() {
        let report = rehearse(&graph(), OrchestratorConfig::default(), &["db".to_string()])
            .await
            .unwrap();
        assert_eq!(report.skipped, ["web"]);
        let text = render(&report);
        assert!(text.contains("✗ db"));
        assert!(text.contains("- web (skipped)"));
    }
}
