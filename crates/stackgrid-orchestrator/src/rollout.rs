//! Tiered rollout of a whole workspace.
//!
//! Walks the analyzer's startup tiers in order. Nodes of one tier deploy
//! concurrently; the next tier starts only after the previous one settled.
//! A node whose required dependency failed (or was skipped) is skipped too.

use std::collections::HashSet;

use serde::Serialize;
use stackgrid_core::NodeId;
use stackgrid_graph::{ServiceGraph, analyzer};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::backend::DeployRequest;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::orchestrator::Orchestrator;

/// Outcome of [`deploy_graph`], by service name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RolloutReport {
    pub workspace: String,
    pub graph_version: u64,
    pub tiers: Vec<Vec<String>>,
    pub deployed: Vec<String>,
    /// Already serving, left alone.
    pub unchanged: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub skipped: Vec<String>,
}

impl RolloutReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

/// Deploy the latest registered graph of `workspace`, tier by tier.
pub async fn deploy_graph(
    orchestrator: &Orchestrator,
    workspace: &str,
    request: &DeployRequest,
) -> OrchestratorResult<RolloutReport> {
    let snapshot = orchestrator
        .state()
        .latest_graph(workspace)?
        .ok_or_else(|| OrchestratorError::GraphNotFound(workspace.to_string()))?;
    let graph = ServiceGraph::from_snapshot(snapshot)?;
    let tiers = analyzer::startup_tiers(&graph)?;

    let name_of = |id: &str| graph.node(id).map(|n| n.name.clone()).unwrap_or_else(|| id.to_string());
    let mut report = RolloutReport {
        workspace: workspace.to_string(),
        graph_version: graph.version(),
        tiers: tiers
            .iter()
            .map(|tier| tier.iter().map(|id| name_of(id)).collect())
            .collect(),
        ..RolloutReport::default()
    };
    let mut failed: HashSet<NodeId> = HashSet::new();

    for (index, tier) in tiers.iter().enumerate() {
        info!(%workspace, tier = index, nodes = tier.len(), "deploying tier");
        let mut set = JoinSet::new();

        for id in tier {
            let blocked_by = graph
                .dependencies_of(id)
                .filter(|e| e.is_required)
                .find(|e| failed.contains(&e.required_service_id))
                .map(|e| name_of(&e.required_service_id));
            if let Some(dependency) = blocked_by {
                warn!(node = %name_of(id), %dependency, "skipped: required dependency did not deploy");
                failed.insert(id.clone());
                report.skipped.push(name_of(id));
                continue;
            }

            let serving = orchestrator
                .state()
                .get_node(workspace, id)?
                .is_some_and(|n| n.status.is_serving());
            if serving {
                report.unchanged.push(name_of(id));
                continue;
            }

            let orchestrator = orchestrator.clone();
            let workspace = workspace.to_string();
            let request = request.clone();
            let id = id.clone();
            set.spawn(async move {
                let result = orchestrator.deploy(&workspace, &id, &request).await;
                (id, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, Ok(_))) => report.deployed.push(name_of(&id)),
                Ok((id, Err(e))) => {
                    error!(node = %name_of(&id), error = %e, "deploy failed");
                    report.failed.push((name_of(&id), e.to_string()));
                    failed.insert(id);
                }
                Err(e) => error!(error = %e, "deploy task panicked"),
            }
        }
    }

    report.deployed.sort();
    report.failed.sort();
    info!(
        %workspace,
        deployed = report.deployed.len(),
        failed = report.failed.len(),
        skipped = report.skipped.len(),
        "rollout finished"
    );
    Ok(report)
}

impl Orchestrator {
    /// See [`deploy_graph`].
    pub async fn deploy_graph(&self, workspace: &str, request: &DeployRequest) -> OrchestratorResult<RolloutReport> {
        deploy_graph(self, workspace, request).await
    }
}
