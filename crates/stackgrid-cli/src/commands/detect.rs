use std::path::Path;
use std::sync::atomic::AtomicBool;

use anyhow::Context;
use stackgrid_core::{GraphSnapshot, RunStatus, StackConfig, TopologyDetectionRun};
use stackgrid_state::StateStore;
use tracing::info;

use crate::OutputFormat;

pub const STATE_FILE: &str = "state.redb";

pub fn detect(path: &Path, data_dir: &Path, format: OutputFormat) -> anyhow::Result<()> {
    let config = StackConfig::load_or_default(path)?;
    let mut run = stackgrid_graph::detect_topology(path, &config, &AtomicBool::new(false));

    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    let state = StateStore::open(&data_dir.join(STATE_FILE))?;
    record(&state, &mut run)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&run)?),
        OutputFormat::Text => print!("{}", render(&run)),
    }
    if run.status == RunStatus::Failed {
        anyhow::bail!("detection failed: {}", run.error.as_deref().unwrap_or("no detail"));
    }
    Ok(())
}

/// Persist the run and, when it produced one, its graph as the workspace's
/// next graph version.
fn record(state: &StateStore, run: &mut TopologyDetectionRun) -> anyhow::Result<()> {
    if let Some(snapshot) = run.service_graph.as_mut() {
        let next = next_version(state.latest_graph(&run.workspace)?.as_ref(), snapshot.version);
        snapshot.version = next;
        state.put_graph(snapshot)?;
    }
    state.put_run(run)?;
    info!(
        run = %run.id,
        workspace = %run.workspace,
        graph_version = run.service_graph.as_ref().map(|g| g.version),
        "detection recorded"
    );
    Ok(())
}

fn next_version(latest: Option<&GraphSnapshot>, built: u64) -> u64 {
    match latest {
        Some(stored) if stored.version >= built => stored.version + 1,
        _ => built,
    }
}

fn render(run: &TopologyDetectionRun) -> String {
    let mut out = String::new();
    out.push_str(&format!("run {} ({:?})\n", run.id, run.status));
    out.push_str(&format!("workspace {}: {} services\n", run.workspace, run.total_services_detected));
    for (service_type, pattern) in &run.detected_patterns {
        out.push_str(&format!("  {:<12} {:>5.1}%\n", service_type, pattern.confidence * 100.0));
    }
    if !run.recommended_services.is_empty() {
        out.push_str(&format!("startup order: {}\n", run.recommended_services.join(" → ")));
    }
    if let Some(strategy) = run.deployment_strategy {
        out.push_str(&format!("strategy: {}\n", strategy.label()));
    }
    if let Some(error) = &run.error {
        out.push_str(&format!("error: {error}\n"));
    }
    out
}
