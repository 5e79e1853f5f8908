pub mod detect;
pub mod graph;
pub mod plan;
pub mod scan;

use std::path::Path;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, bail};
use stackgrid_core::config::CONFIG_FILE;
use stackgrid_core::{RunStatus, StackConfig, TopologyDetectionRun};
use stackgrid_graph::ServiceGraph;

/// Run a detection over `root` and return it with its graph.
///
/// A failed run is an error here; the CLI has nothing to show without a graph.
pub fn detect_graph(root: &Path) -> anyhow::Result<(StackConfig, TopologyDetectionRun, ServiceGraph)> {
    let config = StackConfig::load_or_default(root)
        .with_context(|| format!("loading {}", root.join(CONFIG_FILE).display()))?;
    let run = stackgrid_graph::detect_topology(root, &config, &AtomicBool::new(false));
    if run.status != RunStatus::Completed {
        bail!(
            "detection {:?} in {}: {}",
            run.status,
            root.display(),
            run.error.as_deref().unwrap_or("no detail")
        );
    }
    let Some(snapshot) = run.service_graph.clone() else {
        bail!("detection produced no graph");
    };
    let graph = ServiceGraph::from_snapshot(snapshot)?;
    Ok((config, run, graph))
}

pub fn init(root: &Path) -> anyhow::Result<()> {
    let output = root.join(CONFIG_FILE);
    if output.exists() {
        bail!("{} already exists", output.display());
    }
    let name = StackConfig::default().workspace_name(root);
    std::fs::write(&output, StackConfig::scaffold(&name).to_toml_string()?)?;
    println!("✓ Generated {}", output.display());
    Ok(())
}
