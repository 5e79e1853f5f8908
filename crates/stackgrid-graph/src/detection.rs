//! Topology detection runs.
//!
//! One call scans a folder, builds the service graph, orders it, and
//! records the outcome as an immutable [`TopologyDetectionRun`]. Failures
//! and cancellation are recorded on the run rather than returned.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use stackgrid_core::ids::{epoch_secs, new_run_id};
use stackgrid_core::{
    DetectedPattern, RunStatus, ServiceCandidate, StackConfig, TopologyDetectionRun,
};
use stackgrid_scanner::{FolderTree, ScanSettings, Scanner, SignatureRegistry};
use tracing::{info, warn};

use crate::analyzer;
use crate::builder::{EdgeDeclaration, GraphBuilder};
use crate::error::{DetectionError, GraphError};

/// Snapshot `root` from disk and analyze it.
pub fn detect_topology(root: &Path, config: &StackConfig, cancel: &AtomicBool) -> TopologyDetectionRun {
    let workspace = config.workspace_name(root);
    let mut run = start_run(&workspace, &root.display().to_string());
    let settings = ScanSettings::from(&config.scan);

    let outcome = FolderTree::from_dir(root, &settings)
        .map_err(DetectionError::from)
        .and_then(|tree| analyze(&mut run, &tree, settings, config, cancel));
    finish(run, outcome)
}

/// Analyze an already captured snapshot.
pub fn detect_in_tree(
    tree: &FolderTree,
    workspace: &str,
    config: &StackConfig,
    cancel: &AtomicBool,
) -> TopologyDetectionRun {
    let mut run = start_run(workspace, &tree.root.display().to_string());
    let outcome = analyze(&mut run, tree, ScanSettings::from(&config.scan), config, cancel);
    finish(run, outcome)
}

fn start_run(workspace: &str, folder_path: &str) -> TopologyDetectionRun {
    TopologyDetectionRun {
        id: new_run_id(folder_path),
        workspace: workspace.to_string(),
        folder_path: folder_path.to_string(),
        detection_timestamp: epoch_secs(),
        detected_patterns: BTreeMap::new(),
        service_graph: None,
        recommended_services: Vec::new(),
        deployment_strategy: None,
        status: RunStatus::Analyzing,
        total_services_detected: 0,
        error: None,
    }
}

fn analyze(
    run: &mut TopologyDetectionRun,
    tree: &FolderTree,
    settings: ScanSettings,
    config: &StackConfig,
    cancel: &AtomicBool,
) -> Result<(), DetectionError> {
    checkpoint(cancel)?;
    let scanner = Scanner::new(settings, SignatureRegistry::builtin()?);
    let candidates = scanner.scan_run(tree, &run.id, run.detection_timestamp)?;
    run.detected_patterns = patterns(&candidates);

    checkpoint(cancel)?;
    let explicit = config
        .dependencies
        .iter()
        .map(EdgeDeclaration::try_from)
        .collect::<Result<Vec<_>, GraphError>>()?;
    let graph = GraphBuilder::from_config(&run.workspace, config).build(&candidates, &explicit)?;

    checkpoint(cancel)?;
    run.recommended_services = analyzer::topological_order(&graph)?
        .iter()
        .filter_map(|id| graph.node(id).map(|n| n.name.clone()))
        .collect();
    run.deployment_strategy = Some(analyzer::recommend_strategy(&graph)?);
    run.total_services_detected = graph.len();
    run.service_graph = Some(graph.to_snapshot());
    Ok(())
}

fn checkpoint(cancel: &AtomicBool) -> Result<(), DetectionError> {
    if cancel.load(Ordering::SeqCst) {
        Err(DetectionError::Cancelled)
    } else {
        Ok(())
    }
}

fn finish(mut run: TopologyDetectionRun, outcome: Result<(), DetectionError>) -> TopologyDetectionRun {
    match outcome {
        Ok(()) => {
            run.status = RunStatus::Completed;
            info!(
                run = %run.id,
                workspace = %run.workspace,
                services = run.total_services_detected,
                "topology detection completed"
            );
        }
        Err(DetectionError::Cancelled) => {
            run.status = RunStatus::Cancelled;
            info!(run = %run.id, "topology detection cancelled");
        }
        Err(e) => {
            warn!(run = %run.id, error = %e, "topology detection failed");
            run.status = RunStatus::Failed;
            run.error = Some(e.to_string());
        }
    }
    run
}

/// Best confidence per service type, with `folder: signal` evidence.
fn patterns(candidates: &[ServiceCandidate]) -> BTreeMap<String, DetectedPattern> {
    let mut out: BTreeMap<String, DetectedPattern> = BTreeMap::new();
    for c in candidates {
        let evidence = c
            .matched_signals
            .iter()
            .map(|s| format!("{}: {s}", c.folder_path));
        let entry = out
            .entry(c.inferred_type.as_str().to_string())
            .or_insert_with(|| DetectedPattern {
                confidence: 0.0,
                evidence: Vec::new(),
            });
        entry.confidence = entry.confidence.max(c.confidence);
        entry.evidence.extend(evidence);
    }
    out
}
