//! Human-readable candidate report.

use std::collections::BTreeMap;
use std::path::Path;

use stackgrid_core::ServiceCandidate;

pub fn format_candidates(root: &Path, candidates: &[ServiceCandidate]) -> String {
    let mut out = String::new();

    out.push_str("\n╔══════════════════════════════════════════╗\n");
    out.push_str("║  stackgrid folder scan                   ║\n");
    out.push_str("╠══════════════════════════════════════════╣\n");
    out.push_str(&format!("║  Root:       {:<28}║\n", truncate(&root.display().to_string(), 28)));
    out.push_str(&format!("║  Candidates: {:<28}║\n", candidates.len()));
    out.push_str("╚══════════════════════════════════════════╝\n\n");

    if candidates.is_empty() {
        out.push_str("No services detected.\n");
        return out;
    }

    let mut by_folder: BTreeMap<&str, Vec<&ServiceCandidate>> = BTreeMap::new();
    for c in candidates {
        by_folder.entry(c.folder_path.as_str()).or_default().push(c);
    }

    for (folder, mut cands) in by_folder {
        cands.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        out.push_str(&format!("{folder}/\n"));
        for (i, c) in cands.iter().enumerate() {
            let marker = if i == 0 { "▶" } else { " " };
            out.push_str(&format!(
                "  {marker} {:<12} {:>5.1}%  {}\n",
                c.inferred_type.as_str(),
                c.confidence * 100.0,
                c.matched_signals.join(", ")
            ));
        }
        if let Some(top) = cands.first().filter(|c| !c.declared_env.is_empty()) {
            let keys: Vec<&str> = top.declared_env.keys().map(String::as_str).collect();
            out.push_str(&format!("    env: {}\n", keys.join(", ")));
        }
        out.push('\n');
    }

    out
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let tail: String = s.chars().rev().take(max - 1).collect::<Vec<_>>().into_iter().rev().collect();
    format!("…{tail}")
}
