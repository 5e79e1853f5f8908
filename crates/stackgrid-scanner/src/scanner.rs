//! Folder scanner and pattern matcher.
//!
//! Scores every folder of a [`FolderTree`] against every [`Signature`].
//! Confidence is the matched share of a signature's total weight. Scanning
//! is pure: the same snapshot and run id always give the same candidates.

use std::collections::{BTreeMap, BTreeSet};

use stackgrid_core::ids::{derive_id, epoch_secs, new_run_id};
use stackgrid_core::ServiceCandidate;
use tracing::{debug, info};

use crate::env::declared_env;
use crate::error::ScanResult;
use crate::listing::{EntryKind, FolderTree, ScanSettings};
use crate::signatures::{Matcher, Signature, SignatureRegistry};

/// Levels below a folder that extension signals look into.
const EXTENSION_DEPTH: usize = 2;

/// What one folder contains, precomputed once per scan.
#[derive(Default)]
struct FolderView<'a> {
    files: BTreeSet<&'a str>,
    dirs: BTreeSet<&'a str>,
    /// Extensions of files in the folder or up to [`EXTENSION_DEPTH`] levels below.
    extensions: BTreeSet<String>,
    excerpts: BTreeMap<&'a str, &'a str>,
}

pub struct Scanner {
    settings: ScanSettings,
    registry: SignatureRegistry,
}

impl Scanner {
    pub fn new(settings: ScanSettings, registry: SignatureRegistry) -> Self {
        Self { settings, registry }
    }

    /// Scanner with default settings and the built-in signatures.
    pub fn with_defaults() -> ScanResult<Self> {
        Ok(Self::new(ScanSettings::default(), SignatureRegistry::builtin()?))
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    pub fn registry(&self) -> &SignatureRegistry {
        &self.registry
    }

    /// Scan under a fresh run id.
    pub fn scan(&self, tree: &FolderTree) -> ScanResult<Vec<ServiceCandidate>> {
        let run_id = new_run_id(&tree.root.to_string_lossy());
        self.scan_run(tree, &run_id, epoch_secs())
    }

    /// Scan with an explicit run id and timestamp. Candidate ids derive from
    /// the run id, so separate runs never share candidates.
    pub fn scan_run(
        &self,
        tree: &FolderTree,
        run_id: &str,
        detected_at: u64,
    ) -> ScanResult<Vec<ServiceCandidate>> {
        tree.validate()?;

        let views = folder_views(tree);
        let mut candidates = Vec::new();

        for (&folder, view) in &views {
            for signature in self.registry.signatures() {
                let total = signature.total_weight();
                if total <= 0.0 {
                    continue;
                }
                let (matched_weight, matched) = score(signature, view);
                let confidence = (matched_weight / total).clamp(0.0, 1.0);
                if matched.is_empty() || confidence < self.settings.min_confidence {
                    continue;
                }
                debug!(
                    folder = %folder,
                    service_type = %signature.service_type,
                    confidence,
                    "candidate matched"
                );
                candidates.push(ServiceCandidate {
                    id: derive_id("cand", &[run_id, folder, signature.service_type.as_str()]),
                    folder_path: folder.to_string(),
                    inferred_type: signature.service_type,
                    confidence,
                    matched_signals: matched,
                    detected_at,
                    declared_env: declared_env(tree, folder),
                });
            }
        }

        info!(
            root = %tree.root.display(),
            folders = views.len(),
            candidates = candidates.len(),
            "scan complete"
        );
        Ok(candidates)
    }
}

fn score(signature: &Signature, view: &FolderView<'_>) -> (f64, Vec<String>) {
    let mut weight = 0.0;
    let mut matched = Vec::new();
    for signal in &signature.signals {
        let hit = match &signal.matcher {
            Matcher::File(names) => names.iter().any(|n| view.files.contains(n.as_str())),
            Matcher::Extension(exts) => exts.iter().any(|e| view.extensions.contains(e)),
            Matcher::Directory(name) => view.dirs.contains(name.as_str()),
            Matcher::Content { files, pattern } => files
                .iter()
                .filter_map(|f| view.excerpts.get(f.as_str()))
                .any(|text| pattern.is_match(text)),
        };
        if hit {
            weight += signal.weight;
            matched.push(signal.name.clone());
        }
    }
    (weight, matched)
}

/// Group the snapshot by folder. Every directory gets a view, even an empty one.
fn folder_views(tree: &FolderTree) -> BTreeMap<&str, FolderView<'_>> {
    let mut views: BTreeMap<&str, FolderView<'_>> = tree
        .directories()
        .into_iter()
        .map(|d| (d, FolderView::default()))
        .collect();

    for entry in &tree.entries {
        let parent = entry.parent();
        let name = entry.file_name();
        let Some(view) = views.get_mut(parent) else {
            continue;
        };
        match entry.kind {
            EntryKind::Dir => {
                view.dirs.insert(name);
            }
            EntryKind::File => {
                view.files.insert(name);
                if let Some(excerpt) = entry.excerpt.as_deref() {
                    view.excerpts.insert(name, excerpt);
                }
            }
        }
    }

    for entry in tree.entries.iter().filter(|e| e.kind == EntryKind::File) {
        let Some((_, ext)) = entry.file_name().rsplit_once('.') else {
            continue;
        };
        if ext.is_empty() {
            continue;
        }
        for ancestor in ancestors(entry.parent()).take(EXTENSION_DEPTH + 1) {
            if let Some(view) = views.get_mut(ancestor) {
                view.extensions.insert(ext.to_ascii_lowercase());
            }
        }
    }

    views
}

/// `a/b/c` yields `a/b/c`, `a/b`, `a`, `.`.
fn ancestors(folder: &str) -> impl Iterator<Item = &str> {
    let mut next = Some(folder);
    std::iter::from_fn(move || {
        let current = next?;
        next = match current {
            "." => None,
            _ => Some(current.rsplit_once('/').map(|(p, _)| p).unwrap_or(".")),
        };
        Some(current)
    })
}
