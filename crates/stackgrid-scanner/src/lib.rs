//! stackgrid folder scanner.
//!
//! Takes a read-only snapshot of a directory tree and infers which folders
//! hold services, with a confidence score per (folder, service type).

pub mod env;
pub mod error;
pub mod listing;
pub mod report;
pub mod scanner;
pub mod signatures;

use std::path::Path;

use stackgrid_core::ServiceCandidate;

pub use error::{ScanError, ScanResult};
pub use listing::{EntryKind, FolderEntry, FolderTree, ScanSettings};
pub use scanner::Scanner;
pub use signatures::{Matcher, Signal, Signature, SignatureRegistry};

/// Scan a snapshot with default settings and the built-in signatures.
pub fn scan(tree: &FolderTree) -> ScanResult<Vec<ServiceCandidate>> {
    Scanner::with_defaults()?.scan(tree)
}

/// Snapshot `root` and scan it.
pub fn scan_dir(root: &Path, settings: ScanSettings) -> ScanResult<(FolderTree, Vec<ServiceCandidate>)> {
    let tree = FolderTree::from_dir(root, &settings)?;
    let scanner = Scanner::new(settings, SignatureRegistry::builtin()?);
    let candidates = scanner.scan(&tree)?;
    Ok((tree, candidates))
}
