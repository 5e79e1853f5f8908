//! Folder listing provider: a read-only snapshot of a directory tree.
//!
//! The snapshot holds relative paths, kinds and sizes for every entry, plus
//! a bounded content excerpt for the handful of files signatures look
//! inside. Everything downstream of this module works on the snapshot, never
//! on the live filesystem.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use stackgrid_core::config::ScanConfig;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{ScanError, ScanResult};

/// Directories never descended into.
pub const DEFAULT_IGNORED: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "dist",
    "build",
    "vendor",
    "__pycache__",
    ".venv",
    "venv",
    ".idea",
    ".vscode",
];

/// Files whose leading bytes are captured into the snapshot.
pub const EXCERPT_FILES: &[&str] = &[
    "package.json",
    "requirements.txt",
    "pyproject.toml",
    "Pipfile",
    "go.mod",
    "Cargo.toml",
    "pom.xml",
    "build.gradle",
    "build.gradle.kts",
    "Gemfile",
    "composer.json",
    "Dockerfile",
    "docker-compose.yml",
    "docker-compose.yaml",
    "index.html",
    ".env",
    ".env.example",
    ".env.sample",
    ".env.local",
];

/// Settings for building a snapshot and filtering candidates.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub max_depth: usize,
    pub excerpt_bytes: usize,
    pub min_confidence: f64,
    pub ignore: Vec<String>,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self::from(&ScanConfig::default())
    }
}

impl From<&ScanConfig> for ScanSettings {
    fn from(config: &ScanConfig) -> Self {
        let mut ignore: Vec<String> = DEFAULT_IGNORED.iter().map(|s| s.to_string()).collect();
        ignore.extend(config.ignore.iter().cloned());
        Self {
            max_depth: config.max_depth,
            excerpt_bytes: config.excerpt_bytes,
            min_confidence: config.min_confidence,
            ignore,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderEntry {
    /// Path relative to the root, `/`-separated.
    pub path: String,
    pub kind: EntryKind,
    pub size: u64,
    pub excerpt: Option<String>,
}

impl FolderEntry {
    pub fn file(path: &str, excerpt: Option<&str>) -> Self {
        Self {
            path: path.to_string(),
            kind: EntryKind::File,
            size: excerpt.map(|e| e.len() as u64).unwrap_or(0),
            excerpt: excerpt.map(String::from),
        }
    }

    pub fn dir(path: &str) -> Self {
        Self {
            path: path.to_string(),
            kind: EntryKind::Dir,
            size: 0,
            excerpt: None,
        }
    }

    /// Parent folder path, `"."` for top-level entries.
    pub fn parent(&self) -> &str {
        match self.path.rsplit_once('/') {
            Some((parent, _)) => parent,
            None => ".",
        }
    }

    pub fn file_name(&self) -> &str {
        match self.path.rsplit_once('/') {
            Some((_, name)) => name,
            None => &self.path,
        }
    }
}

/// Read-only snapshot of a directory tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderTree {
    pub root: PathBuf,
    pub entries: Vec<FolderEntry>,
}

impl FolderTree {
    /// Snapshot an externally provided listing.
    pub fn from_entries(root: impl Into<PathBuf>, entries: Vec<FolderEntry>) -> Self {
        Self {
            root: root.into(),
            entries,
        }
    }

    /// Walk `root` on disk and snapshot it.
    pub fn from_dir(root: &Path, settings: &ScanSettings) -> ScanResult<Self> {
        let meta = std::fs::metadata(root).map_err(|source| ScanError::Unreadable {
            path: root.to_path_buf(),
            source,
        })?;
        if !meta.is_dir() {
            return Err(ScanError::NotADirectory(root.to_path_buf()));
        }

        let walker = WalkDir::new(root)
            .max_depth(settings.max_depth)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0
                    || !(e.file_type().is_dir()
                        && settings.ignore.iter().any(|i| e.file_name() == i.as_str()))
            });

        let mut entries = Vec::new();
        for item in walker {
            let entry = match item {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => {
                    return Err(ScanError::Unreadable {
                        path: root.to_path_buf(),
                        source: std::io::Error::from(e),
                    });
                }
                Err(e) => {
                    warn!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if entry.depth() == 0 {
                continue;
            }

            let Some(rel) = relative_path(root, entry.path()) else {
                continue;
            };

            if entry.file_type().is_dir() {
                entries.push(FolderEntry::dir(&rel));
            } else if entry.file_type().is_file() {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                let name = entry.file_name().to_string_lossy();
                let excerpt = if EXCERPT_FILES.contains(&name.as_ref()) {
                    read_excerpt(entry.path(), settings.excerpt_bytes)
                } else {
                    None
                };
                entries.push(FolderEntry {
                    path: rel,
                    kind: EntryKind::File,
                    size,
                    excerpt,
                });
            }
        }

        debug!(root = %root.display(), entries = entries.len(), "folder snapshot taken");
        Ok(Self {
            root: root.to_path_buf(),
            entries,
        })
    }

    /// Reject snapshots with entries that escape the root.
    pub fn validate(&self) -> ScanResult<()> {
        for entry in &self.entries {
            let invalid = |reason: &str| ScanError::InvalidEntry {
                path: entry.path.clone(),
                reason: reason.to_string(),
            };
            if entry.path.is_empty() {
                return Err(invalid("empty path"));
            }
            if entry.path.starts_with('/') || entry.path.contains('\\') {
                return Err(invalid("paths must be relative and '/'-separated"));
            }
            if entry.path.split('/').any(|c| c == ".." || c == "." || c.is_empty()) {
                return Err(invalid("paths must not contain '.', '..' or empty components"));
            }
        }
        Ok(())
    }

    /// Every folder in the snapshot, root (`"."`) first.
    pub fn directories(&self) -> Vec<&str> {
        let mut dirs = vec!["."];
        dirs.extend(
            self.entries
                .iter()
                .filter(|e| e.kind == EntryKind::Dir)
                .map(|e| e.path.as_str()),
        );
        dirs
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

fn read_excerpt(path: &Path, limit: usize) -> Option<String> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read signature file");
            return None;
        }
    };
    let mut buf = Vec::with_capacity(limit.min(8192));
    if let Err(e) = file.take(limit as u64).read_to_end(&mut buf) {
        warn!(path = %path.display(), error = %e, "cannot read signature file");
        return None;
    }
    Some(String::from_utf8_lossy(&buf).into_owned())
}
