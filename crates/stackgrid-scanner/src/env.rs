//! Env-file discovery.
//!
//! Variables declared in a folder's env files are carried on the candidate
//! so the graph builder can infer connections from names like `DATABASE_URL`.

use std::collections::BTreeMap;

use crate::listing::{EntryKind, FolderTree};

/// Env files read, in increasing precedence.
pub const ENV_FILES: &[&str] = &[".env.example", ".env.sample", ".env", ".env.local"];

/// Parse `KEY=VALUE` lines. Comments, blank lines, and malformed keys are skipped.
pub fn parse_env(content: &str) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            continue;
        }
        vars.insert(key.to_string(), unquote(value.trim()));
    }
    vars
}

fn unquote(value: &str) -> String {
    for q in ['"', '\''] {
        if let Some(inner) = value.strip_prefix(q).and_then(|v| v.strip_suffix(q)) {
            return inner.to_string();
        }
    }
    // Unquoted values may carry a trailing comment.
    match value.find(" #") {
        Some(i) => value[..i].trim_end().to_string(),
        None => value.to_string(),
    }
}

/// Variables declared directly in `folder`, later files overriding earlier ones.
pub fn declared_env(tree: &FolderTree, folder: &str) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    for name in ENV_FILES {
        let file = tree.entries.iter().find(|e| {
            e.kind == EntryKind::File && e.parent() == folder && e.file_name() == *name
        });
        if let Some(excerpt) = file.and_then(|f| f.excerpt.as_deref()) {
            vars.extend(parse_env(excerpt));
        }
    }
    vars
}
