//! Root-relative path normalization

use std::path::{Component, Path};

/// Name of the version-control metadata directory
pub const METADATA_DIR: &str = ".git";

/// Whether a normalized relative path is the metadata directory or inside it
pub fn is_metadata_path(rel: &str) -> bool {
    rel == METADATA_DIR || rel.starts_with(".git/")
}

/// Convert an absolute host path to a normalized root-relative path
///
/// Returns `None` for paths outside the root, the root itself, and paths
/// under the metadata directory.
pub fn host_relative(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(p) => Some(p.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    accept(parts.join("/"))
}

/// Convert a remote path to a normalized path relative to `root`
///
/// Relative input is resolved against `root` first.
pub fn remote_relative(root: &str, path: &str) -> Option<String> {
    let absolute = if path.starts_with('/') {
        path.to_string()
    } else {
        remote_join(root, path)
    };

    let root = root.trim_end_matches('/');
    let rest = if root.is_empty() {
        absolute.as_str()
    } else {
        let rest = absolute.strip_prefix(root)?;
        // "/app2/x" must not match root "/app"
        if !rest.is_empty() && !rest.starts_with('/') {
            return None;
        }
        rest
    };

    let parts: Vec<&str> = rest
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    if parts.contains(&"..") {
        return None;
    }
    accept(parts.join("/"))
}

/// Join a root-relative path onto a remote root
pub fn remote_join(root: &str, rel: &str) -> String {
    let root = root.trim_end_matches('/');
    let rel = rel.trim_start_matches('/');
    if rel.is_empty() {
        root.to_string()
    } else {
        format!("{}/{}", root, rel)
    }
}

fn accept(rel: String) -> Option<String> {
    if rel.is_empty() || rel == "." || is_metadata_path(&rel) {
        None
    } else {
        Some(rel)
    }
}
