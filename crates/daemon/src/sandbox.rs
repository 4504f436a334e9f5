//! Working-directory sandbox.
//!
//! Session working directories are resolved to a canonical path and, when a
//! sandbox root is configured, must lie inside it. Symlinks and `..` are
//! resolved before the comparison, so neither can be used to step outside.

use std::fs;
use std::path::{Component, Path, PathBuf};

/// Resolves `path` and checks it against `root`.
///
/// A leading `~` expands to the home directory and relative paths are taken
/// relative to it. Returns the canonical directory, or `None` if the path
/// does not exist, is not a directory, or falls outside the root.
pub fn validate(path: &Path, root: Option<&Path>) -> Option<PathBuf> {
    let expanded = expand_home(path)?;

    let canonical = match fs::canonicalize(&expanded) {
        Ok(p) => p,
        Err(e) => {
            tracing::debug!(path = %expanded.display(), error = %e, "Cannot resolve working directory");
            return None;
        }
    };

    if !canonical.is_dir() {
        tracing::debug!(path = %canonical.display(), "Working directory is not a directory");
        return None;
    }

    let Some(root) = root else {
        return Some(canonical);
    };

    let root_canonical = match expand_home(root).map(fs::canonicalize) {
        Some(Ok(p)) => p,
        _ => {
            tracing::warn!(root = %root.display(), "Sandbox root cannot be resolved, rejecting");
            return None;
        }
    };

    if canonical.starts_with(&root_canonical) {
        Some(canonical)
    } else {
        tracing::warn!(
            path = %canonical.display(),
            root = %root_canonical.display(),
            "Working directory outside sandbox root"
        );
        None
    }
}

/// Expands `~` and anchors relative paths at the home directory.
pub fn expand_home(path: &Path) -> Option<PathBuf> {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(first)) if first == "~" => {
            Some(dirs::home_dir()?.join(components.as_path()))
        }
        Some(Component::RootDir) | Some(Component::Prefix(_)) => Some(path.to_path_buf()),
        Some(_) => Some(dirs::home_dir()?.join(path)),
        None => dirs::home_dir(),
    }
}
