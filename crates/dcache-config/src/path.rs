//! Path helpers shared by the store and the CLI.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Expand a leading `~/` (or a bare `~`) to the user's home directory.
///
/// Paths without the prefix, or hosts with no resolvable home, are returned unchanged.
pub fn expand_home(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

/// Resolve a cache root to an absolute path.
///
/// The root may not exist yet, so only the home prefix and the working
/// directory are applied; symlinks are left alone.
pub fn absolute_root(path: impl AsRef<Path>) -> Result<PathBuf> {
    let expanded = expand_home(path);
    if expanded.is_absolute() {
        return Ok(expanded);
    }
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    Ok(cwd.join(expanded))
}
