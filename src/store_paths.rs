//! Purpose: Shared data-directory and database path resolution helpers.
//! Exports: `default_data_dir` and `resolve_db_root`.
//! Role: Keep CLI and server path semantics aligned from one source.
//! Invariants: Default data directory remains `~/.bibserve`.
//! Invariants: Database names must not contain path separators.

use std::path::{Path, PathBuf};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum DbNameResolveError {
    Empty,
    ContainsPathSeparator,
}

pub fn default_data_dir() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join(".bibserve")
}

pub(crate) fn resolve_db_root(
    db_name: &str,
    data_dir: &Path,
) -> Result<PathBuf, DbNameResolveError> {
    if db_name.is_empty() {
        return Err(DbNameResolveError::Empty);
    }
    if db_name.contains('/') || db_name.contains('\\') {
        return Err(DbNameResolveError::ContainsPathSeparator);
    }
    Ok(data_dir.join(db_name))
}
