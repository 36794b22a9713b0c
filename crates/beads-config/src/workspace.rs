//! Discovery of the `.beads/` state directory and its database file.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::metadata::load_metadata;
use crate::{ConfigError, Result};

/// The name of the workspace state directory.
const STATE_DIR_NAME: &str = ".beads";

/// Environment variable naming a state directory absolutely, overriding
/// discovery.
pub const BEADS_DIR_ENV: &str = "BEADS_DIR";

/// Legacy environment variable naming a database file directly
/// (deprecated).
pub const BEADS_DB_ENV: &str = "BEADS_DB";

/// Canonical database filename.
pub const DEFAULT_DB_NAME: &str = "beads.db";

/// Canonical text-mirror filename.
pub const DEFAULT_MIRROR_NAME: &str = "beads.jsonl";

/// Daemon socket filename inside the state directory.
pub const SOCKET_NAME: &str = "bd.sock";

/// Legacy database filenames recognized with a migration warning.
const LEGACY_DB_NAMES: &[&str] = &["bd.db", "issues.db", "bugs.db"];

/// Walks up the directory tree from `start` looking for a `.beads/`
/// state directory.
///
/// `BEADS_DIR` takes priority over the walk. Returns `None` when the
/// filesystem root is reached without a hit.
pub fn find_state_dir(start: &Path) -> Option<PathBuf> {
    if let Ok(env_dir) = std::env::var(BEADS_DIR_ENV) {
        let env_path = PathBuf::from(&env_dir);
        if env_path.is_dir() {
            return Some(resolve_symlinks(&env_path));
        }
    }

    let start = start.canonicalize().ok()?;
    let mut current = start.as_path();
    loop {
        let candidate = current.join(STATE_DIR_NAME);
        if candidate.is_dir() {
            return Some(resolve_symlinks(&candidate));
        }
        match current.parent() {
            Some(parent) if parent != current => current = parent,
            _ => break,
        }
    }

    None
}

/// Like [`find_state_dir`], but converts `None` into an error.
pub fn find_state_dir_or_error(start: &Path) -> Result<PathBuf> {
    find_state_dir(start).ok_or_else(|| ConfigError::WorkspaceNotFound {
        start: start.display().to_string(),
    })
}

/// Ensures a `.beads/` state directory exists under the given path,
/// creating it if necessary. Returns the state directory path.
pub fn ensure_state_dir(path: &Path) -> Result<PathBuf> {
    let state_dir = if path.ends_with(STATE_DIR_NAME) {
        path.to_path_buf()
    } else {
        path.join(STATE_DIR_NAME)
    };
    std::fs::create_dir_all(&state_dir)?;
    Ok(state_dir)
}

/// Resolves the database file for a state directory.
///
/// Preference order: the `BEADS_DB` environment variable, the metadata
/// document's `database` field, the canonical `beads.db`, then any
/// non-backup `*.db` in the directory. Legacy names are accepted with a
/// warning; multiple candidates warn and pick the first deterministically.
pub fn resolve_database(state_dir: &Path) -> Result<PathBuf> {
    if let Ok(env_db) = std::env::var(BEADS_DB_ENV) {
        if !env_db.is_empty() {
            warn!(env = BEADS_DB_ENV, "using deprecated database override");
            return Ok(resolve_symlinks(Path::new(&env_db)));
        }
    }

    let meta = load_metadata(state_dir)?;
    if !meta.database.is_empty() {
        return Ok(resolve_symlinks(&state_dir.join(&meta.database)));
    }

    let canonical = state_dir.join(DEFAULT_DB_NAME);
    if canonical.exists() {
        return Ok(resolve_symlinks(&canonical));
    }

    // Any non-backup *.db, sorted for determinism.
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(state_dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.extension().is_some_and(|ext| ext == "db")
                        && !p
                            .file_name()
                            .and_then(|n| n.to_str())
                            .is_some_and(|n| n.contains(".backup") || n.ends_with("~"))
                })
                .collect()
        })
        .unwrap_or_default();
    candidates.sort();

    match candidates.as_slice() {
        [] => Ok(canonical),
        [single] => {
            if let Some(name) = single.file_name().and_then(|n| n.to_str()) {
                if LEGACY_DB_NAMES.contains(&name) {
                    warn!(
                        name,
                        "legacy database filename; consider renaming to {DEFAULT_DB_NAME}"
                    );
                }
            }
            Ok(resolve_symlinks(single))
        }
        [first, ..] => {
            warn!(
                count = candidates.len(),
                picked = %first.display(),
                "multiple candidate databases; picking the first"
            );
            Ok(resolve_symlinks(first))
        }
    }
}

/// Resolves the text-mirror file for a state directory, honoring the
/// metadata document's `jsonl_export` field.
pub fn resolve_mirror(state_dir: &Path) -> Result<PathBuf> {
    let meta = load_metadata(state_dir)?;
    Ok(state_dir.join(meta.mirror_name()))
}

/// Canonicalizes when possible so that path comparisons see through
/// symlinks; otherwise returns the path unchanged.
fn resolve_symlinks(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
