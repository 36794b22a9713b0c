//! The workspace metadata document (`metadata.json`).
//!
//! A small JSON document at the state-directory root naming the database
//! and text-mirror files. Writes are atomic (same-directory temp file +
//! rename) with mode 0o600. A legacy `config.json` at the same path is
//! migrated one-shot on first read.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::Result;
use crate::workspace::{DEFAULT_DB_NAME, DEFAULT_MIRROR_NAME};

/// Filename of the metadata document inside the state directory.
pub const METADATA_FILE: &str = "metadata.json";

/// Filename of the legacy configuration document.
const LEGACY_CONFIG_FILE: &str = "config.json";

/// The workspace metadata document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Database filename relative to the state directory.
    #[serde(default)]
    pub database: String,

    /// Text-mirror filename relative to the state directory.
    #[serde(default)]
    pub jsonl_export: String,

    /// Sibling workspaces whose mirrors hydrate this one (paths relative
    /// to the state directory or absolute).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            database: DEFAULT_DB_NAME.to_string(),
            jsonl_export: DEFAULT_MIRROR_NAME.to_string(),
            sources: Vec::new(),
        }
    }
}

impl Metadata {
    /// An all-empty document, as used when no file exists yet. Unlike
    /// [`Metadata::default`] it names no database, so discovery falls
    /// through to the filename scan (which recognizes legacy names).
    pub fn empty() -> Self {
        Self {
            database: String::new(),
            jsonl_export: String::new(),
            sources: Vec::new(),
        }
    }

    /// Mirror filename, defaulting to `beads.jsonl` when absent or empty.
    pub fn mirror_name(&self) -> &str {
        if self.jsonl_export.is_empty() {
            DEFAULT_MIRROR_NAME
        } else {
            &self.jsonl_export
        }
    }
}

/// Loads the metadata document from a state directory.
///
/// A missing document yields the defaults. When only the legacy
/// `config.json` exists, it is parsed, rewritten as `metadata.json`, and
/// the legacy file removed.
pub fn load_metadata(state_dir: &Path) -> Result<Metadata> {
    let path = state_dir.join(METADATA_FILE);
    if path.exists() {
        let content = std::fs::read_to_string(&path)?;
        if content.trim().is_empty() {
            return Ok(Metadata::empty());
        }
        return Ok(serde_json::from_str(&content)?);
    }

    let legacy = state_dir.join(LEGACY_CONFIG_FILE);
    if legacy.exists() {
        let content = std::fs::read_to_string(&legacy)?;
        let meta: Metadata = if content.trim().is_empty() {
            Metadata::default()
        } else {
            serde_json::from_str(&content)?
        };
        save_metadata(state_dir, &meta)?;
        std::fs::remove_file(&legacy)?;
        info!("migrated legacy config.json to metadata.json");
        return Ok(meta);
    }

    Ok(Metadata::empty())
}

/// Saves the metadata document atomically with mode 0o600.
pub fn save_metadata(state_dir: &Path, meta: &Metadata) -> Result<()> {
    std::fs::create_dir_all(state_dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(state_dir)?;
    serde_json::to_writer_pretty(&mut tmp, meta)?;
    tmp.write_all(b"\n")?;
    tmp.flush()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))?;
    }

    tmp.persist(state_dir.join(METADATA_FILE))
        .map_err(|e| e.error)?;
    Ok(())
}
