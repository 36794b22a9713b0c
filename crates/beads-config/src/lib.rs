//! Workspace discovery and metadata for the beads issue store.
//!
//! A *workspace* is the nearest ancestor of the working directory that
//! contains a `.beads/` state directory. The state directory holds the
//! database, the text mirror, the daemon socket, and `metadata.json`.

pub mod metadata;
pub mod workspace;

pub use metadata::{Metadata, load_metadata, save_metadata};
pub use workspace::{
    BEADS_DB_ENV, BEADS_DIR_ENV, DEFAULT_DB_NAME, DEFAULT_MIRROR_NAME, SOCKET_NAME,
    ensure_state_dir, find_state_dir, resolve_database, resolve_mirror,
};

use thiserror::Error;

/// Errors that can occur during workspace discovery or metadata handling.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No `.beads/` state directory was found.
    #[error("no .beads directory found (walked up from {start})")]
    WorkspaceNotFound {
        /// Directory the walk started from.
        start: String,
    },

    /// An I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The metadata document contained invalid JSON.
    #[error("failed to parse metadata: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A specialized `Result` type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;
