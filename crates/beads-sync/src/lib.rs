//! Text-mirror synchronization for the beads issue store.
//!
//! The mirror is a line-JSON file shadowing the database for human review
//! and version control. Export is dirty-driven and dedup'd by content
//! hash; import is a two-phase upsert with a configurable orphan policy.

pub mod atomic;
pub mod export;
pub mod hydrate;
pub mod import;

pub use atomic::write_atomic;
pub use export::{ExportReport, export_dirty, export_full};
pub use hydrate::hydrate_from_sources;
pub use import::{ImportReport, OrphanPolicy, import_mirror, maybe_auto_import};

use thiserror::Error;

/// Metadata key recording the mirror mtime at the last import.
pub const LAST_IMPORT_MTIME_KEY: &str = "last_import_mtime_ms";

/// Errors from mirror synchronization.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Storage-layer failure.
    #[error(transparent)]
    Storage(#[from] beads_storage::StorageError),

    /// Mirror file read/parse failure.
    #[error("mirror error: {0}")]
    Jsonl(#[from] beads_core::jsonl::JsonlError),

    /// An I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The request was canceled by the caller.
    #[error("operation canceled")]
    Canceled,
}

impl SyncError {
    /// Stable error-kind string surfaced to service clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Storage(e) => e.kind(),
            Self::Canceled => "canceled",
            Self::Jsonl(_) | Self::Io(_) | Self::Serialization(_) => "storage",
        }
    }
}

/// Result alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Returns a file's modification time in milliseconds since the epoch,
/// or `None` when the file does not exist.
pub fn file_mtime_ms(path: &std::path::Path) -> Option<i64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let since_epoch = modified.duration_since(std::time::UNIX_EPOCH).ok()?;
    Some(since_epoch.as_millis() as i64)
}
