//! Workspace-local request service for the beads issue store.
//!
//! A filesystem socket inside the workspace state directory accepts
//! length-prefixed JSON requests, validates the caller's version and
//! database binding, and dispatches to the storage engine and the
//! text-mirror sync layer. Write operations feed an in-process mutation
//! stream that long-polling clients consume.

pub mod handlers;
pub mod mutations;
pub mod protocol;
pub mod server;
pub mod state;
pub mod version;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use beads_core::cancel::CancelToken;
use beads_storage::SqliteStore;
use beads_sync::OrphanPolicy;

pub use protocol::{Request, Response, ResponseError};
pub use server::serve;
pub use state::{DEFAULT_MAX_CONNECTIONS, HealthStatus, ServerState};

/// Errors surfaced while opening a workspace for service.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] beads_config::ConfigError),

    #[error(transparent)]
    Storage(#[from] beads_storage::StorageError),

    #[error(transparent)]
    Sync(#[from] beads_sync::SyncError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for daemon operations.
pub type Result<T> = std::result::Result<T, DaemonError>;

/// The request service: one per workspace, shared across connection
/// threads.
pub struct Daemon {
    pub(crate) store: Arc<SqliteStore>,
    /// Canonicalized database path, compared against `expected_db`.
    pub(crate) db_path: PathBuf,
    pub(crate) mirror_path: PathBuf,
    pub(crate) state_dir: PathBuf,
    /// The daemon's own semantic version.
    pub(crate) version: String,
    pub(crate) state: ServerState,
    pub(crate) mutations: mutations::MutationBuffer,
    /// Set by `shutdown`; the accept loop and handlers observe it.
    pub(crate) shutdown: CancelToken,
}

impl Daemon {
    /// Opens the workspace rooted at `state_dir`: resolves the database
    /// and mirror, opens storage, and hydrates from any configured source
    /// workspaces.
    pub fn open(state_dir: &Path) -> Result<Self> {
        Self::open_with_limits(state_dir, DEFAULT_MAX_CONNECTIONS)
    }

    /// [`Daemon::open`] with an explicit connection limit.
    pub fn open_with_limits(state_dir: &Path, max_connections: usize) -> Result<Self> {
        let meta = beads_config::load_metadata(state_dir)?;
        let db_path = beads_config::resolve_database(state_dir)?;
        let mirror_path = beads_config::resolve_mirror(state_dir)?;

        let store = Arc::new(SqliteStore::open(&db_path)?);
        store.set_mirror_path(&mirror_path);

        let hydrated =
            beads_sync::hydrate_from_sources(&store, state_dir, &meta, &CancelToken::new())?;
        if hydrated > 0 {
            info!(sources = hydrated, "hydrated from source workspaces");
        }

        // The database may have been created just now; canonicalize after
        // open so symlink comparison works.
        let db_path = db_path.canonicalize().unwrap_or(db_path);

        Ok(Self {
            store,
            db_path,
            mirror_path,
            state_dir: state_dir.to_path_buf(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: ServerState::new(state_dir, max_connections),
            mutations: mutations::MutationBuffer::new(1024),
            shutdown: CancelToken::new(),
        })
    }

    /// Overrides the advertised daemon version (embedders and tests).
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// The socket path for this workspace.
    pub fn socket_path(&self) -> PathBuf {
        self.state_dir.join(beads_config::SOCKET_NAME)
    }

    /// Shared storage handle (tests and embedders).
    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    /// Whether cooperative shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_canceled()
    }

    /// Requests cooperative shutdown (also reachable via the `shutdown`
    /// operation).
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// The configured orphan policy for mirror imports.
    pub(crate) fn orphan_policy(&self) -> OrphanPolicy {
        self.store
            .get_config_impl("orphan_policy")
            .ok()
            .and_then(|v| OrphanPolicy::parse(&v))
            .unwrap_or_default()
    }
}
