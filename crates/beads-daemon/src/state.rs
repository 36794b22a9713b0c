//! Process state: uptime, connection accounting, the workspace exclusive
//! lock, and the bounded health probe.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use beads_storage::SqliteStore;

/// Filename of the workspace exclusive-lock file.
pub const LOCK_FILE: &str = "bd.lock";

/// Default cap on concurrent connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Health probe outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// The storage ping answered, but slowly (> 500ms).
    Degraded,
    /// The storage ping errored or missed the 1-second deadline.
    Unhealthy,
}

/// Mutable process counters shared across connection threads.
pub struct ServerState {
    pub started_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    active_connections: AtomicUsize,
    pub max_connections: usize,
    state_dir: PathBuf,
}

impl ServerState {
    pub fn new(state_dir: &Path, max_connections: usize) -> Self {
        Self {
            started_at: Utc::now(),
            last_activity: Mutex::new(Utc::now()),
            active_connections: AtomicUsize::new(0),
            max_connections,
            state_dir: state_dir.to_path_buf(),
        }
    }

    /// Stamps the last-activity clock.
    pub fn touch(&self) {
        *self.last_activity.lock().expect("activity lock") = Utc::now();
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock().expect("activity lock")
    }

    /// Tries to account for a new connection; `false` when the limit is
    /// reached.
    pub fn try_add_connection(&self) -> bool {
        let prev = self.active_connections.fetch_add(1, Ordering::SeqCst);
        if prev >= self.max_connections {
            self.active_connections.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    pub fn remove_connection(&self) {
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Reads the current exclusive-lock holder, if any.
    pub fn lock_holder(&self) -> Option<String> {
        let content = std::fs::read_to_string(self.state_dir.join(LOCK_FILE)).ok()?;
        let holder = content.trim();
        if holder.is_empty() {
            None
        } else {
            Some(holder.to_string())
        }
    }
}

/// Resident set size in kilobytes, best effort (Linux reads
/// `/proc/self/status`; elsewhere reports 0).
pub fn memory_footprint_kb() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    if let Some(kb) = rest.split_whitespace().next().and_then(|v| v.parse().ok())
                    {
                        return kb;
                    }
                }
            }
        }
    }
    0
}

/// Pings the storage with a bounded deadline and classifies the result.
///
/// The probe runs on a helper thread so a wedged database cannot hang the
/// health endpoint past its 1-second budget.
pub fn probe_storage(store: &Arc<SqliteStore>) -> (HealthStatus, Duration) {
    let (tx, rx) = std::sync::mpsc::channel();
    let probe_store = Arc::clone(store);
    std::thread::spawn(move || {
        let started = Instant::now();
        let result =
            probe_store.with_connection(|conn| conn.query_row("SELECT 1", [], |_| Ok(())).map_err(Into::into));
        let _ = tx.send((result, started.elapsed()));
    });

    match rx.recv_timeout(Duration::from_secs(1)) {
        Ok((Ok(()), elapsed)) if elapsed <= Duration::from_millis(500) => {
            (HealthStatus::Healthy, elapsed)
        }
        Ok((Ok(()), elapsed)) => (HealthStatus::Degraded, elapsed),
        Ok((Err(e), elapsed)) => {
            warn!(error = %e, "storage health probe failed");
            (HealthStatus::Unhealthy, elapsed)
        }
        Err(_) => (HealthStatus::Unhealthy, Duration::from_secs(1)),
    }
}

/// A held workspace exclusive lock. Releasing the guard (drop) unlocks
/// and removes the file.
pub struct ExclusiveLock {
    file: std::fs::File,
    path: PathBuf,
}

impl ExclusiveLock {
    /// Acquires the workspace lock, recording the holder for `status` to
    /// report. Fails when another process holds it.
    pub fn acquire(state_dir: &Path, holder: &str) -> std::io::Result<Self> {
        let path = state_dir.join(LOCK_FILE);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        file.try_lock_exclusive()?;
        // Record the holder only after the lock is ours.
        std::fs::write(&path, format!("{holder}\n"))?;
        Ok(Self { file, path })
    }
}

impl Drop for ExclusiveLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}
