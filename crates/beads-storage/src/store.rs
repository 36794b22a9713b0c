//! [`SqliteStore`] -- SQLite-backed storage implementation.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{Result, StorageError};
use crate::schema;

/// Configuration key holding the workspace issue prefix.
pub const PREFIX_CONFIG_KEY: &str = "issue_prefix";

/// SQLite-backed storage engine.
///
/// A single mutex-guarded connection serializes writers; write transactions
/// begin IMMEDIATE so the write lock is taken up front. Readers share the
/// same connection, which also gives in-memory databases (whose isolation
/// is per-connection) correct behavior with an effective pool size of one.
pub struct SqliteStore {
    /// The mutex-protected SQLite connection.
    pub(crate) conn: Mutex<Connection>,

    /// Path of the text mirror, when known. Used for bounded parent
    /// resurrection during hierarchical creates.
    pub(crate) mirror_path: Mutex<Option<PathBuf>>,
}

impl SqliteStore {
    /// Opens (or creates) a SQLite database at the given path.
    ///
    /// Enables WAL mode and foreign keys, initialises the schema, then runs
    /// the schema probe (re-running migrations once on probe failure).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!(?path, "opening SQLite database");

        let conn = Connection::open(path).map_err(|e| {
            StorageError::Connection(format!("failed to open {}: {e}", path.display()))
        })?;

        let store = Self {
            conn: Mutex::new(conn),
            mirror_path: Mutex::new(None),
        };
        store.configure_connection()?;
        store.init_schema()?;
        store.probe_schema_with_retry()?;

        Ok(store)
    }

    /// Opens an in-memory SQLite database (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        debug!("opening in-memory SQLite database");
        let conn = Connection::open_in_memory()
            .map_err(|e| StorageError::Connection(format!("failed to open in-memory db: {e}")))?;

        let store = Self {
            conn: Mutex::new(conn),
            mirror_path: Mutex::new(None),
        };
        store.configure_connection()?;
        store.init_schema()?;
        store.probe_schema_with_retry()?;

        Ok(store)
    }

    /// Records the text-mirror path for parent resurrection.
    pub fn set_mirror_path(&self, path: impl Into<PathBuf>) {
        *self.mirror_path.lock().expect("mirror path lock") = Some(path.into());
    }

    /// Returns the recorded text-mirror path, if any.
    pub fn mirror_path(&self) -> Option<PathBuf> {
        self.mirror_path.lock().expect("mirror path lock").clone()
    }

    /// Sets connection pragmas (WAL mode, foreign keys, busy timeout).
    fn configure_connection(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| StorageError::Connection(format!("failed to set pragmas: {e}")))?;
        Ok(())
    }

    /// Creates all tables, views, and indexes if they do not exist, inserts
    /// default config, then runs migrations.
    fn init_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        for stmt in schema::SCHEMA_STATEMENTS {
            conn.execute_batch(stmt)
                .map_err(|e| StorageError::SchemaIncompatible {
                    reason: format!("DDL failed: {e}\nStatement: {}", truncate(stmt, 120)),
                })?;
        }

        for &(key, value) in schema::DEFAULT_CONFIG {
            conn.execute(
                "INSERT OR IGNORE INTO config (key, value) VALUES (?1, ?2)",
                rusqlite::params![key, value],
            )
            .map_err(|e| StorageError::SchemaIncompatible {
                reason: format!("failed to insert default config {key}: {e}"),
            })?;
        }

        Self::run_migrations_on_conn(&conn)?;

        conn.execute(
            "INSERT OR REPLACE INTO config (key, value) VALUES ('schema_version', ?1)",
            rusqlite::params![schema::CURRENT_SCHEMA_VERSION.to_string()],
        )
        .map_err(|e| StorageError::SchemaIncompatible {
            reason: format!("failed to record schema version: {e}"),
        })?;

        info!(
            version = schema::CURRENT_SCHEMA_VERSION,
            "schema initialized"
        );
        Ok(())
    }

    /// Applies pending migrations tracked via the `metadata` table.
    fn run_migrations_on_conn(conn: &Connection) -> Result<()> {
        for &(name, sql) in schema::MIGRATIONS {
            let key = format!("migration:{name}");
            let already_applied: bool = conn
                .query_row(
                    "SELECT COUNT(*) FROM metadata WHERE key = ?1",
                    rusqlite::params![key],
                    |row| row.get::<_, i32>(0),
                )
                .unwrap_or(0)
                > 0;

            if already_applied {
                debug!(name, "migration already applied, skipping");
                continue;
            }

            debug!(name, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| StorageError::SchemaIncompatible {
                    reason: format!("migration {name} failed: {e}"),
                })?;

            conn.execute(
                "INSERT INTO metadata (key, value) VALUES (?1, ?2)",
                rusqlite::params![key, "applied"],
            )
            .map_err(|e| StorageError::SchemaIncompatible {
                reason: format!("failed to mark migration {name}: {e}"),
            })?;
        }
        Ok(())
    }

    /// Probes every expected table with a zero-row SELECT over its expected
    /// columns. On failure the migration set is re-run once; a second
    /// failure is fatal.
    fn probe_schema_with_retry(&self) -> Result<()> {
        let missing = self.probe_schema()?;
        if missing.is_empty() {
            return Ok(());
        }

        warn!(?missing, "schema probe failed, re-running migrations");
        {
            let conn = self.lock_conn()?;
            Self::run_migrations_on_conn(&conn)?;
        }

        let still_missing = self.probe_schema()?;
        if still_missing.is_empty() {
            return Ok(());
        }
        Err(StorageError::SchemaIncompatible {
            reason: format!("missing schema elements: {}", still_missing.join(", ")),
        })
    }

    /// Runs the probe once, returning a description of each missing element.
    fn probe_schema(&self) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut missing = Vec::new();

        for &(table, columns) in schema::EXPECTED_TABLES {
            // A zero-row select over every expected column. Preparation
            // alone surfaces missing tables and columns.
            let sql = format!("SELECT {} FROM {} LIMIT 0", columns.join(", "), table);
            match conn.prepare(&sql) {
                Ok(_) => {}
                Err(e) => {
                    let text = e.to_string();
                    if text.contains("no such table") {
                        missing.push(format!("table {table}"));
                    } else {
                        // Narrow down which columns are absent.
                        let mut bad_cols = Vec::new();
                        for col in columns {
                            let single = format!("SELECT {col} FROM {table} LIMIT 0");
                            if conn.prepare(&single).is_err() {
                                bad_cols.push(*col);
                            }
                        }
                        if bad_cols.is_empty() {
                            missing.push(format!("table {table} ({text})"));
                        } else {
                            missing
                                .push(format!("table {table} columns {}", bad_cols.join(", ")));
                        }
                    }
                }
            }
        }

        Ok(missing)
    }

    /// Acquires the connection lock. Helper used by all operation modules.
    pub(crate) fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StorageError::Connection(format!("mutex poisoned: {e}")))
    }

    /// Hands the underlying connection to a trusted in-process extension.
    ///
    /// Constraints for callers: do not close the connection, do not change
    /// pragmas, and keep write transactions short -- the store's own
    /// writers block on the same handle.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock_conn()?;
        f(&conn)
    }

    /// Returns the configured issue prefix, or `Uninitialized` if unset.
    pub fn require_prefix(&self) -> Result<String> {
        let conn = self.lock_conn()?;
        require_prefix_on_conn(&conn)
    }
}

/// Reads the issue prefix from config on the given connection.
pub(crate) fn require_prefix_on_conn(conn: &Connection) -> Result<String> {
    let prefix: Option<String> = conn
        .query_row(
            "SELECT value FROM config WHERE key = ?1",
            rusqlite::params![PREFIX_CONFIG_KEY],
            |row| row.get(0),
        )
        .ok();
    match prefix {
        Some(p) if !p.is_empty() => Ok(p),
        _ => Err(StorageError::Uninitialized {
            reason: "issue_prefix is not set".into(),
        }),
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

/// Truncates a string for error messages.
fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        format!("{}...", &s[..max])
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory() {
        let store = SqliteStore::open_in_memory().unwrap();
        let conn = store.lock_conn().unwrap();
        let count: i32 = conn
            .query_row("SELECT COUNT(*) FROM config", [], |row| row.get(0))
            .unwrap();
        assert!(count > 0, "default config should be inserted");
    }

    #[test]
    fn schema_version_set() {
        let store = SqliteStore::open_in_memory().unwrap();
        let conn = store.lock_conn().unwrap();
        let version: String = conn
            .query_row(
                "SELECT value FROM config WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, schema::CURRENT_SCHEMA_VERSION.to_string());
    }

    #[test]
    fn idempotent_init() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.init_schema().unwrap();
        store.probe_schema_with_retry().unwrap();
    }

    #[test]
    fn probe_reports_missing_column() {
        let store = SqliteStore::open_in_memory().unwrap();
        {
            let conn = store.lock_conn().unwrap();
            conn.execute_batch(
                "DROP TABLE repo_mtimes;
                 CREATE TABLE repo_mtimes (repo TEXT PRIMARY KEY)",
            )
            .unwrap();
        }
        let missing = store.probe_schema().unwrap();
        assert_eq!(missing.len(), 1);
        assert!(missing[0].contains("repo_mtimes"));
        assert!(missing[0].contains("mtime_ms"));
    }

    #[test]
    fn probe_reports_missing_table() {
        let store = SqliteStore::open_in_memory().unwrap();
        {
            let conn = store.lock_conn().unwrap();
            conn.execute_batch("DROP TABLE export_hashes").unwrap();
        }
        let missing = store.probe_schema().unwrap();
        assert!(missing.iter().any(|m| m == "table export_hashes"));
    }

    #[test]
    fn require_prefix_unset_is_uninitialized() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store.require_prefix().unwrap_err();
        assert_eq!(err.kind(), "uninitialized");
    }

    #[test]
    fn require_prefix_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set_config_impl(PREFIX_CONFIG_KEY, "bd").unwrap();
        assert_eq!(store.require_prefix().unwrap(), "bd");
    }

    #[test]
    fn open_on_disk_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("beads.db");
        {
            let store = SqliteStore::open(&db).unwrap();
            store.set_config_impl(PREFIX_CONFIG_KEY, "bd").unwrap();
        }
        let store = SqliteStore::open(&db).unwrap();
        assert_eq!(store.require_prefix().unwrap(), "bd");
    }
}
