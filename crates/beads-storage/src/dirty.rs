//! Dirty-set, export-hash, and child-counter bookkeeping.
//!
//! The dirty set is exactly the set of issues whose database state has
//! diverged from the text mirror since the last export. Export hashes
//! remember the last content hash written to the mirror so timestamp-only
//! churn can be skipped.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

use crate::error::Result;
use crate::issues::{format_datetime, parse_datetime};
use crate::store::SqliteStore;

// ---------------------------------------------------------------------------
// Connection-level helpers
// ---------------------------------------------------------------------------

/// Marks an issue dirty. Upserts so re-marking refreshes `marked_at`.
pub(crate) fn mark_dirty_on_conn(conn: &Connection, issue_id: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO dirty_issues (issue_id, marked_at) VALUES (?1, ?2)",
        params![issue_id, format_datetime(&Utc::now())],
    )?;
    Ok(())
}

/// Clears the dirty entry for an issue after a successful export.
pub(crate) fn clear_dirty_on_conn(conn: &Connection, issue_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM dirty_issues WHERE issue_id = ?1",
        params![issue_id],
    )?;
    Ok(())
}

/// Records the content hash written to the mirror for an issue.
pub(crate) fn set_export_hash_on_conn(
    conn: &Connection,
    issue_id: &str,
    content_hash: &str,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO export_hashes (issue_id, content_hash, exported_at)
         VALUES (?1, ?2, ?3)",
        params![issue_id, content_hash, format_datetime(&Utc::now())],
    )?;
    Ok(())
}

/// Atomically advances the child counter for a parent and returns the new
/// value. Must run inside the caller's write transaction.
pub(crate) fn next_child_on_conn(conn: &Connection, parent_id: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO child_counters (parent_id, last_child) VALUES (?1, 1)
         ON CONFLICT(parent_id) DO UPDATE SET last_child = last_child + 1",
        params![parent_id],
    )?;
    let n: i64 = conn.query_row(
        "SELECT last_child FROM child_counters WHERE parent_id = ?1",
        params![parent_id],
        |row| row.get(0),
    )?;
    Ok(n)
}

/// Raises the child counter to at least `n` (used when an explicit
/// hierarchical id is inserted, so generated ids never reuse a suffix).
pub(crate) fn note_child_on_conn(conn: &Connection, parent_id: &str, n: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO child_counters (parent_id, last_child) VALUES (?1, ?2)
         ON CONFLICT(parent_id) DO UPDATE SET last_child = MAX(last_child, ?2)",
        params![parent_id, n],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// SqliteStore methods
// ---------------------------------------------------------------------------

impl SqliteStore {
    /// Marks an issue dirty outside any other mutation (e.g., after an
    /// extension writes through the raw handle).
    pub fn mark_dirty_impl(&self, issue_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        mark_dirty_on_conn(&conn, issue_id)
    }

    /// Returns the dirty set as `(issue_id, marked_at)`, oldest first.
    pub fn get_dirty_issues_impl(&self) -> Result<Vec<(String, DateTime<Utc>)>> {
        let conn = self.lock_conn()?;
        let mut stmt =
            conn.prepare("SELECT issue_id, marked_at FROM dirty_issues ORDER BY marked_at ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                parse_datetime(&row.get::<_, String>(1)?),
            ))
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Clears a dirty entry and records the exported hash in one step.
    pub fn note_exported_impl(&self, issue_id: &str, content_hash: &str) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        clear_dirty_on_conn(&tx, issue_id)?;
        set_export_hash_on_conn(&tx, issue_id, content_hash)?;
        tx.commit()
            .map_err(|e| crate::error::StorageError::Transaction(e.to_string()))?;
        Ok(())
    }

    /// Drops a dirty entry without recording an export (used when the
    /// issue vanished between marking and export).
    pub fn clear_dirty_impl(&self, issue_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        clear_dirty_on_conn(&conn, issue_id)
    }

    /// Returns the last exported content hash for an issue, if recorded.
    pub fn get_export_hash_impl(&self, issue_id: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let hash = conn
            .query_row(
                "SELECT content_hash FROM export_hashes WHERE issue_id = ?1",
                params![issue_id],
                |row| row.get::<_, String>(0),
            )
            .ok();
        Ok(hash)
    }

    /// Returns the recorded mirror mtime for a hydration source.
    pub fn get_repo_mtime_impl(&self, repo: &str) -> Result<Option<i64>> {
        let conn = self.lock_conn()?;
        let mtime = conn
            .query_row(
                "SELECT mtime_ms FROM repo_mtimes WHERE repo = ?1",
                params![repo],
                |row| row.get::<_, i64>(0),
            )
            .ok();
        Ok(mtime)
    }

    /// Records the mirror mtime for a hydration source.
    pub fn set_repo_mtime_impl(&self, repo: &str, mtime_ms: i64) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO repo_mtimes (repo, mtime_ms) VALUES (?1, ?2)",
            params![repo, mtime_ms],
        )?;
        Ok(())
    }
}
