//! Compaction hosting: snapshot tables and eligibility queries.
//!
//! The summarizer itself lives outside the engine. The engine stores the
//! pre-compaction image, applies the summarized fields it is handed, and
//! answers which issues are eligible for the next compaction pass.

use chrono::{Duration, Utc};
use rusqlite::{TransactionBehavior, params};
use serde::{Deserialize, Serialize};

use beads_core::content_hash::compute_content_hash;
use beads_core::enums::{EventType, Status};
use beads_core::issue::Issue;

use crate::dirty::mark_dirty_on_conn;
use crate::error::{Result, StorageError};
use crate::issues::{ISSUE_COLUMNS, emit_event, format_datetime, get_issue_on_conn, scan_issue};
use crate::store::SqliteStore;

/// Aggregate compaction statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompactionStats {
    /// Issues currently eligible for compaction.
    pub eligible: i64,
    /// Issues per compaction level: `(level, count)`.
    pub by_level: Vec<(i32, i64)>,
    /// Total bytes of original payloads recorded across compacted issues.
    pub original_bytes: i64,
}

impl SqliteStore {
    /// Returns closed issues eligible for compaction at the next level:
    /// closed longer than the configured tier threshold and still at
    /// `compaction_level < level`.
    pub fn get_compaction_candidates_impl(&self, level: i32) -> Result<Vec<Issue>> {
        let conn = self.lock_conn()?;

        let key = match level {
            1 => "compact_tier1_days",
            _ => "compact_tier2_days",
        };
        let days: i64 = crate::config::get_config_on_conn(&conn, key)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);
        let cutoff = Utc::now() - Duration::days(days);

        let sql = format!(
            "SELECT {ISSUE_COLUMNS} FROM issues
             WHERE status = 'closed'
               AND closed_at IS NOT NULL
               AND closed_at < ?1
               AND compaction_level < ?2
             ORDER BY closed_at ASC, id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![format_datetime(&cutoff), level], scan_issue)?;

        let mut issues = Vec::new();
        for row in rows {
            issues.push(row?);
        }
        Ok(issues)
    }

    /// Applies an externally-produced summary to a closed issue.
    ///
    /// Snapshots the pre-image, replaces the long-form fields with the
    /// summary, bumps the compaction level, and emits a `compacted` event.
    pub fn apply_compaction_impl(
        &self,
        id: &str,
        summary: &str,
        commit: Option<&str>,
        actor: &str,
    ) -> Result<Issue> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut issue = get_issue_on_conn(&tx, id)?;
        if issue.status != Status::Closed {
            return Err(StorageError::validation(format!(
                "issue {id} is not closed; only closed issues are compacted"
            )));
        }

        let pre_image = serde_json::to_string(&issue)?;
        let original_size = pre_image.len() as i32;
        let now = Utc::now();
        let new_level = issue.compaction_level + 1;

        // Latest pre-image, plus the per-level history entry.
        tx.execute(
            "INSERT OR REPLACE INTO issue_snapshots (issue_id, payload, created_at)
             VALUES (?1, ?2, ?3)",
            params![id, pre_image, format_datetime(&now)],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO compaction_snapshots
             (issue_id, compaction_level, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, new_level, pre_image, format_datetime(&now)],
        )?;

        issue.description = summary.to_string();
        issue.design = String::new();
        issue.notes = String::new();
        issue.acceptance_criteria = String::new();
        issue.compaction_level = new_level;
        issue.compacted_at = Some(now);
        issue.compacted_at_commit = commit.map(str::to_owned);
        if issue.original_size == 0 {
            issue.original_size = original_size;
        }
        issue.updated_at = now;
        issue.content_hash = compute_content_hash(&issue);

        tx.execute(
            "UPDATE issues SET
                description = ?2, design = ?3, notes = ?4, acceptance_criteria = ?5,
                compaction_level = ?6, compacted_at = ?7, compacted_at_commit = ?8,
                original_size = ?9, updated_at = ?10, content_hash = ?11
             WHERE id = ?1",
            params![
                id,
                issue.description,
                issue.design,
                issue.notes,
                issue.acceptance_criteria,
                issue.compaction_level,
                issue.compacted_at.as_ref().map(format_datetime),
                issue.compacted_at_commit,
                issue.original_size,
                format_datetime(&issue.updated_at),
                issue.content_hash,
            ],
        )?;

        emit_event(
            &tx,
            id,
            EventType::Compacted,
            actor,
            Some(&(new_level - 1).to_string()),
            Some(&new_level.to_string()),
            None,
            &format_datetime(&now),
        )?;
        mark_dirty_on_conn(&tx, id)?;

        tx.commit()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;
        Ok(issue)
    }

    /// Returns the stored pre-compaction payload for an issue at a level.
    pub fn get_compaction_snapshot_impl(&self, id: &str, level: i32) -> Result<String> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT payload FROM compaction_snapshots
             WHERE issue_id = ?1 AND compaction_level = ?2",
            params![id, level],
            |row| row.get::<_, String>(0),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                StorageError::not_found("compaction snapshot", format!("{id}@{level}"))
            }
            other => StorageError::Query(other),
        })
    }

    /// Aggregate compaction statistics.
    pub fn get_compaction_stats_impl(&self) -> Result<CompactionStats> {
        let mut stats = CompactionStats {
            eligible: self.get_compaction_candidates_impl(1)?.len() as i64,
            ..Default::default()
        };

        let conn = self.lock_conn()?;
        {
            let mut stmt = conn.prepare(
                "SELECT compaction_level, COUNT(*) FROM issues
                 GROUP BY compaction_level ORDER BY compaction_level ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, i32>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                stats.by_level.push(row?);
            }
        }
        stats.original_bytes = conn.query_row(
            "SELECT COALESCE(SUM(original_size), 0) FROM issues WHERE compaction_level > 0",
            [],
            |row| row.get(0),
        )?;

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PREFIX_CONFIG_KEY;
    use beads_core::issue::IssueBuilder;

    fn test_store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set_config_impl(PREFIX_CONFIG_KEY, "bd").unwrap();
        store
    }

    fn closed_long_ago(store: &SqliteStore, id: &str) {
        let issue = IssueBuilder::new(format!("Issue {id}"))
            .id(id)
            .description("a very long description that compaction will fold away")
            .build();
        store.create_issue_impl(&issue, "alice").unwrap();
        store.close_issue_impl(id, "done", "alice").unwrap();
        let conn = store.lock_conn().unwrap();
        conn.execute(
            "UPDATE issues SET closed_at = ?1 WHERE id = ?2",
            params![format_datetime(&(Utc::now() - Duration::days(45))), id],
        )
        .unwrap();
    }

    #[test]
    fn candidates_respect_threshold_and_level() {
        let store = test_store();
        closed_long_ago(&store, "bd-old");

        let fresh = IssueBuilder::new("Fresh close").id("bd-new").build();
        store.create_issue_impl(&fresh, "alice").unwrap();
        store.close_issue_impl("bd-new", "done", "alice").unwrap();

        let candidates = store.get_compaction_candidates_impl(1).unwrap();
        let ids: Vec<&str> = candidates.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["bd-old"]);
    }

    #[test]
    fn apply_compaction_snapshots_and_rewrites() {
        let store = test_store();
        closed_long_ago(&store, "bd-c");

        let compacted = store
            .apply_compaction_impl("bd-c", "short summary", Some("abc123"), "compactor")
            .unwrap();
        assert_eq!(compacted.description, "short summary");
        assert_eq!(compacted.compaction_level, 1);
        assert!(compacted.compacted_at.is_some());
        assert_eq!(compacted.compacted_at_commit.as_deref(), Some("abc123"));
        assert!(compacted.original_size > 0);

        // Pre-image preserved.
        let payload = store.get_compaction_snapshot_impl("bd-c", 1).unwrap();
        let pre: Issue = serde_json::from_str(&payload).unwrap();
        assert!(pre.description.contains("very long description"));

        // No longer a level-1 candidate.
        assert!(store.get_compaction_candidates_impl(1).unwrap().is_empty());

        let events = store.get_events_impl("bd-c", 10).unwrap();
        assert_eq!(events.last().unwrap().event_type, EventType::Compacted);
    }

    #[test]
    fn compaction_rejects_open_issue() {
        let store = test_store();
        let issue = IssueBuilder::new("Open").id("bd-open").build();
        store.create_issue_impl(&issue, "alice").unwrap();

        let err = store
            .apply_compaction_impl("bd-open", "s", None, "compactor")
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn compaction_stats() {
        let store = test_store();
        closed_long_ago(&store, "bd-s1");
        store
            .apply_compaction_impl("bd-s1", "s", None, "compactor")
            .unwrap();

        let stats = store.get_compaction_stats_impl().unwrap();
        assert!(stats.by_level.iter().any(|(level, n)| *level == 1 && *n == 1));
        assert!(stats.original_bytes > 0);
    }
}
