//! Comment and Event operations for [`SqliteStore`].

use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior, params};

use beads_core::comment::{Comment, Event};
use beads_core::enums::EventType;

use crate::dirty::mark_dirty_on_conn;
use crate::error::{Result, StorageError};
use crate::issues::{emit_event, format_datetime, parse_datetime};
use crate::store::SqliteStore;

// ---------------------------------------------------------------------------
// Connection-level helpers (shared with Transaction)
// ---------------------------------------------------------------------------

/// Adds a comment, emits a "commented" event, and marks the issue dirty.
pub(crate) fn add_comment_on_conn(
    conn: &Connection,
    issue_id: &str,
    author: &str,
    text: &str,
) -> Result<Comment> {
    if !crate::ids::id_exists(conn, issue_id)? {
        return Err(StorageError::not_found("issue", issue_id));
    }
    let now = Utc::now();
    let now_str = format_datetime(&now);

    conn.execute(
        "INSERT INTO comments (issue_id, author, text, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![issue_id, author, text, now_str],
    )?;
    let id = conn.last_insert_rowid();

    emit_event(
        conn,
        issue_id,
        EventType::Commented,
        author,
        None,
        None,
        Some(text),
        &now_str,
    )?;
    mark_dirty_on_conn(conn, issue_id)?;

    Ok(Comment {
        id,
        issue_id: issue_id.to_string(),
        author: author.to_string(),
        text: text.to_string(),
        created_at: now,
    })
}

/// Imports a comment with an explicit timestamp and no audit event (used by
/// mirror import, which replays history rather than creating it).
pub(crate) fn import_comment_on_conn(
    conn: &Connection,
    issue_id: &str,
    author: &str,
    text: &str,
    created_at: DateTime<Utc>,
) -> Result<Comment> {
    conn.execute(
        "INSERT INTO comments (issue_id, author, text, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![issue_id, author, text, format_datetime(&created_at)],
    )?;
    let id = conn.last_insert_rowid();

    Ok(Comment {
        id,
        issue_id: issue_id.to_string(),
        author: author.to_string(),
        text: text.to_string(),
        created_at,
    })
}

/// Returns all comments for an issue, oldest first.
pub(crate) fn get_comments_on_conn(conn: &Connection, issue_id: &str) -> Result<Vec<Comment>> {
    let mut stmt = conn.prepare(
        "SELECT id, issue_id, author, text, created_at
         FROM comments WHERE issue_id = ?1 ORDER BY created_at ASC, id ASC",
    )?;
    let rows = stmt.query_map(params![issue_id], |row| {
        let created_at_str: String = row.get(4)?;
        Ok(Comment {
            id: row.get(0)?,
            issue_id: row.get(1)?,
            author: row.get(2)?,
            text: row.get(3)?,
            created_at: parse_datetime(&created_at_str),
        })
    })?;
    let mut comments = Vec::new();
    for row in rows {
        comments.push(row?);
    }
    Ok(comments)
}

fn scan_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let created_at_str: String = row.get("created_at")?;
    Ok(Event {
        id: row.get("id")?,
        issue_id: row.get("issue_id")?,
        event_type: EventType::from(row.get::<_, String>("event_type")?),
        actor: row.get("actor")?,
        old_value: row.get("old_value")?,
        new_value: row.get("new_value")?,
        comment: row.get("comment")?,
        created_at: parse_datetime(&created_at_str),
    })
}

// ---------------------------------------------------------------------------
// SqliteStore methods
// ---------------------------------------------------------------------------

impl SqliteStore {
    /// Adds a comment to an issue and returns the created comment.
    pub fn add_comment_impl(&self, issue_id: &str, author: &str, text: &str) -> Result<Comment> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let comment = add_comment_on_conn(&tx, issue_id, author, text)?;
        tx.commit()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;
        Ok(comment)
    }

    /// Returns all comments for an issue.
    pub fn get_comments_impl(&self, issue_id: &str) -> Result<Vec<Comment>> {
        let conn = self.lock_conn()?;
        get_comments_on_conn(&conn, issue_id)
    }

    /// Returns events for an issue, oldest first, up to `limit`.
    pub fn get_events_impl(&self, issue_id: &str, limit: i32) -> Result<Vec<Event>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, issue_id, event_type, actor, old_value, new_value, comment, created_at
             FROM events WHERE issue_id = ?1 ORDER BY id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![issue_id, limit], scan_event)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// Returns all events with id greater than `since_id`, oldest first.
    pub fn get_all_events_since_impl(&self, since_id: i64) -> Result<Vec<Event>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, issue_id, event_type, actor, old_value, new_value, comment, created_at
             FROM events WHERE id > ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![since_id], scan_event)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
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

    fn seed(store: &SqliteStore, id: &str) {
        let issue = IssueBuilder::new(format!("Issue {id}")).id(id).build();
        store.create_issue_impl(&issue, "alice").unwrap();
    }

    #[test]
    fn add_and_list_comments() {
        let store = test_store();
        seed(&store, "bd-cm1");

        let c1 = store
            .add_comment_impl("bd-cm1", "alice", "first note")
            .unwrap();
        let c2 = store
            .add_comment_impl("bd-cm1", "bob", "second note")
            .unwrap();
        assert!(c2.id > c1.id);

        let comments = store.get_comments_impl("bd-cm1").unwrap();
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].text, "first note");
        assert_eq!(comments[1].author, "bob");
    }

    #[test]
    fn comment_emits_event_and_marks_dirty() {
        let store = test_store();
        seed(&store, "bd-cm2");
        store.note_exported_impl("bd-cm2", "h").unwrap();

        store
            .add_comment_impl("bd-cm2", "alice", "observations")
            .unwrap();

        let events = store.get_events_impl("bd-cm2", 10).unwrap();
        assert_eq!(events.last().unwrap().event_type, EventType::Commented);
        assert_eq!(
            events.last().unwrap().comment.as_deref(),
            Some("observations")
        );
        let dirty = store.get_dirty_issues_impl().unwrap();
        assert!(dirty.iter().any(|(id, _)| id == "bd-cm2"));
    }

    #[test]
    fn comment_on_missing_issue_fails() {
        let store = test_store();
        let err = store
            .add_comment_impl("bd-none", "alice", "lost")
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn events_since_cursor() {
        let store = test_store();
        seed(&store, "bd-cm3");
        let all = store.get_all_events_since_impl(0).unwrap();
        assert_eq!(all.len(), 1);

        let nothing = store.get_all_events_since_impl(all[0].id).unwrap();
        assert!(nothing.is_empty());
    }
}
