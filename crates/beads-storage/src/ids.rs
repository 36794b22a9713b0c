//! ID allocation and partial-ID resolution.
//!
//! Hash ids are allocated inside the same write transaction that inserts
//! the issue, so the uniqueness check and the insert are atomic. The hex
//! truncation length starts at [`beads_core::idgen::DEFAULT_HASH_LEN`] and
//! grows one nibble per observed collision.

use rusqlite::{Connection, params};

use beads_core::idgen;
use beads_core::issue::Issue;

use crate::error::{Result, StorageError};
use crate::store::SqliteStore;

// ---------------------------------------------------------------------------
// Allocation (connection-level, transaction-scoped)
// ---------------------------------------------------------------------------

/// Returns `true` if an issue row with the given id exists.
pub(crate) fn id_exists(conn: &Connection, id: &str) -> Result<bool> {
    let n: i32 = conn.query_row(
        "SELECT COUNT(*) FROM issues WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

/// Allocates a collision-free hash id for a new issue.
///
/// Must be called inside the write transaction that will insert the issue.
pub(crate) fn allocate_hash_id(conn: &Connection, prefix: &str, issue: &Issue, actor: &str) -> Result<String> {
    let digest = idgen::id_digest(&issue.title, &issue.description, actor, issue.created_at);

    let mut len = idgen::DEFAULT_HASH_LEN;
    while len <= idgen::MAX_HASH_LEN {
        let candidate = idgen::format_id(prefix, &digest, len);
        if !id_exists(conn, &candidate)? {
            return Ok(candidate);
        }
        tracing::debug!(candidate, len, "hash id collision, growing");
        len += 1;
    }

    Err(StorageError::conflict(format!(
        "could not allocate a unique id for prefix {prefix} within {} hex chars",
        idgen::MAX_HASH_LEN
    )))
}

/// Allocates the next hierarchical child id for a parent.
///
/// Atomically advances `child_counters[parent_id]` inside the caller's
/// write transaction.
pub(crate) fn allocate_child_id(conn: &Connection, parent_id: &str) -> Result<String> {
    let n = crate::dirty::next_child_on_conn(conn, parent_id)?;
    Ok(idgen::child_id(parent_id, n))
}

// ---------------------------------------------------------------------------
// Partial-ID resolution
// ---------------------------------------------------------------------------

/// Resolves a possibly-partial id to the unique canonical id.
///
/// Accepts the canonical form (`bd-a3f8e9`), the bare hash (`a3f8e9`), the
/// undashed form (`bda3f8e9`), or a unique substring of the hash part.
pub(crate) fn resolve_id_on_conn(conn: &Connection, prefix: &str, input: &str) -> Result<String> {
    let dashed = format!("{prefix}-");

    // 1. Normalize to full form and try the exact lookup.
    let full = if input.starts_with(&dashed) {
        input.to_string()
    } else {
        format!("{dashed}{input}")
    };
    if id_exists(conn, &full)? {
        return Ok(full);
    }

    // The hash part the caller meant: strip "<prefix>-", then a bare
    // "<prefix>" for undashed inputs.
    let input_hash = input
        .strip_prefix(&dashed)
        .or_else(|| input.strip_prefix(prefix))
        .unwrap_or(input);

    // 2. Fetch candidates and rank.
    let like = format!("{dashed}%");
    let mut stmt = conn.prepare("SELECT id FROM issues WHERE id LIKE ?1 ORDER BY id")?;
    let rows = stmt.query_map(params![like], |row| row.get::<_, String>(0))?;

    let mut substring_matches: Vec<String> = Vec::new();
    for row in rows {
        let id = row?;
        if id == input {
            return Ok(id);
        }
        let Some(hash) = idgen::hash_part(&id) else {
            continue;
        };
        if hash == input_hash {
            // Exact hash match is preferred over any substring match and,
            // via the candidate ordering, the parent over its children.
            return Ok(id);
        }
        if !input_hash.is_empty() && hash.contains(input_hash) {
            substring_matches.push(id);
        }
    }

    match substring_matches.len() {
        0 => Err(StorageError::not_found("issue", input)),
        1 => Ok(substring_matches.remove(0)),
        _ => Err(StorageError::conflict(format!(
            "ambiguous id {input}: matches {}",
            substring_matches.join(", ")
        ))),
    }
}

// ---------------------------------------------------------------------------
// SqliteStore methods
// ---------------------------------------------------------------------------

impl SqliteStore {
    /// Resolves a partial id to its canonical form.
    pub fn resolve_id_impl(&self, input: &str) -> Result<String> {
        let prefix = self.require_prefix()?;
        let conn = self.lock_conn()?;
        resolve_id_on_conn(&conn, &prefix, input)
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
        store.create_issue_impl(&issue, "test").unwrap();
    }

    #[test]
    fn resolve_canonical() {
        let store = test_store();
        seed(&store, "bd-a3f8e9");
        assert_eq!(store.resolve_id_impl("bd-a3f8e9").unwrap(), "bd-a3f8e9");
    }

    #[test]
    fn resolve_bare_hash() {
        let store = test_store();
        seed(&store, "bd-a3f8e9");
        assert_eq!(store.resolve_id_impl("a3f8e9").unwrap(), "bd-a3f8e9");
    }

    #[test]
    fn resolve_undashed() {
        let store = test_store();
        seed(&store, "bd-a3f8e9");
        assert_eq!(store.resolve_id_impl("bda3f8e9").unwrap(), "bd-a3f8e9");
    }

    #[test]
    fn resolve_substring_unique() {
        let store = test_store();
        seed(&store, "bd-a3f8e9");
        seed(&store, "bd-77c210");
        assert_eq!(store.resolve_id_impl("3f8").unwrap(), "bd-a3f8e9");
    }

    #[test]
    fn resolve_prefers_parent_over_children() {
        let store = test_store();
        seed(&store, "bd-3d0");
        seed(&store, "bd-3d0.1");
        assert_eq!(store.resolve_id_impl("3d0").unwrap(), "bd-3d0");
    }

    #[test]
    fn resolve_ambiguous() {
        let store = test_store();
        seed(&store, "bd-abc111");
        seed(&store, "bd-abc222");
        let err = store.resolve_id_impl("abc").unwrap_err();
        assert!(err.is_conflict(), "expected ambiguity conflict, got {err}");
    }

    #[test]
    fn resolve_not_found() {
        let store = test_store();
        seed(&store, "bd-a3f8e9");
        let err = store.resolve_id_impl("zzz").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn hash_allocation_grows_on_collision() {
        let store = test_store();
        let conn = store.lock_conn().unwrap();

        let issue = IssueBuilder::new("Collide").description("d").build();
        let digest =
            idgen::id_digest(&issue.title, &issue.description, "alice", issue.created_at);

        // Occupy the 6-char candidate; the allocator must fall through to 7.
        let clash = idgen::format_id("bd", &digest, idgen::DEFAULT_HASH_LEN);
        conn.execute(
            "INSERT INTO issues (id, title) VALUES (?1, 'squatter')",
            params![clash],
        )
        .unwrap();

        let allocated = allocate_hash_id(&conn, "bd", &issue, "alice").unwrap();
        assert_eq!(
            allocated,
            idgen::format_id("bd", &digest, idgen::DEFAULT_HASH_LEN + 1)
        );
    }
}
