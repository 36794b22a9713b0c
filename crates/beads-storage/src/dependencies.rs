//! Dependency CRUD operations and cycle detection for [`SqliteStore`].

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;
use rusqlite::{Connection, TransactionBehavior, params};

use beads_core::dependency::{Dependency, DependencyCounts};
use beads_core::enums::{DependencyType, EventType};
use beads_core::issue::Issue;

use crate::dirty::mark_dirty_on_conn;
use crate::error::{Result, StorageError};
use crate::issues::{
    ISSUE_COLUMNS_PREFIXED, emit_event, format_datetime, get_issue_on_conn, parse_datetime,
    scan_issue,
};
use crate::store::SqliteStore;
use crate::traits::{IssueWithDependencyMetadata, TreeNode};

/// Depth bound for cycle detection and tree traversal. Deep enough for any
/// realistic graph; keeps pathological inputs from running away.
pub(crate) const MAX_GRAPH_DEPTH: i32 = 50;

// ---------------------------------------------------------------------------
// Connection-level helpers
// ---------------------------------------------------------------------------

/// Inserts a dependency edge, with cycle detection for blocking types.
/// Marks both endpoints dirty.
pub(crate) fn add_dependency_on_conn(
    conn: &Connection,
    dep: &Dependency,
    actor: &str,
) -> Result<()> {
    // Both endpoints must exist; FKs would reject anyway but the error
    // should name the missing issue.
    for id in [&dep.issue_id, &dep.depends_on_id] {
        if !crate::ids::id_exists(conn, id)? {
            return Err(StorageError::not_found("issue", id.clone()));
        }
    }

    if dep.dep_type.in_blocking_graph() {
        detect_cycle(conn, &dep.issue_id, &dep.depends_on_id)?;
    }

    let now_str = format_datetime(&Utc::now());
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO dependencies
         (issue_id, depends_on_id, type, created_at, created_by)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            dep.issue_id,
            dep.depends_on_id,
            dep.dep_type.as_str(),
            format_datetime(&dep.created_at),
            dep.created_by,
        ],
    )?;
    // At most one edge per ordered pair, regardless of type.
    if inserted == 0 {
        return Err(StorageError::conflict(format!(
            "dependency {} -> {} already exists",
            dep.issue_id, dep.depends_on_id
        )));
    }

    emit_event(
        conn,
        &dep.issue_id,
        EventType::DependencyAdded,
        actor,
        None,
        Some(&dep.depends_on_id),
        Some(dep.dep_type.as_str()),
        &now_str,
    )?;
    mark_dirty_on_conn(conn, &dep.issue_id)?;
    mark_dirty_on_conn(conn, &dep.depends_on_id)?;

    Ok(())
}

/// Removes a dependency edge. With `dep_type` given, only an edge of that
/// type is removed. Marks both endpoints dirty.
pub(crate) fn remove_dependency_on_conn(
    conn: &Connection,
    issue_id: &str,
    depends_on_id: &str,
    actor: &str,
    dep_type: Option<&DependencyType>,
) -> Result<()> {
    let affected = match dep_type {
        Some(t) => conn.execute(
            "DELETE FROM dependencies
             WHERE issue_id = ?1 AND depends_on_id = ?2 AND type = ?3",
            params![issue_id, depends_on_id, t.as_str()],
        )?,
        None => conn.execute(
            "DELETE FROM dependencies WHERE issue_id = ?1 AND depends_on_id = ?2",
            params![issue_id, depends_on_id],
        )?,
    };

    if affected == 0 {
        return Err(StorageError::not_found(
            "dependency",
            format!("{issue_id} -> {depends_on_id}"),
        ));
    }

    emit_event(
        conn,
        issue_id,
        EventType::DependencyRemoved,
        actor,
        Some(depends_on_id),
        None,
        None,
        &format_datetime(&Utc::now()),
    )?;
    mark_dirty_on_conn(conn, issue_id)?;
    mark_dirty_on_conn(conn, depends_on_id)?;

    Ok(())
}

/// Returns raw dependency records for an issue.
pub(crate) fn get_dependency_records_on_conn(
    conn: &Connection,
    issue_id: &str,
) -> Result<Vec<Dependency>> {
    let mut stmt = conn.prepare(
        "SELECT issue_id, depends_on_id, type, created_at, created_by
         FROM dependencies WHERE issue_id = ?1 ORDER BY depends_on_id",
    )?;
    let rows = stmt.query_map(params![issue_id], scan_dependency)?;

    let mut deps = Vec::new();
    for row in rows {
        deps.push(row?);
    }
    Ok(deps)
}

fn scan_dependency(row: &rusqlite::Row<'_>) -> rusqlite::Result<Dependency> {
    Ok(Dependency {
        issue_id: row.get("issue_id")?,
        depends_on_id: row.get("depends_on_id")?,
        dep_type: DependencyType::from(row.get::<_, String>("type")?),
        created_at: parse_datetime(&row.get::<_, String>("created_at")?),
        created_by: row.get("created_by")?,
    })
}

/// Bulk dependency/dependent counts for a set of ids, one round trip.
pub(crate) fn get_dependency_counts_on_conn(
    conn: &Connection,
    ids: &[String],
) -> Result<HashMap<String, DependencyCounts>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = format!(
        "SELECT i.id,
                (SELECT COUNT(*) FROM dependencies d WHERE d.issue_id = i.id),
                (SELECT COUNT(*) FROM dependencies d WHERE d.depends_on_id = i.id)
         FROM issues i WHERE i.id IN ({placeholders})"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(ids.iter()), |row| {
        Ok((
            row.get::<_, String>(0)?,
            DependencyCounts {
                dependency_count: row.get(1)?,
                dependent_count: row.get(2)?,
            },
        ))
    })?;

    let mut map = HashMap::new();
    for row in rows {
        let (id, counts) = row?;
        map.insert(id, counts);
    }
    Ok(map)
}

// ---------------------------------------------------------------------------
// Cycle detection
// ---------------------------------------------------------------------------

/// Rejects an edge `issue_id -> depends_on_id` whose addition would create
/// a directed cycle in the combined blocks/parent-child subgraph.
///
/// BFS from `depends_on_id` along blocking edges looking for `issue_id`,
/// bounded at [`MAX_GRAPH_DEPTH`].
pub(crate) fn detect_cycle(conn: &Connection, issue_id: &str, depends_on_id: &str) -> Result<()> {
    if issue_id == depends_on_id {
        return Err(StorageError::CycleDetected {
            from: issue_id.to_string(),
            to: depends_on_id.to_string(),
        });
    }

    let mut visited: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<(String, i32)> = VecDeque::new();
    queue.push_back((depends_on_id.to_string(), 0));

    while let Some((current, depth)) = queue.pop_front() {
        if current == issue_id {
            return Err(StorageError::CycleDetected {
                from: issue_id.to_string(),
                to: depends_on_id.to_string(),
            });
        }
        if depth >= MAX_GRAPH_DEPTH || !visited.insert(current.clone()) {
            continue;
        }
        let mut stmt = conn.prepare_cached(
            "SELECT depends_on_id FROM dependencies
             WHERE issue_id = ?1 AND type IN ('blocks', 'parent-child')",
        )?;
        let rows = stmt.query_map(params![current], |row| row.get::<_, String>(0))?;
        for row in rows {
            let next = row?;
            if !visited.contains(&next) {
                queue.push_back((next, depth + 1));
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// SqliteStore methods
// ---------------------------------------------------------------------------

impl SqliteStore {
    /// Adds a dependency edge.
    pub fn add_dependency_impl(&self, dep: &Dependency, actor: &str) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        add_dependency_on_conn(&tx, dep, actor)?;
        tx.commit()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;
        Ok(())
    }

    /// Removes a dependency edge, optionally constrained to a type.
    pub fn remove_dependency_impl(
        &self,
        issue_id: &str,
        depends_on_id: &str,
        actor: &str,
        dep_type: Option<&DependencyType>,
    ) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        remove_dependency_on_conn(&tx, issue_id, depends_on_id, actor, dep_type)?;
        tx.commit()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;
        Ok(())
    }

    /// Returns the issues that the given issue depends on.
    pub fn get_dependencies_impl(&self, issue_id: &str) -> Result<Vec<Issue>> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {ISSUE_COLUMNS_PREFIXED} FROM issues
             INNER JOIN dependencies d ON issues.id = d.depends_on_id
             WHERE d.issue_id = ?1
             ORDER BY issues.id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![issue_id], scan_issue)?;
        let mut issues = Vec::new();
        for row in rows {
            issues.push(row?);
        }
        Ok(issues)
    }

    /// Returns the issues that depend on the given issue.
    pub fn get_dependents_impl(&self, issue_id: &str) -> Result<Vec<Issue>> {
        let conn = self.lock_conn()?;
        let sql = format!(
            "SELECT {ISSUE_COLUMNS_PREFIXED} FROM issues
             INNER JOIN dependencies d ON issues.id = d.issue_id
             WHERE d.depends_on_id = ?1
             ORDER BY issues.id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![issue_id], scan_issue)?;
        let mut issues = Vec::new();
        for row in rows {
            issues.push(row?);
        }
        Ok(issues)
    }

    /// Returns raw dependency records for an issue.
    pub fn get_dependency_records_impl(&self, issue_id: &str) -> Result<Vec<Dependency>> {
        let conn = self.lock_conn()?;
        get_dependency_records_on_conn(&conn, issue_id)
    }

    /// Returns dependencies with their edge metadata.
    pub fn get_dependencies_with_metadata_impl(
        &self,
        issue_id: &str,
    ) -> Result<Vec<IssueWithDependencyMetadata>> {
        let conn = self.lock_conn()?;
        get_deps_with_metadata(&conn, issue_id, true)
    }

    /// Returns dependents with their edge metadata.
    pub fn get_dependents_with_metadata_impl(
        &self,
        issue_id: &str,
    ) -> Result<Vec<IssueWithDependencyMetadata>> {
        let conn = self.lock_conn()?;
        get_deps_with_metadata(&conn, issue_id, false)
    }

    /// Bulk dependency/dependent counts for a set of ids.
    pub fn get_dependency_counts_impl(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, DependencyCounts>> {
        let conn = self.lock_conn()?;
        get_dependency_counts_on_conn(&conn, ids)
    }

    /// Traverses the dependency tree from a root issue via BFS.
    pub fn get_dependency_tree_impl(
        &self,
        issue_id: &str,
        max_depth: i32,
        reverse: bool,
    ) -> Result<Vec<TreeNode>> {
        let conn = self.lock_conn()?;
        let max_depth = max_depth.clamp(1, MAX_GRAPH_DEPTH);

        let mut result = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, i32)> = VecDeque::new();

        let root = get_issue_on_conn(&conn, issue_id)?;
        result.push(TreeNode {
            issue: root,
            depth: 0,
            dep_type: DependencyType::Blocks,
        });
        visited.insert(issue_id.to_string());
        queue.push_back((issue_id.to_string(), 0));

        while let Some((current_id, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }

            let sql = if reverse {
                "SELECT d.issue_id, d.type FROM dependencies d WHERE d.depends_on_id = ?1"
            } else {
                "SELECT d.depends_on_id, d.type FROM dependencies d WHERE d.issue_id = ?1"
            };
            let mut stmt = conn.prepare(sql)?;
            let edges: Vec<(String, String)> = stmt
                .query_map(params![current_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .filter_map(|r| r.ok())
                .collect();

            for (next_id, dep_type_str) in edges {
                if !visited.insert(next_id.clone()) {
                    continue;
                }
                if let Ok(issue) = get_issue_on_conn(&conn, &next_id) {
                    result.push(TreeNode {
                        issue,
                        depth: depth + 1,
                        dep_type: DependencyType::from(dep_type_str.as_str()),
                    });
                    queue.push_back((next_id, depth + 1));
                }
            }
        }

        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// `forward=true` returns the dependencies of `issue_id`; `forward=false`
/// returns its dependents.
fn get_deps_with_metadata(
    conn: &Connection,
    issue_id: &str,
    forward: bool,
) -> Result<Vec<IssueWithDependencyMetadata>> {
    let (join_col, filter_col) = if forward {
        ("depends_on_id", "issue_id")
    } else {
        ("issue_id", "depends_on_id")
    };

    let sql = format!(
        "SELECT {ISSUE_COLUMNS_PREFIXED},
                d.issue_id AS dep_issue_id,
                d.depends_on_id AS dep_depends_on_id,
                d.type AS dep_type,
                d.created_at AS dep_created_at,
                d.created_by AS dep_created_by
         FROM issues
         INNER JOIN dependencies d ON issues.id = d.{join_col}
         WHERE d.{filter_col} = ?1
         ORDER BY issues.id"
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![issue_id], |row| {
        let issue = scan_issue(row)?;
        let dep = Dependency {
            issue_id: row.get("dep_issue_id")?,
            depends_on_id: row.get("dep_depends_on_id")?,
            dep_type: DependencyType::from(row.get::<_, String>("dep_type")?),
            created_at: parse_datetime(&row.get::<_, String>("dep_created_at")?),
            created_by: row.get("dep_created_by")?,
        };
        Ok(IssueWithDependencyMetadata {
            issue,
            dependency: dep,
        })
    })?;

    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
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

    fn blocks(issue_id: &str, depends_on_id: &str) -> Dependency {
        Dependency::new(issue_id, depends_on_id, DependencyType::Blocks, "test")
    }

    #[test]
    fn add_and_get_dependency() {
        let store = test_store();
        seed(&store, "bd-p1");
        seed(&store, "bd-c1");

        store
            .add_dependency_impl(&blocks("bd-c1", "bd-p1"), "alice")
            .unwrap();

        let deps = store.get_dependencies_impl("bd-c1").unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].id, "bd-p1");

        let dependents = store.get_dependents_impl("bd-p1").unwrap();
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[0].id, "bd-c1");
    }

    #[test]
    fn add_dependency_marks_both_dirty() {
        let store = test_store();
        seed(&store, "bd-a");
        seed(&store, "bd-b");
        // Clear create-time dirt so the edge's effect is visible.
        store.note_exported_impl("bd-a", "h").unwrap();
        store.note_exported_impl("bd-b", "h").unwrap();

        store
            .add_dependency_impl(&blocks("bd-a", "bd-b"), "alice")
            .unwrap();
        let dirty: Vec<String> = store
            .get_dirty_issues_impl()
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert!(dirty.contains(&"bd-a".to_string()));
        assert!(dirty.contains(&"bd-b".to_string()));
    }

    #[test]
    fn duplicate_edge_conflicts() {
        let store = test_store();
        seed(&store, "bd-a");
        seed(&store, "bd-b");
        store
            .add_dependency_impl(&blocks("bd-a", "bd-b"), "alice")
            .unwrap();
        // Same ordered pair, even with a different type.
        let dup = Dependency::new("bd-a", "bd-b", DependencyType::Related, "test");
        let err = store.add_dependency_impl(&dup, "alice").unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn missing_endpoint_not_found() {
        let store = test_store();
        seed(&store, "bd-a");
        let err = store
            .add_dependency_impl(&blocks("bd-a", "bd-nope"), "alice")
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn remove_dependency_roundtrip() {
        let store = test_store();
        seed(&store, "bd-a");
        seed(&store, "bd-b");
        store
            .add_dependency_impl(&blocks("bd-b", "bd-a"), "alice")
            .unwrap();
        store
            .remove_dependency_impl("bd-b", "bd-a", "alice", None)
            .unwrap();

        assert!(store.get_dependencies_impl("bd-b").unwrap().is_empty());

        // Add + remove leaves the graph unchanged but two audit events.
        let events = store.get_events_impl("bd-b", 10).unwrap();
        let kinds: Vec<&EventType> = events.iter().map(|e| &e.event_type).collect();
        assert!(kinds.contains(&&EventType::DependencyAdded));
        assert!(kinds.contains(&&EventType::DependencyRemoved));
    }

    #[test]
    fn remove_with_type_mismatch_not_found() {
        let store = test_store();
        seed(&store, "bd-a");
        seed(&store, "bd-b");
        store
            .add_dependency_impl(&blocks("bd-b", "bd-a"), "alice")
            .unwrap();
        let err = store
            .remove_dependency_impl("bd-b", "bd-a", "alice", Some(&DependencyType::Related))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn cycle_detection_rejects() {
        let store = test_store();
        for id in ["bd-cy1", "bd-cy2", "bd-cy3"] {
            seed(&store, id);
        }
        // A -> B -> C
        store
            .add_dependency_impl(&blocks("bd-cy1", "bd-cy2"), "alice")
            .unwrap();
        store
            .add_dependency_impl(&blocks("bd-cy2", "bd-cy3"), "alice")
            .unwrap();

        // C -> A would close the loop.
        let err = store
            .add_dependency_impl(&blocks("bd-cy3", "bd-cy1"), "alice")
            .unwrap_err();
        assert!(err.is_cycle());

        // Graph unchanged.
        assert!(store.get_dependencies_impl("bd-cy3").unwrap().is_empty());
    }

    #[test]
    fn cycle_detection_spans_parent_child() {
        let store = test_store();
        for id in ["bd-e", "bd-t"] {
            seed(&store, id);
        }
        // t is a child of e.
        store
            .add_dependency_impl(
                &Dependency::new("bd-t", "bd-e", DependencyType::ParentChild, "test"),
                "alice",
            )
            .unwrap();
        // e blocked by t combined with the parent edge forms a cycle.
        let err = store
            .add_dependency_impl(&blocks("bd-e", "bd-t"), "alice")
            .unwrap_err();
        assert!(err.is_cycle());
    }

    #[test]
    fn non_blocking_edges_skip_cycle_check() {
        let store = test_store();
        seed(&store, "bd-x");
        seed(&store, "bd-y");
        store
            .add_dependency_impl(&blocks("bd-x", "bd-y"), "alice")
            .unwrap();
        // related back-edge is fine.
        store
            .add_dependency_impl(
                &Dependency::new("bd-y", "bd-x", DependencyType::Related, "test"),
                "alice",
            )
            .unwrap();
    }

    #[test]
    fn self_edge_is_a_cycle() {
        let store = test_store();
        seed(&store, "bd-s");
        let err = store
            .add_dependency_impl(&blocks("bd-s", "bd-s"), "alice")
            .unwrap_err();
        assert!(err.is_cycle());
    }

    #[test]
    fn bulk_counts() {
        let store = test_store();
        for id in ["bd-1", "bd-2", "bd-3"] {
            seed(&store, id);
        }
        store
            .add_dependency_impl(&blocks("bd-1", "bd-2"), "alice")
            .unwrap();
        store
            .add_dependency_impl(&blocks("bd-3", "bd-2"), "alice")
            .unwrap();

        let counts = store
            .get_dependency_counts_impl(&["bd-1".into(), "bd-2".into(), "bd-3".into()])
            .unwrap();
        assert_eq!(counts["bd-1"].dependency_count, 1);
        assert_eq!(counts["bd-2"].dependent_count, 2);
        assert_eq!(counts["bd-3"].dependency_count, 1);
    }

    #[test]
    fn dependency_tree_traversal() {
        let store = test_store();
        for id in ["bd-r", "bd-m", "bd-l"] {
            seed(&store, id);
        }
        store
            .add_dependency_impl(&blocks("bd-r", "bd-m"), "alice")
            .unwrap();
        store
            .add_dependency_impl(&blocks("bd-m", "bd-l"), "alice")
            .unwrap();

        let tree = store.get_dependency_tree_impl("bd-r", 10, false).unwrap();
        let ids: Vec<&str> = tree.iter().map(|n| n.issue.id.as_str()).collect();
        assert_eq!(ids, vec!["bd-r", "bd-m", "bd-l"]);
        assert_eq!(tree[2].depth, 2);

        // Depth limit cuts the walk.
        let tree = store.get_dependency_tree_impl("bd-r", 1, false).unwrap();
        assert_eq!(tree.len(), 2);

        // Reverse walks dependents.
        let tree = store.get_dependency_tree_impl("bd-l", 10, true).unwrap();
        let ids: Vec<&str> = tree.iter().map(|n| n.issue.id.as_str()).collect();
        assert_eq!(ids, vec!["bd-l", "bd-m", "bd-r"]);
    }

    #[test]
    fn deps_with_metadata() {
        let store = test_store();
        seed(&store, "bd-a");
        seed(&store, "bd-b");
        store
            .add_dependency_impl(
                &Dependency::new("bd-a", "bd-b", DependencyType::DiscoveredFrom, "carol"),
                "carol",
            )
            .unwrap();

        let forward = store.get_dependencies_with_metadata_impl("bd-a").unwrap();
        assert_eq!(forward.len(), 1);
        assert_eq!(forward[0].issue.id, "bd-b");
        assert_eq!(forward[0].dependency.dep_type, DependencyType::DiscoveredFrom);
        assert_eq!(forward[0].dependency.created_by, "carol");

        let reverse = store.get_dependents_with_metadata_impl("bd-b").unwrap();
        assert_eq!(reverse.len(), 1);
        assert_eq!(reverse[0].issue.id, "bd-a");
    }
}
