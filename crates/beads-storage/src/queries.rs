//! Complex queries: ready work, blocked issues, staleness, statistics,
//! epic closure eligibility.

use chrono::{Duration, Utc};

use beads_core::enums::SortPolicy;
use beads_core::filter::{StaleFilter, WorkFilter};
use beads_core::issue::Issue;

use crate::error::Result;
use crate::issues::{ISSUE_COLUMNS, format_datetime, scan_issue};
use crate::store::SqliteStore;
use crate::traits::{BlockedIssue, EpicStatus, Statistics};

/// Recursive CTE computing the set of blocked issue ids under the
/// hierarchical semantics: a `blocks` predecessor in a non-terminal state
/// blocks directly, and blockage flows downward through `parent-child`
/// edges from non-closed ancestors, bounded at depth 50.
const BLOCKED_SET_CTE: &str = r#"
    WITH RECURSIVE blocked_set(id, depth) AS (
        SELECT d.issue_id, 0
          FROM dependencies d
          JOIN issues b ON b.id = d.depends_on_id
         WHERE d.type = 'blocks'
           AND b.status IN ('open', 'in_progress', 'blocked')
        UNION
        SELECT d.issue_id, bs.depth + 1
          FROM dependencies d
          JOIN blocked_set bs ON d.depends_on_id = bs.id
          JOIN issues a ON a.id = bs.id
         WHERE d.type = 'parent-child'
           AND a.status != 'closed'
           AND bs.depth < 50
    )
"#;

impl SqliteStore {
    /// Returns issues that are ready to work on: open, with no blocking
    /// predecessor and no blocked ancestor, filtered and sorted per the
    /// work filter.
    pub fn get_ready_work_impl(&self, filter: &WorkFilter) -> Result<Vec<Issue>> {
        let conn = self.lock_conn()?;

        let mut where_clauses: Vec<String> = vec![
            "i.status = 'open'".to_string(),
            "i.id NOT IN (SELECT id FROM blocked_set)".to_string(),
        ];
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        let mut param_idx = 1;

        if let Some(priority) = filter.priority {
            where_clauses.push(format!("i.priority = ?{param_idx}"));
            param_values.push(Box::new(priority));
            param_idx += 1;
        }
        if let Some(ref assignee) = filter.assignee {
            where_clauses.push(format!("i.assignee = ?{param_idx}"));
            param_values.push(Box::new(assignee.clone()));
            param_idx += 1;
        }

        // Label filters (AND).
        for label in &filter.labels {
            where_clauses.push(format!(
                "EXISTS (SELECT 1 FROM labels WHERE labels.issue_id = i.id AND labels.label = ?{param_idx})"
            ));
            param_values.push(Box::new(label.clone()));
            param_idx += 1;
        }

        // Label filters (OR).
        if !filter.labels_any.is_empty() {
            let placeholders: Vec<String> = filter
                .labels_any
                .iter()
                .enumerate()
                .map(|(j, _)| format!("?{}", param_idx + j))
                .collect();
            where_clauses.push(format!(
                "EXISTS (SELECT 1 FROM labels WHERE labels.issue_id = i.id AND labels.label IN ({}))",
                placeholders.join(",")
            ));
            for label in &filter.labels_any {
                param_values.push(Box::new(label.clone()));
            }
            param_idx += filter.labels_any.len();
        }

        let where_sql = where_clauses.join(" AND ");

        // Ties always break by id so the ordering is total.
        let order_sql = match filter.sort_policy {
            SortPolicy::Priority => "i.priority ASC, i.id ASC",
            SortPolicy::Oldest => "i.created_at ASC, i.id ASC",
            _ => "i.priority ASC, i.created_at ASC, i.id ASC",
        };

        let limit_sql = filter
            .limit
            .map(|l| format!(" LIMIT {l}"))
            .unwrap_or_default();

        let sql = format!(
            "{BLOCKED_SET_CTE}
             SELECT {ISSUE_COLUMNS} FROM issues i
             WHERE {where_sql}
             ORDER BY {order_sql}{limit_sql}"
        );

        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), scan_issue)?;

        let mut issues = Vec::new();
        for row in rows {
            issues.push(row?);
        }

        let _ = param_idx;
        Ok(issues)
    }

    /// Returns non-closed issues currently blocked, with their direct open
    /// blocker counts.
    pub fn get_blocked_issues_impl(&self) -> Result<Vec<BlockedIssue>> {
        let conn = self.lock_conn()?;

        let sql = format!(
            "{BLOCKED_SET_CTE}
             SELECT {ISSUE_COLUMNS},
                    (SELECT COUNT(*)
                     FROM dependencies d
                     JOIN issues b ON b.id = d.depends_on_id
                     WHERE d.issue_id = i.id
                       AND d.type = 'blocks'
                       AND b.status IN ('open', 'in_progress', 'blocked')
                    ) AS blocked_by_count
             FROM issues i
             WHERE i.status != 'closed'
               AND i.id IN (SELECT id FROM blocked_set)
             ORDER BY i.priority ASC, i.created_at ASC, i.id ASC"
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            let issue = scan_issue(row)?;
            let blocked_by_count: i32 = row.get("blocked_by_count")?;
            Ok(BlockedIssue {
                issue,
                blocked_by_count,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Returns issues whose `updated_at` is older than `days` days,
    /// optionally filtered by status (default: all non-closed).
    pub fn get_stale_issues_impl(&self, filter: &StaleFilter) -> Result<Vec<Issue>> {
        let conn = self.lock_conn()?;
        let cutoff = Utc::now() - Duration::days(filter.days);

        let mut where_clauses = vec!["updated_at < ?1".to_string()];
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(format_datetime(&cutoff))];

        match filter.status {
            Some(ref status) => {
                where_clauses.push("status = ?2".to_string());
                param_values.push(Box::new(status.as_str().to_string()));
            }
            None => where_clauses.push("status != 'closed'".to_string()),
        }

        let limit_sql = filter
            .limit
            .map(|l| format!(" LIMIT {l}"))
            .unwrap_or_default();
        let sql = format!(
            "SELECT {ISSUE_COLUMNS} FROM issues
             WHERE {}
             ORDER BY updated_at ASC, id ASC{limit_sql}",
            where_clauses.join(" AND ")
        );

        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), scan_issue)?;

        let mut issues = Vec::new();
        for row in rows {
            issues.push(row?);
        }
        Ok(issues)
    }

    /// Returns aggregate statistics about the issue database.
    pub fn get_statistics_impl(&self) -> Result<Statistics> {
        let conn = self.lock_conn()?;
        let mut stats = Statistics::default();

        stats.total_issues = conn.query_row("SELECT COUNT(*) FROM issues", [], |row| row.get(0))?;
        stats.open_issues = conn.query_row(
            "SELECT COUNT(*) FROM issues WHERE status = 'open'",
            [],
            |row| row.get(0),
        )?;
        stats.in_progress_issues = conn.query_row(
            "SELECT COUNT(*) FROM issues WHERE status = 'in_progress'",
            [],
            |row| row.get(0),
        )?;
        stats.blocked_issues = conn.query_row(
            "SELECT COUNT(*) FROM issues WHERE status = 'blocked'",
            [],
            |row| row.get(0),
        )?;
        stats.closed_issues = conn.query_row(
            "SELECT COUNT(*) FROM issues WHERE status = 'closed'",
            [],
            |row| row.get(0),
        )?;
        stats.ready_issues = conn.query_row(
            &format!(
                "{BLOCKED_SET_CTE}
                 SELECT COUNT(*) FROM issues i
                 WHERE i.status = 'open'
                   AND i.id NOT IN (SELECT id FROM blocked_set)"
            ),
            [],
            |row| row.get(0),
        )?;
        stats.dirty_issues = conn.query_row("SELECT COUNT(*) FROM dirty_issues", [], |row| {
            row.get(0)
        })?;

        // By type.
        {
            let mut stmt = conn.prepare(
                "SELECT issue_type, COUNT(*) FROM issues GROUP BY issue_type ORDER BY COUNT(*) DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                stats.by_type.push(row?);
            }
        }

        // By priority.
        {
            let mut stmt = conn.prepare(
                "SELECT priority, COUNT(*) FROM issues GROUP BY priority ORDER BY priority ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, i32>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                stats.by_priority.push(row?);
            }
        }

        // By assignee (open work only).
        {
            let mut stmt = conn.prepare(
                "SELECT COALESCE(NULLIF(assignee, ''), '(unassigned)'), COUNT(*)
                 FROM issues
                 WHERE status != 'closed'
                 GROUP BY assignee
                 ORDER BY COUNT(*) DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                stats.by_assignee.push(row?);
            }
        }

        Ok(stats)
    }

    /// Returns non-closed epics whose parent-child children are all closed
    /// (and that have at least one child).
    pub fn get_epics_eligible_for_closure_impl(&self) -> Result<Vec<EpicStatus>> {
        let conn = self.lock_conn()?;

        let sql = format!(
            "SELECT {ISSUE_COLUMNS},
                    (SELECT COUNT(*)
                     FROM dependencies d
                     WHERE d.depends_on_id = i.id AND d.type = 'parent-child'
                    ) AS total_children,
                    (SELECT COUNT(*)
                     FROM dependencies d
                     JOIN issues child ON child.id = d.issue_id
                     WHERE d.depends_on_id = i.id
                       AND d.type = 'parent-child'
                       AND child.status = 'closed'
                    ) AS closed_children
             FROM issues i
             WHERE i.issue_type = 'epic'
               AND i.status != 'closed'
               AND (SELECT COUNT(*)
                    FROM dependencies d
                    WHERE d.depends_on_id = i.id AND d.type = 'parent-child'
                   ) > 0
               AND (SELECT COUNT(*)
                    FROM dependencies d
                    WHERE d.depends_on_id = i.id AND d.type = 'parent-child'
                   ) = (SELECT COUNT(*)
                        FROM dependencies d
                        JOIN issues child ON child.id = d.issue_id
                        WHERE d.depends_on_id = i.id
                          AND d.type = 'parent-child'
                          AND child.status = 'closed'
                       )
             ORDER BY i.created_at ASC, i.id ASC"
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            let issue = scan_issue(row)?;
            let total_children: i32 = row.get("total_children")?;
            let closed_children: i32 = row.get("closed_children")?;
            Ok(EpicStatus {
                epic: issue,
                total_children,
                closed_children,
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }
}
