//! Issue CRUD operations for [`SqliteStore`].

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, TransactionBehavior, params};
use tracing::info;

use beads_core::content_hash::compute_content_hash;
use beads_core::enums::{EventType, IssueType, Status};
use beads_core::filter::{IssueFilter, MAX_ID_FILTER};
use beads_core::idgen;
use beads_core::issue::Issue;
use beads_core::update::{FieldUpdate, status_change};
use beads_core::validation::validate;

use crate::dirty::{mark_dirty_on_conn, note_child_on_conn};
use crate::error::{Result, StorageError};
use crate::ids;
use crate::labels::get_labels_on_conn;
use crate::store::SqliteStore;
use crate::traits::{DeleteReport, ListedIssue};

// ---------------------------------------------------------------------------
// Column list (shared between INSERT and SELECT)
// ---------------------------------------------------------------------------

/// All issue columns in a deterministic order for SELECT queries.
pub(crate) const ISSUE_COLUMNS: &str = r#"
    id, content_hash, title, description, design, acceptance_criteria, notes,
    status, priority, issue_type, assignee, estimated_minutes,
    external_ref, source_repo,
    created_at, updated_at, closed_at,
    compaction_level, compacted_at, compacted_at_commit, original_size
"#;

/// Same as [`ISSUE_COLUMNS`] but prefixed with `issues.` for JOIN queries
/// where column names would otherwise be ambiguous.
pub(crate) const ISSUE_COLUMNS_PREFIXED: &str = r#"
    issues.id, issues.content_hash, issues.title, issues.description, issues.design,
    issues.acceptance_criteria, issues.notes,
    issues.status, issues.priority, issues.issue_type, issues.assignee, issues.estimated_minutes,
    issues.external_ref, issues.source_repo,
    issues.created_at, issues.updated_at, issues.closed_at,
    issues.compaction_level, issues.compacted_at, issues.compacted_at_commit, issues.original_size
"#;

// ---------------------------------------------------------------------------
// Row scanning and datetime helpers
// ---------------------------------------------------------------------------

/// Deserialises a row into an [`Issue`]. Column order MUST match
/// [`ISSUE_COLUMNS`].
pub(crate) fn scan_issue(row: &Row<'_>) -> rusqlite::Result<Issue> {
    let closed_at_str: Option<String> = row.get("closed_at")?;
    let compacted_at_str: Option<String> = row.get("compacted_at")?;

    Ok(Issue {
        id: row.get("id")?,
        content_hash: row.get("content_hash")?,
        title: row.get("title")?,
        description: row.get("description")?,
        design: row.get("design")?,
        acceptance_criteria: row.get("acceptance_criteria")?,
        notes: row.get("notes")?,
        status: Status::from(row.get::<_, String>("status")?),
        priority: row.get("priority")?,
        issue_type: IssueType::from(row.get::<_, String>("issue_type")?),
        assignee: row.get("assignee")?,
        estimated_minutes: row.get("estimated_minutes")?,
        external_ref: row.get("external_ref")?,
        source_repo: row.get("source_repo")?,
        created_at: parse_datetime(&row.get::<_, String>("created_at")?),
        updated_at: parse_datetime(&row.get::<_, String>("updated_at")?),
        closed_at: closed_at_str.as_deref().map(parse_datetime),
        compaction_level: row.get("compaction_level")?,
        compacted_at: compacted_at_str.as_deref().map(parse_datetime),
        compacted_at_commit: row.get("compacted_at_commit")?,
        original_size: row.get("original_size")?,
        labels: Vec::new(),
        dependencies: Vec::new(),
    })
}

/// Formats a `DateTime<Utc>` as ISO 8601 TEXT for SQLite.
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Parses an ISO 8601 TEXT string from SQLite into a `DateTime<Utc>`.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    s.parse::<DateTime<Utc>>().unwrap_or_else(|_| {
        chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.fZ")
            .or_else(|_| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%SZ"))
            .or_else(|_| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
            .map(|ndt| ndt.and_utc())
            .unwrap_or_else(|_| Utc::now())
    })
}

/// Emits an event row into the events table.
#[allow(clippy::too_many_arguments)]
pub(crate) fn emit_event(
    conn: &Connection,
    issue_id: &str,
    event_type: EventType,
    actor: &str,
    old_value: Option<&str>,
    new_value: Option<&str>,
    comment: Option<&str>,
    created_at: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO events (issue_id, event_type, actor, old_value, new_value, comment, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            issue_id,
            event_type.as_str(),
            actor,
            old_value,
            new_value,
            comment,
            created_at,
        ],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

/// Inserts a finalized issue row. The caller has already set id and
/// content_hash and validated the fields.
pub(crate) fn insert_issue_row(conn: &Connection, issue: &Issue) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO issues ({ISSUE_COLUMNS}) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7,
                ?8, ?9, ?10, ?11, ?12,
                ?13, ?14,
                ?15, ?16, ?17,
                ?18, ?19, ?20, ?21
            )"
        ),
        params![
            issue.id,
            issue.content_hash,
            issue.title,
            issue.description,
            issue.design,
            issue.acceptance_criteria,
            issue.notes,
            issue.status.as_str(),
            issue.priority,
            issue.issue_type.as_str(),
            issue.assignee,
            issue.estimated_minutes,
            issue.external_ref,
            issue.source_repo,
            format_datetime(&issue.created_at),
            format_datetime(&issue.updated_at),
            issue.closed_at.as_ref().map(format_datetime),
            issue.compaction_level,
            issue.compacted_at.as_ref().map(format_datetime),
            issue.compacted_at_commit,
            issue.original_size,
        ],
    )?;
    Ok(())
}

/// Creates an issue on the given connection: allocates or validates the id,
/// computes the content hash, inserts the row (plus any labels carried on
/// the struct), emits a `created` event, and marks the issue dirty.
///
/// `mirror` enables bounded parent resurrection for hierarchical ids.
pub(crate) fn create_issue_on_conn(
    conn: &Connection,
    issue: &Issue,
    actor: &str,
    prefix: &str,
    mirror: Option<&Path>,
) -> Result<Issue> {
    let mut issue = issue.clone();
    issue.set_defaults();

    if issue.id.is_empty() {
        issue.id = ids::allocate_hash_id(conn, prefix, &issue, actor)?;
    } else {
        if !idgen::has_prefix(&issue.id, prefix) {
            return Err(StorageError::PrefixMismatch {
                id: issue.id,
                prefix: prefix.to_string(),
            });
        }
        if ids::id_exists(conn, &issue.id)? {
            return Err(StorageError::conflict(format!(
                "issue {} already exists",
                issue.id
            )));
        }
        if let Some(parent) = idgen::parent_of(&issue.id) {
            ensure_parent_chain(conn, parent, mirror, actor)?;
            if let Some(n) = idgen::child_suffix(&issue.id) {
                note_child_on_conn(conn, parent, n)?;
            }
        }
    }

    // closed <=> closed_at is auto-managed on the way in.
    if issue.status == Status::Closed && issue.closed_at.is_none() {
        issue.closed_at = Some(Utc::now());
    }
    issue.content_hash = compute_content_hash(&issue);
    validate(&issue)?;

    insert_issue_row(conn, &issue)?;
    for label in &issue.labels {
        conn.execute(
            "INSERT OR IGNORE INTO labels (issue_id, label) VALUES (?1, ?2)",
            params![issue.id, label],
        )?;
    }

    emit_event(
        conn,
        &issue.id,
        EventType::Created,
        actor,
        None,
        None,
        None,
        &format_datetime(&Utc::now()),
    )?;
    mark_dirty_on_conn(conn, &issue.id)?;

    Ok(issue)
}

/// Walks up a hierarchical id's parent chain and inserts any missing
/// ancestors found in the text mirror. The search is bounded by the dot
/// count of the id; an ancestor absent from both the database and the
/// mirror fails the create.
fn ensure_parent_chain(
    conn: &Connection,
    parent_id: &str,
    mirror: Option<&Path>,
    actor: &str,
) -> Result<()> {
    let mut missing: Vec<String> = Vec::new();
    let mut cursor = Some(parent_id.to_string());
    while let Some(id) = cursor {
        if ids::id_exists(conn, &id)? {
            break;
        }
        cursor = idgen::parent_of(&id).map(str::to_owned);
        missing.push(id);
    }
    if missing.is_empty() {
        return Ok(());
    }

    let deepest_missing = missing
        .last()
        .cloned()
        .unwrap_or_else(|| parent_id.to_string());
    let mirror_issues = mirror.and_then(load_mirror_index);
    let Some(by_id) = mirror_issues else {
        return Err(StorageError::not_found("parent issue", deepest_missing));
    };

    // Insert topmost ancestor first so each child finds its parent.
    for id in missing.iter().rev() {
        let Some(found) = by_id.get(id) else {
            return Err(StorageError::not_found("parent issue", id.clone()));
        };
        let mut revived = found.clone();
        revived.dependencies.clear();
        revived.set_defaults();
        if revived.status == Status::Closed && revived.closed_at.is_none() {
            revived.closed_at = Some(Utc::now());
        }
        revived.content_hash = compute_content_hash(&revived);
        validate(&revived)?;

        insert_issue_row(conn, &revived)?;
        for label in &revived.labels {
            conn.execute(
                "INSERT OR IGNORE INTO labels (issue_id, label) VALUES (?1, ?2)",
                params![revived.id, label],
            )?;
        }
        if let (Some(p), Some(n)) = (idgen::parent_of(id), idgen::child_suffix(id)) {
            note_child_on_conn(conn, p, n)?;
        }
        emit_event(
            conn,
            id,
            EventType::Created,
            actor,
            None,
            None,
            Some("resurrected from text mirror"),
            &format_datetime(&Utc::now()),
        )?;
        mark_dirty_on_conn(conn, id)?;
        info!(id, "resurrected missing parent from text mirror");
    }

    Ok(())
}

/// Loads the mirror into an id -> issue map (last line per id wins).
fn load_mirror_index(path: &Path) -> Option<HashMap<String, Issue>> {
    let file = std::fs::File::open(path).ok()?;
    let reader = std::io::BufReader::new(file);
    let mut by_id = HashMap::new();
    for record in beads_core::jsonl::read_jsonl(reader) {
        if let Ok(issue) = record {
            if !issue.id.is_empty() {
                by_id.insert(issue.id.clone(), issue);
            }
        }
    }
    Some(by_id)
}

// ---------------------------------------------------------------------------
// Update / close / reopen
// ---------------------------------------------------------------------------

/// Applies a list of typed field updates to an issue in one step.
///
/// Auto-manages `closed_at`, recomputes the content hash when any content
/// field changed, and picks the event type from the status transition.
pub(crate) fn update_issue_on_conn(
    conn: &Connection,
    id: &str,
    updates: &[FieldUpdate],
    actor: &str,
) -> Result<Issue> {
    let mut issue = get_issue_on_conn(conn, id)?;
    if updates.is_empty() {
        return Ok(issue);
    }

    let old_status = issue.status.clone();
    let mut touches_content = false;
    for update in updates {
        touches_content |= update.touches_content();
        apply_field(&mut issue, update);
    }

    let now = Utc::now();
    let event_type = match status_change(updates) {
        Some(new) if *new == Status::Closed && old_status != Status::Closed => {
            issue.closed_at = Some(now);
            EventType::Closed
        }
        Some(new) if *new != Status::Closed && old_status == Status::Closed => {
            issue.closed_at = None;
            EventType::Reopened
        }
        Some(new) if *new != old_status => EventType::StatusChanged,
        _ => EventType::Updated,
    };

    issue.updated_at = now;
    if touches_content {
        issue.content_hash = compute_content_hash(&issue);
    }
    validate(&issue)?;

    write_issue_row(conn, &issue)?;

    let (old_value, new_value) = if matches!(
        event_type,
        EventType::Closed | EventType::Reopened | EventType::StatusChanged
    ) {
        (
            Some(old_status.as_str().to_string()),
            Some(issue.status.as_str().to_string()),
        )
    } else {
        (None, None)
    };
    emit_event(
        conn,
        id,
        event_type,
        actor,
        old_value.as_deref(),
        new_value.as_deref(),
        None,
        &format_datetime(&now),
    )?;
    mark_dirty_on_conn(conn, id)?;

    Ok(issue)
}

fn apply_field(issue: &mut Issue, update: &FieldUpdate) {
    match update {
        FieldUpdate::Title(v) => issue.title = v.clone(),
        FieldUpdate::Description(v) => issue.description = v.clone(),
        FieldUpdate::Design(v) => issue.design = v.clone(),
        FieldUpdate::AcceptanceCriteria(v) => issue.acceptance_criteria = v.clone(),
        FieldUpdate::Notes(v) => issue.notes = v.clone(),
        FieldUpdate::Status(v) => issue.status = v.clone(),
        FieldUpdate::Priority(v) => issue.priority = *v,
        FieldUpdate::IssueType(v) => issue.issue_type = v.clone(),
        FieldUpdate::Assignee(v) => issue.assignee = v.clone(),
        FieldUpdate::EstimatedMinutes(v) => issue.estimated_minutes = *v,
        FieldUpdate::ExternalRef(v) => issue.external_ref = v.clone(),
        FieldUpdate::SourceRepo(v) => issue.source_repo = v.clone(),
    }
}

/// Rewrites every mutable column of an issue row from the in-memory image.
fn write_issue_row(conn: &Connection, issue: &Issue) -> Result<()> {
    let affected = conn.execute(
        "UPDATE issues SET
            content_hash = ?2, title = ?3, description = ?4, design = ?5,
            acceptance_criteria = ?6, notes = ?7, status = ?8, priority = ?9,
            issue_type = ?10, assignee = ?11, estimated_minutes = ?12,
            external_ref = ?13, source_repo = ?14, updated_at = ?15,
            closed_at = ?16, compaction_level = ?17, compacted_at = ?18,
            compacted_at_commit = ?19, original_size = ?20
         WHERE id = ?1",
        params![
            issue.id,
            issue.content_hash,
            issue.title,
            issue.description,
            issue.design,
            issue.acceptance_criteria,
            issue.notes,
            issue.status.as_str(),
            issue.priority,
            issue.issue_type.as_str(),
            issue.assignee,
            issue.estimated_minutes,
            issue.external_ref,
            issue.source_repo,
            format_datetime(&issue.updated_at),
            issue.closed_at.as_ref().map(format_datetime),
            issue.compaction_level,
            issue.compacted_at.as_ref().map(format_datetime),
            issue.compacted_at_commit,
            issue.original_size,
        ],
    )?;
    if affected == 0 {
        return Err(StorageError::not_found("issue", issue.id.clone()));
    }
    Ok(())
}

/// Closes an issue with a reason, setting `closed_at` and emitting a
/// `closed` event.
pub(crate) fn close_issue_on_conn(
    conn: &Connection,
    id: &str,
    reason: &str,
    actor: &str,
) -> Result<Issue> {
    let mut issue = get_issue_on_conn(conn, id)?;
    let old_status = issue.status.clone();
    let now = Utc::now();

    issue.status = Status::Closed;
    issue.closed_at = Some(now);
    issue.updated_at = now;
    issue.content_hash = compute_content_hash(&issue);
    write_issue_row(conn, &issue)?;

    emit_event(
        conn,
        id,
        EventType::Closed,
        actor,
        Some(old_status.as_str()),
        Some(reason),
        None,
        &format_datetime(&now),
    )?;
    mark_dirty_on_conn(conn, id)?;
    Ok(issue)
}

/// Reopens a closed issue, clearing `closed_at`.
pub(crate) fn reopen_issue_on_conn(conn: &Connection, id: &str, actor: &str) -> Result<Issue> {
    let mut issue = get_issue_on_conn(conn, id)?;
    let now = Utc::now();

    issue.status = Status::Open;
    issue.closed_at = None;
    issue.updated_at = now;
    issue.content_hash = compute_content_hash(&issue);
    write_issue_row(conn, &issue)?;

    emit_event(
        conn,
        id,
        EventType::Reopened,
        actor,
        Some("closed"),
        Some("open"),
        None,
        &format_datetime(&now),
    )?;
    mark_dirty_on_conn(conn, id)?;
    Ok(issue)
}

// ---------------------------------------------------------------------------
// Delete / rename
// ---------------------------------------------------------------------------

/// Hard-deletes an issue and every trace of it: dependencies, labels,
/// comments, and events cascade through foreign keys; the bookkeeping
/// tables are cleaned up explicitly.
pub(crate) fn delete_issue_on_conn(conn: &Connection, id: &str) -> Result<()> {
    let affected = conn.execute("DELETE FROM issues WHERE id = ?1", params![id])?;
    if affected == 0 {
        return Err(StorageError::not_found("issue", id));
    }
    conn.execute("DELETE FROM dirty_issues WHERE issue_id = ?1", params![id])?;
    conn.execute("DELETE FROM export_hashes WHERE issue_id = ?1", params![id])?;
    conn.execute(
        "DELETE FROM issue_snapshots WHERE issue_id = ?1",
        params![id],
    )?;
    conn.execute(
        "DELETE FROM compaction_snapshots WHERE issue_id = ?1",
        params![id],
    )?;
    conn.execute(
        "DELETE FROM child_counters WHERE parent_id = ?1",
        params![id],
    )?;
    Ok(())
}

/// Renames an issue, rewriting every reference to its id.
pub(crate) fn rename_issue_on_conn(
    conn: &Connection,
    old_id: &str,
    new_id: &str,
    actor: &str,
) -> Result<()> {
    if ids::id_exists(conn, new_id)? {
        return Err(StorageError::conflict(format!(
            "issue {new_id} already exists"
        )));
    }
    let affected = conn.execute(
        "UPDATE issues SET id = ?2 WHERE id = ?1",
        params![old_id, new_id],
    )?;
    if affected == 0 {
        return Err(StorageError::not_found("issue", old_id));
    }
    // Dependencies, labels, comments, and events follow via ON UPDATE
    // CASCADE; only the FK-less bookkeeping tables need a hand.
    for sql in [
        "UPDATE child_counters SET parent_id = ?2 WHERE parent_id = ?1",
        "DELETE FROM export_hashes WHERE issue_id = ?1",
        "DELETE FROM dirty_issues WHERE issue_id = ?1",
    ] {
        conn.execute(sql, params![old_id, new_id])?;
    }

    emit_event(
        conn,
        new_id,
        EventType::Renamed,
        actor,
        Some(old_id),
        Some(new_id),
        None,
        &format_datetime(&Utc::now()),
    )?;
    mark_dirty_on_conn(conn, new_id)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Lookup and search
// ---------------------------------------------------------------------------

/// Retrieves a single issue by ID on the given connection.
pub(crate) fn get_issue_on_conn(conn: &Connection, id: &str) -> Result<Issue> {
    let sql = format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE id = ?1");
    conn.query_row(&sql, params![id], scan_issue)
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StorageError::not_found("issue", id),
            other => StorageError::Query(other),
        })
}

/// Searches issues on the given connection. Labels are not yet populated.
pub(crate) fn search_issues_on_conn(
    conn: &Connection,
    query: &str,
    filter: &IssueFilter,
) -> Result<Vec<Issue>> {
    if filter.ids.len() > MAX_ID_FILTER {
        return Err(StorageError::validation(format!(
            "id filter accepts at most {MAX_ID_FILTER} entries (got {})",
            filter.ids.len()
        )));
    }

    let mut where_clauses: Vec<String> = Vec::new();
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
    let mut param_idx = 1;

    // Substring search across id, title, description.
    if !query.is_empty() {
        where_clauses.push(format!(
            "(id LIKE ?{pi} OR title LIKE ?{pi} OR description LIKE ?{pi})",
            pi = param_idx
        ));
        param_values.push(Box::new(format!("%{query}%")));
        param_idx += 1;
    }

    if let Some(ref status) = filter.status {
        where_clauses.push(format!("status = ?{param_idx}"));
        param_values.push(Box::new(status.as_str().to_string()));
        param_idx += 1;
    }
    if let Some(ref issue_type) = filter.issue_type {
        where_clauses.push(format!("issue_type = ?{param_idx}"));
        param_values.push(Box::new(issue_type.as_str().to_string()));
        param_idx += 1;
    }
    if let Some(ref assignee) = filter.assignee {
        where_clauses.push(format!("assignee = ?{param_idx}"));
        param_values.push(Box::new(assignee.clone()));
        param_idx += 1;
    }
    if let Some(priority) = filter.priority {
        where_clauses.push(format!("priority = ?{param_idx}"));
        param_values.push(Box::new(priority));
        param_idx += 1;
    }
    if let Some(min) = filter.priority_min {
        where_clauses.push(format!("priority >= ?{param_idx}"));
        param_values.push(Box::new(min));
        param_idx += 1;
    }
    if let Some(max) = filter.priority_max {
        where_clauses.push(format!("priority <= ?{param_idx}"));
        param_values.push(Box::new(max));
        param_idx += 1;
    }

    // Date ranges.
    let date_range = |col: &str,
                          after: &Option<DateTime<Utc>>,
                          before: &Option<DateTime<Utc>>,
                          clauses: &mut Vec<String>,
                          values: &mut Vec<Box<dyn rusqlite::types::ToSql>>,
                          idx: &mut usize| {
        if let Some(t) = after {
            clauses.push(format!("{col} >= ?{idx}"));
            values.push(Box::new(format_datetime(t)));
            *idx += 1;
        }
        if let Some(t) = before {
            clauses.push(format!("{col} <= ?{idx}"));
            values.push(Box::new(format_datetime(t)));
            *idx += 1;
        }
    };
    date_range(
        "created_at",
        &filter.created_after,
        &filter.created_before,
        &mut where_clauses,
        &mut param_values,
        &mut param_idx,
    );
    date_range(
        "updated_at",
        &filter.updated_after,
        &filter.updated_before,
        &mut where_clauses,
        &mut param_values,
        &mut param_idx,
    );
    date_range(
        "closed_at",
        &filter.closed_after,
        &filter.closed_before,
        &mut where_clauses,
        &mut param_values,
        &mut param_idx,
    );

    // Empty-field probes.
    if filter.no_description {
        where_clauses.push("description = ''".to_string());
    }
    if filter.no_assignee {
        where_clauses.push("assignee = ''".to_string());
    }
    if filter.no_labels {
        where_clauses.push(
            "NOT EXISTS (SELECT 1 FROM labels WHERE labels.issue_id = issues.id)".to_string(),
        );
    }

    // Labels AND.
    for label in &filter.labels {
        where_clauses.push(format!(
            "EXISTS (SELECT 1 FROM labels WHERE labels.issue_id = issues.id AND labels.label = ?{param_idx})"
        ));
        param_values.push(Box::new(label.clone()));
        param_idx += 1;
    }

    // Labels OR.
    if !filter.labels_any.is_empty() {
        let placeholders: Vec<String> = filter
            .labels_any
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", param_idx + i))
            .collect();
        where_clauses.push(format!(
            "EXISTS (SELECT 1 FROM labels WHERE labels.issue_id = issues.id AND labels.label IN ({}))",
            placeholders.join(",")
        ));
        for label in &filter.labels_any {
            param_values.push(Box::new(label.clone()));
        }
        param_idx += filter.labels_any.len();
    }

    // Id whitelist.
    if !filter.ids.is_empty() {
        let placeholders: Vec<String> = filter
            .ids
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", param_idx + i))
            .collect();
        where_clauses.push(format!("id IN ({})", placeholders.join(",")));
        for id in &filter.ids {
            param_values.push(Box::new(id.clone()));
        }
        param_idx += filter.ids.len();
    }

    let where_sql = if where_clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", where_clauses.join(" AND "))
    };
    let limit_sql = filter
        .limit
        .map(|l| format!(" LIMIT {l}"))
        .unwrap_or_default();

    let sql = format!(
        "SELECT {ISSUE_COLUMNS} FROM issues {where_sql}
         ORDER BY priority ASC, created_at DESC, id ASC{limit_sql}"
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

// ---------------------------------------------------------------------------
// SqliteStore issue methods
// ---------------------------------------------------------------------------

impl SqliteStore {
    /// Creates a single issue, allocating an id when none is given.
    pub fn create_issue_impl(&self, issue: &Issue, actor: &str) -> Result<Issue> {
        let mirror = self.mirror_path();
        let mut conn = self.lock_conn()?;
        let prefix = crate::store::require_prefix_on_conn(&conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let created = create_issue_on_conn(&tx, issue, actor, &prefix, mirror.as_deref())?;
        tx.commit()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;
        Ok(created)
    }

    /// Creates multiple issues in a single transaction.
    pub fn create_issues_impl(&self, issues: &[Issue], actor: &str) -> Result<Vec<Issue>> {
        let mirror = self.mirror_path();
        let mut conn = self.lock_conn()?;
        let prefix = crate::store::require_prefix_on_conn(&conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut created = Vec::with_capacity(issues.len());
        for issue in issues {
            created.push(create_issue_on_conn(
                &tx,
                issue,
                actor,
                &prefix,
                mirror.as_deref(),
            )?);
        }
        tx.commit()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;
        Ok(created)
    }

    /// Retrieves an issue by ID.
    pub fn get_issue_impl(&self, id: &str) -> Result<Issue> {
        let conn = self.lock_conn()?;
        get_issue_on_conn(&conn, id)
    }

    /// Retrieves an issue by external reference.
    pub fn get_issue_by_external_ref_impl(&self, external_ref: &str) -> Result<Issue> {
        let conn = self.lock_conn()?;
        let sql = format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE external_ref = ?1");
        conn.query_row(&sql, params![external_ref], scan_issue)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    StorageError::not_found("issue", format!("external_ref={external_ref}"))
                }
                other => StorageError::Query(other),
            })
    }

    /// Retrieves multiple issues by their IDs.
    pub fn get_issues_by_ids_impl(&self, ids: &[String]) -> Result<Vec<Issue>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock_conn()?;
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE id IN ({placeholders})");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(ids.iter()), scan_issue)?;
        let mut issues = Vec::new();
        for row in rows {
            issues.push(row?);
        }
        Ok(issues)
    }

    /// Applies typed partial updates to an issue.
    pub fn update_issue_impl(
        &self,
        id: &str,
        updates: &[FieldUpdate],
        actor: &str,
    ) -> Result<Issue> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let updated = update_issue_on_conn(&tx, id, updates, actor)?;
        tx.commit()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;
        Ok(updated)
    }

    /// Closes an issue with a reason.
    pub fn close_issue_impl(&self, id: &str, reason: &str, actor: &str) -> Result<Issue> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let closed = close_issue_on_conn(&tx, id, reason, actor)?;
        tx.commit()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;
        Ok(closed)
    }

    /// Reopens a closed issue.
    pub fn reopen_issue_impl(&self, id: &str, actor: &str) -> Result<Issue> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let reopened = reopen_issue_on_conn(&tx, id, actor)?;
        tx.commit()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;
        Ok(reopened)
    }

    /// Permanently deletes a single issue.
    pub fn delete_issue_impl(&self, id: &str) -> Result<()> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        delete_issue_on_conn(&tx, id)?;
        tx.commit()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;
        Ok(())
    }

    /// Deletes a set of issues under the administrative cleanup policy.
    ///
    /// With `cascade`, transitive dependents join the delete set. Without
    /// it, external dependents either fail the call (`force = false`) or
    /// are orphaned -- their edges into the delete set removed -- and
    /// reported (`force = true`). `dry_run` computes the report without
    /// mutating.
    pub fn delete_issues_impl(
        &self,
        ids: &[String],
        cascade: bool,
        force: bool,
        dry_run: bool,
    ) -> Result<DeleteReport> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut delete_set: Vec<String> = Vec::new();
        for id in ids {
            if !ids::id_exists(&tx, id)? {
                return Err(StorageError::not_found("issue", id.clone()));
            }
            if !delete_set.contains(id) {
                delete_set.push(id.clone());
            }
        }

        if cascade {
            // Pull transitive dependents into the delete set.
            let mut frontier = delete_set.clone();
            while let Some(current) = frontier.pop() {
                let mut stmt =
                    tx.prepare("SELECT issue_id FROM dependencies WHERE depends_on_id = ?1")?;
                let dependents: Vec<String> = stmt
                    .query_map(params![current], |row| row.get::<_, String>(0))?
                    .filter_map(|r| r.ok())
                    .collect();
                for dep in dependents {
                    if !delete_set.contains(&dep) {
                        delete_set.push(dep.clone());
                        frontier.push(dep);
                    }
                }
            }
        }

        // External dependents: issues outside the delete set with an edge
        // into it.
        let mut orphaned: Vec<String> = Vec::new();
        for id in &delete_set {
            let mut stmt =
                tx.prepare("SELECT issue_id FROM dependencies WHERE depends_on_id = ?1")?;
            let dependents: Vec<String> = stmt
                .query_map(params![id], |row| row.get::<_, String>(0))?
                .filter_map(|r| r.ok())
                .collect();
            for dep in dependents {
                if !delete_set.contains(&dep) && !orphaned.contains(&dep) {
                    orphaned.push(dep);
                }
            }
        }

        if !cascade && !force && !orphaned.is_empty() {
            return Err(StorageError::conflict(format!(
                "issues have external dependents: {}",
                orphaned.join(", ")
            )));
        }

        let report = DeleteReport {
            deleted: delete_set.clone(),
            orphaned: orphaned.clone(),
            dry_run,
        };
        if dry_run {
            return Ok(report);
        }

        // Orphaned dependents stay dirty so the mirror drops their edges.
        for id in &orphaned {
            mark_dirty_on_conn(&tx, id)?;
        }
        for id in &delete_set {
            delete_issue_on_conn(&tx, id)?;
        }

        tx.commit()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;
        Ok(report)
    }

    /// Renames an issue (administrative operation).
    pub fn rename_issue_impl(&self, old_id: &str, new_id: &str, actor: &str) -> Result<()> {
        let prefix = self.require_prefix()?;
        if !idgen::has_prefix(new_id, &prefix) {
            return Err(StorageError::PrefixMismatch {
                id: new_id.to_string(),
                prefix,
            });
        }
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        rename_issue_on_conn(&tx, old_id, new_id, actor)?;
        tx.commit()
            .map_err(|e| StorageError::Transaction(e.to_string()))?;
        Ok(())
    }

    /// Searches issues; results carry labels and bulk-joined dependency
    /// counts.
    pub fn search_issues_impl(&self, query: &str, filter: &IssueFilter) -> Result<Vec<ListedIssue>> {
        let conn = self.lock_conn()?;
        let mut issues = search_issues_on_conn(&conn, query, filter)?;

        let ids: Vec<String> = issues.iter().map(|i| i.id.clone()).collect();
        let counts = crate::dependencies::get_dependency_counts_on_conn(&conn, &ids)?;

        let mut listed = Vec::with_capacity(issues.len());
        for issue in issues.iter_mut() {
            issue.labels = get_labels_on_conn(&conn, &issue.id)?;
        }
        for issue in issues {
            let c = counts.get(&issue.id).cloned().unwrap_or_default();
            listed.push(ListedIssue { issue, counts: c });
        }
        Ok(listed)
    }
}
