//! DDL statements, migrations, and the post-migration probe manifest.
//!
//! Timestamps are stored as TEXT in ISO 8601 format (SQLite has no native
//! datetime type). Booleans are stored as INTEGER (0/1). JSON payloads are
//! TEXT.

/// Current schema version. Bumped whenever DDL or migrations change.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Core DDL statements executed during `init_schema`.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    // -- Issues table --------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS issues (
        id                  TEXT PRIMARY KEY,
        content_hash        TEXT NOT NULL DEFAULT '',
        title               TEXT NOT NULL,
        description         TEXT NOT NULL DEFAULT '',
        design              TEXT NOT NULL DEFAULT '',
        acceptance_criteria TEXT NOT NULL DEFAULT '',
        notes               TEXT NOT NULL DEFAULT '',
        status              TEXT NOT NULL DEFAULT 'open',
        priority            INTEGER NOT NULL DEFAULT 2,
        issue_type          TEXT NOT NULL DEFAULT 'task',
        assignee            TEXT NOT NULL DEFAULT '',
        estimated_minutes   INTEGER,
        external_ref        TEXT,
        source_repo         TEXT NOT NULL DEFAULT '',
        created_at          TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        updated_at          TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        closed_at           TEXT,
        compaction_level    INTEGER NOT NULL DEFAULT 0,
        compacted_at        TEXT,
        compacted_at_commit TEXT,
        original_size       INTEGER NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_issues_status ON issues(status)",
    "CREATE INDEX IF NOT EXISTS idx_issues_priority ON issues(priority)",
    "CREATE INDEX IF NOT EXISTS idx_issues_issue_type ON issues(issue_type)",
    "CREATE INDEX IF NOT EXISTS idx_issues_assignee ON issues(assignee)",
    "CREATE INDEX IF NOT EXISTS idx_issues_created_at ON issues(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_issues_updated_at ON issues(updated_at)",
    "CREATE INDEX IF NOT EXISTS idx_issues_external_ref ON issues(external_ref)",
    // -- Dependencies table --------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS dependencies (
        issue_id      TEXT NOT NULL,
        depends_on_id TEXT NOT NULL,
        type          TEXT NOT NULL DEFAULT 'blocks',
        created_at    TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        created_by    TEXT NOT NULL DEFAULT '',
        PRIMARY KEY (issue_id, depends_on_id),
        FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE ON UPDATE CASCADE,
        FOREIGN KEY (depends_on_id) REFERENCES issues(id) ON DELETE CASCADE ON UPDATE CASCADE
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_dependencies_issue ON dependencies(issue_id)",
    "CREATE INDEX IF NOT EXISTS idx_dependencies_depends_on ON dependencies(depends_on_id)",
    "CREATE INDEX IF NOT EXISTS idx_dependencies_depends_on_type ON dependencies(depends_on_id, type)",
    // -- Labels table --------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS labels (
        issue_id TEXT NOT NULL,
        label    TEXT NOT NULL,
        PRIMARY KEY (issue_id, label),
        FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE ON UPDATE CASCADE
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_labels_label ON labels(label)",
    // -- Comments table ------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS comments (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        issue_id   TEXT NOT NULL,
        author     TEXT NOT NULL,
        text       TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE ON UPDATE CASCADE
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_comments_issue ON comments(issue_id)",
    "CREATE INDEX IF NOT EXISTS idx_comments_created_at ON comments(created_at)",
    // -- Events table (audit trail) ------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        issue_id    TEXT NOT NULL,
        event_type  TEXT NOT NULL,
        actor       TEXT NOT NULL,
        old_value   TEXT,
        new_value   TEXT,
        comment     TEXT,
        created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        FOREIGN KEY (issue_id) REFERENCES issues(id) ON DELETE CASCADE ON UPDATE CASCADE
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_events_issue ON events(issue_id)",
    "CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at)",
    // -- Config table --------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS config (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
    // -- Metadata table ------------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS metadata (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
    // -- Dirty-set table -----------------------------------------------------
    r#"
    CREATE TABLE IF NOT EXISTS dirty_issues (
        issue_id  TEXT PRIMARY KEY,
        marked_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
    )
    "#,
    // -- Export hashes (last exported content hash per issue) ----------------
    r#"
    CREATE TABLE IF NOT EXISTS export_hashes (
        issue_id     TEXT PRIMARY KEY,
        content_hash TEXT NOT NULL,
        exported_at  TEXT NOT NULL
    )
    "#,
    // -- Child counters (hierarchical id allocation) -------------------------
    r#"
    CREATE TABLE IF NOT EXISTS child_counters (
        parent_id  TEXT PRIMARY KEY,
        last_child INTEGER NOT NULL DEFAULT 0
    )
    "#,
    // -- Issue snapshots (pre-compaction images) -----------------------------
    r#"
    CREATE TABLE IF NOT EXISTS issue_snapshots (
        issue_id   TEXT NOT NULL,
        payload    TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        PRIMARY KEY (issue_id)
    )
    "#,
    // -- Compaction snapshots (per-level summarized states) ------------------
    r#"
    CREATE TABLE IF NOT EXISTS compaction_snapshots (
        issue_id         TEXT NOT NULL,
        compaction_level INTEGER NOT NULL,
        payload          TEXT NOT NULL,
        created_at       TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
        PRIMARY KEY (issue_id, compaction_level)
    )
    "#,
    // -- Repo mtimes (multi-workspace hydration cursors) ---------------------
    r#"
    CREATE TABLE IF NOT EXISTS repo_mtimes (
        repo     TEXT PRIMARY KEY,
        mtime_ms INTEGER NOT NULL DEFAULT 0
    )
    "#,
    // -- Views: hierarchical blocking semantics ------------------------------
    //
    // An issue is blocked when a `blocks` predecessor is non-terminal, or
    // when a non-closed ancestor (via parent-child, walking upward) is
    // blocked that way. Propagation is depth-bounded at 50.
    r#"
    CREATE VIEW IF NOT EXISTS blocked_issues AS
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
    SELECT DISTINCT i.* FROM issues i JOIN blocked_set bs ON bs.id = i.id
    "#,
    r#"
    CREATE VIEW IF NOT EXISTS ready_issues AS
    SELECT i.* FROM issues i
     WHERE i.status = 'open'
       AND i.id NOT IN (SELECT id FROM blocked_issues)
    "#,
];

/// Default configuration values inserted on first init.
pub const DEFAULT_CONFIG: &[(&str, &str)] = &[
    ("compaction_enabled", "false"),
    ("compact_tier1_days", "30"),
    ("compact_tier2_days", "90"),
    ("orphan_policy", "allow"),
];

/// Schema migrations applied after initial DDL.
///
/// Each migration is a `(name, sql)` pair, tracked in the `metadata` table
/// under the key `migration:<name>` so it runs at most once. Migrations are
/// forward-only.
pub const MIGRATIONS: &[(&str, &str)] = &[
    // Future migrations go here, e.g.:
    // ("001_add_foo_column", "ALTER TABLE issues ADD COLUMN foo TEXT DEFAULT ''"),
];

/// Probe manifest: every table the engine expects, with its columns.
///
/// After migrations the store runs a zero-row SELECT over each entry; a
/// failure marks the database schema-incompatible.
pub const EXPECTED_TABLES: &[(&str, &[&str])] = &[
    (
        "issues",
        &[
            "id",
            "content_hash",
            "title",
            "description",
            "design",
            "acceptance_criteria",
            "notes",
            "status",
            "priority",
            "issue_type",
            "assignee",
            "estimated_minutes",
            "external_ref",
            "source_repo",
            "created_at",
            "updated_at",
            "closed_at",
            "compaction_level",
            "compacted_at",
            "compacted_at_commit",
            "original_size",
        ],
    ),
    (
        "dependencies",
        &[
            "issue_id",
            "depends_on_id",
            "type",
            "created_at",
            "created_by",
        ],
    ),
    ("labels", &["issue_id", "label"]),
    ("comments", &["id", "issue_id", "author", "text", "created_at"]),
    (
        "events",
        &[
            "id",
            "issue_id",
            "event_type",
            "actor",
            "old_value",
            "new_value",
            "comment",
            "created_at",
        ],
    ),
    ("config", &["key", "value"]),
    ("metadata", &["key", "value"]),
    ("dirty_issues", &["issue_id", "marked_at"]),
    ("export_hashes", &["issue_id", "content_hash", "exported_at"]),
    ("child_counters", &["parent_id", "last_child"]),
    ("issue_snapshots", &["issue_id", "payload", "created_at"]),
    (
        "compaction_snapshots",
        &["issue_id", "compaction_level", "payload", "created_at"],
    ),
    ("repo_mtimes", &["repo", "mtime_ms"]),
];
