//! Transaction wrapper for [`SqliteStore`].
//!
//! The bulk import path runs many inserts that must share one write
//! transaction; [`SqliteStore::run_in_transaction_impl`] hands callers a
//! [`Transaction`] view over the pinned connection. Import variants
//! preserve ids and timestamps and emit no audit events -- they replay
//! history rather than create it.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior, params};

use beads_core::comment::Comment;
use beads_core::dependency::Dependency;
use beads_core::issue::Issue;
use beads_core::update::FieldUpdate;

use crate::comments;
use crate::dependencies;
use crate::dirty::mark_dirty_on_conn;
use crate::error::{Result, StorageError};
use crate::ids;
use crate::issues;
use crate::store::SqliteStore;

/// Subset of storage operations available inside a transaction.
///
/// All operations share a single pinned connection and commit or roll back
/// atomically.
pub trait Transaction {
    // -- Regular operations (full semantics, audit events) -------------------

    fn create_issue(&self, issue: &Issue, actor: &str) -> Result<Issue>;
    fn update_issue(&self, id: &str, updates: &[FieldUpdate], actor: &str) -> Result<Issue>;
    fn get_issue(&self, id: &str) -> Result<Issue>;
    fn issue_exists(&self, id: &str) -> Result<bool>;
    fn add_dependency(&self, dep: &Dependency, actor: &str) -> Result<()>;
    fn add_label(&self, issue_id: &str, label: &str, actor: &str) -> Result<()>;
    fn mark_dirty(&self, issue_id: &str) -> Result<()>;

    // -- Import operations (preserve history, no events) ---------------------

    /// Inserts an issue preserving its id and timestamps. Returns `false`
    /// when an issue with that id already exists (the row is left alone).
    fn import_issue(&self, issue: &Issue) -> Result<bool>;

    /// Inserts a dependency edge with cycle checking but no audit event.
    /// Returns `false` when the ordered pair already has an edge.
    fn import_dependency(&self, dep: &Dependency) -> Result<bool>;

    /// Adds a label without an audit event.
    fn import_label(&self, issue_id: &str, label: &str) -> Result<()>;

    /// Inserts a comment with its original timestamp and no event.
    fn import_comment(
        &self,
        issue_id: &str,
        author: &str,
        text: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Comment>;

    // -- Bookkeeping ---------------------------------------------------------

    fn set_metadata(&self, key: &str, value: &str) -> Result<()>;
    fn get_metadata(&self, key: &str) -> Result<String>;
}

/// A thin wrapper around a connection with an active transaction.
pub(crate) struct SqliteTx<'a> {
    pub(crate) conn: &'a Connection,
}

impl Transaction for SqliteTx<'_> {
    fn create_issue(&self, issue: &Issue, actor: &str) -> Result<Issue> {
        let prefix = crate::store::require_prefix_on_conn(self.conn)?;
        issues::create_issue_on_conn(self.conn, issue, actor, &prefix, None)
    }

    fn update_issue(&self, id: &str, updates: &[FieldUpdate], actor: &str) -> Result<Issue> {
        issues::update_issue_on_conn(self.conn, id, updates, actor)
    }

    fn get_issue(&self, id: &str) -> Result<Issue> {
        issues::get_issue_on_conn(self.conn, id)
    }

    fn issue_exists(&self, id: &str) -> Result<bool> {
        ids::id_exists(self.conn, id)
    }

    fn add_dependency(&self, dep: &Dependency, actor: &str) -> Result<()> {
        dependencies::add_dependency_on_conn(self.conn, dep, actor)
    }

    fn add_label(&self, issue_id: &str, label: &str, actor: &str) -> Result<()> {
        crate::labels::add_label_on_conn(self.conn, issue_id, label, actor)
    }

    fn mark_dirty(&self, issue_id: &str) -> Result<()> {
        mark_dirty_on_conn(self.conn, issue_id)
    }

    fn import_issue(&self, issue: &Issue) -> Result<bool> {
        if ids::id_exists(self.conn, &issue.id)? {
            return Ok(false);
        }
        let mut issue = issue.clone();
        issue.set_defaults();
        // Normalize the closed <=> closed_at invariant on the way in; a
        // hand-edited mirror line may carry one without the other.
        if issue.status == beads_core::enums::Status::Closed {
            if issue.closed_at.is_none() {
                issue.closed_at = Some(issue.updated_at);
            }
        } else {
            issue.closed_at = None;
        }
        if issue.content_hash.is_empty() {
            issue.content_hash = beads_core::content_hash::compute_content_hash(&issue);
        }
        issues::insert_issue_row(self.conn, &issue)?;
        for label in &issue.labels {
            self.import_label(&issue.id, label)?;
        }
        if let (Some(parent), Some(n)) = (
            beads_core::idgen::parent_of(&issue.id),
            beads_core::idgen::child_suffix(&issue.id),
        ) {
            crate::dirty::note_child_on_conn(self.conn, parent, n)?;
        }
        Ok(true)
    }

    fn import_dependency(&self, dep: &Dependency) -> Result<bool> {
        for id in [&dep.issue_id, &dep.depends_on_id] {
            if !ids::id_exists(self.conn, id)? {
                return Err(StorageError::not_found("issue", id.clone()));
            }
        }
        if dep.dep_type.in_blocking_graph() {
            dependencies::detect_cycle(self.conn, &dep.issue_id, &dep.depends_on_id)?;
        }
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO dependencies
             (issue_id, depends_on_id, type, created_at, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                dep.issue_id,
                dep.depends_on_id,
                dep.dep_type.as_str(),
                issues::format_datetime(&dep.created_at),
                dep.created_by,
            ],
        )?;
        Ok(inserted > 0)
    }

    fn import_label(&self, issue_id: &str, label: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO labels (issue_id, label) VALUES (?1, ?2)",
            params![issue_id, label],
        )?;
        Ok(())
    }

    fn import_comment(
        &self,
        issue_id: &str,
        author: &str,
        text: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Comment> {
        comments::import_comment_on_conn(self.conn, issue_id, author, text, created_at)
    }

    fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        crate::config::set_metadata_on_conn(self.conn, key, value)
    }

    fn get_metadata(&self, key: &str) -> Result<String> {
        crate::config::get_metadata_on_conn(self.conn, key)
    }
}

// ---------------------------------------------------------------------------
// SqliteStore::run_in_transaction
// ---------------------------------------------------------------------------

impl SqliteStore {
    /// Runs a closure inside an IMMEDIATE transaction pinned to the single
    /// write connection.
    ///
    /// If the closure returns `Ok`, the transaction is committed; on `Err`
    /// it is rolled back.
    pub fn run_in_transaction_impl<T>(
        &self,
        f: &dyn Fn(&dyn Transaction) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let sqlite_tx = SqliteTx { conn: &tx };
        match f(&sqlite_tx) {
            Ok(value) => {
                tx.commit()
                    .map_err(|e| StorageError::Transaction(format!("failed to commit: {e}")))?;
                Ok(value)
            }
            Err(e) => {
                // Transaction is rolled back on drop.
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PREFIX_CONFIG_KEY;
    use beads_core::enums::DependencyType;
    use beads_core::issue::IssueBuilder;

    fn test_store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set_config_impl(PREFIX_CONFIG_KEY, "bd").unwrap();
        store
    }

    #[test]
    fn transaction_commit() {
        let store = test_store();

        store
            .run_in_transaction_impl(&|tx| {
                let issue = IssueBuilder::new("In transaction").id("bd-tx1").build();
                tx.create_issue(&issue, "alice")?;
                tx.add_label("bd-tx1", "transacted", "alice")?;
                Ok(())
            })
            .unwrap();

        let issue = store.get_issue_impl("bd-tx1").unwrap();
        assert_eq!(issue.title, "In transaction");
        assert_eq!(store.get_labels_impl("bd-tx1").unwrap(), vec!["transacted"]);
    }

    #[test]
    fn transaction_rollback_on_error() {
        let store = test_store();

        let result: Result<()> = store.run_in_transaction_impl(&|tx| {
            let issue = IssueBuilder::new("Should rollback").id("bd-tx2").build();
            tx.create_issue(&issue, "alice")?;
            Err(StorageError::Internal("test rollback".into()))
        });

        assert!(result.is_err());
        assert!(store.get_issue_impl("bd-tx2").unwrap_err().is_not_found());
    }

    #[test]
    fn import_issue_preserves_history_without_events() {
        let store = test_store();
        let original_created = chrono::DateTime::parse_from_rfc3339("2023-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        store
            .run_in_transaction_impl(&|tx| {
                let issue = IssueBuilder::new("Imported")
                    .id("bd-imp1")
                    .created_at(original_created)
                    .labels(vec!["from-mirror".into()])
                    .build();
                assert!(tx.import_issue(&issue)?);
                // A second import of the same id is a no-op.
                assert!(!tx.import_issue(&issue)?);
                Ok(())
            })
            .unwrap();

        let issue = store.get_issue_impl("bd-imp1").unwrap();
        assert_eq!(issue.created_at, original_created);
        assert_eq!(store.get_labels_impl("bd-imp1").unwrap(), vec!["from-mirror"]);
        assert!(store.get_events_impl("bd-imp1", 10).unwrap().is_empty());
    }

    #[test]
    fn import_dependency_skips_duplicates_without_events() {
        let store = test_store();
        store
            .run_in_transaction_impl(&|tx| {
                for id in ["bd-ia", "bd-ib"] {
                    tx.import_issue(&IssueBuilder::new(format!("I {id}")).id(id).build())?;
                }
                let dep = Dependency::new("bd-ia", "bd-ib", DependencyType::Blocks, "x");
                assert!(tx.import_dependency(&dep)?);
                assert!(!tx.import_dependency(&dep)?);
                Ok(())
            })
            .unwrap();

        assert_eq!(store.get_dependencies_impl("bd-ia").unwrap().len(), 1);
        assert!(store.get_events_impl("bd-ia", 10).unwrap().is_empty());
    }

    #[test]
    fn import_dependency_detects_cycles() {
        let store = test_store();
        let result: Result<()> = store.run_in_transaction_impl(&|tx| {
            for id in ["bd-ca", "bd-cb"] {
                tx.import_issue(&IssueBuilder::new(format!("I {id}")).id(id).build())?;
            }
            tx.import_dependency(&Dependency::new(
                "bd-ca",
                "bd-cb",
                DependencyType::Blocks,
                "x",
            ))?;
            tx.import_dependency(&Dependency::new(
                "bd-cb",
                "bd-ca",
                DependencyType::Blocks,
                "x",
            ))?;
            Ok(())
        });
        assert!(result.unwrap_err().is_cycle());
    }
}
