//! SQLite storage engine for the beads issue store.
//!
//! Provides the [`Storage`] trait and its SQLite implementation
//! ([`SqliteStore`]), plus the dirty-set/export bookkeeping the text-mirror
//! sync layer builds on.

pub mod config;
pub mod dependencies;
pub mod dirty;
pub mod error;
pub mod ids;
pub mod issues;
pub mod labels;
pub mod comments;
pub mod queries;
pub mod schema;
pub mod snapshots;
pub mod store;
pub mod traits;
pub mod transaction;

// Re-exports for convenience.
pub use error::{Result, StorageError};
pub use snapshots::CompactionStats;
pub use store::{PREFIX_CONFIG_KEY, SqliteStore};
pub use traits::{
    BlockedIssue, DeleteReport, EpicStatus, IssueWithDependencyMetadata, ListedIssue, Statistics,
    Storage, TreeNode,
};
pub use transaction::Transaction;

// ---------------------------------------------------------------------------
// Storage trait implementation for SqliteStore
// ---------------------------------------------------------------------------

use std::collections::HashMap;

use beads_core::comment::{Comment, Event};
use beads_core::dependency::{Dependency, DependencyCounts};
use beads_core::enums::DependencyType;
use beads_core::filter::{IssueFilter, StaleFilter, WorkFilter};
use beads_core::issue::Issue;
use beads_core::update::FieldUpdate;

impl Storage for SqliteStore {
    fn create_issue(&self, issue: &Issue, actor: &str) -> Result<Issue> {
        self.create_issue_impl(issue, actor)
    }

    fn create_issues(&self, issues: &[Issue], actor: &str) -> Result<Vec<Issue>> {
        self.create_issues_impl(issues, actor)
    }

    fn get_issue(&self, id: &str) -> Result<Issue> {
        self.get_issue_impl(id)
    }

    fn get_issue_by_external_ref(&self, external_ref: &str) -> Result<Issue> {
        self.get_issue_by_external_ref_impl(external_ref)
    }

    fn get_issues_by_ids(&self, ids: &[String]) -> Result<Vec<Issue>> {
        self.get_issues_by_ids_impl(ids)
    }

    fn update_issue(&self, id: &str, updates: &[FieldUpdate], actor: &str) -> Result<Issue> {
        self.update_issue_impl(id, updates, actor)
    }

    fn close_issue(&self, id: &str, reason: &str, actor: &str) -> Result<Issue> {
        self.close_issue_impl(id, reason, actor)
    }

    fn reopen_issue(&self, id: &str, actor: &str) -> Result<Issue> {
        self.reopen_issue_impl(id, actor)
    }

    fn delete_issue(&self, id: &str) -> Result<()> {
        self.delete_issue_impl(id)
    }

    fn delete_issues(
        &self,
        ids: &[String],
        cascade: bool,
        force: bool,
        dry_run: bool,
    ) -> Result<DeleteReport> {
        self.delete_issues_impl(ids, cascade, force, dry_run)
    }

    fn rename_issue(&self, old_id: &str, new_id: &str, actor: &str) -> Result<()> {
        self.rename_issue_impl(old_id, new_id, actor)
    }

    fn search_issues(&self, query: &str, filter: &IssueFilter) -> Result<Vec<ListedIssue>> {
        self.search_issues_impl(query, filter)
    }

    fn add_dependency(&self, dep: &Dependency, actor: &str) -> Result<()> {
        self.add_dependency_impl(dep, actor)
    }

    fn remove_dependency(
        &self,
        issue_id: &str,
        depends_on_id: &str,
        actor: &str,
        dep_type: Option<&DependencyType>,
    ) -> Result<()> {
        self.remove_dependency_impl(issue_id, depends_on_id, actor, dep_type)
    }

    fn get_dependencies(&self, issue_id: &str) -> Result<Vec<Issue>> {
        self.get_dependencies_impl(issue_id)
    }

    fn get_dependents(&self, issue_id: &str) -> Result<Vec<Issue>> {
        self.get_dependents_impl(issue_id)
    }

    fn get_dependency_records(&self, issue_id: &str) -> Result<Vec<Dependency>> {
        self.get_dependency_records_impl(issue_id)
    }

    fn get_dependencies_with_metadata(
        &self,
        issue_id: &str,
    ) -> Result<Vec<IssueWithDependencyMetadata>> {
        self.get_dependencies_with_metadata_impl(issue_id)
    }

    fn get_dependents_with_metadata(
        &self,
        issue_id: &str,
    ) -> Result<Vec<IssueWithDependencyMetadata>> {
        self.get_dependents_with_metadata_impl(issue_id)
    }

    fn get_dependency_counts(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, DependencyCounts>> {
        self.get_dependency_counts_impl(ids)
    }

    fn get_dependency_tree(
        &self,
        issue_id: &str,
        max_depth: i32,
        reverse: bool,
    ) -> Result<Vec<TreeNode>> {
        self.get_dependency_tree_impl(issue_id, max_depth, reverse)
    }

    fn add_label(&self, issue_id: &str, label: &str, actor: &str) -> Result<()> {
        self.add_label_impl(issue_id, label, actor)
    }

    fn remove_label(&self, issue_id: &str, label: &str, actor: &str) -> Result<()> {
        self.remove_label_impl(issue_id, label, actor)
    }

    fn get_labels(&self, issue_id: &str) -> Result<Vec<String>> {
        self.get_labels_impl(issue_id)
    }

    fn get_issues_by_label(&self, label: &str) -> Result<Vec<Issue>> {
        self.get_issues_by_label_impl(label)
    }

    fn get_ready_work(&self, filter: &WorkFilter) -> Result<Vec<Issue>> {
        self.get_ready_work_impl(filter)
    }

    fn get_blocked_issues(&self) -> Result<Vec<BlockedIssue>> {
        self.get_blocked_issues_impl()
    }

    fn get_stale_issues(&self, filter: &StaleFilter) -> Result<Vec<Issue>> {
        self.get_stale_issues_impl(filter)
    }

    fn get_epics_eligible_for_closure(&self) -> Result<Vec<EpicStatus>> {
        self.get_epics_eligible_for_closure_impl()
    }

    fn add_comment(&self, issue_id: &str, author: &str, text: &str) -> Result<Comment> {
        self.add_comment_impl(issue_id, author, text)
    }

    fn get_comments(&self, issue_id: &str) -> Result<Vec<Comment>> {
        self.get_comments_impl(issue_id)
    }

    fn get_events(&self, issue_id: &str, limit: i32) -> Result<Vec<Event>> {
        self.get_events_impl(issue_id, limit)
    }

    fn resolve_id(&self, input: &str) -> Result<String> {
        self.resolve_id_impl(input)
    }

    fn get_statistics(&self) -> Result<Statistics> {
        self.get_statistics_impl()
    }

    fn get_compaction_candidates(&self, level: i32) -> Result<Vec<Issue>> {
        self.get_compaction_candidates_impl(level)
    }

    fn apply_compaction(
        &self,
        id: &str,
        summary: &str,
        commit: Option<&str>,
        actor: &str,
    ) -> Result<Issue> {
        self.apply_compaction_impl(id, summary, commit, actor)
    }

    fn get_compaction_stats(&self) -> Result<CompactionStats> {
        self.get_compaction_stats_impl()
    }

    fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.set_config_impl(key, value)
    }

    fn get_config(&self, key: &str) -> Result<String> {
        self.get_config_impl(key)
    }

    fn get_all_config(&self) -> Result<HashMap<String, String>> {
        self.get_all_config_impl()
    }
}
