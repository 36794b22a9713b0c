//! Storage trait and view types -- the public API for issue persistence.
//!
//! Consumers depend on the [`Storage`] trait rather than on the concrete
//! SQLite store so that alternative backends can be substituted in tests.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use beads_core::comment::{Comment, Event};
use beads_core::dependency::{Dependency, DependencyCounts};
use beads_core::enums::DependencyType;
use beads_core::filter::{IssueFilter, StaleFilter, WorkFilter};
use beads_core::issue::Issue;
use beads_core::update::FieldUpdate;

use crate::error::Result;
use crate::snapshots::CompactionStats;

// ---------------------------------------------------------------------------
// View / helper types
// ---------------------------------------------------------------------------

/// A listing row: the issue with labels populated, plus bulk-joined
/// dependency counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListedIssue {
    #[serde(flatten)]
    pub issue: Issue,
    #[serde(flatten)]
    pub counts: DependencyCounts,
}

/// A node in a dependency tree traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    /// The issue at this node.
    pub issue: Issue,
    /// Depth from the root (0 = root).
    pub depth: i32,
    /// The dependency type of the edge leading to this node.
    pub dep_type: DependencyType,
}

/// An issue with its associated dependency edge metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueWithDependencyMetadata {
    /// The related issue.
    pub issue: Issue,
    /// The dependency edge connecting the issue.
    pub dependency: Dependency,
}

/// An issue that is blocked, along with the count of direct open blockers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedIssue {
    /// The blocked issue.
    pub issue: Issue,
    /// Number of direct open blocking dependencies.
    pub blocked_by_count: i32,
}

/// Status of an epic with respect to its children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpicStatus {
    /// The epic issue.
    pub epic: Issue,
    /// Total number of child issues.
    pub total_children: i32,
    /// Number of closed child issues.
    pub closed_children: i32,
}

/// Result of a bulk delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteReport {
    /// Ids that were (or would be) deleted.
    pub deleted: Vec<String>,
    /// External dependents whose edges were (or would be) removed.
    pub orphaned: Vec<String>,
    /// Whether this was a dry run.
    pub dry_run: bool,
}

/// Aggregate statistics about the issue database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub total_issues: i64,
    pub open_issues: i64,
    pub in_progress_issues: i64,
    pub blocked_issues: i64,
    pub closed_issues: i64,
    /// Open issues with no blocking predecessor (hierarchical semantics).
    pub ready_issues: i64,
    /// Issues awaiting export to the text mirror.
    pub dirty_issues: i64,

    /// Breakdown by issue type: `(type_name, count)`.
    pub by_type: Vec<(String, i64)>,
    /// Breakdown by priority: `(priority, count)`.
    pub by_priority: Vec<(i32, i64)>,
    /// Breakdown by assignee (non-closed only): `(assignee, count)`.
    pub by_assignee: Vec<(String, i64)>,
}

// ---------------------------------------------------------------------------
// Storage trait
// ---------------------------------------------------------------------------

/// Primary storage interface for issue persistence.
pub trait Storage: Send + Sync {
    // -- Issue CRUD ----------------------------------------------------------

    /// Creates a new issue (allocating an id when none is given) and emits
    /// a "created" event. Returns the stored issue.
    fn create_issue(&self, issue: &Issue, actor: &str) -> Result<Issue>;

    /// Creates multiple issues in a single transaction.
    fn create_issues(&self, issues: &[Issue], actor: &str) -> Result<Vec<Issue>>;

    /// Retrieves an issue by its ID.
    fn get_issue(&self, id: &str) -> Result<Issue>;

    /// Retrieves an issue by its external reference.
    fn get_issue_by_external_ref(&self, external_ref: &str) -> Result<Issue>;

    /// Retrieves multiple issues by their IDs.
    fn get_issues_by_ids(&self, ids: &[String]) -> Result<Vec<Issue>>;

    /// Applies typed partial updates and emits the transition's event.
    fn update_issue(&self, id: &str, updates: &[FieldUpdate], actor: &str) -> Result<Issue>;

    /// Closes an issue with a reason.
    fn close_issue(&self, id: &str, reason: &str, actor: &str) -> Result<Issue>;

    /// Reopens a closed issue.
    fn reopen_issue(&self, id: &str, actor: &str) -> Result<Issue>;

    /// Permanently deletes an issue and its related data.
    fn delete_issue(&self, id: &str) -> Result<()>;

    /// Deletes a set of issues under the administrative cleanup policy.
    fn delete_issues(
        &self,
        ids: &[String],
        cascade: bool,
        force: bool,
        dry_run: bool,
    ) -> Result<DeleteReport>;

    /// Renames an issue, rewriting every reference.
    fn rename_issue(&self, old_id: &str, new_id: &str, actor: &str) -> Result<()>;

    /// Searches issues; results carry labels and dependency counts.
    fn search_issues(&self, query: &str, filter: &IssueFilter) -> Result<Vec<ListedIssue>>;

    // -- Dependencies --------------------------------------------------------

    /// Adds a dependency edge (cycle-checked for blocking types).
    fn add_dependency(&self, dep: &Dependency, actor: &str) -> Result<()>;

    /// Removes a dependency edge, optionally constrained to a type.
    fn remove_dependency(
        &self,
        issue_id: &str,
        depends_on_id: &str,
        actor: &str,
        dep_type: Option<&DependencyType>,
    ) -> Result<()>;

    /// Returns the issues that the given issue depends on.
    fn get_dependencies(&self, issue_id: &str) -> Result<Vec<Issue>>;

    /// Returns the issues that depend on the given issue.
    fn get_dependents(&self, issue_id: &str) -> Result<Vec<Issue>>;

    /// Returns raw dependency records for an issue.
    fn get_dependency_records(&self, issue_id: &str) -> Result<Vec<Dependency>>;

    /// Returns dependencies with their edge metadata.
    fn get_dependencies_with_metadata(
        &self,
        issue_id: &str,
    ) -> Result<Vec<IssueWithDependencyMetadata>>;

    /// Returns dependents with their edge metadata.
    fn get_dependents_with_metadata(
        &self,
        issue_id: &str,
    ) -> Result<Vec<IssueWithDependencyMetadata>>;

    /// Bulk dependency/dependent counts in a single round trip.
    fn get_dependency_counts(&self, ids: &[String])
    -> Result<HashMap<String, DependencyCounts>>;

    /// Traverses the dependency tree from the given root.
    fn get_dependency_tree(
        &self,
        issue_id: &str,
        max_depth: i32,
        reverse: bool,
    ) -> Result<Vec<TreeNode>>;

    // -- Labels --------------------------------------------------------------

    /// Adds a label to an issue.
    fn add_label(&self, issue_id: &str, label: &str, actor: &str) -> Result<()>;

    /// Removes a label from an issue.
    fn remove_label(&self, issue_id: &str, label: &str, actor: &str) -> Result<()>;

    /// Returns all labels for an issue.
    fn get_labels(&self, issue_id: &str) -> Result<Vec<String>>;

    /// Returns all issues with the given label.
    fn get_issues_by_label(&self, label: &str) -> Result<Vec<Issue>>;

    // -- Work queries --------------------------------------------------------

    /// Returns issues ready to work on under hierarchical blocking.
    fn get_ready_work(&self, filter: &WorkFilter) -> Result<Vec<Issue>>;

    /// Returns blocked issues with direct blocker counts.
    fn get_blocked_issues(&self) -> Result<Vec<BlockedIssue>>;

    /// Returns issues untouched for the filter's number of days.
    fn get_stale_issues(&self, filter: &StaleFilter) -> Result<Vec<Issue>>;

    /// Returns non-closed epics whose children are all closed.
    fn get_epics_eligible_for_closure(&self) -> Result<Vec<EpicStatus>>;

    // -- Comments and events -------------------------------------------------

    /// Adds a comment to an issue and returns the created comment.
    fn add_comment(&self, issue_id: &str, author: &str, text: &str) -> Result<Comment>;

    /// Returns all comments for an issue.
    fn get_comments(&self, issue_id: &str) -> Result<Vec<Comment>>;

    /// Returns events for an issue, oldest first.
    fn get_events(&self, issue_id: &str, limit: i32) -> Result<Vec<Event>>;

    // -- Identity ------------------------------------------------------------

    /// Resolves a partial id to its canonical form.
    fn resolve_id(&self, input: &str) -> Result<String>;

    // -- Statistics ----------------------------------------------------------

    /// Returns aggregate statistics about the issue database.
    fn get_statistics(&self) -> Result<Statistics>;

    // -- Compaction hosting --------------------------------------------------

    /// Returns issues eligible for compaction at the given level.
    fn get_compaction_candidates(&self, level: i32) -> Result<Vec<Issue>>;

    /// Applies an externally-produced summary to a closed issue.
    fn apply_compaction(
        &self,
        id: &str,
        summary: &str,
        commit: Option<&str>,
        actor: &str,
    ) -> Result<Issue>;

    /// Returns aggregate compaction statistics.
    fn get_compaction_stats(&self) -> Result<CompactionStats>;

    // -- Configuration -------------------------------------------------------

    /// Sets a configuration key-value pair.
    fn set_config(&self, key: &str, value: &str) -> Result<()>;

    /// Gets a configuration value by key.
    fn get_config(&self, key: &str) -> Result<String>;

    /// Returns all configuration key-value pairs.
    fn get_all_config(&self) -> Result<HashMap<String, String>>;
}
