//! Issue struct -- the central domain model for the beads system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dependency::Dependency;
use crate::enums::{IssueType, Status};

/// Helper for `skip_serializing_if` on `Vec` fields.
fn is_empty_vec<T>(v: &Vec<T>) -> bool {
    v.is_empty()
}

fn is_zero_i32(v: &i32) -> bool {
    *v == 0
}

/// Represents a trackable work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    // ===== Identity =====
    #[serde(default)]
    pub id: String,

    /// SHA-256 of the canonical content fields -- recomputed on every
    /// content-affecting write, never taken from input.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_hash: String,

    // ===== Content =====
    #[serde(default)]
    pub title: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub design: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub acceptance_criteria: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,

    // ===== Status & workflow =====
    #[serde(default, skip_serializing_if = "Status::is_default")]
    pub status: Status,

    /// Priority 0-4, lower is more urgent. Always serialized: 0 is valid.
    #[serde(default)]
    pub priority: i32,

    #[serde(default, skip_serializing_if = "IssueType::is_default")]
    pub issue_type: IssueType,

    // ===== Assignment =====
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub assignee: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_minutes: Option<i32>,

    // ===== External references =====
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,

    /// Which workspace contributed this issue (multi-workspace hydration).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_repo: String,

    // ===== Timestamps =====
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,

    // ===== Compaction metadata =====
    #[serde(default, skip_serializing_if = "is_zero_i32")]
    pub compaction_level: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacted_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacted_at_commit: Option<String>,

    #[serde(default, skip_serializing_if = "is_zero_i32")]
    pub original_size: i32,

    // ===== Relational data (populated for export/import) =====
    #[serde(default, skip_serializing_if = "is_empty_vec")]
    pub labels: Vec<String>,

    #[serde(default, skip_serializing_if = "is_empty_vec")]
    pub dependencies: Vec<Dependency>,
}

impl Default for Issue {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            content_hash: String::new(),
            title: String::new(),
            description: String::new(),
            design: String::new(),
            acceptance_criteria: String::new(),
            notes: String::new(),
            status: Status::Open,
            priority: 2,
            issue_type: IssueType::Task,
            assignee: String::new(),
            estimated_minutes: None,
            external_ref: None,
            source_repo: String::new(),
            created_at: now,
            updated_at: now,
            closed_at: None,
            compaction_level: 0,
            compacted_at: None,
            compacted_at_commit: None,
            original_size: 0,
            labels: Vec::new(),
            dependencies: Vec::new(),
        }
    }
}

impl Issue {
    /// Applies default values for fields omitted during JSONL import.
    pub fn set_defaults(&mut self) {
        if self.status.as_str().is_empty() {
            self.status = Status::Open;
        }
        if self.issue_type.as_str().is_empty() {
            self.issue_type = IssueType::Task;
        }
    }

    /// Returns `true` if the id follows the hierarchical `<parent>.<n>` form.
    pub fn is_hierarchical(&self) -> bool {
        crate::idgen::parent_of(&self.id).is_some()
    }
}

/// Builder for constructing an [`Issue`] with a fluent API.
pub struct IssueBuilder {
    issue: Issue,
}

impl IssueBuilder {
    /// Creates a new builder with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        let mut issue = Issue::default();
        issue.title = title.into();
        Self { issue }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.issue.id = id.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.issue.description = description.into();
        self
    }

    pub fn design(mut self, design: impl Into<String>) -> Self {
        self.issue.design = design.into();
        self
    }

    pub fn acceptance_criteria(mut self, ac: impl Into<String>) -> Self {
        self.issue.acceptance_criteria = ac.into();
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.issue.notes = notes.into();
        self
    }

    pub fn status(mut self, status: Status) -> Self {
        self.issue.status = status;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.issue.priority = priority;
        self
    }

    pub fn issue_type(mut self, issue_type: IssueType) -> Self {
        self.issue.issue_type = issue_type;
        self
    }

    pub fn assignee(mut self, assignee: impl Into<String>) -> Self {
        self.issue.assignee = assignee.into();
        self
    }

    pub fn estimated_minutes(mut self, minutes: i32) -> Self {
        self.issue.estimated_minutes = Some(minutes);
        self
    }

    pub fn external_ref(mut self, ext: impl Into<String>) -> Self {
        self.issue.external_ref = Some(ext.into());
        self
    }

    pub fn source_repo(mut self, repo: impl Into<String>) -> Self {
        self.issue.source_repo = repo.into();
        self
    }

    pub fn created_at(mut self, t: DateTime<Utc>) -> Self {
        self.issue.created_at = t;
        self
    }

    pub fn updated_at(mut self, t: DateTime<Utc>) -> Self {
        self.issue.updated_at = t;
        self
    }

    pub fn closed_at(mut self, t: DateTime<Utc>) -> Self {
        self.issue.closed_at = Some(t);
        self
    }

    pub fn labels(mut self, labels: Vec<String>) -> Self {
        self.issue.labels = labels;
        self
    }

    /// Consumes the builder and returns the constructed [`Issue`].
    pub fn build(self) -> Issue {
        self.issue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_issue() {
        let issue = Issue::default();
        assert_eq!(issue.status, Status::Open);
        assert_eq!(issue.issue_type, IssueType::Task);
        assert_eq!(issue.priority, 2);
        assert!(issue.closed_at.is_none());
    }

    #[test]
    fn builder_basic() {
        let issue = IssueBuilder::new("Fix the bug")
            .priority(1)
            .status(Status::InProgress)
            .issue_type(IssueType::Bug)
            .assignee("alice")
            .build();

        assert_eq!(issue.title, "Fix the bug");
        assert_eq!(issue.priority, 1);
        assert_eq!(issue.status, Status::InProgress);
        assert_eq!(issue.issue_type, IssueType::Bug);
        assert_eq!(issue.assignee, "alice");
    }

    #[test]
    fn issue_serde_roundtrip() {
        let issue = IssueBuilder::new("Test issue")
            .id("bd-a3f8e9")
            .priority(1)
            .description("A test description")
            .build();

        let json = serde_json::to_string(&issue).unwrap();
        let back: Issue = serde_json::from_str(&json).unwrap();

        assert_eq!(back.title, "Test issue");
        assert_eq!(back.id, "bd-a3f8e9");
        assert_eq!(back.priority, 1);
        assert_eq!(back.description, "A test description");
    }

    #[test]
    fn serde_omits_empty_fields() {
        let issue = IssueBuilder::new("Slim").id("bd-1").build();
        let json = serde_json::to_string(&issue).unwrap();
        assert!(!json.contains("description"));
        assert!(!json.contains("labels"));
        assert!(!json.contains("closed_at"));
        // Priority is always present, even default.
        assert!(json.contains("priority"));
    }

    #[test]
    fn hierarchical_detection() {
        let parent = IssueBuilder::new("Epic").id("bd-3d0").build();
        let child = IssueBuilder::new("Task").id("bd-3d0.1").build();
        assert!(!parent.is_hierarchical());
        assert!(child.is_hierarchical());
    }
}
