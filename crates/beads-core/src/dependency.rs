//! Dependency types -- relationships between issues.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enums::DependencyType;

/// A directed edge between two issues.
///
/// At most one edge may exist per ordered `(issue_id, depends_on_id)` pair,
/// regardless of type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub issue_id: String,

    pub depends_on_id: String,

    /// Dependency type (serialised as "type" in JSON).
    #[serde(rename = "type", default)]
    pub dep_type: DependencyType,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_by: String,
}

impl Dependency {
    /// Creates an edge of the given type between two issues.
    pub fn new(
        issue_id: impl Into<String>,
        depends_on_id: impl Into<String>,
        dep_type: DependencyType,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            issue_id: issue_id.into(),
            depends_on_id: depends_on_id.into(),
            dep_type,
            created_at: Utc::now(),
            created_by: created_by.into(),
        }
    }
}

/// Counts for dependencies and dependents, bulk-joined onto listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyCounts {
    /// Number of issues this issue depends on.
    pub dependency_count: i32,
    /// Number of issues that depend on this issue.
    pub dependent_count: i32,
}
