//! Filter types for querying issues.

use chrono::{DateTime, Utc};

use crate::enums::{IssueType, SortPolicy, Status};

/// Maximum number of ids accepted in an [`IssueFilter::ids`] whitelist.
pub const MAX_ID_FILTER: usize = 1000;

/// Filter for issue listings and search.
#[derive(Debug, Clone, Default)]
pub struct IssueFilter {
    pub status: Option<Status>,
    pub issue_type: Option<IssueType>,
    pub assignee: Option<String>,

    /// Exact priority match.
    pub priority: Option<i32>,
    /// Inclusive priority range.
    pub priority_min: Option<i32>,
    pub priority_max: Option<i32>,

    /// AND semantics: issue must have ALL these labels.
    pub labels: Vec<String>,
    /// OR semantics: issue must have AT LEAST ONE of these labels.
    pub labels_any: Vec<String>,

    /// Whitelist of issue ids; capped at [`MAX_ID_FILTER`].
    pub ids: Vec<String>,

    // Date ranges.
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub updated_after: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
    pub closed_after: Option<DateTime<Utc>>,
    pub closed_before: Option<DateTime<Utc>>,

    // Empty-field probes.
    pub no_description: bool,
    pub no_assignee: bool,
    pub no_labels: bool,

    pub limit: Option<i32>,
}

/// Filter for ready-work queries.
#[derive(Debug, Clone, Default)]
pub struct WorkFilter {
    pub priority: Option<i32>,
    pub assignee: Option<String>,

    /// AND semantics: issue must have ALL these labels.
    pub labels: Vec<String>,
    /// OR semantics: issue must have AT LEAST ONE of these labels.
    pub labels_any: Vec<String>,

    pub sort_policy: SortPolicy,
    pub limit: Option<i32>,
}

/// Filter for stale issue queries.
#[derive(Debug, Clone)]
pub struct StaleFilter {
    /// Issues not updated in this many days.
    pub days: i64,
    /// Filter by status; `None` = all non-closed.
    pub status: Option<Status>,
    /// Maximum issues to return.
    pub limit: Option<i32>,
}

impl Default for StaleFilter {
    fn default() -> Self {
        Self {
            days: 30,
            status: None,
            limit: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_filter_defaults() {
        let f = IssueFilter::default();
        assert!(f.status.is_none());
        assert!(f.priority.is_none());
        assert!(f.labels.is_empty());
        assert!(!f.no_assignee);
    }

    #[test]
    fn work_filter_defaults() {
        let f = WorkFilter::default();
        assert_eq!(f.sort_policy, SortPolicy::Hybrid);
        assert!(f.limit.is_none());
    }

    #[test]
    fn stale_filter_defaults() {
        let f = StaleFilter::default();
        assert_eq!(f.days, 30);
        assert!(f.status.is_none());
    }
}
