//! Typed partial updates for issues.
//!
//! The update path takes a list of [`FieldUpdate`] variants instead of an
//! open-ended field map. Each variant is one allowed field, so unknown
//! fields are rejected at deserialization time and the allow-list is the
//! enum itself.

use serde::{Deserialize, Serialize};

use crate::enums::{IssueType, Status};

/// One field assignment in an update request.
///
/// Wire form: `{"field": "title", "value": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum FieldUpdate {
    Title(String),
    Description(String),
    Design(String),
    AcceptanceCriteria(String),
    Notes(String),
    Status(Status),
    Priority(i32),
    IssueType(IssueType),
    Assignee(String),
    /// `None` clears the estimate.
    EstimatedMinutes(Option<i32>),
    /// `None` clears the reference.
    ExternalRef(Option<String>),
    SourceRepo(String),
}

impl FieldUpdate {
    /// Column name the variant maps to.
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::Title(_) => "title",
            Self::Description(_) => "description",
            Self::Design(_) => "design",
            Self::AcceptanceCriteria(_) => "acceptance_criteria",
            Self::Notes(_) => "notes",
            Self::Status(_) => "status",
            Self::Priority(_) => "priority",
            Self::IssueType(_) => "issue_type",
            Self::Assignee(_) => "assignee",
            Self::EstimatedMinutes(_) => "estimated_minutes",
            Self::ExternalRef(_) => "external_ref",
            Self::SourceRepo(_) => "source_repo",
        }
    }

    /// Returns `true` if the field participates in the content hash.
    pub fn touches_content(&self) -> bool {
        !matches!(self, Self::SourceRepo(_))
    }
}

/// Returns the status assignment in an update list, if any.
pub fn status_change(updates: &[FieldUpdate]) -> Option<&Status> {
    updates.iter().find_map(|u| match u {
        FieldUpdate::Status(s) => Some(s),
        _ => None,
    })
}
