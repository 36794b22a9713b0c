//! Issue validation rules.

use crate::enums::Status;
use crate::issue::Issue;

/// Error type for validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("title is required")]
    TitleRequired,

    #[error("title must be 500 characters or less (got {0})")]
    TitleTooLong(usize),

    #[error("priority must be between 0 and 4 (got {0})")]
    InvalidPriority(i32),

    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("invalid issue type: {0}")]
    InvalidIssueType(String),

    #[error("estimated_minutes cannot be negative")]
    NegativeEstimate,

    #[error("closed issues must have closed_at timestamp")]
    ClosedWithoutTimestamp,

    #[error("non-closed issues cannot have closed_at timestamp")]
    NotClosedWithTimestamp,
}

/// Maximum title length, in characters.
pub const MAX_TITLE_LEN: usize = 500;

/// Validates an issue against the engine's field constraints.
pub fn validate(issue: &Issue) -> Result<(), ValidationError> {
    if issue.title.is_empty() {
        return Err(ValidationError::TitleRequired);
    }
    let title_len = issue.title.chars().count();
    if title_len > MAX_TITLE_LEN {
        return Err(ValidationError::TitleTooLong(title_len));
    }
    if !(0..=4).contains(&issue.priority) {
        return Err(ValidationError::InvalidPriority(issue.priority));
    }
    if !issue.status.is_builtin() {
        return Err(ValidationError::InvalidStatus(
            issue.status.as_str().to_owned(),
        ));
    }
    if !issue.issue_type.is_builtin() {
        return Err(ValidationError::InvalidIssueType(
            issue.issue_type.as_str().to_owned(),
        ));
    }
    if let Some(est) = issue.estimated_minutes {
        if est < 0 {
            return Err(ValidationError::NegativeEstimate);
        }
    }
    // closed <=> closed_at invariant.
    if issue.status == Status::Closed && issue.closed_at.is_none() {
        return Err(ValidationError::ClosedWithoutTimestamp);
    }
    if issue.status != Status::Closed && issue.closed_at.is_some() {
        return Err(ValidationError::NotClosedWithTimestamp);
    }

    Ok(())
}
