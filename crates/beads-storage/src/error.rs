//! Storage error types.

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested entity was not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g., "issue", "dependency").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// A duplicate id or edge, or an ambiguous partial id.
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the conflict.
        message: String,
    },

    /// A validation constraint was violated.
    #[error("validation error: {message}")]
    Validation {
        /// Description of the validation failure.
        message: String,
    },

    /// Adding a dependency would create a cycle in the blocking graph.
    #[error("dependency {from} -> {to} would create a cycle")]
    CycleDetected {
        /// Source of the rejected edge.
        from: String,
        /// Target of the rejected edge.
        to: String,
    },

    /// The workspace has no issue prefix configured.
    #[error("workspace not initialized: {reason}")]
    Uninitialized {
        /// Why the workspace is considered uninitialized.
        reason: String,
    },

    /// An issue ID does not match the configured prefix.
    #[error("issue {id} does not match configured prefix {prefix}")]
    PrefixMismatch {
        /// The issue ID.
        id: String,
        /// The expected prefix.
        prefix: String,
    },

    /// The schema probe could not bring the database to the expected shape.
    #[error("schema incompatible: {reason}")]
    SchemaIncompatible {
        /// Which schema elements are missing or malformed.
        reason: String,
    },

    /// Failed to establish or maintain a database connection.
    #[error("connection error: {0}")]
    Connection(String),

    /// A transaction operation failed.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// The request was canceled by the caller.
    #[error("operation canceled")]
    Canceled,

    /// A raw SQLite query error.
    #[error("query error: {0}")]
    Query(#[from] rusqlite::Error),

    /// JSON serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Catch-all for unexpected internal errors.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the storage crate.
pub type Result<T> = std::result::Result<T, StorageError>;

impl StorageError {
    // -- Constructors --------------------------------------------------------

    /// Creates a [`StorageError::NotFound`] for the given entity kind and id.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Creates a [`StorageError::Validation`] with the given message.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a [`StorageError::Conflict`] with the given message.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    // -- Predicates ----------------------------------------------------------

    /// Returns `true` if this is a [`StorageError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` if this is a [`StorageError::Conflict`].
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns `true` if this is a [`StorageError::CycleDetected`].
    pub fn is_cycle(&self) -> bool {
        matches!(self, Self::CycleDetected { .. })
    }

    /// Stable error-kind string surfaced to service clients.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not-found",
            Self::Conflict { .. } => "conflict",
            Self::Validation { .. } | Self::PrefixMismatch { .. } => "validation",
            Self::CycleDetected { .. } => "cycle",
            Self::Uninitialized { .. } => "uninitialized",
            Self::SchemaIncompatible { .. } => "schema-incompatible",
            Self::Canceled => "canceled",
            Self::Connection(_)
            | Self::Transaction(_)
            | Self::Query(_)
            | Self::Serialization(_)
            | Self::Internal(_) => "storage",
        }
    }
}

impl From<beads_core::validation::ValidationError> for StorageError {
    fn from(e: beads_core::validation::ValidationError) -> Self {
        Self::Validation {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings() {
        assert_eq!(StorageError::not_found("issue", "bd-x").kind(), "not-found");
        assert_eq!(StorageError::validation("bad").kind(), "validation");
        assert_eq!(
            StorageError::CycleDetected {
                from: "a".into(),
                to: "b".into()
            }
            .kind(),
            "cycle"
        );
        assert_eq!(StorageError::Canceled.kind(), "canceled");
    }

    #[test]
    fn predicates() {
        assert!(StorageError::not_found("issue", "x").is_not_found());
        assert!(StorageError::conflict("dup").is_conflict());
        assert!(
            StorageError::CycleDetected {
                from: "a".into(),
                to: "b".into()
            }
            .is_cycle()
        );
    }
}
