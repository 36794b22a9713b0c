//! Enum types for the beads system.
//!
//! Each enum has:
//! - Custom Serialize (as its canonical string form)
//! - Custom Deserialize (known variants + catch-all Custom/Other(String))
//! - `as_str()`, `is_default()`, `Display` impl

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

// ---------------------------------------------------------------------------
// Macro: defines an enum with known string variants + a Custom(String) fallback.
// ---------------------------------------------------------------------------
macro_rules! define_enum {
    (
        $(#[$meta:meta])*
        $name:ident, default = $default:ident, custom_variant = $custom_variant:ident,
        variants: [
            $( ($variant:ident, $str:expr) ),+ $(,)?
        ]
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $variant, )+
            $custom_variant(String),
        }

        impl $name {
            /// Returns the string representation.
            pub fn as_str(&self) -> &str {
                match self {
                    $( Self::$variant => $str, )+
                    Self::$custom_variant(s) => s.as_str(),
                }
            }

            /// Returns `true` if this is the default variant.
            pub fn is_default(&self) -> bool {
                *self == Self::$default
            }

            /// Returns `true` if this is a known (non-custom) variant.
            pub fn is_builtin(&self) -> bool {
                !matches!(self, Self::$custom_variant(_))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::$default
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Ok(Self::from(s))
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                match s {
                    $( $str => Self::$variant, )+
                    other => Self::$custom_variant(other.to_owned()),
                }
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                // Check known variants first to avoid allocation in common case.
                match s.as_str() {
                    $( $str => Self::$variant, )+
                    _ => Self::$custom_variant(s),
                }
            }
        }
    };
}

// ===========================================================================
// Status
// ===========================================================================

define_enum! {
    /// Current state of an issue. Only `closed` is terminal.
    Status, default = Open, custom_variant = Custom,
    variants: [
        (Open, "open"),
        (InProgress, "in_progress"),
        (Closed, "closed"),
        (Blocked, "blocked"),
    ]
}

impl Status {
    /// Returns `true` for states that still count as active work.
    ///
    /// A non-terminal blocker keeps its dependents out of the ready set.
    pub fn is_non_terminal(&self) -> bool {
        !matches!(self, Self::Closed)
    }
}

// ===========================================================================
// IssueType
// ===========================================================================

define_enum! {
    /// Categorises the kind of work.
    IssueType, default = Task, custom_variant = Custom,
    variants: [
        (Bug, "bug"),
        (Feature, "feature"),
        (Task, "task"),
        (Epic, "epic"),
        (Chore, "chore"),
    ]
}

// ===========================================================================
// DependencyType
// ===========================================================================

define_enum! {
    /// Relationship type between issues.
    DependencyType, default = Blocks, custom_variant = Custom,
    variants: [
        (Blocks, "blocks"),
        (Related, "related"),
        (ParentChild, "parent-child"),
        (DiscoveredFrom, "discovered-from"),
    ]
}

impl DependencyType {
    /// Returns `true` if the edge keeps its source out of the ready set
    /// while the target is non-terminal.
    pub fn blocks_work(&self) -> bool {
        matches!(self, Self::Blocks)
    }

    /// Returns `true` if the edge participates in cycle detection.
    ///
    /// `blocks` and `parent-child` form one combined subgraph that must
    /// stay acyclic; informational edges are exempt.
    pub fn in_blocking_graph(&self) -> bool {
        matches!(self, Self::Blocks | Self::ParentChild)
    }
}

// ===========================================================================
// SortPolicy
// ===========================================================================

define_enum! {
    /// Determines how ready work is ordered.
    SortPolicy, default = Hybrid, custom_variant = Custom,
    variants: [
        (Hybrid, "hybrid"),
        (Priority, "priority"),
        (Oldest, "oldest"),
    ]
}

// ===========================================================================
// EventType
// ===========================================================================

/// Categorises audit trail events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    Created,
    Updated,
    StatusChanged,
    Commented,
    Closed,
    Reopened,
    DependencyAdded,
    DependencyRemoved,
    LabelAdded,
    LabelRemoved,
    Compacted,
    Renamed,
    /// Catch-all for unknown / future event types.
    Other(String),
}

impl EventType {
    /// Returns the string representation.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::StatusChanged => "status_changed",
            Self::Commented => "commented",
            Self::Closed => "closed",
            Self::Reopened => "reopened",
            Self::DependencyAdded => "dependency_added",
            Self::DependencyRemoved => "dependency_removed",
            Self::LabelAdded => "label_added",
            Self::LabelRemoved => "label_removed",
            Self::Compacted => "compacted",
            Self::Renamed => "renamed",
            Self::Other(s) => s.as_str(),
        }
    }
}

impl Default for EventType {
    fn default() -> Self {
        Self::Created
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from(s))
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self::from(s.to_owned())
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "created" => Self::Created,
            "updated" => Self::Updated,
            "status_changed" => Self::StatusChanged,
            "commented" => Self::Commented,
            "closed" => Self::Closed,
            "reopened" => Self::Reopened,
            "dependency_added" => Self::DependencyAdded,
            "dependency_removed" => Self::DependencyRemoved,
            "label_added" => Self::LabelAdded,
            "label_removed" => Self::LabelRemoved,
            "compacted" => Self::Compacted,
            "renamed" => Self::Renamed,
            _ => Self::Other(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_default_is_open() {
        assert_eq!(Status::default(), Status::Open);
        assert!(Status::Open.is_default());
        assert!(!Status::Closed.is_default());
    }

    #[test]
    fn status_roundtrip_serde() {
        let s = Status::InProgress;
        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(json, r#""in_progress""#);
        let back: Status = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn status_terminality() {
        assert!(Status::Open.is_non_terminal());
        assert!(Status::InProgress.is_non_terminal());
        assert!(Status::Blocked.is_non_terminal());
        assert!(!Status::Closed.is_non_terminal());
    }

    #[test]
    fn unknown_status_parses_as_custom() {
        let s: Status = serde_json::from_str(r#""someday""#).unwrap();
        assert_eq!(s, Status::Custom("someday".into()));
        assert!(!s.is_builtin());
    }

    #[test]
    fn dependency_type_as_str() {
        assert_eq!(DependencyType::ParentChild.as_str(), "parent-child");
        assert_eq!(DependencyType::DiscoveredFrom.as_str(), "discovered-from");
    }

    #[test]
    fn dependency_type_blocking_rules() {
        assert!(DependencyType::Blocks.blocks_work());
        assert!(!DependencyType::ParentChild.blocks_work());
        assert!(DependencyType::Blocks.in_blocking_graph());
        assert!(DependencyType::ParentChild.in_blocking_graph());
        assert!(!DependencyType::Related.in_blocking_graph());
        assert!(!DependencyType::DiscoveredFrom.in_blocking_graph());
    }

    #[test]
    fn event_type_roundtrip() {
        for et in [
            EventType::Created,
            EventType::StatusChanged,
            EventType::Compacted,
            EventType::Renamed,
        ] {
            let json = serde_json::to_string(&et).unwrap();
            let back: EventType = serde_json::from_str(&json).unwrap();
            assert_eq!(back, et);
        }
    }

    #[test]
    fn event_type_other_variant() {
        let e: EventType = serde_json::from_str(r#""custom_event""#).unwrap();
        assert_eq!(e, EventType::Other("custom_event".into()));
    }

    #[test]
    fn sort_policy_default() {
        assert_eq!(SortPolicy::default(), SortPolicy::Hybrid);
        assert_eq!(SortPolicy::Oldest.as_str(), "oldest");
    }
}
