//! Content-addressed hash IDs.
//!
//! An issue id is `<prefix>-<hex>` where the hex portion is a SHA-256
//! digest of the issue's creation inputs, truncated to an adaptive length.
//! The allocator in the storage crate starts at [`DEFAULT_HASH_LEN`] and
//! grows one nibble at a time when it observes a collision inside the
//! allocating transaction.
//!
//! Hierarchical children take the form `<parent-id>.<n>` where `n` comes
//! from the per-parent child counter.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Initial truncation length for the hex portion of a hash id.
pub const DEFAULT_HASH_LEN: usize = 6;

/// Upper bound on hex truncation length. Sixteen nibbles (64 bits) is far
/// past the point where a real workspace could still collide.
pub const MAX_HASH_LEN: usize = 16;

/// Computes the full 64-char hex digest an id is truncated from.
///
/// The inputs pin the digest to one creation: content, actor, and the
/// creation timestamp at nanosecond resolution.
pub fn id_digest(title: &str, description: &str, actor: &str, created_at: DateTime<Utc>) -> String {
    let mut h = Sha256::new();
    h.update(title.as_bytes());
    h.update([0u8]);
    h.update(description.as_bytes());
    h.update([0u8]);
    h.update(actor.as_bytes());
    h.update([0u8]);
    h.update(
        created_at
            .timestamp_nanos_opt()
            .unwrap_or(0)
            .to_string()
            .as_bytes(),
    );
    format!("{:x}", h.finalize())
}

/// Formats `<prefix>-<hex[..len]>`.
pub fn format_id(prefix: &str, digest: &str, len: usize) -> String {
    let len = len.min(digest.len());
    format!("{}-{}", prefix, &digest[..len])
}

/// Formats a hierarchical child id `<parent>.<n>`.
pub fn child_id(parent_id: &str, n: i64) -> String {
    format!("{parent_id}.{n}")
}

/// Returns the parent id of a hierarchical id, or `None` for top-level ids.
///
/// Only a trailing all-digit segment counts as a child suffix, so
/// `bd-3d0.1` has parent `bd-3d0` but `bd-v1.x` has none.
pub fn parent_of(id: &str) -> Option<&str> {
    let (parent, suffix) = id.rsplit_once('.')?;
    if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
        Some(parent)
    } else {
        None
    }
}

/// Returns the child counter value encoded in a hierarchical id, if any.
pub fn child_suffix(id: &str) -> Option<i64> {
    let (_, suffix) = id.rsplit_once('.')?;
    suffix.parse().ok()
}

/// Returns the hash portion of an id: everything after the first `-`.
///
/// `bd-a3f8e9` yields `a3f8e9`; an id with no dash yields `None`.
pub fn hash_part(id: &str) -> Option<&str> {
    id.split_once('-').map(|(_, h)| h)
}

/// Returns `true` if `id` starts with `<prefix>-`.
pub fn has_prefix(id: &str, prefix: &str) -> bool {
    id.strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_deterministic() {
        let ts = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let d1 = id_digest("Title", "Desc", "alice", ts);
        let d2 = id_digest("Title", "Desc", "alice", ts);
        assert_eq!(d1, d2);
        assert_eq!(d1.len(), 64);
    }

    #[test]
    fn digest_varies_with_actor() {
        let ts = Utc::now();
        assert_ne!(
            id_digest("T", "D", "alice", ts),
            id_digest("T", "D", "bob", ts)
        );
    }

    #[test]
    fn format_id_truncates() {
        let digest = "a3f8e9c01234567890abcdef";
        assert_eq!(format_id("bd", digest, 6), "bd-a3f8e9");
        assert_eq!(format_id("bd", digest, 7), "bd-a3f8e9c");
    }

    #[test]
    fn child_id_format() {
        assert_eq!(child_id("bd-3d0", 1), "bd-3d0.1");
        assert_eq!(child_id("bd-3d0.1", 2), "bd-3d0.1.2");
    }

    #[test]
    fn parent_of_hierarchical() {
        assert_eq!(parent_of("bd-3d0.1"), Some("bd-3d0"));
        assert_eq!(parent_of("bd-3d0.1.2"), Some("bd-3d0.1"));
        assert_eq!(parent_of("bd-3d0"), None);
        assert_eq!(parent_of("bd-v1.x"), None);
    }

    #[test]
    fn child_suffix_parses() {
        assert_eq!(child_suffix("bd-3d0.7"), Some(7));
        assert_eq!(child_suffix("bd-3d0"), None);
    }

    #[test]
    fn hash_part_extraction() {
        assert_eq!(hash_part("bd-a3f8e9"), Some("a3f8e9"));
        assert_eq!(hash_part("bd-a3f8e9.1"), Some("a3f8e9.1"));
        assert_eq!(hash_part("noprefix"), None);
    }

    #[test]
    fn prefix_check() {
        assert!(has_prefix("bd-a3f", "bd"));
        assert!(!has_prefix("bda3f", "bd"));
        assert!(!has_prefix("other-a3f", "bd"));
    }
}
