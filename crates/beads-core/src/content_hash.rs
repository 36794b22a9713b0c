//! Deterministic content hashing for issues.
//!
//! Produces a SHA-256 hex digest over the substantive content fields
//! (excluding ID, timestamps, source routing, and compaction metadata) so
//! that identical content produces identical hashes across all clones.

use sha2::{Digest, Sha256};

use crate::issue::Issue;

/// Separator byte written between fields.
const SEP: u8 = 0;

/// Computes the deterministic content hash for an issue.
///
/// Field order is fixed; changing it changes every stored hash, so append
/// new fields at the end only.
pub fn compute_content_hash(issue: &Issue) -> String {
    let mut h = Sha256::new();

    write_str(&mut h, &issue.title);
    write_str(&mut h, &issue.description);
    write_str(&mut h, &issue.design);
    write_str(&mut h, &issue.acceptance_criteria);
    write_str(&mut h, &issue.notes);
    write_str(&mut h, issue.status.as_str());
    write_int(&mut h, issue.priority);
    write_str(&mut h, issue.issue_type.as_str());
    write_str(&mut h, &issue.assignee);
    write_int_opt(&mut h, issue.estimated_minutes);
    write_str_opt(&mut h, issue.external_ref.as_deref());

    format!("{:x}", h.finalize())
}

// -- helper writers ---------------------------------------------------------

fn write_str(h: &mut Sha256, s: &str) {
    h.update(s.as_bytes());
    h.update([SEP]);
}

fn write_int(h: &mut Sha256, n: i32) {
    h.update(n.to_string().as_bytes());
    h.update([SEP]);
}

fn write_int_opt(h: &mut Sha256, n: Option<i32>) {
    if let Some(n) = n {
        h.update(n.to_string().as_bytes());
    }
    h.update([SEP]);
}

fn write_str_opt(h: &mut Sha256, s: Option<&str>) {
    if let Some(s) = s {
        h.update(s.as_bytes());
    }
    h.update([SEP]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue::IssueBuilder;

    #[test]
    fn content_hash_deterministic() {
        let issue = IssueBuilder::new("Test issue")
            .description("A description")
            .priority(2)
            .build();

        let hash1 = compute_content_hash(&issue);
        let hash2 = compute_content_hash(&issue);
        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 64); // SHA-256 hex = 64 chars
    }

    #[test]
    fn content_hash_differs_on_change() {
        let issue1 = IssueBuilder::new("Title A").build();
        let issue2 = IssueBuilder::new("Title B").build();
        assert_ne!(compute_content_hash(&issue1), compute_content_hash(&issue2));
    }

    #[test]
    fn content_hash_covers_status_and_priority() {
        let base = IssueBuilder::new("Same").build();
        let mut other = IssueBuilder::new("Same").build();
        other.priority = base.priority + 1;
        assert_ne!(compute_content_hash(&base), compute_content_hash(&other));

        let mut closed = IssueBuilder::new("Same").build();
        closed.status = crate::enums::Status::Closed;
        assert_ne!(compute_content_hash(&base), compute_content_hash(&closed));
    }

    #[test]
    fn content_hash_ignores_id_and_timestamps() {
        let mut issue1 = IssueBuilder::new("Same content").build();
        let mut issue2 = IssueBuilder::new("Same content").build();

        issue1.id = "bd-aaa".into();
        issue2.id = "bd-bbb".into();
        issue1.created_at = chrono::Utc::now();
        issue2.created_at = chrono::DateTime::parse_from_rfc3339("2020-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        issue2.source_repo = "elsewhere".into();

        assert_eq!(compute_content_hash(&issue1), compute_content_hash(&issue2));
    }

    #[test]
    fn content_hash_field_boundaries_are_unambiguous() {
        // "ab" + "c" must not collide with "a" + "bc".
        let i1 = IssueBuilder::new("ab").description("c").build();
        let i2 = IssueBuilder::new("a").description("bc").build();
        assert_ne!(compute_content_hash(&i1), compute_content_hash(&i2));
    }
}
