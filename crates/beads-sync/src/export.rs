//! Dirty-driven export of mutated issues to the text mirror.

use std::io::Write;
use std::path::Path;

use tracing::{debug, info};

use beads_core::cancel::CancelToken;
use beads_core::issue::Issue;
use beads_core::jsonl;
use beads_storage::SqliteStore;

use crate::atomic::write_atomic;
use crate::{Result, SyncError};

/// Outcome of an export pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportReport {
    /// Lines appended (or written, for a full export).
    pub written: usize,
    /// Dirty issues skipped because their content hash matched the last
    /// exported hash (timestamp-only churn).
    pub skipped: usize,
    /// Dirty entries cleared for issues that no longer exist.
    pub vanished: usize,
}

/// Loads an issue denormalized for the mirror: labels and outgoing
/// dependency edges populated.
fn load_denormalized(store: &SqliteStore, id: &str) -> beads_storage::Result<Issue> {
    let mut issue = store.get_issue_impl(id)?;
    issue.labels = store.get_labels_impl(id)?;
    issue.dependencies = store.get_dependency_records_impl(id)?;
    Ok(issue)
}

/// The dedup key recorded in `export_hashes`: the content hash extended
/// with the relational data the mirror line carries, so a label or edge
/// change is never mistaken for timestamp-only churn.
fn export_fingerprint(issue: &Issue) -> String {
    let mut fp = issue.content_hash.clone();
    fp.push('|');
    fp.push_str(&issue.labels.join(","));
    fp.push('|');
    for dep in &issue.dependencies {
        fp.push_str(&dep.depends_on_id);
        fp.push(':');
        fp.push_str(dep.dep_type.as_str());
        fp.push(',');
    }
    fp
}

/// Exports dirty issues to the mirror, appending one line per issue whose
/// content hash differs from the last exported hash.
///
/// Idempotent: a clean workspace exports zero lines. Each successful line
/// clears its dirty entry and records the exported hash.
pub fn export_dirty(
    store: &SqliteStore,
    mirror: &Path,
    cancel: &CancelToken,
) -> Result<ExportReport> {
    let dirty = store.get_dirty_issues_impl()?;
    let mut report = ExportReport::default();
    if dirty.is_empty() {
        return Ok(report);
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(mirror)?;

    for (id, _marked_at) in dirty {
        if cancel.is_canceled() {
            return Err(SyncError::Canceled);
        }

        let issue = match load_denormalized(store, &id) {
            Ok(issue) => issue,
            Err(e) if e.is_not_found() => {
                // Deleted since it was marked; a full export will drop its
                // stale line from the mirror.
                store.clear_dirty_impl(&id)?;
                report.vanished += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let fingerprint = export_fingerprint(&issue);
        if store.get_export_hash_impl(&id)?.as_deref() == Some(fingerprint.as_str()) {
            debug!(id, "content unchanged since last export, skipping");
            store.note_exported_impl(&id, &fingerprint)?;
            report.skipped += 1;
            continue;
        }

        let line = jsonl::to_line(&issue)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;

        store.note_exported_impl(&id, &fingerprint)?;
        report.written += 1;
    }

    info!(
        written = report.written,
        skipped = report.skipped,
        "exported dirty issues to mirror"
    );
    Ok(report)
}

/// Rewrites the whole mirror from the database (atomic temp + rename).
///
/// Used after deletions, and by hydration sources that need a canonical
/// file. Clears the entire dirty set and refreshes every export hash.
pub fn export_full(
    store: &SqliteStore,
    mirror: &Path,
    cancel: &CancelToken,
) -> Result<ExportReport> {
    let listed = store.search_issues_impl("", &beads_core::filter::IssueFilter::default())?;

    let mut buf = Vec::new();
    let mut ids = Vec::with_capacity(listed.len());
    for entry in &listed {
        if cancel.is_canceled() {
            return Err(SyncError::Canceled);
        }
        let issue = load_denormalized(store, &entry.issue.id)?;
        let line = jsonl::to_line(&issue)?;
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        ids.push((issue.id.clone(), export_fingerprint(&issue)));
    }

    write_atomic(mirror, &buf)?;

    for (id, hash) in &ids {
        store.note_exported_impl(id, hash)?;
    }
    // Entries for deleted issues have nothing left to export.
    for (id, _) in store.get_dirty_issues_impl()? {
        store.clear_dirty_impl(&id)?;
    }

    info!(written = ids.len(), "rewrote mirror");
    Ok(ExportReport {
        written: ids.len(),
        ..Default::default()
    })
}
