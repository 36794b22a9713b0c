//! Two-phase import of the text mirror into the database.
//!
//! Phase one creates all issues (existing ids are left alone); phase two
//! inserts dependencies and labels, ignoring duplicates and cycles. A
//! configurable orphan policy decides what happens when an imported issue
//! references a nonexistent parent or dependency target.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

use tracing::{info, warn};

use beads_core::cancel::CancelToken;
use beads_core::issue::Issue;
use beads_core::jsonl;
use beads_storage::{SqliteStore, StorageError};

use crate::{LAST_IMPORT_MTIME_KEY, Result, SyncError, file_mtime_ms};

/// What to do when an imported issue references a nonexistent issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrphanPolicy {
    /// Insert the issue but drop the dangling edge (default).
    #[default]
    Allow,
    /// Fail the import.
    Strict,
    /// Look for the missing issue elsewhere in the mirror and insert it
    /// first; edges whose target is in neither the mirror nor the
    /// database are dropped.
    Resurrect,
    /// Drop the offending issue entirely.
    Skip,
}

impl OrphanPolicy {
    /// Parses the config-table spelling of a policy.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(Self::Allow),
            "strict" => Some(Self::Strict),
            "resurrect" => Some(Self::Resurrect),
            "skip" => Some(Self::Skip),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Strict => "strict",
            Self::Resurrect => "resurrect",
            Self::Skip => "skip",
        }
    }
}

impl fmt::Display for OrphanPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an import pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Issues inserted.
    pub created: usize,
    /// Issues whose id already existed (left untouched).
    pub existing: usize,
    /// Issues dropped by the `skip` policy.
    pub issues_skipped: usize,
    /// Dependency edges inserted.
    pub deps_added: usize,
    /// Dangling or cycle-forming edges dropped.
    pub deps_dropped: usize,
}

/// Imports the mirror file into the database.
///
/// `source_repo`, when given, is stamped onto every inserted issue
/// (multi-workspace hydration). Lines are grouped by id with the last
/// occurrence winning.
pub fn import_mirror(
    store: &SqliteStore,
    mirror: &Path,
    policy: OrphanPolicy,
    source_repo: Option<&str>,
    cancel: &CancelToken,
) -> Result<ImportReport> {
    let file = match std::fs::File::open(mirror) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ImportReport::default());
        }
        Err(e) => return Err(e.into()),
    };

    // Group lines into issues: last line per id wins, original order kept.
    let mut order: Vec<String> = Vec::new();
    let mut by_id: HashMap<String, Issue> = HashMap::new();
    for record in jsonl::read_jsonl(std::io::BufReader::new(file)) {
        let issue = record?;
        if issue.id.is_empty() {
            warn!("skipping mirror line with no id");
            continue;
        }
        if !by_id.contains_key(&issue.id) {
            order.push(issue.id.clone());
        }
        by_id.insert(issue.id.clone(), issue);
    }

    let batch_ids: HashSet<String> = by_id.keys().cloned().collect();
    let report = store.run_in_transaction_impl(&|tx| {
        let mut report = ImportReport::default();

        // Decide which issues the skip policy drops: any issue with an
        // edge whose target is in neither the batch nor the database.
        let mut dropped_ids: HashSet<String> = HashSet::new();
        if policy == OrphanPolicy::Skip {
            for id in &order {
                let issue = &by_id[id];
                for dep in &issue.dependencies {
                    if !batch_ids.contains(&dep.depends_on_id)
                        && !tx.issue_exists(&dep.depends_on_id)?
                    {
                        dropped_ids.insert(id.clone());
                        break;
                    }
                }
            }
        }

        // Phase 1: issues.
        for id in &order {
            if cancel.is_canceled() {
                return Err(StorageError::Canceled);
            }
            if dropped_ids.contains(id) {
                report.issues_skipped += 1;
                continue;
            }
            let mut issue = by_id[id].clone();
            if let Some(repo) = source_repo {
                issue.source_repo = repo.to_string();
            }
            if tx.import_issue(&issue)? {
                report.created += 1;
            } else {
                report.existing += 1;
            }
        }

        // Phase 2: dependencies (labels were carried in phase 1).
        for id in &order {
            if cancel.is_canceled() {
                return Err(StorageError::Canceled);
            }
            if dropped_ids.contains(id) {
                continue;
            }
            for dep in &by_id[id].dependencies {
                let target_known =
                    batch_ids.contains(&dep.depends_on_id) && !dropped_ids.contains(&dep.depends_on_id)
                        || tx.issue_exists(&dep.depends_on_id)?;
                if !target_known {
                    match policy {
                        OrphanPolicy::Strict => {
                            return Err(StorageError::not_found(
                                "dependency target",
                                dep.depends_on_id.clone(),
                            ));
                        }
                        // Resurrect searches the mirror for the target;
                        // the whole mirror is already in this batch, so a
                        // miss here means it exists nowhere and the edge
                        // is dropped like `allow` does.
                        _ => {
                            report.deps_dropped += 1;
                            continue;
                        }
                    }
                }
                match tx.import_dependency(dep) {
                    Ok(true) => report.deps_added += 1,
                    Ok(false) => {}
                    Err(e) if e.is_cycle() => {
                        warn!(
                            from = %dep.issue_id,
                            to = %dep.depends_on_id,
                            "dropping cycle-forming edge from mirror"
                        );
                        report.deps_dropped += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(report)
    })?;

    // Record the mirror mtime so the staleness check stays quiet until
    // the file changes again.
    if let Some(mtime) = file_mtime_ms(mirror) {
        store.set_metadata_impl(LAST_IMPORT_MTIME_KEY, &mtime.to_string())?;
    }

    info!(
        created = report.created,
        existing = report.existing,
        deps_added = report.deps_added,
        deps_dropped = report.deps_dropped,
        skipped = report.issues_skipped,
        policy = %policy,
        "imported mirror"
    );
    Ok(report)
}

/// Auto-imports the mirror when it is newer than the last recorded import.
///
/// Returns `true` when an import ran. Intended to be called before
/// servicing requests; the caller logs failures without failing the
/// triggering request.
pub fn maybe_auto_import(
    store: &SqliteStore,
    mirror: &Path,
    policy: OrphanPolicy,
    cancel: &CancelToken,
) -> Result<bool> {
    let Some(current) = file_mtime_ms(mirror) else {
        return Ok(false);
    };
    let recorded: i64 = store
        .get_metadata_impl(LAST_IMPORT_MTIME_KEY)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    if current <= recorded {
        return Ok(false);
    }

    info!(current, recorded, "mirror changed on disk, auto-importing");
    import_mirror(store, mirror, policy, None, cancel)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::export_dirty;
    use beads_core::dependency::Dependency;
    use beads_core::enums::DependencyType;
    use beads_core::issue::IssueBuilder;
    use beads_storage::PREFIX_CONFIG_KEY;

    fn test_store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set_config_impl(PREFIX_CONFIG_KEY, "bd").unwrap();
        store
    }

    fn write_mirror(dir: &Path, lines: &[&str]) -> std::path::PathBuf {
        let path = dir.join("beads.jsonl");
        std::fs::write(&path, lines.join("\n") + "\n").unwrap();
        path
    }

    #[test]
    fn import_creates_issues_labels_and_deps() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = write_mirror(
            dir.path(),
            &[
                r#"{"id":"bd-a","title":"A","priority":1,"labels":["infra"],"dependencies":[{"issue_id":"bd-a","depends_on_id":"bd-b","type":"blocks"}]}"#,
                r#"{"id":"bd-b","title":"B","priority":2}"#,
            ],
        );
        let store = test_store();

        let report =
            import_mirror(&store, &mirror, OrphanPolicy::Allow, None, &CancelToken::new())
                .unwrap();
        assert_eq!(report.created, 2);
        assert_eq!(report.deps_added, 1);

        let a = store.get_issue_impl("bd-a").unwrap();
        assert_eq!(a.title, "A");
        assert_eq!(store.get_labels_impl("bd-a").unwrap(), vec!["infra"]);
        assert_eq!(store.get_dependencies_impl("bd-a").unwrap().len(), 1);
    }

    #[test]
    fn import_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = write_mirror(dir.path(), &[r#"{"id":"bd-a","title":"A"}"#]);
        let store = test_store();
        let cancel = CancelToken::new();

        let first = import_mirror(&store, &mirror, OrphanPolicy::Allow, None, &cancel).unwrap();
        assert_eq!(first.created, 1);
        let second = import_mirror(&store, &mirror, OrphanPolicy::Allow, None, &cancel).unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.existing, 1);
    }

    #[test]
    fn last_line_per_id_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = write_mirror(
            dir.path(),
            &[
                r#"{"id":"bd-a","title":"Old title"}"#,
                r#"{"id":"bd-a","title":"New title"}"#,
            ],
        );
        let store = test_store();

        import_mirror(&store, &mirror, OrphanPolicy::Allow, None, &CancelToken::new()).unwrap();
        assert_eq!(store.get_issue_impl("bd-a").unwrap().title, "New title");
    }

    #[test]
    fn orphan_allow_drops_dangling_edge() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = write_mirror(
            dir.path(),
            &[
                r#"{"id":"bd-a","title":"A","dependencies":[{"issue_id":"bd-a","depends_on_id":"bd-ghost","type":"blocks"}]}"#,
            ],
        );
        let store = test_store();

        let report =
            import_mirror(&store, &mirror, OrphanPolicy::Allow, None, &CancelToken::new())
                .unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.deps_dropped, 1);
        assert!(store.get_dependencies_impl("bd-a").unwrap().is_empty());
    }

    #[test]
    fn orphan_strict_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = write_mirror(
            dir.path(),
            &[
                r#"{"id":"bd-a","title":"A","dependencies":[{"issue_id":"bd-a","depends_on_id":"bd-ghost","type":"blocks"}]}"#,
            ],
        );
        let store = test_store();

        let err = import_mirror(&store, &mirror, OrphanPolicy::Strict, None, &CancelToken::new())
            .unwrap_err();
        assert_eq!(err.kind(), "not-found");
    }

    #[test]
    fn orphan_skip_drops_the_issue() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = write_mirror(
            dir.path(),
            &[
                r#"{"id":"bd-good","title":"Fine"}"#,
                r#"{"id":"bd-bad","title":"Dangles","dependencies":[{"issue_id":"bd-bad","depends_on_id":"bd-ghost","type":"blocks"}]}"#,
            ],
        );
        let store = test_store();

        let report =
            import_mirror(&store, &mirror, OrphanPolicy::Skip, None, &CancelToken::new()).unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.issues_skipped, 1);
        assert!(store.get_issue_impl("bd-good").is_ok());
        assert!(store.get_issue_impl("bd-bad").unwrap_err().is_not_found());
    }

    #[test]
    fn orphan_resurrect_inserts_parent_from_mirror() {
        let dir = tempfile::tempdir().unwrap();
        // The child references a parent that only exists later in the
        // mirror; resurrect pulls it in via the same batch.
        let mirror = write_mirror(
            dir.path(),
            &[
                r#"{"id":"bd-p.1","title":"Child","dependencies":[{"issue_id":"bd-p.1","depends_on_id":"bd-p","type":"parent-child"}]}"#,
                r#"{"id":"bd-p","title":"Parent"}"#,
            ],
        );
        let store = test_store();

        let report = import_mirror(
            &store,
            &mirror,
            OrphanPolicy::Resurrect,
            None,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(report.created, 2);
        assert_eq!(report.deps_added, 1);
        assert!(store.get_issue_impl("bd-p").is_ok());
    }

    #[test]
    fn import_stamps_source_repo() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = write_mirror(dir.path(), &[r#"{"id":"bd-a","title":"A"}"#]);
        let store = test_store();

        import_mirror(
            &store,
            &mirror,
            OrphanPolicy::Allow,
            Some("../sibling"),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(store.get_issue_impl("bd-a").unwrap().source_repo, "../sibling");
    }

    #[test]
    fn export_import_roundtrip_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = dir.path().join("beads.jsonl");
        let store = test_store();
        let cancel = CancelToken::new();

        for id in ["bd-1", "bd-2", "bd-3"] {
            let issue = IssueBuilder::new(format!("Issue {id}")).id(id).build();
            store.create_issue_impl(&issue, "alice").unwrap();
        }
        store
            .add_dependency_impl(
                &Dependency::new("bd-1", "bd-2", DependencyType::Blocks, "alice"),
                "alice",
            )
            .unwrap();
        store
            .add_dependency_impl(
                &Dependency::new("bd-2", "bd-3", DependencyType::ParentChild, "alice"),
                "alice",
            )
            .unwrap();
        store.add_label_impl("bd-1", "core", "alice").unwrap();

        export_dirty(&store, &mirror, &cancel).unwrap();

        // Delete everything, then restore from the mirror.
        store
            .delete_issues_impl(
                &["bd-1".into(), "bd-2".into(), "bd-3".into()],
                true,
                true,
                false,
            )
            .unwrap();
        assert!(store.get_issue_impl("bd-1").unwrap_err().is_not_found());

        let report =
            import_mirror(&store, &mirror, OrphanPolicy::Allow, None, &cancel).unwrap();
        assert_eq!(report.created, 3);
        assert_eq!(report.deps_added, 2);
        assert_eq!(store.get_labels_impl("bd-1").unwrap(), vec!["core"]);
        assert_eq!(store.get_dependencies_impl("bd-1").unwrap().len(), 1);

        // Restored state matches the mirror: a second export is a no-op.
        let report = export_dirty(&store, &mirror, &cancel).unwrap();
        assert_eq!(report.written, 0);
    }

    #[test]
    fn auto_import_only_when_newer() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = write_mirror(dir.path(), &[r#"{"id":"bd-a","title":"A"}"#]);
        let store = test_store();
        let cancel = CancelToken::new();

        assert!(maybe_auto_import(&store, &mirror, OrphanPolicy::Allow, &cancel).unwrap());
        // Unchanged file: no second import.
        assert!(!maybe_auto_import(&store, &mirror, OrphanPolicy::Allow, &cancel).unwrap());

        // Touch the file into the future.
        let future = std::time::SystemTime::now() + std::time::Duration::from_secs(5);
        let file = std::fs::OpenOptions::new().append(true).open(&mirror).unwrap();
        file.set_times(std::fs::FileTimes::new().set_modified(future))
            .unwrap();
        assert!(maybe_auto_import(&store, &mirror, OrphanPolicy::Allow, &cancel).unwrap());
    }

    #[test]
    fn missing_mirror_is_empty_import() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store();
        let report = import_mirror(
            &store,
            &dir.path().join("absent.jsonl"),
            OrphanPolicy::Allow,
            None,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(report, ImportReport::default());
    }
}
