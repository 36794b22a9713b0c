//! Multi-workspace hydration.
//!
//! When a workspace's metadata names source workspaces, opening the
//! database pulls their mirrors into the host store. Each source's mirror
//! mtime is recorded; unchanged sources are skipped on the next open.
//! Imported issues carry the source in `source_repo`; the host is
//! read-through for them and writes only its own tables.

use std::path::Path;

use tracing::{info, warn};

use beads_config::Metadata;
use beads_core::cancel::CancelToken;
use beads_storage::SqliteStore;

use crate::import::{OrphanPolicy, import_mirror};
use crate::{Result, file_mtime_ms};

/// Hydrates the host store from each source workspace named in the
/// metadata document. Returns the number of sources actually imported.
pub fn hydrate_from_sources(
    store: &SqliteStore,
    state_dir: &Path,
    meta: &Metadata,
    cancel: &CancelToken,
) -> Result<usize> {
    let mut imported = 0;

    for source in &meta.sources {
        let source_dir = if Path::new(source).is_absolute() {
            Path::new(source).to_path_buf()
        } else {
            state_dir.join(source)
        };

        let mirror = match beads_config::resolve_mirror(&source_dir) {
            Ok(m) => m,
            Err(e) => {
                warn!(source, error = %e, "skipping unreadable hydration source");
                continue;
            }
        };

        let Some(current) = file_mtime_ms(&mirror) else {
            warn!(source, "hydration source has no mirror, skipping");
            continue;
        };
        let recorded = store.get_repo_mtime_impl(source)?.unwrap_or(0);
        if current <= recorded {
            continue;
        }

        info!(source, "hydrating from source workspace");
        import_mirror(store, &mirror, OrphanPolicy::Allow, Some(source), cancel)?;
        store.set_repo_mtime_impl(source, current)?;
        imported += 1;
    }

    Ok(imported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use beads_storage::PREFIX_CONFIG_KEY;

    fn host_store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store.set_config_impl(PREFIX_CONFIG_KEY, "bd").unwrap();
        store
    }

    fn make_source(root: &Path, name: &str, lines: &[&str]) -> String {
        let state = root.join(name).join(".beads");
        std::fs::create_dir_all(&state).unwrap();
        std::fs::write(state.join("beads.jsonl"), lines.join("\n") + "\n").unwrap();
        state.display().to_string()
    }

    #[test]
    fn hydrates_and_stamps_source_repo() {
        let root = tempfile::tempdir().unwrap();
        let source = make_source(
            root.path(),
            "sibling",
            &[r#"{"id":"sib-1","title":"From sibling"}"#],
        );
        let store = host_store();
        let meta = Metadata {
            sources: vec![source.clone()],
            ..Default::default()
        };

        let imported =
            hydrate_from_sources(&store, root.path(), &meta, &CancelToken::new()).unwrap();
        assert_eq!(imported, 1);

        let issue = store.get_issue_impl("sib-1").unwrap();
        assert_eq!(issue.source_repo, source);
    }

    #[test]
    fn unchanged_sources_are_skipped() {
        let root = tempfile::tempdir().unwrap();
        let source = make_source(root.path(), "sibling", &[r#"{"id":"sib-1","title":"X"}"#]);
        let store = host_store();
        let meta = Metadata {
            sources: vec![source],
            ..Default::default()
        };
        let cancel = CancelToken::new();

        assert_eq!(
            hydrate_from_sources(&store, root.path(), &meta, &cancel).unwrap(),
            1
        );
        // Mirror untouched: nothing to do.
        assert_eq!(
            hydrate_from_sources(&store, root.path(), &meta, &cancel).unwrap(),
            0
        );
    }

    #[test]
    fn missing_source_is_tolerated() {
        let root = tempfile::tempdir().unwrap();
        let store = host_store();
        let meta = Metadata {
            sources: vec!["nowhere/.beads".into()],
            ..Default::default()
        };

        let imported =
            hydrate_from_sources(&store, root.path(), &meta, &CancelToken::new()).unwrap();
        assert_eq!(imported, 0);
    }
}
