//! Crash-safe file writes.

use std::io::Write;
use std::path::Path;

use crate::Result;

/// Writes `contents` to `path` via a same-directory temp file + rename.
///
/// The temp file lives next to the target so the rename never crosses a
/// filesystem boundary.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.jsonl");

        write_atomic(&target, b"first\n").unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "first\n");

        write_atomic(&target, b"second\n").unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "second\n");

        // No temp litter left behind.
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
