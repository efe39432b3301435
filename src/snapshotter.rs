//! A concrete [`FileTreeSnapshotter`] that walks a real directory tree.
//!
//! §6 only specifies the contract an engine consumer must satisfy
//! (`FileTreeSnapshotter(files, pathNormalization, normalizationStrategy) ->
//! FileTreeSnapshot`); this module supplies a real implementation so the
//! engine is exercisable end-to-end, the way the teacher's own
//! `fs_tree::forest_from_fs` walks a filesystem to build a `Tree`.

use std::fs;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::trace;

use crate::content::ContentSnapshot;
use crate::hashing::{ContentHash, HashingReader};
use crate::tree::{CompareStrategy, FileTreeSnapshot, NormalizedFileSnapshot, PathNormalization};

/// Consumed by the engine to turn a set of declared roots into a
/// [`FileTreeSnapshot`]. Must be deterministic given identical filesystem
/// state and arguments (§6).
pub trait FileTreeSnapshotter {
    fn snapshot(
        &self,
        roots: &[Utf8PathBuf],
        normalization: PathNormalization,
        compare_strategy: CompareStrategy,
    ) -> Result<FileTreeSnapshot>;
}

/// Walks each root with `walkdir`, hashing regular files and recording
/// directories and (if a root itself doesn't exist) a single `Missing`
/// entry for that root.
pub struct FilesystemSnapshotter;

impl FileTreeSnapshotter for FilesystemSnapshotter {
    fn snapshot(
        &self,
        roots: &[Utf8PathBuf],
        normalization: PathNormalization,
        compare_strategy: CompareStrategy,
    ) -> Result<FileTreeSnapshot> {
        let mut entries = Vec::new();
        for root in roots {
            walk_root(root, normalization, &mut entries)?;
        }
        Ok(FileTreeSnapshot::from_entries(compare_strategy, entries))
    }
}

/// Walks a single declared root, the way `fs_tree::forest_from_fs` walks a
/// single path: if it's missing, emit one `Missing` entry; otherwise walk
/// every entry beneath it (including the root itself when it's a plain
/// file).
fn walk_root(
    root: &Utf8Path,
    normalization: PathNormalization,
    out: &mut Vec<NormalizedFileSnapshot>,
) -> Result<()> {
    if fs::symlink_metadata(root).is_err() {
        trace!("{root} doesn't exist, recording as missing");
        out.push(NormalizedFileSnapshot::new(
            normalization.normalize(root, root),
            root.to_owned(),
            ContentSnapshot::missing(),
            None,
        ));
        return Ok(());
    }

    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed walking {root}"))?;
        let path = Utf8Path::from_path(entry.path())
            .with_context(|| format!("{} isn't valid UTF-8", entry.path().display()))?;
        let meta = entry
            .metadata()
            .with_context(|| format!("Couldn't stat {path}"))?;

        let (content, last_modified) = if meta.is_dir() {
            (ContentSnapshot::directory(), None)
        } else {
            let mut reader =
                HashingReader::new(fs::File::open(path).with_context(|| format!("Couldn't open {path}"))?);
            std::io::copy(&mut reader, &mut std::io::sink())
                .with_context(|| format!("Couldn't read {path}"))?;
            let (hash, _): (ContentHash, _) = reader.finalize();
            let modified = meta
                .modified()
                .ok()
                .and_then(|t| jiff::Timestamp::try_from(t).ok());
            (ContentSnapshot::regular_file(hash), modified)
        };

        out.push(NormalizedFileSnapshot::new(
            normalization.normalize(path, root),
            path.to_owned(),
            content,
            last_modified,
        ));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_root_yields_one_missing_entry() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let missing = Utf8Path::from_path(dir.path()).unwrap().join("nope");
        let snap = FilesystemSnapshotter.snapshot(
            &[missing.clone()],
            PathNormalization::Absolute,
            CompareStrategy::Unordered,
        )?;
        assert_eq!(snap.len(), 1);
        assert!(snap.get(&missing).unwrap().content.is_missing());
        Ok(())
    }

    #[test]
    fn snapshot_is_deterministic() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = Utf8Path::from_path(dir.path()).unwrap().to_owned();
        fs::write(root.join("a"), b"hello")?;
        fs::create_dir(root.join("sub"))?;
        fs::write(root.join("sub/b"), b"world")?;

        let snapshotter = FilesystemSnapshotter;
        let first = snapshotter.snapshot(
            &[root.clone()],
            PathNormalization::RelativeToRoot,
            CompareStrategy::Unordered,
        )?;
        let second = snapshotter.snapshot(
            &[root],
            PathNormalization::RelativeToRoot,
            CompareStrategy::Unordered,
        )?;
        assert_eq!(first, second);
        assert_eq!(first.hash(), second.hash());
        Ok(())
    }
}
