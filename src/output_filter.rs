//! The output filter (§4.G) — the hard algorithm. Invoked only when
//! [`crate::overlap::detect_overlapping_outputs`] found something; picks out
//! the subset of `after_execution` this task is allowed to claim.

use crate::tree::{CompareStrategy, FileTreeSnapshot};

/// Filters `after_execution` down to the entries this task actually owns,
/// given the previous run's after-execution tree for the same property
/// (`after_previous`, which may be `None` — "no overlap possible here") and
/// this run's before-execution tree (`before_execution`).
///
/// Implements §4.G's six-step classification per entry:
/// 1. `Missing` entries are always dropped.
/// 2. Entries absent from `before_execution` were created during this run — kept.
/// 3. Entries present but not content-and-metadata up to date were modified
///    during this run — kept.
/// 4. Entries unchanged from before-execution but present in
///    `after_previous` were previously owned by this task — kept.
/// 5. Everything else belongs to whoever created it outside this task —
///    dropped.
///
/// §4.G's fast path: if every entry of `after_execution` survives, the same
/// tree is returned (no new allocation, no new `assignable_to_outputs`
/// flag flip) so callers can tell by pointer/value equality that nothing
/// was filtered.
pub fn filter_outputs(
    after_previous: Option<&FileTreeSnapshot>,
    before_execution: &FileTreeSnapshot,
    after_execution: &FileTreeSnapshot,
) -> FileTreeSnapshot {
    let mut kept = Vec::with_capacity(after_execution.len());
    for (path, snap_after) in after_execution.snapshots() {
        if snap_after.content.is_missing() {
            continue;
        }

        let snap_before = before_execution.get(path);
        let keep = match snap_before {
            None => true, // created during execution
            Some(snap_before) => {
                if !snap_after.is_content_and_metadata_up_to_date(snap_before) {
                    true // modified during execution
                } else {
                    // Unchanged this run: keep only if we owned it last time.
                    after_previous.is_some_and(|tree| tree.contains(path))
                }
            }
        };

        if keep {
            kept.push(snap_after.clone());
        }
    }

    if kept.len() == after_execution.len() {
        return after_execution.clone();
    }

    let mut filtered = FileTreeSnapshot::from_entries(CompareStrategy::Unordered, kept);
    filtered.set_assignable_to_outputs(true);
    filtered
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::content::ContentSnapshot;
    use crate::hashing::ContentHash;
    use crate::tree::NormalizedFileSnapshot;
    use camino::Utf8PathBuf;

    fn file(path: &str, hash: &[u8]) -> NormalizedFileSnapshot {
        NormalizedFileSnapshot::new(
            Utf8PathBuf::from(path),
            Utf8PathBuf::from(path),
            ContentSnapshot::regular_file(ContentHash::of_bytes(hash)),
            None,
        )
    }

    fn missing(path: &str) -> NormalizedFileSnapshot {
        NormalizedFileSnapshot::new(
            Utf8PathBuf::from(path),
            Utf8PathBuf::from(path),
            ContentSnapshot::missing(),
            None,
        )
    }

    #[test]
    fn s3_overlap_with_unchanged_foreign_file() {
        // before_execution.out = {o: X, o2: Y}; after_previous.out = {o: X}
        let before = FileTreeSnapshot::from_entries(
            CompareStrategy::Unordered,
            [file("out/o", b"X"), file("out/o2", b"Y")],
        );
        let after_previous =
            FileTreeSnapshot::from_entries(CompareStrategy::Unordered, [file("out/o", b"X")]);
        // T rewrites o with the same content and doesn't touch o2.
        let after = FileTreeSnapshot::from_entries(
            CompareStrategy::Unordered,
            [file("out/o", b"X"), file("out/o2", b"Y")],
        );

        let filtered = filter_outputs(Some(&after_previous), &before, &after);
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains(&Utf8PathBuf::from("out/o")));
        assert!(!filtered.contains(&Utf8PathBuf::from("out/o2")));
    }

    #[test]
    fn s4_overlap_with_modified_foreign_file() {
        let before = FileTreeSnapshot::from_entries(
            CompareStrategy::Unordered,
            [file("out/o", b"X"), file("out/o2", b"Y")],
        );
        let after_previous =
            FileTreeSnapshot::from_entries(CompareStrategy::Unordered, [file("out/o", b"X")]);
        // T modifies o to X2, still doesn't touch o2.
        let after = FileTreeSnapshot::from_entries(
            CompareStrategy::Unordered,
            [file("out/o", b"X2"), file("out/o2", b"Y")],
        );

        let filtered = filter_outputs(Some(&after_previous), &before, &after);
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains(&Utf8PathBuf::from("out/o")));
    }

    #[test]
    fn s5_missing_entries_are_always_dropped() {
        let before = FileTreeSnapshot::empty(CompareStrategy::Unordered);
        let after = FileTreeSnapshot::from_entries(CompareStrategy::Unordered, [missing("out/o")]);
        let filtered = filter_outputs(None, &before, &after);
        assert!(filtered.is_empty());
    }

    #[test]
    fn fast_path_returns_same_tree_when_nothing_is_dropped() {
        let before = FileTreeSnapshot::empty(CompareStrategy::Unordered);
        let after =
            FileTreeSnapshot::from_entries(CompareStrategy::Unordered, [file("out/o", b"X")]);
        let filtered = filter_outputs(None, &before, &after);
        assert_eq!(filtered, after);
    }

    #[test]
    fn created_during_execution_is_kept_even_with_no_overlap_history() {
        let before = FileTreeSnapshot::empty(CompareStrategy::Unordered);
        let after =
            FileTreeSnapshot::from_entries(CompareStrategy::Unordered, [file("out/o", b"X")]);
        let filtered = filter_outputs(None, &before, &after);
        assert_eq!(filtered.len(), 1);
    }

    #[test]
    fn foreign_untouched_entry_with_no_after_previous_tree_is_dropped() {
        // after_previous is None for this property entirely: "no overlap
        // possible" per the spec's resolved open question, but filtering
        // still only keeps entries this task created/modified/owned.
        let before = FileTreeSnapshot::from_entries(
            CompareStrategy::Unordered,
            [file("out/o", b"X"), file("out/o2", b"Y")],
        );
        let after = FileTreeSnapshot::from_entries(
            CompareStrategy::Unordered,
            [file("out/o", b"X"), file("out/o2", b"Y")],
        );
        let filtered = filter_outputs(None, &before, &after);
        assert!(filtered.is_empty());
    }
}
