//! Normalized file snapshots and file-tree snapshots: the comparable,
//! hashable, diffable shape that an input or output property's file state
//! reduces to.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use serde_derive::{Deserialize, Serialize};

use crate::content::ContentSnapshot;
use crate::hashing::ContentHash;

/// How an absolute path is reduced to the key the comparator treats as
/// identity (§3: "the normalized path is what the comparator treats as
/// identity; the absolute path is retained only for diagnostics").
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum PathNormalization {
    /// Compare by the full absolute path.
    Absolute,
    /// Compare by the path relative to a declared root.
    RelativeToRoot,
    /// Compare by file name only, ignoring directory structure.
    NameOnly,
    /// Don't normalize at all — every entry compares equal on path,
    /// distinguished only by content (used for single-file properties).
    None,
}

impl PathNormalization {
    pub fn normalize(&self, absolute_path: &Utf8Path, root: &Utf8Path) -> Utf8PathBuf {
        match self {
            PathNormalization::Absolute => absolute_path.to_owned(),
            PathNormalization::RelativeToRoot => absolute_path
                .strip_prefix(root)
                .map(Utf8Path::to_owned)
                .unwrap_or_else(|_| absolute_path.to_owned()),
            PathNormalization::NameOnly => absolute_path
                .file_name()
                .map(Utf8PathBuf::from)
                .unwrap_or_else(|| absolute_path.to_owned()),
            PathNormalization::None => Utf8PathBuf::new(),
        }
    }
}

/// A single entry of a [`FileTreeSnapshot`]: a content snapshot paired with
/// the normalized path used for comparison, plus bookkeeping retained only
/// for diagnostics and replay.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct NormalizedFileSnapshot {
    pub normalized_path: Utf8PathBuf,
    pub absolute_path: Utf8PathBuf,
    pub content: ContentSnapshot,
    /// Last-modified time, when available, used only by
    /// [`NormalizedFileSnapshot::is_content_and_metadata_up_to_date`].
    #[serde(with = "crate::prettify::timestamp_option")]
    pub last_modified: Option<jiff::Timestamp>,
}

impl NormalizedFileSnapshot {
    pub fn new(
        normalized_path: Utf8PathBuf,
        absolute_path: Utf8PathBuf,
        content: ContentSnapshot,
        last_modified: Option<jiff::Timestamp>,
    ) -> Self {
        Self {
            normalized_path,
            absolute_path,
            content,
            last_modified,
        }
    }

    /// §4.A/B: true iff the content snapshots agree (variant, and hash for
    /// regular files).
    pub fn is_content_up_to_date(&self, other: &NormalizedFileSnapshot) -> bool {
        self.content.is_content_up_to_date(&other.content)
    }

    /// §4.A/B's stricter form: additionally requires last-modified to
    /// match for regular files. Directories and missing entries behave
    /// exactly as the content-only form.
    pub fn is_content_and_metadata_up_to_date(&self, other: &NormalizedFileSnapshot) -> bool {
        if !self.is_content_up_to_date(other) {
            return false;
        }
        match self.content {
            ContentSnapshot::RegularFile { .. } => self.last_modified == other.last_modified,
            ContentSnapshot::Directory | ContentSnapshot::Missing => true,
        }
    }
}

/// Whether a [`FileTreeSnapshot`]'s entries are compared (and diffed) by
/// position or by normalized path (§3, §4.C).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum CompareStrategy {
    Ordered,
    Unordered,
}

/// A snapshot of a property's declared file tree: every observed path
/// beneath it, each reduced to a [`NormalizedFileSnapshot`].
///
/// Entries are always stored keyed by absolute path, in insertion order;
/// `compare_strategy` governs whether equality, hashing, and serialization
/// treat that order as significant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTreeSnapshot {
    entries: BTreeMap<Utf8PathBuf, NormalizedFileSnapshot>,
    insertion_order: Vec<Utf8PathBuf>,
    compare_strategy: CompareStrategy,
    assignable_to_outputs: bool,
}

impl FileTreeSnapshot {
    pub fn empty(compare_strategy: CompareStrategy) -> Self {
        Self {
            entries: BTreeMap::new(),
            insertion_order: Vec::new(),
            compare_strategy,
            assignable_to_outputs: true,
        }
    }

    /// Builds a snapshot from entries in discovery order. Duplicate
    /// absolute paths are a caller bug; the later one wins, matching the
    /// way a real tree walk would simply never produce duplicates.
    pub fn from_entries(
        compare_strategy: CompareStrategy,
        entries: impl IntoIterator<Item = NormalizedFileSnapshot>,
    ) -> Self {
        let mut map = BTreeMap::new();
        let mut order = Vec::new();
        for entry in entries {
            let path = entry.absolute_path.clone();
            if map.insert(path.clone(), entry).is_none() {
                order.push(path);
            }
        }
        Self {
            entries: map,
            insertion_order: order,
            compare_strategy,
            assignable_to_outputs: true,
        }
    }

    pub fn compare_strategy(&self) -> CompareStrategy {
        self.compare_strategy
    }

    pub fn assignable_to_outputs(&self) -> bool {
        self.assignable_to_outputs
    }

    pub fn set_assignable_to_outputs(&mut self, value: bool) {
        self.assignable_to_outputs = value;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, absolute_path: &Utf8Path) -> Option<&NormalizedFileSnapshot> {
        self.entries.get(absolute_path)
    }

    pub fn contains(&self, absolute_path: &Utf8Path) -> bool {
        self.entries.contains_key(absolute_path)
    }

    /// §4.C: "snapshots() → map as stored".
    pub fn snapshots(&self) -> &BTreeMap<Utf8PathBuf, NormalizedFileSnapshot> {
        &self.entries
    }

    /// §4.C: "elements() → ordered list of absolute paths (used to replay
    /// discovered-input sets)".
    pub fn elements(&self) -> Vec<Utf8PathBuf> {
        self.ordered_entries()
            .into_iter()
            .map(|e| e.absolute_path.clone())
            .collect()
    }

    /// Entries in the order implied by `compare_strategy`: insertion order
    /// when `Ordered`, path-sorted when `Unordered` (`BTreeMap`'s own
    /// iteration order already gives us that).
    fn ordered_entries(&self) -> Vec<&NormalizedFileSnapshot> {
        match self.compare_strategy {
            CompareStrategy::Ordered => self
                .insertion_order
                .iter()
                .map(|p| self.entries.get(p).expect("insertion_order/entries out of sync"))
                .collect(),
            CompareStrategy::Unordered => self.entries.values().collect(),
        }
    }

    /// §4.C: aggregate hash over the strategy tag then entries in the
    /// order implied by the strategy, each contributing normalized path +
    /// content hash.
    pub fn hash(&self) -> ContentHash {
        let mut builder = ContentHash::builder();
        let tag: u8 = match self.compare_strategy {
            CompareStrategy::Ordered => 0,
            CompareStrategy::Unordered => 1,
        };
        builder.update(&[tag]);
        for entry in self.ordered_entries() {
            builder.update(entry.normalized_path.as_str().as_bytes());
            builder.update(&[0u8]); // separator, so "ab"+"c" != "a"+"bc"
            builder.update(entry.content.content_hash().to_string().as_bytes());
        }
        builder.finish()
    }

    /// §4.C `diff`: compares `self` (the "after" state) against `previous`
    /// (the "before" state).
    ///
    /// For `Unordered` trees, entries are matched by absolute path (the map
    /// key); for `Ordered` trees, the comparison is strictly positional —
    /// see `SPEC_FULL.md`'s note on diff identity.
    pub fn diff(&self, previous: &FileTreeSnapshot) -> Vec<TreeChange> {
        match self.compare_strategy {
            CompareStrategy::Unordered => self.diff_unordered(previous),
            CompareStrategy::Ordered => self.diff_ordered(previous),
        }
    }

    fn diff_unordered(&self, previous: &FileTreeSnapshot) -> Vec<TreeChange> {
        let mut changes = Vec::new();
        let all_paths: std::collections::BTreeSet<&Utf8PathBuf> =
            self.entries.keys().chain(previous.entries.keys()).collect();
        for path in all_paths {
            match (previous.entries.get(path), self.entries.get(path)) {
                (None, Some(after)) => changes.push(TreeChange::Added {
                    path: path.clone(),
                    after: after.clone(),
                }),
                (Some(before), None) => changes.push(TreeChange::Removed {
                    path: path.clone(),
                    before: before.clone(),
                }),
                (Some(before), Some(after)) => {
                    if !before.is_content_up_to_date(after) {
                        changes.push(TreeChange::Modified {
                            path: path.clone(),
                            before: before.clone(),
                            after: after.clone(),
                        });
                    }
                }
                (None, None) => unreachable!(),
            }
        }
        changes
    }

    fn diff_ordered(&self, previous: &FileTreeSnapshot) -> Vec<TreeChange> {
        let before_entries = previous.ordered_entries();
        let after_entries = self.ordered_entries();
        let mut changes = Vec::new();
        let max_len = before_entries.len().max(after_entries.len());
        for i in 0..max_len {
            match (before_entries.get(i), after_entries.get(i)) {
                (None, Some(after)) => changes.push(TreeChange::Added {
                    path: after.absolute_path.clone(),
                    after: (*after).clone(),
                }),
                (Some(before), None) => changes.push(TreeChange::Removed {
                    path: before.absolute_path.clone(),
                    before: (*before).clone(),
                }),
                (Some(before), Some(after)) => {
                    if !before.is_content_up_to_date(after) {
                        changes.push(TreeChange::Modified {
                            path: after.absolute_path.clone(),
                            before: (*before).clone(),
                            after: (*after).clone(),
                        });
                    }
                }
                (None, None) => unreachable!(),
            }
        }
        changes
    }
}

impl PartialEq for FileTreeSnapshot {
    fn eq(&self, other: &Self) -> bool {
        if self.compare_strategy != other.compare_strategy {
            return false;
        }
        match self.compare_strategy {
            CompareStrategy::Unordered => self.entries == other.entries,
            CompareStrategy::Ordered => self.ordered_entries() == other.ordered_entries(),
        }
    }
}

impl Eq for FileTreeSnapshot {}

/// A single difference between two [`FileTreeSnapshot`]s, as produced by
/// [`FileTreeSnapshot::diff`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TreeChange {
    Added {
        path: Utf8PathBuf,
        after: NormalizedFileSnapshot,
    },
    Removed {
        path: Utf8PathBuf,
        before: NormalizedFileSnapshot,
    },
    Modified {
        path: Utf8PathBuf,
        before: NormalizedFileSnapshot,
        after: NormalizedFileSnapshot,
    },
}

#[cfg(test)]
mod test {
    use super::*;

    fn snap(path: &str, hash: &[u8]) -> NormalizedFileSnapshot {
        NormalizedFileSnapshot::new(
            Utf8PathBuf::from(path),
            Utf8PathBuf::from(path),
            ContentSnapshot::regular_file(ContentHash::of_bytes(hash)),
            None,
        )
    }

    #[test]
    fn empty_tree_hash_is_stable() {
        let a = FileTreeSnapshot::empty(CompareStrategy::Unordered);
        let b = FileTreeSnapshot::empty(CompareStrategy::Unordered);
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a, b);
    }

    #[test]
    fn unordered_equality_ignores_insertion_order() {
        let a = FileTreeSnapshot::from_entries(
            CompareStrategy::Unordered,
            [snap("a", b"1"), snap("b", b"2")],
        );
        let b = FileTreeSnapshot::from_entries(
            CompareStrategy::Unordered,
            [snap("b", b"2"), snap("a", b"1")],
        );
        assert_eq!(a, b);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn ordered_equality_cares_about_order() {
        let a = FileTreeSnapshot::from_entries(
            CompareStrategy::Ordered,
            [snap("a", b"1"), snap("b", b"2")],
        );
        let b = FileTreeSnapshot::from_entries(
            CompareStrategy::Ordered,
            [snap("b", b"2"), snap("a", b"1")],
        );
        assert_ne!(a, b);
    }

    #[test]
    fn diff_unordered_reports_added_removed_modified() {
        let before = FileTreeSnapshot::from_entries(
            CompareStrategy::Unordered,
            [snap("a", b"1"), snap("b", b"2")],
        );
        let after = FileTreeSnapshot::from_entries(
            CompareStrategy::Unordered,
            [snap("a", b"1-changed"), snap("c", b"3")],
        );
        let mut changes = after.diff(&before);
        changes.sort_by_key(|c| match c {
            TreeChange::Added { path, .. }
            | TreeChange::Removed { path, .. }
            | TreeChange::Modified { path, .. } => path.clone(),
        });
        assert_eq!(changes.len(), 3);
        assert!(matches!(changes[0], TreeChange::Modified { .. })); // a
        assert!(matches!(changes[1], TreeChange::Removed { .. })); // b
        assert!(matches!(changes[2], TreeChange::Added { .. })); // c
    }

    #[test]
    fn diff_with_no_changes_is_empty() {
        let tree =
            FileTreeSnapshot::from_entries(CompareStrategy::Unordered, [snap("a", b"1")]);
        assert!(tree.diff(&tree).is_empty());
    }
}
