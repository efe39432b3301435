//! The overlapping-outputs detector (§4.F): finds the first path where a
//! task's declared output area contains something it didn't put there.

use camino::Utf8PathBuf;
use serde_derive::{Deserialize, Serialize};

use crate::tree::FileTreeSnapshot;

/// The first output entry found to be "foreign" — present before this run's
/// task body executed, but not attributable to this task's own previous
/// run. Its presence changes output-filtering behavior for the run (§4.G).
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct OverlappingOutputs {
    pub property_name: String,
    pub absolute_path: Utf8PathBuf,
}

/// Per output property, the previous execution's after-execution snapshot.
///
/// The outer `None` means "no entry at all for this property in the
/// previous record — no overlap is possible there"; `Some(tree)` with an
/// empty tree means "this task claimed nothing here last time, so every
/// before-execution entry in this run is foreign". These two cases are
/// deliberately distinct — see `SPEC_FULL.md`'s resolved open question.
pub type AfterPreviousByProperty<'a> = Vec<(&'a str, Option<&'a FileTreeSnapshot>)>;

/// §4.F: given each output property's before-execution tree for this run
/// and the previous record's after-execution tree for the same property,
/// find the first property (in the order given) containing an entry that
/// is present in `before_execution` but either absent from `after_previous`
/// or present there with different content — and is not itself `Missing`.
///
/// Properties (and entries within a property) are scanned in the order
/// `before_execution` and `after_previous` are given in, matching §4.F's
/// "first such entry in iteration order".
pub fn detect_overlapping_outputs(
    before_execution: &[(&str, &FileTreeSnapshot)],
    after_previous: &AfterPreviousByProperty,
) -> Option<OverlappingOutputs> {
    for (property_name, before_tree) in before_execution {
        let after_previous_tree = after_previous
            .iter()
            .find(|(name, _)| name == property_name)
            .and_then(|(_, tree)| *tree);

        for (path, entry) in before_tree.snapshots() {
            if entry.content.is_missing() {
                continue;
            }
            let foreign = match after_previous_tree {
                // No entry at all for this property last time: every
                // current entry here is foreign.
                None => true,
                Some(previous_tree) => match previous_tree.get(path) {
                    None => true,
                    Some(previous_entry) => !entry.is_content_up_to_date(previous_entry),
                },
            };
            if foreign {
                return Some(OverlappingOutputs {
                    property_name: (*property_name).to_owned(),
                    absolute_path: path.clone(),
                });
            }
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::content::ContentSnapshot;
    use crate::hashing::ContentHash;
    use crate::tree::{CompareStrategy, NormalizedFileSnapshot};

    fn snap(path: &str, hash: &[u8]) -> NormalizedFileSnapshot {
        NormalizedFileSnapshot::new(
            Utf8PathBuf::from(path),
            Utf8PathBuf::from(path),
            ContentSnapshot::regular_file(ContentHash::of_bytes(hash)),
            None,
        )
    }

    #[test]
    fn no_entry_for_property_means_no_overlap_possible() {
        let before =
            FileTreeSnapshot::from_entries(CompareStrategy::Unordered, [snap("out/o", b"X")]);
        let result = detect_overlapping_outputs(&[("out", &before)], &vec![("out", None)]);
        assert_eq!(result, None);
    }

    #[test]
    fn empty_after_previous_means_everything_is_foreign() {
        let before =
            FileTreeSnapshot::from_entries(CompareStrategy::Unordered, [snap("out/o", b"X")]);
        let empty = FileTreeSnapshot::empty(CompareStrategy::Unordered);
        let result =
            detect_overlapping_outputs(&[("out", &before)], &vec![("out", Some(&empty))]);
        assert_eq!(
            result,
            Some(OverlappingOutputs {
                property_name: "out".to_owned(),
                absolute_path: Utf8PathBuf::from("out/o"),
            })
        );
    }

    #[test]
    fn matching_previous_entry_is_not_overlap() {
        let before =
            FileTreeSnapshot::from_entries(CompareStrategy::Unordered, [snap("out/o", b"X")]);
        let previous =
            FileTreeSnapshot::from_entries(CompareStrategy::Unordered, [snap("out/o", b"X")]);
        let result =
            detect_overlapping_outputs(&[("out", &before)], &vec![("out", Some(&previous))]);
        assert_eq!(result, None);
    }

    #[test]
    fn missing_entries_never_trigger_overlap() {
        let before = FileTreeSnapshot::from_entries(
            CompareStrategy::Unordered,
            [NormalizedFileSnapshot::new(
                Utf8PathBuf::from("out/o"),
                Utf8PathBuf::from("out/o"),
                ContentSnapshot::missing(),
                None,
            )],
        );
        let empty = FileTreeSnapshot::empty(CompareStrategy::Unordered);
        let result =
            detect_overlapping_outputs(&[("out", &before)], &vec![("out", Some(&empty))]);
        assert_eq!(result, None);
    }
}
