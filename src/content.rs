//! `ContentSnapshot`: a file's observed content and type, with no notion of
//! where it lives — that's layered on by [`crate::tree::NormalizedFileSnapshot`].

use serde_derive::{Deserialize, Serialize};

use crate::hashing::ContentHash;

/// A fixed signature hash for "this path is a directory". Every directory
/// gets the same content snapshot, so aggregate tree hashes are well-defined
/// even for shapes with no file content at all (§3: "a fixed signature hash,
/// a constant derived once").
fn directory_signature() -> ContentHash {
    ContentHash::of_bytes(b"taskstow:directory-signature:v1")
}

/// A file's observed content and type: a regular file (identified by the
/// hash of its bytes), a directory (all directories compare equal), or an
/// absent path.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum ContentSnapshot {
    RegularFile { hash: ContentHash },
    Directory,
    Missing,
}

impl ContentSnapshot {
    pub fn directory() -> Self {
        ContentSnapshot::Directory
    }

    pub fn missing() -> Self {
        ContentSnapshot::Missing
    }

    pub fn regular_file(hash: ContentHash) -> Self {
        ContentSnapshot::RegularFile { hash }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, ContentSnapshot::Missing)
    }

    /// The hash this snapshot contributes to an aggregate tree hash: the
    /// file's own hash for regular files, the shared directory signature
    /// for directories, and a dedicated constant for missing entries (so a
    /// tree containing only missing entries still hashes deterministically
    /// and distinctly from an empty tree).
    pub fn content_hash(&self) -> ContentHash {
        match self {
            ContentSnapshot::RegularFile { hash } => *hash,
            ContentSnapshot::Directory => directory_signature(),
            ContentSnapshot::Missing => ContentHash::of_bytes(b"taskstow:missing-signature:v1"),
        }
    }

    /// §4.A: true iff both are the same variant and, for regular files,
    /// their hashes match.
    pub fn is_content_up_to_date(&self, other: &ContentSnapshot) -> bool {
        match (self, other) {
            (ContentSnapshot::RegularFile { hash: a }, ContentSnapshot::RegularFile { hash: b }) => {
                a == b
            }
            (ContentSnapshot::Directory, ContentSnapshot::Directory) => true,
            (ContentSnapshot::Missing, ContentSnapshot::Missing) => true,
            _ => false,
        }
    }
}
