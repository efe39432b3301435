//! `ImplementationSnapshot`: identifies the code that ran a task (§4.E).

use serde_derive::{Deserialize, Serialize};

use crate::hashing::ContentHash;

/// A fingerprint of "what code ran": the implementing type's name, plus a
/// hash of its classloader hierarchy, supplied by an external
/// `ClassloaderHierarchyHasher` collaborator (§6). Two are equal iff both
/// components are.
///
/// The field name `classloader_hash` is kept verbatim from the originating
/// model even though this engine has no classloaders of its own — it's the
/// stable fingerprint of "which build of the implementing code", however the
/// embedding tool chooses to compute that.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ImplementationSnapshot {
    pub type_name: String,
    pub classloader_hash: ContentHash,
}

impl ImplementationSnapshot {
    pub fn new(type_name: impl Into<String>, classloader_hash: ContentHash) -> Self {
        Self {
            type_name: type_name.into(),
            classloader_hash,
        }
    }
}

/// Hashes the identity of a task's (or task action's) implementing code.
/// Must be stable across processes given the same underlying code (§6).
pub trait ClassloaderHierarchyHasher {
    fn hash(&self, type_name: &str) -> ContentHash;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn equality_requires_both_fields() {
        let a = ImplementationSnapshot::new("CompileTask", ContentHash::of_bytes(b"v1"));
        let b = ImplementationSnapshot::new("CompileTask", ContentHash::of_bytes(b"v1"));
        let different_hash = ImplementationSnapshot::new("CompileTask", ContentHash::of_bytes(b"v2"));
        let different_name = ImplementationSnapshot::new("LinkTask", ContentHash::of_bytes(b"v1"));
        assert_eq!(a, b);
        assert_ne!(a, different_hash);
        assert_ne!(a, different_name);
    }
}
