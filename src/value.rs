//! `ValueSnapshot`: an opaque structural fingerprint of a declared input
//! property value, plus the `ValueSnapshotter` collaborator contract (§3,
//! §6) and a concrete structural implementation (§11 of `SPEC_FULL.md`).

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_derive::{Deserialize, Serialize as SerdeSerialize};

use crate::hashing::ContentHash;

/// A structural fingerprint of a declared input value. Cheap to compare
/// (just compares `hash`) and cheap to share: `current_execution()` reuses
/// the same `Arc` as the previous record's entry whenever the snapshotter
/// proves the value is unchanged (§8 property 3).
#[derive(Debug, Clone, SerdeSerialize, Deserialize)]
pub struct ValueSnapshot {
    hash: ContentHash,
    /// The structural (CBOR) encoding of the value, retained so a change
    /// report can show what actually changed, not just that something did.
    #[serde(with = "serde_bytes")]
    encoded: Vec<u8>,
}

impl ValueSnapshot {
    pub fn hash(&self) -> ContentHash {
        self.hash
    }
}

impl PartialEq for ValueSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}
impl Eq for ValueSnapshot {}

/// Produces [`ValueSnapshot`]s for declared input values. Consumed by the
/// engine (§6); must be structural, i.e. two structurally-equal values
/// always produce equal snapshots.
pub trait ValueSnapshotter {
    /// Snapshot a value with no previous snapshot to compare against.
    fn snapshot<T: Serialize>(&self, value: &T) -> Result<Arc<ValueSnapshot>>;

    /// Snapshot a value, given the previous run's snapshot for the same
    /// property. Implementations that can prove structural equality
    /// without fully re-encoding SHOULD return `previous` unchanged,
    /// enabling the identity short-circuit of §8 property 3.
    fn snapshot_with_previous<T: Serialize>(
        &self,
        value: &T,
        previous: &Arc<ValueSnapshot>,
    ) -> Result<Arc<ValueSnapshot>> {
        // Default implementation: no way to prove equality cheaply, so
        // always snapshot fresh. Concrete snapshotters that can compare
        // hashes before discarding the new encoding should override this.
        let fresh = self.snapshot(value)?;
        if fresh.hash == previous.hash {
            crate::counters::bump(crate::counters::Op::ValueSnapshotReused);
            Ok(previous.clone())
        } else {
            Ok(fresh)
        }
    }
}

/// A [`ValueSnapshotter`] built on CBOR structural serialization plus
/// content hashing.
pub struct StructuralValueSnapshotter;

impl ValueSnapshotter for StructuralValueSnapshotter {
    fn snapshot<T: Serialize>(&self, value: &T) -> Result<Arc<ValueSnapshot>> {
        let mut encoded = Vec::new();
        ciborium::into_writer(value, &mut encoded)
            .context("value isn't structurally snapshottable")?;
        let hash = ContentHash::of_bytes(&encoded);
        Ok(Arc::new(ValueSnapshot { hash, encoded }))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn equal_values_hash_equal() -> Result<()> {
        let s = StructuralValueSnapshotter;
        let a = s.snapshot(&42i32)?;
        let b = s.snapshot(&42i32)?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn different_values_hash_different() -> Result<()> {
        let s = StructuralValueSnapshotter;
        let a = s.snapshot(&42i32)?;
        let b = s.snapshot(&43i32)?;
        assert_ne!(a, b);
        Ok(())
    }

    #[test]
    fn unchanged_value_short_circuits_to_previous_instance() -> Result<()> {
        let s = StructuralValueSnapshotter;
        let previous = s.snapshot(&42i32)?;
        let current = s.snapshot_with_previous(&42i32, &previous)?;
        assert!(Arc::ptr_eq(&previous, &current));
        Ok(())
    }

    #[test]
    fn changed_value_does_not_reuse_previous_instance() -> Result<()> {
        let s = StructuralValueSnapshotter;
        let previous = s.snapshot(&42i32)?;
        let current = s.snapshot_with_previous(&43i32, &previous)?;
        assert!(!Arc::ptr_eq(&previous, &current));
        Ok(())
    }
}
