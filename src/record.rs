//! `ExecutionRecord` (§4.H): the aggregate of everything the engine knows
//! about one execution of one task, and the compatibility check that
//! decides whether a task can be skipped.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};

use crate::implementation::ImplementationSnapshot;
use crate::overlap::OverlappingOutputs;
use crate::tree::FileTreeSnapshot;
use crate::value::ValueSnapshot;

/// On-disk format version. Bumped whenever `ExecutionRecord`'s shape
/// changes incompatibly; records written under a different version are
/// discarded on read and treated as absent (§6, §7).
pub const RECORD_FORMAT_VERSION: u32 = 1;

/// Everything recorded about one execution of one task (§3 "Execution
/// record"). Constructed with `successful = false` and empty output/
/// discovered-input snapshots; mutated exactly twice over its lifetime, per
/// §3's lifecycle note: once when the task finishes (successful +
/// outputs + discovered inputs), and that's it before `persist()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub build_invocation_id: String,
    pub task_implementation: ImplementationSnapshot,
    pub task_action_implementations: Vec<ImplementationSnapshot>,
    pub input_properties: BTreeMap<String, Arc<ValueSnapshot>>,
    pub cacheable_output_property_names: std::collections::BTreeSet<String>,
    pub declared_output_file_paths: std::collections::BTreeSet<String>,
    pub input_files_snapshot: BTreeMap<String, FileTreeSnapshot>,
    pub discovered_inputs_snapshot: FileTreeSnapshot,
    pub output_files_snapshot: BTreeMap<String, FileTreeSnapshot>,
    pub detected_overlapping_outputs: Option<OverlappingOutputs>,
    pub successful: bool,
}

impl ExecutionRecord {
    /// A fresh record for a task that's about to run: `successful = false`,
    /// no outputs or discovered inputs yet (§3's lifecycle step 1).
    pub fn new(
        build_invocation_id: String,
        task_implementation: ImplementationSnapshot,
        task_action_implementations: Vec<ImplementationSnapshot>,
        input_properties: BTreeMap<String, Arc<ValueSnapshot>>,
        cacheable_output_property_names: std::collections::BTreeSet<String>,
        declared_output_file_paths: std::collections::BTreeSet<String>,
        input_files_snapshot: BTreeMap<String, FileTreeSnapshot>,
        detected_overlapping_outputs: Option<OverlappingOutputs>,
    ) -> Self {
        Self {
            build_invocation_id,
            task_implementation,
            task_action_implementations,
            input_properties,
            cacheable_output_property_names,
            declared_output_file_paths,
            input_files_snapshot,
            discovered_inputs_snapshot: FileTreeSnapshot::empty(crate::tree::CompareStrategy::Unordered),
            output_files_snapshot: BTreeMap::new(),
            detected_overlapping_outputs,
            successful: false,
        }
    }

    /// §3's lifecycle step 2: the task finished. Sets outputs, discovered
    /// inputs, and the success flag in one go.
    pub fn finish(
        &mut self,
        output_files_snapshot: BTreeMap<String, FileTreeSnapshot>,
        discovered_inputs_snapshot: FileTreeSnapshot,
        successful: bool,
    ) {
        self.output_files_snapshot = output_files_snapshot;
        self.discovered_inputs_snapshot = discovered_inputs_snapshot;
        self.successful = successful;
    }

    /// §4.H: "compatible for skip" iff implementation, actions, input
    /// properties (structurally), cacheable output property names, input
    /// file snapshots (content-level), discovered inputs, and `successful`
    /// all agree. Mismatches are reported with a reason so an executor can
    /// explain why a task ran.
    pub fn compatibility_with(&self, previous: &ExecutionRecord) -> Compatibility {
        if !previous.successful {
            return Compatibility::Incompatible(IncompatibilityReason::PreviousExecutionFailed);
        }
        if self.task_implementation != previous.task_implementation {
            return Compatibility::Incompatible(IncompatibilityReason::ImplementationChanged);
        }
        if self.task_action_implementations != previous.task_action_implementations {
            return Compatibility::Incompatible(IncompatibilityReason::ActionImplementationsChanged);
        }
        if !input_properties_match(&self.input_properties, &previous.input_properties) {
            return Compatibility::Incompatible(IncompatibilityReason::InputPropertyChanged);
        }
        if self.cacheable_output_property_names != previous.cacheable_output_property_names {
            return Compatibility::Incompatible(IncompatibilityReason::OutputPropertyNamesChanged);
        }
        if !input_files_match(&self.input_files_snapshot, &previous.input_files_snapshot) {
            return Compatibility::Incompatible(IncompatibilityReason::InputFilesChanged);
        }
        if self.discovered_inputs_snapshot.hash() != previous.discovered_inputs_snapshot.hash() {
            return Compatibility::Incompatible(IncompatibilityReason::DiscoveredInputsChanged);
        }
        Compatibility::Compatible
    }
}

fn input_properties_match(
    a: &BTreeMap<String, Arc<ValueSnapshot>>,
    b: &BTreeMap<String, Arc<ValueSnapshot>>,
) -> bool {
    a.len() == b.len() && a.iter().all(|(k, v)| b.get(k).is_some_and(|o| o.hash() == v.hash()))
}

fn input_files_match(
    a: &BTreeMap<String, FileTreeSnapshot>,
    b: &BTreeMap<String, FileTreeSnapshot>,
) -> bool {
    a.len() == b.len() && a.iter().all(|(k, v)| b.get(k).is_some_and(|o| o.hash() == v.hash()))
}

/// The result of [`ExecutionRecord::compatibility_with`]: either the task
/// can be skipped, or it can't, with a categorized reason for a change
/// report (§6 "a change-report iterator ... consumed by executors to
/// report reasons like 'input property X changed'").
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Compatibility {
    Compatible,
    Incompatible(IncompatibilityReason),
}

impl Compatibility {
    pub fn is_compatible(&self) -> bool {
        matches!(self, Compatibility::Compatible)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IncompatibilityReason {
    PreviousExecutionFailed,
    ImplementationChanged,
    ActionImplementationsChanged,
    InputPropertyChanged,
    OutputPropertyNamesChanged,
    InputFilesChanged,
    DiscoveredInputsChanged,
}

impl std::fmt::Display for IncompatibilityReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            IncompatibilityReason::PreviousExecutionFailed => "previous execution did not succeed",
            IncompatibilityReason::ImplementationChanged => "task implementation changed",
            IncompatibilityReason::ActionImplementationsChanged => {
                "task action implementations changed"
            }
            IncompatibilityReason::InputPropertyChanged => "an input property changed",
            IncompatibilityReason::OutputPropertyNamesChanged => {
                "the set of cacheable output properties changed"
            }
            IncompatibilityReason::InputFilesChanged => "input files changed",
            IncompatibilityReason::DiscoveredInputsChanged => "discovered inputs changed",
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hashing::ContentHash;
    use crate::tree::CompareStrategy;

    fn impl_snapshot() -> ImplementationSnapshot {
        ImplementationSnapshot::new("DemoTask", ContentHash::of_bytes(b"v1"))
    }

    fn base_record(successful: bool) -> ExecutionRecord {
        let mut record = ExecutionRecord::new(
            "build-1".to_owned(),
            impl_snapshot(),
            vec![],
            BTreeMap::new(),
            Default::default(),
            Default::default(),
            BTreeMap::new(),
            None,
        );
        record.finish(
            BTreeMap::new(),
            FileTreeSnapshot::empty(CompareStrategy::Unordered),
            successful,
        );
        record
    }

    #[test]
    fn identical_successful_records_are_compatible() {
        let a = base_record(true);
        let b = base_record(true);
        assert!(a.compatibility_with(&b).is_compatible());
    }

    #[test]
    fn failed_previous_execution_is_never_compatible() {
        let a = base_record(true);
        let b = base_record(false);
        assert_eq!(
            a.compatibility_with(&b),
            Compatibility::Incompatible(IncompatibilityReason::PreviousExecutionFailed)
        );
    }

    #[test]
    fn different_implementation_is_incompatible() {
        let a = base_record(true);
        let mut b = base_record(true);
        b.task_implementation = ImplementationSnapshot::new("OtherTask", ContentHash::of_bytes(b"v1"));
        assert_eq!(
            a.compatibility_with(&b),
            Compatibility::Incompatible(IncompatibilityReason::ImplementationChanged)
        );
    }

    #[test]
    fn round_trips_through_cbor() {
        let record = base_record(true);
        let mut bytes = Vec::new();
        ciborium::into_writer(&record, &mut bytes).unwrap();
        let back: ExecutionRecord = ciborium::from_reader(bytes.as_slice()).unwrap();
        assert_eq!(back.build_invocation_id, record.build_invocation_id);
        assert_eq!(back.task_implementation, record.task_implementation);
        assert_eq!(back.successful, record.successful);
    }
}
