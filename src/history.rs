//! `History`: the per-task façade (§4.I) that ties the rest of the engine
//! together for one task path across one build step.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{PropertyRole, TaskHistoryError};
use crate::implementation::ImplementationSnapshot;
use crate::overlap::{self, OverlappingOutputs};
use crate::record::{Compatibility, ExecutionRecord};
use crate::snapshotter::FileTreeSnapshotter;
use crate::store::Store;
use crate::tree::{CompareStrategy, FileTreeSnapshot, PathNormalization};
use crate::value::{ValueSnapshot, ValueSnapshotter};

/// Everything the executor declares about a task's inputs up front, before
/// `History` builds a current record for it.
pub struct TaskInputs {
    pub task_path: String,
    pub build_invocation_id: String,
    pub task_implementation: ImplementationSnapshot,
    pub task_action_implementations: Vec<ImplementationSnapshot>,
    /// Input values already reduced to `ValueSnapshot`s via
    /// [`History::snapshot_input_property`] — that call is what gives each
    /// entry here the §8 property-3 identity short-circuit against the
    /// previous run's stored value; `History` itself only compares and
    /// stores whatever it's handed.
    pub input_properties: BTreeMap<String, Arc<ValueSnapshot>>,
    pub cacheable_output_property_names: std::collections::BTreeSet<String>,
    /// Property name -> declared roots, for both inputs and (separately,
    /// below) outputs.
    pub input_file_roots: BTreeMap<String, Vec<Utf8PathBuf>>,
    pub output_file_roots: BTreeMap<String, Vec<Utf8PathBuf>>,
}

/// §4.I's four operations for one task path. Constructed by
/// [`crate::history::TaskHistoryRepository::history_for`]; owns exactly one
/// [`ExecutionRecord`] draft plus, lazily, the previous one.
pub struct History<'s, S: FileTreeSnapshotter, V: ValueSnapshotter> {
    store: &'s mut Store,
    snapshotter: &'s S,
    value_snapshotter: &'s V,
    task_path: String,
    previous: Option<Option<ExecutionRecord>>,
    current: Option<ExecutionRecord>,
    overlap: Option<OverlappingOutputs>,
    /// The output trees as they stood right before the task body ran this
    /// invocation, captured by [`History::prepare_execution`]. §4.F/§4.G
    /// both need this distinct from the after-execution snapshot — it's
    /// what lets the filter tell "modified during this run" apart from
    /// "unchanged, belongs to someone else".
    before_execution: Option<BTreeMap<String, FileTreeSnapshot>>,
}

impl<'s, S: FileTreeSnapshotter, V: ValueSnapshotter> History<'s, S, V> {
    pub(crate) fn new(
        store: &'s mut Store,
        snapshotter: &'s S,
        value_snapshotter: &'s V,
        task_path: String,
    ) -> Self {
        Self {
            store,
            snapshotter,
            value_snapshotter,
            task_path,
            previous: None,
            current: None,
            overlap: None,
            before_execution: None,
        }
    }

    /// Snapshots a declared input value property, reusing the previous
    /// run's stored `ValueSnapshot` by `Arc` identity whenever the injected
    /// `ValueSnapshotter` can prove the value is structurally unchanged (§8
    /// property 3). This is the operation §4.I means by "`current_execution`
    /// ... reus[es] previous where possible" for value properties: the
    /// engine, not the caller, is the one consulting
    /// `previous_execution()` and calling `snapshot_with_previous`.
    pub fn snapshot_input_property<T: Serialize>(
        &mut self,
        property: impl Into<String>,
        value: &T,
    ) -> Result<Arc<ValueSnapshot>, TaskHistoryError> {
        let property = property.into();
        self.previous_execution();
        let previous = self
            .previous
            .as_ref()
            .unwrap()
            .as_ref()
            .and_then(|p| p.input_properties.get(&property));

        let snapshot = match previous {
            Some(previous) => self.value_snapshotter.snapshot_with_previous(value, previous),
            None => self.value_snapshotter.snapshot(value),
        };
        snapshot.map_err(|source| TaskHistoryError::InputSerializationFailure {
            task_path: self.task_path.clone(),
            property_name: property,
            value_repr: std::any::type_name::<T>().to_owned(),
            source,
        })
    }

    /// §4.I: at most one load per history instance. `StoreReadFailure` is
    /// recovered locally per §7 — treated the same as "nothing persisted".
    pub fn previous_execution(&mut self) -> Option<&ExecutionRecord> {
        if self.previous.is_none() {
            let loaded = match self.store.get(&self.task_path) {
                Ok(record) => record,
                Err(source) => {
                    // `Store::get` surfaces a version mismatch as a typed
                    // `IncompatibleRecordVersion` wrapped in the `anyhow::Error`;
                    // anything else becomes a `StoreReadFailure` here. §7
                    // recovers both locally as "no previous record" — but
                    // only because both are actually `is_recoverable_as_absent`.
                    let err = match source.downcast::<TaskHistoryError>() {
                        Ok(typed) => typed,
                        Err(source) => TaskHistoryError::StoreReadFailure {
                            task_path: self.task_path.clone(),
                            source,
                        },
                    };
                    if err.is_recoverable_as_absent() {
                        debug!("{err}: treating as no previous record");
                    } else {
                        warn!("{err}: unrecognized error kind, treating as no previous record anyway");
                    }
                    None
                }
            };
            self.previous = Some(loaded);
        }
        self.previous.as_ref().unwrap().as_ref()
    }

    /// §4.I: lazily builds the current record from input state only —
    /// file snapshotters are invoked unconditionally for inputs (§4.I), but
    /// outputs are deliberately left untouched here. §8 property 2 requires
    /// that the skip decision not re-snapshot outputs, so overlap detection
    /// (§4.F), which needs an output snapshot, is deferred to
    /// `update_current`/`update_current_with_outputs` — the skip decision
    /// instead trusts the previous record's own recorded overlap state.
    pub fn current_execution(
        &mut self,
        inputs: &TaskInputs,
    ) -> Result<&ExecutionRecord, TaskHistoryError> {
        if self.current.is_none() {
            let input_files_snapshot = snapshot_properties(
                self.snapshotter,
                &inputs.input_file_roots,
                &inputs.task_path,
                PropertyRole::Input,
            )?;

            // §3: the *paths* declared as outputs, not the property names
            // that own them — every root beneath every output property.
            let declared_output_file_paths = inputs
                .output_file_roots
                .values()
                .flatten()
                .map(|path| path.to_string())
                .collect();

            let record = ExecutionRecord::new(
                inputs.build_invocation_id.clone(),
                inputs.task_implementation.clone(),
                inputs.task_action_implementations.clone(),
                inputs.input_properties.clone(),
                inputs.cacheable_output_property_names.clone(),
                declared_output_file_paths,
                input_files_snapshot,
                None,
            );
            self.current = Some(record);
        }
        Ok(self.current.as_ref().unwrap())
    }

    /// §8 property 2: true iff the current record is compatible with the
    /// previous one (same inputs/implementation, previous succeeded) and
    /// the previous run recorded no overlap — evaluated without
    /// re-snapshotting outputs, per property 2's explicit requirement.
    pub fn is_up_to_date(&mut self, inputs: &TaskInputs) -> Result<bool, TaskHistoryError> {
        self.previous_execution();
        self.current_execution(inputs)?;

        let Some(previous) = self.previous.as_ref().unwrap().clone() else {
            return Ok(false);
        };

        // The current draft's discovered inputs are unknown until the task
        // body runs (§3 lifecycle). To compare them without running the
        // task or re-snapshotting declared outputs (§8 property 2), replay
        // the previous run's own discovered paths (§4.C `elements()`) and
        // see whether any of them changed.
        let discovered_paths = previous.discovered_inputs_snapshot.elements();
        let discovered_inputs_snapshot = if discovered_paths.is_empty() {
            FileTreeSnapshot::empty(CompareStrategy::Unordered)
        } else {
            self.snapshotter
                .snapshot(&discovered_paths, PathNormalization::Absolute, CompareStrategy::Unordered)
                .context("replaying discovered inputs")
                .map_err(|source| TaskHistoryError::SnapshottingFailure {
                    task_path: self.task_path.clone(),
                    property_name: "discovered-inputs".to_owned(),
                    role: PropertyRole::Input,
                    source,
                })?
        };
        self.current.as_mut().unwrap().discovered_inputs_snapshot = discovered_inputs_snapshot;

        let current = self.current.as_ref().unwrap();
        let up_to_date = previous.detected_overlapping_outputs.is_none()
            && current.compatibility_with(&previous).is_compatible();
        crate::counters::bump(if up_to_date {
            crate::counters::Op::TaskSkipped
        } else {
            crate::counters::Op::TaskRan
        });
        Ok(up_to_date)
    }

    /// Snapshots each declared output property exactly as it stands right
    /// now, before the task body runs. Callers that intend to actually run
    /// the task (i.e. `is_up_to_date` returned `false`) MUST call this
    /// after that check and before running the task body — it's the only
    /// point at which "before execution" and "after execution" output
    /// states can be told apart. Idempotent: a second call is a no-op, so
    /// callers that also drive `is_up_to_date` themselves don't need to
    /// track whether they've already called it.
    ///
    /// If a caller skips this (e.g. because outputs are being restored from
    /// elsewhere via `update_current_with_outputs` rather than produced by a
    /// local task run), `update_current_with_outputs` falls back to
    /// snapshotting at that later point — correct for overlap *detection*
    /// against the previous run, but unable to distinguish "modified by
    /// this run" from "unchanged and previously foreign" in §4.G's filter,
    /// since by then both states are identical.
    pub fn prepare_execution(&mut self, inputs: &TaskInputs) -> Result<(), TaskHistoryError> {
        if self.before_execution.is_some() {
            return Ok(());
        }
        let snapshot = snapshot_properties(
            self.snapshotter,
            &inputs.output_file_roots,
            &inputs.task_path,
            PropertyRole::Output,
        )?;
        self.before_execution = Some(snapshot);
        Ok(())
    }

    /// §4.I `update_current`: re-snapshots outputs, applies §4.G when an
    /// overlap was detected at construction time, and records `successful`.
    /// `discovered_input_paths` are the additional input files (§3
    /// "discovered inputs") the task reported finding while it ran, not
    /// known at planning time — snapshotted by absolute path so they can be
    /// replayed the same way on a later build (§4.C `elements()`).
    pub fn update_current(
        &mut self,
        inputs: &TaskInputs,
        discovered_input_paths: &[Utf8PathBuf],
        successful: bool,
    ) -> Result<(), TaskHistoryError> {
        self.current_execution(inputs)?;

        let after_execution = snapshot_properties(
            self.snapshotter,
            &inputs.output_file_roots,
            &inputs.task_path,
            PropertyRole::Output,
        )?;
        self.update_current_with_outputs(inputs, after_execution, discovered_input_paths, successful)
    }

    /// §4.I `update_current_with_outputs`: variant where outputs are
    /// supplied externally (e.g. from an artifact-restore path) instead of
    /// freshly snapshotted.
    pub fn update_current_with_outputs(
        &mut self,
        inputs: &TaskInputs,
        after_execution: BTreeMap<String, FileTreeSnapshot>,
        discovered_input_paths: &[Utf8PathBuf],
        successful: bool,
    ) -> Result<(), TaskHistoryError> {
        self.current_execution(inputs)?;
        self.previous_execution();

        let previous = self.previous.as_ref().unwrap().clone();

        // Use the snapshot captured by `prepare_execution` before the task
        // body ran, if the caller took it; otherwise fall back to
        // snapshotting now (see `prepare_execution`'s doc comment for what
        // that loses).
        let before_execution = match self.before_execution.take() {
            Some(snapshot) => snapshot,
            None => {
                debug!(
                    "{}: no pre-execution output snapshot captured; falling back to a snapshot taken now",
                    self.task_path
                );
                snapshot_properties(
                    self.snapshotter,
                    &inputs.output_file_roots,
                    &inputs.task_path,
                    PropertyRole::Output,
                )?
            }
        };
        let after_previous: Vec<(&str, Option<&FileTreeSnapshot>)> = inputs
            .output_file_roots
            .keys()
            .map(|property| {
                let tree = previous
                    .as_ref()
                    .and_then(|p| p.output_files_snapshot.get(property));
                (property.as_str(), tree)
            })
            .collect();
        let before_execution_refs: Vec<(&str, &FileTreeSnapshot)> =
            before_execution.iter().map(|(p, t)| (p.as_str(), t)).collect();
        let overlap = overlap::detect_overlapping_outputs(&before_execution_refs, &after_previous);
        if let Some(ref o) = overlap {
            info!(
                "Overlapping output detected for {}: property {} path {}",
                self.task_path, o.property_name, o.absolute_path
            );
            crate::counters::bump(crate::counters::Op::OverlapDetected);
        }
        self.overlap = overlap.clone();

        let filtered: BTreeMap<String, FileTreeSnapshot> = if overlap.is_some() {
            after_execution
                .into_iter()
                .map(|(property, after)| {
                    let after_previous = previous
                        .as_ref()
                        .and_then(|p| p.output_files_snapshot.get(&property));
                    let before = before_execution
                        .get(&property)
                        .cloned()
                        .unwrap_or_else(|| FileTreeSnapshot::empty(CompareStrategy::Unordered));
                    let filtered = crate::output_filter::filter_outputs(after_previous, &before, &after);
                    (property, filtered)
                })
                .collect()
        } else {
            after_execution
        };

        let discovered_inputs_snapshot = if discovered_input_paths.is_empty() {
            FileTreeSnapshot::empty(CompareStrategy::Unordered)
        } else {
            self.snapshotter
                .snapshot(discovered_input_paths, PathNormalization::Absolute, CompareStrategy::Unordered)
                .context("snapshotting discovered inputs")
                .map_err(|source| TaskHistoryError::SnapshottingFailure {
                    task_path: self.task_path.clone(),
                    property_name: "discovered-inputs".to_owned(),
                    role: PropertyRole::Input,
                    source,
                })?
        };

        let current = self.current.as_mut().expect("current_execution populated it");
        current.detected_overlapping_outputs = overlap;
        current.finish(filtered, discovered_inputs_snapshot, successful);
        Ok(())
    }

    /// §4.I `persist`: writes the current record. "Instructs previous to
    /// drop unnecessary snapshots" is handled by the store itself — `put`
    /// releases the superseded record's tree-blob references as part of
    /// the same transaction that writes the new one (§4.J).
    pub fn persist(&mut self) -> Result<(), TaskHistoryError> {
        let current = self
            .current
            .as_ref()
            .expect("persist() called before current_execution()/update_current()");
        self.store
            .put(&self.task_path, current)
            .map_err(|source| TaskHistoryError::StoreWriteFailure {
                task_path: self.task_path.clone(),
                source,
            })
    }
}

fn snapshot_properties<S: FileTreeSnapshotter>(
    snapshotter: &S,
    roots_by_property: &BTreeMap<String, Vec<Utf8PathBuf>>,
    task_path: &str,
    role: PropertyRole,
) -> Result<BTreeMap<String, FileTreeSnapshot>, TaskHistoryError> {
    roots_by_property
        .iter()
        .map(|(property, roots)| {
            let snapshot = snapshotter
                .snapshot(roots, PathNormalization::RelativeToRoot, CompareStrategy::Unordered)
                .with_context(|| format!("snapshotting {role} property {property}"))
                .map_err(|source| TaskHistoryError::SnapshottingFailure {
                    task_path: task_path.to_owned(),
                    property_name: property.clone(),
                    role,
                    source,
                })?;
            Ok((property.clone(), snapshot))
        })
        .collect()
}

/// §4.I/§6: `TaskHistoryRepository.getHistory(task) -> History`.
pub struct TaskHistoryRepository<S: FileTreeSnapshotter, V: ValueSnapshotter> {
    store: Store,
    snapshotter: S,
    value_snapshotter: V,
}

impl<S: FileTreeSnapshotter, V: ValueSnapshotter> TaskHistoryRepository<S, V> {
    pub fn new(store: Store, snapshotter: S, value_snapshotter: V) -> Self {
        Self {
            store,
            snapshotter,
            value_snapshotter,
        }
    }

    pub fn history_for(&mut self, task_path: impl Into<String>) -> History<'_, S, V> {
        History::new(&mut self.store, &self.snapshotter, &self.value_snapshotter, task_path.into())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::content::ContentSnapshot;
    use crate::hashing::ContentHash;
    use crate::implementation::ImplementationSnapshot;
    use crate::tree::NormalizedFileSnapshot;
    use std::fs;

    struct FixedSnapshotter {
        contents: std::cell::RefCell<BTreeMap<Utf8PathBuf, Vec<u8>>>,
    }

    impl FileTreeSnapshotter for FixedSnapshotter {
        fn snapshot(
            &self,
            roots: &[Utf8PathBuf],
            _normalization: PathNormalization,
            compare_strategy: CompareStrategy,
        ) -> anyhow::Result<FileTreeSnapshot> {
            let contents = self.contents.borrow();
            let entries = roots.iter().map(|root| {
                let content = contents.get(root).map(|bytes| {
                    ContentSnapshot::regular_file(ContentHash::of_bytes(bytes))
                }).unwrap_or_else(ContentSnapshot::missing);
                NormalizedFileSnapshot::new(root.clone(), root.clone(), content, None)
            });
            Ok(FileTreeSnapshot::from_entries(compare_strategy, entries))
        }
    }

    fn task_inputs(output_path: Utf8PathBuf) -> TaskInputs {
        TaskInputs {
            task_path: ":demo".to_owned(),
            build_invocation_id: "build-1".to_owned(),
            task_implementation: ImplementationSnapshot::new("Demo", ContentHash::of_bytes(b"v1")),
            task_action_implementations: vec![],
            input_properties: BTreeMap::new(),
            cacheable_output_property_names: ["out".to_owned()].into_iter().collect(),
            input_file_roots: BTreeMap::new(),
            output_file_roots: [("out".to_owned(), vec![output_path])].into_iter().collect(),
        }
    }

    #[test]
    fn s1_first_run_persists_successful_record() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let out = Utf8PathBuf::from_path_buf(dir.path().join("o")).unwrap();
        fs::write(&out, b"X")?;

        let snapshotter = FixedSnapshotter {
            contents: std::cell::RefCell::new([(out.clone(), b"X".to_vec())].into_iter().collect()),
        };
        let store = Store::open_in_memory_for_test()?;
        let mut repo = TaskHistoryRepository::new(store, snapshotter, crate::value::StructuralValueSnapshotter);
        let inputs = task_inputs(out.clone());

        let mut history = repo.history_for(":demo");
        assert!(history.previous_execution().is_none());
        history.update_current(&inputs, &[], true)?;
        history.persist()?;

        let mut history = repo.history_for(":demo");
        let previous = history.previous_execution().expect("just persisted");
        assert!(previous.declared_output_file_paths.contains(&out.to_string()));
        assert!(previous.successful);
        assert_eq!(previous.output_files_snapshot["out"].len(), 1);
        Ok(())
    }

    #[test]
    fn s2_idempotent_rerun_reports_up_to_date() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let out = Utf8PathBuf::from_path_buf(dir.path().join("o")).unwrap();
        fs::write(&out, b"X")?;

        let snapshotter = FixedSnapshotter {
            contents: std::cell::RefCell::new([(out.clone(), b"X".to_vec())].into_iter().collect()),
        };
        let store = Store::open_in_memory_for_test()?;
        let mut repo = TaskHistoryRepository::new(store, snapshotter, crate::value::StructuralValueSnapshotter);
        let inputs = task_inputs(out);

        {
            let mut history = repo.history_for(":demo");
            history.update_current(&inputs, &[], true)?;
            history.persist()?;
        }

        let mut history = repo.history_for(":demo");
        assert!(history.is_up_to_date(&inputs)?);
        Ok(())
    }

    #[test]
    fn value_property_reused_by_identity_without_caller_touching_previous_execution() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let out = Utf8PathBuf::from_path_buf(dir.path().join("o")).unwrap();
        fs::write(&out, b"X")?;

        let snapshotter = FixedSnapshotter {
            contents: std::cell::RefCell::new([(out.clone(), b"X".to_vec())].into_iter().collect()),
        };
        let store = Store::open_in_memory_for_test()?;
        let mut repo = TaskHistoryRepository::new(store, snapshotter, crate::value::StructuralValueSnapshotter);

        {
            let mut history = repo.history_for(":demo");
            let mut inputs = task_inputs(out.clone());
            inputs.input_properties = [(
                "p".to_owned(),
                history.snapshot_input_property("p", &7i32)?,
            )]
            .into_iter()
            .collect();
            history.update_current(&inputs, &[], true)?;
            history.persist()?;
        }

        // On the next run, asking for the same value by a fresh `History`
        // must hand back the exact previous `Arc` — the caller never looked
        // at `previous_execution()` itself.
        let mut history = repo.history_for(":demo");
        let first = history
            .previous_execution()
            .unwrap()
            .input_properties
            .get("p")
            .unwrap()
            .clone();
        let reused = history.snapshot_input_property("p", &7i32)?;
        assert!(Arc::ptr_eq(&first, &reused));

        let changed = history.snapshot_input_property("p", &8i32)?;
        assert!(!Arc::ptr_eq(&first, &changed));
        Ok(())
    }
}
