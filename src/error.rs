//! Typed errors at the `History`/store boundary.
//!
//! Internally, the engine uses `anyhow::Result` with `.context(...)` the way
//! the rest of this codebase does — these variants exist only at the public
//! surface, where callers need to distinguish fatal failures from the kinds
//! that §7 says should be swallowed and treated as "no previous record".

use thiserror::Error;

/// Which side of a task's declared file properties an I/O failure happened
/// on, for [`TaskHistoryError::SnapshottingFailure`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PropertyRole {
    Input,
    Output,
}

impl std::fmt::Display for PropertyRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PropertyRole::Input => "input",
            PropertyRole::Output => "output",
        })
    }
}

#[derive(Debug, Error)]
pub enum TaskHistoryError {
    /// A declared input value isn't structurally snapshottable. Fatal to the
    /// task.
    #[error("task {task_path}: input property {property_name} isn't structurally snapshottable ({value_repr})")]
    InputSerializationFailure {
        task_path: String,
        property_name: String,
        value_repr: String,
        #[source]
        source: anyhow::Error,
    },

    /// Snapshotting an input or output tree failed. Fatal to the task.
    #[error("task {task_path}: failed to snapshot {role} property {property_name}")]
    SnapshottingFailure {
        task_path: String,
        property_name: String,
        role: PropertyRole,
        #[source]
        source: anyhow::Error,
    },

    /// Recovered locally: callers should treat this the same as "no
    /// previous record exists".
    #[error("task {task_path}: couldn't read previous execution record")]
    StoreReadFailure {
        task_path: String,
        #[source]
        source: anyhow::Error,
    },

    /// Fatal to the build step; there is no recovery.
    #[error("task {task_path}: couldn't persist execution record")]
    StoreWriteFailure {
        task_path: String,
        #[source]
        source: anyhow::Error,
    },

    /// Recovered locally: the stored record is in a format this build no
    /// longer understands, so it's treated as absent.
    #[error("task {task_path}: stored record has incompatible version {found} (expected {expected})")]
    IncompatibleRecordVersion {
        task_path: String,
        found: u32,
        expected: u32,
    },
}

impl TaskHistoryError {
    /// §7's recovery policy: true for the two kinds that should be treated
    /// as "proceed as if there were no previous record", false for the
    /// kinds that must propagate and fail the task or build step.
    pub fn is_recoverable_as_absent(&self) -> bool {
        matches!(
            self,
            TaskHistoryError::StoreReadFailure { .. }
                | TaskHistoryError::IncompatibleRecordVersion { .. }
        )
    }
}
