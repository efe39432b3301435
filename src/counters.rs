//! Performance counters: Count how many times we do various important operations.

use std::sync::atomic::{fence, AtomicUsize, Ordering};

use enum_map::{Enum, EnumMap};
use lazy_static::lazy_static;
use tracing::debug;

#[derive(Debug, Copy, Clone, Enum)]
pub enum Op {
    StoreRecordHit,
    StoreRecordMiss,
    StoreTreeBlobHit,
    StoreTreeBlobMiss,
    TaskSkipped,
    TaskRan,
    OverlapDetected,
    ValueSnapshotReused,
}

lazy_static! {
    static ref COUNTER_MAP: EnumMap<Op, AtomicUsize> = EnumMap::default();
}

#[inline]
pub fn bump(which: Op) {
    add(which, 1);
}

pub fn add(to: Op, amount: usize) {
    COUNTER_MAP[to].fetch_add(amount, Ordering::Relaxed);
}

pub fn count(of: Op) -> usize {
    COUNTER_MAP[of].load(Ordering::Relaxed)
}

pub fn log_counts() {
    // Probably not needed; but we're probably calling this once at program exit.
    fence(Ordering::SeqCst);

    let counts = COUNTER_MAP
        .iter()
        .map(|(k, v)| (k, v.load(Ordering::Relaxed)))
        .filter(|(_k, v)| *v > 0) // Ignore things we didn't do
        .collect::<Vec<_>>();

    if counts.is_empty() {
        return;
    }

    let opname = |op| match op {
        Op::StoreRecordHit => "store record hits",
        Op::StoreRecordMiss => "store record misses",
        Op::StoreTreeBlobHit => "store tree blob hits",
        Op::StoreTreeBlobMiss => "store tree blob misses",
        Op::TaskSkipped => "tasks skipped as up to date",
        Op::TaskRan => "tasks run",
        Op::OverlapDetected => "overlapping outputs detected",
        Op::ValueSnapshotReused => "input value snapshots reused from previous run",
    };

    debug!("Counters:");
    for (op, count) in &counts {
        debug!("{:6} {}", count, opname(*op));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bump_and_count_agree() {
        let before = count(Op::TaskSkipped);
        bump(Op::TaskSkipped);
        bump(Op::TaskSkipped);
        assert_eq!(count(Op::TaskSkipped), before + 2);
    }
}
