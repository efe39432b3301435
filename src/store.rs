//! The persistent indexed store (§4.J): a `taskHistory` cache keyed by task
//! path, with file-tree snapshots referenced through a separate,
//! reference-counted blob keyspace so outputs of one task can share backing
//! blobs with inputs of another.
//!
//! Grounded on the local SQLite cache the teacher keeps for backend blobs
//! (`PRAGMA user_version` schema versioning, WAL journal mode), with an
//! added cross-process `fs2` lock layer the teacher itself never needed —
//! its own cache never has two processes racing to initialize it from
//! scratch the way §5 requires this store to handle.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};

use anyhow::{Context, Result, bail};
use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, trace, warn};

use crate::config::Configuration;
use crate::record::{ExecutionRecord, RECORD_FORMAT_VERSION};
use crate::tree::FileTreeSnapshot;

/// How many times to retry the "exclusive-init failed, re-check under
/// shared lock" convergence loop of §5 before giving up. In practice one
/// retry always suffices; this just bounds a pathological case.
const MAX_INIT_ATTEMPTS: u32 = 8;

pub struct Store {
    conn: Connection,
    lock_file: File,
    max_entries: u64,
    /// §6's `cacheInMemory` knob: when set, records served by `get` are kept
    /// here so a second read within the same process skips the row lookup
    /// and CBOR decode entirely. `put` keeps it in sync.
    memory_cache: Option<RefCell<BTreeMap<String, ExecutionRecord>>>,
}

impl Store {
    /// Opens (creating if necessary) the store rooted at `directory`.
    /// Performs schema initialization under the convergence discipline of
    /// §5: a process that can't win the exclusive lock re-checks, under a
    /// shared lock, whether initialization completed elsewhere rather than
    /// trusting any locally cached "already initialized" flag.
    pub fn open(directory: &Utf8Path, config: &Configuration) -> Result<Self> {
        std::fs::create_dir_all(directory)
            .with_context(|| format!("Couldn't create store directory {directory}"))?;

        let lock_path = directory.join(".lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("Couldn't open lock file {lock_path}"))?;

        let db_path = directory.join("history.sqlite3");
        let mut conn = Connection::open(&db_path)
            .with_context(|| format!("Couldn't open {db_path}"))?;

        ensure_schema(&mut conn, &lock_file)?;

        Ok(Self {
            conn,
            lock_file,
            max_entries: config.max_entries,
            memory_cache: config.cache_in_memory.then(|| RefCell::new(BTreeMap::new())),
        })
    }

    pub fn open_in_memory_for_test() -> Result<Self> {
        Self::open_in_memory_for_test_with_config(&Configuration::default())
    }

    pub fn open_in_memory_for_test_with_config(config: &Configuration) -> Result<Self> {
        // Used by tests that don't want to touch the filesystem at all;
        // schema init still runs, it just never contends with anyone.
        let lock_file = tempfile::tempfile().context("Couldn't create anonymous lock file")?;
        let mut conn = Connection::open_in_memory().context("Couldn't open in-memory database")?;
        ensure_schema(&mut conn, &lock_file)?;
        Ok(Self {
            conn,
            lock_file,
            max_entries: config.max_entries,
            memory_cache: config.cache_in_memory.then(|| RefCell::new(BTreeMap::new())),
        })
    }

    /// §4.J `get`: reads under the store's shared lock. A missing row, a
    /// version mismatch, or any I/O failure is surfaced to the caller, who
    /// (per §7) is expected to treat all three as "no previous record".
    ///
    /// Checks the in-memory cache first when `cacheInMemory` is enabled
    /// (§6), entirely skipping the row lookup and CBOR decode on a hit.
    pub fn get(&mut self, task_path: &str) -> Result<Option<ExecutionRecord>> {
        if let Some(cache) = &self.memory_cache {
            let cached = cache.borrow().get(task_path).cloned();
            if let Some(record) = cached {
                // Still a real access for eviction purposes, even though it
                // skipped the row lookup and CBOR decode.
                self.touch_last_used(task_path)?;
                return Ok(Some(record));
            }
        }

        self.lock_file
            .lock_shared()
            .context("Couldn't acquire shared store lock")?;
        let result = self.get_locked(task_path);
        FileExt::unlock(&self.lock_file).context("Couldn't release shared store lock")?;

        if let (Some(cache), Ok(Some(record))) = (&self.memory_cache, &result) {
            cache.borrow_mut().insert(task_path.to_owned(), record.clone());
        }
        result
    }

    fn touch_last_used(&mut self, task_path: &str) -> Result<()> {
        self.lock_file
            .lock_shared()
            .context("Couldn't acquire shared store lock")?;
        let result = self
            .conn
            .execute(
                "UPDATE records SET last_used = ?2 WHERE task_path = ?1",
                params![task_path, now_millis()],
            )
            .context("Couldn't touch last_used");
        FileExt::unlock(&self.lock_file).context("Couldn't release shared store lock")?;
        result.map(|_| ())
    }

    fn get_locked(&mut self, task_path: &str) -> Result<Option<ExecutionRecord>> {
        let row: Option<(i64, Vec<u8>)> = self
            .conn
            .query_row(
                "SELECT version, data FROM records WHERE task_path = ?1",
                params![task_path],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .context("Failed reading record row")?;

        let Some((version, data)) = row else {
            crate::counters::bump(crate::counters::Op::StoreRecordMiss);
            return Ok(None);
        };
        if version as u32 != RECORD_FORMAT_VERSION {
            debug!(
                "Discarding record for {task_path}: stored version {version}, expected {}",
                RECORD_FORMAT_VERSION
            );
            crate::counters::bump(crate::counters::Op::StoreRecordMiss);
            return Err(crate::error::TaskHistoryError::IncompatibleRecordVersion {
                task_path: task_path.to_owned(),
                found: version as u32,
                expected: RECORD_FORMAT_VERSION,
            }
            .into());
        }
        crate::counters::bump(crate::counters::Op::StoreRecordHit);
        self.conn
            .execute(
                "UPDATE records SET last_used = ?2 WHERE task_path = ?1",
                params![task_path, now_millis()],
            )
            .context("Couldn't touch last_used")?;

        let stored: StoredExecutionRecord =
            ciborium::from_reader(data.as_slice()).context("Corrupt stored record")?;
        let record = self.resolve(stored).context("Couldn't resolve tree blobs")?;
        Ok(Some(record))
    }

    /// §4.J `put`: under the exclusive lock, atomically (a) interns every
    /// tree this record references (bumping refcounts), (b) releases the
    /// superseded previous record's tree references, (c) replaces the
    /// record row, (d) evicts the least-recently-used rows beyond
    /// `max_entries` (§6's `maxEntries` knob). All of this happens inside
    /// one SQLite transaction.
    pub fn put(&mut self, task_path: &str, record: &ExecutionRecord) -> Result<()> {
        self.lock_file
            .lock_exclusive()
            .context("Couldn't acquire exclusive store lock")?;
        let result = self.put_locked(task_path, record);
        FileExt::unlock(&self.lock_file).context("Couldn't release exclusive store lock")?;

        if result.is_ok() {
            if let Some(cache) = &self.memory_cache {
                let mut cache = cache.borrow_mut();
                cache.insert(task_path.to_owned(), record.clone());
                // A `put` may have evicted other rows under `max_entries`;
                // keep the in-memory cache from holding phantom entries for
                // rows that no longer exist in the backing store.
                if cache.len() > 1 {
                    let mut stmt = self
                        .conn
                        .prepare("SELECT 1 FROM records WHERE task_path = ?1")
                        .context("Couldn't prepare cache-sync query")?;
                    cache.retain(|path, _| {
                        path == task_path
                            || stmt.exists(params![path]).unwrap_or(false)
                    });
                }
            }
        }
        result
    }

    fn put_locked(&mut self, task_path: &str, record: &ExecutionRecord) -> Result<()> {
        let tx = self.conn.transaction().context("Couldn't start transaction")?;

        let previous_hashes: BTreeSet<String> = tx
            .query_row(
                "SELECT data FROM records WHERE task_path = ?1",
                params![task_path],
                |r| r.get::<_, Vec<u8>>(0),
            )
            .optional()
            .context("Failed reading previous record row")?
            .and_then(|data| ciborium::from_reader::<StoredExecutionRecord, _>(data.as_slice()).ok())
            .map(|stored| stored.referenced_hashes())
            .unwrap_or_default();

        for hash in &previous_hashes {
            release_tree(&tx, hash)?;
        }

        let stored = intern_record(&tx, record)?;
        let new_hashes = stored.referenced_hashes();
        for hash in &new_hashes {
            bump_tree_refcount(&tx, hash)?;
        }

        let mut data = Vec::new();
        ciborium::into_writer(&stored, &mut data).context("Couldn't serialize record")?;
        let now = now_millis();
        tx.execute(
            "REPLACE INTO records(task_path, version, data, last_used) VALUES (?1, ?2, ?3, ?4)",
            params![task_path, RECORD_FORMAT_VERSION, data, now],
        )
        .context("Couldn't write record row")?;

        evict_excess_entries(&tx, self.max_entries)?;

        tx.commit().context("Couldn't commit transaction")?;
        trace!("Persisted record for {task_path}");
        Ok(())
    }

    fn resolve(&self, stored: StoredExecutionRecord) -> Result<ExecutionRecord> {
        let input_files_snapshot = stored
            .input_files_snapshot
            .iter()
            .map(|(property, hash)| Ok((property.clone(), load_tree(&self.conn, hash)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        let output_files_snapshot = stored
            .output_files_snapshot
            .iter()
            .map(|(property, hash)| Ok((property.clone(), load_tree(&self.conn, hash)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        let discovered_inputs_snapshot = load_tree(&self.conn, &stored.discovered_inputs_snapshot)?;

        Ok(ExecutionRecord {
            build_invocation_id: stored.build_invocation_id,
            task_implementation: stored.task_implementation,
            task_action_implementations: stored.task_action_implementations,
            input_properties: stored.input_properties,
            cacheable_output_property_names: stored.cacheable_output_property_names,
            declared_output_file_paths: stored.declared_output_file_paths,
            input_files_snapshot,
            discovered_inputs_snapshot,
            output_files_snapshot,
            detected_overlapping_outputs: stored.detected_overlapping_outputs,
            successful: stored.successful,
        })
    }
}

/// The on-disk shape of an [`ExecutionRecord`]: file-tree snapshots are
/// replaced by their content hash (§6: "referenced by integer ids embedded
/// in the record" — this implementation uses the tree's own content hash
/// as that stable identifier, since it's already unique and avoids a
/// separate id-allocation table).
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StoredExecutionRecord {
    build_invocation_id: String,
    task_implementation: crate::implementation::ImplementationSnapshot,
    task_action_implementations: Vec<crate::implementation::ImplementationSnapshot>,
    input_properties: BTreeMap<String, std::sync::Arc<crate::value::ValueSnapshot>>,
    cacheable_output_property_names: BTreeSet<String>,
    declared_output_file_paths: BTreeSet<String>,
    input_files_snapshot: BTreeMap<String, String>,
    discovered_inputs_snapshot: String,
    output_files_snapshot: BTreeMap<String, String>,
    detected_overlapping_outputs: Option<crate::overlap::OverlappingOutputs>,
    successful: bool,
}

impl StoredExecutionRecord {
    fn referenced_hashes(&self) -> BTreeSet<String> {
        let mut hashes: BTreeSet<String> = self.input_files_snapshot.values().cloned().collect();
        hashes.extend(self.output_files_snapshot.values().cloned());
        hashes.insert(self.discovered_inputs_snapshot.clone());
        hashes
    }
}

fn intern_record(tx: &rusqlite::Transaction, record: &ExecutionRecord) -> Result<StoredExecutionRecord> {
    let input_files_snapshot = record
        .input_files_snapshot
        .iter()
        .map(|(property, tree)| Ok((property.clone(), intern_tree(tx, tree)?)))
        .collect::<Result<BTreeMap<_, _>>>()?;
    let output_files_snapshot = record
        .output_files_snapshot
        .iter()
        .map(|(property, tree)| Ok((property.clone(), intern_tree(tx, tree)?)))
        .collect::<Result<BTreeMap<_, _>>>()?;
    let discovered_inputs_snapshot = intern_tree(tx, &record.discovered_inputs_snapshot)?;

    Ok(StoredExecutionRecord {
        build_invocation_id: record.build_invocation_id.clone(),
        task_implementation: record.task_implementation.clone(),
        task_action_implementations: record.task_action_implementations.clone(),
        input_properties: record.input_properties.clone(),
        cacheable_output_property_names: record.cacheable_output_property_names.clone(),
        declared_output_file_paths: record.declared_output_file_paths.clone(),
        input_files_snapshot,
        discovered_inputs_snapshot,
        output_files_snapshot,
        detected_overlapping_outputs: record.detected_overlapping_outputs.clone(),
        successful: record.successful,
    })
}

/// Writes `tree`'s blob if it isn't already present. Does NOT bump its
/// refcount — callers increment separately once the full new reference set
/// for a record is known, so a tree referenced twice by the same record is
/// still only counted once.
fn intern_tree(tx: &rusqlite::Transaction, tree: &FileTreeSnapshot) -> Result<String> {
    let hash = tree.hash().to_string();
    let exists: bool = tx
        .query_row(
            "SELECT 1 FROM tree_blobs WHERE hash = ?1",
            params![hash],
            |_| Ok(()),
        )
        .optional()
        .context("Failed checking tree_blobs")?
        .is_some();
    if !exists {
        crate::counters::bump(crate::counters::Op::StoreTreeBlobMiss);
        let mut data = Vec::new();
        ciborium::into_writer(tree, &mut data).context("Couldn't serialize tree blob")?;
        tx.execute(
            "INSERT INTO tree_blobs(hash, data, refcount) VALUES (?1, ?2, 0)",
            params![hash, data],
        )
        .context("Couldn't insert tree blob")?;
    } else {
        crate::counters::bump(crate::counters::Op::StoreTreeBlobHit);
    }
    Ok(hash)
}

fn bump_tree_refcount(tx: &rusqlite::Transaction, hash: &str) -> Result<()> {
    tx.execute(
        "UPDATE tree_blobs SET refcount = refcount + 1 WHERE hash = ?1",
        params![hash],
    )
    .context("Couldn't bump tree blob refcount")?;
    Ok(())
}

fn release_tree(tx: &rusqlite::Transaction, hash: &str) -> Result<()> {
    tx.execute(
        "UPDATE tree_blobs SET refcount = refcount - 1 WHERE hash = ?1",
        params![hash],
    )
    .context("Couldn't release tree blob reference")?;
    tx.execute(
        "DELETE FROM tree_blobs WHERE hash = ?1 AND refcount <= 0",
        params![hash],
    )
    .context("Couldn't sweep unreferenced tree blob")?;
    Ok(())
}

fn load_tree(conn: &Connection, hash: &str) -> Result<FileTreeSnapshot> {
    let data: Vec<u8> = conn
        .query_row(
            "SELECT data FROM tree_blobs WHERE hash = ?1",
            params![hash],
            |r| r.get(0),
        )
        .with_context(|| format!("Missing tree blob {hash} referenced by a record"))?;
    ciborium::from_reader(data.as_slice()).context("Corrupt tree blob")
}

fn schema_is_initialized(conn: &Connection) -> Result<bool> {
    let version: i64 = conn
        .query_row("PRAGMA user_version", (), |r| r.get(0))
        .context("Couldn't read schema version")?;
    Ok(version >= 1)
}

fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS records (
            task_path TEXT NOT NULL PRIMARY KEY,
            version INTEGER NOT NULL,
            data BLOB NOT NULL,
            last_used INTEGER NOT NULL DEFAULT 0
        ) STRICT;
        CREATE TABLE IF NOT EXISTS tree_blobs (
            hash TEXT NOT NULL PRIMARY KEY,
            data BLOB NOT NULL,
            refcount INTEGER NOT NULL
        ) STRICT;
        PRAGMA user_version=1;",
    )
    .context("Couldn't create schema")?;
    Ok(())
}

/// A strictly increasing tick used for `last_used` ordering. Wall-clock time
/// would do for a single access far apart in time, but two `put`s in the same
/// process can land in the same millisecond; a monotonic counter keeps
/// eviction order deterministic regardless of clock resolution.
fn now_millis() -> i64 {
    static TICK: std::sync::atomic::AtomicI64 = std::sync::atomic::AtomicI64::new(0);
    TICK.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

/// §6's `maxEntries` knob: once a `put` would leave more than `max_entries`
/// rows in `records`, evict the least-recently-used ones (by `last_used`)
/// until back at the cap, releasing their tree-blob references the same way
/// an overwritten record's stale references are released.
fn evict_excess_entries(tx: &rusqlite::Transaction, max_entries: u64) -> Result<()> {
    let count: i64 = tx
        .query_row("SELECT COUNT(*) FROM records", (), |r| r.get(0))
        .context("Couldn't count records")?;
    let overflow = count - max_entries as i64;
    if overflow <= 0 {
        return Ok(());
    }

    let mut stmt = tx
        .prepare("SELECT task_path, data FROM records ORDER BY last_used ASC LIMIT ?1")
        .context("Couldn't prepare eviction query")?;
    let victims: Vec<(String, Vec<u8>)> = stmt
        .query_map(params![overflow], |r| Ok((r.get(0)?, r.get(1)?)))
        .context("Couldn't query eviction candidates")?
        .collect::<rusqlite::Result<_>>()
        .context("Couldn't read eviction candidates")?;
    drop(stmt);

    for (task_path, data) in victims {
        if let Ok(stored) = ciborium::from_reader::<StoredExecutionRecord, _>(data.as_slice()) {
            for hash in stored.referenced_hashes() {
                release_tree(tx, &hash)?;
            }
        }
        tx.execute("DELETE FROM records WHERE task_path = ?1", params![task_path])
            .context("Couldn't evict record")?;
        trace!("Evicted {task_path} from task history store (over max_entries)");
    }
    Ok(())
}

/// §5's convergence discipline: try to win the exclusive lock and
/// initialize; if we lose the race, fall back to a shared lock and
/// re-check whether someone else finished initializing. The re-check is
/// repeated (not cached after the first failure) so two processes racing
/// back and forth still converge.
fn ensure_schema(conn: &mut Connection, lock_file: &File) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "wal")
        .context("Couldn't set WAL journal mode")?;

    for attempt in 0..MAX_INIT_ATTEMPTS {
        match lock_file.try_lock_exclusive() {
            Ok(()) => {
                let result = (|| -> Result<()> {
                    if !schema_is_initialized(conn)? {
                        debug!("Initializing store schema (attempt {attempt})");
                        create_schema(conn)?;
                    }
                    Ok(())
                })();
                FileExt::unlock(lock_file).context("Couldn't release exclusive init lock")?;
                return result;
            }
            Err(_) => {
                // Someone else holds the exclusive lock, presumably
                // initializing. Wait for a shared lock (blocks until they
                // finish, whether they succeeded or bailed) and re-check —
                // never trust a cached "done" flag here.
                lock_file
                    .lock_shared()
                    .context("Couldn't acquire shared init-check lock")?;
                let initialized = schema_is_initialized(conn);
                FileExt::unlock(lock_file).context("Couldn't release shared init-check lock")?;
                if initialized? {
                    return Ok(());
                }
                warn!("Store schema still uninitialized after re-check, retrying (attempt {attempt})");
            }
        }
    }
    bail!("Couldn't converge on store schema initialization after {MAX_INIT_ATTEMPTS} attempts");
}
