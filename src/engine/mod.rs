//! The storage engine service context
//!
//! A single [`Engine`] value owns every subsystem: the ident registry,
//! the size storer, the MVCC tables, the journal and its flusher, the
//! checkpointer, the session cache, and the backup state. Background
//! threads hold weak back-references and die with the engine. Test code
//! constructs and owns an `Engine` directly; nothing here reaches for a
//! global.
//!
//! Startup loads the newest checkpoint image, replays the journal past
//! it, publishes the recovery timestamp as both stable and initial
//! data, and only then starts the background threads.

pub mod backup;
pub(crate) mod checkpoint;
pub mod journal;
pub mod registry;
pub mod sessions;
pub mod size_storer;
pub mod store;
pub mod timestamps;
pub mod txn;

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{BedrockError, Result};
use crate::types::{OpContext, ReadSource, RecordId, Timestamp};

use backup::{BackupCoordinator, BackupFile, BackupOptions};
use checkpoint::CheckpointEngine;
use journal::{Journal, JournalFlusher, JournalOp, JournalRecord};
use registry::{IdentRegistry, RecoveryOutcome};
use sessions::{SessionCache, SessionHandle};
use size_storer::SizeStorer;
use store::{CheckpointMode, RecordStore, Snapshot, TableConfig};
use timestamps::TimestampCoordinator;
use txn::{RecoveryUnit, TableTxn};

/// Engine configuration. Field names follow the options the server
/// layer recognizes.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Journaling on. Without it, durability comes from checkpoints
    /// alone.
    pub durable: bool,
    /// Keep everything in memory; no files are persisted.
    pub ephemeral: bool,
    /// Reject writes and run no background threads except the session
    /// sweeper.
    pub read_only: bool,
    /// Route unreadable table images through orphan recovery at open.
    pub repair: bool,
    pub cache_size_mb: u64,
    pub max_cache_overflow_file_size_mb: u64,
    /// Checkpointer loop period.
    pub checkpoint_interval_secs: u64,
    /// Journal flusher loop period.
    pub journal_commit_interval_ms: u64,
    /// Lag between stable and oldest; zero makes oldest follow stable.
    pub history_window_secs: u32,
    /// Session sweeper threshold.
    pub session_idle_timeout_ms: u64,
    /// Journal segment roll size.
    pub journal_segment_bytes: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            durable: true,
            ephemeral: false,
            read_only: false,
            repair: false,
            cache_size_mb: 256,
            max_cache_overflow_file_size_mb: 0,
            checkpoint_interval_secs: 60,
            journal_commit_interval_ms: 100,
            history_window_secs: 0,
            session_idle_timeout_ms: 30_000,
            journal_segment_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Durable marker describing the newest checkpoint: the timestamp it
/// was taken at (zero for untimestamped) and the commit sequence it
/// covers. Written atomically after the table images land.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct CheckpointMarker {
    stable: u64,
    seq: u64,
    wall_time_ms: u64,
}

fn wall_time_ms() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(dur) => dur.as_millis() as u64,
        Err(_) => 0,
    }
}

/// State shared between the engine facade, recovery units, and the
/// background threads (which hold it weakly).
pub(crate) struct EngineShared {
    pub(crate) config: EngineConfig,
    pub(crate) data_dir: PathBuf,
    pub(crate) registry: IdentRegistry,
    pub(crate) size_storer: SizeStorer,
    pub(crate) timestamps: TimestampCoordinator,
    pub(crate) journal: Arc<Journal>,
    pub(crate) backup: BackupCoordinator,
    flusher: Mutex<Option<Arc<JournalFlusher>>>,
    /// Commit sequence: the newest installed commit. Guarded by
    /// `commit_lock` for writers; readers load it for snapshots.
    sequence: AtomicU64,
    txn_tokens: AtomicU64,
    /// Serializes commit installs so they are atomic across tables.
    commit_lock: Mutex<()>,
    /// Held while a checkpoint runs; excludes explicit timestamp
    /// changes but not ordinary reads and writes.
    checkpoint_lock: Mutex<()>,
    /// Open snapshot sequence numbers (with refcounts); bounds history
    /// truncation.
    open_snapshots: Mutex<BTreeMap<u64, usize>>,
    /// Commit timestamps declared by transactions still in flight.
    pending_commit_ts: Mutex<BTreeMap<u64, usize>>,
    max_committed_ts: AtomicU64,
    shutting_down: AtomicBool,
    repl_recovery_complete: AtomicBool,
    recovery_timestamp: AtomicU64,
}

impl EngineShared {
    pub(crate) fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    pub(crate) fn next_txn_token(&self) -> u64 {
        self.txn_tokens.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn open_snapshot(&self, source: ReadSource) -> Result<Snapshot> {
        let read_ts = match source {
            ReadSource::NoTimestamp => None,
            ReadSource::Provided(ts) => {
                let oldest = self.timestamps.oldest();
                if ts < oldest {
                    return Err(BedrockError::InvalidOption(format!(
                        "read timestamp {} is older than the oldest timestamp {}",
                        ts, oldest
                    )));
                }
                Some(ts)
            }
            ReadSource::Majority => {
                let stable = self.timestamps.stable();
                (!stable.is_null()).then_some(stable)
            }
            ReadSource::LastApplied => {
                let ts = self.timestamps.last_applied();
                (!ts.is_null()).then_some(ts)
            }
            ReadSource::AllDurable => {
                let ts = self.all_durable();
                (!ts.is_null()).then_some(ts)
            }
        };
        let mut snapshots = self
            .open_snapshots
            .lock()
            .expect("snapshot registry lock poisoned");
        let seq = self.sequence.load(Ordering::Acquire);
        *snapshots.entry(seq).or_insert(0) += 1;
        Ok(Snapshot { seq, read_ts })
    }

    pub(crate) fn close_snapshot(&self, snapshot: Snapshot) {
        let mut snapshots = self
            .open_snapshots
            .lock()
            .expect("snapshot registry lock poisoned");
        if let Some(count) = snapshots.get_mut(&snapshot.seq) {
            *count -= 1;
            if *count == 0 {
                snapshots.remove(&snapshot.seq);
            }
        }
    }

    fn min_open_snapshot_seq(&self) -> u64 {
        self.open_snapshots
            .lock()
            .expect("snapshot registry lock poisoned")
            .keys()
            .next()
            .copied()
            .unwrap_or(u64::MAX)
    }

    pub(crate) fn register_pending_commit_ts(&self, ts: Timestamp) {
        let mut pending = self
            .pending_commit_ts
            .lock()
            .expect("pending timestamps lock poisoned");
        *pending.entry(ts.as_u64()).or_insert(0) += 1;
    }

    pub(crate) fn unregister_pending_commit_ts(&self, ts: Timestamp) {
        let mut pending = self
            .pending_commit_ts
            .lock()
            .expect("pending timestamps lock poisoned");
        if let Some(count) = pending.get_mut(&ts.as_u64()) {
            *count -= 1;
            if *count == 0 {
                pending.remove(&ts.as_u64());
            }
        }
    }

    pub(crate) fn oldest_active_txn_ts(&self) -> Option<Timestamp> {
        self.pending_commit_ts
            .lock()
            .expect("pending timestamps lock poisoned")
            .keys()
            .next()
            .map(|raw| Timestamp::from_u64(*raw))
    }

    /// Largest timestamp with every commit at or before it durable:
    /// one less than the earliest in-flight commit timestamp, or the
    /// newest committed timestamp when nothing is in flight. Floored by
    /// the coordinator so it never regresses.
    pub(crate) fn all_durable(&self) -> Timestamp {
        let derived = match self.oldest_active_txn_ts() {
            Some(pending) => Timestamp::from_u64(pending.as_u64().saturating_sub(1)),
            None => Timestamp::from_u64(self.max_committed_ts.load(Ordering::Acquire)),
        };
        self.timestamps.all_durable(derived)
    }

    /// Install a committed transaction: journal first, then version
    /// installs, atomically with respect to snapshots and checkpoints.
    pub(crate) fn commit_install(
        &self,
        tables: &mut HashMap<String, TableTxn>,
        commit_ts: Option<Timestamp>,
        token: u64,
    ) -> Result<u64> {
        if let Some(ts) = commit_ts {
            let oldest = self.timestamps.oldest();
            if ts < oldest {
                return Err(BedrockError::InvalidOption(format!(
                    "commit timestamp {} is older than the oldest timestamp {}",
                    ts, oldest
                )));
            }
        }

        let nonempty = tables.values().any(|txn| !txn.is_empty());
        let guard = self.commit_lock.lock().expect("commit lock poisoned");
        let seq = if nonempty {
            let seq = self.sequence.load(Ordering::Acquire) + 1;

            let mut ops = Vec::new();
            for (ident, txn) in tables.iter() {
                if txn.truncate {
                    ops.push(JournalOp::Truncate {
                        ident: ident.clone(),
                    });
                }
                for (id, pending) in &txn.puts {
                    let op = match &pending.data {
                        Some(data) if pending.created => JournalOp::Insert {
                            ident: ident.clone(),
                            id: id.0,
                            data: data.to_vec(),
                        },
                        Some(data) => JournalOp::Update {
                            ident: ident.clone(),
                            id: id.0,
                            data: data.to_vec(),
                        },
                        None => JournalOp::Delete {
                            ident: ident.clone(),
                            id: id.0,
                        },
                    };
                    ops.push(op);
                }
            }
            self.journal.append(&JournalRecord {
                seq,
                commit_ts,
                ops,
            })?;

            for (ident, txn) in tables.iter() {
                txn.table.install(&txn.puts, txn.truncate, seq, commit_ts);
                self.size_storer.adjust(ident, txn.size_delta);
            }
            // Publish only after every table is installed.
            self.sequence.store(seq, Ordering::Release);
            seq
        } else {
            self.sequence.load(Ordering::Acquire)
        };

        for txn in tables.values() {
            txn.table.release_claims(token, &txn.claims);
        }
        tables.clear();
        if let Some(ts) = commit_ts {
            self.max_committed_ts.fetch_max(ts.as_u64(), Ordering::AcqRel);
        }
        drop(guard);
        Ok(seq)
    }

    /// Block until the durable sequence covers `target`, riding the
    /// flusher's rounds. Without a flusher (read-only, ephemeral,
    /// non-durable) the sync happens inline.
    pub(crate) fn wait_until_durable_seq(&self, ctx: &OpContext, target: u64) -> Result<()> {
        loop {
            if self.journal.durable_seq() >= target {
                return Ok(());
            }
            ctx.check()?;
            let flusher = self
                .flusher
                .lock()
                .expect("flusher slot lock poisoned")
                .clone();
            match flusher {
                Some(flusher) => flusher.wait_for_flush(Some(ctx))?,
                None => self.journal.sync()?,
            }
        }
    }

    pub(crate) fn backup_active(&self) -> bool {
        self.backup.is_active()
    }

    /// What live replication rollback would replay from: exactly the
    /// stable timestamp.
    pub(crate) fn oplog_needed_for_rollback(&self) -> Timestamp {
        self.timestamps.stable()
    }

    /// Truncate version history no legal snapshot can read.
    pub(crate) fn history_pass(&self) {
        let oldest = self.timestamps.oldest();
        if oldest.is_null() {
            return;
        }
        let min_open = self.min_open_snapshot_seq();
        let mut removed = 0;
        for (_, table) in self.registry.all_tables() {
            removed += table.discard_history(oldest, min_open);
        }
        if removed > 0 {
            log::debug!("discarded {} unreachable record versions", removed);
        }
    }

    fn checkpoint_marker_path(&self) -> PathBuf {
        self.data_dir.join("checkpoint.json")
    }

    /// Write a checkpoint: every table image, the size storer, the
    /// catalog, then the marker as the commit point.
    pub(crate) fn take_checkpoint(&self, mode: CheckpointMode) -> Result<Timestamp> {
        let _checkpoint_guard = self
            .checkpoint_lock
            .lock()
            .expect("checkpoint lock poisoned");

        // A consistent boundary: commits at or below this sequence are
        // fully installed.
        let cp_seq = {
            let _commit_guard = self.commit_lock.lock().expect("commit lock poisoned");
            self.sequence.load(Ordering::Acquire)
        };
        let cp_ts = match mode {
            CheckpointMode::Full => Timestamp::MIN,
            CheckpointMode::Stable(ts) => ts,
        };

        if !self.config.ephemeral {
            for (ident, table) in self.registry.all_tables() {
                let path = self.registry.table_path(&ident);
                table.write_image(&path, mode, cp_seq)?;
            }
            self.registry.save_catalog()?;
        }
        self.size_storer.flush(true)?;

        if !self.config.ephemeral {
            let marker = CheckpointMarker {
                stable: cp_ts.as_u64(),
                seq: cp_seq,
                wall_time_ms: wall_time_ms(),
            };
            let tmp = tempfile::NamedTempFile::new_in(&self.data_dir)?;
            serde_json::to_writer_pretty(tmp.as_file(), &marker)?;
            tmp.as_file().sync_data()?;
            tmp.persist(self.checkpoint_marker_path())
                .map_err(|e| BedrockError::Io(e.error))?;
        }

        log::debug!("checkpoint complete at {} (seq {})", cp_ts, cp_seq);
        Ok(cp_ts)
    }

    /// Every file a full backup must copy.
    fn backup_file_set(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for name in ["catalog.json", "size_storer.json", "checkpoint.json"] {
            let path = self.data_dir.join(name);
            if path.exists() {
                files.push(path);
            }
        }
        for (ident, _) in self.registry.all_tables() {
            let path = self.registry.table_path(&ident);
            if path.exists() {
                files.push(path);
            }
        }
        files.extend(self.journal.segment_paths().into_iter().filter(|p| p.exists()));
        files.sort();
        files
    }
}

/// The storage durability core. Owns the data directory and every
/// background thread; dropping it shuts everything down cleanly.
pub struct Engine {
    shared: Arc<EngineShared>,
    checkpointer: Mutex<Option<CheckpointEngine>>,
    session_cache: Arc<SessionCache>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Open (or create) an engine over `data_dir`, running crash
    /// recovery before anything else sees the data.
    pub fn open(data_dir: &Path, config: EngineConfig) -> Result<Self> {
        if !config.ephemeral {
            fs::create_dir_all(data_dir)?;
        }
        log::info!(
            "opening engine at {:?} (durable {}, ephemeral {}, read-only {}, cache {} MB, overflow {} MB)",
            data_dir,
            config.durable,
            config.ephemeral,
            config.read_only,
            config.cache_size_mb,
            config.max_cache_overflow_file_size_mb,
        );
        let journal_enabled = config.durable && !config.ephemeral && !config.read_only;
        let journal = Arc::new(Journal::open(
            data_dir,
            journal_enabled,
            config.journal_segment_bytes,
        )?);
        let size_storer = SizeStorer::open(data_dir, config.ephemeral)?;
        let (registry, repaired) = IdentRegistry::open(data_dir, config.ephemeral, config.repair)?;
        for (ident, outcome) in &repaired {
            log::warn!("repair modified ident '{}': {:?}", ident, outcome);
        }

        let marker = Self::read_checkpoint_marker(data_dir)?;
        let recovery_ts = Timestamp::from_u64(marker.stable);

        let shared = Arc::new(EngineShared {
            timestamps: TimestampCoordinator::new(config.history_window_secs),
            data_dir: data_dir.to_path_buf(),
            registry,
            size_storer,
            journal: Arc::clone(&journal),
            backup: BackupCoordinator::new(),
            flusher: Mutex::new(None),
            sequence: AtomicU64::new(marker.seq),
            txn_tokens: AtomicU64::new(0),
            commit_lock: Mutex::new(()),
            checkpoint_lock: Mutex::new(()),
            open_snapshots: Mutex::new(BTreeMap::new()),
            pending_commit_ts: Mutex::new(BTreeMap::new()),
            max_committed_ts: AtomicU64::new(marker.stable),
            shutting_down: AtomicBool::new(false),
            repl_recovery_complete: AtomicBool::new(false),
            recovery_timestamp: AtomicU64::new(marker.stable),
            config,
        });

        if !shared.config.read_only && !shared.config.ephemeral {
            Self::replay_journal(&shared, marker.seq)?;
        }

        if !recovery_ts.is_null() {
            log::info!("publishing recovery timestamp {}", recovery_ts);
            shared.timestamps.set_initial_data(recovery_ts);
            shared.timestamps.set_stable(recovery_ts, false);
        }

        let session_cache = SessionCache::new(Duration::from_millis(
            shared.config.session_idle_timeout_ms,
        ));
        let sweeper = session_cache.start_sweeper();

        let engine = Self {
            shared,
            checkpointer: Mutex::new(None),
            session_cache,
            sweeper: Mutex::new(Some(sweeper)),
        };
        engine.start_background_threads();
        Ok(engine)
    }

    fn read_checkpoint_marker(data_dir: &Path) -> Result<CheckpointMarker> {
        let path = data_dir.join("checkpoint.json");
        if !path.exists() {
            return Ok(CheckpointMarker::default());
        }
        let file = File::open(&path)?;
        serde_json::from_reader(file).map_err(|e| {
            BedrockError::Corruption(format!(
                "failed to parse checkpoint marker '{}': {}",
                path.display(),
                e
            ))
        })
    }

    fn replay_journal(shared: &Arc<EngineShared>, after_seq: u64) -> Result<()> {
        let summary = Journal::replay(&shared.data_dir, after_seq, |record| {
            for op in record.ops {
                match op {
                    JournalOp::Insert { ident, id, data }
                    | JournalOp::Update { ident, id, data } => {
                        match shared.registry.get(&ident) {
                            Some(table) => table.apply_recovered(
                                RecordId(id),
                                Some(Bytes::from(data)),
                                record.seq,
                                record.commit_ts,
                            ),
                            None => log::warn!(
                                "journal names unknown ident '{}', skipping record",
                                ident
                            ),
                        }
                    }
                    JournalOp::Delete { ident, id } => {
                        if let Some(table) = shared.registry.get(&ident) {
                            table.apply_recovered(
                                RecordId(id),
                                None,
                                record.seq,
                                record.commit_ts,
                            );
                        }
                    }
                    JournalOp::Truncate { ident } => {
                        if let Some(table) = shared.registry.get(&ident) {
                            table.clear_all();
                        }
                    }
                }
            }
            Ok(())
        })?;

        if summary.max_seq > after_seq {
            shared.sequence.store(summary.max_seq, Ordering::Release);
        }
        shared
            .max_committed_ts
            .fetch_max(summary.max_commit_ts.as_u64(), Ordering::AcqRel);
        shared
            .journal
            .note_recovered(summary.max_seq.max(after_seq), summary.max_commit_ts);
        shared
            .journal
            .bound_recovered_segments(summary.max_commit_ts);

        if summary.applied > 0 {
            log::info!("replayed {} journal records", summary.applied);
            // Replay ran outside the usual commit path; reconcile the
            // size storer from the live tables.
            shared.size_storer.rebuild(shared.registry.live_sizes());
            shared.size_storer.flush(false)?;
        }
        Ok(())
    }

    fn start_background_threads(&self) {
        if self.shared.config.read_only {
            return;
        }
        if self.shared.config.durable && !self.shared.config.ephemeral {
            let flusher = Arc::new(JournalFlusher::start(
                Arc::clone(&self.shared.journal),
                Duration::from_millis(self.shared.config.journal_commit_interval_ms),
            ));
            *self.shared.flusher.lock().expect("flusher slot lock poisoned") = Some(flusher);
        }
        if !self.shared.config.ephemeral {
            let checkpointer = CheckpointEngine::start(
                Arc::downgrade(&self.shared),
                Duration::from_secs(self.shared.config.checkpoint_interval_secs),
            );
            *self.checkpointer.lock().expect("checkpointer slot poisoned") = Some(checkpointer);
        }
    }

    fn stop_background_threads(&self) {
        if let Some(checkpointer) = self
            .checkpointer
            .lock()
            .expect("checkpointer slot poisoned")
            .take()
        {
            checkpointer.shutdown();
        }
        let flusher = self
            .shared
            .flusher
            .lock()
            .expect("flusher slot lock poisoned")
            .take();
        if let Some(flusher) = flusher {
            flusher.shutdown();
        }
    }

    // ---- transactions ----

    pub fn new_recovery_unit(&self) -> RecoveryUnit {
        RecoveryUnit::new(Arc::clone(&self.shared))
    }

    // ---- ident lifecycle ----

    /// Create a record store for `ident`.
    pub fn create_record_store(&self, ident: &str, config: TableConfig) -> Result<RecordStore> {
        if self.shared.is_read_only() {
            return Err(BedrockError::InvalidOption(
                "engine is opened read-only".into(),
            ));
        }
        let table = self.shared.registry.create_table(ident, config)?;
        Ok(RecordStore::new(table))
    }

    /// Create the backing table for a sorted-data interface (an index
    /// ident). Indexes store packed keys as record payloads; the table
    /// machinery is identical.
    pub fn create_sorted_data_interface(
        &self,
        ident: &str,
        config: TableConfig,
    ) -> Result<RecordStore> {
        self.create_record_store(ident, config)
    }

    pub fn record_store(&self, ident: &str) -> Result<RecordStore> {
        self.shared
            .registry
            .get(ident)
            .map(RecordStore::new)
            .ok_or_else(|| BedrockError::ident_not_found(ident))
    }

    /// Resolve a record store through a session's cursor cache.
    pub fn record_store_cached(
        &self,
        session: &mut SessionHandle,
        ident: &str,
    ) -> Result<RecordStore> {
        if let Some(table) = session.cached_table(ident) {
            if !table.is_dropped() {
                return Ok(RecordStore::new(table));
            }
        }
        let table = self
            .shared
            .registry
            .get(ident)
            .ok_or_else(|| BedrockError::ident_not_found(ident))?;
        session.cache_table(ident, Arc::clone(&table));
        Ok(RecordStore::new(table))
    }

    pub fn has_ident(&self, ident: &str) -> bool {
        self.shared.registry.has(ident)
    }

    pub fn list_idents(&self) -> Vec<String> {
        self.shared.registry.list_all()
    }

    /// Drop an ident. Cached cursors are invalidated first; the
    /// physical drop defers to the pending queue while anything still
    /// references the table.
    pub fn drop_ident(&self, ident: &str) -> Result<()> {
        if self.shared.is_read_only() {
            return Err(BedrockError::InvalidOption(
                "engine is opened read-only".into(),
            ));
        }
        self.session_cache.close_all_cursors(ident);
        self.shared
            .registry
            .drop_table(ident, self.shared.backup_active())?;
        self.shared.size_storer.remove(ident);
        Ok(())
    }

    pub fn have_drops_queued(&self) -> bool {
        self.shared.registry.have_drops_queued()
    }

    /// Retry queued drops now (the checkpointer also does this each
    /// pass).
    pub fn drain_pending_drops(&self) -> usize {
        self.shared
            .registry
            .drain_pending_drops(self.shared.backup_active())
    }

    /// The size storer's view of an ident: last flushed totals plus
    /// buffered deltas.
    pub fn size_info(&self, ident: &str) -> crate::types::SizeInfo {
        self.shared.size_storer.get(ident)
    }

    /// Repair-mode orphan recovery for one ident.
    pub fn recover_orphan(&self, ident: &str) -> Result<RecoveryOutcome> {
        self.shared
            .registry
            .recover_orphan(ident, self.shared.config.repair)
    }

    // ---- sessions ----

    pub fn acquire_session(&self) -> SessionHandle {
        self.session_cache.acquire_session()
    }

    pub fn session_cache(&self) -> &Arc<SessionCache> {
        &self.session_cache
    }

    // ---- timestamps ----

    pub fn set_stable_timestamp(&self, ts: Timestamp, force: bool) -> Result<()> {
        if ts.is_null() {
            return Ok(());
        }
        let initial_data = self.shared.timestamps.initial_data();
        let update = {
            let _guard = self
                .shared
                .checkpoint_lock
                .lock()
                .expect("checkpoint lock poisoned");
            self.shared.timestamps.set_stable(ts, force)
        };
        if update.applied {
            if let Some(checkpointer) = &*self
                .checkpointer
                .lock()
                .expect("checkpointer slot poisoned")
            {
                if !checkpointer.has_triggered_first_stable() {
                    checkpointer.maybe_trigger_first_stable(update.prev, initial_data, ts);
                }
            }
        }
        Ok(())
    }

    pub fn set_oldest_timestamp(&self, ts: Timestamp, force: bool) -> Result<()> {
        let _guard = self
            .shared
            .checkpoint_lock
            .lock()
            .expect("checkpoint lock poisoned");
        self.shared.timestamps.set_oldest(ts, force);
        Ok(())
    }

    pub fn set_initial_data_timestamp(&self, ts: Timestamp) -> Result<()> {
        self.shared.timestamps.set_initial_data(ts);
        Ok(())
    }

    pub fn stable_timestamp(&self) -> Timestamp {
        self.shared.timestamps.stable()
    }

    pub fn oldest_timestamp(&self) -> Timestamp {
        self.shared.timestamps.oldest()
    }

    pub fn initial_data_timestamp(&self) -> Timestamp {
        self.shared.timestamps.initial_data()
    }

    pub fn get_all_durable_timestamp(&self) -> Timestamp {
        self.shared.all_durable()
    }

    pub fn get_oldest_active_txn_timestamp(&self) -> Option<Timestamp> {
        self.shared.oldest_active_txn_ts()
    }

    /// Published by the replication layer; backs `LastApplied` reads.
    pub fn set_last_applied_timestamp(&self, ts: Timestamp) {
        self.shared.timestamps.set_last_applied(ts);
    }

    // ---- journal ----

    /// Force a journal flush and wait for it.
    pub fn flush_journal(&self, ctx: &OpContext) -> Result<()> {
        let flusher = self
            .shared
            .flusher
            .lock()
            .expect("flusher slot lock poisoned")
            .clone();
        match flusher {
            Some(flusher) => flusher.wait_for_flush(Some(ctx)),
            None => self.shared.journal.sync(),
        }
    }

    /// Request a flush without waiting.
    pub fn trigger_journal_flush(&self) {
        if let Some(flusher) = &*self
            .shared
            .flusher
            .lock()
            .expect("flusher slot lock poisoned")
        {
            flusher.trigger_flush();
        }
    }

    /// Interrupt the in-flight flush round for a replication state
    /// change.
    pub fn interrupt_journal_flusher_for_state_change(&self) {
        if let Some(flusher) = &*self
            .shared
            .flusher
            .lock()
            .expect("flusher slot lock poisoned")
        {
            flusher.interrupt_for_state_change();
        }
    }

    // ---- checkpoints ----

    /// Take a checkpoint now, using the same decision the background
    /// loop applies.
    pub fn checkpoint_now(&self) -> Result<Timestamp> {
        if self.shared.is_read_only() {
            return Err(BedrockError::InvalidOption(
                "engine is opened read-only".into(),
            ));
        }
        let stable = self.shared.timestamps.stable();
        let initial_data = self.shared.timestamps.initial_data();
        if initial_data.allows_unstable_checkpoints() {
            self.shared.take_checkpoint(CheckpointMode::Full)
        } else if stable < initial_data {
            Err(BedrockError::InvalidOption(format!(
                "stable {} is behind initial data {}; checkpoint would be invalid",
                stable, initial_data
            )))
        } else {
            self.shared.take_checkpoint(CheckpointMode::Stable(stable))
        }
    }

    /// Wake the checkpointer for an immediate pass.
    pub fn trigger_checkpoint(&self) {
        if let Some(checkpointer) = &*self
            .checkpointer
            .lock()
            .expect("checkpointer slot poisoned")
        {
            checkpointer.trigger_checkpoint();
        }
    }

    /// Newest point the journal must reach back to after a crash, as
    /// published by the last stable checkpoint.
    pub fn oplog_needed_for_crash_recovery(&self) -> Timestamp {
        self.checkpointer
            .lock()
            .expect("checkpointer slot poisoned")
            .as_ref()
            .map(|cp| cp.oplog_needed_for_crash_recovery())
            .unwrap_or(Timestamp::MIN)
    }

    /// Discard every write after the stable timestamp and restart the
    /// background threads over the rolled-back state.
    pub fn rollback_to_stable(&self) -> Result<Timestamp> {
        let initial_data = self.shared.timestamps.initial_data();
        if initial_data.allows_unstable_checkpoints() {
            return Err(BedrockError::UnrecoverableRollback(
                "dataset is incomplete; no initial data timestamp".into(),
            ));
        }
        let stable = self.shared.timestamps.stable();
        if stable < initial_data {
            return Err(BedrockError::UnrecoverableRollback(format!(
                "no stable timestamp to recover to (initial data {}, stable {})",
                initial_data, stable
            )));
        }

        log::info!("rolling back to the stable timestamp {}", stable);
        self.shared.size_storer.flush(true)?;
        self.stop_background_threads();

        for (_, table) in self.shared.registry.all_tables() {
            table.rollback_to_stable(stable);
        }
        self.shared
            .max_committed_ts
            .store(stable.as_u64(), Ordering::Release);

        // The rolled-back state must be the one a crash recovers to:
        // checkpoint it and retire the journal, which still holds the
        // discarded writes.
        self.shared
            .take_checkpoint(CheckpointMode::Stable(stable))
            .map_err(|e| {
                BedrockError::UnrecoverableRollback(format!(
                    "checkpoint after rollback failed: {}",
                    e
                ))
            })?;
        self.shared.journal.truncate_all()?;

        self.shared
            .size_storer
            .rebuild(self.shared.registry.live_sizes());
        self.shared.size_storer.flush(true)?;

        self.start_background_threads();
        Ok(stable)
    }

    // ---- backup ----

    /// Open a backup cursor over the engine's files.
    pub fn begin_backup(&self) -> Result<Vec<BackupFile>> {
        if self.shared.config.ephemeral {
            return Err(BedrockError::InvalidOption(
                "the in-memory engine cannot create a backup cursor".into(),
            ));
        }
        self.shared.size_storer.flush(true)?;
        let files = self.shared.backup_file_set();
        self.shared.backup.begin(
            files,
            None,
            self.shared.journal.current_segment_index(),
            &BackupOptions::default(),
        )
    }

    /// Open a backup cursor that also pins the published
    /// crash-recovery point for its duration; incremental options
    /// produce per-file changed-block lists.
    pub fn begin_non_blocking_backup(&self, options: &BackupOptions) -> Result<Vec<BackupFile>> {
        if self.shared.config.ephemeral {
            return Err(BedrockError::InvalidOption(
                "the in-memory engine cannot create a backup cursor".into(),
            ));
        }
        let pin = self.oplog_needed_for_crash_recovery();
        self.shared.size_storer.flush(true)?;
        let files = self.shared.backup_file_set();
        self.shared.backup.begin(
            files,
            Some(pin),
            self.shared.journal.current_segment_index(),
            options,
        )
    }

    /// Journal files generated since the backup began, for syncing a
    /// multi-node backup to a common point.
    pub fn extend_backup_cursor(&self) -> Result<Vec<PathBuf>> {
        let floor = self.shared.backup.journal_floor().ok_or_else(|| {
            BedrockError::InvalidOption("no backup cursor is open".into())
        })?;
        Ok(self.shared.journal.segments_since(floor))
    }

    pub fn end_backup(&self) -> Result<()> {
        self.shared.backup.end()
    }

    /// Drop all incremental backup tracking state.
    pub fn disable_incremental_backup(&self) -> Result<()> {
        if self.shared.config.ephemeral {
            return Err(BedrockError::InvalidOption(
                "the in-memory engine cannot create a backup cursor".into(),
            ));
        }
        self.shared.backup.disable_incremental();
        Ok(())
    }

    // ---- downgrade ----

    /// The recovery timestamp published at open, if any.
    pub fn recovery_timestamp(&self) -> Option<Timestamp> {
        let raw = self.shared.recovery_timestamp.load(Ordering::Acquire);
        (raw != 0).then(|| Timestamp::from_u64(raw))
    }

    pub fn mark_replication_recovery_complete(&self) {
        self.shared
            .repl_recovery_complete
            .store(true, Ordering::Release);
    }

    /// Final checkpoint plus compatibility rewrite, gating a binary
    /// downgrade. Refused while a recovery timestamp exists and
    /// replication recovery has not run.
    pub fn prepare_for_downgrade(&self, compatibility: &str) -> Result<()> {
        if self.recovery_timestamp().is_some()
            && !self.shared.repl_recovery_complete.load(Ordering::Acquire)
        {
            return Err(BedrockError::InvalidOption(
                "downgrade requires replication recovery after a recovery timestamp".into(),
            ));
        }
        self.checkpoint_now()?;
        self.shared.registry.set_compatibility(compatibility)
    }

    pub fn compatibility(&self) -> String {
        self.shared.registry.compatibility()
    }

    /// Clean shutdown: stop the background threads, take a final
    /// checkpoint, sync the journal. Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("engine shutting down");
        self.stop_background_threads();
        if !self.shared.config.read_only {
            if let Err(e) = self.checkpoint_now() {
                log::warn!("final checkpoint failed: {}", e);
            }
            if let Err(e) = self.shared.journal.sync() {
                log::warn!("final journal sync failed: {}", e);
            }
        }
        self.session_cache.shutdown();
        if let Some(sweeper) = self.sweeper.lock().expect("sweeper slot poisoned").take() {
            let _ = sweeper.join();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::txn::WriteUnitOfWork;
    use crate::error::ErrorKind;
    use tempfile::tempdir;

    fn quick_config() -> EngineConfig {
        EngineConfig {
            journal_commit_interval_ms: 20,
            ..Default::default()
        }
    }

    fn commit_one(engine: &Engine, rs: &RecordStore, data: &[u8]) -> RecordId {
        let ru = engine.new_recovery_unit();
        let wuow = WriteUnitOfWork::new(&ru).unwrap();
        let id = rs.insert(&ru, data).unwrap();
        wuow.commit().unwrap();
        id
    }

    fn commit_one_at(
        engine: &Engine,
        rs: &RecordStore,
        data: &[u8],
        ts: Timestamp,
    ) -> RecordId {
        let ru = engine.new_recovery_unit();
        let wuow = WriteUnitOfWork::new(&ru).unwrap();
        let id = rs.insert(&ru, data).unwrap();
        ru.set_timestamp(ts).unwrap();
        wuow.commit().unwrap();
        id
    }

    #[test]
    fn test_open_create_insert_reopen() {
        let dir = tempdir().unwrap();
        let id;
        {
            let engine = Engine::open(dir.path(), quick_config()).unwrap();
            let rs = engine
                .create_record_store("t1", TableConfig::default())
                .unwrap();
            id = commit_one(&engine, &rs, b"alpha");
            // Clean shutdown checkpoints.
        }
        let engine = Engine::open(dir.path(), quick_config()).unwrap();
        let rs = engine.record_store("t1").unwrap();
        let ru = engine.new_recovery_unit();
        assert_eq!(rs.find(&ru, id).unwrap(), &b"alpha"[..]);
    }

    #[test]
    fn test_journal_replay_recovers_unchecked_commits() {
        let dir = tempdir().unwrap();
        let id;
        {
            let engine = Engine::open(dir.path(), quick_config()).unwrap();
            let rs = engine
                .create_record_store("t1", TableConfig::default())
                .unwrap();
            id = commit_one(&engine, &rs, b"survives");
            let ctx = OpContext::new();
            engine.flush_journal(&ctx).unwrap();
            // Simulate a crash: suppress the clean-shutdown checkpoint
            // so recovery has to come from the journal.
            engine.shared.shutting_down.store(true, Ordering::Release);
        }
        let engine = Engine::open(dir.path(), quick_config()).unwrap();
        let rs = engine.record_store("t1").unwrap();
        let ru = engine.new_recovery_unit();
        assert_eq!(rs.find(&ru, id).unwrap(), &b"survives"[..]);

        let info = engine.shared.size_storer.get("t1");
        assert_eq!(info.num_records, 1);
    }

    #[test]
    fn test_recovery_timestamp_published_as_stable_and_initial() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::open(dir.path(), quick_config()).unwrap();
            let rs = engine
                .create_record_store("t1", TableConfig::default())
                .unwrap();
            engine
                .set_initial_data_timestamp(Timestamp::new(50, 0))
                .unwrap();
            commit_one_at(&engine, &rs, b"x", Timestamp::new(80, 0));
            engine
                .set_stable_timestamp(Timestamp::new(80, 0), false)
                .unwrap();
            engine.checkpoint_now().unwrap();
        }
        let engine = Engine::open(dir.path(), quick_config()).unwrap();
        assert_eq!(engine.stable_timestamp(), Timestamp::new(80, 0));
        assert_eq!(engine.initial_data_timestamp(), Timestamp::new(80, 0));
        assert_eq!(engine.recovery_timestamp(), Some(Timestamp::new(80, 0)));
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::open(dir.path(), quick_config()).unwrap();
            engine
                .create_record_store("t1", TableConfig::default())
                .unwrap();
        }
        let config = EngineConfig {
            read_only: true,
            ..quick_config()
        };
        let engine = Engine::open(dir.path(), config).unwrap();
        assert!(engine
            .create_record_store("t2", TableConfig::default())
            .is_err());
        assert!(engine.drop_ident("t1").is_err());

        let rs = engine.record_store("t1").unwrap();
        let ru = engine.new_recovery_unit();
        let _wuow = WriteUnitOfWork::new(&ru).unwrap();
        assert_eq!(
            rs.insert(&ru, b"x").unwrap_err().kind(),
            ErrorKind::InvalidOption
        );
    }

    #[test]
    fn test_ephemeral_leaves_no_files() {
        let dir = tempdir().unwrap();
        let config = EngineConfig {
            ephemeral: true,
            ..quick_config()
        };
        let engine = Engine::open(dir.path(), config).unwrap();
        let rs = engine
            .create_record_store("t1", TableConfig::default())
            .unwrap();
        let id = commit_one(&engine, &rs, b"memory-only");
        let ru = engine.new_recovery_unit();
        assert_eq!(rs.find(&ru, id).unwrap(), &b"memory-only"[..]);
        drop(ru);
        drop(engine);
        assert!(!dir.path().join("catalog.json").exists());
        assert!(!dir.path().join("journal").exists());
    }

    #[test]
    fn test_all_durable_derivation() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), quick_config()).unwrap();
        let rs = engine
            .create_record_store("t1", TableConfig::default())
            .unwrap();

        commit_one_at(&engine, &rs, b"a", Timestamp::new(10, 0));
        assert_eq!(engine.get_all_durable_timestamp(), Timestamp::new(10, 0));

        // An open transaction with a declared timestamp holds
        // all-durable just below it.
        let ru = engine.new_recovery_unit();
        let wuow = WriteUnitOfWork::new(&ru).unwrap();
        rs.insert(&ru, b"b").unwrap();
        ru.set_timestamp(Timestamp::new(20, 0)).unwrap();
        assert_eq!(
            engine.get_all_durable_timestamp(),
            Timestamp::from_u64(Timestamp::new(20, 0).as_u64() - 1)
        );
        assert_eq!(
            engine.get_oldest_active_txn_timestamp(),
            Some(Timestamp::new(20, 0))
        );
        wuow.commit().unwrap();
        assert_eq!(engine.get_all_durable_timestamp(), Timestamp::new(20, 0));
    }

    #[test]
    fn test_wait_until_durable_after_commit() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), quick_config()).unwrap();
        let rs = engine
            .create_record_store("t1", TableConfig::default())
            .unwrap();

        let ru = engine.new_recovery_unit();
        let wuow = WriteUnitOfWork::new(&ru).unwrap();
        rs.insert(&ru, b"durable").unwrap();
        wuow.commit().unwrap();

        let ctx = OpContext::new();
        ru.wait_until_durable(&ctx).unwrap();
        assert!(engine.shared.journal.durable_seq() >= 1);
    }

    #[test]
    fn test_prepare_for_downgrade_gate() {
        let dir = tempdir().unwrap();
        {
            let engine = Engine::open(dir.path(), quick_config()).unwrap();
            let rs = engine
                .create_record_store("t1", TableConfig::default())
                .unwrap();
            engine
                .set_initial_data_timestamp(Timestamp::new(10, 0))
                .unwrap();
            commit_one_at(&engine, &rs, b"x", Timestamp::new(10, 0));
            engine
                .set_stable_timestamp(Timestamp::new(10, 0), false)
                .unwrap();
            engine.checkpoint_now().unwrap();
        }
        let engine = Engine::open(dir.path(), quick_config()).unwrap();
        assert!(engine.recovery_timestamp().is_some());
        // Blocked until replication recovery is acknowledged.
        assert_eq!(
            engine.prepare_for_downgrade("compat-4.2").unwrap_err().kind(),
            ErrorKind::InvalidOption
        );
        engine.mark_replication_recovery_complete();
        engine.prepare_for_downgrade("compat-4.2").unwrap();
        assert_eq!(engine.compatibility(), "compat-4.2");
    }

    #[test]
    fn test_session_cached_record_store() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), quick_config()).unwrap();
        engine
            .create_record_store("t1", TableConfig::default())
            .unwrap();

        let mut session = engine.acquire_session();
        engine.record_store_cached(&mut session, "t1").unwrap();
        assert_eq!(session.cached_count(), 1);
        // Cache hit on the second resolve.
        engine.record_store_cached(&mut session, "t1").unwrap();

        // The drop path invalidates the cached handle.
        engine.drop_ident("t1").unwrap();
        assert!(engine.record_store_cached(&mut session, "t1").is_err());
    }
}
