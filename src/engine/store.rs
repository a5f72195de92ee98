//! MVCC record tables and the per-table record store API
//!
//! Each ident owns a [`Table`]: an ordered map of record id to version
//! chain. Versions carry the commit sequence that installed them and an
//! optional commit timestamp. Uncommitted writes never touch the table;
//! they live in the owning transaction's buffer and are installed
//! atomically at commit. Write-write conflicts are detected eagerly with
//! per-record claims, first writer wins.
//!
//! [`RecordStore`] is the handle handed to operations: insert, update,
//! delete, point lookup, scans with save/restore, capped eviction, and
//! the oplog variant keyed by caller-provided timestamps.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{BedrockError, Result};
use crate::types::{OpContext, RecordId, SizeInfo, Timestamp};

use super::txn::RecoveryUnit;

/// Scan direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Per-table creation options. The registry treats the serialized form
/// as an opaque config string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Records are keyed by caller-provided timestamp ids and duplicate
    /// ids are rejected.
    pub oplog: bool,
    /// Ring-buffer byte bound; oldest records are evicted on insert.
    pub capped_max_size: Option<i64>,
    /// Ring-buffer record-count bound.
    pub capped_max_count: Option<i64>,
}

impl TableConfig {
    pub fn is_capped(&self) -> bool {
        self.capped_max_size.is_some() || self.capped_max_count.is_some()
    }
}

/// What a transaction reads: commits installed at or before `seq`, and,
/// when a read timestamp is chosen, only commits stamped at or before
/// it. Untimestamped commits are visible to every snapshot that covers
/// their sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub seq: u64,
    pub read_ts: Option<Timestamp>,
}

impl Snapshot {
    fn sees(&self, version: &Version) -> bool {
        if version.seq > self.seq {
            return false;
        }
        match (self.read_ts, version.commit_ts) {
            (Some(read_ts), Some(commit_ts)) => commit_ts <= read_ts,
            _ => true,
        }
    }
}

#[derive(Debug, Clone)]
struct Version {
    seq: u64,
    commit_ts: Option<Timestamp>,
    /// `None` is a tombstone.
    data: Option<Bytes>,
}

struct TableInner {
    /// Version chains, oldest version first.
    records: BTreeMap<RecordId, Vec<Version>>,
    /// Uncommitted write claims: record id -> transaction token.
    claims: HashMap<RecordId, u64>,
    next_record_id: u64,
    /// Committed live totals.
    size: SizeInfo,
}

impl TableInner {
    fn visible<'a>(&'a self, id: RecordId, snap: Snapshot) -> Option<&'a Bytes> {
        let chain = self.records.get(&id)?;
        chain
            .iter()
            .rev()
            .find(|v| snap.sees(v))
            .and_then(|v| v.data.as_ref())
    }

    fn recompute_size(&mut self) {
        let mut size = SizeInfo::default();
        for chain in self.records.values() {
            if let Some(version) = chain.last() {
                if let Some(data) = &version.data {
                    size.num_records += 1;
                    size.data_size += data.len() as i64;
                }
            }
        }
        self.size = size;
    }
}

/// How a checkpoint selects versions.
#[derive(Debug, Clone, Copy)]
pub enum CheckpointMode {
    /// Newest committed version of every record, timestamps ignored.
    Full,
    /// Newest version stamped at or before the stable timestamp
    /// (untimestamped versions always qualify).
    Stable(Timestamp),
}

/// One buffered write, staged in a transaction until commit.
#[derive(Debug, Clone)]
pub(crate) struct PendingWrite {
    /// `None` deletes the record.
    pub data: Option<Bytes>,
    /// True when this transaction created the record (drives journal
    /// replay semantics, not visibility).
    pub created: bool,
}

#[derive(Serialize, Deserialize)]
struct ImageRow {
    id: u64,
    data: Vec<u8>,
}

/// An MVCC table. Shared between the engine, record stores, and open
/// cursors through `Arc`.
impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table").field("ident", &self.ident).finish()
    }
}

pub struct Table {
    ident: String,
    config: TableConfig,
    inner: Mutex<TableInner>,
    /// Open cursor pins; a pinned table reports Busy to drops.
    open_cursors: AtomicUsize,
    dropped: AtomicBool,
    /// Signaled on install so tailable oplog cursors can wait.
    tail_cv: Condvar,
}

impl Table {
    pub fn new(ident: &str, config: TableConfig) -> Self {
        Self {
            ident: ident.to_string(),
            config,
            inner: Mutex::new(TableInner {
                records: BTreeMap::new(),
                claims: HashMap::new(),
                next_record_id: 1,
                size: SizeInfo::default(),
            }),
            open_cursors: AtomicUsize::new(0),
            dropped: AtomicBool::new(false),
            tail_cv: Condvar::new(),
        }
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().expect("table lock poisoned")
    }

    pub fn committed_size(&self) -> SizeInfo {
        self.lock().size
    }

    pub fn cursor_pins(&self) -> usize {
        self.open_cursors.load(Ordering::Acquire)
    }

    pub fn mark_dropped(&self) {
        self.dropped.store(true, Ordering::Release);
        // Wake tailable waiters so they observe the drop.
        let _guard = self.lock();
        self.tail_cv.notify_all();
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    pub(crate) fn alloc_record_id(&self) -> RecordId {
        let mut inner = self.lock();
        let id = RecordId(inner.next_record_id);
        inner.next_record_id += 1;
        id
    }

    /// Claim `id` for an uncommitted write. Fails with `WriteConflict`
    /// when another transaction holds the claim or a commit newer than
    /// the snapshot already touched the record.
    pub(crate) fn claim_for_write(&self, id: RecordId, token: u64, snap: Snapshot) -> Result<()> {
        let mut inner = self.lock();
        if let Some(owner) = inner.claims.get(&id) {
            if *owner != token {
                return Err(BedrockError::WriteConflict);
            }
            return Ok(());
        }
        if let Some(latest) = inner.records.get(&id).and_then(|c| c.last()) {
            if latest.seq > snap.seq {
                return Err(BedrockError::WriteConflict);
            }
        }
        inner.claims.insert(id, token);
        Ok(())
    }

    pub(crate) fn release_claims(&self, token: u64, ids: &[RecordId]) {
        let mut inner = self.lock();
        for id in ids {
            if inner.claims.get(id) == Some(&token) {
                inner.claims.remove(id);
            }
        }
    }

    /// Install a committed transaction's writes. Callers hold the
    /// engine-wide commit lock so installs are atomic across tables.
    pub(crate) fn install(
        &self,
        puts: &BTreeMap<RecordId, PendingWrite>,
        truncate: bool,
        seq: u64,
        commit_ts: Option<Timestamp>,
    ) {
        let mut inner = self.lock();
        if truncate {
            inner.records.clear();
        }
        for (id, pending) in puts {
            inner
                .records
                .entry(*id)
                .or_default()
                .push(Version {
                    seq,
                    commit_ts,
                    data: pending.data.clone(),
                });
        }
        inner.recompute_size();
        if self.config.oplog {
            self.tail_cv.notify_all();
        }
    }

    /// Read the version of `id` visible to `snap`.
    pub(crate) fn read(&self, id: RecordId, snap: Snapshot) -> Option<Bytes> {
        self.lock().visible(id, snap).cloned()
    }

    /// True when any version chain exists for `id` (committed presence,
    /// regardless of visibility). Drives oplog duplicate detection.
    pub(crate) fn chain_exists(&self, id: RecordId) -> bool {
        self.lock().records.contains_key(&id)
    }

    /// Next record visible to `snap` strictly beyond `pos` in the given
    /// direction, or the first/last record when `pos` is `None`.
    pub(crate) fn next_visible(
        &self,
        pos: Option<RecordId>,
        direction: Direction,
        snap: Snapshot,
    ) -> Option<(RecordId, Bytes)> {
        let inner = self.lock();
        let range: Box<dyn Iterator<Item = (&RecordId, &Vec<Version>)> + '_> = match direction {
            Direction::Forward => {
                let lower = match pos {
                    Some(p) => Bound::Excluded(p),
                    None => Bound::Unbounded,
                };
                Box::new(inner.records.range((lower, Bound::Unbounded)))
            }
            Direction::Backward => {
                let upper = match pos {
                    Some(p) => Bound::Excluded(p),
                    None => Bound::Unbounded,
                };
                Box::new(inner.records.range((Bound::Unbounded, upper)).rev())
            }
        };
        for (id, chain) in range {
            if let Some(data) = chain.iter().rev().find(|v| snap.sees(v)).and_then(|v| v.data.as_ref())
            {
                return Some((*id, data.clone()));
            }
        }
        None
    }

    /// Oldest record visible to `snap` whose id is not in `skip`.
    /// Used to plan capped eviction.
    pub(crate) fn oldest_live(
        &self,
        snap: Snapshot,
        skip: &BTreeSet<RecordId>,
    ) -> Option<(RecordId, usize)> {
        let inner = self.lock();
        for (id, _) in inner.records.iter() {
            if skip.contains(id) {
                continue;
            }
            if let Some(data) = inner.visible(*id, snap) {
                return Some((*id, data.len()));
            }
        }
        None
    }

    /// Discard all versions stamped after the stable timestamp.
    /// Untimestamped versions survive.
    pub(crate) fn rollback_to_stable(&self, stable: Timestamp) {
        let mut inner = self.lock();
        inner.records.retain(|_, chain| {
            chain.retain(|v| v.commit_ts.map_or(true, |ts| ts <= stable));
            !chain.is_empty()
        });
        inner.recompute_size();
    }

    /// Drop version-chain history no legal snapshot can still read.
    ///
    /// A version may go once a newer version exists that every legal
    /// reader sees: sequence at or below the oldest open snapshot and
    /// commit timestamp at or below the oldest timestamp (or none).
    pub(crate) fn discard_history(&self, oldest_ts: Timestamp, min_open_seq: u64) -> u64 {
        let mut inner = self.lock();
        let mut removed = 0u64;
        inner.records.retain(|_, chain| {
            let mut keep_from = 0;
            for (i, v) in chain.iter().enumerate() {
                let ts_ok = v.commit_ts.map_or(true, |ts| ts <= oldest_ts);
                if ts_ok && v.seq <= min_open_seq {
                    keep_from = i;
                }
            }
            if keep_from > 0 {
                removed += keep_from as u64;
                chain.drain(..keep_from);
            }
            // A lone unreadable tombstone can go entirely.
            if chain.len() == 1
                && chain[0].data.is_none()
                && chain[0].commit_ts.map_or(true, |ts| ts <= oldest_ts)
                && chain[0].seq <= min_open_seq
            {
                removed += 1;
                return false;
            }
            !chain.is_empty()
        });
        removed
    }

    /// Apply one replayed journal mutation with upsert semantics.
    pub(crate) fn apply_recovered(
        &self,
        id: RecordId,
        data: Option<Bytes>,
        seq: u64,
        commit_ts: Option<Timestamp>,
    ) {
        let mut inner = self.lock();
        inner.records.entry(id).or_default().push(Version {
            seq,
            commit_ts,
            data,
        });
        if id.0 >= inner.next_record_id {
            inner.next_record_id = id.0 + 1;
        }
        inner.recompute_size();
    }

    pub(crate) fn clear_all(&self) {
        let mut inner = self.lock();
        inner.records.clear();
        inner.recompute_size();
    }

    /// Serialize the table image for a checkpoint: one row per record
    /// visible under `mode`, bounded by the checkpoint sequence.
    pub(crate) fn write_image(&self, path: &Path, mode: CheckpointMode, upto_seq: u64) -> Result<SizeInfo> {
        let rows: Vec<ImageRow> = {
            let inner = self.lock();
            inner
                .records
                .iter()
                .filter_map(|(id, chain)| {
                    chain
                        .iter()
                        .rev()
                        .filter(|v| v.seq <= upto_seq)
                        .find(|v| match mode {
                            CheckpointMode::Full => true,
                            CheckpointMode::Stable(ts) => {
                                v.commit_ts.map_or(true, |commit| commit <= ts)
                            }
                        })
                        .and_then(|v| v.data.as_ref())
                        .map(|data| ImageRow {
                            id: id.0,
                            data: data.to_vec(),
                        })
                })
                .collect()
        };

        let dir = path
            .parent()
            .ok_or_else(|| BedrockError::Internal(format!("bad image path {:?}", path)))?;
        let mut image_size = SizeInfo::default();
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            for row in &rows {
                image_size.num_records += 1;
                image_size.data_size += row.data.len() as i64;
                let encoded = bincode::serialize(row)?;
                writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
                writer.write_all(&encoded)?;
            }
            writer.flush()?;
        }
        tmp.as_file().sync_data()?;
        tmp.persist(path)
            .map_err(|e| BedrockError::Io(e.error))?;
        Ok(image_size)
    }

    /// Load a checkpoint image, replacing the table contents. Image rows
    /// carry no timestamps: checkpointed data is, by construction,
    /// stable, so it is restored as untimestamped.
    pub(crate) fn load_image(&self, path: &Path) -> Result<()> {
        let rows = read_image_rows(path, false)?;
        self.replace_from_rows(rows);
        Ok(())
    }

    /// Tolerant image load for repair: undecodable rows are skipped.
    /// Returns the number of rows that had to be dropped.
    pub(crate) fn salvage_image(&self, path: &Path) -> Result<u64> {
        let (rows, skipped) = read_image_rows_tolerant(path)?;
        self.replace_from_rows(rows);
        Ok(skipped)
    }

    fn replace_from_rows(&self, rows: Vec<(RecordId, Bytes)>) {
        let mut inner = self.lock();
        inner.records.clear();
        for (id, data) in rows {
            if id.0 >= inner.next_record_id {
                inner.next_record_id = id.0 + 1;
            }
            inner.records.insert(
                id,
                vec![Version {
                    seq: 0,
                    commit_ts: None,
                    data: Some(data),
                }],
            );
        }
        inner.recompute_size();
    }

    /// Compact version chains down to their newest committed version.
    pub(crate) fn compact_chains(&self) -> u64 {
        let mut inner = self.lock();
        let mut removed = 0u64;
        for chain in inner.records.values_mut() {
            if chain.len() > 1 {
                removed += (chain.len() - 1) as u64;
                let last = chain.pop().expect("non-empty chain");
                chain.clear();
                chain.push(last);
            }
        }
        removed
    }

    fn wait_for_tail(&self, ctx: &OpContext, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            ctx.check()?;
            if self.is_dropped() {
                return Ok(false);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(true);
            }
            let wait = (deadline - now).min(Duration::from_millis(50));
            let (guard, timed_out) = self
                .tail_cv
                .wait_timeout(inner, wait)
                .expect("tail wait poisoned");
            inner = guard;
            if !timed_out.timed_out() {
                // Woken by an install or a drop; the caller re-polls.
                ctx.check()?;
                return Ok(!self.is_dropped());
            }
        }
    }
}

fn read_image_rows(path: &Path, tolerant: bool) -> Result<Vec<(RecordId, Bytes)>> {
    read_image_rows_inner(path, tolerant).map(|(rows, _)| rows)
}

fn read_image_rows_tolerant(path: &Path) -> Result<(Vec<(RecordId, Bytes)>, u64)> {
    read_image_rows_inner(path, true)
}

fn read_image_rows_inner(path: &Path, tolerant: bool) -> Result<(Vec<(RecordId, Bytes)>, u64)> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut rows = Vec::new();
    let mut skipped = 0u64;
    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) if tolerant => {
                log::warn!("table image {:?}: unreadable tail ({})", path, e);
                skipped += 1;
                break;
            }
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut row_buf = vec![0u8; len];
        if let Err(e) = reader.read_exact(&mut row_buf) {
            if tolerant {
                log::warn!("table image {:?}: truncated row ({})", path, e);
                skipped += 1;
                break;
            }
            return Err(e.into());
        }
        match bincode::deserialize::<ImageRow>(&row_buf) {
            Ok(row) => rows.push((RecordId(row.id), Bytes::from(row.data))),
            Err(e) => {
                if tolerant {
                    log::warn!("table image {:?}: skipping undecodable row ({})", path, e);
                    skipped += 1;
                    continue;
                }
                return Err(e.into());
            }
        }
    }
    Ok((rows, skipped))
}

/// Statistics from a compaction pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactStats {
    pub versions_removed: u64,
}

/// Per-record hook an index layer hands to [`RecordStore::compact`] so
/// it can revalidate payloads and rebuild its entries as records are
/// rewritten.
pub trait CompactAdaptor {
    fn validate(&mut self, id: RecordId, data: &Bytes) -> Result<()>;
}

/// Keeps `Table::open_cursors` accurate across all cursor exit paths.
struct CursorPin {
    table: Arc<Table>,
}

impl CursorPin {
    fn new(table: Arc<Table>) -> Self {
        table.open_cursors.fetch_add(1, Ordering::AcqRel);
        Self { table }
    }
}

impl Drop for CursorPin {
    fn drop(&mut self) {
        self.table.open_cursors.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A stateful scan over one table, merging the owning transaction's
/// buffered writes with committed data. Owned by the recovery unit whose
/// snapshot it reads; the borrow ties the lifetimes together.
pub struct RecordCursor<'a> {
    _ru: &'a RecoveryUnit,
    table: Arc<Table>,
    snap: Snapshot,
    direction: Direction,
    tailable: bool,
    /// The transaction's buffered writes for this table at open time.
    buffered: BTreeMap<RecordId, Option<Bytes>>,
    pos: Option<RecordId>,
    saved_pos: Option<Option<RecordId>>,
    _pin: CursorPin,
}

impl<'a> RecordCursor<'a> {
    /// Advance and return the next visible record. `None` means the scan
    /// is exhausted; for tailable cursors that is "end for now" unless
    /// [`RecordCursor::is_dead`] reports the table is gone.
    pub fn next(&mut self) -> Result<Option<(RecordId, Bytes)>> {
        // A dropped table stops producing immediately, even for cursors
        // opened before the drop. Tailable cursors report it through
        // `is_dead` instead.
        if self.table.is_dropped() {
            if self.tailable {
                return Ok(None);
            }
            return Err(BedrockError::ident_not_found(self.table.ident()));
        }
        let snap = self.effective_snapshot();
        loop {
            let committed = self.table.next_visible(self.pos, self.direction, snap);
            let buffered = self.next_buffered();

            let candidate = match (committed, buffered) {
                (None, None) => return Ok(None),
                (Some(c), None) => c,
                (None, Some((id, data))) => match data {
                    Some(data) => (id, data),
                    None => {
                        self.pos = Some(id);
                        continue;
                    }
                },
                (Some((cid, cdata)), Some((bid, bdata))) => {
                    let buffered_first = match self.direction {
                        Direction::Forward => bid <= cid,
                        Direction::Backward => bid >= cid,
                    };
                    if buffered_first {
                        match bdata {
                            Some(data) => (bid, data),
                            None => {
                                self.pos = Some(bid);
                                continue;
                            }
                        }
                    } else {
                        (cid, cdata)
                    }
                }
            };

            self.pos = Some(candidate.0);
            return Ok(Some(candidate));
        }
    }

    /// Tailable cursors read past their opening snapshot: each poll
    /// sees everything committed so far (bounded by the read timestamp,
    /// if one was chosen). Plain cursors keep their frozen snapshot.
    fn effective_snapshot(&self) -> Snapshot {
        if self.tailable {
            Snapshot {
                seq: u64::MAX,
                read_ts: self.snap.read_ts,
            }
        } else {
            self.snap
        }
    }

    fn next_buffered(&self) -> Option<(RecordId, Option<Bytes>)> {
        match self.direction {
            Direction::Forward => {
                let lower = match self.pos {
                    Some(p) => Bound::Excluded(p),
                    None => Bound::Unbounded,
                };
                self.buffered
                    .range((lower, Bound::Unbounded))
                    .next()
                    .map(|(id, data)| (*id, data.clone()))
            }
            Direction::Backward => {
                let upper = match self.pos {
                    Some(p) => Bound::Excluded(p),
                    None => Bound::Unbounded,
                };
                self.buffered
                    .range((Bound::Unbounded, upper))
                    .next_back()
                    .map(|(id, data)| (*id, data.clone()))
            }
        }
    }

    /// Remember the position across a yield point.
    pub fn save_state(&mut self) {
        self.saved_pos = Some(self.pos);
    }

    /// Reestablish the cursor after a yield. If the record at the saved
    /// position was removed, the next call to [`RecordCursor::next`]
    /// lands on the next record in scan order; the cursor never moves
    /// backward.
    pub fn restore_state(&mut self) -> Result<()> {
        if self.table.is_dropped() {
            return Err(BedrockError::ident_not_found(self.table.ident()));
        }
        if let Some(pos) = self.saved_pos.take() {
            self.pos = pos;
        }
        Ok(())
    }

    /// For tailable cursors: true once the table itself is gone, meaning
    /// the scan will never yield again (as opposed to "end for now").
    pub fn is_dead(&self) -> bool {
        self.tailable && self.table.is_dropped()
    }

    pub fn is_tailable(&self) -> bool {
        self.tailable
    }

    /// Block until more oplog data may be available, the timeout lapses,
    /// or the context is interrupted. Returns false when the scan is
    /// permanently exhausted.
    pub fn wait_for_more(&self, ctx: &OpContext, timeout: Duration) -> Result<bool> {
        if !self.tailable {
            return Err(BedrockError::InvalidOption(
                "wait_for_more requires a tailable cursor".into(),
            ));
        }
        self.table.wait_for_tail(ctx, timeout)
    }
}

/// Per-table API handle. Cheap to clone-by-construction from the engine;
/// all mutation goes through a recovery unit.
pub struct RecordStore {
    table: Arc<Table>,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("ident", &self.table.ident())
            .finish()
    }
}

impl RecordStore {
    pub(crate) fn new(table: Arc<Table>) -> Self {
        Self { table }
    }

    pub fn ident(&self) -> &str {
        self.table.ident()
    }

    pub fn is_oplog(&self) -> bool {
        self.table.config().oplog
    }

    /// Committed record count. Buffered writes are not reflected until
    /// their transaction commits.
    pub fn num_records(&self) -> i64 {
        self.table.committed_size().num_records
    }

    /// Committed payload bytes.
    pub fn data_size(&self) -> i64 {
        self.table.committed_size().data_size
    }

    /// Insert a record, assigning the next record id. Oplog tables must
    /// use [`RecordStore::insert_with_id`].
    pub fn insert(&self, ru: &RecoveryUnit, data: &[u8]) -> Result<RecordId> {
        if self.table.config().oplog {
            return Err(BedrockError::InvalidOption(
                "oplog inserts must provide a timestamp-valued record id".into(),
            ));
        }
        let id = self.table.alloc_record_id();
        self.insert_at(ru, id, data)
    }

    /// Insert a record at a caller-chosen id. For oplog tables the id is
    /// the record's timestamp; duplicates are rejected.
    pub fn insert_with_id(&self, ru: &RecoveryUnit, id: RecordId, data: &[u8]) -> Result<RecordId> {
        if self.table.config().oplog {
            let duplicate = match ru.buffered_get(self.table.ident(), id) {
                Some(Some(_)) => true,
                Some(None) => false,
                None => self.table.chain_exists(id),
            };
            if duplicate {
                return Err(BedrockError::AlreadyExists(format!(
                    "duplicate oplog record id {}",
                    id
                )));
            }
        }
        self.insert_at(ru, id, data)
    }

    fn insert_at(&self, ru: &RecoveryUnit, id: RecordId, data: &[u8]) -> Result<RecordId> {
        ru.require_write()?;
        let snap = ru.snapshot()?;
        self.table.claim_for_write(id, ru.txn_token(), snap)?;
        ru.record_claim(&self.table, id);
        ru.buffer_put(
            &self.table,
            id,
            PendingWrite {
                data: Some(Bytes::copy_from_slice(data)),
                created: true,
            },
            SizeInfo::new(1, data.len() as i64),
        );
        if self.table.config().is_capped() {
            self.evict_for_capped(ru, snap, id)?;
        }
        Ok(id)
    }

    /// Evict from the front until the capped invariant holds again.
    /// Evictions become buffered deletes in the same unit of work, so a
    /// conflicting concurrent insert resolves as a write conflict.
    fn evict_for_capped(&self, ru: &RecoveryUnit, snap: Snapshot, new_id: RecordId) -> Result<()> {
        let config = self.table.config().clone();
        let mut effective = self.table.committed_size();
        effective.add(ru.table_size_delta(self.table.ident()));

        let over = |size: &SizeInfo| {
            config.capped_max_size.map_or(false, |max| size.data_size > max)
                || config
                    .capped_max_count
                    .map_or(false, |max| size.num_records > max)
        };

        let mut skip: BTreeSet<RecordId> = ru.buffered_removed_ids(self.table.ident());
        while over(&effective) {
            // The front of the ring is the smaller of the oldest
            // committed record and the oldest of this transaction's own
            // buffered inserts.
            let committed = self.table.oldest_live(snap, &skip);
            let buffered = ru.oldest_buffered_live(self.table.ident(), &skip);
            let victim = match (committed, buffered) {
                (Some(c), Some(b)) => {
                    if c.0 <= b.0 {
                        c
                    } else {
                        b
                    }
                }
                (Some(c), None) => c,
                (None, Some(b)) => b,
                (None, None) => break,
            };
            if victim.0 >= new_id {
                break;
            }
            self.table.claim_for_write(victim.0, ru.txn_token(), snap)?;
            ru.record_claim(&self.table, victim.0);
            ru.buffer_put(
                &self.table,
                victim.0,
                PendingWrite {
                    data: None,
                    created: false,
                },
                SizeInfo::new(-1, -(victim.1 as i64)),
            );
            effective.add(SizeInfo::new(-1, -(victim.1 as i64)));
            skip.insert(victim.0);
        }
        Ok(())
    }

    /// Replace a record's payload. The record id never changes; the
    /// returned id is always the input id.
    pub fn update(&self, ru: &RecoveryUnit, id: RecordId, data: &[u8]) -> Result<RecordId> {
        ru.require_write()?;
        let snap = ru.snapshot()?;
        let old_len = self.visible_len(ru, id, snap)?;
        self.table.claim_for_write(id, ru.txn_token(), snap)?;
        ru.record_claim(&self.table, id);
        ru.buffer_put(
            &self.table,
            id,
            PendingWrite {
                data: Some(Bytes::copy_from_slice(data)),
                created: false,
            },
            SizeInfo::new(0, data.len() as i64 - old_len as i64),
        );
        Ok(id)
    }

    /// Remove a record. Reports `NotFound` when no visible record
    /// exists; callers on replay paths may silence that.
    pub fn delete(&self, ru: &RecoveryUnit, id: RecordId) -> Result<()> {
        ru.require_write()?;
        let snap = ru.snapshot()?;
        let old_len = self.visible_len(ru, id, snap)?;
        self.table.claim_for_write(id, ru.txn_token(), snap)?;
        ru.record_claim(&self.table, id);
        ru.buffer_put(
            &self.table,
            id,
            PendingWrite {
                data: None,
                created: false,
            },
            SizeInfo::new(-1, -(old_len as i64)),
        );
        Ok(())
    }

    fn visible_len(&self, ru: &RecoveryUnit, id: RecordId, snap: Snapshot) -> Result<usize> {
        match ru.buffered_get(self.table.ident(), id) {
            Some(Some(data)) => Ok(data.len()),
            Some(None) => Err(BedrockError::record_not_found(self.table.ident(), id.0)),
            None => self
                .table
                .read(id, snap)
                .map(|d| d.len())
                .ok_or_else(|| BedrockError::record_not_found(self.table.ident(), id.0)),
        }
    }

    /// Point lookup by record id.
    pub fn find(&self, ru: &RecoveryUnit, id: RecordId) -> Result<Bytes> {
        let snap = ru.snapshot()?;
        match ru.buffered_get(self.table.ident(), id) {
            Some(Some(data)) => Ok(data),
            Some(None) => Err(BedrockError::record_not_found(self.table.ident(), id.0)),
            None => self
                .table
                .read(id, snap)
                .ok_or_else(|| BedrockError::record_not_found(self.table.ident(), id.0)),
        }
    }

    /// Open a scan cursor. The cursor sees the transaction's snapshot
    /// plus its own buffered writes as of this call.
    pub fn cursor<'a>(&self, ru: &'a RecoveryUnit, direction: Direction) -> Result<RecordCursor<'a>> {
        self.open_cursor(ru, direction, false)
    }

    /// Open a tailable cursor; only legal on oplog tables.
    pub fn tailable_cursor<'a>(&self, ru: &'a RecoveryUnit) -> Result<RecordCursor<'a>> {
        if !self.table.config().oplog {
            return Err(BedrockError::InvalidOption(
                "tailable cursors require an oplog table".into(),
            ));
        }
        self.open_cursor(ru, Direction::Forward, true)
    }

    fn open_cursor<'a>(
        &self,
        ru: &'a RecoveryUnit,
        direction: Direction,
        tailable: bool,
    ) -> Result<RecordCursor<'a>> {
        if self.table.is_dropped() {
            return Err(BedrockError::ident_not_found(self.table.ident()));
        }
        let snap = ru.snapshot()?;
        let buffered = ru.buffered_table_writes(self.table.ident());
        Ok(RecordCursor {
            _ru: ru,
            table: Arc::clone(&self.table),
            snap,
            direction,
            tailable,
            buffered,
            pos: None,
            saved_pos: None,
            _pin: CursorPin::new(Arc::clone(&self.table)),
        })
    }

    /// Remove every record. Takes effect at commit like any other write.
    pub fn truncate(&self, ru: &RecoveryUnit) -> Result<()> {
        ru.require_write()?;
        let _snap = ru.snapshot()?;
        let committed = self.table.committed_size();
        ru.buffer_truncate(
            &self.table,
            SizeInfo::new(-committed.num_records, -committed.data_size),
        );
        Ok(())
    }

    /// Reclaim version-chain history. Adaptor-driven compaction (the
    /// index layer revalidating records as they are rewritten) is not
    /// supported by this engine, and capped tables are self-bounding.
    pub fn compact(&self, adaptor: Option<&mut dyn CompactAdaptor>) -> Result<CompactStats> {
        if adaptor.is_some() {
            return Err(BedrockError::NotSupported(
                "adaptor-driven compaction is not supported".into(),
            ));
        }
        if self.table.config().is_capped() {
            return Err(BedrockError::NotSupported(
                "capped tables cannot be compacted".into(),
            ));
        }
        let versions_removed = self.table.compact_chains();
        Ok(CompactStats { versions_removed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(seq: u64) -> Snapshot {
        Snapshot { seq, read_ts: None }
    }

    fn put(id: u64, data: &[u8]) -> (RecordId, PendingWrite) {
        (
            RecordId(id),
            PendingWrite {
                data: Some(Bytes::copy_from_slice(data)),
                created: true,
            },
        )
    }

    fn install_one(table: &Table, id: u64, data: &[u8], seq: u64, ts: Option<Timestamp>) {
        let mut puts = BTreeMap::new();
        let (rid, pending) = put(id, data);
        puts.insert(rid, pending);
        table.install(&puts, false, seq, ts);
    }

    #[test]
    fn test_snapshot_visibility_by_seq() {
        let table = Table::new("t1", TableConfig::default());
        install_one(&table, 1, b"alpha", 5, None);

        assert!(table.read(RecordId(1), snap(4)).is_none());
        assert_eq!(table.read(RecordId(1), snap(5)).unwrap(), &b"alpha"[..]);
    }

    #[test]
    fn test_snapshot_visibility_by_timestamp() {
        let table = Table::new("t1", TableConfig::default());
        install_one(&table, 1, b"old", 1, Some(Timestamp::new(50, 0)));
        install_one(&table, 1, b"new", 2, Some(Timestamp::new(150, 0)));

        let at_100 = Snapshot {
            seq: 10,
            read_ts: Some(Timestamp::new(100, 0)),
        };
        assert_eq!(table.read(RecordId(1), at_100).unwrap(), &b"old"[..]);

        let latest = snap(10);
        assert_eq!(table.read(RecordId(1), latest).unwrap(), &b"new"[..]);
    }

    #[test]
    fn test_claim_conflicts() {
        let table = Table::new("t1", TableConfig::default());
        install_one(&table, 1, b"x", 1, None);

        table.claim_for_write(RecordId(1), 100, snap(1)).unwrap();
        // Another transaction cannot claim the same record.
        let err = table.claim_for_write(RecordId(1), 200, snap(1)).unwrap_err();
        assert!(err.is_retryable());
        // The holder can re-claim.
        table.claim_for_write(RecordId(1), 100, snap(1)).unwrap();

        table.release_claims(100, &[RecordId(1)]);
        table.claim_for_write(RecordId(1), 200, snap(1)).unwrap();
    }

    #[test]
    fn test_claim_conflicts_with_newer_commit() {
        let table = Table::new("t1", TableConfig::default());
        install_one(&table, 1, b"x", 5, None);

        // A snapshot from before seq 5 lost the race.
        let err = table.claim_for_write(RecordId(1), 7, snap(4)).unwrap_err();
        assert!(err.is_retryable());
        table.claim_for_write(RecordId(1), 7, snap(5)).unwrap();
    }

    #[test]
    fn test_size_accounting() {
        let table = Table::new("t1", TableConfig::default());
        install_one(&table, 1, b"aaaa", 1, None);
        install_one(&table, 2, b"bb", 2, None);
        assert_eq!(table.committed_size(), SizeInfo::new(2, 6));

        // Tombstone removes a record from the totals.
        let mut puts = BTreeMap::new();
        puts.insert(
            RecordId(1),
            PendingWrite {
                data: None,
                created: false,
            },
        );
        table.install(&puts, false, 3, None);
        assert_eq!(table.committed_size(), SizeInfo::new(1, 2));
    }

    #[test]
    fn test_rollback_to_stable_drops_later_versions() {
        let table = Table::new("t1", TableConfig::default());
        install_one(&table, 1, b"A", 1, Some(Timestamp::new(50, 0)));
        install_one(&table, 2, b"B", 2, Some(Timestamp::new(150, 0)));

        table.rollback_to_stable(Timestamp::new(100, 0));

        let latest = snap(10);
        assert!(table.read(RecordId(1), latest).is_some());
        assert!(table.read(RecordId(2), latest).is_none());
        assert_eq!(table.committed_size().num_records, 1);
    }

    #[test]
    fn test_rollback_keeps_untimestamped() {
        let table = Table::new("t1", TableConfig::default());
        install_one(&table, 1, b"A", 1, None);
        table.rollback_to_stable(Timestamp::new(1, 0));
        assert!(table.read(RecordId(1), snap(10)).is_some());
    }

    #[test]
    fn test_discard_history_keeps_reachable_versions() {
        let table = Table::new("t1", TableConfig::default());
        install_one(&table, 1, b"v1", 1, Some(Timestamp::new(10, 0)));
        install_one(&table, 1, b"v2", 2, Some(Timestamp::new(20, 0)));
        install_one(&table, 1, b"v3", 3, Some(Timestamp::new(30, 0)));

        // Oldest at 20: v1 is unreachable, v2 must survive for readers
        // at exactly the oldest timestamp.
        let removed = table.discard_history(Timestamp::new(20, 0), u64::MAX);
        assert_eq!(removed, 1);
        let at_20 = Snapshot {
            seq: 10,
            read_ts: Some(Timestamp::new(20, 0)),
        };
        assert_eq!(table.read(RecordId(1), at_20).unwrap(), &b"v2"[..]);
    }

    #[test]
    fn test_discard_history_respects_open_snapshots() {
        let table = Table::new("t1", TableConfig::default());
        install_one(&table, 1, b"v1", 1, Some(Timestamp::new(10, 0)));
        install_one(&table, 1, b"v2", 2, Some(Timestamp::new(20, 0)));

        // An open snapshot at seq 1 still needs v1.
        let removed = table.discard_history(Timestamp::new(20, 0), 1);
        assert_eq!(removed, 0);
        assert_eq!(table.read(RecordId(1), snap(1)).unwrap(), &b"v1"[..]);
    }

    #[test]
    fn test_next_visible_directions() {
        let table = Table::new("t1", TableConfig::default());
        install_one(&table, 1, b"a", 1, None);
        install_one(&table, 3, b"c", 2, None);
        install_one(&table, 7, b"g", 3, None);

        let s = snap(10);
        let (first, _) = table.next_visible(None, Direction::Forward, s).unwrap();
        assert_eq!(first, RecordId(1));
        let (second, _) = table
            .next_visible(Some(RecordId(1)), Direction::Forward, s)
            .unwrap();
        assert_eq!(second, RecordId(3));

        let (newest, _) = table.next_visible(None, Direction::Backward, s).unwrap();
        assert_eq!(newest, RecordId(7));
        assert!(table
            .next_visible(Some(RecordId(1)), Direction::Backward, s)
            .is_none());
    }

    #[test]
    fn test_image_roundtrip_stable_mode() {
        let dir = tempfile::tempdir().unwrap();
        let table = Table::new("t1", TableConfig::default());
        install_one(&table, 1, b"A", 1, Some(Timestamp::new(50, 0)));
        install_one(&table, 2, b"B", 2, Some(Timestamp::new(150, 0)));

        let path = dir.path().join("t1.tbl");
        let size = table
            .write_image(&path, CheckpointMode::Stable(Timestamp::new(100, 0)), u64::MAX)
            .unwrap();
        assert_eq!(size.num_records, 1);

        let restored = Table::new("t1", TableConfig::default());
        restored.load_image(&path).unwrap();
        assert!(restored.read(RecordId(1), snap(10)).is_some());
        assert!(restored.read(RecordId(2), snap(10)).is_none());
    }

    #[test]
    fn test_image_full_mode_includes_everything_committed() {
        let dir = tempfile::tempdir().unwrap();
        let table = Table::new("t1", TableConfig::default());
        install_one(&table, 1, b"A", 1, Some(Timestamp::new(50, 0)));
        install_one(&table, 2, b"B", 2, Some(Timestamp::new(150, 0)));

        let path = dir.path().join("t1.tbl");
        let size = table
            .write_image(&path, CheckpointMode::Full, u64::MAX)
            .unwrap();
        assert_eq!(size.num_records, 2);
    }

    #[test]
    fn test_salvage_image_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let table = Table::new("t1", TableConfig::default());
        install_one(&table, 1, b"A", 1, None);
        let path = dir.path().join("t1.tbl");
        table
            .write_image(&path, CheckpointMode::Full, u64::MAX)
            .unwrap();

        // Corrupt the tail.
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&99u32.to_le_bytes()).unwrap();
        file.write_all(b"garbage").unwrap();
        drop(file);

        let restored = Table::new("t1", TableConfig::default());
        restored.salvage_image(&path).unwrap();
        assert_eq!(restored.committed_size().num_records, 1);
    }

    #[test]
    fn test_compact_chains() {
        let table = Table::new("t1", TableConfig::default());
        install_one(&table, 1, b"v1", 1, None);
        install_one(&table, 1, b"v2", 2, None);
        install_one(&table, 1, b"v3", 3, None);

        assert_eq!(table.compact_chains(), 2);
        assert_eq!(table.read(RecordId(1), snap(10)).unwrap(), &b"v3"[..]);
    }

    #[test]
    fn test_truncate_install() {
        let table = Table::new("t1", TableConfig::default());
        install_one(&table, 1, b"a", 1, None);
        install_one(&table, 2, b"b", 2, None);

        table.install(&BTreeMap::new(), true, 3, None);
        assert_eq!(table.committed_size(), SizeInfo::default());
        assert!(table.next_visible(None, Direction::Forward, snap(10)).is_none());
    }
}
