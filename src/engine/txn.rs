//! Recovery units and write units of work
//!
//! A [`RecoveryUnit`] is the per-operation transaction handle: it owns at
//! most one snapshot, buffers writes until commit, and runs registered
//! commit/rollback handlers. Writes must be bracketed by a
//! [`WriteUnitOfWork`], which aborts on drop unless committed; nesting is
//! tracked on the recovery unit and only the outermost level touches the
//! underlying transaction.
//!
//! Write conflicts surface as retryable errors and are recovered by
//! [`write_conflict_retry`], never across the recovery unit boundary.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{BedrockError, ErrorKind, Result};
use crate::types::{OpContext, ReadSource, RecordId, SizeInfo, Timestamp};

use super::store::{PendingWrite, Snapshot, Table};
use super::EngineShared;

/// Transaction state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuState {
    Inactive,
    Active,
    Prepared,
    Committing,
    Aborted,
}

/// Buffered writes against one table.
pub(crate) struct TableTxn {
    pub table: Arc<Table>,
    pub puts: BTreeMap<RecordId, PendingWrite>,
    pub truncate: bool,
    pub size_delta: SizeInfo,
    pub claims: Vec<RecordId>,
}

impl TableTxn {
    fn new(table: Arc<Table>) -> Self {
        Self {
            table,
            puts: BTreeMap::new(),
            truncate: false,
            size_delta: SizeInfo::default(),
            claims: Vec::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.puts.is_empty() && !self.truncate
    }
}

/// A pair of callbacks tied to the unit's outcome. Commit handlers run
/// in registration order, rollback handlers in reverse.
pub trait Change: Send {
    fn commit(self: Box<Self>, commit_ts: Option<Timestamp>);
    fn rollback(self: Box<Self>);
}

struct ChangeFns<C, R>
where
    C: FnOnce(Option<Timestamp>) + Send,
    R: FnOnce() + Send,
{
    on_commit: C,
    on_rollback: R,
}

impl<C, R> Change for ChangeFns<C, R>
where
    C: FnOnce(Option<Timestamp>) + Send,
    R: FnOnce() + Send,
{
    fn commit(self: Box<Self>, commit_ts: Option<Timestamp>) {
        (self.on_commit)(commit_ts);
    }

    fn rollback(self: Box<Self>) {
        (self.on_rollback)();
    }
}

struct RuInner {
    state: RuState,
    nesting: u32,
    /// A nested level aborted; the outermost level may only abort.
    failed_nested: bool,
    read_source: ReadSource,
    snapshot: Option<Snapshot>,
    token: u64,
    commit_ts: Option<Timestamp>,
    prepare_ts: Option<Timestamp>,
    /// True while `commit_ts` is registered in the engine's pending set.
    ts_registered: bool,
    tables: HashMap<String, TableTxn>,
    changes: Vec<Box<dyn Change>>,
    /// A failed outermost commit leaves its error here; every later call
    /// reports it until the unit is destroyed.
    poisoned: Option<(ErrorKind, String)>,
    /// Durability target of the last successful commit.
    last_commit_seq: u64,
}

/// The transaction state a released recovery unit hands to a long-lived
/// holder. Keeps the snapshot (and therefore history) pinned until
/// reattached or dropped.
pub struct PausedTransaction {
    shared: Arc<EngineShared>,
    payload: Option<PausedPayload>,
}

struct PausedPayload {
    snapshot: Option<Snapshot>,
    token: u64,
    read_source: ReadSource,
    tables: HashMap<String, TableTxn>,
}

impl Drop for PausedTransaction {
    fn drop(&mut self) {
        if let Some(payload) = self.payload.take() {
            for txn in payload.tables.values() {
                txn.table.release_claims(payload.token, &txn.claims);
            }
            if let Some(snapshot) = payload.snapshot {
                self.shared.close_snapshot(snapshot);
            }
        }
    }
}

/// One-shot transactional handle, created per operation.
pub struct RecoveryUnit {
    shared: Arc<EngineShared>,
    inner: Mutex<RuInner>,
}

impl RecoveryUnit {
    pub(crate) fn new(shared: Arc<EngineShared>) -> Self {
        let token = shared.next_txn_token();
        Self {
            shared,
            inner: Mutex::new(RuInner {
                state: RuState::Inactive,
                nesting: 0,
                failed_nested: false,
                read_source: ReadSource::NoTimestamp,
                snapshot: None,
                token,
                commit_ts: None,
                prepare_ts: None,
                ts_registered: false,
                tables: HashMap::new(),
                changes: Vec::new(),
                poisoned: None,
                last_commit_seq: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RuInner> {
        self.inner.lock().expect("recovery unit lock poisoned")
    }

    fn check_poisoned(inner: &RuInner) -> Result<()> {
        if let Some((kind, msg)) = &inner.poisoned {
            return Err(BedrockError::from_kind(*kind, msg.clone()));
        }
        Ok(())
    }

    pub fn state(&self) -> RuState {
        self.lock().state
    }

    /// Enter (or nest into) a unit of work. Returns the nesting depth
    /// after the call; 1 means this call opened the transaction.
    pub fn begin_unit_of_work(&self) -> Result<u32> {
        let mut inner = self.lock();
        Self::check_poisoned(&inner)?;
        match inner.state {
            RuState::Inactive => {
                inner.state = RuState::Active;
            }
            RuState::Active => {}
            other => {
                return Err(BedrockError::InvalidOption(format!(
                    "cannot begin a unit of work in state {:?}",
                    other
                )))
            }
        }
        inner.nesting += 1;
        Ok(inner.nesting)
    }

    /// Commit at the outermost level; inner levels only record that the
    /// level finished cleanly.
    pub fn commit_unit_of_work(&self) -> Result<()> {
        let mut inner = self.lock();
        Self::check_poisoned(&inner)?;
        if inner.nesting == 0 {
            return Err(BedrockError::InvalidOption(
                "commit without an open unit of work".into(),
            ));
        }
        if inner.nesting > 1 {
            inner.nesting -= 1;
            return Ok(());
        }
        if inner.failed_nested {
            self.abort_locked(&mut inner);
            return Err(BedrockError::InvalidOption(
                "a nested unit of work aborted; only abort is legal".into(),
            ));
        }
        if !matches!(inner.state, RuState::Active | RuState::Prepared) {
            return Err(BedrockError::InvalidOption(format!(
                "cannot commit in state {:?}",
                inner.state
            )));
        }
        if let (RuState::Prepared, Some(prepare_ts)) = (inner.state, inner.prepare_ts) {
            match inner.commit_ts {
                Some(commit_ts) if commit_ts >= prepare_ts => {}
                _ => {
                    return Err(BedrockError::InvalidOption(
                        "prepared transactions need a commit timestamp at or past the prepare timestamp"
                            .into(),
                    ))
                }
            }
        }

        inner.state = RuState::Committing;
        let commit_ts = inner.commit_ts;
        let token = inner.token;
        match self.shared.commit_install(&mut inner.tables, commit_ts, token) {
            Ok(seq) => {
                inner.last_commit_seq = seq;
                for change in inner.changes.drain(..).collect::<Vec<_>>() {
                    change.commit(commit_ts);
                }
                self.reset_transaction(&mut inner);
                Ok(())
            }
            Err(e) => {
                // The engine installed nothing; roll back, release the
                // declared timestamp and snapshot, and poison.
                inner.poisoned = Some((e.kind(), e.to_string()));
                self.rollback_state(&mut inner);
                if inner.ts_registered {
                    if let Some(ts) = inner.commit_ts {
                        self.shared.unregister_pending_commit_ts(ts);
                    }
                    inner.ts_registered = false;
                }
                if let Some(snapshot) = inner.snapshot.take() {
                    self.shared.close_snapshot(snapshot);
                }
                inner.state = RuState::Aborted;
                inner.nesting = 0;
                Err(e)
            }
        }
    }

    /// Abort the current level. A nested abort forces the outermost
    /// level to abort as well.
    pub fn abort_unit_of_work(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.nesting == 0 {
            return Err(BedrockError::InvalidOption(
                "abort without an open unit of work".into(),
            ));
        }
        if inner.nesting > 1 {
            inner.nesting -= 1;
            inner.failed_nested = true;
            return Ok(());
        }
        self.abort_locked(&mut inner);
        Ok(())
    }

    fn abort_locked(&self, inner: &mut RuInner) {
        self.rollback_state(inner);
        inner.state = RuState::Aborted;
        self.reset_transaction(inner);
    }

    /// Undo buffered effects: release claims and run rollback handlers
    /// in reverse registration order.
    fn rollback_state(&self, inner: &mut RuInner) {
        for txn in inner.tables.values() {
            txn.table.release_claims(inner.token, &txn.claims);
        }
        inner.tables.clear();
        for change in inner.changes.drain(..).rev().collect::<Vec<_>>() {
            change.rollback();
        }
    }

    fn reset_transaction(&self, inner: &mut RuInner) {
        if inner.ts_registered {
            if let Some(ts) = inner.commit_ts {
                self.shared.unregister_pending_commit_ts(ts);
            }
            inner.ts_registered = false;
        }
        if let Some(snapshot) = inner.snapshot.take() {
            self.shared.close_snapshot(snapshot);
        }
        inner.tables.clear();
        inner.changes.clear();
        inner.commit_ts = None;
        inner.prepare_ts = None;
        inner.failed_nested = false;
        inner.nesting = 0;
        inner.state = RuState::Inactive;
    }

    /// Declare the commit timestamp for every write in this unit. Must
    /// be at or past the oldest timestamp by commit time.
    pub fn set_timestamp(&self, ts: Timestamp) -> Result<()> {
        let mut inner = self.lock();
        Self::check_poisoned(&inner)?;
        if inner.state != RuState::Active {
            return Err(BedrockError::InvalidOption(
                "commit timestamps require an active unit of work".into(),
            ));
        }
        if inner.ts_registered {
            if let Some(old) = inner.commit_ts {
                self.shared.unregister_pending_commit_ts(old);
            }
        }
        self.shared.register_pending_commit_ts(ts);
        inner.commit_ts = Some(ts);
        inner.ts_registered = true;
        Ok(())
    }

    pub fn commit_timestamp(&self) -> Option<Timestamp> {
        self.lock().commit_ts
    }

    /// Move an active, non-nested transaction to the prepared state.
    /// Only commit or abort are legal afterwards.
    pub fn set_prepare_timestamp(&self, ts: Timestamp) -> Result<()> {
        let mut inner = self.lock();
        Self::check_poisoned(&inner)?;
        if inner.state != RuState::Active || inner.nesting != 1 {
            return Err(BedrockError::InvalidOption(
                "prepare requires a single active unit of work".into(),
            ));
        }
        inner.prepare_ts = Some(ts);
        inner.state = RuState::Prepared;
        Ok(())
    }

    /// Choose how this unit picks its read timestamp. Illegal once the
    /// unit is active.
    pub fn set_read_source(&self, source: ReadSource) -> Result<()> {
        let mut inner = self.lock();
        Self::check_poisoned(&inner)?;
        if inner.state != RuState::Inactive {
            return Err(BedrockError::InvalidOption(
                "cannot change the read source of an active unit".into(),
            ));
        }
        if let Some(snapshot) = inner.snapshot.take() {
            self.shared.close_snapshot(snapshot);
        }
        inner.read_source = source;
        Ok(())
    }

    pub fn read_source(&self) -> ReadSource {
        self.lock().read_source
    }

    /// Force the next operation to open a fresh snapshot. Legal only
    /// outside a unit of work.
    pub fn abandon_snapshot(&self) -> Result<()> {
        let mut inner = self.lock();
        Self::check_poisoned(&inner)?;
        if inner.nesting > 0 {
            return Err(BedrockError::InvalidOption(
                "cannot abandon a snapshot inside a unit of work".into(),
            ));
        }
        if let Some(snapshot) = inner.snapshot.take() {
            self.shared.close_snapshot(snapshot);
        }
        Ok(())
    }

    /// Block until the engine's durable state covers this unit's last
    /// commit. Must not be called while holding locks the write path
    /// needs.
    pub fn wait_until_durable(&self, ctx: &OpContext) -> Result<()> {
        let target = self.lock().last_commit_seq;
        self.shared.wait_until_durable_seq(ctx, target)
    }

    /// Register a commit/rollback handler pair.
    pub fn register_change(&self, change: Box<dyn Change>) -> Result<()> {
        let mut inner = self.lock();
        Self::check_poisoned(&inner)?;
        inner.changes.push(change);
        Ok(())
    }

    /// Convenience wrapper over [`RecoveryUnit::register_change`].
    pub fn on_commit_and_rollback<C, R>(&self, on_commit: C, on_rollback: R) -> Result<()>
    where
        C: FnOnce(Option<Timestamp>) + Send + 'static,
        R: FnOnce() + Send + 'static,
    {
        self.register_change(Box::new(ChangeFns {
            on_commit,
            on_rollback,
        }))
    }

    /// Transfer the open transaction to a long-lived holder; this unit
    /// returns to `Inactive`. Legal only outside a unit of work.
    pub fn release(&self) -> Result<PausedTransaction> {
        let mut inner = self.lock();
        Self::check_poisoned(&inner)?;
        if inner.nesting > 0 || inner.state == RuState::Prepared {
            return Err(BedrockError::InvalidOption(
                "cannot release inside a unit of work or while prepared".into(),
            ));
        }
        let payload = PausedPayload {
            snapshot: inner.snapshot.take(),
            token: inner.token,
            read_source: inner.read_source,
            tables: std::mem::take(&mut inner.tables),
        };
        inner.state = RuState::Inactive;
        // The unit keeps working as a fresh transaction if reused.
        inner.token = self.shared.next_txn_token();
        Ok(PausedTransaction {
            shared: Arc::clone(&self.shared),
            payload: Some(payload),
        })
    }

    /// Take back a transaction previously released.
    pub fn reattach(&self, mut paused: PausedTransaction) -> Result<()> {
        let mut inner = self.lock();
        Self::check_poisoned(&inner)?;
        if inner.state != RuState::Inactive || inner.snapshot.is_some() {
            return Err(BedrockError::InvalidOption(
                "cannot reattach to a unit with an open transaction".into(),
            ));
        }
        let payload = paused
            .payload
            .take()
            .ok_or_else(|| BedrockError::InvalidOption("transaction already reattached".into()))?;
        inner.snapshot = payload.snapshot;
        inner.token = payload.token;
        inner.read_source = payload.read_source;
        inner.tables = payload.tables;
        Ok(())
    }

    // ---- crate-internal surface used by the record store ----

    pub(crate) fn txn_token(&self) -> u64 {
        self.lock().token
    }

    /// The snapshot for reads, opened lazily from the read source.
    pub(crate) fn snapshot(&self) -> Result<Snapshot> {
        let mut inner = self.lock();
        Self::check_poisoned(&inner)?;
        if let Some(snapshot) = inner.snapshot {
            return Ok(snapshot);
        }
        let snapshot = self.shared.open_snapshot(inner.read_source)?;
        inner.snapshot = Some(snapshot);
        Ok(snapshot)
    }

    pub(crate) fn require_write(&self) -> Result<()> {
        let inner = self.lock();
        Self::check_poisoned(&inner)?;
        if self.shared.is_read_only() {
            return Err(BedrockError::InvalidOption(
                "engine is opened read-only".into(),
            ));
        }
        if inner.state != RuState::Active {
            return Err(BedrockError::InvalidOption(
                "writes require an active unit of work".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn record_claim(&self, table: &Arc<Table>, id: RecordId) {
        let mut inner = self.lock();
        let txn = inner
            .tables
            .entry(table.ident().to_string())
            .or_insert_with(|| TableTxn::new(Arc::clone(table)));
        txn.claims.push(id);
    }

    pub(crate) fn buffer_put(
        &self,
        table: &Arc<Table>,
        id: RecordId,
        pending: PendingWrite,
        delta: SizeInfo,
    ) {
        let mut inner = self.lock();
        let txn = inner
            .tables
            .entry(table.ident().to_string())
            .or_insert_with(|| TableTxn::new(Arc::clone(table)));
        txn.puts.insert(id, pending);
        txn.size_delta.add(delta);
    }

    pub(crate) fn buffer_truncate(&self, table: &Arc<Table>, delta: SizeInfo) {
        let mut inner = self.lock();
        let txn = inner
            .tables
            .entry(table.ident().to_string())
            .or_insert_with(|| TableTxn::new(Arc::clone(table)));
        txn.truncate = true;
        txn.puts.clear();
        txn.size_delta = delta;
    }

    /// `Some(Some(_))` live buffered write, `Some(None)` buffered
    /// delete, `None` no buffered state.
    pub(crate) fn buffered_get(&self, ident: &str, id: RecordId) -> Option<Option<Bytes>> {
        let inner = self.lock();
        let txn = inner.tables.get(ident)?;
        if let Some(pending) = txn.puts.get(&id) {
            return Some(pending.data.clone());
        }
        if txn.truncate {
            return Some(None);
        }
        None
    }

    pub(crate) fn buffered_table_writes(&self, ident: &str) -> BTreeMap<RecordId, Option<Bytes>> {
        let inner = self.lock();
        inner
            .tables
            .get(ident)
            .map(|txn| {
                txn.puts
                    .iter()
                    .map(|(id, pending)| (*id, pending.data.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn table_size_delta(&self, ident: &str) -> SizeInfo {
        let inner = self.lock();
        inner
            .tables
            .get(ident)
            .map(|txn| txn.size_delta)
            .unwrap_or_default()
    }

    /// Oldest live buffered insert for `ident` outside `skip`, as a
    /// capped-eviction candidate.
    pub(crate) fn oldest_buffered_live(
        &self,
        ident: &str,
        skip: &BTreeSet<RecordId>,
    ) -> Option<(RecordId, usize)> {
        let inner = self.lock();
        let txn = inner.tables.get(ident)?;
        txn.puts
            .iter()
            .filter(|(id, pending)| pending.data.is_some() && !skip.contains(id))
            .map(|(id, pending)| (*id, pending.data.as_ref().map(Bytes::len).unwrap_or(0)))
            .next()
    }

    pub(crate) fn buffered_removed_ids(&self, ident: &str) -> BTreeSet<RecordId> {
        let inner = self.lock();
        inner
            .tables
            .get(ident)
            .map(|txn| {
                txn.puts
                    .iter()
                    .filter(|(_, pending)| pending.data.is_none())
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn abort_quietly(&self) {
        let mut inner = self.lock();
        if inner.nesting > 0 {
            self.abort_locked(&mut inner);
        } else if inner.snapshot.is_some() || !inner.tables.is_empty() {
            self.rollback_state(&mut inner);
            self.reset_transaction(&mut inner);
        }
    }
}

impl Drop for RecoveryUnit {
    fn drop(&mut self) {
        self.abort_quietly();
    }
}

/// RAII bracket around writes. Construction begins a unit of work on the
/// recovery unit; dropping without [`WriteUnitOfWork::commit`] aborts
/// (or, when nested, forces the outermost unit to abort).
pub struct WriteUnitOfWork<'a> {
    ru: &'a RecoveryUnit,
    toplevel: bool,
    committed: bool,
}

impl<'a> WriteUnitOfWork<'a> {
    pub fn new(ru: &'a RecoveryUnit) -> Result<Self> {
        let depth = ru.begin_unit_of_work()?;
        Ok(Self {
            ru,
            toplevel: depth == 1,
            committed: false,
        })
    }

    pub fn is_toplevel(&self) -> bool {
        self.toplevel
    }

    /// Commit this level. At the outermost level this commits the
    /// underlying transaction; the recovery unit has already cleaned up
    /// if that fails, so the drop path stays idempotent.
    pub fn commit(mut self) -> Result<()> {
        self.committed = true;
        self.ru.commit_unit_of_work()
    }
}

impl Drop for WriteUnitOfWork<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let _ = self.ru.abort_unit_of_work();
        }
    }
}

/// Run `body` until it stops failing with a write conflict. All other
/// errors surface unchanged.
pub fn write_conflict_retry<T, F>(op_name: &str, ns: &str, mut body: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempts = 0u32;
    loop {
        match body() {
            Err(e) if e.is_retryable() => {
                attempts += 1;
                log::debug!(
                    "write conflict in {} on {} (attempt {}), retrying",
                    op_name,
                    ns,
                    attempts
                );
                if attempts > 3 {
                    thread::sleep(Duration::from_millis((attempts as u64).min(100)));
                } else {
                    thread::yield_now();
                }
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, EngineConfig};
    use crate::engine::store::TableConfig;
    use tempfile::tempdir;

    fn test_engine(dir: &std::path::Path) -> Engine {
        Engine::open(dir, EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_wuow_commit_and_readback() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        engine
            .create_record_store("t1", TableConfig::default())
            .unwrap();
        let rs = engine.record_store("t1").unwrap();

        let ru = engine.new_recovery_unit();
        let wuow = WriteUnitOfWork::new(&ru).unwrap();
        let id = rs.insert(&ru, b"alpha").unwrap();
        wuow.commit().unwrap();

        let reader = engine.new_recovery_unit();
        assert_eq!(rs.find(&reader, id).unwrap(), &b"alpha"[..]);
    }

    #[test]
    fn test_wuow_drop_aborts() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        engine
            .create_record_store("t1", TableConfig::default())
            .unwrap();
        let rs = engine.record_store("t1").unwrap();

        let ru = engine.new_recovery_unit();
        let id = {
            let _wuow = WriteUnitOfWork::new(&ru).unwrap();
            rs.insert(&ru, b"ghost").unwrap()
            // dropped without commit
        };
        assert_eq!(ru.state(), RuState::Inactive);

        let reader = engine.new_recovery_unit();
        assert_eq!(
            rs.find(&reader, id).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_nested_wuow_defers_to_outermost() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        engine
            .create_record_store("t1", TableConfig::default())
            .unwrap();
        let rs = engine.record_store("t1").unwrap();

        let ru = engine.new_recovery_unit();
        let outer = WriteUnitOfWork::new(&ru).unwrap();
        let id = rs.insert(&ru, b"outer").unwrap();
        {
            let inner = WriteUnitOfWork::new(&ru).unwrap();
            assert!(!inner.is_toplevel());
            rs.insert(&ru, b"inner").unwrap();
            inner.commit().unwrap();
            // Nothing visible yet: only the outermost commit installs.
            let reader = engine.new_recovery_unit();
            assert!(rs.find(&reader, id).is_err());
        }
        outer.commit().unwrap();

        let reader = engine.new_recovery_unit();
        assert!(rs.find(&reader, id).is_ok());
    }

    #[test]
    fn test_nested_abort_forces_outer_abort() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        engine
            .create_record_store("t1", TableConfig::default())
            .unwrap();
        let rs = engine.record_store("t1").unwrap();

        let ru = engine.new_recovery_unit();
        let outer = WriteUnitOfWork::new(&ru).unwrap();
        let id = rs.insert(&ru, b"doomed").unwrap();
        {
            let _inner = WriteUnitOfWork::new(&ru).unwrap();
            // dropped without commit
        }
        let err = outer.commit().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOption);

        let reader = engine.new_recovery_unit();
        assert!(rs.find(&reader, id).is_err());
    }

    #[test]
    fn test_snapshot_stability_within_unit() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        engine
            .create_record_store("t1", TableConfig::default())
            .unwrap();
        let rs = engine.record_store("t1").unwrap();

        let id = {
            let ru = engine.new_recovery_unit();
            let wuow = WriteUnitOfWork::new(&ru).unwrap();
            let id = rs.insert(&ru, b"v1").unwrap();
            wuow.commit().unwrap();
            id
        };

        let reader = engine.new_recovery_unit();
        assert_eq!(rs.find(&reader, id).unwrap(), &b"v1"[..]);

        // A concurrent update commits under the reader.
        {
            let writer = engine.new_recovery_unit();
            let wuow = WriteUnitOfWork::new(&writer).unwrap();
            rs.update(&writer, id, b"v2").unwrap();
            wuow.commit().unwrap();
        }

        // Repeated reads in the open snapshot stay identical.
        assert_eq!(rs.find(&reader, id).unwrap(), &b"v1"[..]);

        // A fresh snapshot observes the update.
        reader.abandon_snapshot().unwrap();
        assert_eq!(rs.find(&reader, id).unwrap(), &b"v2"[..]);
    }

    #[test]
    fn test_write_conflict_and_retry() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        engine
            .create_record_store("t1", TableConfig::default())
            .unwrap();
        let rs = engine.record_store("t1").unwrap();

        let id = {
            let ru = engine.new_recovery_unit();
            let wuow = WriteUnitOfWork::new(&ru).unwrap();
            let id = rs.insert(&ru, b"base").unwrap();
            wuow.commit().unwrap();
            id
        };

        // First writer claims the record.
        let ru1 = engine.new_recovery_unit();
        let wuow1 = WriteUnitOfWork::new(&ru1).unwrap();
        rs.update(&ru1, id, b"first").unwrap();

        // Second writer conflicts while the claim is held.
        {
            let ru2 = engine.new_recovery_unit();
            let _wuow2 = WriteUnitOfWork::new(&ru2).unwrap();
            let err = rs.update(&ru2, id, b"second").unwrap_err();
            assert_eq!(err.kind(), ErrorKind::WriteConflict);
        }

        wuow1.commit().unwrap();

        // The retry helper wins on the next attempt and sees the first
        // writer's data in its new snapshot.
        let observed = write_conflict_retry("update", "t1", || {
            let ru = engine.new_recovery_unit();
            let before = rs.find(&ru, id)?;
            let wuow = WriteUnitOfWork::new(&ru)?;
            rs.update(&ru, id, b"second")?;
            wuow.commit()?;
            Ok(before)
        })
        .unwrap();
        assert_eq!(observed, &b"first"[..]);
    }

    #[test]
    fn test_set_read_source_rejected_while_active() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        let ru = engine.new_recovery_unit();
        let _wuow = WriteUnitOfWork::new(&ru).unwrap();
        let err = ru.set_read_source(ReadSource::Majority).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOption);
    }

    #[test]
    fn test_abandon_snapshot_rejected_inside_unit() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        let ru = engine.new_recovery_unit();
        let _wuow = WriteUnitOfWork::new(&ru).unwrap();
        assert_eq!(
            ru.abandon_snapshot().unwrap_err().kind(),
            ErrorKind::InvalidOption
        );
    }

    #[test]
    fn test_commit_handlers_run_in_order_rollback_reversed() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        let order = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));

        let ru = engine.new_recovery_unit();
        let wuow = WriteUnitOfWork::new(&ru).unwrap();
        for label in ["a", "b"] {
            let order = Arc::clone(&order);
            let counter = Arc::clone(&counter);
            ru.on_commit_and_rollback(
                move |_| {
                    order.lock().unwrap().push(label);
                },
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();
        }
        wuow.commit().unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        let rollback_order = Arc::new(Mutex::new(Vec::new()));
        let ru = engine.new_recovery_unit();
        let wuow = WriteUnitOfWork::new(&ru).unwrap();
        for label in ["x", "y"] {
            let rollback_order = Arc::clone(&rollback_order);
            ru.on_commit_and_rollback(move |_| {}, move || {
                rollback_order.lock().unwrap().push(label);
            })
            .unwrap();
        }
        drop(wuow);
        assert_eq!(*rollback_order.lock().unwrap(), vec!["y", "x"]);
    }

    #[test]
    fn test_release_and_reattach() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        engine
            .create_record_store("t1", TableConfig::default())
            .unwrap();
        let rs = engine.record_store("t1").unwrap();

        let id = {
            let ru = engine.new_recovery_unit();
            let wuow = WriteUnitOfWork::new(&ru).unwrap();
            let id = rs.insert(&ru, b"v1").unwrap();
            wuow.commit().unwrap();
            id
        };

        let ru = engine.new_recovery_unit();
        // Open the snapshot by reading.
        assert_eq!(rs.find(&ru, id).unwrap(), &b"v1"[..]);
        let paused = ru.release().unwrap();
        assert_eq!(ru.state(), RuState::Inactive);

        // A later update commits while the transaction is paused.
        {
            let writer = engine.new_recovery_unit();
            let wuow = WriteUnitOfWork::new(&writer).unwrap();
            rs.update(&writer, id, b"v2").unwrap();
            wuow.commit().unwrap();
        }

        ru.reattach(paused).unwrap();
        // The reattached snapshot still reads its original view.
        assert_eq!(rs.find(&ru, id).unwrap(), &b"v1"[..]);
    }

    #[test]
    fn test_poisoned_after_failed_commit() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        engine
            .create_record_store("t1", TableConfig::default())
            .unwrap();
        let rs = engine.record_store("t1").unwrap();

        // Advance stable (oldest follows with a zero history window) so
        // a stale commit timestamp is rejected.
        engine
            .set_stable_timestamp(Timestamp::new(100, 0), false)
            .unwrap();

        let ru = engine.new_recovery_unit();
        let wuow = WriteUnitOfWork::new(&ru).unwrap();
        rs.insert(&ru, b"x").unwrap();
        ru.set_timestamp(Timestamp::new(10, 0)).unwrap();
        assert!(wuow.commit().is_err());

        // Every subsequent call reports the poison.
        assert!(ru.begin_unit_of_work().is_err());
        assert!(ru.snapshot().is_err());
    }

    #[test]
    fn test_prepare_state_machine() {
        let dir = tempdir().unwrap();
        let engine = test_engine(dir.path());
        engine
            .create_record_store("t1", TableConfig::default())
            .unwrap();
        let rs = engine.record_store("t1").unwrap();

        let ru = engine.new_recovery_unit();
        let wuow = WriteUnitOfWork::new(&ru).unwrap();
        rs.insert(&ru, b"p").unwrap();
        ru.set_timestamp(Timestamp::new(5, 0)).unwrap();
        ru.set_prepare_timestamp(Timestamp::new(5, 0)).unwrap();
        assert_eq!(ru.state(), RuState::Prepared);

        // Writes are rejected while prepared.
        assert_eq!(
            rs.insert(&ru, b"q").unwrap_err().kind(),
            ErrorKind::InvalidOption
        );

        wuow.commit().unwrap();
        assert_eq!(ru.state(), RuState::Inactive);
    }
}
