//! Segmented journal and the journal flusher thread
//!
//! Committed writes are appended to the journal without fsync; a
//! dedicated flusher thread makes them durable in rounds, either on a
//! configurable interval or on demand. Waiters share one fsync per round
//! through a pair of promise slots: callers that join before a round
//! starts resolve with that round, callers that join mid-round resolve
//! with the following one.
//!
//! The journal is a sequence of numbered segment files under
//! `journal/`. Each record is binary-encoded with a 4-byte length
//! prefix. A segment rolls once it exceeds the configured size; closed
//! segments whose newest commit timestamp is older than the oplog needed
//! for crash recovery are deleted by the checkpoint pass, unless an open
//! backup cursor pins them.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BedrockError, ErrorKind, Result};
use crate::types::{OpContext, Timestamp};

/// One journaled mutation. Replay applies these in order within a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JournalOp {
    Insert {
        ident: String,
        id: u64,
        data: Vec<u8>,
    },
    Update {
        ident: String,
        id: u64,
        data: Vec<u8>,
    },
    Delete {
        ident: String,
        id: u64,
    },
    Truncate {
        ident: String,
    },
}

/// One committed transaction's worth of journal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    /// Commit sequence number, unique and increasing across the engine.
    pub seq: u64,
    /// Commit timestamp, if the transaction declared one.
    pub commit_ts: Option<Timestamp>,
    pub ops: Vec<JournalOp>,
}

/// A closed, fully synced segment.
#[derive(Debug, Clone)]
struct SegmentInfo {
    index: u64,
    path: PathBuf,
    /// Newest commit timestamp contained in the segment.
    max_commit_ts: Timestamp,
}

struct SegmentWriter {
    file: Option<File>,
    index: u64,
    bytes: u64,
    max_commit_ts: Timestamp,
    /// Highest seq written into the current segment (not yet synced).
    written_seq: u64,
    written_ts: Timestamp,
}

fn segment_file_name(index: u64) -> String {
    format!("journal-{:06}.log", index)
}

fn parse_segment_index(name: &str) -> Option<u64> {
    let rest = name.strip_prefix("journal-")?.strip_suffix(".log")?;
    rest.parse().ok()
}

/// The on-disk journal. Appends are buffered to the OS; durability comes
/// from [`Journal::sync`], driven by the flusher thread.
pub struct Journal {
    dir: PathBuf,
    /// False in ephemeral mode: appends and syncs become no-ops that
    /// still advance the durable markers.
    enabled: bool,
    max_segment_bytes: u64,
    writer: Mutex<SegmentWriter>,
    segments: Mutex<Vec<SegmentInfo>>,
    durable_seq: AtomicU64,
    durable_ts: AtomicU64,
}

impl Journal {
    /// Open the journal directory, indexing any segments left over from
    /// a previous run. Writing starts in a fresh segment so recovery
    /// replay and new appends never share a file.
    pub fn open(data_dir: &Path, enabled: bool, max_segment_bytes: u64) -> Result<Self> {
        let dir = data_dir.join("journal");
        if enabled {
            fs::create_dir_all(&dir)?;
        }

        let mut segments = Vec::new();
        let mut max_index = 0u64;
        if enabled && dir.exists() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if let Some(index) = parse_segment_index(name) {
                    max_index = max_index.max(index);
                    segments.push(SegmentInfo {
                        index,
                        path: entry.path(),
                        // Unknown until scanned; MAX keeps the segment
                        // from being pruned before replay inspects it.
                        max_commit_ts: Timestamp::MAX,
                    });
                }
            }
            segments.sort_by_key(|s| s.index);
        }

        Ok(Self {
            dir,
            enabled,
            max_segment_bytes,
            writer: Mutex::new(SegmentWriter {
                file: None,
                index: max_index + 1,
                bytes: 0,
                max_commit_ts: Timestamp::MIN,
                written_seq: 0,
                written_ts: Timestamp::MIN,
            }),
            segments: Mutex::new(segments),
            durable_seq: AtomicU64::new(0),
            durable_ts: AtomicU64::new(0),
        })
    }

    /// Append a record without waiting for durability. Data reaches the
    /// OS buffer; fsync happens in the next flusher round.
    pub fn append(&self, record: &JournalRecord) -> Result<()> {
        let mut writer = self.writer.lock().expect("journal writer lock poisoned");

        if self.enabled {
            if writer.file.is_none() {
                let path = self.dir.join(segment_file_name(writer.index));
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                writer.file = Some(file);
                writer.bytes = 0;
                writer.max_commit_ts = Timestamp::MIN;
            }

            let encoded = bincode::serialize(record)?;
            let len = encoded.len() as u32;
            let file = writer.file.as_mut().expect("segment file just opened");
            file.write_all(&len.to_le_bytes())?;
            file.write_all(&encoded)?;
            file.flush()?;
            writer.bytes += 4 + encoded.len() as u64;
        }

        writer.written_seq = writer.written_seq.max(record.seq);
        if let Some(ts) = record.commit_ts {
            writer.max_commit_ts = writer.max_commit_ts.max(ts);
            writer.written_ts = writer.written_ts.max(ts);
        }

        if self.enabled && writer.bytes >= self.max_segment_bytes {
            self.roll_segment(&mut writer)?;
        }
        Ok(())
    }

    /// Close the current segment (fsynced) and start a new one.
    fn roll_segment(&self, writer: &mut SegmentWriter) -> Result<()> {
        let Some(file) = writer.file.take() else {
            return Ok(());
        };
        file.sync_data()?;
        let closed = SegmentInfo {
            index: writer.index,
            path: self.dir.join(segment_file_name(writer.index)),
            max_commit_ts: writer.max_commit_ts,
        };
        log::debug!(
            "journal segment {} closed ({} bytes, newest commit {})",
            closed.index,
            writer.bytes,
            closed.max_commit_ts
        );
        self.segments
            .lock()
            .expect("journal segments lock poisoned")
            .push(closed);
        writer.index += 1;
        writer.bytes = 0;
        writer.max_commit_ts = Timestamp::MIN;
        // Everything in closed segments is durable.
        self.mark_durable(writer.written_seq, writer.written_ts);
        Ok(())
    }

    /// Force everything written so far to disk and advance the durable
    /// markers. Called by the flusher once per round.
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock().expect("journal writer lock poisoned");
        if self.enabled {
            if let Some(file) = writer.file.as_mut() {
                file.sync_data()?;
            }
        }
        let (seq, ts) = (writer.written_seq, writer.written_ts);
        drop(writer);
        self.mark_durable(seq, ts);
        Ok(())
    }

    fn mark_durable(&self, seq: u64, ts: Timestamp) {
        self.durable_seq.fetch_max(seq, Ordering::AcqRel);
        self.durable_ts.fetch_max(ts.as_u64(), Ordering::AcqRel);
    }

    /// Highest commit sequence known durable.
    pub fn durable_seq(&self) -> u64 {
        self.durable_seq.load(Ordering::Acquire)
    }

    /// Newest commit timestamp known durable.
    pub fn durable_timestamp(&self) -> Timestamp {
        Timestamp::from_u64(self.durable_ts.load(Ordering::Acquire))
    }

    /// After replay, bound leftover segments' pruning metadata by the
    /// newest commit the scan found; without this, segments inherited
    /// from a previous run would never become prunable.
    pub fn bound_recovered_segments(&self, max_ts: Timestamp) {
        let mut segments = self.segments.lock().expect("journal segments lock poisoned");
        for seg in segments.iter_mut() {
            if seg.max_commit_ts == Timestamp::MAX {
                seg.max_commit_ts = max_ts;
            }
        }
    }

    /// Seed the durable markers from recovery, before the flusher runs.
    pub fn note_recovered(&self, seq: u64, ts: Timestamp) {
        let mut writer = self.writer.lock().expect("journal writer lock poisoned");
        writer.written_seq = writer.written_seq.max(seq);
        writer.written_ts = writer.written_ts.max(ts);
        drop(writer);
        self.mark_durable(seq, ts);
    }

    /// Index of the segment currently accepting appends.
    pub fn current_segment_index(&self) -> u64 {
        self.writer.lock().expect("journal writer lock poisoned").index
    }

    /// All journal files on disk, oldest first, including the active
    /// segment. Used by backup.
    pub fn segment_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .segments
            .lock()
            .expect("journal segments lock poisoned")
            .iter()
            .map(|s| s.path.clone())
            .collect();
        let writer = self.writer.lock().expect("journal writer lock poisoned");
        if writer.file.is_some() {
            paths.push(self.dir.join(segment_file_name(writer.index)));
        }
        paths
    }

    /// Journal files created at or after the given segment index.
    pub fn segments_since(&self, index: u64) -> Vec<PathBuf> {
        self.segment_paths()
            .into_iter()
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .and_then(parse_segment_index)
                    .map(|i| i >= index)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Delete closed segments whose newest commit is older than `floor`.
    /// `pin` (an open backup's oplog pin) lowers the floor further.
    pub fn prune_older_than(&self, floor: Timestamp, pin: Option<Timestamp>) -> Result<usize> {
        let effective = match pin {
            Some(p) => floor.min(p),
            None => floor,
        };
        let mut segments = self.segments.lock().expect("journal segments lock poisoned");
        let mut removed = 0;
        segments.retain(|seg| {
            if seg.max_commit_ts < effective {
                match fs::remove_file(&seg.path) {
                    Ok(()) => {
                        log::debug!("pruned journal segment {}", seg.index);
                        removed += 1;
                        false
                    }
                    Err(e) => {
                        log::warn!("failed to prune journal segment {}: {}", seg.index, e);
                        true
                    }
                }
            } else {
                true
            }
        });
        Ok(removed)
    }

    /// Delete every closed segment and reset the active one. Used after
    /// rollback-to-stable, once a fresh checkpoint has made the journal
    /// contents redundant.
    pub fn truncate_all(&self) -> Result<()> {
        let mut segments = self.segments.lock().expect("journal segments lock poisoned");
        for seg in segments.drain(..) {
            if let Err(e) = fs::remove_file(&seg.path) {
                log::warn!("failed to remove journal segment {}: {}", seg.index, e);
            }
        }
        drop(segments);

        let mut writer = self.writer.lock().expect("journal writer lock poisoned");
        if let Some(file) = writer.file.take() {
            drop(file);
            let path = self.dir.join(segment_file_name(writer.index));
            if let Err(e) = fs::remove_file(&path) {
                log::warn!("failed to remove active journal segment: {}", e);
            }
        }
        writer.index += 1;
        writer.bytes = 0;
        writer.max_commit_ts = Timestamp::MIN;
        Ok(())
    }

    /// Scan every segment in index order and hand each decodable record
    /// with `seq > after_seq` to `apply`. A truncated or corrupt tail
    /// ends the scan: records past a torn write were never acknowledged
    /// durable, so they must not be replayed.
    pub fn replay<F>(data_dir: &Path, after_seq: u64, mut apply: F) -> Result<ReplaySummary>
    where
        F: FnMut(JournalRecord) -> Result<()>,
    {
        let dir = data_dir.join("journal");
        let mut summary = ReplaySummary::default();
        if !dir.exists() {
            return Ok(summary);
        }

        let mut indexed: Vec<(u64, PathBuf)> = fs::read_dir(&dir)?
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let name = entry.file_name();
                let index = parse_segment_index(name.to_str()?)?;
                Some((index, entry.path()))
            })
            .collect();
        indexed.sort_by_key(|(i, _)| *i);

        'segments: for (index, path) in indexed {
            let mut file = File::open(&path)?;
            loop {
                let mut len_buf = [0u8; 4];
                match file.read_exact(&mut len_buf) {
                    Ok(()) => {}
                    Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e.into()),
                }
                let len = u32::from_le_bytes(len_buf) as usize;
                let mut record_buf = vec![0u8; len];
                if file.read_exact(&mut record_buf).is_err() {
                    log::warn!("journal segment {} has a torn tail, ending replay", index);
                    break 'segments;
                }
                let record: JournalRecord = match bincode::deserialize(&record_buf) {
                    Ok(r) => r,
                    Err(e) => {
                        log::warn!(
                            "journal segment {} has an undecodable record ({}), ending replay",
                            index,
                            e
                        );
                        break 'segments;
                    }
                };
                summary.max_seq = summary.max_seq.max(record.seq);
                if let Some(ts) = record.commit_ts {
                    summary.max_commit_ts = summary.max_commit_ts.max(ts);
                }
                if record.seq > after_seq {
                    apply(record)?;
                    summary.applied += 1;
                }
            }
        }
        Ok(summary)
    }
}

/// What a journal replay found.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplaySummary {
    pub applied: u64,
    pub max_seq: u64,
    pub max_commit_ts: Timestamp,
}

/// Cloneable outcome of one flush round. Errors carry only their kind
/// and message so every waiter can observe them.
#[derive(Debug, Clone)]
enum RoundOutcome {
    Ok,
    Err(ErrorKind, String),
}

impl RoundOutcome {
    fn from_error(e: &BedrockError) -> Self {
        RoundOutcome::Err(e.kind(), e.to_string())
    }

    fn into_result(self) -> Result<()> {
        match self {
            RoundOutcome::Ok => Ok(()),
            RoundOutcome::Err(kind, msg) => Err(BedrockError::from_kind(kind, msg)),
        }
    }
}

/// Completion signal shared by every waiter of one flush round.
/// Resolves at most once.
pub struct FlushSignal {
    state: Mutex<Option<RoundOutcome>>,
    cv: Condvar,
}

impl FlushSignal {
    fn new() -> Self {
        Self {
            state: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn complete(&self, outcome: RoundOutcome) {
        let mut state = self.state.lock().expect("flush signal lock poisoned");
        if state.is_none() {
            *state = Some(outcome);
            self.cv.notify_all();
        }
    }

    /// Block until the round resolves, honoring the caller's context.
    pub fn wait(&self, ctx: Option<&OpContext>) -> Result<()> {
        let mut state = self.state.lock().expect("flush signal lock poisoned");
        loop {
            if let Some(outcome) = state.clone() {
                return outcome.into_result();
            }
            if let Some(ctx) = ctx {
                ctx.check()?;
            }
            let (guard, _) = self
                .cv
                .wait_timeout(state, Duration::from_millis(50))
                .expect("flush signal wait poisoned");
            state = guard;
        }
    }
}

struct FlusherState {
    flush_now: bool,
    shutting_down: bool,
    current: Arc<FlushSignal>,
    next: Arc<FlushSignal>,
}

struct FlusherShared {
    journal: Arc<Journal>,
    state: Mutex<FlusherState>,
    cv: Condvar,
    interrupt_requested: AtomicBool,
    commit_interval: Duration,
}

/// Background thread that makes committed writes durable and wakes
/// waiters once per round.
pub struct JournalFlusher {
    shared: Arc<FlusherShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl JournalFlusher {
    pub fn start(journal: Arc<Journal>, commit_interval: Duration) -> Self {
        let shared = Arc::new(FlusherShared {
            journal,
            state: Mutex::new(FlusherState {
                flush_now: false,
                shutting_down: false,
                current: Arc::new(FlushSignal::new()),
                next: Arc::new(FlushSignal::new()),
            }),
            cv: Condvar::new(),
            interrupt_requested: AtomicBool::new(false),
            commit_interval,
        });
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("bedrock-journal-flusher".into())
            .spawn(move || flusher_loop(thread_shared))
            .expect("failed to spawn journal flusher");
        Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Request an immediate flush without waiting for it.
    pub fn trigger_flush(&self) {
        let mut state = self.shared.state.lock().expect("flusher state lock poisoned");
        if !state.flush_now {
            state.flush_now = true;
            self.shared.cv.notify_one();
        }
    }

    /// Block until a round that started after this call completes.
    pub fn wait_for_flush(&self, ctx: Option<&OpContext>) -> Result<()> {
        let signal = {
            let mut state = self.shared.state.lock().expect("flusher state lock poisoned");
            if state.shutting_down {
                return Err(BedrockError::shutdown("journal flusher"));
            }
            if !state.flush_now {
                state.flush_now = true;
                self.shared.cv.notify_one();
            }
            Arc::clone(&state.next)
        };
        signal.wait(ctx)
    }

    /// Resolve the in-flight round with `Interrupted`; used when a
    /// replication state change must not wait out a slow fsync.
    pub fn interrupt_for_state_change(&self) {
        self.shared.interrupt_requested.store(true, Ordering::Release);
        self.trigger_flush();
    }

    /// Signal the thread to stop and wait for it. Idempotent.
    pub fn shutdown(&self) {
        self.request_shutdown();
        let handle = self
            .handle
            .lock()
            .expect("flusher handle lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn request_shutdown(&self) {
        let mut state = self.shared.state.lock().expect("flusher state lock poisoned");
        state.shutting_down = true;
        self.shared.cv.notify_one();
    }
}

impl Drop for JournalFlusher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn flusher_loop(shared: Arc<FlusherShared>) {
    log::debug!("journal flusher started");
    loop {
        let current = {
            let state = shared.state.lock().expect("flusher state lock poisoned");
            Arc::clone(&state.current)
        };

        let outcome = if shared.interrupt_requested.swap(false, Ordering::AcqRel) {
            RoundOutcome::Err(ErrorKind::Interrupted, "replication state change".into())
        } else {
            match shared.journal.sync() {
                Ok(()) => RoundOutcome::Ok,
                Err(e) => {
                    log::error!("journal flush round failed: {}", e);
                    RoundOutcome::from_error(&e)
                }
            }
        };
        current.complete(outcome);

        let mut state = shared.state.lock().expect("flusher state lock poisoned");
        let (guard, _timeout) = shared
            .cv
            .wait_timeout_while(state, shared.commit_interval, |s| {
                !s.flush_now && !s.shutting_down
            })
            .expect("flusher state wait poisoned");
        state = guard;
        state.flush_now = false;

        if state.shutting_down {
            state
                .next
                .complete(RoundOutcome::Err(
                    ErrorKind::ShutdownInProgress,
                    "journal flusher is shutting down".into(),
                ));
            log::debug!("journal flusher stopping");
            return;
        }

        state.current = std::mem::replace(&mut state.next, Arc::new(FlushSignal::new()));
    }
}
