//! Checkpoint background task
//!
//! A single thread sleeps on a condition variable for the configured
//! interval and then decides, from the initial-data and stable
//! timestamps, what kind of checkpoint to take:
//!
//! - no consistent view of the data yet: untimestamped full checkpoint
//! - stable behind initial data: skip; the data on disk would be
//!   logically invalid at the stable timestamp
//! - otherwise: stable checkpoint, with `oplogNeededForRollback`
//!   snapshotted before the checkpoint and
//!   `oplogNeededForCrashRecovery` published after it succeeds
//!
//! The first time stable crosses initial data the thread is woken
//! immediately instead of waiting out the interval; a one-shot latch
//! keeps that from firing twice. Each pass also drains queued drops,
//! truncates unreachable version history, and prunes journal segments
//! the published crash-recovery point (and any open backup pin) no
//! longer needs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::ErrorKind;
use crate::types::Timestamp;

use super::store::CheckpointMode;
use super::EngineShared;

struct CheckpointGate {
    wake: bool,
    shutting_down: bool,
}

pub(crate) struct CheckpointShared {
    engine: Weak<EngineShared>,
    gate: Mutex<CheckpointGate>,
    cv: Condvar,
    interval: Duration,
    first_stable_triggered: AtomicBool,
    oplog_needed_for_crash_recovery: AtomicU64,
}

pub(crate) struct CheckpointEngine {
    shared: Arc<CheckpointShared>,
    handle: Option<JoinHandle<()>>,
}

impl CheckpointEngine {
    pub fn start(engine: Weak<EngineShared>, interval: Duration) -> Self {
        let shared = Arc::new(CheckpointShared {
            engine,
            gate: Mutex::new(CheckpointGate {
                wake: false,
                shutting_down: false,
            }),
            cv: Condvar::new(),
            interval,
            first_stable_triggered: AtomicBool::new(false),
            oplog_needed_for_crash_recovery: AtomicU64::new(0),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("bedrock-checkpointer".into())
            .spawn(move || checkpoint_loop(thread_shared))
            .expect("failed to spawn checkpointer");
        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Wake the loop for an immediate pass.
    pub fn trigger_checkpoint(&self) {
        let mut gate = self.shared.gate.lock().expect("checkpoint gate poisoned");
        gate.wake = true;
        self.shared.cv.notify_one();
    }

    pub fn has_triggered_first_stable(&self) -> bool {
        self.shared.first_stable_triggered.load(Ordering::Acquire)
    }

    /// Expedite the first stable checkpoint: the moment stable crosses
    /// initial data, checkpoint now rather than on the next interval.
    pub fn maybe_trigger_first_stable(
        &self,
        prev_stable: Timestamp,
        initial_data: Timestamp,
        curr_stable: Timestamp,
    ) {
        if self.shared.first_stable_triggered.load(Ordering::Acquire) {
            return;
        }
        if prev_stable < initial_data && curr_stable >= initial_data {
            self.shared
                .first_stable_triggered
                .store(true, Ordering::Release);
            log::info!(
                "triggering the first stable checkpoint (initial data {}, stable {})",
                initial_data,
                curr_stable
            );
            self.trigger_checkpoint();
        }
    }

    /// Newest point the journal must reach back to for crash recovery.
    pub fn oplog_needed_for_crash_recovery(&self) -> Timestamp {
        Timestamp::from_u64(
            self.shared
                .oplog_needed_for_crash_recovery
                .load(Ordering::Acquire),
        )
    }

    /// Stop the loop and wait for it.
    pub fn shutdown(mut self) {
        {
            let mut gate = self.shared.gate.lock().expect("checkpoint gate poisoned");
            gate.shutting_down = true;
            self.shared.cv.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CheckpointEngine {
    fn drop(&mut self) {
        {
            let mut gate = self.shared.gate.lock().expect("checkpoint gate poisoned");
            gate.shutting_down = true;
            self.shared.cv.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn checkpoint_loop(shared: Arc<CheckpointShared>) {
    log::debug!("checkpointer started");
    loop {
        {
            let gate = shared.gate.lock().expect("checkpoint gate poisoned");
            let (mut gate, _) = shared
                .cv
                .wait_timeout_while(gate, shared.interval, |g| !g.wake && !g.shutting_down)
                .expect("checkpoint wait poisoned");
            gate.wake = false;
            if gate.shutting_down {
                break;
            }
        }

        let Some(engine) = shared.engine.upgrade() else {
            break;
        };
        let started = Instant::now();

        engine.registry.drain_pending_drops(engine.backup_active());
        engine.history_pass();

        let stable = engine.timestamps.stable();
        let initial_data = engine.timestamps.initial_data();

        if initial_data.allows_unstable_checkpoints() {
            // No consistent view of the data yet; checkpoint everything
            // without a timestamp.
            match engine.take_checkpoint(CheckpointMode::Full) {
                Ok(_) => {}
                Err(e) => handle_checkpoint_error(&shared, e),
            }
        } else if stable < initial_data {
            log::debug!(
                "stable {} is behind initial data {}, skipping checkpoint",
                stable,
                initial_data
            );
        } else {
            // Record what rollback would need *before* checkpointing, so
            // the published value is guaranteed covered by the
            // checkpoint once it lands.
            let oplog_needed = engine.oplog_needed_for_rollback();
            log::debug!(
                "stable checkpoint at {} (oplog needed for rollback {})",
                stable,
                oplog_needed
            );
            match engine.take_checkpoint(CheckpointMode::Stable(stable)) {
                Ok(_) => {
                    let pin = engine.backup.pinned_oplog();
                    let publish = pin.map_or(oplog_needed, |p| oplog_needed.min(p));
                    shared
                        .oplog_needed_for_crash_recovery
                        .store(publish.as_u64(), Ordering::Release);
                    if let Err(e) = engine.journal.prune_older_than(publish, pin) {
                        log::warn!("journal pruning failed: {}", e);
                    }
                }
                Err(e) => handle_checkpoint_error(&shared, e),
            }
        }

        let elapsed = started.elapsed();
        if elapsed >= Duration::from_secs(30) {
            log::info!("checkpoint took {:?} to complete", elapsed);
        }

        let shutting_down = shared
            .gate
            .lock()
            .expect("checkpoint gate poisoned")
            .shutting_down;
        if shutting_down {
            break;
        }
    }
    log::debug!("checkpointer stopping");
}

fn handle_checkpoint_error(shared: &Arc<CheckpointShared>, e: crate::error::BedrockError) {
    match e.kind() {
        ErrorKind::WriteConflict => {
            log::warn!("checkpoint encountered a write conflict, will retry");
        }
        ErrorKind::ShutdownInProgress => {
            let mut gate = shared.gate.lock().expect("checkpoint gate poisoned");
            gate.shutting_down = true;
        }
        _ => {
            log::error!("checkpoint failed: {}", e);
        }
    }
}
