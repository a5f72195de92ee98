//! Core value types shared across the engine
//!
//! Timestamps follow the replication clock convention: the upper 32 bits
//! are wall-clock seconds, the lower 32 bits a per-second increment.
//! Record ids are opaque, totally ordered 64-bit values; for oplog tables
//! the id *is* the record's timestamp.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{BedrockError, Result};

/// A logical commit time: `secs << 32 | inc`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The null timestamp.
    pub const MIN: Timestamp = Timestamp(0);
    /// The largest representable timestamp.
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    pub fn new(secs: u32, inc: u32) -> Self {
        Timestamp(((secs as u64) << 32) | inc as u64)
    }

    pub fn from_u64(raw: u64) -> Self {
        Timestamp(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn secs(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn inc(self) -> u32 {
        self.0 as u32
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// True for the values (0 and 1) that mark the data set as not yet
    /// consistent; checkpoints taken in this range are untimestamped.
    pub fn allows_unstable_checkpoints(self) -> bool {
        self.0 <= 1
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.secs(), self.inc())
    }
}

/// Opaque identifier for a record within one table. Assigned
/// monotonically for standard tables; equal to the record's timestamp
/// for oplog tables.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RecordId(pub u64);

impl RecordId {
    pub const MIN: RecordId = RecordId(0);
    pub const MAX: RecordId = RecordId(u64::MAX);

    pub fn from_timestamp(ts: Timestamp) -> Self {
        RecordId(ts.as_u64())
    }

    pub fn as_timestamp(self) -> Timestamp {
        Timestamp::from_u64(self.0)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-ident record count and byte size. Values may go negative
/// transiently during replay; they are clamped to zero on persistence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeInfo {
    pub num_records: i64,
    pub data_size: i64,
}

impl SizeInfo {
    pub fn new(num_records: i64, data_size: i64) -> Self {
        Self {
            num_records,
            data_size,
        }
    }

    pub fn add(&mut self, other: SizeInfo) {
        self.num_records += other.num_records;
        self.data_size += other.data_size;
    }

    /// Clamp both fields to zero. Applied before persisting.
    pub fn clamped(self) -> Self {
        Self {
            num_records: self.num_records.max(0),
            data_size: self.data_size.max(0),
        }
    }

    pub fn is_zero(self) -> bool {
        self.num_records == 0 && self.data_size == 0
    }
}

/// How a transaction chooses its read timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// Read the newest committed data, ignoring timestamps.
    NoTimestamp,
    /// Read at the last timestamp the replication layer applied through.
    LastApplied,
    /// Read at the majority-committed (stable) timestamp.
    Majority,
    /// Read at an explicitly provided timestamp.
    Provided(Timestamp),
    /// Read at the all-durable timestamp.
    AllDurable,
}

/// Operation-scoped cancellation context. Blocking calls check the
/// interruption flag and the deadline and give up with `Interrupted`.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    deadline: Option<Instant>,
    interrupted: Arc<AtomicBool>,
}

impl OpContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Mark the operation interrupted. Safe to call from another thread
    /// through a clone of this context.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Return `Interrupted` if the operation was cancelled or its
    /// deadline has passed.
    pub fn check(&self) -> Result<()> {
        if self.interrupted.load(Ordering::Acquire) {
            return Err(BedrockError::Interrupted);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(BedrockError::Interrupted);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_timestamp_encoding() {
        let ts = Timestamp::new(1000, 7);
        assert_eq!(ts.secs(), 1000);
        assert_eq!(ts.inc(), 7);
        assert_eq!(ts.as_u64(), (1000u64 << 32) | 7);
    }

    #[test]
    fn test_timestamp_ordering() {
        assert!(Timestamp::new(5, 0) < Timestamp::new(5, 1));
        assert!(Timestamp::new(5, 99) < Timestamp::new(6, 0));
        assert!(Timestamp::MIN < Timestamp::new(0, 1));
    }

    #[test]
    fn test_timestamp_sentinels() {
        assert!(Timestamp::MIN.allows_unstable_checkpoints());
        assert!(Timestamp::from_u64(1).allows_unstable_checkpoints());
        assert!(!Timestamp::new(0, 2).allows_unstable_checkpoints());
        assert!(Timestamp::MIN.is_null());
        assert!(!Timestamp::from_u64(1).is_null());
    }

    #[test]
    fn test_record_id_timestamp_roundtrip() {
        let ts = Timestamp::new(123, 4);
        let id = RecordId::from_timestamp(ts);
        assert_eq!(id.as_timestamp(), ts);
    }

    #[test]
    fn test_size_info_clamping() {
        let mut info = SizeInfo::new(2, 100);
        info.add(SizeInfo::new(-5, -500));
        assert_eq!(info.num_records, -3);
        let clamped = info.clamped();
        assert_eq!(clamped.num_records, 0);
        assert_eq!(clamped.data_size, 0);
    }

    #[test]
    fn test_op_context_interrupt() {
        let ctx = OpContext::new();
        assert!(ctx.check().is_ok());
        ctx.interrupt();
        assert!(ctx.check().is_err());
    }

    #[test]
    fn test_op_context_deadline() {
        let ctx = OpContext::with_deadline(Instant::now() - Duration::from_millis(1));
        assert!(ctx.check().is_err());
    }
}
