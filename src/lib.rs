//! Bedrock: a storage durability core for a document database
//!
//! Bedrock owns a data directory and provides the transactional and
//! durability substrate the layers above build on:
//!
//! - **Recovery units**: per-operation transactional handles with
//!   snapshot isolation, nested write units of work, commit/abort, and
//!   registered commit/rollback handlers.
//! - **Timestamps**: the stable/oldest/initial-data model, with oldest
//!   derived from stable through a configurable history window and an
//!   all-durable timestamp that never regresses.
//! - **Checkpoints**: a background thread persisting a consistent view
//!   of every table at the stable timestamp, plus rollback-to-stable.
//! - **Journal**: committed writes appended without fsync and made
//!   durable in shared rounds by the journal flusher.
//! - **Idents**: opaque names mapping to record stores (collections and
//!   indexes), with deferred drops and repair-mode orphan recovery.
//! - **Backup**: full and incremental backup cursors that freeze file
//!   sets and pin the journal while open.
//!
//! ```no_run
//! use bedrock::{Engine, EngineConfig, TableConfig, WriteUnitOfWork};
//!
//! # fn main() -> bedrock::Result<()> {
//! let engine = Engine::open(std::path::Path::new("./data"), EngineConfig::default())?;
//! let store = engine.create_record_store("collection-1", TableConfig::default())?;
//!
//! let ru = engine.new_recovery_unit();
//! let wuow = WriteUnitOfWork::new(&ru)?;
//! let id = store.insert(&ru, b"document bytes")?;
//! wuow.commit()?;
//!
//! let reader = engine.new_recovery_unit();
//! assert_eq!(store.find(&reader, id)?, &b"document bytes"[..]);
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod error;
pub mod types;

pub use engine::backup::{BackupBlock, BackupFile, BackupOptions};
pub use engine::registry::{DropOutcome, RecoveryOutcome};
pub use engine::sessions::{SessionCache, SessionHandle};
pub use engine::store::{
    CompactAdaptor, CompactStats, Direction, RecordCursor, RecordStore, TableConfig,
};
pub use engine::txn::{
    write_conflict_retry, Change, PausedTransaction, RecoveryUnit, RuState, WriteUnitOfWork,
};
pub use engine::{Engine, EngineConfig};
pub use error::{BedrockError, ErrorKind, Result};
pub use types::{OpContext, ReadSource, RecordId, SizeInfo, Timestamp};
