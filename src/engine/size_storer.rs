//! Persistent per-table size summaries
//!
//! Record-count and byte-size deltas are buffered in memory as
//! transactions commit and merged into the persisted image on flush,
//! which the checkpoint path drives. Values can dip below zero while
//! replay is reconciling; they are clamped on persistence.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{BedrockError, Result};
use crate::types::SizeInfo;

pub struct SizeStorer {
    path: PathBuf,
    ephemeral: bool,
    /// Last flushed image.
    persisted: Mutex<HashMap<String, SizeInfo>>,
    /// Deltas accumulated since the last flush.
    buffer: Mutex<HashMap<String, SizeInfo>>,
}

impl SizeStorer {
    pub fn open(data_dir: &Path, ephemeral: bool) -> Result<Self> {
        let path = data_dir.join("size_storer.json");
        let persisted = if !ephemeral && path.exists() {
            let file = File::open(&path)?;
            serde_json::from_reader(file).map_err(|e| {
                BedrockError::Corruption(format!(
                    "failed to parse size storer '{}': {}",
                    path.display(),
                    e
                ))
            })?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            ephemeral,
            persisted: Mutex::new(persisted),
            buffer: Mutex::new(HashMap::new()),
        })
    }

    /// Buffer a delta for `ident`. Cheap; called on every commit.
    pub fn adjust(&self, ident: &str, delta: SizeInfo) {
        if delta.is_zero() {
            return;
        }
        let mut buffer = self.buffer.lock().expect("size buffer lock poisoned");
        buffer.entry(ident.to_string()).or_default().add(delta);
    }

    /// Last flushed value plus any buffered delta.
    pub fn get(&self, ident: &str) -> SizeInfo {
        let mut info = self
            .persisted
            .lock()
            .expect("size storer lock poisoned")
            .get(ident)
            .copied()
            .unwrap_or_default();
        if let Some(delta) = self
            .buffer
            .lock()
            .expect("size buffer lock poisoned")
            .get(ident)
        {
            info.add(*delta);
        }
        info
    }

    /// Replace the entry with an authoritative value, discarding any
    /// buffered delta. Used when a checkpoint has just measured the
    /// table exactly, and by recovery reconciliation.
    pub fn set_exact(&self, ident: &str, info: SizeInfo) {
        self.buffer
            .lock()
            .expect("size buffer lock poisoned")
            .remove(ident);
        self.persisted
            .lock()
            .expect("size storer lock poisoned")
            .insert(ident.to_string(), info.clamped());
    }

    /// Forget a dropped ident.
    pub fn remove(&self, ident: &str) {
        self.buffer
            .lock()
            .expect("size buffer lock poisoned")
            .remove(ident);
        self.persisted
            .lock()
            .expect("size storer lock poisoned")
            .remove(ident);
    }

    /// Replace the whole mapping, e.g. after rollback-to-stable rebuilt
    /// sizes from the live tables.
    pub fn rebuild(&self, entries: HashMap<String, SizeInfo>) {
        self.buffer
            .lock()
            .expect("size buffer lock poisoned")
            .clear();
        let mut persisted = self.persisted.lock().expect("size storer lock poisoned");
        *persisted = entries
            .into_iter()
            .map(|(ident, info)| (ident, info.clamped()))
            .collect();
    }

    /// Merge buffered deltas into the image and write it out atomically.
    /// With `sync` the file is fsynced before rename.
    pub fn flush(&self, sync: bool) -> Result<()> {
        let mut persisted = self.persisted.lock().expect("size storer lock poisoned");
        {
            let mut buffer = self.buffer.lock().expect("size buffer lock poisoned");
            for (ident, delta) in buffer.drain() {
                let entry = persisted.entry(ident).or_default();
                entry.add(delta);
                *entry = entry.clamped();
            }
        }
        if self.ephemeral {
            return Ok(());
        }

        let dir = self
            .path
            .parent()
            .ok_or_else(|| BedrockError::Internal("size storer has no parent dir".into()))?;
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(tmp.as_file(), &*persisted)?;
        tmp.as_file().flush()?;
        if sync {
            tmp.as_file().sync_data()?;
        }
        tmp.persist(&self.path).map_err(|e| BedrockError::Io(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_adjust_and_get() {
        let dir = tempdir().unwrap();
        let storer = SizeStorer::open(dir.path(), false).unwrap();

        storer.adjust("t1", SizeInfo::new(3, 300));
        storer.adjust("t1", SizeInfo::new(-1, -100));
        assert_eq!(storer.get("t1"), SizeInfo::new(2, 200));
        assert_eq!(storer.get("missing"), SizeInfo::default());
    }

    #[test]
    fn test_flush_persists_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let storer = SizeStorer::open(dir.path(), false).unwrap();
            storer.adjust("t1", SizeInfo::new(5, 500));
            storer.flush(true).unwrap();
        }
        let storer = SizeStorer::open(dir.path(), false).unwrap();
        assert_eq!(storer.get("t1"), SizeInfo::new(5, 500));
    }

    #[test]
    fn test_negative_values_clamped_on_flush() {
        let dir = tempdir().unwrap();
        let storer = SizeStorer::open(dir.path(), false).unwrap();
        storer.adjust("t1", SizeInfo::new(-7, -900));
        // Visible raw before flush, clamped once persisted.
        assert_eq!(storer.get("t1").num_records, -7);
        storer.flush(false).unwrap();
        assert_eq!(storer.get("t1"), SizeInfo::default());
    }

    #[test]
    fn test_set_exact_discards_buffer() {
        let dir = tempdir().unwrap();
        let storer = SizeStorer::open(dir.path(), false).unwrap();
        storer.adjust("t1", SizeInfo::new(100, 1000));
        storer.set_exact("t1", SizeInfo::new(2, 20));
        assert_eq!(storer.get("t1"), SizeInfo::new(2, 20));
    }

    #[test]
    fn test_rebuild_replaces_everything() {
        let dir = tempdir().unwrap();
        let storer = SizeStorer::open(dir.path(), false).unwrap();
        storer.adjust("stale", SizeInfo::new(9, 9));

        let mut entries = HashMap::new();
        entries.insert("t1".to_string(), SizeInfo::new(4, 40));
        storer.rebuild(entries);

        assert_eq!(storer.get("stale"), SizeInfo::default());
        assert_eq!(storer.get("t1"), SizeInfo::new(4, 40));
    }

    #[test]
    fn test_ephemeral_never_touches_disk() {
        let dir = tempdir().unwrap();
        let storer = SizeStorer::open(dir.path(), true).unwrap();
        storer.adjust("t1", SizeInfo::new(1, 10));
        storer.flush(true).unwrap();
        assert!(!dir.path().join("size_storer.json").exists());
        assert_eq!(storer.get("t1"), SizeInfo::new(1, 10));
    }
}
