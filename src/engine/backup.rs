//! Backup cursors
//!
//! At most one backup cursor is open at a time. Opening one freezes a
//! list of the engine's files for external copy; the non-blocking
//! variant also pins the published crash-recovery point so the
//! checkpoint pass cannot prune journal segments out from under the
//! copy. Incremental mode fingerprints every file in fixed-size blocks
//! (SHA-256) under a caller-chosen backup id; a later backup naming
//! that id as its source gets only the changed `{offset, length}`
//! ranges per file.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};

use crate::error::{BedrockError, Result};
use crate::types::Timestamp;

/// A changed byte range within one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupBlock {
    pub offset: u64,
    pub length: u64,
}

/// One file the backup must copy. `blocks` is `None` for a full copy.
#[derive(Debug, Clone)]
pub struct BackupFile {
    pub path: PathBuf,
    pub size: u64,
    pub blocks: Option<Vec<BackupBlock>>,
}

/// Options for [`begin`]: plain, incremental-base, or incremental
/// against a previously recorded backup id.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub incremental: bool,
    pub this_backup_name: Option<String>,
    pub src_backup_name: Option<String>,
    pub block_size_mb: u64,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            incremental: false,
            this_backup_name: None,
            src_backup_name: None,
            block_size_mb: 16,
        }
    }
}

struct ActiveBackup {
    pinned_oplog: Option<Timestamp>,
    /// Journal segment index at begin; extend returns segments at or
    /// past this point.
    journal_floor: u64,
}

type Fingerprints = HashMap<PathBuf, Vec<[u8; 32]>>;

pub(crate) struct BackupCoordinator {
    active: Mutex<Option<ActiveBackup>>,
    /// Backup id -> per-file block fingerprints.
    incremental: Mutex<HashMap<String, Fingerprints>>,
}

impl BackupCoordinator {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(None),
            incremental: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().expect("backup lock poisoned").is_some()
    }

    pub fn pinned_oplog(&self) -> Option<Timestamp> {
        self.active
            .lock()
            .expect("backup lock poisoned")
            .as_ref()
            .and_then(|b| b.pinned_oplog)
    }

    pub fn journal_floor(&self) -> Option<u64> {
        self.active
            .lock()
            .expect("backup lock poisoned")
            .as_ref()
            .map(|b| b.journal_floor)
    }

    /// Open the backup cursor over `files`. With incremental options,
    /// fingerprints are recorded under `this_backup_name` and, when a
    /// source id is given, per-file changed blocks are returned.
    pub fn begin(
        &self,
        files: Vec<PathBuf>,
        pinned_oplog: Option<Timestamp>,
        journal_floor: u64,
        options: &BackupOptions,
    ) -> Result<Vec<BackupFile>> {
        let mut active = self.active.lock().expect("backup lock poisoned");
        if active.is_some() {
            return Err(BedrockError::Busy("a backup cursor is already open".into()));
        }

        let block_size = options
            .block_size_mb
            .max(1)
            .saturating_mul(1024 * 1024);

        let mut result = Vec::with_capacity(files.len());
        if options.incremental {
            let this_name = options.this_backup_name.as_deref().ok_or_else(|| {
                BedrockError::InvalidOption(
                    "incremental backup requires a backup name".into(),
                )
            })?;
            let mut store = self.incremental.lock().expect("incremental lock poisoned");
            let src = match options.src_backup_name.as_deref() {
                Some(src_name) => Some(store.get(src_name).cloned().ok_or_else(|| {
                    BedrockError::NotFound(format!(
                        "no incremental backup named '{}'",
                        src_name
                    ))
                })?),
                None => None,
            };

            let mut fingerprints: Fingerprints = HashMap::new();
            for path in files {
                let size = file_size(&path)?;
                let digests = fingerprint_file(&path, block_size)?;
                let blocks = src.as_ref().map(|src| {
                    changed_blocks(
                        src.get(&path).map(Vec::as_slice).unwrap_or(&[]),
                        &digests,
                        block_size,
                        size,
                    )
                });
                fingerprints.insert(path.clone(), digests);
                result.push(BackupFile { path, size, blocks });
            }
            store.insert(this_name.to_string(), fingerprints);
        } else {
            for path in files {
                let size = file_size(&path)?;
                result.push(BackupFile {
                    path,
                    size,
                    blocks: None,
                });
            }
        }

        *active = Some(ActiveBackup {
            pinned_oplog,
            journal_floor,
        });
        log::info!(
            "backup cursor opened over {} files (oplog pin {:?})",
            result.len(),
            pinned_oplog
        );
        Ok(result)
    }

    /// Close the cursor and release the oplog pin.
    pub fn end(&self) -> Result<()> {
        let mut active = self.active.lock().expect("backup lock poisoned");
        if active.take().is_none() {
            return Err(BedrockError::InvalidOption(
                "no backup cursor is open".into(),
            ));
        }
        log::info!("backup cursor closed");
        Ok(())
    }

    /// Drop all incremental tracking state.
    pub fn disable_incremental(&self) {
        self.incremental
            .lock()
            .expect("incremental lock poisoned")
            .clear();
        log::info!("incremental backup state discarded");
    }
}

fn file_size(path: &Path) -> Result<u64> {
    Ok(std::fs::metadata(path)?.len())
}

fn fingerprint_file(path: &Path, block_size: u64) -> Result<Vec<[u8; 32]>> {
    let mut file = File::open(path)?;
    let mut digests = Vec::new();
    let mut buf = vec![0u8; block_size as usize];
    loop {
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        let mut hasher = Sha256::new();
        hasher.update(&buf[..filled]);
        digests.push(hasher.finalize().into());
        if filled < buf.len() {
            break;
        }
    }
    Ok(digests)
}

fn changed_blocks(
    old: &[[u8; 32]],
    new: &[[u8; 32]],
    block_size: u64,
    file_size: u64,
) -> Vec<BackupBlock> {
    let mut blocks = Vec::new();
    for (i, digest) in new.iter().enumerate() {
        if old.get(i) != Some(digest) {
            let offset = i as u64 * block_size;
            let length = block_size.min(file_size.saturating_sub(offset));
            blocks.push(BackupBlock { offset, length });
        }
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        path
    }

    #[test]
    fn test_single_cursor_at_a_time() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "a.tbl", b"data");
        let coordinator = BackupCoordinator::new();

        coordinator
            .begin(vec![path.clone()], None, 1, &BackupOptions::default())
            .unwrap();
        let err = coordinator
            .begin(vec![path], None, 1, &BackupOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Busy);

        coordinator.end().unwrap();
        assert!(coordinator.end().is_err());
    }

    #[test]
    fn test_full_backup_lists_files_with_sizes() {
        let dir = tempdir().unwrap();
        let a = write_file(dir.path(), "a.tbl", b"aaaa");
        let b = write_file(dir.path(), "b.tbl", b"bb");
        let coordinator = BackupCoordinator::new();

        let files = coordinator
            .begin(vec![a, b], Some(Timestamp::new(7, 0)), 3, &BackupOptions::default())
            .unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].size, 4);
        assert!(files[0].blocks.is_none());
        assert_eq!(coordinator.pinned_oplog(), Some(Timestamp::new(7, 0)));
        assert_eq!(coordinator.journal_floor(), Some(3));
    }

    #[test]
    fn test_incremental_requires_name() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "a.tbl", b"data");
        let coordinator = BackupCoordinator::new();
        let options = BackupOptions {
            incremental: true,
            ..Default::default()
        };
        let err = coordinator.begin(vec![path], None, 1, &options).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidOption);
    }

    #[test]
    fn test_incremental_reports_changed_blocks() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "a.tbl", b"unchanged");
        let coordinator = BackupCoordinator::new();

        // Base backup records fingerprints.
        let base = BackupOptions {
            incremental: true,
            this_backup_name: Some("base".into()),
            block_size_mb: 1,
            ..Default::default()
        };
        coordinator
            .begin(vec![path.clone()], None, 1, &base)
            .unwrap();
        coordinator.end().unwrap();

        // Unchanged file: no blocks to copy.
        let next = BackupOptions {
            incremental: true,
            this_backup_name: Some("next".into()),
            src_backup_name: Some("base".into()),
            block_size_mb: 1,
            ..Default::default()
        };
        let files = coordinator
            .begin(vec![path.clone()], None, 1, &next)
            .unwrap();
        assert_eq!(files[0].blocks.as_deref(), Some(&[][..]));
        coordinator.end().unwrap();

        // Changed file: the touched block comes back.
        write_file(dir.path(), "a.tbl", b"different!");
        let third = BackupOptions {
            incremental: true,
            this_backup_name: Some("third".into()),
            src_backup_name: Some("next".into()),
            block_size_mb: 1,
            ..Default::default()
        };
        let files = coordinator.begin(vec![path], None, 1, &third).unwrap();
        let blocks = files[0].blocks.as_ref().unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].offset, 0);
        assert_eq!(blocks[0].length, 10);
        coordinator.end().unwrap();
    }

    #[test]
    fn test_unknown_source_id_rejected() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "a.tbl", b"data");
        let coordinator = BackupCoordinator::new();
        let options = BackupOptions {
            incremental: true,
            this_backup_name: Some("next".into()),
            src_backup_name: Some("never-recorded".into()),
            ..Default::default()
        };
        let err = coordinator.begin(vec![path], None, 1, &options).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn test_disable_incremental_clears_history() {
        let dir = tempdir().unwrap();
        let path = write_file(dir.path(), "a.tbl", b"data");
        let coordinator = BackupCoordinator::new();
        let base = BackupOptions {
            incremental: true,
            this_backup_name: Some("base".into()),
            ..Default::default()
        };
        coordinator.begin(vec![path.clone()], None, 1, &base).unwrap();
        coordinator.end().unwrap();

        coordinator.disable_incremental();

        let next = BackupOptions {
            incremental: true,
            this_backup_name: Some("next".into()),
            src_backup_name: Some("base".into()),
            ..Default::default()
        };
        assert!(coordinator.begin(vec![path], None, 1, &next).is_err());
    }
}
