//! Ident registry and table lifecycle
//!
//! Maps opaque ident strings to live tables, persists the catalog
//! (ident -> opaque config string) atomically on every change, and owns
//! the pending-drop queue: a drop that finds the table still referenced
//! succeeds immediately and the physical removal is retried by the
//! checkpoint pass, throttled to one drain per second and
//! `max(10, 10%)` entries per tick.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{BedrockError, Result};
use crate::types::SizeInfo;

use super::store::{Table, TableConfig};

/// Outcome of orphan recovery in repair mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The table image loaded cleanly after the rename dance.
    Recovered,
    /// Some rows were unreadable and were dropped; the image was
    /// rewritten without them.
    Salvaged,
    /// Nothing was readable; the ident was rebuilt empty.
    Rebuilt,
    /// The ident was missing from the catalog and had to be
    /// re-registered from its data file.
    DataModifiedByRepair,
}

/// Whether a drop completed or was deferred to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropOutcome {
    Dropped,
    Queued,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct Catalog {
    /// Engine compatibility string, rewritten on downgrade.
    compatibility: String,
    /// Ident -> opaque config string.
    idents: HashMap<String, String>,
}

struct IdentEntry {
    table: Arc<Table>,
}

struct PendingDrop {
    ident: String,
    table: Arc<Table>,
}

pub struct IdentRegistry {
    tables_dir: PathBuf,
    catalog_path: PathBuf,
    ephemeral: bool,
    entries: RwLock<HashMap<String, IdentEntry>>,
    compatibility: Mutex<String>,
    drop_queue: Mutex<VecDeque<PendingDrop>>,
    last_drain: Mutex<Option<Instant>>,
}

/// Idents with this prefix are engine metadata and are hidden from
/// listings.
const INTERNAL_PREFIX: &str = "internal-";

pub fn is_internal_ident(ident: &str) -> bool {
    ident.starts_with(INTERNAL_PREFIX)
}

fn validate_ident(ident: &str) -> Result<()> {
    if ident.is_empty() {
        return Err(BedrockError::InvalidOption("ident cannot be empty".into()));
    }
    if ident.contains("..") || ident.contains('/') || ident.contains('\\') || ident.contains('\0') {
        return Err(BedrockError::InvalidOption(format!(
            "invalid ident '{}': contains forbidden characters",
            ident
        )));
    }
    if ident.len() > 255 {
        return Err(BedrockError::InvalidOption("ident too long".into()));
    }
    Ok(())
}

impl IdentRegistry {
    /// Open the registry, loading the catalog and every table image.
    /// With `repair`, unreadable images are routed through the orphan
    /// path instead of failing the open; outcomes are returned so the
    /// caller can report the modifications.
    pub fn open(
        data_dir: &Path,
        ephemeral: bool,
        repair: bool,
    ) -> Result<(Self, Vec<(String, RecoveryOutcome)>)> {
        let tables_dir = data_dir.join("tables");
        if !ephemeral {
            fs::create_dir_all(&tables_dir)?;
        }

        let catalog_path = data_dir.join("catalog.json");
        let catalog: Catalog = if !ephemeral && catalog_path.exists() {
            let file = File::open(&catalog_path)?;
            serde_json::from_reader(file).map_err(|e| {
                BedrockError::Corruption(format!(
                    "failed to parse catalog '{}': {}",
                    catalog_path.display(),
                    e
                ))
            })?
        } else {
            Catalog::default()
        };

        let registry = Self {
            tables_dir,
            catalog_path,
            ephemeral,
            entries: RwLock::new(HashMap::new()),
            compatibility: Mutex::new(catalog.compatibility.clone()),
            drop_queue: Mutex::new(VecDeque::new()),
            last_drain: Mutex::new(None),
        };

        let mut repaired = Vec::new();
        for (ident, config_str) in &catalog.idents {
            let config: TableConfig = serde_json::from_str(config_str).map_err(|e| {
                BedrockError::Corruption(format!("bad config for ident '{}': {}", ident, e))
            })?;
            let table = Arc::new(Table::new(ident, config));
            let image = registry.table_path(ident);
            if !ephemeral && image.exists() {
                match table.load_image(&image) {
                    Ok(()) => {}
                    Err(e) if repair => {
                        log::warn!("ident '{}' failed to load ({}), repairing", ident, e);
                        registry.entries.write().expect("registry lock poisoned").insert(
                            ident.clone(),
                            IdentEntry {
                                table: Arc::clone(&table),
                            },
                        );
                        let outcome = registry.recover_orphan_inner(ident, &table)?;
                        repaired.push((ident.clone(), outcome));
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            } else if !ephemeral && repair {
                log::warn!("ident '{}' has no data file, rebuilding empty", ident);
                File::create(&image)?;
                repaired.push((ident.clone(), RecoveryOutcome::Rebuilt));
            }
            registry
                .entries
                .write()
                .expect("registry lock poisoned")
                .insert(
                    ident.clone(),
                    IdentEntry { table },
                );
        }

        Ok((registry, repaired))
    }

    pub fn table_path(&self, ident: &str) -> PathBuf {
        self.tables_dir.join(format!("{}.tbl", ident))
    }

    pub fn compatibility(&self) -> String {
        self.compatibility
            .lock()
            .expect("compatibility lock poisoned")
            .clone()
    }

    pub fn set_compatibility(&self, compat: &str) -> Result<()> {
        *self
            .compatibility
            .lock()
            .expect("compatibility lock poisoned") = compat.to_string();
        self.save_catalog()
    }

    /// Create a table for `ident`. The serialized config round-trips
    /// through the catalog as an opaque string.
    pub fn create_table(&self, ident: &str, config: TableConfig) -> Result<Arc<Table>> {
        validate_ident(ident)?;
        let table = Arc::new(Table::new(ident, config));
        {
            let mut entries = self.entries.write().expect("registry lock poisoned");
            if entries.contains_key(ident) {
                return Err(BedrockError::ident_already_exists(ident));
            }
            entries.insert(
                ident.to_string(),
                IdentEntry {
                    table: Arc::clone(&table),
                },
            );
        }
        self.save_catalog()?;
        if !self.ephemeral {
            File::create(self.table_path(ident))?;
        }
        Ok(table)
    }

    pub fn get(&self, ident: &str) -> Option<Arc<Table>> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .get(ident)
            .map(|e| Arc::clone(&e.table))
    }

    pub fn has(&self, ident: &str) -> bool {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .contains_key(ident)
    }

    /// All live idents, engine metadata excluded.
    pub fn list_all(&self) -> Vec<String> {
        let mut idents: Vec<String> = self
            .entries
            .read()
            .expect("registry lock poisoned")
            .keys()
            .filter(|ident| !is_internal_ident(ident))
            .cloned()
            .collect();
        idents.sort();
        idents
    }

    /// Every live table, for checkpoint and maintenance passes.
    pub fn all_tables(&self) -> Vec<(String, Arc<Table>)> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .iter()
            .map(|(ident, entry)| (ident.clone(), Arc::clone(&entry.table)))
            .collect()
    }

    /// Drop `ident`. The catalog entry goes immediately (new opens see
    /// `NotFound`); the physical file follows right away when nothing
    /// references the table, otherwise through the pending-drop queue.
    pub fn drop_table(&self, ident: &str, busy: bool) -> Result<DropOutcome> {
        let entry = {
            let mut entries = self.entries.write().expect("registry lock poisoned");
            entries
                .remove(ident)
                .ok_or_else(|| BedrockError::ident_not_found(ident))?
        };
        entry.table.mark_dropped();
        self.save_catalog()?;

        if busy || entry.table.cursor_pins() > 0 {
            log::debug!("drop of '{}' deferred, table still referenced", ident);
            self.drop_queue
                .lock()
                .expect("drop queue lock poisoned")
                .push_back(PendingDrop {
                    ident: ident.to_string(),
                    table: entry.table,
                });
            return Ok(DropOutcome::Queued);
        }

        self.remove_table_file(ident)?;
        Ok(DropOutcome::Dropped)
    }

    fn remove_table_file(&self, ident: &str) -> Result<()> {
        if self.ephemeral {
            return Ok(());
        }
        let path = self.table_path(ident);
        if path.exists() {
            fs::remove_file(path)?;
        }
        log::debug!("dropped table file for '{}'", ident);
        Ok(())
    }

    pub fn have_drops_queued(&self) -> bool {
        !self
            .drop_queue
            .lock()
            .expect("drop queue lock poisoned")
            .is_empty()
    }

    /// Retry queued drops. Respects the one-second gap between drains
    /// and drops at most `max(10, 10%)` entries per call; still-pinned
    /// tables go back to the end of the queue.
    pub fn drain_pending_drops(&self, busy: bool) -> usize {
        {
            let mut last = self.last_drain.lock().expect("drain gate lock poisoned");
            if let Some(at) = *last {
                if at.elapsed() < Duration::from_secs(1) {
                    return 0;
                }
            }
            *last = Some(Instant::now());
        }

        let quota = {
            let queue = self.drop_queue.lock().expect("drop queue lock poisoned");
            if queue.is_empty() {
                return 0;
            }
            (queue.len() / 10).max(10)
        };

        let mut dropped = 0;
        for _ in 0..quota {
            let pending = {
                let mut queue = self.drop_queue.lock().expect("drop queue lock poisoned");
                match queue.pop_front() {
                    Some(p) => p,
                    None => break,
                }
            };
            if busy || pending.table.cursor_pins() > 0 {
                self.drop_queue
                    .lock()
                    .expect("drop queue lock poisoned")
                    .push_back(pending);
                continue;
            }
            match self.remove_table_file(&pending.ident) {
                Ok(()) => dropped += 1,
                Err(e) => {
                    log::warn!("queued drop of '{}' failed: {}", pending.ident, e);
                    self.drop_queue
                        .lock()
                        .expect("drop queue lock poisoned")
                        .push_back(pending);
                }
            }
        }
        if dropped > 0 {
            log::debug!("drained {} queued drops", dropped);
        }
        dropped
    }

    /// Repair-mode recovery of an ident whose data file is missing or
    /// unreadable. The file is renamed aside, the ident recreated, and
    /// the contents salvaged back in; when nothing is readable the
    /// ident is rebuilt empty.
    pub fn recover_orphan(&self, ident: &str, repair: bool) -> Result<RecoveryOutcome> {
        if !repair {
            return Err(BedrockError::InvalidOption(
                "orphan recovery requires repair mode".into(),
            ));
        }
        let known = self.has(ident);
        let table = match self.get(ident) {
            Some(table) => table,
            None => {
                // The file exists but the catalog lost the ident:
                // re-register it with a default config. The data file
                // must be moved aside first, since registering creates
                // an empty file in its place.
                let path = self.table_path(ident);
                if !path.exists() {
                    return Err(BedrockError::ident_not_found(ident));
                }
                let aside = path.with_extension("tbl.orphan");
                fs::rename(&path, &aside)?;
                let table = self.create_table(ident, TableConfig::default())?;
                fs::rename(&aside, &path)?;
                table
            }
        };
        let outcome = self.recover_orphan_inner(ident, &table)?;
        if !known {
            return Ok(RecoveryOutcome::DataModifiedByRepair);
        }
        Ok(outcome)
    }

    fn recover_orphan_inner(&self, ident: &str, table: &Arc<Table>) -> Result<RecoveryOutcome> {
        let path = self.table_path(ident);
        if !path.exists() {
            table.clear_all();
            if !self.ephemeral {
                File::create(&path)?;
            }
            return Ok(RecoveryOutcome::Rebuilt);
        }

        // Move the data file aside so the ident can be recreated, then
        // bring the bytes back for salvage.
        let tmp = path.with_extension("tbl.orphan");
        fs::rename(&path, &tmp)?;
        File::create(&path)?;
        fs::remove_file(&path)?;
        fs::rename(&tmp, &path)?;

        match table.load_image(&path) {
            Ok(()) => Ok(RecoveryOutcome::Recovered),
            Err(e) => {
                log::warn!("ident '{}' did not load cleanly ({}), salvaging", ident, e);
                let skipped = table.salvage_image(&path)?;
                if table.committed_size().num_records == 0 && skipped > 0 {
                    table.clear_all();
                    File::create(&path)?;
                    log::warn!("ident '{}' was unsalvageable, rebuilt empty", ident);
                    return Ok(RecoveryOutcome::Rebuilt);
                }
                // Rewrite the image without the unreadable rows.
                table.write_image(&path, super::store::CheckpointMode::Full, u64::MAX)?;
                Ok(RecoveryOutcome::Salvaged)
            }
        }
    }

    /// Write the catalog atomically. Every create/drop goes through
    /// here before its physical effect.
    pub fn save_catalog(&self) -> Result<()> {
        if self.ephemeral {
            return Ok(());
        }
        let catalog = Catalog {
            compatibility: self.compatibility(),
            idents: self
                .entries
                .read()
                .expect("registry lock poisoned")
                .iter()
                .map(|(ident, entry)| {
                    let config_str = serde_json::to_string(entry.table.config())
                        .expect("table config serializes");
                    (ident.clone(), config_str)
                })
                .collect(),
        };
        let dir = self
            .catalog_path
            .parent()
            .ok_or_else(|| BedrockError::Internal("catalog has no parent dir".into()))?;
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(tmp.as_file(), &catalog)?;
        tmp.as_file().sync_data()?;
        tmp.persist(&self.catalog_path)
            .map_err(|e| BedrockError::Io(e.error))?;
        Ok(())
    }

    /// Live committed sizes of every table, for size storer rebuilds.
    pub fn live_sizes(&self) -> HashMap<String, SizeInfo> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .iter()
            .map(|(ident, entry)| (ident.clone(), entry.table.committed_size()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_list() {
        let dir = tempdir().unwrap();
        let (registry, _) = IdentRegistry::open(dir.path(), false, false).unwrap();

        registry
            .create_table("collection-7-abc", TableConfig::default())
            .unwrap();
        registry
            .create_table("index-8-abc", TableConfig::default())
            .unwrap();
        registry
            .create_table("internal-size-storer", TableConfig::default())
            .unwrap();

        assert!(registry.has("collection-7-abc"));
        // Internal idents are hidden from listings.
        assert_eq!(
            registry.list_all(),
            vec!["collection-7-abc".to_string(), "index-8-abc".to_string()]
        );
        assert!(dir.path().join("tables/collection-7-abc.tbl").exists());
    }

    #[test]
    fn test_duplicate_ident_rejected() {
        let dir = tempdir().unwrap();
        let (registry, _) = IdentRegistry::open(dir.path(), false, false).unwrap();
        registry.create_table("t1", TableConfig::default()).unwrap();
        let err = registry
            .create_table("t1", TableConfig::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_ident_validation() {
        let dir = tempdir().unwrap();
        let (registry, _) = IdentRegistry::open(dir.path(), false, false).unwrap();
        for bad in ["", "../evil", "a/b", "a\\b", "a\0b"] {
            assert!(registry.create_table(bad, TableConfig::default()).is_err());
        }
    }

    #[test]
    fn test_catalog_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let (registry, _) = IdentRegistry::open(dir.path(), false, false).unwrap();
            let config = TableConfig {
                oplog: true,
                ..Default::default()
            };
            registry.create_table("oplog-1", config).unwrap();
        }
        let (registry, repaired) = IdentRegistry::open(dir.path(), false, false).unwrap();
        assert!(repaired.is_empty());
        assert!(registry.get("oplog-1").unwrap().config().oplog);
    }

    #[test]
    fn test_drop_unreferenced_is_immediate() {
        let dir = tempdir().unwrap();
        let (registry, _) = IdentRegistry::open(dir.path(), false, false).unwrap();
        registry.create_table("t1", TableConfig::default()).unwrap();

        let outcome = registry.drop_table("t1", false).unwrap();
        assert_eq!(outcome, DropOutcome::Dropped);
        assert!(!registry.has("t1"));
        assert!(!dir.path().join("tables/t1.tbl").exists());
    }

    #[test]
    fn test_drop_missing_reports_not_found() {
        let dir = tempdir().unwrap();
        let (registry, _) = IdentRegistry::open(dir.path(), false, false).unwrap();
        assert_eq!(
            registry.drop_table("nope", false).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_busy_drop_queues_and_drains() {
        let dir = tempdir().unwrap();
        let (registry, _) = IdentRegistry::open(dir.path(), false, false).unwrap();
        registry.create_table("t1", TableConfig::default()).unwrap();

        let outcome = registry.drop_table("t1", true).unwrap();
        assert_eq!(outcome, DropOutcome::Queued);
        assert!(registry.have_drops_queued());
        assert!(dir.path().join("tables/t1.tbl").exists());

        // First drain attempt runs (no prior drain), file goes.
        let dropped = registry.drain_pending_drops(false);
        assert_eq!(dropped, 1);
        assert!(!dir.path().join("tables/t1.tbl").exists());
        assert!(!registry.have_drops_queued());
    }

    #[test]
    fn test_drain_respects_one_second_gap() {
        let dir = tempdir().unwrap();
        let (registry, _) = IdentRegistry::open(dir.path(), false, false).unwrap();
        registry.create_table("t1", TableConfig::default()).unwrap();
        registry.create_table("t2", TableConfig::default()).unwrap();
        registry.drop_table("t1", true).unwrap();

        assert_eq!(registry.drain_pending_drops(false), 1);

        registry.drop_table("t2", true).unwrap();
        // Within the gap: nothing happens.
        assert_eq!(registry.drain_pending_drops(false), 0);
        assert!(registry.have_drops_queued());
    }

    #[test]
    fn test_recover_orphan_requires_repair_mode() {
        let dir = tempdir().unwrap();
        let (registry, _) = IdentRegistry::open(dir.path(), false, false).unwrap();
        registry.create_table("t1", TableConfig::default()).unwrap();
        assert_eq!(
            registry.recover_orphan("t1", false).unwrap_err().kind(),
            ErrorKind::InvalidOption
        );
    }

    #[test]
    fn test_recover_orphan_salvages_corrupt_image() {
        use std::io::Write;

        let dir = tempdir().unwrap();
        let (registry, _) = IdentRegistry::open(dir.path(), false, false).unwrap();
        let table = registry.create_table("t1", TableConfig::default()).unwrap();

        // Build an image with one good row, then corrupt the tail.
        let mut puts = std::collections::BTreeMap::new();
        puts.insert(
            crate::types::RecordId(1),
            super::super::store::PendingWrite {
                data: Some(bytes::Bytes::from_static(b"keep")),
                created: true,
            },
        );
        table.install(&puts, false, 1, None);
        let path = registry.table_path("t1");
        table
            .write_image(&path, super::super::store::CheckpointMode::Full, u64::MAX)
            .unwrap();
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&500u32.to_le_bytes()).unwrap();
        file.write_all(b"junk").unwrap();
        drop(file);

        let outcome = registry.recover_orphan("t1", true).unwrap();
        assert_eq!(outcome, RecoveryOutcome::Salvaged);
        assert_eq!(
            registry.get("t1").unwrap().committed_size().num_records,
            1
        );
    }

    #[test]
    fn test_recover_orphan_rebuilds_when_file_missing() {
        let dir = tempdir().unwrap();
        let (registry, _) = IdentRegistry::open(dir.path(), false, false).unwrap();
        registry.create_table("t1", TableConfig::default()).unwrap();
        fs::remove_file(registry.table_path("t1")).unwrap();

        let outcome = registry.recover_orphan("t1", true).unwrap();
        assert_eq!(outcome, RecoveryOutcome::Rebuilt);
        assert!(registry.table_path("t1").exists());
    }
}
