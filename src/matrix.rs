//! Fragment Matrix
//!
//! Authoritative presence index: for every `(backup, block)` two bitmap pairs
//! record which Data and Parity fragments are held locally and which were
//! acknowledged by their supplier.
//!
//! Presence changes are pushed to subscribers in the order they are applied.
//! Persistence is coalesced: a change marks the matrix dirty and the flusher
//! writes at most once per flush interval. [`FragmentMatrix::close`] writes
//! synchronously.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::domain::types::{BackupId, FragmentKind, FragmentName, Presence};
use crate::error::{Error, Result};

// =============================================================================
// Types
// =============================================================================

/// Presence of one fragment after a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixChange {
    pub backup_id: BackupId,
    pub fragment: FragmentName,
    pub local: bool,
    pub remote: bool,
}

/// Local and remote flags of one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRow {
    pub local: Presence,
    pub remote: Presence,
}

impl BlockRow {
    fn empty(k: usize, m: usize) -> Self {
        Self {
            local: Presence::empty(k, m),
            remote: Presence::empty(k, m),
        }
    }

    /// Fragments held neither locally nor remotely.
    pub fn absent(&self) -> usize {
        let k = self.local.data.len();
        let m = self.local.parity.len();
        let data = (0..k)
            .filter(|&i| !self.local.data[i] && !self.remote.get(FragmentKind::Data, i))
            .count();
        let parity = (0..m)
            .filter(|&j| !self.local.parity[j] && !self.remote.get(FragmentKind::Parity, j))
            .count();
        data + parity
    }

    /// Local fragments not yet acknowledged remotely.
    pub fn unsent(&self, block_number: u64) -> Vec<FragmentName> {
        let mut names = Vec::new();
        for (kind, bits) in [
            (FragmentKind::Data, &self.local.data),
            (FragmentKind::Parity, &self.local.parity),
        ] {
            for (index, local) in bits.iter().enumerate() {
                if *local && !self.remote.get(kind, index) {
                    names.push(FragmentName::new(block_number, index, kind));
                }
            }
        }
        names
    }
}

#[derive(Debug)]
struct BackupRows {
    data_count: usize,
    parity_count: usize,
    blocks: BTreeMap<u64, BlockRow>,
}

/// Point-in-time copy of one backup's rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixSnapshot {
    pub backup_id: BackupId,
    pub data_count: usize,
    pub parity_count: usize,
    pub blocks: BTreeMap<u64, BlockRow>,
}

impl MatrixSnapshot {
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn local(&self, block_number: u64) -> Option<&Presence> {
        self.blocks.get(&block_number).map(|row| &row.local)
    }

    pub fn remote(&self, block_number: u64) -> Option<&Presence> {
        self.blocks.get(&block_number).map(|row| &row.remote)
    }
}

/// Aggregate counts for one backup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatrixStats {
    pub blocks: usize,
    pub local_fragments: usize,
    pub remote_fragments: usize,
    /// Blocks whose every fragment is acknowledged remotely
    pub fully_remote_blocks: usize,
}

// =============================================================================
// Persistence Format
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct PersistedMatrix {
    version: u32,
    backups: Vec<PersistedBackup>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedBackup {
    id: BackupId,
    k: usize,
    m: usize,
    blocks: BTreeMap<u64, PersistedBlock>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedBlock {
    ld: String,
    lp: String,
    rd: String,
    rp: String,
}

fn bits_to_string(bits: &[bool]) -> String {
    bits.iter().map(|b| if *b { '1' } else { '0' }).collect()
}

fn string_to_bits(s: &str, expected: usize) -> Result<Vec<bool>> {
    if s.len() != expected {
        return Err(Error::Serialization(format!(
            "bitmap '{}' has {} flags, expected {}",
            s,
            s.len(),
            expected
        )));
    }
    s.chars()
        .map(|c| match c {
            '1' => Ok(true),
            '0' => Ok(false),
            other => Err(Error::Serialization(format!("bad bitmap flag '{}'", other))),
        })
        .collect()
}

const FORMAT_VERSION: u32 = 1;

// =============================================================================
// Matrix
// =============================================================================

/// Presence index shared by every pipeline component.
pub struct FragmentMatrix {
    path: Option<PathBuf>,
    flush_interval: Duration,
    backups: DashMap<BackupId, Arc<RwLock<BackupRows>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<MatrixChange>>>,
    dirty: AtomicBool,
    wake: Notify,
    persist_lock: Mutex<()>,
    persist_count: AtomicU64,
}

impl FragmentMatrix {
    /// Open a persisted matrix, or start empty if `path` does not exist yet.
    pub fn open(path: impl Into<PathBuf>, flush_interval: Duration) -> Result<Arc<Self>> {
        let path = path.into();
        let matrix = Self::build(Some(path.clone()), flush_interval);
        if path.exists() {
            matrix.load(&path)?;
            info!(
                "Loaded fragment matrix with {} backups from {}",
                matrix.backups.len(),
                path.display()
            );
        }
        Ok(Arc::new(matrix))
    }

    /// Matrix without persistence.
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self::build(None, Duration::from_millis(1000)))
    }

    fn build(path: Option<PathBuf>, flush_interval: Duration) -> Self {
        Self {
            path,
            flush_interval,
            backups: DashMap::new(),
            subscribers: Mutex::new(Vec::new()),
            dirty: AtomicBool::new(false),
            wake: Notify::new(),
            persist_lock: Mutex::new(()),
            persist_count: AtomicU64::new(0),
        }
    }

    fn load(&self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        let persisted: PersistedMatrix = serde_json::from_str(&text)?;
        if persisted.version != FORMAT_VERSION {
            return Err(Error::Serialization(format!(
                "unsupported matrix format version {}",
                persisted.version
            )));
        }
        for backup in persisted.backups {
            let (k, m) = (backup.k, backup.m);
            let mut blocks = BTreeMap::new();
            for (block_number, row) in backup.blocks {
                blocks.insert(
                    block_number,
                    BlockRow {
                        local: Presence {
                            data: string_to_bits(&row.ld, k)?,
                            parity: string_to_bits(&row.lp, m)?,
                        },
                        remote: Presence {
                            data: string_to_bits(&row.rd, k)?,
                            parity: string_to_bits(&row.rp, m)?,
                        },
                    },
                );
            }
            self.backups.insert(
                backup.id,
                Arc::new(RwLock::new(BackupRows {
                    data_count: k,
                    parity_count: m,
                    blocks,
                })),
            );
        }
        Ok(())
    }

    // =========================================================================
    // Subscription
    // =========================================================================

    /// Receive every subsequent presence change.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<MatrixChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    fn notify(&self, change: MatrixChange) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(change.clone()).is_ok());
    }

    fn touch(&self) {
        self.dirty.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Start tracking a backup with `k` data and `m` parity fragments per block.
    pub fn register_backup(&self, backup_id: &BackupId, k: usize, m: usize) -> Result<()> {
        if let Some(existing) = self.backups.get(backup_id) {
            let rows = existing.read();
            if rows.data_count != k || rows.parity_count != m {
                return Err(Error::MatrixInvariant(format!(
                    "{} is registered as {}x{}, not {}x{}",
                    backup_id, rows.data_count, rows.parity_count, k, m
                )));
            }
            return Ok(());
        }
        self.backups.insert(
            backup_id.clone(),
            Arc::new(RwLock::new(BackupRows {
                data_count: k,
                parity_count: m,
                blocks: BTreeMap::new(),
            })),
        );
        self.touch();
        Ok(())
    }

    fn rows(&self, backup_id: &BackupId) -> Result<Arc<RwLock<BackupRows>>> {
        self.backups
            .get(backup_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::BackupNotFound(backup_id.to_string()))
    }

    fn check_index_dims(k: usize, m: usize, kind: FragmentKind, index: usize) -> bool {
        match kind {
            FragmentKind::Data => index < k,
            FragmentKind::Parity => index < m,
        }
    }

    fn check_index(rows: &BackupRows, kind: FragmentKind, index: usize) -> Result<()> {
        let limit = match kind {
            FragmentKind::Data => rows.data_count,
            FragmentKind::Parity => rows.parity_count,
        };
        if index >= limit {
            return Err(Error::MatrixInvariant(format!(
                "{} index {} out of range 0..{}",
                kind, index, limit
            )));
        }
        Ok(())
    }

    /// Set the local flag of one fragment. Returns whether it changed.
    ///
    /// Clearing the flag requires the fragment to be acknowledged remotely;
    /// use [`remove_backup`](Self::remove_backup) to drop a whole backup.
    pub fn mark_local(
        &self,
        backup_id: &BackupId,
        block_number: u64,
        kind: FragmentKind,
        index: usize,
        present: bool,
    ) -> Result<bool> {
        let rows = self.rows(backup_id)?;
        let mut rows = rows.write();
        Self::check_index(&rows, kind, index)?;
        let (k, m) = (rows.data_count, rows.parity_count);
        let row = rows
            .blocks
            .entry(block_number)
            .or_insert_with(|| BlockRow::empty(k, m));

        if !present && !row.remote.get(kind, index) {
            return Err(Error::MatrixInvariant(format!(
                "cannot drop local {}/{} before it is remote",
                backup_id,
                FragmentName::new(block_number, index, kind)
            )));
        }
        let changed = row.local.set(kind, index, present);
        if changed {
            self.notify(MatrixChange {
                backup_id: backup_id.clone(),
                fragment: FragmentName::new(block_number, index, kind),
                local: present,
                remote: row.remote.get(kind, index),
            });
            self.touch();
        }
        Ok(changed)
    }

    /// Set the remote flag of one fragment. Returns whether it changed.
    pub fn mark_remote(
        &self,
        backup_id: &BackupId,
        block_number: u64,
        kind: FragmentKind,
        index: usize,
        present: bool,
    ) -> Result<bool> {
        let rows = self.rows(backup_id)?;
        let mut rows = rows.write();
        Self::check_index(&rows, kind, index)?;
        let (k, m) = (rows.data_count, rows.parity_count);
        let row = rows
            .blocks
            .entry(block_number)
            .or_insert_with(|| BlockRow::empty(k, m));

        let changed = row.remote.set(kind, index, present);
        if changed {
            self.notify(MatrixChange {
                backup_id: backup_id.clone(),
                fragment: FragmentName::new(block_number, index, kind),
                local: row.local.get(kind, index),
                remote: present,
            });
            self.touch();
        }
        Ok(changed)
    }

    /// Mark every fragment of a freshly made block as local.
    pub fn mark_block_local(&self, backup_id: &BackupId, block_number: u64) -> Result<usize> {
        let rows = self.rows(backup_id)?;
        let mut rows = rows.write();
        let (k, m) = (rows.data_count, rows.parity_count);
        let row = rows
            .blocks
            .entry(block_number)
            .or_insert_with(|| BlockRow::empty(k, m));

        let mut changed = 0;
        for (kind, count) in [(FragmentKind::Data, k), (FragmentKind::Parity, m)] {
            for index in 0..count {
                if row.local.set(kind, index, true) {
                    changed += 1;
                    self.notify(MatrixChange {
                        backup_id: backup_id.clone(),
                        fragment: FragmentName::new(block_number, index, kind),
                        local: true,
                        remote: row.remote.get(kind, index),
                    });
                }
            }
        }
        if changed > 0 {
            self.touch();
        }
        Ok(changed)
    }

    /// Drop every row of a backup at once.
    pub fn remove_backup(&self, backup_id: &BackupId) -> bool {
        let removed = self.backups.remove(backup_id).is_some();
        if removed {
            info!("Removed matrix rows for {}", backup_id);
            self.touch();
        }
        removed
    }

    /// Rebuild local flags of a backup from the fragment files in `dir`.
    ///
    /// The directory is authoritative: flags of fragments without a file are
    /// cleared. Returns the number of fragment files found.
    #[instrument(skip(self, dir), fields(backup_id = %backup_id))]
    pub fn scan_local(&self, backup_id: &BackupId, dir: &Path) -> Result<usize> {
        let mut found: BTreeMap<u64, Vec<FragmentName>> = BTreeMap::new();
        match std::fs::read_dir(dir) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry?;
                    let file_name = entry.file_name();
                    let Some(name) = file_name.to_str() else {
                        continue;
                    };
                    if name.starts_with('.') {
                        continue;
                    }
                    match name.parse::<FragmentName>() {
                        Ok(fragment) => found.entry(fragment.block_number).or_default().push(fragment),
                        Err(_) => debug!("Ignoring {} during scan", name),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let rows = self.rows(backup_id)?;
        let mut rows = rows.write();
        let (k, m) = (rows.data_count, rows.parity_count);
        let mut total = 0;

        for (block_number, names) in &found {
            rows.blocks
                .entry(*block_number)
                .or_insert_with(|| BlockRow::empty(k, m));
            total += names.len();
        }

        let mut changes = Vec::new();
        for (block_number, row) in rows.blocks.iter_mut() {
            let mut present = Presence::empty(k, m);
            for name in found.get(block_number).into_iter().flatten() {
                if Self::check_index_dims(k, m, name.kind, name.index) {
                    present.set(name.kind, name.index, true);
                } else {
                    warn!("Ignoring out-of-range fragment file {}", name);
                }
            }
            for (kind, count) in [(FragmentKind::Data, k), (FragmentKind::Parity, m)] {
                for index in 0..count {
                    let now = present.get(kind, index);
                    if row.local.set(kind, index, now) {
                        changes.push(MatrixChange {
                            backup_id: backup_id.clone(),
                            fragment: FragmentName::new(*block_number, index, kind),
                            local: now,
                            remote: row.remote.get(kind, index),
                        });
                    }
                }
            }
        }
        rows.blocks
            .retain(|_, row| row.local.count() > 0 || row.remote.count() > 0);

        let changed = !changes.is_empty();
        for change in changes {
            self.notify(change);
        }
        if changed {
            self.touch();
        }
        drop(rows);

        info!("Scanned {} local fragments in {}", total, dir.display());
        Ok(total)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn contains(&self, backup_id: &BackupId) -> bool {
        self.backups.contains_key(backup_id)
    }

    pub fn backups(&self) -> Vec<BackupId> {
        let mut ids: Vec<BackupId> = self.backups.iter().map(|e| e.key().clone()).collect();
        ids.sort_by_key(|id| id.to_string());
        ids
    }

    pub fn snapshot(&self, backup_id: &BackupId) -> Option<MatrixSnapshot> {
        let rows = self.backups.get(backup_id)?.value().clone();
        let rows = rows.read();
        Some(MatrixSnapshot {
            backup_id: backup_id.clone(),
            data_count: rows.data_count,
            parity_count: rows.parity_count,
            blocks: rows.blocks.clone(),
        })
    }

    pub fn block(&self, backup_id: &BackupId, block_number: u64) -> Option<BlockRow> {
        let rows = self.backups.get(backup_id)?.value().clone();
        let rows = rows.read();
        rows.blocks.get(&block_number).cloned()
    }

    pub fn stats(&self, backup_id: &BackupId) -> Option<MatrixStats> {
        let rows = self.backups.get(backup_id)?.value().clone();
        let rows = rows.read();
        let mut stats = MatrixStats {
            blocks: rows.blocks.len(),
            ..Default::default()
        };
        for row in rows.blocks.values() {
            stats.local_fragments += row.local.count();
            stats.remote_fragments += row.remote.count();
            if row.remote.is_full() {
                stats.fully_remote_blocks += 1;
            }
        }
        Some(stats)
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Number of completed writes to disk.
    pub fn persist_count(&self) -> u64 {
        self.persist_count.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Write the whole matrix to disk now.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            self.dirty.store(false, Ordering::Release);
            return Ok(());
        };
        let _guard = self.persist_lock.lock();
        self.dirty.store(false, Ordering::Release);

        let mut backups = Vec::with_capacity(self.backups.len());
        for id in self.backups() {
            let Some(rows) = self.backups.get(&id).map(|e| e.value().clone()) else {
                continue;
            };
            let rows = rows.read();
            backups.push(PersistedBackup {
                id,
                k: rows.data_count,
                m: rows.parity_count,
                blocks: rows
                    .blocks
                    .iter()
                    .map(|(n, row)| {
                        (
                            *n,
                            PersistedBlock {
                                ld: bits_to_string(&row.local.data),
                                lp: bits_to_string(&row.local.parity),
                                rd: bits_to_string(&row.remote.data),
                                rp: bits_to_string(&row.remote.parity),
                            },
                        )
                    })
                    .collect(),
            });
        }
        let body = serde_json::to_vec(&PersistedMatrix {
            version: FORMAT_VERSION,
            backups,
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, path)?;
        self.persist_count.fetch_add(1, Ordering::AcqRel);
        debug!("Persisted fragment matrix to {}", path.display());
        Ok(())
    }

    /// Flush pending changes synchronously.
    pub fn close(&self) -> Result<()> {
        if self.is_dirty() {
            self.persist()?;
        }
        Ok(())
    }

    /// Coalescing flush loop. Exits after a final flush when `shutdown` fires.
    pub async fn run_flusher(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = shutdown.cancelled() => break,
            }
            tokio::select! {
                _ = tokio::time::sleep(self.flush_interval) => {}
                _ = shutdown.cancelled() => break,
            }
            if !self.is_dirty() {
                continue;
            }
            let matrix = self.clone();
            match tokio::task::spawn_blocking(move || matrix.persist()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Matrix flush failed: {}", e);
                    self.dirty.store(true, Ordering::Release);
                }
                Err(e) => warn!("Matrix flush task failed: {}", e),
            }
        }
        if let Err(e) = self.close() {
            warn!("Final matrix flush failed: {}", e);
        }
    }
}

impl std::fmt::Debug for FragmentMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentMatrix")
            .field("path", &self.path)
            .field("backups", &self.backups.len())
            .finish()
    }
}
