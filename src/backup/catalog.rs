//! Backup Catalog
//!
//! Durable record of every known backup: its ecc scheme, block count,
//! status, supplier placement and at-risk blocks.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::types::{BackupId, SupplierId};
use crate::error::{Error, Result};

/// Lifecycle status of a backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupStatus {
    Running,
    Done,
    Aborted,
    Failed,
}

impl std::fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackupStatus::Running => "running",
            BackupStatus::Done => "done",
            BackupStatus::Aborted => "aborted",
            BackupStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Catalog entry for one backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackupState {
    pub id: BackupId,
    pub ecc_scheme: String,
    /// Unknown while running; frozen once done
    pub total_blocks: Option<u64>,
    pub status: BackupStatus,
    /// Supplier at position `i` holds Data `i` and Parity `i`
    pub suppliers: Vec<SupplierId>,
    #[serde(default)]
    pub at_risk_blocks: BTreeSet<u64>,
    #[serde(default)]
    pub source_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl BackupState {
    pub fn new(id: BackupId, ecc_scheme: &str, suppliers: Vec<SupplierId>) -> Self {
        Self {
            id,
            ecc_scheme: ecc_scheme.to_string(),
            total_blocks: None,
            status: BackupStatus::Running,
            suppliers,
            at_risk_blocks: BTreeSet::new(),
            source_path: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == BackupStatus::Done
    }
}

/// Catalog of backups, optionally persisted as JSON.
#[derive(Debug)]
pub struct BackupCatalog {
    path: Option<PathBuf>,
    states: RwLock<BTreeMap<BackupId, BackupState>>,
}

impl BackupCatalog {
    /// Load the catalog at `path`, or start empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut states = BTreeMap::new();
        if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            let entries: Vec<BackupState> = serde_json::from_str(&text)?;
            for state in entries {
                states.insert(state.id.clone(), state);
            }
            info!("Loaded {} backups from {}", states.len(), path.display());
        }
        Ok(Self {
            path: Some(path),
            states: RwLock::new(states),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            states: RwLock::new(BTreeMap::new()),
        }
    }

    fn save(&self, states: &BTreeMap<BackupId, BackupState>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let entries: Vec<&BackupState> = states.values().collect();
        let body = serde_json::to_vec_pretty(&entries)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, path)?;
        debug!("Saved backup catalog to {}", path.display());
        Ok(())
    }

    /// Record a new backup; fails if the id is already known.
    pub fn create(&self, state: BackupState) -> Result<()> {
        let mut states = self.states.write();
        if states.contains_key(&state.id) {
            return Err(Error::Config(format!("backup {} already exists", state.id)));
        }
        states.insert(state.id.clone(), state);
        self.save(&states)
    }

    pub fn get(&self, id: &BackupId) -> Option<BackupState> {
        self.states.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<BackupState> {
        self.states.read().values().cloned().collect()
    }

    /// Apply `f` to a backup's state and persist.
    pub fn update<F>(&self, id: &BackupId, f: F) -> Result<BackupState>
    where
        F: FnOnce(&mut BackupState),
    {
        let mut states = self.states.write();
        let state = states
            .get_mut(id)
            .ok_or_else(|| Error::BackupNotFound(id.to_string()))?;
        f(state);
        let updated = state.clone();
        self.save(&states)?;
        Ok(updated)
    }

    /// Freeze a backup as done with its final block count.
    pub fn mark_done(&self, id: &BackupId, total_blocks: u64) -> Result<BackupState> {
        self.update(id, |state| {
            state.status = BackupStatus::Done;
            state.total_blocks = Some(total_blocks);
        })
    }

    pub fn set_status(&self, id: &BackupId, status: BackupStatus) -> Result<BackupState> {
        let current = self
            .get(id)
            .ok_or_else(|| Error::BackupNotFound(id.to_string()))?;
        if current.is_done() && status != BackupStatus::Done {
            return Err(Error::Internal(format!(
                "backup {} is done and cannot become {}",
                id, status
            )));
        }
        self.update(id, |state| state.status = status)
    }

    /// Set or clear the at-risk mark of a block. Returns whether it changed.
    pub fn set_at_risk(&self, id: &BackupId, block_number: u64, at_risk: bool) -> Result<bool> {
        let mut changed = false;
        {
            let states = self.states.read();
            let state = states
                .get(id)
                .ok_or_else(|| Error::BackupNotFound(id.to_string()))?;
            if state.at_risk_blocks.contains(&block_number) == at_risk {
                return Ok(false);
            }
        }
        self.update(id, |state| {
            changed = if at_risk {
                state.at_risk_blocks.insert(block_number)
            } else {
                state.at_risk_blocks.remove(&block_number)
            };
        })?;
        Ok(changed)
    }

    pub fn remove(&self, id: &BackupId) -> Result<Option<BackupState>> {
        let mut states = self.states.write();
        let removed = states.remove(id);
        if removed.is_some() {
            self.save(&states)?;
        }
        Ok(removed)
    }
}
