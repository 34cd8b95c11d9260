//! Pipeline Events
//!
//! Immutable records of significant occurrences, delivered to observers
//! through an [`EventPublisher`](super::ports::EventPublisher).
//!
//! # Example
//!
//! ```ignore
//! let event = PipelineEvent::backup_started(backup_id.clone(), Some("/home/alice".into()));
//! event_publisher.publish(event).await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{BackupId, FragmentName, SupplierId};

/// Event emitted by the backup pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    // =========================================================================
    // Backup Events
    // =========================================================================
    /// A backup began pulling bytes from its producer.
    BackupStarted {
        backup_id: BackupId,
        source_path: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// Every block of a backup was encoded.
    BackupDone {
        backup_id: BackupId,
        source_path: Option<String>,
        total_blocks: u64,
        timestamp: DateTime<Utc>,
    },

    /// A backup stopped before its last block.
    BackupAborted {
        backup_id: BackupId,
        source_path: Option<String>,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A raid `make` task for a block failed.
    BackupRaidMakeFailed {
        backup_id: BackupId,
        block_number: u64,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Fragment Events
    // =========================================================================
    /// Local or remote presence of a fragment changed.
    FragmentChanged {
        backup_id: BackupId,
        fragment: FragmentName,
        local: bool,
        remote: bool,
        timestamp: DateTime<Utc>,
    },

    /// Missing fragments of a block exceed the correctable bound.
    BlockAtRisk {
        backup_id: BackupId,
        block_number: u64,
        missing: usize,
        correctable: usize,
        timestamp: DateTime<Utc>,
    },

    /// A rebuild produced fragments owed to suppliers.
    BlockRebuilt {
        backup_id: BackupId,
        block_number: u64,
        fragments: usize,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Restore Events
    // =========================================================================
    /// A restore emitted its last block.
    RestoreDone {
        backup_id: BackupId,
        blocks: u64,
        timestamp: DateTime<Utc>,
    },

    /// A restore gave up.
    RestoreFailed {
        backup_id: BackupId,
        block_number: u64,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Supplier Events
    // =========================================================================
    /// A supplier session changed state.
    SupplierStatusChanged {
        supplier: SupplierId,
        state: String,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    /// Get the timestamp of this event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            PipelineEvent::BackupStarted { timestamp, .. }
            | PipelineEvent::BackupDone { timestamp, .. }
            | PipelineEvent::BackupAborted { timestamp, .. }
            | PipelineEvent::BackupRaidMakeFailed { timestamp, .. }
            | PipelineEvent::FragmentChanged { timestamp, .. }
            | PipelineEvent::BlockAtRisk { timestamp, .. }
            | PipelineEvent::BlockRebuilt { timestamp, .. }
            | PipelineEvent::RestoreDone { timestamp, .. }
            | PipelineEvent::RestoreFailed { timestamp, .. }
            | PipelineEvent::SupplierStatusChanged { timestamp, .. } => *timestamp,
        }
    }

    /// Observer-facing event name.
    pub fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::BackupStarted { .. } => "backup-started",
            PipelineEvent::BackupDone { .. } => "backup-done",
            PipelineEvent::BackupAborted { .. } => "backup-aborted",
            PipelineEvent::BackupRaidMakeFailed { .. } => "backup-raidmake-failed",
            PipelineEvent::FragmentChanged { .. } => "fragment-changed",
            PipelineEvent::BlockAtRisk { .. } => "block-at-risk",
            PipelineEvent::BlockRebuilt { .. } => "block-rebuilt",
            PipelineEvent::RestoreDone { .. } => "restore-done",
            PipelineEvent::RestoreFailed { .. } => "restore-failed",
            PipelineEvent::SupplierStatusChanged { .. } => "supplier-status-changed",
        }
    }

    /// Backup this event refers to, if any.
    pub fn backup_id(&self) -> Option<&BackupId> {
        match self {
            PipelineEvent::BackupStarted { backup_id, .. }
            | PipelineEvent::BackupDone { backup_id, .. }
            | PipelineEvent::BackupAborted { backup_id, .. }
            | PipelineEvent::BackupRaidMakeFailed { backup_id, .. }
            | PipelineEvent::FragmentChanged { backup_id, .. }
            | PipelineEvent::BlockAtRisk { backup_id, .. }
            | PipelineEvent::BlockRebuilt { backup_id, .. }
            | PipelineEvent::RestoreDone { backup_id, .. }
            | PipelineEvent::RestoreFailed { backup_id, .. } => Some(backup_id),
            PipelineEvent::SupplierStatusChanged { .. } => None,
        }
    }
}

// =============================================================================
// Event Constructors
// =============================================================================

impl PipelineEvent {
    pub fn backup_started(backup_id: BackupId, source_path: Option<String>) -> Self {
        PipelineEvent::BackupStarted {
            backup_id,
            source_path,
            timestamp: Utc::now(),
        }
    }

    pub fn backup_done(backup_id: BackupId, source_path: Option<String>, total_blocks: u64) -> Self {
        PipelineEvent::BackupDone {
            backup_id,
            source_path,
            total_blocks,
            timestamp: Utc::now(),
        }
    }

    pub fn backup_aborted(
        backup_id: BackupId,
        source_path: Option<String>,
        reason: impl Into<String>,
    ) -> Self {
        PipelineEvent::BackupAborted {
            backup_id,
            source_path,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn raid_make_failed(
        backup_id: BackupId,
        block_number: u64,
        reason: impl Into<String>,
    ) -> Self {
        PipelineEvent::BackupRaidMakeFailed {
            backup_id,
            block_number,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn fragment_changed(
        backup_id: BackupId,
        fragment: FragmentName,
        local: bool,
        remote: bool,
    ) -> Self {
        PipelineEvent::FragmentChanged {
            backup_id,
            fragment,
            local,
            remote,
            timestamp: Utc::now(),
        }
    }

    pub fn block_at_risk(
        backup_id: BackupId,
        block_number: u64,
        missing: usize,
        correctable: usize,
    ) -> Self {
        PipelineEvent::BlockAtRisk {
            backup_id,
            block_number,
            missing,
            correctable,
            timestamp: Utc::now(),
        }
    }

    pub fn block_rebuilt(backup_id: BackupId, block_number: u64, fragments: usize) -> Self {
        PipelineEvent::BlockRebuilt {
            backup_id,
            block_number,
            fragments,
            timestamp: Utc::now(),
        }
    }

    pub fn restore_done(backup_id: BackupId, blocks: u64) -> Self {
        PipelineEvent::RestoreDone {
            backup_id,
            blocks,
            timestamp: Utc::now(),
        }
    }

    pub fn restore_failed(backup_id: BackupId, block_number: u64, reason: impl Into<String>) -> Self {
        PipelineEvent::RestoreFailed {
            backup_id,
            block_number,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn supplier_status_changed(supplier: SupplierId, state: impl Into<String>) -> Self {
        PipelineEvent::SupplierStatusChanged {
            supplier,
            state: state.into(),
            timestamp: Utc::now(),
        }
    }
}
