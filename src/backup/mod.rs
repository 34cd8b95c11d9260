//! Backup Module
//!
//! - [`catalog`] - Durable per-backup state
//! - [`job`] - Block-producing state machine for one backup

pub mod catalog;
mod job;

pub use catalog::{BackupCatalog, BackupState, BackupStatus};
pub use job::{
    BackupDeps, BackupHandle, BackupJob, BackupJobConfig, BackupOutcome, BackupPhase, BlockReport,
    BlockResult,
};
