//! Fragvault - Erasure-Coded Backup Pipeline
//!
//! Turns an archive byte stream into encrypted, erasure-coded fragments that
//! are spread over remote suppliers, keeps them healthy over time, and turns
//! them back into the original stream on restore.
//!
//! # Architecture
//!
//! ```text
//! Block Pipe → Backup Job → Raid Worker → Fragment Matrix
//!                                             │
//!                         Data Sender ◀───────┼───────▶ Backup Monitor
//!                              │                             │
//!                              ▼                             ▼
//!                         Suppliers  ─────────────▶  Restore Worker
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Port implementations (cipher, suppliers, event publishers)
//! - [`backup`] - Backup catalog and the per-backup state machine
//! - [`block`] - Block model and the fixed sealed-block encoding
//! - [`config`] - Pipeline configuration
//! - [`domain`] - Value types, ports and events
//! - [`ec`] - XOR erasure coding
//! - [`error`] - Error types
//! - [`matrix`] - Authoritative fragment presence index
//! - [`metrics`] - Prometheus metrics
//! - [`monitor`] - Periodic reconciliation loop
//! - [`pipe`] - Producer-to-runtime byte pipe
//! - [`pipeline`] - Composition root
//! - [`raid`] - Worker pool running make/read/rebuild
//! - [`restore`] - Restore worker
//! - [`sender`] - Fragment upload queue
//! - [`supplier`] - Supplier sessions and fetching

pub mod adapters;
pub mod backup;
pub mod block;
pub mod config;
pub mod domain;
pub mod ec;
pub mod error;
pub mod matrix;
pub mod metrics;
pub mod monitor;
pub mod pipe;
pub mod pipeline;
pub mod raid;
pub mod restore;
pub mod sender;
pub mod supplier;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use domain::types::{BackupId, FragmentName, SupplierId};
pub use ec::EccMap;
pub use error::{Error, Result};
pub use pipeline::Pipeline;
