//! Domain Ports (Port/Adapter Pattern)
//!
//! Abstractions the pipeline depends on. Adapters in [`crate::adapters`]
//! provide the concrete implementations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Pipeline Core                           │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │ SupplierTransport │ BlockCipher │ EventPublisher    │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Adapters (Impls)                        │
//! │  DirectorySupplier │ InMemorySupplier │ AesGcmBlockCipher   │
//! │  LoggingEventPublisher │ ChannelEventPublisher              │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::block::{Block, SealedBlock};
use crate::domain::events::PipelineEvent;
use crate::domain::types::{BackupId, Fragment, FragmentName, SupplierId};
use crate::error::Result;

// =============================================================================
// Supplier Transport
// =============================================================================

/// Supplier answer to `StoreFragment`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreReply {
    /// Fragment stored; signed by the supplier in a real deployment.
    Ack { name: FragmentName },
    /// Supplier refused to keep the fragment.
    Fail { reason: String },
}

/// Supplier answer to `FetchFragment`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchReply {
    Data(Fragment),
    NotFound,
}

/// Request/ack protocol spoken with a single supplier.
///
/// An `Err` means the supplier could not be reached; protocol-level refusals
/// come back as `StoreReply::Fail` or `FetchReply::NotFound`.
#[async_trait]
pub trait SupplierTransport: Send + Sync {
    /// Identity of the supplier behind this transport.
    fn supplier_id(&self) -> &SupplierId;

    /// `StoreFragment{fragmentName, bytes}`
    async fn store(&self, fragment: Fragment) -> Result<StoreReply>;

    /// `FetchFragment{fragmentName}`
    async fn fetch(&self, backup_id: &BackupId, name: &FragmentName) -> Result<FetchReply>;

    /// `ListFragments{backupId}`
    async fn list(&self, backup_id: &BackupId) -> Result<BTreeSet<FragmentName>>;

    /// `Probe{}`; `Ok` is `Pong{}`.
    async fn probe(&self) -> Result<()>;

    /// Drop everything held for a backup. Suppliers that do not support
    /// deletion keep the default no-op.
    async fn remove_backup(&self, _backup_id: &BackupId) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Block Cipher
// =============================================================================

/// Seals plaintext blocks for storage and opens them on restore.
pub trait BlockCipher: Send + Sync {
    /// Tag recorded in every sealed header.
    fn session_key_type(&self) -> &str;

    /// Encrypt a block under a fresh session key.
    fn seal(&self, block: &Block) -> Result<SealedBlock>;

    /// Decrypt a sealed block.
    fn open(&self, sealed: &SealedBlock) -> Result<Block>;
}

// =============================================================================
// Event Publisher
// =============================================================================

/// Observer bus endpoint for pipeline events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a single event.
    async fn publish(&self, event: PipelineEvent) -> Result<()>;

    /// Publish several events in order.
    async fn publish_all(&self, events: Vec<PipelineEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}
