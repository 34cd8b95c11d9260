//! Infrastructure Adapters
//!
//! Implementations of the domain ports.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │        SupplierTransport │ BlockCipher │ EventPublisher          │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  DirectorySupplier │ InMemorySupplier │ AesGcmBlockCipher       │
//! │  Logging / InMemory / Composite / Channel event publishers      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod aes_gcm;
mod event_publisher;
mod supplier_dir;
mod supplier_memory;

pub use self::aes_gcm::{AesGcmBlockCipher, SESSION_KEY_TYPE};
pub use event_publisher::{
    ChannelEventPublisher, CompositeEventPublisher, InMemoryEventCollector, LoggingEventPublisher,
};
pub use supplier_dir::DirectorySupplier;
pub use supplier_memory::InMemorySupplier;
