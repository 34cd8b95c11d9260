//! Domain Layer
//!
//! Value objects, ports and events shared by the pipeline components.
//!
//! - [`types`] - Backup, supplier and fragment identifiers, fragment records
//! - [`ports`] - Traits implemented by adapters (suppliers, cipher, events)
//! - [`events`] - Events emitted to observers

pub mod events;
pub mod ports;
pub mod types;

pub use events::PipelineEvent;
pub use ports::{BlockCipher, EventPublisher, FetchReply, StoreReply, SupplierTransport};
pub use types::{
    checksum, BackupId, Checksum, Fragment, FragmentKind, FragmentName, Presence, SupplierId,
};
