//! Supplier Sessions
//!
//! - [`session`] - Per-supplier ack/failure tracking and probe backoff
//! - [`registry`] - Transports and sessions of every known supplier
//! - [`fetch`] - Pulling fragments back into the local tree

pub mod fetch;
mod registry;
pub mod session;

pub use fetch::{FetchScope, FetchSummary, FragmentFetcher};
pub use registry::{ProbeReport, SupplierRegistry};
pub use session::{SessionConfig, SupplierSession, SupplierState};
