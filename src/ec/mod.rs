//! Erasure Coding Module
//!
//! XOR erasure coding used to spread every encrypted block over a set of
//! suppliers.
//!
//! # Components
//!
//! - **ECC Map** (`eccmap.rs`): named incidence tables (`2x2` .. `64x64`)
//!   with their correctable thresholds and the peeling planner.
//! - **Codec** (`codec.rs`): in-memory split, parity computation and
//!   recovery with cooperative cancellation.
//!
//! # Usage
//!
//! ```rust,ignore
//! use fragvault::ec::{codec, EccMap};
//!
//! let map = EccMap::by_name("18x18")?;
//! let never = AtomicBool::new(false);
//! let encoded = codec::encode(&map, b"hello", &never)?;
//! assert_eq!(encoded.data.len(), 18);
//! ```

pub mod codec;
pub mod eccmap;

#[cfg(test)]
mod proptest;

pub use codec::{EncodedBlock, WORD_SIZE, YIELD_BYTES};
pub use eccmap::{EccMap, RecoveryPlan, RecoveryStep, DEFAULT_SCHEME};
