//! Request-coalescing cache fills.
//!
//! When many callers concurrently ask a cache for the same missing key, only one of them should
//! run the expensive computation that produces the value. Everybody else waits for that one
//! computation and observes the very same value, or the very same error.
//!
//! The [`Coordinator`] does exactly that, on top of any [`CacheStore`]. It does not keep track of
//! in-flight computations in a locked map. Instead, keys are hashed into a fixed-size
//! [`BucketTable`], and each bucket slot is claimed and released with a single atomic
//! compare-and-swap. Two different keys that hash into the same bucket are told apart by
//! comparing them, and the later one retries a bounded number of times.
//!
//! The crate also ships a [`MemoryStore`] based on `moka`, which honors per-entry expiration
//! set by the factory.

#![warn(missing_docs)]

#[macro_use]
pub mod metrics;

pub mod buckets;
pub mod config;
pub mod coordinator;
mod error;
pub mod logging;
pub mod memory;
pub mod pending;
pub mod store;
mod utils;

pub use buckets::BucketTable;
pub use coordinator::{Coordinator, MAX_COLLISION_RETRIES};
pub use error::{FillError, FillResult};
pub use memory::{MemoryEntry, MemoryStore};
pub use store::{CacheStore, FillKey, StoreEntry};
