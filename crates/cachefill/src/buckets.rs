//! The lock-free table of in-flight computations.
//!
//! Every slot holds at most one [`PendingOperation`]. A caller becomes the owner of a computation
//! by swapping its operation into an empty slot, and gives up ownership by swapping it out again.
//! Both are a single compare-and-swap on one slot, so unrelated keys never contend with each
//! other unless they hash into the same bucket.

use std::fmt;
use std::sync::Arc;

use arc_swap::{ArcSwapOption, Guard};

use crate::config::BucketConfig;
use crate::error::{FillError, FillResult};
use crate::pending::PendingOperation;

/// A fixed-size array of slots for [`PendingOperation`]s.
///
/// The table is meant to be created once and shared, via [`Arc`], by everything that coordinates
/// fills for the same key and value types. It is never resized.
pub struct BucketTable<K, V> {
    slots: Box<[ArcSwapOption<PendingOperation<K, V>>]>,
}

impl<K, V> BucketTable<K, V> {
    /// Creates a table sized for the current host, using the default [`BucketConfig`].
    pub fn new() -> Self {
        let len = BucketConfig::default().bucket_count(num_cpus::get());
        Self::with_len_unchecked(len)
    }

    /// Creates a table with exactly `len` slots.
    ///
    /// Returns [`FillError::InvalidArgument`] if `len` is zero.
    pub fn with_len(len: usize) -> FillResult<Self> {
        if len == 0 {
            return Err(FillError::InvalidArgument("buckets"));
        }
        Ok(Self::with_len_unchecked(len))
    }

    /// Creates a table sized according to `config` and the current host.
    pub fn from_config(config: &BucketConfig) -> FillResult<Self> {
        Self::with_len(config.bucket_count(num_cpus::get()))
    }

    fn with_len_unchecked(len: usize) -> Self {
        let slots = (0..len).map(|_| ArcSwapOption::empty()).collect();
        Self { slots }
    }

    /// The number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Always `false`, a table has at least one slot.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Maps a hash onto a slot index.
    pub fn index_of(&self, hash: u64) -> usize {
        (hash % self.slots.len() as u64) as usize
    }

    /// Tries to place `operation` into the empty slot at `index`.
    ///
    /// Returns the operation that occupied the slot before. `None` means the slot was empty and
    /// `operation` now occupies it.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn claim(
        &self,
        index: usize,
        operation: &Arc<PendingOperation<K, V>>,
    ) -> Option<Arc<PendingOperation<K, V>>> {
        let empty: Option<Arc<PendingOperation<K, V>>> = None;
        let previous = self.slots[index].compare_and_swap(&empty, Some(Arc::clone(operation)));
        Guard::into_inner(previous)
    }

    /// Clears the slot at `index`, but only if it still holds `expected`.
    ///
    /// Returns whether the slot was cleared.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn release(&self, index: usize, expected: &Arc<PendingOperation<K, V>>) -> bool {
        let current = Some(Arc::clone(expected));
        let cleared: Option<Arc<PendingOperation<K, V>>> = None;
        let previous = self.slots[index].compare_and_swap(&current, cleared);
        matches!(&*previous, Some(previous) if Arc::ptr_eq(previous, expected))
    }

    /// Returns the operation currently occupying the slot at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn occupant(&self, index: usize) -> Option<Arc<PendingOperation<K, V>>> {
        self.slots[index].load_full()
    }

    /// Counts the occupied slots.
    ///
    /// This is only a snapshot, slots may be claimed and released concurrently.
    pub fn occupied(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.load().is_some())
            .count()
    }
}

impl<K, V> Default for BucketTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for BucketTable<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BucketTable")
            .field("len", &self.len())
            .field("occupied", &self.occupied())
            .finish()
    }
}
