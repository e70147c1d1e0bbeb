//! The contract between the [`Coordinator`](crate::Coordinator) and the cache it fills.
//!
//! The coordinator does not store anything itself. It asks a [`CacheStore`] whether a value is
//! already present, and hands the factory a [`StoreEntry`] that is committed to the store once
//! the factory succeeded. Storage, eviction and expiration are all up to the store.

use std::borrow::Cow;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

/// A key that values can be computed and cached for.
///
/// Keys are compared with [`Eq`], so textual keys compare ordinally, byte by byte.
pub trait FillKey: Eq + Hash + Clone + Debug + Send + Sync + 'static {
    /// Whether the key may be used for a cache fill at all.
    ///
    /// Invalid keys are rejected with [`FillError::InvalidArgument`](crate::FillError) before
    /// any coordination starts.
    fn is_valid(&self) -> bool {
        true
    }
}

fn is_valid_text(text: &str) -> bool {
    !text.trim().is_empty()
}

impl FillKey for String {
    fn is_valid(&self) -> bool {
        is_valid_text(self)
    }
}

impl FillKey for &'static str {
    fn is_valid(&self) -> bool {
        is_valid_text(self)
    }
}

impl FillKey for Box<str> {
    fn is_valid(&self) -> bool {
        is_valid_text(self)
    }
}

impl FillKey for Arc<str> {
    fn is_valid(&self) -> bool {
        is_valid_text(self)
    }
}

impl FillKey for Cow<'static, str> {
    fn is_valid(&self) -> bool {
        is_valid_text(self)
    }
}

macro_rules! impl_fill_key {
    ($($ty:ty),* $(,)?) => {
        $(impl FillKey for $ty {})*
    };
}

impl_fill_key!(
    u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, char, bool
);

impl<A: FillKey, B: FillKey> FillKey for (A, B) {
    fn is_valid(&self) -> bool {
        self.0.is_valid() && self.1.is_valid()
    }
}

/// A not yet committed entry of a [`CacheStore`].
///
/// Concrete entry types additionally expose whatever expiration or eviction settings their store
/// supports, so the factory can configure them before the entry is committed.
pub trait StoreEntry<V> {
    /// Stages `value` to be written on [`commit`](Self::commit).
    fn set_value(&mut self, value: V);

    /// Writes the staged value into the store.
    ///
    /// Dropping an entry without committing it leaves the store untouched.
    fn commit(self);
}

/// A cache that can be filled by the [`Coordinator`](crate::Coordinator).
///
/// Both methods may be called concurrently from many tasks.
pub trait CacheStore: Send + Sync + 'static {
    /// The key type.
    type Key: FillKey;
    /// The cached value, which is cloned to every caller.
    type Value: Clone + Send + Sync + 'static;
    /// The entry handle given to the factory.
    type Entry: StoreEntry<Self::Value> + Send + 'static;

    /// Looks up `key` without blocking.
    fn try_get(&self, key: &Self::Key) -> Option<Self::Value>;

    /// Starts a new entry for `key`, which is only visible once committed.
    fn begin_entry(&self, key: &Self::Key) -> Self::Entry;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_textual_keys() {
        assert!("profile:42".is_valid());
        assert!(String::from(" x ").is_valid());

        assert!(!"".is_valid());
        assert!(!String::from(" \t\n").is_valid());
        assert!(!Box::<str>::from("   ").is_valid());
        assert!(!Arc::<str>::from("").is_valid());
        assert!(!Cow::<'static, str>::Borrowed(" ").is_valid());
    }

    #[test]
    fn test_ordinal_equality() {
        // no case folding or normalization
        assert_ne!("Key", "key");
        assert_ne!("e\u{301}", "\u{e9}");
    }

    #[test]
    fn test_other_keys() {
        assert!(0u64.is_valid());
        assert!((7u32, "name").is_valid());
        assert!(!(7u32, "").is_valid());
    }
}
