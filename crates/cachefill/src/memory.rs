//! An in-memory [`CacheStore`] backed by `moka`.
use std::fmt;
use std::time::{Duration, Instant};

use crate::config::MemoryStoreConfig;
use crate::store::{CacheStore, FillKey, StoreEntry};

/// An item saved in the in-memory moka cache.
#[derive(Clone, Debug)]
struct InMemoryItem<V> {
    /// When to evict this item, if ever.
    deadline: Option<Instant>,
    /// The actual data.
    value: V,
}

type InMemoryCache<K, V> = moka::sync::Cache<K, InMemoryItem<V>>;

/// A struct implementing [`moka::Expiry`] that uses the [`InMemoryItem`] deadline as the explicit
/// expiration time.
struct CacheExpiration;

/// Returns the duration between the `current_time` and `target_time` in the future.
/// In case the `target_time` is already elapsed (it is in the past relative to `current_time`), this
/// will return `ZERO`.
fn saturating_duration_since(current_time: Instant, target_time: Instant) -> Duration {
    target_time
        .checked_duration_since(current_time)
        .unwrap_or_default()
}

impl<K, V> moka::Expiry<K, InMemoryItem<V>> for CacheExpiration {
    fn expire_after_create(
        &self,
        _key: &K,
        value: &InMemoryItem<V>,
        current_time: Instant,
    ) -> Option<Duration> {
        value
            .deadline
            .map(|deadline| saturating_duration_since(current_time, deadline))
    }

    fn expire_after_update(
        &self,
        _key: &K,
        value: &InMemoryItem<V>,
        current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        value
            .deadline
            .map(|deadline| saturating_duration_since(current_time, deadline))
    }
}

/// A bounded in-memory cache with per-entry expiration.
///
/// Factories can set the expiration of the value they produce through
/// [`MemoryEntry::set_time_to_live`] or [`MemoryEntry::set_deadline`]. Entries without an explicit
/// expiration fall back to the configured
/// [`default_ttl`](crate::config::MemoryStoreConfig::default_ttl).
pub struct MemoryStore<K, V> {
    cache: InMemoryCache<K, V>,
    default_ttl: Option<Duration>,
}

impl<K, V> MemoryStore<K, V>
where
    K: FillKey,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a store according to `config`.
    pub fn new(config: &MemoryStoreConfig) -> Self {
        let cache = InMemoryCache::builder()
            .max_capacity(config.capacity)
            .expire_after(CacheExpiration)
            .build();

        Self {
            cache,
            default_ttl: config.default_ttl,
        }
    }

    /// Creates a store holding at most `capacity` entries, without a default expiration.
    pub fn with_capacity(capacity: u64) -> Self {
        Self::new(&MemoryStoreConfig {
            capacity,
            default_ttl: None,
        })
    }

    /// Inserts `value` directly, bypassing any coordination.
    ///
    /// The entry expires after the configured default expiration, if any.
    pub fn insert(&self, key: K, value: V) {
        let deadline = deadline_after(self.default_ttl);
        self.cache.insert(key, InMemoryItem { deadline, value });
    }

    /// Removes `key` from the store.
    pub fn invalidate(&self, key: &K) {
        self.cache.invalidate(key);
    }

    /// Whether the store currently holds a value for `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.cache.contains_key(key)
    }

    /// The number of entries in the store.
    ///
    /// This flushes pending maintenance work first, so that recent inserts and expirations are
    /// accounted for.
    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

fn deadline_after(ttl: Option<Duration>) -> Option<Instant> {
    ttl.and_then(|ttl| Instant::now().checked_add(ttl))
}

impl<K, V> CacheStore for MemoryStore<K, V>
where
    K: FillKey,
    V: Clone + Send + Sync + 'static,
{
    type Key = K;
    type Value = V;
    type Entry = MemoryEntry<K, V>;

    fn try_get(&self, key: &K) -> Option<V> {
        self.cache.get(key).map(|item| item.value)
    }

    fn begin_entry(&self, key: &K) -> MemoryEntry<K, V> {
        MemoryEntry {
            cache: self.cache.clone(),
            key: key.clone(),
            value: None,
            deadline: None,
            default_ttl: self.default_ttl,
        }
    }
}

impl<K, V> Clone for MemoryStore<K, V> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            default_ttl: self.default_ttl,
        }
    }
}

impl<K, V> fmt::Debug for MemoryStore<K, V>
where
    K: FillKey,
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.cache.entry_count())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

/// An uncommitted entry of a [`MemoryStore`].
pub struct MemoryEntry<K, V> {
    cache: InMemoryCache<K, V>,
    key: K,
    value: Option<V>,
    deadline: Option<Instant>,
    default_ttl: Option<Duration>,
}

impl<K, V> MemoryEntry<K, V> {
    /// The key this entry will be stored under.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The staged value, if any.
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    /// Expires the entry `ttl` after now.
    pub fn set_time_to_live(&mut self, ttl: Duration) {
        self.deadline = deadline_after(Some(ttl));
    }

    /// Expires the entry at `deadline`.
    pub fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }
}

impl<K, V> StoreEntry<V> for MemoryEntry<K, V>
where
    K: FillKey,
    V: Clone + Send + Sync + 'static,
{
    fn set_value(&mut self, value: V) {
        self.value = Some(value);
    }

    fn commit(self) {
        let Some(value) = self.value else {
            tracing::debug!(key = ?self.key, "Dropping entry without a value");
            return;
        };
        let deadline = self.deadline.or_else(|| deadline_after(self.default_ttl));
        self.cache.insert(self.key, InMemoryItem { deadline, value });
    }
}

impl<K: fmt::Debug, V> fmt::Debug for MemoryEntry<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryEntry")
            .field("key", &self.key)
            .field("staged", &self.value.is_some())
            .field("deadline", &self.deadline)
            .finish()
    }
}
