//! Coalescing of concurrent cache fills.
use std::fmt;
use std::hash::BuildHasher;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use rustc_hash::FxBuildHasher;
use tracing::Instrument;

use crate::buckets::BucketTable;
use crate::config::BucketConfig;
use crate::error::{FillError, FillResult};
use crate::pending::{Completion, PendingOperation, Release};
use crate::store::{CacheStore, FillKey, StoreEntry};
use crate::utils::CallOnDrop;

/// How many times a fill is retried after its bucket turned out to be occupied by an unrelated
/// key.
///
/// After the initial attempt and this many retries, the fill fails with
/// [`FillError::TooManyCollisions`].
pub const MAX_COLLISION_RETRIES: usize = 2;

type Operation<S> = PendingOperation<<S as CacheStore>::Key, <S as CacheStore>::Value>;

/// Makes sure that a value is computed at most once, no matter how many callers ask for it
/// concurrently.
///
/// See [`get_or_create`](Self::get_or_create) for how the computation is coordinated.
pub struct Coordinator<S: CacheStore> {
    store: Arc<S>,
    buckets: Arc<BucketTable<S::Key, S::Value>>,
    hasher: FxBuildHasher,
}

impl<S: CacheStore> Coordinator<S> {
    /// Creates a coordinator with its own bucket table, sized for the current host.
    pub fn new(store: impl Into<Arc<S>>) -> Self {
        Self::with_buckets(store, Arc::new(BucketTable::new()))
    }

    /// Creates a coordinator using an existing, possibly shared, bucket table.
    pub fn with_buckets(
        store: impl Into<Arc<S>>,
        buckets: Arc<BucketTable<S::Key, S::Value>>,
    ) -> Self {
        Self {
            store: store.into(),
            buckets,
            hasher: FxBuildHasher,
        }
    }

    /// Creates a coordinator with a bucket table sized according to `config`.
    pub fn from_config(store: impl Into<Arc<S>>, config: &BucketConfig) -> FillResult<Self> {
        let buckets = BucketTable::from_config(config)?;
        Ok(Self::with_buckets(store, Arc::new(buckets)))
    }

    /// The store that is being filled.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The table tracking in-flight computations.
    pub fn buckets(&self) -> &Arc<BucketTable<S::Key, S::Value>> {
        &self.buckets
    }

    fn bucket_index(&self, key: &S::Key) -> usize {
        self.buckets.index_of(self.hasher.hash_one(key))
    }

    /// Returns the value for `key`, computing it with `factory` if it is not cached yet.
    ///
    /// If the store already holds `key`, its value is returned right away. Otherwise the key is
    /// hashed into a bucket, and the caller tries to claim it:
    ///
    /// - If the bucket was empty, the caller owns the computation. `factory` is called with a
    ///   fresh [`StoreEntry`], on which it may configure expiration. A successful value is
    ///   committed to the store before anybody else is woken up.
    /// - If the bucket is busy computing the same key, the caller waits for that computation and
    ///   returns its value or its error.
    /// - If the bucket is busy computing a different key, the caller waits until it is done,
    ///   ignores its outcome, and starts over. This is retried up to
    ///   [`MAX_COLLISION_RETRIES`] times. Finding an operation that already has its outcome
    ///   but did not give up its bucket yet counts as a collision, too.
    ///
    /// The owner resolves waiters before it releases the bucket, and only returns once the
    /// bucket is released.
    ///
    /// The computation runs as its own task on the tokio runtime. Dropping the returned future,
    /// for example because of a timeout, only stops waiting for it.
    ///
    /// # Errors
    ///
    /// - [`FillError::InvalidArgument`] if `key` is not [valid](FillKey::is_valid).
    /// - [`FillError::Factory`] if the factory failed, for this caller or the one it waited for.
    /// - [`FillError::TooManyCollisions`] if the bucket kept being occupied by unrelated keys.
    /// - [`FillError::Abandoned`] if the computation panicked.
    pub async fn get_or_create<F>(&self, key: S::Key, factory: F) -> FillResult<S::Value>
    where
        F: for<'e> FnOnce(&'e mut S::Entry) -> BoxFuture<'e, anyhow::Result<S::Value>>
            + Send
            + 'static,
    {
        if !key.is_valid() {
            return Err(FillError::InvalidArgument("key"));
        }
        metric!(counter("fill.access") += 1);

        let mut collision_depth = 0;
        loop {
            if let Some(value) = self.store.try_get(&key) {
                metric!(counter("fill.fast_path") += 1);
                tracing::trace!(?key, "Found cached value");
                return Ok(value);
            }

            let index = self.bucket_index(&key);
            let (operation, completion, release) = PendingOperation::new(key.clone());

            let Some(occupant) = self.buckets.claim(index, &operation) else {
                return self.fill(index, operation, completion, release, factory).await;
            };

            if occupant.key() == &key {
                metric!(counter("fill.duplicate") += 1);
                tracing::trace!(?key, index, "Waiting for in-flight computation");
                return observe(&occupant).await;
            }

            metric!(counter("fill.collision") += 1);
            if collision_depth >= MAX_COLLISION_RETRIES {
                metric!(counter("fill.collision_exhausted") += 1);
                tracing::warn!(
                    ?key,
                    occupant = ?occupant.key(),
                    index,
                    buckets = self.buckets.len(),
                    "Giving up after repeated bucket collisions",
                );
                return Err(FillError::TooManyCollisions {
                    attempts: collision_depth + 1,
                });
            }

            tracing::debug!(
                ?key,
                occupant = ?occupant.key(),
                index,
                "Bucket is occupied by another key, waiting for it",
            );
            if occupant.is_resolved() {
                // finished, but it still holds the bucket
                occupant.released().await;
            } else {
                occupant.settled().await;
            }
            collision_depth += 1;
        }
    }

    /// Runs the computation for a freshly claimed bucket.
    ///
    /// The slot is released on every exit path of the spawned computation, including panics.
    async fn fill<F>(
        &self,
        index: usize,
        operation: Arc<Operation<S>>,
        completion: Completion<S::Value>,
        release: Release,
        factory: F,
    ) -> FillResult<S::Value>
    where
        F: for<'e> FnOnce(&'e mut S::Entry) -> BoxFuture<'e, anyhow::Result<S::Value>>
            + Send
            + 'static,
    {
        let key = operation.key().clone();

        let release_token = {
            let buckets = Arc::clone(&self.buckets);
            let operation = Arc::clone(&operation);
            CallOnDrop::new(move || {
                if !buckets.release(index, &operation) {
                    tracing::error!(key = ?operation.key(), index, "Bucket was not held on release");
                }
                drop(release);
            })
        };

        // Somebody may have committed the value between our lookup and the claim.
        if let Some(value) = self.store.try_get(&key) {
            metric!(counter("fill.fast_path") += 1);
            completion.resolve(Ok(value.clone()));
            drop(release_token);
            return Ok(value);
        }

        metric!(counter("fill.computation") += 1);
        tracing::trace!(?key, index, "Claimed bucket, starting computation");

        let store = Arc::clone(&self.store);
        let span = tracing::debug_span!("cache_fill", ?key, index);
        let computation = async move {
            let start = Instant::now();
            let mut entry = store.begin_entry(&key);

            let outcome = match factory(&mut entry).await {
                Ok(value) => {
                    entry.set_value(value.clone());
                    entry.commit();
                    Ok(value)
                }
                Err(err) => {
                    metric!(counter("fill.factory_failure") += 1);
                    let message = format!("{err:#}");
                    tracing::debug!(error = %message, "Computation failed");
                    // the entry is discarded without being committed
                    drop(entry);
                    Err(FillError::Factory(Arc::new(err)))
                }
            };

            metric!(
                timer("fill.duration") = start.elapsed(),
                "status" => if outcome.is_ok() { "ok" } else { "error" },
            );

            completion.resolve(outcome);
            // Waiters woken by the outcome get to run while the operation still holds the bucket.
            tokio::task::yield_now().await;
            drop(release_token);
        }
        .instrument(span);

        tokio::spawn(computation);

        let outcome = observe(&operation).await;
        operation.released().await;
        outcome
    }
}

/// Waits for `operation`, reporting computations that never produced an outcome.
async fn observe<K: FillKey, V: Clone>(operation: &PendingOperation<K, V>) -> FillResult<V> {
    let outcome = operation.wait().await;
    if let Err(FillError::Abandoned) = outcome {
        metric!(counter("fill.abandoned") += 1);
        tracing::error!(key = ?operation.key(), "Computation ended without a result");
    }
    outcome
}

impl<S: CacheStore> Clone for Coordinator<S> {
    fn clone(&self) -> Self {
        // derive(Clone) would require `S: Clone`, although only the `Arc` is cloned
        Self {
            store: Arc::clone(&self.store),
            buckets: Arc::clone(&self.buckets),
            hasher: FxBuildHasher,
        }
    }
}

impl<S: CacheStore + fmt::Debug> fmt::Debug for Coordinator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("store", &self.store)
            .field("buckets", &self.buckets)
            .finish()
    }
}
