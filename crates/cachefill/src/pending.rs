//! In-flight computations and their completion signal.
//!
//! A [`PendingOperation`] is created by a caller that tries to become the owner of a
//! computation. If it manages to place the operation into a bucket slot, it keeps the matching
//! [`Completion`] and resolves it exactly once, and then gives up the slot through its
//! [`Release`]. Anybody else that finds the operation in the slot can wait on it, any number of
//! times and from any number of tasks.
//!
//! An operation goes through `created → running → resolved → released`. Between the last two
//! states it is finished, but still occupies its bucket.

use std::fmt;
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};

use crate::error::{FillError, FillResult};

type CompletionSignal<V> = Shared<oneshot::Receiver<FillResult<V>>>;

/// A single in-flight factory execution for one key.
pub struct PendingOperation<K, V> {
    key: K,
    signal: CompletionSignal<V>,
    released: Shared<oneshot::Receiver<()>>,
}

/// The resolving half of a [`PendingOperation`].
///
/// Dropping it without calling [`resolve`](Self::resolve) makes all waiters observe
/// [`FillError::Abandoned`].
pub struct Completion<V> {
    sender: oneshot::Sender<FillResult<V>>,
}

/// Marks a [`PendingOperation`] as having left its bucket once dropped.
pub struct Release {
    _sender: oneshot::Sender<()>,
}

impl<K, V> PendingOperation<K, V>
where
    V: Clone,
{
    /// Creates a new operation computing `key`, along with its resolving and releasing halves.
    pub fn new(key: K) -> (Arc<Self>, Completion<V>, Release) {
        let (sender, receiver) = oneshot::channel();
        let (release, released) = oneshot::channel();
        let operation = Self {
            key,
            signal: receiver.shared(),
            released: released.shared(),
        };
        let release = Release { _sender: release };
        (Arc::new(operation), Completion { sender }, release)
    }

    /// The key this operation is computing.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Waits for the operation to be resolved and returns its outcome.
    pub async fn wait(&self) -> FillResult<V> {
        match self.signal.clone().await {
            Ok(outcome) => outcome,
            Err(oneshot::Canceled) => Err(FillError::Abandoned),
        }
    }

    /// Waits for the operation to be resolved, discarding its outcome.
    pub async fn settled(&self) {
        let _outcome = self.signal.clone().await;
    }

    /// Waits until the operation has left its bucket.
    pub async fn released(&self) {
        let _released = self.released.clone().await;
    }

    /// Whether the outcome is already available.
    pub fn is_resolved(&self) -> bool {
        self.signal.peek().is_some() || self.signal.clone().now_or_never().is_some()
    }
}

impl<V> Completion<V> {
    /// Resolves the operation, waking up every waiter.
    pub fn resolve(self, outcome: FillResult<V>) {
        // all the waiters may be gone already, which is fine
        self.sender.send(outcome).ok();
    }
}

impl<K: fmt::Debug, V: Clone> fmt::Debug for PendingOperation<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("key", &self.key)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

impl<V> fmt::Debug for Completion<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("canceled", &self.sender.is_canceled())
            .finish()
    }
}
