//! Helpers for testing cache fills.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Factories that should stay in flight while the test arranges concurrent callers can wait
//!    on a [`Gate`]. Keep a clone of the gate around and [`open`](Gate::open) it once all callers
//!    are in place.
//!
//!  - To force distinct keys into the same bucket, use [`CollidingKey`]. All of them hash to the
//!    same value, but only compare equal when their names match.
//!
//!  - Tests that depend on the order of concurrent callers run on the current thread runtime.
//!    There, [`settle`] and [`wait_until`] step the runtime without relying on timing.

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::watch;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use cachefill::FillKey;

/// Number of times [`settle`] yields to the scheduler.
const SETTLE_ROUNDS: usize = 16;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `cachefill` crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("cachefill=trace,cachefill_stress=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Gives spawned tasks a chance to run up to their next suspension point.
///
/// Tests use this to make sure concurrent callers have reached the bucket before the test
/// moves on. On the current thread runtime, every yield polls all tasks that are ready.
pub async fn settle() {
    for _ in 0..SETTLE_ROUNDS {
        tokio::task::yield_now().await;
    }
}

/// Yields to the scheduler until `condition` holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::task::yield_now().await;
    }
}

/// A one-way barrier that factories can wait on.
///
/// All clones share the same state. Once opened, the gate stays open.
#[derive(Clone, Debug)]
pub struct Gate {
    sender: Arc<watch::Sender<bool>>,
}

impl Gate {
    /// Creates a closed gate.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Opens the gate, releasing all current and future waiters.
    pub fn open(&self) {
        self.sender.send_replace(true);
    }

    /// Whether the gate has been opened.
    pub fn is_open(&self) -> bool {
        *self.sender.borrow()
    }

    /// Waits until the gate is opened.
    pub async fn wait(&self) {
        let mut receiver = self.sender.subscribe();
        // the sender lives as long as `self`, so this can not fail
        receiver.wait_for(|open| *open).await.ok();
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

/// A shared counter, typically counting factory executions.
#[derive(Clone, Debug, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    /// Creates a counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the counter and returns the new value.
    pub fn increment(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The current value.
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// A key that always lands in the same bucket as every other `CollidingKey`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollidingKey(pub String);

impl CollidingKey {
    /// Creates a key with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl Hash for CollidingKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        0u64.hash(state);
    }
}

impl FillKey for CollidingKey {
    fn is_valid(&self) -> bool {
        self.0.is_valid()
    }
}
