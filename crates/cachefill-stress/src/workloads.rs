use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use rand::Rng;
use serde::{Deserialize, Serialize};

use cachefill::{Coordinator, FillError, FillKey, FillResult, MemoryStore};

pub type StressStore = MemoryStore<StressKey, Arc<str>>;

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    /// How many requests are in flight at the same time.
    pub concurrency: usize,
    /// Number of distinct keys that requests are spread over.
    pub keys: usize,
    /// How long a single computation takes.
    #[serde(with = "humantime_serde")]
    pub factory_delay: Duration,
    /// Probability of a computation failing.
    #[serde(default)]
    pub failure_rate: f64,
    /// Whether all keys of this workload should land in the same bucket.
    #[serde(default)]
    pub colliding: bool,
    /// Expiration that computations set on their entries.
    #[serde(default, with = "humantime_serde")]
    pub ttl: Option<Duration>,
}

/// The key type of all workloads.
///
/// Keys are namespaced by workload, so concurrently running workloads never share values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StressKey {
    pub(crate) workload: usize,
    pub(crate) id: usize,
    pub(crate) colliding: bool,
}

impl Hash for StressKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.workload.hash(state);
        if !self.colliding {
            self.id.hash(state);
        }
    }
}

impl FillKey for StressKey {}

/// Counts what happened to the requests of a workload.
#[derive(Debug, Default)]
pub struct Outcomes {
    pub requests: AtomicUsize,
    pub computations: AtomicUsize,
    pub factory_errors: AtomicUsize,
    pub collision_errors: AtomicUsize,
    pub other_errors: AtomicUsize,
}

impl Outcomes {
    fn record(&self, result: &FillResult<Arc<str>>) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let counter = match result {
            Ok(_) => return,
            Err(FillError::Factory(_)) => &self.factory_errors,
            Err(FillError::TooManyCollisions { .. }) => &self.collision_errors,
            Err(_) => &self.other_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub struct ParsedWorkload {
    pub index: usize,
    pub concurrency: usize,
    keys: usize,
    factory_delay: Duration,
    failure_rate: f64,
    colliding: bool,
    ttl: Option<Duration>,
    pub outcomes: Outcomes,
}

pub fn prepare_workload(index: usize, workload: Workload) -> Result<ParsedWorkload> {
    let Workload {
        concurrency,
        keys,
        factory_delay,
        failure_rate,
        colliding,
        ttl,
    } = workload;

    ensure!(concurrency > 0, "workload {index}: concurrency must be positive");
    ensure!(keys > 0, "workload {index}: needs at least one key");
    ensure!(
        (0.0..=1.0).contains(&failure_rate),
        "workload {index}: failure_rate must be between 0 and 1"
    );

    Ok(ParsedWorkload {
        index,
        concurrency,
        keys,
        factory_delay,
        failure_rate,
        colliding,
        ttl,
        outcomes: Outcomes::default(),
    })
}

impl ParsedWorkload {
    fn random_key(&self) -> StressKey {
        StressKey {
            workload: self.index,
            id: rand::rng().random_range(0..self.keys),
            colliding: self.colliding,
        }
    }
}

/// Requests a random key of `workload`, computing it if needed.
pub async fn process_request(
    coordinator: &Coordinator<StressStore>,
    workload: &Arc<ParsedWorkload>,
) {
    let key = workload.random_key();
    let fail = rand::rng().random_bool(workload.failure_rate);

    let factory_workload = Arc::clone(workload);
    let result = coordinator
        .get_or_create(key, move |entry| {
            if let Some(ttl) = factory_workload.ttl {
                entry.set_time_to_live(ttl);
            }
            Box::pin(async move {
                factory_workload
                    .outcomes
                    .computations
                    .fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(factory_workload.factory_delay).await;
                if fail {
                    bail!("simulated failure");
                }
                let value = format!("{:?}", entry.key());
                Ok(Arc::from(value))
            })
        })
        .await;

    if let Err(FillError::Abandoned) = &result {
        tracing::error!(workload = workload.index, "Computation was abandoned");
    }
    workload.outcomes.record(&result);
}
