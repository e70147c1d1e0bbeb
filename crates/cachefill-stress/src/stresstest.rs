use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use cachefill::config::Config;
use cachefill::{Coordinator, MemoryStore, metric};

use crate::workloads::{
    ParsedWorkload, StressStore, WorkloadsConfig, prepare_workload, process_request,
};

/// How often the occupied buckets are counted while the workloads run.
const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let store: StressStore = MemoryStore::new(&config.store);
    let coordinator = Coordinator::from_config(store, &config.buckets)
        .context("failed to create coordinator")?;
    tracing::info!(buckets = coordinator.buckets().len(), "Starting stresstest");

    // initialize workloads
    let workloads = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| prepare_workload(i, workload).map(Arc::new))
        .collect::<Result<Vec<_>>>()?;

    // warmup: run each workload once to make sure the runtime is warm
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|workload| {
            let coordinator = coordinator.clone();
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                process_request(&coordinator, &workload).await;
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    let start = Instant::now();
    let deadline = tokio::time::Instant::from_std(start + duration);

    let peak_occupied = Arc::new(AtomicUsize::new(0));
    let sampler = tokio::spawn(sample_occupancy(
        coordinator.clone(),
        deadline,
        Arc::clone(&peak_occupied),
    ));

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for entry in &workloads {
        let coordinator = coordinator.clone();
        let workload = Arc::clone(entry);

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency;
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let coordinator = coordinator.clone();
                        let workload = Arc::clone(&workload);
                        let task_durations = Arc::clone(&task_durations);
                        let task_start = Instant::now();

                        tokio::spawn(async move {
                            process_request(&coordinator, &workload).await;

                            let elapsed = task_start.elapsed().as_secs_f64();
                            if let Ok(mut task_durations) = task_durations.lock() {
                                task_durations.add(elapsed);
                            }

                            drop(permit);
                        });
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            match task_durations.lock() {
                Ok(mut task_durations) => std::mem::take(&mut *task_durations),
                Err(_) => DDSketch::default(),
            }
        });
        tasks.push((Arc::clone(entry), task));
    }

    for (workload, task) in tasks {
        let task_durations = task.await.context("workload task panicked")?;
        report(&workload, &task_durations, duration);
    }

    sampler.await.context("sampler task panicked")?;
    let peak_occupied = peak_occupied.load(Ordering::Relaxed);
    let buckets = coordinator.buckets().len();
    println!();
    println!("Peak occupied buckets: {peak_occupied} of {buckets}");

    Ok(())
}

/// Periodically reports the number of occupied buckets until `deadline`, keeping track of the
/// highest count seen.
async fn sample_occupancy(
    coordinator: Coordinator<StressStore>,
    deadline: tokio::time::Instant,
    peak: Arc<AtomicUsize>,
) {
    let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    while tokio::time::Instant::now() < deadline {
        interval.tick().await;
        let occupied = coordinator.buckets().occupied();
        metric!(gauge("stress.buckets.occupied") = occupied as u64);
        peak.fetch_max(occupied, Ordering::Relaxed);
    }
}

fn report(workload: &ParsedWorkload, task_durations: &DDSketch, duration: Duration) {
    let i = workload.index;
    let concurrency = workload.concurrency;

    let ops = task_durations.count();
    let ops_ps = ops as f32 / duration.as_secs_f32();
    println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");

    if ops > 0 {
        let quantile = |q| {
            let secs = task_durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let p50 = quantile(0.5);
        let p90 = quantile(0.9);
        let p99 = quantile(0.99);
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    let outcomes = &workload.outcomes;
    let requests = outcomes.requests.load(Ordering::Relaxed);
    let computations = outcomes.computations.load(Ordering::Relaxed);
    let factory_errors = outcomes.factory_errors.load(Ordering::Relaxed);
    let collision_errors = outcomes.collision_errors.load(Ordering::Relaxed);
    let other_errors = outcomes.other_errors.load(Ordering::Relaxed);
    println!("  requests: {requests}; computations: {computations}");
    println!(
        "  errors: {factory_errors} factory, {collision_errors} collisions, {other_errors} other"
    );
}
