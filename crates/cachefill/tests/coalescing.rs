use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use cachefill::{
    BucketTable, CacheStore, Coordinator, FillError, FillResult, MAX_COLLISION_RETRIES,
    MemoryEntry, MemoryStore,
};
use cachefill_test::{CollidingKey, Counter, Gate, settle, setup, wait_until};

type Store = MemoryStore<String, String>;
type CollidingStore = MemoryStore<CollidingKey, String>;

fn coordinator() -> Coordinator<Store> {
    Coordinator::new(Store::with_capacity(1024))
}

fn colliding_coordinator() -> Coordinator<CollidingStore> {
    Coordinator::new(CollidingStore::with_capacity(1024))
}

/// Spawns a caller whose factory counts its invocation once `gate` opens.
fn spawn_counting(
    coordinator: &Coordinator<Store>,
    key: &str,
    gate: &Gate,
    counter: &Counter,
) -> tokio::task::JoinHandle<FillResult<String>> {
    let coordinator = coordinator.clone();
    let key = key.to_owned();
    let gate = gate.clone();
    let counter = counter.clone();

    tokio::spawn(async move {
        coordinator
            .get_or_create(key, move |_entry| {
                Box::pin(async move {
                    gate.wait().await;
                    Ok(counter.increment().to_string())
                })
            })
            .await
    })
}

#[tokio::test]
async fn test_concurrent_callers_share_computation() {
    setup();

    let coordinator = coordinator();
    let gate = Gate::new();
    let counter = Counter::new();

    let first = spawn_counting(&coordinator, "K", &gate, &counter);
    let second = spawn_counting(&coordinator, "K", &gate, &counter);
    wait_until(|| coordinator.buckets().occupied() == 1).await;
    settle().await;
    assert_eq!(coordinator.buckets().occupied(), 1);
    assert!(!first.is_finished());
    assert!(!second.is_finished());

    gate.open();
    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();

    assert_eq!(first, "1");
    assert_eq!(second, "1");
    assert_eq!(counter.get(), 1);
    assert_eq!(
        coordinator.store().try_get(&"K".into()).as_deref(),
        Some("1")
    );
    assert_eq!(coordinator.buckets().occupied(), 0);

    // later callers are served from the store
    let third = spawn_counting(&coordinator, "K", &gate, &counter);
    assert_eq!(third.await.unwrap().unwrap(), "1");
    assert_eq!(counter.get(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_concurrent_callers() {
    setup();

    let coordinator = coordinator();
    let counter = Counter::new();

    let callers: Vec<_> = (0..64)
        .map(|_| {
            let coordinator = coordinator.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                coordinator
                    .get_or_create("K".into(), move |_entry| {
                        Box::pin(async move {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(counter.increment().to_string())
                        })
                    })
                    .await
            })
        })
        .collect();

    for caller in callers {
        assert_eq!(caller.await.unwrap().unwrap(), "1");
    }
    assert_eq!(counter.get(), 1);
    assert_eq!(coordinator.buckets().occupied(), 0);
}

#[tokio::test]
async fn test_waiters_share_failure() {
    setup();

    let coordinator = coordinator();
    let gate = Gate::new();
    let counter = Counter::new();
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();

    let callers: Vec<_> = (0..2)
        .map(|_| {
            let coordinator = coordinator.clone();
            let gate = gate.clone();
            let counter = counter.clone();
            let started = started_tx.clone();
            tokio::spawn(async move {
                coordinator
                    .get_or_create("K".into(), move |_entry| {
                        Box::pin(async move {
                            started.send(()).ok();
                            gate.wait().await;
                            counter.increment();
                            Err(anyhow!("upstream unavailable"))
                        })
                    })
                    .await
            })
        })
        .collect();
    started_rx.recv().await.unwrap();
    settle().await;
    gate.open();

    let mut errors = Vec::new();
    for caller in callers {
        errors.push(caller.await.unwrap().unwrap_err());
    }
    assert_eq!(counter.get(), 1);

    let (Some(first), Some(second)) = (errors[0].factory_error(), errors[1].factory_error()) else {
        panic!("expected factory errors, got {errors:?}");
    };
    // both callers observe the very same error
    assert!(std::ptr::eq(first, second));
    assert_eq!(first.to_string(), "upstream unavailable");

    // failures are not cached, the next caller computes again
    assert!(!coordinator.store().contains(&"K".into()));
    assert_eq!(coordinator.buckets().occupied(), 0);
    let retry = spawn_counting(&coordinator, "K", &gate, &counter);
    assert_eq!(retry.await.unwrap().unwrap(), "2");
}

#[tokio::test]
async fn test_colliding_keys_are_computed_separately() {
    setup();

    let coordinator = colliding_coordinator();
    let gate = Gate::new();
    let calls_a = Counter::new();
    let calls_b = Counter::new();
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();

    let a = tokio::spawn({
        let coordinator = coordinator.clone();
        let gate = gate.clone();
        let calls = calls_a.clone();
        async move {
            coordinator
                .get_or_create(CollidingKey::new("A"), move |_entry| {
                    Box::pin(async move {
                        started_tx.send(()).ok();
                        gate.wait().await;
                        calls.increment();
                        Ok("a".into())
                    })
                })
                .await
        }
    });
    started_rx.recv().await.unwrap();

    let b = tokio::spawn({
        let coordinator = coordinator.clone();
        let calls = calls_b.clone();
        async move {
            coordinator
                .get_or_create(CollidingKey::new("B"), move |_entry| {
                    Box::pin(async move {
                        calls.increment();
                        Ok("b".into())
                    })
                })
                .await
        }
    });
    settle().await;

    // B sits in the occupied bucket until A is done
    assert!(!b.is_finished());
    assert_eq!(calls_b.get(), 0);
    assert_eq!(coordinator.buckets().occupied(), 1);

    gate.open();
    assert_eq!(a.await.unwrap().unwrap(), "a");
    assert_eq!(b.await.unwrap().unwrap(), "b");

    assert_eq!(calls_a.get(), 1);
    assert_eq!(calls_b.get(), 1);
    let store = coordinator.store();
    assert_eq!(store.try_get(&CollidingKey::new("A")).as_deref(), Some("a"));
    assert_eq!(store.try_get(&CollidingKey::new("B")).as_deref(), Some("b"));
}

#[tokio::test]
async fn test_collision_ignores_foreign_failure() {
    setup();

    let coordinator = colliding_coordinator();
    let gate = Gate::new();
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();

    let a = tokio::spawn({
        let coordinator = coordinator.clone();
        let gate = gate.clone();
        async move {
            coordinator
                .get_or_create(CollidingKey::new("A"), move |_entry| {
                    Box::pin(async move {
                        started_tx.send(()).ok();
                        gate.wait().await;
                        Err(anyhow!("A is broken"))
                    })
                })
                .await
        }
    });
    started_rx.recv().await.unwrap();

    let b = tokio::spawn({
        let coordinator = coordinator.clone();
        async move {
            coordinator
                .get_or_create(CollidingKey::new("B"), |_entry| {
                    Box::pin(async move { Ok("b".into()) })
                })
                .await
        }
    });
    settle().await;
    gate.open();

    let err = a.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), "factory");
    assert_eq!(b.await.unwrap().unwrap(), "b");
}

#[tokio::test]
async fn test_collision_retries_exhausted() {
    setup();

    let coordinator = colliding_coordinator();
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();

    // three keys forced into one bucket, whose computations finish one at a time
    let keys = ["A", "B", "C"];

    let mut gates = Vec::new();
    let mut callers = Vec::new();
    for name in keys {
        let gate = Gate::new();
        gates.push((name, gate.clone()));

        let coordinator = coordinator.clone();
        let started = started_tx.clone();
        callers.push(tokio::spawn(async move {
            coordinator
                .get_or_create(CollidingKey::new(name), move |_entry| {
                    Box::pin(async move {
                        started.send(name).ok();
                        gate.wait().await;
                        Ok(name.to_lowercase())
                    })
                })
                .await
        }));
    }

    // a finished owner keeps its bucket until its waiters have seen the outcome, so the
    // remaining callers collide with it once more before the next one gets to claim
    for _ in 0..keys.len() - 1 {
        let owner = started_rx.recv().await.unwrap();
        let (_, gate) = gates.iter().find(|(name, _)| *name == owner).unwrap();
        gate.open();
    }

    let mut computed = 0;
    let mut exhausted = 0;
    for caller in callers {
        match caller.await.unwrap() {
            Ok(_) => computed += 1,
            Err(FillError::TooManyCollisions { attempts }) => {
                assert_eq!(attempts, MAX_COLLISION_RETRIES + 1);
                exhausted += 1;
            }
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    assert_eq!(computed, 2);
    assert!(exhausted >= 1);
    assert_eq!(computed + exhausted, keys.len());
    assert_eq!(coordinator.buckets().occupied(), 0);
}

#[tokio::test]
async fn test_bucket_is_reused() {
    setup();

    let buckets = Arc::new(BucketTable::with_len(1).unwrap());
    let coordinator = Coordinator::with_buckets(Store::with_capacity(16), buckets);

    for key in ["A", "B", "C"] {
        let value = coordinator
            .get_or_create(key.into(), move |_entry| {
                Box::pin(async move { Ok(key.to_lowercase()) })
            })
            .await
            .unwrap();
        assert_eq!(value, key.to_lowercase());
        assert_eq!(coordinator.buckets().occupied(), 0);
    }

    let err = coordinator
        .get_or_create("D".into(), |_entry| {
            Box::pin(async move { Err(anyhow!("nope")) })
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "factory");
    assert_eq!(coordinator.buckets().occupied(), 0);
}

#[tokio::test]
async fn test_cancelled_caller_does_not_cancel_computation() {
    setup();

    let coordinator = coordinator();
    let gate = Gate::new();
    let counter = Counter::new();

    // the owner stops waiting, but the computation it started keeps running
    let owner = tokio::time::timeout(Duration::from_millis(20), {
        let gate = gate.clone();
        let counter = counter.clone();
        coordinator.get_or_create("K".into(), move |_entry| {
            Box::pin(async move {
                gate.wait().await;
                Ok(counter.increment().to_string())
            })
        })
    })
    .await;
    assert!(owner.is_err());
    assert_eq!(coordinator.buckets().occupied(), 1);

    // a waiter giving up does not affect anybody else either
    let impatient = tokio::time::timeout(
        Duration::from_millis(20),
        coordinator.get_or_create("K".into(), |_entry| {
            Box::pin(async move { Ok("impatient".into()) })
        }),
    )
    .await;
    assert!(impatient.is_err());

    let patient = spawn_counting(&coordinator, "K", &gate, &counter);
    settle().await;
    gate.open();

    assert_eq!(patient.await.unwrap().unwrap(), "1");
    assert_eq!(counter.get(), 1);
    assert_eq!(
        coordinator.store().try_get(&"K".into()).as_deref(),
        Some("1")
    );

    // nobody owns the computation anymore, it still gives up its bucket
    wait_until(|| coordinator.buckets().occupied() == 0).await;
}

#[tokio::test]
async fn test_panicking_factory() {
    setup();

    let coordinator = coordinator();

    let err = coordinator
        .get_or_create("K".into(), |_entry| {
            Box::pin(async move {
                let explode = true;
                if explode {
                    panic!("factory exploded");
                }
                Ok(String::new())
            })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, FillError::Abandoned));
    assert!(!coordinator.store().contains(&"K".into()));
    assert_eq!(coordinator.buckets().occupied(), 0);

    let value = coordinator
        .get_or_create("K".into(), |_entry| {
            Box::pin(async move { Ok("recovered".into()) })
        })
        .await
        .unwrap();
    assert_eq!(value, "recovered");
}

fn expiring(
    counter: Counter,
) -> impl for<'e> FnOnce(&'e mut MemoryEntry<String, String>) -> BoxFuture<'e, anyhow::Result<String>>
+ Send
+ 'static {
    move |entry| {
        entry.set_time_to_live(Duration::from_millis(50));
        Box::pin(async move { Ok(counter.increment().to_string()) })
    }
}

#[tokio::test]
async fn test_factory_sets_expiration() {
    setup();

    let coordinator = coordinator();
    let counter = Counter::new();

    let value = coordinator
        .get_or_create("K".into(), expiring(counter.clone()))
        .await
        .unwrap();
    assert_eq!(value, "1");
    assert!(coordinator.store().contains(&"K".into()));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(coordinator.store().try_get(&"K".into()), None);

    let value = coordinator
        .get_or_create("K".into(), expiring(counter.clone()))
        .await
        .unwrap();
    assert_eq!(value, "2");
}
