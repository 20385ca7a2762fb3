use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::*;
use crate::config::DEFAULT_STALENESS_INTERVAL;
use crate::source::ManualSource;

struct TestTransformer {
    ty: TransformerType,
    id: usize,
    renders: u32,
    fail_reset: bool,
    panic_reset: bool,
}

impl Transformer for TestTransformer {
    fn transformer_type(&self) -> &TransformerType {
        &self.ty
    }

    fn reset(&mut self) -> anyhow::Result<()> {
        if self.fail_reset {
            anyhow::bail!("stylesheet state corrupted");
        }
        if self.panic_reset {
            panic!("reset on a torn-down stylesheet");
        }
        self.renders = 0;
        Ok(())
    }
}

#[derive(Default)]
struct TestFactory {
    created: AtomicUsize,
    delay: Duration,
    broken_theme: Option<&'static str>,
}

impl TestFactory {
    fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransformerFactory for TestFactory {
    type Transformer = TestTransformer;

    async fn create(&self, ty: &TransformerType) -> anyhow::Result<TestTransformer> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.broken_theme == Some(ty.theme()) {
            anyhow::bail!("theme {} has no stylesheet", ty);
        }
        let id = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TestTransformer {
            ty: ty.clone(),
            id,
            renders: 0,
            fail_reset: false,
            panic_reset: false,
        })
    }
}

fn no_sweep(max: usize) -> PoolConfig {
    PoolConfig::new(max).with_cache_time(Duration::ZERO)
}

fn pool_with(
    config: PoolConfig,
    factory: TestFactory,
) -> (TransformerPool<TestFactory>, Arc<ManualSource>) {
    let source = Arc::new(ManualSource::at(SystemTime::UNIX_EPOCH));
    let pool = TransformerPool::new(config, factory, source.clone()).unwrap();
    (pool, source)
}

fn pool(config: PoolConfig) -> (TransformerPool<TestFactory>, Arc<ManualSource>) {
    pool_with(config, TestFactory::default())
}

fn theme(name: &str) -> TransformerType {
    TransformerType::new(name)
}

async fn checkout(
    pool: &TransformerPool<TestFactory>,
    ty: &TransformerType,
) -> Checkout<TestFactory> {
    pool.acquire(ty, &CancellationToken::new())
        .await
        .unwrap()
        .expect("not cancelled")
}

#[tokio::test]
async fn release_then_acquire_reuses_instance() {
    let (pool, _) = pool(no_sweep(1));
    let ty = theme("default");

    let mut first = checkout(&pool, &ty).await;
    assert!(!first.is_reused());
    first.renders = 3;
    let first_id = first.id;
    assert_eq!(pool.release(first), ReleaseOutcome::Recycled);

    let second = checkout(&pool, &ty).await;
    assert!(second.is_reused());
    assert_eq!(second.id, first_id);
    assert_eq!(second.renders, 0, "reset() runs on release");
    assert_eq!(pool.factory().created(), 1);
    assert_eq!(pool.total_created(), 1);
    second.release();
}

#[tokio::test]
async fn types_do_not_share_instances() {
    let (pool, _) = pool(no_sweep(2));

    checkout(&pool, &theme("a")).await.release();
    let b = checkout(&pool, &theme("b")).await;
    assert!(!b.is_reused());
    assert_eq!(b.transformer_type(), &theme("b"));
    assert_eq!(pool.factory().created(), 2);
    b.release();
}

#[tokio::test]
async fn in_use_and_available_track_checkouts() {
    let (pool, _) = pool(no_sweep(3));

    let a = checkout(&pool, &theme("x")).await;
    let b = checkout(&pool, &theme("x")).await;
    assert_eq!(pool.in_use(), 2);
    assert_eq!(pool.available(), 1);

    a.release();
    assert_eq!(pool.in_use(), 1);
    b.release();
    assert_eq!(pool.in_use(), 0);
    assert_eq!(pool.available(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn capacity_never_exceeded_and_no_double_issue() {
    const MAX: usize = 3;
    let (pool, _) = pool(no_sweep(MAX));
    let live = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let issued = Arc::new(StdMutex::new(HashSet::new()));

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let pool = pool.clone();
            let live = Arc::clone(&live);
            let peak = Arc::clone(&peak);
            let issued = Arc::clone(&issued);
            tokio::spawn(async move {
                let ty = theme(if i % 2 == 0 { "even" } else { "odd" });
                for _ in 0..20 {
                    let t = checkout(&pool, &ty).await;
                    assert!(issued.lock().unwrap().insert(t.id), "instance issued twice");

                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    assert!(pool.in_use() <= MAX);
                    tokio::task::yield_now().await;
                    live.fetch_sub(1, Ordering::SeqCst);

                    assert!(issued.lock().unwrap().remove(&t.id));
                    t.release();
                }
            })
        })
        .collect();

    for result in futures::future::join_all(tasks).await {
        result.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= MAX);
    assert_eq!(pool.in_use(), 0);
    // Per type, instances never outnumber the peak of concurrent checkouts.
    assert!(pool.factory().created() <= 2 * MAX);
}

#[tokio::test(start_paused = true)]
async fn second_acquire_waits_for_release() {
    let (pool, _) = pool(no_sweep(1));
    let held = checkout(&pool, &theme("default")).await;

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { checkout(&pool, &theme("default")).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());
    assert_eq!(pool.in_use(), 1);

    let held_id = held.id;
    held.release();
    let got = waiter.await.unwrap();
    assert!(got.is_reused());
    assert_eq!(got.id, held_id);
    got.release();
}

#[tokio::test(start_paused = true)]
async fn release_wakes_exactly_one_waiter() {
    let (pool, _) = pool(no_sweep(1));
    let held = checkout(&pool, &theme("default")).await;

    let spawn_waiter = || {
        let pool = pool.clone();
        tokio::spawn(async move { checkout(&pool, &theme("default")).await })
    };
    let w1 = spawn_waiter();
    let w2 = spawn_waiter();

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!w1.is_finished() && !w2.is_finished());

    held.release();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let finished = [w1.is_finished(), w2.is_finished()];
    assert_eq!(finished.iter().filter(|f| **f).count(), 1);
    assert_eq!(pool.in_use(), 1);

    let (done, pending) = if finished[0] { (w1, w2) } else { (w2, w1) };
    done.await.unwrap().release();
    pending.await.unwrap().release();
    assert_eq!(pool.in_use(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_acquire_returns_none_without_side_effects() {
    let (pool, _) = pool(no_sweep(1));
    let held = checkout(&pool, &theme("default")).await;
    let cancel = CancellationToken::new();

    let waiter = {
        let pool = pool.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { pool.acquire(&theme("default"), &cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let result = waiter.await.unwrap().unwrap();
    assert!(result.is_none());
    assert_eq!(pool.in_use(), 1);
    assert_eq!(pool.factory().created(), 1);

    held.release();
    assert_eq!(pool.in_use(), 0);
    assert_eq!(pool.available(), 1);
}

#[tokio::test(start_paused = true)]
async fn dropping_acquire_mid_construction_returns_capacity() {
    let factory = TestFactory {
        delay: Duration::from_millis(100),
        ..TestFactory::default()
    };
    let (pool, _) = pool_with(no_sweep(1), factory);

    let attempt = tokio::time::timeout(
        Duration::from_millis(10),
        pool.acquire(&theme("slow"), &CancellationToken::new()),
    )
    .await;
    assert!(attempt.is_err());
    assert_eq!(pool.in_use(), 0);
    assert_eq!(pool.available(), 1);

    let t = checkout(&pool, &theme("slow")).await;
    assert_eq!(pool.in_use(), 1);
    t.release();
}

#[tokio::test(start_paused = true)]
async fn staleness_flush_forces_new_construction() {
    let (pool, source) = pool(no_sweep(1));
    let ty = theme("default");

    checkout(&pool, &ty).await.release();
    assert_eq!(pool.factory().created(), 1);

    source.advance(Duration::from_secs(1));
    tokio::time::advance(DEFAULT_STALENESS_INTERVAL + Duration::from_millis(1)).await;

    let fresh = checkout(&pool, &ty).await;
    assert!(!fresh.is_reused());
    assert_eq!(pool.factory().created(), 2);
    assert_eq!(pool.total_created(), 1, "counter restarts after a flush");
    assert_eq!(pool.stats().generation, 1);
    fresh.release();
}

#[tokio::test(start_paused = true)]
async fn staleness_is_checked_at_most_once_per_interval() {
    let (pool, source) = pool(no_sweep(1));
    let ty = theme("default");

    checkout(&pool, &ty).await.release();
    source.advance(Duration::from_secs(1));
    tokio::time::advance(Duration::from_secs(1)).await;

    let t = checkout(&pool, &ty).await;
    assert!(t.is_reused(), "source not polled inside the interval");
    t.release();

    tokio::time::advance(DEFAULT_STALENESS_INTERVAL).await;
    let t = checkout(&pool, &ty).await;
    assert!(!t.is_reused());
    t.release();
}

#[tokio::test(start_paused = true)]
async fn unchanged_source_keeps_spool() {
    let (pool, _) = pool(no_sweep(1));
    let ty = theme("default");

    checkout(&pool, &ty).await.release();
    tokio::time::advance(DEFAULT_STALENESS_INTERVAL * 3).await;

    let t = checkout(&pool, &ty).await;
    assert!(t.is_reused());
    t.release();
}

#[tokio::test]
async fn instance_checked_out_across_flush_is_discarded() {
    let (pool, _) = pool(no_sweep(2));
    let ty = theme("default");

    let old = checkout(&pool, &ty).await;
    pool.flush();

    // Recreates the idle list for the type under the new generation.
    let current = checkout(&pool, &ty).await;
    assert!(!current.is_reused());

    assert_eq!(old.release(), ReleaseOutcome::Discarded(DiscardReason::Stale));
    assert_eq!(current.release(), ReleaseOutcome::Recycled);
    assert_eq!(pool.in_use(), 0);
    assert_eq!(pool.stats().spooled(), 1);
}

#[tokio::test(start_paused = true)]
async fn sweeper_evicts_unused_lists() {
    let (pool, _) = pool(PoolConfig::new(1).with_cache_time(Duration::from_millis(100)));
    let ty = theme("default");
    assert!(pool.is_sweeping());

    checkout(&pool, &ty).await.release();
    assert_eq!(pool.stats().spooled(), 1);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(pool.stats().idle_for(&ty).is_none());

    let t = checkout(&pool, &ty).await;
    assert!(!t.is_reused());
    assert_eq!(pool.factory().created(), 2);
    t.release();
}

#[tokio::test(start_paused = true)]
async fn never_released_list_survives_sweep() {
    let (pool, _) = pool(PoolConfig::new(1).with_cache_time(Duration::from_millis(100)));
    let ty = theme("default");

    let t = checkout(&pool, &ty).await;
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert!(pool.stats().idle_for(&ty).is_some());
    assert_eq!(t.release(), ReleaseOutcome::Recycled);
}

#[tokio::test(start_paused = true)]
async fn release_into_evicted_list_is_discarded() {
    let (pool, _) = pool(PoolConfig::new(2).with_cache_time(Duration::from_millis(100)));
    let ty = theme("default");

    let a = checkout(&pool, &ty).await;
    let b = checkout(&pool, &ty).await;
    a.release();

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(b.release(), ReleaseOutcome::Discarded(DiscardReason::Evicted));
    assert_eq!(pool.in_use(), 0);
    assert_eq!(pool.available(), 2);
}

#[tokio::test]
async fn evict_unused_is_noop_without_cache_time() {
    let (pool, _) = pool(no_sweep(1));
    assert!(!pool.is_sweeping());
    checkout(&pool, &theme("default")).await.release();
    assert_eq!(pool.evict_unused(), 0);
    assert_eq!(pool.stats().spooled(), 1);
}

#[tokio::test]
async fn failed_reset_discards_but_returns_capacity() {
    let (pool, _) = pool(no_sweep(1));
    let ty = theme("default");

    let mut t = checkout(&pool, &ty).await;
    t.fail_reset = true;
    assert_eq!(
        pool.release(t),
        ReleaseOutcome::Discarded(DiscardReason::ResetFailed)
    );
    assert_eq!(pool.in_use(), 0);

    let next = checkout(&pool, &ty).await;
    assert!(!next.is_reused());
    next.release();
}

#[tokio::test]
async fn construction_failure_is_an_error_and_frees_the_slot() {
    let factory = TestFactory {
        broken_theme: Some("broken"),
        ..TestFactory::default()
    };
    let (pool, _) = pool_with(no_sweep(1), factory);

    let err = pool
        .acquire(&theme("broken"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_construction());
    assert!(err.to_string().contains("broken"));
    assert_eq!(pool.in_use(), 0);
    assert_eq!(pool.available(), 1);

    checkout(&pool, &theme("default")).await.release();
}

#[tokio::test]
async fn dropped_checkout_returns_capacity() {
    let (pool, _) = pool(no_sweep(1));
    let ty = theme("default");

    drop(checkout(&pool, &ty).await);
    assert_eq!(pool.in_use(), 0);
    assert_eq!(pool.available(), 1);

    let t = checkout(&pool, &ty).await;
    assert!(!t.is_reused(), "abandoned instance is not pooled");
    t.release();
}

#[tokio::test]
async fn foreign_release_is_discarded() {
    let (pool_a, _) = pool(no_sweep(1));
    let (pool_b, _) = pool(no_sweep(1));

    let t = checkout(&pool_a, &theme("default")).await;
    assert_eq!(
        pool_b.release(t),
        ReleaseOutcome::Discarded(DiscardReason::Foreign)
    );
    assert_eq!(pool_a.in_use(), 0);
    assert_eq!(pool_b.in_use(), 0);
    assert_eq!(pool_a.stats().spooled(), 0);
}

#[tokio::test]
async fn try_acquire_fails_at_capacity() {
    let (pool, _) = pool(no_sweep(1));
    let held = pool.try_acquire(&theme("default")).await.unwrap();

    let err = pool.try_acquire(&theme("default")).await.unwrap_err();
    assert!(matches!(err, PoolError::AtCapacity { max: 1 }));

    held.release();
    pool.try_acquire(&theme("default")).await.unwrap().release();
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_pool() {
    let (pool, _) = pool(PoolConfig::new(1).with_cache_time(Duration::from_millis(100)));
    let held = checkout(&pool, &theme("default")).await;

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(&theme("default"), &CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    pool.shutdown();
    assert!(pool.is_closed());
    assert!(matches!(waiter.await.unwrap(), Err(PoolError::Closed)));
    assert!(matches!(
        pool.try_acquire(&theme("default")).await,
        Err(PoolError::Closed)
    ));

    assert_eq!(held.release(), ReleaseOutcome::Discarded(DiscardReason::Closed));
    assert_eq!(pool.in_use(), 0);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!pool.is_sweeping());
}

#[tokio::test]
async fn zero_concurrency_is_rejected() {
    let source = Arc::new(ManualSource::new());
    let result = TransformerPool::new(PoolConfig::new(0), TestFactory::default(), source);
    assert!(matches!(result, Err(ConfigError::ZeroConcurrency)));
}

#[test]
fn sweeping_pool_needs_runtime() {
    let source = Arc::new(ManualSource::new());
    let result = TransformerPool::new(PoolConfig::new(1), TestFactory::default(), source.clone());
    assert!(matches!(result, Err(ConfigError::NoRuntime)));

    assert!(TransformerPool::new(no_sweep(1), TestFactory::default(), source).is_ok());
}

#[tokio::test]
async fn stats_snapshot_reflects_state() {
    let (pool, _) = pool(no_sweep(2));

    checkout(&pool, &theme("b")).await.release();
    checkout(&pool, &theme("a")).await.release();
    let held = checkout(&pool, &theme("a")).await;

    let stats = pool.stats();
    assert_eq!(stats.pool_id, pool.id());
    assert_eq!(stats.in_use, 1);
    assert_eq!(stats.available, 1);
    assert_eq!(stats.total_created, 2);
    assert_eq!(stats.generation, 0);

    let themes: Vec<&str> = stats.idle.iter().map(|i| i.ty.theme()).collect();
    assert_eq!(themes, ["a", "b"]);
    assert_eq!(stats.idle_for(&theme("a")).unwrap().spooled, 0);
    assert_eq!(stats.idle_for(&theme("b")).unwrap().spooled, 1);
    assert!(stats.idle_for(&theme("b")).unwrap().last_used_at.is_some());

    held.release();
}

#[tokio::test]
async fn panicking_reset_still_returns_capacity() {
    let (pool, _) = pool(no_sweep(1));
    let ty = theme("default");

    let mut held = checkout(&pool, &ty).await;
    held.panic_reset = true;
    let released = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| held.release()));
    assert!(released.is_err());

    assert_eq!(pool.in_use(), 0);
    assert_eq!(pool.available(), 1);
    assert_eq!(pool.stats().available, 1);

    let next = checkout(&pool, &ty).await;
    assert!(!next.is_reused(), "the panicked instance is gone");
    assert_eq!(next.release(), ReleaseOutcome::Recycled);
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_construction_discards_result() {
    let factory = TestFactory {
        delay: Duration::from_millis(100),
        ..TestFactory::default()
    };
    let (pool, _) = pool_with(no_sweep(1), factory);

    let building = {
        let pool = pool.clone();
        tokio::spawn(async move { checkout(&pool, &theme("default")).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    pool.shutdown();

    let built = building.await.unwrap();
    assert!(pool.stats().idle.is_empty());
    assert_eq!(built.release(), ReleaseOutcome::Discarded(DiscardReason::Closed));
    assert_eq!(pool.stats().spooled(), 0);
    assert_eq!(pool.in_use(), 0);
}

/// Records the pool's in-use count from inside `modified()`, which would
/// deadlock if the state lock were held during the read.
#[derive(Default)]
struct ObservingSource {
    pool: std::sync::OnceLock<TransformerPool<TestFactory>>,
    reads: StdMutex<Vec<usize>>,
}

impl ModificationSource for ObservingSource {
    fn modified(&self) -> Option<SystemTime> {
        if let Some(pool) = self.pool.get() {
            self.reads.lock().unwrap().push(pool.in_use());
        }
        Some(SystemTime::UNIX_EPOCH)
    }
}

#[tokio::test]
async fn source_is_read_outside_the_state_lock() {
    let source = Arc::new(ObservingSource::default());
    let pool = TransformerPool::new(no_sweep(2), TestFactory::default(), source.clone()).unwrap();
    assert!(source.pool.set(pool.clone()).is_ok());

    let held = checkout(&pool, &theme("default")).await;
    assert_eq!(*source.reads.lock().unwrap(), vec![1]);

    // Within the staleness interval the source is not read again.
    checkout(&pool, &theme("default")).await.release();
    assert_eq!(source.reads.lock().unwrap().len(), 1);
    held.release();
}
