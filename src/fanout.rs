//! Bounded parallel fan-out.
//!
//! Control-plane rounds (readiness checks, liveness pings, signal
//! broadcasts) run through a worker pool of at most min(n, 3 × CPU)
//! concurrent calls; there is no unbounded fan-out.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::error;

/// Pool size for a fan-out over `n` targets: min(n, 3 × CPU), at least 1.
pub fn pool_size(n: usize) -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|c| c.get())
        .unwrap_or(1);
    n.min(cpus * 3).max(1)
}

/// Runs `f` over every item with at most `limit` concurrent executions.
///
/// Results are collected in completion order. A panicking task is logged
/// and its result omitted, leaving the other items unaffected.
pub async fn run_bounded<T, R, F, Fut>(items: Vec<T>, limit: usize, f: F) -> Vec<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = R> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut tasks: JoinSet<R> = JoinSet::new();

    for item in items {
        let semaphore = semaphore.clone();
        // The future is constructed eagerly but does no work until the
        // permit admits it.
        let call = f(item);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            call.await
        });
    }

    let mut results = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => error!(error = %e, "Fan-out task aborted"),
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_pool_size_bounds() {
        assert_eq!(pool_size(0), 1);
        assert_eq!(pool_size(1), 1);
        let cpus = std::thread::available_parallelism().unwrap().get();
        assert_eq!(pool_size(usize::MAX), cpus * 3);
    }

    #[tokio::test]
    async fn test_all_items_processed() {
        let results = run_bounded((0..20).collect(), 4, |n: i32| async move { n * 2 }).await;

        let mut results = results;
        results.sort();
        assert_eq!(results, (0..20).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let results = run_bounded(
            (0..16).collect::<Vec<i32>>(),
            3,
            |_n| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                }
            },
        )
        .await;

        assert_eq!(results.len(), 16);
        assert!(
            peak.load(Ordering::SeqCst) <= 3,
            "peak concurrency {} exceeded limit",
            peak.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_panic_leaves_siblings_unaffected() {
        let results = run_bounded((0..5).collect::<Vec<i32>>(), 2, |n| async move {
            if n == 2 {
                panic!("task blew up");
            }
            n
        })
        .await;

        assert_eq!(results.len(), 4);
        assert!(!results.contains(&2));
    }
}
