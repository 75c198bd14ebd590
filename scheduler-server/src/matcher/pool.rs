//! Per-device fan-out with an explicit concurrency limit

use futures::future::join_all;
use std::future::Future;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    /// At most `n` futures in flight
    Bounded(usize),
    Unbounded,
}

/// Run every future and collect the outputs in input order
pub async fn run_all<T, Fut>(futures: impl IntoIterator<Item = Fut>, concurrency: Concurrency) -> Vec<T>
where
    Fut: Future<Output = T>,
{
    match concurrency {
        Concurrency::Unbounded => join_all(futures).await,
        Concurrency::Bounded(limit) => {
            let semaphore = Semaphore::new(limit.max(1));
            let semaphore = &semaphore;
            join_all(futures.into_iter().map(|fut| async move {
                // Never closed, acquire only fails after close()
                let _permit = semaphore.acquire().await.ok();
                fut.await
            }))
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn track(active: &AtomicUsize, peak: &AtomicUsize, value: usize) -> usize {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        active.fetch_sub(1, Ordering::SeqCst);
        value * 2
    }

    #[tokio::test]
    async fn test_bounded_limits_in_flight() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let out = run_all(
            (0..25).map(|i| track(&active, &peak, i)),
            Concurrency::Bounded(10),
        )
        .await;
        assert_eq!(out, (0..25).map(|i| i * 2).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 10);
    }

    #[tokio::test]
    async fn test_unbounded_runs_everything_at_once() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let out = run_all((0..25).map(|i| track(&active, &peak, i)), Concurrency::Unbounded).await;
        assert_eq!(out.len(), 25);
        assert_eq!(peak.load(Ordering::SeqCst), 25);
    }

    #[tokio::test]
    async fn test_zero_limit_still_makes_progress() {
        let out = run_all((0..3).map(|i| async move { i }), Concurrency::Bounded(0)).await;
        assert_eq!(out, vec![0, 1, 2]);
    }
}
