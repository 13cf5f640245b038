//! Semaphore-backed admission control.
//!
//! [`Backpressure`] caps how many callers may hold a permit at once and keeps
//! counters for how many are waiting, active, or were turned away.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

pub struct Backpressure {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    waiting_count: Arc<AtomicUsize>,
    peak_active: Arc<AtomicUsize>,
    rejected_count: AtomicU64,
    total_count: AtomicU64,
}

impl Backpressure {
    /// A limit of zero is raised to one so acquire can never block forever.
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            waiting_count: Arc::new(AtomicUsize::new(0)),
            peak_active: Arc::new(AtomicUsize::new(0)),
            rejected_count: AtomicU64::new(0),
            total_count: AtomicU64::new(0),
        }
    }

    /// Wait for a permit. Waiters are served in FIFO order.
    pub async fn acquire(&self) -> BackpressurePermit {
        self.total_count.fetch_add(1, Ordering::SeqCst);
        let waiting = WaitingGuard::enter(Arc::clone(&self.waiting_count));

        let permit = Arc::clone(&self.semaphore).acquire_owned().await;
        drop(waiting);

        self.granted(permit.ok())
    }

    /// Take a permit only if one is free right now.
    pub fn try_acquire(&self) -> Option<BackpressurePermit> {
        self.total_count.fetch_add(1, Ordering::SeqCst);

        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Some(self.granted(Some(permit))),
            Err(_) => {
                self.rejected_count.fetch_add(1, Ordering::SeqCst);
                None
            }
        }
    }

    fn granted(&self, permit: Option<OwnedSemaphorePermit>) -> BackpressurePermit {
        let active = self.active_count();
        self.peak_active.fetch_max(active, Ordering::SeqCst);
        trace!(active, max = self.max_concurrent, "backpressure.permit_granted");
        BackpressurePermit {
            _permit: permit,
            acquired_at: Instant::now(),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting_count.load(Ordering::SeqCst)
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected_count.load(Ordering::SeqCst)
    }

    pub fn total_count(&self) -> u64 {
        self.total_count.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> usize {
        self.max_concurrent
            .saturating_sub(self.semaphore.available_permits())
    }

    /// Highest number of permits held at the same time so far.
    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    /// Current load as a percentage of the limit (0-100).
    pub fn load_percentage(&self) -> u8 {
        let active = self.active_count();
        ((active as f64 / self.max_concurrent as f64) * 100.0) as u8
    }

    pub fn stats(&self) -> BackpressureStats {
        BackpressureStats {
            max_concurrent: self.max_concurrent,
            available_permits: self.available_permits(),
            waiting_count: self.waiting_count(),
            active_count: self.active_count(),
            peak_active: self.peak_active(),
            rejected_count: self.rejected_count(),
            total_count: self.total_count(),
            load_percentage: self.load_percentage(),
        }
    }
}

/// Decrements the waiting counter even if the acquiring future is dropped.
struct WaitingGuard(Arc<AtomicUsize>);

impl WaitingGuard {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Held for the duration of a guarded section; dropping it frees the slot.
pub struct BackpressurePermit {
    _permit: Option<OwnedSemaphorePermit>,
    acquired_at: Instant,
}

impl BackpressurePermit {
    pub fn held_duration(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressureStats {
    pub max_concurrent: usize,
    pub available_permits: usize,
    pub waiting_count: usize,
    pub active_count: usize,
    pub peak_active: usize,
    pub rejected_count: u64,
    pub total_count: u64,
    pub load_percentage: u8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn acquire_up_to_limit() {
        let bp = Backpressure::new(2);

        let _permit1 = bp.acquire().await;
        let _permit2 = bp.acquire().await;

        assert_eq!(bp.active_count(), 2);
        assert_eq!(bp.available_permits(), 0);
        assert_eq!(bp.load_percentage(), 100);
    }

    #[tokio::test]
    async fn try_acquire_rejects_when_full() {
        let bp = Backpressure::new(1);

        let permit = bp.try_acquire();
        assert!(permit.is_some());
        assert!(bp.try_acquire().is_none());
        assert_eq!(bp.rejected_count(), 1);

        drop(permit);
        assert!(bp.try_acquire().is_some());
        assert_eq!(bp.total_count(), 3);
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let bp = Arc::new(Backpressure::new(1));
        let held = bp.acquire().await;

        let waiter = {
            let bp = Arc::clone(&bp);
            tokio::spawn(async move {
                let _permit = bp.acquire().await;
            })
        };

        sleep(Duration::from_millis(20)).await;
        assert_eq!(bp.waiting_count(), 1);
        assert!(!waiter.is_finished());

        drop(held);
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish once the permit is released")
            .unwrap();
        assert_eq!(bp.waiting_count(), 0);
    }

    #[tokio::test]
    async fn dropped_waiter_does_not_leak_waiting_count() {
        let bp = Backpressure::new(1);
        let _held = bp.acquire().await;

        let result = timeout(Duration::from_millis(20), bp.acquire()).await;
        assert!(result.is_err());
        assert_eq!(bp.waiting_count(), 0);
    }

    #[tokio::test]
    async fn permit_reports_time_held() {
        let bp = Backpressure::new(1);
        let permit = bp.acquire().await;
        sleep(Duration::from_millis(20)).await;
        assert!(permit.held_duration() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn zero_limit_is_raised_to_one() {
        let bp = Backpressure::new(0);
        assert_eq!(bp.max_concurrent(), 1);
        assert!(bp.try_acquire().is_some());
    }

    #[tokio::test]
    async fn stats_track_peak_concurrency() {
        let bp = Backpressure::new(3);
        let a = bp.acquire().await;
        let b = bp.acquire().await;
        drop(a);
        drop(b);
        let _c = bp.acquire().await;

        let stats = bp.stats();
        assert_eq!(stats.peak_active, 2);
        assert_eq!(stats.active_count, 1);
        assert_eq!(stats.available_permits, 2);
        assert_eq!(stats.total_count, 3);
    }
}
