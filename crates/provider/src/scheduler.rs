//! Priority-aware admission to a bounded worker pool.
//!
//! HIGH, NORMAL and LOW work share `worker_count` permits. A waiting task is
//! admitted only when no strictly higher priority task is waiting, so LOW work
//! progresses only once nothing above it is queued. CRITICAL work runs on its
//! own lane and never waits behind the shared pool.

use market_data_core::{RequestPriority, SchedulerConfig};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub available_workers: usize,
    pub available_critical_lanes: usize,
    pub waiting_low: usize,
    pub waiting_normal: usize,
    pub waiting_high: usize,
}

pub struct PriorityScheduler {
    workers: Arc<Semaphore>,
    critical: Arc<Semaphore>,
    waiting: Mutex<[usize; 4]>,
    notify: Notify,
}

/// Counts a task as waiting until it is admitted or cancelled.
struct WaitTicket<'a> {
    scheduler: &'a PriorityScheduler,
    priority: RequestPriority,
}

impl<'a> WaitTicket<'a> {
    fn new(scheduler: &'a PriorityScheduler, priority: RequestPriority) -> Self {
        scheduler.waiting.lock()[priority.index()] += 1;
        Self { scheduler, priority }
    }
}

impl Drop for WaitTicket<'_> {
    fn drop(&mut self) {
        {
            let mut waiting = self.scheduler.waiting.lock();
            let slot = &mut waiting[self.priority.index()];
            *slot = slot.saturating_sub(1);
        }
        self.scheduler.notify.notify_waiters();
    }
}

/// Holds a worker permit while the task runs and wakes waiters on release.
struct RunningGuard<'a> {
    scheduler: &'a PriorityScheduler,
    permit: Option<OwnedSemaphorePermit>,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        drop(self.permit.take());
        self.scheduler.notify.notify_waiters();
    }
}

impl PriorityScheduler {
    #[must_use]
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            workers: Arc::new(Semaphore::new(config.worker_count.max(1))),
            critical: Arc::new(Semaphore::new(config.critical_lanes.max(1))),
            waiting: Mutex::new([0; 4]),
            notify: Notify::new(),
        }
    }

    fn higher_waiting(&self, priority: RequestPriority) -> bool {
        let waiting = self.waiting.lock();
        waiting[priority.index() + 1..].iter().any(|&n| n > 0)
    }

    /// Runs `task` once admitted at `priority`.
    pub async fn run<F, T>(&self, priority: RequestPriority, task: F) -> T
    where
        F: Future<Output = T>,
    {
        if priority.is_critical() {
            // lane semaphore is never closed
            let _lane = Arc::clone(&self.critical).acquire_owned().await.ok();
            return task.await;
        }

        let ticket = WaitTicket::new(self, priority);
        let permit = loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.higher_waiting(priority) {
                if let Ok(permit) = Arc::clone(&self.workers).try_acquire_owned() {
                    break permit;
                }
            }
            trace!(priority = %priority, "Waiting for worker");
            notified.await;
        };
        drop(ticket);

        let _running = RunningGuard {
            scheduler: self,
            permit: Some(permit),
        };
        task.await
    }

    #[must_use]
    pub fn pending(&self, priority: RequestPriority) -> usize {
        if priority.is_critical() {
            return 0;
        }
        self.waiting.lock()[priority.index()]
    }

    #[must_use]
    pub fn available_workers(&self) -> usize {
        self.workers.available_permits()
    }

    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let waiting = *self.waiting.lock();
        SchedulerStats {
            available_workers: self.workers.available_permits(),
            available_critical_lanes: self.critical.available_permits(),
            waiting_low: waiting[RequestPriority::Low.index()],
            waiting_normal: waiting[RequestPriority::Normal.index()],
            waiting_high: waiting[RequestPriority::High.index()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    async fn until(cond: impl Fn() -> bool) {
        while !cond() {
            tokio::task::yield_now().await;
        }
    }

    fn single_worker() -> Arc<PriorityScheduler> {
        Arc::new(PriorityScheduler::new(
            &SchedulerConfig::default().with_worker_count(1),
        ))
    }

    #[tokio::test]
    async fn test_high_admitted_before_low() {
        let scheduler = single_worker();
        let (release, blocked) = oneshot::channel::<()>();
        let blocker = {
            let s = Arc::clone(&scheduler);
            tokio::spawn(async move {
                s.run(RequestPriority::Normal, async {
                    blocked.await.ok();
                })
                .await;
            })
        };
        until(|| scheduler.available_workers() == 0).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let spawn_at = |priority: RequestPriority, label: &'static str| {
            let s = Arc::clone(&scheduler);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                s.run(priority, async move { order.lock().push(label) }).await;
            })
        };

        let low = spawn_at(RequestPriority::Low, "low");
        until(|| scheduler.pending(RequestPriority::Low) == 1).await;
        let high = spawn_at(RequestPriority::High, "high");
        until(|| scheduler.pending(RequestPriority::High) == 1).await;

        release.send(()).unwrap();
        blocker.await.unwrap();
        high.await.unwrap();
        low.await.unwrap();

        assert_eq!(*order.lock(), vec!["high", "low"]);
        assert_eq!(scheduler.available_workers(), 1);
    }

    #[tokio::test]
    async fn test_critical_not_blocked_by_saturated_pool() {
        let scheduler = single_worker();
        let (_release, blocked) = oneshot::channel::<()>();
        let s = Arc::clone(&scheduler);
        let _blocker = tokio::spawn(async move {
            s.run(RequestPriority::Low, async {
                blocked.await.ok();
            })
            .await;
        });
        until(|| scheduler.available_workers() == 0).await;

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            scheduler.run(RequestPriority::Critical, async { 42 }),
        )
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_ticket() {
        let scheduler = single_worker();
        let (release, blocked) = oneshot::channel::<()>();
        let s = Arc::clone(&scheduler);
        let blocker = tokio::spawn(async move {
            s.run(RequestPriority::Normal, async {
                blocked.await.ok();
            })
            .await;
        });
        until(|| scheduler.available_workers() == 0).await;

        let waited = tokio::time::timeout(
            Duration::from_millis(20),
            scheduler.run(RequestPriority::High, async {}),
        )
        .await;
        assert!(waited.is_err());
        assert_eq!(scheduler.pending(RequestPriority::High), 0);

        release.send(()).unwrap();
        blocker.await.unwrap();
        scheduler.run(RequestPriority::Low, async {}).await;
    }
}
