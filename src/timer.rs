use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Tick,
    Restart,
}

struct PendingJob {
    id: u64,
    kind: TimerKind,
    handle: JoinHandle<()>,
}

/// One-shot delayed job slot. At most one job is pending; scheduling a new one
/// replaces the old. Cancelling only affects a job still waiting on its delay,
/// never one that has already started running.
#[derive(Clone)]
pub struct TaskTimer {
    runtime: Handle,
    pending: Arc<Mutex<Option<PendingJob>>>,
    next_id: Arc<AtomicU64>,
}

impl TaskTimer {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            pending: Arc::new(Mutex::new(None)),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn schedule<F, Fut>(&self, kind: TimerKind, delay: Duration, job: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let pending = self.pending.clone();

        let mut slot = lock(&self.pending);
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let owned = {
                let mut slot = lock(&pending);
                if slot.as_ref().is_some_and(|job| job.id == id) {
                    slot.take();
                    true
                } else {
                    false
                }
            };
            if owned {
                job().await;
            }
        });

        if let Some(previous) = slot.replace(PendingJob { id, kind, handle }) {
            previous.handle.abort();
            tracing::debug!(kind = ?previous.kind, "replaced pending timer job");
        }
    }

    pub fn cancel(&self) -> bool {
        match lock(&self.pending).take() {
            Some(job) => {
                job.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn scheduled(&self) -> Option<TimerKind> {
        lock(&self.pending).as_ref().map(|job| job.kind)
    }
}

fn lock(pending: &Mutex<Option<PendingJob>>) -> MutexGuard<'_, Option<PendingJob>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::{TaskTimer, TimerKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::runtime::Handle;
    use tokio::time::{sleep, Duration};

    #[tokio::test(start_paused = true)]
    async fn runs_job_after_delay_and_clears_slot() {
        let timer = TaskTimer::new(Handle::current());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        timer.schedule(TimerKind::Tick, Duration::from_millis(100), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(timer.scheduled(), Some(TimerKind::Tick));

        sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(timer.scheduled(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_pending_job() {
        let timer = TaskTimer::new(Handle::current());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        timer.schedule(TimerKind::Restart, Duration::from_millis(100), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(timer.cancel());
        assert!(!timer.cancel());
        sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_previous_job() {
        let timer = TaskTimer::new(Handle::current());
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = fired.clone();
            timer.schedule(TimerKind::Tick, Duration::from_millis(50), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
