//! Scheduler & sources: dispatches journey invocations and replay events at
//! precise wall-clock offsets, independent of how long prior work takes
//! (`4.4`, `5`).

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tokio::time::{sleep_until, Duration, Instant};
use tracing::warn;

/// Counts down one unit per dispatched work item; the terminal barrier
/// awaits this latch with a safety margin.
pub struct CompletionLatch {
    remaining: AtomicI64,
    notify: Notify,
    cancelled: AtomicBool,
}

impl CompletionLatch {
    pub fn new(expected: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicI64::new(expected as i64),
            notify: Notify::new(),
            cancelled: AtomicBool::new(false),
        })
    }

    pub fn count_down(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) <= 1 {
            self.notify.notify_waiters();
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn is_drained(&self) -> bool {
        self.remaining.load(Ordering::Acquire) <= 0
    }

    /// Waits for every expected unit to count down (or cancellation), with
    /// a hard timeout. Returns `true` on a full drain, `false` on timeout
    /// or partial (cancelled) completion.
    pub async fn await_completion(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_drained() {
                return !self.is_cancelled();
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("completion latch timed out; abandoning in-flight work");
                return false;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(remaining) => {}
            }
        }
    }
}

/// Single-threaded fire-and-forget timer: `schedule(delay, task)` only ever
/// hands work off to the worker pool, never performs I/O itself, so a slow
/// request can never block a later wave's launch.
pub async fn schedule_at<F>(fire_at: Instant, worker_pool: Arc<Semaphore>, task: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    sleep_until(fire_at).await;
    let permit = worker_pool.clone().acquire_owned().await.expect("semaphore not closed");
    tokio::spawn(async move {
        task.await;
        drop(permit);
    });
}

/// Wave source: `R` journeys launched every second for `D` seconds.
pub struct WaveSource {
    pub rps: usize,
    pub duration_secs: u64,
}

impl WaveSource {
    /// Worker-pool size recommendation: `R · 8` so overlapping waves all
    /// make progress without the scheduler blocking on completion.
    pub fn recommended_pool_size(&self) -> usize {
        self.rps.saturating_mul(8).max(1)
    }

    /// Wave `w ∈ [1, D]` fires at `T0 + (w-1)·1s`.
    pub fn wave_fire_time(&self, t0: Instant, wave: u64) -> Instant {
        t0 + Duration::from_secs(wave.saturating_sub(1))
    }

    pub fn total_journeys(&self) -> usize {
        self.rps.saturating_mul(self.duration_secs as usize)
    }
}

/// Replay source: a pre-parsed stream of cumulative dispatch offsets.
pub struct ReplaySource {
    pub offsets_ms: Vec<u64>,
}

impl ReplaySource {
    pub fn dispatch_time(&self, t0: Instant, index: usize) -> Instant {
        t0 + Duration::from_millis(self.offsets_ms[index])
    }

    pub fn len(&self) -> usize {
        self.offsets_ms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets_ms.is_empty()
    }
}
