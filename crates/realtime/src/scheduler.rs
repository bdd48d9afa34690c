// Timer abstraction for expiry and reconnect backoff.
//
// Production code runs on `TokioScheduler`; tests drive `ManualScheduler`
// so that virtual time advances deterministically.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tracing::warn;

use crate::lock;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait Scheduler: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Run `task` once after `delay` unless the returned handle is cancelled first.
    /// Never runs the task before returning, so callers may hold their own locks.
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle;
}

/// Cancellation token for a scheduled task. Cancelling twice is a no-op.
#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    abort: Option<tokio::task::AbortHandle>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

// ── Tokio ──────────────────────────────────────────────────────────

/// Wall-clock scheduler backed by `tokio::time`.
///
/// `now()` is derived from the tokio clock so paused-time tests stay coherent.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    origin: DateTime<Utc>,
    started: tokio::time::Instant,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self { origin: Utc::now(), started: tokio::time::Instant::now() }
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TokioScheduler {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed()).unwrap_or_default();
        self.origin + elapsed
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(delay_ms = delay.as_millis() as u64, "no tokio runtime; timer dropped");
            return TimerHandle { cancelled: Arc::new(AtomicBool::new(true)), abort: None };
        };

        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let join = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if !flag.load(Ordering::Acquire) {
                task();
            }
        });
        TimerHandle { cancelled, abort: Some(join.abort_handle()) }
    }
}

// ── Virtual time ───────────────────────────────────────────────────

struct Pending {
    cancelled: Arc<AtomicBool>,
    task: Task,
}

#[derive(Default)]
struct ManualState {
    elapsed: Duration,
    next_seq: u64,
    queue: BTreeMap<(Duration, u64), Pending>,
}

/// Scheduler whose clock only moves when `advance` is called.
pub struct ManualScheduler {
    origin: DateTime<Utc>,
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        let origin = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap_or_else(Utc::now);
        Self::starting_at(origin)
    }

    pub fn starting_at(origin: DateTime<Utc>) -> Self {
        Self { origin, state: Mutex::new(ManualState::default()) }
    }

    pub fn elapsed(&self) -> Duration {
        lock(&self.state).elapsed
    }

    /// Number of scheduled tasks that have neither run nor been cancelled.
    pub fn pending(&self) -> usize {
        lock(&self.state)
            .queue
            .values()
            .filter(|pending| !pending.cancelled.load(Ordering::Acquire))
            .count()
    }

    /// Move the clock forward, running every task that falls due in deadline
    /// order. Returns how many tasks ran.
    pub fn advance(&self, by: Duration) -> usize {
        let target = lock(&self.state).elapsed + by;
        let mut ran = 0;

        loop {
            let next = {
                let mut state = lock(&self.state);
                match state.queue.keys().next().copied() {
                    Some(key) if key.0 <= target => {
                        state.elapsed = state.elapsed.max(key.0);
                        state.queue.remove(&key)
                    }
                    _ => None,
                }
            };
            // The lock is released here so tasks can schedule more work.
            let Some(pending) = next else {
                break;
            };
            if !pending.cancelled.load(Ordering::Acquire) {
                (pending.task)();
                ran += 1;
            }
        }

        let mut state = lock(&self.state);
        state.elapsed = state.elapsed.max(target);
        ran
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ManualScheduler {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.elapsed()).unwrap_or_default();
        self.origin + elapsed
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut state = lock(&self.state);
        let due = state.elapsed + delay;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.insert((due, seq), Pending { cancelled: Arc::clone(&cancelled), task });
        TimerHandle { cancelled, abort: None }
    }
}

/// Wait `delay` on `scheduler`'s clock. Returns early if the timer is
/// dropped without firing, e.g. a [`TokioScheduler`] outside a runtime.
pub async fn sleep(scheduler: &dyn Scheduler, delay: Duration) {
    let (tx, rx) = tokio::sync::oneshot::channel();
    let _timer = scheduler.schedule(
        delay,
        Box::new(move || {
            let _ = tx.send(());
        }),
    );
    let _ = rx.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter_task(counter: &Arc<AtomicUsize>) -> Task {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn manual_tasks_run_only_when_due() {
        let scheduler = ManualScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.schedule(Duration::from_millis(100), counter_task(&counter));

        assert_eq!(scheduler.advance(Duration::from_millis(99)), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.advance(Duration::from_millis(1)), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn sleep_follows_the_manual_clock() {
        let scheduler = Arc::new(ManualScheduler::new());
        let clock = Arc::clone(&scheduler);
        let sleeper = tokio::spawn(async move { sleep(clock.as_ref(), Duration::from_millis(200)).await });
        while scheduler.pending() == 0 {
            tokio::task::yield_now().await;
        }

        scheduler.advance(Duration::from_millis(199));
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(!sleeper.is_finished());

        scheduler.advance(Duration::from_millis(1));
        sleeper.await.expect("sleeper should finish");
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn cancelled_task_never_runs() {
        let scheduler = ManualScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = scheduler.schedule(Duration::from_millis(10), counter_task(&counter));
        handle.cancel();
        handle.cancel();

        assert!(handle.is_cancelled());
        assert_eq!(scheduler.pending(), 0);
        scheduler.advance(Duration::from_secs(1));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn tasks_run_in_deadline_order_and_see_their_deadline_as_now() {
        let scheduler = Arc::new(ManualScheduler::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let start = scheduler.now();

        for delay in [300u64, 100, 200] {
            let seen = Arc::clone(&seen);
            let clock = Arc::clone(&scheduler);
            scheduler.schedule(
                Duration::from_millis(delay),
                Box::new(move || {
                    let at = (clock.now() - start).num_milliseconds();
                    seen.lock().expect("seen lock").push((delay, at));
                }),
            );
        }

        scheduler.advance(Duration::from_secs(1));
        assert_eq!(*seen.lock().expect("seen lock"), vec![(100, 100), (200, 200), (300, 300)]);
        assert_eq!((scheduler.now() - start).num_milliseconds(), 1_000);
    }

    #[test]
    fn tasks_scheduled_during_advance_run_if_due_in_window() {
        let scheduler = Arc::new(ManualScheduler::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let inner_counter = Arc::clone(&counter);
        let inner_scheduler = Arc::clone(&scheduler);
        scheduler.schedule(
            Duration::from_millis(10),
            Box::new(move || {
                inner_scheduler.schedule(Duration::from_millis(10), counter_task(&inner_counter));
            }),
        );

        assert_eq!(scheduler.advance(Duration::from_millis(20)), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_scheduler_fires_after_delay_unless_cancelled() {
        let scheduler = TokioScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let cancelled = Arc::new(AtomicUsize::new(0));

        scheduler.schedule(Duration::from_millis(50), counter_task(&fired));
        let handle = scheduler.schedule(Duration::from_millis(50), counter_task(&cancelled));
        handle.cancel();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(cancelled.load(Ordering::SeqCst), 0);
    }
}
