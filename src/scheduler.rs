//! One-shot timer scheduling.
//!
//! Subscribers arm cutover timers through the [`Scheduler`] trait so the bus
//! is not tied to a particular clock. [`ThreadScheduler`] is the wall-clock
//! default; [`ManualScheduler`] is a virtual clock for deterministic tests.

use crossbeam_channel::{after, bounded, select};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::warn;

/// A task to run once when its timer fires.
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Schedules one-shot tasks.
pub trait Scheduler: Send + Sync {
    /// Run `task` once after `delay`, unless the returned handle is
    /// cancelled or dropped first.
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle;
}

/// Handle to a pending timer. Dropping the handle cancels the timer.
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl TimerHandle {
    /// Create a handle from a cancellation routine.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Cancel the timer. A cancelled task never runs.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("armed", &self.cancel.is_some())
            .finish()
    }
}

/// Wall-clock scheduler: each timer waits on its own short-lived thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadScheduler;

impl ThreadScheduler {
    /// Create a new wall-clock scheduler.
    pub fn new() -> Self {
        Self
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let (cancel_tx, cancel_rx) = bounded::<()>(1);

        let spawned = thread::Builder::new()
            .name("iambus-timer".to_string())
            .spawn(move || {
                let deadline = after(delay);
                select! {
                    // Either an explicit cancel or the handle being dropped.
                    recv(cancel_rx) -> _ => {}
                    recv(deadline) -> _ => task(),
                }
            });

        if let Err(e) = spawned {
            warn!(error = %e, ?delay, "failed to spawn timer thread; timer will not fire");
        }

        TimerHandle::new(move || {
            let _ = cancel_tx.try_send(());
        })
    }
}

struct PendingTimer {
    deadline: Duration,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    task: TimerTask,
}

#[derive(Default)]
struct ManualClock {
    now: Duration,
    next_seq: u64,
    pending: Vec<PendingTimer>,
}

/// Virtual-clock scheduler. Time only moves when [`advance`] is called.
///
/// [`advance`]: ManualScheduler::advance
#[derive(Clone, Default)]
pub struct ManualScheduler {
    clock: Arc<Mutex<ManualClock>>,
}

impl ManualScheduler {
    /// Create a scheduler whose clock starts at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.clock.lock().now
    }

    /// Number of armed, uncancelled timers.
    pub fn pending(&self) -> usize {
        self.clock
            .lock()
            .pending
            .iter()
            .filter(|t| !t.cancelled.load(Ordering::SeqCst))
            .count()
    }

    /// Move the clock forward by `by`, firing every timer that comes due in
    /// deadline order. Timers armed by a firing task with a deadline inside
    /// the window fire during the same call. Returns the number fired.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.clock.lock().now + by;
        let mut fired = 0;

        loop {
            let next = {
                let mut clock = self.clock.lock();
                clock
                    .pending
                    .retain(|t| !t.cancelled.load(Ordering::SeqCst));

                let due = clock
                    .pending
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.deadline <= target)
                    .min_by_key(|(_, t)| (t.deadline, t.seq))
                    .map(|(i, _)| i);

                match due {
                    Some(i) => {
                        let timer = clock.pending.swap_remove(i);
                        clock.now = clock.now.max(timer.deadline);
                        Some(timer)
                    }
                    None => {
                        clock.now = target;
                        None
                    }
                }
            };

            // Run outside the lock so the task may schedule again.
            match next {
                Some(timer) => {
                    (timer.task)();
                    fired += 1;
                }
                None => return fired,
            }
        }
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let mut clock = self.clock.lock();
            let seq = clock.next_seq;
            clock.next_seq += 1;
            let deadline = clock.now + delay;
            clock.pending.push(PendingTimer {
                deadline,
                seq,
                cancelled: Arc::clone(&cancelled),
                task,
            });
        }

        TimerHandle::new(move || cancelled.store(true, Ordering::SeqCst))
    }
}
