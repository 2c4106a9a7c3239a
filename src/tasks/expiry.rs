//! Expiry Scheduler
//!
//! One background wake-up per table that sleeps until the earliest pending
//! deadline, sweeps, and re-arms itself for the next one. While nothing in the
//! table can expire it is parked and holds no timer.
//!
//! Inside a Tokio runtime the wake-up is a task parked on a `Notify`; without
//! one it is a dedicated thread parked on a `Condvar`.
//!
//! ```text
//!            arm(d) / earlier deadline
//!   Idle  ─────────────────────────────▶  Armed(d)
//!    ▲                                       │ deadline reached
//!    │ no finite deadline left / disarm      ▼
//!    └─────────────────────────────────── sweep ──▶ Armed(next)
//! ```

use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Something the scheduler can sweep.
pub trait Sweep: Send + Sync + 'static {
    /// Removes everything expired at `now` and returns the earliest remaining
    /// deadline, if any.
    fn sweep(&self, now: Instant) -> Option<Instant>;

    /// Name used in log lines.
    fn label(&self) -> &str;
}

/// What carries the wake-up for a table.
#[derive(Debug)]
enum Driver {
    Task(JoinHandle<()>),
    Thread(thread::JoinHandle<()>),
}

impl Driver {
    fn is_finished(&self) -> bool {
        match self {
            Driver::Task(task) => task.is_finished(),
            Driver::Thread(handle) => handle.is_finished(),
        }
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    /// None = idle.
    deadline: Option<Instant>,
    /// Bumped on every disarm so an in-flight sweep cannot re-arm stale state.
    generation: u64,
    driver: Option<Driver>,
    shutdown: bool,
}

impl SchedulerState {
    /// Takes the earliest remaining deadline after a sweep, unless a disarm
    /// happened meanwhile or something earlier was armed.
    fn rearm_after_sweep(&mut self, generation: u64, next: Option<Instant>) {
        if let Some(next) = next {
            if self.generation == generation && self.deadline.map_or(true, |armed| next < armed) {
                self.deadline = Some(next);
            }
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<SchedulerState>,
    /// Wakes the Tokio task.
    wake: Notify,
    /// Wakes the fallback thread.
    wakeup: Condvar,
}

impl Shared {
    fn notify(&self) {
        self.wake.notify_one();
        self.wakeup.notify_one();
    }
}

// == Expiry Scheduler ==
/// Single re-armable wake-up for one table.
///
/// The driver is started lazily on the first [`arm`](Self::arm): a task on the
/// current Tokio runtime if there is one, otherwise a dedicated thread. It is
/// stopped when the scheduler is dropped.
#[derive(Debug, Default)]
pub struct ExpiryScheduler {
    shared: Arc<Shared>,
}

impl ExpiryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    // == Arm ==
    /// Makes sure a wake-up happens no later than `deadline`.
    ///
    /// If the scheduler is idle or armed for a later instant it is re-armed for
    /// `deadline`; an earlier armed deadline is left alone.
    pub fn arm<S: Sweep>(&self, deadline: Instant, target: &Arc<S>) {
        {
            let mut state = self.shared.state.lock();
            self.ensure_running(&mut state, target);

            if state.deadline.is_some_and(|armed| armed <= deadline) {
                return;
            }
            state.deadline = Some(deadline);
        }

        let in_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64;
        trace!(table = target.label(), in_ms, "Expiry scheduler armed");
        self.shared.notify();
    }

    // == Disarm ==
    /// Returns to idle, cancelling any pending wake-up.
    pub fn disarm(&self) {
        {
            let mut state = self.shared.state.lock();
            state.deadline = None;
            state.generation = state.generation.wrapping_add(1);
        }
        self.shared.notify();
    }

    // == Deadline ==
    /// The instant of the pending wake-up, or None when idle.
    pub fn deadline(&self) -> Option<Instant> {
        self.shared.state.lock().deadline
    }

    /// Returns true while a wake-up is pending.
    pub fn is_armed(&self) -> bool {
        self.deadline().is_some()
    }

    fn ensure_running<S: Sweep>(&self, state: &mut SchedulerState, target: &Arc<S>) {
        if state.driver.as_ref().is_some_and(|driver| !driver.is_finished()) {
            return;
        }

        let weak = Arc::downgrade(target);
        let shared = self.shared.clone();

        if let Ok(handle) = Handle::try_current() {
            state.driver = Some(Driver::Task(handle.spawn(expiry_loop(weak, shared))));
            debug!(table = target.label(), "Expiry task started");
            return;
        }

        let spawned = thread::Builder::new()
            .name(format!("expiry-{}", target.label()))
            .spawn(move || expiry_thread(weak, shared));
        match spawned {
            Ok(handle) => {
                state.driver = Some(Driver::Thread(handle));
                debug!(table = target.label(), "No Tokio runtime; expiry thread started");
            }
            Err(err) => {
                state.driver = None;
                warn!(
                    table = target.label(),
                    error = %err,
                    "Failed to start expiry thread; expired entries are only dropped on access"
                );
            }
        }
    }
}

impl Drop for ExpiryScheduler {
    fn drop(&mut self) {
        let driver = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.driver.take()
        };
        // The thread is not joined: the last table handle may be dropped on it.
        if let Some(Driver::Task(task)) = driver {
            task.abort();
        }
        self.shared.notify();
    }
}

/// The Tokio scheduler loop. Holds only a weak reference to its table.
async fn expiry_loop<S: Sweep>(target: Weak<S>, shared: Arc<Shared>) {
    loop {
        let armed = shared.state.lock().deadline;

        let Some(deadline) = armed else {
            shared.wake.notified().await;
            continue;
        };

        tokio::select! {
            _ = tokio::time::sleep_until(deadline.into()) => {}
            _ = shared.wake.notified() => continue,
        }

        let generation = {
            let mut state = shared.state.lock();
            if state.deadline != Some(deadline) {
                continue;
            }
            // Idle while sweeping; arms from re-entrant callbacks land here.
            state.deadline = None;
            state.generation
        };

        let Some(table) = target.upgrade() else {
            return;
        };
        let next = table.sweep(Instant::now());
        drop(table);

        shared.state.lock().rearm_after_sweep(generation, next);
    }
}

/// The thread scheduler loop, used when no Tokio runtime is available.
fn expiry_thread<S: Sweep>(target: Weak<S>, shared: Arc<Shared>) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            return;
        }

        let Some(deadline) = state.deadline else {
            shared.wakeup.wait(&mut state);
            continue;
        };

        if Instant::now() < deadline {
            shared.wakeup.wait_until(&mut state, deadline);
            continue;
        }

        // Idle while sweeping; arms from re-entrant callbacks land here.
        state.deadline = None;
        let generation = state.generation;

        // Sweep (and a possible last drop of the table) run without the lock.
        let swept = MutexGuard::unlocked(&mut state, || {
            target.upgrade().map(|table| table.sweep(Instant::now()))
        });

        match swept {
            Some(next) => state.rearm_after_sweep(generation, next),
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Sweeps a fixed list of deadlines.
    struct Deadlines {
        pending: Mutex<Vec<Instant>>,
        sweeps: AtomicUsize,
    }

    impl Deadlines {
        fn new(pending: Vec<Instant>) -> Arc<Self> {
            Arc::new(Self {
                pending: Mutex::new(pending),
                sweeps: AtomicUsize::new(0),
            })
        }
    }

    impl Sweep for Deadlines {
        fn sweep(&self, now: Instant) -> Option<Instant> {
            self.sweeps.fetch_add(1, Ordering::SeqCst);
            let mut pending = self.pending.lock();
            pending.retain(|deadline| *deadline > now);
            pending.iter().min().copied()
        }

        fn label(&self) -> &str {
            "test"
        }
    }

    #[tokio::test]
    async fn test_scheduler_starts_idle() {
        let scheduler = ExpiryScheduler::new();
        assert!(!scheduler.is_armed());
        assert!(scheduler.deadline().is_none());
    }

    #[tokio::test]
    async fn test_arm_keeps_earliest_deadline() {
        let target = Deadlines::new(Vec::new());
        let scheduler = ExpiryScheduler::new();
        let now = Instant::now();

        scheduler.arm(now + Duration::from_secs(60), &target);
        scheduler.arm(now + Duration::from_secs(10), &target);
        scheduler.arm(now + Duration::from_secs(30), &target);

        assert_eq!(scheduler.deadline(), Some(now + Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_wakes_and_rearms_until_idle() {
        let now = Instant::now();
        let first = now + Duration::from_millis(50);
        let second = now + Duration::from_millis(120);
        let target = Deadlines::new(vec![first, second]);
        let scheduler = ExpiryScheduler::new();

        scheduler.arm(first, &target);

        tokio::time::sleep(Duration::from_millis(90)).await;
        assert_eq!(target.pending.lock().len(), 1);
        assert_eq!(scheduler.deadline(), Some(second));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(target.pending.lock().is_empty());
        assert!(!scheduler.is_armed(), "Scheduler should be idle once nothing is pending");
        assert_eq!(target.sweeps.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_earlier_deadline_preempts_sleep() {
        let now = Instant::now();
        let late = now + Duration::from_secs(30);
        let soon = now + Duration::from_millis(40);
        let target = Deadlines::new(vec![late, soon]);
        let scheduler = ExpiryScheduler::new();

        scheduler.arm(late, &target);
        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.arm(soon, &target);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(target.sweeps.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.deadline(), Some(late));
    }

    #[tokio::test]
    async fn test_disarm_cancels_pending_wakeup() {
        let deadline = Instant::now() + Duration::from_millis(30);
        let target = Deadlines::new(vec![deadline]);
        let scheduler = ExpiryScheduler::new();

        scheduler.arm(deadline, &target);
        scheduler.disarm();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(target.sweeps.load(Ordering::SeqCst), 0);
        assert!(!scheduler.is_armed());
    }

    #[tokio::test]
    async fn test_task_exits_when_target_dropped() {
        let target = Deadlines::new(Vec::new());
        let scheduler = ExpiryScheduler::new();

        scheduler.arm(Instant::now() + Duration::from_millis(20), &target);
        drop(target);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let finished = scheduler
            .shared
            .state
            .lock()
            .driver
            .as_ref()
            .is_some_and(|driver| driver.is_finished());
        assert!(finished, "Task should stop once its table is gone");
    }

    #[test]
    fn test_without_runtime_thread_sweeps_and_idles() {
        let now = Instant::now();
        let first = now + Duration::from_millis(30);
        let second = now + Duration::from_millis(80);
        let target = Deadlines::new(vec![first, second]);
        let scheduler = ExpiryScheduler::new();

        scheduler.arm(first, &target);
        assert!(matches!(
            scheduler.shared.state.lock().driver,
            Some(Driver::Thread(_))
        ));

        std::thread::sleep(Duration::from_millis(200));

        assert!(target.pending.lock().is_empty());
        assert_eq!(target.sweeps.load(Ordering::SeqCst), 2);
        assert!(!scheduler.is_armed(), "Scheduler should be idle once nothing is pending");
    }

    #[test]
    fn test_without_runtime_earlier_deadline_wakes_thread() {
        let now = Instant::now();
        let late = now + Duration::from_secs(30);
        let soon = now + Duration::from_millis(40);
        let target = Deadlines::new(vec![late, soon]);
        let scheduler = ExpiryScheduler::new();

        scheduler.arm(late, &target);
        std::thread::sleep(Duration::from_millis(10));
        scheduler.arm(soon, &target);

        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(target.sweeps.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.deadline(), Some(late));
    }

    #[test]
    fn test_without_runtime_disarm_cancels_wakeup() {
        let deadline = Instant::now() + Duration::from_millis(30);
        let target = Deadlines::new(vec![deadline]);
        let scheduler = ExpiryScheduler::new();

        scheduler.arm(deadline, &target);
        scheduler.disarm();

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(target.sweeps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_thread_stops_when_scheduler_dropped() {
        let target = Deadlines::new(Vec::new());
        let scheduler = ExpiryScheduler::new();
        scheduler.arm(Instant::now() + Duration::from_secs(30), &target);

        let handle = match scheduler.shared.state.lock().driver.take() {
            Some(Driver::Thread(handle)) => handle,
            other => panic!("expected a thread driver, got {other:?}"),
        };
        drop(scheduler);

        handle.join().unwrap();
    }
}
