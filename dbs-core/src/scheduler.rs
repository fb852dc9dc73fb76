//! Process-wide timer service: delayed one-shot tasks with a cancellation handle.
//!
//! Every task moves from pending to exactly one of fired or cancelled through a
//! single atomic transition, so a cancel racing the timer either suppresses the
//! task entirely or loses and leaves it to run once.

use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Shared scheduler. Cheap to clone; all clones use the same runtime.
#[derive(Clone, Debug)]
pub struct Scheduler {
    handle: Handle,
}

impl Scheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Scheduler on the runtime of the calling task. Panics outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Run `task` once after `delay`, unless cancelled first.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> ScheduledTask
    where
        F: FnOnce() + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(PENDING));
        let timer_state = state.clone();
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if timer_state
                .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                task();
            }
        });
        ScheduledTask { state, join }
    }
}

/// Handle to a scheduled task, owned by the action that scheduled it.
#[derive(Debug)]
pub struct ScheduledTask {
    state: Arc<AtomicU8>,
    join: JoinHandle<()>,
}

impl ScheduledTask {
    /// Cancel the task. Returns true only for the call that actually prevented it from running.
    pub fn cancel(&self) -> bool {
        let won = self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.join.abort();
        }
        won
    }

    #[cfg(test)]
    fn has_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }

    #[cfg(test)]
    fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }
}

/// Runs actions concurrently on the runtime. No ordering between submitted actions.
#[derive(Clone, Debug)]
pub struct Executor {
    handle: Handle,
}

impl Executor {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    pub fn execute<A>(&self, action: A) -> JoinHandle<()>
    where
        A: crate::action::Action,
    {
        self.spawn(action.run())
    }

    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(fut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let sched = Scheduler::current();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let task = sched.schedule(Duration::from_millis(500), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(task.has_fired());
        assert!(!task.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_fire_suppresses() {
        let sched = Scheduler::current();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let task = sched.schedule(Duration::from_millis(500), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(task.cancel());
        assert!(!task.cancel());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(task.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_cancel_never_double_runs() {
        let sched = Scheduler::current();
        for _ in 0..200 {
            let hits = Arc::new(AtomicUsize::new(0));
            let h = hits.clone();
            let task = sched.schedule(Duration::ZERO, move || {
                h.fetch_add(1, Ordering::SeqCst);
            });
            tokio::task::yield_now().await;
            let cancelled = task.cancel();
            tokio::time::sleep(Duration::from_millis(5)).await;
            let ran = hits.load(Ordering::SeqCst);
            assert_eq!(ran + usize::from(cancelled), 1);
        }
    }
}
