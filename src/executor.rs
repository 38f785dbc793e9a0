//! Event-loop abstraction and a deterministic single-threaded executor.
//!
//! All selection and deadline work runs on an event executor: a serial
//! execution context that can run closures immediately or after a delay.
//! Production embeddings supply their own implementation of
//! [`EventExecutor`]; tests use [`ManualExecutor`], which pairs a
//! [`VirtualClock`] with an explicit run queue so time only moves when the
//! test says so.
//!
//! # Timer Cancellation
//!
//! [`TimerHandle::cancel`] is idempotent and best-effort: a timer whose
//! closure has already started running cannot be recalled, only handles for
//! timers still queued suppress the closure.

use crate::time::{Time, TimeSource, VirtualClock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

/// A unit of work submitted to an event executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a scheduled timer.
///
/// Dropping the handle does not cancel the timer; call [`cancel`] to
/// suppress a closure that has not yet started running.
///
/// [`cancel`]: TimerHandle::cancel
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Creates a live handle.
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancels the timer. Idempotent; returns `true` if this call flipped
    /// the timer from live to cancelled.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    /// Whether the timer has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// A serial execution context with a clock and delayed scheduling.
///
/// Implementations must run submitted tasks one at a time. Tasks submitted
/// from within the event loop run after the current task completes, never
/// reentrantly.
pub trait EventExecutor: Send + Sync {
    /// Submits `task` to run as soon as possible.
    fn execute(&self, task: Task);

    /// Schedules `task` to run after `delay`. The returned handle can
    /// suppress the task until the moment it starts running.
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle;

    /// Whether the calling thread is currently inside this executor's loop.
    fn in_event_loop(&self) -> bool;

    /// The executor's current time.
    fn now(&self) -> Time;
}

/// A queued timer on the manual executor.
struct QueuedTimer {
    deadline: Time,
    /// Monotonic tiebreak so equal-deadline timers fire in submission order.
    seq: u64,
    handle: TimerHandle,
    task: Task,
}

/// Mutable state of a [`ManualExecutor`].
struct ManualState {
    queue: VecDeque<Task>,
    timers: Vec<QueuedTimer>,
    next_seq: u64,
    /// Thread currently draining the queue, if any.
    running_on: Option<ThreadId>,
}

struct ManualInner {
    clock: Arc<VirtualClock>,
    state: Mutex<ManualState>,
}

/// Deterministic single-threaded executor driven by a [`VirtualClock`].
///
/// Nothing runs until the test calls [`run_until_idle`] or [`advance`].
/// `advance` moves the clock, fires every timer that became due, and then
/// drains the immediate queue, which mirrors how a real event loop
/// interleaves timer expiry with ordinary tasks.
///
/// [`run_until_idle`]: ManualExecutor::run_until_idle
/// [`advance`]: ManualExecutor::advance
#[derive(Clone)]
pub struct ManualExecutor {
    inner: Arc<ManualInner>,
}

impl Default for ManualExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualExecutor {
    /// Creates an executor whose clock starts at [`Time::ZERO`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ManualInner {
                clock: Arc::new(VirtualClock::new()),
                state: Mutex::new(ManualState {
                    queue: VecDeque::new(),
                    timers: Vec::new(),
                    next_seq: 0,
                    running_on: None,
                }),
            }),
        }
    }

    /// The executor's clock, for tests that need to read or pre-set time.
    #[must_use]
    pub fn clock(&self) -> Arc<VirtualClock> {
        Arc::clone(&self.inner.clock)
    }

    /// Runs queued tasks (and already-due timers) until nothing is runnable.
    ///
    /// Returns the number of tasks that ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            self.promote_due_timers();
            let Some(task) = self.pop_task() else { break };
            task();
            self.exit_loop();
            ran += 1;
        }
        ran
    }

    /// Advances the clock by `delta`, firing every timer that becomes due,
    /// then drains the queue. Returns the number of tasks that ran.
    pub fn advance(&self, delta: Duration) -> usize {
        let nanos = u64::try_from(delta.as_nanos()).unwrap_or(u64::MAX);
        self.inner.clock.advance(nanos);
        self.run_until_idle()
    }

    /// Number of scheduled timers that have not fired and not been
    /// cancelled.
    #[must_use]
    pub fn pending_timer_count(&self) -> usize {
        let mut state = self.lock_state();
        state.timers.retain(|t| !t.handle.is_cancelled());
        state.timers.len()
    }

    /// Number of tasks waiting in the immediate queue.
    #[must_use]
    pub fn queued_task_count(&self) -> usize {
        self.lock_state().queue.len()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ManualState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Moves due, uncancelled timers onto the immediate queue in
    /// (deadline, submission) order.
    fn promote_due_timers(&self) {
        let now = self.inner.clock.now();
        let mut state = self.lock_state();
        let mut due: Vec<QueuedTimer> = Vec::new();
        let mut remaining: Vec<QueuedTimer> = Vec::new();
        for timer in state.timers.drain(..) {
            if timer.handle.is_cancelled() {
                continue;
            }
            if timer.deadline <= now {
                due.push(timer);
            } else {
                remaining.push(timer);
            }
        }
        state.timers = remaining;
        due.sort_by_key(|t| (t.deadline, t.seq));
        for timer in due {
            state.queue.push_back(timer.task);
        }
    }

    /// Pops the next task and marks this thread as inside the loop.
    fn pop_task(&self) -> Option<Task> {
        let mut state = self.lock_state();
        let task = state.queue.pop_front()?;
        state.running_on = Some(std::thread::current().id());
        Some(task)
    }

    fn exit_loop(&self) {
        self.lock_state().running_on = None;
    }
}

impl EventExecutor for ManualExecutor {
    fn execute(&self, task: Task) {
        self.lock_state().queue.push_back(task);
    }

    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let handle = TimerHandle::new();
        let nanos = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
        let deadline = self.inner.clock.now().saturating_add_nanos(nanos);
        let mut state = self.lock_state();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.timers.push(QueuedTimer {
            deadline,
            seq,
            handle: handle.clone(),
            task,
        });
        handle
    }

    fn in_event_loop(&self) -> bool {
        self.lock_state().running_on == Some(std::thread::current().id())
    }

    fn now(&self) -> Time {
        self.inner.clock.now()
    }
}

impl std::fmt::Debug for ManualExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("ManualExecutor")
            .field("now", &self.inner.clock.now())
            .field("queued", &state.queue.len())
            .field("timers", &state.timers.len())
            .finish()
    }
}
