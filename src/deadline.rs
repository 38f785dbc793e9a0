//! Deadline scheduling with two-phase cancellation delivery.
//!
//! A [`DeadlineScheduler`] tracks one logical timeout for a request or
//! response exchange. It moves through a small state machine:
//!
//! ```text
//!            ┌──────────► Inactive ◄──┐ clear_timeout
//!   Init ────┤               ▲  │     │
//!            └──────────► Scheduled ──┘ set_timeout_nanos
//!                            │
//!                 timer fire │ finish_now
//!                            ▼
//!                        Finishing ──► Finished
//! ```
//!
//! Firing is two-phase: the [`when_cancelling`] signal completes while the
//! scheduler is `Finishing`, then the cancellation task runs, then the
//! [`when_cancelled`] signal completes with the identical cause reference.
//! Observers of the first signal can still read pre-cancellation state;
//! observers of the second see the fully settled scheduler.
//!
//! The timeout value is nanoseconds with `0` meaning "no deadline". Timeout
//! mutations come in three flavors, see [`TimeoutMode`].
//!
//! [`when_cancelling`]: DeadlineScheduler::when_cancelling
//! [`when_cancelled`]: DeadlineScheduler::when_cancelled

use crate::error::{Cause, Error};
use crate::executor::{EventExecutor, TimerHandle};
use crate::signal::{CancellationSignal, UnitSignal};
use crate::time::Time;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;
use tracing::trace;

/// Which side of an exchange a scheduler guards.
///
/// The role picks the default cause synthesized when a deadline fires with
/// no explicit cause: a server deadline means the request timed out, a
/// client deadline means the response did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Waiting on a peer's response.
    Client,
    /// Waiting on a caller's request.
    Server,
}

impl Role {
    fn default_cause(self) -> Cause {
        match self {
            Self::Client => Arc::new(Error::response_timed_out()),
            Self::Server => Arc::new(Error::request_timed_out()),
        }
    }
}

/// How [`DeadlineScheduler::set_timeout_nanos`] interprets its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutMode {
    /// The value is the total budget measured from `start()`. A budget
    /// already exhausted fires immediately; a value of `0` disables the
    /// deadline.
    SetFromStart,
    /// The value is the remaining budget measured from now. Must be
    /// positive.
    SetFromNow,
    /// The value adjusts the current budget, saturating. A disabled
    /// deadline is left disabled.
    Extend,
}

/// Scheduler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Created, not started.
    Init,
    /// Started with a live timer.
    Scheduled,
    /// Started with no deadline.
    Inactive,
    /// Cause recorded, first-phase observers running.
    Finishing,
    /// Settled.
    Finished,
}

/// Work to run when a deadline fires or the exchange is cancelled.
pub trait CancellationTask: Send + Sync {
    /// Whether the task still wants to run. Checked immediately before
    /// `run`; tasks whose exchange already completed return `false`.
    fn can_schedule(&self) -> bool {
        true
    }

    /// Runs the task with the cancellation cause.
    fn run(&self, cause: Cause);
}

/// A task that does nothing. Useful as a placeholder before the real task
/// is attached with [`DeadlineScheduler::update_task`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCancellationTask;

impl CancellationTask for NoopCancellationTask {
    fn run(&self, _cause: Cause) {}
}

struct FnTask<F>(F);

impl<F: Fn(Cause) + Send + Sync> CancellationTask for FnTask<F> {
    fn run(&self, cause: Cause) {
        (self.0)(cause);
    }
}

/// Wraps a closure as a [`CancellationTask`] that is always schedulable.
pub fn task_fn<F>(f: F) -> impl CancellationTask
where
    F: Fn(Cause) + Send + Sync,
{
    FnTask(f)
}

/// A `SetFromNow` requested before `start()`; re-based when started.
struct PendingFromNow {
    nanos: u64,
    /// When the request was made, if a clock was available.
    requested_at: Option<Time>,
}

struct Fields {
    state: State,
    /// Total budget in nanoseconds from `start_time`; `0` disables.
    timeout_nanos: u64,
    start_time: Time,
    executor: Option<Arc<dyn EventExecutor>>,
    timer: Option<TimerHandle>,
    task: Option<Box<dyn CancellationTask>>,
    cause: Option<Cause>,
    pending_from_now: Option<PendingFromNow>,
}

struct Inner {
    role: Role,
    fields: Mutex<Fields>,
    when_cancelling: OnceLock<CancellationSignal>,
    when_cancelled: OnceLock<CancellationSignal>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Fields> {
        match self.fields.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn cancelling_signal(&self) -> &CancellationSignal {
        self.when_cancelling.get_or_init(CancellationSignal::new)
    }

    fn cancelled_signal(&self) -> &CancellationSignal {
        self.when_cancelled.get_or_init(CancellationSignal::new)
    }
}

/// Deadline state machine for one request or response exchange.
///
/// Cloning is cheap; clones share the same state.
#[derive(Clone)]
pub struct DeadlineScheduler {
    inner: Arc<Inner>,
}

/// What a timeout mutation decided to do, applied after the lock drops.
enum TimeoutAction {
    Nothing,
    FireNow,
    Rearm { delay_nanos: u64, stale: Option<TimerHandle> },
}

impl DeadlineScheduler {
    /// Creates an unstarted scheduler. `timeout_nanos == 0` means no
    /// deadline.
    #[must_use]
    pub fn new(role: Role, timeout_nanos: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                role,
                fields: Mutex::new(Fields {
                    state: State::Init,
                    timeout_nanos,
                    start_time: Time::ZERO,
                    executor: None,
                    timer: None,
                    task: None,
                    cause: None,
                    pending_from_now: None,
                }),
                when_cancelling: OnceLock::new(),
                when_cancelled: OnceLock::new(),
            }),
        }
    }

    /// A client-side scheduler: the synthesized cause is "response timed
    /// out".
    #[must_use]
    pub fn of_client(timeout_nanos: u64) -> Self {
        Self::new(Role::Client, timeout_nanos)
    }

    /// A server-side scheduler: the synthesized cause is "request timed
    /// out".
    #[must_use]
    pub fn of_server(timeout_nanos: u64) -> Self {
        Self::new(Role::Server, timeout_nanos)
    }

    /// An already-settled scheduler carrying the role's default cause.
    ///
    /// Used where a completed exchange still hands out a scheduler handle.
    #[must_use]
    pub fn finished(role: Role) -> Self {
        let scheduler = Self::new(role, 0);
        let cause = role.default_cause();
        {
            let mut fields = scheduler.inner.lock();
            fields.state = State::Finished;
            fields.cause = Some(Arc::clone(&cause));
        }
        let _ = scheduler
            .inner
            .when_cancelling
            .set(CancellationSignal::completed(Arc::clone(&cause)));
        let _ = scheduler
            .inner
            .when_cancelled
            .set(CancellationSignal::completed(cause));
        scheduler
    }

    /// Binds the scheduler to its executor.
    ///
    /// # Panics
    ///
    /// Panics when called twice; the binding is permanent.
    pub fn init(&self, executor: Arc<dyn EventExecutor>) {
        let mut fields = self.inner.lock();
        assert!(
            fields.executor.is_none(),
            "DeadlineScheduler::init called twice"
        );
        fields.executor = Some(executor);
    }

    /// Starts the clock: captures the start time and arms the timer.
    ///
    /// A zero timeout leaves the scheduler `Inactive`. Calls after the
    /// first are no-ops.
    ///
    /// # Panics
    ///
    /// Panics when the scheduler was never bound with [`init`].
    ///
    /// [`init`]: DeadlineScheduler::init
    pub fn start(&self) {
        let action = {
            let mut fields = self.inner.lock();
            if fields.state != State::Init {
                return;
            }
            let now = match &fields.executor {
                Some(executor) => executor.now(),
                None => panic!("DeadlineScheduler::start before init"),
            };
            fields.start_time = now;
            if let Some(pending) = fields.pending_from_now.take() {
                let elapsed = pending
                    .requested_at
                    .map_or(0, |at| now.as_nanos().saturating_sub(at.as_nanos()));
                fields.timeout_nanos = pending.nanos.saturating_sub(elapsed).max(1);
            }
            if fields.timeout_nanos == 0 {
                fields.state = State::Inactive;
                TimeoutAction::Nothing
            } else {
                fields.state = State::Scheduled;
                TimeoutAction::Rearm {
                    delay_nanos: fields.timeout_nanos,
                    stale: None,
                }
            }
        };
        trace!(timeout_nanos = self.timeout_nanos(), "deadline started");
        self.apply(action);
    }

    /// Binds the executor, attaches the task, and starts, in one call.
    pub fn init_and_start(&self, executor: Arc<dyn EventExecutor>, task: impl CancellationTask + 'static) {
        self.init(executor);
        self.update_task(task);
        self.start();
    }

    /// Attaches or replaces the cancellation task.
    ///
    /// If the deadline already fired, the new task runs at once with the
    /// recorded cause, subject to its `can_schedule`.
    pub fn update_task(&self, task: impl CancellationTask + 'static) {
        let fired_cause = {
            let mut fields = self.inner.lock();
            match fields.state {
                State::Finishing | State::Finished => fields.cause.clone(),
                _ => {
                    fields.task = Some(Box::new(task));
                    return;
                }
            }
        };
        if let Some(cause) = fired_cause {
            if task.can_schedule() {
                task.run(cause);
            }
        }
    }

    /// Mutates the timeout. No-op once the deadline is firing or fired.
    ///
    /// `nanos` is signed to allow negative `Extend` adjustments; the other
    /// modes clamp negatives to zero.
    pub fn set_timeout_nanos(&self, mode: TimeoutMode, nanos: i64) {
        let action = {
            let mut fields = self.inner.lock();
            if matches!(fields.state, State::Finishing | State::Finished) {
                TimeoutAction::Nothing
            } else {
                match mode {
                    TimeoutMode::SetFromStart => self.set_from_start(&mut fields, nanos.max(0) as u64),
                    TimeoutMode::SetFromNow => self.set_from_now(&mut fields, nanos.max(1) as u64),
                    TimeoutMode::Extend => self.extend(&mut fields, nanos),
                }
            }
        };
        self.apply(action);
    }

    /// Disables the deadline: the timer is released and a `Scheduled`
    /// scheduler becomes `Inactive`. Idempotent.
    pub fn clear_timeout(&self) {
        let stale = {
            let mut fields = self.inner.lock();
            if matches!(fields.state, State::Finishing | State::Finished) {
                return;
            }
            fields.timeout_nanos = 0;
            fields.pending_from_now = None;
            if fields.state == State::Scheduled {
                fields.state = State::Inactive;
            }
            fields.timer.take()
        };
        if let Some(timer) = stale {
            timer.cancel();
        }
    }

    /// Releases the armed timer without touching the logical state.
    pub fn stop(&self) {
        let stale = self.inner.lock().timer.take();
        if let Some(timer) = stale {
            timer.cancel();
        }
    }

    /// Fires the deadline now with the role's default cause. Idempotent.
    pub fn finish_now(&self) {
        self.fire(None);
    }

    /// Fires the deadline now with an explicit cause. Idempotent; the first
    /// cause wins.
    pub fn finish_now_with(&self, cause: Cause) {
        self.fire(Some(cause));
    }

    /// Signal completed while the deadline is `Finishing`, before the
    /// cancellation task runs.
    #[must_use]
    pub fn when_cancelling(&self) -> CancellationSignal {
        self.inner.cancelling_signal().clone()
    }

    /// Signal completed after the cancellation task ran, with the identical
    /// cause reference as [`when_cancelling`].
    ///
    /// [`when_cancelling`]: DeadlineScheduler::when_cancelling
    #[must_use]
    pub fn when_cancelled(&self) -> CancellationSignal {
        self.inner.cancelled_signal().clone()
    }

    /// Cause-erased view of [`when_cancelling`].
    ///
    /// [`when_cancelling`]: DeadlineScheduler::when_cancelling
    #[must_use]
    pub fn when_timing_out(&self) -> UnitSignal {
        self.inner.cancelling_signal().unit()
    }

    /// Cause-erased view of [`when_cancelled`].
    ///
    /// [`when_cancelled`]: DeadlineScheduler::when_cancelled
    #[must_use]
    pub fn when_timed_out(&self) -> UnitSignal {
        self.inner.cancelled_signal().unit()
    }

    /// Current total budget in nanoseconds; `0` means no deadline.
    #[must_use]
    pub fn timeout_nanos(&self) -> u64 {
        self.inner.lock().timeout_nanos
    }

    /// When the clock started; [`Time::ZERO`] before `start()`.
    #[must_use]
    pub fn start_time(&self) -> Time {
        self.inner.lock().start_time
    }

    /// The recorded cause, once firing began.
    #[must_use]
    pub fn cause(&self) -> Option<Cause> {
        self.inner.lock().cause.clone()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    /// Whether the scheduler has settled.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state() == State::Finished
    }

    /// Whether the scheduler is between the two completion phases.
    #[must_use]
    pub fn is_finishing(&self) -> bool {
        self.state() == State::Finishing
    }

    fn set_from_start(&self, fields: &mut Fields, nanos: u64) -> TimeoutAction {
        if nanos == 0 {
            fields.timeout_nanos = 0;
            fields.pending_from_now = None;
            if fields.state == State::Scheduled {
                fields.state = State::Inactive;
            }
            return TimeoutAction::Rearm {
                delay_nanos: u64::MAX,
                stale: fields.timer.take(),
            };
        }
        fields.timeout_nanos = nanos;
        fields.pending_from_now = None;
        if fields.state == State::Init {
            return TimeoutAction::Nothing;
        }
        self.rearm_from_remaining(fields)
    }

    fn set_from_now(&self, fields: &mut Fields, nanos: u64) -> TimeoutAction {
        let now = fields.executor.as_ref().map(|e| e.now());
        if fields.state == State::Init {
            fields.pending_from_now = Some(PendingFromNow {
                nanos,
                requested_at: now,
            });
            fields.timeout_nanos = nanos;
            return TimeoutAction::Nothing;
        }
        // Started; the executor is bound.
        let now = match now {
            Some(now) => now,
            None => return TimeoutAction::Nothing,
        };
        let elapsed = now.as_nanos().saturating_sub(fields.start_time.as_nanos());
        fields.timeout_nanos = elapsed.saturating_add(nanos);
        self.rearm_from_remaining(fields)
    }

    fn extend(&self, fields: &mut Fields, adjustment: i64) -> TimeoutAction {
        if fields.state == State::Init {
            if let Some(pending) = &mut fields.pending_from_now {
                pending.nanos = pending.nanos.saturating_add_signed(adjustment);
            }
            fields.timeout_nanos = fields.timeout_nanos.saturating_add_signed(adjustment);
            return TimeoutAction::Nothing;
        }
        if fields.timeout_nanos == 0 {
            // No deadline to extend.
            return TimeoutAction::Nothing;
        }
        fields.timeout_nanos = fields.timeout_nanos.saturating_add_signed(adjustment);
        if fields.timeout_nanos == 0 {
            // The whole budget was taken away.
            return TimeoutAction::FireNow;
        }
        self.rearm_from_remaining(fields)
    }

    /// Recomputes the remaining budget and either re-arms or fires.
    ///
    /// Callers guarantee a positive `timeout_nanos`.
    fn rearm_from_remaining(&self, fields: &mut Fields) -> TimeoutAction {
        let Some(executor) = &fields.executor else {
            return TimeoutAction::Nothing;
        };
        let deadline = fields
            .start_time
            .as_nanos()
            .saturating_add(fields.timeout_nanos);
        let remaining = deadline.saturating_sub(executor.now().as_nanos());
        if remaining == 0 {
            return TimeoutAction::FireNow;
        }
        if fields.state == State::Inactive {
            fields.state = State::Scheduled;
        }
        TimeoutAction::Rearm {
            delay_nanos: remaining,
            stale: fields.timer.take(),
        }
    }

    fn apply(&self, action: TimeoutAction) {
        match action {
            TimeoutAction::Nothing => {}
            TimeoutAction::FireNow => self.fire(None),
            TimeoutAction::Rearm { delay_nanos, stale } => {
                if let Some(timer) = stale {
                    timer.cancel();
                }
                if delay_nanos != u64::MAX {
                    self.arm(delay_nanos);
                }
            }
        }
    }

    /// Schedules the firing timer and attaches its handle, unless the
    /// scheduler settled while the timer was being created.
    fn arm(&self, delay_nanos: u64) {
        let executor = {
            let fields = self.inner.lock();
            match &fields.executor {
                Some(executor) => Arc::clone(executor),
                None => return,
            }
        };
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handle = executor.schedule(
            Duration::from_nanos(delay_nanos),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    Self { inner }.fire(None);
                }
            }),
        );
        let stale = {
            let mut fields = self.inner.lock();
            if fields.state == State::Scheduled {
                fields.timer.replace(handle)
            } else {
                Some(handle)
            }
        };
        if let Some(timer) = stale {
            timer.cancel();
        }
    }

    /// The two-phase firing sequence. First call wins.
    ///
    /// Phase order is load-bearing: cause recorded under `Finishing`, the
    /// cancelling signal completes, state moves to `Finished`, the task
    /// runs, the cancelled signal completes with the same cause.
    fn fire(&self, cause: Option<Cause>) {
        let (resolved, timer) = {
            let mut fields = self.inner.lock();
            if matches!(fields.state, State::Finishing | State::Finished) {
                return;
            }
            if fields.state == State::Init {
                // Implicit start; the clock may be unbound.
                if let Some(executor) = &fields.executor {
                    fields.start_time = executor.now();
                }
            }
            fields.state = State::Finishing;
            let resolved = cause
                .and_then(|c| Error::unwrap_cause(&c))
                .unwrap_or_else(|| self.inner.role.default_cause());
            fields.cause = Some(Arc::clone(&resolved));
            (resolved, fields.timer.take())
        };
        if let Some(timer) = timer {
            timer.cancel();
        }
        trace!(role = ?self.inner.role, cause = %resolved, "deadline firing");

        self.inner
            .cancelling_signal()
            .complete(Arc::clone(&resolved));

        let task = {
            let mut fields = self.inner.lock();
            fields.state = State::Finished;
            fields.task.take()
        };
        if let Some(task) = task {
            if task.can_schedule() {
                task.run(Arc::clone(&resolved));
            }
        }

        self.inner.cancelled_signal().complete(resolved);
    }
}

impl std::fmt::Debug for DeadlineScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fields = self.inner.lock();
        f.debug_struct("DeadlineScheduler")
            .field("role", &self.inner.role)
            .field("state", &fields.state)
            .field("timeout_nanos", &fields.timeout_nanos)
            .field("start_time", &fields.start_time)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::executor::ManualExecutor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MILLIS: u64 = 1_000_000;

    fn executor() -> (ManualExecutor, Arc<dyn EventExecutor>) {
        let manual = ManualExecutor::new();
        let exec: Arc<dyn EventExecutor> = Arc::new(manual.clone());
        (manual, exec)
    }

    #[test]
    fn fires_after_the_timeout_elapses() {
        let (manual, exec) = executor();
        let scheduler = DeadlineScheduler::of_server(100 * MILLIS);
        let fired = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&fired);
        scheduler.init_and_start(exec, task_fn(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(scheduler.state(), State::Scheduled);
        manual.advance(Duration::from_millis(99));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        manual.advance(Duration::from_millis(1));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_finished());
        let cause = scheduler.cause().expect("cause recorded");
        assert_eq!(cause.kind(), ErrorKind::RequestTimedOut);
    }

    #[test]
    fn zero_timeout_starts_inactive_and_never_fires() {
        let (manual, exec) = executor();
        let scheduler = DeadlineScheduler::of_client(0);
        scheduler.init_and_start(exec, NoopCancellationTask);
        assert_eq!(scheduler.state(), State::Inactive);
        assert_eq!(manual.pending_timer_count(), 0);
        manual.advance(Duration::from_secs(3600));
        assert!(!scheduler.is_finished());
    }

    #[test]
    fn init_panics_when_called_twice() {
        let (_manual, exec) = executor();
        let scheduler = DeadlineScheduler::of_client(MILLIS);
        scheduler.init(Arc::clone(&exec));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            scheduler.init(exec);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn set_from_start_past_budget_fires_immediately() {
        let (manual, exec) = executor();
        let scheduler = DeadlineScheduler::of_client(10_000 * MILLIS);
        scheduler.init_and_start(exec, NoopCancellationTask);
        manual.advance(Duration::from_millis(150));
        scheduler.set_timeout_nanos(TimeoutMode::SetFromStart, (100 * MILLIS) as i64);
        assert!(scheduler.is_finished());
        let cause = scheduler.cause().expect("cause recorded");
        assert_eq!(cause.kind(), ErrorKind::ResponseTimedOut);
    }

    #[test]
    fn set_from_start_reschedules_a_live_deadline() {
        let (manual, exec) = executor();
        let scheduler = DeadlineScheduler::of_client(100 * MILLIS);
        scheduler.init_and_start(exec, NoopCancellationTask);
        manual.advance(Duration::from_millis(50));
        scheduler.set_timeout_nanos(TimeoutMode::SetFromStart, (300 * MILLIS) as i64);
        manual.advance(Duration::from_millis(100));
        assert!(!scheduler.is_finished());
        manual.advance(Duration::from_millis(150));
        assert!(scheduler.is_finished());
    }

    #[test]
    fn set_from_start_zero_disables() {
        let (manual, exec) = executor();
        let scheduler = DeadlineScheduler::of_client(100 * MILLIS);
        scheduler.init_and_start(exec, NoopCancellationTask);
        scheduler.set_timeout_nanos(TimeoutMode::SetFromStart, 0);
        assert_eq!(scheduler.state(), State::Inactive);
        assert_eq!(manual.pending_timer_count(), 0);
        manual.advance(Duration::from_secs(10));
        assert!(!scheduler.is_finished());
    }

    #[test]
    fn set_from_now_rebases_on_the_current_instant() {
        let (manual, exec) = executor();
        let scheduler = DeadlineScheduler::of_client(100 * MILLIS);
        scheduler.init_and_start(exec, NoopCancellationTask);
        manual.advance(Duration::from_millis(80));
        scheduler.set_timeout_nanos(TimeoutMode::SetFromNow, (200 * MILLIS) as i64);
        manual.advance(Duration::from_millis(199));
        assert!(!scheduler.is_finished());
        manual.advance(Duration::from_millis(1));
        assert!(scheduler.is_finished());
        // Total budget covers the 80ms already spent plus the new 200ms.
        assert_eq!(scheduler.timeout_nanos(), 280 * MILLIS);
    }

    #[test]
    fn set_from_now_before_start_rebases_by_the_wait() {
        let (manual, exec) = executor();
        let scheduler = DeadlineScheduler::of_client(0);
        scheduler.init(exec);
        scheduler.set_timeout_nanos(TimeoutMode::SetFromNow, (100 * MILLIS) as i64);
        manual.advance(Duration::from_millis(30));
        scheduler.start();
        // 30ms of the 100ms elapsed before start.
        assert_eq!(scheduler.timeout_nanos(), 70 * MILLIS);
        manual.advance(Duration::from_millis(70));
        assert!(scheduler.is_finished());
    }

    #[test]
    fn set_from_start_overrides_a_pending_from_now() {
        let (manual, exec) = executor();
        let scheduler = DeadlineScheduler::of_client(0);
        scheduler.init(exec);
        scheduler.set_timeout_nanos(TimeoutMode::SetFromNow, (500 * MILLIS) as i64);
        scheduler.set_timeout_nanos(TimeoutMode::SetFromStart, (100 * MILLIS) as i64);
        scheduler.start();
        assert_eq!(scheduler.timeout_nanos(), 100 * MILLIS);
        manual.advance(Duration::from_millis(100));
        assert!(scheduler.is_finished());
    }

    #[test]
    fn extend_lengthens_a_live_deadline() {
        let (manual, exec) = executor();
        let scheduler = DeadlineScheduler::of_client(100 * MILLIS);
        scheduler.init_and_start(exec, NoopCancellationTask);
        scheduler.set_timeout_nanos(TimeoutMode::Extend, (50 * MILLIS) as i64);
        manual.advance(Duration::from_millis(120));
        assert!(!scheduler.is_finished());
        manual.advance(Duration::from_millis(30));
        assert!(scheduler.is_finished());
    }

    #[test]
    fn extend_to_nonpositive_fires_immediately() {
        let (manual, exec) = executor();
        let scheduler = DeadlineScheduler::of_server(100 * MILLIS);
        scheduler.init_and_start(exec, NoopCancellationTask);
        manual.advance(Duration::from_millis(50));
        scheduler.set_timeout_nanos(TimeoutMode::Extend, -(60 * MILLIS as i64));
        assert!(scheduler.is_finished());
        let cause = scheduler.cause().expect("cause recorded");
        assert_eq!(cause.kind(), ErrorKind::RequestTimedOut);
    }

    #[test]
    fn extend_by_the_whole_budget_fires_immediately() {
        let (_manual, exec) = executor();
        let scheduler = DeadlineScheduler::of_client(100 * MILLIS);
        scheduler.init_and_start(exec, NoopCancellationTask);
        scheduler.set_timeout_nanos(TimeoutMode::Extend, -(100 * MILLIS as i64));
        assert!(scheduler.is_finished());
    }

    #[test]
    fn extend_before_start_clamps_at_zero() {
        let (_manual, exec) = executor();
        let scheduler = DeadlineScheduler::of_client(100 * MILLIS);
        scheduler.init(exec);
        scheduler.set_timeout_nanos(TimeoutMode::Extend, -(500 * MILLIS as i64));
        assert_eq!(scheduler.timeout_nanos(), 0);
        scheduler.start();
        assert_eq!(scheduler.state(), State::Inactive);
    }

    #[test]
    fn extend_on_a_disabled_deadline_is_a_noop() {
        let (manual, exec) = executor();
        let scheduler = DeadlineScheduler::of_client(0);
        scheduler.init_and_start(exec, NoopCancellationTask);
        scheduler.set_timeout_nanos(TimeoutMode::Extend, (100 * MILLIS) as i64);
        assert_eq!(scheduler.state(), State::Inactive);
        manual.advance(Duration::from_secs(10));
        assert!(!scheduler.is_finished());
    }

    #[test]
    fn clear_timeout_releases_the_timer() {
        let (manual, exec) = executor();
        let scheduler = DeadlineScheduler::of_client(100 * MILLIS);
        scheduler.init_and_start(exec, NoopCancellationTask);
        scheduler.clear_timeout();
        scheduler.clear_timeout();
        assert_eq!(scheduler.state(), State::Inactive);
        assert_eq!(manual.pending_timer_count(), 0);
        manual.advance(Duration::from_secs(10));
        assert!(!scheduler.is_finished());
    }

    #[test]
    fn finish_now_is_idempotent_and_first_cause_wins() {
        let (_manual, exec) = executor();
        let scheduler = DeadlineScheduler::of_client(100 * MILLIS);
        scheduler.init_and_start(exec, NoopCancellationTask);
        let first: Cause = Arc::new(Error::cancelled("caller aborted"));
        scheduler.finish_now_with(Arc::clone(&first));
        scheduler.finish_now_with(Arc::new(Error::cancelled("too late")));
        scheduler.finish_now();
        let cause = scheduler.cause().expect("cause recorded");
        assert!(Arc::ptr_eq(&cause, &first));
    }

    #[test]
    fn finish_now_before_init_uses_the_default_cause() {
        let scheduler = DeadlineScheduler::of_server(100 * MILLIS);
        scheduler.finish_now();
        assert!(scheduler.is_finished());
        assert_eq!(scheduler.start_time(), Time::ZERO);
        let cause = scheduler.cause().expect("cause recorded");
        assert_eq!(cause.kind(), ErrorKind::RequestTimedOut);
    }

    #[test]
    fn wrapper_cause_is_unwrapped_and_empty_wrapper_synthesizes() {
        let (_manual, exec) = executor();
        let scheduler = DeadlineScheduler::of_client(MILLIS);
        scheduler.init_and_start(Arc::clone(&exec), NoopCancellationTask);
        let inner: Cause = Arc::new(Error::cancelled("upstream closed"));
        scheduler.finish_now_with(Arc::new(Error::wrapped(Arc::clone(&inner))));
        let cause = scheduler.cause().expect("cause recorded");
        assert!(Arc::ptr_eq(&cause, &inner));

        let bare = DeadlineScheduler::of_client(MILLIS);
        bare.init_and_start(exec, NoopCancellationTask);
        bare.finish_now_with(Arc::new(Error::new(ErrorKind::Wrapped)));
        let cause = bare.cause().expect("cause recorded");
        assert_eq!(cause.kind(), ErrorKind::ResponseTimedOut);
    }

    #[test]
    fn two_phase_order_and_identical_cause_reference() {
        let (_manual, exec) = executor();
        let scheduler = DeadlineScheduler::of_client(100 * MILLIS);
        let order = Arc::new(Mutex::new(Vec::new()));

        let cancelling = scheduler.when_cancelling();
        let cancelled = scheduler.when_cancelled();

        let log = Arc::clone(&order);
        let probe = scheduler.clone();
        scheduler.init_and_start(exec, task_fn(move |_| {
            // The first signal fires before the task; the second after.
            assert!(probe.when_cancelling().is_complete());
            assert!(!probe.when_cancelled().is_complete());
            log.lock().unwrap().push("task");
        }));

        let explicit: Cause = Arc::new(Error::cancelled("torn down"));
        scheduler.finish_now_with(Arc::clone(&explicit));

        order.lock().unwrap().push("after");
        assert_eq!(*order.lock().unwrap(), vec!["task", "after"]);

        let first = cancelling.peek().expect("cancelling complete");
        let second = cancelled.peek().expect("cancelled complete");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &explicit));
    }

    #[test]
    fn task_with_can_schedule_false_is_skipped() {
        struct Declined(Arc<AtomicUsize>);
        impl CancellationTask for Declined {
            fn can_schedule(&self) -> bool {
                false
            }
            fn run(&self, _cause: Cause) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let (_manual, exec) = executor();
        let runs = Arc::new(AtomicUsize::new(0));
        let scheduler = DeadlineScheduler::of_client(MILLIS);
        scheduler.init_and_start(exec, Declined(Arc::clone(&runs)));
        scheduler.finish_now();
        assert!(scheduler.is_finished());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        // Both signals still complete.
        assert!(scheduler.when_cancelling().is_complete());
        assert!(scheduler.when_cancelled().is_complete());
    }

    #[test]
    fn update_task_after_firing_runs_immediately() {
        let (_manual, exec) = executor();
        let scheduler = DeadlineScheduler::of_server(MILLIS);
        scheduler.init(exec);
        scheduler.start();
        scheduler.finish_now();
        let runs = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&runs);
        scheduler.update_task(task_fn(move |cause| {
            assert_eq!(cause.kind(), ErrorKind::RequestTimedOut);
            count.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_releases_the_timer_but_keeps_state() {
        let (manual, exec) = executor();
        let scheduler = DeadlineScheduler::of_client(100 * MILLIS);
        scheduler.init_and_start(exec, NoopCancellationTask);
        scheduler.stop();
        assert_eq!(scheduler.state(), State::Scheduled);
        assert_eq!(manual.pending_timer_count(), 0);
        manual.advance(Duration::from_secs(10));
        assert!(!scheduler.is_finished());
    }

    #[test]
    fn finished_preset_is_settled_with_the_role_default() {
        let scheduler = DeadlineScheduler::finished(Role::Client);
        assert!(scheduler.is_finished());
        assert!(scheduler.when_cancelling().is_complete());
        assert!(scheduler.when_cancelled().is_complete());
        let cause = scheduler.cause().expect("preset cause");
        assert_eq!(cause.kind(), ErrorKind::ResponseTimedOut);
        // Mutations are no-ops on a settled scheduler.
        scheduler.finish_now_with(Arc::new(Error::cancelled("ignored")));
        scheduler.set_timeout_nanos(TimeoutMode::SetFromStart, MILLIS as i64);
        assert_eq!(scheduler.timeout_nanos(), 0);
    }

    #[test]
    fn firing_cancels_the_armed_timer() {
        let (manual, exec) = executor();
        let scheduler = DeadlineScheduler::of_client(100 * MILLIS);
        scheduler.init_and_start(exec, NoopCancellationTask);
        assert_eq!(manual.pending_timer_count(), 1);
        scheduler.finish_now();
        assert_eq!(manual.pending_timer_count(), 0);
        // The timer closure, were it still live, would be a no-op anyway.
        manual.advance(Duration::from_secs(1));
        assert!(scheduler.is_finished());
    }

    #[test]
    fn legacy_unit_views_track_the_signals() {
        let (_manual, exec) = executor();
        let scheduler = DeadlineScheduler::of_client(MILLIS);
        let timing_out = scheduler.when_timing_out();
        let timed_out = scheduler.when_timed_out();
        scheduler.init_and_start(exec, NoopCancellationTask);
        assert!(!timing_out.is_complete());
        scheduler.finish_now();
        assert!(timing_out.is_complete());
        assert!(timed_out.is_complete());
    }
}
