//! Asynchronous resource selection with bounded waiting.
//!
//! A [`SelectionWaiter`] sits in front of a [`ResourcePool`] whose contents
//! change over time. Callers ask for a resource; if one is available the
//! answer is immediate, otherwise the caller parks until the pool is
//! refreshed or a per-call timeout elapses.
//!
//! # Protocol
//!
//! ```text
//! select(probe, executor, timeout)
//!   │
//!   ├── timeout == 0 ──────────► record cause, resolve Ok(None)
//!   ├── fast path: select_now ─► resolve Ok(Some(r)) / Err(cause)
//!   │
//!   ├── park entry in pending set
//!   ├── double-check select_now   (closes the race with a refresh that
//!   │                              ran before we parked)
//!   └── arm timeout timer         (closes the race with a refresh that
//!                                  ran between the double-check and here)
//! ```
//!
//! A timeout is not an error at the selection surface: the future resolves
//! with `Ok(None)` and the timeout cause is recorded on the probe, where the
//! caller can retrieve it to enrich whatever error it raises next.
//!
//! Resource completions found by [`refresh`] are claimed synchronously but
//! delivered on the entry's bound executor, so waiters always observe
//! completion from their own event loop. Completed entries are left in the
//! pending set as tombstones and purged on the next `refresh` scan.
//!
//! [`refresh`]: SelectionWaiter::refresh

use crate::error::{Cause, Error};
use crate::executor::{EventExecutor, TimerHandle};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tracing::trace;

/// Out-of-band sink for selection failure causes.
///
/// When a selection times out the future resolves with `Ok(None)` rather
/// than an error; the cause goes here so the caller can attach it to the
/// error it ultimately reports.
pub trait SelectionProbe: Send + Sync {
    /// Records a failure cause for later retrieval.
    fn record_failure(&self, cause: Cause);
}

impl<T: SelectionProbe + ?Sized> SelectionProbe for Arc<T> {
    fn record_failure(&self, cause: Cause) {
        (**self).record_failure(cause);
    }
}

/// A pool of resources that a [`SelectionWaiter`] draws from.
pub trait ResourcePool: Send + Sync + 'static {
    /// Per-call context a selection carries through the pool.
    type Probe: SelectionProbe + Clone + Send + Sync + 'static;
    /// The resource handed out on success.
    type Resource: Clone + Send + Sync + 'static;

    /// Attempts a selection without waiting.
    ///
    /// `Ok(None)` means nothing is available right now; the waiter will
    /// park. `Err` is a hard pool failure and resolves the selection
    /// immediately.
    fn select_now(&self, probe: &Self::Probe) -> Result<Option<Self::Resource>, Error>;

    /// Registers a listener invoked whenever the pool's contents change.
    ///
    /// Pools with static contents keep the default, which drops the
    /// listener.
    fn subscribe(&self, listener: Box<dyn Fn() + Send + Sync>) {
        let _ = listener;
    }
}

/// A parked selection waiting for the pool to produce a resource.
struct PendingSelection<P: ResourcePool> {
    probe: P::Probe,
    executor: Arc<dyn EventExecutor>,
    state: Mutex<PendingState<P::Resource>>,
}

struct PendingState<R> {
    /// Resource claimed by `try_complete`, awaiting delivery on the
    /// executor.
    claimed: Option<R>,
    result: Option<Result<Option<R>, Cause>>,
    wakers: Vec<Waker>,
    timer: Option<TimerHandle>,
}

impl<P: ResourcePool> PendingSelection<P> {
    fn new(probe: P::Probe, executor: Arc<dyn EventExecutor>) -> Self {
        Self {
            probe,
            executor,
            state: Mutex::new(PendingState {
                claimed: None,
                result: None,
                wakers: Vec::new(),
                timer: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PendingState<P::Resource>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Resolves the selection. First call wins; the timer is cancelled and
    /// waiters are woken outside the lock.
    fn finish(&self, result: Result<Option<P::Resource>, Cause>) -> bool {
        let (wakers, timer) = {
            let mut state = self.lock();
            if state.result.is_some() {
                return false;
            }
            state.result = Some(result);
            (std::mem::take(&mut state.wakers), state.timer.take())
        };
        if let Some(timer) = timer {
            timer.cancel();
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// Probes the pool on behalf of this entry.
    ///
    /// Returns `true` when the entry is resolved or claimed and can be
    /// dropped from the pending set. A claimed resource is delivered on the
    /// entry's executor unless we are already on it.
    fn try_complete(self: &Arc<Self>, pool: &P) -> bool {
        if self.is_settled() {
            return true;
        }
        match pool.select_now(&self.probe) {
            Ok(Some(resource)) => {
                let timer = {
                    let mut state = self.lock();
                    if state.result.is_some() || state.claimed.is_some() {
                        return true;
                    }
                    state.claimed = Some(resource);
                    state.timer.take()
                };
                if let Some(timer) = timer {
                    timer.cancel();
                }
                if self.executor.in_event_loop() {
                    self.deliver_claimed();
                } else {
                    let entry = Arc::clone(self);
                    self.executor.execute(Box::new(move || entry.deliver_claimed()));
                }
                true
            }
            Ok(None) => false,
            Err(err) => self.finish(Err(Arc::new(err))),
        }
    }

    /// Moves the claimed resource into the final result.
    fn deliver_claimed(&self) {
        let claimed = self.lock().claimed.clone();
        if let Some(resource) = claimed {
            self.finish(Ok(Some(resource)));
        }
    }

    /// Attaches the timeout timer, or cancels it if the entry settled while
    /// the timer was being armed.
    fn attach_timer(&self, handle: TimerHandle) {
        let settled = {
            let mut state = self.lock();
            if state.result.is_none() && state.claimed.is_none() {
                state.timer = Some(handle.clone());
                false
            } else {
                true
            }
        };
        if settled {
            handle.cancel();
        }
    }

    /// Resolved, or claimed and awaiting delivery.
    fn is_settled(&self) -> bool {
        let state = self.lock();
        state.result.is_some() || state.claimed.is_some()
    }

    fn is_done(&self) -> bool {
        self.lock().result.is_some()
    }
}

struct WaiterInner<P: ResourcePool> {
    pool: P,
    pending: Mutex<Vec<Arc<PendingSelection<P>>>>,
}

impl<P: ResourcePool> WaiterInner<P> {
    fn lock_pending(&self) -> MutexGuard<'_, Vec<Arc<PendingSelection<P>>>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn refresh(&self) {
        let mut pending = self.lock_pending();
        let before = pending.len();
        pending.retain(|entry| !entry.try_complete(&self.pool));
        trace!(before, after = pending.len(), "pending selections refreshed");
    }
}

/// Front door for asynchronous selection against a [`ResourcePool`].
///
/// Cloning is cheap and clones share the pending set.
pub struct SelectionWaiter<P: ResourcePool> {
    inner: Arc<WaiterInner<P>>,
}

impl<P: ResourcePool> Clone for SelectionWaiter<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: ResourcePool> SelectionWaiter<P> {
    /// Wraps `pool` in a waiter with an empty pending set.
    #[must_use]
    pub fn new(pool: P) -> Self {
        Self {
            inner: Arc::new(WaiterInner {
                pool,
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The wrapped pool.
    #[must_use]
    pub fn pool(&self) -> &P {
        &self.inner.pool
    }

    /// Subscribes this waiter to pool change notifications, so every pool
    /// update triggers a [`refresh`].
    ///
    /// The subscription holds no strong reference to the waiter; it goes
    /// quiet once the last waiter clone is dropped.
    ///
    /// [`refresh`]: SelectionWaiter::refresh
    pub fn watch(&self) {
        let weak: Weak<WaiterInner<P>> = Arc::downgrade(&self.inner);
        self.inner.pool.subscribe(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.refresh();
            }
        }));
    }

    /// Selects a resource, waiting up to `timeout_millis` for the pool to
    /// produce one.
    ///
    /// - `timeout_millis == 0` resolves `Ok(None)` at once, without probing;
    ///   the timeout cause is recorded on the probe.
    /// - `timeout_millis == u64::MAX` waits without a deadline.
    /// - On timeout the future resolves `Ok(None)` and the cause is recorded
    ///   on the probe.
    pub fn select(
        &self,
        probe: P::Probe,
        executor: &Arc<dyn EventExecutor>,
        timeout_millis: u64,
    ) -> SelectionFuture<P> {
        if timeout_millis == 0 {
            probe.record_failure(Arc::new(Error::selection_timed_out(0)));
            return SelectionFuture::ready(Ok(None));
        }

        match self.inner.pool.select_now(&probe) {
            Ok(Some(resource)) => return SelectionFuture::ready(Ok(Some(resource))),
            Err(err) => return SelectionFuture::ready(Err(Arc::new(err))),
            Ok(None) => {}
        }

        let entry = Arc::new(PendingSelection::new(probe, Arc::clone(executor)));
        self.inner.lock_pending().push(Arc::clone(&entry));

        // A refresh may have raced past between the fast path and the push.
        if entry.try_complete(&self.inner.pool) {
            return SelectionFuture::parked(entry);
        }

        if timeout_millis != u64::MAX {
            let timer_entry = Arc::clone(&entry);
            let handle = executor.schedule(
                Duration::from_millis(timeout_millis),
                Box::new(move || {
                    if timer_entry.is_settled() {
                        return;
                    }
                    trace!(timeout_millis, "selection timed out");
                    // Record before resolving so a woken caller always sees
                    // the cause.
                    timer_entry
                        .probe
                        .record_failure(Arc::new(Error::selection_timed_out(timeout_millis)));
                    timer_entry.finish(Ok(None));
                }),
            );
            entry.attach_timer(handle);
        }

        SelectionFuture::parked(entry)
    }

    /// Re-probes every parked selection after the pool's contents changed.
    ///
    /// Entries that settle (and tombstones from earlier completions) are
    /// dropped from the pending set.
    pub fn refresh(&self) {
        self.inner.refresh();
    }

    /// Number of parked selections, tombstones excluded.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        let mut pending = self.inner.lock_pending();
        pending.retain(|entry| !entry.is_settled());
        pending.len()
    }
}

impl<P: ResourcePool> std::fmt::Debug for SelectionWaiter<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectionWaiter")
            .field("pending", &self.inner.lock_pending().len())
            .finish()
    }
}

enum FutureState<P: ResourcePool> {
    Ready(Result<Option<P::Resource>, Cause>),
    Parked(Arc<PendingSelection<P>>),
}

/// Future returned by [`SelectionWaiter::select`].
///
/// Resolves to `Ok(Some(resource))` on success, `Ok(None)` on timeout, and
/// `Err(cause)` on pool failure or cancellation. Dropping an unresolved
/// future cancels the selection.
#[must_use = "a selection future does nothing until polled"]
pub struct SelectionFuture<P: ResourcePool> {
    state: FutureState<P>,
}

impl<P: ResourcePool> SelectionFuture<P> {
    fn ready(result: Result<Option<P::Resource>, Cause>) -> Self {
        Self {
            state: FutureState::Ready(result),
        }
    }

    fn parked(entry: Arc<PendingSelection<P>>) -> Self {
        Self {
            state: FutureState::Parked(entry),
        }
    }

    /// Cancels the selection. Idempotent; has no effect once resolved.
    ///
    /// Returns `true` if this call resolved the future.
    pub fn cancel(&self) -> bool {
        match &self.state {
            FutureState::Ready(_) => false,
            FutureState::Parked(entry) => {
                entry.finish(Err(Arc::new(Error::cancelled("selection cancelled"))))
            }
        }
    }

    /// Whether the future has resolved.
    #[must_use]
    pub fn is_done(&self) -> bool {
        match &self.state {
            FutureState::Ready(_) => true,
            FutureState::Parked(entry) => entry.is_done(),
        }
    }
}

impl<P: ResourcePool> Future for SelectionFuture<P> {
    type Output = Result<Option<P::Resource>, Cause>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &self.state {
            FutureState::Ready(result) => Poll::Ready(result.clone()),
            FutureState::Parked(entry) => {
                let mut state = entry.lock();
                if let Some(result) = &state.result {
                    return Poll::Ready(result.clone());
                }
                if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    state.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl<P: ResourcePool> Drop for SelectionFuture<P> {
    fn drop(&mut self) {
        if let FutureState::Parked(entry) = &self.state {
            entry.finish(Err(Arc::new(Error::cancelled("selection dropped"))));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::executor::ManualExecutor;
    use futures_lite::future::block_on;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Probe that remembers recorded causes.
    #[derive(Debug, Clone, Default)]
    struct TestProbe {
        failures: Arc<Mutex<Vec<Cause>>>,
    }

    impl TestProbe {
        fn last_failure(&self) -> Option<Cause> {
            self.failures.lock().unwrap().last().cloned()
        }
    }

    impl SelectionProbe for TestProbe {
        fn record_failure(&self, cause: Cause) {
            self.failures.lock().unwrap().push(cause);
        }
    }

    /// Pool backed by a queue of canned answers.
    #[derive(Default)]
    struct TestPool {
        slots: Mutex<Vec<&'static str>>,
        probes: AtomicUsize,
        listeners: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
    }

    impl TestPool {
        fn offer(&self, value: &'static str) {
            self.slots.lock().unwrap().push(value);
            let listeners = self.listeners.lock().unwrap();
            for listener in listeners.iter() {
                listener();
            }
        }

        fn probe_count(&self) -> usize {
            self.probes.load(Ordering::SeqCst)
        }
    }

    impl ResourcePool for Arc<TestPool> {
        type Probe = TestProbe;
        type Resource = &'static str;

        fn select_now(&self, _probe: &TestProbe) -> Result<Option<&'static str>, Error> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            Ok(self.slots.lock().unwrap().pop())
        }

        fn subscribe(&self, listener: Box<dyn Fn() + Send + Sync>) {
            self.listeners.lock().unwrap().push(listener);
        }
    }

    struct Fixture {
        waiter: SelectionWaiter<Arc<TestPool>>,
        pool: Arc<TestPool>,
        manual: ManualExecutor,
        exec: Arc<dyn EventExecutor>,
    }

    fn fixture() -> Fixture {
        let pool = Arc::new(TestPool::default());
        let manual = ManualExecutor::new();
        Fixture {
            waiter: SelectionWaiter::new(Arc::clone(&pool)),
            pool,
            exec: Arc::new(manual.clone()),
            manual,
        }
    }

    #[test]
    fn fast_path_resolves_without_parking() {
        let f = fixture();
        f.pool.offer("a");
        let fut = f.waiter.select(TestProbe::default(), &f.exec, 1_000);
        assert!(fut.is_done());
        assert_eq!(block_on(fut).unwrap(), Some("a"));
        assert_eq!(f.waiter.pending_count(), 0);
        assert_eq!(f.manual.pending_timer_count(), 0);
    }

    #[test]
    fn zero_timeout_resolves_absent_without_probing() {
        let f = fixture();
        f.pool.offer("should not be taken");
        let probe = TestProbe::default();
        let fut = f.waiter.select(probe.clone(), &f.exec, 0);
        assert_eq!(block_on(fut).unwrap(), None);
        assert_eq!(f.pool.probe_count(), 0);
        let cause = probe.last_failure().expect("cause recorded");
        assert_eq!(cause.kind(), ErrorKind::SelectionTimedOut);
    }

    #[test]
    fn parked_selection_resolves_on_refresh() {
        let f = fixture();
        let fut = f.waiter.select(TestProbe::default(), &f.exec, 5_000);
        assert!(!fut.is_done());
        assert_eq!(f.waiter.pending_count(), 1);
        f.pool.offer("late");
        f.waiter.refresh();
        // The claim is immediate; delivery happens on the executor.
        assert_eq!(f.waiter.pending_count(), 0);
        assert!(!fut.is_done());
        f.manual.run_until_idle();
        assert_eq!(block_on(fut).unwrap(), Some("late"));
    }

    #[test]
    fn timeout_resolves_absent_and_records_cause() {
        let f = fixture();
        let probe = TestProbe::default();
        let fut = f.waiter.select(probe.clone(), &f.exec, 100);
        f.manual.advance(Duration::from_millis(100));
        assert_eq!(block_on(fut).unwrap(), None);
        let cause = probe.last_failure().expect("cause recorded");
        assert_eq!(cause.kind(), ErrorKind::SelectionTimedOut);
        assert!(cause.to_string().contains("100ms"));
    }

    #[test]
    fn refresh_before_timeout_cancels_the_timer() {
        let f = fixture();
        let fut = f.waiter.select(TestProbe::default(), &f.exec, 1_000);
        f.pool.offer("b");
        f.waiter.refresh();
        assert_eq!(f.manual.pending_timer_count(), 0);
        f.manual.advance(Duration::from_secs(5));
        assert_eq!(block_on(fut).unwrap(), Some("b"));
    }

    #[test]
    fn max_timeout_never_arms_a_timer() {
        let f = fixture();
        let fut = f.waiter.select(TestProbe::default(), &f.exec, u64::MAX);
        assert_eq!(f.manual.pending_timer_count(), 0);
        f.pool.offer("eventually");
        f.waiter.refresh();
        f.manual.run_until_idle();
        assert_eq!(block_on(fut).unwrap(), Some("eventually"));
    }

    #[test]
    fn cancel_is_idempotent_and_resolves_cancelled() {
        let f = fixture();
        let fut = f.waiter.select(TestProbe::default(), &f.exec, 1_000);
        assert!(fut.cancel());
        assert!(!fut.cancel());
        assert_eq!(f.manual.pending_timer_count(), 0);
        let err = block_on(fut).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn drop_cancels_a_parked_selection() {
        let f = fixture();
        {
            let _fut = f.waiter.select(TestProbe::default(), &f.exec, 1_000);
        }
        f.pool.offer("orphan");
        f.waiter.refresh();
        f.manual.run_until_idle();
        // The dropped entry resolved cancelled, so the resource stays.
        assert_eq!(f.pool.slots.lock().unwrap().len(), 1);
        assert_eq!(f.waiter.pending_count(), 0);
    }

    #[test]
    fn pool_error_resolves_the_future() {
        struct FailingPool;
        #[derive(Clone)]
        struct NoopProbe;
        impl SelectionProbe for NoopProbe {
            fn record_failure(&self, _cause: Cause) {}
        }
        impl ResourcePool for FailingPool {
            type Probe = NoopProbe;
            type Resource = ();
            fn select_now(&self, _probe: &NoopProbe) -> Result<Option<()>, Error> {
                Err(Error::pool("resolver unavailable"))
            }
        }
        let waiter = SelectionWaiter::new(FailingPool);
        let exec: Arc<dyn EventExecutor> = Arc::new(ManualExecutor::new());
        let err = block_on(waiter.select(NoopProbe, &exec, 1_000)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Pool);
    }

    #[test]
    fn refresh_purges_tombstones() {
        let f = fixture();
        let fut = f.waiter.select(TestProbe::default(), &f.exec, 1_000);
        fut.cancel();
        assert_eq!(f.waiter.pending_count(), 0);
        f.waiter.refresh();
        assert_eq!(f.waiter.inner.lock_pending().len(), 0);
        drop(fut);
    }

    #[test]
    fn watch_refreshes_on_pool_updates() {
        let f = fixture();
        f.waiter.watch();
        let fut = f.waiter.select(TestProbe::default(), &f.exec, 5_000);
        f.pool.offer("pushed");
        f.manual.run_until_idle();
        assert_eq!(block_on(fut).unwrap(), Some("pushed"));
    }

    #[test]
    fn watch_subscription_goes_quiet_after_drop() {
        let pool = Arc::new(TestPool::default());
        {
            let waiter = SelectionWaiter::new(Arc::clone(&pool));
            waiter.watch();
        }
        // The listener upgrades to nothing; this must not panic or probe.
        pool.offer("ignored");
        assert_eq!(pool.probe_count(), 0);
    }
}
