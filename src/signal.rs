//! One-shot completion signals carrying a cancellation cause.
//!
//! A [`CancellationSignal`] completes at most once with a [`Cause`] and fans
//! that cause out to every clone and every pending waiter. It is the building
//! block for the two-phase cancellation notifications: one signal fires while
//! a deadline is being processed and a second fires after the cancellation
//! task has run.
//!
//! # Completion Semantics
//!
//! - The first `complete` wins; later calls are ignored and report `false`.
//! - Awaiting an already-completed signal resolves immediately with the
//!   stored cause.
//! - Wakers are drained and woken outside the internal lock.
//!
//! [`UnitSignal`] is a cause-erasing view over a `CancellationSignal` for
//! callers that only care about *when* completion happened, not why.

use crate::error::Cause;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

/// Internal state shared by all clones of a signal.
#[derive(Debug)]
struct SignalInner {
    /// The cause, once completed.
    cause: Option<Cause>,
    /// Waiters parked before completion.
    wakers: Vec<Waker>,
}

/// A one-shot signal that completes exactly once with a [`Cause`].
///
/// Clones share the same underlying state. The signal itself is a future
/// resolving to the completion cause; it can be awaited any number of times
/// via clones.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    inner: Arc<Mutex<SignalInner>>,
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationSignal {
    /// Creates a fresh, incomplete signal.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SignalInner {
                cause: None,
                wakers: Vec::new(),
            })),
        }
    }

    /// Creates a signal that is already completed with `cause`.
    #[must_use]
    pub fn completed(cause: Cause) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SignalInner {
                cause: Some(cause),
                wakers: Vec::new(),
            })),
        }
    }

    /// Completes the signal with `cause`.
    ///
    /// Returns `true` if this call won the completion, `false` if the signal
    /// was already complete. Waiters are woken outside the lock.
    pub fn complete(&self, cause: Cause) -> bool {
        let wakers = {
            let mut inner = match self.inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if inner.cause.is_some() {
                return false;
            }
            inner.cause = Some(cause);
            std::mem::take(&mut inner.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// Returns the completion cause if the signal has completed.
    #[must_use]
    pub fn peek(&self) -> Option<Cause> {
        match self.inner.lock() {
            Ok(guard) => guard.cause.clone(),
            Err(poisoned) => poisoned.into_inner().cause.clone(),
        }
    }

    /// Whether the signal has completed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.peek().is_some()
    }

    /// A view of this signal that resolves to `()` instead of the cause.
    #[must_use]
    pub fn unit(&self) -> UnitSignal {
        UnitSignal {
            signal: self.clone(),
        }
    }
}

impl Future for CancellationSignal {
    type Output = Cause;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(cause) = &inner.cause {
            return Poll::Ready(Arc::clone(cause));
        }
        if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            inner.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

/// A cause-erasing view over a [`CancellationSignal`].
#[derive(Debug, Clone)]
pub struct UnitSignal {
    signal: CancellationSignal,
}

impl UnitSignal {
    /// Whether the underlying signal has completed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.signal.is_complete()
    }
}

impl Future for UnitSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.signal).poll(cx) {
            Poll::Ready(_) => Poll::Ready(()),
            Poll::Pending => Poll::Pending,
        }
    }
}
