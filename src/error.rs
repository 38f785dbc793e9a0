//! Error types and the shared cancellation cause.
//!
//! Errors are explicit and typed (no stringly-typed errors). A cancellation
//! cause is shared between observer signals and the cancellation task as a
//! [`Cause`] (`Arc<Error>`), so every party that sees a firing sees the
//! identical reference.
//!
//! Two kinds of failure flow through the selection protocol and they are
//! deliberately distinct:
//!
//! - a resolution failure (the pool's `select_now` returned an error) is a
//!   genuine error and completes the selection exceptionally;
//! - a selection timeout is *not* exceptional: the selection resolves to
//!   "absent" and the timeout cause is recorded out of band, so the caller
//!   can run its normal downstream error pipeline uniformly.

use std::fmt;
use std::sync::Arc;

/// A shared, immutable cancellation cause.
pub type Cause = Arc<Error>;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Destination selection did not resolve within its timeout.
    ///
    /// Recorded out of band on the probe; the selection itself resolves to
    /// "absent".
    SelectionTimedOut,
    /// A server-side request deadline fired with no explicit cause.
    RequestTimedOut,
    /// A client-side response deadline fired with no explicit cause.
    ResponseTimedOut,
    /// The operation was cancelled explicitly.
    Cancelled,
    /// A wrapper carrying an inner cause; unwrapped when a deadline fires.
    Wrapped,
    /// The resource pool failed while resolving a destination.
    Pool,
}

impl ErrorKind {
    /// Returns true for kinds that wrap an inner cause.
    #[must_use]
    pub const fn is_wrapper(&self) -> bool {
        matches!(self, Self::Wrapped)
    }

    /// Returns true for the synthesized deadline-default kinds.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::SelectionTimedOut | Self::RequestTimedOut | Self::ResponseTimedOut
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SelectionTimedOut => "selection timed out",
            Self::RequestTimedOut => "request timed out",
            Self::ResponseTimedOut => "response timed out",
            Self::Cancelled => "cancelled",
            Self::Wrapped => "wrapped",
            Self::Pool => "pool",
        };
        f.write_str(name)
    }
}

/// The error type for selection and deadline operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    inner: Option<Cause>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            inner: None,
        }
    }

    /// Creates a new error with a message.
    #[must_use]
    pub fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
            inner: None,
        }
    }

    /// A selection that failed to resolve within `timeout_millis`.
    #[must_use]
    pub fn selection_timed_out(timeout_millis: u64) -> Self {
        Self::with_message(
            ErrorKind::SelectionTimedOut,
            format!("failed to select a destination within {timeout_millis}ms"),
        )
    }

    /// The default cause for a server-side deadline firing.
    #[must_use]
    pub fn request_timed_out() -> Self {
        Self::new(ErrorKind::RequestTimedOut)
    }

    /// The default cause for a client-side deadline firing.
    #[must_use]
    pub fn response_timed_out() -> Self {
        Self::new(ErrorKind::ResponseTimedOut)
    }

    /// An explicit cancellation.
    #[must_use]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::with_message(ErrorKind::Cancelled, message)
    }

    /// A resolution failure reported by the resource pool.
    #[must_use]
    pub fn pool(message: impl Into<String>) -> Self {
        Self::with_message(ErrorKind::Pool, message)
    }

    /// A wrapper error carrying an inner cause.
    ///
    /// When a deadline fires with a wrapper, the inner cause is recorded
    /// instead of the wrapper itself.
    #[must_use]
    pub fn wrapped(inner: Cause) -> Self {
        Self {
            kind: ErrorKind::Wrapped,
            message: None,
            inner: Some(inner),
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the typed inner cause, if any.
    #[must_use]
    pub fn inner(&self) -> Option<&Cause> {
        self.inner.as_ref()
    }

    /// Unwraps a wrapper cause to its inner cause.
    ///
    /// Returns `None` for wrapper kinds with no inner cause recorded;
    /// non-wrapper causes pass through unchanged.
    #[must_use]
    pub fn unwrap_cause(cause: &Cause) -> Option<Cause> {
        if cause.kind.is_wrapper() {
            cause.inner.clone()
        } else {
            Some(Arc::clone(cause))
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {message}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}
