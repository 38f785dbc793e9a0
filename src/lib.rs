//! Picket: cancel-correct destination selection and deadline scheduling for
//! client-side RPC runtimes.
//!
//! # Overview
//!
//! Every outgoing request needs two things from its runtime before a byte
//! hits the wire: a usable destination resolved out of a dynamically
//! changing pool, and a deadline that can be rescheduled, extended, or
//! cleared while the request is in flight. Picket implements both as
//! non-blocking state machines that stay correct under concurrent mutation
//! from timers, topology updates, and caller-driven cancellation.
//!
//! # Core Guarantees
//!
//! - **At-most-once completion**: a pending selection resolves exactly once
//!   across any interleaving of timer fire, pool notification, explicit
//!   cancel, and resolution error
//! - **No timer leaks**: every completion path releases its scheduled timer
//! - **Two-phase cancellation**: deadline observers see the cause before
//!   the cancellation task runs, and again after it has run, exactly once
//!   each, with the identical cause reference
//! - **Executor-bound ordering**: completions triggered off-thread are
//!   dispatched through the owning executor, preserving
//!   single-threaded-per-request semantics
//!
//! # Module Structure
//!
//! - [`time`]: logical timestamps plus wall-clock and virtual time sources
//! - [`executor`]: the scheduled-executor capability both cores run on
//! - [`select`]: the asynchronous destination-selection protocol
//! - [`deadline`]: the per-request deadline/cancellation scheduler
//! - [`signal`]: single-completion, multi-observer cancellation signals
//! - [`error`]: typed errors and the shared cancellation cause
//!
//! # Non-goals
//!
//! Picket does not decide *which* destination is chosen among several
//! available ones (that is the pool's load-balancing policy, consumed only
//! through [`select::ResourcePool::select_now`]), and it defines no wire
//! format, transport, or retry policy.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod deadline;
pub mod error;
pub mod executor;
pub mod select;
pub mod signal;
pub mod test_utils;
pub mod time;

pub use deadline::{
    task_fn, CancellationTask, DeadlineScheduler, NoopCancellationTask, Role, State, TimeoutMode,
};
pub use error::{Cause, Error, ErrorKind};
pub use executor::{EventExecutor, ManualExecutor, Task, TimerHandle};
pub use select::{ResourcePool, SelectionFuture, SelectionProbe, SelectionWaiter};
pub use signal::{CancellationSignal, UnitSignal};
pub use time::{Time, TimeSource, VirtualClock, WallClock};
