//! Test utilities for Picket.
//!
//! This module provides shared helpers for unit and integration tests:
//! - Consistent tracing-based logging initialization
//! - Phase/section macros for readable test output
//! - A recording probe and a scripted pool for selection tests
//!
//! # Example
//! ```
//! use picket::test_utils::init_test_logging;
//!
//! fn my_test() {
//!     init_test_logging();
//!     // test code
//! }
//! ```

use crate::error::{Cause, Error};
use crate::select::{ResourcePool, SelectionProbe};
use std::sync::{Arc, Mutex, Once};
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
///
/// The first call wins; later calls are no-ops.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
    ($name:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::info!(
            test = %$name,
            $($key = %$value,)*
            "test completed successfully: {}",
            $name
        );
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

/// Probe that records every failure cause handed to it.
#[derive(Debug, Clone, Default)]
pub struct RecordingProbe {
    failures: Arc<Mutex<Vec<Cause>>>,
}

impl RecordingProbe {
    /// Creates an empty probe.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently recorded cause.
    #[must_use]
    pub fn last_failure(&self) -> Option<Cause> {
        self.failures().last().cloned()
    }

    /// Every recorded cause, oldest first.
    #[must_use]
    pub fn failures(&self) -> Vec<Cause> {
        match self.failures.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl SelectionProbe for RecordingProbe {
    fn record_failure(&self, cause: Cause) {
        match self.failures.lock() {
            Ok(mut guard) => guard.push(cause),
            Err(poisoned) => poisoned.into_inner().push(cause),
        }
    }
}

/// Pool over a scripted list of destinations, for selection tests.
///
/// Destinations are taken in LIFO order; an empty script parks the caller.
/// Offering a destination notifies subscribed listeners.
#[derive(Default)]
pub struct ScriptedPool {
    slots: Mutex<Vec<String>>,
    fail_with: Mutex<Option<String>>,
    listeners: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
    probes: std::sync::atomic::AtomicUsize,
}

impl ScriptedPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a destination and notifies listeners.
    pub fn offer(&self, destination: impl Into<String>) {
        self.lock_slots().push(destination.into());
        let listeners = match self.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for listener in listeners.iter() {
            listener();
        }
    }

    /// Makes the next `select_now` fail with a pool error.
    pub fn fail_next(&self, message: impl Into<String>) {
        match self.fail_with.lock() {
            Ok(mut guard) => *guard = Some(message.into()),
            Err(poisoned) => *poisoned.into_inner() = Some(message.into()),
        }
    }

    /// How many times the pool was probed.
    #[must_use]
    pub fn probe_count(&self) -> usize {
        self.probes.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl ResourcePool for Arc<ScriptedPool> {
    type Probe = RecordingProbe;
    type Resource = String;

    fn select_now(&self, _probe: &RecordingProbe) -> Result<Option<String>, Error> {
        self.probes
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let failure = match self.fail_with.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(message) = failure {
            return Err(Error::pool(message));
        }
        Ok(self.lock_slots().pop())
    }

    fn subscribe(&self, listener: Box<dyn Fn() + Send + Sync>) {
        match self.listeners.lock() {
            Ok(mut guard) => guard.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }
}

impl std::fmt::Debug for ScriptedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedPool")
            .field("slots", &self.lock_slots().len())
            .field("probes", &self.probe_count())
            .finish()
    }
}
