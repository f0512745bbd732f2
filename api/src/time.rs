//! Clock used by every time-driven transition.
//!
//! Escrow holds, auction start/end checks and payment deadlines all read the
//! current time from a [`TimeSource`] so the `mock-time` feature can drive
//! the scheduler deterministically in tests.
use anyhow::Context;
use jiff::{Span, Timestamp};
#[cfg(feature = "mock-time")]
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct TimeSource {
    #[cfg(feature = "mock-time")]
    time: Arc<Mutex<Timestamp>>,
}

impl TimeSource {
    #[allow(clippy::new_without_default)]
    #[cfg(not(feature = "mock-time"))]
    pub fn new() -> Self {
        Self {}
    }

    #[cfg(feature = "mock-time")]
    pub fn new(initial_time: Timestamp) -> Self {
        Self {
            time: Arc::new(Mutex::new(initial_time)),
        }
    }

    #[cfg(not(feature = "mock-time"))]
    pub fn now(&self) -> Timestamp {
        Timestamp::now()
    }

    #[cfg(feature = "mock-time")]
    pub fn now(&self) -> Timestamp {
        *self.time.lock().unwrap()
    }

    /// The current time shifted forward by a span of hours or smaller units.
    pub fn after(&self, span: Span) -> anyhow::Result<Timestamp> {
        self.now()
            .checked_add(span)
            .with_context(|| format!("adding {span} to the current time"))
    }

    #[cfg(feature = "mock-time")]
    pub fn advance(&self, duration: Span) {
        *self.time.lock().unwrap() += duration;
    }

    #[cfg(feature = "mock-time")]
    pub fn set(&self, time: Timestamp) {
        *self.time.lock().unwrap() = time;
    }
}
