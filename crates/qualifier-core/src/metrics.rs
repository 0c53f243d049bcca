//! Process-wide atomic counters.
//!
//! Counters are bumped silently at the call site; [`Metrics::flush`] emits
//! them as one `info!` event, typically when a batch finishes.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    remote_calls: AtomicU64,
    retries: AtomicU64,
    rate_limited: AtomicU64,
    breaker_rejections: AtomicU64,
    checkpoints_written: AtomicU64,
    entities_finished: AtomicU64,
    entities_aborted: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! counter {
    ($inc:ident, $get:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(metric = stringify!($field), "counter incremented");
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            remote_calls: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            breaker_rejections: AtomicU64::new(0),
            checkpoints_written: AtomicU64::new(0),
            entities_finished: AtomicU64::new(0),
            entities_aborted: AtomicU64::new(0),
        }
    }

    counter!(inc_remote_calls, remote_calls, remote_calls);
    counter!(inc_retries, retries, retries);
    counter!(inc_rate_limited, rate_limited, rate_limited);
    counter!(inc_breaker_rejections, breaker_rejections, breaker_rejections);
    counter!(inc_checkpoints_written, checkpoints_written, checkpoints_written);
    counter!(inc_entities_finished, entities_finished, entities_finished);
    counter!(inc_entities_aborted, entities_aborted, entities_aborted);

    /// Emit all counters as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            remote_calls = self.remote_calls(),
            retries = self.retries(),
            rate_limited = self.rate_limited(),
            breaker_rejections = self.breaker_rejections(),
            checkpoints_written = self.checkpoints_written(),
            entities_finished = self.entities_finished(),
            entities_aborted = self.entities_aborted(),
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.remote_calls,
            &self.retries,
            &self.rate_limited,
            &self.breaker_rejections,
            &self.checkpoints_written,
            &self.entities_finished,
            &self.entities_aborted,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
