//! # Rate Reporting
//!
//! Pure helpers turning a message count and a measured interval into a
//! throughput figure, plus the progress cadence shared by both roles.
//!
//! Every measured phase captures its own [`PhaseTimings`] value; nothing here
//! keeps a shared start timestamp around between phases.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::info;

/// Number of progress lines a full measured phase emits
pub const PROGRESS_STEPS: u64 = 10;

/// Messages per second for `count` messages between two millisecond timestamps.
///
/// ```rust
/// # use queue_perf::metrics::messages_per_second;
/// assert_eq!(messages_per_second(1000, 0, 2000), 500.0);
/// ```
pub fn messages_per_second(count: u64, start_ms: u64, end_ms: u64) -> f64 {
    let duration_secs = (end_ms as f64 - start_ms as f64) / 1000.0;
    rate_over(count, duration_secs)
}

/// A zero or negative interval reports 0.0 rather than infinity.
fn rate_over(count: u64, duration_secs: f64) -> f64 {
    if duration_secs > 0.0 {
        count as f64 / duration_secs
    } else {
        0.0
    }
}

/// Start and end of one measured phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTimings {
    pub started: Instant,
    pub finished: Instant,
}

impl PhaseTimings {
    pub fn new(started: Instant, finished: Instant) -> Self {
        Self { started, finished }
    }

    pub fn elapsed(&self) -> Duration {
        self.finished.saturating_duration_since(self.started)
    }
}

/// Final throughput figure for a measured phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateReport {
    pub messages: u64,
    pub message_size: usize,
    pub elapsed: Duration,
    pub messages_per_second: f64,
    pub bytes_per_second: f64,
}

impl RateReport {
    pub fn new(messages: u64, message_size: usize, timings: PhaseTimings) -> Self {
        let elapsed = timings.elapsed();
        let secs = elapsed.as_secs_f64();
        Self {
            messages,
            message_size,
            elapsed,
            messages_per_second: rate_over(messages, secs),
            bytes_per_second: rate_over(messages.saturating_mul(message_size as u64), secs),
        }
    }

    /// Log the summary line for this report
    pub fn log(&self) {
        info!("{}", self);
    }
}

impl fmt::Display for RateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "average: {:.2} msg/s ({} messages in {:.2}s)",
            self.messages_per_second,
            self.messages,
            self.elapsed.as_secs_f64()
        )
    }
}

/// Decides when a measured phase logs its progress.
///
/// Lines fire on `total/10, 2*total/10, ..., total`. With fewer than ten
/// messages the step is zero and no periodic line fires at all.
#[derive(Debug, Clone, Copy)]
pub struct ProgressReporter {
    step: u64,
    verb: &'static str,
}

impl ProgressReporter {
    pub fn new(total: u64, verb: &'static str) -> Self {
        Self {
            step: total / PROGRESS_STEPS,
            verb,
        }
    }

    pub fn should_report(&self, count: u64) -> bool {
        self.step != 0 && count % self.step == 0
    }

    /// Log a progress line if `count` lands on a step boundary
    pub fn observe(&self, count: u64, started: Instant) {
        if self.should_report(count) {
            info!(
                "{} {:6} messages in {:.2}s",
                self.verb,
                count,
                started.elapsed().as_secs_f64()
            );
        }
    }
}
