//! Run identifiers and the unit scaling used by the run summary line.
//!
//! ```rust
//! use queue_perf::utils::*;
//! use std::time::Duration;
//!
//! assert_eq!(format_rate(1536.0), "1.50 KB/s");
//! assert_eq!(format_message_rate(15500.0), "15.50K msg/s");
//! assert_eq!(format_elapsed(Duration::from_millis(2500)), "2.50s");
//! ```

use std::time::Duration;
use uuid::Uuid;

const BYTE_UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
const COUNT_UNITS: [&str; 3] = ["", "K", "M"];

/// Generate a unique identifier for a run
pub fn generate_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Divide `value` by `base` until it fits the largest unit it reaches.
/// Returns the scaled value and the index of its unit.
fn scale(mut value: f64, base: f64, units: usize) -> (f64, usize) {
    let mut unit = 0;
    while value >= base && unit + 1 < units {
        value /= base;
        unit += 1;
    }
    (value, unit)
}

/// Byte throughput in binary units, e.g. "1.50 KB/s"
pub fn format_rate(bytes_per_second: f64) -> String {
    match scale(bytes_per_second, 1024.0, BYTE_UNITS.len()) {
        (value, 0) => format!("{:.0} B/s", value),
        (value, unit) => format!("{:.2} {}/s", value, BYTE_UNITS[unit]),
    }
}

/// Message throughput in decimal units, e.g. "15.50K msg/s"
pub fn format_message_rate(messages_per_second: f64) -> String {
    match scale(messages_per_second, 1000.0, COUNT_UNITS.len()) {
        (value, 0) => format!("{:.0} msg/s", value),
        (value, unit) => format!("{:.2}{} msg/s", value, COUNT_UNITS[unit]),
    }
}

/// Measured phase length: seconds, with minutes split off for long runs
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs < 60.0 {
        format!("{:.2}s", secs)
    } else {
        let minutes = elapsed.as_secs() / 60;
        format!("{}m {:.2}s", minutes, secs - (minutes * 60) as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_rate() {
        assert_eq!(format_rate(0.0), "0 B/s");
        assert_eq!(format_rate(512.0), "512 B/s");
        assert_eq!(format_rate(1536.0), "1.50 KB/s");
        assert_eq!(format_rate(2621440.0), "2.50 MB/s");
        assert_eq!(format_rate(3.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0), "3072.00 GB/s");
    }

    #[test]
    fn test_format_message_rate() {
        assert_eq!(format_message_rate(750.0), "750 msg/s");
        assert_eq!(format_message_rate(15500.0), "15.50K msg/s");
        assert_eq!(format_message_rate(2300000.0), "2.30M msg/s");
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::ZERO), "0.00s");
        assert_eq!(format_elapsed(Duration::from_millis(2500)), "2.50s");
        assert_eq!(format_elapsed(Duration::from_millis(90_250)), "1m 30.25s");
    }

    #[test]
    fn test_run_ids_are_unique() {
        assert_ne!(generate_run_id(), generate_run_id());
    }
}
