use crate::transport::DeliveryMode;
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Queue Perf - measure steady-state throughput of a point-to-point queue
///
/// Start the listener first and wait for its READY line, then start the
/// sender with the same parameters.
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Which side of the queue to drive
    #[clap(value_enum)]
    pub role: Role,

    /// Messages in the measured phase
    pub message_count: u64,

    /// Messages exchanged before measurement starts
    pub warmup_messages: u64,

    /// Payload size in bytes
    pub message_size: usize,

    /// Delivery durability requested from the producer
    #[clap(value_enum)]
    pub delivery_mode: DeliveryMode,

    /// Group sends and receipts into transactions
    #[clap(action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub transacted: bool,

    /// Messages per transaction when transacted
    pub batch_size: u64,

    /// Acknowledgement mode: DUPS_OK selects lazy acknowledgement, anything else auto
    #[clap(action = ArgAction::Set, value_parser = parse_dups_ok)]
    pub dups_ok: bool,

    /// Discard messages left on the queue before the listener reports ready
    #[clap(action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub drain_queue: bool,

    /// Name under which the queue is looked up (e.g. queue/perfQueue)
    pub queue_lookup: String,

    /// Name under which the connection factory is looked up (memory, pmq)
    pub connection_factory_lookup: String,

    /// Bounded wait per receive while draining the queue
    #[clap(long, value_parser = parse_duration, default_value = "5s", help_heading = "Timing")]
    pub drain_timeout: Duration,

    /// Give up waiting for the listener to finish after this long (default: wait forever)
    #[clap(long, value_parser = parse_duration, help_heading = "Timing")]
    pub completion_timeout: Option<Duration>,

    /// Write the run results to this file (JSON format)
    #[clap(short = 'o', long, help_heading = "Output")]
    pub output_file: Option<PathBuf>,

    /// Also write log output to this file
    #[clap(long, help_heading = "Output")]
    pub log_file: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[clap(short = 'v', long, action = ArgAction::Count, help_heading = "Output")]
    pub verbose: u8,

    /// Only log warnings and errors
    #[clap(short = 'q', long, help_heading = "Output")]
    pub quiet: bool,

    /// POSIX Message Queue: maximum number of messages in a newly created queue
    #[clap(long, default_value_t = crate::defaults::PMQ_DEPTH, help_heading = "Transport")]
    pub pmq_depth: usize,

    /// POSIX Message Queue: maximum message size of a newly created queue
    #[clap(long, default_value_t = crate::defaults::PMQ_MAX_MESSAGE_SIZE, help_heading = "Transport")]
    pub pmq_max_message_size: usize,
}

/// Role this process plays in the benchmark
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum Role {
    /// Produce messages and time the send path
    #[clap(name = "sender")]
    Sender,

    /// Consume messages and time the receive path
    #[clap(name = "listener")]
    Listener,

    /// Run listener and sender in this process
    #[clap(name = "loopback")]
    Loopback,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Sender => write!(f, "sender"),
            Role::Listener => write!(f, "listener"),
            Role::Loopback => write!(f, "loopback"),
        }
    }
}

/// `DUPS_OK` (any case) selects lazy acknowledgement; every other value means auto
fn parse_dups_ok(s: &str) -> Result<bool, String> {
    Ok(s.trim().eq_ignore_ascii_case("DUPS_OK"))
}

/// Parse duration from string (e.g., "500ms", "10s", "5m", "1h")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, multiplier_ms) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, 1.0)
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, 1_000.0)
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, 60_000.0)
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, 3_600_000.0)
    } else {
        (s, 1_000.0) // Default to seconds
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be a non-negative number: {}", s));
    }

    Ok(Duration::from_millis((num * multiplier_ms) as u64))
}
