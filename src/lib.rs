//! # Queue Perf Library
//!
//! A throughput benchmark harness for point-to-point message queues. One
//! process runs the **listener**, which registers an asynchronous callback on
//! a queue and counts deliveries; another runs the **sender**, which pushes a
//! fixed number of same-sized payloads at the queue. Each side times its own
//! measured phase and reports messages per second.
//!
//! ## Run Lifecycle
//!
//! Both roles go through the same stages:
//!
//! 1. Validate [`BenchmarkParameters`].
//! 2. Resolve the queue and connection factory through a
//!    [`transport::NamingContext`], then open a connection and a session.
//! 3. Exchange warmup messages, untimed.
//! 4. Exchange the measured messages, committing every `batch_size` messages
//!    when transacted, and log progress ten times along the way.
//! 5. Log the average rate and close the connection.
//!
//! ## Modules
//!
//! - `transport`: the messaging abstraction plus the in-memory and POSIX
//!   message queue transports
//! - `sender` / `listener`: the two role drivers, and `loopback` running
//!   both in one process
//! - `transaction`: commit batching shared by both drivers
//! - `metrics`: rate computation and progress cadence
//! - `results`: the JSON run record
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use queue_perf::{run_loopback, BenchmarkParameters};
//! use queue_perf::transport::{Registry, TransportConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = Registry::with_defaults(&TransportConfig::default());
//!     let params = BenchmarkParameters {
//!         connection_factory_lookup: "pmq".to_string(),
//!         ..Default::default()
//!     };
//!
//!     let report = run_loopback(&params, &registry).await?;
//!     println!("sent: {}", report.sent);
//!     println!("received: {}", report.received);
//!     Ok(())
//! }
//! ```

/// Benchmark parameters and transport acquisition shared by both roles
pub mod benchmark;

/// Command-line interface
///
/// Positional arguments describe the run; flags tune timing, output and the
/// POSIX message queue transport.
pub mod cli;

pub mod error;

/// Receiver driver: drain, warmup and measured phases via a delivery callback
pub mod listener;

pub mod logging;

/// Listener and sender driven together in one process
pub mod loopback;

/// Rate computation and progress reporting
pub mod metrics;

/// Run records and JSON output
pub mod results;

/// Sender driver
pub mod sender;

pub mod transaction;

/// Messaging abstraction and transport implementations
///
/// Drivers only see the traits defined here; which transport they talk to is
/// decided by the name the connection factory is looked up under.
pub mod transport;

pub mod utils;

pub use benchmark::{BenchmarkParameters, TransportHandle};
pub use cli::{Args, Role};
pub use error::HarnessError;
pub use listener::run_listener;
pub use loopback::{run_loopback, LoopbackReport};
pub use metrics::{PhaseTimings, RateReport};
pub use results::{ResultsManager, RunRecord};
pub use sender::run_sender;

/// The current version of the harness
///
/// Populated from Cargo.toml and recorded in every run record.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Default payload size in bytes
    pub const MESSAGE_SIZE: usize = 1024;

    /// Default number of measured messages
    pub const MSG_COUNT: u64 = 10000;

    /// Default number of warmup messages
    ///
    /// Warmup lets the transport reach steady state before the clock starts.
    pub const WARMUP_MESSAGES: u64 = 1000;

    /// Default messages per transaction
    pub const BATCH_SIZE: u64 = 100;

    /// Bounded wait per receive while draining a queue
    pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

    /// POSIX Message Queue: default maximum number of queued messages
    ///
    /// Matches the usual `/proc/sys/fs/mqueue/msg_max` limit for unprivileged
    /// users.
    pub const PMQ_DEPTH: usize = 10;

    /// POSIX Message Queue: default maximum message size
    pub const PMQ_MAX_MESSAGE_SIZE: usize = 8192;
}
