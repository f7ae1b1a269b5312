//! # Queue Perf - Main Entry Point
//!
//! Parses the command line, installs logging, builds the naming registry and
//! runs the selected role:
//!
//! - `sender`: produce warmup and measured messages, report the send rate
//! - `listener`: drain (optionally), announce READY, count deliveries,
//!   report the receive rate
//! - `loopback`: run the listener, wait for READY, then run the sender in
//!   the same process
//!
//! A failed run exits non-zero with the error chain on stderr.

use anyhow::Result;
use clap::Parser;
use queue_perf::{
    cli::{Args, Role},
    logging::init_logging,
    results::{ResultsManager, RunRecord},
    run_listener, run_loopback, run_sender,
    transport::{NamingContext, Registry, TransportConfig},
    BenchmarkParameters, HarnessError, RateReport,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _logging = init_logging(args.verbose, args.quiet, args.log_file.as_deref())?;

    let params = BenchmarkParameters::from_args(&args)?;
    info!("Queue Perf {} starting as {}", queue_perf::VERSION, args.role);
    info!("\n{}", params);

    let config = TransportConfig {
        message_queue_depth: args.pmq_depth,
        max_message_size: args.pmq_max_message_size,
    };
    let registry = Registry::with_defaults(&config);

    let mut record = RunRecord::new(args.role, &params.connection_factory_lookup, params.clone());
    match run_role(args.role, &params, &registry).await {
        Ok(reports) => {
            for (role, report) in reports {
                record.add_report(role, report);
            }
        }
        Err(e) => {
            error!("{} run failed: {}", args.role, e);
            return Err(e.into());
        }
    }

    ResultsManager::new(args.output_file.as_deref()).finalize(&record)?;
    Ok(())
}

async fn run_role(
    role: Role,
    params: &BenchmarkParameters,
    naming: &dyn NamingContext,
) -> Result<Vec<(Role, RateReport)>, HarnessError> {
    match role {
        Role::Sender => Ok(vec![(Role::Sender, run_sender(params, naming).await?)]),
        Role::Listener => Ok(vec![(
            Role::Listener,
            run_listener(params, naming, None).await?,
        )]),
        Role::Loopback => {
            let report = run_loopback(params, naming).await?;
            Ok(vec![
                (Role::Listener, report.received),
                (Role::Sender, report.sent),
            ])
        }
    }
}
