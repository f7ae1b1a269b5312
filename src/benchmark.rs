//! # Benchmark Parameters and Transport Acquisition
//!
//! This module holds what both roles share:
//!
//! - **BenchmarkParameters**: the immutable description of a run, built once
//!   from the command line and owned by the active driver for the run's
//!   lifetime.
//! - **TransportHandle**: the connection and session a driver works through,
//!   acquired via the naming context and released exactly once at the end of
//!   the run, whether it succeeded or not.

use crate::{
    cli::Args,
    error::{HarnessError, ResultExt},
    transport::{AcknowledgeMode, Connection, DeliveryMode, NamingContext, QueueRef, Session},
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for a single benchmark run
///
/// Both the sender and the listener consume the same parameters; a listener
/// and sender pair must agree on message and warmup counts for the listener
/// to ever complete.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkParameters {
    /// Messages in the measured phase
    pub messages_to_send: u64,

    /// Messages exchanged before measurement starts
    pub warmup_messages: u64,

    /// Payload size in bytes
    pub message_size: usize,

    /// Delivery durability requested from the producer
    pub delivery_mode: DeliveryMode,

    /// Group sends and receipts into transactions of `batch_size`
    pub transacted: bool,

    /// Messages per transaction; ignored unless `transacted`
    pub batch_size: u64,

    /// Lazy acknowledgement for non-transacted sessions
    pub dups_ok: bool,

    /// Listener discards stale messages before reporting ready
    pub drain_queue: bool,

    /// Name the queue is looked up under
    pub queue_lookup: String,

    /// Name the connection factory is looked up under
    pub connection_factory_lookup: String,

    /// Bounded wait per receive while draining
    pub drain_timeout: Duration,

    /// Optional limit on how long the listener waits for completion
    pub completion_timeout: Option<Duration>,
}

impl Default for BenchmarkParameters {
    fn default() -> Self {
        Self {
            messages_to_send: crate::defaults::MSG_COUNT,
            warmup_messages: crate::defaults::WARMUP_MESSAGES,
            message_size: crate::defaults::MESSAGE_SIZE,
            delivery_mode: DeliveryMode::NonPersistent,
            transacted: false,
            batch_size: crate::defaults::BATCH_SIZE,
            dups_ok: false,
            drain_queue: false,
            queue_lookup: "queue/perfQueue".to_string(),
            connection_factory_lookup: "memory".to_string(),
            drain_timeout: crate::defaults::DRAIN_TIMEOUT,
            completion_timeout: None,
        }
    }
}

impl BenchmarkParameters {
    /// Create validated parameters from CLI arguments
    pub fn from_args(args: &Args) -> Result<Self, HarnessError> {
        let params = Self {
            messages_to_send: args.message_count,
            warmup_messages: args.warmup_messages,
            message_size: args.message_size,
            delivery_mode: args.delivery_mode,
            transacted: args.transacted,
            batch_size: args.batch_size,
            dups_ok: args.dups_ok,
            drain_queue: args.drain_queue,
            queue_lookup: args.queue_lookup.clone(),
            connection_factory_lookup: args.connection_factory_lookup.clone(),
            drain_timeout: args.drain_timeout,
            completion_timeout: args.completion_timeout,
        };
        params.validate()?;
        Ok(params)
    }

    /// Check the invariants the drivers rely on
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.transacted && self.batch_size == 0 {
            return Err(HarnessError::InvalidParameters(
                "batch size must be greater than 0 for transacted runs".to_string(),
            ));
        }
        if self.messages_to_send == 0 {
            return Err(HarnessError::InvalidParameters(
                "message count must be greater than 0".to_string(),
            ));
        }
        if self.queue_lookup.is_empty() || self.connection_factory_lookup.is_empty() {
            return Err(HarnessError::InvalidParameters(
                "queue and connection factory names must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Session acknowledgement mode implied by these parameters
    pub fn acknowledge_mode(&self) -> AcknowledgeMode {
        if self.transacted {
            AcknowledgeMode::Transacted
        } else if self.dups_ok {
            AcknowledgeMode::DupsOk
        } else {
            AcknowledgeMode::Auto
        }
    }

    pub fn is_durable(&self) -> bool {
        self.delivery_mode == DeliveryMode::Persistent
    }
}

impl std::fmt::Display for BenchmarkParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "-----------------------------------------------------------------"
        )?;
        writeln!(f, "  Queue:              {}", self.queue_lookup)?;
        writeln!(f, "  Connection Factory: {}", self.connection_factory_lookup)?;
        writeln!(f, "  Message Count:      {}", self.messages_to_send)?;
        writeln!(f, "  Warmup Messages:    {}", self.warmup_messages)?;
        writeln!(f, "  Message Size:       {} bytes", self.message_size)?;
        writeln!(f, "  Delivery Mode:      {}", self.delivery_mode)?;
        if self.transacted {
            writeln!(f, "  Transactions:       batches of {}", self.batch_size)?;
        } else {
            writeln!(f, "  Acknowledgement:    {:?}", self.acknowledge_mode())?;
        }
        if self.drain_queue {
            writeln!(f, "  Drain Wait:         {:?}", self.drain_timeout)?;
        }
        if let Some(timeout) = self.completion_timeout {
            writeln!(f, "  Completion Timeout: {:?}", timeout)?;
        }
        write!(
            f,
            "-----------------------------------------------------------------"
        )
    }
}

/// An open connection and session against the benchmark queue
pub struct TransportHandle {
    pub queue: QueueRef,
    pub connection: Box<dyn Connection>,
    pub session: Arc<dyn Session>,
}

impl TransportHandle {
    /// Resolve the queue and connection factory, then open a connection and
    /// a session in the acknowledgement mode the parameters ask for.
    pub async fn acquire(
        params: &BenchmarkParameters,
        naming: &dyn NamingContext,
    ) -> Result<Self, HarnessError> {
        let queue = naming
            .lookup_queue(&params.queue_lookup)
            .setup(format!("looking up queue '{}'", params.queue_lookup))?;
        let factory = naming
            .lookup_connection_factory(&params.connection_factory_lookup)
            .setup(format!(
                "looking up connection factory '{}'",
                params.connection_factory_lookup
            ))?;

        let connection = factory
            .create_connection()
            .await
            .setup(format!("connecting through {}", factory.name()))?;

        let session = match connection.create_session(params.acknowledge_mode()).await {
            Ok(session) => session,
            Err(e) => {
                close_connection(connection.as_ref()).await;
                return Err(HarnessError::Setup {
                    stage: "creating a session".to_string(),
                    source: e,
                });
            }
        };

        debug!(
            "Acquired {} session on {} via {}",
            match session.acknowledge_mode() {
                AcknowledgeMode::Transacted => "transacted",
                AcknowledgeMode::Auto => "auto-acknowledge",
                AcknowledgeMode::DupsOk => "dups-ok",
            },
            queue,
            factory.name()
        );
        Ok(Self {
            queue,
            connection,
            session,
        })
    }

    /// Close the connection. Failures are logged, never propagated.
    pub async fn release(self) {
        close_connection(self.connection.as_ref()).await;
    }
}

async fn close_connection(connection: &dyn Connection) {
    match connection.close().await {
        Ok(()) => info!("Connection closed"),
        Err(e) => warn!("Failed to close connection: {:#}", e),
    }
}
