//! # Sender Driver
//!
//! Produces a warmup pass and a timed pass over one reusable payload and
//! reports the timed pass's throughput.
//!
//! Sends are awaited one at a time; the only suspension is the transport call
//! itself. A failed send or commit ends the run: retrying would skew the very
//! interval being measured.

use crate::{
    benchmark::{BenchmarkParameters, TransportHandle},
    error::{HarnessError, ResultExt},
    metrics::{PhaseTimings, ProgressReporter, RateReport},
    transaction::TransactionBatcher,
    transport::{Message, MessageProducer, NamingContext, ProducerOptions, Session},
};
use std::time::Instant;
use tracing::{debug, info};

/// Run the producer side of the benchmark
pub async fn run_sender(
    params: &BenchmarkParameters,
    naming: &dyn NamingContext,
) -> Result<RateReport, HarnessError> {
    params.validate()?;
    info!("params = {:?}", params);

    let handle = TransportHandle::acquire(params, naming).await?;
    let outcome = send_all(params, &handle).await;
    handle.release().await;
    outcome
}

async fn send_all(
    params: &BenchmarkParameters,
    handle: &TransportHandle,
) -> Result<RateReport, HarnessError> {
    let options = ProducerOptions {
        delivery_mode: params.delivery_mode,
        disable_message_id: true,
        disable_message_timestamp: true,
    };
    let mut producer = handle
        .session
        .create_producer(&handle.queue, options)
        .await
        .setup(format!("creating a producer on {}", handle.queue))?;
    let message = Message::zeroed(params.message_size);
    let session = handle.session.as_ref();

    info!("warming up by sending {} messages", params.warmup_messages);
    let mut batcher = TransactionBatcher::new(params.transacted, params.batch_size);
    send_phase(
        producer.as_mut(),
        session,
        &message,
        params.warmup_messages,
        &mut batcher,
        None,
    )
    .await?;
    info!("warmed up");

    let mut batcher = TransactionBatcher::new(params.transacted, params.batch_size);
    let progress = ProgressReporter::new(params.messages_to_send, "sent");
    let started = Instant::now();
    send_phase(
        producer.as_mut(),
        session,
        &message,
        params.messages_to_send,
        &mut batcher,
        Some((&progress, started)),
    )
    .await?;
    let timings = PhaseTimings::new(started, Instant::now());
    debug!("Measured phase used {} commits", batcher.commits());

    let report = RateReport::new(params.messages_to_send, params.message_size, timings);
    report.log();
    Ok(report)
}

/// Send `count` copies of `message`, committing through `batcher`.
///
/// The final partial batch is committed before returning, so the caller's
/// end timestamp covers all the phase's work.
async fn send_phase(
    producer: &mut dyn MessageProducer,
    session: &dyn Session,
    message: &Message,
    count: u64,
    batcher: &mut TransactionBatcher,
    progress: Option<(&ProgressReporter, Instant)>,
) -> Result<(), HarnessError> {
    for i in 1..=count {
        producer
            .send(message)
            .await
            .transport(format!("sending message {}", i))?;
        batcher.record(session).await?;
        if let Some((progress, started)) = progress {
            progress.observe(i, started);
        }
    }
    batcher.finish(session).await?;
    Ok(())
}
