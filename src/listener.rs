//! # Receiver Driver
//!
//! The listener registers an asynchronous callback with the transport and
//! counts deliveries through a small state machine:
//!
//! ```text
//! Warmup --(warmup count reached)--> Measuring --(message count reached)--> Complete
//! ```
//!
//! A run without warmup messages starts directly in `Measuring`. The first
//! message seen in `Measuring` sets the timing baseline; the message that
//! completes the count records the end and fires the one-shot completion
//! signal, which carries the phase timings back to the driving task.
//!
//! ## Concurrency
//!
//! The transport invokes the callback from a task it owns and awaits it before
//! delivering the next message. The state machine still sits behind a mutex so
//! the compound phase transition never depends on that contract alone.
//! Commits are awaited inside the callback, which holds back further delivery
//! and bounds unacknowledged work to one batch.

use crate::{
    benchmark::{BenchmarkParameters, TransportHandle},
    error::{HarnessError, ResultExt},
    metrics::{PhaseTimings, ProgressReporter, RateReport},
    transaction::TransactionBatcher,
    transport::{Message, MessageConsumer, MessageListener, NamingContext, Session},
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info};

/// Run the consumer side of the benchmark.
///
/// `ready` is notified right after the READY line is logged, for callers that
/// start a sender in the same process.
pub async fn run_listener(
    params: &BenchmarkParameters,
    naming: &dyn NamingContext,
    ready: Option<oneshot::Sender<()>>,
) -> Result<RateReport, HarnessError> {
    params.validate()?;
    info!("params = {:?}", params);

    let handle = TransportHandle::acquire(params, naming).await?;
    let outcome = listen(params, &handle, ready).await;
    handle.release().await;
    outcome
}

async fn listen(
    params: &BenchmarkParameters,
    handle: &TransportHandle,
    ready: Option<oneshot::Sender<()>>,
) -> Result<RateReport, HarnessError> {
    let mut consumer = handle
        .session
        .create_consumer(&handle.queue)
        .await
        .setup(format!("creating a consumer on {}", handle.queue))?;
    handle
        .connection
        .start()
        .await
        .setup("starting the connection")?;

    if params.drain_queue {
        drain_queue(consumer.as_mut(), params.drain_timeout).await?;
    }

    info!("READY!!!");
    if let Some(ready) = ready {
        let _ = ready.send(());
    }

    let (completion_tx, completion_rx) = oneshot::channel();
    let listener = Arc::new(PerfListener::new(
        params,
        handle.session.clone(),
        completion_tx,
    ));
    consumer
        .set_message_listener(listener)
        .await
        .setup("registering the message listener")?;

    let timings = wait_for_completion(completion_rx, params.completion_timeout).await?;
    // Stop delivery before the connection goes away.
    drop(consumer);

    let report = RateReport::new(params.messages_to_send, params.message_size, timings);
    report.log();
    Ok(report)
}

/// Wait for the completion signal, forever unless a timeout is configured.
///
/// Without a timeout a stalled transport keeps the run waiting indefinitely.
async fn wait_for_completion(
    completion: oneshot::Receiver<PhaseTimings>,
    timeout: Option<Duration>,
) -> Result<PhaseTimings, HarnessError> {
    let outcome = match timeout {
        None => completion.await,
        Some(limit) => match tokio::time::timeout(limit, completion).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(HarnessError::Interrupted(format!(
                    "no completion after {:?}",
                    limit
                )))
            }
        },
    };
    outcome.map_err(|_| {
        HarnessError::Interrupted("message delivery stopped before completion".to_string())
    })
}

/// Pull and discard messages until a pull comes back empty.
///
/// Clears out whatever an earlier run left behind. Returns the number of
/// messages discarded.
pub async fn drain_queue(
    consumer: &mut dyn MessageConsumer,
    wait: Duration,
) -> Result<u64, HarnessError> {
    info!("draining queue");
    let mut drained = 0u64;
    while consumer
        .receive(wait)
        .await
        .transport("draining the queue")?
        .is_some()
    {
        drained += 1;
    }
    info!("queue is drained");
    debug!("Discarded {} stale messages", drained);
    Ok(drained)
}

/// Where the callback state machine currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivePhase {
    Warmup,
    Measuring,
    Complete,
}

struct ReceiveState {
    phase: ReceivePhase,
    received_in_phase: u64,
    batcher: TransactionBatcher,
    measure_started: Option<Instant>,
    completion: Option<oneshot::Sender<PhaseTimings>>,
}

/// Delivery callback counting warmup and measured messages
pub struct PerfListener {
    warmup_messages: u64,
    messages_to_send: u64,
    transacted: bool,
    batch_size: u64,
    progress: ProgressReporter,
    session: Arc<dyn Session>,
    state: Mutex<ReceiveState>,
}

impl PerfListener {
    pub fn new(
        params: &BenchmarkParameters,
        session: Arc<dyn Session>,
        completion: oneshot::Sender<PhaseTimings>,
    ) -> Self {
        let phase = if params.warmup_messages > 0 {
            ReceivePhase::Warmup
        } else {
            ReceivePhase::Measuring
        };
        Self {
            warmup_messages: params.warmup_messages,
            messages_to_send: params.messages_to_send,
            transacted: params.transacted,
            batch_size: params.batch_size,
            progress: ProgressReporter::new(params.messages_to_send, "received"),
            session,
            state: Mutex::new(ReceiveState {
                phase,
                received_in_phase: 0,
                batcher: TransactionBatcher::new(params.transacted, params.batch_size),
                measure_started: None,
                completion: Some(completion),
            }),
        }
    }

    pub async fn phase(&self) -> ReceivePhase {
        self.state.lock().await.phase
    }

    /// Advance the state machine by one delivered message.
    ///
    /// Phase boundaries are crossed even when a commit on the boundary
    /// message fails; the commit error is returned after the transition.
    async fn handle_delivery(&self) -> Result<(), HarnessError> {
        let mut state = self.state.lock().await;
        let session = self.session.as_ref();

        match state.phase {
            ReceivePhase::Warmup => {
                state.received_in_phase += 1;
                let recorded = state.batcher.record(session).await.map(drop);
                if state.received_in_phase != self.warmup_messages {
                    return recorded;
                }

                let finished = state.batcher.finish(session).await.map(drop);
                info!(
                    "warmed up after receiving {} msgs",
                    state.received_in_phase
                );
                state.phase = ReceivePhase::Measuring;
                state.received_in_phase = 0;
                state.batcher = TransactionBatcher::new(self.transacted, self.batch_size);
                recorded.and(finished)
            }
            ReceivePhase::Measuring => {
                let started = *state.measure_started.get_or_insert_with(Instant::now);
                state.received_in_phase += 1;
                let count = state.received_in_phase;
                let recorded = state.batcher.record(session).await.map(drop);
                self.progress.observe(count, started);
                if count != self.messages_to_send {
                    return recorded;
                }

                let finished = state.batcher.finish(session).await.map(drop);
                let timings = PhaseTimings::new(started, Instant::now());
                state.phase = ReceivePhase::Complete;
                if let Some(completion) = state.completion.take() {
                    let _ = completion.send(timings);
                }
                recorded.and(finished)
            }
            ReceivePhase::Complete => {
                debug!("Ignoring message delivered after completion");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl MessageListener for PerfListener {
    async fn on_message(&self, _message: Message) {
        // The delivery task belongs to the transport; never let a failure
        // escape into it.
        if let Err(e) = self.handle_delivery().await {
            error!("Failed to process delivered message: {:#}", anyhow::Error::new(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{
        AcknowledgeMode, ConnectionFactory, MemoryBroker, MemoryConnectionFactory, QueueRef,
        Registry,
    };
    use tokio::sync::oneshot::error::TryRecvError;

    /// Log output of the current thread, captured for assertions
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn install(&self) -> tracing::subscriber::DefaultGuard {
            let logs = self.clone();
            let subscriber = tracing_subscriber::fmt()
                .with_writer(move || logs.clone())
                .with_ansi(false)
                .with_target(false)
                .without_time()
                .finish();
            tracing::subscriber::set_default(subscriber)
        }

        fn messages(&self) -> Vec<String> {
            String::from_utf8_lossy(&self.0.lock())
                .lines()
                .map(|line| line.trim().trim_start_matches("INFO").trim().to_string())
                .collect()
        }

        fn count(&self, message: &str) -> usize {
            self.messages().iter().filter(|m| *m == message).count()
        }

        fn position(&self, message: &str) -> Option<usize> {
            self.messages().iter().position(|m| m == message)
        }
    }

    fn registry(broker: &MemoryBroker) -> Registry {
        let mut registry = Registry::new();
        registry.bind_connection_factory(
            "memory",
            Arc::new(MemoryConnectionFactory::new(broker.clone())),
        );
        registry
    }

    async fn session(broker: &MemoryBroker, mode: AcknowledgeMode) -> Arc<dyn Session> {
        let connection = MemoryConnectionFactory::new(broker.clone())
            .create_connection()
            .await
            .unwrap();
        connection.create_session(mode).await.unwrap()
    }

    fn transacted_params() -> BenchmarkParameters {
        BenchmarkParameters {
            messages_to_send: 100,
            warmup_messages: 10,
            transacted: true,
            batch_size: 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_completion_fires_after_last_delivery() {
        let broker = MemoryBroker::new();
        let session = session(&broker, AcknowledgeMode::Transacted).await;
        let (tx, mut rx) = oneshot::channel();
        let listener = PerfListener::new(&transacted_params(), session, tx);

        for i in 1..=109 {
            listener.on_message(Message::zeroed(1)).await;
            if i < 10 {
                assert_eq!(listener.phase().await, ReceivePhase::Warmup);
            } else {
                assert_eq!(listener.phase().await, ReceivePhase::Measuring);
            }
            assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        }

        listener.on_message(Message::zeroed(1)).await;
        assert_eq!(listener.phase().await, ReceivePhase::Complete);
        assert!(rx.try_recv().is_ok());
        // One warmup commit and ten measured commits.
        assert_eq!(broker.stats().commits, 11);
    }

    #[tokio::test]
    async fn test_partial_batches_are_committed_at_phase_ends() {
        let broker = MemoryBroker::new();
        let session = session(&broker, AcknowledgeMode::Transacted).await;
        let (tx, mut rx) = oneshot::channel();
        let params = BenchmarkParameters {
            messages_to_send: 25,
            warmup_messages: 5,
            transacted: true,
            batch_size: 10,
            ..Default::default()
        };
        let listener = PerfListener::new(&params, session, tx);

        for _ in 0..30 {
            listener.on_message(Message::zeroed(1)).await;
        }
        assert!(rx.try_recv().is_ok());
        // ceil(5 / 10) + ceil(25 / 10)
        assert_eq!(broker.stats().commits, 1 + 3);
    }

    #[tokio::test]
    async fn test_no_warmup_starts_measuring() {
        let broker = MemoryBroker::new();
        let session = session(&broker, AcknowledgeMode::Auto).await;
        let (tx, mut rx) = oneshot::channel();
        let params = BenchmarkParameters {
            messages_to_send: 3,
            warmup_messages: 0,
            ..Default::default()
        };
        let listener = PerfListener::new(&params, session, tx);
        assert_eq!(listener.phase().await, ReceivePhase::Measuring);

        for _ in 0..3 {
            listener.on_message(Message::zeroed(1)).await;
        }
        let timings = rx.try_recv().unwrap();
        assert!(timings.finished >= timings.started);
        assert_eq!(broker.stats().commits, 0);
    }

    #[tokio::test]
    async fn test_deliveries_after_completion_are_ignored() {
        let broker = MemoryBroker::new();
        let session = session(&broker, AcknowledgeMode::Transacted).await;
        let (tx, _rx) = oneshot::channel();
        let params = BenchmarkParameters {
            messages_to_send: 2,
            warmup_messages: 0,
            transacted: true,
            batch_size: 1,
            ..Default::default()
        };
        let listener = PerfListener::new(&params, session, tx);

        for _ in 0..5 {
            listener.on_message(Message::zeroed(1)).await;
        }
        assert_eq!(listener.phase().await, ReceivePhase::Complete);
        assert_eq!(broker.stats().commits, 2);
    }

    #[tokio::test]
    async fn test_callback_errors_are_swallowed() {
        let broker = MemoryBroker::new();
        broker.fail_commits_after(0);
        let session = session(&broker, AcknowledgeMode::Transacted).await;
        let (tx, mut rx) = oneshot::channel();
        let params = BenchmarkParameters {
            messages_to_send: 2,
            warmup_messages: 0,
            transacted: true,
            batch_size: 1,
            ..Default::default()
        };
        let listener = PerfListener::new(&params, session, tx);

        // Every commit fails, yet each delivery still advances the count.
        listener.on_message(Message::zeroed(1)).await;
        assert_eq!(listener.phase().await, ReceivePhase::Measuring);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        listener.on_message(Message::zeroed(1)).await;
        assert_eq!(listener.phase().await, ReceivePhase::Complete);
        assert!(rx.try_recv().is_ok());
        assert_eq!(broker.stats().commits, 0);
    }

    #[tokio::test]
    async fn test_failed_commit_on_last_warmup_message_still_starts_measuring() {
        let broker = MemoryBroker::new();
        let session = session(&broker, AcknowledgeMode::Transacted).await;
        let (tx, mut rx) = oneshot::channel();
        let params = BenchmarkParameters {
            messages_to_send: 4,
            warmup_messages: 2,
            transacted: true,
            batch_size: 2,
            ..Default::default()
        };
        let listener = PerfListener::new(&params, session, tx);

        listener.on_message(Message::zeroed(1)).await;
        broker.fail_commits_after(0);
        listener.on_message(Message::zeroed(1)).await;
        assert_eq!(listener.phase().await, ReceivePhase::Measuring);

        broker.fail_commits_after(u64::MAX);
        for _ in 0..4 {
            listener.on_message(Message::zeroed(1)).await;
        }
        assert_eq!(listener.phase().await, ReceivePhase::Complete);
        assert!(rx.try_recv().is_ok());
        assert_eq!(broker.stats().commits, 2);
    }

    #[tokio::test]
    async fn test_failed_commit_on_last_measured_message_still_completes() {
        let broker = MemoryBroker::new();
        let session = session(&broker, AcknowledgeMode::Transacted).await;
        let (tx, mut rx) = oneshot::channel();
        let params = BenchmarkParameters {
            messages_to_send: 4,
            warmup_messages: 0,
            transacted: true,
            batch_size: 2,
            ..Default::default()
        };
        let listener = PerfListener::new(&params, session, tx);

        for _ in 0..3 {
            listener.on_message(Message::zeroed(1)).await;
        }
        assert_eq!(broker.stats().commits, 1);

        broker.fail_commits_after(1);
        listener.on_message(Message::zeroed(1)).await;
        assert_eq!(listener.phase().await, ReceivePhase::Complete);
        assert!(rx.try_recv().is_ok());

        // Later deliveries are ignored once complete.
        broker.fail_commits_after(u64::MAX);
        for _ in 0..10 {
            listener.on_message(Message::zeroed(1)).await;
        }
        assert_eq!(broker.stats().commits, 1);
    }

    #[tokio::test]
    async fn test_drain_discards_stale_messages() {
        let broker = MemoryBroker::new();
        broker.enqueue("stale", Message::zeroed(1));
        let connection = MemoryConnectionFactory::new(broker.clone())
            .create_connection()
            .await
            .unwrap();
        let session = connection
            .create_session(AcknowledgeMode::Auto)
            .await
            .unwrap();
        let mut consumer = session.create_consumer(&QueueRef::new("stale")).await.unwrap();
        connection.start().await.unwrap();

        let logs = CapturedLogs::default();
        let _guard = logs.install();
        let drained = drain_queue(consumer.as_mut(), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(drained, 1);
        assert_eq!(broker.depth("stale"), 0);

        assert_eq!(logs.count("draining queue"), 1);
        assert_eq!(logs.count("queue is drained"), 1);
        assert!(logs.position("draining queue") < logs.position("queue is drained"));
    }

    #[tokio::test]
    async fn test_run_listener_end_to_end() {
        let broker = MemoryBroker::new();
        let registry = registry(&broker);
        let params = transacted_params();
        let (ready_tx, ready_rx) = oneshot::channel();

        let feeder = {
            let broker = broker.clone();
            async move {
                ready_rx.await.unwrap();
                for _ in 0..110 {
                    broker.enqueue("perfQueue", Message::zeroed(8));
                }
            }
        };
        let (report, ()) = tokio::join!(run_listener(&params, &registry, Some(ready_tx)), feeder);

        let report = report.unwrap();
        assert_eq!(report.messages, 100);
        let stats = broker.stats();
        assert_eq!(stats.commits, 11);
        assert_eq!(stats.deliveries, 110);
        assert_eq!(stats.closed_connections, 1);
    }

    #[tokio::test]
    async fn test_run_listener_drains_before_ready() {
        let broker = MemoryBroker::new();
        broker.enqueue("perfQueue", Message::zeroed(8));
        broker.enqueue("perfQueue", Message::zeroed(8));
        let registry = registry(&broker);
        let params = BenchmarkParameters {
            messages_to_send: 10,
            warmup_messages: 0,
            drain_queue: true,
            drain_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let (ready_tx, ready_rx) = oneshot::channel();
        let logs = CapturedLogs::default();
        let _guard = logs.install();

        let feeder = {
            let broker = broker.clone();
            async move {
                ready_rx.await.unwrap();
                assert_eq!(broker.depth("perfQueue"), 0);
                for _ in 0..10 {
                    broker.enqueue("perfQueue", Message::zeroed(8));
                }
            }
        };
        let (report, ()) = tokio::join!(run_listener(&params, &registry, Some(ready_tx)), feeder);

        assert_eq!(report.unwrap().messages, 10);
        assert_eq!(broker.stats().deliveries, 12);

        assert_eq!(logs.count("queue is drained"), 1);
        assert_eq!(logs.count("READY!!!"), 1);
        assert!(logs.position("queue is drained") < logs.position("READY!!!"));
    }

    #[tokio::test]
    async fn test_completion_timeout_interrupts() {
        let broker = MemoryBroker::new();
        let params = BenchmarkParameters {
            messages_to_send: 5,
            warmup_messages: 0,
            completion_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };

        let err = run_listener(&params, &registry(&broker), None)
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::Interrupted(_)));
        assert_eq!(broker.stats().closed_connections, 1);
    }
}
