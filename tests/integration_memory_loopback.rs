use anyhow::Result;
use queue_perf::{
    run_listener, run_loopback, run_sender,
    transport::{MemoryBroker, MemoryConnectionFactory, Message, Registry},
    BenchmarkParameters, HarnessError,
};
use std::sync::Arc;
use std::time::Duration;

fn registry(broker: &MemoryBroker) -> Registry {
    let mut registry = Registry::new();
    registry.bind_connection_factory(
        "jms/PerfConnectionFactory",
        Arc::new(MemoryConnectionFactory::new(broker.clone())),
    );
    registry
}

fn params() -> BenchmarkParameters {
    BenchmarkParameters {
        messages_to_send: 1000,
        warmup_messages: 100,
        message_size: 128,
        connection_factory_lookup: "jms/PerfConnectionFactory".to_string(),
        ..Default::default()
    }
}

/// Listener and sender in one process over the in-memory broker.
#[tokio::test]
async fn memory_loopback_auto_acknowledge() -> Result<()> {
    let broker = MemoryBroker::new();
    let report = run_loopback(&params(), &registry(&broker)).await?;

    assert_eq!(report.sent.messages, 1000);
    assert_eq!(report.received.messages, 1000);
    assert!(report.received.messages_per_second >= 0.0);

    let stats = broker.stats();
    assert_eq!(stats.sends, 1100);
    assert_eq!(stats.deliveries, 1100);
    assert_eq!(stats.commits, 0);
    assert_eq!(stats.closed_connections, 2);
    assert_eq!(broker.depth("perfQueue"), 0);
    Ok(())
}

#[tokio::test]
async fn memory_loopback_transacted_with_drain() -> Result<()> {
    let broker = MemoryBroker::new();
    // Left over from an earlier run.
    for _ in 0..5 {
        broker.enqueue("perfQueue", Message::zeroed(128));
    }
    let params = BenchmarkParameters {
        transacted: true,
        batch_size: 30,
        drain_queue: true,
        drain_timeout: Duration::from_millis(50),
        ..params()
    };

    let report = run_loopback(&params, &registry(&broker)).await?;
    assert_eq!(report.received.messages, 1000);

    let stats = broker.stats();
    assert_eq!(stats.deliveries, 5 + 1100);
    // ceil(100 / 30) + ceil(1000 / 30) per side.
    assert_eq!(stats.commits, 2 * (4 + 34));
    Ok(())
}

/// The roles started separately, the way two processes would run them.
#[tokio::test]
async fn memory_listener_then_sender() -> Result<()> {
    let broker = MemoryBroker::new();
    let registry = registry(&broker);
    let params = BenchmarkParameters {
        dups_ok: true,
        ..params()
    };

    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
    let listener = run_listener(&params, &registry, Some(ready_tx));
    let sender = async {
        ready_rx.await.expect("listener ready");
        run_sender(&params, &registry).await
    };
    let (received, sent) = tokio::join!(listener, sender);

    assert_eq!(received?.messages, 1000);
    assert_eq!(sent?.messages, 1000);
    Ok(())
}

#[tokio::test]
async fn mismatched_counts_hit_the_completion_timeout() {
    let broker = MemoryBroker::new();
    let registry = registry(&broker);
    let listener_params = BenchmarkParameters {
        completion_timeout: Some(Duration::from_millis(200)),
        ..params()
    };
    let sender_params = BenchmarkParameters {
        messages_to_send: 500,
        ..params()
    };

    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
    let listener = run_listener(&listener_params, &registry, Some(ready_tx));
    let sender = async {
        ready_rx.await.expect("listener ready");
        run_sender(&sender_params, &registry).await
    };
    let (received, sent) = tokio::join!(listener, sender);

    assert_eq!(sent.unwrap().messages, 500);
    assert!(matches!(received, Err(HarnessError::Interrupted(_))));
}
