use super::{
    AcknowledgeMode, Connection, ConnectionFactory, Message, MessageConsumer, MessageListener,
    MessageProducer, ProducerOptions, QueueRef, Session,
};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

/// Counters describing everything the broker has seen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Producer send calls, including sends staged in a transaction
    pub sends: u64,
    /// Successful session commits
    pub commits: u64,
    /// Messages handed to consumers, by pull or by listener
    pub deliveries: u64,
    /// Connections closed through `Connection::close`
    pub closed_connections: u64,
}

/// In-process message broker.
///
/// Cloning the broker yields another handle to the same queues, so a test can
/// keep one handle for inspection while the harness drives another through a
/// [`MemoryConnectionFactory`].
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    sends: AtomicU64,
    commits: AtomicU64,
    deliveries: AtomicU64,
    closed_connections: AtomicU64,
    fail_sends_after: AtomicU64,
    fail_commits_after: AtomicU64,
    fail_close: AtomicBool,
}

impl Default for BrokerInner {
    fn default() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            sends: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
            closed_connections: AtomicU64::new(0),
            fail_sends_after: AtomicU64::new(u64::MAX),
            fail_commits_after: AtomicU64::new(u64::MAX),
            fail_close: AtomicBool::new(false),
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a message straight onto a queue, bypassing any producer
    pub fn enqueue(&self, queue: &str, message: Message) {
        self.queue(queue).push(message);
    }

    /// Number of messages currently waiting on a queue
    pub fn depth(&self, queue: &str) -> usize {
        self.inner
            .queues
            .lock()
            .get(queue)
            .map_or(0, |q| q.depth.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            sends: self.inner.sends.load(Ordering::Acquire),
            commits: self.inner.commits.load(Ordering::Acquire),
            deliveries: self.inner.deliveries.load(Ordering::Acquire),
            closed_connections: self.inner.closed_connections.load(Ordering::Acquire),
        }
    }

    /// Make every send after the first `limit` fail
    pub fn fail_sends_after(&self, limit: u64) {
        self.inner.fail_sends_after.store(limit, Ordering::Release);
    }

    /// Make every commit after the first `limit` fail
    pub fn fail_commits_after(&self, limit: u64) {
        self.inner.fail_commits_after.store(limit, Ordering::Release);
    }

    /// Make `Connection::close` fail
    pub fn fail_close(&self) {
        self.inner.fail_close.store(true, Ordering::Release);
    }

    fn queue(&self, name: &str) -> Arc<MemoryQueue> {
        self.inner
            .queues
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::new()))
            .clone()
    }
}

struct MemoryQueue {
    tx: mpsc::UnboundedSender<Message>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    depth: AtomicUsize,
}

impl MemoryQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            depth: AtomicUsize::new(0),
        }
    }

    fn push(&self, message: Message) {
        // The queue owns its receiver, so the channel cannot be closed here.
        if self.tx.send(message).is_ok() {
            self.depth.fetch_add(1, Ordering::AcqRel);
        }
    }

    async fn pop(&self) -> Option<Message> {
        let message = self.rx.lock().await.recv().await;
        if message.is_some() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
        }
        message
    }
}

/// Connection factory handing out connections to one [`MemoryBroker`]
pub struct MemoryConnectionFactory {
    broker: MemoryBroker,
}

impl MemoryConnectionFactory {
    pub fn new(broker: MemoryBroker) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl ConnectionFactory for MemoryConnectionFactory {
    async fn create_connection(&self) -> Result<Box<dyn Connection>> {
        let (started, _) = watch::channel(false);
        debug!("Opened in-memory connection");
        Ok(Box::new(MemoryConnection {
            broker: self.broker.clone(),
            started,
            closed: AtomicBool::new(false),
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    started: watch::Sender<bool>,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn create_session(&self, mode: AcknowledgeMode) -> Result<Arc<dyn Session>> {
        if self.closed.load(Ordering::Acquire) {
            bail!("connection is closed");
        }
        Ok(Arc::new(MemorySession {
            broker: self.broker.clone(),
            mode,
            staged: Arc::new(Mutex::new(Vec::new())),
            started: self.started.subscribe(),
        }))
    }

    async fn start(&self) -> Result<()> {
        self.started.send_replace(true);
        debug!("In-memory connection started");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.broker.inner.fail_close.load(Ordering::Acquire) {
            return Err(anyhow!("injected close failure"));
        }
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.started.send_replace(false);
            self.broker
                .inner
                .closed_connections
                .fetch_add(1, Ordering::AcqRel);
            debug!("In-memory connection closed");
        }
        Ok(())
    }
}

type StagedSends = Arc<Mutex<Vec<(Arc<MemoryQueue>, Message)>>>;

struct MemorySession {
    broker: MemoryBroker,
    mode: AcknowledgeMode,
    staged: StagedSends,
    started: watch::Receiver<bool>,
}

#[async_trait]
impl Session for MemorySession {
    async fn create_producer(
        &self,
        queue: &QueueRef,
        options: ProducerOptions,
    ) -> Result<Box<dyn MessageProducer>> {
        Ok(Box::new(MemoryProducer {
            broker: self.broker.clone(),
            queue: self.broker.queue(queue.name()),
            options,
            staged: self.mode.is_transacted().then(|| self.staged.clone()),
        }))
    }

    async fn create_consumer(&self, queue: &QueueRef) -> Result<Box<dyn MessageConsumer>> {
        Ok(Box::new(MemoryConsumer {
            broker: self.broker.clone(),
            queue: self.broker.queue(queue.name()),
            started: self.started.clone(),
            delivery: None,
        }))
    }

    async fn commit(&self) -> Result<()> {
        if !self.mode.is_transacted() {
            bail!("commit called on a {:?} session", self.mode);
        }
        let inner = &self.broker.inner;
        if inner.commits.load(Ordering::Acquire) >= inner.fail_commits_after.load(Ordering::Acquire)
        {
            bail!("injected commit failure");
        }
        let staged: Vec<_> = self.staged.lock().drain(..).collect();
        for (queue, message) in staged {
            queue.push(message);
        }
        inner.commits.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn acknowledge_mode(&self) -> AcknowledgeMode {
        self.mode
    }
}

struct MemoryProducer {
    broker: MemoryBroker,
    queue: Arc<MemoryQueue>,
    options: ProducerOptions,
    staged: Option<StagedSends>,
}

#[async_trait]
impl MessageProducer for MemoryProducer {
    async fn send(&mut self, message: &Message) -> Result<()> {
        let inner = &self.broker.inner;
        if inner.sends.load(Ordering::Acquire) >= inner.fail_sends_after.load(Ordering::Acquire) {
            bail!("injected send failure");
        }
        inner.sends.fetch_add(1, Ordering::AcqRel);

        let mut message = message.clone();
        if !self.options.disable_message_id {
            message.message_id = Some(format!("ID:{}", Uuid::new_v4()));
        }
        if !self.options.disable_message_timestamp {
            message.timestamp = Some(chrono::Utc::now());
        }
        match &self.staged {
            Some(staged) => staged.lock().push((self.queue.clone(), message)),
            None => self.queue.push(message),
        }
        Ok(())
    }
}

struct MemoryConsumer {
    broker: MemoryBroker,
    queue: Arc<MemoryQueue>,
    started: watch::Receiver<bool>,
    delivery: Option<JoinHandle<()>>,
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        if let Some(task) = self.delivery.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl MessageConsumer for MemoryConsumer {
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Message>> {
        let queue = self.queue.clone();
        let mut started = self.started.clone();
        let pull = async move {
            started
                .wait_for(|running| *running)
                .await
                .map_err(|_| anyhow!("connection closed while receiving"))?;
            Ok::<_, anyhow::Error>(queue.pop().await)
        };
        match tokio::time::timeout(timeout, pull).await {
            Ok(Ok(Some(message))) => {
                self.broker.inner.deliveries.fetch_add(1, Ordering::AcqRel);
                Ok(Some(message))
            }
            Ok(Ok(None)) | Err(_) => Ok(None),
            Ok(Err(e)) => Err(e),
        }
    }

    async fn set_message_listener(&mut self, listener: Arc<dyn MessageListener>) -> Result<()> {
        if self.delivery.is_some() {
            bail!("a message listener is already registered");
        }
        let queue = self.queue.clone();
        let broker = self.broker.clone();
        let mut started = self.started.clone();
        self.delivery = Some(tokio::spawn(async move {
            loop {
                let connected = started.wait_for(|running| *running).await.is_ok();
                if !connected {
                    break;
                }
                let Some(message) = queue.pop().await else {
                    break;
                };
                broker.inner.deliveries.fetch_add(1, Ordering::AcqRel);
                listener.on_message(message).await;
            }
            debug!("In-memory delivery task finished");
        }));
        Ok(())
    }
}
