use super::{
    AcknowledgeMode, Connection, ConnectionFactory, DeliveryMode, Message, MessageConsumer,
    MessageListener, MessageProducer, ProducerOptions, QueueRef, Session, TransportConfig,
};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::mqueue::{
    mq_close, mq_getattr, mq_open, mq_receive, mq_send, mq_unlink, MQ_OFlag, MqAttr, MqdT,
};
use nix::sys::stat::Mode;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Longest a send waits for room in a full queue before giving up
const QUEUE_FULL_TIMEOUT: Duration = Duration::from_secs(30);

/// Back-off ceiling while polling a full or empty queue
const MAX_POLL_DELAY: Duration = Duration::from_millis(10);

/// Remove a queue from the system namespace
pub fn unlink_queue(queue: &QueueRef) -> Result<()> {
    let name = format!("/{}", queue.name());
    mq_unlink(name.as_str()).map_err(|e| anyhow!("Failed to unlink queue '{}': {}", name, e))
}

/// An open POSIX message queue descriptor
struct PosixQueue {
    name: String,
    mq_fd: Option<MqdT>,
    msg_size: usize,
}

impl PosixQueue {
    /// Open the queue, creating it with the configured attributes if missing
    fn open(queue: &QueueRef, config: &TransportConfig) -> Result<Self> {
        let name = format!("/{}", queue.name());
        let attr = MqAttr::new(
            0,
            config.message_queue_depth as i64,
            config.max_message_size as i64,
            0,
        );
        let mq_fd = mq_open(
            name.as_str(),
            MQ_OFlag::O_CREAT | MQ_OFlag::O_RDWR | MQ_OFlag::O_NONBLOCK,
            Mode::S_IRUSR | Mode::S_IWUSR,
            Some(&attr),
        )
        .map_err(|e| anyhow!("Failed to open queue '{}': {}", name, e))?;

        // An existing queue keeps the attributes it was created with.
        let msg_size = match mq_getattr(&mq_fd) {
            Ok(actual) => actual.msgsize() as usize,
            Err(e) => {
                let _ = mq_close(mq_fd);
                bail!("Failed to read attributes of queue '{}': {}", name, e);
            }
        };

        debug!("Opened message queue '{}' (msgsize {})", name, msg_size);
        Ok(Self {
            name,
            mq_fd: Some(mq_fd),
            msg_size,
        })
    }

    fn fd(&self) -> Result<&MqdT> {
        self.mq_fd
            .as_ref()
            .ok_or_else(|| anyhow!("queue '{}' is closed", self.name))
    }

    async fn send(&self, body: &[u8]) -> Result<()> {
        if body.len() > self.msg_size {
            bail!(
                "message of {} bytes exceeds the {} byte limit of queue '{}'",
                body.len(),
                self.msg_size,
                self.name
            );
        }
        let deadline = Instant::now() + QUEUE_FULL_TIMEOUT;
        let mut delay = Duration::from_millis(1);
        loop {
            match mq_send(self.fd()?, body, 0) {
                Ok(()) => return Ok(()),
                Err(Errno::EAGAIN) if Instant::now() < deadline => {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_POLL_DELAY);
                }
                Err(Errno::EAGAIN) => {
                    bail!("queue '{}' stayed full for {:?}", self.name, QUEUE_FULL_TIMEOUT)
                }
                Err(e) => bail!("Failed to send to '{}': {}", self.name, e),
            }
        }
    }

    /// Pull one message without blocking. `Ok(None)` means the queue is empty.
    fn try_receive(&self) -> Result<Option<Message>> {
        let mut buffer = vec![0u8; self.msg_size];
        let mut priority = 0u32;
        match mq_receive(self.fd()?, &mut buffer, &mut priority) {
            Ok(bytes_read) => {
                buffer.truncate(bytes_read);
                Ok(Some(Message::bytes(buffer.into())))
            }
            Err(Errno::EAGAIN) => Ok(None),
            Err(e) => Err(anyhow!("Failed to receive from '{}': {}", self.name, e)),
        }
    }
}

impl Drop for PosixQueue {
    fn drop(&mut self) {
        if let Some(fd) = self.mq_fd.take() {
            if let Err(e) = mq_close(fd) {
                warn!("Failed to close message queue '{}': {}", self.name, e);
            }
        }
    }
}

/// Connection factory for queues in the POSIX message queue namespace
pub struct PosixMqConnectionFactory {
    config: TransportConfig,
}

impl PosixMqConnectionFactory {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConnectionFactory for PosixMqConnectionFactory {
    async fn create_connection(&self) -> Result<Box<dyn Connection>> {
        let (started, _) = watch::channel(false);
        Ok(Box::new(PosixMqConnection {
            config: self.config.clone(),
            started,
        }))
    }

    fn name(&self) -> &'static str {
        "POSIX Message Queue"
    }
}

struct PosixMqConnection {
    config: TransportConfig,
    started: watch::Sender<bool>,
}

#[async_trait]
impl Connection for PosixMqConnection {
    async fn create_session(&self, mode: AcknowledgeMode) -> Result<Arc<dyn Session>> {
        Ok(Arc::new(PosixMqSession {
            config: self.config.clone(),
            mode,
            staged: Arc::new(Mutex::new(VecDeque::new())),
            started: self.started.subscribe(),
        }))
    }

    async fn start(&self) -> Result<()> {
        self.started.send_replace(true);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // Descriptors close when the endpoints holding them are dropped; the
        // queues themselves outlive the connection so a listener can drain
        // what a previous sender left behind.
        self.started.send_replace(false);
        debug!("POSIX Message Queue connection closed");
        Ok(())
    }
}

type StagedSends = Arc<Mutex<VecDeque<(Arc<PosixQueue>, Message)>>>;

/// Send staged entries in order, removing each one only once it is sent.
///
/// A failed send leaves it and everything after it staged for the next
/// commit.
async fn flush_staged<T, F, Fut>(staged: &Mutex<VecDeque<T>>, mut send: F) -> Result<usize>
where
    T: Clone,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut sent = 0;
    loop {
        let next = staged.lock().front().cloned();
        let Some(entry) = next else {
            return Ok(sent);
        };
        send(entry).await?;
        staged.lock().pop_front();
        sent += 1;
    }
}

struct PosixMqSession {
    config: TransportConfig,
    mode: AcknowledgeMode,
    staged: StagedSends,
    started: watch::Receiver<bool>,
}

#[async_trait]
impl Session for PosixMqSession {
    async fn create_producer(
        &self,
        queue: &QueueRef,
        options: ProducerOptions,
    ) -> Result<Box<dyn MessageProducer>> {
        if options.delivery_mode == DeliveryMode::Persistent {
            debug!("POSIX message queues do not survive a reboot; persistence is best effort");
        }
        Ok(Box::new(PosixMqProducer {
            queue: Arc::new(PosixQueue::open(queue, &self.config)?),
            staged: self.mode.is_transacted().then(|| self.staged.clone()),
        }))
    }

    async fn create_consumer(&self, queue: &QueueRef) -> Result<Box<dyn MessageConsumer>> {
        Ok(Box::new(PosixMqConsumer {
            queue: Arc::new(PosixQueue::open(queue, &self.config)?),
            started: self.started.clone(),
            delivery: None,
        }))
    }

    async fn commit(&self) -> Result<()> {
        if !self.mode.is_transacted() {
            bail!("commit called on a {:?} session", self.mode);
        }
        let sent = flush_staged(&self.staged, |(queue, message)| async move {
            queue.send(message.body()).await
        })
        .await?;
        debug!("Committed {} staged messages", sent);
        Ok(())
    }

    fn acknowledge_mode(&self) -> AcknowledgeMode {
        self.mode
    }
}

struct PosixMqProducer {
    queue: Arc<PosixQueue>,
    staged: Option<StagedSends>,
}

#[async_trait]
impl MessageProducer for PosixMqProducer {
    async fn send(&mut self, message: &Message) -> Result<()> {
        match &self.staged {
            Some(staged) => {
                staged.lock().push_back((self.queue.clone(), message.clone()));
                Ok(())
            }
            None => self.queue.send(message.body()).await,
        }
    }
}

struct PosixMqConsumer {
    queue: Arc<PosixQueue>,
    started: watch::Receiver<bool>,
    delivery: Option<JoinHandle<()>>,
}

impl Drop for PosixMqConsumer {
    fn drop(&mut self) {
        if let Some(task) = self.delivery.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl MessageConsumer for PosixMqConsumer {
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Message>> {
        let deadline = Instant::now() + timeout;
        let running = *self.started.borrow();
        if !running {
            let mut started = self.started.clone();
            let wait = async move { started.wait_for(|running| *running).await.is_ok() };
            match tokio::time::timeout(timeout, wait).await {
                Ok(true) => {}
                Ok(false) => bail!("connection closed while receiving"),
                Err(_) => return Ok(None),
            }
        }

        let mut delay = Duration::from_millis(1);
        loop {
            if let Some(message) = self.queue.try_receive()? {
                return Ok(Some(message));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(MAX_POLL_DELAY);
        }
    }

    async fn set_message_listener(&mut self, listener: Arc<dyn MessageListener>) -> Result<()> {
        if self.delivery.is_some() {
            bail!("a message listener is already registered");
        }
        let queue = self.queue.clone();
        let mut started = self.started.clone();
        self.delivery = Some(tokio::spawn(async move {
            let mut delay = Duration::from_millis(1);
            loop {
                let connected = started.wait_for(|running| *running).await.is_ok();
                if !connected {
                    break;
                }
                match queue.try_receive() {
                    Ok(Some(message)) => {
                        delay = Duration::from_millis(1);
                        listener.on_message(message).await;
                    }
                    Ok(None) => {
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(MAX_POLL_DELAY);
                    }
                    Err(e) => {
                        warn!("Stopping delivery from '{}': {}", queue.name, e);
                        break;
                    }
                }
            }
            debug!("POSIX Message Queue delivery task finished");
        }));
        Ok(())
    }
}
