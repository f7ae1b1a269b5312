//! # Message Transport Abstraction
//!
//! The benchmark drivers never construct a transport themselves. They resolve
//! a queue and a connection factory through a [`NamingContext`], open a
//! [`Connection`], and work through the [`Session`], [`MessageProducer`] and
//! [`MessageConsumer`] endpoints it hands out.
//!
//! Two implementations ship with the crate:
//!
//! - [`memory`]: an in-process broker used by the loopback role and by tests.
//! - `posix_message_queue` (Linux only): queues backed by `mq_overview(7)`,
//!   usable between independent sender and listener processes.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub mod memory;
#[cfg(target_os = "linux")]
pub mod posix_message_queue;

pub use memory::{BrokerStats, MemoryBroker, MemoryConnectionFactory};
#[cfg(target_os = "linux")]
pub use posix_message_queue::PosixMqConnectionFactory;

/// Prefix under which any queue name resolves without an explicit binding.
pub const DYNAMIC_QUEUE_PREFIX: &str = "queue/";

/// Delivery durability requested from the producer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    #[clap(name = "persistent")]
    Persistent,
    #[clap(name = "non_persistent")]
    NonPersistent,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryMode::Persistent => write!(f, "persistent"),
            DeliveryMode::NonPersistent => write!(f, "non_persistent"),
        }
    }
}

/// How a session acknowledges consumed messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcknowledgeMode {
    /// Work is grouped into units that become visible on commit.
    Transacted,
    /// Every delivery is acknowledged as it is handed to the consumer.
    Auto,
    /// Lazy acknowledgement; the transport may redeliver.
    DupsOk,
}

impl AcknowledgeMode {
    pub fn is_transacted(self) -> bool {
        self == AcknowledgeMode::Transacted
    }
}

/// A resolved queue destination
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueRef {
    name: String,
}

impl QueueRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for QueueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue://{}", self.name)
    }
}

/// A bytes message.
///
/// The body is reference counted so a single payload can be sent any number
/// of times without copying it.
#[derive(Debug, Clone)]
pub struct Message {
    body: Arc<[u8]>,
    pub message_id: Option<String>,
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

impl Message {
    /// Create a message around an existing body
    pub fn bytes(body: Arc<[u8]>) -> Self {
        Self {
            body,
            message_id: None,
            timestamp: None,
        }
    }

    /// Create a message with a zero-filled body of `size` bytes
    pub fn zeroed(size: usize) -> Self {
        Self::bytes(vec![0u8; size].into())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// Producer settings applied when the send endpoint is created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerOptions {
    pub delivery_mode: DeliveryMode,
    /// Skip assigning a message id on every send.
    pub disable_message_id: bool,
    /// Skip stamping the send time on every send.
    pub disable_message_timestamp: bool,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self {
            delivery_mode: DeliveryMode::NonPersistent,
            disable_message_id: false,
            disable_message_timestamp: false,
        }
    }
}

/// Transport-specific tuning knobs
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// POSIX Message Queue: maximum number of messages in queue
    pub message_queue_depth: usize,
    /// POSIX Message Queue: maximum size of a single message
    pub max_message_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            message_queue_depth: 10,
            max_message_size: 8192,
        }
    }
}

/// Opens connections to a message transport
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create_connection(&self) -> Result<Box<dyn Connection>>;

    /// Get transport name for identification
    fn name(&self) -> &'static str;
}

/// A live connection to the transport
#[async_trait]
pub trait Connection: Send + Sync {
    async fn create_session(&self, mode: AcknowledgeMode) -> Result<Arc<dyn Session>>;

    /// Begin message delivery to this connection's consumers
    async fn start(&self) -> Result<()>;

    /// Release the connection and everything created from it
    async fn close(&self) -> Result<()>;
}

/// A single-threaded context for producing and consuming messages
#[async_trait]
pub trait Session: Send + Sync {
    async fn create_producer(
        &self,
        queue: &QueueRef,
        options: ProducerOptions,
    ) -> Result<Box<dyn MessageProducer>>;

    async fn create_consumer(&self, queue: &QueueRef) -> Result<Box<dyn MessageConsumer>>;

    /// Commit all work done in the current transaction
    async fn commit(&self) -> Result<()>;

    fn acknowledge_mode(&self) -> AcknowledgeMode;
}

#[async_trait]
pub trait MessageProducer: Send {
    async fn send(&mut self, message: &Message) -> Result<()>;
}

#[async_trait]
pub trait MessageConsumer: Send {
    /// Pull one message, waiting at most `timeout`. `None` means the wait
    /// elapsed with nothing delivered.
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Message>>;

    /// Switch to asynchronous delivery.
    ///
    /// The transport owns the delivery task and awaits each callback before
    /// handing over the next message. Delivery stops when the consumer is
    /// dropped.
    async fn set_message_listener(&mut self, listener: Arc<dyn MessageListener>) -> Result<()>;
}

/// Callback invoked by the transport for every delivered message
#[async_trait]
pub trait MessageListener: Send + Sync {
    async fn on_message(&self, message: Message);
}

/// What a name resolves to in a [`NamingContext`]
#[derive(Clone)]
pub enum Binding {
    Queue(QueueRef),
    ConnectionFactory(Arc<dyn ConnectionFactory>),
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Queue(queue) => f.debug_tuple("Queue").field(queue).finish(),
            Binding::ConnectionFactory(factory) => f
                .debug_tuple("ConnectionFactory")
                .field(&factory.name())
                .finish(),
        }
    }
}

/// Name lookup service resolving queues and connection factories
pub trait NamingContext: Send + Sync {
    fn lookup(&self, name: &str) -> Result<Binding>;

    fn lookup_queue(&self, name: &str) -> Result<QueueRef> {
        match self.lookup(name)? {
            Binding::Queue(queue) => Ok(queue),
            other => Err(anyhow!("'{}' is bound to {:?}, not a queue", name, other)),
        }
    }

    fn lookup_connection_factory(&self, name: &str) -> Result<Arc<dyn ConnectionFactory>> {
        match self.lookup(name)? {
            Binding::ConnectionFactory(factory) => Ok(factory),
            other => Err(anyhow!(
                "'{}' is bound to {:?}, not a connection factory",
                name,
                other
            )),
        }
    }
}

/// In-process naming registry.
///
/// Explicit bindings win; otherwise `queue/<name>` resolves to the queue
/// `<name>` so that benchmark queues need no up-front registration.
#[derive(Default)]
pub struct Registry {
    bindings: HashMap<String, Binding>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every transport this build supports: `memory` for the
    /// in-process broker and, on Linux, `pmq` for POSIX message queues.
    pub fn with_defaults(config: &TransportConfig) -> Self {
        let mut registry = Self::new();
        registry.bind_connection_factory(
            "memory",
            Arc::new(MemoryConnectionFactory::new(MemoryBroker::new())),
        );
        #[cfg(target_os = "linux")]
        registry.bind_connection_factory(
            "pmq",
            Arc::new(PosixMqConnectionFactory::new(config.clone())),
        );
        #[cfg(not(target_os = "linux"))]
        let _ = config;
        registry
    }

    pub fn bind_queue(&mut self, name: impl Into<String>, queue: QueueRef) -> &mut Self {
        self.bindings.insert(name.into(), Binding::Queue(queue));
        self
    }

    pub fn bind_connection_factory(
        &mut self,
        name: impl Into<String>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> &mut Self {
        self.bindings
            .insert(name.into(), Binding::ConnectionFactory(factory));
        self
    }
}

impl NamingContext for Registry {
    fn lookup(&self, name: &str) -> Result<Binding> {
        if let Some(binding) = self.bindings.get(name) {
            return Ok(binding.clone());
        }
        match name.strip_prefix(DYNAMIC_QUEUE_PREFIX) {
            Some(queue) if !queue.is_empty() => Ok(Binding::Queue(QueueRef::new(queue))),
            _ => bail!("name '{}' is not bound", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let message = Message::zeroed(16);
        assert_eq!(message.len(), 16);
        assert!(message.body().iter().all(|b| *b == 0));
        assert!(message.message_id.is_none());

        let clone = message.clone();
        assert!(std::ptr::eq(message.body().as_ptr(), clone.body().as_ptr()));
    }

    #[test]
    fn test_registry_dynamic_queues() {
        let registry = Registry::new();
        let queue = registry.lookup_queue("queue/perfQueue").unwrap();
        assert_eq!(queue.name(), "perfQueue");
        assert_eq!(queue.to_string(), "queue://perfQueue");

        assert!(registry.lookup("queue/").is_err());
        assert!(registry.lookup("perfQueue").is_err());
    }

    #[test]
    fn test_registry_explicit_bindings() {
        let mut registry = Registry::with_defaults(&TransportConfig::default());
        registry.bind_queue("testQueue", QueueRef::new("bench"));

        assert_eq!(registry.lookup_queue("testQueue").unwrap().name(), "bench");
        let factory = registry.lookup_connection_factory("memory").unwrap();
        assert_eq!(factory.name(), "memory");

        assert!(registry.lookup_queue("memory").is_err());
        assert!(registry.lookup_connection_factory("testQueue").is_err());
    }

    #[test]
    fn test_transport_config_default() {
        let config = TransportConfig::default();
        assert_eq!(config.message_queue_depth, 10);
        assert_eq!(config.max_message_size, 8192);
    }
}
