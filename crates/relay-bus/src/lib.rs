//! Broker seam used by the webhook relay.
//!
//! The relay only needs a handful of AMQP 0-9-1 operations: dial, open a
//! channel, declare exchanges and queues, bind, publish and consume. They are
//! expressed here as object-safe traits so the messaging core can run against
//! RabbitMQ in production and against [`LocalBroker`] in tests.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

mod local;
pub mod topic;

pub use local::LocalBroker;

/// Name of the broker's default exchange, which routes straight to the queue
/// named by the routing key.
pub const DEFAULT_EXCHANGE: &str = "";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("broker connection or channel closed")]
    Closed,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeSpec {
    /// Durable, non auto-deleted topic exchange.
    pub fn durable_topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
            auto_delete: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueSpec {
    /// Empty asks the broker to pick a name.
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

impl QueueSpec {
    /// Anonymous, non-durable, auto-deleting, exclusive queue.
    pub fn private() -> Self {
        Self {
            name: String::new(),
            durable: false,
            auto_delete: true,
            exclusive: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub content_type: String,
    pub body: Bytes,
}

impl OutboundMessage {
    pub fn new(content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            body: body.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Single-consumer sequence of auto-acknowledged deliveries.
///
/// `next` returns `None` once the owning channel or connection is gone; a
/// pending `next` is just a pause. The sequence cannot be restarted.
#[derive(Debug)]
pub struct Deliveries {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Deliveries {
    /// Returns the sending half that feeds a new sequence.
    pub fn channel() -> (mpsc::UnboundedSender<Delivery>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self, uri: &str) -> BusResult<Arc<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> BusResult<Arc<dyn BrokerChannel>>;
    async fn close(&self) -> BusResult<()>;
    fn is_open(&self) -> bool;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> BusResult<()>;
    /// Returns the declared queue's name, which is broker-chosen when the
    /// spec leaves it empty.
    async fn declare_queue(&self, spec: &QueueSpec) -> BusResult<String>;
    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> BusResult<()>;
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> BusResult<()>;
    async fn consume(&self, queue: &str, consumer_tag: &str) -> BusResult<Deliveries>;
    async fn close(&self) -> BusResult<()>;
}
