use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    topic, Broker, BrokerChannel, BrokerConnection, BusError, BusResult, Deliveries, Delivery,
    ExchangeKind, ExchangeSpec, OutboundMessage, QueueSpec, DEFAULT_EXCHANGE,
};

/// In-memory broker with AMQP-like routing for tests and local runs.
///
/// Cloning shares the same broker. Besides routing it can inject the faults
/// the relay has to survive: refused dials, refused publishes, silently
/// stalled delivery and severed connections.
#[derive(Clone, Default)]
pub struct LocalBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    router: Mutex<Router>,
    dials: AtomicUsize,
    fail_dials_from: Mutex<Option<usize>>,
    refuse_publishes: AtomicBool,
    stalled: AtomicBool,
    next_id: AtomicU64,
}

#[derive(Default)]
struct Router {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, LocalQueue>,
    bindings: Vec<Binding>,
    connections: HashMap<u64, Arc<AtomicBool>>,
}

struct LocalQueue {
    spec: QueueSpec,
    owner: u64,
    consumer: Option<Consumer>,
    backlog: VecDeque<Delivery>,
}

struct Consumer {
    connection: u64,
    channel: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    pattern: String,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of dial attempts so far, failed ones included.
    pub fn dial_count(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }

    /// Makes the `nth` dial attempt (1-based) and every later one fail.
    pub fn fail_dials_from(&self, nth: usize) {
        *self.inner.fail_dials_from.lock() = Some(nth);
    }

    pub fn open_connections(&self) -> usize {
        self.inner
            .router
            .lock()
            .connections
            .values()
            .filter(|open| open.load(Ordering::SeqCst))
            .count()
    }

    /// While set, every publish is rejected with a transport error.
    pub fn refuse_publishes(&self, refuse: bool) {
        self.inner.refuse_publishes.store(refuse, Ordering::SeqCst);
    }

    /// While set, publishes succeed but nothing is routed.
    pub fn stall(&self, stalled: bool) {
        self.inner.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Drops every open connection as if the broker went away.
    pub fn sever(&self) {
        let ids: Vec<u64> = self.inner.router.lock().connections.keys().copied().collect();
        for id in ids {
            self.inner.drop_connection(id);
        }
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.inner.router.lock().queues.contains_key(name)
    }

    pub fn queue_count(&self) -> usize {
        self.inner.router.lock().queues.len()
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.inner.router.lock().exchanges.get(name).cloned()
    }
}

impl Inner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn drop_connection(&self, connection: u64) {
        let mut router = self.router.lock();
        if let Some(open) = router.connections.remove(&connection) {
            open.store(false, Ordering::SeqCst);
        }
        let mut doomed = Vec::new();
        for (name, queue) in router.queues.iter_mut() {
            let consumer_gone = queue
                .consumer
                .as_ref()
                .is_some_and(|c| c.connection == connection);
            if consumer_gone {
                queue.consumer = None;
            }
            if (queue.spec.exclusive && queue.owner == connection)
                || (consumer_gone && queue.spec.auto_delete)
            {
                doomed.push(name.clone());
            }
        }
        router.remove_queues(&doomed);
        debug!(connection, removed_queues = doomed.len(), "local connection dropped");
    }

    fn drop_channel(&self, channel: u64) {
        let mut router = self.router.lock();
        let mut doomed = Vec::new();
        for (name, queue) in router.queues.iter_mut() {
            if queue.consumer.as_ref().is_some_and(|c| c.channel == channel) {
                queue.consumer = None;
                if queue.spec.auto_delete {
                    doomed.push(name.clone());
                }
            }
        }
        router.remove_queues(&doomed);
    }
}

impl Router {
    fn remove_queues(&mut self, names: &[String]) {
        for name in names {
            self.queues.remove(name);
        }
        self.bindings.retain(|b| !names.contains(&b.queue));
    }

    fn targets(&self, exchange: &ExchangeSpec, routing_key: &str) -> Vec<String> {
        let mut targets: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange.name) {
            let hit = match exchange.kind {
                ExchangeKind::Topic => topic::matches(&binding.pattern, routing_key),
                ExchangeKind::Direct => binding.pattern == routing_key,
                ExchangeKind::Fanout => true,
            };
            if hit && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        targets
    }

    fn deliver(&mut self, queue: &str, delivery: Delivery) {
        let Some(queue) = self.queues.get_mut(queue) else {
            return;
        };
        let delivery = match &queue.consumer {
            Some(consumer) => match consumer.tx.send(delivery) {
                Ok(()) => return,
                Err(mpsc::error::SendError(delivery)) => delivery,
            },
            None => delivery,
        };
        queue.backlog.push_back(delivery);
    }
}

#[async_trait]
impl Broker for LocalBroker {
    async fn connect(&self, uri: &str) -> BusResult<Arc<dyn BrokerConnection>> {
        tokio::task::yield_now().await;
        let attempt = self.inner.dials.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(nth) = *self.inner.fail_dials_from.lock() {
            if attempt >= nth {
                return Err(BusError::Transport(format!("connection refused: {uri}")));
            }
        }

        let id = self.inner.next_id();
        let open = Arc::new(AtomicBool::new(true));
        self.inner.router.lock().connections.insert(id, Arc::clone(&open));
        Ok(Arc::new(LocalConnection {
            broker: Arc::clone(&self.inner),
            id,
            open,
        }))
    }
}

struct LocalConnection {
    broker: Arc<Inner>,
    id: u64,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for LocalConnection {
    async fn open_channel(&self) -> BusResult<Arc<dyn BrokerChannel>> {
        if !self.is_open() {
            return Err(BusError::Closed);
        }
        Ok(Arc::new(LocalChannel {
            broker: Arc::clone(&self.broker),
            connection: self.id,
            connection_open: Arc::clone(&self.open),
            id: self.broker.next_id(),
            open: AtomicBool::new(true),
        }))
    }

    async fn close(&self) -> BusResult<()> {
        if self.open.load(Ordering::SeqCst) {
            self.broker.drop_connection(self.id);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

struct LocalChannel {
    broker: Arc<Inner>,
    connection: u64,
    connection_open: Arc<AtomicBool>,
    id: u64,
    open: AtomicBool,
}

impl LocalChannel {
    fn ensure_open(&self) -> BusResult<()> {
        if self.open.load(Ordering::SeqCst) && self.connection_open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Closed)
        }
    }
}

#[async_trait]
impl BrokerChannel for LocalChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> BusResult<()> {
        self.ensure_open()?;
        let mut router = self.broker.router.lock();
        match router.exchanges.get(&spec.name) {
            Some(existing) if existing != spec => Err(BusError::PreconditionFailed(format!(
                "exchange '{}' already declared with different properties",
                spec.name
            ))),
            Some(_) => Ok(()),
            None => {
                router.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> BusResult<String> {
        self.ensure_open()?;
        let name = if spec.name.is_empty() {
            format!("amq.gen-{}", self.broker.next_id())
        } else {
            spec.name.clone()
        };
        let mut router = self.broker.router.lock();
        if let Some(existing) = router.queues.get(&name) {
            if existing.spec.exclusive && existing.owner != self.connection {
                return Err(BusError::PreconditionFailed(format!(
                    "queue '{name}' is locked by another connection"
                )));
            }
            if existing.spec != *spec {
                return Err(BusError::PreconditionFailed(format!(
                    "queue '{name}' already declared with different properties"
                )));
            }
            return Ok(name);
        }
        router.queues.insert(
            name.clone(),
            LocalQueue {
                spec: QueueSpec {
                    name: name.clone(),
                    ..spec.clone()
                },
                owner: self.connection,
                consumer: None,
                backlog: VecDeque::new(),
            },
        );
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> BusResult<()> {
        self.ensure_open()?;
        let mut router = self.broker.router.lock();
        if !router.queues.contains_key(queue) {
            return Err(BusError::NotFound(format!("queue '{queue}'")));
        }
        if !router.exchanges.contains_key(exchange) {
            return Err(BusError::NotFound(format!("exchange '{exchange}'")));
        }
        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            pattern: pattern.to_string(),
        };
        if !router.bindings.contains(&binding) {
            router.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> BusResult<()> {
        self.ensure_open()?;
        if self.broker.refuse_publishes.load(Ordering::SeqCst) {
            return Err(BusError::Transport("publish refused".into()));
        }
        let mut router = self.broker.router.lock();
        let targets = if exchange == DEFAULT_EXCHANGE {
            vec![routing_key.to_string()]
        } else {
            let spec = router
                .exchanges
                .get(exchange)
                .ok_or_else(|| BusError::NotFound(format!("exchange '{exchange}'")))?;
            router.targets(spec, routing_key)
        };
        if self.broker.stalled.load(Ordering::SeqCst) {
            return Ok(());
        }
        let delivery = Delivery {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            content_type: Some(message.content_type),
            body: message.body,
        };
        for queue in targets {
            router.deliver(&queue, delivery.clone());
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> BusResult<Deliveries> {
        self.ensure_open()?;
        let mut router = self.broker.router.lock();
        let entry = router
            .queues
            .get_mut(queue)
            .ok_or_else(|| BusError::NotFound(format!("queue '{queue}'")))?;
        if entry.consumer.is_some() {
            return Err(BusError::PreconditionFailed(format!(
                "queue '{queue}' already has a consumer"
            )));
        }
        let (tx, deliveries) = Deliveries::channel();
        for delivery in entry.backlog.drain(..) {
            let _ = tx.send(delivery);
        }
        entry.consumer = Some(Consumer {
            connection: self.connection,
            channel: self.id,
            tx,
        });
        Ok(deliveries)
    }

    async fn close(&self) -> BusResult<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.broker.drop_channel(self.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    async fn channel(broker: &LocalBroker) -> (Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>) {
        let conn = broker.connect("memory://").await.expect("connect");
        let chan = conn.open_channel().await.expect("channel");
        (conn, chan)
    }

    fn json(body: &'static str) -> OutboundMessage {
        OutboundMessage::new("application/json", Bytes::from_static(body.as_bytes()))
    }

    #[test_timeout::tokio_timeout_test]
    async fn topic_exchange_routes_by_pattern() {
        let broker = LocalBroker::new();
        let (_conn, chan) = channel(&broker).await;
        chan.declare_exchange(&ExchangeSpec::durable_topic("webhooks"))
            .await
            .expect("declare exchange");
        let orders = chan.declare_queue(&QueueSpec::private()).await.expect("queue");
        let everything = chan.declare_queue(&QueueSpec::private()).await.expect("queue");
        chan.bind_queue(&orders, "webhooks", "orders.#").await.expect("bind");
        chan.bind_queue(&everything, "webhooks", "#").await.expect("bind");
        let mut orders_rx = chan.consume(&orders, "").await.expect("consume");
        let mut all_rx = chan.consume(&everything, "").await.expect("consume");

        chan.publish("webhooks", "orders.42", json("{}")).await.expect("publish");
        chan.publish("webhooks", "invoices.7", json("{}")).await.expect("publish");

        assert_eq!(orders_rx.next().await.expect("order").routing_key, "orders.42");
        assert!(orders_rx.try_next().is_none());
        assert_eq!(all_rx.next().await.expect("first").routing_key, "orders.42");
        assert_eq!(all_rx.next().await.expect("second").routing_key, "invoices.7");
    }

    #[test_timeout::tokio_timeout_test]
    async fn default_exchange_targets_queue_by_name() {
        let broker = LocalBroker::new();
        let (_conn, chan) = channel(&broker).await;
        let queue = chan.declare_queue(&QueueSpec::private()).await.expect("queue");
        chan.publish(DEFAULT_EXCHANGE, &queue, OutboundMessage::new("text/plain", "ping"))
            .await
            .expect("publish before consume");
        let mut rx = chan.consume(&queue, "").await.expect("consume");
        let delivery = rx.next().await.expect("backlog delivered");
        assert_eq!(delivery.body, Bytes::from_static(b"ping"));
        assert_eq!(delivery.content_type.as_deref(), Some("text/plain"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn mismatched_exchange_redeclare_fails() {
        let broker = LocalBroker::new();
        let (_conn, chan) = channel(&broker).await;
        chan.declare_exchange(&ExchangeSpec::durable_topic("webhooks"))
            .await
            .expect("first declare");
        chan.declare_exchange(&ExchangeSpec::durable_topic("webhooks"))
            .await
            .expect("matching redeclare");
        let transient = ExchangeSpec {
            durable: false,
            ..ExchangeSpec::durable_topic("webhooks")
        };
        let err = chan.declare_exchange(&transient).await.unwrap_err();
        assert!(matches!(err, BusError::PreconditionFailed(_)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn closing_consumer_channel_deletes_auto_delete_queue() {
        let broker = LocalBroker::new();
        let (_conn, chan) = channel(&broker).await;
        let queue = chan.declare_queue(&QueueSpec::private()).await.expect("queue");
        let mut rx = chan.consume(&queue, "").await.expect("consume");
        chan.close().await.expect("close");
        chan.close().await.expect("second close is a no-op");

        assert!(rx.next().await.is_none());
        assert!(!broker.queue_exists(&queue));
        assert!(matches!(
            chan.publish(DEFAULT_EXCHANGE, &queue, json("{}")).await,
            Err(BusError::Closed)
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn severing_ends_delivery_streams() {
        let broker = LocalBroker::new();
        let (conn, chan) = channel(&broker).await;
        let queue = chan.declare_queue(&QueueSpec::private()).await.expect("queue");
        let mut rx = chan.consume(&queue, "").await.expect("consume");
        assert_eq!(broker.open_connections(), 1);

        broker.sever();

        assert!(rx.next().await.is_none());
        assert!(!conn.is_open());
        assert_eq!(broker.open_connections(), 0);
        assert_eq!(broker.queue_count(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn stalled_broker_accepts_but_drops() {
        let broker = LocalBroker::new();
        let (_conn, chan) = channel(&broker).await;
        let queue = chan.declare_queue(&QueueSpec::private()).await.expect("queue");
        let mut rx = chan.consume(&queue, "").await.expect("consume");
        broker.stall(true);
        chan.publish(DEFAULT_EXCHANGE, &queue, json("{}")).await.expect("accepted");
        tokio::task::yield_now().await;
        assert!(rx.try_next().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn exclusive_queue_is_locked_to_its_connection() {
        let broker = LocalBroker::new();
        let (_a, chan_a) = channel(&broker).await;
        let (_b, chan_b) = channel(&broker).await;
        let spec = QueueSpec {
            name: "private".into(),
            ..QueueSpec::private()
        };
        chan_a.declare_queue(&spec).await.expect("owner declares");
        let err = chan_b.declare_queue(&spec).await.unwrap_err();
        assert!(matches!(err, BusError::PreconditionFailed(_)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn dial_failures_are_counted() {
        let broker = LocalBroker::new();
        broker.fail_dials_from(2);
        assert!(broker.connect("memory://").await.is_ok());
        assert!(broker.connect("memory://").await.is_err());
        assert_eq!(broker.dial_count(), 2);
        assert_eq!(broker.open_connections(), 1);
    }
}
