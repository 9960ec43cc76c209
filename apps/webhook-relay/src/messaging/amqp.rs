//! RabbitMQ implementation of the broker seam, on top of lapin.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use relay_bus::{
    Broker, BrokerChannel, BrokerConnection, BusError, BusResult, Deliveries, Delivery,
    ExchangeKind, ExchangeSpec, OutboundMessage, QueueSpec,
};
use tracing::{debug, warn};

const REPLY_SUCCESS: u16 = 200;

#[derive(Debug, Default, Clone, Copy)]
pub struct AmqpBroker;

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self, uri: &str) -> BusResult<Arc<dyn BrokerConnection>> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(bus_error)?;
        Ok(Arc::new(AmqpConnection { connection }))
    }
}

struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> BusResult<Arc<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await.map_err(bus_error)?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> BusResult<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.connection
            .close(REPLY_SUCCESS, "relay shutting down")
            .await
            .map_err(bus_error)
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }
}

struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> BusResult<()> {
        let kind = match spec.kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        };
        let options = ExchangeDeclareOptions {
            durable: spec.durable,
            auto_delete: spec.auto_delete,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(&spec.name, kind, options, FieldTable::default())
            .await
            .map_err(bus_error)
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> BusResult<String> {
        let options = QueueDeclareOptions {
            durable: spec.durable,
            exclusive: spec.exclusive,
            auto_delete: spec.auto_delete,
            ..QueueDeclareOptions::default()
        };
        let queue = self
            .channel
            .queue_declare(&spec.name, options, FieldTable::default())
            .await
            .map_err(bus_error)?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> BusResult<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(bus_error)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> BusResult<()> {
        let properties = BasicProperties::default().with_content_type(message.content_type.into());
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(bus_error)?
            .await
            .map_err(bus_error)?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> BusResult<Deliveries> {
        let options = BasicConsumeOptions {
            no_ack: true,
            ..BasicConsumeOptions::default()
        };
        let mut consumer = self
            .channel
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await
            .map_err(bus_error)?;

        let (tx, deliveries) = Deliveries::channel();
        let queue = queue.to_string();
        tokio::spawn(async move {
            while let Some(next) = consumer.next().await {
                match next {
                    Ok(delivery) => {
                        let delivery = Delivery {
                            exchange: delivery.exchange.as_str().to_string(),
                            routing_key: delivery.routing_key.as_str().to_string(),
                            content_type: delivery
                                .properties
                                .content_type()
                                .as_ref()
                                .map(|value| value.as_str().to_string()),
                            body: Bytes::from(delivery.data),
                        };
                        if tx.send(delivery).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(queue = %queue, error = %err, "amqp consumer failed");
                        break;
                    }
                }
            }
            debug!(queue = %queue, "amqp consumer finished");
        });
        Ok(deliveries)
    }

    async fn close(&self) -> BusResult<()> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "relay shutting down")
            .await
            .map_err(bus_error)
    }
}

/// Classifies by AMQP reply code so callers can tell an incompatible
/// redeclaration or a missing entity apart from a broken link.
fn bus_error(err: lapin::Error) -> BusError {
    match err {
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            BusError::Closed
        }
        lapin::Error::ProtocolError(err) => match err.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                BusError::PreconditionFailed(err.to_string())
            }
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => BusError::NotFound(err.to_string()),
            _ => BusError::Transport(err.to_string()),
        },
        other => BusError::Transport(other.to_string()),
    }
}
