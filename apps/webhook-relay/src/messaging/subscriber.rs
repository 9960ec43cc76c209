use std::sync::Arc;

use relay_bus::{BrokerChannel, Deliveries, Delivery, QueueSpec};
use tracing::{info, warn};

use super::publisher::declare_exchange;
use super::{ConnectionManager, EXCHANGE};
use crate::error::{RelayError, RelayResult};

/// Binding pattern that matches every routing key.
pub const DEFAULT_BINDING: &str = "#";

/// A private queue bound to the `webhooks` exchange.
///
/// The queue is exclusive, auto-deleting and non-durable, so it disappears
/// with its consumer.
pub struct Subscriber {
    channel: Arc<dyn BrokerChannel>,
    queue: String,
}

impl Subscriber {
    pub async fn new(connections: &ConnectionManager, pattern: &str) -> RelayResult<Self> {
        let channel = connections
            .subscriber_connection()?
            .open_channel()
            .await
            .map_err(RelayError::Channel)?;
        declare_exchange(channel.as_ref()).await?;

        let queue = channel
            .declare_queue(&QueueSpec::private())
            .await
            .map_err(RelayError::Queue)?;
        channel
            .bind_queue(&queue, EXCHANGE, pattern)
            .await
            .map_err(RelayError::Queue)?;
        info!(queue = %queue, pattern, "subscriber queue bound");

        Ok(Self { channel, queue })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Starts consuming. Takes `self` because the sequence cannot be
    /// restarted; a fresh `Subscriber` is needed for a new one.
    pub async fn subscribe(self) -> RelayResult<DeliveryStream> {
        let deliveries = self
            .channel
            .consume(&self.queue, "")
            .await
            .map_err(RelayError::Subscribe)?;
        Ok(DeliveryStream {
            deliveries,
            channel: self.channel,
        })
    }
}

/// Auto-acknowledged deliveries from a subscriber queue. `next` yields `None`
/// only once the channel or connection has closed.
pub struct DeliveryStream {
    deliveries: Deliveries,
    channel: Arc<dyn BrokerChannel>,
}

impl DeliveryStream {
    pub async fn next(&mut self) -> Option<Delivery> {
        self.deliveries.next().await
    }

    pub async fn close(self) {
        if let Err(err) = self.channel.close().await {
            warn!(error = %err, "failed to close subscriber channel");
        }
    }
}
