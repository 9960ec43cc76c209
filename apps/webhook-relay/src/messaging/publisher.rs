use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use relay_bus::{BrokerChannel, ExchangeSpec, OutboundMessage};
use tracing::{debug, warn};

use super::envelope::{Envelope, ENVELOPE_CONTENT_TYPE};
use super::{ConnectionManager, EXCHANGE};
use crate::error::{RelayError, RelayResult};

const PUBLISH_DEADLINE: Duration = Duration::from_secs(1);

/// Anything the receiver can hand an envelope to.
#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    async fn publish(&self, envelope: &Envelope) -> RelayResult<()>;
}

/// Publishes envelopes to the `webhooks` topic exchange, keyed by path.
pub struct Publisher {
    channel: Arc<dyn BrokerChannel>,
}

impl Publisher {
    pub async fn new(connections: &ConnectionManager) -> RelayResult<Self> {
        let channel = connections
            .publisher_connection()?
            .open_channel()
            .await
            .map_err(RelayError::Channel)?;
        declare_exchange(channel.as_ref()).await?;
        Ok(Self { channel })
    }

    pub async fn close(&self) {
        if let Err(err) = self.channel.close().await {
            warn!(error = %err, "failed to close publisher channel");
        }
    }

    async fn send(&self, envelope: &Envelope) -> RelayResult<()> {
        let payload = envelope.encode()?;
        let routing_key = envelope.routing_key();
        let message = OutboundMessage::new(ENVELOPE_CONTENT_TYPE, payload);

        match tokio::time::timeout(
            PUBLISH_DEADLINE,
            self.channel.publish(EXCHANGE, &routing_key, message),
        )
        .await
        {
            Ok(Ok(())) => {
                debug!(routing_key = %routing_key, method = %envelope.method, "published webhook");
                Ok(())
            }
            Ok(Err(err)) => Err(RelayError::Publish(err.to_string())),
            Err(_) => Err(RelayError::Publish(format!(
                "timed out after {}ms",
                PUBLISH_DEADLINE.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl EnvelopeSink for Publisher {
    async fn publish(&self, envelope: &Envelope) -> RelayResult<()> {
        let outcome = self.send(envelope).await;
        match &outcome {
            Ok(()) => counter!("webhook_relay_published_total", 1),
            Err(_) => counter!("webhook_relay_publish_failures_total", 1),
        }
        outcome
    }
}

/// Idempotent declare of the durable `webhooks` topic exchange.
pub(crate) async fn declare_exchange(channel: &dyn BrokerChannel) -> RelayResult<()> {
    channel
        .declare_exchange(&ExchangeSpec::durable_topic(EXCHANGE))
        .await
        .map_err(|err| RelayError::exchange(EXCHANGE, err))
}
