//! Consumer side of the relay: replays captured webhooks against a fixed
//! destination.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use axum::http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use axum::http::{Request, StatusCode, Uri};
use bytes::Bytes;
use metrics::counter;
use relay_bus::{Broker, Delivery};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::messaging::{ConnectionManager, DeliveryStream, Envelope, HealthChecker, Subscriber};
use crate::shutdown::{ShutdownCoordinator, HEARTBEAT_FAILED};

pub const ORIGINAL_PATH_HEADER: &str = "relay-original-path";
pub const ORIGINAL_HOST_HEADER: &str = "relay-original-host";

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ForwarderSettings {
    pub destination: Uri,
    /// Attach `Relay-Original-Path` and `Relay-Original-Host`.
    pub extra_headers: bool,
    /// Send the captured `Host` rather than the destination's.
    pub preserve_host: bool,
    /// Accept invalid TLS certificates from the destination.
    pub insecure: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    StreamClosed,
}

pub struct Forwarder {
    client: reqwest::Client,
    settings: ForwarderSettings,
}

impl Forwarder {
    pub fn new(settings: ForwarderSettings) -> RelayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .danger_accept_invalid_certs(settings.insecure)
            .build()
            .map_err(|err| RelayError::Config(format!("failed to build HTTP client: {err}")))?;
        Ok(Self::with_client(client, settings))
    }

    pub fn with_client(client: reqwest::Client, settings: ForwarderSettings) -> Self {
        Self { client, settings }
    }

    /// Rebuilds the captured request against the destination. Framing headers
    /// are left for the client to recompute.
    pub fn build_request(&self, envelope: &Envelope) -> RelayResult<Request<Bytes>> {
        let mut request = envelope.to_http_request(self.settings.destination.clone())?;
        let headers = request.headers_mut();
        headers.remove(CONTENT_LENGTH);
        headers.remove(TRANSFER_ENCODING);
        headers.remove(HOST);

        if self.settings.extra_headers {
            headers.insert(
                HeaderName::from_static(ORIGINAL_PATH_HEADER),
                header_value(&envelope.path)?,
            );
            headers.insert(
                HeaderName::from_static(ORIGINAL_HOST_HEADER),
                header_value(&envelope.host)?,
            );
        }
        if self.settings.preserve_host && !envelope.host.is_empty() {
            headers.insert(HOST, header_value(&envelope.host)?);
        }
        Ok(request)
    }

    /// Sends one delivery. Any response status counts as forwarded.
    pub async fn forward(&self, delivery: &Delivery) -> RelayResult<StatusCode> {
        let envelope = Envelope::decode(&delivery.body)?;
        let request = self.build_request(&envelope)?;
        let request = reqwest::Request::try_from(request)
            .map_err(|err| RelayError::Forward(err.to_string()))?;

        let response = self
            .client
            .execute(request)
            .await
            .map_err(|err| RelayError::Forward(err.to_string()))?;
        let status = response.status();
        info!(
            method = %envelope.method,
            path = %envelope.path,
            status = status.as_u16(),
            "forwarded webhook"
        );
        Ok(status)
    }

    /// Forwards deliveries one at a time until `shutdown` fires or the stream
    /// closes. Per-delivery failures are logged and skipped.
    pub async fn run(&self, mut stream: DeliveryStream, shutdown: CancellationToken) -> StopReason {
        let reason = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break StopReason::Shutdown,
                next = stream.next() => next,
            };
            let Some(delivery) = next else {
                break StopReason::StreamClosed;
            };

            match self.forward(&delivery).await {
                Ok(_) => counter!("webhook_relay_forwarded_total", 1),
                Err(err) => {
                    counter!("webhook_relay_forward_failures_total", 1);
                    warn!(routing_key = %delivery.routing_key, error = %err, "failed to forward webhook");
                }
            }
        };
        debug!(?reason, "forwarder stopped");
        stream.close().await;
        reason
    }
}

fn header_value(value: &str) -> RelayResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| RelayError::Decode(format!("'{value}' is not a valid header value")))
}

pub async fn run(config: &RelayConfig, broker: Arc<dyn Broker>) -> Result<()> {
    let settings = config.forwarder_settings()?;
    let forwarder = Forwarder::new(settings)?;

    let connections = ConnectionManager::new(broker);
    connections
        .init(&config.amqp)
        .await
        .context("failed to connect to broker")?;

    let outcome = run_with(config, &connections, forwarder).await;
    connections.close_all().await;
    outcome
}

async fn run_with(
    config: &RelayConfig,
    connections: &ConnectionManager,
    forwarder: Forwarder,
) -> Result<()> {
    let stream = Subscriber::new(connections, &config.key)
        .await
        .context("failed to set up subscriber")?
        .subscribe()
        .await
        .context("failed to start consuming")?;
    let health = match HealthChecker::start(connections, &config.amqp, config.health("transmitter"))
        .await
    {
        Ok(health) => Arc::new(health),
        Err(err) => {
            stream.close().await;
            return Err(err).context("failed to start health checker");
        }
    };

    let shutdown = ShutdownCoordinator::new(config.shutdown_grace());
    let signals = shutdown.listen_for_signals();
    let watcher = shutdown.watch_health(Arc::clone(&health));

    info!(key = %config.key, send_to = %config.send_to, "transmitter started");
    let token = shutdown.token();
    let handle = tokio::spawn(async move { forwarder.run(stream, token).await });
    let drained = shutdown.drain("forwarder", handle).await;

    signals.abort();
    watcher.abort();
    health.stop().await;

    match drained? {
        StopReason::StreamClosed => bail!("delivery stream closed unexpectedly"),
        StopReason::Shutdown if shutdown.reason().as_deref() == Some(HEARTBEAT_FAILED) => {
            bail!("transmitter stopped after losing the broker")
        }
        StopReason::Shutdown => {
            info!("transmitter stopped");
            Ok(())
        }
    }
}
