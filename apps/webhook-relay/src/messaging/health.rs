//! Broker heartbeat.
//!
//! Every interval the checker publishes a ping straight to its own private
//! queue (default exchange, routing key = queue name) and waits for the echo.
//! A missing echo or a failed publish raises the failure signal. Round-tripping
//! through the broker catches stalls where the TCP connection still looks
//! healthy but messages no longer flow.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use relay_bus::{BrokerChannel, Deliveries, OutboundMessage, QueueSpec, DEFAULT_EXCHANGE};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ConnectionManager;
use crate::error::{RelayError, RelayResult};

const HEARTBEAT_CONTENT_TYPE: &str = "text/plain";
const PUBLISH_DEADLINE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub interval: Duration,
    pub timeout: Duration,
    /// Tags heartbeat payloads and log lines.
    pub instance_id: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(2),
            instance_id: "webhook-relay".to_string(),
        }
    }
}

/// Running heartbeat loop plus its one-slot failure signal.
///
/// At most one failure is buffered; failures raised while one is pending are
/// dropped. `stop` ends the loop, releases both channels and may be called any
/// number of times from any task.
pub struct HealthChecker {
    stopped: AtomicBool,
    cancel: CancellationToken,
    failures: tokio::sync::Mutex<mpsc::Receiver<()>>,
    channels: parking_lot::Mutex<Vec<Arc<dyn BrokerChannel>>>,
    queue: String,
}

impl HealthChecker {
    /// Ensures the connection pair exists, provisions the private queue and
    /// starts the loop. Setup errors are returned, not signalled.
    pub async fn start(
        connections: &ConnectionManager,
        uri: &str,
        config: HealthConfig,
    ) -> RelayResult<Self> {
        connections.init(uri).await?;

        let publish = connections
            .publisher_connection()?
            .open_channel()
            .await
            .map_err(RelayError::Channel)?;
        let provisioned = provision(connections).await;
        let (subscribe, queue, deliveries) = match provisioned {
            Ok(parts) => parts,
            Err(err) => {
                if let Err(close_err) = publish.close().await {
                    warn!(error = %close_err, "failed to close heartbeat publish channel after setup failure");
                }
                return Err(err);
            }
        };

        let (failure_tx, failure_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let heartbeat = Heartbeat {
            channel: Arc::clone(&publish),
            queue: queue.clone(),
            deliveries,
            config,
            cancel: cancel.clone(),
            failures: failure_tx,
        };
        info!(
            queue = %queue,
            interval_ms = heartbeat.config.interval.as_millis() as u64,
            timeout_ms = heartbeat.config.timeout.as_millis() as u64,
            "health checker started"
        );
        tokio::spawn(heartbeat.run());

        Ok(Self {
            stopped: AtomicBool::new(false),
            cancel,
            failures: tokio::sync::Mutex::new(failure_rx),
            channels: parking_lot::Mutex::new(vec![publish, subscribe]),
            queue,
        })
    }

    /// Waits for the next failure. `None` means the checker has stopped and
    /// will never signal again.
    pub async fn failure(&self) -> Option<()> {
        if self.is_stopped() {
            return None;
        }
        let mut rx = self.failures.lock().await;
        let received = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            received = rx.recv() => received,
        };
        // The loop can lose the race with `stop` and signal after it.
        if self.is_stopped() {
            return None;
        }
        received
    }

    /// Takes a pending failure without waiting.
    pub fn try_failure(&self) -> bool {
        if self.is_stopped() {
            return false;
        }
        match self.failures.try_lock() {
            Ok(mut rx) => rx.try_recv().is_ok() && !self.is_stopped(),
            Err(_) => false,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        if let Ok(mut rx) = self.failures.try_lock() {
            while rx.try_recv().is_ok() {}
        }

        let channels = std::mem::take(&mut *self.channels.lock());
        for channel in channels {
            if let Err(err) = channel.close().await {
                warn!(error = %err, "failed to close health check channel");
            }
        }
        info!(queue = %self.queue, "health checker stopped");
    }
}

async fn provision(
    connections: &ConnectionManager,
) -> RelayResult<(Arc<dyn BrokerChannel>, String, Deliveries)> {
    let channel = connections
        .subscriber_connection()?
        .open_channel()
        .await
        .map_err(RelayError::Channel)?;
    let declared = channel.declare_queue(&QueueSpec::private()).await;
    let consumed = match declared {
        Ok(queue) => channel
            .consume(&queue, "")
            .await
            .map(|deliveries| (queue, deliveries))
            .map_err(RelayError::Subscribe),
        Err(err) => Err(RelayError::Queue(err)),
    };
    match consumed {
        Ok((queue, deliveries)) => Ok((channel, queue, deliveries)),
        Err(err) => {
            if let Err(close_err) = channel.close().await {
                warn!(error = %close_err, "failed to close heartbeat consume channel after setup failure");
            }
            Err(err)
        }
    }
}

enum Echo {
    Observed,
    TimedOut,
    Closed,
    Stopped,
}

struct Heartbeat {
    channel: Arc<dyn BrokerChannel>,
    queue: String,
    deliveries: Deliveries,
    config: HealthConfig,
    cancel: CancellationToken,
    failures: mpsc::Sender<()>,
}

impl Heartbeat {
    async fn run(mut self) {
        let interval = self.config.interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sequence: u64 = 0;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            sequence += 1;
            let payload = format!("ping {} {}", self.config.instance_id, sequence);
            if let Err(reason) = self.ping(&payload).await {
                self.fail(&reason);
                continue;
            }

            match self.await_echo(&payload).await {
                Echo::Observed => debug!(sequence, "heartbeat echoed"),
                Echo::TimedOut => self.fail("heartbeat not echoed before timeout"),
                Echo::Closed => {
                    self.fail("heartbeat consumer closed");
                    return;
                }
                Echo::Stopped => return,
            }
        }
    }

    async fn ping(&self, payload: &str) -> Result<(), String> {
        let message = OutboundMessage::new(HEARTBEAT_CONTENT_TYPE, payload.to_string());
        let publish = self.channel.publish(DEFAULT_EXCHANGE, &self.queue, message);
        match tokio::time::timeout(PUBLISH_DEADLINE, publish).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(format!("heartbeat publish failed: {err}")),
            Err(_) => Err("heartbeat publish timed out".to_string()),
        }
    }

    /// Skips echoes of earlier pings that arrive late.
    async fn await_echo(&mut self, payload: &str) -> Echo {
        let deadline = tokio::time::sleep(self.config.timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Echo::Stopped,
                delivery = self.deliveries.next() => match delivery {
                    Some(delivery) if delivery.body == payload.as_bytes() => return Echo::Observed,
                    Some(_) => continue,
                    None if self.cancel.is_cancelled() => return Echo::Stopped,
                    None => return Echo::Closed,
                },
                _ = &mut deadline => return Echo::TimedOut,
            }
        }
    }

    fn fail(&self, reason: &str) {
        if self.cancel.is_cancelled() {
            return;
        }
        counter!("webhook_relay_heartbeat_failures_total", 1);
        match self.failures.try_send(()) {
            Ok(()) => warn!(instance = %self.config.instance_id, reason, "health check failed"),
            Err(TrySendError::Full(())) => {
                debug!(reason, "health check failure already pending")
            }
            Err(TrySendError::Closed(())) => {}
        }
    }
}
