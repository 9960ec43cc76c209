//! HTTP side of the relay: every request, whatever its method or path, is
//! captured as an envelope and published.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use axum::body::to_bytes;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::Router;
use relay_bus::Broker;
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::RelayConfig;
use crate::messaging::{ConnectionManager, Envelope, EnvelopeSink, HealthChecker, Publisher};
use crate::shutdown::{ShutdownCoordinator, HEARTBEAT_FAILED};

#[derive(Debug, Clone)]
pub struct ReceiverSettings {
    pub max_body_bytes: usize,
    pub request_timeout: Duration,
}

impl Default for ReceiverSettings {
    fn default() -> Self {
        Self {
            max_body_bytes: 10 * 1024 * 1024,
            request_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Clone)]
struct ReceiverState {
    sink: Arc<dyn EnvelopeSink>,
    max_body_bytes: usize,
}

pub fn router(sink: Arc<dyn EnvelopeSink>, settings: &ReceiverSettings) -> Router {
    let state = ReceiverState {
        sink,
        max_body_bytes: settings.max_body_bytes,
    };
    Router::new()
        .fallback(capture)
        .with_state(state)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::INTERNAL_SERVER_ERROR,
            settings.request_timeout,
        ))
        .layer(TraceLayer::new_for_http())
}

async fn capture(State(state): State<ReceiverState>, request: Request) -> StatusCode {
    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, state.max_body_bytes).await {
        Ok(body) => body,
        Err(err) => {
            warn!(path = %parts.uri.path(), error = %err, "failed to read request body");
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    let envelope = Envelope::from_parts(&parts, &body);
    match state.sink.publish(&envelope).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(err) => {
            error!(path = %envelope.path, error = %err, "failed to publish webhook");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Serves until `shutdown` fires, then lets in-flight requests finish within
/// the grace period.
pub async fn serve(
    listener: TcpListener,
    sink: Arc<dyn EnvelopeSink>,
    settings: &ReceiverSettings,
    shutdown: &ShutdownCoordinator,
) -> Result<()> {
    let app = router(sink, settings);
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown.token().cancelled_owned());
    let handle = tokio::spawn(async move { server.await });

    shutdown
        .drain("http server", handle)
        .await?
        .context("http server failed")
}

pub async fn run(config: &RelayConfig, broker: Arc<dyn Broker>) -> Result<()> {
    let connections = ConnectionManager::new(broker);
    connections
        .init(&config.amqp)
        .await
        .context("failed to connect to broker")?;

    let outcome = run_with(config, &connections).await;
    connections.close_all().await;
    outcome
}

async fn run_with(config: &RelayConfig, connections: &ConnectionManager) -> Result<()> {
    let publisher = Arc::new(
        Publisher::new(connections)
            .await
            .context("failed to set up publisher")?,
    );
    let health = Arc::new(
        HealthChecker::start(connections, &config.amqp, config.health("receiver"))
            .await
            .context("failed to start health checker")?,
    );

    let shutdown = ShutdownCoordinator::new(config.shutdown_grace());
    let signals = shutdown.listen_for_signals();
    let watcher = shutdown.watch_health(Arc::clone(&health));

    let served = match TcpListener::bind(&config.listen).await {
        Ok(listener) => {
            info!(listen = %config.listen, "receiver listening");
            let sink: Arc<dyn EnvelopeSink> = publisher.clone();
            serve(listener, sink, &config.receiver_settings(), &shutdown).await
        }
        Err(err) => Err(err).with_context(|| format!("failed to bind {}", config.listen)),
    };

    signals.abort();
    watcher.abort();
    health.stop().await;
    publisher.close().await;

    served?;
    if shutdown.reason().as_deref() == Some(HEARTBEAT_FAILED) {
        bail!("receiver stopped after losing the broker");
    }
    info!("receiver stopped");
    Ok(())
}
