//! Webhook relay over RabbitMQ.
//!
//! The `receiver` captures arbitrary HTTP requests and publishes them to the
//! `webhooks` topic exchange; the `transmitter` consumes a binding of that
//! exchange and replays each request against a configured host.

pub mod cli;
pub mod config;
pub mod error;
pub mod messaging;
pub mod receiver;
pub mod shutdown;
pub mod telemetry;
pub mod transmitter;

pub use crate::config::{ConfigOverrides, RelayConfig};
pub use crate::error::{RelayError, RelayResult};
