//! Broker-facing relay core: connection pair, envelope codec, publish and
//! subscribe sides, and the heartbeat.

pub mod amqp;
mod connection;
pub mod envelope;
mod health;
mod publisher;
mod subscriber;

pub use connection::ConnectionManager;
pub use envelope::{routing_key, Envelope};
pub use health::{HealthChecker, HealthConfig};
pub use publisher::{EnvelopeSink, Publisher};
pub use subscriber::{DeliveryStream, Subscriber, DEFAULT_BINDING};

/// Topic exchange every relayed webhook is published to.
pub const EXCHANGE: &str = "webhooks";
