use relay_bus::BusError;
use thiserror::Error;

pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Clone, Error)]
pub enum RelayError {
    #[error("failed to connect to broker: {0}")]
    Connection(BusError),
    #[error("broker connections are not initialised")]
    NotReady,
    #[error("failed to open broker channel: {0}")]
    Channel(BusError),
    #[error("failed to declare exchange '{exchange}': {source}")]
    Exchange { exchange: String, source: BusError },
    #[error("failed to declare or bind queue: {0}")]
    Queue(BusError),
    #[error("failed to encode envelope: {0}")]
    Serialization(String),
    #[error("failed to decode envelope: {0}")]
    Decode(String),
    #[error("failed to publish message: {0}")]
    Publish(String),
    #[error("failed to start consuming: {0}")]
    Subscribe(BusError),
    #[error("failed to forward request: {0}")]
    Forward(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RelayError {
    pub fn exchange(exchange: &str, source: BusError) -> Self {
        Self::Exchange {
            exchange: exchange.to_string(),
            source,
        }
    }
}
