use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use relay_bus::Broker;
use tracing::info;
use webhook_relay::cli::{Cli, Command};
use webhook_relay::messaging::amqp::AmqpBroker;
use webhook_relay::{receiver, telemetry, transmitter, RelayConfig};

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing()?;

    let cli = Cli::parse();
    let config = RelayConfig::load(cli.config.as_deref(), &cli.overrides())?;
    telemetry::install_metrics(config.metrics_addr()?)?;
    info!(
        role = cli.role(),
        instance_id = %config.instance_id(cli.role()),
        "starting webhook-relay"
    );

    let broker: Arc<dyn Broker> = Arc::new(AmqpBroker);
    match cli.command {
        Command::Receiver(_) => receiver::run(&config, broker).await,
        Command::Transmitter(_) => transmitter::run(&config, broker).await,
    }
}
