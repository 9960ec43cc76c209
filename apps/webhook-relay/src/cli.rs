use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::ConfigOverrides;

#[derive(Debug, Parser)]
#[command(
    name = "webhook-relay",
    author,
    version,
    about = "Captures webhooks, publishes them to RabbitMQ and replays them to other hosts"
)]
pub struct Cli {
    /// AMQP URI for RabbitMQ.
    #[arg(long, global = true)]
    pub amqp: Option<String>,

    /// Config file (defaults to ./config.yaml when present).
    #[arg(long, global = true, env = "WEBHOOK_RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Receives webhooks and publishes them to the `webhooks` exchange.
    Receiver(ReceiverArgs),
    /// Consumes webhooks from RabbitMQ and sends them on to a host.
    Transmitter(TransmitterArgs),
}

#[derive(Debug, Args)]
pub struct ReceiverArgs {
    /// Address to listen on.
    #[arg(long)]
    pub listen: Option<String>,
}

#[derive(Debug, Args)]
pub struct TransmitterArgs {
    /// Routing-key pattern to subscribe to.
    #[arg(long)]
    pub key: Option<String>,

    /// URI to send webhooks to.
    #[arg(long)]
    pub send_to: Option<String>,

    /// Skip TLS certificate verification.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub insecure: Option<bool>,

    /// Add Relay-Original-Path and Relay-Original-Host headers.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub extra_headers: Option<bool>,

    /// Send the original Host header instead of the destination's.
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub preserve_host: Option<bool>,
}

impl Cli {
    pub fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides {
            amqp: self.amqp.clone(),
            ..ConfigOverrides::default()
        };
        match &self.command {
            Command::Receiver(args) => {
                overrides.listen = args.listen.clone();
            }
            Command::Transmitter(args) => {
                overrides.key = args.key.clone();
                overrides.send_to = args.send_to.clone();
                overrides.insecure = args.insecure;
                overrides.extra_headers = args.extra_headers;
                overrides.preserve_host = args.preserve_host;
            }
        }
        overrides
    }

    pub fn role(&self) -> &'static str {
        match self.command {
            Command::Receiver(_) => "receiver",
            Command::Transmitter(_) => "transmitter",
        }
    }
}
