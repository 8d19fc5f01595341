use std::path::PathBuf;

use blesyn_core::Message;
use blesyn_protocol::HandshakeConfig;
use blesyn_sim::{run_loopback, HandshakeReport, SimError};
use clap::{Parser, Subcommand};
use tracing::{error, info};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (.toml, .json, .yaml or .env)
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Text the responder serves after the handshake
    #[arg(long, short)]
    text: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Commands {
    /// Run both roles in process (default)
    Loopback,
    /// Act as the responder on the local BlueZ adapter
    #[cfg(all(feature = "bluer", target_os = "linux"))]
    Respond,
    /// Act as the initiator and handshake with a nearby responder
    #[cfg(feature = "btleplug")]
    Initiate,
}

fn run(cli: Cli) -> Result<HandshakeReport, SimError> {
    let config = HandshakeConfig::load(cli.config)?;
    let mut settings = config.settings()?;
    if let Some(text) = &cli.text {
        settings.outbound_text = Message::outbound(text);
    }
    let runner = config.runner();
    info!(
        "sim: service {} characteristic {}",
        settings.service, settings.characteristic
    );

    match cli.command.unwrap_or(Commands::Loopback) {
        Commands::Loopback => run_loopback(settings, &runner),
        #[cfg(all(feature = "bluer", target_os = "linux"))]
        Commands::Respond => blesyn_sim::radio::run_responder(settings, &runner),
        #[cfg(feature = "btleplug")]
        Commands::Initiate => blesyn_sim::radio::run_initiator(settings, &runner),
    }
}

fn main() {
    let filter = std::env::var("BLESYN_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let report = match run(Cli::parse()) {
        Ok(report) => report,
        Err(err) => {
            error!("{err}");
            std::process::exit(2);
        }
    };

    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{json}"),
        Err(err) => {
            error!("report serialization failed: {err}");
            std::process::exit(2);
        }
    }
    if !report.completed {
        std::process::exit(1);
    }
}
