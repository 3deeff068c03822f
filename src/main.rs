//! SCADA Gateway CLI Entry Point
//!
//! ```bash
//! scada-gateway example > gateway.toml
//! scada-gateway run gateway.toml --simulate --jsonl
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::info;

use scada_gateway::core::logging;
use scada_gateway::core::traits::PlcConnector;
use scada_gateway::gateway::config::EXAMPLE_CONFIG;
use scada_gateway::gateway::{Gateway, GatewayConfig, TelemetryFrame, Visibility};
use scada_gateway::protocols::virtual_plc::VirtualConnector;

/// SCADA Gateway - polls PLCs and streams their telemetry
#[derive(Parser, Debug)]
#[command(name = "scada-gateway", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway until interrupted
    Run {
        /// Configuration file path
        config: PathBuf,

        /// Print raw telemetry frames as JSON Lines
        #[arg(long)]
        jsonl: bool,

        /// Enable debug logging for the gateway
        #[arg(short, long)]
        verbose: bool,

        /// Serve every endpoint from an in-memory virtual PLC
        #[arg(long)]
        simulate: bool,
    },

    /// Print an example configuration
    Example,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            jsonl,
            verbose,
            simulate,
        } => run(config, jsonl, verbose, simulate).await,
        Commands::Example => {
            println!("{}", EXAMPLE_CONFIG);
            Ok(())
        }
    }
}

async fn run(path: PathBuf, jsonl: bool, verbose: bool, simulate: bool) -> anyhow::Result<()> {
    logging::init(verbose);

    let config = GatewayConfig::load(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    let connector = connector_for(&config, simulate)?;

    let gateway = Gateway::new(config, connector)?;
    let (tx, rx) = mpsc::channel(64);
    gateway.subscribe("stdout", Visibility::All, tx).await;
    let printer = tokio::spawn(print_frames(rx, jsonl));

    gateway.start();
    info!(gateway = %gateway.name(), "press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl+C")?;
    info!("shutdown requested");

    gateway.shutdown().await;
    printer.abort();
    Ok(())
}

fn connector_for(config: &GatewayConfig, simulate: bool) -> anyhow::Result<Arc<dyn PlcConnector>> {
    if simulate {
        let connector = VirtualConnector::new();
        for endpoint in config.descriptors() {
            let demo = VirtualConnector::demo([endpoint.address.as_str()], &endpoint.root_node);
            if let Some(plc) = demo.plc(&endpoint.address) {
                connector.register(endpoint.address.clone(), plc);
            }
        }
        return Ok(Arc::new(connector));
    }

    #[cfg(feature = "opcua")]
    {
        use scada_gateway::protocols::opcua::OpcUaConnector;
        Ok(Arc::new(OpcUaConnector::new(config.opcua.clone())))
    }

    #[cfg(not(feature = "opcua"))]
    {
        anyhow::bail!("built without the `opcua` feature; use --simulate")
    }
}

async fn print_frames(mut rx: mpsc::Receiver<Arc<String>>, jsonl: bool) {
    while let Some(frame) = rx.recv().await {
        if jsonl {
            println!("{}", frame);
            continue;
        }

        let Ok(frame) = serde_json::from_str::<TelemetryFrame>(&frame) else {
            continue;
        };
        for snapshot in frame.snapshots() {
            let error = snapshot.error.as_deref().unwrap_or("");
            println!(
                "{:<24} {:<13} {:>4} points {}",
                snapshot.name,
                snapshot.status.as_str(),
                snapshot.nodes.len(),
                error
            );
        }
    }
}
