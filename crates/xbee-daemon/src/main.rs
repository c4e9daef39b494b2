//! XBee Daemon - Main entry point
//!
//! Runs the driver on a serial port and keeps the node table current.

mod config;

use anyhow::Result;
use chrono::Local;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::interval;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use xbee_core::Node;
use xbee_driver::Driver;

#[derive(Parser, Debug)]
#[command(name = "xbee")]
#[command(about = "XBee radio gateway daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "xbee.toml")]
    config: PathBuf,

    /// Serial port of the radio
    #[arg(short, long)]
    port: Option<String>,

    /// Serial baud rate
    #[arg(short, long)]
    baud: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Run a single discovery, print the node table and exit
    #[arg(long)]
    scan_once: bool,

    /// Write a default configuration file and exit
    #[arg(long)]
    write_default_config: bool,
}

/// Longest wait for the radio in `--scan-once` mode
const OPEN_TIMEOUT: Duration = Duration::from_secs(30);

fn print_nodes(nodes: &[Node]) {
    println!(
        "{} node(s) at {}:",
        nodes.len(),
        Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    for node in nodes {
        println!(
            "  - {} {} {} {}",
            node.addr_extended, node.addr_short, node.kind, node.label
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("XBee daemon v{}", env!("CARGO_PKG_VERSION"));

    if args.write_default_config {
        config::save_default_config(&args.config)?;
        info!(path = %args.config.display(), "Wrote default configuration");
        return Ok(());
    }

    // Load configuration
    let mut config = config::load_config(&args.config)?;

    if let Some(port) = args.port {
        config.driver.serial.port = port;
    }
    if let Some(baud) = args.baud {
        config.driver.serial.baud = baud;
    }

    info!(
        port = %config.driver.serial.port,
        baud = config.driver.serial.baud,
        "Configuration loaded"
    );

    let driver = Driver::new(config.driver.clone());

    if args.scan_once {
        info!("Running single discovery");
        driver.wait_until_open(OPEN_TIMEOUT).await?;
        let nodes = driver.get_node_list(true, true).await?;
        print_nodes(&nodes);
        driver.shutdown().await;
        return Ok(());
    }

    let period = Duration::from_secs(config.daemon.discovery_interval_secs.max(1));
    let mut ticker = interval(period);
    // The driver starts a discovery when the link opens
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = driver.get_node_list(true, false).await {
                    warn!(error = %e, "Node discovery not started");
                    continue;
                }
                match driver.get_node_list(false, false).await {
                    Ok(nodes) => {
                        for node in &nodes {
                            info!(
                                address = %node.addr_extended,
                                short = %node.addr_short,
                                kind = %node.kind,
                                label = %node.label,
                                "Node"
                            );
                        }
                        info!(nodes = nodes.len(), "Node table");
                    }
                    Err(e) => warn!(error = %e, "Unable to read node table"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    driver.shutdown().await;
    Ok(())
}
