//! Flash bootloader simulator
//!
//! Serves UDS reprogramming requests over ISO-TP with RAM-backed flash and a
//! JSON metadata file.
//!
//! # Usage
//!
//! ```bash
//! ./fbl-sim --interface vcan0 --nv-file /tmp/fbl-nv.json
//! ```
//!
//! With config file:
//! ```bash
//! ./fbl-sim --config config/fbl-sim.toml
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::task::JoinHandle;
use tracing::info;

use fbl_sim::config::{parse_can_id, parse_hex_string, SimConfig};
use fbl_sim::{simulator, transport, SimHardware};

#[derive(Parser, Debug)]
#[command(name = "fbl-sim")]
#[command(about = "UDS flash bootloader simulator over SocketCAN ISO-TP")]
struct Args {
    /// Configuration file path (TOML format)
    /// If provided, overrides command-line options
    #[arg(short, long)]
    config: Option<String>,

    /// CAN interface name
    #[arg(short, long, default_value = "vcan0")]
    interface: String,

    /// Bootloader's receive CAN ID (tester sends to this)
    #[arg(long, default_value = "0x18DA00F1")]
    rx_id: String,

    /// Bootloader's transmit CAN ID
    #[arg(long, default_value = "0x18DAF100")]
    tx_id: String,

    /// Metadata file (created on first write)
    #[arg(long, default_value = "fbl-nv.json")]
    nv_file: PathBuf,

    /// Security access shared secret (hex string, e.g., "deadbeef")
    #[arg(long, default_value = "ff")]
    security_secret: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        "fbl_sim=debug,fbl_core=debug"
    } else {
        "fbl_sim=info,fbl_core=info"
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = if let Some(config_path) = &args.config {
        info!("Loading config from: {}", config_path);
        SimConfig::load(config_path)?
    } else {
        let mut config = SimConfig::default();
        config.transport.interface = args.interface.clone();
        config.transport.rx_id = args.rx_id.clone();
        config.transport.tx_id = args.tx_id.clone();
        config.storage.nv_file = args.nv_file.clone();
        config.security.secret = args.security_secret.clone();
        config
    };

    info!("Starting flash bootloader simulator");
    info!(
        interface = %config.transport.interface,
        rx_id = %config.transport.rx_id,
        tx_id = %config.transport.tx_id,
        nv_file = %config.storage.nv_file.display()
    );

    let rx_id = parse_can_id(&config.transport.rx_id)?;
    let tx_id = parse_can_id(&config.transport.tx_id)?;
    let secret = parse_hex_string(&config.security.secret)?;

    let socket = transport::open_socket(&config.transport.interface, rx_id, tx_id)?;
    let hardware = SimHardware::new(config.bootloader, config.storage.nv_file, secret);

    let running = Arc::new(AtomicBool::new(true));
    let running_for_loop = running.clone();
    let mut main_handle: JoinHandle<Result<()>> = tokio::task::spawn_blocking(move || {
        simulator::run(hardware, socket, running_for_loop)
    });

    info!("Simulator ready - waiting for requests");
    info!("Press Ctrl+C to stop");

    tokio::select! {
        result = &mut main_handle => {
            // Halted or failed to reboot
            return result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    running.store(false, Ordering::SeqCst);
    let _ = tokio::time::timeout(Duration::from_secs(2), main_handle).await;

    info!("Simulator stopped");
    Ok(())
}
