//! bulk-link host
//!
//! Attaches USB devices that expose a bulk-in/bulk-out endpoint pair as
//! device sessions and bridges the first attached one to stdin/stdout.

mod bridge;
mod config;
mod usb;

use anyhow::{Context, Result};
use async_channel::Receiver;
use bridge::Bridge;
use clap::Parser;
use common::{UsbBridge, UsbCommand, UsbEvent, create_usb_bridge, setup_logging};
use config::HostConfig;
use session::Driver;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use usb::{HostPower, TransferTimeouts, spawn_usb_worker};

#[derive(Parser, Debug)]
#[command(name = "bulk-host")]
#[command(
    author,
    version,
    about = "Bulk-link host - bridge a USB bulk endpoint pair to stdin/stdout"
)]
#[command(long_about = "
Attaches every USB device with a bulk-in/bulk-out endpoint pair (optionally
restricted by VID:PID filters) and copies data between the first attached
device and stdin/stdout.

EXAMPLES:
    # Bridge the first matching device
    bulk-host

    # List devices and exit
    bulk-host --list-devices

    # Reads of up to 64 bytes, debug logging
    bulk-host --read-chunk 64 --log-level debug

CONFIGURATION:
    The host looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/bulk-link/host.toml
    3. /etc/bulk-link/host.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Bytes requested per device read
    #[arg(long, value_name = "BYTES")]
    read_chunk: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = HostConfig::default();
        let path = HostConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        HostConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        HostConfig::load_or_default()
    };

    if let Some(chunk) = args.read_chunk {
        config.host.read_chunk = chunk;
    }
    if let Some(ref level) = args.log_level {
        config.host.log_level = level.clone();
    }
    config.validate().context("Invalid settings")?;

    setup_logging(&config.host.log_level).context("Failed to setup logging")?;

    info!("bulk-link host v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", config.host.log_level);

    let (usb_bridge, worker) = create_usb_bridge();
    let timeouts = TransferTimeouts {
        poll: config.usb.poll_timeout(),
        write: config.usb.write_timeout(),
    };
    let usb_worker_handle = spawn_usb_worker(worker, config.usb.filters.clone(), timeouts)
        .context("Failed to spawn USB worker thread")?;

    let result = if args.list_devices {
        list_devices_mode(&usb_bridge).await
    } else {
        run(config, &usb_bridge).await
    };

    info!("Shutting down USB subsystem...");
    if let Err(e) = shutdown_usb_worker(&usb_bridge).await {
        error!("Error shutting down USB worker: {:#}", e);
    }

    match usb_worker_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("USB worker failed: {}", e),
        Err(e) => error!("USB worker thread panicked: {:?}", e),
    }

    result
}

/// List USB devices and exit
async fn list_devices_mode(usb_bridge: &UsbBridge) -> Result<()> {
    let devices = usb_bridge
        .list_devices()
        .await
        .context("Failed to list devices")?;

    if devices.is_empty() {
        println!("No USB devices found.");
    } else {
        println!("Found {} USB device(s):\n", devices.len());
        for device in devices {
            println!("  {}", device);
        }
    }

    Ok(())
}

/// Attach devices as they come and go until Ctrl+C
async fn run(config: HostConfig, usb_bridge: &UsbBridge) -> Result<()> {
    let driver = Driver::new(config.session.clone(), Arc::new(HostPower));
    let stdin = bridge::spawn_stdin_pump().context("Failed to start stdin reader")?;

    let mut minors: HashMap<(u8, u8), u32> = HashMap::new();
    let mut active: Option<Bridge> = None;

    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("Waiting for devices, press Ctrl+C to stop");

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!("Error waiting for Ctrl+C: {}", e);
                }
                info!("Received Ctrl+C, shutting down gracefully...");
                break;
            }
            event = usb_bridge.recv_event() => {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        error!("USB event channel closed: {}", e);
                        break;
                    }
                };
                handle_event(&driver, event, &mut minors, &mut active).await;
            }
        }

        if active.is_none()
            && let Some(minor) = driver.registry().minors().first().copied()
        {
            active = start_bridge(&driver, minor, &config, &stdin).await;
        }
    }

    if let Some(bridge) = active.take() {
        bridge.stop().await;
    }
    driver.shutdown().await;
    Ok(())
}

async fn handle_event(
    driver: &Driver,
    event: UsbEvent,
    minors: &mut HashMap<(u8, u8), u32>,
    active: &mut Option<Bridge>,
) {
    match event {
        UsbEvent::DeviceArrived {
            device,
            interface,
            transport,
        } => match driver.on_attach(&interface, transport) {
            Ok(minor) => {
                info!("{} attached as minor {}", device, minor);
                minors.insert(device.location(), minor);
            }
            Err(e) => warn!("Failed to attach {}: {}", device, e),
        },
        UsbEvent::DeviceLeft {
            bus_number,
            device_address,
        } => {
            let Some(minor) = minors.remove(&(bus_number, device_address)) else {
                return;
            };
            if let Err(e) = driver.on_detach(minor).await {
                warn!("Detach of minor {} failed: {}", minor, e);
            }
            if active.as_ref().is_some_and(|b| b.minor() == minor)
                && let Some(bridge) = active.take()
            {
                bridge.stop().await;
            }
            info!("Minor {} detached", minor);
        }
    }
}

async fn start_bridge(
    driver: &Driver,
    minor: u32,
    config: &HostConfig,
    stdin: &Receiver<Vec<u8>>,
) -> Option<Bridge> {
    match Bridge::start(driver, minor, &config.host, stdin.clone()).await {
        Ok(bridge) => Some(bridge),
        Err(e) => {
            warn!("Cannot bridge minor {}: {}", minor, e);
            None
        }
    }
}

/// Shutdown USB worker thread gracefully
async fn shutdown_usb_worker(usb_bridge: &UsbBridge) -> Result<()> {
    usb_bridge
        .send_command(UsbCommand::Shutdown)
        .await
        .context("Failed to send Shutdown command")?;
    Ok(())
}
