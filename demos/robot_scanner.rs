use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use robot_nexus::{BtleplugRadio, Controller, ControllerConfig, ControllerEvent, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging, RUST_LOG overrides the default filter
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("🤖 Robot Nexus Scanner Example");

    // Optional JSON configuration file as the first argument
    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!("📄 Loading configuration from {}", path);
            ControllerConfig::load(&path)?
        }
        None => ControllerConfig::default(),
    };

    let (radio, radio_events) = match BtleplugRadio::new().await {
        Ok(radio) => radio,
        Err(e) => {
            error!("❌ Failed to open Bluetooth adapter: {}", e);
            return Err(e);
        }
    };

    let controller = Controller::new(Arc::new(radio), config)?;
    let mut events = controller.subscribe();
    let handle = controller.start(radio_events);
    info!("📡 Scanning for robots, press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Stopping...");
                break;
            }
            event = events.recv() => match event {
                Ok(ControllerEvent::ScanStarted) => info!("🔍 Scanning"),
                Ok(ControllerEvent::RobotDiscovered { device, rssi }) => {
                    info!("✨ Found robot {} ({} dBm)", device, rssi);
                }
                Ok(ControllerEvent::Connected { device }) => info!("🔗 Connected to {}", device),
                Ok(ControllerEvent::TransferComplete { device, report }) => {
                    info!("📦 Status from {}: {}", device, report.msgtype);
                }
                Ok(ControllerEvent::ModelUpdated(robots)) => {
                    info!("📊 Robot model ({} robots):", robots.len());
                    for robot in robots {
                        info!("  {}", robot);
                    }
                }
                Ok(ControllerEvent::Disconnected { device }) => {
                    info!("👋 Disconnected from {}", device);
                }
                Ok(ControllerEvent::RadioReset) => warn!("🔄 Resetting Bluetooth adapter"),
                Err(RecvError::Closed) => break,
                Err(e) => warn!("⚠️ Missed controller events: {}", e),
            }
        }
    }

    handle.shutdown().await;
    info!("✅ Done");
    Ok(())
}
