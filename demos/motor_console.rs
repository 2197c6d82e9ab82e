//! Motor console example
//!
//! Demonstrates the full link lifecycle:
//! - Scanning for motor controllers
//! - Connecting to the strongest (or a given) controller
//! - Sending calibrate and speed commands
//! - Printing decoded telemetry
//! - Reporting auto-reconnect progress
//!
//! Run with: cargo run --example motor_console
//!
//! To connect to a specific controller and run at a given speed:
//!   cargo run --example motor_console -- --address <ADDRESS> --speed 1500

use motor_link_ble::{
    ConnectionState, DeviceManager, Error, LinkConfig, ReconnectEvent, Result,
};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,motor_link_ble=debug".into()),
        )
        .init();

    println!("Motor Console");
    println!("=============\n");

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let target_address = args
        .iter()
        .position(|arg| arg == "--address")
        .and_then(|i| args.get(i + 1))
        .cloned();
    let speed = args
        .iter()
        .position(|arg| arg == "--speed")
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse::<i32>().ok())
        .unwrap_or(1000);

    let manager = DeviceManager::btleplug(LinkConfig::default()).await?;

    let _sighted = manager.on_device_sighted(|device| {
        println!(
            "  Sighted {} {:?} ({} dBm, id {})",
            device.address,
            device.name.as_deref().unwrap_or("<unnamed>"),
            device.rssi,
            device
                .device_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    });

    let _connection = manager.on_connection_changed(|summary| {
        println!(
            "Link {}: {}",
            summary.name.as_deref().unwrap_or("<unnamed>"),
            if summary.connected { "connected" } else { "disconnected" }
        );
    });

    let _timeout = manager.on_reconnect_timeout(|device_id| {
        println!("Gave up reconnecting to {}", device_id);
    });

    println!("Scanning for 5 seconds...\n");
    manager.start_scan().await?;
    tokio::time::sleep(Duration::from_secs(5)).await;

    let device = match target_address {
        Some(address) => manager
            .device(&address)
            .ok_or(Error::DeviceNotFound { address })?,
        None => manager.strongest().ok_or_else(|| Error::DeviceNotFound {
            address: "any".to_string(),
        })?,
    };

    println!("\nConnecting to {}...", device.address);
    manager.connect(&device.address).await?;

    // Wait for the link to become ready
    let mut states = manager.subscribe_state();
    while manager.connection_state() != ConnectionState::Ready {
        match tokio::time::timeout(Duration::from_secs(15), states.recv()).await {
            Ok(Ok(event)) => println!("  State: {} -> {}", event.previous, event.state),
            Ok(Err(_)) => continue,
            Err(_) => {
                println!("Timed out waiting for the controller");
                manager.shutdown_manager().await?;
                return Ok(());
            }
        }
    }

    println!("\nCalibrating, then running at {} rpm\n", speed);
    manager.calibrate()?;
    manager.set_speed(speed)?;

    let mut telemetry = manager.subscribe_telemetry();
    let mut reconnect = manager.subscribe_reconnect();
    let deadline = tokio::time::sleep(Duration::from_secs(20));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            Ok(frame) = telemetry.recv() => {
                let flags = frame.flags();
                println!(
                    "  {:?}  speed {:>6}  position {:>8}{}{}",
                    frame.motor_state(),
                    frame.speed,
                    frame.position,
                    if flags.sync_bad() { "  [SYNC BAD]" } else { "" },
                    if flags.overheat() { "  [OVERHEAT]" } else { "" },
                );
            }
            Ok(event) = reconnect.recv() => {
                match event {
                    ReconnectEvent::Started { device_id } => println!("Link lost, looking for {}", device_id),
                    ReconnectEvent::Matched { address } => println!("Found again at {}", address),
                    ReconnectEvent::TimedOut { .. } => break,
                    ReconnectEvent::Cancelled => {}
                }
            }
            _ = &mut deadline => break,
        }
    }

    println!("\nStopping motor");
    if let Err(e) = manager.shutdown() {
        println!("Could not stop motor: {}", e);
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    manager.disconnect().await?;
    manager.shutdown_manager().await?;

    Ok(())
}
