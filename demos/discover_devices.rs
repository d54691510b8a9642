//! Basic example: discover nearby LOGITOW bricks and print their events
//!
//! Run with: cargo run --example discover_devices
//!
//! To connect to every brick as soon as it is found:
//!   cargo run --example discover_devices -- --connect

use logitow_ble::{BlockState, ChannelSink, DeviceManager, ManagerConfig, ManagerEvent, Result};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("logitow_ble=debug".parse().unwrap()),
        )
        .init();

    let auto_connect = std::env::args().any(|arg| arg == "--connect");

    println!("Starting LOGITOW discovery...");
    if auto_connect {
        println!("Bricks will be connected as soon as they are found.\n");
    }

    let config = ManagerConfig::default().with_auto_connect(auto_connect);
    let sink = Arc::new(ChannelSink::new(config.event_capacity));
    let manager = DeviceManager::with_btleplug(sink.clone(), config).await?;

    let _handle = sink.on_event(|event| match event {
        ManagerEvent::BlockData { id, data } => {
            let state = BlockState::from_bytes(&data);
            println!(
                "[{}] block {:06X} {:?} side {:?} -> {:06X}",
                id,
                state.block_a,
                state.operation(),
                state.side,
                state.block_b
            );
        }
        ManagerEvent::BatteryInfo { id, volts } => println!("[{}] battery {:.1} V", id, volts),
        other => println!("{:?}", other),
    });

    manager.start_scan().await?;

    // Let discovery run for a while.
    tokio::time::sleep(Duration::from_secs(10)).await;

    println!("\nDiscovered: {:?}", manager.discovered_devices());
    println!("Connected: {:?}", manager.connected_devices());

    for id in manager.connected_devices() {
        if let Err(e) = manager.request_battery(&id).await {
            println!("Battery request for {} failed: {}", id, e);
        }
    }

    // Give battery reports time to arrive.
    tokio::time::sleep(Duration::from_secs(2)).await;

    manager.shutdown().await?;
    Ok(())
}
