// Allow derivable impls for clarity
#![allow(clippy::derivable_impls)]
// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # logitow-ble
//!
//! A cross-platform Rust library for discovering and streaming LOGITOW
//! building bricks over Bluetooth Low Energy.
//!
//! A LOGITOW brick reports every block attached to or removed from it as a
//! 7-byte block-state notification, and answers battery requests with a
//! 2-byte voltage report. This crate finds the bricks, keeps a bounded set of
//! them connected, and forwards both streams to an [`EventSink`].
//!
//! ## Features
//!
//! - **Discovery**: Track every peripheral advertising the `LOGITOW` name
//! - **Sessions**: Connect, subscribe and tear down one brick at a time or many at once
//! - **Block Data**: Raw block-state payloads, plus [`BlockState`] for structured access
//! - **Battery**: Voltage reports with low-charge detection
//! - **Pluggable Radio**: Everything runs against the [`Transport`] trait
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use logitow_ble::{ChannelSink, DeviceManager, ManagerConfig, Result};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let sink = Arc::new(ChannelSink::default());
//!     let mut events = sink.subscribe();
//!
//!     let manager = DeviceManager::with_btleplug(sink, ManagerConfig::default()).await?;
//!     manager.start_scan().await?;
//!
//!     // Wait for bricks to be discovered
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//!     for id in manager.discovered_devices() {
//!         manager.connect(&id).await?;
//!     }
//!
//!     while let Ok(event) = events.recv().await {
//!         println!("{:?}", event);
//!     }
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod config;
pub mod device_manager;
pub mod error;
pub mod events;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use config::{BatteryThresholds, ManagerConfig};
pub use device_manager::DeviceManager;
pub use error::{Error, Result};
pub use events::{CallbackHandle, ChannelSink, EventSink, ManagerEvent};
pub use registry::{DeviceRegistry, RegistryEntry, Scope};
pub use session::DeviceSession;

// Re-export commonly used types from submodules
pub use ble::advertising::{Advertisement, AdvertisementDelta, DeviceId, PropertyValue};
pub use ble::characteristics::ChannelKind;
pub use ble::connection::SessionState;
pub use ble::scanner::ScanController;
pub use protocol::{BatteryReading, BlockOperation, BlockSide, BlockState};
pub use transport::{CommunicationStatus, PowerState, Transport};
