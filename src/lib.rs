// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # motor-link-ble
//!
//! A Rust library for discovering, connecting to and commanding a remote
//! motor controller over Bluetooth Low Energy, while decoding its telemetry
//! stream.
//!
//! ## Features
//!
//! - **Discovery**: Track nearby controllers with stale entry eviction
//! - **Ordered Commands**: Writes are dispatched strictly in order, one at a time,
//!   each paced by its acknowledgment or a bounded timeout
//! - **Telemetry**: Status, speed and position decoded from every notification
//! - **Auto-Reconnect**: An unexpectedly lost unit is found again by its
//!   advertised device identifier and reconnected within a deadline
//! - **Pluggable Radio**: The engine runs on any [`Transport`]; a btleplug
//!   implementation is included
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use motor_link_ble::{DeviceManager, LinkConfig, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let manager = DeviceManager::btleplug(LinkConfig::default()).await?;
//!     manager.start_scan().await?;
//!
//!     // Wait for controllers to be discovered
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//!     if let Some(device) = manager.strongest() {
//!         manager.connect(&device.address).await?;
//!     }
//!
//!     let mut telemetry = manager.subscribe_telemetry();
//!     while let Ok(frame) = telemetry.recv().await {
//!         println!("speed {} position {}", frame.speed, frame.position);
//!         if manager.is_ready() {
//!             manager.set_speed(1200)?;
//!         }
//!     }
//!
//!     manager.shutdown_manager().await?;
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
pub mod protocol;
pub mod subscription;

// Re-exports for convenience
pub use device_manager::DeviceManager;
pub use error::{Error, Result};
pub use subscription::CallbackHandle;

// Re-export commonly used types from submodules
pub use ble::advertising::{Advertisement, DeviceId, ScanRequest};
pub use ble::connection::{ConnectionEvent, ConnectionState, ConnectionSummary};
pub use ble::reconnect::ReconnectEvent;
pub use ble::registry::Sighting;
pub use ble::transport::{GattLink, Transport, TransportEvent};
pub use config::{LinkConfig, ScanMode};
pub use protocol::{Command, MotorState, Opcode, StatusFlags, TelemetryFrame};
