#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # bike-trainer-ble
//!
//! Scan for, connect to and read telemetry from a Bluetooth Low Energy heart
//! rate strap and a smart indoor bike trainer, and steer the trainer through
//! its Fitness Machine control point.
//!
//! The crate speaks two standard Bluetooth SIG profiles:
//!
//! - **Heart Rate** (service `0x180D`): Heart Rate Measurement notifications
//!   with an 8-bit or 16-bit beats-per-minute value.
//! - **Fitness Machine** (service `0x1826`): Indoor Bike Data notifications
//!   carrying a flag-selected subset of speed, cadence, distance, resistance,
//!   power, energy, heart rate, metabolic equivalent and timer fields; plus
//!   control point writes for setpoints.
//!
//! Each role runs its own [`GattSession`] with an observable connection
//! state and a latest-value telemetry slot. [`SessionManager`] bundles a
//! scanner and both sessions on one adapter.
//!
//! ## Quick Start
//!
//! ```no_run
//! use bike_trainer_ble::{PeripheralRole, SessionConfig, SessionManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = SessionManager::new(SessionConfig::default()).await?;
//!     manager.start_scan().await;
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//!     if let Some(trainer) = manager.devices().into_iter().find(|d| d.is_fitness_machine()) {
//!         manager.connect(PeripheralRole::Trainer, trainer.address).await;
//!     }
//!
//!     let mut telemetry = manager.subscribe_trainer_telemetry();
//!     while telemetry.changed().await.is_ok() {
//!         if let Some(power) = telemetry.borrow().as_ref().and_then(|t| t.instantaneous_power) {
//!             println!("{power} W");
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Safety Warning
//!
//! ⚠️ Target power and resistance commands change the load on a rider's legs.
//! The trainer ignores setpoints until control has been requested, and this
//! crate does not confirm that a command was accepted.

use uuid::Uuid;

/// btleplug implementation of the transport traits
pub mod ble;
/// Error types and handling
pub mod error;
/// Scanner and both role sessions behind one facade
pub mod manager;
/// GATT layout of each peripheral role
pub mod profile;
/// Notification decoders and control point encoding
pub mod protocol;
/// Peripheral discovery
pub mod scan;
/// Per-role connection state machine
pub mod session;
/// Adapter and link traits
pub mod transport;
/// Type definitions and data structures
pub mod types;

#[cfg(test)]
mod testing;

// Re-export the main types for convenient usage
pub use ble::BtleplugAdapter;
pub use error::{BleSessionError, Result};
pub use manager::SessionManager;
pub use profile::{HeartRateProfile, IndoorBikeProfile, Profile};
pub use protocol::{decode_heart_rate, decode_indoor_bike_data, ControlPointCommand};
pub use scan::ScanCoordinator;
pub use session::GattSession;
pub use types::{
    ConnectionState, DeviceAddress, DiscoveredDevice, HeartRateSample, IndoorBikeTelemetry,
    PeripheralRole, SessionConfig, WriteKind,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Heart Rate service (`0x180D`)
pub const HEART_RATE_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_180d_0000_1000_8000_0080_5f9b_34fb);

/// Heart Rate Measurement characteristic (`0x2A37`), notify only
pub const HEART_RATE_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x0000_2a37_0000_1000_8000_0080_5f9b_34fb);

/// Fitness Machine service (`0x1826`)
pub const FITNESS_MACHINE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_1826_0000_1000_8000_0080_5f9b_34fb);

/// Fitness Machine Feature characteristic (`0x2ACC`)
pub const FITNESS_MACHINE_FEATURE_UUID: Uuid =
    Uuid::from_u128(0x0000_2acc_0000_1000_8000_0080_5f9b_34fb);

/// Indoor Bike Data characteristic (`0x2AD2`), notify only
pub const INDOOR_BIKE_DATA_UUID: Uuid = Uuid::from_u128(0x0000_2ad2_0000_1000_8000_0080_5f9b_34fb);

/// Training Status characteristic (`0x2AD3`)
pub const TRAINING_STATUS_UUID: Uuid = Uuid::from_u128(0x0000_2ad3_0000_1000_8000_0080_5f9b_34fb);

/// Fitness Machine Control Point characteristic (`0x2AD9`), write and indicate
pub const FITNESS_MACHINE_CONTROL_POINT_UUID: Uuid =
    Uuid::from_u128(0x0000_2ad9_0000_1000_8000_0080_5f9b_34fb);

/// Client Characteristic Configuration descriptor (`0x2902`)
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid =
    Uuid::from_u128(0x0000_2902_0000_1000_8000_0080_5f9b_34fb);

/// Value written to the CCCD to enable notifications
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
