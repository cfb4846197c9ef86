use thiserror::Error;

use crate::types::{DeviceAddress, PeripheralRole};

/// Errors produced by the BLE session layer
#[derive(Error, Debug)]
pub enum BleSessionError {
    /// Bluetooth Low Energy stack error
    #[error("BLE error: {0}")]
    Ble(#[source] btleplug::Error),

    /// No usable Bluetooth adapter (absent or switched off)
    #[error("Bluetooth adapter unavailable")]
    AdapterUnavailable,

    /// The platform refused Bluetooth access
    #[error("Bluetooth permission not granted")]
    PermissionDenied,

    /// The address is not known to the adapter
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceAddress),

    /// Reconnect was requested but the role was never connected
    #[error("No previously used {role} device to reconnect to")]
    NoPreviousDevice {
        /// Role that has no remembered device
        role: PeripheralRole,
    },

    /// The role's session is not in the connected state
    #[error("{role} session is not connected")]
    NotConnected {
        /// Role that is not connected
        role: PeripheralRole,
    },

    /// The trainer did not expose a Fitness Machine Control Point
    #[error("Fitness Machine Control Point not available")]
    ControlPointUnavailable,

    /// Transport-level failure reported by a non-btleplug backend
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type for BLE session operations
pub type Result<T> = std::result::Result<T, BleSessionError>;

impl From<btleplug::Error> for BleSessionError {
    fn from(error: btleplug::Error) -> Self {
        match error {
            btleplug::Error::PermissionDenied => Self::PermissionDenied,
            other => Self::Ble(other),
        }
    }
}

impl BleSessionError {
    /// Check if this error was detected before any transport action was taken
    #[must_use]
    pub const fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::AdapterUnavailable
                | Self::PermissionDenied
                | Self::NoPreviousDevice { .. }
                | Self::NotConnected { .. }
                | Self::ControlPointUnavailable
        )
    }

    /// Check if this error came from the radio or link
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Ble(_) | Self::DeviceNotFound(_) | Self::Transport(_)
        )
    }
}
