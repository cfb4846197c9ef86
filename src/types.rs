use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, fmt};
use uuid::Uuid;

use crate::{FITNESS_MACHINE_SERVICE_UUID, HEART_RATE_SERVICE_UUID};

/// Which peripheral a session talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeripheralRole {
    /// Heart-rate strap (Heart Rate service)
    HeartRate,
    /// Smart trainer (Fitness Machine service)
    Trainer,
}

impl fmt::Display for PeripheralRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeartRate => write!(f, "heart rate"),
            Self::Trainer => write!(f, "trainer"),
        }
    }
}

/// Transport-level connection state of one role
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No link, or the link was lost
    #[default]
    Disconnected,
    /// Connect requested, waiting for the link to come up
    Connecting,
    /// Link is up
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

/// Opaque, stable identifier of a peripheral as reported by the platform
///
/// On Linux this is the MAC address, on macOS and Windows a platform UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Create an address from its platform string form
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Borrow the address string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceAddress {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DeviceAddress {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A peripheral seen during scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Stable device identifier, unique per peripheral
    pub address: DeviceAddress,
    /// Advertised local name
    pub display_name: Option<String>,
    /// Signal strength (RSSI, dBm)
    pub signal_strength: i16,
    /// Service UUIDs present in the advertisement
    pub advertised_services: BTreeSet<Uuid>,
}

impl DiscoveredDevice {
    /// Create a device record with no name or advertised services
    #[must_use]
    pub fn new(address: impl Into<DeviceAddress>, signal_strength: i16) -> Self {
        Self {
            address: address.into(),
            display_name: None,
            signal_strength,
            advertised_services: BTreeSet::new(),
        }
    }

    /// Whether the device advertises the Heart Rate service
    #[must_use]
    pub fn is_heart_rate_monitor(&self) -> bool {
        self.advertised_services.contains(&HEART_RATE_SERVICE_UUID)
    }

    /// Whether the device advertises the Fitness Machine service
    #[must_use]
    pub fn is_fitness_machine(&self) -> bool {
        self.advertised_services.contains(&FITNESS_MACHINE_SERVICE_UUID)
    }
}

/// One Heart Rate Measurement notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartRateSample {
    /// Heart rate in beats per minute
    pub beats_per_minute: u16,
}

/// Decoded Indoor Bike Data notification
///
/// A field is `Some` exactly when its flag bit was set in the source frame
/// and the frame was long enough to carry it. Zero is a real reading, not a
/// stand-in for "absent".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndoorBikeTelemetry {
    /// Instantaneous speed (km/h)
    pub instantaneous_speed: Option<f64>,
    /// Average speed (km/h)
    pub average_speed: Option<f64>,
    /// Instantaneous cadence (rpm)
    pub instantaneous_cadence: Option<f64>,
    /// Average cadence (rpm)
    pub average_cadence: Option<f64>,
    /// Total distance (m)
    pub total_distance: Option<u32>,
    /// Resistance level (unitless, signed)
    pub resistance_level: Option<i16>,
    /// Instantaneous power (W)
    pub instantaneous_power: Option<i16>,
    /// Average power (W)
    pub average_power: Option<i16>,
    /// Total expended energy (kcal)
    pub total_energy: Option<u16>,
    /// Energy per hour (kcal)
    pub energy_per_hour: Option<u16>,
    /// Energy per minute (kcal)
    pub energy_per_minute: Option<u8>,
    /// Heart rate reported by the trainer (bpm)
    pub heart_rate: Option<u8>,
    /// Metabolic equivalent
    pub metabolic_equivalent: Option<f64>,
    /// Elapsed time (s)
    pub elapsed_time: Option<u16>,
    /// Remaining time (s)
    pub remaining_time: Option<u16>,
}

/// ATT write flavour used for control point commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteKind {
    /// Write request, acknowledged at the ATT layer
    #[default]
    WithResponse,
    /// Write command, unacknowledged
    WithoutResponse,
}

/// Session manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Index of the host adapter to use
    pub adapter_index: usize,
    /// Services a scan is filtered to
    pub scan_services: Vec<Uuid>,
    /// Halt an active scan when a role starts connecting
    pub stop_scan_on_connect: bool,
    /// Write type for control point commands
    pub control_write: WriteKind,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            adapter_index: 0,
            scan_services: vec![HEART_RATE_SERVICE_UUID, FITNESS_MACHINE_SERVICE_UUID],
            stop_scan_on_connect: true,
            control_write: WriteKind::WithResponse,
        }
    }
}
