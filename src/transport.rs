//! Platform seam between the session logic and a BLE stack.
//!
//! [`crate::ble`] implements these traits on top of btleplug. Anything that
//! can scan, open a GATT link and push notifications can stand in for it.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    error::Result,
    types::{DeviceAddress, DiscoveredDevice, WriteKind},
};

/// Asynchronous event reported by the adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    /// A scan found a peripheral or refreshed its advertisement
    DeviceDiscovered(DiscoveredDevice),
    /// A peripheral link went down, whoever initiated it
    DeviceDisconnected(DeviceAddress),
    /// The platform aborted the running scan
    ScanFailed(String),
}

/// A GATT service and the UUIDs of its characteristics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// Service UUID
    pub uuid: Uuid,
    /// Characteristic UUIDs within the service
    pub characteristics: Vec<Uuid>,
}

impl GattService {
    /// Whether the service exposes the given characteristic
    #[must_use]
    pub fn has_characteristic(&self, uuid: Uuid) -> bool {
        self.characteristics.contains(&uuid)
    }
}

/// A characteristic value pushed by the peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Characteristic that changed
    pub characteristic: Uuid,
    /// Raw value bytes
    pub value: Vec<u8>,
}

/// Host Bluetooth adapter
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Check that the adapter is present, powered and usable
    async fn ensure_ready(&self) -> Result<()>;

    /// Begin continuous discovery of peripherals advertising any of `services`
    async fn start_scan(&self, services: &[Uuid]) -> Result<()>;

    /// Halt discovery
    async fn stop_scan(&self) -> Result<()>;

    /// Stream of adapter events; called once by the session manager
    async fn events(&self) -> Result<BoxStream<'static, AdapterEvent>>;

    /// Handle for a GATT link to a known peripheral; does not connect
    async fn link(&self, address: &DeviceAddress) -> Result<Arc<dyn GattLink>>;
}

/// GATT client link to one peripheral
#[async_trait]
pub trait GattLink: Send + Sync {
    /// Peripheral this link targets
    fn address(&self) -> &DeviceAddress;

    /// Bring the link up; resolves once connected or failed
    async fn connect(&self) -> Result<()>;

    /// Discover services and characteristics
    async fn discover_services(&self) -> Result<Vec<GattService>>;

    /// Write the Client Characteristic Configuration descriptor of
    /// `characteristic` with the enable-notification value
    async fn enable_notifications(&self, characteristic: Uuid) -> Result<()>;

    /// Write a characteristic value
    async fn write(&self, characteristic: Uuid, value: &[u8], kind: WriteKind) -> Result<()>;

    /// Tear the link down and release its resources
    async fn disconnect(&self) -> Result<()>;

    /// Stream of notifications; ends when the link closes
    async fn notifications(&self) -> Result<BoxStream<'static, Notification>>;
}
