use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, trace};
use uuid::Uuid;

use crate::{
    error::Result,
    transport::BleAdapter,
    types::DiscoveredDevice,
};

/// Drives peripheral discovery and keeps the live device list
///
/// The list is keyed by address: a device seen again replaces its earlier
/// entry in place, new devices are appended. Starting a scan clears it.
#[derive(Clone)]
pub struct ScanCoordinator {
    shared: Arc<ScanShared>,
}

struct ScanShared {
    adapter: Arc<dyn BleAdapter>,
    services: Vec<Uuid>,
    scanning: watch::Sender<bool>,
    devices: watch::Sender<Vec<DiscoveredDevice>>,
}

impl ScanCoordinator {
    /// Create a coordinator that filters discovery to `services`
    #[must_use]
    pub fn new(adapter: Arc<dyn BleAdapter>, services: Vec<Uuid>) -> Self {
        Self {
            shared: Arc::new(ScanShared {
                adapter,
                services,
                scanning: watch::Sender::new(false),
                devices: watch::Sender::new(Vec::new()),
            }),
        }
    }

    /// Start continuous discovery
    ///
    /// Clears the previous device list. Scanning state stays `false` when the
    /// adapter is not ready or refuses to scan.
    ///
    /// # Errors
    ///
    /// Returns [`crate::BleSessionError::AdapterUnavailable`] or
    /// [`crate::BleSessionError::PermissionDenied`] when the adapter check
    /// fails, or the adapter's error if the scan cannot start.
    pub async fn start_scan(&self) -> Result<()> {
        let shared = &self.shared;

        if let Err(e) = shared.adapter.ensure_ready().await {
            shared.scanning.send_replace(false);
            return Err(e);
        }

        shared.devices.send_replace(Vec::new());

        if let Err(e) = shared.adapter.start_scan(&shared.services).await {
            shared.scanning.send_replace(false);
            return Err(e);
        }

        shared.scanning.send_replace(true);
        info!("Started BLE scan for {} service(s)", shared.services.len());
        Ok(())
    }

    /// Halt discovery; does nothing when not scanning
    ///
    /// # Errors
    ///
    /// Returns the adapter's error if it fails to stop. Scanning state is
    /// `false` afterwards either way.
    pub async fn stop_scan(&self) -> Result<()> {
        if !self.is_scanning() {
            debug!("stop_scan called while not scanning");
            return Ok(());
        }

        let result = self.shared.adapter.stop_scan().await;
        self.shared.scanning.send_replace(false);
        info!("Stopped BLE scan");
        result
    }

    /// Record a discovery event
    pub fn on_discovered(&self, device: DiscoveredDevice) {
        if !self.is_scanning() {
            return;
        }

        let wanted = device
            .advertised_services
            .iter()
            .any(|uuid| self.shared.services.contains(uuid));
        if !wanted {
            trace!("Ignoring {} (no filtered service advertised)", device.address);
            return;
        }

        self.shared.devices.send_modify(|devices| {
            match devices.iter_mut().find(|d| d.address == device.address) {
                Some(existing) => *existing = device,
                None => {
                    debug!("Discovered {} ({:?})", device.address, device.display_name);
                    devices.push(device);
                }
            }
        });
    }

    /// Record a platform scan failure; never raised to callers
    pub fn on_scan_failed(&self, reason: &str) {
        error!("BLE scan failed: {}", reason);
        self.shared.scanning.send_replace(false);
    }

    /// Whether discovery is running
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        *self.shared.scanning.borrow()
    }

    /// Snapshot of the device list
    #[must_use]
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.shared.devices.borrow().clone()
    }

    /// Observe the scanning flag
    #[must_use]
    pub fn subscribe_scanning(&self) -> watch::Receiver<bool> {
        self.shared.scanning.subscribe()
    }

    /// Observe the device list
    #[must_use]
    pub fn subscribe_devices(&self) -> watch::Receiver<Vec<DiscoveredDevice>> {
        self.shared.devices.subscribe()
    }
}
