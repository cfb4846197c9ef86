use async_trait::async_trait;
use btleplug::{
    api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType},
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use futures::stream::{BoxStream, StreamExt};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{BleSessionError, Result},
    transport::{AdapterEvent, BleAdapter, GattLink, GattService, Notification},
    types::{DeviceAddress, DiscoveredDevice, SessionConfig, WriteKind},
};

type PeripheralCache = Arc<Mutex<HashMap<DeviceAddress, Peripheral>>>;

/// [`BleAdapter`] backed by the host Bluetooth stack through btleplug
pub struct BtleplugAdapter {
    _manager: Manager,
    central: Option<Adapter>,
    peripherals: PeripheralCache,
}

impl BtleplugAdapter {
    /// Open the host adapter selected by `config.adapter_index`
    ///
    /// A missing adapter is not an error here; it surfaces as
    /// [`BleSessionError::AdapterUnavailable`] from [`BleAdapter::ensure_ready`].
    ///
    /// # Errors
    ///
    /// Returns [`BleSessionError::Ble`] if the platform Bluetooth manager
    /// cannot be initialized.
    pub async fn new(config: &SessionConfig) -> Result<Self> {
        let manager = Manager::new().await?;
        let central = manager
            .adapters()
            .await?
            .into_iter()
            .nth(config.adapter_index);

        if central.is_none() {
            warn!("No Bluetooth adapter at index {}", config.adapter_index);
        }

        Ok(Self {
            _manager: manager,
            central,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn central(&self) -> Result<&Adapter> {
        self.central
            .as_ref()
            .ok_or(BleSessionError::AdapterUnavailable)
    }
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    async fn ensure_ready(&self) -> Result<()> {
        let info = self.central()?.adapter_info().await?;
        debug!("Using Bluetooth adapter: {}", info);
        Ok(())
    }

    async fn start_scan(&self, services: &[Uuid]) -> Result<()> {
        let scan_filter = ScanFilter {
            services: services.to_vec(),
        };
        self.central()?.start_scan(scan_filter).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.central()?.stop_scan().await?;
        Ok(())
    }

    async fn events(&self) -> Result<BoxStream<'static, AdapterEvent>> {
        let central = self.central()?.clone();
        let peripherals = Arc::clone(&self.peripherals);
        let events = central.events().await?;

        Ok(events
            .filter_map(move |event| {
                let central = central.clone();
                let peripherals = Arc::clone(&peripherals);
                async move { translate_event(&central, &peripherals, event).await }
            })
            .boxed())
    }

    async fn link(&self, address: &DeviceAddress) -> Result<Arc<dyn GattLink>> {
        let cached = self.peripherals.lock().await.get(address).cloned();
        if let Some(peripheral) = cached {
            return Ok(Arc::new(BtleplugLink::new(address.clone(), peripheral)));
        }

        let peripheral = self
            .central()?
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == address.as_str())
            .ok_or_else(|| BleSessionError::DeviceNotFound(address.clone()))?;

        self.peripherals
            .lock()
            .await
            .insert(address.clone(), peripheral.clone());

        Ok(Arc::new(BtleplugLink::new(address.clone(), peripheral)))
    }
}

async fn translate_event(
    central: &Adapter,
    peripherals: &PeripheralCache,
    event: CentralEvent,
) -> Option<AdapterEvent> {
    match event {
        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
            discovered_device(central, peripherals, &id)
                .await
                .map(AdapterEvent::DeviceDiscovered)
        }
        CentralEvent::DeviceDisconnected(id) => Some(AdapterEvent::DeviceDisconnected(
            DeviceAddress::new(id.to_string()),
        )),
        _ => None,
    }
}

/// Build a scan record from the peripheral's current properties
async fn discovered_device(
    central: &Adapter,
    peripherals: &PeripheralCache,
    id: &PeripheralId,
) -> Option<DiscoveredDevice> {
    let peripheral = central.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    let address = DeviceAddress::new(peripheral.id().to_string());

    let device = DiscoveredDevice {
        address: address.clone(),
        display_name: properties.local_name,
        signal_strength: properties.rssi.unwrap_or(0),
        advertised_services: properties.services.into_iter().collect(),
    };

    peripherals.lock().await.insert(address, peripheral);
    Some(device)
}

impl From<WriteKind> for WriteType {
    fn from(kind: WriteKind) -> Self {
        match kind {
            WriteKind::WithResponse => Self::WithResponse,
            WriteKind::WithoutResponse => Self::WithoutResponse,
        }
    }
}

/// [`GattLink`] over a btleplug peripheral
pub struct BtleplugLink {
    address: DeviceAddress,
    peripheral: Peripheral,
}

impl BtleplugLink {
    fn new(address: DeviceAddress, peripheral: Peripheral) -> Self {
        Self {
            address,
            peripheral,
        }
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| BleSessionError::Transport(format!("characteristic {uuid} not discovered")))
    }
}

#[async_trait]
impl GattLink for BtleplugLink {
    fn address(&self) -> &DeviceAddress {
        &self.address
    }

    async fn connect(&self) -> Result<()> {
        info!("Connecting to {}", self.address);
        self.peripheral.connect().await?;
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<GattService>> {
        self.peripheral.discover_services().await?;

        let services = self
            .peripheral
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service.characteristics.iter().map(|c| c.uuid).collect(),
            })
            .collect();

        Ok(services)
    }

    async fn enable_notifications(&self, characteristic: Uuid) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        // subscribe writes ENABLE_NOTIFICATION_VALUE to the characteristic's
        // CLIENT_CHARACTERISTIC_CONFIG_UUID descriptor
        self.peripheral.subscribe(&characteristic).await?;
        Ok(())
    }

    async fn write(&self, characteristic: Uuid, value: &[u8], kind: WriteKind) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        debug!("Writing {:02X?} to {}", value, characteristic.uuid);
        self.peripheral
            .write(&characteristic, value, kind.into())
            .await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await?;
        Ok(())
    }

    async fn notifications(&self) -> Result<BoxStream<'static, Notification>> {
        let stream = self.peripheral.notifications().await?;
        Ok(stream
            .map(|n| Notification {
                characteristic: n.uuid,
                value: n.value,
            })
            .boxed())
    }
}
