//! In-memory transport for exercising sessions without a radio.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::{
    error::{BleSessionError, Result},
    transport::{AdapterEvent, BleAdapter, GattLink, GattService, Notification},
    types::{DeviceAddress, WriteKind},
    FITNESS_MACHINE_CONTROL_POINT_UUID, FITNESS_MACHINE_FEATURE_UUID, FITNESS_MACHINE_SERVICE_UUID,
    HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID, INDOOR_BIKE_DATA_UUID,
    TRAINING_STATUS_UUID,
};

pub(crate) const WAIT: Duration = Duration::from_secs(2);

pub(crate) fn heart_rate_services() -> Vec<GattService> {
    vec![GattService {
        uuid: HEART_RATE_SERVICE_UUID,
        characteristics: vec![HEART_RATE_MEASUREMENT_UUID],
    }]
}

pub(crate) fn trainer_services() -> Vec<GattService> {
    vec![GattService {
        uuid: FITNESS_MACHINE_SERVICE_UUID,
        characteristics: vec![
            FITNESS_MACHINE_FEATURE_UUID,
            INDOOR_BIKE_DATA_UUID,
            TRAINING_STATUS_UUID,
            FITNESS_MACHINE_CONTROL_POINT_UUID,
        ],
    }]
}

/// Scripted peripheral link
pub(crate) struct FakeLink {
    address: DeviceAddress,
    services: Vec<GattService>,
    gate: Mutex<Option<oneshot::Receiver<bool>>>,
    notify_tx: mpsc::UnboundedSender<Notification>,
    notify_rx: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    writes_tx: mpsc::UnboundedSender<(Uuid, Vec<u8>, WriteKind)>,
    writes_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Uuid, Vec<u8>, WriteKind)>>,
    subscribed: Mutex<Vec<Uuid>>,
    connects: watch::Sender<usize>,
    disconnects: watch::Sender<usize>,
    adapter_events: Mutex<Option<mpsc::UnboundedSender<AdapterEvent>>>,
}

impl FakeLink {
    pub(crate) fn new(address: &str, services: Vec<GattService>) -> Arc<Self> {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (writes_tx, writes_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            address: DeviceAddress::from(address),
            services,
            gate: Mutex::new(None),
            notify_tx,
            notify_rx: Mutex::new(Some(notify_rx)),
            writes_tx,
            writes_rx: tokio::sync::Mutex::new(writes_rx),
            subscribed: Mutex::new(Vec::new()),
            connects: watch::Sender::new(0),
            disconnects: watch::Sender::new(0),
            adapter_events: Mutex::new(None),
        })
    }

    /// Hold the next `connect` until the returned sender fires
    /// (`true` = link comes up, `false` = connect fails)
    pub(crate) fn hold_connect(&self) -> oneshot::Sender<bool> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock().unwrap() = Some(rx);
        tx
    }

    pub(crate) fn push(&self, characteristic: Uuid, value: &[u8]) {
        let _ = self.notify_tx.send(Notification {
            characteristic,
            value: value.to_vec(),
        });
    }

    pub(crate) fn subscribed(&self) -> Vec<Uuid> {
        self.subscribed.lock().unwrap().clone()
    }

    pub(crate) async fn next_write(&self) -> (Uuid, Vec<u8>, WriteKind) {
        let mut rx = self.writes_rx.lock().await;
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for a write")
            .expect("write channel closed")
    }

    pub(crate) fn try_next_write(&self) -> Option<(Uuid, Vec<u8>, WriteKind)> {
        self.writes_rx.try_lock().ok()?.try_recv().ok()
    }

    pub(crate) fn connect_count(&self) -> usize {
        *self.connects.borrow()
    }

    pub(crate) fn disconnect_count(&self) -> usize {
        *self.disconnects.borrow()
    }

    pub(crate) async fn wait_for_disconnects(&self, count: usize) {
        let mut rx = self.disconnects.subscribe();
        tokio::time::timeout(WAIT, rx.wait_for(|n| *n >= count))
            .await
            .expect("timed out waiting for disconnect")
            .expect("disconnect counter dropped");
    }

    pub(crate) async fn wait_for_subscription(&self, characteristic: Uuid) {
        tokio::time::timeout(WAIT, async {
            while !self.subscribed().contains(&characteristic) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("timed out waiting for subscription");
    }
}

#[async_trait]
impl GattLink for FakeLink {
    fn address(&self) -> &DeviceAddress {
        &self.address
    }

    async fn connect(&self) -> Result<()> {
        self.connects.send_modify(|n| *n += 1);
        let gate = self.gate.lock().unwrap().take();
        match gate {
            Some(gate) => match gate.await {
                Ok(true) => Ok(()),
                _ => Err(BleSessionError::Transport("connect failed".to_string())),
            },
            None => Ok(()),
        }
    }

    async fn discover_services(&self) -> Result<Vec<GattService>> {
        Ok(self.services.clone())
    }

    async fn enable_notifications(&self, characteristic: Uuid) -> Result<()> {
        self.subscribed.lock().unwrap().push(characteristic);
        Ok(())
    }

    async fn write(&self, characteristic: Uuid, value: &[u8], kind: WriteKind) -> Result<()> {
        let _ = self.writes_tx.send((characteristic, value.to_vec(), kind));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.send_modify(|n| *n += 1);
        // the host stack reports every link going down, ours included
        if let Some(events) = self.adapter_events.lock().unwrap().as_ref() {
            let _ = events.send(AdapterEvent::DeviceDisconnected(self.address.clone()));
        }
        Ok(())
    }

    async fn notifications(&self) -> Result<BoxStream<'static, Notification>> {
        let rx = self.notify_rx.lock().unwrap().take();
        Ok(match rx {
            Some(rx) => stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|n| (n, rx))
            })
            .boxed(),
            None => stream::pending().boxed(),
        })
    }
}

/// Scripted adapter holding a fixed set of links
pub(crate) struct FakeAdapter {
    ready: Mutex<Option<fn() -> BleSessionError>>,
    links: Mutex<HashMap<DeviceAddress, Arc<FakeLink>>>,
    events_tx: mpsc::UnboundedSender<AdapterEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<AdapterEvent>>>,
    scans: Mutex<Vec<Vec<Uuid>>>,
    stops: Mutex<usize>,
}

impl FakeAdapter {
    pub(crate) fn new() -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            ready: Mutex::new(None),
            links: Mutex::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            scans: Mutex::new(Vec::new()),
            stops: Mutex::new(0),
        })
    }

    pub(crate) fn add_link(&self, link: &Arc<FakeLink>) {
        *link.adapter_events.lock().unwrap() = Some(self.events_tx.clone());
        self.links
            .lock()
            .unwrap()
            .insert(link.address().clone(), Arc::clone(link));
    }

    /// Make `ensure_ready` fail with the given error
    pub(crate) fn fail_ready(&self, error: fn() -> BleSessionError) {
        *self.ready.lock().unwrap() = Some(error);
    }

    pub(crate) fn emit(&self, event: AdapterEvent) {
        let _ = self.events_tx.send(event);
    }

    pub(crate) fn scans(&self) -> Vec<Vec<Uuid>> {
        self.scans.lock().unwrap().clone()
    }

    pub(crate) fn stops(&self) -> usize {
        *self.stops.lock().unwrap()
    }
}

#[async_trait]
impl BleAdapter for FakeAdapter {
    async fn ensure_ready(&self) -> Result<()> {
        match *self.ready.lock().unwrap() {
            Some(error) => Err(error()),
            None => Ok(()),
        }
    }

    async fn start_scan(&self, services: &[Uuid]) -> Result<()> {
        self.scans.lock().unwrap().push(services.to_vec());
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        *self.stops.lock().unwrap() += 1;
        Ok(())
    }

    async fn events(&self) -> Result<BoxStream<'static, AdapterEvent>> {
        let rx = self
            .events_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| BleSessionError::Transport("events already taken".to_string()))?;
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|e| (e, rx)) }).boxed())
    }

    async fn link(&self, address: &DeviceAddress) -> Result<Arc<dyn GattLink>> {
        let link = self.links.lock().unwrap().get(address).cloned();
        match link {
            Some(link) => Ok(link),
            None => Err(BleSessionError::DeviceNotFound(address.clone())),
        }
    }
}
