use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    error::{BleSessionError, Result},
    profile::{IndoorBikeProfile, Profile},
    protocol::ControlPointCommand,
    transport::{BleAdapter, GattLink, GattService, Notification},
    types::{ConnectionState, DeviceAddress, SessionConfig, WriteKind},
};

/// GATT session for one peripheral role
///
/// The session is the only writer of its connection state and telemetry
/// slot; both are published as [`watch`] values for any number of readers.
///
/// Every connect attempt is tagged with a generation number. Tearing a
/// session down bumps the generation, so completions that arrive later for
/// an older attempt are recognised as stale: the link they bring up is torn
/// down again and the state stays [`ConnectionState::Disconnected`].
pub struct GattSession<P: Profile> {
    shared: Arc<Shared<P>>,
}

impl<P: Profile> Clone for GattSession<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<P: Profile> {
    adapter: Arc<dyn BleAdapter>,
    control_write: WriteKind,
    state: watch::Sender<ConnectionState>,
    telemetry: watch::Sender<Option<P::Sample>>,
    generation: watch::Sender<u64>,
    slot: Mutex<Slot>,
}

#[derive(Default)]
struct Slot {
    active: Option<ActiveLink>,
    last_device: Option<DeviceAddress>,
}

struct ActiveLink {
    link: Arc<dyn GattLink>,
    generation: u64,
    up: bool,
    subscribed: bool,
    commands: Option<mpsc::UnboundedSender<Bytes>>,
}

impl Slot {
    fn is_current(&self, generation: u64) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.generation == generation)
    }

    fn current_mut(&mut self, generation: u64) -> Option<&mut ActiveLink> {
        self.active
            .as_mut()
            .filter(|active| active.generation == generation)
    }
}

/// What service discovery found for the session's profile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Layout {
    measurement: bool,
    control_point: bool,
}

impl Layout {
    fn locate<P: Profile>(services: &[GattService]) -> Self {
        let Some(service) = services.iter().find(|s| s.uuid == P::SERVICE) else {
            return Self::default();
        };
        Self {
            measurement: service.has_characteristic(P::MEASUREMENT),
            control_point: P::CONTROL_POINT.is_some_and(|uuid| service.has_characteristic(uuid)),
        }
    }
}

impl<P: Profile> GattSession<P> {
    /// Create a disconnected session
    #[must_use]
    pub fn new(adapter: Arc<dyn BleAdapter>, config: &SessionConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                adapter,
                control_write: config.control_write,
                state: watch::Sender::new(ConnectionState::Disconnected),
                telemetry: watch::Sender::new(None),
                generation: watch::Sender::new(0),
                slot: Mutex::new(Slot::default()),
            }),
        }
    }

    /// Role this session serves
    #[must_use]
    pub const fn role(&self) -> crate::types::PeripheralRole {
        P::ROLE
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Observe connection state transitions
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Most recent decoded sample, `None` while there is no data
    #[must_use]
    pub fn latest(&self) -> Option<P::Sample> {
        self.shared.telemetry.borrow().clone()
    }

    /// Observe decoded samples; each notification overwrites the last
    #[must_use]
    pub fn subscribe_telemetry(&self) -> watch::Receiver<Option<P::Sample>> {
        self.shared.telemetry.subscribe()
    }

    /// Device most recently used for a connect attempt
    pub async fn last_device(&self) -> Option<DeviceAddress> {
        self.shared.slot.lock().await.last_device.clone()
    }

    /// Whether [`Self::reconnect`] has a device to go back to
    pub async fn has_last_device(&self) -> bool {
        self.shared.slot.lock().await.last_device.is_some()
    }

    /// Whether notifications on the measurement characteristic were enabled
    ///
    /// A connected session that is not subscribed found no matching service
    /// or characteristic and will never produce telemetry.
    pub async fn measurement_subscribed(&self) -> bool {
        self.shared
            .slot
            .lock()
            .await
            .active
            .as_ref()
            .is_some_and(|active| active.subscribed)
    }

    /// Connect to `address`, replacing any existing link
    ///
    /// Returns once the attempt is under way; the state moves to
    /// [`ConnectionState::Connected`] when the link comes up. No timeout is
    /// applied.
    ///
    /// The address becomes the reconnect target once the adapter resolves
    /// it, even if the link itself later fails to come up.
    ///
    /// # Errors
    ///
    /// Returns [`BleSessionError::DeviceNotFound`] if the adapter does not
    /// know the address. The state is left `Disconnected` and the previous
    /// reconnect target is kept.
    pub async fn connect(&self, address: DeviceAddress) -> Result<()> {
        let mut slot = self.shared.slot.lock().await;
        self.teardown(&mut slot).await;
        self.open(&mut slot, address).await
    }

    /// Connect again to the last used device
    ///
    /// # Errors
    ///
    /// Returns [`BleSessionError::NoPreviousDevice`] if the session was never
    /// asked to connect, or the errors of [`Self::connect`].
    pub async fn reconnect(&self) -> Result<()> {
        let mut slot = self.shared.slot.lock().await;
        let Some(address) = slot.last_device.clone() else {
            return Err(BleSessionError::NoPreviousDevice { role: P::ROLE });
        };

        self.teardown(&mut slot).await;
        info!("Reconnecting {} to {}", P::ROLE, address);
        self.open(&mut slot, address).await
    }

    /// Tear down the link, if any, and enter `Disconnected`
    pub async fn disconnect(&self) {
        let mut slot = self.shared.slot.lock().await;
        self.teardown(&mut slot).await;
    }

    async fn teardown(&self, slot: &mut Slot) {
        self.shared.generation.send_modify(|g| *g += 1);

        if let Some(active) = slot.active.take() {
            info!("Disconnecting {} from {}", P::ROLE, active.link.address());
            if let Err(e) = active.link.disconnect().await {
                warn!("Error while disconnecting {}: {}", P::ROLE, e);
            }
        }

        self.enter_disconnected();
    }

    async fn open(&self, slot: &mut Slot, address: DeviceAddress) -> Result<()> {
        let generation = *self.shared.generation.borrow();
        self.set_state(ConnectionState::Connecting);
        info!("Connecting {} to {}", P::ROLE, address);

        let link = match self.shared.adapter.link(&address).await {
            Ok(link) => link,
            Err(e) => {
                self.enter_disconnected();
                return Err(e);
            }
        };

        slot.active = Some(ActiveLink {
            link: Arc::clone(&link),
            generation,
            up: false,
            subscribed: false,
            commands: None,
        });
        slot.last_device = Some(address);

        tokio::spawn(self.clone().drive(link, generation));
        Ok(())
    }

    /// Connection, discovery and notification pump for one attempt
    async fn drive(self, link: Arc<dyn GattLink>, generation: u64) {
        let mut generations = self.shared.generation.subscribe();

        if let Err(e) = link.connect().await {
            warn!("{} connection to {} failed: {}", P::ROLE, link.address(), e);
            self.on_link_down(generation).await;
            return;
        }

        if !self.on_link_up(generation).await {
            debug!("Dropping stale {} link to {}", P::ROLE, link.address());
            if let Err(e) = link.disconnect().await {
                debug!("Stale link disconnect failed: {}", e);
            }
            return;
        }

        let services = match link.discover_services().await {
            Ok(services) => services,
            Err(e) => {
                warn!("{} service discovery failed: {}", P::ROLE, e);
                self.on_link_down(generation).await;
                return;
            }
        };

        let Some(notifications) = self.on_services_discovered(generation, &link, &services).await
        else {
            return;
        };

        self.pump(generation, notifications, &mut generations).await;
    }

    async fn on_link_up(&self, generation: u64) -> bool {
        let mut slot = self.shared.slot.lock().await;
        let Some(active) = slot.current_mut(generation) else {
            return false;
        };
        active.up = true;
        self.set_state(ConnectionState::Connected);
        info!("{} connected", P::ROLE);
        true
    }

    /// Wire up the control point and measurement notifications
    ///
    /// Returns the notification stream once subscribed; `None` leaves the
    /// session connected without telemetry.
    async fn on_services_discovered(
        &self,
        generation: u64,
        link: &Arc<dyn GattLink>,
        services: &[GattService],
    ) -> Option<BoxStream<'static, Notification>> {
        let layout = Layout::locate::<P>(services);
        debug!(
            "{} discovered {} service(s): {:?}",
            P::ROLE,
            services.len(),
            layout
        );

        if let (true, Some(control_point)) = (layout.control_point, P::CONTROL_POINT) {
            let commands = spawn_writer(Arc::clone(link), control_point, self.shared.control_write);
            let mut slot = self.shared.slot.lock().await;
            slot.current_mut(generation)?.commands = Some(commands);
        }

        if !layout.measurement {
            warn!(
                "{} service {} or characteristic {} missing, no telemetry will arrive",
                P::ROLE,
                P::SERVICE,
                P::MEASUREMENT
            );
            return None;
        }

        let notifications = match link.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("{} notification stream unavailable: {}", P::ROLE, e);
                return None;
            }
        };

        if let Err(e) = link.enable_notifications(P::MEASUREMENT).await {
            warn!("Enabling {} notifications failed: {}", P::ROLE, e);
            return None;
        }

        let mut slot = self.shared.slot.lock().await;
        slot.current_mut(generation)?.subscribed = true;
        debug!("{} notifications enabled on {}", P::ROLE, P::MEASUREMENT);
        Some(notifications)
    }

    async fn pump(
        &self,
        generation: u64,
        mut notifications: BoxStream<'static, Notification>,
        generations: &mut watch::Receiver<u64>,
    ) {
        loop {
            tokio::select! {
                notification = notifications.next() => match notification {
                    Some(notification) => self.on_notification(generation, &notification).await,
                    None => break,
                },
                changed = generations.changed() => {
                    if changed.is_err() || *generations.borrow_and_update() != generation {
                        return;
                    }
                }
            }
        }

        debug!("{} notification stream closed", P::ROLE);
        self.on_link_down(generation).await;
    }

    async fn on_notification(&self, generation: u64, notification: &Notification) {
        if notification.characteristic != P::MEASUREMENT {
            trace!("Ignoring {} notification on {}", P::ROLE, notification.characteristic);
            return;
        }

        let Some(sample) = P::decode(&notification.value) else {
            debug!("Dropped malformed {} frame: {:02X?}", P::ROLE, notification.value);
            return;
        };

        let slot = self.shared.slot.lock().await;
        if slot.is_current(generation) {
            trace!("{} sample: {:?}", P::ROLE, sample);
            self.shared.telemetry.send_replace(Some(sample));
        }
    }

    /// The current link failed; release it and enter `Disconnected`
    async fn on_link_down(&self, generation: u64) {
        let active = {
            let mut slot = self.shared.slot.lock().await;
            if !slot.is_current(generation) {
                return;
            }
            self.shared.generation.send_modify(|g| *g += 1);
            self.enter_disconnected();
            slot.active.take()
        };

        if let Some(active) = active {
            info!("{} disconnected from {}", P::ROLE, active.link.address());
            if let Err(e) = active.link.disconnect().await {
                debug!("Releasing failed {} link: {}", P::ROLE, e);
            }
        }
    }

    /// The peer (or the platform) reported that `address` went away
    ///
    /// Only a link that is up can go down this way. While connecting, the
    /// event is the echo of tearing down an earlier link to the same address;
    /// a real failure of the new attempt arrives through its own connect.
    pub(crate) async fn on_peer_disconnected(&self, address: &DeviceAddress) {
        let mut slot = self.shared.slot.lock().await;
        let Some(active) = slot
            .active
            .as_ref()
            .filter(|active| active.link.address() == address)
        else {
            return;
        };
        if !active.up {
            debug!("Ignoring disconnect of {} while {} is connecting", address, P::ROLE);
            return;
        }

        info!("{} peer {} disconnected", P::ROLE, address);
        self.shared.generation.send_modify(|g| *g += 1);
        slot.active = None;
        self.enter_disconnected();
    }

    async fn send_command(&self, command: ControlPointCommand) -> Result<()> {
        let slot = self.shared.slot.lock().await;
        let active = slot
            .active
            .as_ref()
            .filter(|_| self.state() == ConnectionState::Connected)
            .ok_or(BleSessionError::NotConnected { role: P::ROLE })?;
        let commands = active
            .commands
            .as_ref()
            .ok_or(BleSessionError::ControlPointUnavailable)?;

        let frame = command.encode();
        info!("Sending {:?} to {}", command, P::ROLE);
        debug!("Control point frame: {:02X?}", &frame[..]);

        commands
            .send(frame)
            .map_err(|_| BleSessionError::Transport("control point writer stopped".to_string()))
    }

    fn set_state(&self, next: ConnectionState) {
        self.shared.state.send_if_modified(|state| {
            let changed = *state != next;
            *state = next;
            changed
        });
    }

    fn enter_disconnected(&self) {
        self.set_state(ConnectionState::Disconnected);
        self.shared
            .telemetry
            .send_if_modified(|telemetry| telemetry.take().is_some());
    }
}

/// Trainer control; writes are queued in order and not acknowledged
///
/// The trainer only honours setpoints after [`Self::request_control`].
impl GattSession<IndoorBikeProfile> {
    /// Queue a Request Control command
    ///
    /// # Errors
    ///
    /// Returns [`BleSessionError::NotConnected`] or
    /// [`BleSessionError::ControlPointUnavailable`].
    pub async fn request_control(&self) -> Result<()> {
        self.send_command(ControlPointCommand::RequestControl).await
    }

    /// Queue a Set Target Resistance Level command
    ///
    /// # Errors
    ///
    /// Same as [`Self::request_control`].
    pub async fn set_target_resistance(&self, level: i32) -> Result<()> {
        self.send_command(ControlPointCommand::SetTargetResistance(level))
            .await
    }

    /// Queue a Set Target Power command
    ///
    /// # Errors
    ///
    /// Same as [`Self::request_control`].
    pub async fn set_target_power(&self, watts: i32) -> Result<()> {
        self.send_command(ControlPointCommand::SetTargetPower(watts))
            .await
    }

    /// Queue a Reset command
    ///
    /// # Errors
    ///
    /// Same as [`Self::request_control`].
    pub async fn reset(&self) -> Result<()> {
        self.send_command(ControlPointCommand::Reset).await
    }

    /// Queue a Start or Resume command
    ///
    /// # Errors
    ///
    /// Same as [`Self::request_control`].
    pub async fn start(&self) -> Result<()> {
        self.send_command(ControlPointCommand::Start).await
    }

    /// Queue a Stop or Pause command
    ///
    /// # Errors
    ///
    /// Same as [`Self::request_control`].
    pub async fn stop(&self) -> Result<()> {
        self.send_command(ControlPointCommand::Stop).await
    }
}

/// One writer per link keeps control point frames in submission order
fn spawn_writer(
    link: Arc<dyn GattLink>,
    characteristic: Uuid,
    kind: WriteKind,
) -> mpsc::UnboundedSender<Bytes> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = link.write(characteristic, &frame, kind).await {
                warn!("Control point write {:02X?} failed: {}", &frame[..], e);
            }
        }
    });

    tx
}
