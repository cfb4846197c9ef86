use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    ble::BtleplugAdapter,
    error::{BleSessionError, Result},
    profile::{HeartRateProfile, IndoorBikeProfile},
    scan::ScanCoordinator,
    session::GattSession,
    transport::{AdapterEvent, BleAdapter},
    types::{
        ConnectionState, DeviceAddress, DiscoveredDevice, HeartRateSample, IndoorBikeTelemetry,
        PeripheralRole, SessionConfig,
    },
};

/// Entry point for applications: one scanner, one heart-rate session and
/// one trainer session sharing a Bluetooth adapter
///
/// The command methods never fail. Precondition and transport errors are
/// logged and the call becomes a no-op, so a UI can wire buttons straight to
/// them. The underlying sessions are available through
/// [`Self::heart_rate_session`] and [`Self::trainer_session`] for callers that
/// want the [`Result`].
///
/// # Examples
///
/// ```no_run
/// use bike_trainer_ble::{SessionConfig, SessionManager};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let manager = SessionManager::new(SessionConfig::default()).await?;
///     manager.start_scan().await;
///
///     let mut devices = manager.subscribe_devices();
///     devices.wait_for(|d| d.iter().any(|d| d.is_fitness_machine())).await?;
///
///     let trainer = manager
///         .devices()
///         .into_iter()
///         .find(|d| d.is_fitness_machine())
///         .map(|d| d.address);
///     if let Some(address) = trainer {
///         manager.connect_trainer(address).await;
///     }
///     Ok(())
/// }
/// ```
pub struct SessionManager {
    config: SessionConfig,
    scanner: ScanCoordinator,
    heart_rate: GattSession<HeartRateProfile>,
    trainer: GattSession<IndoorBikeProfile>,
    event_pump: Option<JoinHandle<()>>,
}

impl SessionManager {
    /// Open the host adapter and start listening for its events
    ///
    /// # Errors
    ///
    /// Returns [`BleSessionError::Ble`] if the platform Bluetooth manager
    /// cannot be initialized. A missing adapter is reported later, by
    /// [`Self::start_scan`].
    pub async fn new(config: SessionConfig) -> Result<Self> {
        let adapter = BtleplugAdapter::new(&config).await?;
        Ok(Self::with_adapter(Arc::new(adapter), config).await)
    }

    /// Build a manager on any [`BleAdapter`]
    pub async fn with_adapter(adapter: Arc<dyn BleAdapter>, config: SessionConfig) -> Self {
        let scanner = ScanCoordinator::new(Arc::clone(&adapter), config.scan_services.clone());
        let heart_rate = GattSession::new(Arc::clone(&adapter), &config);
        let trainer = GattSession::new(Arc::clone(&adapter), &config);

        let event_pump = match adapter.events().await {
            Ok(events) => Some(tokio::spawn(pump_events(
                events,
                scanner.clone(),
                heart_rate.clone(),
                trainer.clone(),
            ))),
            Err(e) => {
                warn!("Adapter events unavailable: {}", e);
                None
            }
        };

        Self {
            config,
            scanner,
            heart_rate,
            trainer,
            event_pump,
        }
    }

    /// Configuration the manager was built with
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start scanning; the device list is cleared first
    pub async fn start_scan(&self) {
        report("start scan", self.scanner.start_scan().await);
    }

    /// Stop scanning
    pub async fn stop_scan(&self) {
        report("stop scan", self.scanner.stop_scan().await);
    }

    /// Whether a scan is running
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    /// Observe the scanning flag
    #[must_use]
    pub fn subscribe_scanning(&self) -> watch::Receiver<bool> {
        self.scanner.subscribe_scanning()
    }

    /// Devices found by the current or last scan
    #[must_use]
    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.scanner.devices()
    }

    /// Observe the device list
    #[must_use]
    pub fn subscribe_devices(&self) -> watch::Receiver<Vec<DiscoveredDevice>> {
        self.scanner.subscribe_devices()
    }

    /// Connect `role` to `address`, replacing that role's current link
    pub async fn connect(&self, role: PeripheralRole, address: DeviceAddress) {
        if self.config.stop_scan_on_connect {
            self.stop_scan().await;
        }

        let result = match role {
            PeripheralRole::HeartRate => self.heart_rate.connect(address).await,
            PeripheralRole::Trainer => self.trainer.connect(address).await,
        };
        report("connect", result);
    }

    /// Connect the heart-rate strap at `address`
    pub async fn connect_heart_rate(&self, address: DeviceAddress) {
        self.connect(PeripheralRole::HeartRate, address).await;
    }

    /// Connect the trainer at `address`
    pub async fn connect_trainer(&self, address: DeviceAddress) {
        self.connect(PeripheralRole::Trainer, address).await;
    }

    /// Connect the heart-rate session to its last used strap again
    pub async fn reconnect_heart_rate(&self) {
        report("reconnect", self.heart_rate.reconnect().await);
    }

    /// Whether the heart-rate session has a strap to reconnect to
    pub async fn has_last_heart_rate_device(&self) -> bool {
        self.heart_rate.has_last_device().await
    }

    /// Disconnect one role
    pub async fn disconnect(&self, role: PeripheralRole) {
        match role {
            PeripheralRole::HeartRate => self.heart_rate.disconnect().await,
            PeripheralRole::Trainer => self.trainer.disconnect().await,
        }
    }

    /// Disconnect both roles
    pub async fn disconnect_all(&self) {
        info!("Disconnecting all peripherals");
        self.heart_rate.disconnect().await;
        self.trainer.disconnect().await;
    }

    /// Ask the trainer for control; required before setpoints are honoured
    pub async fn request_control(&self) {
        report("request control", self.trainer.request_control().await);
    }

    /// Set the trainer's target resistance level
    pub async fn set_target_resistance(&self, level: i32) {
        report(
            "set target resistance",
            self.trainer.set_target_resistance(level).await,
        );
    }

    /// Set the trainer's target power in watts
    pub async fn set_target_power(&self, watts: i32) {
        report("set target power", self.trainer.set_target_power(watts).await);
    }

    /// Reset the trainer
    pub async fn reset_trainer(&self) {
        report("reset", self.trainer.reset().await);
    }

    /// Start or resume the trainer's session
    pub async fn start_trainer(&self) {
        report("start", self.trainer.start().await);
    }

    /// Stop or pause the trainer's session
    pub async fn stop_trainer(&self) {
        report("stop", self.trainer.stop().await);
    }

    /// Connection state of one role
    #[must_use]
    pub fn connection_state(&self, role: PeripheralRole) -> ConnectionState {
        match role {
            PeripheralRole::HeartRate => self.heart_rate.state(),
            PeripheralRole::Trainer => self.trainer.state(),
        }
    }

    /// Observe the connection state of one role
    #[must_use]
    pub fn subscribe_connection_state(
        &self,
        role: PeripheralRole,
    ) -> watch::Receiver<ConnectionState> {
        match role {
            PeripheralRole::HeartRate => self.heart_rate.subscribe_state(),
            PeripheralRole::Trainer => self.trainer.subscribe_state(),
        }
    }

    /// Latest heart-rate sample
    #[must_use]
    pub fn heart_rate(&self) -> Option<HeartRateSample> {
        self.heart_rate.latest()
    }

    /// Observe heart-rate samples
    #[must_use]
    pub fn subscribe_heart_rate(&self) -> watch::Receiver<Option<HeartRateSample>> {
        self.heart_rate.subscribe_telemetry()
    }

    /// Latest trainer telemetry
    #[must_use]
    pub fn trainer_telemetry(&self) -> Option<IndoorBikeTelemetry> {
        self.trainer.latest()
    }

    /// Observe trainer telemetry
    #[must_use]
    pub fn subscribe_trainer_telemetry(&self) -> watch::Receiver<Option<IndoorBikeTelemetry>> {
        self.trainer.subscribe_telemetry()
    }

    /// The heart-rate session
    #[must_use]
    pub const fn heart_rate_session(&self) -> &GattSession<HeartRateProfile> {
        &self.heart_rate
    }

    /// The trainer session
    #[must_use]
    pub const fn trainer_session(&self) -> &GattSession<IndoorBikeProfile> {
        &self.trainer
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(pump) = self.event_pump.take() {
            pump.abort();
        }
    }
}

/// Route adapter events to the scanner and sessions until the stream ends
async fn pump_events(
    mut events: BoxStream<'static, AdapterEvent>,
    scanner: ScanCoordinator,
    heart_rate: GattSession<HeartRateProfile>,
    trainer: GattSession<IndoorBikeProfile>,
) {
    while let Some(event) = events.next().await {
        match event {
            AdapterEvent::DeviceDiscovered(device) => scanner.on_discovered(device),
            AdapterEvent::DeviceDisconnected(address) => {
                heart_rate.on_peer_disconnected(&address).await;
                trainer.on_peer_disconnected(&address).await;
            }
            AdapterEvent::ScanFailed(reason) => scanner.on_scan_failed(&reason),
        }
    }

    debug!("Adapter event stream ended");
    if scanner.is_scanning() {
        scanner.on_scan_failed("adapter event stream ended");
    }
}

fn report(operation: &str, result: Result<()>) {
    match result {
        Ok(()) => {}
        Err(e @ BleSessionError::NoPreviousDevice { .. }) => {
            debug!("Cannot {}: {}", operation, e);
        }
        Err(e) if e.is_precondition() => warn!("Cannot {}: {}", operation, e),
        Err(e) => error!("Failed to {}: {}", operation, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        testing::{heart_rate_services, trainer_services, FakeAdapter, FakeLink, WAIT},
        HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID, INDOOR_BIKE_DATA_UUID,
    };

    async fn manager(adapter: &Arc<FakeAdapter>) -> SessionManager {
        SessionManager::with_adapter(
            Arc::clone(adapter) as Arc<dyn BleAdapter>,
            SessionConfig::default(),
        )
        .await
    }

    async fn wait_state(manager: &SessionManager, role: PeripheralRole, target: ConnectionState) {
        let mut rx = manager.subscribe_connection_state(role);
        tokio::time::timeout(WAIT, rx.wait_for(|state| *state == target))
            .await
            .expect("timed out waiting for state")
            .map(|_| ())
            .expect("state channel closed");
    }

    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    fn strap(address: &str) -> DiscoveredDevice {
        let mut device = DiscoveredDevice::new(address, -60);
        device.display_name = Some("Polar H10".to_string());
        device.advertised_services.insert(HEART_RATE_SERVICE_UUID);
        device
    }

    #[tokio::test]
    async fn test_discoveries_reach_the_device_list() {
        let adapter = FakeAdapter::new();
        let manager = manager(&adapter).await;

        manager.start_scan().await;
        assert!(manager.is_scanning());
        adapter.emit(AdapterEvent::DeviceDiscovered(strap("HR-1")));

        let mut devices = manager.subscribe_devices();
        tokio::time::timeout(WAIT, devices.wait_for(|d| d.len() == 1))
            .await
            .unwrap()
            .unwrap();

        assert!(manager.devices()[0].is_heart_rate_monitor());
    }

    #[tokio::test]
    async fn test_connect_stops_scanning() {
        let adapter = FakeAdapter::new();
        let link = FakeLink::new("HR-1", heart_rate_services());
        adapter.add_link(&link);
        let manager = manager(&adapter).await;

        manager.start_scan().await;
        manager.connect_heart_rate("HR-1".into()).await;

        assert!(!manager.is_scanning());
        assert_eq!(adapter.stops(), 1);
        wait_state(&manager, PeripheralRole::HeartRate, ConnectionState::Connected).await;
        assert_eq!(
            manager.connection_state(PeripheralRole::Trainer),
            ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn test_adapter_disconnect_event_resets_only_that_role() {
        let adapter = FakeAdapter::new();
        let strap = FakeLink::new("HR-1", heart_rate_services());
        let kickr = FakeLink::new("KICKR", trainer_services());
        adapter.add_link(&strap);
        adapter.add_link(&kickr);
        let manager = manager(&adapter).await;

        manager.connect_heart_rate("HR-1".into()).await;
        manager.connect_trainer("KICKR".into()).await;
        strap.wait_for_subscription(HEART_RATE_MEASUREMENT_UUID).await;
        kickr.wait_for_subscription(INDOOR_BIKE_DATA_UUID).await;

        adapter.emit(AdapterEvent::DeviceDisconnected("KICKR".into()));
        wait_state(&manager, PeripheralRole::Trainer, ConnectionState::Disconnected).await;

        assert_eq!(
            manager.connection_state(PeripheralRole::HeartRate),
            ConnectionState::Connected
        );
    }

    #[tokio::test]
    async fn test_disconnect_all_clears_both_roles() {
        let adapter = FakeAdapter::new();
        let strap = FakeLink::new("HR-1", heart_rate_services());
        let kickr = FakeLink::new("KICKR", trainer_services());
        adapter.add_link(&strap);
        adapter.add_link(&kickr);
        let manager = manager(&adapter).await;

        manager.connect_heart_rate("HR-1".into()).await;
        manager.connect_trainer("KICKR".into()).await;
        strap.wait_for_subscription(HEART_RATE_MEASUREMENT_UUID).await;
        strap.push(HEART_RATE_MEASUREMENT_UUID, &[0x00, 72]);
        let mut hr = manager.subscribe_heart_rate();
        tokio::time::timeout(WAIT, hr.wait_for(Option::is_some))
            .await
            .unwrap()
            .unwrap();

        manager.disconnect_all().await;

        for role in [PeripheralRole::HeartRate, PeripheralRole::Trainer] {
            assert_eq!(manager.connection_state(role), ConnectionState::Disconnected);
        }
        assert!(manager.heart_rate().is_none());
        assert!(manager.trainer_telemetry().is_none());
    }

    #[tokio::test]
    async fn test_commands_without_trainer_are_no_ops() {
        let adapter = FakeAdapter::new();
        let manager = manager(&adapter).await;

        manager.request_control().await;
        manager.set_target_power(200).await;
        manager.set_target_resistance(10).await;
        manager.reset_trainer().await;
        manager.start_trainer().await;
        manager.stop_trainer().await;
        manager.reconnect_heart_rate().await;

        assert!(!manager.has_last_heart_rate_device().await);
        assert_eq!(
            manager.connection_state(PeripheralRole::Trainer),
            ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn test_start_and_stop_reach_the_control_point() {
        let adapter = FakeAdapter::new();
        let kickr = FakeLink::new("KICKR", trainer_services());
        adapter.add_link(&kickr);
        let manager = manager(&adapter).await;

        manager.connect_trainer("KICKR".into()).await;
        kickr.wait_for_subscription(INDOOR_BIKE_DATA_UUID).await;
        manager.start_trainer().await;
        manager.stop_trainer().await;

        assert_eq!(kickr.next_write().await.1, vec![0x07]);
        assert_eq!(kickr.next_write().await.1, vec![0x08]);
    }

    #[tokio::test]
    async fn test_reconnect_heart_rate_uses_last_strap() {
        let adapter = FakeAdapter::new();
        let strap = FakeLink::new("HR-1", heart_rate_services());
        adapter.add_link(&strap);
        let manager = manager(&adapter).await;

        manager.connect_heart_rate("HR-1".into()).await;
        wait_state(&manager, PeripheralRole::HeartRate, ConnectionState::Connected).await;
        manager.disconnect(PeripheralRole::HeartRate).await;
        assert!(manager.has_last_heart_rate_device().await);

        manager.reconnect_heart_rate().await;
        wait_state(&manager, PeripheralRole::HeartRate, ConnectionState::Connected).await;
        assert_eq!(strap.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_reconnect_survives_disconnect_echo() {
        let adapter = FakeAdapter::new();
        let strap = FakeLink::new("HR-1", heart_rate_services());
        adapter.add_link(&strap);
        let manager = manager(&adapter).await;

        manager.connect_heart_rate("HR-1".into()).await;
        wait_state(&manager, PeripheralRole::HeartRate, ConnectionState::Connected).await;

        let release = strap.hold_connect();
        manager.reconnect_heart_rate().await;
        // let the pump deliver the DeviceDisconnected raised by the teardown
        settle().await;
        assert_eq!(
            manager.connection_state(PeripheralRole::HeartRate),
            ConnectionState::Connecting
        );

        release.send(true).unwrap();
        wait_state(&manager, PeripheralRole::HeartRate, ConnectionState::Connected).await;
        settle().await;

        assert_eq!(
            manager.connection_state(PeripheralRole::HeartRate),
            ConnectionState::Connected
        );
        assert_eq!(strap.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_disconnecting_one_role_keeps_the_other_telemetry() {
        for role in [PeripheralRole::HeartRate, PeripheralRole::Trainer] {
            let adapter = FakeAdapter::new();
            let strap = FakeLink::new("HR-1", heart_rate_services());
            let kickr = FakeLink::new("KICKR", trainer_services());
            adapter.add_link(&strap);
            adapter.add_link(&kickr);
            let manager = manager(&adapter).await;

            manager.connect_heart_rate("HR-1".into()).await;
            manager.connect_trainer("KICKR".into()).await;
            strap.wait_for_subscription(HEART_RATE_MEASUREMENT_UUID).await;
            kickr.wait_for_subscription(INDOOR_BIKE_DATA_UUID).await;

            strap.push(HEART_RATE_MEASUREMENT_UUID, &[0x00, 140]);
            kickr.push(INDOOR_BIKE_DATA_UUID, &[0x40, 0x00, 0xFA, 0x00]);
            let mut hr = manager.subscribe_heart_rate();
            let mut bike = manager.subscribe_trainer_telemetry();
            tokio::time::timeout(WAIT, hr.wait_for(Option::is_some))
                .await
                .unwrap()
                .unwrap();
            tokio::time::timeout(WAIT, bike.wait_for(Option::is_some))
                .await
                .unwrap()
                .unwrap();

            manager.disconnect(role).await;
            settle().await;

            match role {
                PeripheralRole::HeartRate => {
                    assert!(manager.heart_rate().is_none());
                    assert_eq!(
                        manager.trainer_telemetry().and_then(|t| t.instantaneous_power),
                        Some(250)
                    );
                    assert_eq!(
                        manager.connection_state(PeripheralRole::Trainer),
                        ConnectionState::Connected
                    );
                }
                PeripheralRole::Trainer => {
                    assert!(manager.trainer_telemetry().is_none());
                    assert_eq!(manager.heart_rate().map(|s| s.beats_per_minute), Some(140));
                    assert_eq!(
                        manager.connection_state(PeripheralRole::HeartRate),
                        ConnectionState::Connected
                    );
                }
            }
        }
    }

    #[tokio::test]
    async fn test_disconnect_all_while_connecting_converges() {
        let adapter = FakeAdapter::new();
        let strap = FakeLink::new("HR-1", heart_rate_services());
        let kickr = FakeLink::new("KICKR", trainer_services());
        adapter.add_link(&strap);
        adapter.add_link(&kickr);
        let manager = manager(&adapter).await;
        let release_strap = strap.hold_connect();
        let release_kickr = kickr.hold_connect();

        manager.connect_heart_rate("HR-1".into()).await;
        manager.connect_trainer("KICKR".into()).await;
        for role in [PeripheralRole::HeartRate, PeripheralRole::Trainer] {
            assert_eq!(manager.connection_state(role), ConnectionState::Connecting);
        }

        manager.disconnect_all().await;
        release_strap.send(true).unwrap();
        release_kickr.send(true).unwrap();
        strap.wait_for_disconnects(2).await;
        kickr.wait_for_disconnects(2).await;
        settle().await;

        for role in [PeripheralRole::HeartRate, PeripheralRole::Trainer] {
            assert_eq!(manager.connection_state(role), ConnectionState::Disconnected);
        }
        assert!(manager.heart_rate().is_none());
        assert!(manager.trainer_telemetry().is_none());
        assert!(strap.subscribed().is_empty());
        assert!(kickr.subscribed().is_empty());
    }

    #[tokio::test]
    async fn test_scan_failure_event_clears_scanning() {
        let adapter = FakeAdapter::new();
        let manager = manager(&adapter).await;
        manager.start_scan().await;

        adapter.emit(AdapterEvent::ScanFailed("too frequent".to_string()));

        let mut scanning = manager.subscribe_scanning();
        tokio::time::timeout(WAIT, scanning.wait_for(|s| !*s))
            .await
            .unwrap()
            .unwrap();
    }
}
