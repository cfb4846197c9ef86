use bike_trainer_ble::{PeripheralRole, Result, SessionConfig, SessionManager};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🚴 Live Telemetry Example");
    info!("Scanning for heart rate straps and trainers...");

    let manager = SessionManager::new(SessionConfig::default()).await?;
    manager.start_scan().await;
    sleep(Duration::from_secs(8)).await;
    manager.stop_scan().await;

    let devices = manager.devices();
    info!("📡 Found {} device(s)", devices.len());
    for device in &devices {
        info!(
            "  {} {:?} ({} dBm)",
            device.address,
            device.display_name.as_deref().unwrap_or("<unnamed>"),
            device.signal_strength
        );
    }

    // Connect the strongest device of each kind
    let strongest = |hr: bool| {
        devices
            .iter()
            .filter(|d| if hr { d.is_heart_rate_monitor() } else { d.is_fitness_machine() })
            .max_by_key(|d| d.signal_strength)
            .map(|d| d.address.clone())
    };

    match strongest(true) {
        Some(address) => manager.connect(PeripheralRole::HeartRate, address).await,
        None => warn!("No heart rate strap found"),
    }
    match strongest(false) {
        Some(address) => manager.connect(PeripheralRole::Trainer, address).await,
        None => warn!("No trainer found"),
    }

    let mut heart_rate = manager.subscribe_heart_rate();
    let mut trainer = manager.subscribe_trainer_telemetry();

    info!("📊 Streaming telemetry for 60 seconds, Ctrl+C to stop");
    let deadline = sleep(Duration::from_secs(60));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            Ok(()) = heart_rate.changed() => {
                if let Some(sample) = *heart_rate.borrow_and_update() {
                    info!("❤️  {} bpm", sample.beats_per_minute);
                }
            }
            Ok(()) = trainer.changed() => {
                let telemetry = trainer.borrow_and_update().clone();
                if let Some(t) = telemetry {
                    info!(
                        "⚡ power {:?} W, cadence {:?} rpm, speed {:?} km/h",
                        t.instantaneous_power, t.instantaneous_cadence, t.instantaneous_speed
                    );
                }
            }
        }
    }

    manager.disconnect_all().await;
    info!("👋 Disconnected");
    Ok(())
}
