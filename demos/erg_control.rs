use bike_trainer_ble::{ConnectionState, PeripheralRole, Result, SessionConfig, SessionManager};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🎛️  ERG Control Example");
    info!("⚠️  The trainer will change resistance, keep a safe cadence");

    let manager = SessionManager::new(SessionConfig::default()).await?;
    manager.start_scan().await;

    let mut devices = manager.subscribe_devices();
    let found = tokio::time::timeout(
        Duration::from_secs(15),
        devices.wait_for(|d| d.iter().any(|d| d.is_fitness_machine())),
    )
    .await
    .is_ok_and(|r| r.is_ok());
    if !found {
        error!("❌ No trainer advertising the Fitness Machine service");
        return Ok(());
    }

    let Some(trainer) = manager.devices().into_iter().find(|d| d.is_fitness_machine()) else {
        return Ok(());
    };
    info!("✅ Found trainer {}", trainer.address);
    manager.connect_trainer(trainer.address).await;

    let mut state = manager.subscribe_connection_state(PeripheralRole::Trainer);
    let connected = tokio::time::timeout(
        Duration::from_secs(20),
        state.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    .is_ok_and(|r| r.is_ok());
    if !connected {
        error!("❌ Trainer did not connect");
        return Ok(());
    }

    // Discovery runs after the link comes up
    sleep(Duration::from_secs(2)).await;

    info!("🔑 Requesting control");
    manager.request_control().await;
    manager.start_trainer().await;

    for watts in [100, 150, 200, 150] {
        info!("⚡ Target power {} W", watts);
        manager.set_target_power(watts).await;
        sleep(Duration::from_secs(10)).await;
        if let Some(power) = manager
            .trainer_telemetry()
            .and_then(|t| t.instantaneous_power)
        {
            info!("   measured {} W", power);
        }
    }

    info!("🔧 Switching to resistance level 5.0");
    manager.set_target_resistance(5).await;
    sleep(Duration::from_secs(10)).await;

    manager.stop_trainer().await;
    manager.reset_trainer().await;
    manager.disconnect_all().await;
    info!("👋 Done");
    Ok(())
}
