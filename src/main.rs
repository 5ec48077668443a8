use even_g1_bridge::domain::models::{DeviceEvent, NotificationSpec, Side};
use even_g1_bridge::domain::settings::SettingsService;
use even_g1_bridge::infrastructure::bluetooth::{
    DiscoveredDevice, DualPeerCoordinator, LoopbackTransport, SessionContext,
};
use even_g1_bridge::infrastructure::logging;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// How long to watch the simulated glasses before shutting down.
const DEMO_DURATION: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;
    let _logging_guard = logging::init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting Even G1 bridge against simulated glasses");

    let transport = Arc::new(LoopbackTransport::simulated_glasses());
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let context = SessionContext::new(transport.clone(), event_tx, Handle::current());
    let coordinator = DualPeerCoordinator::new(context, settings_service.get());

    for device in [
        DiscoveredDevice::new("00:00:00:00:00:01", "Even G1_00_L_SIM01"),
        DiscoveredDevice::new("00:00:00:00:00:02", "Even G1_00_R_SIM02"),
    ] {
        if let Err(e) = coordinator.bind_peer(&device) {
            warn!("Could not bind {}: {}", device.name, e);
        }
    }

    for side in Side::BOTH {
        coordinator.connect_side(side)?;
    }

    let notification = NotificationSpec {
        id: 1,
        source_name: "Bridge".to_string(),
        title: Some("Hello".to_string()),
        body: Some("The bridge is up.".to_string()),
        when: chrono::Utc::now().timestamp_millis(),
        ..Default::default()
    };

    let deadline = tokio::time::sleep(DEMO_DURATION);
    tokio::pin!(deadline);
    let mut notified = false;

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                info!("Device event: {:?}", event);
                if !notified && matches!(event, DeviceEvent::Hardware(_)) {
                    notified = true;
                    let command = coordinator.send_notification(&notification)?;
                    let coordinator = coordinator.clone();
                    tokio::spawn(async move {
                        let shown = coordinator.session(Side::Left).wait_for_response(&command).await;
                        info!("Notification delivered: {}", shown);
                    });
                }
            }
            _ = &mut deadline => break,
        }
    }

    for side in Side::BOTH {
        coordinator.disconnect_side(side);
        info!(
            "Side {}: {} packets written",
            side,
            transport.written(side).len()
        );
    }
    info!("Simulated session finished");
    Ok(())
}
