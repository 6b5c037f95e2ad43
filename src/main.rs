use airdry_core::ble::ble_scanner::BtleplugScanner;
use airdry_core::ble::location_registry::LocationRegistry;
use airdry_core::ble::proximity_tracker::{BleTrackerHandle, TrackerConfig};
use airdry_core::config::AppConfig;
use airdry_core::device::device_manager::DeviceManagerHandle;
use airdry_core::mqtt::mqtt_handler::MqttHandle;
use color_eyre::Result;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = AppConfig::load();
    info!(
        "Starting device connectivity core (broker {}:{}, prefix {})",
        config.mqtt.host, config.mqtt.port, config.mqtt.topic_prefix
    );

    let mqtt = MqttHandle::spawn(config.mqtt.clone());
    if let Err(e) = mqtt.connect().await {
        // The service stays up; devices reconnect once the broker is back
        // and an operator can trigger another connect through the API.
        warn!("MQTT broker not reachable: {}", e);
    }

    let registry = DeviceManagerHandle::spawn(mqtt.clone(), &config.mqtt.topic_prefix).await;

    let tracker = match BtleplugScanner::new().await {
        Ok(scanner) => {
            let locations = LocationRegistry::load(&config.locations_file).await;
            let tracker_config = TrackerConfig {
                topic_prefix: config.mqtt.topic_prefix.clone(),
                ..TrackerConfig::default()
            };
            Some(BleTrackerHandle::spawn(
                scanner,
                tracker_config,
                mqtt.clone(),
                registry.clone(),
                locations,
            ))
        }
        Err(e) => {
            warn!("BLE scanning unavailable: {}", e);
            None
        }
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    if let Some(tracker) = &tracker {
        tracker.stop_background_scan();
    }
    mqtt.disconnect().await;

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
