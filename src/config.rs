//! Runtime configuration.
//!
//! An optional TOML file under the user config directory provides defaults;
//! the `MQTT_*` environment variables override it, so containerized
//! deployments need no file at all.

use serde::Deserialize;
use tracing::{info, warn};

use crate::mqtt::config::MqttConfig;

const CONFIG_FILE: &str = "airdry/config.toml";
const DEFAULT_LOCATIONS_FILE: &str = "locations.json";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub mqtt: MqttConfig,
    /// Where the BLE location registry persists its named locations.
    #[serde(default = "default_locations_file")]
    pub locations_file: String,
}

fn default_locations_file() -> String {
    DEFAULT_LOCATIONS_FILE.to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig::default(),
            locations_file: default_locations_file(),
        }
    }
}

impl AppConfig {
    /// File config (if any) with environment overrides applied.
    pub fn load() -> Self {
        let mut config = Self::from_file().unwrap_or_default();
        config.apply_env();
        config
    }

    fn from_file() -> Option<Self> {
        let path = dirs::config_dir()?.join(CONFIG_FILE);
        let text = std::fs::read_to_string(&path).ok()?;
        match toml::from_str(&text) {
            Ok(config) => {
                info!("Loaded configuration from {}", path.display());
                Some(config)
            }
            Err(e) => {
                warn!("Ignoring malformed {}: {}", path.display(), e);
                None
            }
        }
    }

    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("MQTT_BROKER") {
            self.mqtt.host = host;
        }
        if let Some(port) = std::env::var("MQTT_PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
        {
            self.mqtt.port = port;
        }
        if let Ok(user) = std::env::var("MQTT_USER") {
            self.mqtt.username = Some(user);
        }
        if let Ok(password) = std::env::var("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Ok(prefix) = std::env::var("MQTT_TOPIC_PREFIX") {
            self.mqtt.topic_prefix = prefix;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_namespace() {
        let config = AppConfig::default();
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.topic_prefix, "swissairdry");
        assert_eq!(config.locations_file, "locations.json");
        assert!(config.mqtt.username.is_none());
    }

    #[test]
    fn toml_file_shape_parses() {
        let config: AppConfig = toml::from_str(
            r#"
            locations_file = "/var/lib/airdry/locations.json"

            [mqtt]
            host = "broker.local"
            port = 8883
            username = "svc"
            password = "secret"
            topic_prefix = "airdry"
            "#,
        )
        .unwrap();
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.topic_prefix, "airdry");
        assert_eq!(config.mqtt.keep_alive_secs, 60);
    }

    #[test]
    fn env_overrides_apply() {
        std::env::set_var("MQTT_BROKER", "override.local");
        std::env::set_var("MQTT_PORT", "2883");
        std::env::set_var("MQTT_TOPIC_PREFIX", "testprefix");

        let mut config = AppConfig::default();
        config.apply_env();
        assert_eq!(config.mqtt.host, "override.local");
        assert_eq!(config.mqtt.port, 2883);
        assert_eq!(config.mqtt.topic_prefix, "testprefix");

        std::env::remove_var("MQTT_BROKER");
        std::env::remove_var("MQTT_PORT");
        std::env::remove_var("MQTT_TOPIC_PREFIX");
    }
}
