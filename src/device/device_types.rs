//! Canonical device model shared by every transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Microcontroller families the backend understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Esp8266,
    Esp32,
    Stm32,
    Other,
}

/// How commands reach a device and telemetry leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommTransport {
    Mqtt,
    Http,
    Ble,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Maintenance,
    Error,
    Unknown,
}

impl DeviceStatus {
    /// Parses the status strings firmware publishes. Anything unrecognized
    /// maps to `Unknown` rather than failing.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => DeviceStatus::Online,
            "offline" => DeviceStatus::Offline,
            "maintenance" => DeviceStatus::Maintenance,
            "error" => DeviceStatus::Error,
            _ => DeviceStatus::Unknown,
        }
    }
}

/// One field device. `data` holds the last normalized readings, `metadata`
/// whatever the installer attached at registration; both keep unrecognized
/// fields so newer firmware can ship keys the backend does not know yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub device_type: DeviceType,
    pub transport: CommTransport,
    pub name: String,
    pub location: Option<String>,
    pub status: DeviceStatus,
    pub last_seen: DateTime<Utc>,
    pub metadata: Map<String, Value>,
    pub data: Map<String, Value>,
}

impl Device {
    /// Minimal record auto-provisioned on first contact from a device the
    /// registry has never seen.
    pub fn provisioned(
        id: &str,
        device_type: DeviceType,
        transport: CommTransport,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.to_string(),
            device_type,
            transport,
            name: format!("Device {}", id),
            location: None,
            status: DeviceStatus::Unknown,
            last_seen: now,
            metadata: Map::new(),
            data: Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parsing_is_lenient() {
        assert_eq!(DeviceStatus::parse("online"), DeviceStatus::Online);
        assert_eq!(DeviceStatus::parse("OFFLINE"), DeviceStatus::Offline);
        assert_eq!(DeviceStatus::parse(" error "), DeviceStatus::Error);
        assert_eq!(DeviceStatus::parse("rebooting"), DeviceStatus::Unknown);
    }

    #[test]
    fn enums_serialize_lowercase() {
        assert_eq!(
            serde_json::to_string(&DeviceType::Esp8266).unwrap(),
            "\"esp8266\""
        );
        assert_eq!(
            serde_json::to_string(&CommTransport::Mqtt).unwrap(),
            "\"mqtt\""
        );
    }
}
