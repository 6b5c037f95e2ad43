//! Protocol-specific payload normalization.
//!
//! Each device family reports sensor readings under its own field names; the
//! normalizers translate those to the canonical schema consumed by the rest
//! of the service. Fields without a translation pass through unchanged so
//! firmware can add sensors before the backend learns about them.

use serde_json::{Map, Value};

use super::device_types::DeviceType;

/// ESP8266/ESP32 firmware reports standard names already; only the heap
/// counter needs translating.
const ESP_RENAMES: &[(&str, &str)] = &[("heap", "free_memory")];

/// STM32 firmware uses abbreviated field names throughout.
const STM32_RENAMES: &[(&str, &str)] = &[
    ("temp", "temperature"),
    ("hum", "humidity"),
    ("pres", "pressure"),
    ("volt", "voltage"),
    ("status", "device_status"),
];

/// Translates a raw payload into canonical field names for the given device
/// type. `Other` performs no translation.
pub fn normalize(device_type: DeviceType, raw: &Map<String, Value>) -> Map<String, Value> {
    match device_type {
        DeviceType::Esp8266 | DeviceType::Esp32 => apply_renames(raw, ESP_RENAMES),
        DeviceType::Stm32 => apply_renames(raw, STM32_RENAMES),
        DeviceType::Other => raw.clone(),
    }
}

fn apply_renames(raw: &Map<String, Value>, renames: &[(&str, &str)]) -> Map<String, Value> {
    let mut out = Map::new();

    // Canonical and unrecognized fields pass through untouched.
    for (key, value) in raw {
        if renames.iter().all(|(from, _)| from != key) {
            out.insert(key.clone(), value.clone());
        }
    }

    // Abbreviated names translate unless the payload carried the canonical
    // field as well.
    for (from, to) in renames {
        if let Some(value) = raw.get(*from) {
            if !out.contains_key(*to) {
                out.insert((*to).to_string(), value.clone());
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn stm32_abbreviations_translate() {
        let raw = map(json!({"temp": 21.5, "hum": 44.0, "status": "running"}));
        let normalized = normalize(DeviceType::Stm32, &raw);
        assert_eq!(
            Value::Object(normalized),
            json!({"temperature": 21.5, "humidity": 44.0, "device_status": "running"})
        );
    }

    #[test]
    fn esp_heap_becomes_free_memory() {
        let raw = map(json!({"temperature": 22.5, "rssi": -71, "heap": 45678}));
        let normalized = normalize(DeviceType::Esp32, &raw);
        assert_eq!(normalized.get("free_memory"), Some(&json!(45678)));
        assert_eq!(normalized.get("temperature"), Some(&json!(22.5)));
        assert_eq!(normalized.get("rssi"), Some(&json!(-71)));
        assert!(normalized.get("heap").is_none());
    }

    #[test]
    fn unrecognized_fields_pass_through() {
        let raw = map(json!({"temp": 20.0, "fan_rpm": 1450}));
        let normalized = normalize(DeviceType::Stm32, &raw);
        assert_eq!(normalized.get("fan_rpm"), Some(&json!(1450)));
        assert_eq!(normalized.get("temperature"), Some(&json!(20.0)));
    }

    #[test]
    fn canonical_field_wins_over_abbreviation() {
        let raw = map(json!({"temp": 20.0, "temperature": 21.0}));
        let normalized = normalize(DeviceType::Stm32, &raw);
        assert_eq!(normalized.get("temperature"), Some(&json!(21.0)));
    }

    #[test]
    fn other_type_is_identity() {
        let raw = map(json!({"anything": [1, 2, 3], "heap": 7}));
        assert_eq!(normalize(DeviceType::Other, &raw), raw);
    }
}
