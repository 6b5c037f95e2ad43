//! Device connectivity core for the SwissAirDry backend.
//!
//! Connects heterogeneous dehumidifier controllers (ESP8266/ESP32/STM32) to
//! the central service: a resilient MQTT connection manager with wildcard
//! topic routing, a protocol-agnostic device registry that normalizes every
//! family's telemetry into one schema, and a BLE proximity tracker that
//! infers coarse device locations from signal strength.
//!
//! The REST layer consumes this crate through the cloneable handles
//! ([`mqtt::mqtt_handler::MqttHandle`],
//! [`device::device_manager::DeviceManagerHandle`],
//! [`ble::proximity_tracker::BleTrackerHandle`]); each handle fronts a
//! single-writer worker task, so no caller ever touches connection or
//! registry state directly.

pub mod ble;
pub mod config;
pub mod device;
pub mod mqtt;
