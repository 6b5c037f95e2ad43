//! # Device Registry Module
//!
//! Protocol-agnostic device abstraction: every field unit, whatever its
//! microcontroller family or transport, is tracked as one canonical
//! [`device_types::Device`] record. Inbound payloads are normalized through
//! the per-family translation tables before they touch the record, and
//! outbound commands are routed to the transport the device registered with.
//!
//! All mutation flows through the single-writer actor in
//! [`device_manager`], which serializes updates arriving concurrently from
//! MQTT callbacks, the BLE tracker and the REST layer.

pub mod device_manager;
pub mod device_types;
pub mod normalizer;
