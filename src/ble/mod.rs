//! # BLE Proximity Module
//!
//! Coarse indoor location for field devices, inferred from advertisement
//! signal strength. A background loop scans, debounces the noisy sightings,
//! buckets RSSI into named locations and reports only the changes upward
//! (MQTT publish + device registry update).
//!
//! ```text
//! ble/
//! ├── ble_scanner.rs        - Scan trait and btleplug adapter binding
//! ├── location_registry.rs  - Named locations, JSON-file persistence
//! └── proximity_tracker.rs  - Scan loop, debounce, buckets, eviction
//! ```

pub mod ble_scanner;
pub mod location_registry;
pub mod proximity_tracker;
