//! RSSI-based proximity tracking.
//!
//! A periodic scan loop discovers devices advertising the recognized name
//! prefix, debounces them (a single sighting is noise, two make a device),
//! buckets signal strength into named locations and evicts anything unseen
//! for five minutes. Only bucket *changes* leave the tracker — as an MQTT
//! publish and a registry location update — so a device parked at the edge
//! of a bucket does not flap.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rumqttc::QoS;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::device::device_manager::DeviceManagerHandle;
use crate::mqtt::mqtt_handler::MqttHandle;

use super::ble_scanner::AdvertisementSource;
use super::location_registry::{LocationInfo, LocationRegistry};

/// Advertised-name prefix marking our field devices.
pub const DEVICE_PREFIX: &str = "SAD_";

/// Signal floor: at or below this a device counts as not present.
pub const RSSI_THRESHOLD: i16 = -85;

/// Sightings required before an assignment is trusted.
pub const MIN_DISCOVERY_COUNT: u32 = 2;

/// Discovery entries unseen this long are dropped.
const EVICT_AFTER_SECS: i64 = 300;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub topic_prefix: String,
    pub device_prefix: String,
    pub scan_window: Duration,
    pub scan_interval: Duration,
    pub error_backoff: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "swissairdry".to_string(),
            device_prefix: DEVICE_PREFIX.to_string(),
            scan_window: Duration::from_secs(5),
            scan_interval: Duration::from_secs(60),
            error_backoff: Duration::from_secs(10),
        }
    }
}

/// Maps signal strength to a location bucket, or `None` below the floor.
pub fn bucket_for_rssi(rssi: i16) -> Option<&'static str> {
    if rssi > -60 {
        Some("near")
    } else if rssi > -75 {
        Some("mid")
    } else if rssi > RSSI_THRESHOLD {
        Some("far")
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub rssi: i16,
    pub last_seen: DateTime<Utc>,
    pub discovery_count: u32,
}

/// Snapshot row returned by `list_discovered`.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredDeviceInfo {
    pub device_id: String,
    pub rssi: i16,
    pub last_seen: DateTime<Utc>,
    pub discovery_count: u32,
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocationChange {
    pub device_id: String,
    pub location_id: String,
}

/// Discovery set and location assignments. Pure state transitions, driven by
/// the worker loop and directly testable with synthetic clocks.
#[derive(Debug, Default)]
pub struct ProximityState {
    discovered: HashMap<String, DiscoveredDevice>,
    assignments: HashMap<String, String>,
}

impl ProximityState {
    /// Records one advertisement sighting.
    pub fn observe(&mut self, device_id: &str, rssi: i16, now: DateTime<Utc>) {
        self.discovered
            .entry(device_id.to_string())
            .and_modify(|d| {
                d.rssi = rssi;
                d.last_seen = now;
                d.discovery_count += 1;
            })
            .or_insert(DiscoveredDevice {
                rssi,
                last_seen: now,
                discovery_count: 1,
            });
    }

    /// Re-buckets every sufficiently-sighted device and returns only the
    /// assignments that actually changed.
    pub fn process_locations(&mut self) -> Vec<LocationChange> {
        let mut changes = Vec::new();
        for (device_id, device) in &self.discovered {
            if device.discovery_count < MIN_DISCOVERY_COUNT {
                continue;
            }
            let Some(bucket) = bucket_for_rssi(device.rssi) else {
                continue;
            };
            if self.assignments.get(device_id).map(String::as_str) != Some(bucket) {
                self.assignments
                    .insert(device_id.clone(), bucket.to_string());
                changes.push(LocationChange {
                    device_id: device_id.clone(),
                    location_id: bucket.to_string(),
                });
            }
        }
        changes
    }

    /// Drops discovery entries unseen for more than five minutes. The
    /// assignment stays: it is the last known location, not cleared by
    /// going out of range.
    pub fn evict_stale(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let cutoff = now - ChronoDuration::seconds(EVICT_AFTER_SECS);
        let stale: Vec<String> = self
            .discovered
            .iter()
            .filter(|(_, d)| d.last_seen < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.discovered.remove(id);
        }
        stale
    }

    pub fn list_discovered(&self) -> Vec<DiscoveredDeviceInfo> {
        self.discovered
            .iter()
            .map(|(id, d)| DiscoveredDeviceInfo {
                device_id: id.clone(),
                rssi: d.rssi,
                last_seen: d.last_seen,
                discovery_count: d.discovery_count,
                location: self.assignments.get(id).cloned(),
            })
            .collect()
    }

    pub fn device_location(&self, device_id: &str) -> Option<String> {
        self.assignments.get(device_id).cloned()
    }
}

enum TrackerQuery {
    ListDiscovered {
        response_tx: oneshot::Sender<Vec<DiscoveredDeviceInfo>>,
    },
    DeviceLocation {
        device_id: String,
        response_tx: oneshot::Sender<Option<String>>,
    },
    AddLocation {
        id: String,
        name: String,
        description: String,
        response_tx: oneshot::Sender<bool>,
    },
    UpdateLocation {
        id: String,
        name: Option<String>,
        description: Option<String>,
        response_tx: oneshot::Sender<bool>,
    },
    RemoveLocation {
        id: String,
        response_tx: oneshot::Sender<bool>,
    },
    Locations {
        response_tx: oneshot::Sender<HashMap<String, LocationInfo>>,
    },
}

/// Handle to the background scan loop.
pub struct BleTrackerHandle {
    query_tx: mpsc::Sender<TrackerQuery>,
    cancel: CancellationToken,
}

impl BleTrackerHandle {
    /// Spawns the scan loop over the given advertisement source.
    pub fn spawn<S>(
        source: S,
        config: TrackerConfig,
        mqtt: MqttHandle,
        registry: DeviceManagerHandle,
        locations: LocationRegistry,
    ) -> Self
    where
        S: AdvertisementSource + Send + 'static,
    {
        let (query_tx, query_rx) = mpsc::channel(32);
        let cancel = CancellationToken::new();

        let worker = TrackerWorker {
            source,
            config,
            mqtt,
            registry,
            core: TrackerCore {
                state: ProximityState::default(),
                locations,
            },
            query_rx,
            cancel: cancel.clone(),
        };
        tokio::spawn(worker.run());

        Self { query_tx, cancel }
    }

    /// Stops the loop promptly, interrupting a pending sleep phase.
    pub fn stop_background_scan(&self) {
        self.cancel.cancel();
    }

    pub async fn list_discovered(&self) -> Vec<DiscoveredDeviceInfo> {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .query_tx
            .send(TrackerQuery::ListDiscovered { response_tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        response_rx.await.unwrap_or_default()
    }

    pub async fn device_location(&self, device_id: &str) -> Option<String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.query_tx
            .send(TrackerQuery::DeviceLocation {
                device_id: device_id.to_string(),
                response_tx,
            })
            .await
            .ok()?;
        response_rx.await.ok().flatten()
    }

    pub async fn add_location(&self, id: &str, name: &str, description: &str) -> bool {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .query_tx
            .send(TrackerQuery::AddLocation {
                id: id.to_string(),
                name: name.to_string(),
                description: description.to_string(),
                response_tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        response_rx.await.unwrap_or(false)
    }

    pub async fn update_location(
        &self,
        id: &str,
        name: Option<&str>,
        description: Option<&str>,
    ) -> bool {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .query_tx
            .send(TrackerQuery::UpdateLocation {
                id: id.to_string(),
                name: name.map(str::to_string),
                description: description.map(str::to_string),
                response_tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        response_rx.await.unwrap_or(false)
    }

    pub async fn remove_location(&self, id: &str) -> bool {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .query_tx
            .send(TrackerQuery::RemoveLocation {
                id: id.to_string(),
                response_tx,
            })
            .await
            .is_err()
        {
            return false;
        }
        response_rx.await.unwrap_or(false)
    }

    pub async fn locations(&self) -> HashMap<String, LocationInfo> {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .query_tx
            .send(TrackerQuery::Locations { response_tx })
            .await
            .is_err()
        {
            return HashMap::new();
        }
        response_rx.await.unwrap_or_default()
    }
}

/// Tracker state the query handler mutates; split from the worker so queries
/// can be serviced while a scan future borrows the source.
struct TrackerCore {
    state: ProximityState,
    locations: LocationRegistry,
}

impl TrackerCore {
    async fn handle_query(&mut self, query: TrackerQuery) {
        match query {
            TrackerQuery::ListDiscovered { response_tx } => {
                let _ = response_tx.send(self.state.list_discovered());
            }
            TrackerQuery::DeviceLocation {
                device_id,
                response_tx,
            } => {
                let _ = response_tx.send(self.state.device_location(&device_id));
            }
            TrackerQuery::AddLocation {
                id,
                name,
                description,
                response_tx,
            } => {
                let ok = self.locations.add(&id, &name, &description);
                if ok {
                    self.locations.save().await;
                }
                let _ = response_tx.send(ok);
            }
            TrackerQuery::UpdateLocation {
                id,
                name,
                description,
                response_tx,
            } => {
                let ok = self
                    .locations
                    .update(&id, name.as_deref(), description.as_deref());
                if ok {
                    self.locations.save().await;
                }
                let _ = response_tx.send(ok);
            }
            TrackerQuery::RemoveLocation { id, response_tx } => {
                let ok = self.locations.remove(&id);
                if ok {
                    self.locations.save().await;
                }
                let _ = response_tx.send(ok);
            }
            TrackerQuery::Locations { response_tx } => {
                let _ = response_tx.send(self.locations.all().clone());
            }
        }
    }
}

struct TrackerWorker<S> {
    source: S,
    config: TrackerConfig,
    mqtt: MqttHandle,
    registry: DeviceManagerHandle,
    core: TrackerCore,
    query_rx: mpsc::Receiver<TrackerQuery>,
    cancel: CancellationToken,
}

impl<S: AdvertisementSource + Send> TrackerWorker<S> {
    async fn run(mut self) {
        info!(
            "BLE proximity tracking started (prefix {}, every {}s)",
            self.config.device_prefix,
            self.config.scan_interval.as_secs()
        );

        loop {
            let cycle_start = tokio::time::Instant::now();

            // Scan phase; queries keep being serviced while the radio runs.
            let scan = {
                let scan_fut = self.source.scan(self.config.scan_window);
                tokio::pin!(scan_fut);
                loop {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        query = self.query_rx.recv() => {
                            match query {
                                Some(query) => self.core.handle_query(query).await,
                                // All handles dropped.
                                None => return,
                            }
                        }
                        result = &mut scan_fut => break result,
                    }
                }
            };

            match scan {
                Ok(advertisements) => {
                    let now = Utc::now();
                    for ad in advertisements {
                        let Some(device_id) = ad.name.strip_prefix(&self.config.device_prefix)
                        else {
                            continue;
                        };
                        if device_id.is_empty() {
                            continue;
                        }
                        debug!("Heard {} at {} dBm", device_id, ad.rssi);
                        self.core.state.observe(device_id, ad.rssi, now);
                    }

                    let changes = self.core.state.process_locations();
                    for change in changes {
                        self.report_change(&change).await;
                    }

                    for device_id in self.core.state.evict_stale(now) {
                        info!("Evicting stale BLE device {}", device_id);
                    }
                }
                Err(e) => {
                    error!("BLE scan failed: {}", e);
                    if !self.idle(self.config.error_backoff).await {
                        return;
                    }
                    continue;
                }
            }

            // Sleep out the rest of the cycle.
            let deadline = cycle_start + self.config.scan_interval;
            if !self.idle_until(deadline).await {
                return;
            }
        }
    }

    /// Publishes a bucket change and feeds it to the device registry.
    async fn report_change(&mut self, change: &LocationChange) {
        let location_name = self.core.locations.display_name(&change.location_id);
        info!(
            "Device {} is now at {} ({})",
            change.device_id, change.location_id, location_name
        );

        let topic = format!("{}/{}/location", self.config.topic_prefix, change.device_id);
        let payload = json!({
            "device_id": change.device_id,
            "location_id": change.location_id,
            "location_name": location_name,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if !self.mqtt.publish(&topic, payload, QoS::AtMostOnce, false).await {
            warn!("Could not publish location change for {}", change.device_id);
        }

        self.registry
            .set_location(&change.device_id, &change.location_id)
            .await;
    }

    async fn idle(&mut self, duration: Duration) -> bool {
        self.idle_until(tokio::time::Instant::now() + duration).await
    }

    /// Waits until `deadline` while servicing queries. Returns `false` when
    /// the tracker was stopped.
    async fn idle_until(&mut self, deadline: tokio::time::Instant) -> bool {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                query = self.query_rx.recv() => {
                    match query {
                        Some(query) => self.core.handle_query(query).await,
                        None => return false,
                    }
                }
                _ = tokio::time::sleep_until(deadline) => return true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn buckets_follow_descending_thresholds() {
        assert_eq!(bucket_for_rssi(-40), Some("near"));
        assert_eq!(bucket_for_rssi(-59), Some("near"));
        assert_eq!(bucket_for_rssi(-60), Some("mid"));
        assert_eq!(bucket_for_rssi(-65), Some("mid"));
        assert_eq!(bucket_for_rssi(-75), Some("far"));
        assert_eq!(bucket_for_rssi(-84), Some("far"));
        assert_eq!(bucket_for_rssi(-85), None);
        assert_eq!(bucket_for_rssi(-100), None);
    }

    #[test]
    fn single_sighting_never_assigns() {
        let mut state = ProximityState::default();
        state.observe("unit-1", -50, now());
        assert!(state.process_locations().is_empty());
        assert_eq!(state.device_location("unit-1"), None);
    }

    #[test]
    fn second_sighting_assigns_by_rssi() {
        let mut state = ProximityState::default();
        let t = now();
        state.observe("unit-1", -55, t);
        state.observe("unit-1", -55, t);
        let changes = state.process_locations();
        assert_eq!(
            changes,
            vec![LocationChange {
                device_id: "unit-1".into(),
                location_id: "near".into()
            }]
        );

        state.observe("unit-2", -65, t);
        state.observe("unit-2", -65, t);
        let changes = state.process_locations();
        assert_eq!(changes[0].location_id, "mid");
    }

    #[test]
    fn unchanged_bucket_emits_nothing() {
        let mut state = ProximityState::default();
        let t = now();
        state.observe("unit-1", -55, t);
        state.observe("unit-1", -57, t);
        assert_eq!(state.process_locations().len(), 1);

        // Still near; no churn.
        state.observe("unit-1", -52, t);
        assert!(state.process_locations().is_empty());

        // Crossing into another bucket fires again.
        state.observe("unit-1", -70, t);
        let changes = state.process_locations();
        assert_eq!(changes[0].location_id, "mid");
    }

    #[test]
    fn below_floor_is_not_present() {
        let mut state = ProximityState::default();
        let t = now();
        state.observe("unit-1", -90, t);
        state.observe("unit-1", -90, t);
        assert!(state.process_locations().is_empty());
        assert_eq!(state.device_location("unit-1"), None);
    }

    #[test]
    fn eviction_keeps_last_known_location() {
        let mut state = ProximityState::default();
        let t0 = now();
        state.observe("unit-1", -55, t0);
        state.observe("unit-1", -55, t0);
        state.process_locations();

        // 301 seconds without a sighting: dropped from discovery, location
        // assignment untouched.
        let t1 = t0 + ChronoDuration::seconds(301);
        let evicted = state.evict_stale(t1);
        assert_eq!(evicted, vec!["unit-1".to_string()]);
        assert!(state.list_discovered().is_empty());
        assert_eq!(state.device_location("unit-1"), Some("near".into()));
    }

    #[test]
    fn eviction_spares_devices_within_the_window() {
        let mut state = ProximityState::default();
        let t0 = now();
        state.observe("unit-1", -55, t0);
        let t1 = t0 + ChronoDuration::seconds(299);
        assert!(state.evict_stale(t1).is_empty());
        assert_eq!(state.list_discovered().len(), 1);
    }

    #[test]
    fn rediscovery_after_eviction_starts_the_count_over() {
        let mut state = ProximityState::default();
        let t0 = now();
        state.observe("unit-1", -55, t0);
        state.observe("unit-1", -55, t0);
        state.evict_stale(t0 + ChronoDuration::seconds(301));

        state.observe("unit-1", -55, t0 + ChronoDuration::seconds(302));
        let entry = &state.list_discovered()[0];
        assert_eq!(entry.discovery_count, 1);
    }

    mod loop_tests {
        use std::sync::{Arc, Mutex};

        use crate::ble::ble_scanner::{Advertisement, ScanError};
        use crate::device::device_manager::DeviceManagerHandle;
        use crate::mqtt::config::MqttConfig;
        use crate::mqtt::mqtt_handler::MqttHandle;

        use super::*;

        /// Replays a fixed advertisement on every scan.
        struct FakeSource {
            advertisements: Arc<Mutex<Vec<Advertisement>>>,
        }

        impl AdvertisementSource for FakeSource {
            async fn scan(&mut self, _window: Duration) -> Result<Vec<Advertisement>, ScanError> {
                Ok(self.advertisements.lock().unwrap().clone())
            }
        }

        async fn spawn_tracker(
            advertisements: Arc<Mutex<Vec<Advertisement>>>,
        ) -> BleTrackerHandle {
            let mqtt = MqttHandle::spawn(MqttConfig::default());
            let registry = DeviceManagerHandle::spawn(mqtt.clone(), "swissairdry").await;
            let dir = tempfile::tempdir().unwrap();
            let locations = LocationRegistry::load(dir.path().join("locations.json")).await;
            let config = TrackerConfig {
                scan_window: Duration::from_millis(1),
                scan_interval: Duration::from_millis(20),
                error_backoff: Duration::from_millis(5),
                ..TrackerConfig::default()
            };
            BleTrackerHandle::spawn(FakeSource { advertisements }, config, mqtt, registry, locations)
        }

        #[tokio::test]
        async fn loop_discovers_and_assigns_prefixed_devices() {
            let ads = Arc::new(Mutex::new(vec![
                Advertisement {
                    name: "SAD_unit-9".into(),
                    rssi: -50,
                },
                Advertisement {
                    name: "SomeHeadphones".into(),
                    rssi: -40,
                },
            ]));
            let tracker = spawn_tracker(ads).await;

            // Give the loop a few cycles to pass the debounce threshold.
            tokio::time::sleep(Duration::from_millis(200)).await;

            let discovered = tracker.list_discovered().await;
            assert_eq!(discovered.len(), 1, "unprefixed devices must be ignored");
            let entry = &discovered[0];
            assert_eq!(entry.device_id, "unit-9");
            assert!(entry.discovery_count >= 2);
            assert_eq!(entry.location.as_deref(), Some("near"));
            assert_eq!(
                tracker.device_location("unit-9").await.as_deref(),
                Some("near")
            );

            tracker.stop_background_scan();
        }

        #[tokio::test]
        async fn stop_interrupts_the_loop_promptly() {
            let ads = Arc::new(Mutex::new(Vec::new()));
            let tracker = spawn_tracker(ads).await;
            tokio::time::sleep(Duration::from_millis(30)).await;

            tracker.stop_background_scan();
            tokio::time::sleep(Duration::from_millis(30)).await;

            // Worker gone: queries fall back to empty results.
            assert!(tracker.list_discovered().await.is_empty());
            assert_eq!(tracker.device_location("unit-9").await, None);
        }

        #[tokio::test]
        async fn location_management_round_trips() {
            let ads = Arc::new(Mutex::new(Vec::new()));
            let tracker = spawn_tracker(ads).await;

            assert!(tracker.add_location("attic", "Attic", "").await);
            assert!(!tracker.add_location("attic", "Attic", "").await);
            assert!(tracker.update_location("attic", Some("Attic East"), None).await);
            assert!(tracker.locations().await.contains_key("attic"));
            assert!(tracker.remove_location("attic").await);
            assert!(!tracker.remove_location("attic").await);

            tracker.stop_background_scan();
        }
    }
}
