//! BLE advertisement scanning.
//!
//! The tracker only needs "which names did we hear, how loud" per scan
//! window, so the scan source is a minimal trait and the btleplug adapter
//! binding lives behind it. Tests drive the tracker with a fake source; the
//! service binary plugs in [`BtleplugScanner`].

use std::future::Future;
use std::time::Duration;

use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("no Bluetooth adapter available")]
    NoAdapter,
    #[error("bluetooth backend error: {0}")]
    Backend(String),
}

/// One advertisement heard during a scan window.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub name: String,
    /// Received signal strength in dBm.
    pub rssi: i16,
}

/// Minimal scan interface decoupling the tracker from a specific BLE crate.
///
/// The returned future must be `Send`: the tracker loop runs on a spawned
/// task.
pub trait AdvertisementSource {
    /// Scans for `window` and returns the named advertisements observed.
    fn scan(
        &mut self,
        window: Duration,
    ) -> impl Future<Output = Result<Vec<Advertisement>, ScanError>> + Send;
}

/// Host-adapter scanner backed by btleplug.
pub struct BtleplugScanner {
    adapter: Adapter,
}

impl BtleplugScanner {
    /// Picks the first Bluetooth adapter on the host.
    pub async fn new() -> Result<Self, ScanError> {
        let manager = Manager::new().await.map_err(backend)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(backend)?
            .into_iter()
            .next()
            .ok_or(ScanError::NoAdapter)?;
        Ok(Self { adapter })
    }
}

impl AdvertisementSource for BtleplugScanner {
    async fn scan(&mut self, window: Duration) -> Result<Vec<Advertisement>, ScanError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(backend)?;
        tokio::time::sleep(window).await;
        self.adapter.stop_scan().await.map_err(backend)?;

        let mut advertisements = Vec::new();
        for peripheral in self.adapter.peripherals().await.map_err(backend)? {
            let Some(properties) = peripheral.properties().await.map_err(backend)? else {
                continue;
            };
            // Unnamed peripherals cannot carry the device prefix; skip them
            // along with entries the adapter has no signal reading for.
            let (Some(name), Some(rssi)) = (properties.local_name, properties.rssi) else {
                continue;
            };
            advertisements.push(Advertisement { name, rssi });
        }
        Ok(advertisements)
    }
}

fn backend(e: btleplug::Error) -> ScanError {
    ScanError::Backend(e.to_string())
}
