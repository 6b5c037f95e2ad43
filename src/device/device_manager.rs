//! Device registry actor.
//!
//! A single worker task owns the id → [`Device`] map, so concurrent updates
//! arriving from MQTT callbacks, the BLE tracker and the REST layer are
//! serialized through one command channel instead of racing on shared state.
//! MQTT callbacks enqueue with `try_send` and never block the transport task.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rumqttc::QoS;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::mqtt::message_router::{HandlerError, MessageCallback, MessagePayload};
use crate::mqtt::mqtt_handler::MqttHandle;

use super::device_types::{CommTransport, Device, DeviceStatus, DeviceType};
use super::normalizer::normalize;

enum DeviceAction {
    Register {
        id: String,
        device_type: DeviceType,
        transport: CommTransport,
        name: String,
        location: Option<String>,
        metadata: Option<Map<String, Value>>,
        response_tx: oneshot::Sender<bool>,
    },
    UpdateData {
        id: String,
        data: Map<String, Value>,
        source: CommTransport,
        response_tx: Option<oneshot::Sender<bool>>,
    },
    UpdateStatus {
        id: String,
        status: DeviceStatus,
    },
    SetLocation {
        id: String,
        location: String,
    },
    SendCommand {
        id: String,
        command: String,
        params: Map<String, Value>,
        response_tx: oneshot::Sender<bool>,
    },
    PushConfig {
        id: String,
        config: Map<String, Value>,
        response_tx: oneshot::Sender<bool>,
    },
    Get {
        id: String,
        response_tx: oneshot::Sender<Option<Device>>,
    },
    List {
        response_tx: oneshot::Sender<Vec<Device>>,
    },
    ListByType {
        device_type: DeviceType,
        response_tx: oneshot::Sender<Vec<Device>>,
    },
}

/// Cloneable handle to the registry worker.
#[derive(Clone)]
pub struct DeviceManagerHandle {
    action_tx: mpsc::Sender<DeviceAction>,
}

impl DeviceManagerHandle {
    /// Spawns the registry worker and wires the inbound MQTT feed: global
    /// status/telemetry subscriptions whose callbacks enqueue updates onto
    /// the worker channel.
    pub async fn spawn(mqtt: MqttHandle, topic_prefix: &str) -> Self {
        let (action_tx, action_rx) = mpsc::channel(256);

        register_ingest_callbacks(&mqtt, topic_prefix, action_tx.clone()).await;

        let worker = DeviceWorker {
            devices: HashMap::new(),
            mqtt,
            topic_prefix: topic_prefix.to_string(),
            action_rx,
        };
        tokio::spawn(worker.run());
        info!("Device registry started");

        Self { action_tx }
    }

    /// Inserts or replaces a device. MQTT devices get their topic templates
    /// subscribed as part of registration.
    pub async fn register(
        &self,
        id: &str,
        device_type: DeviceType,
        transport: CommTransport,
        name: &str,
        location: Option<String>,
        metadata: Option<Map<String, Value>>,
    ) -> bool {
        let (response_tx, response_rx) = oneshot::channel();
        let sent = self
            .action_tx
            .send(DeviceAction::Register {
                id: id.to_string(),
                device_type,
                transport,
                name: name.to_string(),
                location,
                metadata,
                response_tx,
            })
            .await;
        if sent.is_err() {
            return false;
        }
        response_rx.await.unwrap_or(false)
    }

    /// Normalizes and merges a telemetry payload, refreshing `last_seen` and
    /// marking the device online. Unknown ids are auto-provisioned.
    pub async fn update_data(
        &self,
        id: &str,
        data: Map<String, Value>,
        source: CommTransport,
    ) -> bool {
        let (response_tx, response_rx) = oneshot::channel();
        let sent = self
            .action_tx
            .send(DeviceAction::UpdateData {
                id: id.to_string(),
                data,
                source,
                response_tx: Some(response_tx),
            })
            .await;
        if sent.is_err() {
            return false;
        }
        response_rx.await.unwrap_or(false)
    }

    /// Dispatches a command over the device's transport. Unknown ids and the
    /// stubbed HTTP/BLE paths return `false`.
    pub async fn send_command(
        &self,
        id: &str,
        command: &str,
        params: Map<String, Value>,
    ) -> bool {
        let (response_tx, response_rx) = oneshot::channel();
        let sent = self
            .action_tx
            .send(DeviceAction::SendCommand {
                id: id.to_string(),
                command: command.to_string(),
                params,
                response_tx,
            })
            .await;
        if sent.is_err() {
            return false;
        }
        response_rx.await.unwrap_or(false)
    }

    /// Pushes a configuration document to an MQTT device's config topic.
    pub async fn push_config(&self, id: &str, config: Map<String, Value>) -> bool {
        let (response_tx, response_rx) = oneshot::channel();
        let sent = self
            .action_tx
            .send(DeviceAction::PushConfig {
                id: id.to_string(),
                config,
                response_tx,
            })
            .await;
        if sent.is_err() {
            return false;
        }
        response_rx.await.unwrap_or(false)
    }

    /// Records a location fix (BLE tracker feed). Unknown ids are
    /// auto-provisioned as BLE devices.
    pub async fn set_location(&self, id: &str, location: &str) {
        let _ = self
            .action_tx
            .send(DeviceAction::SetLocation {
                id: id.to_string(),
                location: location.to_string(),
            })
            .await;
    }

    pub async fn get(&self, id: &str) -> Option<Device> {
        let (response_tx, response_rx) = oneshot::channel();
        self.action_tx
            .send(DeviceAction::Get {
                id: id.to_string(),
                response_tx,
            })
            .await
            .ok()?;
        response_rx.await.ok().flatten()
    }

    pub async fn list(&self) -> Vec<Device> {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .action_tx
            .send(DeviceAction::List { response_tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        response_rx.await.unwrap_or_default()
    }

    pub async fn list_by_type(&self, device_type: DeviceType) -> Vec<Device> {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .action_tx
            .send(DeviceAction::ListByType {
                device_type,
                response_tx,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }
        response_rx.await.unwrap_or_default()
    }
}

/// Subscribes the global device feed and registers the callbacks that bridge
/// MQTT dispatch into the registry channel.
async fn register_ingest_callbacks(
    mqtt: &MqttHandle,
    topic_prefix: &str,
    action_tx: mpsc::Sender<DeviceAction>,
) {
    for leaf in ["status", "telemetry", "data"] {
        let pattern = format!("{}/+/{}", topic_prefix, leaf);
        mqtt.subscribe(&pattern, QoS::AtMostOnce).await;
        let tx = action_tx.clone();
        let callback: MessageCallback = Arc::new(move |topic, payload| {
            let Some(action) = ingest_action(topic, payload) else {
                debug!("Ignoring payload on {}", topic);
                return Ok(());
            };
            // Never block the transport task on registry work.
            tx.try_send(action)
                .map_err(|e| HandlerError(format!("registry queue rejected {}: {}", topic, e)))
        });
        mqtt.add_callback(&pattern, callback).await;
    }
}

/// Maps an inbound `{prefix}/{id}/{leaf}` message to a registry action.
fn ingest_action(topic: &str, payload: &MessagePayload) -> Option<DeviceAction> {
    let mut segments = topic.split('/');
    let _prefix = segments.next()?;
    let id = segments.next()?.to_string();
    let leaf = segments.next()?;
    if segments.next().is_some() || id.is_empty() {
        return None;
    }

    match leaf {
        "status" => {
            // Firmware publishes either a bare string or an object with a
            // `status` field.
            let text = payload.as_text().or_else(|| {
                payload
                    .as_json()
                    .and_then(|v| v.get("status"))
                    .and_then(Value::as_str)
            })?;
            Some(DeviceAction::UpdateStatus {
                id,
                status: DeviceStatus::parse(text),
            })
        }
        "telemetry" | "data" => {
            let data = payload.as_json()?.as_object()?.clone();
            Some(DeviceAction::UpdateData {
                id,
                data,
                source: CommTransport::Mqtt,
                response_tx: None,
            })
        }
        _ => None,
    }
}

struct DeviceWorker {
    devices: HashMap<String, Device>,
    mqtt: MqttHandle,
    topic_prefix: String,
    action_rx: mpsc::Receiver<DeviceAction>,
}

impl DeviceWorker {
    async fn run(mut self) {
        while let Some(action) = self.action_rx.recv().await {
            self.handle_action(action).await;
        }
        debug!("Device registry stopped");
    }

    async fn handle_action(&mut self, action: DeviceAction) {
        match action {
            DeviceAction::Register {
                id,
                device_type,
                transport,
                name,
                location,
                metadata,
                response_tx,
            } => {
                let ok = self
                    .register(id, device_type, transport, name, location, metadata)
                    .await;
                let _ = response_tx.send(ok);
            }
            DeviceAction::UpdateData {
                id,
                data,
                source,
                response_tx,
            } => {
                let ok = self.update_data(&id, data, source);
                if let Some(tx) = response_tx {
                    let _ = tx.send(ok);
                }
            }
            DeviceAction::UpdateStatus { id, status } => self.update_status(&id, status),
            DeviceAction::SetLocation { id, location } => self.set_location(&id, location),
            DeviceAction::SendCommand {
                id,
                command,
                params,
                response_tx,
            } => {
                let ok = self.send_command(&id, &command, params).await;
                let _ = response_tx.send(ok);
            }
            DeviceAction::PushConfig {
                id,
                config,
                response_tx,
            } => {
                let ok = self.push_config(&id, config).await;
                let _ = response_tx.send(ok);
            }
            DeviceAction::Get { id, response_tx } => {
                let _ = response_tx.send(self.devices.get(&id).cloned());
            }
            DeviceAction::List { response_tx } => {
                let _ = response_tx.send(self.devices.values().cloned().collect());
            }
            DeviceAction::ListByType {
                device_type,
                response_tx,
            } => {
                let listed = self
                    .devices
                    .values()
                    .filter(|d| d.device_type == device_type)
                    .cloned()
                    .collect();
                let _ = response_tx.send(listed);
            }
        }
    }

    async fn register(
        &mut self,
        id: String,
        device_type: DeviceType,
        transport: CommTransport,
        name: String,
        location: Option<String>,
        metadata: Option<Map<String, Value>>,
    ) -> bool {
        if self.devices.contains_key(&id) {
            warn!("Device {} already registered, replacing it", id);
        }

        let name = if name.is_empty() {
            format!("Device {}", id)
        } else {
            name
        };
        let device = Device {
            id: id.clone(),
            device_type,
            transport,
            name,
            location,
            status: DeviceStatus::Offline,
            last_seen: Utc::now(),
            metadata: metadata.unwrap_or_default(),
            data: Map::new(),
        };

        if transport == CommTransport::Mqtt {
            self.subscribe_device_topics(&id, device_type).await;
        }

        info!(
            "Registered device {} (type {:?}, transport {:?})",
            id, device_type, transport
        );
        self.devices.insert(id, device);
        true
    }

    /// Per-device topic templates; ESP and STM32 families publish on extra
    /// namespaces next to the shared one.
    async fn subscribe_device_topics(&self, id: &str, device_type: DeviceType) {
        let prefix = &self.topic_prefix;
        self.mqtt
            .subscribe(&format!("{}/devices/{}/#", prefix, id), QoS::AtMostOnce)
            .await;
        match device_type {
            DeviceType::Esp8266 | DeviceType::Esp32 => {
                self.mqtt
                    .subscribe(&format!("{}/sensors/{}/#", prefix, id), QoS::AtMostOnce)
                    .await;
            }
            DeviceType::Stm32 => {
                self.mqtt
                    .subscribe(&format!("{}/stm32/{}/#", prefix, id), QoS::AtMostOnce)
                    .await;
            }
            DeviceType::Other => {}
        }
    }

    fn update_data(
        &mut self,
        id: &str,
        raw: Map<String, Value>,
        source: CommTransport,
    ) -> bool {
        let device = self.devices.entry(id.to_string()).or_insert_with(|| {
            info!("Auto-provisioning device {} from {:?} telemetry", id, source);
            Device::provisioned(id, DeviceType::Other, source, Utc::now())
        });

        let normalized = normalize(device.device_type, &raw);
        for (key, value) in normalized {
            device.data.insert(key, value);
        }
        device.last_seen = Utc::now();
        device.status = DeviceStatus::Online;
        debug!("Updated data for {}", id);
        true
    }

    fn update_status(&mut self, id: &str, status: DeviceStatus) {
        let device = self.devices.entry(id.to_string()).or_insert_with(|| {
            info!("Auto-provisioning device {} from status message", id);
            Device::provisioned(id, DeviceType::Other, CommTransport::Mqtt, Utc::now())
        });
        device.status = status;
        device.last_seen = Utc::now();
    }

    fn set_location(&mut self, id: &str, location: String) {
        let device = self.devices.entry(id.to_string()).or_insert_with(|| {
            info!("Auto-provisioning device {} from BLE discovery", id);
            Device::provisioned(id, DeviceType::Other, CommTransport::Ble, Utc::now())
        });
        device.location = Some(location);
        device.last_seen = Utc::now();
    }

    async fn send_command(
        &mut self,
        id: &str,
        command: &str,
        params: Map<String, Value>,
    ) -> bool {
        let Some(device) = self.devices.get(id) else {
            warn!("Cannot send command to unknown device {}", id);
            return false;
        };

        match device.transport {
            CommTransport::Mqtt => {
                let topic = format!("{}/{}/command", self.topic_prefix, id);
                let payload = json!({
                    "command": command,
                    "params": params,
                    "timestamp": Utc::now().to_rfc3339(),
                });
                self.mqtt
                    .publish(&topic, payload, QoS::AtLeastOnce, false)
                    .await
            }
            CommTransport::Http => {
                warn!("HTTP command transport not implemented, dropping {} for {}", command, id);
                false
            }
            CommTransport::Ble => {
                warn!("BLE command transport not implemented, dropping {} for {}", command, id);
                false
            }
        }
    }

    async fn push_config(&mut self, id: &str, config: Map<String, Value>) -> bool {
        let Some(device) = self.devices.get(id) else {
            warn!("Cannot push config to unknown device {}", id);
            return false;
        };
        if device.transport != CommTransport::Mqtt {
            warn!("Config push requires MQTT transport, {} uses {:?}", id, device.transport);
            return false;
        }

        let topic = format!("{}/{}/config", self.topic_prefix, id);
        self.mqtt
            .publish(&topic, Value::Object(config), QoS::AtLeastOnce, true)
            .await
    }
}
