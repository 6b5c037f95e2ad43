//! MQTT connection manager.
//!
//! One worker task owns the broker session (rumqttc client + event loop), the
//! subscription table and the reconnection state machine. Callers hold a cheap
//! cloneable [`MqttHandle`] and talk to the worker over a command channel, so
//! session state has exactly one writer and broker callbacks never touch
//! shared memory.
//!
//! Reconnection policy: an unexpected connection loss schedules bounded
//! retries with exponential backoff (10 s doubling up to 160 s, five attempts).
//! Every attempt discards the previous session object and builds a fresh one
//! with a newly generated client identifier, which also covers the
//! broker-side identifier-collision case. After the fifth failed attempt the
//! worker goes back to `Disconnected` and stays there until an explicit
//! `connect()`.

use std::time::Duration;

use rand::{distr::Alphanumeric, Rng};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::config::MqttConfig;
use super::message_router::{MessageCallback, MessageRouter};

/// MQTT 3.1 limits client identifiers to 23 bytes.
const CLIENT_ID_MAX_LEN: usize = 23;

/// Retry schedule bounds: waits of 10 * 2^(n-1) seconds for n = 1..=5.
const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const BACKOFF_BASE_SECS: u64 = 10;

/// How many recent error messages the status keeps around.
const ERROR_HISTORY: usize = 10;

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Operational snapshot of the connection, for dashboards and logs.
#[derive(Clone, Debug, Default)]
pub struct MqttStatus {
    pub connection_state: ConnectionState,
    pub error_messages: Vec<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<chrono::DateTime<chrono::Local>>,
}

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    #[error("broker rejected credentials")]
    AuthRejected,
    #[error("broker rejected client identifier ({0})")]
    IdentifierRejected(String),
    #[error("broker refused connection: {0}")]
    Refused(String),
    #[error("no CONNACK within {0:?}")]
    Timeout(Duration),
    #[error("connection worker is gone")]
    WorkerGone,
}

/// Generates a broker-unique client identifier.
///
/// Combines a random suffix, the millisecond clock and the process id. The
/// 23-byte identifier budget forces compact encodings: 6 random characters,
/// the lower 32 bits of the clock and the lower 16 bits of the pid.
pub fn generate_client_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    let millis = chrono::Utc::now().timestamp_millis() as u64 & 0xffff_ffff;
    let pid = std::process::id() & 0xffff;
    let mut id = format!("sard-{}{:08x}{:04x}", suffix, millis, pid);
    id.truncate(CLIENT_ID_MAX_LEN);
    id
}

/// Backoff before reconnect attempt `attempt` (1-based), or `None` once the
/// attempt budget is exhausted.
pub fn next_backoff(attempt: u32) -> Option<Duration> {
    if attempt == 0 || attempt > MAX_RECONNECT_ATTEMPTS {
        return None;
    }
    Some(Duration::from_secs(
        BACKOFF_BASE_SECS * 2u64.pow(attempt - 1),
    ))
}

enum Command {
    Connect {
        response_tx: oneshot::Sender<Result<(), MqttError>>,
    },
    Disconnect {
        response_tx: oneshot::Sender<()>,
    },
    Publish {
        topic: String,
        payload: Value,
        qos: QoS,
        retain: bool,
        response_tx: oneshot::Sender<bool>,
    },
    Subscribe {
        pattern: String,
        qos: QoS,
        response_tx: oneshot::Sender<bool>,
    },
    Unsubscribe {
        pattern: String,
        response_tx: oneshot::Sender<bool>,
    },
    AddCallback {
        pattern: String,
        callback: MessageCallback,
        response_tx: oneshot::Sender<()>,
    },
    Status {
        response_tx: oneshot::Sender<MqttStatus>,
    },
}

/// Cloneable handle to the MQTT connection worker.
#[derive(Clone)]
pub struct MqttHandle {
    command_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl MqttHandle {
    /// Spawns the connection worker. The worker starts disconnected; call
    /// [`MqttHandle::connect`] to open the broker session.
    pub fn spawn(config: MqttConfig) -> Self {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let worker = ConnectionWorker {
            config,
            command_rx,
            state_tx,
            router: MessageRouter::new(),
            session: None,
            retry: None,
            status: MqttStatus::default(),
        };
        tokio::spawn(worker.run());

        Self {
            command_tx,
            state_rx,
        }
    }

    /// Opens the broker session. Idempotent: a no-op returning `Ok` while
    /// already connected. On success every retained subscription is replayed.
    pub async fn connect(&self) -> Result<(), MqttError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Connect { response_tx })
            .await
            .map_err(|_| MqttError::WorkerGone)?;
        response_rx.await.map_err(|_| MqttError::WorkerGone)?
    }

    /// Tears the session down and cancels any pending reconnect. Safe to call
    /// in any state.
    pub async fn disconnect(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .command_tx
            .send(Command::Disconnect { response_tx })
            .await
            .is_ok()
        {
            let _ = response_rx.await;
        }
    }

    /// Publishes a JSON payload. Returns `false` (after logging) when not
    /// connected or when the transport refuses the message; never blocks the
    /// caller on connectivity loss.
    pub async fn publish(&self, topic: &str, payload: Value, qos: QoS, retain: bool) -> bool {
        let (response_tx, response_rx) = oneshot::channel();
        let sent = self
            .command_tx
            .send(Command::Publish {
                topic: topic.to_string(),
                payload,
                qos,
                retain,
                response_tx,
            })
            .await;
        if sent.is_err() {
            error!("MQTT worker gone, dropping publish to {}", topic);
            return false;
        }
        response_rx.await.unwrap_or(false)
    }

    /// Registers a topic filter. While disconnected the filter is retained
    /// and replayed on the next successful connect.
    pub async fn subscribe(&self, pattern: &str, qos: QoS) -> bool {
        let (response_tx, response_rx) = oneshot::channel();
        let sent = self
            .command_tx
            .send(Command::Subscribe {
                pattern: pattern.to_string(),
                qos,
                response_tx,
            })
            .await;
        if sent.is_err() {
            return false;
        }
        response_rx.await.unwrap_or(false)
    }

    /// Drops a topic filter and its callbacks.
    pub async fn unsubscribe(&self, pattern: &str) -> bool {
        let (response_tx, response_rx) = oneshot::channel();
        let sent = self
            .command_tx
            .send(Command::Unsubscribe {
                pattern: pattern.to_string(),
                response_tx,
            })
            .await;
        if sent.is_err() {
            return false;
        }
        response_rx.await.unwrap_or(false)
    }

    /// Attaches an inbound-message callback to a filter. Callbacks must not
    /// block; slow consumers should hand the message off to a queue.
    pub async fn add_callback(&self, pattern: &str, callback: MessageCallback) {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .command_tx
            .send(Command::AddCallback {
                pattern: pattern.to_string(),
                callback,
                response_tx,
            })
            .await
            .is_ok()
        {
            let _ = response_rx.await;
        }
    }

    pub async fn status(&self) -> MqttStatus {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .command_tx
            .send(Command::Status { response_tx })
            .await
            .is_err()
        {
            return MqttStatus::default();
        }
        response_rx.await.unwrap_or_default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

struct Session {
    client: AsyncClient,
    eventloop: EventLoop,
}

struct Retry {
    attempt: u32,
    at: Instant,
}

enum Wake {
    Command(Option<Command>),
    Event(Result<Event, ConnectionError>),
    Retry,
}

struct ConnectionWorker {
    config: MqttConfig,
    command_rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    router: MessageRouter,
    session: Option<Session>,
    retry: Option<Retry>,
    status: MqttStatus,
}

impl ConnectionWorker {
    async fn run(mut self) {
        loop {
            let wake = if let Some(session) = self.session.as_mut() {
                tokio::select! {
                    cmd = self.command_rx.recv() => Wake::Command(cmd),
                    event = session.eventloop.poll() => Wake::Event(event),
                }
            } else if let Some(retry) = &self.retry {
                tokio::select! {
                    cmd = self.command_rx.recv() => Wake::Command(cmd),
                    _ = tokio::time::sleep_until(retry.at) => Wake::Retry,
                }
            } else {
                Wake::Command(self.command_rx.recv().await)
            };

            match wake {
                Wake::Command(None) => break,
                Wake::Command(Some(command)) => self.handle_command(command).await,
                Wake::Event(event) => self.handle_event(event),
                Wake::Retry => self.run_retry().await,
            }
        }

        // All handles dropped: tear the session down and exit.
        if let Some(session) = self.session.take() {
            let _ = session.client.try_disconnect();
        }
        self.set_state(ConnectionState::Disconnected);
        debug!("MQTT worker stopped");
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.status.connection_state = state.clone();
        self.state_tx.send_replace(state);
    }

    fn record_error(&mut self, message: String) {
        if self.status.error_messages.len() >= ERROR_HISTORY {
            self.status.error_messages.remove(0);
        }
        self.status.error_messages.push(message);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { response_tx } => {
                if self.session.is_some()
                    && self.status.connection_state == ConnectionState::Connected
                {
                    let _ = response_tx.send(Ok(()));
                    return;
                }
                self.retry = None;
                let result = self.open_session().await;
                if let Err(e) = &result {
                    self.record_error(e.to_string());
                    self.set_state(ConnectionState::Disconnected);
                }
                let _ = response_tx.send(result);
            }
            Command::Disconnect { response_tx } => {
                self.retry = None;
                if let Some(session) = self.session.take() {
                    let _ = session.client.try_disconnect();
                    info!("Disconnected from MQTT broker");
                }
                self.set_state(ConnectionState::Disconnected);
                let _ = response_tx.send(());
            }
            Command::Publish {
                topic,
                payload,
                qos,
                retain,
                response_tx,
            } => {
                let _ = response_tx.send(self.publish(&topic, &payload, qos, retain));
            }
            Command::Subscribe {
                pattern,
                qos,
                response_tx,
            } => {
                self.router.subscribe(&pattern, qos);
                let ok = match &self.session {
                    Some(session) if self.status.connection_state == ConnectionState::Connected => {
                        match session.client.try_subscribe(pattern.as_str(), qos) {
                            Ok(()) => true,
                            Err(e) => {
                                warn!("Subscribe to {} failed: {}", pattern, e);
                                false
                            }
                        }
                    }
                    // Retained for replay on the next connect.
                    _ => true,
                };
                let _ = response_tx.send(ok);
            }
            Command::Unsubscribe {
                pattern,
                response_tx,
            } => {
                let known = self.router.unsubscribe(&pattern);
                let mut ok = known;
                if known {
                    if let Some(session) = &self.session {
                        if let Err(e) = session.client.try_unsubscribe(pattern.as_str()) {
                            warn!("Unsubscribe from {} failed: {}", pattern, e);
                            ok = false;
                        }
                    }
                }
                let _ = response_tx.send(ok);
            }
            Command::AddCallback {
                pattern,
                callback,
                response_tx,
            } => {
                self.router.add_callback(&pattern, callback);
                let _ = response_tx.send(());
            }
            Command::Status { response_tx } => {
                let _ = response_tx.send(self.status.clone());
            }
        }
    }

    fn publish(&mut self, topic: &str, payload: &Value, qos: QoS, retain: bool) -> bool {
        if self.status.connection_state != ConnectionState::Connected {
            warn!("Not connected, dropping publish to {}", topic);
            return false;
        }
        let Some(session) = &self.session else {
            warn!("Not connected, dropping publish to {}", topic);
            return false;
        };
        let body = payload.to_string();
        match session.client.try_publish(topic, qos, retain, body) {
            Ok(()) => true,
            Err(e) => {
                warn!("Publish to {} failed: {}", topic, e);
                self.record_error(format!("publish {}: {}", topic, e));
                false
            }
        }
    }

    /// Builds a fresh session (fresh client identifier included) and waits
    /// for the broker's CONNACK.
    async fn open_session(&mut self) -> Result<(), MqttError> {
        self.set_state(ConnectionState::Connecting);
        self.session = None;

        let client_id = generate_client_id();
        debug!("Connecting to {}:{} as {}", self.config.host, self.config.port, client_id);

        let mut options = MqttOptions::new(client_id, self.config.host.clone(), self.config.port);
        options.set_keep_alive(self.config.keep_alive());
        options.set_clean_session(false);
        if let (Some(user), Some(pass)) = (&self.config.username, &self.config.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 100);

        let timeout = self.config.connect_timeout();
        match tokio::time::timeout(timeout, await_connack(&mut eventloop)).await {
            Err(_) => return Err(MqttError::Timeout(timeout)),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(())) => {}
        }

        info!("Connected to MQTT broker {}:{}", self.config.host, self.config.port);
        self.resubscribe(&client);
        self.session = Some(Session { client, eventloop });
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    fn resubscribe(&self, client: &AsyncClient) {
        for (pattern, qos) in self.router.patterns() {
            match client.try_subscribe(pattern.as_str(), qos) {
                Ok(()) => debug!("Resubscribed to {}", pattern),
                Err(e) => warn!("Resubscribe to {} failed: {}", pattern, e),
            }
        }
    }

    fn handle_event(&mut self, event: Result<Event, ConnectionError>) {
        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                self.status.messages_received += 1;
                self.status.last_activity = Some(chrono::Local::now());
                self.router.dispatch(&publish.topic, &publish.payload);
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                // The event loop re-established the session underneath us.
                if ack.code == ConnectReturnCode::Success {
                    info!("MQTT session re-established");
                    if let Some(session) = &self.session {
                        let client = session.client.clone();
                        self.resubscribe(&client);
                    }
                    self.set_state(ConnectionState::Connected);
                }
            }
            Ok(Event::Outgoing(Outgoing::Publish(_))) => {
                self.status.messages_sent += 1;
                self.status.last_activity = Some(chrono::Local::now());
            }
            Ok(_) => {}
            Err(e) => {
                self.record_error(e.to_string());
                if is_collision_class(&e) {
                    // Return code 7 usually means the identifier is already
                    // taken, though the broker may refuse for other reasons;
                    // either way the session is rebuilt with a fresh id.
                    warn!(
                        "Broker refused session ({}), discarding it and regenerating client id",
                        e
                    );
                } else {
                    warn!("MQTT connection lost: {}", e);
                }
                self.session = None;
                self.schedule_retry(1);
            }
        }
    }

    fn schedule_retry(&mut self, attempt: u32) {
        match next_backoff(attempt) {
            Some(delay) => {
                info!(
                    "Reconnect attempt {}/{} in {}s",
                    attempt,
                    MAX_RECONNECT_ATTEMPTS,
                    delay.as_secs()
                );
                self.set_state(ConnectionState::Reconnecting);
                self.retry = Some(Retry {
                    attempt,
                    at: Instant::now() + delay,
                });
            }
            None => {
                error!(
                    "Giving up on MQTT reconnection after {} attempts",
                    MAX_RECONNECT_ATTEMPTS
                );
                self.retry = None;
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }

    async fn run_retry(&mut self) {
        let attempt = self.retry.take().map_or(1, |r| r.attempt);
        match self.open_session().await {
            Ok(()) => info!("Reconnected on attempt {}", attempt),
            Err(e) => {
                warn!("Reconnect attempt {} failed: {}", attempt, e);
                self.record_error(e.to_string());
                self.schedule_retry(attempt + 1);
            }
        }
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), MqttError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(refusal_error(code)),
                }
            }
            Ok(_) => continue,
            Err(e) => return Err(classify_connection_error(&e)),
        }
    }
}

fn refusal_error(code: ConnectReturnCode) -> MqttError {
    match code {
        ConnectReturnCode::BadClientId | ConnectReturnCode::NotAuthorized => {
            MqttError::IdentifierRejected(format!("{:?}", code))
        }
        ConnectReturnCode::BadUserNamePassword => MqttError::AuthRejected,
        code => MqttError::Refused(format!("{:?}", code)),
    }
}

fn classify_connection_error(e: &ConnectionError) -> MqttError {
    match e {
        ConnectionError::ConnectionRefused(code) => refusal_error(*code),
        other => MqttError::Unreachable(other.to_string()),
    }
}

fn is_collision_class(e: &ConnectionError) -> bool {
    matches!(
        e,
        ConnectionError::ConnectionRefused(
            ConnectReturnCode::NotAuthorized | ConnectReturnCode::BadClientId
        )
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn backoff_sequence_doubles_from_ten_seconds() {
        let waits: Vec<_> = (1..=5)
            .map(|n| next_backoff(n).unwrap().as_secs())
            .collect();
        assert_eq!(waits, vec![10, 20, 40, 80, 160]);
    }

    #[test]
    fn sixth_attempt_is_terminal() {
        assert_eq!(next_backoff(6), None);
        assert_eq!(next_backoff(0), None);
    }

    #[test]
    fn client_ids_fit_the_mqtt31_limit_and_differ() {
        let a = generate_client_id();
        let b = generate_client_id();
        assert!(a.len() <= 23, "{} is too long", a);
        assert!(a.starts_with("sard-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn publish_while_disconnected_returns_false() {
        let handle = MqttHandle::spawn(MqttConfig::default());
        assert!(!handle.is_connected());
        assert!(
            !handle
                .publish("swissairdry/dev-01/command", json!({"command": "on"}), QoS::AtMostOnce, false)
                .await
        );
    }

    #[tokio::test]
    async fn subscriptions_are_retained_while_disconnected() {
        let handle = MqttHandle::spawn(MqttConfig::default());
        assert!(handle.subscribe("swissairdry/+/status", QoS::AtMostOnce).await);
        assert!(handle.unsubscribe("swissairdry/+/status").await);
        assert!(!handle.unsubscribe("swissairdry/+/status").await);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let handle = MqttHandle::spawn(MqttConfig::default());
        handle.disconnect().await;
        handle.disconnect().await;
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }
}
