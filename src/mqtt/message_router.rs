//! Inbound message routing.
//!
//! Keeps the subscription table (filter, QoS, registered callbacks) and fans
//! every inbound publish out to all callbacks whose filter matches the topic.
//! A failing callback is logged and skipped so it can never break delivery to
//! the remaining ones.

use std::sync::Arc;

use rumqttc::QoS;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, warn};

use super::topic_matcher::matches;

/// Error a message callback may return. Routing logs it and moves on.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

/// Callback invoked for every inbound message matching a registered filter.
pub type MessageCallback =
    Arc<dyn Fn(&str, &MessagePayload) -> Result<(), HandlerError> + Send + Sync>;

/// Decoded payload of an inbound publish.
///
/// Device firmware publishes JSON almost everywhere, but status topics carry
/// plain `online`/`offline` strings, so non-JSON UTF-8 is delivered raw
/// instead of dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    Json(Value),
    Raw(String),
}

impl MessagePayload {
    /// Decodes raw bytes. Returns `None` for payloads that are not valid
    /// UTF-8; those are dropped by the caller.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(bytes).ok()?;
        match serde_json::from_str::<Value>(text) {
            Ok(value) => Some(MessagePayload::Json(value)),
            Err(_) => Some(MessagePayload::Raw(text.to_string())),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            MessagePayload::Json(value) => Some(value),
            MessagePayload::Raw(_) => None,
        }
    }

    /// The payload as a plain string: either a JSON string value or raw text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessagePayload::Json(Value::String(s)) => Some(s),
            MessagePayload::Raw(s) => Some(s),
            MessagePayload::Json(_) => None,
        }
    }
}

/// One registered subscription: a topic filter, its QoS and the callbacks
/// interested in matching messages.
pub struct Subscription {
    pub pattern: String,
    pub qos: QoS,
    handlers: Vec<MessageCallback>,
}

/// Subscription table with wildcard-aware dispatch.
#[derive(Default)]
pub struct MessageRouter {
    subscriptions: Vec<Subscription>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a filter. Re-registering an existing filter updates its QoS
    /// and keeps the callbacks already attached to it.
    pub fn subscribe(&mut self, pattern: &str, qos: QoS) {
        if let Some(sub) = self.subscriptions.iter_mut().find(|s| s.pattern == pattern) {
            sub.qos = qos;
            return;
        }
        self.subscriptions.push(Subscription {
            pattern: pattern.to_string(),
            qos,
            handlers: Vec::new(),
        });
    }

    /// Removes a filter and all callbacks attached to it. Returns whether the
    /// filter was known.
    pub fn unsubscribe(&mut self, pattern: &str) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.pattern != pattern);
        self.subscriptions.len() != before
    }

    /// Attaches a callback to a filter, registering the filter at QoS 0 if it
    /// was not subscribed yet.
    pub fn add_callback(&mut self, pattern: &str, callback: MessageCallback) {
        if let Some(sub) = self.subscriptions.iter_mut().find(|s| s.pattern == pattern) {
            sub.handlers.push(callback);
            return;
        }
        self.subscriptions.push(Subscription {
            pattern: pattern.to_string(),
            qos: QoS::AtMostOnce,
            handlers: vec![callback],
        });
    }

    /// All registered filters with their QoS, for resubscription after a
    /// (re)connect.
    pub fn patterns(&self) -> Vec<(String, QoS)> {
        self.subscriptions
            .iter()
            .map(|s| (s.pattern.clone(), s.qos))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Dispatches an inbound publish to every callback of every matching
    /// subscription. Returns the number of callbacks invoked.
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> usize {
        let Some(decoded) = MessagePayload::decode(payload) else {
            warn!("Dropping non-UTF-8 payload on {}", topic);
            return 0;
        };

        let mut invoked = 0;
        for sub in &self.subscriptions {
            if !matches(&sub.pattern, topic) {
                continue;
            }
            for handler in &sub.handlers {
                invoked += 1;
                if let Err(e) = handler(topic, &decoded) {
                    error!("Message callback failed for {}: {}", topic, e);
                }
            }
        }
        debug!("Dispatched {} to {} callback(s)", topic, invoked);
        invoked
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    fn counting_callback(counter: Arc<AtomicUsize>) -> MessageCallback {
        Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn dispatch_fires_all_matching_callbacks() {
        let mut router = MessageRouter::new();
        let count = Arc::new(AtomicUsize::new(0));
        router.add_callback("swissairdry/+/status", counting_callback(count.clone()));
        router.add_callback("swissairdry/#", counting_callback(count.clone()));
        router.add_callback("other/#", counting_callback(count.clone()));

        let fired = router.dispatch("swissairdry/dev-01/status", b"\"online\"");
        assert_eq!(fired, 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failing_callback_does_not_block_others() {
        let mut router = MessageRouter::new();
        let count = Arc::new(AtomicUsize::new(0));
        router.add_callback(
            "a/#",
            Arc::new(|_, _| Err(HandlerError("boom".into()))),
        );
        router.add_callback("a/#", counting_callback(count.clone()));

        router.dispatch("a/b", b"{}");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_removes_filter() {
        let mut router = MessageRouter::new();
        router.subscribe("a/b", QoS::AtLeastOnce);
        assert!(router.unsubscribe("a/b"));
        assert!(!router.unsubscribe("a/b"));
        assert!(router.is_empty());
    }

    #[test]
    fn payload_json_round_trip_is_identical() {
        let sent = json!({"temperature": 21.5, "humidity": 44.0, "nested": {"a": [1, 2, 3]}});
        let wire = serde_json::to_vec(&sent).unwrap();

        let received = MessagePayload::decode(&wire).unwrap();
        assert_eq!(received.as_json(), Some(&sent));
    }

    #[test]
    fn raw_text_payload_is_delivered_not_dropped() {
        let decoded = MessagePayload::decode(b"online, probably").unwrap();
        assert_eq!(decoded.as_text(), Some("online, probably"));
        assert!(decoded.as_json().is_none());
    }

    #[test]
    fn json_string_payload_reads_as_text() {
        let decoded = MessagePayload::decode(b"\"online\"").unwrap();
        assert_eq!(decoded.as_text(), Some("online"));
    }

    #[test]
    fn invalid_utf8_is_dropped() {
        assert!(MessagePayload::decode(&[0xff, 0xfe, 0x00]).is_none());
    }
}
