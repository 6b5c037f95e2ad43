//! # MQTT Connectivity Module
//!
//! Everything between the broker socket and the rest of the service: the
//! connection worker with its reconnection state machine, the subscription
//! table with wildcard dispatch, and the pure topic matcher underneath it.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs          - Broker connection settings
//! ├── topic_matcher.rs   - Pure +/# filter matching
//! ├── message_router.rs  - Subscription table and inbound dispatch
//! └── mqtt_handler.rs    - Connection worker, state machine, handle API
//! ```
//!
//! ## Design
//!
//! - **Single writer**: one worker task owns the rumqttc session; callers use
//!   a cloneable [`mqtt_handler::MqttHandle`] over a command channel.
//! - **Contained failures**: publish/subscribe report `false` and log instead
//!   of raising; a broken callback never stops delivery to the others.
//! - **Bounded recovery**: exponential backoff with a fresh client identifier
//!   per attempt, terminal after five failures until an explicit reconnect.

pub mod config;
pub mod message_router;
pub mod mqtt_handler;
pub mod topic_matcher;
