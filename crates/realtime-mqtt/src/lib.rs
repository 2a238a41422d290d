//! Realtime pub/sub client for an MQTT ("MQTToT") messaging broker.
//!
//! Keeps one long-lived broker connection alive, maintains the subscription
//! set derived from feature flags, publishes outbound commands, and decodes
//! inbound multiplexed frames into typed [`Event`]s.
//!
//! # Features
//! - MQTT 3.1.1 framing over WebSocket (default) or raw TCP
//! - zlib-compressed payloads and compact numeric topic ids
//! - Full resubscription after every reconnect
//! - Keepalive watchdog and capped exponential reconnect backoff
//! - MessagePack pubsub envelopes, incremental sync, GraphQL subscriptions
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), realtime_mqtt::Error> {
//! use realtime_mqtt::{AuthInfo, DeviceInfo, Event, RealtimeClient, RealtimeConfig};
//!
//! let auth = AuthInfo {
//!     user_id: "25025320".to_string(),
//!     device_id: "2f4b0c1e-9a77-4d0e-8f1a-3c5d7e9f1b2a".to_string(),
//!     password: "sessionid=...".to_string(),
//!     ..Default::default()
//! };
//! let mut client = RealtimeClient::new(RealtimeConfig::new(auth, DeviceInfo::default()));
//! client.start()?;
//! while let Some(event) = client.next_event().await {
//!     match event {
//!         Event::Connected => println!("connected"),
//!         Event::ThreadItemCreated { thread_id, item, .. } => {
//!             println!("{thread_id}: {item}");
//!         }
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod client;
pub mod codec;
pub mod command;
mod connection;
pub mod handler;
pub mod identity;
pub mod message;
pub mod mqtt;
pub mod parser;
pub mod provider;
pub mod subscription;
mod timer;
pub mod topics;
pub mod transport;
mod types;

pub use client::RealtimeClient;
pub use command::{Command, DirectItem};
pub use message::{Message, Module};
pub use mqtt::QoS;
pub use provider::{
    AuthInfo, DeviceInfo, Experiments, MemorySettings, SettingsStore, StaticExperiments,
};
pub use subscription::{Subscription, SubscriptionRegistry};
pub use topics::Topic;
pub use transport::{Connector, TcpConnector, Transport, WsConnector};
pub use types::{
    Ack, ConnectionState, DEFAULT_HOST, DEFAULT_PORT, Error, Event, RealtimeConfig,
    SequencePolicy, TimingConfig,
};
