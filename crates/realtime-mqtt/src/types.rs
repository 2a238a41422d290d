//! Public types for the realtime-mqtt crate.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite;

use crate::mqtt::MqttError;
use crate::provider::{
    AuthInfo, DeviceInfo, Experiments, MemorySettings, SettingsStore, StaticExperiments,
};
use crate::transport::{Connector, WsConnector};

/// Default broker host.
///
/// The default endpoint (MQTToT over `wss://{host}/chat`) is assumed, not
/// broker-verified. Set [`RealtimeConfig::host`] and
/// [`RealtimeConfig::connector`] for the broker you actually target.
pub const DEFAULT_HOST: &str = "edge-chat.instagram.com";
/// Default broker port.
pub const DEFAULT_PORT: u16 = 443;

/// Broker connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ShuttingDown,
}

/// Acknowledgement of an outbound direct command, correlated by
/// `client_context`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub action: Option<String>,
    pub status: String,
    pub status_code: Option<String>,
    pub client_context: Option<String>,
    pub payload: Value,
}

/// Events emitted by a [`RealtimeClient`](crate::RealtimeClient).
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Broker accepted the connection and subscriptions were replayed.
    Connected,
    /// Connection lost; the client reconnects on its own unless stopped.
    Disconnected { reason: Option<String> },
    LiveStarted { broadcast_id: String, broadcast: Value },
    LiveStopped { broadcast_id: String, broadcast: Value },
    DirectStoryCreated { thread_id: String, item: Value },
    DirectStoryUpdated { thread_id: String, item: Value },
    DirectStoryScreenshot { thread_id: String, screenshot: Value },
    DirectStoryAction { thread_id: String, action: Value },
    ThreadCreated { thread_id: String, thread: Value },
    ThreadUpdated { thread_id: String, thread: Value },
    ThreadNotify { thread_id: String, item_id: String, notify: Value },
    ThreadSeen { thread_id: String, user_id: String, seen: Value },
    ThreadActivity { thread_id: String, activity: Value },
    ThreadItemCreated { thread_id: String, item_id: String, item: Value },
    ThreadItemUpdated { thread_id: String, item_id: String, item: Value },
    ThreadItemRemoved { thread_id: String, item_id: String },
    ClientContextAck(Ack),
    UnseenCountUpdate(Value),
    PresenceUpdate(Value),
    /// Incremental sync subscription confirmed from `seq_id`.
    IrisSubscribed { seq_id: Option<i64> },
    /// Broker suggested a datacenter; it is used on the next connect.
    RegionHint(String),
    ZeroProvision(Value),
    /// Recoverable problem (dropped message, failed connect attempt).
    Warning(String),
    /// Broker-reported failure.
    Error { message: String },
}

impl Event {
    /// Stable event name.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Connected => "connected",
            Event::Disconnected { .. } => "disconnected",
            Event::LiveStarted { .. } => "live-started",
            Event::LiveStopped { .. } => "live-stopped",
            Event::DirectStoryCreated { .. } => "direct-story-created",
            Event::DirectStoryUpdated { .. } => "direct-story-updated",
            Event::DirectStoryScreenshot { .. } => "direct-story-screenshot",
            Event::DirectStoryAction { .. } => "direct-story-action",
            Event::ThreadCreated { .. } => "thread-created",
            Event::ThreadUpdated { .. } => "thread-updated",
            Event::ThreadNotify { .. } => "thread-notify",
            Event::ThreadSeen { .. } => "thread-seen",
            Event::ThreadActivity { .. } => "thread-activity",
            Event::ThreadItemCreated { .. } => "thread-item-created",
            Event::ThreadItemUpdated { .. } => "thread-item-updated",
            Event::ThreadItemRemoved { .. } => "thread-item-removed",
            Event::ClientContextAck(_) => "client-context-ack",
            Event::UnseenCountUpdate(_) => "unseen-count-update",
            Event::PresenceUpdate(_) => "presence-update",
            Event::IrisSubscribed { .. } => "iris-subscribed",
            Event::RegionHint(_) => "region-hint",
            Event::ZeroProvision(_) => "zero-provision",
            Event::Warning(_) => "warning",
            Event::Error { .. } => "error",
        }
    }

    /// Status events are never dropped under backpressure.
    pub(crate) fn is_status(&self) -> bool {
        matches!(
            self,
            Event::Connected | Event::Disconnected { .. } | Event::Error { .. }
        )
    }
}

/// How message-sync entries are ordered across frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SequencePolicy {
    /// Keep the order within each frame; frames are handled as they arrive.
    #[default]
    FrameOrder,
    /// Also drop entries whose `seq_id` is not newer than the last one handled
    /// on the current connection.
    DropStale,
}

/// Timeouts and intervals. All fields have defaults via [`Default`].
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Bound on transport connect plus CONNECT/CONNACK handshake.
    pub connect_timeout: Duration,
    /// Force a reconnect when no inbound traffic arrives within this window.
    /// Also advertised as the MQTT keep-alive.
    pub keepalive_interval: Duration,
    /// Send PINGREQ after this much outbound silence.
    pub ping_interval: Duration,
    pub initial_retry_interval: Duration,
    pub max_retry_interval: Duration,
    /// Upper bound of the random delay added to each retry.
    pub max_retry_jitter: Duration,
    pub event_channel_capacity: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(60),
            ping_interval: Duration::from_secs(30),
            initial_retry_interval: Duration::from_secs(1),
            max_retry_interval: Duration::from_secs(60),
            max_retry_jitter: Duration::from_secs(1),
            event_channel_capacity: 64,
        }
    }
}

/// Configuration for [`RealtimeClient::new`](crate::RealtimeClient::new).
pub struct RealtimeConfig {
    pub auth: AuthInfo,
    pub device: DeviceInfo,
    /// Broker host. Defaults to [`DEFAULT_HOST`].
    pub host: String,
    /// Broker port. Defaults to [`DEFAULT_PORT`].
    pub port: u16,
    pub timing: Option<TimingConfig>,
    pub sequence_policy: SequencePolicy,
    pub experiments: Arc<dyn Experiments>,
    pub settings: Arc<dyn SettingsStore>,
    /// Defaults to MQTT over secure WebSocket at `/chat`, an assumed
    /// endpoint; supply your own [`Connector`] for other brokers.
    pub connector: Arc<dyn Connector>,
}

impl RealtimeConfig {
    pub fn new(auth: AuthInfo, device: DeviceInfo) -> Self {
        Self {
            auth,
            device,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            timing: None,
            sequence_policy: SequencePolicy::default(),
            experiments: Arc::new(StaticExperiments::default()),
            settings: Arc::new(MemorySettings::default()),
            connector: Arc::new(WsConnector::default()),
        }
    }
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not connected to the broker")]
    NotConnected,

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("MQTT framing error: {0}")]
    Mqtt(#[from] MqttError),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("broker refused connection: {reason} (code {code})")]
    ConnectionRefused { code: u8, reason: &'static str },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("realtime client task has stopped")]
    ClientGone,
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names() {
        assert_eq!(Event::Connected.name(), "connected");
        assert_eq!(
            Event::ThreadItemRemoved {
                thread_id: "1".into(),
                item_id: "2".into()
            }
            .name(),
            "thread-item-removed"
        );
        assert_eq!(Event::RegionHint("dc2".into()).name(), "region-hint");
        assert_eq!(Event::Warning(String::new()).name(), "warning");
    }

    #[test]
    fn status_events() {
        assert!(Event::Connected.is_status());
        assert!(Event::Disconnected { reason: None }.is_status());
        assert!(!Event::UnseenCountUpdate(Value::Null).is_status());
        assert!(!Event::Warning("x".into()).is_status());
    }

    #[test]
    fn default_timing() {
        let t = TimingConfig::default();
        assert!(t.ping_interval < t.keepalive_interval);
        assert_eq!(t.connect_timeout, Duration::from_secs(5));
        assert_eq!(t.event_channel_capacity, 64);
    }

    #[test]
    fn config_defaults() {
        let config = RealtimeConfig::new(AuthInfo::default(), DeviceInfo::default());
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.port, 443);
        assert!(config.timing.is_none());
        assert_eq!(config.sequence_policy, SequencePolicy::FrameOrder);
    }

    #[test]
    fn ack_serializes_with_payload() {
        let ack = Ack {
            action: Some("item_ack".into()),
            status: "ok".into(),
            status_code: Some("200".into()),
            client_context: Some("ctx".into()),
            payload: serde_json::json!({"item_id": "1"}),
        };
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["payload"]["item_id"], "1");
        assert_eq!(json["status"], "ok");
    }
}
