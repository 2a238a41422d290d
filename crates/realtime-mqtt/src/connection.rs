//! Connection management: broker handshake, keepalive, reconnection, and
//! inbound dispatch.
//!
//! One task owns the transport, the subscription registry, and every timer.
//! The client talks to it through an unbounded request queue; replies travel
//! back on oneshot channels and events on a bounded channel.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use crate::codec;
use crate::command::Command;
use crate::handler::{Effect, HandlerRegistry};
use crate::identity::ConnectIdentity;
use crate::mqtt::{Connect, Packet, Publish, QoS, connack};
use crate::parser::{ParserRegistry, SequenceGate, seq_id};
use crate::provider::{AuthInfo, DeviceInfo, Experiments, SettingsStore, settings};
use crate::subscription::{Subscription, SubscriptionRegistry};
use crate::timer::{Backoff, Timer};
use crate::topics::{self, Topic};
use crate::transport::{Connector, Transport};
use crate::types::{ConnectionState, Error, Event, RealtimeConfig, TimingConfig};

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Requests from [`RealtimeClient`](crate::RealtimeClient) handles.
pub(crate) enum Request {
    Start,
    Stop,
    Send {
        command: Command,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    AddSubscription(Subscription),
    RemoveSubscription(Subscription),
    SetOption {
        key: String,
        value: String,
    },
    State(oneshot::Sender<ConnectionState>),
    Subscriptions(oneshot::Sender<Vec<Subscription>>),
}

// ---------------------------------------------------------------------------
// Event sink
// ---------------------------------------------------------------------------

/// Status events held back while the consumer is behind.
const MAX_PENDING_STATUS: usize = 32;

/// Outbound event channel. Never waits on the consumer: when the channel is
/// full, status events queue here until the run loop sees room again and
/// everything else is dropped.
struct EventSink {
    tx: mpsc::Sender<Event>,
    pending: VecDeque<Event>,
    dropped: u64,
}

impl EventSink {
    fn new(tx: mpsc::Sender<Event>) -> Self {
        Self {
            tx,
            pending: VecDeque::new(),
            dropped: 0,
        }
    }

    fn emit(&mut self, event: Event) {
        if self.pending.is_empty() {
            match self.tx.try_send(event) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(event)) => self.hold(event),
            }
        } else {
            // Keep delivery order behind the queued status events.
            self.hold(event);
        }
    }

    fn hold(&mut self, event: Event) {
        if !event.is_status() {
            self.record_drop(&event);
            return;
        }
        if self.pending.len() >= MAX_PENDING_STATUS
            && let Some(oldest) = self.pending.pop_front()
        {
            self.record_drop(&oldest);
        }
        self.pending.push_back(event);
    }

    fn record_drop(&mut self, event: &Event) {
        self.dropped += 1;
        if self.dropped.is_power_of_two() {
            tracing::warn!(
                dropped = self.dropped,
                event = event.name(),
                "event channel full, dropping events"
            );
        }
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Move queued status events into the channel while it has room.
    /// `open` is false once the consumer is gone.
    fn flush(&mut self, open: bool) {
        if !open {
            self.pending.clear();
            return;
        }
        while let Some(event) = self.pending.pop_front() {
            match self.tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(event)) => {
                    self.pending.push_front(event);
                    return;
                }
                Err(TrySendError::Closed(_)) => {
                    self.pending.clear();
                    return;
                }
            }
        }
    }
}

/// Completes once the channel has room for one event; `false` when closed.
async fn has_room(tx: &mpsc::Sender<Event>) -> bool {
    tx.reserve().await.is_ok()
}

// ---------------------------------------------------------------------------
// Connection manager
// ---------------------------------------------------------------------------

pub(crate) struct ConnectionManager {
    requests: mpsc::UnboundedReceiver<Request>,
    events: EventSink,
    state: ConnectionState,
    shutting_down: bool,
    auth: AuthInfo,
    device: DeviceInfo,
    experiments: Arc<dyn Experiments>,
    settings: Arc<dyn SettingsStore>,
    connector: Arc<dyn Connector>,
    host: String,
    port: u16,
    timing: TimingConfig,
    /// Additional connect options, read on every connect.
    options: HashMap<String, String>,
    registry: SubscriptionRegistry,
    parsers: ParserRegistry,
    handlers: HandlerRegistry,
    transport: Option<Transport>,
    keepalive: Timer,
    ping: Timer,
    reconnect: Timer,
    backoff: Backoff,
    next_packet_id: u16,
    sync_gate: SequenceGate,
}

impl ConnectionManager {
    pub(crate) fn new(
        config: RealtimeConfig,
        requests: mpsc::UnboundedReceiver<Request>,
        events: mpsc::Sender<Event>,
    ) -> Self {
        if !topics::verify_mapping() {
            tracing::error!("topic mapping is not a bijection; some frames will be misrouted");
        }
        let timing = config.timing.unwrap_or_default();
        let registry = SubscriptionRegistry::from_experiments(
            &config.auth,
            config.experiments.as_ref(),
            config.settings.as_ref(),
        );
        let mut options = HashMap::new();
        if let Some(datacenter) = config.settings.get(settings::DATACENTER) {
            options.insert(settings::DATACENTER.to_string(), datacenter);
        }
        let backoff = Backoff::new(
            timing.initial_retry_interval,
            timing.max_retry_interval,
            timing.max_retry_jitter,
        );
        Self {
            requests,
            events: EventSink::new(events),
            state: ConnectionState::Disconnected,
            shutting_down: false,
            auth: config.auth,
            device: config.device,
            experiments: config.experiments,
            settings: config.settings,
            connector: config.connector,
            host: config.host,
            port: config.port,
            timing,
            options,
            registry,
            parsers: ParserRegistry::new(),
            handlers: HandlerRegistry::new(),
            transport: None,
            keepalive: Timer::default(),
            ping: Timer::default(),
            reconnect: Timer::default(),
            backoff,
            next_packet_id: 0,
            sync_gate: SequenceGate::new(config.sequence_policy),
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => {
                        tracing::debug!("all client handles dropped");
                        self.stop().await;
                        return;
                    }
                },

                open = has_room(&self.events.tx), if self.events.has_pending() => {
                    self.events.flush(open);
                }

                packet = next_packet(&mut self.transport) => self.handle_packet(packet).await,

                () = self.keepalive.fired() => {
                    tracing::warn!("keepalive timeout, forcing disconnect");
                    self.keepalive.cancel();
                    self.transport = None;
                    self.on_close(Some("keepalive timeout".to_string()));
                }

                () = self.ping.fired() => self.send_ping().await,

                () = self.reconnect.fired() => {
                    self.reconnect.cancel();
                    self.connect().await;
                }
            }
        }
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Start => self.start(),
            Request::Stop => self.stop().await,
            Request::Send { command, reply } => {
                let result = self.send_command(command).await;
                let _ = reply.send(result);
            }
            Request::AddSubscription(sub) => {
                if let Some(command) = self.registry.add(sub) {
                    self.publish_if_connected(command).await;
                }
            }
            Request::RemoveSubscription(sub) => {
                if let Some(command) = self.registry.remove(&sub) {
                    self.publish_if_connected(command).await;
                }
            }
            Request::SetOption { key, value } => {
                tracing::debug!(%key, %value, "connect option set");
                self.options.insert(key, value);
            }
            Request::State(reply) => {
                let _ = reply.send(self.state);
            }
            Request::Subscriptions(reply) => {
                let _ = reply.send(self.registry.iter().cloned().collect());
            }
        }
    }

    // --- Lifecycle ---

    fn start(&mut self) {
        self.shutting_down = false;
        if matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            return;
        }
        tracing::info!(host = %self.host, port = self.port, "starting realtime client");
        self.state = ConnectionState::Disconnected;
        self.backoff.reset();
        self.reconnect.arm(Duration::ZERO);
    }

    async fn stop(&mut self) {
        if self.shutting_down && self.state == ConnectionState::ShuttingDown {
            return;
        }
        self.shutting_down = true;
        self.reconnect.cancel();
        self.keepalive.cancel();
        self.ping.cancel();
        if let Some(mut transport) = self.transport.take() {
            let goodbye = async {
                transport.sink.send(Packet::Disconnect).await?;
                transport.sink.close().await?;
                Ok::<_, Error>(())
            };
            if let Err(e) = tokio::time::timeout(DISCONNECT_TIMEOUT, goodbye)
                .await
                .unwrap_or(Err(Error::Timeout("disconnect")))
            {
                tracing::debug!(error = %e, "DISCONNECT not delivered");
            }
            self.events
                .emit(Event::Disconnected {
                    reason: Some("stopped".to_string()),
                });
        }
        self.state = ConnectionState::ShuttingDown;
        tracing::info!("realtime client stopped");
    }

    async fn connect(&mut self) {
        if self.shutting_down || self.state == ConnectionState::Connected {
            return;
        }
        self.state = ConnectionState::Connecting;
        tracing::info!(
            host = %self.host,
            port = self.port,
            attempt = self.backoff.attempt(),
            "connecting to broker"
        );
        let connect = match self.connect_packet() {
            Ok(connect) => connect,
            Err(e) => {
                self.on_connect_failed(e);
                return;
            }
        };
        let connector = Arc::clone(&self.connector);
        let attempt = handshake(
            connector.as_ref(),
            &self.host,
            self.port,
            self.timing.connect_timeout,
            connect,
        );
        match tokio::time::timeout(self.timing.connect_timeout, attempt).await {
            Ok(Ok(transport)) => self.on_connected(transport).await,
            Ok(Err(e)) => self.on_connect_failed(e),
            Err(_) => self.on_connect_failed(Error::Timeout("broker handshake")),
        }
    }

    /// CONNECT carrying the compressed identity for this attempt.
    fn connect_packet(&self) -> Result<Connect, Error> {
        let identity = ConnectIdentity::build(
            &self.auth,
            &self.device,
            self.experiments.as_ref(),
            &self.options,
        )?;
        let payload = codec::encode_json(&identity)?;
        let keep_alive = u16::try_from(self.timing.keepalive_interval.as_secs()).unwrap_or(u16::MAX);
        Ok(Connect::mqttot(keep_alive, payload))
    }

    async fn on_connected(&mut self, transport: Transport) {
        self.transport = Some(transport);
        self.state = ConnectionState::Connected;
        self.reconnect.cancel();
        self.backoff.reset();
        self.sync_gate.reset();
        self.keepalive.arm(self.timing.keepalive_interval);
        self.ping.arm(self.timing.ping_interval);
        tracing::info!(subscriptions = self.registry.len(), "connected to broker");
        self.events.emit(Event::Connected);

        for command in self.registry.resubscribe_commands() {
            let topic = command.topic;
            if let Err(e) = self.send_command(command).await {
                tracing::warn!(%topic, error = %e, "resubscribe failed");
                break;
            }
        }
    }

    fn on_connect_failed(&mut self, error: Error) {
        tracing::warn!(error = %error, attempt = self.backoff.attempt(), "connect failed");
        self.state = if self.shutting_down {
            ConnectionState::ShuttingDown
        } else {
            ConnectionState::Disconnected
        };
        self.events
            .emit(Event::Warning(format!("connect failed: {error}")));
        self.schedule_reconnect();
    }

    /// Shared by broker close, stream errors, write failures, and keepalive
    /// expiry.
    fn on_close(&mut self, reason: Option<String>) {
        self.keepalive.cancel();
        self.ping.cancel();
        self.transport = None;
        if self.shutting_down {
            self.state = ConnectionState::ShuttingDown;
            return;
        }
        tracing::info!(reason = reason.as_deref().unwrap_or("unknown"), "disconnected");
        self.state = ConnectionState::Disconnected;
        self.events.emit(Event::Disconnected { reason });
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.shutting_down {
            return;
        }
        let delay = self.backoff.next_delay();
        tracing::debug!(?delay, attempt = self.backoff.attempt(), "reconnect scheduled");
        self.reconnect.arm(delay);
    }

    // --- Outbound ---

    pub(crate) async fn send_command(&mut self, command: Command) -> Result<(), Error> {
        if self.state != ConnectionState::Connected || self.transport.is_none() {
            return Err(Error::NotConnected);
        }
        let payload = codec::encode_json(&command.payload)?;
        let packet_id = match command.qos {
            QoS::AtLeastOnce => Some(self.next_packet_id()),
            QoS::AtMostOnce => None,
        };
        let publish = Publish {
            topic: command.topic.wire_topic(),
            qos: command.qos,
            packet_id,
            retain: false,
            dup: false,
            payload: payload.into(),
        };
        self.write(Packet::Publish(publish)).await?;
        tracing::trace!(topic = %command.topic, ?packet_id, "published");
        self.keepalive.arm(self.timing.keepalive_interval);
        self.ping.arm(self.timing.ping_interval);
        Ok(())
    }

    async fn publish_if_connected(&mut self, command: Command) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let topic = command.topic;
        if let Err(e) = self.send_command(command).await {
            tracing::warn!(%topic, error = %e, "subscription update not sent");
        }
    }

    async fn send_ping(&mut self) {
        self.ping.arm(self.timing.ping_interval);
        if let Err(e) = self.write(Packet::PingReq).await {
            tracing::debug!(error = %e, "PINGREQ failed");
        }
    }

    /// Write one packet. A failed write closes the connection.
    async fn write(&mut self, packet: Packet) -> Result<(), Error> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(Error::NotConnected);
        };
        let name = packet.name();
        let result = transport.sink.send(packet).await;
        if let Err(e) = &result {
            tracing::warn!(packet = name, error = %e, "write failed");
            self.on_close(Some(e.to_string()));
        }
        result
    }

    fn next_packet_id(&mut self) -> u16 {
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        if self.next_packet_id == 0 {
            self.next_packet_id = 1;
        }
        self.next_packet_id
    }

    // --- Inbound ---

    async fn handle_packet(&mut self, packet: Option<Result<Packet, Error>>) {
        match packet {
            Some(Ok(Packet::Publish(publish))) => {
                self.keepalive.arm(self.timing.keepalive_interval);
                if publish.qos == QoS::AtLeastOnce
                    && let Some(packet_id) = publish.packet_id
                    && self.write(Packet::PubAck { packet_id }).await.is_err()
                {
                    return;
                }
                self.dispatch(&publish.topic, &publish.payload);
            }
            Some(Ok(Packet::PingResp | Packet::PubAck { .. })) => {
                self.keepalive.arm(self.timing.keepalive_interval);
            }
            Some(Ok(Packet::Disconnect)) => {
                self.on_close(Some("broker sent DISCONNECT".to_string()));
            }
            Some(Ok(other)) => {
                tracing::debug!(packet = other.name(), "ignoring unexpected packet");
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "transport error");
                self.on_close(Some(e.to_string()));
            }
            None => {
                self.on_close(Some("connection closed by broker".to_string()));
            }
        }
    }

    fn dispatch(&mut self, wire_topic: &str, payload: &[u8]) {
        let inflated = match codec::decompress(payload) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(topic = wire_topic, error = %e, "dropping frame that failed to inflate");
                return;
            }
        };
        let Some(topic) = Topic::from_wire_topic(wire_topic) else {
            tracing::warn!(topic = wire_topic, "dropping frame for unknown topic");
            return;
        };
        let Some(parser) = self.parsers.get(topic) else {
            tracing::warn!(%topic, "no parser for topic");
            return;
        };
        let messages = match parser.parse(topic, &inflated) {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(%topic, error = %e, "dropping undecodable frame");
                return;
            }
        };
        tracing::trace!(%topic, messages = messages.len(), "frame decoded");

        for message in messages {
            if topic == Topic::MessageSync
                && let Some(seq) = seq_id(&message.data)
                && !self.sync_gate.admit(seq)
            {
                tracing::debug!(seq, "dropping stale sync entry");
                continue;
            }
            match self.handlers.handle(&message) {
                None => tracing::warn!(module = %message.module, "no handler for module"),
                Some(Ok((events, effects))) => {
                    for effect in effects {
                        self.apply_effect(effect);
                    }
                    for event in events {
                        self.events.emit(event);
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(module = %message.module, error = %e, "handler failed");
                    self.events
                        .emit(Event::Warning(format!(
                            "dropped {} message: {e}",
                            message.module
                        )));
                }
            }
        }
    }

    fn apply_effect(&mut self, effect: Effect) {
        match effect {
            Effect::PreferRegion(datacenter) => {
                tracing::info!(%datacenter, "broker suggested datacenter");
                self.settings.set(settings::DATACENTER, &datacenter);
                self.options
                    .insert(settings::DATACENTER.to_string(), datacenter);
            }
        }
    }
}

/// Open the transport, send CONNECT, and wait for an accepting CONNACK.
async fn handshake(
    connector: &dyn Connector,
    host: &str,
    port: u16,
    timeout: Duration,
    connect: Connect,
) -> Result<Transport, Error> {
    let mut transport = connector.connect(host, port, timeout).await?;
    transport.sink.send(Packet::Connect(connect)).await?;

    loop {
        match transport.stream.next().await {
            Some(Ok(Packet::ConnAck(ack))) if ack.return_code == connack::ACCEPTED => {
                return Ok(transport);
            }
            Some(Ok(Packet::ConnAck(ack))) => {
                return Err(Error::ConnectionRefused {
                    code: ack.return_code,
                    reason: connack::describe(ack.return_code),
                });
            }
            Some(Ok(other)) => {
                tracing::debug!(packet = other.name(), "ignoring packet before CONNACK");
            }
            Some(Err(e)) => return Err(e),
            None => return Err(Error::Protocol("broker closed before CONNACK".to_string())),
        }
    }
}

async fn next_packet(transport: &mut Option<Transport>) -> Option<Result<Packet, Error>> {
    match transport {
        Some(transport) => transport.stream.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_sink_drops_non_status_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut sink = EventSink::new(tx);
        sink.emit(Event::Warning("a".into()));
        sink.emit(Event::Warning("b".into()));
        assert_eq!(sink.dropped, 1);
        assert!(!sink.has_pending());
        assert_eq!(rx.recv().await, Some(Event::Warning("a".into())));

        sink.emit(Event::Connected);
        assert_eq!(rx.recv().await, Some(Event::Connected));
    }

    #[tokio::test]
    async fn event_sink_queues_status_without_waiting() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut sink = EventSink::new(tx);
        sink.emit(Event::Warning("a".into()));
        sink.emit(Event::Disconnected { reason: None });
        sink.emit(Event::Warning("b".into()));
        sink.emit(Event::Connected);
        assert!(sink.has_pending());
        assert_eq!(sink.dropped, 1);

        assert_eq!(rx.recv().await, Some(Event::Warning("a".into())));
        assert!(has_room(&sink.tx).await);
        sink.flush(true);
        assert_eq!(rx.recv().await, Some(Event::Disconnected { reason: None }));
        assert!(sink.has_pending());
        sink.flush(true);
        assert_eq!(rx.recv().await, Some(Event::Connected));
        assert!(!sink.has_pending());
    }

    #[test]
    fn event_sink_caps_queued_status() {
        let (tx, _rx) = mpsc::channel(1);
        let mut sink = EventSink::new(tx);
        sink.emit(Event::Connected);
        for _ in 0..MAX_PENDING_STATUS + 3 {
            sink.emit(Event::Disconnected { reason: None });
        }
        assert_eq!(sink.pending.len(), MAX_PENDING_STATUS);
        assert_eq!(sink.dropped, 3);
    }

    #[tokio::test]
    async fn event_sink_ignores_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut sink = EventSink::new(tx);
        sink.emit(Event::Connected);
        sink.emit(Event::Warning("x".into()));
        assert_eq!(sink.dropped, 0);
        assert!(!sink.has_pending());
        assert!(!has_room(&sink.tx).await);
    }

    #[test]
    fn packet_ids_skip_zero() {
        let (_tx, requests) = mpsc::unbounded_channel();
        let (events, _rx) = mpsc::channel(1);
        let config = RealtimeConfig::new(AuthInfo::default(), DeviceInfo::default());
        let mut manager = ConnectionManager::new(config, requests, events);
        manager.next_packet_id = u16::MAX;
        assert_eq!(manager.next_packet_id(), 1);
        assert_eq!(manager.next_packet_id(), 2);
    }

    #[tokio::test]
    async fn send_requires_connection() {
        let (_tx, requests) = mpsc::unbounded_channel();
        let (events, _rx) = mpsc::channel(1);
        let config = RealtimeConfig::new(AuthInfo::default(), DeviceInfo::default());
        let mut manager = ConnectionManager::new(config, requests, events);
        let result = manager
            .send_command(Command::mark_seen("t", "i"))
            .await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn region_hint_effect_persists() {
        let (_tx, requests) = mpsc::unbounded_channel();
        let (events, _rx) = mpsc::channel(1);
        let store = Arc::new(crate::provider::MemorySettings::default());
        let mut config = RealtimeConfig::new(AuthInfo::default(), DeviceInfo::default());
        config.settings = store.clone();
        let mut manager = ConnectionManager::new(config, requests, events);
        manager.apply_effect(Effect::PreferRegion("ATN".into()));
        assert_eq!(manager.options.get(settings::DATACENTER).map(String::as_str), Some("ATN"));
        assert_eq!(store.get(settings::DATACENTER).as_deref(), Some("ATN"));
    }
}
