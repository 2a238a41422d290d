//! Public entry point: [`RealtimeClient`].

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot};

use crate::command::{Command, DirectItem};
use crate::connection::{ConnectionManager, Request};
use crate::provider::{Experiments, flags};
use crate::subscription::Subscription;
use crate::types::{ConnectionState, Error, Event, RealtimeConfig, TimingConfig};

/// Handle to a realtime connection.
///
/// Construction spawns a background task that owns the broker connection.
/// Call [`start`](RealtimeClient::start) to connect and
/// [`next_event`](RealtimeClient::next_event) to receive [`Event`]s. The
/// task reconnects on its own until [`stop`](RealtimeClient::stop) is called
/// or the client is dropped.
///
/// The task never waits for the consumer. If events are not read, non-status
/// events are dropped and status events are held back until there is room.
pub struct RealtimeClient {
    requests: mpsc::UnboundedSender<Request>,
    events: mpsc::Receiver<Event>,
    experiments: Arc<dyn Experiments>,
}

impl RealtimeClient {
    /// Spawn the connection task. Must be called from within a Tokio runtime.
    /// No connection is attempted until [`start`](Self::start).
    pub fn new(config: RealtimeConfig) -> Self {
        let capacity = config
            .timing
            .as_ref()
            .map_or_else(
                || TimingConfig::default().event_channel_capacity,
                |t| t.event_channel_capacity,
            )
            .max(1);
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let experiments = Arc::clone(&config.experiments);
        let manager = ConnectionManager::new(config, request_rx, event_tx);
        tokio::spawn(manager.run());
        Self {
            requests: request_tx,
            events: event_rx,
            experiments,
        }
    }

    fn request(&self, request: Request) -> Result<(), Error> {
        self.requests.send(request).map_err(|_| Error::ClientGone)
    }

    async fn ask<T>(&self, request: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T, Error> {
        let (tx, rx) = oneshot::channel();
        self.request(request(tx))?;
        rx.await.map_err(|_| Error::ClientGone)
    }

    // --- Lifecycle ---

    /// Begin connecting. No-op while already connecting or connected.
    pub fn start(&self) -> Result<(), Error> {
        self.request(Request::Start)
    }

    /// Disconnect and stop reconnecting until the next [`start`](Self::start).
    pub fn stop(&self) -> Result<(), Error> {
        self.request(Request::Stop)
    }

    pub async fn state(&self) -> Result<ConnectionState, Error> {
        self.ask(Request::State).await
    }

    /// Receive the next event. Returns `None` once the background task has
    /// exited.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    // --- Subscriptions ---

    /// Add `sub` to the registry; published immediately when connected and
    /// replayed on every reconnect.
    pub fn add_subscription(&self, sub: Subscription) -> Result<(), Error> {
        self.request(Request::AddSubscription(sub))
    }

    pub fn remove_subscription(&self, sub: Subscription) -> Result<(), Error> {
        self.request(Request::RemoveSubscription(sub))
    }

    /// Set a connect option (for example `datacenter`), used from the next
    /// connect on.
    pub fn set_additional_option(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), Error> {
        self.request(Request::SetOption {
            key: key.into(),
            value: value.into(),
        })
    }

    pub async fn subscriptions(&self) -> Result<Vec<Subscription>, Error> {
        self.ask(Request::Subscriptions).await
    }

    // --- Commands ---

    /// Publish `command`. Fails with [`Error::NotConnected`] without writing
    /// anything unless the broker connection is up.
    pub async fn send_command(&self, command: Command) -> Result<(), Error> {
        self.ask(|reply| Request::Send { command, reply }).await?
    }

    /// Publish a direct command and return its client context, or `None` if
    /// it could not be sent.
    async fn send_direct(&self, command: Command) -> Option<String> {
        let context = command.client_context.clone();
        match self.send_command(command).await {
            Ok(()) => context,
            Err(e) => {
                tracing::warn!(error = %e, "direct command not sent");
                None
            }
        }
    }

    pub async fn mark_direct_item_seen(&self, thread_id: &str, item_id: &str) -> Option<String> {
        self.send_direct(Command::mark_seen(thread_id, item_id)).await
    }

    pub async fn indicate_activity_in_direct_thread(
        &self,
        thread_id: &str,
        is_active: bool,
    ) -> Option<String> {
        self.send_direct(Command::indicate_activity(thread_id, is_active))
            .await
    }

    pub async fn send_text_to_direct(&self, thread_id: &str, text: &str) -> Option<String> {
        self.send_item(
            thread_id,
            DirectItem::Text {
                text: text.to_string(),
            },
        )
        .await
    }

    pub async fn send_like_to_direct(&self, thread_id: &str) -> Option<String> {
        self.send_item(thread_id, DirectItem::Like).await
    }

    pub async fn send_post_to_direct(&self, thread_id: &str, media_id: &str) -> Option<String> {
        self.send_item(
            thread_id,
            DirectItem::Post {
                media_id: media_id.to_string(),
            },
        )
        .await
    }

    pub async fn send_story_to_direct(&self, thread_id: &str, story_id: &str) -> Option<String> {
        self.send_item(
            thread_id,
            DirectItem::Story {
                story_id: story_id.to_string(),
            },
        )
        .await
    }

    pub async fn send_profile_to_direct(&self, thread_id: &str, user_id: &str) -> Option<String> {
        self.send_item(
            thread_id,
            DirectItem::Profile {
                user_id: user_id.to_string(),
            },
        )
        .await
    }

    pub async fn send_location_to_direct(
        &self,
        thread_id: &str,
        venue_id: &str,
    ) -> Option<String> {
        self.send_item(
            thread_id,
            DirectItem::Location {
                venue_id: venue_id.to_string(),
            },
        )
        .await
    }

    pub async fn send_hashtag_to_direct(&self, thread_id: &str, hashtag: &str) -> Option<String> {
        self.send_item(
            thread_id,
            DirectItem::Hashtag {
                hashtag: hashtag.to_string(),
            },
        )
        .await
    }

    /// Like an item. Refused unless reactions are enabled for this account.
    pub async fn send_reaction_to_direct(&self, thread_id: &str, item_id: &str) -> Option<String> {
        self.react(thread_id, item_id, true).await
    }

    pub async fn delete_reaction_from_direct(
        &self,
        thread_id: &str,
        item_id: &str,
    ) -> Option<String> {
        self.react(thread_id, item_id, false).await
    }

    async fn react(&self, thread_id: &str, item_id: &str, add: bool) -> Option<String> {
        if !flags::REACTIONS.enabled(self.experiments.as_ref()) {
            tracing::debug!("reactions are disabled");
            return None;
        }
        self.send_item(
            thread_id,
            DirectItem::Reaction {
                item_id: item_id.to_string(),
                add,
            },
        )
        .await
    }

    async fn send_item(&self, thread_id: &str, item: DirectItem) -> Option<String> {
        self.send_direct(Command::send_item(thread_id, item)).await
    }

    /// Ask for message-sync entries after `seq_id`. Returns `false` when the
    /// sync channel is disabled or the request could not be sent.
    pub async fn receive_offline_messages(&self, seq_id: i64) -> bool {
        if !flags::IRIS.enabled(self.experiments.as_ref()) {
            tracing::debug!("message sync is disabled");
            return false;
        }
        match self
            .send_command(Command::iris_subscribe(seq_id, now_ms()))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(seq_id, error = %e, "message sync subscribe not sent");
                false
            }
        }
    }
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient").finish_non_exhaustive()
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}
