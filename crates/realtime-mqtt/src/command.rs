//! Outbound commands.
//!
//! A [`Command`] is the unit the connection manager publishes: a JSON payload
//! bound to a topic and QoS. Constructors here build the payload shapes the
//! broker expects for subscription updates, incremental sync, and direct
//! messaging.

use serde_json::{Map, Value, json};

use crate::mqtt::QoS;
use crate::topics::Topic;

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub topic: Topic,
    pub qos: QoS,
    pub payload: Value,
    /// Correlation id echoed back in the broker's acknowledgement.
    pub client_context: Option<String>,
}

impl Command {
    pub fn new(topic: Topic, qos: QoS, payload: Value) -> Self {
        Self {
            topic,
            qos,
            payload,
            client_context: None,
        }
    }

    /// Update-subscriptions payload on `topic`. Empty lists are omitted.
    pub fn update_subscriptions(topic: Topic, sub: Vec<String>, unsub: Vec<String>) -> Self {
        let mut payload = Map::new();
        if !sub.is_empty() {
            payload.insert("sub".into(), json!(sub));
        }
        if !unsub.is_empty() {
            payload.insert("unsub".into(), json!(unsub));
        }
        Self::new(topic, QoS::AtLeastOnce, Value::Object(payload))
    }

    /// Ask the broker to stream message-sync entries newer than `seq_id`.
    pub fn iris_subscribe(seq_id: i64, snapshot_at_ms: i64) -> Self {
        Self::new(
            Topic::IrisSub,
            QoS::AtLeastOnce,
            json!({
                "seq_id": seq_id,
                "snapshot_at_ms": snapshot_at_ms,
            }),
        )
    }

    /// Send an item to a direct thread.
    pub fn send_item(thread_id: &str, item: DirectItem) -> Self {
        let context = new_client_context();
        let mut payload = Map::new();
        payload.insert("action".into(), json!("send_item"));
        payload.insert("thread_id".into(), json!(thread_id));
        payload.insert("client_context".into(), json!(context));
        payload.insert("item_type".into(), json!(item.item_type()));
        item.write_fields(&mut payload);
        Self {
            topic: Topic::SendMessage,
            qos: QoS::AtLeastOnce,
            payload: Value::Object(payload),
            client_context: Some(context),
        }
    }

    pub fn mark_seen(thread_id: &str, item_id: &str) -> Self {
        let context = new_client_context();
        Self {
            topic: Topic::SendMessage,
            qos: QoS::AtLeastOnce,
            payload: json!({
                "action": "mark_seen",
                "thread_id": thread_id,
                "item_id": item_id,
                "client_context": context,
            }),
            client_context: Some(context),
        }
    }

    /// Typing indicator, published at QoS 0.
    pub fn indicate_activity(thread_id: &str, active: bool) -> Self {
        let context = new_client_context();
        Self {
            topic: Topic::SendMessage,
            qos: QoS::AtMostOnce,
            payload: json!({
                "action": "indicate_activity",
                "thread_id": thread_id,
                "activity_status": if active { "1" } else { "0" },
                "client_context": context,
            }),
            client_context: Some(context),
        }
    }
}

fn new_client_context() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Item kinds that can be sent to a direct thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectItem {
    Text { text: String },
    Like,
    Post { media_id: String },
    Story { story_id: String },
    Profile { user_id: String },
    Location { venue_id: String },
    Hashtag { hashtag: String },
    Reaction { item_id: String, add: bool },
}

impl DirectItem {
    pub fn item_type(&self) -> &'static str {
        match self {
            DirectItem::Text { .. } => "text",
            DirectItem::Like => "like",
            DirectItem::Post { .. } => "media_share",
            DirectItem::Story { .. } => "story_share",
            DirectItem::Profile { .. } => "profile",
            DirectItem::Location { .. } => "location",
            DirectItem::Hashtag { .. } => "hashtag",
            DirectItem::Reaction { .. } => "reaction",
        }
    }

    fn write_fields(self, payload: &mut Map<String, Value>) {
        match self {
            DirectItem::Text { text } => {
                payload.insert("text".into(), json!(text));
            }
            DirectItem::Like => {}
            DirectItem::Post { media_id } => {
                payload.insert("media_id".into(), json!(media_id));
            }
            DirectItem::Story { story_id } => {
                payload.insert("item_id".into(), json!(story_id));
            }
            DirectItem::Profile { user_id } => {
                payload.insert("profile_user_id".into(), json!(user_id));
            }
            DirectItem::Location { venue_id } => {
                payload.insert("venue_id".into(), json!(venue_id));
            }
            DirectItem::Hashtag { hashtag } => {
                payload.insert("item_id".into(), json!(hashtag));
            }
            DirectItem::Reaction { item_id, add } => {
                payload.insert("item_id".into(), json!(item_id));
                payload.insert("node_type".into(), json!("item"));
                payload.insert("reaction_type".into(), json!("like"));
                payload.insert(
                    "reaction_status".into(),
                    json!(if add { "created" } else { "deleted" }),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_subscriptions_omits_empty_lists() {
        let cmd = Command::update_subscriptions(Topic::Pubsub, vec!["ig/u/v1/1".into()], vec![]);
        assert_eq!(cmd.topic, Topic::Pubsub);
        assert_eq!(cmd.qos, QoS::AtLeastOnce);
        assert_eq!(cmd.payload, json!({"sub": ["ig/u/v1/1"]}));

        let cmd = Command::update_subscriptions(Topic::Pubsub, vec![], vec!["x".into()]);
        assert_eq!(cmd.payload, json!({"unsub": ["x"]}));
        assert!(cmd.client_context.is_none());
    }

    #[test]
    fn send_text_carries_context() {
        let cmd = Command::send_item(
            "340282366841710300949128",
            DirectItem::Text {
                text: "hi".into(),
            },
        );
        assert_eq!(cmd.topic, Topic::SendMessage);
        let context = cmd.client_context.clone().unwrap();
        assert_eq!(cmd.payload["client_context"], json!(context));
        assert_eq!(cmd.payload["action"], "send_item");
        assert_eq!(cmd.payload["item_type"], "text");
        assert_eq!(cmd.payload["text"], "hi");
        assert!(uuid::Uuid::parse_str(&context).is_ok());
    }

    #[test]
    fn contexts_are_unique() {
        let a = Command::send_item("t", DirectItem::Like);
        let b = Command::send_item("t", DirectItem::Like);
        assert_ne!(a.client_context, b.client_context);
    }

    #[test]
    fn reaction_fields() {
        let cmd = Command::send_item(
            "t",
            DirectItem::Reaction {
                item_id: "i".into(),
                add: false,
            },
        );
        assert_eq!(cmd.payload["item_type"], "reaction");
        assert_eq!(cmd.payload["node_type"], "item");
        assert_eq!(cmd.payload["reaction_status"], "deleted");
        assert_eq!(cmd.payload["item_id"], "i");
    }

    #[test]
    fn indicate_activity_is_fire_and_forget() {
        let cmd = Command::indicate_activity("t", true);
        assert_eq!(cmd.qos, QoS::AtMostOnce);
        assert_eq!(cmd.payload["activity_status"], "1");
        assert_eq!(Command::indicate_activity("t", false).payload["activity_status"], "0");
    }

    #[test]
    fn iris_subscribe_payload() {
        let cmd = Command::iris_subscribe(42, 1_700_000_000_000);
        assert_eq!(cmd.topic, Topic::IrisSub);
        assert_eq!(cmd.payload, json!({"seq_id": 42, "snapshot_at_ms": 1_700_000_000_000i64}));
    }
}
