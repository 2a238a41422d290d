//! Subscription registry.
//!
//! The registry is the authoritative set of `(topic, id)` subscriptions. Every
//! mutation returns the delta command to publish; a fresh connection replays
//! the whole set with [`SubscriptionRegistry::resubscribe_commands`].

use std::collections::BTreeMap;

use serde_json::json;

use crate::command::Command;
use crate::provider::{AuthInfo, Experiments, SettingsStore, flags, settings};
use crate::topics::Topic;

const APP_PRESENCE_QUERY: &str = "17846944882223835";
const ZERO_PROVISION_QUERY: &str = "17913953740109069";

/// A single broker subscription. Identity is `(topic, id)`; `wire` is the
/// string sent in update-subscriptions payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: Topic,
    pub id: String,
    wire: String,
}

impl Subscription {
    pub fn new(topic: Topic, id: impl Into<String>, wire: impl Into<String>) -> Self {
        Self {
            topic,
            id: id.into(),
            wire: wire.into(),
        }
    }

    /// Live broadcast start/end notifications for `user_id`.
    pub fn live(user_id: &str) -> Self {
        Self::new(
            Topic::Pubsub,
            "live",
            format!("ig/live_notification_subscribe/{user_id}"),
        )
    }

    /// Direct inbox updates for `user_id`.
    pub fn direct(user_id: &str) -> Self {
        Self::new(Topic::Pubsub, "direct", format!("ig/u/v1/{user_id}"))
    }

    pub fn app_presence(subscription_id: &str) -> Self {
        Self::new(
            Topic::RealtimeSub,
            "presence",
            graphql_subscription(
                APP_PRESENCE_QUERY,
                json!({"input_data": {"client_subscription_id": subscription_id}}),
            ),
        )
    }

    pub fn zero_provision(device_id: &str, subscription_id: &str) -> Self {
        Self::new(
            Topic::RealtimeSub,
            "zero_provision",
            graphql_subscription(
                ZERO_PROVISION_QUERY,
                json!({
                    "input_data": {
                        "client_subscription_id": subscription_id,
                        "device_id": device_id,
                    }
                }),
            ),
        )
    }

    pub fn wire(&self) -> &str {
        &self.wire
    }
}

fn graphql_subscription(query_id: &str, input: serde_json::Value) -> String {
    format!("1/graphqlsubscriptions/{query_id}/{input}")
}

/// Ordered set of active subscriptions, grouped by topic.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionRegistry {
    topics: BTreeMap<Topic, BTreeMap<String, Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initial set for a session: direct always, the others behind their
    /// feature flags.
    pub fn from_experiments(
        auth: &AuthInfo,
        experiments: &dyn Experiments,
        store: &dyn SettingsStore,
    ) -> Self {
        let mut registry = Self::new();
        if flags::LIVE_EVENTS.enabled(experiments) {
            registry.add(Subscription::live(&auth.user_id));
        }
        registry.add(Subscription::direct(&auth.user_id));
        let presence_disabled = store
            .get(settings::PRESENCE_DISABLED)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        if flags::APP_PRESENCE.enabled(experiments) && !presence_disabled {
            registry.add(Subscription::app_presence(&new_subscription_id()));
        }
        if flags::ZERO_PROVISION.enabled(experiments) {
            registry.add(Subscription::zero_provision(
                &auth.device_id,
                &new_subscription_id(),
            ));
        }
        registry
    }

    /// Insert `sub`. Returns the delta command, or `None` when `(topic, id)`
    /// is already present.
    pub fn add(&mut self, sub: Subscription) -> Option<Command> {
        let by_id = self.topics.entry(sub.topic).or_default();
        if by_id.contains_key(&sub.id) {
            return None;
        }
        let command = Command::update_subscriptions(sub.topic, vec![sub.wire.clone()], vec![]);
        by_id.insert(sub.id.clone(), sub);
        Some(command)
    }

    /// Remove the subscription matching `(sub.topic, sub.id)`. Returns the
    /// unsubscribe delta built from the stored wire string, or `None` when
    /// absent.
    pub fn remove(&mut self, sub: &Subscription) -> Option<Command> {
        let by_id = self.topics.get_mut(&sub.topic)?;
        let removed = by_id.remove(&sub.id)?;
        if by_id.is_empty() {
            self.topics.remove(&sub.topic);
        }
        Some(Command::update_subscriptions(
            removed.topic,
            vec![],
            vec![removed.wire],
        ))
    }

    /// One full update-subscriptions command per non-empty topic.
    pub fn resubscribe_commands(&self) -> Vec<Command> {
        self.topics
            .iter()
            .filter(|(_, by_id)| !by_id.is_empty())
            .map(|(topic, by_id)| {
                let sub = by_id.values().map(|s| s.wire.clone()).collect();
                Command::update_subscriptions(*topic, sub, vec![])
            })
            .collect()
    }

    pub fn contains(&self, topic: Topic, id: &str) -> bool {
        self.topics
            .get(&topic)
            .is_some_and(|by_id| by_id.contains_key(id))
    }

    pub fn len(&self) -> usize {
        self.topics.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.topics.values().flat_map(BTreeMap::values)
    }
}

fn new_subscription_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MemorySettings, StaticExperiments};

    fn auth() -> AuthInfo {
        AuthInfo {
            user_id: "25025320".into(),
            device_id: "android-1234567890abcdef".into(),
            ..Default::default()
        }
    }

    #[test]
    fn add_is_idempotent() {
        let mut registry = SubscriptionRegistry::new();
        let cmd = registry.add(Subscription::direct("1")).unwrap();
        assert_eq!(cmd.payload, json!({"sub": ["ig/u/v1/1"]}));
        assert!(registry.add(Subscription::direct("1")).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn wire_string_is_set_at_construction() {
        let sub = Subscription::new(Topic::Pubsub, "custom", "ig/custom/1");
        assert_eq!(sub.wire(), "ig/custom/1");
        assert_eq!(Subscription::live("7").wire(), "ig/live_notification_subscribe/7");
        assert_eq!(Subscription::direct("7").wire(), "ig/u/v1/7");
    }

    #[test]
    fn remove_absent_is_noop() {
        let mut registry = SubscriptionRegistry::new();
        assert!(registry.remove(&Subscription::live("1")).is_none());
        registry.add(Subscription::live("1"));
        let cmd = registry.remove(&Subscription::live("1")).unwrap();
        assert_eq!(
            cmd.payload,
            json!({"unsub": ["ig/live_notification_subscribe/1"]})
        );
        assert!(registry.is_empty());
        assert!(registry.remove(&Subscription::live("1")).is_none());
    }

    #[test]
    fn resubscribe_covers_each_topic_once() {
        let mut registry = SubscriptionRegistry::new();
        registry.add(Subscription::direct("1"));
        registry.add(Subscription::live("1"));
        registry.add(Subscription::app_presence("abc"));

        let cmds = registry.resubscribe_commands();
        assert_eq!(cmds.len(), 2);
        let pubsub = cmds.iter().find(|c| c.topic == Topic::Pubsub).unwrap();
        let mut subs: Vec<String> =
            serde_json::from_value(pubsub.payload["sub"].clone()).unwrap();
        subs.sort();
        assert_eq!(
            subs,
            vec!["ig/live_notification_subscribe/1", "ig/u/v1/1"]
        );
        let realtime = cmds.iter().find(|c| c.topic == Topic::RealtimeSub).unwrap();
        assert_eq!(realtime.payload["sub"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn app_presence_wire_format() {
        let sub = Subscription::app_presence("abc");
        assert_eq!(
            sub.wire(),
            r#"1/graphqlsubscriptions/17846944882223835/{"input_data":{"client_subscription_id":"abc"}}"#
        );
    }

    #[test]
    fn initial_set_follows_flags() {
        let none = StaticExperiments::default();
        let registry = SubscriptionRegistry::from_experiments(
            &auth(),
            &none,
            &MemorySettings::default(),
        );
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(Topic::Pubsub, "direct"));

        let all = StaticExperiments::default()
            .enable(flags::LIVE_EVENTS)
            .enable(flags::APP_PRESENCE)
            .enable(flags::ZERO_PROVISION);
        let registry =
            SubscriptionRegistry::from_experiments(&auth(), &all, &MemorySettings::default());
        assert_eq!(registry.len(), 4);
        assert!(registry.contains(Topic::Pubsub, "live"));
        assert!(registry.contains(Topic::RealtimeSub, "presence"));
        assert!(registry.contains(Topic::RealtimeSub, "zero_provision"));
    }

    #[test]
    fn presence_disabled_setting_wins() {
        let ex = StaticExperiments::default().enable(flags::APP_PRESENCE);
        let store = MemorySettings::default().with(settings::PRESENCE_DISABLED, "true");
        let registry = SubscriptionRegistry::from_experiments(&auth(), &ex, &store);
        assert!(!registry.contains(Topic::RealtimeSub, "presence"));
    }
}
