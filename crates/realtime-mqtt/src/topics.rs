//! Topic names and their compact wire identifiers.
//!
//! The broker never sees the human-readable names: every PUBLISH carries the
//! decimal wire id as its topic string, and the CONNECT identity lists the ids
//! the client wants pushed to it.

use std::collections::HashSet;
use std::fmt;

/// A broker topic known to this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// Generic multiplexed pubsub ("skywalker") envelope channel.
    Pubsub,
    /// Outbound direct commands.
    SendMessage,
    /// Acknowledgements for outbound direct commands.
    SendMessageResponse,
    /// Outbound incremental-sync subscribe requests.
    IrisSub,
    /// Responses to incremental-sync subscribe requests.
    IrisSubResponse,
    /// Sequence-numbered incremental sync entries.
    MessageSync,
    /// GraphQL subscription updates.
    RealtimeSub,
    /// GraphQL query results.
    Graphql,
    /// Preferred datacenter hints.
    RegionHint,
}

impl Topic {
    pub const ALL: [Topic; 9] = [
        Topic::Pubsub,
        Topic::SendMessage,
        Topic::SendMessageResponse,
        Topic::IrisSub,
        Topic::IrisSubResponse,
        Topic::MessageSync,
        Topic::RealtimeSub,
        Topic::Graphql,
        Topic::RegionHint,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Topic::Pubsub => "/pubsub",
            Topic::SendMessage => "/ig_send_message",
            Topic::SendMessageResponse => "/ig_send_message_response",
            Topic::IrisSub => "/ig_sub_iris",
            Topic::IrisSubResponse => "/ig_sub_iris_response",
            Topic::MessageSync => "/ig_message_sync",
            Topic::RealtimeSub => "/ig_realtime_sub",
            Topic::Graphql => "/graphql",
            Topic::RegionHint => "/t_region_hint",
        }
    }

    pub const fn wire_id(self) -> u16 {
        match self {
            Topic::Pubsub => 88,
            Topic::SendMessage => 132,
            Topic::SendMessageResponse => 133,
            Topic::IrisSub => 134,
            Topic::IrisSubResponse => 135,
            Topic::MessageSync => 146,
            Topic::RealtimeSub => 149,
            Topic::Graphql => 9,
            Topic::RegionHint => 150,
        }
    }

    /// The PUBLISH topic string for this topic.
    pub fn wire_topic(self) -> String {
        self.wire_id().to_string()
    }

    pub fn from_name(name: &str) -> Option<Topic> {
        Topic::ALL.into_iter().find(|t| t.name() == name)
    }

    pub fn from_wire_id(id: u16) -> Option<Topic> {
        Topic::ALL.into_iter().find(|t| t.wire_id() == id)
    }

    /// Reverse-map a PUBLISH topic string. Accepts either the numeric wire id
    /// or, for brokers that do not compact, the full topic name.
    pub fn from_wire_topic(topic: &str) -> Option<Topic> {
        match topic.parse::<u16>() {
            Ok(id) => Topic::from_wire_id(id),
            Err(_) => Topic::from_name(topic),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Map a topic name to its wire id.
pub fn map(name: &str) -> Option<u16> {
    Topic::from_name(name).map(Topic::wire_id)
}

/// Map a wire id back to its topic name.
pub fn unmap(id: u16) -> Option<&'static str> {
    Topic::from_wire_id(id).map(Topic::name)
}

/// Check that no two topics share a name or a wire id.
///
/// Violations are logged at error level; the client keeps running.
pub fn verify_mapping() -> bool {
    let mut ids = HashSet::new();
    let mut names = HashSet::new();
    let mut ok = true;
    for topic in Topic::ALL {
        if !ids.insert(topic.wire_id()) {
            tracing::error!(topic = %topic, id = topic.wire_id(), "duplicate topic wire id");
            ok = false;
        }
        if !names.insert(topic.name()) {
            tracing::error!(topic = %topic, "duplicate topic name");
            ok = false;
        }
    }
    ok
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_is_bijective() {
        assert!(verify_mapping());
        for topic in Topic::ALL {
            let id = map(topic.name()).unwrap();
            assert_eq!(unmap(id), Some(topic.name()));
            assert_eq!(map(unmap(id).unwrap()), Some(id));
        }
    }

    #[test]
    fn known_wire_ids() {
        assert_eq!(map("/pubsub"), Some(88));
        assert_eq!(map("/ig_send_message_response"), Some(133));
        assert_eq!(map("/graphql"), Some(9));
        assert_eq!(unmap(150), Some("/t_region_hint"));
        assert_eq!(unmap(146), Some("/ig_message_sync"));
    }

    #[test]
    fn unknown_topics() {
        assert_eq!(map("/nope"), None);
        assert_eq!(unmap(1), None);
        assert_eq!(Topic::from_wire_topic("999"), None);
        assert_eq!(Topic::from_wire_topic("garbage"), None);
    }

    #[test]
    fn wire_topic_accepts_id_or_name() {
        assert_eq!(Topic::from_wire_topic("135"), Some(Topic::IrisSubResponse));
        assert_eq!(
            Topic::from_wire_topic("/ig_realtime_sub"),
            Some(Topic::RealtimeSub)
        );
        assert_eq!(Topic::RegionHint.wire_topic(), "150");
    }
}
