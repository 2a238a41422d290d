//! Inbound payload parsers.
//!
//! Each topic with inbound traffic has exactly one parser. Parsers are pure:
//! they turn an inflated payload into zero or more [`Message`]s, or fail the
//! whole frame with a [`DecodeError`].
//!
//! ## Generic pubsub envelope
//!
//! ```text
//! msgpack array [ {"t": <inner type>, "p": <inner JSON>}, ... ]
//! ```
//!
//! `p` is normally a JSON string; binary and map forms are also accepted.
//!
//! This envelope layout is assumed, not verified against a production
//! broker. Deployments that see a different layout should decode frames with
//! their own parser; [`PubsubEnvelope`] and [`encode_envelopes`] describe the
//! layout expected here.

use std::collections::HashMap;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{Message, Module};
use crate::topics::Topic;
use crate::types::SequencePolicy;

/// Errors raised while decoding one inbound frame.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid msgpack: {0}")]
    Msgpack(String),

    #[error("invalid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("unexpected payload shape: {0}")]
    Shape(&'static str),
}

pub trait Parser: Send + Sync {
    fn parse(&self, topic: Topic, payload: &[u8]) -> Result<Vec<Message>, DecodeError>;
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

/// Whole payload is one JSON document for `module`.
#[derive(Debug, Clone, Copy)]
pub struct JsonParser(pub Module);

impl Parser for JsonParser {
    fn parse(&self, _topic: Topic, payload: &[u8]) -> Result<Vec<Message>, DecodeError> {
        let data: Value = serde_json::from_slice(payload)?;
        Ok(vec![Message::new(self.0, data)])
    }
}

// ---------------------------------------------------------------------------
// Generic pubsub
// ---------------------------------------------------------------------------

/// One envelope inside a generic pubsub frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubsubEnvelope {
    #[serde(rename = "t")]
    pub kind: i64,
    #[serde(rename = "p")]
    pub payload: String,
}

impl PubsubEnvelope {
    pub const DIRECT: i64 = 1;
    pub const LIVE: i64 = 2;
    pub const LIVE_BROADCAST: i64 = 3;

    fn module(kind: i64) -> Option<Module> {
        match kind {
            Self::DIRECT => Some(Module::Direct),
            Self::LIVE | Self::LIVE_BROADCAST => Some(Module::Live),
            _ => None,
        }
    }
}

/// Encode envelopes the way the broker frames them.
pub fn encode_envelopes(envelopes: &[PubsubEnvelope]) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec_named(envelopes)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PubsubParser;

impl Parser for PubsubParser {
    fn parse(&self, _topic: Topic, payload: &[u8]) -> Result<Vec<Message>, DecodeError> {
        let mut cursor = std::io::Cursor::new(payload);
        let value = rmpv::decode::read_value(&mut cursor)
            .map_err(|e| DecodeError::Msgpack(e.to_string()))?;
        let envelopes = match value {
            rmpv::Value::Array(items) => items,
            map @ rmpv::Value::Map(_) => vec![map],
            _ => return Err(DecodeError::Shape("pubsub frame is not an array")),
        };

        let mut messages = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            let rmpv::Value::Map(fields) = envelope else {
                return Err(DecodeError::Shape("pubsub envelope is not a map"));
            };
            let mut kind = None;
            let mut inner = None;
            for (k, v) in fields {
                match k.as_str() {
                    Some("t") => kind = v.as_i64(),
                    Some("p") => inner = Some(v),
                    _ => {}
                }
            }
            let kind = kind.ok_or(DecodeError::Shape("pubsub envelope missing type"))?;
            let inner = inner.ok_or(DecodeError::Shape("pubsub envelope missing payload"))?;
            let Some(module) = PubsubEnvelope::module(kind) else {
                tracing::warn!(kind, "skipping pubsub envelope of unknown type");
                continue;
            };
            messages.push(Message::new(module, inner_payload(inner)?));
        }
        Ok(messages)
    }
}

fn inner_payload(value: rmpv::Value) -> Result<Value, DecodeError> {
    match value {
        rmpv::Value::String(s) => {
            let text = s
                .as_str()
                .ok_or(DecodeError::Shape("pubsub payload is not UTF-8"))?;
            Ok(serde_json::from_str(text)?)
        }
        rmpv::Value::Binary(bytes) => Ok(serde_json::from_slice(&bytes)?),
        other @ (rmpv::Value::Map(_) | rmpv::Value::Array(_)) => Ok(rmpv_to_json(other)),
        _ => Err(DecodeError::Shape("pubsub payload is not JSON")),
    }
}

/// Convert an rmpv::Value to serde_json::Value, encoding binary data as base64 strings.
fn rmpv_to_json(value: rmpv::Value) -> Value {
    match value {
        rmpv::Value::Nil => Value::Null,
        rmpv::Value::Boolean(b) => Value::Bool(b),
        rmpv::Value::Integer(i) => {
            if let Some(n) = i.as_i64() {
                Value::Number(n.into())
            } else if let Some(n) = i.as_u64() {
                Value::Number(n.into())
            } else {
                Value::Null
            }
        }
        rmpv::Value::F32(f) => {
            serde_json::Number::from_f64(f64::from(f)).map_or(Value::Null, Value::Number)
        }
        rmpv::Value::F64(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        rmpv::Value::String(s) => match s.into_str() {
            Some(s) => Value::String(s),
            None => {
                tracing::warn!("msgpack string contains invalid UTF-8, substituting empty string");
                Value::String(String::new())
            }
        },
        rmpv::Value::Binary(bytes) | rmpv::Value::Ext(_, bytes) => {
            Value::String(base64::engine::general_purpose::STANDARD.encode(&bytes))
        }
        rmpv::Value::Array(arr) => Value::Array(arr.into_iter().map(rmpv_to_json).collect()),
        rmpv::Value::Map(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    let key = match k {
                        rmpv::Value::String(s) => s.into_str().unwrap_or_default(),
                        other => other.to_string(),
                    };
                    (key, rmpv_to_json(v))
                })
                .collect(),
        ),
    }
}

// ---------------------------------------------------------------------------
// Message sync
// ---------------------------------------------------------------------------

/// Sequence-numbered sync entries. Each entry becomes one direct message, in
/// frame order.
#[derive(Debug, Clone, Copy, Default)]
pub struct IrisParser;

impl Parser for IrisParser {
    fn parse(&self, _topic: Topic, payload: &[u8]) -> Result<Vec<Message>, DecodeError> {
        let entries = match serde_json::from_slice::<Value>(payload)? {
            Value::Array(entries) => entries,
            entry @ Value::Object(_) => vec![entry],
            _ => return Err(DecodeError::Shape("sync payload is not an array")),
        };
        entries
            .into_iter()
            .map(|entry| {
                if seq_id(&entry).is_none() {
                    return Err(DecodeError::Shape("sync entry missing seq_id"));
                }
                Ok(Message::new(Module::Direct, entry))
            })
            .collect()
    }
}

pub(crate) fn seq_id(entry: &Value) -> Option<i64> {
    match entry.get("seq_id")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Cross-frame ordering for sync entries on one connection.
#[derive(Debug, Clone)]
pub(crate) struct SequenceGate {
    policy: SequencePolicy,
    last: Option<i64>,
}

impl SequenceGate {
    pub(crate) fn new(policy: SequencePolicy) -> Self {
        Self { policy, last: None }
    }

    /// Whether an entry with `seq` should be dispatched.
    pub(crate) fn admit(&mut self, seq: i64) -> bool {
        if self.policy == SequencePolicy::DropStale
            && let Some(last) = self.last
            && seq <= last
        {
            return false;
        }
        self.last = Some(self.last.map_or(seq, |last| last.max(seq)));
        true
    }

    pub(crate) fn reset(&mut self) {
        self.last = None;
    }
}

// ---------------------------------------------------------------------------
// GraphQL
// ---------------------------------------------------------------------------

/// A GraphQL subscription or query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphqlResult {
    pub topic: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy)]
pub struct GraphqlParser(pub Module);

impl Parser for GraphqlParser {
    fn parse(&self, _topic: Topic, payload: &[u8]) -> Result<Vec<Message>, DecodeError> {
        let mut result: GraphqlResult = serde_json::from_slice(payload)?;
        if let Value::String(nested) = &result.payload {
            result.payload = serde_json::from_str(nested)?;
        }
        Ok(vec![Message::new(self.0, serde_json::to_value(result)?)])
    }
}

// ---------------------------------------------------------------------------
// Scalar
// ---------------------------------------------------------------------------

/// Bare string payload, either a JSON string literal or raw text.
#[derive(Debug, Clone, Copy)]
pub struct ScalarParser(pub Module);

impl Parser for ScalarParser {
    fn parse(&self, _topic: Topic, payload: &[u8]) -> Result<Vec<Message>, DecodeError> {
        let text = std::str::from_utf8(payload)?.trim();
        let value = if text.starts_with('"') {
            serde_json::from_str::<String>(text)?
        } else {
            text.to_string()
        };
        if value.is_empty() {
            return Err(DecodeError::Shape("empty scalar payload"));
        }
        Ok(vec![Message::new(self.0, Value::String(value))])
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Parser per inbound topic, fixed at construction.
pub struct ParserRegistry {
    parsers: HashMap<Topic, Box<dyn Parser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        let mut parsers: HashMap<Topic, Box<dyn Parser>> = HashMap::new();
        parsers.insert(Topic::SendMessageResponse, Box::new(JsonParser(Module::Direct)));
        parsers.insert(Topic::IrisSubResponse, Box::new(JsonParser(Module::Iris)));
        parsers.insert(Topic::Pubsub, Box::new(PubsubParser));
        parsers.insert(Topic::MessageSync, Box::new(IrisParser));
        parsers.insert(Topic::Graphql, Box::new(GraphqlParser(Module::Graphql)));
        parsers.insert(Topic::RealtimeSub, Box::new(GraphqlParser(Module::Graphql)));
        parsers.insert(Topic::RegionHint, Box::new(ScalarParser(Module::RegionHint)));
        Self { parsers }
    }

    pub fn get(&self, topic: Topic) -> Option<&dyn Parser> {
        self.parsers.get(&topic).map(Box::as_ref)
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(kind: i64, payload: &Value) -> PubsubEnvelope {
        PubsubEnvelope {
            kind,
            payload: payload.to_string(),
        }
    }

    #[test]
    fn pubsub_routes_by_inner_type() {
        let frame = encode_envelopes(&[
            envelope(1, &json!({"event": "patch", "data": []})),
            envelope(99, &json!({})),
            envelope(3, &json!({"event": "patch", "data": [{"op": "add"}]})),
        ])
        .unwrap();
        let messages = PubsubParser.parse(Topic::Pubsub, &frame).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].module, Module::Direct);
        assert_eq!(messages[1].module, Module::Live);
        assert_eq!(messages[1].data["data"][0]["op"], "add");
    }

    #[test]
    fn pubsub_inner_must_be_json() {
        let frame = encode_envelopes(&[PubsubEnvelope {
            kind: 1,
            payload: "not json".into(),
        }])
        .unwrap();
        assert!(matches!(
            PubsubParser.parse(Topic::Pubsub, &frame),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn pubsub_rejects_garbage() {
        assert!(PubsubParser.parse(Topic::Pubsub, b"\xc1").is_err());
        let scalar = rmp_serde::to_vec(&7u8).unwrap();
        assert!(matches!(
            PubsubParser.parse(Topic::Pubsub, &scalar),
            Err(DecodeError::Shape(_))
        ));
    }

    #[test]
    fn pubsub_map_payload() {
        let mut buf = Vec::new();
        let frame = rmpv::Value::Array(vec![rmpv::Value::Map(vec![
            (rmpv::Value::from("t"), rmpv::Value::from(2)),
            (
                rmpv::Value::from("p"),
                rmpv::Value::Map(vec![(
                    rmpv::Value::from("blob"),
                    rmpv::Value::Binary(vec![1, 2, 3]),
                )]),
            ),
        ])]);
        rmpv::encode::write_value(&mut buf, &frame).unwrap();
        let messages = PubsubParser.parse(Topic::Pubsub, &buf).unwrap();
        assert_eq!(messages[0].data, json!({"blob": "AQID"}));
    }

    #[test]
    fn iris_keeps_order_and_requires_seq_id() {
        let payload = json!([
            {"seq_id": 5, "event": "patch", "data": []},
            {"seq_id": 6, "event": "patch", "data": []},
        ]);
        let messages = IrisParser
            .parse(Topic::MessageSync, payload.to_string().as_bytes())
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(seq_id(&messages[0].data), Some(5));
        assert_eq!(seq_id(&messages[1].data), Some(6));

        let missing = json!([{"event": "patch"}]);
        assert!(
            IrisParser
                .parse(Topic::MessageSync, missing.to_string().as_bytes())
                .is_err()
        );
    }

    #[test]
    fn sequence_gate_policies() {
        let mut gate = SequenceGate::new(SequencePolicy::FrameOrder);
        assert!(gate.admit(5));
        assert!(gate.admit(3));

        let mut gate = SequenceGate::new(SequencePolicy::DropStale);
        assert!(gate.admit(5));
        assert!(!gate.admit(5));
        assert!(!gate.admit(4));
        assert!(gate.admit(6));
        gate.reset();
        assert!(gate.admit(1));
    }

    #[test]
    fn graphql_decodes_nested_payload() {
        let payload = json!({
            "topic": "app_presence",
            "payload": "{\"presence_event\":{\"user_id\":\"1\",\"is_active\":true}}",
        });
        let messages = GraphqlParser(Module::Graphql)
            .parse(Topic::RealtimeSub, payload.to_string().as_bytes())
            .unwrap();
        assert_eq!(messages[0].module, Module::Graphql);
        assert_eq!(messages[0].data["payload"]["presence_event"]["is_active"], true);
    }

    #[test]
    fn graphql_requires_topic() {
        assert!(
            GraphqlParser(Module::Graphql)
                .parse(Topic::Graphql, br#"{"payload": {}}"#)
                .is_err()
        );
    }

    #[test]
    fn scalar_accepts_literal_and_raw() {
        let parser = ScalarParser(Module::RegionHint);
        let a = parser.parse(Topic::RegionHint, br#""ATN""#).unwrap();
        let b = parser.parse(Topic::RegionHint, b" ATN\n").unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].data, json!("ATN"));
        assert!(parser.parse(Topic::RegionHint, b"  ").is_err());
        assert!(parser.parse(Topic::RegionHint, b"\xff").is_err());
    }

    #[test]
    fn registry_covers_inbound_topics() {
        let registry = ParserRegistry::new();
        for topic in [
            Topic::Pubsub,
            Topic::SendMessageResponse,
            Topic::IrisSubResponse,
            Topic::MessageSync,
            Topic::RealtimeSub,
            Topic::Graphql,
            Topic::RegionHint,
        ] {
            assert!(registry.get(topic).is_some(), "no parser for {topic}");
        }
        assert!(registry.get(Topic::SendMessage).is_none());
        assert!(registry.get(Topic::IrisSub).is_none());
    }
}
