//! Per-module message handlers.
//!
//! A handler turns one [`Message`] into events and side effects. Everything a
//! handler produces is collected in a [`HandlerContext`]; when the handler
//! fails the context is discarded, so a message never yields partial output.

use std::collections::HashMap;

use serde_json::Value;

use crate::message::{Message, Module};
use crate::parser::seq_id;
use crate::types::{Ack, Event};

/// Side effects a handler asks the connection manager to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Connect to this datacenter next time.
    PreferRegion(String),
}

#[derive(Debug, Default)]
pub struct HandlerContext {
    events: Vec<Event>,
    effects: Vec<Effect>,
}

impl HandlerContext {
    pub fn emit(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn effect(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    pub fn into_parts(self) -> (Vec<Event>, Vec<Effect>) {
        (self.events, self.effects)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("invalid `{field}`: {source}")]
    InvalidValue {
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("unexpected message: {0}")]
    Unexpected(String),
}

pub trait Handler: Send + Sync {
    fn handle(&self, message: &Message, cx: &mut HandlerContext) -> Result<(), HandlerError>;
}

// ---------------------------------------------------------------------------
// Patch helpers
// ---------------------------------------------------------------------------

/// One JSON-patch style operation.
struct PatchOp<'a> {
    op: &'a str,
    segments: Vec<&'a str>,
    raw: &'a Value,
}

impl PatchOp<'_> {
    /// The op's `value`, with JSON held in a string decoded.
    fn value(&self) -> Result<Value, HandlerError> {
        match self.raw.get("value") {
            None => Ok(Value::Null),
            Some(Value::String(s)) if looks_like_json(s) => serde_json::from_str(s)
                .map_err(|source| HandlerError::InvalidValue {
                    field: "value",
                    source,
                }),
            Some(v) => Ok(v.clone()),
        }
    }
}

fn looks_like_json(s: &str) -> bool {
    matches!(s.trim_start().as_bytes().first(), Some(b'{' | b'['))
}

/// Operations of a `{"event":"patch","data":[...]}` frame, or `None` for
/// any other event.
fn patch_ops(data: &Value) -> Result<Option<Vec<PatchOp<'_>>>, HandlerError> {
    if data.get("event").and_then(Value::as_str) != Some("patch") {
        return Ok(None);
    }
    let ops = data
        .get("data")
        .and_then(Value::as_array)
        .ok_or(HandlerError::MissingField("data"))?;
    ops.iter()
        .map(|raw| {
            let op = raw
                .get("op")
                .and_then(Value::as_str)
                .ok_or(HandlerError::MissingField("op"))?;
            let path = raw
                .get("path")
                .and_then(Value::as_str)
                .ok_or(HandlerError::MissingField("path"))?;
            Ok(PatchOp {
                op,
                segments: path.trim_matches('/').split('/').collect(),
                raw,
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

fn string_field(data: &Value, field: &'static str) -> Result<String, HandlerError> {
    match data.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(HandlerError::MissingField(field)),
    }
}

fn owned(s: &str) -> String {
    s.to_string()
}

fn optional_string(data: &Value, field: &str) -> Option<String> {
    match data.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Direct
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct DirectHandler;

impl DirectHandler {
    fn ack(data: &Value) -> Result<Ack, HandlerError> {
        Ok(Ack {
            action: optional_string(data, "action"),
            status: string_field(data, "status")?,
            status_code: optional_string(data, "status_code"),
            client_context: optional_string(data, "client_context"),
            payload: data.get("payload").cloned().unwrap_or(Value::Null),
        })
    }

    fn route(op: &PatchOp<'_>, cx: &mut HandlerContext) -> Result<(), HandlerError> {
        match (op.op, op.segments.as_slice()) {
            ("add", ["direct_v2", "threads", t]) => cx.emit(Event::ThreadCreated {
                thread_id: owned(t),
                thread: op.value()?,
            }),
            ("replace", ["direct_v2", "threads", t]) => cx.emit(Event::ThreadUpdated {
                thread_id: owned(t),
                thread: op.value()?,
            }),
            ("add", ["direct_v2", "threads", t, "items", i]) => cx.emit(Event::ThreadItemCreated {
                thread_id: owned(t),
                item_id: owned(i),
                item: op.value()?,
            }),
            ("replace", ["direct_v2", "threads", t, "items", i]) => {
                cx.emit(Event::ThreadItemUpdated {
                    thread_id: owned(t),
                    item_id: owned(i),
                    item: op.value()?,
                })
            }
            ("remove", ["direct_v2", "threads", t, "items", i]) => {
                cx.emit(Event::ThreadItemRemoved {
                    thread_id: owned(t),
                    item_id: owned(i),
                })
            }
            (_, ["direct_v2", "threads", t, "items", i, "notify"]) => {
                cx.emit(Event::ThreadNotify {
                    thread_id: owned(t),
                    item_id: owned(i),
                    notify: op.value()?,
                })
            }
            (_, ["direct_v2", "threads", t, "participants", u, "has_seen"]) => {
                cx.emit(Event::ThreadSeen {
                    thread_id: owned(t),
                    user_id: owned(u),
                    seen: op.value()?,
                })
            }
            (_, ["direct_v2", "threads", t, "activity_indicator_id", _]) => {
                cx.emit(Event::ThreadActivity {
                    thread_id: owned(t),
                    activity: op.value()?,
                })
            }
            (_, ["direct_v2", "inbox", "unseen_count"]) => {
                cx.emit(Event::UnseenCountUpdate(op.value()?))
            }
            ("add", ["direct_v2", "visual_threads", t, "items", _]) => {
                cx.emit(Event::DirectStoryCreated {
                    thread_id: owned(t),
                    item: op.value()?,
                })
            }
            ("replace", ["direct_v2", "visual_threads", t, "items", _]) => {
                cx.emit(Event::DirectStoryUpdated {
                    thread_id: owned(t),
                    item: op.value()?,
                })
            }
            (_, ["direct_v2", "visual_thread", t, "screenshot"]) => {
                cx.emit(Event::DirectStoryScreenshot {
                    thread_id: owned(t),
                    screenshot: op.value()?,
                })
            }
            (_, ["direct_v2", "visual_action_badge", t]) => cx.emit(Event::DirectStoryAction {
                thread_id: owned(t),
                action: op.value()?,
            }),
            (kind, segments) => {
                tracing::debug!(op = kind, path = %segments.join("/"), "ignoring direct patch");
            }
        }
        Ok(())
    }
}

impl Handler for DirectHandler {
    fn handle(&self, message: &Message, cx: &mut HandlerContext) -> Result<(), HandlerError> {
        let data = &message.data;
        if data.get("status").is_some() {
            cx.emit(Event::ClientContextAck(Self::ack(data)?));
            return Ok(());
        }
        let Some(ops) = patch_ops(data)? else {
            tracing::debug!(event = ?data.get("event"), "ignoring direct message");
            return Ok(());
        };
        for op in &ops {
            Self::route(op, cx)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Live
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct LiveHandler;

impl Handler for LiveHandler {
    fn handle(&self, message: &Message, cx: &mut HandlerContext) -> Result<(), HandlerError> {
        let Some(ops) = patch_ops(&message.data)? else {
            tracing::debug!("ignoring live message without patch");
            return Ok(());
        };
        for op in &ops {
            match (op.op, op.segments.as_slice()) {
                ("add", ["broadcast", id, "started"]) => cx.emit(Event::LiveStarted {
                    broadcast_id: id.to_string(),
                    broadcast: op.value()?,
                }),
                (_, ["broadcast", id, "ended"]) => cx.emit(Event::LiveStopped {
                    broadcast_id: id.to_string(),
                    broadcast: op.value()?,
                }),
                (kind, segments) => {
                    tracing::debug!(op = kind, path = %segments.join("/"), "ignoring live patch");
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Iris
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct IrisHandler;

impl Handler for IrisHandler {
    fn handle(&self, message: &Message, cx: &mut HandlerContext) -> Result<(), HandlerError> {
        let data = &message.data;
        let succeeded = data
            .get("succeeded")
            .and_then(Value::as_bool)
            .ok_or(HandlerError::MissingField("succeeded"))?;
        if succeeded {
            cx.emit(Event::IrisSubscribed {
                seq_id: seq_id(data),
            });
        } else {
            let message = optional_string(data, "error_message")
                .or_else(|| optional_string(data, "error_type"))
                .unwrap_or_else(|| "message sync subscription failed".to_string());
            cx.emit(Event::Error { message });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GraphQL
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct GraphqlHandler;

impl Handler for GraphqlHandler {
    fn handle(&self, message: &Message, cx: &mut HandlerContext) -> Result<(), HandlerError> {
        let topic = message
            .data
            .get("topic")
            .and_then(Value::as_str)
            .ok_or(HandlerError::MissingField("topic"))?;
        let payload = message.data.get("payload").unwrap_or(&Value::Null);
        match topic {
            "app_presence" => {
                let presence = payload.get("presence_event").unwrap_or(payload);
                cx.emit(Event::PresenceUpdate(presence.clone()));
            }
            "zero_product_provisioning" => cx.emit(Event::ZeroProvision(payload.clone())),
            "direct_typing" => match patch_ops(payload)? {
                Some(ops) => {
                    for op in &ops {
                        DirectHandler::route(op, cx)?;
                    }
                }
                None => cx.emit(Event::ThreadActivity {
                    thread_id: string_field(payload, "thread_id")?,
                    activity: payload.clone(),
                }),
            },
            other => tracing::debug!(topic = other, "ignoring graphql result"),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Region hint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct RegionHintHandler;

impl Handler for RegionHintHandler {
    fn handle(&self, message: &Message, cx: &mut HandlerContext) -> Result<(), HandlerError> {
        let Value::String(region) = &message.data else {
            return Err(HandlerError::Unexpected(format!(
                "region hint is not a string: {}",
                message.data
            )));
        };
        cx.emit(Event::RegionHint(region.clone()));
        cx.effect(Effect::PreferRegion(region.clone()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Handler per module, fixed at construction.
pub struct HandlerRegistry {
    handlers: HashMap<Module, Box<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        let mut handlers: HashMap<Module, Box<dyn Handler>> = HashMap::new();
        handlers.insert(Module::Direct, Box::new(DirectHandler));
        handlers.insert(Module::Live, Box::new(LiveHandler));
        handlers.insert(Module::Iris, Box::new(IrisHandler));
        handlers.insert(Module::Graphql, Box::new(GraphqlHandler));
        handlers.insert(Module::RegionHint, Box::new(RegionHintHandler));
        Self { handlers }
    }

    pub fn get(&self, module: Module) -> Option<&dyn Handler> {
        self.handlers.get(&module).map(Box::as_ref)
    }

    /// Run the handler for `message`. Returns `None` when no handler is
    /// registered for its module.
    pub fn handle(
        &self,
        message: &Message,
    ) -> Option<Result<(Vec<Event>, Vec<Effect>), HandlerError>> {
        let handler = self.get(message.module)?;
        let mut cx = HandlerContext::default();
        Some(handler.handle(message, &mut cx).map(|()| cx.into_parts()))
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
