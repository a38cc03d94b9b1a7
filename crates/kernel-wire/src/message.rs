//! Kernel channel message types.
//!
//! Inbound traffic is a positional tuple tagged by its action:
//!
//! ```text
//! ["run", code, contextId]
//! ["inspect", code, contextId]
//! ["getAllPropertyNames", code, contextId]
//! ["reply", replyPayload, _, contextId]
//! ```
//!
//! Outbound traffic is a single object shape (`EngineMessage`) whose optional
//! fields select what kind of message it is.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

/// Opaque identifier of an execution context, chosen by the host.
///
/// Hosts use strings or numbers; the value is echoed back untouched.
/// An absent id (`None`) denotes the initial context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(transparent)]
#[ts(export)]
pub struct ContextId(#[ts(type = "string | number")] Value);

impl ContextId {
    pub fn new(value: impl Into<Value>) -> Self {
        Self(value.into())
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

impl From<&str> for ContextId {
    fn from(s: &str) -> Self {
        Self(Value::String(s.to_string()))
    }
}

impl From<String> for ContextId {
    fn from(s: String) -> Self {
        Self(Value::String(s))
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Value::String(s) => write!(f, "{}", s),
            other => write!(f, "{}", other),
        }
    }
}

// ── Inbound ─────────────────────────────────────────────────────────

/// Action named in the first slot of an inbound tuple.
///
/// Unknown values are preserved in `Other` so the dispatcher can report them
/// back to the context instead of failing to decode the whole message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Run,
    Inspect,
    GetAllPropertyNames,
    Reply,
    /// An unrecognized action, preserved for error reporting.
    Other(String),
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Run => write!(f, "run"),
            Action::Inspect => write!(f, "inspect"),
            Action::GetAllPropertyNames => write!(f, "getAllPropertyNames"),
            Action::Reply => write!(f, "reply"),
            Action::Other(s) => write!(f, "{}", s),
        }
    }
}

impl std::str::FromStr for Action {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "run" => Action::Run,
            "inspect" => Action::Inspect,
            "getAllPropertyNames" => Action::GetAllPropertyNames,
            "reply" => Action::Reply,
            _ => Action::Other(s.to_string()),
        })
    }
}

/// Failure to make sense of an inbound message.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("inbound message must be an array, got: {0}")]
    NotATuple(String),

    #[error("inbound message has no action")]
    MissingAction,

    #[error("action `{0}` requires a code string")]
    MissingCode(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("reply has no numeric correlation id")]
    MissingReplyId,
}

/// A decoded inbound action tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub action: Action,
    /// Source code for `run`, `inspect` and `getAllPropertyNames`.
    pub code: Option<String>,
    /// Reply payload for `reply`.
    pub reply: Option<Value>,
    pub context_id: Option<ContextId>,
}

impl InboundMessage {
    pub fn run(code: &str, context_id: impl Into<ContextId>) -> Self {
        Self::with_code(Action::Run, code, context_id)
    }

    pub fn inspect(code: &str, context_id: impl Into<ContextId>) -> Self {
        Self::with_code(Action::Inspect, code, context_id)
    }

    pub fn get_all_property_names(code: &str, context_id: impl Into<ContextId>) -> Self {
        Self::with_code(Action::GetAllPropertyNames, code, context_id)
    }

    pub fn reply(payload: Value, context_id: Option<ContextId>) -> Self {
        Self {
            action: Action::Reply,
            code: None,
            reply: Some(payload),
            context_id,
        }
    }

    fn with_code(action: Action, code: &str, context_id: impl Into<ContextId>) -> Self {
        Self {
            action,
            code: Some(code.to_string()),
            reply: None,
            context_id: Some(context_id.into()),
        }
    }

    /// Decode a positional tuple.
    ///
    /// Only the shape of the tuple is checked here; a missing code string or
    /// an unknown action is left for the dispatcher to report to the context.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let items = match value {
            Value::Array(items) => items,
            other => return Err(ProtocolError::NotATuple(other.to_string())),
        };

        let action: Action = match items.first() {
            Some(Value::String(s)) => match s.parse::<Action>() {
                Ok(action) => action,
                Err(never) => match never {},
            },
            _ => return Err(ProtocolError::MissingAction),
        };

        let context_at = |index: usize| {
            items
                .get(index)
                .filter(|v| !v.is_null())
                .cloned()
                .map(ContextId)
        };

        if action == Action::Reply {
            return Ok(Self {
                action,
                code: None,
                reply: items.get(1).cloned(),
                context_id: context_at(3),
            });
        }

        Ok(Self {
            code: items.get(1).and_then(|v| v.as_str()).map(str::to_string),
            reply: None,
            context_id: context_at(2),
            action,
        })
    }

    /// Encode back into the positional tuple the host sends.
    pub fn to_value(&self) -> Value {
        let context = self
            .context_id
            .as_ref()
            .map(|id| id.0.clone())
            .unwrap_or(Value::Null);
        match self.action {
            Action::Reply => Value::Array(vec![
                Value::String(self.action.to_string()),
                self.reply.clone().unwrap_or(Value::Null),
                Value::Null,
                context,
            ]),
            _ => Value::Array(vec![
                Value::String(self.action.to_string()),
                self.code.clone().map(Value::String).unwrap_or(Value::Null),
                context,
            ]),
        }
    }

    /// The code string, or a protocol error naming the action.
    pub fn require_code(&self) -> Result<&str, ProtocolError> {
        self.code
            .as_deref()
            .ok_or_else(|| ProtocolError::MissingCode(self.action.to_string()))
    }

    /// The correlation id embedded in a reply payload.
    pub fn reply_id(&self) -> Result<u64, ProtocolError> {
        self.reply
            .as_ref()
            .and_then(|payload| payload.get("id"))
            .and_then(Value::as_u64)
            .ok_or(ProtocolError::MissingReplyId)
    }
}

impl Serialize for InboundMessage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for InboundMessage {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        InboundMessage::from_value(value).map_err(serde::de::Error::custom)
    }
}

// ── Outbound ────────────────────────────────────────────────────────

/// Mapping from MIME type to its rendered representation.
///
/// At most one value per MIME type. Rendered bundles always carry a
/// `text/plain` entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[serde(transparent)]
#[ts(export)]
pub struct MimeBundle(#[ts(type = "Record<string, unknown>")] BTreeMap<String, Value>);

impl MimeBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bundle with a single entry.
    pub fn single(mime_type: &str, value: impl Into<Value>) -> Self {
        let mut bundle = Self::new();
        bundle.insert(mime_type, value);
        bundle
    }

    pub fn insert(&mut self, mime_type: &str, value: impl Into<Value>) {
        self.0.insert(mime_type.to_string(), value.into());
    }

    /// Insert only if no representation exists for `mime_type` yet.
    /// Returns whether the value was inserted.
    pub fn insert_if_absent(&mut self, mime_type: &str, value: impl Into<Value>) -> bool {
        if self.0.contains_key(mime_type) {
            return false;
        }
        self.0.insert(mime_type.to_string(), value.into());
        true
    }

    /// Merge `other` in, keeping entries already present.
    pub fn merge_absent(&mut self, other: MimeBundle) {
        for (key, value) in other.0 {
            self.0.entry(key).or_insert(value);
        }
    }

    pub fn get(&self, mime_type: &str) -> Option<&Value> {
        self.0.get(mime_type)
    }

    /// The entry for `mime_type` if it is a string.
    pub fn text(&self, mime_type: &str) -> Option<&str> {
        self.0.get(mime_type).and_then(Value::as_str)
    }

    pub fn contains(&self, mime_type: &str) -> bool {
        self.0.contains_key(mime_type)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl FromIterator<(String, Value)> for MimeBundle {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Structured error payload delivered to the frontend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ErrorInfo {
    pub ename: String,
    pub evalue: String,
    pub traceback: Vec<String>,
}

/// Sub-request issued by a context that wants user interaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct RequestBody {
    /// Correlation id assigned by the requester. Absent for fire-and-forget
    /// requests such as `clear`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(type = "unknown")]
    pub input: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(type = "unknown")]
    pub clear: Option<Value>,
}

/// Display update addressed to a (sub-)display of a context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct DisplayBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<MimeBundle>,
}

/// Structural description of a value, answered to `inspect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Inspection {
    pub string: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub constructor_list: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
}

/// Which output stream a captured write came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stream::Stdout => write!(f, "stdout"),
            Stream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Message sent from the engine to the host.
///
/// Which optional fields are set decides the message kind: a result carries
/// `mime`/`error` plus `end`, a request carries `request`, and so on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct EngineMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ContextId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<MimeBundle>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestBody>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<DisplayBody>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inspection: Option<Inspection>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub names: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<bool>,
}

impl EngineMessage {
    /// Lifecycle message sent once at startup.
    pub fn online() -> Self {
        Self {
            status: Some("online".to_string()),
            ..Default::default()
        }
    }

    pub fn result(mime: MimeBundle, end: bool) -> Self {
        Self {
            mime: Some(mime),
            end: Some(end),
            ..Default::default()
        }
    }

    pub fn error(error: ErrorInfo, end: bool) -> Self {
        Self {
            error: Some(error),
            end: Some(end),
            ..Default::default()
        }
    }

    /// Bare completion signal.
    pub fn end() -> Self {
        Self {
            end: Some(true),
            ..Default::default()
        }
    }

    pub fn request(request: RequestBody) -> Self {
        Self {
            request: Some(request),
            ..Default::default()
        }
    }

    pub fn display(display: DisplayBody) -> Self {
        Self {
            display: Some(display),
            ..Default::default()
        }
    }

    pub fn inspection(inspection: Inspection) -> Self {
        Self {
            inspection: Some(inspection),
            end: Some(true),
            ..Default::default()
        }
    }

    pub fn names(names: Vec<String>) -> Self {
        Self {
            names: Some(names),
            end: Some(true),
            ..Default::default()
        }
    }

    /// Captured console output.
    pub fn stream(stream: Stream, text: impl Into<String>) -> Self {
        let text = Some(text.into());
        match stream {
            Stream::Stdout => Self {
                stdout: text,
                ..Default::default()
            },
            Stream::Stderr => Self {
                stderr: text,
                ..Default::default()
            },
        }
    }

    pub fn with_id(mut self, id: Option<ContextId>) -> Self {
        self.id = id;
        self
    }

    /// Whether this message completes its context.
    pub fn is_end(&self) -> bool {
        self.end == Some(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_run() {
        let msg = InboundMessage::from_value(json!(["run", "1+1", "ctx-1"])).unwrap();
        assert_eq!(msg.action, Action::Run);
        assert_eq!(msg.code.as_deref(), Some("1+1"));
        assert_eq!(msg.context_id, Some(ContextId::from("ctx-1")));
    }

    #[test]
    fn test_decode_reply_reads_context_from_fourth_slot() {
        let msg =
            InboundMessage::from_value(json!(["reply", {"id": 3, "input": "42"}, null, "ctx-4"]))
                .unwrap();
        assert_eq!(msg.action, Action::Reply);
        assert_eq!(msg.reply_id().unwrap(), 3);
        assert_eq!(msg.context_id, Some(ContextId::from("ctx-4")));
        assert!(msg.code.is_none());
    }

    #[test]
    fn test_decode_numeric_context_id() {
        let msg = InboundMessage::from_value(json!(["inspect", "x", 7])).unwrap();
        assert_eq!(msg.context_id, Some(ContextId::new(7)));
        assert_eq!(msg.context_id.unwrap().to_string(), "7");
    }

    #[test]
    fn test_decode_null_context_is_initial() {
        let msg = InboundMessage::from_value(json!(["run", "1", null])).unwrap();
        assert!(msg.context_id.is_none());
        let msg = InboundMessage::from_value(json!(["run", "1"])).unwrap();
        assert!(msg.context_id.is_none());
    }

    #[test]
    fn test_decode_unknown_action_is_preserved() {
        let msg = InboundMessage::from_value(json!(["complete", "x", "ctx"])).unwrap();
        assert_eq!(msg.action, Action::Other("complete".into()));
        assert_eq!(msg.context_id, Some(ContextId::from("ctx")));
    }

    #[test]
    fn test_decode_rejects_non_tuple() {
        let err = InboundMessage::from_value(json!({"action": "run"})).unwrap_err();
        assert!(matches!(err, ProtocolError::NotATuple(_)));
        let err = InboundMessage::from_value(json!([1, 2])).unwrap_err();
        assert_eq!(err, ProtocolError::MissingAction);
    }

    #[test]
    fn test_missing_code_and_reply_id() {
        let msg = InboundMessage::from_value(json!(["run", 12, "ctx"])).unwrap();
        assert_eq!(
            msg.require_code().unwrap_err(),
            ProtocolError::MissingCode("run".into())
        );
        let msg = InboundMessage::from_value(json!(["reply", {"input": "x"}])).unwrap();
        assert_eq!(msg.reply_id().unwrap_err(), ProtocolError::MissingReplyId);
    }

    #[test]
    fn test_encode_matches_host_tuples() {
        let run = serde_json::to_value(InboundMessage::run("1+1", "ctx-1")).unwrap();
        assert_eq!(run, json!(["run", "1+1", "ctx-1"]));

        let reply = InboundMessage::reply(json!({"id": 1}), Some("ctx-4".into()));
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!(["reply", {"id": 1}, null, "ctx-4"])
        );
        let back: InboundMessage = serde_json::from_value(json!(["reply", {"id": 1}, null, "ctx-4"])).unwrap();
        assert_eq!(back, reply);
    }

    #[test]
    fn test_action_display_from_str() {
        for action in [
            Action::Run,
            Action::Inspect,
            Action::GetAllPropertyNames,
            Action::Reply,
        ] {
            assert_eq!(action.to_string().parse::<Action>().unwrap(), action);
        }
        assert_eq!(
            "bogus".parse::<Action>().unwrap(),
            Action::Other("bogus".into())
        );
    }

    #[test]
    fn test_result_message_shape() {
        let msg = EngineMessage::result(MimeBundle::single(crate::TEXT_PLAIN, "2"), true)
            .with_id(Some("ctx-1".into()));
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"id": "ctx-1", "mime": {"text/plain": "2"}, "end": true})
        );
        assert!(msg.is_end());
    }

    #[test]
    fn test_request_message_shape() {
        let msg = EngineMessage::request(RequestBody {
            id: Some(1),
            input: Some(json!({"prompt": "x?"})),
            clear: None,
        })
        .with_id(Some("ctx".into()));
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"id": "ctx", "request": {"id": 1, "input": {"prompt": "x?"}}})
        );
        assert!(!msg.is_end());
    }

    #[test]
    fn test_stream_and_online_shapes() {
        let msg = EngineMessage::stream(Stream::Stderr, "oops\n");
        assert_eq!(serde_json::to_value(&msg).unwrap(), json!({"stderr": "oops\n"}));
        assert_eq!(
            serde_json::to_value(EngineMessage::online()).unwrap(),
            json!({"status": "online"})
        );
    }

    #[test]
    fn test_inspection_uses_camel_case() {
        let inspection = Inspection {
            string: "abc".into(),
            type_name: "string".into(),
            constructor_list: vec!["String".into(), "Object".into()],
            length: Some(3),
        };
        assert_eq!(
            serde_json::to_value(&inspection).unwrap(),
            json!({"string": "abc", "type": "string", "constructorList": ["String", "Object"], "length": 3})
        );
    }

    #[test]
    fn test_mime_bundle_insert_if_absent() {
        let mut bundle = MimeBundle::single(crate::TEXT_HTML, "<b>hi</b>");
        assert!(!bundle.insert_if_absent(crate::TEXT_HTML, "<i>other</i>"));
        assert!(bundle.insert_if_absent(crate::TEXT_PLAIN, "hi"));
        assert_eq!(bundle.text(crate::TEXT_HTML), Some("<b>hi</b>"));
        assert_eq!(bundle.len(), 2);

        bundle.merge_absent(MimeBundle::single(crate::TEXT_PLAIN, "ignored"));
        assert_eq!(bundle.text(crate::TEXT_PLAIN), Some("hi"));
    }
}
