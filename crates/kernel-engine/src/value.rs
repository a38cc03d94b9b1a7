//! Values produced by evaluating notebook code.
//!
//! `Value` is a tagged variant covering what an evaluator can hand back to
//! the engine. Deferred computations are native futures (`Deferred`), and
//! values that know how to render themselves opt in through `Renderable`.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use kernel_wire::MimeBundle;

/// Outcome of a settled deferred value: `Err` carries the rejection reason.
pub type Settled = Result<Value, Value>;

/// A pending computation whose outcome is delivered later.
///
/// Cloning shares the underlying future, so any clone may be awaited.
#[derive(Clone)]
pub struct Deferred(Shared<BoxFuture<'static, Settled>>);

impl Deferred {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Settled> + Send + 'static,
    {
        Self(future.boxed().shared())
    }

    pub fn resolved(value: Value) -> Self {
        Self::new(futures::future::ready(Ok(value)))
    }

    pub fn rejected(reason: Value) -> Self {
        Self::new(futures::future::ready(Err(reason)))
    }

    /// Whether the outcome is still unknown to this handle.
    pub fn is_pending(&self) -> bool {
        self.0.peek().is_none()
    }

    /// The outcome, once some clone has driven the future to completion.
    pub fn peek(&self) -> Option<&Settled> {
        self.0.peek()
    }
}

impl Future for Deferred {
    type Output = Settled;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.poll_unpin(cx)
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// Failure reported by a rendering hook.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct HookError(pub String);

/// Result of an optional rendering hook: `None` means "not supported".
pub type HookResult<T> = Option<Result<T, HookError>>;

/// Opt-in rendering and reflection capability for host-defined values.
///
/// Every hook is optional. A hook that fails (or panics) is skipped when the
/// value is rendered; it never aborts serialization of the result.
pub trait Renderable: fmt::Debug + Send + Sync {
    /// Constructor name reported by inspection.
    fn type_name(&self) -> &str;

    fn to_mime(&self) -> HookResult<MimeBundle> {
        None
    }

    fn to_html(&self) -> HookResult<String> {
        None
    }

    fn to_svg(&self) -> HookResult<String> {
        None
    }

    fn to_png(&self) -> HookResult<Bytes> {
        None
    }

    fn to_jpeg(&self) -> HookResult<Bytes> {
        None
    }

    /// Plain-text form used by the fallback inspector.
    fn inspect(&self) -> Option<String> {
        None
    }

    /// Own property names listed before the `Object` prototype.
    fn property_names(&self) -> Vec<String> {
        Vec::new()
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// An error value as thrown by evaluated code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl ErrorValue {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        let name = name.into();
        let message = message.into();
        let stack = Some(format!("{}: {}\n    at <anonymous>", name, message));
        Self {
            name,
            message,
            stack,
        }
    }

    /// Stack lines, or the `Name: message` header when no stack was captured.
    pub fn traceback(&self) -> Vec<String> {
        match &self.stack {
            Some(stack) => stack.lines().map(str::to_string).collect(),
            None => vec![self.header()],
        }
    }

    pub fn header(&self) -> String {
        if self.message.is_empty() {
            self.name.clone()
        } else {
            format!("{}: {}", self.name, self.message)
        }
    }
}

/// A plain object: optional class name plus ordered own entries.
#[derive(Debug, Clone, Default)]
pub struct Object {
    pub class: Option<String>,
    pub entries: Vec<(String, Value)>,
}

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Set `key`, replacing an existing entry in place.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

/// Result of evaluating notebook code.
#[derive(Debug, Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Bytes),
    Array(Vec<Value>),
    Object(Object),
    Function(String),
    Error(ErrorValue),
    Deferred(Deferred),
    Custom(Arc<dyn Renderable>),
}

impl Value {
    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Value::Error(ErrorValue::new(name, message))
    }

    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = Settled> + Send + 'static,
    {
        Value::Deferred(Deferred::new(future))
    }

    pub fn custom(renderable: impl Renderable + 'static) -> Self {
        Value::Custom(Arc::new(renderable))
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Value::Deferred(_))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// JavaScript truthiness.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    /// Convert a JSON value (e.g. a host reply) into a `Value`.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Object(Object {
                class: None,
                entries: map
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            }),
        }
    }

    /// JSON form, following `JSON.stringify` conventions where they apply:
    /// `undefined`, functions and non-finite numbers become `null`.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;

        match self {
            Value::Undefined | Value::Null | Value::Function(_) => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::String(s) => Json::String(s.clone()),
            Value::Bytes(bytes) => serde_json::json!({
                "type": "Buffer",
                "data": bytes.iter().copied().collect::<Vec<u8>>(),
            }),
            Value::Array(items) => Json::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(obj) => Json::Object(
                obj.entries
                    .iter()
                    .filter(|(_, v)| !matches!(v, Value::Undefined | Value::Function(_)))
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::Error(err) => serde_json::json!({
                "name": err.name,
                "message": err.message,
            }),
            Value::Deferred(_) => Json::Object(serde_json::Map::new()),
            Value::Custom(custom) => custom.to_json(),
        }
    }
}

fn number_to_json(n: f64) -> serde_json::Value {
    if !n.is_finite() {
        return serde_json::Value::Null;
    }
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        return serde_json::Value::from(n as i64);
    }
    serde_json::Number::from_f64(n)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Bytes> for Value {
    fn from(bytes: Bytes) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_deferred_resolves_and_is_shared() {
        let deferred = Deferred::resolved(Value::Number(5.0));
        let clone = deferred.clone();
        assert!(deferred.is_pending());

        let settled = clone.await.unwrap();
        assert!(matches!(settled, Value::Number(n) if n == 5.0));
        assert!(!deferred.is_pending());
        assert!(matches!(deferred.peek(), Some(Ok(Value::Number(_)))));
    }

    #[tokio::test]
    async fn test_deferred_rejection_carries_reason() {
        let deferred = Deferred::rejected(Value::error("Error", "nope"));
        match deferred.await {
            Err(Value::Error(err)) => assert_eq!(err.message, "nope"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_json_round_trip_keeps_structure() {
        let json = json!({"a": 1, "b": [true, null, "x"], "c": {"d": 2.5}});
        assert_eq!(Value::from_json(json.clone()).to_json(), json);
    }

    #[test]
    fn test_to_json_drops_undefined_and_non_finite() {
        let mut obj = Object::new();
        obj.insert("keep", Value::Number(2.0));
        obj.insert("skip", Value::Undefined);
        obj.insert("f", Value::Function("f".into()));
        assert_eq!(Value::Object(obj).to_json(), json!({"keep": 2}));
        assert_eq!(Value::Number(f64::NAN).to_json(), json!(null));
        assert_eq!(
            Value::Array(vec![Value::Undefined, Value::Number(1.5)]).to_json(),
            json!([null, 1.5])
        );
    }

    #[test]
    fn test_object_insert_replaces_in_place() {
        let mut obj = Object::new();
        obj.insert("a", Value::Number(1.0));
        obj.insert("b", Value::Number(2.0));
        obj.insert("a", Value::Number(3.0));
        assert_eq!(obj.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(matches!(obj.get("a"), Some(Value::Number(n)) if *n == 3.0));
    }

    #[test]
    fn test_error_traceback() {
        let err = ErrorValue::new("Error", "boom");
        assert_eq!(err.traceback(), vec!["Error: boom", "    at <anonymous>"]);

        let bare = ErrorValue {
            name: "TypeError".into(),
            message: "bad".into(),
            stack: None,
        };
        assert_eq!(bare.traceback(), vec!["TypeError: bad"]);
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Undefined.is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(!Value::String(String::new()).is_truthy());
        assert!(Value::Array(vec![]).is_truthy());
        assert!(Value::from("x").is_truthy());
    }
}
