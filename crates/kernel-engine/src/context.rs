//! Execution contexts: one per evaluation lifecycle.
//!
//! A context owns the completion state of one inbound message and is the
//! only way evaluated code produces output. It is cheap to clone; deferred
//! deliveries hold a clone and keep writing through it after the dispatcher
//! has moved on to the next message.
//!
//! State machine: `Active(async)` to `Done`. The first message carrying
//! `end: true` completes the context; anything sent afterwards is dropped.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::BoxFuture;
use futures::FutureExt;
use kernel_wire::{ContextId, DisplayBody, EngineMessage, RequestBody, Stream};
use log::{debug, error, warn};

use crate::channel::{ChannelError, ChannelSender};
use crate::render::{error_info, Format, MimeRenderer};
use crate::requester::{Reply, RequestError, Requester};
use crate::value::Value;

/// Shared collaborators every context writes through.
#[derive(Clone)]
pub struct Services {
    pub channel: ChannelSender,
    pub requester: Arc<Requester>,
    pub renderer: Arc<MimeRenderer>,
}

impl Services {
    /// Report a failure that escaped all per-message handling.
    pub fn report_uncaught(&self, text: &str) {
        error!("[dispatcher] uncaught: {}", text);
        if let Err(e) = self.channel.send(&EngineMessage::stream(Stream::Stderr, text)) {
            error!("[dispatcher] failed to report uncaught error: {}", e);
        }
    }
}

/// Outcome of a send from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Not transmitted: the context was done, or it is the initial context.
    Dropped,
}

/// What kind of output a value is delivered as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    Result,
    Error,
    Format(Format),
}

/// Callback form of `input`: `(error, input)`. The error is always `None`;
/// failures surface through the returned future instead.
pub type InputCallback = Box<dyn FnOnce(Option<RequestError>, serde_json::Value) + Send>;

#[derive(Debug, Default)]
struct ContextState {
    is_async: bool,
    done: bool,
}

struct Inner {
    id: Option<ContextId>,
    state: Mutex<ContextState>,
    services: Services,
}

#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ExecutionContext")
            .field("id", &self.inner.id)
            .field("is_async", &state.is_async)
            .field("done", &state.done)
            .finish()
    }
}

impl ExecutionContext {
    /// A context for `id`. `None` is the initial context, which never
    /// transmits anything.
    pub fn new(id: Option<ContextId>, services: Services) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                state: Mutex::new(ContextState::default()),
                services,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> Option<&ContextId> {
        self.inner.id.as_ref()
    }

    pub fn services(&self) -> &Services {
        &self.inner.services
    }

    pub fn renderer(&self) -> &MimeRenderer {
        &self.inner.services.renderer
    }

    /// Human-readable name for logs.
    pub fn label(&self) -> String {
        match &self.inner.id {
            Some(id) => format!("context {}", id),
            None => "initial context".to_string(),
        }
    }

    pub fn is_async(&self) -> bool {
        self.lock().is_async
    }

    pub fn is_done(&self) -> bool {
        self.lock().done
    }

    /// Mark completion as deferred (or not). Has no effect once done.
    /// Returns the resulting flag.
    pub fn set_async(&self, value: bool) -> bool {
        let mut state = self.lock();
        if !state.done {
            state.is_async = value;
        }
        state.is_async
    }

    /// Make the context reusable. Only the initial context is ever reset.
    pub(crate) fn reset(&self) {
        *self.lock() = ContextState::default();
    }

    /// Send one message on this context's stream.
    ///
    /// The first message with `end: true` completes the context. Sends after
    /// that are dropped with a warning. Transport failures propagate.
    pub fn send(&self, message: EngineMessage) -> Result<Delivery, ChannelError> {
        {
            let mut state = self.lock();
            if state.done {
                warn!("[context] {} already done, dropping message", self.label());
                return Ok(Delivery::Dropped);
            }
            if message.is_end() {
                state.done = true;
                state.is_async = false;
            }
        }

        match &self.inner.id {
            Some(id) => {
                let message = message.with_id(Some(id.clone()));
                self.inner.services.channel.send(&message)?;
                Ok(Delivery::Sent)
            }
            None => {
                debug!("[context] initial context has no stream, not sending");
                Ok(Delivery::Dropped)
            }
        }
    }

    /// Forward captured console output. Output is not a completion message,
    /// so it is sent even after the context is done.
    pub fn write_stream(&self, stream: Stream, text: &str) -> Result<(), ChannelError> {
        if let Some(id) = &self.inner.id {
            let message = EngineMessage::stream(stream, text).with_id(Some(id.clone()));
            self.inner.services.channel.send(&message)?;
        }
        Ok(())
    }

    /// Deliver `value` as `payload`.
    ///
    /// A deferred value switches the context to async and is delivered once it
    /// settles; a rejection always completes the context with an error. For
    /// ready values `keep_alive` leaves the context open (and async).
    pub fn deliver(
        &self,
        payload: Payload,
        value: Value,
        keep_alive: bool,
    ) -> Result<(), ChannelError> {
        if let Value::Deferred(deferred) = value {
            self.set_async(true);
            let context = self.clone();
            tokio::spawn(async move {
                let outcome = match AssertUnwindSafe(deferred).catch_unwind().await {
                    Ok(Ok(resolved)) => context.deliver(payload, resolved, keep_alive),
                    Ok(Err(reason)) => context
                        .send(EngineMessage::error(error_info(&reason), true))
                        .map(|_| ()),
                    Err(panic) => {
                        let text = format!(
                            "deferred value for {} panicked: {}",
                            context.label(),
                            panic_message(panic.as_ref())
                        );
                        context.services().report_uncaught(&text);
                        return;
                    }
                };
                if let Err(e) = outcome {
                    error!("[context] {} deferred delivery failed: {}", context.label(), e);
                }
            });
            return Ok(());
        }

        if keep_alive {
            self.set_async(true);
        }
        let end = !keep_alive;
        let message = match payload {
            Payload::Result => EngineMessage::result(self.renderer().render(&value), end),
            Payload::Error => EngineMessage::error(error_info(&value), end),
            Payload::Format(format) => {
                EngineMessage::result(self.renderer().format(format, &value), end)
            }
        };
        self.send(message).map(|_| ())
    }

    pub fn send_result(&self, value: Value, keep_alive: bool) -> Result<(), ChannelError> {
        self.deliver(Payload::Result, value, keep_alive)
    }

    pub fn send_error(&self, value: Value, keep_alive: bool) -> Result<(), ChannelError> {
        self.deliver(Payload::Error, value, keep_alive)
    }

    pub fn mime(&self, value: Value, keep_alive: bool) -> Result<(), ChannelError> {
        self.deliver(Payload::Format(Format::Mime), value, keep_alive)
    }

    pub fn text(&self, value: Value, keep_alive: bool) -> Result<(), ChannelError> {
        self.deliver(Payload::Format(Format::Text), value, keep_alive)
    }

    pub fn html(&self, value: Value, keep_alive: bool) -> Result<(), ChannelError> {
        self.deliver(Payload::Format(Format::Html), value, keep_alive)
    }

    pub fn svg(&self, value: Value, keep_alive: bool) -> Result<(), ChannelError> {
        self.deliver(Payload::Format(Format::Svg), value, keep_alive)
    }

    pub fn png(&self, value: Value, keep_alive: bool) -> Result<(), ChannelError> {
        self.deliver(Payload::Format(Format::Png), value, keep_alive)
    }

    pub fn jpeg(&self, value: Value, keep_alive: bool) -> Result<(), ChannelError> {
        self.deliver(Payload::Format(Format::Jpeg), value, keep_alive)
    }

    pub fn json(&self, value: Value, keep_alive: bool) -> Result<(), ChannelError> {
        self.deliver(Payload::Format(Format::Json), value, keep_alive)
    }

    /// Complete the context, optionally with a final result.
    pub fn done(&self, value: Option<Value>) -> Result<Delivery, ChannelError> {
        let message = match value {
            None => EngineMessage::end(),
            Some(value) => EngineMessage::result(self.renderer().render(&value), true),
        };
        self.send(message)
    }

    /// Ask the host for user input. Resolves to the reply's `input` field.
    pub fn input(
        &self,
        options: serde_json::Value,
        callback: Option<InputCallback>,
    ) -> BoxFuture<'static, Result<serde_json::Value, RequestError>> {
        self.set_async(true);
        let on_reply = callback.map(|callback| {
            Box::new(move |reply: &Reply| callback(None, input_field(reply)))
                as Box<dyn FnOnce(&Reply) + Send>
        });
        let request = RequestBody {
            input: Some(options),
            ..Default::default()
        };
        let pending = self
            .inner
            .services
            .requester
            .send(self, request, on_reply);
        async move { pending.await.map(|reply| input_field(&reply)) }.boxed()
    }

    /// Open a display bound to this context, optionally a named sub-display.
    pub fn display(&self, display_id: Option<&str>) -> Result<DisplayHandle, ChannelError> {
        let display_id = display_id.filter(|id| !id.is_empty()).map(str::to_string);
        if let Some(id) = &display_id {
            self.send(EngineMessage::display(DisplayBody {
                open: Some(id.clone()),
                ..Default::default()
            }))?;
        }
        Ok(DisplayHandle {
            context: self.clone(),
            display_id,
        })
    }

    /// Ask the host to clear output. No reply is expected.
    pub fn clear(&self, options: Option<serde_json::Value>) -> Result<Delivery, ChannelError> {
        let request = RequestBody {
            clear: Some(options.unwrap_or_else(|| serde_json::json!({}))),
            ..Default::default()
        };
        self.send(EngineMessage::request(request))
    }
}

fn input_field(reply: &Reply) -> serde_json::Value {
    reply
        .get("input")
        .cloned()
        .unwrap_or(serde_json::Value::Null)
}

/// Output handle for a (sub-)display of a context.
#[derive(Debug, Clone)]
pub struct DisplayHandle {
    context: ExecutionContext,
    display_id: Option<String>,
}

impl DisplayHandle {
    pub fn display_id(&self) -> Option<&str> {
        self.display_id.as_deref()
    }

    /// Send `value` rendered as `format` to this display. Deferred values are
    /// shown once they resolve.
    pub fn show(&self, format: Format, value: Value) -> Result<(), ChannelError> {
        if let Value::Deferred(deferred) = value {
            let handle = self.clone();
            tokio::spawn(async move {
                let outcome = match AssertUnwindSafe(deferred).catch_unwind().await {
                    Ok(Ok(resolved)) => handle.show(format, resolved),
                    Ok(Err(reason)) => handle
                        .context
                        .send(EngineMessage::error(error_info(&reason), true))
                        .map(|_| ()),
                    Err(panic) => {
                        let text = format!("display update panicked: {}", panic_message(panic.as_ref()));
                        handle.context.services().report_uncaught(&text);
                        return;
                    }
                };
                if let Err(e) = outcome {
                    error!("[context] display update failed: {}", e);
                }
            });
            return Ok(());
        }

        let mime = self.context.renderer().format(format, &value);
        self.context
            .send(EngineMessage::display(DisplayBody {
                display_id: self.display_id.clone(),
                mime: Some(mime),
                ..Default::default()
            }))
            .map(|_| ())
    }

    pub fn mime(&self, value: Value) -> Result<(), ChannelError> {
        self.show(Format::Mime, value)
    }

    pub fn text(&self, value: Value) -> Result<(), ChannelError> {
        self.show(Format::Text, value)
    }

    pub fn html(&self, value: Value) -> Result<(), ChannelError> {
        self.show(Format::Html, value)
    }

    pub fn svg(&self, value: Value) -> Result<(), ChannelError> {
        self.show(Format::Svg, value)
    }

    pub fn png(&self, value: Value) -> Result<(), ChannelError> {
        self.show(Format::Png, value)
    }

    pub fn jpeg(&self, value: Value) -> Result<(), ChannelError> {
        self.show(Format::Jpeg, value)
    }

    pub fn json(&self, value: Value) -> Result<(), ChannelError> {
        self.show(Format::Json, value)
    }

    /// Close a named sub-display. The main display cannot be closed.
    pub fn close(&self) -> Result<Delivery, ChannelError> {
        match &self.display_id {
            Some(id) => self.context.send(EngineMessage::display(DisplayBody {
                close: Some(id.clone()),
                ..Default::default()
            })),
            None => {
                debug!("[context] close on main display of {} ignored", self.context.label());
                Ok(Delivery::Dropped)
            }
        }
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
