//! Front controller: turns inbound action tuples into context lifecycles.
//!
//! Per message the dispatcher releases the initial context, creates and
//! captures a fresh context, routes the action, then releases it and
//! recaptures the (reset) initial context. Only transport failures escape
//! `handle`; evaluation and protocol failures become error messages on the
//! context that caused them.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use kernel_wire::{Action, EngineMessage, InboundMessage, ProtocolError};
use log::{debug, error, info, warn};

use crate::ambient::{Ambient, Capture, OutputSink};
use crate::channel::{ChannelError, ChannelReceiver, ChannelSender};
use crate::config::EngineConfig;
use crate::context::{panic_message, ExecutionContext, Services};
use crate::evaluator::{Evaluator, Scope};
use crate::reflect::{describe, property_names};
use crate::render::MimeRenderer;
use crate::requester::{Received, Requester};
use crate::value::Value;

pub struct Dispatcher<E> {
    evaluator: E,
    services: Services,
    ambient: Arc<Ambient>,
    initial: ExecutionContext,
    initial_capture: Option<Capture>,
}

impl<E: Evaluator> Dispatcher<E> {
    pub fn new(
        evaluator: E,
        channel: ChannelSender,
        config: &EngineConfig,
        output: Arc<dyn OutputSink>,
    ) -> Self {
        let services = Services {
            channel,
            requester: Arc::new(Requester::new(config)),
            renderer: Arc::new(MimeRenderer::new()),
        };
        let ambient = Arc::new(Ambient::new(output));
        let initial = ExecutionContext::new(None, services.clone());
        let initial_capture = Some(ambient.capture(initial.clone()));
        Self {
            evaluator,
            services,
            ambient,
            initial,
            initial_capture,
        }
    }

    /// Where a host installs a custom renderer.
    pub fn renderer(&self) -> &Arc<MimeRenderer> {
        &self.services.renderer
    }

    pub fn requester(&self) -> &Arc<Requester> {
        &self.services.requester
    }

    pub fn ambient(&self) -> &Arc<Ambient> {
        &self.ambient
    }

    pub fn initial_context(&self) -> &ExecutionContext {
        &self.initial
    }

    /// Tell the host the engine is ready.
    pub fn announce(&self) -> Result<(), ChannelError> {
        info!("[dispatcher] online on channel {}", self.services.channel.namespace());
        self.services.channel.send(&EngineMessage::online())
    }

    /// Handle one raw inbound payload.
    pub fn handle(&mut self, raw: serde_json::Value) -> Result<(), ChannelError> {
        match InboundMessage::from_value(raw) {
            Ok(message) => self.handle_message(message),
            Err(e) => {
                warn!("[dispatcher] malformed inbound message: {}", e);
                self.services
                    .report_uncaught(&format!("malformed inbound message: {}", e));
                Ok(())
            }
        }
    }

    pub fn handle_message(&mut self, message: InboundMessage) -> Result<(), ChannelError> {
        debug!(
            "[dispatcher] {} for {}",
            message.action,
            message
                .context_id
                .as_ref()
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string())
        );

        if let Some(mut capture) = self.initial_capture.take() {
            capture.release();
        }

        let context = match message.action {
            Action::Reply => None,
            _ => Some(ExecutionContext::new(
                message.context_id.clone(),
                self.services.clone(),
            )),
        };
        let mut capture = context
            .as_ref()
            .map(|context| self.ambient.capture(context.clone()));

        let result = match catch_unwind(AssertUnwindSafe(|| self.route(&message, context.as_ref())))
        {
            Ok(result) => result,
            Err(panic) => {
                let text = panic_message(panic.as_ref());
                error!("[dispatcher] {} handler panicked: {}", message.action, text);
                match &context {
                    Some(context) => context.send_error(Value::error("InternalError", text), false),
                    None => {
                        self.services.report_uncaught(&text);
                        Ok(())
                    }
                }
            }
        };

        if let Some(capture) = capture.as_mut() {
            capture.release();
        }
        self.initial_capture = Some(self.ambient.capture(self.initial.clone()));
        self.initial.reset();
        result
    }

    /// Receive and handle messages until the channel closes.
    pub async fn run(mut self, mut receiver: ChannelReceiver) -> Result<(), ChannelError> {
        self.announce()?;
        while let Some(raw) = receiver.recv().await {
            self.handle(raw)?;
        }
        info!("[dispatcher] channel closed, stopping");
        Ok(())
    }

    fn route(
        &self,
        message: &InboundMessage,
        context: Option<&ExecutionContext>,
    ) -> Result<(), ChannelError> {
        let context = match (&message.action, context) {
            (Action::Reply, _) => return self.on_reply(message),
            (_, Some(context)) => context,
            (_, None) => return Ok(()),
        };
        match &message.action {
            Action::Run => self.on_run(message, context),
            Action::Inspect => self.on_inspect(message, context),
            Action::GetAllPropertyNames => self.on_property_names(message, context),
            Action::Reply => Ok(()),
            Action::Other(name) => {
                self.protocol_error(context, ProtocolError::UnknownAction(name.clone()))
            }
        }
    }

    fn evaluate(&self, code: &str, context: &ExecutionContext) -> Result<Value, Value> {
        let scope = Scope::new(context, &self.ambient);
        self.evaluator.evaluate(code, &scope)
    }

    fn protocol_error(
        &self,
        context: &ExecutionContext,
        err: ProtocolError,
    ) -> Result<(), ChannelError> {
        warn!("[dispatcher] protocol error on {}: {}", context.label(), err);
        context.send_error(Value::error("ProtocolError", err.to_string()), false)
    }

    fn on_run(&self, message: &InboundMessage, context: &ExecutionContext) -> Result<(), ChannelError> {
        let code = match message.require_code() {
            Ok(code) => code,
            Err(e) => return self.protocol_error(context, e),
        };

        match self.evaluate(code, context) {
            Err(thrown) => context.send_error(thrown, false),
            Ok(_) if context.is_done() => {
                warn!(
                    "[dispatcher] {} completed during evaluation, result not sent",
                    context.label()
                );
                Ok(())
            }
            Ok(result) if result.is_deferred() => context.send_result(result, false),
            Ok(result) if context.is_async() => {
                if !result.is_undefined() {
                    warn!(
                        "[dispatcher] {} is async but evaluation returned a ready value; not sending it",
                        context.label()
                    );
                }
                Ok(())
            }
            Ok(result) => context.send_result(result, false),
        }
    }

    fn on_inspect(
        &self,
        message: &InboundMessage,
        context: &ExecutionContext,
    ) -> Result<(), ChannelError> {
        let code = match message.require_code() {
            Ok(code) => code,
            Err(e) => return self.protocol_error(context, e),
        };
        match self.evaluate(code, context) {
            Ok(value) => context
                .send(EngineMessage::inspection(describe(&value)))
                .map(|_| ()),
            Err(thrown) => context.send_error(thrown, false),
        }
    }

    fn on_property_names(
        &self,
        message: &InboundMessage,
        context: &ExecutionContext,
    ) -> Result<(), ChannelError> {
        let code = match message.require_code() {
            Ok(code) => code,
            Err(e) => return self.protocol_error(context, e),
        };
        match self.evaluate(code, context) {
            Ok(value) => context
                .send(EngineMessage::names(property_names(&value)))
                .map(|_| ()),
            Err(thrown) => context.send_error(thrown, false),
        }
    }

    /// Replies correlate by the payload's `id`. Without one, the reply's
    /// context id picks that context's oldest pending request.
    fn on_reply(&self, message: &InboundMessage) -> Result<(), ChannelError> {
        let payload = message.reply.clone().unwrap_or(serde_json::Value::Null);
        let requester = &self.services.requester;
        let received = match (message.reply_id(), &message.context_id) {
            (Ok(id), _) => requester.receive(id, payload),
            (Err(_), Some(context_id)) => requester.receive_for_context(context_id, payload),
            (Err(e), None) => {
                warn!("[dispatcher] unusable reply: {}", e);
                return Ok(());
            }
        };
        match received {
            Received::Delivered => debug!("[dispatcher] reply delivered"),
            Received::Buffered => debug!("[dispatcher] reply arrived early, buffered"),
            Received::Ignored => {}
        }
        Ok(())
    }
}
