//! kernel-engine: runs notebook code requests relayed over a kernel channel.
//!
//! The host sends positional action tuples (`["run", code, contextId]`) on
//! a namespaced channel. The `Dispatcher` gives each one an
//! `ExecutionContext`, evaluates the code through an `Evaluator`, and sends
//! results, errors, displays and sub-requests back. Each context sends at
//! most one message with `end: true`.

pub mod ambient;
pub mod channel;
pub mod config;
pub mod connection;
pub mod context;
pub mod dispatcher;
pub mod evaluator;
pub mod inspect;
pub mod reflect;
pub mod render;
pub mod requester;
pub mod script;
pub mod value;

#[cfg(test)]
mod test_util;

pub use ambient::{Ambient, Capture, OutputSink, ProcessOutput, StderrOutput};
pub use channel::{memory_pair, ChannelError, ChannelReceiver, ChannelSender, Endpoint, Envelope, Transport};
pub use config::EngineConfig;
pub use connection::spawn_framed;
pub use context::{Delivery, DisplayHandle, ExecutionContext, InputCallback, Payload, Services};
pub use dispatcher::Dispatcher;
pub use evaluator::{Evaluator, FnEvaluator, Scope};
pub use render::{Format, MimeRenderer, Renderer};
pub use requester::{PendingReply, Received, Reply, ReplyCallback, RequestError, Requester};
pub use script::ScriptEvaluator;
pub use value::{Deferred, ErrorValue, HookError, HookResult, Object, Renderable, Value};
