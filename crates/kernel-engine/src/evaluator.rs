//! The seam between the engine and whatever actually runs code.

use std::sync::Arc;

use kernel_wire::Stream;

use crate::ambient::Ambient;
use crate::channel::ChannelError;
use crate::context::ExecutionContext;
use crate::value::Value;

/// What evaluated code can reach: its own context and the console.
pub struct Scope<'a> {
    context: &'a ExecutionContext,
    ambient: &'a Arc<Ambient>,
}

impl<'a> Scope<'a> {
    pub fn new(context: &'a ExecutionContext, ambient: &'a Arc<Ambient>) -> Self {
        Self { context, ambient }
    }

    /// The context the code is running in. Clone it to use it after
    /// evaluation returns.
    pub fn context(&self) -> &ExecutionContext {
        self.context
    }

    /// Console output, intercepted for the current context.
    pub fn print(&self, stream: Stream, text: &str) -> Result<(), ChannelError> {
        self.ambient.write(stream, text)
    }
}

/// Evaluates source code. `Err` carries the thrown value.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, code: &str, scope: &Scope<'_>) -> Result<Value, Value>;
}

/// Adapts a closure into an `Evaluator`.
pub struct FnEvaluator<F>(pub F);

impl<F> FnEvaluator<F>
where
    F: Fn(&str, &Scope<'_>) -> Result<Value, Value> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Evaluator for FnEvaluator<F>
where
    F: Fn(&str, &Scope<'_>) -> Result<Value, Value> + Send + Sync,
{
    fn evaluate(&self, code: &str, scope: &Scope<'_>) -> Result<Value, Value> {
        (self.0)(code, scope)
    }
}

impl<E: Evaluator + ?Sized> Evaluator for Arc<E> {
    fn evaluate(&self, code: &str, scope: &Scope<'_>) -> Result<Value, Value> {
        (**self).evaluate(code, scope)
    }
}
