//! The current-execution handle and console output interception.
//!
//! Exactly one context is "current" at a time: the most recent capture that
//! has not been released. Captures are tracked by generation, so releasing
//! is idempotent and may happen in any order. Console writes always reach the
//! original sink and are forwarded to the current context as `stdout` or
//! `stderr` messages.

use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use kernel_wire::Stream;
use log::trace;

use crate::channel::ChannelError;
use crate::context::ExecutionContext;

/// Where console output goes when nothing intercepts it.
pub trait OutputSink: Send + Sync {
    fn write(&self, stream: Stream, text: &str);
}

/// The process's own stdout/stderr.
#[derive(Debug, Default)]
pub struct ProcessOutput;

impl OutputSink for ProcessOutput {
    fn write(&self, stream: Stream, text: &str) {
        // Console output is best effort.
        let _ = match stream {
            Stream::Stdout => std::io::stdout().write_all(text.as_bytes()),
            Stream::Stderr => std::io::stderr().write_all(text.as_bytes()),
        };
    }
}

/// Sends both streams to stderr. Used when stdout carries the protocol.
#[derive(Debug, Default)]
pub struct StderrOutput;

impl OutputSink for StderrOutput {
    fn write(&self, _stream: Stream, text: &str) {
        let _ = std::io::stderr().write_all(text.as_bytes());
    }
}

#[derive(Default)]
struct AmbientState {
    next_generation: u64,
    captures: Vec<(u64, ExecutionContext)>,
}

pub struct Ambient {
    state: Mutex<AmbientState>,
    original: Arc<dyn OutputSink>,
}

impl Ambient {
    pub fn new(original: Arc<dyn OutputSink>) -> Self {
        Self {
            state: Mutex::new(AmbientState::default()),
            original,
        }
    }

    fn lock(&self) -> MutexGuard<'_, AmbientState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make `context` current until the returned guard is released.
    pub fn capture(self: &Arc<Self>, context: ExecutionContext) -> Capture {
        let mut state = self.lock();
        let generation = state.next_generation;
        state.next_generation += 1;
        trace!("[ambient] capture {} ({})", generation, context.label());
        state.captures.push((generation, context));
        Capture {
            ambient: Arc::downgrade(self),
            generation,
            released: false,
        }
    }

    fn release(&self, generation: u64) {
        let mut state = self.lock();
        if let Some(pos) = state.captures.iter().position(|(g, _)| *g == generation) {
            let (_, context) = state.captures.remove(pos);
            trace!("[ambient] release {} ({})", generation, context.label());
        }
    }

    pub fn current(&self) -> Option<ExecutionContext> {
        self.lock().captures.last().map(|(_, context)| context.clone())
    }

    pub fn is_captured(&self) -> bool {
        !self.lock().captures.is_empty()
    }

    /// Console write: pass through to the original sink, then forward to the
    /// current context.
    pub fn write(&self, stream: Stream, text: &str) -> Result<(), ChannelError> {
        self.original.write(stream, text);
        match self.current() {
            Some(context) => context.write_stream(stream, text),
            None => Ok(()),
        }
    }
}

/// Guard for one capture. Releasing twice is harmless; dropping releases.
pub struct Capture {
    ambient: Weak<Ambient>,
    generation: u64,
    released: bool,
}

impl Capture {
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(ambient) = self.ambient.upgrade() {
            ambient.release(self.generation);
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::test_util::{harness, RecordingOutput};
    use serde_json::json;

    #[tokio::test]
    async fn test_release_is_idempotent_and_order_independent() {
        let h = harness(EngineConfig::default());
        let ambient = Arc::new(Ambient::new(Arc::new(RecordingOutput::default())));
        let first = h.context("a");
        let second = h.context("b");

        let mut a = ambient.capture(first);
        let mut b = ambient.capture(second);
        assert_eq!(ambient.current().unwrap().label(), "context b");

        // Out of order: releasing the older capture keeps the newer current.
        a.release();
        a.release();
        assert_eq!(ambient.current().unwrap().label(), "context b");

        b.release();
        assert!(!ambient.is_captured());
        b.release();
        assert!(ambient.current().is_none());
    }

    #[tokio::test]
    async fn test_dropping_guard_releases() {
        let h = harness(EngineConfig::default());
        let ambient = Arc::new(Ambient::new(Arc::new(RecordingOutput::default())));
        {
            let _guard = ambient.capture(h.context("scoped"));
            assert!(ambient.is_captured());
        }
        assert!(!ambient.is_captured());
    }

    #[tokio::test]
    async fn test_write_passes_through_and_forwards() {
        let mut h = harness(EngineConfig::default());
        let sink = Arc::new(RecordingOutput::default());
        let ambient = Arc::new(Ambient::new(sink.clone()));

        ambient.write(Stream::Stdout, "before\n").unwrap();
        let guard = ambient.capture(h.context("w"));
        ambient.write(Stream::Stderr, "during\n").unwrap();
        drop(guard);
        ambient.write(Stream::Stdout, "after\n").unwrap();

        assert_eq!(
            sink.lines(),
            vec![
                (Stream::Stdout, "before\n".to_string()),
                (Stream::Stderr, "during\n".to_string()),
                (Stream::Stdout, "after\n".to_string()),
            ]
        );
        assert_eq!(h.next().await, json!({"id": "w", "stderr": "during\n"}));
        assert!(h.try_next().is_none());
    }
}
