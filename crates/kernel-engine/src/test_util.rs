//! Shared fixtures for unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use kernel_wire::{ContextId, Stream};

use crate::ambient::OutputSink;
use crate::channel::{memory_pair, ChannelReceiver, ChannelSender};
use crate::config::EngineConfig;
use crate::context::{ExecutionContext, Services};
use crate::render::MimeRenderer;
use crate::requester::Requester;

pub(crate) struct Harness {
    pub services: Services,
    pub requester: Arc<Requester>,
    host: ChannelReceiver,
    _host_tx: ChannelSender,
    _engine_rx: ChannelReceiver,
}

/// Engine services wired to an in-memory host whose traffic can be read back.
pub(crate) fn harness(config: EngineConfig) -> Harness {
    let (engine, host) = memory_pair();
    let (engine_tx, engine_rx) = engine.open(&config.namespace);
    let (host_tx, host_rx) = host.open(&config.namespace);
    let requester = Arc::new(Requester::new(&config));
    let services = Services {
        channel: engine_tx,
        requester: requester.clone(),
        renderer: Arc::new(MimeRenderer::new()),
    };
    Harness {
        services,
        requester,
        host: host_rx,
        _host_tx: host_tx,
        _engine_rx: engine_rx,
    }
}

impl Harness {
    pub fn context(&self, id: impl Into<serde_json::Value>) -> ExecutionContext {
        ExecutionContext::new(Some(ContextId::new(id)), self.services.clone())
    }

    /// Next message the engine sent to the host.
    pub async fn next(&mut self) -> serde_json::Value {
        tokio::time::timeout(Duration::from_secs(5), self.host.recv())
            .await
            .expect("timed out waiting for engine message")
            .expect("engine channel closed")
    }

    pub fn try_next(&mut self) -> Option<serde_json::Value> {
        self.host.try_recv()
    }
}

/// Output sink that remembers every write.
#[derive(Default)]
pub(crate) struct RecordingOutput {
    writes: Mutex<Vec<(Stream, String)>>,
}

impl RecordingOutput {
    pub fn lines(&self) -> Vec<(Stream, String)> {
        self.writes.lock().unwrap().clone()
    }
}

impl OutputSink for RecordingOutput {
    fn write(&self, stream: Stream, text: &str) {
        self.writes.lock().unwrap().push((stream, text.to_string()));
    }
}
