use std::time::Duration;

/// Default channel namespace shared with the host.
pub const DEFAULT_NAMESPACE: &str = "kernel";

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Channel namespace both sides tag their messages with.
    pub namespace: String,
    /// How long a reply that arrived before its request stays buffered.
    pub reply_ttl: Duration,
    /// Upper bound on buffered early replies; the oldest is evicted first.
    pub max_buffered_replies: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            reply_ttl: Duration::from_secs(60),
            max_buffered_replies: 256,
        }
    }
}
