//! Correlation of sub-requests sent to the host with their replies.
//!
//! Each request gets a fresh monotonically increasing id. A reply can race
//! ahead of the request that expects it, so replies for ids not yet issued
//! are buffered (bounded by a TTL and a capacity) until `send` picks them up.
//! A reply without an id answers the oldest request still pending for the
//! context named in the reply. Every id is consumed exactly once.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::FutureExt;
use kernel_wire::{ContextId, EngineMessage, RequestBody};
use log::{debug, error, warn};
use tokio::sync::oneshot;

use crate::channel::ChannelError;
use crate::config::EngineConfig;
use crate::context::{Delivery, ExecutionContext};

/// Reply payload as sent by the host (`{id, input, ...}`).
pub type Reply = serde_json::Value;

/// Invoked with the reply before the pending future resolves.
pub type ReplyCallback = Box<dyn FnOnce(&Reply) + Send>;

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// The issuing context had already completed, so nothing was sent.
    #[error("request dropped: context already completed")]
    Dropped,

    /// The requester forgot the id before a reply arrived.
    #[error("request {0} abandoned before a reply arrived")]
    Abandoned(u64),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// What `receive` did with a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    Delivered,
    Buffered,
    Ignored,
}

struct Waiter {
    context: Option<ContextId>,
    callback: Option<ReplyCallback>,
    resolve: oneshot::Sender<Reply>,
}

impl Waiter {
    fn fire(self, id: u64, reply: Reply) {
        if let Some(callback) = self.callback {
            if catch_unwind(AssertUnwindSafe(|| callback(&reply))).is_err() {
                error!("[requester] callback for request {} panicked", id);
            }
        }
        // The caller may have stopped waiting; that is fine.
        let _ = self.resolve.send(reply);
    }
}

struct Buffered {
    reply: Reply,
    received_at: Instant,
}

struct State {
    next_id: u64,
    waiting: HashMap<u64, Waiter>,
    buffered: HashMap<u64, Buffered>,
}

pub struct Requester {
    state: Mutex<State>,
    reply_ttl: Duration,
    max_buffered: usize,
}

impl Requester {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 0,
                waiting: HashMap::new(),
                buffered: HashMap::new(),
            }),
            reply_ttl: config.reply_ttl,
            max_buffered: config.max_buffered_replies,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn prune(&self, state: &mut State) {
        let ttl = self.reply_ttl;
        state.buffered.retain(|id, entry| {
            let keep = entry.received_at.elapsed() < ttl;
            if !keep {
                debug!("[requester] evicting stale reply for {}", id);
            }
            keep
        });
        // Nobody can observe a reply for a waiter without a callback whose
        // receiver is gone.
        state
            .waiting
            .retain(|_, waiter| waiter.callback.is_some() || !waiter.resolve.is_closed());
    }

    /// Issue `request` through `context` and wait for the correlated reply.
    ///
    /// If the reply already arrived (and was buffered), the callback fires and
    /// the returned future resolves immediately.
    pub fn send(
        &self,
        context: &ExecutionContext,
        mut request: RequestBody,
        callback: Option<ReplyCallback>,
    ) -> PendingReply {
        let (resolve, rx) = oneshot::channel();
        let mut waiter = Some(Waiter {
            context: context.id().cloned(),
            callback,
            resolve,
        });

        let (id, early) = {
            let mut state = self.lock();
            self.prune(&mut state);
            let id = state.next_id;
            state.next_id += 1;
            let early = state.buffered.remove(&id);
            if early.is_none() {
                if let Some(waiter) = waiter.take() {
                    state.waiting.insert(id, waiter);
                }
            }
            (id, early)
        };

        request.id = Some(id);
        debug!("[requester] {} issuing request {}", context.label(), id);
        let failure = match context.send(EngineMessage::request(request)) {
            Ok(Delivery::Sent) => None,
            Ok(Delivery::Dropped) => Some(RequestError::Dropped),
            Err(e) => Some(RequestError::Channel(e)),
        };
        if let Some(err) = failure {
            self.lock().waiting.remove(&id);
            return PendingReply::failed(id, err);
        }

        if let (Some(buffered), Some(waiter)) = (early, waiter) {
            debug!("[requester] request {} answered from buffer", id);
            waiter.fire(id, buffered.reply);
        }
        PendingReply::waiting(id, rx)
    }

    /// Route a reply from the host to whoever is waiting for `id`.
    pub fn receive(&self, id: u64, reply: Reply) -> Received {
        let waiter = {
            let mut state = self.lock();
            self.prune(&mut state);
            match state.waiting.remove(&id) {
                Some(waiter) => waiter,
                None if id < state.next_id => {
                    warn!("[requester] ignoring reply for request {} (not pending)", id);
                    return Received::Ignored;
                }
                None if self.max_buffered == 0 => {
                    warn!("[requester] reply buffering disabled, ignoring {}", id);
                    return Received::Ignored;
                }
                None => {
                    while state.buffered.len() >= self.max_buffered {
                        let oldest = state
                            .buffered
                            .iter()
                            .min_by_key(|(_, entry)| entry.received_at)
                            .map(|(id, _)| *id);
                        match oldest {
                            Some(oldest) => {
                                warn!("[requester] buffer full, evicting reply {}", oldest);
                                state.buffered.remove(&oldest);
                            }
                            None => break,
                        }
                    }
                    debug!("[requester] buffering early reply {}", id);
                    state.buffered.insert(
                        id,
                        Buffered {
                            reply,
                            received_at: Instant::now(),
                        },
                    );
                    return Received::Buffered;
                }
            }
        };
        waiter.fire(id, reply);
        Received::Delivered
    }

    /// Route a reply that carries no id to the oldest request pending for
    /// `context`. Such a reply cannot be matched ahead of its request, so it
    /// is never buffered.
    pub fn receive_for_context(&self, context: &ContextId, reply: Reply) -> Received {
        let (id, waiter) = {
            let mut state = self.lock();
            self.prune(&mut state);
            let oldest = state
                .waiting
                .iter()
                .filter(|(_, waiter)| waiter.context.as_ref() == Some(context))
                .map(|(id, _)| *id)
                .min();
            match oldest.and_then(|id| state.waiting.remove(&id).map(|w| (id, w))) {
                Some(found) => found,
                None => {
                    warn!(
                        "[requester] ignoring reply without id: nothing pending for context {}",
                        context
                    );
                    return Received::Ignored;
                }
            }
        };
        debug!("[requester] reply without id matched request {}", id);
        waiter.fire(id, reply);
        Received::Delivered
    }

    pub fn pending_count(&self) -> usize {
        self.lock().waiting.len()
    }

    pub fn buffered_count(&self) -> usize {
        self.lock().buffered.len()
    }
}

enum PendingState {
    Waiting(oneshot::Receiver<Reply>),
    Failed(Option<RequestError>),
}

/// Resolves to the reply for one request.
pub struct PendingReply {
    id: u64,
    state: PendingState,
}

impl PendingReply {
    fn waiting(id: u64, rx: oneshot::Receiver<Reply>) -> Self {
        Self {
            id,
            state: PendingState::Waiting(rx),
        }
    }

    fn failed(id: u64, err: RequestError) -> Self {
        Self {
            id,
            state: PendingState::Failed(Some(err)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for PendingReply {
    type Output = Result<Reply, RequestError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let id = this.id;
        match &mut this.state {
            PendingState::Waiting(rx) => rx
                .poll_unpin(cx)
                .map(|res| res.map_err(|_| RequestError::Abandoned(id))),
            PendingState::Failed(err) => {
                Poll::Ready(Err(err.take().unwrap_or(RequestError::Abandoned(id))))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::harness;
    use serde_json::json;
    use std::sync::Arc;

    fn input_request() -> RequestBody {
        RequestBody {
            input: Some(json!({"prompt": "?"})),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_send_then_receive() {
        let mut h = harness(EngineConfig::default());
        let ctx = h.context("ctx");

        let pending = h.requester.send(&ctx, input_request(), None);
        let id = pending.id();
        let sent = h.next().await;
        assert_eq!(sent["request"]["id"], json!(id));
        assert_eq!(sent["request"]["input"], json!({"prompt": "?"}));
        assert_eq!(sent["id"], json!("ctx"));

        assert_eq!(h.requester.receive(id, json!({"id": id, "input": "42"})), Received::Delivered);
        assert_eq!(pending.await.unwrap()["input"], json!("42"));

        // Consumed exactly once.
        assert_eq!(h.requester.receive(id, json!({"id": id})), Received::Ignored);
        assert_eq!(h.requester.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_reply_before_send_is_buffered() {
        let h = harness(EngineConfig::default());
        let ctx = h.context("ctx");

        assert_eq!(h.requester.receive(0, json!({"id": 0, "input": "early"})), Received::Buffered);
        assert_eq!(h.requester.buffered_count(), 1);

        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = hits.clone();
        let pending = h.requester.send(
            &ctx,
            input_request(),
            Some(Box::new(move |reply: &Reply| {
                assert_eq!(reply["input"], json!("early"));
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })),
        );
        assert_eq!(pending.await.unwrap()["input"], json!("early"));
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(h.requester.buffered_count(), 0);
    }

    #[tokio::test]
    async fn test_buffer_capacity_evicts_oldest() {
        let config = EngineConfig {
            max_buffered_replies: 2,
            ..Default::default()
        };
        let h = harness(config);

        h.requester.receive(10, json!({}));
        h.requester.receive(11, json!({}));
        h.requester.receive(12, json!({}));
        assert_eq!(h.requester.buffered_count(), 2);
    }

    #[tokio::test]
    async fn test_buffered_replies_expire() {
        let config = EngineConfig {
            reply_ttl: Duration::ZERO,
            ..Default::default()
        };
        let h = harness(config);
        let ctx = h.context("ctx");

        h.requester.receive(0, json!({"input": "stale"}));
        let pending = h.requester.send(&ctx, input_request(), None);
        assert_eq!(pending.id(), 0);
        assert_eq!(h.requester.pending_count(), 1);
        assert_eq!(h.requester.buffered_count(), 0);
    }

    #[tokio::test]
    async fn test_reply_without_id_goes_to_oldest_request_of_context() {
        let mut h = harness(EngineConfig::default());
        let first = h.context("a");
        let other = h.context("b");

        let a0 = h.requester.send(&first, input_request(), None);
        let b1 = h.requester.send(&other, input_request(), None);
        let a2 = h.requester.send(&first, input_request(), None);
        for _ in 0..3 {
            h.next().await;
        }

        let ctx_a = ContextId::from("a");
        assert_eq!(
            h.requester.receive_for_context(&ctx_a, json!({"input": "one"})),
            Received::Delivered
        );
        assert_eq!(a0.await.unwrap()["input"], json!("one"));
        assert_eq!(
            h.requester.receive_for_context(&ctx_a, json!({"input": "two"})),
            Received::Delivered
        );
        assert_eq!(a2.await.unwrap()["input"], json!("two"));

        // Nothing left for "a"; "b" is untouched.
        assert_eq!(
            h.requester.receive_for_context(&ctx_a, json!({"input": "three"})),
            Received::Ignored
        );
        assert_eq!(h.requester.pending_count(), 1);
        assert_eq!(h.requester.buffered_count(), 0);
        assert_eq!(h.requester.receive(b1.id(), json!({"input": "b"})), Received::Delivered);
        assert_eq!(b1.await.unwrap()["input"], json!("b"));
    }

    #[tokio::test]
    async fn test_send_from_done_context_is_dropped() {
        let h = harness(EngineConfig::default());
        let ctx = h.context("ctx");
        ctx.done(None).unwrap();

        let err = h.requester.send(&ctx, input_request(), None).await.unwrap_err();
        assert!(matches!(err, RequestError::Dropped));
        assert_eq!(h.requester.pending_count(), 0);
    }
}
