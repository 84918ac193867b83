//! Unary (one request, one response) method handler.
//!
//! Lifecycle per call: the dispatch loop sees the accept complete and calls
//! [`activate_next`](crate::server::handler::Handler::activate_next); the
//! handler invokes the user callback synchronously, finishes the call,
//! drains exactly one confirmation from its own event queue, and re-arms.
//! Net effect: exactly one in-flight accepted-but-unserved call per method,
//! served strictly sequentially. Concurrency across methods comes from each
//! method having its own handler.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use cqmux_core::{
    CallStatus, CompletionQueue, ConnId, Guarded, PendingAccept, TagId, TagLabel, TagRegistry,
    Transport,
};

use crate::server::handler::Handler;

/// User-supplied unary callback.
pub type UnaryFn<Req, Resp> = dyn Fn(&Req) -> (Resp, CallStatus) + Send + Sync;

pub struct UnaryHandler<T: Transport> {
    method: String,
    transport: T,
    primary: Arc<CompletionQueue>,
    /// Internal queue used solely to confirm that each finish was delivered.
    events: Arc<CompletionQueue>,
    /// This handler's identity on the primary queue.
    accept_tag: TagId,
    handler_fn: Box<UnaryFn<T::Request, T::Response>>,
    state: Guarded<UnaryState<T::Request, T::Response>>,
}

struct UnaryState<Req, Resp> {
    pending: Option<PendingAccept<Req, Resp>>,
    tags: TagRegistry,
    served: u64,
    stopped: bool,
}

impl<T: Transport> UnaryHandler<T>
where
    T::Response: Default,
{
    pub(crate) fn new(
        method: &str,
        transport: T,
        primary: Arc<CompletionQueue>,
        accept_tag: TagId,
        handler_fn: Box<UnaryFn<T::Request, T::Response>>,
    ) -> Self {
        Self {
            method: method.to_owned(),
            transport,
            primary,
            events: Arc::new(CompletionQueue::new()),
            accept_tag,
            handler_fn,
            state: Guarded::new(UnaryState {
                pending: None,
                tags: TagRegistry::new(),
                served: 0,
                stopped: false,
            }),
        }
    }

    /// Arms the accept slot. Called once after registration and again after
    /// every served call.
    pub(crate) fn rearm(&self) {
        let (pending, slot) = PendingAccept::arm(&self.primary, self.accept_tag, &self.events);
        let stopped = self.state.with(|s| {
            if s.stopped {
                return true;
            }
            s.pending = Some(pending);
            false
        });
        if !stopped {
            self.transport.accept_next(slot);
        }
    }
}

impl<T: Transport> Handler for UnaryHandler<T>
where
    T::Response: Default,
{
    fn method(&self) -> &str {
        &self.method
    }

    fn activate_next(&self) {
        if let Some(mut call) = self.state.with(|s| s.pending.take()).and_then(|p| p.take()) {
            let conn = self.state.with(|s| {
                s.served += 1;
                ConnId::new(s.served)
            });

            // A panicking user callback must not escape: it would corrupt
            // the re-arm sequence and leak the accept slot. It becomes an
            // error status on the response instead.
            let (response, status) =
                match panic::catch_unwind(AssertUnwindSafe(|| (self.handler_fn)(&call.request))) {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(method = %self.method, %conn, "unary handler panicked");
                        (
                            T::Response::default(),
                            CallStatus::Internal("request handler panicked".to_owned()),
                        )
                    }
                };

            let tag = self.state.with(|s| s.tags.make_tag(conn, TagLabel::Done));
            call.responder.finish(response, status, tag);

            // The transport posts exactly one completion per accepted call
            // once finish is issued. Anything else here means our view of
            // the call's lifecycle has diverged from the transport's.
            match self.events.next() {
                Some((fired, _ok)) if fired == tag => {
                    self.state.with(|s| {
                        s.tags.take_tag(fired);
                    });
                }
                other => panic!(
                    "unary finish confirmation violated on {}: expected {tag}, got {other:?}",
                    self.method
                ),
            }
        }

        self.rearm();
    }

    fn halt(&self) {
        self.state.with(|s| s.stopped = true);
    }

    fn teardown(&self, _drain: Duration) {
        self.state.with(|s| {
            s.stopped = true;
            // Abandon the armed slot; the transport's reject (if any) lands
            // on the primary queue after this handler is already gone and is
            // ignored there.
            s.pending = None;
            debug_assert!(s.tags.is_empty(), "unary tags are consumed synchronously");
        });
        self.events.shutdown();
        #[cfg(feature = "tracing")]
        tracing::debug!(method = %self.method, "unary handler torn down");
    }
}
