//! Server-streaming method handler with ordered broadcast.
//!
//! One handler serves an unbounded number of long-lived clients for a single
//! streaming method. Two threads touch its state, always through the
//! [`Guarded`] monitor:
//!
//! 1. the dispatch loop thread, via `activate_next` when the pending
//!    accept completes;
//! 2. the handler's own synchronization thread, which drains the handler's
//!    event queue and reconciles each `(tag, ok)` pair against the tag
//!    registry.
//!
//! The subtle case is a client disconnecting while a broadcast write to it
//! is still pending: the write's completion (with `ok == false`) and the
//! call's done notification can arrive in either order. The reconciliation
//! below frees the connection exactly once and treats whichever event lands
//! second as a no-op.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cqmux_core::{
    CompletionQueue, ConnId, Connection, Error, Guarded, PendingAccept, Result, Tag, TagId,
    TagLabel, TagRegistry, Transport,
};

use crate::server::handler::Handler;

/// User-supplied on-connect callback, invoked with each new client's initial
/// request.
pub type OnConnectFn<Req> = dyn Fn(&Req) + Send + Sync;

pub struct StreamingHandler<T: Transport>
where
    T::Response: Clone,
{
    method: String,
    transport: T,
    primary: Arc<CompletionQueue>,
    /// Secondary queue carrying this handler's write and done completions.
    events: Arc<CompletionQueue>,
    /// This handler's identity on the primary queue.
    accept_tag: TagId,
    on_connect: Box<OnConnectFn<T::Request>>,
    state: Guarded<StreamState<T::Request, T::Response>>,
    sync_thread: Guarded<Option<JoinHandle<()>>>,
}

struct StreamState<Req, Resp> {
    pending: Option<PendingAccept<Req, Resp>>,
    active: HashMap<ConnId, Connection<Req, Resp>>,
    /// Writes issued by the last broadcast that the transport has not yet
    /// accounted for. Broadcasts are serialized on this reaching zero.
    in_flight: usize,
    tags: TagRegistry,
    next_conn: u64,
    stopped: bool,
}

impl<T: Transport> StreamingHandler<T>
where
    T::Response: Clone,
{
    pub(crate) fn new(
        method: &str,
        transport: T,
        primary: Arc<CompletionQueue>,
        accept_tag: TagId,
        on_connect: Box<OnConnectFn<T::Request>>,
    ) -> Self {
        Self {
            method: method.to_owned(),
            transport,
            primary,
            events: Arc::new(CompletionQueue::new()),
            accept_tag,
            on_connect,
            state: Guarded::new(StreamState {
                pending: None,
                active: HashMap::new(),
                in_flight: 0,
                tags: TagRegistry::new(),
                next_conn: 0,
                stopped: false,
            }),
            sync_thread: Guarded::new(None),
        }
    }

    /// Spawns the synchronization thread and arms the first accept. Called
    /// once, after the handler is registered with the dispatch loop.
    pub(crate) fn start(handler: &Arc<Self>) {
        let me = Arc::clone(handler);
        let thread = thread::Builder::new()
            .name(format!("cqmux-sync-{}", handler.method))
            .spawn(move || me.sync_loop())
            .expect("failed to spawn handler synchronization thread");
        handler.sync_thread.with(|slot| *slot = Some(thread));
        handler.rearm();
    }

    fn rearm(&self) {
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

    /// Broadcasts `update` to every active client.
    ///
    /// Blocks until no delivery from a *previous* broadcast is outstanding,
    /// which is what keeps successive broadcasts globally ordered: every
    /// client observes updates in the same relative order. Does not wait for
    /// the deliveries it issues itself. Returns immediately when no client
    /// is connected.
    pub fn write(&self, update: T::Response) -> Result<()> {
        self.state
            .wait_with(|s| s.stopped || s.in_flight == 0, |s| Self::fan_out(s, update))
    }

    /// Bounded variant of [`write`](Self::write) for callers that cannot
    /// afford to wedge behind a stalled client.
    pub fn write_timeout(&self, update: T::Response, timeout: Duration) -> Result<()> {
        self.state
            .wait_with_timeout(
                timeout,
                |s| s.stopped || s.in_flight == 0,
                |s| Self::fan_out(s, update),
            )
            .unwrap_or(Err(Error::WriteTimeout))
    }

    /// Number of currently connected clients.
    pub fn active_clients(&self) -> usize {
        self.state.with(|s| s.active.len())
    }

    /// Number of correlation tags the transport has not yet fired.
    pub fn outstanding_tags(&self) -> usize {
        self.state.with(|s| s.tags.outstanding())
    }

    /// Issues one tagged write per active connection. Runs under the state
    /// lock, but only mutates bookkeeping: `Responder::write` merely issues
    /// the send, it never performs the network write itself.
    fn fan_out(s: &mut StreamState<T::Request, T::Response>, update: T::Response) -> Result<()> {
        if s.stopped {
            return Err(Error::ServerStopped);
        }
        debug_assert_eq!(s.in_flight, 0);
        let StreamState {
            active,
            in_flight,
            tags,
            ..
        } = s;
        for (id, conn) in active {
            let tag = tags.make_tag(*id, TagLabel::Writing);
            conn.responder.write(update.clone(), tag);
            conn.write_in_flight = true;
            *in_flight += 1;
        }
        Ok(())
    }

    /// Drains the handler's event queue until it shuts down.
    fn sync_loop(&self) {
        #[cfg(feature = "tracing")]
        tracing::trace!(method = %self.method, "synchronization thread started");

        while let Some((tag, ok)) = self.events.next() {
            self.reconcile(tag, ok);
        }

        // Queue shut down and fully drained: no further event can settle a
        // broadcast, so make any blocked writer observe `stopped`.
        self.state.with(|s| s.stopped = true);
        self.state.notify_all();

        #[cfg(feature = "tracing")]
        tracing::trace!(method = %self.method, "synchronization thread stopped");
    }

    fn reconcile(&self, tag: TagId, ok: bool) {
        self.state.with(|s| {
            let Tag { conn, label } = s.tags.take_tag(tag);
            let remove_now = match label {
                TagLabel::Writing => {
                    debug_assert!(s.in_flight > 0);
                    s.in_flight -= 1;
                    match s.active.get_mut(&conn) {
                        Some(c) => {
                            debug_assert!(c.write_in_flight);
                            c.write_in_flight = false;
                            // A failed write means the client is gone; a
                            // done notification seen mid-write deferred its
                            // removal to us.
                            !ok || c.remove_after_write
                        }
                        None => false,
                    }
                }
                TagLabel::Done => {
                    match s.active.get_mut(&conn) {
                        // A write is still outstanding with the transport:
                        // defer, its completion performs the removal.
                        Some(c) if c.write_in_flight => {
                            c.remove_after_write = true;
                            false
                        }
                        // The disconnect is unambiguous: nothing is pending
                        // against the connection, erase it now.
                        Some(_) => true,
                        // Already erased by a failed write.
                        None => false,
                    }
                }
            };
            if remove_now {
                s.active.remove(&conn);
                #[cfg(feature = "tracing")]
                tracing::debug!(method = %self.method, %conn, "client disconnected");
            }
        });
        // Writers wait for in_flight == 0; wake them to re-check.
        self.state.notify_all();
    }
}

impl<T: Transport> Handler for StreamingHandler<T>
where
    T::Response: Clone,
{
    fn method(&self) -> &str {
        &self.method
    }

    /// A client landed on the pending slot: run the on-connect callback,
    /// move the connection into the active set, register its done
    /// notification, and unconditionally re-arm a fresh accept.
    fn activate_next(&self) {
        if let Some(call) = self.state.with(|s| s.pending.take()).and_then(|p| p.take()) {
            (self.on_connect)(&call.request);
            self.state.with(|s| {
                s.next_conn += 1;
                let id = ConnId::new(s.next_conn);
                let mut conn = Connection::new(id, call);
                let done = s.tags.make_tag(id, TagLabel::Done);
                conn.context.notify_on_done(done);
                s.active.insert(id, conn);
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    method = %self.method, %id, clients = s.active.len(),
                    "client connected"
                );
            });
        }
        self.rearm();
    }

    fn halt(&self) {
        self.state.with(|s| s.stopped = true);
        self.state.notify_all();
    }

    fn teardown(&self, drain: Duration) {
        // Refuse new broadcasts and abandon the armed accept slot.
        self.state.with(|s| {
            s.stopped = true;
            s.pending = None;
        });
        self.state.notify_all();

        // Give in-flight deliveries until the deadline to settle, then force
        // the transport to end every remaining call.
        let drained = self
            .state
            .wait_with_timeout(drain, |s| s.in_flight == 0, |_| ())
            .is_some();
        if !drained {
            #[cfg(feature = "tracing")]
            tracing::warn!(method = %self.method, "drain deadline hit, cancelling remaining calls");
        }
        self.state.with(|s| {
            for conn in s.active.values_mut() {
                conn.context.cancel();
            }
        });

        // Close the event queue; the synchronization thread drains whatever
        // is left (each event reported failed), consumes the matching tags,
        // and exits. Joining it guarantees no tag or connection we own
        // outlives the handler.
        self.events.shutdown();
        if let Some(handle) = self.sync_thread.with(Option::take) {
            let _ = handle.join();
        }
        self.state.with(|s| {
            s.active.clear();
            s.in_flight = 0;
        });

        #[cfg(feature = "tracing")]
        tracing::debug!(method = %self.method, "streaming handler torn down");
    }
}

/// Broadcast capability handed back by
/// [`Server::register_streaming`](crate::Server::register_streaming) — the
/// only surface callers outside the dispatch core interact with.
pub struct StreamHandle<Resp> {
    inner: Arc<dyn StreamSink<Resp>>,
}

impl<Resp> StreamHandle<Resp> {
    pub(crate) fn new(inner: Arc<dyn StreamSink<Resp>>) -> Self {
        Self { inner }
    }

    /// Broadcasts one update to every connected client. See
    /// [`StreamingHandler::write`] for the ordering contract.
    pub fn write(&self, update: Resp) -> Result<()> {
        self.inner.write(update)
    }

    /// Like [`write`](Self::write), but gives up with
    /// [`Error::WriteTimeout`] when the previous broadcast has not settled
    /// within `timeout`.
    pub fn write_timeout(&self, update: Resp, timeout: Duration) -> Result<()> {
        self.inner.write_timeout(update, timeout)
    }

    /// Number of currently connected clients.
    pub fn active_clients(&self) -> usize {
        self.inner.active_clients()
    }

    /// Number of correlation tags the transport has not yet fired. Zero
    /// after a clean shutdown.
    pub fn outstanding_tags(&self) -> usize {
        self.inner.outstanding_tags()
    }
}

impl<Resp> Clone for StreamHandle<Resp> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Object-safe view of a streaming handler, so [`StreamHandle`] is generic
/// over the response type alone rather than the whole transport.
pub(crate) trait StreamSink<Resp>: Send + Sync {
    fn write(&self, update: Resp) -> Result<()>;
    fn write_timeout(&self, update: Resp, timeout: Duration) -> Result<()>;
    fn active_clients(&self) -> usize;
    fn outstanding_tags(&self) -> usize;
}

impl<T: Transport> StreamSink<T::Response> for StreamingHandler<T>
where
    T::Response: Clone,
{
    fn write(&self, update: T::Response) -> Result<()> {
        StreamingHandler::write(self, update)
    }

    fn write_timeout(&self, update: T::Response, timeout: Duration) -> Result<()> {
        StreamingHandler::write_timeout(self, update, timeout)
    }

    fn active_clients(&self) -> usize {
        StreamingHandler::active_clients(self)
    }

    fn outstanding_tags(&self) -> usize {
        StreamingHandler::outstanding_tags(self)
    }
}
