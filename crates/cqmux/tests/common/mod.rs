//! In-memory mock transport used by the integration tests.
//!
//! The mock honors the transport contract the dispatch core relies on:
//! every accepted call eventually fires its done notification, and every
//! issued write eventually posts a completion — immediately in auto-ack
//! mode, or when the test decides in manual mode, which is how the
//! disconnect-during-write races are driven in both orders.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cqmux::{
    AcceptSlot, CallContext, CallStatus, CompletionQueue, Guarded, Responder, Server,
    ServerConfig, TagId, Transport,
};

const WAIT: Duration = Duration::from_secs(2);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Spins until `cond` holds, failing the test after a couple of seconds.
pub fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

/// A running server plus its dispatch thread, shut down on drop.
pub struct TestServer {
    pub server: Arc<Server>,
    dispatch: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start() -> Self {
        init_tracing();
        let server = Arc::new(Server::new(ServerConfig::default()));
        let dispatch = {
            let server = Arc::clone(&server);
            thread::spawn(move || server.run())
        };
        Self {
            server,
            dispatch: Some(dispatch),
        }
    }

    /// Shuts down and joins the dispatch thread.
    pub fn stop(&mut self) {
        self.server.shutdown();
        if let Some(dispatch) = self.dispatch.take() {
            dispatch.join().expect("dispatch thread panicked");
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ClientState<Resp> {
    events: Arc<CompletionQueue>,
    received: Vec<Resp>,
    done_tag: Option<TagId>,
    pending_writes: Vec<TagId>,
    auto_ack: bool,
    alive: bool,
    finished: Option<(Resp, CallStatus)>,
}

/// One method's accept capability. Cloneable so tests keep a handle after
/// moving it into the registration call.
pub struct MockTransport<Req, Resp> {
    slot: Arc<Guarded<Option<AcceptSlot<Req, Resp>>>>,
}

impl<Req, Resp> Clone for MockTransport<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<Req: Send + 'static, Resp: Send + 'static> MockTransport<Req, Resp> {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Guarded::new(None)),
        }
    }

    /// Lands a client on the armed accept slot, blocking until the handler
    /// has re-armed it if necessary.
    pub fn connect(&self, request: Req) -> MockClient<Resp> {
        let slot = self
            .slot
            .wait_with_timeout(WAIT, |slot| slot.is_some(), |slot| slot.take().unwrap())
            .expect("accept slot was not armed in time");
        let state = Arc::new(Guarded::new(ClientState {
            events: slot.events(),
            received: Vec::new(),
            done_tag: None,
            pending_writes: Vec::new(),
            auto_ack: true,
            alive: true,
            finished: None,
        }));
        slot.connect(
            request,
            Box::new(MockContext {
                state: Arc::clone(&state),
            }),
            Box::new(MockResponder {
                state: Arc::clone(&state),
            }),
        );
        MockClient { state }
    }

    /// Fails the armed accept slot, as a listener does when it shuts down.
    pub fn reject_pending(&self) {
        let slot = self
            .slot
            .wait_with_timeout(WAIT, |slot| slot.is_some(), |slot| slot.take().unwrap())
            .expect("accept slot was not armed in time");
        slot.reject();
    }
}

impl<Req: Send + 'static, Resp: Send + 'static> Transport for MockTransport<Req, Resp> {
    type Request = Req;
    type Response = Resp;

    fn accept_next(&self, slot: AcceptSlot<Req, Resp>) {
        self.slot.with(|armed| {
            assert!(armed.is_none(), "accept slot armed twice");
            *armed = Some(slot);
        });
        self.slot.notify_all();
    }
}

/// Test-side view of one connected client.
pub struct MockClient<Resp> {
    state: Arc<Guarded<ClientState<Resp>>>,
}

impl<Resp: Send + 'static> MockClient<Resp> {
    /// Stop acknowledging writes automatically; they queue up until
    /// [`ack_write`](Self::ack_write).
    pub fn set_manual_ack(&self) {
        self.state.with(|s| s.auto_ack = false);
    }

    /// Completes the oldest unacknowledged write. `ok == false` simulates
    /// the transport discovering mid-write that the client is gone.
    pub fn ack_write(&self, ok: bool) {
        let (events, tag) = self.state.with(|s| {
            assert!(!s.pending_writes.is_empty(), "no write to acknowledge");
            if !ok {
                s.alive = false;
            }
            (Arc::clone(&s.events), s.pending_writes.remove(0))
        });
        events.post(tag, ok);
    }

    /// Fires the call's done notification, as the transport does when the
    /// client hangs up. Pending writes stay pending: the test controls
    /// whether the done event or the write completion lands first.
    pub fn disconnect(&self) {
        let (events, done) = self.state.with(|s| {
            s.alive = false;
            (Arc::clone(&s.events), s.done_tag.take())
        });
        let done = done.expect("no done notification registered");
        events.post(done, true);
    }

    pub fn received(&self) -> Vec<Resp>
    where
        Resp: Clone,
    {
        self.state.with(|s| s.received.clone())
    }

    /// Waits for the unary response.
    pub fn response(&self) -> (Resp, CallStatus)
    where
        Resp: Clone,
    {
        self.state
            .wait_with_timeout(
                WAIT,
                |s| s.finished.is_some(),
                |s| s.finished.clone().unwrap(),
            )
            .expect("no unary response in time")
    }
}

struct MockContext<Resp> {
    state: Arc<Guarded<ClientState<Resp>>>,
}

impl<Resp: Send + 'static> CallContext for MockContext<Resp> {
    fn notify_on_done(&mut self, tag: TagId) {
        self.state.with(|s| s.done_tag = Some(tag));
    }

    fn cancel(&mut self) {
        // The transport fails every outstanding operation on a cancelled
        // call, done notification included.
        let (events, mut tags) = self.state.with(|s| {
            s.alive = false;
            let mut tags: Vec<TagId> = s.pending_writes.drain(..).collect();
            tags.extend(s.done_tag.take());
            (Arc::clone(&s.events), tags)
        });
        for tag in tags.drain(..) {
            events.post(tag, false);
        }
    }
}

struct MockResponder<Resp> {
    state: Arc<Guarded<ClientState<Resp>>>,
}

impl<Resp: Send + 'static> Responder<Resp> for MockResponder<Resp> {
    fn write(&mut self, message: Resp, tag: TagId) {
        let post = self.state.with(|s| {
            if !s.alive {
                return Some((Arc::clone(&s.events), tag, false));
            }
            s.received.push(message);
            if s.auto_ack {
                Some((Arc::clone(&s.events), tag, true))
            } else {
                s.pending_writes.push(tag);
                None
            }
        });
        if let Some((events, tag, ok)) = post {
            events.post(tag, ok);
        }
    }

    fn finish(&mut self, message: Resp, status: CallStatus, tag: TagId) {
        let events = self.state.with(|s| {
            s.finished = Some((message, status));
            Arc::clone(&s.events)
        });
        events.post(tag, true);
        self.state.notify_all();
    }
}
