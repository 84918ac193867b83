//! The boundary an RPC transport implements to plug into the dispatch core.
//!
//! The core never touches a socket or a wire format. It arms one
//! [`AcceptSlot`] per method, and from then on talks to the transport
//! exclusively through [`CallContext`] and [`Responder`] trait objects,
//! observing progress as `(tag, ok)` completions on the queues it owns.

use std::sync::Arc;

use crate::guarded::Guarded;
use crate::queue::CompletionQueue;
use crate::tag::TagId;

/// Terminal status of a call, as reported to the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallStatus {
    Ok,
    /// The request was malformed or out of bounds.
    InvalidArgument(String),
    /// The user handler failed; the request itself may have been fine.
    Internal(String),
    /// The call ended because the server is going away.
    Unavailable(String),
    Cancelled,
}

impl CallStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Per-call cancellation and end-of-call notification, implemented by the
/// transport.
pub trait CallContext: Send {
    /// Arranges for `tag` to be posted on the call's event queue when the
    /// call ends for any reason — normally, by error, or by cancellation.
    ///
    /// This notification may race with the completion of a write that is
    /// still pending against the same call; the two can arrive in either
    /// order.
    fn notify_on_done(&mut self, tag: TagId);

    /// Forces the call to end. The done notification still fires.
    fn cancel(&mut self);
}

/// Write half of one accepted call, implemented by the transport.
///
/// Both operations only *issue* the send and return; the actual delivery is
/// reported later by posting `tag` on the call's event queue, so neither may
/// be assumed to have reached the client when the method returns.
pub trait Responder<Resp>: Send {
    /// Sends one message on an accepted streaming call.
    fn write(&mut self, message: Resp, tag: TagId);

    /// Sends the single response of a unary call and ends it.
    fn finish(&mut self, message: Resp, status: CallStatus, tag: TagId);
}

/// What the transport delivers when a client lands on an armed accept slot.
pub struct AcceptedCall<Req, Resp> {
    pub request: Req,
    pub context: Box<dyn CallContext>,
    pub responder: Box<dyn Responder<Resp>>,
}

/// One method's accept capability, implemented by the transport.
pub trait Transport: Send + Sync + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    /// Arms the slot for this method's next client call.
    ///
    /// The transport must eventually resolve the slot: with
    /// [`AcceptSlot::connect`] when a client arrives, or with
    /// [`AcceptSlot::reject`] once the listener shuts down and no further
    /// client can arrive.
    fn accept_next(&self, slot: AcceptSlot<Self::Request, Self::Response>);
}

/// A claim ticket for one method's next client call.
///
/// Created by the dispatch layer each time a handler arms its accept slot
/// and handed to [`Transport::accept_next`]. Resolving the slot posts the
/// arming handler's identity tag on the dispatch loop's primary queue, which
/// is what triggers `activate_next` on that handler.
pub struct AcceptSlot<Req, Resp> {
    primary: Arc<CompletionQueue>,
    accept_tag: TagId,
    events: Arc<CompletionQueue>,
    cell: Arc<Guarded<Option<AcceptedCall<Req, Resp>>>>,
}

impl<Req, Resp> AcceptSlot<Req, Resp> {
    pub(crate) fn new(
        primary: Arc<CompletionQueue>,
        accept_tag: TagId,
        events: Arc<CompletionQueue>,
        cell: Arc<Guarded<Option<AcceptedCall<Req, Resp>>>>,
    ) -> Self {
        Self {
            primary,
            accept_tag,
            events,
            cell,
        }
    }

    /// The queue on which the transport must post this call's subsequent
    /// write and done completions.
    pub fn events(&self) -> Arc<CompletionQueue> {
        Arc::clone(&self.events)
    }

    /// Resolves the slot with a newly connected client.
    pub fn connect(
        self,
        request: Req,
        context: Box<dyn CallContext>,
        responder: Box<dyn Responder<Resp>>,
    ) {
        self.cell.with(|cell| {
            *cell = Some(AcceptedCall {
                request,
                context,
                responder,
            });
        });
        self.primary.post(self.accept_tag, true);
    }

    /// Resolves the slot as failed: the listener is shutting down and no
    /// further client will arrive on it.
    pub fn reject(self) {
        self.primary.post(self.accept_tag, false);
    }
}
