//! Per-call connection state owned by a handler.

use std::sync::Arc;

use crate::guarded::Guarded;
use crate::queue::CompletionQueue;
use crate::tag::{ConnId, TagId};
use crate::transport::{AcceptSlot, AcceptedCall, CallContext, Responder};

/// One accepted call, exclusively owned by the handler that armed the slot
/// it arrived on.
///
/// The two flags make the disconnect-during-write reconciliation explicit:
/// a connection with `write_in_flight` set must never be dropped, because
/// the transport still holds a write against it. A done notification that
/// arrives in that window sets `remove_after_write` instead, and the write's
/// own completion performs the removal.
pub struct Connection<Req, Resp> {
    pub id: ConnId,
    pub request: Req,
    pub context: Box<dyn CallContext>,
    pub responder: Box<dyn Responder<Resp>>,
    pub write_in_flight: bool,
    pub remove_after_write: bool,
}

impl<Req, Resp> Connection<Req, Resp> {
    pub fn new(id: ConnId, call: AcceptedCall<Req, Resp>) -> Self {
        Self {
            id,
            request: call.request,
            context: call.context,
            responder: call.responder,
            write_in_flight: false,
            remove_after_write: false,
        }
    }
}

/// Handler-side half of an armed accept slot.
///
/// [`arm`](Self::arm) produces the pair: the [`AcceptSlot`] goes to the
/// transport, the `PendingAccept` stays in the handler's state. At most one
/// exists per handler at any time, and a fresh one is created the moment the
/// previous one resolves — the accept slot is never left unarmed.
pub struct PendingAccept<Req, Resp> {
    cell: Arc<Guarded<Option<AcceptedCall<Req, Resp>>>>,
}

impl<Req, Resp> PendingAccept<Req, Resp> {
    /// Builds a linked (`PendingAccept`, [`AcceptSlot`]) pair.
    ///
    /// `accept_tag` is the arming handler's identity on `primary`; `events`
    /// is the handler's own queue, on which the accepted call's later
    /// completions will be posted.
    pub fn arm(
        primary: &Arc<CompletionQueue>,
        accept_tag: TagId,
        events: &Arc<CompletionQueue>,
    ) -> (Self, AcceptSlot<Req, Resp>) {
        let cell = Arc::new(Guarded::new(None));
        let slot = AcceptSlot::new(
            Arc::clone(primary),
            accept_tag,
            Arc::clone(events),
            Arc::clone(&cell),
        );
        (Self { cell }, slot)
    }

    /// Takes the call the transport connected to this slot, if any.
    pub fn take(&self) -> Option<AcceptedCall<Req, Resp>> {
        self.cell.with(Option::take)
    }
}
