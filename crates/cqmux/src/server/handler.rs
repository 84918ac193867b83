//! The seam between the dispatch loop and the two handler kinds.

use std::time::Duration;

/// One registered method, as seen by the dispatch loop.
///
/// There are exactly two implementations — unary and streaming — so this is
/// a closed set behind a single dispatch method rather than a hierarchy.
pub trait Handler: Send + Sync {
    /// Method name, for logs.
    fn method(&self) -> &str;

    /// Called on the dispatch loop thread whenever this handler's pending
    /// accept completed successfully. Must leave a fresh accept armed.
    fn activate_next(&self);

    /// Stops the handler from taking new work: subsequent broadcasts fail
    /// with `ServerStopped` and the accept slot is abandoned. Does not block.
    fn halt(&self);

    /// Tears the handler down: waits up to `drain` for in-flight deliveries,
    /// cancels whatever remains, and joins any thread the handler owns. No
    /// tag or connection owned by the handler survives this call.
    fn teardown(&self, drain: Duration);
}
