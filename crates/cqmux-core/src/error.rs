//! Error types for the dispatch core.
//!
//! Only *recoverable* conditions appear here. Transport failures
//! (`ok == false` completions) are handled internally as disconnects and
//! never surface as errors; consuming an unknown correlation tag is an
//! invariant violation and panics, because the shared bookkeeping is no
//! longer trustworthy at that point.

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the dispatch core.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// A registration or broadcast was attempted after shutdown began.
    #[error("server is shutting down")]
    ServerStopped,

    /// A bounded broadcast gave up waiting for the previous broadcast's
    /// deliveries to settle.
    #[error("timed out waiting for prior broadcast deliveries to settle")]
    WriteTimeout,
}
