#![doc = include_str!("../README.md")]

mod server;

pub use crate::server::config::ServerConfig;
pub use crate::server::dispatch::Server;
pub use crate::server::streaming::StreamHandle;

// Everything a transport implementation or a caller needs from the core
// crate, re-exported so `cqmux` is usable on its own.
pub use cqmux_core::{
    AcceptSlot, AcceptedCall, CallContext, CallStatus, CompletionQueue, ConnId, Error, Guarded,
    Responder, Result, Tag, TagId, TagLabel, TagRegistry, Transport,
};
