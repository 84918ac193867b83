//! The dispatch layer: handlers, the dispatch loop, and server lifecycle.
//!
//! ## Structure
//!
//! - [`config`] - server configuration consumed by [`dispatch::Server`].
//! - [`handler`] - the object-safe seam the dispatch loop routes through.
//! - [`unary`] - one-request/one-response method handler.
//! - [`streaming`] - long-lived broadcast method handler.
//! - [`dispatch`] - the primary-queue loop and the registration API.

pub mod config;
pub mod dispatch;
pub mod handler;
pub mod streaming;
pub mod unary;
