#![doc = include_str!("../README.md")]

mod connection;
mod error;
mod guarded;
mod queue;
mod tag;
mod transport;

pub use crate::connection::*;
pub use crate::error::*;
pub use crate::guarded::*;
pub use crate::queue::*;
pub use crate::tag::*;
pub use crate::transport::*;
