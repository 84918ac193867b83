//! Correlation tags for completion-queue events.
//!
//! Every asynchronous operation handed to the transport carries a [`TagId`].
//! When the operation settles, the transport posts `(tag, ok)` on a
//! completion queue, and the consumer resolves the tag back to the logical
//! event it stands for through the issuing handler's [`TagRegistry`].
//!
//! Ids are allocated from a process-wide counter, so a tag is a stable
//! handle rather than an address: its validity never depends on the lifetime
//! of the object it describes, and ids are never reused.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TAG: AtomicU64 = AtomicU64::new(1);

/// Opaque correlation token attached to one asynchronous operation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct TagId(u64);

impl TagId {
    /// Allocates a fresh, never-reused id.
    pub fn next() -> Self {
        Self(NEXT_TAG.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag#{}", self.0)
    }
}

/// Identity of one accepted connection within its handler.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ConnId(u64);

impl ConnId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Which logical event a tag stands for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TagLabel {
    /// A write issued against the connection settled.
    Writing,
    /// The call ended, for any reason.
    Done,
}

/// The record a [`TagId`] resolves to.
#[derive(Clone, Copy, Debug)]
pub struct Tag {
    pub conn: ConnId,
    pub label: TagLabel,
}

/// Live tags issued by one handler.
///
/// The registry lives inside the owning handler's [`Guarded`] state; there
/// is no process-wide tag map.
///
/// Every tag handed to the transport must have a live entry here for as long
/// as the transport could plausibly fire it, and must be consumed exactly
/// once with [`take_tag`](Self::take_tag) by whichever code path handles the
/// corresponding event.
///
/// [`Guarded`]: crate::Guarded
#[derive(Default)]
pub struct TagRegistry {
    tags: HashMap<TagId, Tag>,
}

impl TagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates and stores a tag, returning the id to hand to the
    /// transport.
    pub fn make_tag(&mut self, conn: ConnId, label: TagLabel) -> TagId {
        let id = TagId::next();
        self.tags.insert(id, Tag { conn, label });
        id
    }

    /// Removes and returns the tag for `id`.
    ///
    /// # Panics
    ///
    /// Panics when `id` is unknown. That means an event was consumed twice
    /// or a tag was fabricated; either way the shared state can no longer be
    /// trusted, so this is not a recoverable condition.
    pub fn take_tag(&mut self, id: TagId) -> Tag {
        self.tags
            .remove(&id)
            .unwrap_or_else(|| panic!("{id} has no registry entry: double consumption or fabricated tag"))
    }

    /// Number of tags the transport has not yet fired.
    pub fn outstanding(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}
