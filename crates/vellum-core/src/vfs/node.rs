//! Filesystem nodes and their materialization state.

use super::cache::{Blob, RangeKey};

/// How much of a node's content is available.
///
/// The state only ever advances `Deferred → Lazy → Eager` (or straight to
/// `Eager` when exact bytes are supplied).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Materialization {
    /// Bytes are present.
    Eager(Blob),
    /// The owning bundle is cached; the slice has not been cut yet.
    Lazy(RangeKey),
    /// The owning bundle has not been fetched at all.
    Deferred(RangeKey),
}

impl Materialization {
    fn rank(&self) -> u8 {
        match self {
            Self::Deferred(_) => 0,
            Self::Lazy(_) => 1,
            Self::Eager(_) => 2,
        }
    }

    /// Whether the bytes are present.
    pub fn is_eager(&self) -> bool {
        matches!(self, Self::Eager(_))
    }
}

/// Who put a node into the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOrigin {
    /// Mounted from a bundle (eager, lazy or deferred).
    Bundle,
    /// Externally supplied package file, may shadow bundle files.
    Override,
    /// Written by the driver or the compiler during this session.
    Session,
}

/// One file in the virtual filesystem.
#[derive(Debug, Clone)]
pub struct Node {
    /// Size reported before resolution.
    pub size: u64,
    /// Materialization state.
    pub state: Materialization,
    /// Provenance.
    pub origin: NodeOrigin,
}

impl Node {
    /// A node whose bytes are known.
    pub fn eager(bytes: Blob, origin: NodeOrigin) -> Self {
        Self {
            size: bytes.len() as u64,
            state: Materialization::Eager(bytes),
            origin,
        }
    }

    /// A marker for a cached bundle slice.
    pub fn lazy(key: RangeKey) -> Self {
        Self {
            size: key.end.saturating_sub(key.start),
            state: Materialization::Lazy(key),
            origin: NodeOrigin::Bundle,
        }
    }

    /// A marker for a slice of a bundle that has not been fetched.
    pub fn deferred(key: RangeKey) -> Self {
        Self {
            size: key.end.saturating_sub(key.start),
            state: Materialization::Deferred(key),
            origin: NodeOrigin::Bundle,
        }
    }

    /// Move to `next` unless that would regress the state.
    ///
    /// Returns whether the state changed.
    pub fn advance(&mut self, next: Materialization) -> bool {
        if next.rank() < self.state.rank() {
            return false;
        }
        if let Materialization::Eager(bytes) = &next {
            self.size = bytes.len() as u64;
        }
        self.state = next;
        true
    }
}
