//! BufMon Runtime Library
//!
//! Linked into programs instrumented by the `bufmon` classifier. Instrumented code
//! reports every buffer it creates and every offset it accesses through the C ABI in
//! [`abi`]. At process exit the runtime computes, per access site, how far the largest
//! observed offset was from the end of its buffer and publishes these distances through
//! a shared-memory segment (or a log file when built with the `log-file` feature).
//!
//! # Threading
//!
//! The runtime targets single-threaded programs. The process-wide instance is guarded
//! by one coarse mutex so that multi-threaded targets cannot corrupt the table, but the
//! recorded maxima of concurrent accesses are only as ordered as the lock acquisitions.

use std::fmt;

pub mod abi;
pub mod channel;
pub mod config;
pub mod runtime;
pub mod table;

pub use config::RuntimeConfig;
pub use runtime::Runtime;
pub use table::{AccessEntry, BufferRecord, BufferSize, BufferTable, Distance, TrackError};

/// Size reported by the classifier when it cannot determine a buffer's extent.
///
/// A genuine zero-byte buffer is reported as `0` and is never confused with this value.
pub const UNKNOWN_SIZE: u64 = u64::MAX;

/// Identifier of a buffer, unique within a linked program.
#[repr(transparent)]
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct BufferId(u32);

impl BufferId {
    /// First identifier handed out by a fresh counter. Zero is reserved.
    pub const FIRST: Self = BufferId(1);

    pub const fn new(id: u32) -> Self {
        BufferId(id)
    }

    pub const fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf{}", self.0)
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a static access site. Lives in its own space, distinct from [`BufferId`].
#[repr(transparent)]
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct AccessSiteId(u64);

impl AccessSiteId {
    pub const FIRST: Self = AccessSiteId(1);

    pub const fn new(id: u64) -> Self {
        AccessSiteId(id)
    }

    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for AccessSiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "site{}", self.0)
    }
}

impl fmt::Display for AccessSiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
