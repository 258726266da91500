//! Address-keyed buffer table.
//!
//! Maps the current base address of every tracked buffer to its metadata: the buffer
//! identifier, its size, and the largest byte offset each access site reached. At most
//! one record is live per address; registering a buffer at an occupied address evicts
//! the previous record together with all of its access entries.

use crate::{AccessSiteId, BufferId, UNKNOWN_SIZE};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, trace, warn};

/// Extent of a tracked buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferSize {
    /// Size in bytes. Zero is a genuine zero-byte buffer.
    Known(u64),
    /// The classifier could not determine the size.
    Unknown,
}

impl BufferSize {
    /// Decodes the size argument received from instrumented code.
    pub fn from_raw(raw: u64) -> Self {
        if raw == UNKNOWN_SIZE {
            BufferSize::Unknown
        } else {
            BufferSize::Known(raw)
        }
    }

    /// Returns the size used for distance computation.
    pub fn or_fallback(self, fallback: u64) -> u64 {
        match self {
            BufferSize::Known(size) => size,
            BufferSize::Unknown => fallback,
        }
    }

    /// Capacity left after skipping `offset` bytes. Saturates at zero.
    pub fn remaining(self, offset: u64) -> Self {
        match self {
            BufferSize::Known(size) => BufferSize::Known(size.saturating_sub(offset)),
            BufferSize::Unknown => BufferSize::Unknown,
        }
    }
}

impl fmt::Display for BufferSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferSize::Known(size) => write!(f, "{size}"),
            BufferSize::Unknown => write!(f, "unknown"),
        }
    }
}

/// Largest offset observed at one access site for the owning buffer.
///
/// Offsets arrive as 64-bit two's complement values. A "last byte" computed for an
/// empty copy (`len - 1` or `strlen(src) - 1` with a zero length) wraps to `-1`, which
/// lies before the buffer and never outranks a real offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessEntry {
    pub site: AccessSiteId,
    pub max_offset: i64,
}

/// One `(buffer, site, distance)` tuple ready for publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Distance {
    pub buffer_id: BufferId,
    pub site: AccessSiteId,
    /// `size - max_offset`. Negative when the access crossed the buffer's extent.
    pub distance: i64,
}

impl Distance {
    pub fn as_tuple(&self) -> (u32, u64, i64) {
        (self.buffer_id.get(), self.site.get(), self.distance)
    }
}

/// Non-fatal conditions reported by the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackError {
    /// No live record at the given address.
    MissingRecord { address: usize },
    /// Bookkeeping memory for a new access entry could not be reserved.
    OutOfMemory,
}

impl fmt::Display for TrackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackError::MissingRecord { address } => {
                write!(f, "no buffer tracked at address 0x{address:x}")
            }
            TrackError::OutOfMemory => write!(f, "out of memory for access entry"),
        }
    }
}

impl std::error::Error for TrackError {}

/// Metadata of a buffer currently live at some address.
#[derive(Debug, Clone)]
pub struct BufferRecord {
    id: BufferId,
    address: usize,
    size: BufferSize,
    /// Most buffers are touched by a handful of sites.
    accesses: SmallVec<[AccessEntry; 4]>,
}

impl BufferRecord {
    pub fn new(id: BufferId, address: usize, size: BufferSize) -> Self {
        Self {
            id,
            address,
            size,
            accesses: SmallVec::new(),
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn size(&self) -> BufferSize {
        self.size
    }

    pub fn accesses(&self) -> &[AccessEntry] {
        &self.accesses
    }

    /// Raises the maximum stored for `site` to `offset`.
    ///
    /// # Returns
    /// * `Ok(true)` - A new entry was created or the stored maximum grew
    /// * `Ok(false)` - The stored maximum was already at least `offset`
    /// * `Err(TrackError::OutOfMemory)` - A new entry could not be allocated
    fn record_access(&mut self, site: AccessSiteId, offset: i64) -> Result<bool, TrackError> {
        if let Some(entry) = self.accesses.iter_mut().find(|entry| entry.site == site) {
            if offset > entry.max_offset {
                entry.max_offset = offset;
                return Ok(true);
            }
            return Ok(false);
        }

        self.accesses
            .try_reserve(1)
            .map_err(|_| TrackError::OutOfMemory)?;
        self.accesses.push(AccessEntry {
            site,
            max_offset: offset,
        });
        Ok(true)
    }

    /// Distances of every access site recorded for this buffer.
    pub fn distances(&self, fallback: u64) -> impl Iterator<Item = Distance> + '_ {
        let size = self.size.or_fallback(fallback);
        self.accesses.iter().map(move |entry| Distance {
            buffer_id: self.id,
            site: entry.site,
            distance: distance(size, entry.max_offset),
        })
    }
}

/// `size - offset`, clamped to the `i64` range.
fn distance(size: u64, offset: i64) -> i64 {
    let delta = i128::from(size) - i128::from(offset);
    i64::try_from(delta).unwrap_or(if delta < 0 { i64::MIN } else { i64::MAX })
}

/// Tracks every live buffer by its base address.
#[derive(Debug, Default)]
pub struct BufferTable {
    /// Map from buffer base address to its record
    records: BTreeMap<usize, BufferRecord>,
}

impl BufferTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, address: usize) -> Option<&BufferRecord> {
        self.records.get(&address)
    }

    /// Records in ascending address order.
    pub fn records(&self) -> impl Iterator<Item = &BufferRecord> {
        self.records.values()
    }

    /// Every `(buffer, site, distance)` tuple, using `fallback` for unknown sizes.
    pub fn distances(&self, fallback: u64) -> impl Iterator<Item = Distance> + '_ {
        self.records
            .values()
            .flat_map(move |record| record.distances(fallback))
    }

    /// Returns true if at least one access has been recorded.
    pub fn has_accesses(&self) -> bool {
        self.records.values().any(|record| !record.accesses.is_empty())
    }

    /// Registers a buffer at `address`.
    ///
    /// A realloc always evicts the record for the old allocation first. Any record still
    /// present at the address is stale, since the allocator reused memory the runtime was
    /// never told was freed, and is evicted as well.
    ///
    /// # Returns
    /// The evicted record, if any.
    pub fn store_buffer(
        &mut self,
        id: BufferId,
        address: usize,
        size: BufferSize,
        is_realloc: bool,
    ) -> Option<BufferRecord> {
        if address == 0 {
            trace!("Ignoring buffer {:?} at null address", id);
            return None;
        }

        let mut evicted = None;
        if is_realloc {
            evicted = self.evict(address);
            if let Some(old) = &evicted {
                debug!(
                    "Realloc of {:?} at 0x{:x} discarded {} access entries",
                    old.id,
                    address,
                    old.accesses.len()
                );
            }
        }
        if let Some(stale) = self.evict(address) {
            debug!(
                "Buffer {:?} displaced stale {:?} at 0x{:x}",
                id, stale.id, address
            );
            evicted = Some(stale);
        }

        self.records
            .insert(address, BufferRecord::new(id, address, size));
        evicted
    }

    /// Registers `pointer_address` as an alias of the buffer at `buffer_address`.
    ///
    /// The alias carries the base record's identifier so that accesses through it stay
    /// attributed to the original buffer. Its capacity is what remains of the base after
    /// skipping `offset` bytes.
    pub fn store_buffer_pointer(
        &mut self,
        buffer_address: usize,
        pointer_address: usize,
        offset: u64,
    ) -> Result<BufferId, TrackError> {
        let base = self
            .records
            .get(&buffer_address)
            .ok_or(TrackError::MissingRecord {
                address: buffer_address,
            })?;
        let (id, size) = (base.id, base.size.remaining(offset));

        if pointer_address != buffer_address {
            self.store_buffer(id, pointer_address, size, false);
        }
        Ok(id)
    }

    /// Records that `site` accessed byte `offset` of the buffer at `address`.
    ///
    /// `offset` is read as a signed value (see [`AccessEntry`]).
    ///
    /// # Returns
    /// * `true` - The stored maximum for the site changed
    /// * `false` - Zero offset, no record at `address`, or no change
    pub fn update_buffer(&mut self, site: AccessSiteId, address: usize, offset: u64) -> bool {
        if offset == 0 {
            return false;
        }
        let Some(record) = self.records.get_mut(&address) else {
            trace!("Dropped {:?} access at untracked 0x{:x}", site, address);
            return false;
        };
        match record.record_access(site, offset as i64) {
            Ok(updated) => updated,
            Err(err) => {
                warn!("Abandoned {:?} access at 0x{:x}: {}", site, address, err);
                false
            }
        }
    }

    /// Removes and returns every record, leaving the table empty.
    pub fn take(&mut self) -> BufferTable {
        std::mem::take(self)
    }

    fn evict(&mut self, address: usize) -> Option<BufferRecord> {
        self.records.remove(&address)
    }
}
