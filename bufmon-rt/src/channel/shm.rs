//! Shared-memory publication channel.
//!
//! The segment is an array of fixed-size records laid out back to back:
//!
//! ```text
//! | buffer id (u32) | site id (u64) | distance (i64) | buffer id | site id | distance | ...
//! ```
//!
//! Fields use native byte order and no padding. An all-zero slot is free, and the first
//! free slot ends the published data. Several processes may publish into the same
//! segment in turn, so a writer starts at the first free slot instead of offset zero.
//! Readers stop there too, so nothing after it is ever seen.

use super::{Channel, PublishStats};
use crate::table::{BufferTable, Distance};
use crate::{AccessSiteId, BufferId};
use anyhow::{Context, Result, bail};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr::NonNull;
use tracing::{debug, error, warn};
use zerocopy::byteorder::{I64, NativeEndian, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// One published `(buffer, site, distance)` tuple as it appears in the segment.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct DistanceRecord {
    buffer_id: U32<NativeEndian>,
    site_id: U64<NativeEndian>,
    distance: I64<NativeEndian>,
}

/// Size of one record slot in bytes.
pub const RECORD_SIZE: usize = size_of::<DistanceRecord>();

impl DistanceRecord {
    pub fn new(distance: &Distance) -> Self {
        Self {
            buffer_id: U32::new(distance.buffer_id.get()),
            site_id: U64::new(distance.site.get()),
            distance: I64::new(distance.distance),
        }
    }

    pub fn to_distance(&self) -> Distance {
        Distance {
            buffer_id: BufferId::new(self.buffer_id.get()),
            site: AccessSiteId::new(self.site_id.get()),
            distance: self.distance.get(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().iter().all(|&byte| byte == 0)
    }
}

/// Appends records to a segment image.
pub struct SegmentWriter<'a> {
    bytes: &'a mut [u8],
    /// Index of the next free slot.
    cursor: usize,
}

impl<'a> SegmentWriter<'a> {
    /// Creates a writer positioned at the first free slot of `bytes`.
    pub fn new(bytes: &'a mut [u8]) -> Self {
        let cursor = bytes
            .chunks_exact(RECORD_SIZE)
            .position(|slot| slot.iter().all(|&byte| byte == 0))
            .unwrap_or(bytes.len() / RECORD_SIZE);
        Self { bytes, cursor }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len() / RECORD_SIZE
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.cursor
    }

    /// Index of the slot the next record goes into.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Writes `distance` into the next free slot.
    ///
    /// # Returns
    /// * `true` - Record written
    /// * `false` - Segment is full, nothing written
    pub fn push(&mut self, distance: &Distance) -> bool {
        if self.remaining() == 0 {
            return false;
        }
        let start = self.cursor * RECORD_SIZE;
        let record = DistanceRecord::new(distance);
        self.bytes[start..start + RECORD_SIZE].copy_from_slice(record.as_bytes());
        self.cursor += 1;
        true
    }
}

/// Iterates over the occupied slots of a segment image, in write order.
pub struct SegmentReader<'a> {
    slots: std::slice::ChunksExact<'a, u8>,
}

impl<'a> SegmentReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            slots: bytes.chunks_exact(RECORD_SIZE),
        }
    }
}

impl Iterator for SegmentReader<'_> {
    type Item = Distance;

    fn next(&mut self) -> Option<Distance> {
        let slot = self.slots.next()?;
        let record = DistanceRecord::read_from_bytes(slot).ok()?;
        if record.is_empty() {
            return None;
        }
        Some(record.to_distance())
    }
}

/// An attached System V shared-memory segment.
#[derive(Debug)]
pub struct SharedSegment {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: The mapping stays valid until `Drop` detaches it, and all access goes through
// `&self`/`&mut self`.
unsafe impl Send for SharedSegment {}

impl SharedSegment {
    /// Creates (if needed) and attaches the segment identified by `key_path` and
    /// `project_id`.
    ///
    /// # Arguments
    /// * `key_path` - Existing file used to derive the key with `ftok`
    /// * `project_id` - Low byte mixed into the key
    /// * `size` - Segment size in bytes
    pub fn attach(key_path: &Path, project_id: i32, size: usize) -> Result<Self> {
        let c_path = CString::new(key_path.as_os_str().as_bytes())
            .with_context(|| format!("Invalid key path {}", key_path.display()))?;

        // SAFETY: `c_path` is a valid NUL-terminated string for the duration of the call.
        let key = unsafe { libc::ftok(c_path.as_ptr(), project_id) };
        if key == -1 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("ftok({}) failed", key_path.display()));
        }

        // SAFETY: Plain system call with scalar arguments.
        let shmid = unsafe { libc::shmget(key, size, libc::IPC_CREAT | 0o666) };
        if shmid < 0 {
            return Err(std::io::Error::last_os_error()).context("shmget failed");
        }

        // SAFETY: Attaching a valid segment id at a kernel-chosen address.
        let addr = unsafe { libc::shmat(shmid, std::ptr::null(), 0) };
        if addr as isize == -1 {
            return Err(std::io::Error::last_os_error()).context("shmat failed");
        }
        let Some(ptr) = NonNull::new(addr.cast::<u8>()) else {
            bail!("shmat returned a null mapping");
        };

        debug!("Attached {} byte segment (key 0x{:x}) at {:p}", size, key, ptr);
        Ok(Self { ptr, len: size })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl AsRef<[u8]> for SharedSegment {
    fn as_ref(&self) -> &[u8] {
        // SAFETY: `ptr` maps `len` bytes for as long as `self` is alive.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl AsMut<[u8]> for SharedSegment {
    fn as_mut(&mut self) -> &mut [u8] {
        // SAFETY: `ptr` maps `len` bytes for as long as `self` is alive, and `&mut self`
        // guarantees no other slice into the mapping exists in this process.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        // SAFETY: `ptr` was returned by `shmat` and is detached exactly once.
        if unsafe { libc::shmdt(self.ptr.as_ptr().cast()) } == -1 {
            error!("shmdt failed: {}", std::io::Error::last_os_error());
        }
    }
}

/// Publishes distances into a segment image.
///
/// Generic over the storage so the attached [`SharedSegment`] and plain byte buffers
/// share the same writer.
pub struct ShmChannel<S> {
    segment: S,
}

impl<S: AsMut<[u8]>> ShmChannel<S> {
    pub fn new(segment: S) -> Self {
        Self { segment }
    }

    pub fn into_inner(self) -> S {
        self.segment
    }
}

impl<S: AsMut<[u8]> + Send> Channel for ShmChannel<S> {
    fn publish(&mut self, table: &BufferTable, fallback: u64) -> Result<PublishStats> {
        let mut stats = PublishStats::default();
        if !table.has_accesses() {
            // Leave the segment untouched.
            return Ok(stats);
        }

        let mut writer = SegmentWriter::new(self.segment.as_mut());
        for distance in table.distances(fallback) {
            if writer.push(&distance) {
                stats.written += 1;
            } else {
                stats.dropped += 1;
            }
        }
        if stats.dropped > 0 {
            warn!(
                "Segment full: published {} distances, dropped {}",
                stats.written, stats.dropped
            );
        }
        Ok(stats)
    }
}
