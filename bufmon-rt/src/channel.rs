//! Publication channels.
//!
//! A channel receives the buffer table once, at shutdown, and hands the computed
//! distances to the external consumer. Publication never blocks or retries: a full
//! segment or an unopenable file simply ends it.

pub mod log_file;
pub mod shm;

use crate::config::RuntimeConfig;
use crate::table::BufferTable;
use anyhow::Result;

pub use log_file::LogFileChannel;
pub use shm::{DistanceRecord, RECORD_SIZE, SegmentReader, SegmentWriter, SharedSegment, ShmChannel};

/// Outcome of a publication.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishStats {
    /// Tuples written to the channel.
    pub written: usize,
    /// Tuples dropped because the channel was full.
    pub dropped: usize,
}

/// Sink for the distances computed at shutdown.
pub trait Channel: Send {
    /// Publishes every access recorded in `table`.
    ///
    /// # Arguments
    /// * `table` - The buffer table at shutdown
    /// * `fallback` - Size assumed for buffers of unknown size
    fn publish(&mut self, table: &BufferTable, fallback: u64) -> Result<PublishStats>;
}

/// Opens the channel selected at compile time.
pub fn open(config: &RuntimeConfig) -> Result<Box<dyn Channel>> {
    if cfg!(feature = "log-file") {
        Ok(Box::new(LogFileChannel::new(config.log_file.clone())))
    } else {
        let segment = SharedSegment::attach(
            &config.shm_key_path,
            config.shm_project_id,
            config.shm_size,
        )?;
        Ok(Box::new(ShmChannel::new(segment)))
    }
}
