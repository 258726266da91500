//! Runtime context.
//!
//! [`Runtime`] owns the buffer table and the publication channel for the lifetime of
//! the monitored process. Instrumented code reaches the single process instance through
//! [`with_global`], which creates it on first use and registers its shutdown with
//! `atexit`.

use crate::channel::{self, Channel, PublishStats};
use crate::config::RuntimeConfig;
use crate::table::{BufferSize, BufferTable};
use crate::{AccessSiteId, BufferId};
use std::sync::{Mutex, OnceLock, PoisonError};
use tracing::{debug, error, info, trace};
use tracing_subscriber::EnvFilter;

/// Global runtime instance used by the C ABI.
static RUNTIME: OnceLock<Mutex<Runtime>> = OnceLock::new();

/// Tracks buffers and publishes their distances at shutdown.
pub struct Runtime {
    config: RuntimeConfig,
    table: BufferTable,
    /// `None` when the channel could not be opened; tracking continues unpublished.
    channel: Option<Box<dyn Channel>>,
}

impl Runtime {
    /// Creates a runtime publishing through the channel selected at compile time.
    ///
    /// Failing to open the channel is reported and otherwise ignored.
    pub fn new(config: RuntimeConfig) -> Self {
        let channel = match channel::open(&config) {
            Ok(channel) => Some(channel),
            Err(e) => {
                error!("Buffer distances will not be published: {:#}", e);
                None
            }
        };
        Self {
            config,
            table: BufferTable::new(),
            channel,
        }
    }

    /// Creates a runtime publishing through `channel`.
    pub fn with_channel(config: RuntimeConfig, channel: Box<dyn Channel>) -> Self {
        Self {
            config,
            table: BufferTable::new(),
            channel: Some(channel),
        }
    }

    /// Creates a runtime that tracks buffers but never publishes.
    pub fn detached(config: RuntimeConfig) -> Self {
        Self {
            config,
            table: BufferTable::new(),
            channel: None,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn table(&self) -> &BufferTable {
        &self.table
    }

    /// Registers a buffer created by instrumented code.
    ///
    /// # Arguments
    /// * `id` - Identifier assigned by the classifier
    /// * `address` - Base address of the buffer
    /// * `size` - Size in bytes, or [`crate::UNKNOWN_SIZE`]
    /// * `is_realloc` - The buffer was returned by `realloc`
    pub fn store_buffer(&mut self, id: BufferId, address: usize, size: u64, is_realloc: bool) {
        trace!(
            "store_buffer({:?}, 0x{:x}, {}, {})",
            id, address, size, is_realloc
        );
        self.table
            .store_buffer(id, address, BufferSize::from_raw(size), is_realloc);
    }

    /// Registers a pointer derived from a tracked buffer as an alias of it.
    ///
    /// `id` is the identifier the classifier assigned to the derivation site. The alias
    /// record itself is attributed to the base buffer.
    pub fn store_buffer_pointer(
        &mut self,
        id: BufferId,
        buffer_address: usize,
        pointer_address: usize,
        offset: u64,
    ) {
        match self
            .table
            .store_buffer_pointer(buffer_address, pointer_address, offset)
        {
            Ok(base) => trace!(
                "Alias site {:?}: 0x{:x} -> {:?} at 0x{:x}",
                id, pointer_address, base, buffer_address
            ),
            Err(e) => trace!("Dropped alias site {:?}: {}", id, e),
        }
    }

    /// Records an access at `offset` bytes into the buffer at `address`.
    ///
    /// # Returns
    /// Whether the stored maximum for `site` changed.
    pub fn update_buffer(&mut self, site: AccessSiteId, address: usize, offset: u64) -> bool {
        self.table.update_buffer(site, address, offset)
    }

    /// Publishes every recorded distance and clears the table.
    ///
    /// Safe to call more than once; later calls find an empty table and leave the
    /// channel untouched.
    pub fn shutdown(&mut self) -> Option<PublishStats> {
        let table = self.table.take();
        let channel = self.channel.as_mut()?;
        match channel.publish(&table, self.config.unknown_size_fallback) {
            Ok(stats) => {
                debug!(
                    "Published {} distances from {} buffers",
                    stats.written,
                    table.len()
                );
                Some(stats)
            }
            Err(e) => {
                error!("Failed to publish buffer distances: {:#}", e);
                None
            }
        }
    }
}

/// Runs `f` on the process-wide runtime, creating it on first use.
pub fn with_global<R>(f: impl FnOnce(&mut Runtime) -> R) -> R {
    let runtime = RUNTIME.get_or_init(|| {
        let config = RuntimeConfig::from_env();
        init_logging(&config.log_filter);
        info!("Initializing buffer monitor runtime");
        let runtime = Runtime::new(config);
        register_exit_hook();
        Mutex::new(runtime)
    });
    let mut guard = runtime.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard)
}

/// Publishes and clears the process-wide runtime if it was ever created.
pub fn shutdown_global() -> Option<PublishStats> {
    let runtime = RUNTIME.get()?;
    runtime
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .shutdown()
}

extern "C" fn shutdown_at_exit() {
    shutdown_global();
}

fn register_exit_hook() {
    // SAFETY: `shutdown_at_exit` is a plain `extern "C"` function that never unwinds.
    if unsafe { libc::atexit(shutdown_at_exit) } != 0 {
        error!("Could not register exit hook; distances will only be published by __bufmon_fini");
    }
}

/// Sends the runtime's diagnostics to standard error. Leaves an existing subscriber
/// in place.
fn init_logging(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{RECORD_SIZE, SegmentReader, ShmChannel};
    use std::sync::{Arc, Mutex};

    /// Segment image shared with the test after the runtime takes ownership.
    #[derive(Clone, Default)]
    struct SharedBytes(Arc<Mutex<Vec<u8>>>);

    impl Channel for SharedBytes {
        fn publish(&mut self, table: &BufferTable, fallback: u64) -> anyhow::Result<PublishStats> {
            let mut bytes = self.0.lock().unwrap();
            ShmChannel::new(bytes.as_mut_slice()).publish(table, fallback)
        }
    }

    #[test]
    fn test_shutdown_publishes_once() {
        let bytes = SharedBytes(Arc::new(Mutex::new(vec![0; RECORD_SIZE * 8])));
        let mut runtime =
            Runtime::with_channel(RuntimeConfig::default(), Box::new(bytes.clone()));

        runtime.store_buffer(BufferId::new(7), 0x1000, 64, false);
        runtime.update_buffer(AccessSiteId::new(101), 0x1000, 40);

        assert_eq!(runtime.shutdown().unwrap().written, 1);
        assert!(runtime.table().is_empty());
        assert_eq!(runtime.shutdown().unwrap().written, 0);

        let image = bytes.0.lock().unwrap();
        let read: Vec<_> = SegmentReader::new(&image).map(|d| d.as_tuple()).collect();
        assert_eq!(read, vec![(7, 101, 24)]);
    }

    #[test]
    fn test_detached_runtime_still_tracks() {
        let mut runtime = Runtime::detached(RuntimeConfig::default());
        runtime.store_buffer(BufferId::new(1), 0x1000, 16, false);
        assert!(runtime.update_buffer(AccessSiteId::new(1), 0x1000, 4));
        assert_eq!(runtime.shutdown(), None);
    }

    #[test]
    fn test_alias_dropped_without_base() {
        let mut runtime = Runtime::detached(RuntimeConfig::default());
        runtime.store_buffer_pointer(BufferId::new(2), 0x1000, 0x1008, 8);
        assert!(runtime.table().is_empty());
    }
}
