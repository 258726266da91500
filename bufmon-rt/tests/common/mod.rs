//! Common test utilities and macros

use bufmon_rt::channel::{Channel, PublishStats, RECORD_SIZE, SegmentReader, ShmChannel};
use bufmon_rt::{BufferTable, Runtime, RuntimeConfig};
use std::sync::{Arc, Mutex};

/// Number of slots in the default segment.
pub const SLOTS: usize = 30000 / RECORD_SIZE;

/// In-process stand-in for the shared segment. Clones share the same bytes.
#[derive(Clone)]
pub struct MemorySegment(Arc<Mutex<Vec<u8>>>);

impl MemorySegment {
    pub fn with_slots(slots: usize) -> Self {
        Self(Arc::new(Mutex::new(vec![0; slots * RECORD_SIZE])))
    }

    /// Tuples currently stored, in write order.
    pub fn tuples(&self) -> Vec<(u32, u64, i64)> {
        let bytes = self.0.lock().unwrap();
        SegmentReader::new(&bytes).map(|d| d.as_tuple()).collect()
    }

    pub fn is_zeroed(&self) -> bool {
        self.0.lock().unwrap().iter().all(|&b| b == 0)
    }
}

impl Channel for MemorySegment {
    fn publish(&mut self, table: &BufferTable, fallback: u64) -> anyhow::Result<PublishStats> {
        let mut bytes = self.0.lock().unwrap();
        ShmChannel::new(bytes.as_mut_slice()).publish(table, fallback)
    }
}

/// Runtime publishing into a fresh in-memory segment.
pub fn runtime_with_segment(slots: usize) -> (Runtime, MemorySegment) {
    let segment = MemorySegment::with_slots(slots);
    let runtime = Runtime::with_channel(RuntimeConfig::default(), Box::new(segment.clone()));
    (runtime, segment)
}

/// Runs `calls` against a runtime, shuts it down and returns the published tuples
/// sorted by buffer and site.
pub fn run_and_publish(calls: impl FnOnce(&mut Runtime)) -> Vec<(u32, u64, i64)> {
    let (mut runtime, segment) = runtime_with_segment(SLOTS);
    calls(&mut runtime);
    runtime.shutdown();
    let mut tuples = segment.tuples();
    tuples.sort();
    tuples
}

#[macro_export]
macro_rules! check_distances {
    ($test_name:ident, calls = |$rt:ident| $body:block, expected = [$($tuple:expr),* $(,)?]) => {
        #[test]
        fn $test_name() {
            let published = crate::common::run_and_publish(|$rt| $body);
            let mut expected: Vec<(u32, u64, i64)> = vec![$($tuple),*];
            expected.sort();
            assert_eq!(published, expected);
        }
    };
}
