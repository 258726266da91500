//! Log-file publication channel.
//!
//! Writes one line per recorded access:
//!
//! ```text
//! buffer_id: 7, access_site_id: 101, buffer_address: 0x1000, buffer_size: 64, accessed_offset: 40
//! ```

use super::{Channel, PublishStats};
use crate::table::BufferTable;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct LogFileChannel {
    path: PathBuf,
}

impl LogFileChannel {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Channel for LogFileChannel {
    fn publish(&mut self, table: &BufferTable, _fallback: u64) -> Result<PublishStats> {
        let file = File::create(&self.path)
            .with_context(|| format!("Error opening file {}", self.path.display()))?;
        let mut out = BufWriter::new(file);

        let mut stats = PublishStats::default();
        for record in table.records() {
            for entry in record.accesses() {
                writeln!(
                    out,
                    "buffer_id: {}, access_site_id: {}, buffer_address: 0x{:x}, buffer_size: {}, accessed_offset: {}",
                    record.id(),
                    entry.site,
                    record.address(),
                    record.size(),
                    entry.max_offset
                )?;
                stats.written += 1;
            }
        }
        out.flush()
            .with_context(|| format!("Error writing {}", self.path.display()))?;
        Ok(stats)
    }
}
