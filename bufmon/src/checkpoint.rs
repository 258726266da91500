//! Identifier checkpoint.
//!
//! Keeps buffer and access site identifiers unique across compilation units compiled
//! by separate compiler invocations. The checkpoint file holds the next identifiers to
//! hand out as two whitespace-separated integers. A compilation holds the checkpoint
//! from load to commit, so concurrent compilations get disjoint ranges.

use anyhow::{Context, Result, bail};
use bufmon_rt::{AccessSiteId, BufferId};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// Serializes checkpoint access between threads of this process. The file lock only
/// excludes other processes.
static CHECKPOINT_LOCK: Mutex<()> = Mutex::new(());

/// Next identifiers to assign. Zero is never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdCounters {
    next_buffer: u32,
    next_site: u64,
}

impl Default for IdCounters {
    fn default() -> Self {
        Self {
            next_buffer: BufferId::FIRST.get(),
            next_site: AccessSiteId::FIRST.get(),
        }
    }
}

impl IdCounters {
    pub fn new(next_buffer: u32, next_site: u64) -> Self {
        Self {
            next_buffer: next_buffer.max(1),
            next_site: next_site.max(1),
        }
    }

    pub fn peek_buffer_id(&self) -> BufferId {
        BufferId::new(self.next_buffer)
    }

    pub fn peek_site_id(&self) -> AccessSiteId {
        AccessSiteId::new(self.next_site)
    }

    pub fn next_buffer_id(&mut self) -> BufferId {
        let id = BufferId::new(self.next_buffer);
        self.next_buffer = self.next_buffer.wrapping_add(1).max(1);
        id
    }

    pub fn next_site_id(&mut self) -> AccessSiteId {
        let id = AccessSiteId::new(self.next_site);
        self.next_site = self.next_site.wrapping_add(1).max(1);
        id
    }

    /// Parses the checkpoint file format.
    pub fn parse(contents: &str) -> Result<Self> {
        let mut fields = contents.split_whitespace();
        let (Some(buffer), Some(site)) = (fields.next(), fields.next()) else {
            bail!("Expected two identifiers, found {:?}", contents.trim());
        };
        let buffer = buffer
            .parse()
            .with_context(|| format!("Invalid buffer identifier {buffer:?}"))?;
        let site = site
            .parse()
            .with_context(|| format!("Invalid access site identifier {site:?}"))?;
        Ok(Self::new(buffer, site))
    }
}

impl fmt::Display for IdCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.next_buffer, self.next_site)
    }
}

/// Exclusive hold on the checkpoint for one compilation unit.
///
/// Dropping the lease without [`CheckpointLease::commit`] releases it unchanged.
pub struct CheckpointLease {
    pub counters: IdCounters,
    path: PathBuf,
    /// `None` when the file could not be opened; counters then start fresh and are
    /// not persisted.
    file: Option<File>,
    _guard: MutexGuard<'static, ()>,
}

impl CheckpointLease {
    /// Acquires the checkpoint at `path`, creating the file if needed.
    ///
    /// Never fails: an unusable file is reported and the counters restart at 1.
    pub fn acquire(path: &Path) -> Self {
        let guard = CHECKPOINT_LOCK
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let (file, counters) = match open_locked(path) {
            Ok((file, counters)) => (Some(file), counters),
            Err(e) => {
                error!("Identifier checkpoint unavailable: {:#}", e);
                (None, IdCounters::default())
            }
        };
        debug!("Loaded identifiers {} from {}", counters, path.display());

        Self {
            counters,
            path: path.to_path_buf(),
            file,
            _guard: guard,
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.file.is_some()
    }

    /// Writes the counters back and releases the checkpoint.
    pub fn commit(self) -> Result<()> {
        let Some(mut file) = self.file else {
            bail!("Could not write identifiers to {}", self.path.display());
        };
        file.set_len(0)
            .and_then(|_| file.seek(SeekFrom::Start(0)))
            .and_then(|_| write!(file, "{}", self.counters))
            .and_then(|_| file.flush())
            .with_context(|| format!("Could not write identifiers to {}", self.path.display()))?;
        debug!("Saved identifiers {} to {}", self.counters, self.path.display());
        Ok(())
    }
}

/// Opens and locks the checkpoint file, then reads its counters.
fn open_locked(path: &Path) -> Result<(File, IdCounters)> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("Could not open {}", path.display()))?;
    file.lock()
        .with_context(|| format!("Could not lock {}", path.display()))?;

    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .with_context(|| format!("Could not read {}", path.display()))?;

    let counters = if contents.trim().is_empty() {
        info!(
            "No identifiers in {}. Will create them after the module is processed.",
            path.display()
        );
        IdCounters::default()
    } else {
        IdCounters::parse(&contents).unwrap_or_else(|e| {
            warn!("Ignoring malformed {}: {:#}", path.display(), e);
            IdCounters::default()
        })
    };
    Ok((file, counters))
}
