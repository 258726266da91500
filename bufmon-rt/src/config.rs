//! Runtime configuration.
//!
//! Defaults match the fuzzer-side consumer. Environment variables override them:
//!
//! | Variable          | Field          |
//! |-------------------|----------------|
//! | `BUFMON_SHM_KEY`  | `shm_key_path` |
//! | `BUFMON_LOG_FILE` | `log_file`     |
//! | `BUFMON_LOG`      | `log_filter`   |

use std::path::PathBuf;

/// Size of the shared-memory segment in bytes.
pub const SHARED_MEM_SIZE: usize = 30000;

/// Size used for buffers whose extent the classifier could not determine.
pub const UNKNOWN_SIZE_FALLBACK: u64 = 10000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Existing file whose inode derives the System V segment key.
    pub shm_key_path: PathBuf,
    /// Project identifier passed to `ftok`.
    pub shm_project_id: i32,
    pub shm_size: usize,
    /// Destination of the log-file channel. Truncated on every run.
    pub log_file: PathBuf,
    pub unknown_size_fallback: u64,
    /// `tracing` filter directive for the runtime's own diagnostics.
    pub log_filter: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shm_key_path: PathBuf::from("/bin/clang"),
            shm_project_id: 1,
            shm_size: SHARED_MEM_SIZE,
            log_file: PathBuf::from("./buffer_data.log"),
            unknown_size_fallback: UNKNOWN_SIZE_FALLBACK,
            log_filter: "warn".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Builds the configuration from the defaults and the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration using `lookup` to resolve variables.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(path) = lookup("BUFMON_SHM_KEY") {
            config.shm_key_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("BUFMON_LOG_FILE") {
            config.log_file = PathBuf::from(path);
        }
        if let Some(filter) = lookup("BUFMON_LOG") {
            config.log_filter = filter;
        }
        config
    }
}
