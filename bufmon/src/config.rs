//! Classifier configuration.

use std::path::PathBuf;

/// Default location of the identifier checkpoint shared by all compilations.
pub const DEFAULT_ID_FILE: &str = "/var/tmp/ID.log";

/// Metadata tag marking instructions the classifier must not analyze.
pub const SKIP_MARKER: &str = "bufmon.skip";

/// Metadata tag that makes memory-safety instrumentation ignore an instruction.
pub const NO_SANITIZE: &str = "nosanitize";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierConfig {
    /// Identifier checkpoint (`BUFMON_ID_FILE`).
    pub id_file: PathBuf,
    /// Function that receives global registrations when the module defines it.
    pub entry_point: String,
    /// Register pointers produced by indexing as aliases (`BUFMON_TRACK_POINTERS`).
    pub track_buffer_pointers: bool,
    pub skip_marker: String,
    pub sanitizer_exempt_marker: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            id_file: PathBuf::from(DEFAULT_ID_FILE),
            entry_point: "main".to_string(),
            track_buffer_pointers: cfg!(feature = "track-pointers"),
            skip_marker: SKIP_MARKER.to_string(),
            sanitizer_exempt_marker: NO_SANITIZE.to_string(),
        }
    }
}

impl ClassifierConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(path) = lookup("BUFMON_ID_FILE") {
            config.id_file = PathBuf::from(path);
        }
        if let Some(value) = lookup("BUFMON_TRACK_POINTERS") {
            config.track_buffer_pointers = matches!(value.as_str(), "1" | "true" | "yes");
        }
        config
    }
}
