//! SQLite connection configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Path marking an in-memory database
pub const MEMORY_PATH: &str = ":memory:";

/// Settings applied when a connection is opened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Database file, or `:memory:`
    pub path: PathBuf,
    /// Write-ahead logging
    pub wal_mode: bool,
    pub foreign_keys: bool,
    /// How long a writer waits on a locked database
    pub busy_timeout_ms: u32,
    /// `PRAGMA cache_size`; negative values are KiB
    pub cache_size: i64,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(MEMORY_PATH),
            wal_mode: true,
            foreign_keys: true,
            busy_timeout_ms: 5000,
            cache_size: -2000,
        }
    }
}

impl SqliteConfig {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// In-memory database for tests
    pub fn memory() -> Self {
        Self {
            wal_mode: false,
            ..Default::default()
        }
    }

    pub fn is_memory(&self) -> bool {
        self.path.to_str() == Some(MEMORY_PATH)
    }

    /// Path as handed to the registry as the database name
    pub fn database(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}
