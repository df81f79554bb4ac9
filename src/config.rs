use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::pool::READER_LIMIT;
use crate::segment::directory::MAX_KEY_LENGTH;

/// Default backing size (16MB)
pub const DEFAULT_SIZE: usize = 1 << 24;

/// Default number of versions retained per key
pub const DEFAULT_HISTORY_DEPTH: usize = 1 << 8;

/// Default number of named objects the directory can hold
pub const DEFAULT_DIRECTORY_CAPACITY: usize = 4096;

/// Configuration for an MVCC container.
#[derive(Debug, Clone)]
pub struct MvccConfig {
    /// Path of the backing file (or `/dev/shm` object)
    pub path: PathBuf,

    /// Size of the backing store, fixed at creation (default: 16MB)
    pub size: usize,

    /// Versions kept per key before the oldest is overwritten (default: 256)
    pub history_depth: usize,

    /// Reader token pool capacity (default and maximum: 65532)
    pub reader_limit: usize,

    /// Maximum number of distinct keys (default: 4096)
    pub directory_capacity: usize,
}

impl Default for MvccConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./mvcc.db"),
            size: DEFAULT_SIZE,
            history_depth: DEFAULT_HISTORY_DEPTH,
            reader_limit: READER_LIMIT,
            directory_capacity: DEFAULT_DIRECTORY_CAPACITY,
        }
    }
}

impl MvccConfig {
    /// Create a new config backed by the given file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Create a new config backed by a named POSIX shared memory object
    pub fn shared_memory(name: &str) -> Self {
        Self::new(PathBuf::from("/dev/shm").join(name.trim_start_matches('/')))
    }

    /// Set backing store size
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Set per-key history depth
    pub fn history_depth(mut self, depth: usize) -> Self {
        self.history_depth = depth;
        self
    }

    /// Set reader token pool capacity
    pub fn reader_limit(mut self, limit: usize) -> Self {
        self.reader_limit = limit;
        self
    }

    /// Set directory capacity
    pub fn directory_capacity(mut self, capacity: usize) -> Self {
        self.directory_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.history_depth == 0 || self.history_depth > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "history depth {} out of range",
                self.history_depth
            )));
        }
        if self.reader_limit == 0 || self.reader_limit > READER_LIMIT {
            return Err(Error::InvalidConfig(format!(
                "reader limit {} must be between 1 and {}",
                self.reader_limit, READER_LIMIT
            )));
        }
        if self.directory_capacity == 0 || self.directory_capacity > u32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "directory capacity {} out of range",
                self.directory_capacity
            )));
        }
        if self.path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("empty path".to_string()));
        }
        Ok(())
    }
}

/// Checks a key name against the directory's fixed name width.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidKey {
            key: key.to_string(),
            reason: "key is empty",
        });
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(Error::InvalidKey {
            key: key.to_string(),
            reason: "key is longer than 31 bytes",
        });
    }
    Ok(())
}
