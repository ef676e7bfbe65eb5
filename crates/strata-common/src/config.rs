//! Configuration structures for StrataDB.

use serde::{Deserialize, Serialize};

/// Default number of buffer pool frames (1024 frames = 4 MB).
pub const DEFAULT_POOL_SIZE: usize = 1024;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of buffer pool frames.
    pub pool_size: usize,
    /// Enable write-ahead logging for crash recovery.
    pub enable_wal: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            enable_wal: true,
        }
    }
}

impl EngineConfig {
    /// Configuration with WAL disabled (no crash recovery).
    pub fn without_wal() -> Self {
        Self {
            enable_wal: false,
            ..Default::default()
        }
    }
}
