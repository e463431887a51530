//! Disk subsystem configuration.
//!
//! Tunables default to the values in [`crate::constants`] and can be
//! overridden with the builder-style `with_*` setters.

use crate::constants::{
    BUFFER_POOL_PIECES, DISK_JOB_QUEUE_DEPTH, FILE_HANDLE_IDLE_TIMEOUT, MAX_CONCURRENT_OPS,
    MAX_OPEN_FILES,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How piece data is laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Slots are packed densely; a slot may hold any piece.
    Compact,
    /// Slot index equals piece index; files are created sparse.
    #[default]
    Sparse,
    /// Slot index equals piece index; files are extended to full size up front.
    Full,
}

impl StorageMode {
    pub fn is_compact(self) -> bool {
        self == StorageMode::Compact
    }

    /// Whether `initialize` should pre-extend files to their final size.
    pub fn allocates_files(self) -> bool {
        self == StorageMode::Full
    }
}

/// Configuration shared by every torrent registered with a
/// [`DiskManager`](crate::disk_io::DiskManager).
#[derive(Debug, Clone)]
pub struct DiskConfig {
    /// Storage mode for newly added torrents
    pub storage_mode: StorageMode,
    /// Upper bound on open file handles across all torrents
    pub max_open_files: usize,
    /// Idle time after which a file handle may be closed
    pub file_handle_idle_timeout: Duration,
    /// Disk jobs allowed to run concurrently across all torrents
    pub max_concurrent_ops: usize,
    /// Per-torrent job queue depth
    pub job_queue_depth: usize,
    /// Scratch buffers pre-allocated in the buffer pool
    pub scratch_buffers: usize,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            storage_mode: StorageMode::default(),
            max_open_files: MAX_OPEN_FILES,
            file_handle_idle_timeout: FILE_HANDLE_IDLE_TIMEOUT,
            max_concurrent_ops: MAX_CONCURRENT_OPS,
            job_queue_depth: DISK_JOB_QUEUE_DEPTH,
            scratch_buffers: BUFFER_POOL_PIECES,
        }
    }
}

impl DiskConfig {
    pub fn with_storage_mode(mut self, mode: StorageMode) -> Self {
        self.storage_mode = mode;
        self
    }

    pub fn with_max_open_files(mut self, max_open_files: usize) -> Self {
        self.max_open_files = max_open_files.max(1);
        self
    }

    pub fn with_file_handle_idle_timeout(mut self, timeout: Duration) -> Self {
        self.file_handle_idle_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_ops(mut self, ops: usize) -> Self {
        self.max_concurrent_ops = ops.max(1);
        self
    }

    pub fn with_job_queue_depth(mut self, depth: usize) -> Self {
        self.job_queue_depth = depth.max(1);
        self
    }

    pub fn with_scratch_buffers(mut self, count: usize) -> Self {
        self.scratch_buffers = count;
        self
    }
}
