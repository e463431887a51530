//! Storage constants and tuning parameters.
//!
//! These values mirror the defaults of long-standing BitTorrent clients,
//! with some adjustments for large torrents stored on fast disks.

use std::time::Duration;

// ============================================================================
// Block and piece sizes
// ============================================================================

/// Standard block size (16KB)
pub const BLOCK_SIZE: usize = 16384;

// ============================================================================
// File handles
// ============================================================================

/// Maximum number of file handles kept open across all torrents
pub const MAX_OPEN_FILES: usize = 512;

/// Handles unused for longer than this are closed by `evict_idle`
pub const FILE_HANDLE_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Disk jobs
// ============================================================================

/// Maximum disk jobs executing at once across all torrents
pub const MAX_CONCURRENT_OPS: usize = 512;

/// Pending jobs buffered per torrent before submitters wait
pub const DISK_JOB_QUEUE_DEPTH: usize = 256;

// ============================================================================
// Buffer pool
// ============================================================================

/// Number of piece-sized scratch buffers kept warm in the pool
pub const BUFFER_POOL_PIECES: usize = 16;

// ============================================================================
// Fast resume
// ============================================================================

/// Allowed mtime drift in compact mode, either direction (seconds)
pub const COMPACT_MTIME_SLACK: i64 = 1;

/// Allowed mtime drift into the past in sparse/full mode (seconds)
pub const SPARSE_MTIME_PAST_SLACK: i64 = 1;

/// Allowed mtime drift into the future in sparse/full mode (seconds).
/// Files may still be flushed after resume data was saved.
pub const SPARSE_MTIME_FUTURE_SLACK: i64 = 5 * 60;
