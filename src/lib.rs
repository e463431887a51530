//! bitslot - piece storage for BitTorrent clients
//!
//! This library decides where each piece of a torrent lives on disk, checks
//! fast-resume data against the files it describes, and scans existing
//! files to find out which pieces they already hold.
//!
//! # Modules
//!
//! - [`file_storage`] - File layout of a torrent and piece/byte arithmetic
//! - [`storage`] - Slot-level disk I/O, file handle and buffer pools
//! - [`piece_manager`] - Piece/slot allocation, fast resume and full check
//! - [`disk_io`] - Per-torrent disk workers and the torrent registry
//! - [`resume`] - Fast-resume data
//! - [`bitfield`] - Set of verified pieces
//! - [`config`] - Storage mode and disk tunables

pub mod bitfield;
pub mod config;
pub mod constants;
pub mod disk_io;
pub mod file_storage;
pub mod piece_manager;
pub mod resume;
pub mod storage;

pub use bitfield::Bitfield;
pub use config::{DiskConfig, StorageMode};
pub use disk_io::{DiskManager, TorrentDisk};
pub use file_storage::{FileEntry, FileStorage};
pub use piece_manager::{CheckState, CheckStep, PieceManager, ScanOutcome, SlotEntry};
pub use resume::{FileStamp, ResumeData};
pub use storage::{DiskStorage, ReadMode, ResumeRejection, StorageError, StorageInterface};
