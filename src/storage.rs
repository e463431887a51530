//! Slot-level disk storage.
//!
//! This module moves bytes between slots and files. It knows nothing about
//! which piece a slot holds; that mapping belongs to
//! [`PieceManager`](crate::piece_manager::PieceManager).
//!
//! # Components
//!
//! - [`StorageInterface`] - Async trait for slot reads, writes and moves
//! - [`DiskStorage`] - Implementation over real files below a save path
//! - [`FilePool`] - Open file handles shared across torrents
//! - [`BufferPool`] - Reusable piece-sized scratch buffers
//!
//! # Examples
//!
//! ```no_run
//! use bitslot::file_storage::FileStorage;
//! use bitslot::storage::{BufferPool, DiskStorage, FilePool, ReadMode, StorageInterface};
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut files = FileStorage::new(16384);
//! files.add_file("movie/part1.bin", 20000).add_file("movie/part2.bin", 12768);
//!
//! let storage = DiskStorage::new(
//!     PathBuf::from("./downloads"),
//!     files,
//!     Arc::new(FilePool::default()),
//!     BufferPool::new(),
//! )?;
//! storage.initialize(false).await?;
//!
//! // Slot 1 spans both files.
//! storage.write(&[1u8; 16384], 1, 0).await?;
//! storage.swap_slots(0, 1).await?;
//!
//! let mut buf = vec![0u8; 16384];
//! storage.read(&mut buf, 0, 0, ReadMode::Exact).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! File paths are validated when a [`DiskStorage`] is created and when a
//! file is renamed. Paths containing `..` or absolute paths are rejected.

mod backend;
mod buffer_pool;
mod disk;
mod error;
mod file_pool;

pub use backend::{FileFailure, InitReport, ReadMode, StorageInterface};
pub use buffer_pool::{BufferPool, PooledBuffer};
pub use disk::DiskStorage;
pub use error::{ResumeRejection, StorageError};
pub use file_pool::{FilePool, StorageId};
