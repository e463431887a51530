//! Disk job dispatch.
//!
//! Every torrent gets one worker task that owns its
//! [`PieceManager`](crate::piece_manager::PieceManager) and runs disk jobs
//! one at a time in the order they were submitted. Callers talk to the
//! worker through a cloneable [`TorrentDisk`] handle; each call sends a job
//! and waits for its reply.
//!
//! [`DiskManager`] registers torrents by info-hash, spawns their workers and
//! owns what they share: the open file pool, the scratch buffer pool and a
//! semaphore bounding how many jobs run at once across all torrents.
//!
//! # Examples
//!
//! ```no_run
//! use bitslot::config::{DiskConfig, StorageMode};
//! use bitslot::disk_io::DiskManager;
//! use bitslot::file_storage::FileStorage;
//! use std::path::PathBuf;
//!
//! # async fn example(hashes: Vec<[u8; 20]>) -> Result<(), Box<dyn std::error::Error>> {
//! let manager = DiskManager::new(DiskConfig::default().with_storage_mode(StorageMode::Compact));
//!
//! let mut files = FileStorage::new(32768);
//! files.add_file("album/track1.flac", 50000);
//!
//! let disk = manager.add_torrent("c12fe1c0", PathBuf::from("./downloads"), files, hashes)?;
//! disk.check_fastresume(None).await?;
//! disk.check_until_done().await?;
//!
//! println!("have {} pieces", disk.have_pieces().count());
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod job;
mod manager;
mod worker;

pub use manager::DiskManager;
pub use worker::TorrentDisk;
