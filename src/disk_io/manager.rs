use super::worker::TorrentDisk;
use crate::config::DiskConfig;
use crate::file_storage::FileStorage;
use crate::piece_manager::PieceManager;
use crate::storage::{BufferPool, DiskStorage, FilePool, StorageError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

struct Registered {
    disk: TorrentDisk,
    worker: JoinHandle<()>,
}

/// Registry of the disk workers of every torrent.
pub struct DiskManager {
    config: DiskConfig,
    torrents: RwLock<HashMap<String, Registered>>,
    semaphore: Arc<Semaphore>,
    file_pool: Arc<FilePool>,
    buffer_pool: Arc<BufferPool>,
}

impl DiskManager {
    pub fn new(config: DiskConfig) -> Self {
        Self {
            torrents: RwLock::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_ops)),
            file_pool: Arc::new(FilePool::new(
                config.max_open_files,
                config.file_handle_idle_timeout,
            )),
            buffer_pool: BufferPool::with_capacity(config.scratch_buffers),
            config,
        }
    }

    pub fn config(&self) -> &DiskConfig {
        &self.config
    }

    pub fn file_pool(&self) -> &Arc<FilePool> {
        &self.file_pool
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    /// Registers a torrent stored below `save_path` and spawns its worker.
    /// Must be called from within a tokio runtime.
    ///
    /// A torrent already registered under `info_hash` is replaced; its old
    /// worker finishes the jobs it has queued and then stops.
    pub fn add_torrent(
        &self,
        info_hash: impl Into<String>,
        save_path: PathBuf,
        files: FileStorage,
        piece_hashes: Vec<[u8; 20]>,
    ) -> Result<TorrentDisk, StorageError> {
        let info_hash = info_hash.into();
        let storage = DiskStorage::new(
            save_path,
            files,
            self.file_pool.clone(),
            self.buffer_pool.clone(),
        )?;
        let manager = PieceManager::new(storage, piece_hashes, self.config.storage_mode)?;
        let (disk, worker) = TorrentDisk::spawn(
            info_hash.clone(),
            manager,
            self.semaphore.clone(),
            self.config.job_queue_depth,
        );

        tracing::debug!(
            "Registered torrent {} with {} pieces ({:?} mode)",
            info_hash,
            disk.num_pieces(),
            self.config.storage_mode
        );

        let previous = self.torrents.write().insert(
            info_hash.clone(),
            Registered {
                disk: disk.clone(),
                worker,
            },
        );
        if let Some(old) = previous {
            tracing::warn!("Torrent {} registered twice, stopping old worker", info_hash);
            tokio::spawn(async move {
                let _ = old.disk.shutdown().await;
            });
        }
        Ok(disk)
    }

    pub fn get(&self, info_hash: &str) -> Result<TorrentDisk, StorageError> {
        self.torrents
            .read()
            .get(info_hash)
            .map(|r| r.disk.clone())
            .ok_or_else(|| StorageError::TorrentNotFound(info_hash.to_string()))
    }

    pub fn torrent_count(&self) -> usize {
        self.torrents.read().len()
    }

    /// Unregisters a torrent, waiting for its worker to release the files
    /// and stop.
    pub async fn remove_torrent(&self, info_hash: &str) -> Result<(), StorageError> {
        let registered = self
            .torrents
            .write()
            .remove(info_hash)
            .ok_or_else(|| StorageError::TorrentNotFound(info_hash.to_string()))?;
        stop(registered).await
    }

    /// Closes file handles that have been idle past the configured timeout.
    pub async fn evict_idle_handles(&self) {
        self.file_pool.evict_idle().await;
    }

    /// Stops every worker, waiting for all of them.
    pub async fn shutdown(&self) {
        let registered: Vec<(String, Registered)> = self.torrents.write().drain().collect();
        let count = registered.len();

        futures::future::join_all(registered.into_iter().map(
            |(info_hash, r)| async move {
                if let Err(e) = stop(r).await {
                    tracing::warn!("Disk worker for {} did not stop cleanly: {}", info_hash, e);
                }
            },
        ))
        .await;

        tracing::debug!("Stopped {} disk workers", count);
    }
}

async fn stop(registered: Registered) -> Result<(), StorageError> {
    let result = registered.disk.shutdown().await;
    registered
        .worker
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;
    match result {
        // Already stopped through another handle.
        Err(StorageError::WorkerGone) => Ok(()),
        other => other,
    }
}

impl Default for DiskManager {
    fn default() -> Self {
        Self::new(DiskConfig::default())
    }
}
