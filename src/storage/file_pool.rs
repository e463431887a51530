use crate::constants::{FILE_HANDLE_IDLE_TIMEOUT, MAX_OPEN_FILES};
use dashmap::DashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex as TokioMutex, MutexGuard};

/// Identifies one storage instance within a [`FilePool`].
pub type StorageId = u64;

type HandleKey = (StorageId, usize);

pub(crate) struct PooledFile {
    file: TokioMutex<File>,
    last_used: parking_lot::Mutex<Instant>,
    is_write: bool,
}

impl PooledFile {
    pub(crate) async fn lock(&self) -> MutexGuard<'_, File> {
        *self.last_used.lock() = Instant::now();
        self.file.lock().await
    }

    fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }
}

/// Open file handles shared by every storage instance.
///
/// Handles are keyed by storage id and file index. The pool keeps at most
/// `max_open` handles, closing the least recently used one when a new file
/// is opened past the limit.
pub struct FilePool {
    handles: DashMap<HandleKey, Arc<PooledFile>>,
    max_open: usize,
    idle_timeout: Duration,
    next_id: AtomicU64,
}

impl FilePool {
    pub fn new(max_open: usize, idle_timeout: Duration) -> Self {
        Self {
            handles: DashMap::new(),
            max_open: max_open.max(1),
            idle_timeout,
            next_id: AtomicU64::new(0),
        }
    }

    /// Issues a fresh id for a storage instance using this pool.
    pub fn next_storage_id(&self) -> StorageId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) async fn open(
        &self,
        storage: StorageId,
        file_index: usize,
        path: &Path,
        write: bool,
    ) -> std::io::Result<Arc<PooledFile>> {
        let key = (storage, file_index);
        if let Some(handle) = self.handles.get(&key) {
            if handle.is_write || !write {
                *handle.last_used.lock() = Instant::now();
                return Ok(handle.clone());
            }
        }
        self.handles.remove(&key);

        let file = if write {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(path)
                .await?
        } else {
            File::open(path).await?
        };

        let handle = Arc::new(PooledFile {
            file: TokioMutex::new(file),
            last_used: parking_lot::Mutex::new(Instant::now()),
            is_write: write,
        });
        self.handles.insert(key, handle.clone());
        self.enforce_limit(key).await;
        Ok(handle)
    }

    async fn enforce_limit(&self, keep: HandleKey) {
        while self.handles.len() > self.max_open {
            let victim = self
                .handles
                .iter()
                .filter(|r| *r.key() != keep)
                .min_by_key(|r| r.last_used())
                .map(|r| *r.key());
            let Some(victim) = victim else {
                break;
            };
            if let Some((_, handle)) = self.handles.remove(&victim) {
                tracing::trace!("closing file handle {:?} (pool full)", victim);
                if let Err(e) = close(handle).await {
                    tracing::warn!("sync of evicted handle {:?} failed: {}", victim, e);
                }
            }
        }
    }

    /// Closes every handle belonging to `storage`, syncing written files.
    /// Every handle is closed even when one fails; the first error is
    /// returned.
    pub async fn release(&self, storage: StorageId) -> std::io::Result<()> {
        let keys: Vec<HandleKey> = self
            .handles
            .iter()
            .filter(|r| r.key().0 == storage)
            .map(|r| *r.key())
            .collect();
        let mut result = Ok(());
        for key in keys {
            if let Some((_, handle)) = self.handles.remove(&key) {
                let closed = close(handle).await;
                if result.is_ok() {
                    result = closed;
                }
            }
        }
        result
    }

    pub async fn release_file(&self, storage: StorageId, file_index: usize) -> std::io::Result<()> {
        match self.handles.remove(&(storage, file_index)) {
            Some((_, handle)) => close(handle).await,
            None => Ok(()),
        }
    }

    /// Drops the handles of `storage` without syncing. Used from `Drop`.
    pub(crate) fn forget(&self, storage: StorageId) {
        self.handles.retain(|key, _| key.0 != storage);
    }

    pub async fn evict_idle(&self) {
        let now = Instant::now();
        let to_evict: Vec<HandleKey> = self
            .handles
            .iter()
            .filter(|r| now.duration_since(r.last_used()) > self.idle_timeout)
            .map(|r| *r.key())
            .collect();

        for key in to_evict {
            if let Some((_, handle)) = self.handles.remove(&key) {
                if let Err(e) = close(handle).await {
                    tracing::warn!("sync of idle handle {:?} failed: {}", key, e);
                }
            }
        }
    }

    pub fn open_count(&self) -> usize {
        self.handles.len()
    }

    pub fn open_count_for(&self, storage: StorageId) -> usize {
        self.handles.iter().filter(|r| r.key().0 == storage).count()
    }
}

impl Default for FilePool {
    fn default() -> Self {
        Self::new(MAX_OPEN_FILES, FILE_HANDLE_IDLE_TIMEOUT)
    }
}

async fn close(handle: Arc<PooledFile>) -> std::io::Result<()> {
    if !handle.is_write {
        return Ok(());
    }
    let mut file = handle.file.lock().await;
    file.flush().await?;
    file.sync_data().await
}
