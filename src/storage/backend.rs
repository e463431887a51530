use super::buffer_pool::BufferPool;
use super::error::StorageError;
use crate::file_storage::FileStorage;
use crate::resume::ResumeData;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How a read treats bytes that are not on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Missing files and regions past the end of a file read as zeros.
    /// The returned count only includes bytes that came from disk.
    ZeroFill,
    /// Any missing byte fails the read with [`StorageError::ShortRead`].
    Exact,
}

/// A file `initialize` could not create or size.
#[derive(Debug)]
pub struct FileFailure {
    pub file_index: usize,
    pub path: PathBuf,
    pub error: std::io::Error,
}

/// Outcome of [`StorageInterface::initialize`]. Files that failed are
/// listed rather than aborting the whole initialization.
#[derive(Debug, Default)]
pub struct InitReport {
    pub failed: Vec<FileFailure>,
}

impl InitReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Slot-level access to the bytes of one torrent.
///
/// A slot is a piece-length window of the torrent's byte stream; the
/// backend never knows which piece a slot holds. All operations report
/// failure through [`StorageError`].
#[async_trait]
pub trait StorageInterface: Send + Sync {
    fn files(&self) -> &FileStorage;

    fn save_path(&self) -> &Path;

    fn buffer_pool(&self) -> &Arc<BufferPool>;

    /// Creates directories and files, extending each file to its final
    /// size when `allocate_files` is set. Safe to call repeatedly.
    async fn initialize(&self, allocate_files: bool) -> Result<InitReport, StorageError>;

    /// Whether any file of the torrent exists with data in it.
    async fn has_any_file(&self) -> Result<bool, StorageError>;

    /// Reads `buf.len()` bytes starting at `offset` within `slot`.
    async fn read(
        &self,
        buf: &mut [u8],
        slot: u32,
        offset: u32,
        mode: ReadMode,
    ) -> Result<usize, StorageError>;

    async fn write(&self, buf: &[u8], slot: u32, offset: u32) -> Result<(), StorageError>;

    /// First slot at or after `slot` that may hold data. Slots lying in an
    /// unallocated region of a sparse file are skipped. Backends that
    /// cannot tell return `slot`.
    async fn sparse_end(&self, slot: u32) -> u32 {
        slot
    }

    /// Copies the content of `src` into `dst`.
    async fn move_slot(&self, src: u32, dst: u32) -> Result<(), StorageError> {
        let size = self.files().piece_size(dst) as usize;
        let mut buf = self.buffer_pool().get(size);
        self.read(&mut buf, src, 0, ReadMode::ZeroFill).await?;
        self.write(&buf, dst, 0).await
    }

    /// Exchanges the contents of `a` and `b`.
    async fn swap_slots(&self, a: u32, b: u32) -> Result<(), StorageError> {
        let pool = self.buffer_pool();
        let mut from_a = pool.get(self.files().piece_size(b) as usize);
        let mut from_b = pool.get(self.files().piece_size(a) as usize);
        self.read(&mut from_a, a, 0, ReadMode::ZeroFill).await?;
        self.read(&mut from_b, b, 0, ReadMode::ZeroFill).await?;
        self.write(&from_a, b, 0).await?;
        self.write(&from_b, a, 0).await
    }

    /// Rotates contents: `a` goes to `b`, `b` goes to `c`, `c` goes to `a`.
    async fn swap_slots3(&self, a: u32, b: u32, c: u32) -> Result<(), StorageError> {
        let files = self.files();
        let pool = self.buffer_pool();
        let mut first = pool.get(files.piece_size(b) as usize);
        let mut second = pool.get(files.piece_size(c) as usize);

        self.read(&mut first, a, 0, ReadMode::ZeroFill).await?;
        self.read(&mut second, b, 0, ReadMode::ZeroFill).await?;
        self.write(&first, b, 0).await?;

        first.resize(files.piece_size(a) as usize);
        self.read(&mut first, c, 0, ReadMode::ZeroFill).await?;
        self.write(&second, c, 0).await?;
        self.write(&first, a, 0).await
    }

    /// Moves every file of the torrent under `new_path`.
    async fn move_storage(&mut self, new_path: &Path) -> Result<(), StorageError>;

    /// Closes all open handles of this storage.
    async fn release_files(&self) -> Result<(), StorageError>;

    async fn delete_files(&self) -> Result<(), StorageError>;

    async fn rename_file(&mut self, index: usize, new_name: &Path) -> Result<(), StorageError>;

    /// Records file stamps and renamed files into `rd`.
    async fn write_resume_data(&self, rd: &mut ResumeData) -> Result<(), StorageError>;

    /// Applies renamed files from `rd` and checks that the files on disk
    /// still match the recorded stamps.
    async fn verify_resume_data(&mut self, rd: &ResumeData, compact: bool)
        -> Result<(), StorageError>;
}
