use super::backend::{FileFailure, InitReport, ReadMode, StorageInterface};
use super::buffer_pool::BufferPool;
use super::error::{ResumeRejection, StorageError};
use super::file_pool::{FilePool, StorageId};
use crate::constants::{COMPACT_MTIME_SLACK, SPARSE_MTIME_FUTURE_SLACK, SPARSE_MTIME_PAST_SLACK};
use crate::file_storage::{FileEntry, FileSlice, FileStorage};
use crate::resume::{FileStamp, ResumeData};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::collections::BTreeSet;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// [`StorageInterface`] over real files below a save path.
pub struct DiskStorage {
    id: StorageId,
    save_path: PathBuf,
    files: FileStorage,
    original_paths: Vec<PathBuf>,
    pool: Arc<FilePool>,
    buffers: Arc<BufferPool>,
}

impl DiskStorage {
    pub fn new(
        save_path: PathBuf,
        files: FileStorage,
        pool: Arc<FilePool>,
        buffers: Arc<BufferPool>,
    ) -> Result<Self, StorageError> {
        files.validate_paths()?;
        let original_paths = files.files().iter().map(|f| f.path.clone()).collect();
        Ok(Self {
            id: pool.next_storage_id(),
            save_path,
            files,
            original_paths,
            pool,
            buffers,
        })
    }

    pub fn id(&self) -> StorageId {
        self.id
    }

    fn file_path(&self, index: usize) -> PathBuf {
        self.save_path.join(&self.files.files()[index].path)
    }

    async fn read_slice(&self, slice: &FileSlice, dst: &mut [u8]) -> std::io::Result<usize> {
        let path = self.file_path(slice.file_index);
        let handle = self.pool.open(self.id, slice.file_index, &path, false).await?;
        let mut file = handle.lock().await;
        file.seek(SeekFrom::Start(slice.offset)).await?;

        let mut filled = 0;
        while filled < dst.len() {
            let n = file.read(&mut dst[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    async fn write_slice(&self, slice: &FileSlice, src: &[u8]) -> std::io::Result<()> {
        let path = self.file_path(slice.file_index);
        let handle = self.pool.open(self.id, slice.file_index, &path, true).await?;
        let mut file = handle.lock().await;
        file.seek(SeekFrom::Start(slice.offset)).await?;
        file.write_all(src).await?;
        // tokio reports a failed write on the next operation, not here
        file.flush().await
    }

    async fn initialize_file(&self, entry: &FileEntry, allocate: bool) -> std::io::Result<()> {
        let path = self.save_path.join(&entry.path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        #[cfg(unix)]
        if let Some(target) = &entry.symlink_path {
            return match tokio::fs::symlink(self.save_path.join(target), &path).await {
                Err(e) if e.kind() != ErrorKind::AlreadyExists => Err(e),
                _ => Ok(()),
            };
        }

        let current = match tokio::fs::metadata(&path).await {
            Ok(meta) => Some(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;

        let resize = match current {
            Some(len) => len > entry.size || (allocate && len < entry.size),
            None => allocate,
        };
        if resize {
            file.set_len(entry.size).await?;
        }

        #[cfg(unix)]
        if entry.executable {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = file.metadata().await?.permissions();
            perms.set_mode(perms.mode() | 0o111);
            tokio::fs::set_permissions(&path, perms).await?;
        }

        Ok(())
    }

    /// Relative paths of the top-level entries this torrent owns.
    fn top_level_entries(&self) -> BTreeSet<PathBuf> {
        self.files
            .files()
            .iter()
            .filter(|f| !f.pad_file)
            .filter_map(|f| match f.path.components().next() {
                Some(Component::Normal(name)) => Some(PathBuf::from(name)),
                _ => None,
            })
            .collect()
    }

    fn mapped_files(&self) -> Vec<Option<PathBuf>> {
        let renamed = self
            .files
            .files()
            .iter()
            .zip(&self.original_paths)
            .any(|(f, original)| &f.path != original);
        if !renamed {
            return Vec::new();
        }
        self.files
            .files()
            .iter()
            .zip(&self.original_paths)
            .map(|(f, original)| (&f.path != original).then(|| f.path.clone()))
            .collect()
    }

    async fn check_stamps(&self, rd: &ResumeData, compact: bool) -> Result<(), StorageError> {
        let seed = rd.is_seed(self.files.num_pieces());

        for (index, (entry, recorded)) in self.files.files().iter().zip(&rd.file_sizes).enumerate() {
            if entry.pad_file {
                continue;
            }
            let path = self.file_path(index);

            if seed && recorded.size != entry.size {
                return Err(ResumeRejection::SizeMismatch {
                    path,
                    expected: entry.size,
                    actual: recorded.size,
                }
                .into());
            }

            let actual = FileStamp::of(&path).await?;
            let size_ok = if compact {
                actual.size == recorded.size
            } else {
                actual.size >= recorded.size
            };
            if !size_ok {
                return Err(ResumeRejection::SizeMismatch {
                    path,
                    expected: recorded.size,
                    actual: actual.size,
                }
                .into());
            }

            // a zero mtime means the file did not exist when the data was saved
            if recorded.mtime == 0 {
                continue;
            }
            let time_ok = if compact {
                (actual.mtime - recorded.mtime).abs() <= COMPACT_MTIME_SLACK
            } else {
                actual.mtime >= recorded.mtime - SPARSE_MTIME_PAST_SLACK
                    && actual.mtime <= recorded.mtime + SPARSE_MTIME_FUTURE_SLACK
            };
            if !time_ok {
                return Err(ResumeRejection::TimestampMismatch {
                    path,
                    expected: recorded.mtime,
                    actual: actual.mtime,
                }
                .into());
            }
        }
        Ok(())
    }
}

impl Drop for DiskStorage {
    fn drop(&mut self) {
        self.pool.forget(self.id);
    }
}

/// A non-empty file without a single allocated block is one sparse hole.
#[cfg(unix)]
fn is_unallocated(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    meta.is_file() && meta.len() > 0 && meta.blocks() == 0
}

#[cfg(not(unix))]
fn is_unallocated(_meta: &std::fs::Metadata) -> bool {
    false
}

#[async_trait]
impl StorageInterface for DiskStorage {
    fn files(&self) -> &FileStorage {
        &self.files
    }

    fn save_path(&self) -> &Path {
        &self.save_path
    }

    fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    async fn initialize(&self, allocate_files: bool) -> Result<InitReport, StorageError> {
        tokio::fs::create_dir_all(&self.save_path).await?;

        let mut report = InitReport::default();
        for (index, entry) in self.files.files().iter().enumerate() {
            if entry.pad_file {
                continue;
            }
            if let Err(error) = self.initialize_file(entry, allocate_files).await {
                let path = self.file_path(index);
                tracing::warn!("failed to initialize {}: {}", path.display(), error);
                report.failed.push(FileFailure {
                    file_index: index,
                    path,
                    error,
                });
            }
        }

        self.pool.release(self.id).await?;
        Ok(report)
    }

    async fn sparse_end(&self, slot: u32) -> u32 {
        let piece_length = self.files.piece_length() as u64;
        let Some(index) = self.files.file_index_at_offset(slot as u64 * piece_length) else {
            return slot;
        };
        let Some(entry) = self.files.file(index).filter(|e| !e.pad_file) else {
            return slot;
        };
        match tokio::fs::metadata(self.file_path(index)).await {
            Ok(meta) if is_unallocated(&meta) => {
                let end = ((entry.offset + entry.size) / piece_length) as u32;
                tracing::trace!("File {} holds no data, skipping to slot {}", index, end);
                end.max(slot)
            }
            _ => slot,
        }
    }

    async fn has_any_file(&self) -> Result<bool, StorageError> {
        for (index, entry) in self.files.files().iter().enumerate() {
            if entry.pad_file {
                continue;
            }
            match tokio::fs::metadata(self.file_path(index)).await {
                Ok(meta) if meta.is_file() && meta.len() > 0 => return Ok(true),
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }

    async fn read(
        &self,
        buf: &mut [u8],
        slot: u32,
        offset: u32,
        mode: ReadMode,
    ) -> Result<usize, StorageError> {
        let num_pieces = self.files.num_pieces();
        if slot >= num_pieces {
            return Err(StorageError::out_of_range("slot", slot, num_pieces));
        }
        let wanted = buf.len();
        let slot_size = self.files.piece_size(slot) as usize;
        let available = slot_size.saturating_sub(offset as usize).min(wanted);
        if mode == ReadMode::Exact && available < wanted {
            return Err(StorageError::out_of_range(
                "read end",
                offset as u64 + wanted as u64,
                slot_size as u64,
            ));
        }

        let slices = self.files.map_block(slot, offset, available as u32)?;
        let mut pos = 0usize;
        let mut total = 0usize;

        for slice in &slices {
            let len = slice.size as usize;
            let dst = &mut buf[pos..pos + len];
            pos += len;

            if slice.pad_file {
                dst.fill(0);
                total += len;
                continue;
            }

            let n = match self.read_slice(slice, dst).await {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::NotFound => 0,
                Err(e) => return Err(e.into()),
            };
            total += n;
            if n < len {
                match mode {
                    ReadMode::Exact => {
                        return Err(StorageError::ShortRead {
                            slot,
                            wanted,
                            got: total,
                        })
                    }
                    ReadMode::ZeroFill => dst[n..].fill(0),
                }
            }
        }

        buf[pos..].fill(0);
        Ok(total)
    }

    async fn write(&self, buf: &[u8], slot: u32, offset: u32) -> Result<(), StorageError> {
        let num_pieces = self.files.num_pieces();
        if slot >= num_pieces {
            return Err(StorageError::out_of_range("slot", slot, num_pieces));
        }
        let slot_size = self.files.piece_size(slot) as u64;
        let end = offset as u64 + buf.len() as u64;
        if end > slot_size {
            return Err(StorageError::out_of_range("write end", end, slot_size));
        }

        let slices = self.files.map_block(slot, offset, buf.len() as u32)?;
        let mut pos = 0usize;
        for slice in &slices {
            let len = slice.size as usize;
            if !slice.pad_file {
                self.write_slice(slice, &buf[pos..pos + len]).await?;
            }
            pos += len;
        }
        Ok(())
    }

    async fn move_storage(&mut self, new_path: &Path) -> Result<(), StorageError> {
        if new_path == self.save_path {
            return Ok(());
        }
        self.pool.release(self.id).await?;
        tokio::fs::create_dir_all(new_path).await?;

        for entry in self.top_level_entries() {
            let from = self.save_path.join(&entry);
            let to = new_path.join(&entry);
            match tokio::fs::rename(&from, &to).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    // likely a cross-device move
                    tracing::debug!("rename {} failed ({}), copying", from.display(), e);
                    copy_recursive(from.clone(), to).await?;
                    remove_recursive(&from).await?;
                }
            }
        }

        tracing::debug!(
            "moved storage from {} to {}",
            self.save_path.display(),
            new_path.display()
        );
        self.save_path = new_path.to_path_buf();
        Ok(())
    }

    async fn release_files(&self) -> Result<(), StorageError> {
        self.pool.release(self.id).await?;
        Ok(())
    }

    async fn delete_files(&self) -> Result<(), StorageError> {
        self.pool.release(self.id).await?;

        let mut dirs = BTreeSet::new();
        for (index, entry) in self.files.files().iter().enumerate() {
            if entry.pad_file {
                continue;
            }
            match tokio::fs::remove_file(self.file_path(index)).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            dirs.extend(
                entry
                    .path
                    .ancestors()
                    .skip(1)
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(Path::to_path_buf),
            );
        }

        let mut dirs: Vec<PathBuf> = dirs.into_iter().collect();
        dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
        for dir in dirs {
            let path = self.save_path.join(&dir);
            if let Err(e) = tokio::fs::remove_dir(&path).await {
                if e.kind() != ErrorKind::NotFound {
                    tracing::debug!("keeping directory {}: {}", path.display(), e);
                }
            }
        }
        Ok(())
    }

    async fn rename_file(&mut self, index: usize, new_name: &Path) -> Result<(), StorageError> {
        crate::file_storage::validate_file_path(new_name)?;
        let old_path = self
            .files
            .file_path(index, &self.save_path)
            .ok_or_else(|| StorageError::out_of_range("file", index as u64, self.files.num_files() as u64))?;
        let new_path = self.save_path.join(new_name);

        self.pool.release_file(self.id, index).await?;
        if let Some(parent) = new_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::rename(&old_path, &new_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.files.rename_file(index, new_name)?;
        Ok(())
    }

    async fn write_resume_data(&self, rd: &mut ResumeData) -> Result<(), StorageError> {
        // handles may hold unflushed writes that would move the mtime later
        self.pool.release(self.id).await?;

        let mut stamps = Vec::with_capacity(self.files.num_files());
        for (index, entry) in self.files.files().iter().enumerate() {
            if entry.pad_file {
                stamps.push(FileStamp::default());
                continue;
            }
            stamps.push(FileStamp::of(&self.file_path(index)).await?);
        }
        rd.file_sizes = stamps;
        rd.mapped_files = self.mapped_files();
        Ok(())
    }

    async fn verify_resume_data(
        &mut self,
        rd: &ResumeData,
        compact: bool,
    ) -> Result<(), StorageError> {
        let num_files = self.files.num_files();

        if !rd.mapped_files.is_empty() {
            if rd.mapped_files.len() != num_files {
                return Err(ResumeRejection::MappedFileCountMismatch {
                    recorded: rd.mapped_files.len(),
                    actual: num_files,
                }
                .into());
            }
            for (index, mapped) in rd.mapped_files.iter().enumerate() {
                if let Some(path) = mapped {
                    self.files.rename_file(index, path.clone())?;
                }
            }
        }

        if rd.file_sizes.is_empty() && num_files > 0 {
            return Err(ResumeRejection::MissingFileSizes.into());
        }
        if rd.file_sizes.len() != num_files {
            return Err(ResumeRejection::FileCountMismatch {
                recorded: rd.file_sizes.len(),
                actual: num_files,
            }
            .into());
        }

        self.check_stamps(rd, compact).await
    }
}

fn copy_recursive(from: PathBuf, to: PathBuf) -> BoxFuture<'static, std::io::Result<()>> {
    async move {
        let meta = tokio::fs::metadata(&from).await?;
        if meta.is_dir() {
            tokio::fs::create_dir_all(&to).await?;
            let mut entries = tokio::fs::read_dir(&from).await?;
            while let Some(entry) = entries.next_entry().await? {
                copy_recursive(entry.path(), to.join(entry.file_name())).await?;
            }
        } else {
            if let Some(parent) = to.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&from, &to).await?;
        }
        Ok(())
    }
    .boxed()
}

async fn remove_recursive(path: &Path) -> std::io::Result<()> {
    if tokio::fs::metadata(path).await?.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}
