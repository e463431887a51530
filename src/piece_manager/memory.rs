//! In-memory storage used to drive the manager in tests.

use crate::file_storage::FileStorage;
use crate::resume::{FileStamp, ResumeData};
use crate::storage::{
    BufferPool, InitReport, ReadMode, ResumeRejection, StorageError, StorageInterface,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Read(u32),
    Write(u32),
    Move(u32, u32),
    Swap(u32, u32),
    Swap3(u32, u32, u32),
    Initialize,
}

/// Slot contents held in memory. `None` means nothing was ever written,
/// which reads back as zero bytes.
pub(crate) struct MemoryStorage {
    files: FileStorage,
    save_path: PathBuf,
    buffers: Arc<BufferPool>,
    slots: Mutex<Vec<Option<Vec<u8>>>>,
    ops: Mutex<Vec<Op>>,
    failing_reads: Mutex<BTreeSet<u32>>,
    failing_writes: Mutex<BTreeSet<u32>>,
    holes: Mutex<BTreeSet<u32>>,
    reject_resume: bool,
}

impl MemoryStorage {
    pub(crate) fn new(files: FileStorage) -> Self {
        let n = files.num_pieces() as usize;
        Self {
            files,
            save_path: PathBuf::from("/memory"),
            buffers: BufferPool::with_capacity(4),
            slots: Mutex::new(vec![None; n]),
            ops: Mutex::new(Vec::new()),
            failing_reads: Mutex::new(BTreeSet::new()),
            failing_writes: Mutex::new(BTreeSet::new()),
            holes: Mutex::new(BTreeSet::new()),
            reject_resume: false,
        }
    }

    pub(crate) fn rejecting_resume(mut self) -> Self {
        self.reject_resume = true;
        self
    }

    /// Stores `data` in `slot`, zero-padded to the slot size.
    pub(crate) fn put(&self, slot: u32, data: &[u8]) {
        let mut content = vec![0u8; self.files.piece_size(slot) as usize];
        let len = data.len().min(content.len());
        content[..len].copy_from_slice(&data[..len]);
        self.slots.lock()[slot as usize] = Some(content);
    }

    /// Makes `slot` a sparse hole: it reads back as zeros and
    /// `sparse_end` skips over it.
    pub(crate) fn punch_hole(&self, slot: u32) {
        self.put(slot, &[]);
        self.holes.lock().insert(slot);
    }

    pub(crate) fn get(&self, slot: u32) -> Option<Vec<u8>> {
        self.slots.lock()[slot as usize].clone()
    }

    /// Reads of `slot` fail with an I/O error from now on.
    pub(crate) fn fail_reads(&self, slot: u32) {
        self.failing_reads.lock().insert(slot);
    }

    /// Writes to `slot` fail with an I/O error from now on, including the
    /// writes a move or swap issues.
    pub(crate) fn fail_writes(&self, slot: u32) {
        self.failing_writes.lock().insert(slot);
    }

    pub(crate) fn ops(&self) -> Vec<Op> {
        self.ops.lock().clone()
    }

    pub(crate) fn clear_ops(&self) {
        self.ops.lock().clear();
    }

    pub(crate) fn reads(&self) -> usize {
        self.ops
            .lock()
            .iter()
            .filter(|op| matches!(op, Op::Read(_)))
            .count()
    }

    fn read_slot(&self, slot: u32) -> Result<Vec<u8>, StorageError> {
        if self.failing_reads.lock().contains(&slot) {
            return Err(injected(slot));
        }
        Ok(self.slots.lock()[slot as usize].clone().unwrap_or_default())
    }

    fn store(&self, slot: u32, mut data: Vec<u8>) -> Result<(), StorageError> {
        if self.failing_writes.lock().contains(&slot) {
            return Err(injected(slot));
        }
        data.resize(self.files.piece_size(slot) as usize, 0);
        self.slots.lock()[slot as usize] = Some(data);
        self.holes.lock().remove(&slot);
        Ok(())
    }
}

fn injected(slot: u32) -> StorageError {
    std::io::Error::other(format!("injected failure in slot {}", slot)).into()
}

#[async_trait]
impl StorageInterface for MemoryStorage {
    fn files(&self) -> &FileStorage {
        &self.files
    }

    fn save_path(&self) -> &Path {
        &self.save_path
    }

    fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    async fn initialize(&self, _allocate_files: bool) -> Result<InitReport, StorageError> {
        self.ops.lock().push(Op::Initialize);
        Ok(InitReport::default())
    }

    async fn has_any_file(&self) -> Result<bool, StorageError> {
        Ok(self.slots.lock().iter().any(Option::is_some))
    }

    async fn read(
        &self,
        buf: &mut [u8],
        slot: u32,
        offset: u32,
        mode: ReadMode,
    ) -> Result<usize, StorageError> {
        self.ops.lock().push(Op::Read(slot));
        let data = self.read_slot(slot)?;
        let start = (offset as usize).min(data.len());
        let got = (data.len() - start).min(buf.len());
        if got < buf.len() && mode == ReadMode::Exact {
            return Err(StorageError::ShortRead {
                slot,
                wanted: buf.len(),
                got,
            });
        }
        buf[..got].copy_from_slice(&data[start..start + got]);
        buf[got..].fill(0);
        Ok(got)
    }

    async fn write(&self, buf: &[u8], slot: u32, offset: u32) -> Result<(), StorageError> {
        self.ops.lock().push(Op::Write(slot));
        if self.failing_writes.lock().contains(&slot) {
            return Err(injected(slot));
        }
        self.holes.lock().remove(&slot);
        let size = self.files.piece_size(slot) as usize;
        let mut slots = self.slots.lock();
        let content = slots[slot as usize].get_or_insert_with(|| vec![0u8; size]);
        let start = offset as usize;
        content[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    async fn sparse_end(&self, slot: u32) -> u32 {
        let holes = self.holes.lock();
        let mut end = slot;
        while holes.contains(&end) {
            end += 1;
        }
        end
    }

    async fn move_slot(&self, src: u32, dst: u32) -> Result<(), StorageError> {
        self.ops.lock().push(Op::Move(src, dst));
        let data = self.read_slot(src)?;
        self.store(dst, data)
    }

    async fn swap_slots(&self, a: u32, b: u32) -> Result<(), StorageError> {
        self.ops.lock().push(Op::Swap(a, b));
        let (da, db) = (self.read_slot(a)?, self.read_slot(b)?);
        self.store(b, da)?;
        self.store(a, db)
    }

    async fn swap_slots3(&self, a: u32, b: u32, c: u32) -> Result<(), StorageError> {
        self.ops.lock().push(Op::Swap3(a, b, c));
        let (da, db, dc) = (self.read_slot(a)?, self.read_slot(b)?, self.read_slot(c)?);
        self.store(b, da)?;
        self.store(c, db)?;
        self.store(a, dc)
    }

    async fn move_storage(&mut self, new_path: &Path) -> Result<(), StorageError> {
        self.save_path = new_path.to_path_buf();
        Ok(())
    }

    async fn release_files(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn delete_files(&self) -> Result<(), StorageError> {
        self.slots.lock().iter_mut().for_each(|s| *s = None);
        Ok(())
    }

    async fn rename_file(&mut self, index: usize, new_name: &Path) -> Result<(), StorageError> {
        self.files.rename_file(index, new_name)
    }

    async fn write_resume_data(&self, rd: &mut ResumeData) -> Result<(), StorageError> {
        rd.file_sizes = self
            .files
            .files()
            .iter()
            .map(|f| FileStamp {
                size: f.size,
                mtime: 0,
            })
            .collect();
        Ok(())
    }

    async fn verify_resume_data(
        &mut self,
        rd: &ResumeData,
        _compact: bool,
    ) -> Result<(), StorageError> {
        if self.reject_resume {
            return Err(ResumeRejection::MissingFileSizes.into());
        }
        if rd.file_sizes.len() != self.files.num_files() {
            return Err(ResumeRejection::FileCountMismatch {
                recorded: rd.file_sizes.len(),
                actual: self.files.num_files(),
            }
            .into());
        }
        Ok(())
    }
}
