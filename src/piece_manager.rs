//! Piece to slot allocation.
//!
//! [`PieceManager`] decides which slot on disk holds each piece. In sparse
//! and full mode slot `i` always holds piece `i`. In compact mode slots are
//! handed out as pieces arrive, so a slot may hold any piece until the
//! torrent completes and the map becomes the identity.
//!
//! On startup the manager either trusts fast-resume data
//! ([`PieceManager::check_fastresume`]) or scans every slot, hashing its
//! content to find out which piece it holds and moving data towards its
//! home slot ([`PieceManager::check_files`]). Both advance one slot per
//! call so a disk worker can interleave other jobs.

mod allocate;
mod identify;
mod rotation;
mod scan;
mod slot_map;

#[cfg(test)]
mod memory;
#[cfg(test)]
mod tests;

pub use slot_map::{Displaced, SlotEntry, SlotMap, SlotTables};

use crate::bitfield::Bitfield;
use crate::config::StorageMode;
use crate::resume::ResumeData;
use crate::storage::{FileFailure, PooledBuffer, ReadMode, StorageError, StorageInterface};
use bytes::Bytes;
use identify::HashIndex;
use parking_lot::RwLock;
use sha1::{Digest, Sha1};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Result of [`PieceManager::check_fastresume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Resume data was accepted; only file creation remains.
    NoError,
    /// Slots must be scanned or reordered with [`PieceManager::check_files`].
    NeedFullCheck,
}

/// Observable phase of the startup check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Idle,
    FullCheck,
    ExpandPieces,
    CreateFiles,
    Finished,
}

/// Progress report of one [`PieceManager::check_files`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckStep {
    pub done: bool,
    /// Between 0.0 and 1.0
    pub progress: f32,
    /// Piece identified during this step, if any
    pub have_piece: Option<u32>,
}

impl CheckStep {
    fn finished() -> Self {
        Self {
            done: true,
            progress: 1.0,
            have_piece: None,
        }
    }

    fn pending(position: u32, total: u32, have_piece: Option<u32>) -> Self {
        let progress = if total == 0 {
            1.0
        } else {
            position.min(total) as f32 / total as f32
        };
        Self {
            done: false,
            progress,
            have_piece,
        }
    }
}

enum ScanState {
    Idle,
    FullCheck(FullCheck),
    ExpandPieces(Expand),
    CreateFiles,
    Finished,
}

struct FullCheck {
    cursor: u32,
    /// Built on the first step
    index: Option<HashIndex>,
}

struct Expand {
    cursor: u32,
    /// Piece whose data was lifted out of the slot it occupied and waits
    /// to be written to its home slot.
    scratch: Option<Scratch>,
}

struct Scratch {
    piece: u32,
    data: PooledBuffer,
}

/// Running hash of a piece written in order from offset 0.
struct PartialHash {
    offset: u32,
    hasher: Sha1,
}

/// Owns the piece/slot tables of one torrent and every byte moved
/// between its slots.
///
/// All methods take `&mut self`; a single worker drives one manager. The
/// "have" set is the only state shared with other tasks, through
/// [`PieceManager::have_handle`].
pub struct PieceManager<S: StorageInterface> {
    storage: S,
    piece_hashes: Vec<[u8; 20]>,
    mode: StorageMode,
    /// `None` once the map is known to be the identity
    tables: Option<SlotTables>,
    have: Arc<RwLock<Bitfield>>,
    unfinished: BTreeSet<u32>,
    partial: HashMap<u32, PartialHash>,
    scan: ScanState,
    out_of_place: bool,
    abort: Arc<AtomicBool>,
    init_failures: Vec<FileFailure>,
}

impl<S: StorageInterface> PieceManager<S> {
    /// `piece_hashes` holds the expected SHA-1 of every piece.
    pub fn new(
        storage: S,
        piece_hashes: Vec<[u8; 20]>,
        mode: StorageMode,
    ) -> Result<Self, StorageError> {
        let num_pieces = storage.files().num_pieces();
        if piece_hashes.len() != num_pieces as usize {
            return Err(StorageError::out_of_range(
                "piece hash count",
                piece_hashes.len() as u64,
                num_pieces,
            ));
        }

        let tables = mode.is_compact().then(|| {
            let mut tables = SlotTables::new(num_pieces);
            tables.unallocated_slots.extend(0..num_pieces);
            tables
        });

        Ok(Self {
            storage,
            piece_hashes,
            mode,
            tables,
            have: Arc::new(RwLock::new(Bitfield::new(num_pieces as usize))),
            unfinished: BTreeSet::new(),
            partial: HashMap::new(),
            scan: ScanState::Idle,
            out_of_place: false,
            abort: Arc::new(AtomicBool::new(false)),
            init_failures: Vec::new(),
        })
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn num_pieces(&self) -> u32 {
        self.storage.files().num_pieces()
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.mode
    }

    pub fn state(&self) -> CheckState {
        match self.scan {
            ScanState::Idle => CheckState::Idle,
            ScanState::FullCheck(_) => CheckState::FullCheck,
            ScanState::ExpandPieces(_) => CheckState::ExpandPieces,
            ScanState::CreateFiles => CheckState::CreateFiles,
            ScanState::Finished => CheckState::Finished,
        }
    }

    /// Whether the last scan found a piece outside its home slot.
    pub fn out_of_place(&self) -> bool {
        self.out_of_place
    }

    /// Piece/slot tables, or `None` while the map is the identity.
    pub fn tables(&self) -> Option<&SlotTables> {
        self.tables.as_ref()
    }

    pub fn have_handle(&self) -> Arc<RwLock<Bitfield>> {
        self.have.clone()
    }

    pub fn have_pieces(&self) -> Bitfield {
        self.have.read().clone()
    }

    pub fn has_piece(&self, piece: u32) -> bool {
        self.have.read().has_piece(piece as usize)
    }

    /// Pieces written but not yet verified.
    pub fn unfinished_pieces(&self) -> impl Iterator<Item = u32> + '_ {
        self.unfinished.iter().copied()
    }

    /// Setting the flag makes the next [`PieceManager::check_files`] call
    /// fail with [`StorageError::CheckAborted`].
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    /// Files the last `initialize` could not create or size.
    pub fn init_failures(&self) -> &[FileFailure] {
        &self.init_failures
    }

    /// Slot holding `piece`, if any.
    pub fn slot_for(&self, piece: u32) -> Option<u32> {
        if piece >= self.num_pieces() {
            return None;
        }
        match &self.tables {
            Some(tables) => tables.map.slot_of(piece),
            None => Some(piece),
        }
    }

    /// What `slot` holds.
    pub fn piece_for(&self, slot: u32) -> SlotEntry {
        match &self.tables {
            Some(tables) => tables.map.entry(slot),
            None if slot < self.num_pieces() => SlotEntry::Piece(slot),
            None => SlotEntry::Unallocated,
        }
    }

    /// Slot map as it would be persisted: the compact tables with trailing
    /// unallocated slots trimmed, or one entry per piece in the other modes.
    pub fn export_piece_map(&self) -> Vec<SlotEntry> {
        match &self.tables {
            Some(tables) if self.mode.is_compact() => {
                let entries = tables.map.entries();
                let used = entries
                    .iter()
                    .rposition(|e| *e != SlotEntry::Unallocated)
                    .map_or(0, |i| i + 1);
                entries[..used].to_vec()
            }
            _ => {
                let have = self.have.read();
                (0..self.num_pieces())
                    .map(|piece| {
                        if have.has_piece(piece as usize) || self.unfinished.contains(&piece) {
                            SlotEntry::Piece(piece)
                        } else {
                            SlotEntry::Unassigned
                        }
                    })
                    .collect()
            }
        }
    }

    fn check_piece(&self, piece: u32) -> Result<(), StorageError> {
        let num_pieces = self.num_pieces();
        if piece >= num_pieces {
            return Err(StorageError::out_of_range("piece", piece, num_pieces));
        }
        Ok(())
    }

    fn check_range(&self, piece: u32, offset: u32, length: usize) -> Result<(), StorageError> {
        self.check_piece(piece)?;
        let size = self.storage.files().piece_size(piece) as u64;
        let end = offset as u64 + length as u64;
        if end > size {
            return Err(StorageError::out_of_range("block end", end, size));
        }
        Ok(())
    }

    /// Reads `length` bytes of `piece` starting at `offset`.
    pub async fn read(&self, piece: u32, offset: u32, length: u32) -> Result<Bytes, StorageError> {
        self.check_range(piece, offset, length as usize)?;
        let slot = self
            .slot_for(piece)
            .ok_or(StorageError::PieceNotStored(piece))?;

        let mut buf = self.storage.buffer_pool().get(length as usize);
        self.storage.read(&mut buf, slot, offset, ReadMode::Exact).await?;
        Ok(Bytes::copy_from_slice(&buf))
    }

    /// Writes a block of `piece`, allocating a slot for it first in compact
    /// mode.
    pub async fn write(&mut self, piece: u32, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        self.check_range(piece, offset, data.len())?;
        let slot = self.allocate_slot_for_piece(piece).await?;
        self.storage.write(data, slot, offset).await?;

        let partial = self.partial.entry(piece).or_insert_with(|| PartialHash {
            offset: 0,
            hasher: Sha1::new(),
        });
        if partial.offset == offset {
            partial.hasher.update(data);
            partial.offset += data.len() as u32;
        }
        self.unfinished.insert(piece);
        Ok(())
    }

    /// Hashes `piece` as stored, marking it as had when the digest matches
    /// the expected one.
    pub async fn hash_piece(&mut self, piece: u32) -> Result<[u8; 20], StorageError> {
        self.check_piece(piece)?;
        let slot = self
            .slot_for(piece)
            .ok_or(StorageError::PieceNotStored(piece))?;
        let size = self.storage.files().piece_size(piece);

        let (offset, hasher) = match self.partial.remove(&piece) {
            Some(partial) if partial.offset <= size => (partial.offset, partial.hasher),
            _ => (0, Sha1::new()),
        };

        let mut buf = self.storage.buffer_pool().get((size - offset) as usize);
        if !buf.is_empty() {
            self.storage.read(&mut buf, slot, offset, ReadMode::ZeroFill).await?;
        }

        let digest: [u8; 20] = tokio::task::spawn_blocking(move || {
            let mut hasher = hasher;
            hasher.update(&buf[..]);
            hasher.finalize().into()
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;

        if digest == self.piece_hashes[piece as usize] {
            self.have.write().set_piece(piece as usize);
            self.unfinished.remove(&piece);
        } else {
            tracing::debug!("Piece {} failed hash check", piece);
        }
        Ok(digest)
    }

    /// Forgets the data of `piece` after it failed verification. In compact
    /// mode its slot goes back to the free list.
    pub fn mark_failed(&mut self, piece: u32) -> Result<(), StorageError> {
        self.check_piece(piece)?;
        self.have.write().clear_piece(piece as usize);
        self.unfinished.remove(&piece);
        self.partial.remove(&piece);

        if !self.mode.is_compact() {
            return Ok(());
        }
        if let Some(tables) = self.tables.as_mut() {
            if let Some(slot) = tables.map.slot_of(piece) {
                tables.map.set_unassigned(slot);
                tables.free_slots.push(slot);
            }
        }
        Ok(())
    }

    pub async fn write_resume_data(&self) -> Result<ResumeData, StorageError> {
        let mut rd = ResumeData {
            piece_length: self.storage.files().piece_length(),
            slot_map: self.export_piece_map(),
            storage_mode: self.mode,
            unfinished_pieces: self.unfinished.iter().copied().collect(),
            ..Default::default()
        };
        self.storage.write_resume_data(&mut rd).await?;
        Ok(rd)
    }

    pub async fn move_storage(&mut self, new_path: &Path) -> Result<(), StorageError> {
        self.storage.move_storage(new_path).await
    }

    pub async fn release_files(&self) -> Result<(), StorageError> {
        self.storage.release_files().await
    }

    pub async fn delete_files(&self) -> Result<(), StorageError> {
        self.storage.delete_files().await
    }

    pub async fn rename_file(&mut self, index: usize, new_name: &Path) -> Result<(), StorageError> {
        self.storage.rename_file(index, new_name).await
    }
}
