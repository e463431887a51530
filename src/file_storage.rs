//! Torrent file layout and piece arithmetic.
//!
//! A [`FileStorage`] describes the files of a torrent as one contiguous byte
//! stream cut into fixed-size pieces. It answers two questions: which file
//! windows back a given piece range ([`FileStorage::map_block`]), and which
//! piece range a file offset falls into ([`FileStorage::map_file`]).
//!
//! # Examples
//!
//! ```
//! use bitslot::file_storage::FileStorage;
//!
//! let mut fs = FileStorage::new(1024);
//! fs.add_file("a.bin", 1500);
//! fs.add_file("b.bin", 600);
//!
//! assert_eq!(fs.num_pieces(), 3);
//! assert_eq!(fs.last_piece_size(), 52);
//!
//! // Piece 1 starts inside a.bin and continues into b.bin.
//! let slices = fs.map_block(1, 0, 1024).unwrap();
//! assert_eq!(slices.len(), 2);
//! assert_eq!(slices[0].offset, 1024);
//! assert_eq!(slices[1].size, 548);
//! ```

mod entry;

pub use entry::{FileEntry, FileSlice, PeerRequest};

use crate::storage::StorageError;
use std::path::{Component, Path, PathBuf};

pub(crate) fn validate_file_path(file_path: &Path) -> Result<(), StorageError> {
    for component in file_path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::PathTraversal(file_path.display().to_string()));
            }
            _ => {}
        }
    }
    if file_path.as_os_str().is_empty() {
        return Err(StorageError::PathTraversal(String::new()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStorage {
    files: Vec<FileEntry>,
    piece_length: u32,
    total_size: u64,
}

impl FileStorage {
    /// Creates an empty layout. A zero piece length is treated as one byte.
    pub fn new(piece_length: u32) -> Self {
        Self {
            files: Vec::new(),
            piece_length: piece_length.max(1),
            total_size: 0,
        }
    }

    pub fn add_file(&mut self, path: impl Into<PathBuf>, size: u64) -> &mut Self {
        self.add_entry(FileEntry::new(path, size))
    }

    pub fn add_pad_file(&mut self, size: u64) -> &mut Self {
        self.add_entry(FileEntry::pad(size))
    }

    /// Appends a file; its offset is set to the current end of the torrent.
    pub fn add_entry(&mut self, mut entry: FileEntry) -> &mut Self {
        entry.offset = self.total_size;
        self.total_size += entry.size;
        self.files.push(entry);
        self
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn num_pieces(&self) -> u32 {
        self.total_size.div_ceil(self.piece_length as u64) as u32
    }

    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn file(&self, index: usize) -> Option<&FileEntry> {
        self.files.get(index)
    }

    /// Size of piece `index`; zero for indices past the end.
    pub fn piece_size(&self, index: u32) -> u32 {
        let num_pieces = self.num_pieces();
        if index >= num_pieces {
            return 0;
        }
        if index + 1 == num_pieces {
            return self.last_piece_size();
        }
        self.piece_length
    }

    pub fn last_piece_size(&self) -> u32 {
        let num_pieces = self.num_pieces();
        if num_pieces == 0 {
            return 0;
        }
        let before = (num_pieces as u64 - 1) * self.piece_length as u64;
        (self.total_size - before) as u32
    }

    /// Absolute path of file `index` under `save_path`.
    pub fn file_path(&self, index: usize, save_path: &Path) -> Option<PathBuf> {
        self.files.get(index).map(|f| save_path.join(&f.path))
    }

    /// Returns the file windows backing `size` bytes starting at `offset`
    /// within `piece`, in torrent order. Zero-length files never appear.
    pub fn map_block(
        &self,
        piece: u32,
        offset: u32,
        size: u32,
    ) -> Result<Vec<FileSlice>, StorageError> {
        let num_pieces = self.num_pieces();
        if piece >= num_pieces {
            return Err(StorageError::out_of_range("piece", piece, num_pieces));
        }
        let start = piece as u64 * self.piece_length as u64 + offset as u64;
        let end = start + size as u64;
        if end > self.total_size {
            return Err(StorageError::out_of_range("byte offset", end, self.total_size));
        }

        let mut slices = Vec::new();
        if size == 0 {
            return Ok(slices);
        }

        // last file starting at or before `start`
        let first = self.files.partition_point(|f| f.offset <= start);
        let mut remaining = size as u64;
        let mut position = start;

        for (index, file) in self.files.iter().enumerate().skip(first.saturating_sub(1)) {
            if remaining == 0 {
                break;
            }
            if !file.contains_offset(position) {
                continue;
            }
            let file_offset = position - file.offset;
            let take = remaining.min(file.size - file_offset);
            slices.push(FileSlice {
                file_index: index,
                offset: file_offset,
                size: take,
                pad_file: file.pad_file,
            });
            position += take;
            remaining -= take;
        }

        Ok(slices)
    }

    /// Maps a range within one file back to piece coordinates. The length
    /// is clamped to the end of the torrent.
    pub fn map_file(
        &self,
        file_index: usize,
        file_offset: u64,
        size: u32,
    ) -> Result<PeerRequest, StorageError> {
        let file = self
            .files
            .get(file_index)
            .ok_or_else(|| StorageError::out_of_range("file", file_index as u64, self.files.len() as u64))?;

        let offset = file.offset + file_offset;
        if offset >= self.total_size {
            return Err(StorageError::out_of_range("byte offset", offset, self.total_size));
        }

        let piece_length = self.piece_length as u64;
        Ok(PeerRequest {
            piece: (offset / piece_length) as u32,
            start: (offset % piece_length) as u32,
            length: (size as u64).min(self.total_size - offset) as u32,
        })
    }

    /// Index of the non-empty file containing torrent byte `offset`.
    pub fn file_index_at_offset(&self, offset: u64) -> Option<usize> {
        if offset >= self.total_size {
            return None;
        }
        let candidate = self.files.partition_point(|f| f.offset <= offset);
        self.files[..candidate]
            .iter()
            .rposition(|f| f.contains_offset(offset))
    }

    pub fn rename_file(&mut self, index: usize, new_path: impl Into<PathBuf>) -> Result<(), StorageError> {
        let new_path = new_path.into();
        validate_file_path(&new_path)?;
        let count = self.files.len();
        let file = self
            .files
            .get_mut(index)
            .ok_or_else(|| StorageError::out_of_range("file", index as u64, count as u64))?;
        file.path = new_path;
        Ok(())
    }

    /// Rejects any file path that could escape the save path.
    pub fn validate_paths(&self) -> Result<(), StorageError> {
        for file in &self.files {
            validate_file_path(&file.path)?;
            if let Some(target) = &file.symlink_path {
                validate_file_path(target)?;
            }
        }
        Ok(())
    }
}
