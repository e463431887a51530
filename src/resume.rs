//! Fast-resume data.
//!
//! [`ResumeData`] captures everything needed to restart a torrent without
//! re-hashing its files: the slot map, which pieces were only partially
//! written, and a size/mtime stamp for every file that corroborates the map.
//! It is encoded as JSON; slot entries are plain integers where `-1` means
//! unassigned and `-2` means unallocated.

use crate::config::StorageMode;
use crate::piece_manager::SlotEntry;
use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

/// Size and modification time of one file at the time resume data was saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileStamp {
    pub size: u64,
    /// Seconds since the unix epoch; zero when the file did not exist.
    pub mtime: i64,
}

impl FileStamp {
    /// Stats `path`, returning a zero stamp when the file does not exist.
    pub async fn of(path: &std::path::Path) -> std::io::Result<Self> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => {
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                Ok(Self {
                    size: meta.len(),
                    mtime,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResumeData {
    pub piece_length: u32,
    pub file_sizes: Vec<FileStamp>,
    pub slot_map: Vec<SlotEntry>,
    pub storage_mode: StorageMode,
    pub unfinished_pieces: Vec<u32>,
    /// New relative path for every renamed file, `None` for unchanged ones.
    /// Empty when no file was renamed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mapped_files: Vec<Option<PathBuf>>,
}

impl ResumeData {
    pub fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// True when the slot map places every piece, i.e. the torrent was
    /// complete when this data was written.
    pub fn is_seed(&self, num_pieces: u32) -> bool {
        num_pieces > 0
            && self.slot_map.len() == num_pieces as usize
            && self.slot_map.iter().all(|e| e.piece().is_some())
    }
}
