use std::path::PathBuf;

/// One file of a torrent, positioned in the torrent's byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the save path
    pub path: PathBuf,
    pub size: u64,
    /// Offset of the first byte of this file within the torrent
    pub offset: u64,
    /// Padding files are never created on disk and read back as zeros.
    pub pad_file: bool,
    pub executable: bool,
    /// Target of a symlink entry, relative to the save path
    pub symlink_path: Option<PathBuf>,
}

impl FileEntry {
    /// Creates a regular file entry. The offset is assigned when the entry
    /// is added to a [`FileStorage`](super::FileStorage).
    pub fn new(path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            offset: 0,
            pad_file: false,
            executable: false,
            symlink_path: None,
        }
    }

    pub fn pad(size: u64) -> Self {
        let mut entry = Self::new(PathBuf::from(".pad").join(size.to_string()), size);
        entry.pad_file = true;
        entry
    }

    pub fn with_executable(mut self, executable: bool) -> Self {
        self.executable = executable;
        self
    }

    pub fn with_symlink(mut self, target: impl Into<PathBuf>) -> Self {
        self.symlink_path = Some(target.into());
        self
    }

    pub fn contains_offset(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.offset + self.size
    }
}

/// A window of a file that backs part of a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSlice {
    pub file_index: usize,
    /// Offset within the file
    pub offset: u64,
    pub size: u64,
    pub pad_file: bool,
}

/// A byte range expressed in piece coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerRequest {
    pub piece: u32,
    pub start: u32,
    pub length: u32,
}
