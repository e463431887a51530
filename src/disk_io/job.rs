use crate::piece_manager::{CheckStep, ScanOutcome, SlotEntry};
use crate::resume::ResumeData;
use crate::storage::StorageError;
use bytes::Bytes;
use std::path::PathBuf;
use tokio::sync::oneshot;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, StorageError>>;

/// A unit of work for a torrent's disk worker.
pub(crate) enum DiskJob {
    CheckFastresume {
        resume: Option<Box<ResumeData>>,
        reply: Reply<ScanOutcome>,
    },
    CheckStep {
        reply: Reply<CheckStep>,
    },
    Read {
        piece: u32,
        offset: u32,
        length: u32,
        reply: Reply<Bytes>,
    },
    Write {
        piece: u32,
        offset: u32,
        data: Bytes,
        reply: Reply<()>,
    },
    Hash {
        piece: u32,
        reply: Reply<[u8; 20]>,
    },
    MoveStorage {
        path: PathBuf,
        reply: Reply<()>,
    },
    ReleaseFiles {
        reply: Reply<()>,
    },
    DeleteFiles {
        reply: Reply<()>,
    },
    RenameFile {
        index: usize,
        name: PathBuf,
        reply: Reply<()>,
    },
    WriteResumeData {
        reply: Reply<ResumeData>,
    },
    MarkFailed {
        piece: u32,
        reply: Reply<()>,
    },
    ExportPieceMap {
        reply: Reply<Vec<SlotEntry>>,
    },
    /// Releases the files and stops the worker.
    Shutdown {
        reply: Reply<()>,
    },
}

impl DiskJob {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            DiskJob::CheckFastresume { .. } => "check_fastresume",
            DiskJob::CheckStep { .. } => "check_step",
            DiskJob::Read { .. } => "read",
            DiskJob::Write { .. } => "write",
            DiskJob::Hash { .. } => "hash",
            DiskJob::MoveStorage { .. } => "move_storage",
            DiskJob::ReleaseFiles { .. } => "release_files",
            DiskJob::DeleteFiles { .. } => "delete_files",
            DiskJob::RenameFile { .. } => "rename_file",
            DiskJob::WriteResumeData { .. } => "write_resume_data",
            DiskJob::MarkFailed { .. } => "mark_failed",
            DiskJob::ExportPieceMap { .. } => "export_piece_map",
            DiskJob::Shutdown { .. } => "shutdown",
        }
    }

    /// Answers the job with `error` without running it.
    pub(crate) fn fail(self, error: StorageError) {
        match self {
            DiskJob::CheckFastresume { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            DiskJob::CheckStep { reply } => {
                let _ = reply.send(Err(error));
            }
            DiskJob::Read { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            DiskJob::Hash { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            DiskJob::WriteResumeData { reply } => {
                let _ = reply.send(Err(error));
            }
            DiskJob::ExportPieceMap { reply } => {
                let _ = reply.send(Err(error));
            }
            DiskJob::Write { reply, .. }
            | DiskJob::MoveStorage { reply, .. }
            | DiskJob::ReleaseFiles { reply }
            | DiskJob::DeleteFiles { reply }
            | DiskJob::RenameFile { reply, .. }
            | DiskJob::MarkFailed { reply, .. }
            | DiskJob::Shutdown { reply } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}
