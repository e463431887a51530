use super::job::{DiskJob, Reply};
use crate::bitfield::Bitfield;
use crate::piece_manager::{CheckStep, PieceManager, ScanOutcome, SlotEntry};
use crate::resume::ResumeData;
use crate::storage::{StorageError, StorageInterface};
use bytes::Bytes;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;

/// Runs the jobs of one torrent, one at a time.
pub(crate) struct DiskWorker<S: StorageInterface> {
    name: String,
    manager: PieceManager<S>,
    jobs: mpsc::Receiver<DiskJob>,
    limiter: Arc<Semaphore>,
}

impl<S: StorageInterface + 'static> DiskWorker<S> {
    async fn run(mut self) {
        tracing::debug!("Disk worker for {} started", self.name);

        while let Some(job) = self.jobs.recv().await {
            let _permit = match Arc::clone(&self.limiter).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    job.fail(StorageError::Io(std::io::Error::other("semaphore closed")));
                    break;
                }
            };

            tracing::trace!("{}: running {} job", self.name, job.name());
            if !self.execute(job).await {
                break;
            }
        }

        tracing::debug!("Disk worker for {} stopped", self.name);
    }

    /// Returns false once the worker should stop.
    async fn execute(&mut self, job: DiskJob) -> bool {
        let pm = &mut self.manager;
        match job {
            DiskJob::CheckFastresume { resume, reply } => {
                let _ = reply.send(pm.check_fastresume(resume.as_deref()).await);
            }
            DiskJob::CheckStep { reply } => {
                let result = pm.check_files().await;
                if let Err(e) = &result {
                    tracing::warn!("{}: file check failed: {}", self.name, e);
                }
                let _ = reply.send(result);
            }
            DiskJob::Read {
                piece,
                offset,
                length,
                reply,
            } => {
                let _ = reply.send(pm.read(piece, offset, length).await);
            }
            DiskJob::Write {
                piece,
                offset,
                data,
                reply,
            } => {
                let _ = reply.send(pm.write(piece, offset, &data).await);
            }
            DiskJob::Hash { piece, reply } => {
                let _ = reply.send(pm.hash_piece(piece).await);
            }
            DiskJob::MoveStorage { path, reply } => {
                let _ = reply.send(pm.move_storage(&path).await);
            }
            DiskJob::ReleaseFiles { reply } => {
                let _ = reply.send(pm.release_files().await);
            }
            DiskJob::DeleteFiles { reply } => {
                let _ = reply.send(pm.delete_files().await);
            }
            DiskJob::RenameFile { index, name, reply } => {
                let _ = reply.send(pm.rename_file(index, &name).await);
            }
            DiskJob::WriteResumeData { reply } => {
                let _ = reply.send(pm.write_resume_data().await);
            }
            DiskJob::MarkFailed { piece, reply } => {
                let _ = reply.send(pm.mark_failed(piece));
            }
            DiskJob::ExportPieceMap { reply } => {
                let _ = reply.send(Ok(pm.export_piece_map()));
            }
            DiskJob::Shutdown { reply } => {
                let _ = reply.send(pm.release_files().await);
                return false;
            }
        }
        true
    }
}

/// Handle to the disk worker of one torrent.
///
/// Cloning the handle is cheap; all clones feed the same worker, so jobs
/// submitted through any of them run in submission order. Every call fails
/// with [`StorageError::WorkerGone`] once the worker has stopped.
#[derive(Clone)]
pub struct TorrentDisk {
    jobs: mpsc::Sender<DiskJob>,
    have: Arc<RwLock<Bitfield>>,
    abort: Arc<AtomicBool>,
    num_pieces: u32,
}

impl TorrentDisk {
    /// Spawns a worker owning `manager` on the current tokio runtime.
    pub fn spawn<S: StorageInterface + 'static>(
        name: impl Into<String>,
        manager: PieceManager<S>,
        limiter: Arc<Semaphore>,
        queue_depth: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let handle = Self {
            jobs: tx,
            have: manager.have_handle(),
            abort: manager.abort_handle(),
            num_pieces: manager.num_pieces(),
        };
        let worker = DiskWorker {
            name: name.into(),
            manager,
            jobs: rx,
            limiter,
        };
        (handle, tokio::spawn(worker.run()))
    }

    async fn submit<T>(&self, job: impl FnOnce(Reply<T>) -> DiskJob) -> Result<T, StorageError> {
        let (tx, rx) = oneshot::channel();
        self.jobs
            .send(job(tx))
            .await
            .map_err(|_| StorageError::WorkerGone)?;
        rx.await.map_err(|_| StorageError::WorkerGone)?
    }

    pub fn num_pieces(&self) -> u32 {
        self.num_pieces
    }

    /// Snapshot of the verified pieces. Does not wait for queued jobs.
    pub fn have_pieces(&self) -> Bitfield {
        self.have.read().clone()
    }

    /// Makes the next check step fail with [`StorageError::CheckAborted`].
    /// A later [`TorrentDisk::check_fastresume`] clears the flag.
    pub fn abort_check(&self) {
        self.abort.store(true, Ordering::Release);
    }

    pub async fn check_fastresume(
        &self,
        resume: Option<ResumeData>,
    ) -> Result<ScanOutcome, StorageError> {
        let resume = resume.map(Box::new);
        self.submit(|reply| DiskJob::CheckFastresume { resume, reply })
            .await
    }

    /// Runs one step of the startup check.
    pub async fn run_check_step(&self) -> Result<CheckStep, StorageError> {
        self.submit(|reply| DiskJob::CheckStep { reply }).await
    }

    /// Runs check steps until the check is finished, yielding between steps
    /// so other jobs of this torrent can interleave.
    pub async fn check_until_done(&self) -> Result<(), StorageError> {
        loop {
            let step = self.run_check_step().await?;
            if step.done {
                return Ok(());
            }
            tokio::task::yield_now().await;
        }
    }

    pub async fn read(&self, piece: u32, offset: u32, length: u32) -> Result<Bytes, StorageError> {
        self.submit(|reply| DiskJob::Read {
            piece,
            offset,
            length,
            reply,
        })
        .await
    }

    pub async fn write(&self, piece: u32, offset: u32, data: Bytes) -> Result<(), StorageError> {
        self.submit(|reply| DiskJob::Write {
            piece,
            offset,
            data,
            reply,
        })
        .await
    }

    /// Hashes `piece` as stored and returns the digest. The piece shows up
    /// in [`TorrentDisk::have_pieces`] when it matched.
    pub async fn hash_piece(&self, piece: u32) -> Result<[u8; 20], StorageError> {
        self.submit(|reply| DiskJob::Hash { piece, reply }).await
    }

    pub async fn move_storage(&self, path: impl Into<PathBuf>) -> Result<(), StorageError> {
        let path = path.into();
        self.submit(|reply| DiskJob::MoveStorage { path, reply })
            .await
    }

    pub async fn release_files(&self) -> Result<(), StorageError> {
        self.submit(|reply| DiskJob::ReleaseFiles { reply }).await
    }

    pub async fn delete_files(&self) -> Result<(), StorageError> {
        self.submit(|reply| DiskJob::DeleteFiles { reply }).await
    }

    pub async fn rename_file(
        &self,
        index: usize,
        name: impl Into<PathBuf>,
    ) -> Result<(), StorageError> {
        let name = name.into();
        self.submit(|reply| DiskJob::RenameFile { index, name, reply })
            .await
    }

    pub async fn write_resume_data(&self) -> Result<ResumeData, StorageError> {
        self.submit(|reply| DiskJob::WriteResumeData { reply })
            .await
    }

    pub async fn mark_failed(&self, piece: u32) -> Result<(), StorageError> {
        self.submit(|reply| DiskJob::MarkFailed { piece, reply })
            .await
    }

    pub async fn export_piece_map(&self) -> Result<Vec<SlotEntry>, StorageError> {
        self.submit(|reply| DiskJob::ExportPieceMap { reply })
            .await
    }

    /// Releases the files and stops the worker after the jobs queued
    /// before this call.
    pub async fn shutdown(&self) -> Result<(), StorageError> {
        self.submit(|reply| DiskJob::Shutdown { reply }).await
    }
}
