use super::identify::{identify_data, HashIndex, SlotDigest};
use super::rotation::Reconcile;
use super::slot_map::{SlotEntry, SlotTables};
use super::{CheckStep, Expand, FullCheck, PieceManager, ScanOutcome, ScanState, Scratch};
use crate::bitfield::Bitfield;
use crate::file_storage::FileStorage;
use crate::resume::ResumeData;
use crate::storage::{ReadMode, ResumeRejection, StorageError, StorageInterface};
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;

fn fatal(e: StorageError) -> StorageError {
    match e {
        StorageError::FatalDisk(_) => e,
        other => StorageError::FatalDisk(other.to_string()),
    }
}

/// Slots from `slot` to the end of the file backing it.
fn slots_left_in_file(files: &FileStorage, slot: u32) -> u32 {
    let piece_length = files.piece_length() as u64;
    let offset = slot as u64 * piece_length;
    let file_end = files
        .files()
        .iter()
        .map(|f| f.offset + f.size)
        .find(|&end| end > offset)
        .unwrap_or(files.total_size());
    (file_end.saturating_sub(offset).div_ceil(piece_length)).max(1) as u32
}

/// Rebuilds the slot tables from a persisted slot map.
fn tables_from_resume(
    rd: &ResumeData,
    num_pieces: u32,
    compact: bool,
) -> Result<(SlotTables, bool), ResumeRejection> {
    let mut tables = SlotTables::new(num_pieces);
    let mut out_of_place = false;

    for (slot, entry) in rd.slot_map.iter().enumerate() {
        let slot = slot as u32;
        match *entry {
            SlotEntry::Piece(piece) => {
                if piece >= num_pieces {
                    return Err(ResumeRejection::InvalidPiece(piece as i64));
                }
                if tables.map.slot_of(piece).is_some() {
                    return Err(ResumeRejection::DuplicatePiece(piece));
                }
                tables.map.assign(piece, slot);
                out_of_place |= piece != slot;
            }
            SlotEntry::Unassigned => {
                tables.map.set_unassigned(slot);
                if compact {
                    tables.free_slots.push(slot);
                }
            }
            SlotEntry::Unallocated => {
                if compact {
                    tables.unallocated_slots.push_back(slot);
                }
            }
        }
    }
    if compact {
        tables
            .unallocated_slots
            .extend(rd.slot_map.len() as u32..num_pieces);
    }
    Ok((tables, out_of_place))
}

impl<S: StorageInterface> PieceManager<S> {
    /// Restores the tables from fast-resume data, falling back to a full
    /// check when there is none or it cannot be trusted. Never reads piece
    /// data.
    pub async fn check_fastresume(
        &mut self,
        resume: Option<&ResumeData>,
    ) -> Result<ScanOutcome, StorageError> {
        self.abort.store(false, Ordering::Release);

        let Some(rd) = resume.filter(|rd| !rd.slot_map.is_empty()) else {
            return self.check_no_fastresume().await;
        };

        match self.load_resume(rd).await {
            Ok(outcome) => Ok(outcome),
            Err(StorageError::ResumeDataRejected(reason)) => {
                tracing::info!("Fast resume rejected: {}", reason);
                self.check_no_fastresume().await
            }
            Err(e) => Err(fatal(e)),
        }
    }

    async fn load_resume(&mut self, rd: &ResumeData) -> Result<ScanOutcome, StorageError> {
        let num_pieces = self.num_pieces();
        let piece_length = self.storage.files().piece_length();
        if rd.piece_length != piece_length {
            return Err(ResumeRejection::PieceLengthMismatch {
                recorded: rd.piece_length,
                actual: piece_length,
            }
            .into());
        }
        if rd.slot_map.len() > num_pieces as usize {
            return Err(ResumeRejection::TooManySlots {
                slots: rd.slot_map.len(),
                pieces: num_pieces as usize,
            }
            .into());
        }
        if let Some(&bad) = rd.unfinished_pieces.iter().find(|&&p| p >= num_pieces) {
            return Err(ResumeRejection::InvalidPiece(bad as i64).into());
        }

        let compact = self.mode.is_compact();
        let (tables, out_of_place) = tables_from_resume(rd, num_pieces, compact)?;
        self.storage
            .verify_resume_data(rd, rd.storage_mode.is_compact())
            .await?;

        let unfinished: BTreeSet<u32> = rd.unfinished_pieces.iter().copied().collect();
        let mut have = Bitfield::new(num_pieces as usize);
        for entry in tables.map.entries() {
            if let SlotEntry::Piece(piece) = *entry {
                if !unfinished.contains(&piece) {
                    have.set_piece(piece as usize);
                }
            }
        }
        *self.have.write() = have;
        self.unfinished = unfinished;
        self.partial.clear();
        self.out_of_place = out_of_place;

        tracing::debug!(
            "Fast resume accepted: {}/{} pieces, {} unfinished",
            self.have.read().count(),
            num_pieces,
            self.unfinished.len()
        );

        if compact {
            let identity = tables.unallocated_slots.is_empty() && tables.map.is_identity();
            self.tables = Some(tables);
            if identity {
                self.switch_to_full_mode();
            }
            self.scan = ScanState::CreateFiles;
            return Ok(ScanOutcome::NoError);
        }

        if out_of_place {
            tracing::debug!("Resumed pieces are out of place, reordering");
            self.tables = Some(tables);
            self.scan = ScanState::ExpandPieces(Expand {
                cursor: 0,
                scratch: None,
            });
            return Ok(ScanOutcome::NeedFullCheck);
        }

        self.tables = None;
        self.scan = ScanState::CreateFiles;
        Ok(ScanOutcome::NoError)
    }

    async fn check_no_fastresume(&mut self) -> Result<ScanOutcome, StorageError> {
        let has_files = self.storage.has_any_file().await.map_err(fatal)?;
        let num_pieces = self.num_pieces();

        self.have.write().clear_all();
        self.unfinished.clear();
        self.partial.clear();
        self.out_of_place = false;
        self.tables = Some(SlotTables::new(num_pieces));
        self.scan = ScanState::FullCheck(FullCheck {
            cursor: 0,
            index: None,
        });

        tracing::debug!(
            "Starting full check of {} slots (files present: {})",
            num_pieces,
            has_files
        );
        Ok(ScanOutcome::NeedFullCheck)
    }

    /// Advances the startup check by one slot.
    pub async fn check_files(&mut self) -> Result<CheckStep, StorageError> {
        if self.abort.load(Ordering::Acquire) {
            self.park_scratch().await?;
            return Err(StorageError::CheckAborted);
        }
        if matches!(self.scan, ScanState::Idle) {
            self.check_no_fastresume().await?;
        }

        match self.scan {
            ScanState::Idle => Ok(CheckStep::pending(0, self.num_pieces(), None)),
            ScanState::FullCheck(_) => self.full_check_step().await,
            ScanState::ExpandPieces(_) => self.expand_step().await,
            ScanState::CreateFiles => self.create_files().await,
            ScanState::Finished => Ok(CheckStep::finished()),
        }
    }

    async fn full_check_step(&mut self) -> Result<CheckStep, StorageError> {
        let num_pieces = self.num_pieces();
        let compact = self.mode.is_compact();

        let ScanState::FullCheck(check) = &mut self.scan else {
            return Ok(CheckStep::pending(0, num_pieces, None));
        };
        let current = check.cursor;
        if current >= num_pieces {
            return self.finish_full_check().await;
        }
        let index = check
            .index
            .get_or_insert_with(|| HashIndex::new(&self.piece_hashes));
        let tables = self
            .tables
            .get_or_insert_with(|| SlotTables::new(num_pieces));

        let files = self.storage.files();
        let size = files.piece_size(current) as usize;
        let mut buf = self.storage.buffer_pool().get(size);
        let read = self
            .storage
            .read(&mut buf, current, 0, ReadMode::ZeroFill)
            .await;

        let mut advance = 1;
        let mut found = None;
        match read {
            Ok(got) if got == size => {
                let digest = SlotDigest::of(&buf, files.last_piece_size() as usize);
                drop(buf);
                let candidates = index.candidates(digest.small.as_ref(), &digest.large);
                let identified = identify_data(&candidates, current, tables, &self.have, compact);

                let step = Reconcile::plan(tables, current, identified);
                let rotation = step.rotation(current);
                match rotation.apply(&self.storage).await {
                    Ok(()) => {
                        step.commit(tables, current, compact);
                        if let Some(piece) = identified {
                            self.out_of_place |= piece != current;
                        }
                        found = identified;
                        if identified.is_none() && current + 1 < num_pieces {
                            let next = self.storage.sparse_end(current + 1).await;
                            if next > current + 1 {
                                advance = next - current;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Moving data found in slot {} failed: {}", current, e);
                        // a partial rotation leaves every slot it touched in doubt
                        let mut have = self.have.write();
                        if let Some(piece) = identified {
                            have.clear_piece(piece as usize);
                        }
                        for slot in rotation.touched() {
                            if let Some(piece) = tables.map.set_unassigned(slot) {
                                have.clear_piece(piece as usize);
                            }
                            if compact && !tables.free_slots.contains(&slot) {
                                tables.free_slots.push(slot);
                            }
                        }
                        advance = slots_left_in_file(files, current);
                    }
                }
            }
            Ok(got) => {
                tracing::debug!("Slot {} short by {} bytes", current, size - got);
                advance = slots_left_in_file(files, current);
            }
            Err(e) => {
                tracing::debug!("Slot {} unreadable: {}", current, e);
                advance = slots_left_in_file(files, current);
            }
        }

        let next = (current + advance).min(num_pieces);
        if advance > 1 {
            tracing::debug!("Skipping slots {}..{}", current, next);
        }
        // skipped slots are still unallocated; a scanned slot never is
        if compact {
            for slot in current..next {
                if tables.map.entry(slot) == SlotEntry::Unallocated {
                    tables.unallocated_slots.push_back(slot);
                }
            }
        }

        check.cursor = next;
        if next >= num_pieces {
            return self.finish_full_check().await;
        }
        Ok(CheckStep::pending(next, num_pieces, found))
    }

    async fn finish_full_check(&mut self) -> Result<CheckStep, StorageError> {
        let compact = self.mode.is_compact();
        tracing::debug!(
            "Full check done: {} pieces found, out of place: {}",
            self.have.read().count(),
            self.out_of_place
        );

        if !compact {
            if self.out_of_place {
                self.scan = ScanState::ExpandPieces(Expand {
                    cursor: 0,
                    scratch: None,
                });
                return Ok(CheckStep::pending(0, self.num_pieces(), None));
            }
            self.tables = None;
        } else if self
            .tables
            .as_ref()
            .is_some_and(|t| t.unallocated_slots.is_empty() && t.map.is_identity())
        {
            self.switch_to_full_mode();
        }

        self.scan = ScanState::CreateFiles;
        self.create_files().await
    }

    /// Moves pieces of a non-compact torrent to their home slots, one slot
    /// per call.
    async fn expand_step(&mut self) -> Result<CheckStep, StorageError> {
        let num_pieces = self.num_pieces();
        let ScanState::ExpandPieces(expand) = &mut self.scan else {
            return Ok(CheckStep::pending(0, num_pieces, None));
        };
        let Some(tables) = self.tables.as_mut() else {
            self.scan = ScanState::CreateFiles;
            return self.create_files().await;
        };
        let files = self.storage.files();
        let pool = self.storage.buffer_pool();

        if let Some(scratch) = expand.scratch.take() {
            let home = scratch.piece;
            let mut next = None;
            if let Some(waiting) = tables.map.entry(home).piece() {
                let mut held = pool.get(files.piece_size(waiting) as usize);
                if let Err(e) = self.storage.read(&mut held, home, 0, ReadMode::ZeroFill).await {
                    expand.scratch = Some(scratch);
                    return Err(fatal(e));
                }
                next = Some(Scratch {
                    piece: waiting,
                    data: held,
                });
            }
            if let Err(e) = self.storage.write(&scratch.data, home, 0).await {
                expand.scratch = Some(scratch);
                return Err(fatal(e));
            }
            tables.map.assign(home, home);
            expand.scratch = next;
            return Ok(CheckStep::pending(expand.cursor, num_pieces, None));
        }

        let mut cursor = expand.cursor;
        let piece = loop {
            if cursor >= num_pieces {
                break None;
            }
            match tables.map.entry(cursor) {
                SlotEntry::Piece(p) if p != cursor => break Some(p),
                _ => cursor += 1,
            }
        };
        expand.cursor = cursor;

        let Some(piece) = piece else {
            tracing::debug!("All pieces in place");
            self.scan = ScanState::CreateFiles;
            return self.create_files().await;
        };

        let mut next = None;
        if let Some(waiting) = tables.map.entry(piece).piece() {
            let mut held = pool.get(files.piece_size(waiting) as usize);
            self.storage
                .read(&mut held, piece, 0, ReadMode::ZeroFill)
                .await
                .map_err(fatal)?;
            next = Some(Scratch {
                piece: waiting,
                data: held,
            });
        }
        self.storage.move_slot(cursor, piece).await.map_err(fatal)?;
        tables.map.assign(piece, piece);
        expand.scratch = next;

        tracing::trace!("Moved piece {} from slot {} home", piece, cursor);
        Ok(CheckStep::pending(cursor, num_pieces, None))
    }

    /// Writes a piece lifted out during expansion back to disk so an
    /// aborted check loses nothing.
    ///
    /// The slot the current move started from is unassigned while a piece
    /// is held, and its content was already copied elsewhere, so the held
    /// piece goes there.
    async fn park_scratch(&mut self) -> Result<(), StorageError> {
        let ScanState::ExpandPieces(expand) = &mut self.scan else {
            return Ok(());
        };
        let Some(tables) = self.tables.as_mut() else {
            return Ok(());
        };
        let Some(scratch) = expand.scratch.take() else {
            return Ok(());
        };
        let slot = expand.cursor;
        if tables.map.entry(slot).piece().is_some() {
            let piece = scratch.piece;
            expand.scratch = Some(scratch);
            return Err(StorageError::FatalDisk(format!(
                "no free slot to park piece {}",
                piece
            )));
        }
        if let Err(e) = self.storage.write(&scratch.data, slot, 0).await {
            expand.scratch = Some(scratch);
            return Err(fatal(e));
        }
        tables.map.assign(scratch.piece, slot);
        tracing::debug!("Parked piece {} in slot {} on abort", scratch.piece, slot);
        Ok(())
    }

    async fn create_files(&mut self) -> Result<CheckStep, StorageError> {
        let report = self
            .storage
            .initialize(self.mode.allocates_files())
            .await
            .map_err(fatal)?;
        if !report.is_clean() {
            tracing::warn!("{} files could not be initialized", report.failed.len());
        }
        self.init_failures = report.failed;

        if !self.mode.is_compact() {
            self.tables = None;
        }
        self.scan = ScanState::Finished;

        tracing::info!(
            "File check finished: {}/{} pieces",
            self.have.read().count(),
            self.num_pieces()
        );
        Ok(CheckStep::finished())
    }
}
