use super::slot_map::SlotEntry;
use super::PieceManager;
use crate::config::StorageMode;
use crate::storage::{StorageError, StorageInterface};

impl<S: StorageInterface> PieceManager<S> {
    /// Returns the slot `piece` should be written to, handing out a new one
    /// in compact mode.
    ///
    /// The short last slot only ever goes to the last piece. When the home
    /// slot of `piece` holds another piece, that piece is moved into the new
    /// slot and `piece` gets its home instead.
    pub async fn allocate_slot_for_piece(&mut self, piece: u32) -> Result<u32, StorageError> {
        self.check_piece(piece)?;
        if !self.mode.is_compact() {
            return Ok(piece);
        }
        let Some(tables) = self.tables.as_ref() else {
            return Ok(piece);
        };
        if let Some(slot) = tables.map.slot_of(piece) {
            return Ok(slot);
        }

        if tables.free_slots.is_empty() {
            self.allocate_slots(1).await?;
        }
        let slot = self.take_free_slot(piece).await?;

        let Some(tables) = self.tables.as_mut() else {
            return Ok(slot);
        };
        let mut slot = slot;
        match tables.map.entry(piece) {
            SlotEntry::Piece(other) if slot != piece => {
                if let Err(e) = self.storage.move_slot(piece, slot).await {
                    tables.map.set_unassigned(slot);
                    tables.free_slots.push(slot);
                    return Err(e);
                }
                tables.map.assign(other, slot);
                tables.map.assign(piece, piece);
                tracing::trace!("Piece {} moved to slot {} to make room", other, slot);
                slot = piece;
            }
            _ => {
                tables.map.assign(piece, slot);
            }
        }

        if tables.free_slots.is_empty()
            && tables.unallocated_slots.is_empty()
            && tables.map.is_identity()
        {
            self.switch_to_full_mode();
        }
        Ok(slot)
    }

    /// Picks a free slot for `piece` and removes it from the free list.
    async fn take_free_slot(&mut self, piece: u32) -> Result<u32, StorageError> {
        let last = self.num_pieces() - 1;
        let Some(tables) = self.tables.as_mut() else {
            return Ok(piece);
        };
        if tables.remove_free(piece) {
            return Ok(piece);
        }
        let Some(&back) = tables.free_slots.last() else {
            return Err(StorageError::NoFreeSlot(piece));
        };

        if back == last && piece != last && tables.free_slots.len() == 1 {
            self.allocate_slots(1).await?;
            let only_last = self
                .tables
                .as_ref()
                .is_some_and(|t| t.free_slots.len() == 1);
            if only_last {
                self.move_last_piece_home().await?;
            }
        }

        let Some(tables) = self.tables.as_mut() else {
            return Ok(piece);
        };
        let position = if piece == last {
            tables.free_slots.len().checked_sub(1)
        } else {
            tables.free_slots.iter().rposition(|&s| s != last)
        };
        let Some(position) = position else {
            return Err(StorageError::NoFreeSlot(piece));
        };
        Ok(tables.free_slots.remove(position))
    }

    /// Frees a full-size slot by moving the last piece into the last slot.
    async fn move_last_piece_home(&mut self) -> Result<(), StorageError> {
        let last = self.num_pieces() - 1;
        let Some(tables) = self.tables.as_mut() else {
            return Ok(());
        };
        let Some(from) = tables.map.slot_of(last) else {
            return Ok(());
        };

        self.storage.move_slot(from, last).await?;
        tables.map.assign(last, last);
        tables.remove_free(last);
        tables.free_slots.push(from);
        tracing::trace!("Last piece moved home from slot {}", from);
        Ok(())
    }

    /// Turns up to `count` unallocated slots into free ones. A slot whose
    /// own piece is stored elsewhere pulls it home and frees the old slot
    /// instead. Returns whether any data was moved.
    pub async fn allocate_slots(&mut self, count: u32) -> Result<bool, StorageError> {
        if !self.mode.is_compact() {
            return Ok(false);
        }
        let mut written = false;

        for _ in 0..count {
            let Some(tables) = self.tables.as_mut() else {
                break;
            };
            let Some(&pos) = tables.unallocated_slots.front() else {
                break;
            };

            let new_free = match tables.map.slot_of(pos) {
                Some(elsewhere) => {
                    self.storage.move_slot(elsewhere, pos).await?;
                    tables.map.assign(pos, pos);
                    written = true;
                    elsewhere
                }
                None => {
                    tables.map.set_unassigned(pos);
                    pos
                }
            };
            tables.unallocated_slots.pop_front();
            tables.free_slots.push(new_free);
        }
        Ok(written)
    }

    /// Drops the tables once every slot holds its own piece.
    pub(super) fn switch_to_full_mode(&mut self) {
        tracing::debug!("All slots allocated, switching to sparse mode");
        self.mode = StorageMode::Sparse;
        self.tables = None;
    }
}
