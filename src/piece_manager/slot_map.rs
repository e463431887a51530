use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// What a slot currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum SlotEntry {
    Piece(u32),
    /// Allocated on disk but holding no useful piece.
    Unassigned,
    /// Never written; storage must grow before the slot is used.
    Unallocated,
}

impl SlotEntry {
    pub const UNASSIGNED: i32 = -1;
    pub const UNALLOCATED: i32 = -2;

    pub fn piece(self) -> Option<u32> {
        match self {
            SlotEntry::Piece(p) => Some(p),
            _ => None,
        }
    }
}

impl From<SlotEntry> for i32 {
    fn from(entry: SlotEntry) -> i32 {
        match entry {
            SlotEntry::Piece(p) => p as i32,
            SlotEntry::Unassigned => SlotEntry::UNASSIGNED,
            SlotEntry::Unallocated => SlotEntry::UNALLOCATED,
        }
    }
}

impl TryFrom<i32> for SlotEntry {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            SlotEntry::UNASSIGNED => Ok(SlotEntry::Unassigned),
            SlotEntry::UNALLOCATED => Ok(SlotEntry::Unallocated),
            p if p >= 0 => Ok(SlotEntry::Piece(p as u32)),
            other => Err(format!("invalid slot entry {}", other)),
        }
    }
}

/// Result of [`SlotMap::assign`]: what had to give way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Displaced {
    /// Slot the piece occupied before; now [`SlotEntry::Unassigned`].
    pub previous_slot: Option<u32>,
    /// Piece that occupied the target slot; now has no slot.
    pub evicted: Option<u32>,
}

/// Bidirectional piece/slot table.
///
/// `piece_to_slot[p] == Some(s)` holds exactly when `slot_to_piece[s] ==
/// Piece(p)`. Every mutating method keeps both directions in step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotMap {
    piece_to_slot: Vec<Option<u32>>,
    slot_to_piece: Vec<SlotEntry>,
}

impl SlotMap {
    /// All slots unallocated, no piece placed.
    pub fn new(num_pieces: u32) -> Self {
        Self {
            piece_to_slot: vec![None; num_pieces as usize],
            slot_to_piece: vec![SlotEntry::Unallocated; num_pieces as usize],
        }
    }

    pub fn len(&self) -> u32 {
        self.slot_to_piece.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.slot_to_piece.is_empty()
    }

    pub fn slot_of(&self, piece: u32) -> Option<u32> {
        self.piece_to_slot.get(piece as usize).copied().flatten()
    }

    pub fn entry(&self, slot: u32) -> SlotEntry {
        self.slot_to_piece
            .get(slot as usize)
            .copied()
            .unwrap_or(SlotEntry::Unallocated)
    }

    pub fn entries(&self) -> &[SlotEntry] {
        &self.slot_to_piece
    }

    /// Places `piece` in `slot`.
    pub fn assign(&mut self, piece: u32, slot: u32) -> Displaced {
        let mut displaced = Displaced::default();

        if let Some(old) = self.slot_of(piece) {
            if old == slot {
                return displaced;
            }
            self.slot_to_piece[old as usize] = SlotEntry::Unassigned;
            displaced.previous_slot = Some(old);
        }

        if let SlotEntry::Piece(other) = self.slot_to_piece[slot as usize] {
            self.piece_to_slot[other as usize] = None;
            displaced.evicted = Some(other);
        }

        self.slot_to_piece[slot as usize] = SlotEntry::Piece(piece);
        self.piece_to_slot[piece as usize] = Some(slot);
        displaced
    }

    /// Marks `slot` unassigned, returning the piece it held.
    pub fn set_unassigned(&mut self, slot: u32) -> Option<u32> {
        self.clear(slot, SlotEntry::Unassigned)
    }

    /// Marks `slot` unallocated, returning the piece it held.
    pub fn set_unallocated(&mut self, slot: u32) -> Option<u32> {
        self.clear(slot, SlotEntry::Unallocated)
    }

    fn clear(&mut self, slot: u32, to: SlotEntry) -> Option<u32> {
        let previous = self.slot_to_piece[slot as usize].piece();
        if let Some(piece) = previous {
            self.piece_to_slot[piece as usize] = None;
        }
        self.slot_to_piece[slot as usize] = to;
        previous
    }

    /// Exchanges the entries of two slots.
    pub fn swap_slots(&mut self, a: u32, b: u32) {
        self.slot_to_piece.swap(a as usize, b as usize);
        self.relink(a);
        self.relink(b);
    }

    /// Rotates entries the same way slot contents move in a three-way
    /// swap: `a` goes to `b`, `b` goes to `c`, `c` goes to `a`.
    pub fn rotate3(&mut self, a: u32, b: u32, c: u32) {
        let (ea, eb, ec) = (self.entry(a), self.entry(b), self.entry(c));
        self.slot_to_piece[b as usize] = ea;
        self.slot_to_piece[c as usize] = eb;
        self.slot_to_piece[a as usize] = ec;
        self.relink(a);
        self.relink(b);
        self.relink(c);
    }

    fn relink(&mut self, slot: u32) {
        if let SlotEntry::Piece(p) = self.slot_to_piece[slot as usize] {
            self.piece_to_slot[p as usize] = Some(slot);
        }
    }

    /// True when every placed piece sits in its own slot.
    pub fn is_identity(&self) -> bool {
        self.slot_to_piece
            .iter()
            .enumerate()
            .all(|(slot, entry)| match entry {
                SlotEntry::Piece(p) => *p as usize == slot,
                _ => true,
            })
    }

    /// Number of placed pieces not in their own slot.
    pub fn out_of_place(&self) -> usize {
        self.slot_to_piece
            .iter()
            .enumerate()
            .filter(|(slot, entry)| matches!(entry, SlotEntry::Piece(p) if *p as usize != *slot))
            .count()
    }

    /// Checks that both directions agree.
    pub fn check_invariant(&self) -> bool {
        let forward = self
            .piece_to_slot
            .iter()
            .enumerate()
            .all(|(piece, slot)| match slot {
                Some(s) => self.entry(*s) == SlotEntry::Piece(piece as u32),
                None => true,
            });
        let backward = self
            .slot_to_piece
            .iter()
            .enumerate()
            .all(|(slot, entry)| match entry {
                SlotEntry::Piece(p) => self.slot_of(*p) == Some(slot as u32),
                _ => true,
            });
        forward && backward
    }
}

/// Slot map plus the free and unallocated lists used in compact mode.
#[derive(Debug, Clone)]
pub struct SlotTables {
    pub map: SlotMap,
    /// Unassigned slots ready for new pieces
    pub free_slots: Vec<u32>,
    /// Slots storage has not grown into yet, lowest first
    pub unallocated_slots: VecDeque<u32>,
}

impl SlotTables {
    pub fn new(num_pieces: u32) -> Self {
        Self {
            map: SlotMap::new(num_pieces),
            free_slots: Vec::new(),
            unallocated_slots: VecDeque::new(),
        }
    }

    pub fn remove_free(&mut self, slot: u32) -> bool {
        match self.free_slots.iter().position(|&s| s == slot) {
            Some(i) => {
                self.free_slots.remove(i);
                true
            }
            None => false,
        }
    }

    /// Every slot is in exactly one of free, unallocated or assigned, and
    /// the lists agree with the slot entries.
    pub fn check_invariant(&self) -> bool {
        if !self.map.check_invariant() {
            return false;
        }
        let mut seen = vec![false; self.map.len() as usize];
        for &slot in self.free_slots.iter().chain(self.unallocated_slots.iter()) {
            match seen.get_mut(slot as usize) {
                Some(flag) if !*flag => *flag = true,
                _ => return false,
            }
        }
        self.free_slots
            .iter()
            .all(|&s| self.map.entry(s) == SlotEntry::Unassigned)
            && self
                .unallocated_slots
                .iter()
                .all(|&s| self.map.entry(s) == SlotEntry::Unallocated)
    }
}
