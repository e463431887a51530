use super::slot_map::SlotTables;
use crate::bitfield::Bitfield;
use parking_lot::RwLock;
use sha1::{Digest, Sha1};
use std::collections::HashMap;

pub(crate) type Digest20 = [u8; 20];

/// Known piece hash to every piece index carrying it.
#[derive(Debug, Default)]
pub(crate) struct HashIndex {
    by_hash: HashMap<Digest20, Vec<u32>>,
}

impl HashIndex {
    pub(crate) fn new(piece_hashes: &[Digest20]) -> Self {
        let mut by_hash: HashMap<Digest20, Vec<u32>> = HashMap::with_capacity(piece_hashes.len());
        for (index, hash) in piece_hashes.iter().enumerate() {
            by_hash.entry(*hash).or_default().push(index as u32);
        }
        Self { by_hash }
    }

    /// Matches for the small digest followed by matches for the large one.
    pub(crate) fn candidates(&self, small: Option<&Digest20>, large: &Digest20) -> Vec<u32> {
        let small = small.and_then(|h| self.by_hash.get(h));
        let large = self.by_hash.get(large);
        small
            .into_iter()
            .chain(large)
            .flat_map(|pieces| pieces.iter().copied())
            .collect()
    }
}

/// Digests of one slot's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotDigest {
    /// Over the first `last_piece_size` bytes; `None` when the slot is
    /// exactly that long.
    pub small: Option<Digest20>,
    pub large: Digest20,
}

impl SlotDigest {
    pub(crate) fn of(data: &[u8], last_piece_size: usize) -> Self {
        let mut hasher = Sha1::new();
        let small = if last_piece_size < data.len() {
            hasher.update(&data[..last_piece_size]);
            let small: Digest20 = hasher.clone().finalize().into();
            hasher.update(&data[last_piece_size..]);
            Some(small)
        } else {
            hasher.update(data);
            None
        };
        Self {
            small,
            large: hasher.finalize().into(),
        }
    }
}

/// Decides which piece the data scanned in slot `current` belongs to.
///
/// A candidate is claimed once the tables give it a slot. The returned
/// piece is marked in `have`.
pub(crate) fn identify_data(
    candidates: &[u32],
    current: u32,
    tables: &mut SlotTables,
    have: &RwLock<Bitfield>,
    compact: bool,
) -> Option<u32> {
    if candidates.is_empty() {
        return None;
    }

    let mut have = have.write();

    if candidates.contains(&current) {
        if let Some(other_slot) = tables.map.slot_of(current) {
            // An earlier slot was taken for this piece; this slot wins.
            let replacement = candidates
                .iter()
                .copied()
                .find(|&c| c != current && tables.map.slot_of(c).is_none());
            match replacement {
                Some(other) => {
                    tables.map.assign(other, other_slot);
                    have.set_piece(other as usize);
                }
                None => {
                    tables.map.set_unassigned(other_slot);
                    if compact {
                        tables.free_slots.push(other_slot);
                    }
                }
            }
            tracing::trace!(
                "Slot {} matches its own piece, displacing earlier find in slot {}",
                current,
                other_slot
            );
        }
        have.set_piece(current as usize);
        return Some(current);
    }

    let free = candidates
        .iter()
        .copied()
        .find(|&c| tables.map.slot_of(c).is_none())?;
    have.set_piece(free as usize);
    Some(free)
}
