use super::slot_map::{SlotEntry, SlotTables};
use crate::storage::{StorageError, StorageInterface};

/// How the tables must change once the data in the current slot has been
/// identified during a full check.
///
/// `current` is the slot being scanned and `piece` the piece its bytes
/// belong to. A piece "belongs home" in the slot with its own index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reconcile {
    /// Nothing moves; record what the slot holds.
    Record { piece: Option<u32> },
    /// The data is piece `piece` and its home slot was already scanned.
    /// Whatever was recorded there (`displaced`) takes its place here.
    BringHome { piece: u32, displaced: SlotEntry },
    /// Piece `current` was found earlier in `owner_slot` and comes back
    /// here. The data found here, if any, goes to `owner_slot`.
    FetchOwner { piece: Option<u32>, owner_slot: u32 },
    /// Piece `current` sits in slot `piece` and piece `piece` sits here.
    TwoCycle { piece: u32 },
    /// Data here belongs in slot `piece`, whose occupant moves to
    /// `owner_slot`, whose occupant (piece `current`) comes here.
    ThreeCycle {
        piece: u32,
        owner_slot: u32,
        displaced: SlotEntry,
    },
}

/// Storage calls issued for a [`Reconcile`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rotation {
    None,
    Move { from: u32, to: u32 },
    Swap(u32, u32),
    /// Contents rotate `a -> b -> c -> a`.
    Swap3(u32, u32, u32),
    MoveTwice {
        first: (u32, u32),
        second: (u32, u32),
    },
}

impl Reconcile {
    /// Decides the reconciliation for slot `current` holding the data of
    /// `identified` without touching the tables.
    pub(crate) fn plan(tables: &SlotTables, current: u32, identified: Option<u32>) -> Self {
        let map = &tables.map;
        let target = identified
            .filter(|&p| p != current && map.entry(p) != SlotEntry::Unallocated);

        match (target, map.slot_of(current)) {
            (None, None) => Reconcile::Record { piece: identified },
            (Some(piece), None) => Reconcile::BringHome {
                piece,
                displaced: map.entry(piece),
            },
            (None, Some(owner_slot)) => Reconcile::FetchOwner {
                piece: identified,
                owner_slot,
            },
            (Some(piece), Some(owner_slot)) if owner_slot == piece => Reconcile::TwoCycle { piece },
            (Some(piece), Some(owner_slot)) => Reconcile::ThreeCycle {
                piece,
                owner_slot,
                displaced: map.entry(piece),
            },
        }
    }

    /// The slot moves that put the data where the committed tables say it
    /// is. Every source is read before its slot is overwritten.
    pub(crate) fn rotation(&self, current: u32) -> Rotation {
        match *self {
            Reconcile::Record { .. } => Rotation::None,
            Reconcile::BringHome { piece, displaced } => match displaced {
                SlotEntry::Piece(_) => Rotation::Swap(piece, current),
                _ => Rotation::Move {
                    from: current,
                    to: piece,
                },
            },
            Reconcile::FetchOwner { piece, owner_slot } => match piece {
                Some(_) => Rotation::Swap(owner_slot, current),
                None => Rotation::Move {
                    from: owner_slot,
                    to: current,
                },
            },
            Reconcile::TwoCycle { piece } => Rotation::Swap(current, piece),
            Reconcile::ThreeCycle {
                piece,
                owner_slot,
                displaced,
            } => match displaced {
                SlotEntry::Piece(_) => Rotation::Swap3(current, piece, owner_slot),
                _ => Rotation::MoveTwice {
                    first: (current, piece),
                    second: (owner_slot, current),
                },
            },
        }
    }

    /// Applies the step to the tables. Call only after the rotation
    /// succeeded on disk.
    pub(crate) fn commit(&self, tables: &mut SlotTables, current: u32, compact: bool) {
        match *self {
            Reconcile::Record { piece: Some(piece) } => {
                tables.map.assign(piece, current);
            }
            Reconcile::Record { piece: None } => {
                tables.map.set_unassigned(current);
                if compact {
                    tables.free_slots.push(current);
                }
            }
            Reconcile::BringHome { piece, displaced } => {
                tables.map.assign(piece, piece);
                match displaced {
                    SlotEntry::Piece(other) => {
                        tables.map.assign(other, current);
                    }
                    _ => {
                        tables.map.set_unassigned(current);
                        if compact {
                            tables.remove_free(piece);
                            tables.free_slots.push(current);
                        }
                    }
                }
            }
            Reconcile::FetchOwner { piece, owner_slot } => {
                tables.map.assign(current, current);
                match piece {
                    Some(piece) => {
                        tables.map.assign(piece, owner_slot);
                    }
                    None if compact => tables.free_slots.push(owner_slot),
                    None => {}
                }
            }
            Reconcile::TwoCycle { piece } => {
                tables.map.assign(current, current);
                tables.map.assign(piece, piece);
            }
            Reconcile::ThreeCycle {
                piece,
                owner_slot,
                displaced,
            } => {
                tables.map.assign(current, current);
                tables.map.assign(piece, piece);
                match displaced {
                    SlotEntry::Piece(other) => {
                        tables.map.assign(other, owner_slot);
                    }
                    _ if compact => {
                        tables.remove_free(piece);
                        tables.free_slots.push(owner_slot);
                    }
                    _ => {}
                }
            }
        }
    }
}

impl Rotation {
    /// Slots the rotation reads or writes, ascending.
    pub(crate) fn touched(self) -> Vec<u32> {
        let mut slots = match self {
            Rotation::None => Vec::new(),
            Rotation::Move { from, to } => vec![from, to],
            Rotation::Swap(a, b) => vec![a, b],
            Rotation::Swap3(a, b, c) => vec![a, b, c],
            Rotation::MoveTwice { first, second } => vec![first.0, first.1, second.0, second.1],
        };
        slots.sort_unstable();
        slots.dedup();
        slots
    }

    pub(crate) async fn apply<S>(self, storage: &S) -> Result<(), StorageError>
    where
        S: StorageInterface + ?Sized,
    {
        match self {
            Rotation::None => Ok(()),
            Rotation::Move { from, to } => storage.move_slot(from, to).await,
            Rotation::Swap(a, b) => storage.swap_slots(a, b).await,
            Rotation::Swap3(a, b, c) => storage.swap_slots3(a, b, c).await,
            Rotation::MoveTwice { first, second } => {
                storage.move_slot(first.0, first.1).await?;
                storage.move_slot(second.0, second.1).await
            }
        }
    }
}
