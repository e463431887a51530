use super::memory::{MemoryStorage, Op};
use super::*;
use crate::file_storage::FileStorage;
use crate::resume::FileStamp;
use proptest::prelude::*;

const PIECE: u32 = 16;

/// Distinct content for every piece: first bytes differ for any two
/// pieces below 256.
fn piece_data(piece: u32, size: u32) -> Vec<u8> {
    (0..size as usize)
        .map(|i| (piece as usize * 7 + i * 13 + 1) as u8)
        .collect()
}

struct Torrent {
    files: FileStorage,
    hashes: Vec<[u8; 20]>,
    /// `(original, copy)`: piece `copy` carries the same bytes as `original`.
    twin: Option<(u32, u32)>,
}

impl Torrent {
    fn new(sizes: &[u64]) -> Self {
        let mut files = FileStorage::new(PIECE);
        for (i, size) in sizes.iter().enumerate() {
            files.add_file(format!("t/f{}", i), *size);
        }
        let mut torrent = Self {
            files,
            hashes: Vec::new(),
            twin: None,
        };
        torrent.rehash();
        torrent
    }

    fn with_twin(mut self, original: u32, copy: u32) -> Self {
        self.twin = Some((original, copy));
        self.rehash();
        self
    }

    fn rehash(&mut self) {
        self.hashes = (0..self.files.num_pieces())
            .map(|p| Sha1::digest(self.data(p)).into())
            .collect();
    }

    fn data(&self, piece: u32) -> Vec<u8> {
        let source = match self.twin {
            Some((original, copy)) if piece == copy => original,
            _ => piece,
        };
        piece_data(source, self.files.piece_size(piece))
    }

    fn storage(&self) -> MemoryStorage {
        MemoryStorage::new(self.files.clone())
    }

    /// Storage where slot `i` holds the data of `layout[i]`.
    fn laid_out(&self, layout: &[Option<u32>]) -> MemoryStorage {
        let storage = self.storage();
        for (slot, piece) in layout.iter().enumerate() {
            if let Some(piece) = piece {
                storage.put(slot as u32, &self.data(*piece));
            }
        }
        storage
    }

    fn in_order(&self) -> MemoryStorage {
        let layout: Vec<_> = (0..self.files.num_pieces()).map(Some).collect();
        self.laid_out(&layout)
    }

    fn manager(&self, storage: MemoryStorage, mode: StorageMode) -> PieceManager<MemoryStorage> {
        PieceManager::new(storage, self.hashes.clone(), mode).unwrap()
    }

    fn resume(&self, slot_map: Vec<SlotEntry>, mode: StorageMode) -> ResumeData {
        ResumeData {
            piece_length: PIECE,
            file_sizes: self
                .files
                .files()
                .iter()
                .map(|f| FileStamp { size: f.size, mtime: 0 })
                .collect(),
            slot_map,
            storage_mode: mode,
            unfinished_pieces: Vec::new(),
            mapped_files: Vec::new(),
        }
    }
}

async fn run_check(pm: &mut PieceManager<MemoryStorage>) -> usize {
    for calls in 1..10_000 {
        let step = pm.check_files().await.unwrap();
        assert!((0.0..=1.0).contains(&step.progress));
        if step.done {
            return calls;
        }
    }
    panic!("check never finished");
}

fn moves(ops: &[Op]) -> Vec<Op> {
    ops.iter()
        .copied()
        .filter(|op| {
            matches!(
                op,
                Op::Move(..) | Op::Swap(..) | Op::Swap3(..) | Op::Write(_)
            )
        })
        .collect()
}

#[tokio::test]
async fn test_fresh_compact_torrent_on_empty_disk() {
    let t = Torrent::new(&[5 * PIECE as u64]);
    let mut pm = t.manager(t.storage(), StorageMode::Compact);

    let empty = t.resume(Vec::new(), StorageMode::Compact);
    let outcome = pm.check_fastresume(Some(&empty)).await.unwrap();
    assert_eq!(outcome, ScanOutcome::NeedFullCheck);
    assert_eq!(pm.state(), CheckState::FullCheck);

    let calls = run_check(&mut pm).await;
    assert!(calls <= 5);
    assert_eq!(pm.have_pieces().count(), 0);
    assert_eq!(pm.state(), CheckState::Finished);
    assert!(pm.storage().ops().contains(&Op::Initialize));

    let tables = pm.tables().unwrap();
    assert_eq!(tables.unallocated_slots, (0..5).collect::<Vec<_>>());
    assert!(tables.free_slots.is_empty());
    assert!(tables.check_invariant());
}

#[tokio::test]
async fn test_complete_data_in_order_compact() {
    let t = Torrent::new(&[40, 30]);
    let mut pm = t.manager(t.in_order(), StorageMode::Compact);

    pm.check_fastresume(None).await.unwrap();
    let calls = run_check(&mut pm).await;

    assert_eq!(calls, 5);
    assert!(moves(&pm.storage().ops()).is_empty());
    assert!(!pm.out_of_place());
    assert!(pm.have_pieces().is_complete());
    assert_eq!(pm.state(), CheckState::Finished);
    // every slot allocated and in place
    assert_eq!(pm.storage_mode(), StorageMode::Sparse);
    assert!(pm.tables().is_none());
}

#[tokio::test]
async fn test_swapped_pieces_sparse() {
    let t = Torrent::new(&[8 * PIECE as u64]);
    let mut layout: Vec<_> = (0..8).map(Some).collect();
    layout.swap(2, 5);
    let mut pm = t.manager(t.laid_out(&layout), StorageMode::Sparse);

    assert_eq!(pm.check_fastresume(None).await.unwrap(), ScanOutcome::NeedFullCheck);
    run_check(&mut pm).await;

    let ops = moves(&pm.storage().ops());
    assert_eq!(ops.len(), 1);
    assert!(matches!(ops[0], Op::Swap(2, 5) | Op::Swap(5, 2)));

    assert!(pm.out_of_place());
    assert!(pm.have_pieces().is_complete());
    assert_eq!(pm.storage().get(2), Some(t.data(2)));
    assert_eq!(pm.storage().get(5), Some(t.data(5)));
    assert!(pm.tables().is_none());
    assert_eq!(pm.state(), CheckState::Finished);
}

#[tokio::test]
async fn test_resume_with_free_and_unallocated_slots() {
    let t = Torrent::new(&[20 * PIECE as u64]);
    let mut pm = t.manager(t.storage(), StorageMode::Compact);

    let rd = t.resume(vec![SlotEntry::Unassigned; 10], StorageMode::Compact);
    assert_eq!(pm.check_fastresume(Some(&rd)).await.unwrap(), ScanOutcome::NoError);
    assert_eq!(pm.state(), CheckState::CreateFiles);
    assert_eq!(pm.storage_mode(), StorageMode::Compact);

    let tables = pm.tables().unwrap();
    assert_eq!(tables.free_slots, (0..10).collect::<Vec<_>>());
    assert_eq!(tables.unallocated_slots, (10..20).collect::<Vec<_>>());
    assert!(tables.check_invariant());

    // home slot preferred, otherwise the most recently freed one
    assert_eq!(pm.allocate_slot_for_piece(3).await.unwrap(), 3);
    assert_eq!(pm.allocate_slot_for_piece(15).await.unwrap(), 9);
    assert_eq!(pm.allocate_slot_for_piece(15).await.unwrap(), 9);

    assert!(pm.check_files().await.unwrap().done);
    assert_eq!(pm.storage().reads(), 0);
}

#[tokio::test]
async fn test_unreadable_file_is_skipped() {
    let t = Torrent::new(&[100 * PIECE as u64, 5 * PIECE as u64, 10 * PIECE as u64]);
    let storage = t.in_order();
    for slot in 100..105 {
        storage.fail_reads(slot);
    }
    let mut pm = t.manager(storage, StorageMode::Compact);

    pm.check_fastresume(None).await.unwrap();
    let calls = run_check(&mut pm).await;

    // one call covers the whole unreadable file
    assert_eq!(calls, 100 + 1 + 10);
    assert_eq!(pm.have_pieces().count(), 110);
    assert!((100..105).all(|p| !pm.has_piece(p)));

    let tables = pm.tables().unwrap();
    assert_eq!(tables.unallocated_slots, (100..105).collect::<Vec<_>>());
    assert!((100..105).all(|s| tables.map.entry(s) == SlotEntry::Unallocated));
    assert!(tables.check_invariant());
}

#[tokio::test]
async fn test_full_check_skips_sparse_hole() {
    let t = Torrent::new(&[6 * PIECE as u64]);
    let storage = t.laid_out(&[None, None, None, None, None, Some(5)]);
    storage.put(0, &[0xFF; PIECE as usize]);
    for slot in 1..5 {
        storage.punch_hole(slot);
    }
    let mut pm = t.manager(storage, StorageMode::Compact);
    pm.check_fastresume(None).await.unwrap();
    run_check(&mut pm).await;

    // only the garbage slot and the slot past the hole are read
    assert_eq!(pm.storage().reads(), 2);
    assert!(pm.has_piece(5));
    assert_eq!(pm.have_pieces().count(), 1);
    assert_eq!(
        pm.export_piece_map(),
        vec![
            SlotEntry::Unassigned,
            SlotEntry::Unallocated,
            SlotEntry::Unallocated,
            SlotEntry::Unallocated,
            SlotEntry::Unallocated,
            SlotEntry::Piece(5),
        ]
    );
    let tables = pm.tables().unwrap();
    assert!(tables.check_invariant());
    assert_eq!(tables.unallocated_slots, [1, 2, 3, 4]);
}

#[tokio::test]
async fn test_single_piece_of_exact_length() {
    let t = Torrent::new(&[PIECE as u64]);
    let mut pm = t.manager(t.in_order(), StorageMode::Sparse);

    pm.check_fastresume(None).await.unwrap();
    let step = pm.check_files().await.unwrap();
    assert!(step.done);
    assert_eq!(step.progress, 1.0);
    assert!(pm.has_piece(0));
}

#[tokio::test]
async fn test_one_byte_last_piece_found_in_full_slot() {
    let t = Torrent::new(&[2 * PIECE as u64 + 1]);
    assert_eq!(t.files.last_piece_size(), 1);
    let mut pm = t.manager(t.laid_out(&[Some(2), Some(1), None]), StorageMode::Compact);

    pm.check_fastresume(None).await.unwrap();
    assert_eq!(run_check(&mut pm).await, 3);

    assert!(pm.has_piece(1));
    assert!(pm.has_piece(2));
    assert!(!pm.has_piece(0));
    assert_eq!(pm.slot_for(2), Some(0));
    assert_eq!(pm.read(2, 0, 1).await.unwrap().as_ref(), &t.data(2)[..]);

    // allocating slot 2 pulls the last piece into it and frees slot 0
    assert_eq!(pm.allocate_slot_for_piece(0).await.unwrap(), 0);
    assert_eq!(pm.storage().get(2), Some(t.data(2)));
    assert_eq!(pm.storage_mode(), StorageMode::Sparse);
    assert!(pm.tables().is_none());
}

#[tokio::test]
async fn test_zero_pieces_finish_immediately() {
    let t = Torrent::new(&[]);
    let mut pm = t.manager(t.storage(), StorageMode::Compact);

    let step = pm.check_files().await.unwrap();
    assert!(step.done);
    assert_eq!(step.progress, 1.0);
    assert_eq!(pm.state(), CheckState::Finished);
}

#[tokio::test]
async fn test_finished_check_is_idempotent() {
    let t = Torrent::new(&[3 * PIECE as u64]);
    let mut pm = t.manager(t.in_order(), StorageMode::Sparse);
    pm.check_fastresume(None).await.unwrap();
    run_check(&mut pm).await;

    pm.storage().clear_ops();
    for _ in 0..3 {
        let step = pm.check_files().await.unwrap();
        assert_eq!(step, CheckStep::finished());
    }
    assert!(pm.storage().ops().is_empty());
}

#[tokio::test]
async fn test_abort_between_steps() {
    let t = Torrent::new(&[4 * PIECE as u64]);
    let mut pm = t.manager(t.in_order(), StorageMode::Compact);
    pm.check_fastresume(None).await.unwrap();

    pm.check_files().await.unwrap();
    pm.abort_handle().store(true, std::sync::atomic::Ordering::Release);
    assert!(matches!(
        pm.check_files().await,
        Err(StorageError::CheckAborted)
    ));
    assert_eq!(pm.state(), CheckState::FullCheck);
    assert!(pm.tables().unwrap().check_invariant());

    // a new check starts over
    pm.check_fastresume(None).await.unwrap();
    run_check(&mut pm).await;
    assert!(pm.have_pieces().is_complete());
}

#[tokio::test]
async fn test_resume_round_trip_reads_nothing() {
    let t = Torrent::new(&[4 * PIECE as u64 + 3]);
    let mut pm = t.manager(t.in_order(), StorageMode::Sparse);
    pm.check_fastresume(None).await.unwrap();
    run_check(&mut pm).await;
    let rd = pm.write_resume_data().await.unwrap();

    let mut resumed = t.manager(t.in_order(), StorageMode::Sparse);
    assert_eq!(resumed.check_fastresume(Some(&rd)).await.unwrap(), ScanOutcome::NoError);
    assert!(resumed.check_files().await.unwrap().done);

    assert_eq!(resumed.have_pieces(), pm.have_pieces());
    assert_eq!(resumed.storage().reads(), 0);
}

#[tokio::test]
async fn test_compact_round_trip_reproduces_tables() {
    let t = Torrent::new(&[6 * PIECE as u64]);
    let storage = t.laid_out(&[Some(3), Some(0), None, None, None, None]);
    storage.put(2, &[0xFF; PIECE as usize]);
    let mut pm = t.manager(storage, StorageMode::Compact);

    pm.check_fastresume(None).await.unwrap();
    run_check(&mut pm).await;
    assert_eq!(moves(&pm.storage().ops()), vec![Op::Swap(0, 1)]);
    assert_eq!(
        pm.export_piece_map(),
        vec![SlotEntry::Piece(0), SlotEntry::Piece(3), SlotEntry::Unassigned]
    );

    let rd = pm.write_resume_data().await.unwrap();
    let copy = t.storage();
    for slot in 0..6 {
        if let Some(data) = pm.storage().get(slot) {
            copy.put(slot, &data);
        }
    }
    let mut resumed = t.manager(copy, StorageMode::Compact);
    assert_eq!(resumed.check_fastresume(Some(&rd)).await.unwrap(), ScanOutcome::NoError);

    let (a, b) = (pm.tables().unwrap(), resumed.tables().unwrap());
    assert_eq!(a.map, b.map);
    assert_eq!(b.free_slots, vec![2]);
    assert_eq!(b.unallocated_slots, vec![3, 4, 5]);
    assert_eq!(resumed.have_pieces(), pm.have_pieces());
    assert_eq!(resumed.storage().reads(), 0);
    assert_eq!(resumed.read(3, 0, PIECE).await.unwrap().as_ref(), &t.data(3)[..]);
}

#[tokio::test]
async fn test_unfinished_pieces_are_not_had() {
    let t = Torrent::new(&[3 * PIECE as u64]);
    let mut rd = t.resume(
        vec![SlotEntry::Piece(0), SlotEntry::Piece(1), SlotEntry::Unassigned],
        StorageMode::Compact,
    );
    rd.unfinished_pieces = vec![1];

    let mut pm = t.manager(t.storage(), StorageMode::Compact);
    assert_eq!(pm.check_fastresume(Some(&rd)).await.unwrap(), ScanOutcome::NoError);
    assert!(pm.has_piece(0));
    assert!(!pm.has_piece(1));
    assert_eq!(pm.unfinished_pieces().collect::<Vec<_>>(), vec![1]);
    assert_eq!(pm.slot_for(1), Some(1));
}

#[tokio::test]
async fn test_rejected_resume_falls_back_to_full_check() {
    let t = Torrent::new(&[3 * PIECE as u64]);
    let rd = t.resume(vec![SlotEntry::Piece(0)], StorageMode::Sparse);

    let mut pm = t.manager(t.storage().rejecting_resume(), StorageMode::Sparse);
    assert_eq!(pm.check_fastresume(Some(&rd)).await.unwrap(), ScanOutcome::NeedFullCheck);
    assert_eq!(pm.state(), CheckState::FullCheck);

    let mut duplicate = t.resume(vec![SlotEntry::Piece(1), SlotEntry::Piece(1)], StorageMode::Compact);
    let mut pm = t.manager(t.storage(), StorageMode::Compact);
    assert_eq!(pm.check_fastresume(Some(&duplicate)).await.unwrap(), ScanOutcome::NeedFullCheck);

    duplicate.slot_map = vec![SlotEntry::Unassigned; 4];
    assert_eq!(pm.check_fastresume(Some(&duplicate)).await.unwrap(), ScanOutcome::NeedFullCheck);

    let mut wrong_length = t.resume(vec![SlotEntry::Piece(0)], StorageMode::Compact);
    wrong_length.piece_length = PIECE * 2;
    assert_eq!(pm.check_fastresume(Some(&wrong_length)).await.unwrap(), ScanOutcome::NeedFullCheck);
}

#[tokio::test]
async fn test_compact_resume_expanded_in_sparse_mode() {
    let t = Torrent::new(&[3 * PIECE as u64]);
    let rd = t.resume(
        vec![SlotEntry::Piece(1), SlotEntry::Piece(0), SlotEntry::Piece(2)],
        StorageMode::Compact,
    );
    let mut pm = t.manager(t.laid_out(&[Some(1), Some(0), Some(2)]), StorageMode::Sparse);

    assert_eq!(pm.check_fastresume(Some(&rd)).await.unwrap(), ScanOutcome::NeedFullCheck);
    assert_eq!(pm.state(), CheckState::ExpandPieces);
    assert_eq!(run_check(&mut pm).await, 3);

    assert_eq!(
        pm.storage().ops(),
        vec![Op::Read(1), Op::Move(0, 1), Op::Write(0), Op::Initialize]
    );
    for piece in 0..3 {
        assert_eq!(pm.storage().get(piece), Some(t.data(piece)));
    }
    assert!(pm.have_pieces().is_complete());
    assert!(pm.tables().is_none());
}

#[tokio::test]
async fn test_abort_during_expansion_keeps_held_piece() {
    let t = Torrent::new(&[3 * PIECE as u64]);
    let rd = t.resume(
        vec![SlotEntry::Piece(1), SlotEntry::Piece(2), SlotEntry::Piece(0)],
        StorageMode::Compact,
    );
    let mut pm = t.manager(t.laid_out(&[Some(1), Some(2), Some(0)]), StorageMode::Sparse);
    pm.check_fastresume(Some(&rd)).await.unwrap();
    assert_eq!(pm.state(), CheckState::ExpandPieces);

    // piece 1 goes home and piece 2 is held in memory
    pm.check_files().await.unwrap();
    pm.abort_handle().store(true, std::sync::atomic::Ordering::Release);
    assert!(matches!(
        pm.check_files().await,
        Err(StorageError::CheckAborted)
    ));

    assert!(pm.tables().unwrap().check_invariant());
    for piece in 0..3 {
        let slot = pm.slot_for(piece).unwrap();
        assert_eq!(pm.storage().get(slot), Some(t.data(piece)), "piece {}", piece);
    }

    pm.check_fastresume(None).await.unwrap();
    run_check(&mut pm).await;
    assert!(pm.have_pieces().is_complete());
    for piece in 0..3 {
        assert_eq!(pm.storage().get(piece), Some(t.data(piece)));
    }
}

#[tokio::test]
async fn test_failed_expansion_write_is_fatal() {
    let t = Torrent::new(&[3 * PIECE as u64]);
    let rd = t.resume(
        vec![SlotEntry::Piece(1), SlotEntry::Piece(0), SlotEntry::Piece(2)],
        StorageMode::Compact,
    );
    let storage = t.laid_out(&[Some(1), Some(0), Some(2)]);
    storage.fail_writes(1);
    let mut pm = t.manager(storage, StorageMode::Sparse);
    pm.check_fastresume(Some(&rd)).await.unwrap();

    assert!(matches!(
        pm.check_files().await,
        Err(StorageError::FatalDisk(_))
    ));
    assert_eq!(pm.state(), CheckState::ExpandPieces);
    assert_eq!(pm.slot_for(0), Some(1));
    assert_eq!(pm.slot_for(1), Some(0));
    assert_eq!(pm.storage().get(0), Some(t.data(1)));
    assert_eq!(pm.storage().get(1), Some(t.data(0)));
}

#[tokio::test]
async fn test_failed_write_of_held_piece_then_abort() {
    let t = Torrent::new(&[3 * PIECE as u64]);
    let rd = t.resume(
        vec![SlotEntry::Piece(1), SlotEntry::Piece(2), SlotEntry::Piece(0)],
        StorageMode::Compact,
    );
    let storage = t.laid_out(&[Some(1), Some(2), Some(0)]);
    storage.fail_writes(2);
    let mut pm = t.manager(storage, StorageMode::Sparse);
    pm.check_fastresume(Some(&rd)).await.unwrap();

    pm.check_files().await.unwrap();
    assert!(matches!(
        pm.check_files().await,
        Err(StorageError::FatalDisk(_))
    ));

    // the held piece survives the failed step and is parked on abort
    pm.abort_handle().store(true, std::sync::atomic::Ordering::Release);
    assert!(matches!(
        pm.check_files().await,
        Err(StorageError::CheckAborted)
    ));
    assert_eq!(pm.slot_for(2), Some(0));
    assert_eq!(pm.storage().get(0), Some(t.data(2)));
    assert_eq!(pm.storage().get(1), Some(t.data(1)));
    assert_eq!(pm.storage().get(2), Some(t.data(0)));
    assert!(pm.tables().unwrap().check_invariant());
}

#[tokio::test]
async fn test_failed_swap_forgets_touched_slots() {
    let t = Torrent::new(&[PIECE as u64, PIECE as u64, 2 * PIECE as u64]);
    let storage = t.laid_out(&[Some(1), Some(0)]);
    // the swap writes slot 0, then fails on slot 1
    storage.fail_writes(1);
    let mut pm = t.manager(storage, StorageMode::Compact);
    pm.check_fastresume(None).await.unwrap();
    run_check(&mut pm).await;

    assert!(pm.storage().ops().contains(&Op::Swap(1, 0)));
    assert_eq!(pm.storage().get(0), Some(t.data(0)));
    assert!(pm.have_pieces().is_empty());

    let tables = pm.tables().unwrap();
    assert!(tables.check_invariant());
    let mut free = tables.free_slots.clone();
    free.sort_unstable();
    assert_eq!(free, vec![0, 1]);
    assert_eq!(
        pm.export_piece_map(),
        vec![SlotEntry::Unassigned, SlotEntry::Unassigned]
    );
}

#[tokio::test]
async fn test_last_slot_kept_for_last_piece() {
    let t = Torrent::new(&[3 * PIECE as u64 + 8]);
    let mut pm = t.manager(t.laid_out(&[Some(0)]), StorageMode::Compact);
    let rd = t.resume(
        vec![
            SlotEntry::Piece(0),
            SlotEntry::Unassigned,
            SlotEntry::Unallocated,
            SlotEntry::Unassigned,
        ],
        StorageMode::Compact,
    );
    pm.check_fastresume(Some(&rd)).await.unwrap();

    assert_eq!(pm.allocate_slot_for_piece(2).await.unwrap(), 1);
    assert_eq!(pm.tables().unwrap().free_slots, vec![3]);
    assert_eq!(pm.allocate_slot_for_piece(3).await.unwrap(), 3);
}

#[tokio::test]
async fn test_last_slot_rule_allocates_another_slot() {
    let t = Torrent::new(&[3 * PIECE as u64 + 8]);
    let mut pm = t.manager(t.laid_out(&[Some(0), Some(1)]), StorageMode::Compact);
    let rd = t.resume(
        vec![
            SlotEntry::Piece(0),
            SlotEntry::Piece(1),
            SlotEntry::Unallocated,
            SlotEntry::Unassigned,
        ],
        StorageMode::Compact,
    );
    pm.check_fastresume(Some(&rd)).await.unwrap();

    assert_eq!(pm.allocate_slot_for_piece(2).await.unwrap(), 2);
    let tables = pm.tables().unwrap();
    assert_eq!(tables.free_slots, vec![3]);
    assert!(tables.unallocated_slots.is_empty());
    assert!(tables.check_invariant());
}

#[tokio::test]
async fn test_last_slot_rule_moves_last_piece_home() {
    let t = Torrent::new(&[3 * PIECE as u64 + 8]);
    let storage = t.laid_out(&[Some(3), Some(1), Some(0)]);
    let mut pm = t.manager(storage, StorageMode::Compact);
    let rd = t.resume(
        vec![
            SlotEntry::Piece(3),
            SlotEntry::Piece(1),
            SlotEntry::Piece(0),
            SlotEntry::Unassigned,
        ],
        StorageMode::Compact,
    );
    pm.check_fastresume(Some(&rd)).await.unwrap();

    assert_eq!(pm.allocate_slot_for_piece(2).await.unwrap(), 2);
    assert_eq!(pm.storage().ops(), vec![Op::Move(0, 3), Op::Move(2, 0)]);
    assert_eq!(pm.storage().get(3), Some(t.data(3)));
    assert_eq!(pm.storage().get(0), Some(t.data(0)));
    assert_eq!(pm.storage_mode(), StorageMode::Sparse);
}

#[tokio::test]
async fn test_write_hash_and_relocate_in_compact_mode() {
    let t = Torrent::new(&[4 * PIECE as u64]);
    let mut pm = t.manager(t.storage(), StorageMode::Compact);

    let data2 = t.data(2);
    pm.write(2, 0, &data2).await.unwrap();
    assert_eq!(pm.slot_for(2), Some(0));
    assert_eq!(pm.unfinished_pieces().collect::<Vec<_>>(), vec![2]);

    pm.storage().clear_ops();
    let digest = pm.hash_piece(2).await.unwrap();
    assert_eq!(digest, t.hashes[2]);
    // the whole piece was hashed while writing
    assert_eq!(pm.storage().reads(), 0);
    assert!(pm.has_piece(2));
    assert_eq!(pm.unfinished_pieces().count(), 0);

    // piece 0 claims its home slot, pushing piece 2 into a new one
    let data0 = t.data(0);
    pm.write(0, 0, &data0[..8]).await.unwrap();
    pm.write(0, 8, &data0[8..]).await.unwrap();
    assert_eq!(pm.slot_for(0), Some(0));
    assert_eq!(pm.slot_for(2), Some(1));
    assert_eq!(pm.read(2, 0, PIECE).await.unwrap().as_ref(), &data2[..]);
    assert_eq!(pm.hash_piece(0).await.unwrap(), t.hashes[0]);
    assert!(pm.tables().unwrap().check_invariant());
}

#[tokio::test]
async fn test_failed_piece_returns_slot() {
    let t = Torrent::new(&[4 * PIECE as u64]);
    let mut pm = t.manager(t.storage(), StorageMode::Compact);

    pm.write(1, 4, &[9u8; 4]).await.unwrap();
    let slot = pm.slot_for(1).unwrap();
    let digest = pm.hash_piece(1).await.unwrap();
    assert_ne!(digest, t.hashes[1]);
    assert!(!pm.has_piece(1));

    pm.mark_failed(1).unwrap();
    assert_eq!(pm.slot_for(1), None);
    assert_eq!(pm.piece_for(slot), SlotEntry::Unassigned);
    assert!(pm.tables().unwrap().free_slots.contains(&slot));
    assert!(matches!(
        pm.read(1, 0, 4).await,
        Err(StorageError::PieceNotStored(1))
    ));
}

#[tokio::test]
async fn test_out_of_range_requests() {
    let t = Torrent::new(&[2 * PIECE as u64]);
    let mut pm = t.manager(t.in_order(), StorageMode::Sparse);

    assert!(matches!(
        pm.read(2, 0, 1).await,
        Err(StorageError::OutOfRange { .. })
    ));
    assert!(matches!(
        pm.write(0, PIECE - 2, &[0; 4]).await,
        Err(StorageError::OutOfRange { .. })
    ));
    assert!(matches!(pm.mark_failed(7), Err(StorageError::OutOfRange { .. })));
    assert!(PieceManager::new(t.storage(), Vec::new(), StorageMode::Sparse).is_err());
}

#[tokio::test]
async fn test_sparse_export_lists_had_pieces() {
    let t = Torrent::new(&[3 * PIECE as u64]);
    let storage = t.laid_out(&[Some(0), None, Some(2)]);
    storage.put(1, &[0xFF; PIECE as usize]);
    let mut pm = t.manager(storage, StorageMode::Full);
    pm.check_fastresume(None).await.unwrap();
    run_check(&mut pm).await;

    assert_eq!(
        pm.export_piece_map(),
        vec![SlotEntry::Piece(0), SlotEntry::Unassigned, SlotEntry::Piece(2)]
    );
    assert_eq!(pm.piece_for(1), SlotEntry::Piece(1));
    assert_eq!(pm.slot_for(2), Some(2));
}

fn scan_layout(n: u32) -> impl Strategy<Value = (Vec<u32>, Vec<bool>)> {
    (
        Just((0..n).collect::<Vec<u32>>()).prop_shuffle(),
        proptest::collection::vec(any::<bool>(), n as usize),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_full_check_preserves_data(
        (order, garbage) in scan_layout(7),
        compact in any::<bool>(),
    ) {
        // short last piece, and pieces 1 and 4 share a hash
        let t = Torrent::new(&[7 * PIECE as u64 - 5]).with_twin(1, 4);
        let storage = t.storage();
        let mut present = Vec::new();
        for (slot, piece) in order.iter().enumerate() {
            let slot = slot as u32;
            let data = t.data(*piece);
            if garbage[slot as usize] {
                storage.put(slot, &[0xFF; PIECE as usize]);
            } else {
                storage.put(slot, &data);
                // a full piece cut short by the last slot is lost
                if data.len() <= t.files.piece_size(slot) as usize {
                    present.push(*piece);
                }
            }
        }
        let mode = if compact { StorageMode::Compact } else { StorageMode::Sparse };
        let mut pm = t.manager(storage, mode);

        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            pm.check_fastresume(None).await.unwrap();
            loop {
                let step = pm.check_files().await.unwrap();
                if let Some(tables) = pm.tables() {
                    assert!(tables.check_invariant());
                }
                if step.done {
                    break;
                }
            }
        });

        // with twins either index may claim the bytes, so check by content
        let have = pm.have_pieces();
        prop_assert_eq!(have.count(), present.len());
        for piece in (0..7).filter(|&p| have.has_piece(p as usize)) {
            let expected = t.data(piece);
            let slot = pm.slot_for(piece).unwrap();
            let stored = pm.storage().get(slot).unwrap();
            prop_assert_eq!(&stored[..expected.len()], &expected[..]);
        }
        if !compact {
            prop_assert!(pm.tables().is_none());
        }
    }
}
