//! Reopen and recovery tests: header initialization, header validation,
//! persistence across handles, damaged blocks, retired blocks left behind,
//! writes cut off before their header was published.

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use crate::engine::tests::helpers::*;
    use crate::engine::{Engine, EngineError};
    use crate::format::{BLOCK_SIZE, HeaderBlock, HeaderRegion};
    use crate::freelist::BlockAllocator;
    use crate::mvcc::{CommitContext, commit_insert, plan_retirement};
    use crate::store::{BlockStore, StorageError};

    fn scan_keys(engine: &Engine) -> Vec<Vec<u8>> {
        let snapshot = engine.begin_snapshot().unwrap();
        engine
            .scan(&snapshot)
            .unwrap()
            .map(|kv| kv.unwrap().0)
            .collect()
    }

    /// # Scenario
    /// Opening a zero-filled file.
    ///
    /// # Starting environment
    /// A 3-block file of zeros created outside the engine.
    ///
    /// # Actions
    /// Open the engine.
    ///
    /// # Expected behavior
    /// The header becomes `{last_tx: 0, free_block: 0, current_data_block: 1,
    /// last_block: 0}` and is persisted.
    #[test]
    fn zero_filled_file_gets_initial_header() {
        let tmp = TempDir::new().unwrap();
        let path = db_path(&tmp);
        fs::write(&path, vec![0u8; 3 * BLOCK_SIZE]).unwrap();

        let engine = Engine::open(&path, fixed_config()).unwrap();
        let stats = engine.stats().unwrap();
        assert_eq!(stats.last_tx, 0);
        assert_eq!(stats.current_data_block, 1);
        assert_eq!(stats.last_block, 0);
        assert_eq!(stats.free_blocks, 0);
        assert_eq!(stats.block_count, 3);
        drop(engine);

        let store = BlockStore::open(&path).unwrap();
        let region = store.read_header().unwrap().expect("header written");
        assert_eq!(region.header, HeaderBlock::initial());
        assert_eq!(region.list_head, None);
    }

    /// # Scenario
    /// State survives closing and reopening.
    ///
    /// # Actions
    /// 1. Put `a`, put `b`, delete `a`; close.
    /// 2. Reopen; read both keys; put `c`.
    ///
    /// # Expected behavior
    /// `a` is gone, `b` is intact, and the next transaction id is 4.
    #[test]
    fn reopen_preserves_data_and_tx_ids() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = fresh_engine(&tmp, 4, test_config());
            engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
            engine.put(b"b".to_vec(), vec![2; BLOCK_SIZE + 10]).unwrap();
            engine.delete(b"a".to_vec()).unwrap();
            engine.close().unwrap();
        }

        let engine = Engine::open(db_path(&tmp), test_config()).unwrap();
        assert_eq!(get_latest(&engine, b"a"), None);
        assert_eq!(get_latest(&engine, b"b"), Some(vec![2; BLOCK_SIZE + 10]));
        assert_eq!(engine.put(b"c".to_vec(), b"3".to_vec()).unwrap(), 4);
        assert_eq!(get_latest(&engine, b"c"), Some(b"3".to_vec()));
    }

    #[test]
    fn damaged_header_checksum_is_invalid_file() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = fresh_engine(&tmp, 3, fixed_config());
            engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        }
        // Flip a byte of last_tx without fixing the checksum.
        poke(&db_path(&tmp), 0, &[0x7f]);

        let err = Engine::open(db_path(&tmp), fixed_config()).unwrap_err();
        assert!(
            matches!(err, EngineError::Storage(StorageError::InvalidFile(_))),
            "unexpected error: {err:?}"
        );
    }

    /// # Scenario
    /// A header with a valid checksum but impossible fields.
    ///
    /// # Starting environment
    /// 3-block file whose header claims `last_block = 9`.
    ///
    /// # Expected behavior
    /// Open fails with `InvalidFile`.
    #[test]
    fn inconsistent_header_is_invalid_file() {
        let tmp = TempDir::new().unwrap();
        let path = db_path(&tmp);
        {
            let store = BlockStore::create(&path, 3).unwrap();
            let region = HeaderRegion {
                header: HeaderBlock {
                    last_tx: 5,
                    free_block: 0,
                    current_data_block: 1,
                    last_block: 9,
                },
                list_head: None,
            };
            store.write_header(&region, true).unwrap();
        }

        let err = Engine::open(&path, fixed_config()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Storage(StorageError::InvalidFile(_))
        ));
    }

    #[test]
    fn truncated_file_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = db_path(&tmp);
        fs::write(&path, vec![0u8; BLOCK_SIZE + 100]).unwrap();
        let err = Engine::open(&path, fixed_config()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Storage(StorageError::InvalidFile(_))
        ));
    }

    /// # Scenario
    /// An overflow block's id field is damaged while the file is closed.
    ///
    /// # Starting environment
    /// `a` spans blocks 1 and 2; `b` lives in block 3.
    ///
    /// # Actions
    /// Overwrite block 2's id with 77, reopen, read both keys.
    ///
    /// # Expected behavior
    /// Reading `a` reports `Corruption`; `b` still reads correctly.
    #[test]
    fn damaged_overflow_block_only_affects_its_record() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = fresh_engine(&tmp, 4, fixed_config());
            engine.put(b"a".to_vec(), vec![1; BLOCK_SIZE]).unwrap();
            engine.put(b"b".to_vec(), b"2".to_vec()).unwrap();
            assert_eq!(engine.stats().unwrap().last_block, 3);
        }
        poke(&db_path(&tmp), 2 * BLOCK_SIZE as u64, &77u32.to_le_bytes());

        let engine = Engine::open(db_path(&tmp), fixed_config()).unwrap();
        let snapshot = engine.begin_snapshot().unwrap();
        let err = engine.get(b"a", &snapshot).unwrap_err();
        assert!(
            matches!(err, EngineError::Storage(StorageError::Corruption { .. })),
            "unexpected error: {err:?}"
        );
        assert_eq!(engine.get(b"b", &snapshot).unwrap(), Some(b"2".to_vec()));
    }

    /// # Scenario
    /// The process stops while retired blocks are still waiting for a
    /// snapshot.
    ///
    /// # Starting environment
    /// `a` (blocks 1-2) deleted and retired while a snapshot was held.
    ///
    /// # Actions
    /// Drop everything, reopen.
    ///
    /// # Expected behavior
    /// Both blocks are on the free list after open; `b` is intact.
    #[test]
    fn retired_blocks_are_released_on_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = fresh_engine(&tmp, 4, fixed_config());
            engine.put(b"a".to_vec(), vec![1; BLOCK_SIZE]).unwrap();
            engine.put(b"b".to_vec(), b"2".to_vec()).unwrap();
            engine.delete(b"a".to_vec()).unwrap();
            let _held = engine.begin_snapshot().unwrap();

            let reclaimed = engine.reclaim().unwrap();
            assert_eq!(reclaimed.retired_blocks, 1);
            assert_eq!(reclaimed.released_blocks, 0);
            assert_eq!(engine.stats().unwrap().free_blocks, 0);
        }

        let engine = Engine::open(db_path(&tmp), fixed_config()).unwrap();
        let stats = engine.stats().unwrap();
        assert_eq!(stats.free_blocks, 2);
        assert_eq!(stats.pending_release, 0);
        assert_eq!(get_latest(&engine, b"b"), Some(b"2".to_vec()));
    }

    /// # Scenario
    /// The process stops after a put appended and linked its record but
    /// before the header naming its transaction was written.
    ///
    /// # Starting environment
    /// `a` committed as tx 1; `b` appended and linked as tx 2 directly
    /// through the store, header left at tx 1.
    ///
    /// # Actions
    /// Reopen, read `b`, put `c`, scan.
    ///
    /// # Expected behavior
    /// The reopened engine matches the published header: `b` never
    /// appears, `c` reuses tx 2, and the scan yields `a` then `c`.
    #[test]
    fn crash_after_append_rolls_back_to_published_header() {
        let tmp = TempDir::new().unwrap();
        let path = db_path(&tmp);
        {
            let engine = fresh_engine(&tmp, 4, fixed_config());
            engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
            engine.close().unwrap();
        }
        {
            let store = BlockStore::open(&path).unwrap();
            let mut region = store.read_header().unwrap().unwrap();
            let mut cursor = None;
            let allocator = BlockAllocator::fixed();
            let mut ctx = CommitContext {
                store: &store,
                allocator: &allocator,
                region: &mut region,
                cursor: &mut cursor,
            };
            commit_insert(&mut ctx, b"b", b"2", 2).unwrap();
            store.close().unwrap();
        }

        let engine = Engine::open(&path, fixed_config()).unwrap();
        assert_eq!(engine.stats().unwrap().last_tx, 1);
        assert_eq!(get_latest(&engine, b"b"), None);
        assert_eq!(scan_keys(&engine), vec![b"a".to_vec()]);

        assert_eq!(engine.put(b"c".to_vec(), b"3".to_vec()).unwrap(), 2);
        assert_eq!(get_latest(&engine, b"b"), None);
        assert_eq!(get_latest(&engine, b"c"), Some(b"3".to_vec()));
        assert_eq!(scan_keys(&engine), vec![b"a".to_vec(), b"c".to_vec()]);
        assert_eq!(engine.stats().unwrap().records, 2);
    }

    /// # Scenario
    /// The process stops after a reclamation published its new list head
    /// and before it rewrote any link or flag.
    ///
    /// # Starting environment
    /// Block 1 holds `a` and the head of `z`, whose value overflows into
    /// block 2; `m` lives in block 3. `a` and `z` are deleted. The
    /// retirement of block 1 is planned and only its header is written.
    ///
    /// # Actions
    /// Reopen, read, then reclaim.
    ///
    /// # Expected behavior
    /// No block is freed at open because none is flagged `RETIRED`; `m` is
    /// the only key. The next reclamation retires block 1 and releases it
    /// together with its overflow block.
    #[test]
    fn crash_after_retirement_publish_keeps_blocks_until_reclaimed() {
        let tmp = TempDir::new().unwrap();
        let path = db_path(&tmp);
        {
            let engine = fresh_engine(&tmp, 6, fixed_config());
            engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
            engine.put(b"z".to_vec(), vec![9; BLOCK_SIZE]).unwrap();
            engine.put(b"m".to_vec(), b"3".to_vec()).unwrap();
            engine.delete(b"a".to_vec()).unwrap();
            engine.delete(b"z".to_vec()).unwrap();
            let stats = engine.stats().unwrap();
            assert_eq!((stats.last_tx, stats.current_data_block, stats.last_block), (5, 3, 3));
            engine.close().unwrap();
        }
        {
            let store = BlockStore::open(&path).unwrap();
            let mut region = store.read_header().unwrap().unwrap();
            let plan = plan_retirement(&store, &region, 5).unwrap();
            assert_eq!(plan.blocks, vec![1]);
            region.list_head = plan.new_head;
            region.header.last_tx = 6;
            store.write_header(&region, true).unwrap();
            store.close().unwrap();
        }

        let engine = Engine::open(&path, fixed_config()).unwrap();
        let stats = engine.stats().unwrap();
        assert_eq!(stats.last_tx, 6);
        assert_eq!(stats.free_blocks, 0);
        assert_eq!(get_latest(&engine, b"m"), Some(b"3".to_vec()));
        assert_eq!(get_latest(&engine, b"z"), None);
        assert_eq!(scan_keys(&engine), vec![b"m".to_vec()]);

        let reclaimed = engine.reclaim().unwrap();
        assert_eq!(reclaimed.retired_blocks, 1);
        assert_eq!(reclaimed.released_blocks, 2);
        assert_eq!(engine.stats().unwrap().free_blocks, 2);
        assert_eq!(scan_keys(&engine), vec![b"m".to_vec()]);
        assert_eq!(engine.put(b"n".to_vec(), b"4".to_vec()).unwrap(), 8);
    }

    /// # Scenario
    /// A reclamation was planned but the process stopped before its header
    /// was published.
    ///
    /// # Expected behavior
    /// Reopening sees exactly the state before the plan: every block is in
    /// use and all records are still linked.
    #[test]
    fn unpublished_retirement_leaves_no_trace() {
        let tmp = TempDir::new().unwrap();
        let path = db_path(&tmp);
        let before = {
            let engine = fresh_engine(&tmp, 6, fixed_config());
            engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
            engine.put(b"z".to_vec(), vec![9; BLOCK_SIZE]).unwrap();
            engine.put(b"m".to_vec(), b"3".to_vec()).unwrap();
            engine.delete(b"a".to_vec()).unwrap();
            engine.delete(b"z".to_vec()).unwrap();
            let stats = engine.stats().unwrap();
            engine.close().unwrap();
            stats
        };
        {
            let store = BlockStore::open(&path).unwrap();
            let region = store.read_header().unwrap().unwrap();
            assert!(!plan_retirement(&store, &region, 5).unwrap().is_empty());
            store.close().unwrap();
        }

        let engine = Engine::open(&path, fixed_config()).unwrap();
        assert_eq!(engine.stats().unwrap(), before);
        assert_eq!(scan_keys(&engine), vec![b"m".to_vec()]);
    }

    /// # Scenario
    /// The block holding the list head is damaged while the file is closed.
    ///
    /// # Expected behavior
    /// Open succeeds, and `stats` reports the corruption instead of a
    /// partial count.
    #[test]
    fn stats_fail_on_damaged_list_block() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = fresh_engine(&tmp, 4, fixed_config());
            engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
            engine.put(b"b".to_vec(), b"2".to_vec()).unwrap();
            engine.close().unwrap();
        }
        poke(&db_path(&tmp), BLOCK_SIZE as u64, &77u32.to_le_bytes());

        let engine = Engine::open(db_path(&tmp), fixed_config()).unwrap();
        let err = engine.stats().unwrap_err();
        assert!(
            matches!(err, EngineError::Storage(StorageError::Corruption { .. })),
            "unexpected error: {err:?}"
        );
    }
}
