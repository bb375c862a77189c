//! Allocation tests: high-water bump, growth policy, exhaustion.
//!
//! ## See also
//! - [`tests_release`]: free-list push/pop and chain release

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::format::{BlockFlags, BlockHeader, HeaderBlock};
    use crate::freelist::BlockAllocator;
    use crate::store::StorageError;
    use crate::store::tests::helpers::*;

    /// # Scenario
    /// Allocating from a fresh header on a 3-block file that may not grow.
    ///
    /// # Actions
    /// 1. Allocate twice.
    /// 2. Allocate a third time.
    ///
    /// # Expected behavior
    /// Ids 1 and 2 are handed out with `last_block` following them; the third
    /// call fails with `AllocationExhausted` and leaves the header unchanged.
    #[test]
    fn high_water_then_exhausted() {
        let tmp = TempDir::new().unwrap();
        let store = fresh_store(&tmp, 3);
        let alloc = BlockAllocator::fixed();
        let mut header = HeaderBlock::initial();

        assert_eq!(alloc.allocate(&store, &mut header).unwrap(), 1);
        assert_eq!(header.last_block, 1);
        assert_eq!(alloc.allocate(&store, &mut header).unwrap(), 2);
        assert_eq!(header.last_block, 2);

        let before = header;
        let err = alloc.allocate(&store, &mut header).unwrap_err();
        assert!(
            matches!(
                err,
                StorageError::AllocationExhausted {
                    last_block: 2,
                    capacity: 3
                }
            ),
            "got: {err:?}"
        );
        assert_eq!(header, before);
    }

    #[test]
    fn high_water_blocks_are_initialized() {
        let tmp = TempDir::new().unwrap();
        let store = fresh_store(&tmp, 3);
        let mut header = HeaderBlock::initial();

        let id = BlockAllocator::fixed()
            .allocate(&store, &mut header)
            .unwrap();
        assert_eq!(store.read_block(id).unwrap().header, BlockHeader::empty(id));
    }

    /// # Scenario
    /// The high-water mark reaches the end of the file with growth enabled.
    ///
    /// # Expected behavior
    /// The file grows by the configured step and allocation continues.
    #[test]
    fn growth_extends_file() {
        let tmp = TempDir::new().unwrap();
        let store = fresh_store(&tmp, 2);
        let alloc = BlockAllocator::new(4, 1024);
        let mut header = HeaderBlock::initial();

        assert_eq!(alloc.allocate(&store, &mut header).unwrap(), 1);
        assert_eq!(store.block_count().unwrap(), 2);
        assert_eq!(alloc.allocate(&store, &mut header).unwrap(), 2);
        assert_eq!(store.block_count().unwrap(), 6);
        assert!(store.read_block(2).is_ok());
    }

    /// # Scenario
    /// Growth is enabled but capped by `max_blocks`.
    ///
    /// # Expected behavior
    /// The file grows only up to the cap; allocation past it fails.
    #[test]
    fn growth_respects_max_blocks() {
        let tmp = TempDir::new().unwrap();
        let store = fresh_store(&tmp, 2);
        let alloc = BlockAllocator::new(16, 4);
        let mut header = HeaderBlock::initial();

        for expected in 1..=3 {
            assert_eq!(alloc.allocate(&store, &mut header).unwrap(), expected);
        }
        assert_eq!(store.block_count().unwrap(), 4);
        assert!(matches!(
            alloc.allocate(&store, &mut header),
            Err(StorageError::AllocationExhausted { capacity: 4, .. })
        ));
    }

    /// # Scenario
    /// The free-list head points at a block that is not marked free.
    ///
    /// # Expected behavior
    /// `Corruption` naming that block; the header is not modified.
    #[test]
    fn free_head_without_free_flag_is_corruption() {
        let tmp = TempDir::new().unwrap();
        let store = fresh_store(&tmp, 3);
        store.allocate_raw_block(1).unwrap();
        store
            .write_block_header(&BlockHeader {
                id: 1,
                next_block: 0,
                flags: BlockFlags::DATA,
                num_records: 0,
            })
            .unwrap();

        let mut header = HeaderBlock {
            last_tx: 0,
            free_block: 1,
            current_data_block: 1,
            last_block: 1,
        };
        let err = BlockAllocator::fixed()
            .allocate(&store, &mut header)
            .unwrap_err();
        assert!(matches!(err, StorageError::Corruption { block: 1, .. }));
        assert_eq!(header.free_block, 1);
    }
}
