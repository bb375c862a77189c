//! Block scan and write-cursor recovery tests.

#[cfg(test)]
mod tests {
    use crate::format::{
        BLOCK_HEADER_SIZE, BLOCK_SIZE, BlockFlags, BlockHeader, HeaderBlock, RECORD_OVERHEAD,
    };
    use crate::record::tests::helpers::*;
    use crate::record::{scan_block, write_cursor_for};
    use crate::store::StorageError;

    /// # Scenario
    /// Scanning a block holding three records.
    ///
    /// # Expected behavior
    /// Heads come back in physical order with their offsets; a clone taken
    /// mid-scan continues from the same point and a new scan starts over.
    #[test]
    fn scan_yields_heads_in_physical_order() {
        let mut fx = Fixture::new(3);
        fx.append(b"c", b"3", 1).unwrap();
        fx.append(b"a", b"11", 2).unwrap();
        fx.append(b"b", b"", 3).unwrap();

        let mut scan = scan_block(&fx.store, 1).unwrap();
        let first = scan.next().unwrap().unwrap();
        assert_eq!(first.key, b"c");
        assert_eq!(first.offset, BLOCK_HEADER_SIZE);

        let rest: Vec<_> = scan.clone().map(|h| h.unwrap()).collect();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].key, b"a");
        assert_eq!(rest[0].offset, BLOCK_HEADER_SIZE + RECORD_OVERHEAD + 2);
        assert_eq!(rest[0].value_len, 2);
        assert_eq!(rest[1].key, b"b");
        assert_eq!(rest[1].created, 3);

        assert_eq!(scan.count(), 2);
        assert_eq!(scan_block(&fx.store, 1).unwrap().count(), 3);
    }

    #[test]
    fn overflow_and_free_blocks_yield_nothing() {
        let mut fx = Fixture::new(4);
        fx.append(b"big", &pattern(BLOCK_SIZE), 1).unwrap();
        assert_eq!(scan_block(&fx.store, 2).unwrap().count(), 0);

        fx.store.allocate_raw_block(3).unwrap();
        fx.store
            .write_block_header(&BlockHeader {
                id: 3,
                next_block: 0,
                flags: BlockFlags::FREE,
                num_records: 7,
            })
            .unwrap();
        assert_eq!(scan_block(&fx.store, 3).unwrap().count(), 0);
    }

    /// # Scenario
    /// `num_records` claims more records than the block holds.
    ///
    /// # Expected behavior
    /// The valid heads are yielded, then a single `Corruption`, then the
    /// scan ends.
    #[test]
    fn overstated_record_count_ends_with_corruption() {
        let mut fx = Fixture::new(3);
        fx.append(b"a", b"1", 1).unwrap();
        let mut header = fx.store.read_block_header(1).unwrap();
        header.num_records = 5;
        fx.store.write_block_header(&header).unwrap();

        let items: Vec<_> = scan_block(&fx.store, 1).unwrap().collect();
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(
            items[1],
            Err(StorageError::Corruption { block: 1, .. })
        ));
    }

    #[test]
    fn cursor_of_fresh_file_is_sealed() {
        let fx = Fixture::new(3);
        let cursor = write_cursor_for(&fx.store, &HeaderBlock::initial()).unwrap();
        assert!(cursor.sealed);
        assert_eq!(cursor.block, 1);
    }

    /// # Scenario
    /// The writer restarts after appending records.
    ///
    /// # Expected behavior
    /// The recomputed cursor equals the one the writer held.
    #[test]
    fn cursor_is_recomputed_from_block_contents() {
        let mut fx = Fixture::new(3);
        fx.append(b"a", b"1", 1).unwrap();
        fx.append(b"b", &pattern(500), 2).unwrap();

        let recomputed = write_cursor_for(&fx.store, &fx.header).unwrap();
        assert_eq!(recomputed, fx.cursor);
    }

    #[test]
    fn cursor_on_overflow_tail_is_sealed() {
        let mut fx = Fixture::new(4);
        fx.append(b"big", &pattern(BLOCK_SIZE), 1).unwrap();

        let recomputed = write_cursor_for(&fx.store, &fx.header).unwrap();
        assert_eq!(recomputed.block, 2);
        assert!(recomputed.sealed);
    }

    #[test]
    fn cursor_on_free_block_is_corruption() {
        let mut fx = Fixture::new(3);
        fx.append(b"a", b"1", 1).unwrap();
        fx.store
            .write_block_header(&BlockHeader {
                id: 1,
                next_block: 0,
                flags: BlockFlags::FREE,
                num_records: 0,
            })
            .unwrap();

        assert!(matches!(
            write_cursor_for(&fx.store, &fx.header),
            Err(StorageError::Corruption { block: 1, .. })
        ));
    }
}
