use tempfile::TempDir;

use crate::format::{HeaderBlock, Record, RecordLocator, TxId};
use crate::freelist::BlockAllocator;
use crate::record::{WriteCursor, append_record, write_cursor_for};
use crate::store::tests::helpers::fresh_store;
use crate::store::{BlockStore, StorageError};

/// A scratch store plus the writer-side state the record engine needs.
pub struct Fixture {
    pub _tmp: TempDir,
    pub store: BlockStore,
    pub allocator: BlockAllocator,
    pub header: HeaderBlock,
    pub cursor: WriteCursor,
}

impl Fixture {
    /// A fixed-size file of `blocks` blocks with a fresh header.
    pub fn new(blocks: u32) -> Self {
        let tmp = TempDir::new().unwrap();
        let store = fresh_store(&tmp, blocks);
        let header = HeaderBlock::initial();
        let cursor = write_cursor_for(&store, &header).unwrap();
        Self {
            _tmp: tmp,
            store,
            allocator: BlockAllocator::fixed(),
            header,
            cursor,
        }
    }

    pub fn append(
        &mut self,
        key: &[u8],
        value: &[u8],
        tx: TxId,
    ) -> Result<RecordLocator, StorageError> {
        let record = Record::new(key.to_vec(), value.to_vec(), tx);
        append_record(
            &self.store,
            &self.allocator,
            &mut self.header,
            &mut self.cursor,
            &record,
        )
    }
}

/// Deterministic filler bytes so overflow chunks are distinguishable.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
