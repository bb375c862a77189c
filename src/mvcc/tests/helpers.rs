use std::sync::Arc;

use tempfile::TempDir;

use crate::format::{HeaderBlock, HeaderRegion, RecordHead, TxId};
use crate::freelist::BlockAllocator;
use crate::mvcc::{
    CommitContext, ListWalk, RetirePlan, SnapshotRegistry, apply_retirement, commit_delete,
    commit_insert, plan_retirement,
};
use crate::record::WriteCursor;
use crate::store::BlockStore;
use crate::store::tests::helpers::fresh_store;

/// A store with a working header region, driven one commit at a time.
///
/// Every mutation publishes the region, like the engine does.
pub struct ListFixture {
    pub _tmp: TempDir,
    pub store: BlockStore,
    pub allocator: BlockAllocator,
    pub region: HeaderRegion,
    pub cursor: Option<WriteCursor>,
    pub registry: Arc<SnapshotRegistry>,
}

impl ListFixture {
    pub fn new(blocks: u32) -> Self {
        let tmp = TempDir::new().unwrap();
        let store = fresh_store(&tmp, blocks);
        let region = HeaderRegion {
            header: HeaderBlock::initial(),
            list_head: None,
        };
        store.write_header(&region, false).unwrap();
        Self {
            _tmp: tmp,
            store,
            allocator: BlockAllocator::fixed(),
            region,
            cursor: None,
            registry: Arc::new(SnapshotRegistry::new()),
        }
    }

    pub fn publish(&self) {
        self.store.write_header(&self.region, false).unwrap();
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> TxId {
        let tx = self.region.header.last_tx + 1;
        let mut ctx = CommitContext {
            store: &self.store,
            allocator: &self.allocator,
            region: &mut self.region,
            cursor: &mut self.cursor,
        };
        commit_insert(&mut ctx, key, value, tx).unwrap();
        self.region.header.last_tx = tx;
        self.publish();
        tx
    }

    pub fn delete(&mut self, key: &[u8]) -> Option<TxId> {
        let tx = self.region.header.last_tx + 1;
        commit_delete(&self.store, self.region.list_head, key, tx)
            .unwrap()
            .map(|_| {
                self.region.header.last_tx = tx;
                self.publish();
                tx
            })
    }

    /// Plans a retirement at `horizon`, installs the new head and applies it.
    pub fn retire(&mut self, horizon: TxId) -> RetirePlan {
        let plan = plan_retirement(&self.store, &self.region, horizon).unwrap();
        self.region.list_head = plan.new_head;
        apply_retirement(&self.store, &plan).unwrap();
        plan
    }

    /// Every linked record head, in list order.
    pub fn walk(&self) -> Vec<RecordHead> {
        ListWalk::new(&self.store, self.region.list_head)
            .map(|h| h.unwrap())
            .collect()
    }

    /// `(key, created)` of every linked record, in list order.
    pub fn order(&self) -> Vec<(Vec<u8>, TxId)> {
        self.walk().into_iter().map(|h| (h.key, h.created)).collect()
    }
}
