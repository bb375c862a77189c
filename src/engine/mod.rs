//! # Storage Engine
//!
//! Ties the block store, allocator, record engine and visibility layer into
//! a single handle with a transactional write path.
//!
//! ## Concurrency Model
//!
//! One writer at a time: `put`, `delete` and `reclaim` serialize on a
//! `Mutex<WriterState>` that owns the writer's copy of the header region,
//! the bump pointer and the blocks waiting to be released. Readers never
//! take that mutex. They register a snapshot (a short lock on the snapshot
//! registry) and then read blocks through the store one copy at a time.
//!
//! ## Write path
//!
//! Every mutation runs against a *working copy* of the header region:
//!
//! 1. Mint `tx = last_tx + 1`.
//! 2. Allocate, write record bytes, stamp superseded versions, rewire links.
//! 3. If `sync_on_commit`, flush every dirty block.
//! 4. Publish the working copy with one header write (the commit point).
//! 5. Install the working copy as the writer's header.
//!
//! A failure before step 4 leaves the published header, and therefore every
//! reader, on the previous transaction. The bytes written so far are then
//! repaired by [`recover`], which also runs on every open, so the blocks
//! match the published header again before the failed id is handed out a
//! second time.
//!
//! ## Guarantees
//!
//! - **Snapshot reads:** a reader sees exactly the versions committed at or
//!   before its snapshot's watermark, however many commits follow.
//! - **No reuse under readers:** blocks reclaimed under transaction `U` are
//!   handed out again only after every snapshot older than `U` has dropped.
//! - **Durability:** with `sync_on_commit`, a transaction is on disk when
//!   `put`/`delete` returns.

#[cfg(test)]
mod tests;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::format::{
    BLOCK_HEADER_SIZE, BLOCK_SIZE, BlockFlags, HeaderBlock, HeaderRegion, RecordLocator, TxId,
};
use crate::freelist::{BlockAllocator, free_blocks};
use crate::mvcc::{
    self, CommitContext, ListWalk, PendingRelease, Snapshot, SnapshotRegistry, Versioned,
    apply_retirement, commit_delete, commit_insert, find_retired, lookup, plan_retirement,
    release_retired,
};
use crate::record::{WriteCursor, read_record_at};
use crate::recovery::recover;
use crate::store::{BlockStore, StorageError};

/// A key/value pair produced by scans.
pub type KeyValue = (Vec<u8>, Vec<u8>);

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Error originating from the storage layers.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// `delete` found no live version of the key.
    #[error("key not found")]
    KeyNotFound,

    /// Internal invariant violation (poisoned lock, exhausted tx ids, etc.).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Configuration for an [`Engine`] instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Blocks appended whenever the high-water mark reaches the end of the
    /// file. 0 keeps the file at its initial size.
    pub growth_blocks: u32,

    /// Upper bound on the file size, in blocks.
    pub max_blocks: u32,

    /// Flush dirty blocks before, and the header after, every publish.
    pub sync_on_commit: bool,

    /// Run a reclamation round after every successful delete.
    pub reclaim_on_delete: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            growth_blocks: 64,
            max_blocks: 1 << 20,
            sync_on_commit: true,
            reclaim_on_delete: false,
        }
    }
}

/// Snapshot of engine statistics returned by [`Engine::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    /// Highest committed transaction.
    pub last_tx: TxId,
    /// Blocks in the file, header block included.
    pub block_count: u32,
    /// High-water mark of allocated blocks.
    pub last_block: u32,
    /// Block currently receiving appends.
    pub current_data_block: u32,
    /// Blocks on the free list.
    pub free_blocks: usize,
    /// Record versions reachable from the list head.
    pub records: usize,
    /// Versions with `deleted == 0`, i.e. keys currently present.
    pub live_records: usize,
    /// Registered snapshots.
    pub active_snapshots: usize,
    /// Retired blocks waiting for older snapshots to finish.
    pub pending_release: usize,
}

/// Outcome of [`Engine::reclaim`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    /// Data blocks unlinked in this round.
    pub retired_blocks: usize,
    /// Record versions those blocks held.
    pub retired_records: usize,
    /// Blocks (overflow blocks included) returned to the free list.
    pub released_blocks: usize,
}

/// Writer-owned state, guarded by the writer mutex.
#[derive(Debug)]
struct WriterState {
    /// Header region as last published by this writer.
    region: HeaderRegion,

    /// Bump pointer; `None` until the first append after open or after a
    /// failed write.
    cursor: Option<WriteCursor>,

    /// Retired blocks waiting for older snapshots.
    pending: Vec<PendingRelease>,
}

#[derive(Debug)]
struct EngineInner {
    store: BlockStore,
    writer: Mutex<WriterState>,
    snapshots: Arc<SnapshotRegistry>,
    allocator: BlockAllocator,
    config: EngineConfig,
}

/// The storage engine handle.
///
/// Thread-safe; clones share the same underlying file.
#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    // --------------------------------------------------------------------------------------------
    // Lock helpers
    // --------------------------------------------------------------------------------------------

    /// Acquires the writer mutex.
    fn writer(&self) -> Result<MutexGuard<'_, WriterState>, EngineError> {
        self.inner
            .writer
            .lock()
            .map_err(|_| EngineError::Internal("writer mutex poisoned".into()))
    }

    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// Creates a new data file of `blocks` blocks and opens an engine on it.
    pub fn create(
        path: impl AsRef<Path>,
        blocks: u32,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let store = BlockStore::create(path, blocks)?;
        Self::with_store(store, config)
    }

    /// Opens an engine on an existing data file.
    ///
    /// A file whose header was never written is initialized with the empty
    /// header `{last_tx: 0, free_block: 0, current_data_block: 1,
    /// last_block: 0}`. Bytes written by a transaction that never published
    /// are repaired, and blocks left retired by a previous process are
    /// returned to the free list.
    pub fn open(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self, EngineError> {
        let store = BlockStore::open(path)?;
        Self::with_store(store, config)
    }

    fn with_store(store: BlockStore, config: EngineConfig) -> Result<Self, EngineError> {
        let allocator = BlockAllocator::new(config.growth_blocks, config.max_blocks);
        let block_count = store.block_count()?;

        let mut region = match store.read_header()? {
            Some(region) => {
                validate_region(&region, block_count)?;
                region
            }
            None => {
                let region = HeaderRegion {
                    header: HeaderBlock::initial(),
                    list_head: None,
                };
                store.write_header(&region, true)?;
                info!(path = %store.path().display(), "initialized empty header");
                region
            }
        };

        let mut working = region;
        let report = recover(&store, &mut working)?;

        let retired = find_retired(&store, &working.header);
        if !retired.is_empty() {
            let mut pending = vec![PendingRelease {
                blocks: retired,
                retired_at: 0,
            }];
            let freed =
                release_retired(&store, &allocator, &mut working.header, &mut pending, None)?;
            info!(freed, "released blocks retired before restart");
        }

        if working != region || !report.is_clean() {
            publish(&store, &working, config.sync_on_commit)?;
            region = working;
        }

        info!(
            path = %store.path().display(),
            last_tx = region.header.last_tx,
            blocks = block_count,
            last_block = region.header.last_block,
            "engine opened"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                store,
                writer: Mutex::new(WriterState {
                    region,
                    cursor: None,
                    pending: Vec::new(),
                }),
                snapshots: Arc::new(SnapshotRegistry::new()),
                allocator,
                config,
            }),
        })
    }

    /// Flushes the whole mapping to disk, then unmaps the file and closes
    /// its handle.
    ///
    /// Every clone of this engine shares the store, so afterwards all of
    /// them fail with [`StorageError::Closed`]. Closing twice is harmless.
    pub fn close(&self) -> Result<(), EngineError> {
        let writer = self.writer()?;
        self.inner.store.close()?;
        info!(
            path = %self.inner.store.path().display(),
            last_tx = writer.region.header.last_tx,
            "engine closed"
        );
        Ok(())
    }

    /// Path of the data file.
    pub fn path(&self) -> &Path {
        self.inner.store.path()
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Registers a read snapshot at the last published transaction.
    pub fn begin_snapshot(&self) -> Result<Snapshot, EngineError> {
        Ok(mvcc::begin_snapshot(&self.inner.store, &self.inner.snapshots)?)
    }

    /// List head as currently published.
    fn published_head(&self) -> Result<Option<RecordLocator>, EngineError> {
        Ok(self
            .inner
            .store
            .read_header()?
            .and_then(|region| region.list_head))
    }

    /// The value of `key` visible at `snapshot`, if any.
    pub fn get(&self, key: &[u8], snapshot: &Snapshot) -> Result<Option<Vec<u8>>, EngineError> {
        let head = self.published_head()?;
        let record = lookup(&self.inner.store, head, key, snapshot.tx())?;
        Ok(record.map(|r| r.value))
    }

    /// Lazily iterates the key/value pairs visible at `snapshot`, in key
    /// order.
    pub fn scan<'a>(&'a self, snapshot: &'a Snapshot) -> Result<EngineScan<'a>, EngineError> {
        let head = self.published_head()?;
        Ok(EngineScan {
            store: &self.inner.store,
            walk: ListWalk::new(&self.inner.store, head),
            snapshot,
        })
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Writes a new version of `key` and returns its transaction id.
    ///
    /// A previously live version is superseded (its `deleted` becomes the
    /// new id). Fails with [`StorageError::AllocationExhausted`] if the file
    /// cannot hold the record; the database is unchanged in that case.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<TxId, EngineError> {
        let mut writer = self.writer()?;
        let tx = next_tx(&writer.region)?;
        tracing::trace!(key_len = key.len(), value_len = value.len(), tx, "engine put");

        self.transact(&mut writer, |ctx| {
            commit_insert(ctx, &key, &value, tx)?;
            ctx.region.header.last_tx = tx;
            Ok(Some(()))
        })?;

        debug!(tx, "committed put");
        Ok(tx)
    }

    /// Marks the live version of `key` deleted and returns the transaction
    /// id.
    ///
    /// Returns [`EngineError::KeyNotFound`] without consuming a transaction
    /// id if the key has no live version.
    pub fn delete(&self, key: Vec<u8>) -> Result<TxId, EngineError> {
        let mut writer = self.writer()?;
        let tx = next_tx(&writer.region)?;

        let deleted = self.transact(&mut writer, |ctx| {
            let loc = commit_delete(ctx.store, ctx.region.list_head, &key, tx)?;
            if loc.is_some() {
                ctx.region.header.last_tx = tx;
            }
            Ok(loc)
        })?;
        if deleted.is_none() {
            return Err(EngineError::KeyNotFound);
        }
        debug!(tx, "committed delete");

        if self.inner.config.reclaim_on_delete {
            self.reclaim_locked(&mut writer)?;
        }
        Ok(tx)
    }

    // --------------------------------------------------------------------------------------------
    // Reclamation
    // --------------------------------------------------------------------------------------------

    /// Retires blocks that no snapshot can read any more and frees retired
    /// blocks whose older snapshots have all finished.
    pub fn reclaim(&self) -> Result<ReclaimStats, EngineError> {
        let mut writer = self.writer()?;
        self.reclaim_locked(&mut writer)
    }

    fn reclaim_locked(&self, writer: &mut WriterState) -> Result<ReclaimStats, EngineError> {
        let mut stats = ReclaimStats::default();
        let horizon = self
            .inner
            .snapshots
            .oldest()?
            .unwrap_or(writer.region.header.last_tx);

        // Publish the new head first; links and flags change only once the
        // retirement is committed.
        let tx = next_tx(&writer.region)?;
        let plan = self.transact(writer, |ctx| {
            let plan = plan_retirement(ctx.store, ctx.region, horizon)?;
            if plan.is_empty() {
                return Ok(None);
            }
            ctx.region.list_head = plan.new_head;
            ctx.region.header.last_tx = tx;
            Ok(Some(plan))
        })?;
        if let Some(plan) = plan {
            if let Err(e) = apply_retirement(&self.inner.store, &plan) {
                self.recover_after_failure(writer);
                return Err(e.into());
            }
            stats.retired_blocks = plan.blocks.len();
            stats.retired_records = plan.records;
            writer.pending.push(PendingRelease {
                blocks: plan.blocks,
                retired_at: tx,
            });
        }

        if !writer.pending.is_empty() {
            let oldest = self.inner.snapshots.oldest()?;
            let mut pending = writer.pending.clone();
            let released = self.transact(writer, |ctx| {
                let freed = release_retired(
                    ctx.store,
                    ctx.allocator,
                    &mut ctx.region.header,
                    &mut pending,
                    oldest,
                )?;
                Ok((freed > 0).then_some(freed))
            })?;
            writer.pending = pending;
            stats.released_blocks = released.unwrap_or(0);
        }

        debug!(
            horizon,
            retired_blocks = stats.retired_blocks,
            retired_records = stats.retired_records,
            released_blocks = stats.released_blocks,
            waiting = writer.pending.len(),
            "reclamation round"
        );
        Ok(stats)
    }

    // --------------------------------------------------------------------------------------------
    // Diagnostics
    // --------------------------------------------------------------------------------------------

    /// Collects statistics about the file and the record list.
    ///
    /// Takes the writer mutex so the free list and record list are walked
    /// in a consistent state.
    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let writer = self.writer()?;
        let store = &self.inner.store;
        let header = writer.region.header;

        let mut records = 0;
        let mut live_records = 0;
        for node in ListWalk::new(store, writer.region.list_head) {
            let node = node?;
            records += 1;
            if node.is_live() {
                live_records += 1;
            }
        }

        Ok(EngineStats {
            last_tx: header.last_tx,
            block_count: store.block_count()?,
            last_block: header.last_block,
            current_data_block: header.current_data_block,
            free_blocks: free_blocks(store, &header)?.len(),
            records,
            live_records,
            active_snapshots: self.inner.snapshots.active()?,
            pending_release: writer.pending.iter().map(|p| p.blocks.len()).sum(),
        })
    }

    // --------------------------------------------------------------------------------------------
    // Commit helper
    // --------------------------------------------------------------------------------------------

    /// Runs `op` against a working copy of the writer's header region.
    ///
    /// If `op` returns `Some`, the working copy is published and installed.
    /// If it returns `None`, nothing is published. On any error the
    /// published header is left untouched, the blocks are repaired to match
    /// it and the bump pointer is dropped, to be recomputed from disk by the
    /// next append. An exhausted allocation writes nothing and skips the
    /// repair.
    fn transact<T>(
        &self,
        writer: &mut WriterState,
        op: impl FnOnce(&mut CommitContext<'_>) -> Result<Option<T>, StorageError>,
    ) -> Result<Option<T>, EngineError> {
        let store = &self.inner.store;
        let mut region = writer.region;
        let mut cursor = writer.cursor;

        let result = op(&mut CommitContext {
            store,
            allocator: &self.inner.allocator,
            region: &mut region,
            cursor: &mut cursor,
        });
        let outcome = result.and_then(|value| match value {
            Some(value) => {
                publish(store, &region, self.inner.config.sync_on_commit).map(|()| Some(value))
            }
            None => Ok(None),
        });

        match outcome {
            Ok(value) => {
                if value.is_some() {
                    writer.region = region;
                }
                writer.cursor = cursor;
                Ok(value)
            }
            Err(e) => {
                writer.cursor = None;
                if !matches!(e, StorageError::AllocationExhausted { .. }) {
                    self.recover_after_failure(writer);
                }
                Err(e.into())
            }
        }
    }

    /// Repairs the blocks after a write that did not publish and drops
    /// pending blocks that are no longer retired.
    ///
    /// A failed repair is logged; the caller reports the original error.
    fn recover_after_failure(&self, writer: &mut WriterState) {
        let store = &self.inner.store;
        let mut region = writer.region;
        let repaired = recover(store, &mut region).and_then(|report| {
            if region != writer.region || !report.is_clean() {
                publish(store, &region, self.inner.config.sync_on_commit)?;
            }
            Ok(report)
        });

        match repaired {
            Ok(report) => {
                writer.region = region;
                writer.cursor = None;
                writer.pending.retain_mut(|p| {
                    p.blocks.retain(|id| {
                        store
                            .read_block_header(*id)
                            .is_ok_and(|block| block.flags.contains(BlockFlags::RETIRED))
                    });
                    !p.blocks.is_empty()
                });
                debug!(?report, "repaired blocks after failed commit");
            }
            Err(e) => error!(error = %e, "repair after failed commit failed"),
        }
    }
}

/// Flushes dirty blocks (when durable) and writes the header region.
fn publish(store: &BlockStore, region: &HeaderRegion, durable: bool) -> Result<(), StorageError> {
    if durable {
        store.sync()?;
    }
    store.write_header(region, durable)
}

fn next_tx(region: &HeaderRegion) -> Result<TxId, EngineError> {
    region
        .header
        .last_tx
        .checked_add(1)
        .ok_or_else(|| EngineError::Internal("transaction ids exhausted".into()))
}

/// Rejects a published header whose fields contradict each other or the
/// file size.
fn validate_region(region: &HeaderRegion, block_count: u32) -> Result<(), StorageError> {
    let h = &region.header;
    let invalid = |what: String| Err(StorageError::InvalidFile(format!("header: {what}")));

    if h.last_tx < 0 {
        return invalid(format!("negative last_tx {}", h.last_tx));
    }
    if h.last_block >= block_count {
        return invalid(format!(
            "last_block {} beyond file of {block_count} blocks",
            h.last_block
        ));
    }
    if h.free_block > h.last_block {
        return invalid(format!(
            "free_block {} beyond last_block {}",
            h.free_block, h.last_block
        ));
    }
    if h.current_data_block == 0 || h.current_data_block > h.last_block.max(1) {
        return invalid(format!(
            "current_data_block {} outside 1..={}",
            h.current_data_block,
            h.last_block.max(1)
        ));
    }
    if let Some(head) = region.list_head
        && (head.block > h.last_block
            || !(BLOCK_HEADER_SIZE..BLOCK_SIZE).contains(&head.offset))
    {
        return invalid(format!(
            "list head at block {} offset {} outside allocated blocks",
            head.block, head.offset
        ));
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Scan iterator
// ------------------------------------------------------------------------------------------------

/// Lazy iterator over the key/value pairs visible at one snapshot.
///
/// Borrows the snapshot so it stays registered for the whole scan.
#[derive(Debug)]
pub struct EngineScan<'a> {
    store: &'a BlockStore,
    walk: ListWalk<'a>,
    snapshot: &'a Snapshot,
}

impl Iterator for EngineScan<'_> {
    type Item = Result<KeyValue, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let node = match self.walk.next()? {
                Ok(node) => node,
                Err(e) => return Some(Err(e.into())),
            };
            if !node.is_visible(self.snapshot.tx()) {
                continue;
            }
            return Some(
                read_record_at(self.store, node.block, node.offset)
                    .map(|r| (r.key, r.value))
                    .map_err(EngineError::from),
            );
        }
    }
}
