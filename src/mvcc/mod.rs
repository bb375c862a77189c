//! Transaction and Visibility Layer
//!
//! Decides which record versions a reader sees and maintains the logical
//! record list that readers walk.
//!
//! ## Visibility
//!
//! A reader holding watermark `T` sees a version iff
//! `created <= T && (deleted == 0 || deleted > T)`. Writers mint a new
//! transaction id `last_tx + 1` per mutation and publish it by writing the
//! header; until then every byte they wrote is invisible to readers,
//! whose watermarks are all `<= last_tx`.
//!
//! ## Logical list
//!
//! Every linked record is a node of one doubly linked list ordered by key
//! ascending, then by `created` descending (newest version of a key first).
//! Links store only a *block id*. The neighbor inside that block is the
//! record that is structurally adjacent in list order:
//!
//! - the successor is the smallest record of the target block ordered after
//!   the source;
//! - the predecessor is the largest record ordered before it.
//!
//! A link whose target block has no such record is dangling and reported as
//! [`StorageError::Corruption`]. The locator of the list head is published
//! with the header.
//!
//! ## Reclamation
//!
//! Versions that no snapshot can see any more are reclaimed one data block
//! at a time. A block qualifies once every record in it was deleted at or
//! before the horizon (the oldest registered snapshot). [`plan_retirement`]
//! works out, in a single forward walk, the new list head and the link
//! patches that unlink its records, without writing anything. The caller
//! publishes the new head as transaction `U`, then [`apply_retirement`]
//! patches the links and flags the blocks `RETIRED`. A `RETIRED` flag on
//! disk therefore always belongs to a published retirement. The block goes
//! back to the free list only after every snapshot older than `U` has
//! finished, since such a reader may still be positioned inside it.
//!
//! ## Void records
//!
//! A record with `deleted == created` is void: a transaction that never
//! published wrote it. It is invisible at every watermark and is not a node
//! of the list, so link resolution skips it.

#[cfg(test)]
pub(crate) mod tests;

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{trace, warn};

use crate::format::{
    BlockFlags, BlockHeader, BlockId, HeaderBlock, HeaderRegion, Record, RecordHead,
    RecordLocator, TxId,
};
use crate::freelist::BlockAllocator;
use crate::record::{
    self, WriteCursor, patch_deleted, patch_next, patch_prev, read_record_at, read_record_head,
    scan_block,
};
use crate::store::{BlockStore, StorageError};

// ------------------------------------------------------------------------------------------------
// Visibility
// ------------------------------------------------------------------------------------------------

/// A record version with a validity interval `[created, deleted)`.
pub trait Versioned {
    /// Transaction that created the version.
    fn created(&self) -> TxId;

    /// Transaction that superseded or removed it, 0 while live.
    fn deleted(&self) -> TxId;

    /// Whether a reader at watermark `snapshot` sees this version.
    fn is_visible(&self, snapshot: TxId) -> bool {
        is_visible(self.created(), self.deleted(), snapshot)
    }

    /// Whether the version has been superseded or removed at all.
    fn is_live(&self) -> bool {
        self.deleted() == 0
    }

    /// Whether the version was left behind by an unpublished transaction.
    fn is_void(&self) -> bool {
        self.deleted() == self.created()
    }
}

impl Versioned for Record {
    fn created(&self) -> TxId {
        self.created
    }

    fn deleted(&self) -> TxId {
        self.deleted
    }
}

impl Versioned for RecordHead {
    fn created(&self) -> TxId {
        self.created
    }

    fn deleted(&self) -> TxId {
        self.deleted
    }
}

/// `created <= T && (deleted == 0 || deleted > T)`.
#[inline]
pub fn is_visible(created: TxId, deleted: TxId, snapshot: TxId) -> bool {
    created <= snapshot && (deleted == 0 || deleted > snapshot)
}

// ------------------------------------------------------------------------------------------------
// Snapshots
// ------------------------------------------------------------------------------------------------

/// Watermarks of all live snapshots, with a reference count per watermark.
#[derive(Debug, Default)]
pub struct SnapshotRegistry {
    active: Mutex<BTreeMap<TxId, usize>>,
}

impl SnapshotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<TxId, usize>>, StorageError> {
        self.active
            .lock()
            .map_err(|_| StorageError::Internal("snapshot registry mutex poisoned".into()))
    }

    /// Oldest registered watermark, if any snapshot is alive.
    pub fn oldest(&self) -> Result<Option<TxId>, StorageError> {
        Ok(self.lock()?.keys().next().copied())
    }

    /// Number of live snapshots.
    pub fn active(&self) -> Result<usize, StorageError> {
        Ok(self.lock()?.values().sum())
    }

    fn release(&self, tx: TxId) {
        // Drop cannot report errors; a poisoned registry only delays reclamation.
        if let Ok(mut active) = self.active.lock()
            && let Some(count) = active.get_mut(&tx)
        {
            *count -= 1;
            if *count == 0 {
                active.remove(&tx);
            }
        }
    }
}

/// A registered read watermark.
///
/// Everything committed at or before [`Snapshot::tx`] is visible through
/// it; nothing committed later is. Dropping the guard deregisters it.
#[derive(Debug)]
pub struct Snapshot {
    tx: TxId,
    registry: Arc<SnapshotRegistry>,
}

impl Snapshot {
    /// The watermark `T`.
    pub fn tx(&self) -> TxId {
        self.tx
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.registry.release(self.tx);
        trace!(tx = self.tx, "snapshot released");
    }
}

/// Registers a snapshot at the currently published `last_tx`.
///
/// The registry stays locked while the header is read, so a concurrent
/// reclamation either sees this snapshot or has already published the
/// transaction it will compare against.
pub fn begin_snapshot(
    store: &BlockStore,
    registry: &Arc<SnapshotRegistry>,
) -> Result<Snapshot, StorageError> {
    let mut active = registry.lock()?;
    let tx = store
        .read_header()?
        .map(|region| region.header.last_tx)
        .unwrap_or(0);
    *active.entry(tx).or_insert(0) += 1;
    drop(active);

    trace!(tx, "snapshot registered");
    Ok(Snapshot {
        tx,
        registry: Arc::clone(registry),
    })
}

// ------------------------------------------------------------------------------------------------
// List navigation
// ------------------------------------------------------------------------------------------------

/// Resolves a link into `target` from `from` by picking the record of the
/// target block that is adjacent to `from` in list order. Void records are
/// not list nodes and never match.
fn resolve_link(
    store: &BlockStore,
    from: &RecordHead,
    target: BlockId,
    wanted: Ordering,
) -> Result<RecordHead, StorageError> {
    let mut best: Option<RecordHead> = None;
    for head in scan_block(store, target)? {
        let head = head?;
        if head.is_void() || head.list_cmp(&from.key, from.created) != wanted {
            continue;
        }
        let closer = match &best {
            None => true,
            Some(b) => head.list_cmp(&b.key, b.created) == wanted.reverse(),
        };
        if closer {
            best = Some(head);
        }
    }

    best.ok_or_else(|| StorageError::Corruption {
        block: target,
        detail: format!(
            "dangling {} link from block {} offset {}",
            if wanted == Ordering::Greater { "next" } else { "prev" },
            from.block,
            from.offset
        ),
    })
}

/// The record after `from` in list order, or `None` at the tail.
pub fn successor(store: &BlockStore, from: &RecordHead) -> Result<Option<RecordHead>, StorageError> {
    if from.next == 0 {
        return Ok(None);
    }
    resolve_link(store, from, from.next, Ordering::Greater).map(Some)
}

/// The record before `from` in list order, or `None` at the head.
pub fn predecessor(
    store: &BlockStore,
    from: &RecordHead,
) -> Result<Option<RecordHead>, StorageError> {
    if from.prev == 0 {
        return Ok(None);
    }
    resolve_link(store, from, from.prev, Ordering::Less).map(Some)
}

/// Lazy forward walk over the record list.
///
/// Yields every linked record head, visible or not. Stops after the first
/// error.
#[derive(Debug)]
pub struct ListWalk<'a> {
    store: &'a BlockStore,
    pending: Option<RecordLocator>,
    current: Option<RecordHead>,
    failed: bool,
}

impl<'a> ListWalk<'a> {
    pub fn new(store: &'a BlockStore, head: Option<RecordLocator>) -> Self {
        Self {
            store,
            pending: head,
            current: None,
            failed: false,
        }
    }

    fn advance(&mut self) -> Result<Option<RecordHead>, StorageError> {
        let next = match (self.pending.take(), &self.current) {
            (Some(loc), _) => Some(read_record_head(self.store, loc)?),
            (None, Some(current)) => successor(self.store, current)?,
            (None, None) => None,
        };
        self.current = next.clone();
        Ok(next)
    }
}

impl Iterator for ListWalk<'_> {
    type Item = Result<RecordHead, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.advance() {
            Ok(Some(head)) => Some(Ok(head)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Finds the version of `key` visible at `snapshot` and reads it in full.
///
/// The walk stops at the first key greater than `key`.
pub fn lookup(
    store: &BlockStore,
    head: Option<RecordLocator>,
    key: &[u8],
    snapshot: TxId,
) -> Result<Option<Record>, StorageError> {
    for node in ListWalk::new(store, head) {
        let node = node?;
        match node.key.as_slice().cmp(key) {
            Ordering::Less => {}
            Ordering::Equal if node.is_visible(snapshot) => {
                return read_record_at(store, node.block, node.offset).map(Some);
            }
            Ordering::Equal => {}
            Ordering::Greater => break,
        }
    }
    Ok(None)
}

/// Where a new version of a key belongs in the list.
#[derive(Debug, Default)]
pub struct InsertPosition {
    /// Last record with a smaller key.
    pub pred: Option<RecordHead>,

    /// First record with an equal or greater key.
    pub succ: Option<RecordHead>,

    /// The version of the key with `deleted == 0`, if any.
    pub live: Option<RecordHead>,
}

/// Locates the insertion point for a new (newest) version of `key`.
pub fn find_insert_position(
    store: &BlockStore,
    head: Option<RecordLocator>,
    key: &[u8],
) -> Result<InsertPosition, StorageError> {
    let mut pos = InsertPosition::default();
    for node in ListWalk::new(store, head) {
        let node = node?;
        match node.key.as_slice().cmp(key) {
            Ordering::Less => pos.pred = Some(node),
            Ordering::Equal => {
                // Only the newest version of a key can be live.
                if node.is_live() {
                    pos.live = Some(node.clone());
                }
                pos.succ = Some(node);
                break;
            }
            Ordering::Greater => {
                pos.succ = Some(node);
                break;
            }
        }
    }
    Ok(pos)
}

// ------------------------------------------------------------------------------------------------
// Commits
// ------------------------------------------------------------------------------------------------

/// Writer-side state a commit works on.
///
/// `region` is a working copy of the published header region: commits edit
/// it and the caller publishes it afterwards.
#[derive(Debug)]
pub struct CommitContext<'a> {
    pub store: &'a BlockStore,
    pub allocator: &'a BlockAllocator,
    pub region: &'a mut HeaderRegion,

    /// Bump pointer; computed from the current data block on first use.
    pub cursor: &'a mut Option<WriteCursor>,
}

/// Writes version `tx` of `key` and splices it into the list.
///
/// Order of effects: record bytes and `num_records`, then `deleted = tx` on
/// the previously live version, then the new record's neighbors are linked
/// to it, then the list head in the working region. Returns the locator of
/// the new record.
pub fn commit_insert(
    ctx: &mut CommitContext<'_>,
    key: &[u8],
    value: &[u8],
    tx: TxId,
) -> Result<RecordLocator, StorageError> {
    let pos = find_insert_position(ctx.store, ctx.region.list_head, key)?;

    let mut record = Record::new(key.to_vec(), value.to_vec(), tx);
    record.prev = pos.pred.as_ref().map_or(0, |p| p.block);
    record.next = pos.succ.as_ref().map_or(0, |s| s.block);

    let cursor = match ctx.cursor.take() {
        Some(cursor) => cursor,
        None => record::write_cursor_for(ctx.store, &ctx.region.header)?,
    };
    let cursor = ctx.cursor.insert(cursor);
    let loc = record::append_record(
        ctx.store,
        ctx.allocator,
        &mut ctx.region.header,
        cursor,
        &record,
    )?;

    if let Some(live) = &pos.live {
        patch_deleted(ctx.store, live.locator(), tx)?;
    }
    match &pos.pred {
        Some(pred) => patch_next(ctx.store, pred.locator(), loc.block)?,
        None => ctx.region.list_head = Some(loc),
    }
    if let Some(succ) = &pos.succ {
        patch_prev(ctx.store, succ.locator(), loc.block)?;
    }

    trace!(
        tx,
        block = loc.block,
        offset = loc.offset,
        superseded = pos.live.is_some(),
        "inserted version"
    );
    Ok(loc)
}

/// Marks the live version of `key` as deleted by `tx`.
///
/// Returns `None`, writing nothing, if the key has no live version.
pub fn commit_delete(
    store: &BlockStore,
    head: Option<RecordLocator>,
    key: &[u8],
    tx: TxId,
) -> Result<Option<RecordLocator>, StorageError> {
    let pos = find_insert_position(store, head, key)?;
    match pos.live {
        Some(live) => {
            patch_deleted(store, live.locator(), tx)?;
            trace!(tx, block = live.block, offset = live.offset, "deleted version");
            Ok(Some(live.locator()))
        }
        None => Ok(None),
    }
}

// ------------------------------------------------------------------------------------------------
// Reclamation
// ------------------------------------------------------------------------------------------------

/// A link rewrite that unlinks retired records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkPatch {
    Prev(RecordLocator, BlockId),
    Next(RecordLocator, BlockId),
}

/// What [`plan_retirement`] decided. Nothing has been written yet.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetirePlan {
    /// Data blocks to flag `RETIRED`.
    pub blocks: Vec<BlockId>,

    /// Record versions those blocks hold.
    pub records: usize,

    /// List head once the blocks are unlinked.
    pub new_head: Option<RecordLocator>,

    patches: Vec<LinkPatch>,
}

impl RetirePlan {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Blocks chained from `id` through `next_block`, `id` included.
fn chain_of(store: &BlockStore, header: &BlockHeader, last_block: BlockId) -> Result<Vec<BlockId>, StorageError> {
    let mut chain = vec![header.id];
    let mut next = header.next_block;
    while next != 0 {
        if chain.len() > last_block as usize {
            return Err(StorageError::Corruption {
                block: header.id,
                detail: "overflow chain does not terminate".into(),
            });
        }
        chain.push(next);
        next = store.read_block_header(next)?.next_block;
    }
    Ok(chain)
}

/// Whether every record of data block `header.id` is invisible at `horizon`
/// and to every later watermark.
fn is_reclaimable(
    store: &BlockStore,
    header: &BlockHeader,
    horizon: TxId,
    current: BlockId,
    last_block: BlockId,
) -> Result<bool, StorageError> {
    if header.flags != BlockFlags::DATA || header.num_records == 0 {
        return Ok(false);
    }
    if chain_of(store, header, last_block)?.contains(&current) {
        return Ok(false);
    }
    for head in scan_block(store, header.id)? {
        let head = head?;
        if head.is_void() {
            continue;
        }
        if head.deleted == 0 || head.deleted > horizon {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Finds every data block whose records are all dead at `horizon` and plans
/// how to unlink them.
///
/// Reads only. Blocks that fail to decode are skipped with a warning.
pub fn plan_retirement(
    store: &BlockStore,
    region: &HeaderRegion,
    horizon: TxId,
) -> Result<RetirePlan, StorageError> {
    let header = region.header;
    let mut candidates = HashSet::new();
    for id in 1..=header.last_block {
        if id == header.current_data_block {
            continue;
        }
        let reclaimable = store.read_block_header(id).and_then(|block| {
            is_reclaimable(store, &block, horizon, header.current_data_block, header.last_block)
        });
        match reclaimable {
            Ok(true) => {
                candidates.insert(id);
            }
            Ok(false) => {}
            Err(e) => warn!(block = id, error = %e, "skipping unreadable block during reclamation"),
        }
    }
    if candidates.is_empty() {
        return Ok(RetirePlan {
            new_head: region.list_head,
            ..RetirePlan::default()
        });
    }

    let mut plan = RetirePlan::default();
    let mut last_kept: Option<RecordHead> = None;
    for node in ListWalk::new(store, region.list_head) {
        let node = node?;
        if candidates.contains(&node.block) {
            plan.records += 1;
            continue;
        }

        let prev_block = last_kept.as_ref().map_or(0, |k| k.block);
        if node.prev != prev_block {
            plan.patches.push(LinkPatch::Prev(node.locator(), prev_block));
        }
        match &last_kept {
            Some(kept) if kept.next != node.block => {
                plan.patches.push(LinkPatch::Next(kept.locator(), node.block));
            }
            Some(_) => {}
            None => plan.new_head = Some(node.locator()),
        }
        last_kept = Some(node);
    }
    if let Some(kept) = &last_kept
        && kept.next != 0
    {
        plan.patches.push(LinkPatch::Next(kept.locator(), 0));
    }

    plan.blocks = candidates.into_iter().collect();
    plan.blocks.sort_unstable();
    trace!(
        blocks = plan.blocks.len(),
        records = plan.records,
        patches = plan.patches.len(),
        horizon,
        "planned retirement"
    );
    Ok(plan)
}

/// Carries out a published [`RetirePlan`]: patches the links, then flags the
/// blocks `RETIRED`.
///
/// Every link is rewritten before the first flag, so a block found
/// `RETIRED` is never reachable from the list.
pub fn apply_retirement(store: &BlockStore, plan: &RetirePlan) -> Result<(), StorageError> {
    for patch in &plan.patches {
        match *patch {
            LinkPatch::Prev(loc, block) => patch_prev(store, loc, block)?,
            LinkPatch::Next(loc, block) => patch_next(store, loc, block)?,
        }
    }
    for id in &plan.blocks {
        let mut block = store.read_block_header(*id)?;
        block.flags = block.flags.with(BlockFlags::RETIRED);
        store.write_block_header(&block)?;
    }
    trace!(blocks = plan.blocks.len(), "retired blocks");
    Ok(())
}

/// Blocks retired under transaction `retired_at`, waiting for older
/// snapshots to finish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRelease {
    pub blocks: Vec<BlockId>,
    pub retired_at: TxId,
}

impl PendingRelease {
    /// True once no snapshot older than `retired_at` can exist.
    pub fn is_releasable(&self, oldest_snapshot: Option<TxId>) -> bool {
        oldest_snapshot.is_none_or(|oldest| oldest >= self.retired_at)
    }
}

/// Returns every releasable pending block (and its overflow chain) to the
/// free list. Returns how many blocks were freed.
pub fn release_retired(
    store: &BlockStore,
    allocator: &BlockAllocator,
    header: &mut HeaderBlock,
    pending: &mut Vec<PendingRelease>,
    oldest_snapshot: Option<TxId>,
) -> Result<usize, StorageError> {
    let mut freed = 0;
    let mut i = 0;
    while i < pending.len() {
        if !pending[i].is_releasable(oldest_snapshot) {
            i += 1;
            continue;
        }
        for id in &pending[i].blocks {
            freed += allocator.release_chain(store, header, *id)?;
        }
        pending.remove(i);
    }
    Ok(freed)
}

/// Data blocks flagged `RETIRED`, whose retirement has been published.
pub fn find_retired(store: &BlockStore, header: &HeaderBlock) -> Vec<BlockId> {
    (1..=header.last_block)
        .filter(|id| match store.read_block_header(*id) {
            Ok(block) => block.flags.contains(BlockFlags::RETIRED),
            Err(e) => {
                warn!(block = *id, error = %e, "skipping unreadable block while looking for retired blocks");
                false
            }
        })
        .collect()
}
