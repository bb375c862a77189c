//! Recovery
//!
//! Puts the blocks back in line with the last published header.
//!
//! Only a header publish commits a transaction, but a writer touches blocks
//! before it publishes. It appends the new record, stamps the superseded
//! version, patches the neighbors' links and overwrites the free blocks it
//! popped. If the process stops, or the commit fails, before the header is
//! written, those bytes describe a transaction that never happened and
//! whose id the next commit will hand out again.
//!
//! [`recover`] runs on open and after every commit that failed after
//! writing. Measured against the published `last_tx`, it:
//!
//! 1. clears `deleted` stamps above `last_tx`;
//! 2. relinks the list over the committed records, in list order;
//! 3. voids records created above `last_tx` (`deleted = created`);
//! 4. cuts `next_block` pointers behind a last record that does not
//!    overflow;
//! 5. threads every block no record owns back onto the free list.
//!
//! Relinking comes before voiding: a concurrent reader that follows a stale
//! link into an orphan still finds the orphan's own links pointing onward.
//! On a file that was closed cleanly nothing is written.


use std::collections::{BTreeSet, HashSet};

use tracing::{debug, info, warn};

use crate::format::{
    BLOCK_HEADER_SIZE, BLOCK_SIZE, BlockFlags, BlockHeader, BlockId, HeaderRegion, RecordHead,
};
use crate::freelist::free_blocks;
use crate::mvcc::Versioned;
use crate::record::{patch_deleted, patch_next, patch_prev, scan_block};
use crate::store::{BlockStore, StorageError};

/// What [`recover`] changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records of unpublished transactions, now void.
    pub voided: usize,

    /// `deleted` stamps cleared.
    pub restored: usize,

    /// Link fields rewritten.
    pub relinked: usize,

    /// Stray overflow pointers cut.
    pub trimmed: usize,

    /// Blocks put back on the free list.
    pub freed: usize,
}

impl RecoveryReport {
    /// True if nothing had to be repaired.
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

/// How a block up to `last_block` is used.
#[derive(Debug)]
enum Role {
    Free,
    Overflow(BlockHeader),
    Data {
        header: BlockHeader,
        heads: Vec<RecordHead>,
    },
    Retired(BlockHeader),
    /// Not free, yet holding no record: the start of an append that never
    /// counted its record.
    Unused,
    Unreadable,
}

fn classify(store: &BlockStore, id: BlockId) -> Result<Role, StorageError> {
    let header = store.read_block_header(id)?;
    let flags = header.flags;
    if flags.contains(BlockFlags::FREE) {
        return Ok(Role::Free);
    }
    if flags.contains(BlockFlags::OVERFLOW) {
        return Ok(Role::Overflow(header));
    }
    if !flags.contains(BlockFlags::DATA) || header.num_records == 0 {
        return Ok(Role::Unused);
    }
    if flags.contains(BlockFlags::RETIRED) {
        return Ok(Role::Retired(header));
    }

    let heads = scan_block(store, id)?.collect::<Result<Vec<_>, _>>()?;
    Ok(Role::Data { header, heads })
}

/// Repairs whatever an unpublished transaction left in the blocks.
///
/// `region` is the published header region. Its list head and free-list
/// root are updated in place; the caller publishes it if it changed.
/// `RETIRED` blocks are left alone.
///
/// # Errors
///
/// The first unreadable block, if the list needs relinking while some
/// block cannot be decoded: relinking without it would drop its records.
pub fn recover(store: &BlockStore, region: &mut HeaderRegion) -> Result<RecoveryReport, StorageError> {
    let header = region.header;
    let last_tx = header.last_tx;
    let mut report = RecoveryReport::default();

    let mut roles = Vec::with_capacity(header.last_block as usize);
    let mut unreadable = None;
    for id in 1..=header.last_block {
        match classify(store, id) {
            Ok(role) => roles.push(role),
            Err(e) => {
                warn!(block = id, error = %e, "unreadable block during recovery");
                unreadable.get_or_insert(e);
                roles.push(Role::Unreadable);
            }
        }
    }
    let role = |id: BlockId| -> Option<&Role> {
        id.checked_sub(1).and_then(|i| roles.get(i as usize))
    };

    // Link targets a committed record may name.
    let targets: HashSet<BlockId> = (1..=header.last_block)
        .filter(|id| matches!(role(*id), Some(Role::Data { .. } | Role::Unreadable)))
        .collect();

    let mut members = Vec::new();
    let mut orphans = Vec::new();
    let mut stamped = Vec::new();
    for r in &roles {
        let Role::Data { heads, .. } = r else { continue };
        for head in heads {
            if head.is_void() {
                continue;
            }
            if head.created > last_tx {
                orphans.push(head);
                continue;
            }
            if head.deleted > last_tx {
                stamped.push(head);
            }
            members.push(head);
        }
    }

    let dangling = |block: BlockId| block != 0 && !targets.contains(&block);
    let broken_links = members.iter().any(|h| dangling(h.prev) || dangling(h.next))
        || region.list_head.is_some_and(|loc| !targets.contains(&loc.block))
        || (region.list_head.is_none() && !members.is_empty())
        || (region.list_head.is_some() && members.is_empty() && unreadable.is_none());
    let relink = !orphans.is_empty() || broken_links;
    if relink && let Some(e) = unreadable {
        return Err(e);
    }

    for head in &stamped {
        patch_deleted(store, head.locator(), 0)?;
        report.restored += 1;
    }

    if relink {
        members.sort_by(|a, b| a.list_cmp(&b.key, b.created));
        for (i, head) in members.iter().enumerate() {
            let prev = i.checked_sub(1).map_or(0, |p| members[p].block);
            let next = members.get(i + 1).map_or(0, |n| n.block);
            if head.prev != prev {
                patch_prev(store, head.locator(), prev)?;
                report.relinked += 1;
            }
            if head.next != next {
                patch_next(store, head.locator(), next)?;
                report.relinked += 1;
            }
        }
        region.list_head = members.first().map(|h| h.locator());
    }

    for head in &orphans {
        patch_deleted(store, head.locator(), head.created)?;
        report.voided += 1;
    }

    // Chains of blocks that hold records, after cutting stray pointers.
    let mut owned = HashSet::from([header.current_data_block]);
    for (i, r) in roles.iter().enumerate() {
        let id = i as BlockId + 1;
        let mut next = match r {
            Role::Data { header: block, heads } => {
                let end = heads
                    .last()
                    .map_or(BLOCK_HEADER_SIZE, |h| h.offset + h.encoded_len());
                if block.next_block != 0 && end <= BLOCK_SIZE {
                    store.write_block_header(&BlockHeader {
                        next_block: 0,
                        ..*block
                    })?;
                    report.trimmed += 1;
                    0
                } else {
                    block.next_block
                }
            }
            Role::Retired(block) => block.next_block,
            Role::Unreadable => 0,
            Role::Free | Role::Overflow(_) | Role::Unused => continue,
        };
        owned.insert(id);
        while let Some(Role::Overflow(block)) = role(next) {
            if !owned.insert(next) {
                break;
            }
            next = block.next_block;
        }
    }

    let free: BTreeSet<BlockId> = (1..=header.last_block)
        .filter(|id| !owned.contains(id))
        .collect();
    let listed = free_blocks(store, &header).ok();
    let intact = listed
        .as_ref()
        .is_some_and(|l| l.len() == free.len() && l.iter().all(|id| free.contains(id)));
    if !intact {
        let kept = listed.map_or(0, |l| l.iter().filter(|id| free.contains(id)).count());
        let mut root = 0;
        for id in free.iter().rev() {
            store.write_block_header(&BlockHeader {
                id: *id,
                next_block: root,
                flags: BlockFlags::FREE,
                num_records: 0,
            })?;
            root = *id;
        }
        region.header.free_block = root;
        report.freed = free.len().saturating_sub(kept);
    }

    if report.is_clean() {
        debug!(last_tx, "blocks consistent with published header");
    } else {
        info!(
            last_tx,
            voided = report.voided,
            restored = report.restored,
            relinked = report.relinked,
            trimmed = report.trimmed,
            freed = report.freed,
            rebuilt_free_list = !intact,
            "repaired blocks written by an unpublished transaction"
        );
    }
    Ok(report)
}
