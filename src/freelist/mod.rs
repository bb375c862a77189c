//! Free-List Allocator
//!
//! Hands out block ids and takes reclaimed blocks back.
//!
//! Reclaimed blocks form a singly linked list threaded through each free
//! block's `next_block` field and rooted at [`HeaderBlock::free_block`].
//! When the list is empty the allocator bumps the high-water mark
//! [`HeaderBlock::last_block`], growing the file if the configuration
//! allows it. The high-water mark never decreases and the file never
//! shrinks.
//!
//! The allocator only edits the caller's working copy of the header; the
//! changes take effect when the caller publishes that header. Popping a free
//! block performs no write at all, so an operation that fails halfway
//! through allocating leaves the published free list intact.

#[cfg(test)]
mod tests;

use std::collections::HashSet;

use tracing::trace;

use crate::format::{BlockFlags, BlockHeader, BlockId, HeaderBlock};
use crate::store::{BlockStore, StorageError};

/// Allocation policy: how the file may grow once the high-water mark
/// reaches the end of the mapping.
#[derive(Debug, Clone, Copy)]
pub struct BlockAllocator {
    /// Blocks appended per growth step; 0 keeps the file at its current size.
    growth_blocks: u32,

    /// Hard cap on the file size in blocks.
    max_blocks: u32,
}

impl BlockAllocator {
    pub fn new(growth_blocks: u32, max_blocks: u32) -> Self {
        Self {
            growth_blocks,
            max_blocks,
        }
    }

    /// An allocator that never grows the file.
    pub fn fixed() -> Self {
        Self::new(0, u32::MAX)
    }

    /// Obtains a block id for a new allocation.
    ///
    /// Pops the head of the free list if there is one, otherwise advances
    /// `last_block` and initializes the new block with
    /// [`BlockStore::allocate_raw_block`].
    ///
    /// # Errors
    ///
    /// - [`StorageError::AllocationExhausted`] if the free list is empty and
    ///   the file cannot hold another block.
    /// - [`StorageError::Corruption`] if the free-list head is not a free block.
    pub fn allocate(
        &self,
        store: &BlockStore,
        header: &mut HeaderBlock,
    ) -> Result<BlockId, StorageError> {
        if header.free_block != 0 {
            let id = header.free_block;
            let block = store.read_block_header(id)?;
            if !block.flags.contains(BlockFlags::FREE) {
                return Err(StorageError::Corruption {
                    block: id,
                    detail: format!("free-list entry has flags {:#04x}", block.flags.0),
                });
            }
            if block.next_block > header.last_block {
                return Err(StorageError::Corruption {
                    block: id,
                    detail: format!(
                        "free-list link {} beyond last block {}",
                        block.next_block, header.last_block
                    ),
                });
            }
            header.free_block = block.next_block;
            trace!(block = id, "allocated block from free list");
            return Ok(id);
        }

        let block_count = store.block_count()?;
        let id = header
            .last_block
            .checked_add(1)
            .ok_or(StorageError::AllocationExhausted {
                last_block: header.last_block,
                capacity: block_count,
            })?;

        if id >= block_count {
            self.grow_for(store, header, id, block_count)?;
        }

        store.allocate_raw_block(id)?;
        header.last_block = id;
        trace!(block = id, "allocated block past high-water mark");
        Ok(id)
    }

    /// Grows the file so that block `id` becomes addressable.
    fn grow_for(
        &self,
        store: &BlockStore,
        header: &HeaderBlock,
        id: BlockId,
        block_count: u32,
    ) -> Result<(), StorageError> {
        let step = self
            .growth_blocks
            .min(self.max_blocks.saturating_sub(block_count));
        if step == 0 || id >= block_count.saturating_add(step) {
            return Err(StorageError::AllocationExhausted {
                last_block: header.last_block,
                capacity: if self.growth_blocks == 0 {
                    block_count
                } else {
                    self.max_blocks.max(block_count)
                },
            });
        }
        store.grow(step)?;
        Ok(())
    }

    /// Returns `id` to the free list.
    ///
    /// The block's header becomes `{next_block: old free head, flags: FREE}`
    /// and `header.free_block` points at it. The caller must already have
    /// established that no snapshot can still reach the block.
    pub fn release(
        &self,
        store: &BlockStore,
        header: &mut HeaderBlock,
        id: BlockId,
    ) -> Result<(), StorageError> {
        if id == 0 || id > header.last_block || id == header.current_data_block {
            return Err(StorageError::Internal(format!(
                "refusing to release block {id} (last block {}, current data block {})",
                header.last_block, header.current_data_block
            )));
        }

        store.write_block_header(&BlockHeader {
            id,
            next_block: header.free_block,
            flags: BlockFlags::FREE,
            num_records: 0,
        })?;
        header.free_block = id;
        trace!(block = id, "released block to free list");
        Ok(())
    }

    /// Releases a data block together with every overflow block chained
    /// from it. Returns how many blocks were freed.
    pub fn release_chain(
        &self,
        store: &BlockStore,
        header: &mut HeaderBlock,
        id: BlockId,
    ) -> Result<usize, StorageError> {
        let mut chain = vec![id];
        let mut next = store.read_block_header(id)?.next_block;
        while next != 0 {
            if chain.len() > header.last_block as usize {
                return Err(StorageError::Corruption {
                    block: id,
                    detail: "overflow chain does not terminate".into(),
                });
            }
            let block = store.read_block_header(next)?;
            if !block.flags.contains(BlockFlags::OVERFLOW) {
                return Err(StorageError::Corruption {
                    block: next,
                    detail: "chained block is not an overflow block".into(),
                });
            }
            chain.push(next);
            next = block.next_block;
        }

        for block in &chain {
            self.release(store, header, *block)?;
        }
        Ok(chain.len())
    }
}

/// Walks the free list from `header.free_block`.
///
/// Fails with [`StorageError::Corruption`] on a cycle or a non-free entry.
pub fn free_blocks(store: &BlockStore, header: &HeaderBlock) -> Result<Vec<BlockId>, StorageError> {
    let mut seen = HashSet::new();
    let mut blocks = Vec::new();
    let mut next = header.free_block;
    while next != 0 {
        if !seen.insert(next) {
            return Err(StorageError::Corruption {
                block: next,
                detail: "free list contains a cycle".into(),
            });
        }
        let block = store.read_block_header(next)?;
        if !block.flags.contains(BlockFlags::FREE) {
            return Err(StorageError::Corruption {
                block: next,
                detail: "free-list entry is not marked free".into(),
            });
        }
        blocks.push(next);
        next = block.next_block;
    }
    Ok(blocks)
}
