//! Record Engine
//!
//! Places encoded records into data blocks and reads them back.
//!
//! ## Placement
//!
//! New records are appended at the bump pointer of the current data block
//! (a [`WriteCursor`]). The record *head* (fixed fields, key and value length)
//! always lies entirely inside the block the record starts in. Value bytes
//! that do not fit continue in `OVERFLOW` blocks chained through
//! `next_block`. Only the last record of a data block may overflow, and no
//! record ever starts inside an overflow block: after an overflowing append
//! the last chain block becomes the current data block in a *sealed* state,
//! so the next append opens a fresh data block.
//!
//! ## Publication order
//!
//! [`append_record`] obtains every block it needs before writing anything,
//! then writes the record bytes, and increments `num_records` of the starting
//! block last. A concurrent [`scan_block`] therefore never sees a record
//! whose bytes are incomplete.

#[cfg(test)]
mod tests;

use tracing::trace;

use crate::encoding::{self, Decode, EncodingError};
use crate::format::{
    BLOCK_HEADER_SIZE, BLOCK_PAYLOAD_SIZE, BLOCK_SIZE, BlockFlags, BlockHeader, BlockId,
    FixedFields, HeaderBlock, MAX_RECORDS_PER_BLOCK, MAX_VALUE_LEN, RECORD_DELETED_OFFSET,
    RECORD_NEXT_OFFSET, RECORD_PREV_OFFSET, Record, RecordHead, RecordLocator, TxId,
};
use crate::freelist::BlockAllocator;
use crate::store::{Block, BlockStore, StorageError};

// ------------------------------------------------------------------------------------------------
// Write cursor
// ------------------------------------------------------------------------------------------------

/// Bump pointer into the current data block.
///
/// Lives only in the writer's memory; recomputed with [`write_cursor_for`]
/// after open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteCursor {
    /// Block the cursor points into.
    pub block: BlockId,

    /// First unused byte, counted from the block start.
    pub offset: usize,

    /// Records that start in `block`.
    pub num_records: u8,

    /// No further record may start in `block`.
    pub sealed: bool,
}

impl WriteCursor {
    fn sealed(block: BlockId) -> Self {
        Self {
            block,
            offset: BLOCK_SIZE,
            num_records: 0,
            sealed: true,
        }
    }

    /// True if a record head of `head_len` bytes can start at the cursor.
    pub fn accepts(&self, head_len: usize) -> bool {
        !self.sealed
            && self.num_records < MAX_RECORDS_PER_BLOCK
            && self.offset + head_len <= BLOCK_SIZE
    }
}

/// Recomputes the bump pointer of `header.current_data_block`.
///
/// A file on which nothing has been allocated yet, or whose current block is
/// an overflow block, yields a sealed cursor. Otherwise the records of the
/// block are walked to find the end of the last one.
pub fn write_cursor_for(
    store: &BlockStore,
    header: &HeaderBlock,
) -> Result<WriteCursor, StorageError> {
    let id = header.current_data_block;
    if header.last_block == 0 || id == 0 || id > header.last_block {
        return Ok(WriteCursor::sealed(id));
    }

    let block = store.read_block(id)?;
    let flags = block.header.flags;
    if flags.contains(BlockFlags::FREE) || flags.contains(BlockFlags::RETIRED) {
        return Err(StorageError::Corruption {
            block: id,
            detail: format!("current data block has flags {:#04x}", flags.0),
        });
    }
    if flags.contains(BlockFlags::OVERFLOW) {
        return Ok(WriteCursor::sealed(id));
    }

    let mut scan = BlockScan::new(block);
    for head in scan.by_ref() {
        head?;
    }
    let offset = scan.offset;
    let num_records = scan.header().num_records;
    Ok(WriteCursor {
        block: id,
        offset: offset.min(BLOCK_SIZE),
        num_records,
        sealed: offset > BLOCK_SIZE || num_records >= MAX_RECORDS_PER_BLOCK,
    })
}

// ------------------------------------------------------------------------------------------------
// Append
// ------------------------------------------------------------------------------------------------

/// Appends `record` and returns where it starts.
///
/// `header` is the writer's working copy: `current_data_block`,
/// `last_block` and `free_block` are updated in it, and the caller publishes
/// it once the whole operation has succeeded. `cursor` is advanced only on
/// success.
///
/// # Errors
///
/// [`StorageError::AllocationExhausted`] if the blocks the record needs
/// cannot all be obtained. Nothing has been written in that case.
pub fn append_record(
    store: &BlockStore,
    allocator: &BlockAllocator,
    header: &mut HeaderBlock,
    cursor: &mut WriteCursor,
    record: &Record,
) -> Result<RecordLocator, StorageError> {
    let head_len = record.head_len();
    if head_len > BLOCK_PAYLOAD_SIZE || record.value.len() > MAX_VALUE_LEN {
        return Err(StorageError::Internal(format!(
            "record with {} key bytes and {} value bytes cannot be placed",
            record.key.len(),
            record.value.len()
        )));
    }
    let bytes = encoding::encode_to_vec(record).map_err(|e| StorageError::Internal(e.to_string()))?;

    let new_start = !cursor.accepts(head_len);
    let start_offset = if new_start {
        BLOCK_HEADER_SIZE
    } else {
        cursor.offset
    };
    let first_len = bytes.len().min(BLOCK_SIZE - start_offset);
    let overflow_count = (bytes.len() - first_len).div_ceil(BLOCK_PAYLOAD_SIZE);

    // Obtain everything first: a failure here must leave the file untouched.
    let start = if new_start {
        allocator.allocate(store, header)?
    } else {
        cursor.block
    };
    let mut overflow = Vec::with_capacity(overflow_count);
    for _ in 0..overflow_count {
        overflow.push(allocator.allocate(store, header)?);
    }

    let mut start_header = if new_start {
        store.allocate_raw_block(start)?;
        BlockHeader {
            flags: BlockFlags::DATA,
            ..BlockHeader::empty(start)
        }
    } else {
        store.read_block_header(start)?
    };
    if let Some(first) = overflow.first() {
        start_header.next_block = *first;
    }
    store.write_block_header(&start_header)?;
    store.write_bytes(start, start_offset, &bytes[..first_len])?;

    let mut rest = &bytes[first_len..];
    for (i, id) in overflow.iter().enumerate() {
        let (chunk, tail) = rest.split_at(rest.len().min(BLOCK_PAYLOAD_SIZE));
        store.allocate_raw_block(*id)?;
        store.write_block_header(&BlockHeader {
            id: *id,
            next_block: overflow.get(i + 1).copied().unwrap_or(0),
            flags: BlockFlags::OVERFLOW,
            num_records: 0,
        })?;
        store.write_bytes(*id, BLOCK_HEADER_SIZE, chunk)?;
        rest = tail;
    }

    start_header.num_records += 1;
    store.write_block_header(&start_header)?;

    let next_cursor = match overflow.last() {
        Some(last) => {
            let tail_len = bytes.len() - first_len - (overflow_count - 1) * BLOCK_PAYLOAD_SIZE;
            WriteCursor {
                offset: BLOCK_HEADER_SIZE + tail_len,
                ..WriteCursor::sealed(*last)
            }
        }
        None => WriteCursor {
            block: start,
            offset: start_offset + bytes.len(),
            num_records: start_header.num_records,
            sealed: false,
        },
    };
    header.current_data_block = next_cursor.block;
    *cursor = next_cursor;

    trace!(
        block = start,
        offset = start_offset,
        len = bytes.len(),
        overflow_blocks = overflow_count,
        "appended record"
    );
    Ok(RecordLocator {
        block: start,
        offset: start_offset,
    })
}

// ------------------------------------------------------------------------------------------------
// Reads
// ------------------------------------------------------------------------------------------------

/// Decodes the head of the record at `offset` inside `block`.
///
/// Returns the head and its encoded length.
fn decode_head(block: &Block, offset: usize) -> Result<(RecordHead, usize), StorageError> {
    let id = block.header.id;
    let corrupt = move |e: EncodingError| StorageError::Corruption {
        block: id,
        detail: format!("record head at offset {offset}: {e}"),
    };
    if !(BLOCK_HEADER_SIZE..BLOCK_SIZE).contains(&offset) {
        return Err(StorageError::Corruption {
            block: id,
            detail: format!("record offset {offset} outside the block payload"),
        });
    }

    let buf = block.payload_from(offset);
    let (fixed, mut off) = FixedFields::decode_from(buf).map_err(corrupt)?;
    let (key_len, n) = encoding::decode_len_prefix(&buf[off..]).map_err(corrupt)?;
    off += n;
    encoding::require(&buf[off..], key_len).map_err(corrupt)?;
    let key = buf[off..off + key_len].to_vec();
    off += key_len;
    let (value_len, n) = encoding::decode_len_prefix(&buf[off..]).map_err(corrupt)?;
    off += n;

    if fixed.created <= 0 || (fixed.deleted != 0 && fixed.deleted < fixed.created) {
        return Err(StorageError::Corruption {
            block: id,
            detail: format!(
                "record at offset {offset} has invalid lifetime [{}, {})",
                fixed.created, fixed.deleted
            ),
        });
    }

    Ok((
        RecordHead {
            block: id,
            offset,
            created: fixed.created,
            deleted: fixed.deleted,
            prev: fixed.prev,
            next: fixed.next,
            key,
            value_len,
        },
        off,
    ))
}

fn require_data_block(block: &Block) -> Result<(), StorageError> {
    let flags = block.header.flags;
    if !flags.contains(BlockFlags::DATA) || flags.contains(BlockFlags::FREE) {
        return Err(StorageError::Corruption {
            block: block.header.id,
            detail: format!("expected a data block, found flags {:#04x}", flags.0),
        });
    }
    Ok(())
}

/// Reads the head of the record at `loc` without its value.
pub fn read_record_head(store: &BlockStore, loc: RecordLocator) -> Result<RecordHead, StorageError> {
    let block = store.read_block(loc.block)?;
    require_data_block(&block)?;
    let (head, _) = decode_head(&block, loc.offset)?;
    trace!(block = loc.block, offset = loc.offset, "read record head");
    Ok(head)
}

/// Reads the full record starting at `offset` in block `id`.
///
/// The record is decoded as one logical byte stream: when its value runs
/// past the end of the block, reading continues in the block named by
/// `next_block`, and so on down the overflow chain.
///
/// # Errors
///
/// - [`StorageError::TruncatedRecord`] if the chain ends before the declared
///   value length has been read.
/// - [`StorageError::Corruption`] if any block on the way carries the wrong
///   id, or a continuation block is not an overflow block.
pub fn read_record_at(store: &BlockStore, id: BlockId, offset: usize) -> Result<Record, StorageError> {
    let block = store.read_block(id)?;
    require_data_block(&block)?;
    let (head, head_len) = decode_head(&block, offset)?;

    let mut value = Vec::with_capacity(head.value_len);
    let in_block = (BLOCK_SIZE - (offset + head_len)).min(head.value_len);
    value.extend_from_slice(&block.payload_from(offset + head_len)[..in_block]);

    let mut next = block.header.next_block;
    while value.len() < head.value_len {
        if next == 0 {
            return Err(StorageError::TruncatedRecord {
                block: id,
                offset,
                needed: head.encoded_len(),
                read: head_len + value.len(),
            });
        }
        let cont = store.read_block(next)?;
        if !cont.header.flags.contains(BlockFlags::OVERFLOW) {
            return Err(StorageError::Corruption {
                block: next,
                detail: format!(
                    "continuation of record at block {id} offset {offset} has flags {:#04x}",
                    cont.header.flags.0
                ),
            });
        }
        let take = (head.value_len - value.len()).min(BLOCK_PAYLOAD_SIZE);
        value.extend_from_slice(&cont.payload[..take]);
        next = cont.header.next_block;
    }

    trace!(block = id, offset, len = head.encoded_len(), "read record");
    Ok(Record {
        offset,
        created: head.created,
        deleted: head.deleted,
        prev: head.prev,
        next: head.next,
        key: head.key,
        value,
    })
}

// ------------------------------------------------------------------------------------------------
// Block scan
// ------------------------------------------------------------------------------------------------

/// Iterator over the record heads that begin in one block, in physical order.
///
/// Works on a private copy of the block taken when the scan was created, so
/// it can be cloned to restart from any point. Yields at most `num_records`
/// items and stops after the first error.
#[derive(Debug, Clone)]
pub struct BlockScan {
    block: Block,
    index: u8,
    offset: usize,
    done: bool,
}

impl BlockScan {
    fn new(block: Block) -> Self {
        let flags = block.header.flags;
        let done = !flags.contains(BlockFlags::DATA)
            || flags.contains(BlockFlags::FREE)
            || flags.contains(BlockFlags::OVERFLOW);
        Self {
            block,
            index: 0,
            offset: BLOCK_HEADER_SIZE,
            done,
        }
    }

    /// Header of the scanned block.
    pub fn header(&self) -> &BlockHeader {
        &self.block.header
    }
}

impl Iterator for BlockScan {
    type Item = Result<RecordHead, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.index >= self.block.header.num_records {
            return None;
        }
        match decode_head(&self.block, self.offset) {
            Ok((head, _)) => {
                self.index += 1;
                self.offset += head.encoded_len();
                Some(Ok(head))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Starts a scan of the records that begin in block `id`.
///
/// Free and overflow blocks yield nothing. Logical list links are not
/// followed.
pub fn scan_block(store: &BlockStore, id: BlockId) -> Result<BlockScan, StorageError> {
    Ok(BlockScan::new(store.read_block(id)?))
}

// ------------------------------------------------------------------------------------------------
// In-place field updates
// ------------------------------------------------------------------------------------------------

/// Stamps the `deleted` field of the record at `loc`.
pub fn patch_deleted(store: &BlockStore, loc: RecordLocator, tx: TxId) -> Result<(), StorageError> {
    store.write_bytes(loc.block, loc.offset + RECORD_DELETED_OFFSET, &tx.to_le_bytes())
}

/// Rewrites the `prev` link of the record at `loc`.
pub fn patch_prev(store: &BlockStore, loc: RecordLocator, prev: BlockId) -> Result<(), StorageError> {
    store.write_bytes(loc.block, loc.offset + RECORD_PREV_OFFSET, &prev.to_le_bytes())
}

/// Rewrites the `next` link of the record at `loc`.
pub fn patch_next(store: &BlockStore, loc: RecordLocator, next: BlockId) -> Result<(), StorageError> {
    store.write_bytes(loc.block, loc.offset + RECORD_NEXT_OFFSET, &next.to_le_bytes())
}
