//! On-disk layout: header block, block headers and record encodings.
//!
//! Every structure here is serialized through the [`encoding`](crate::encoding)
//! traits in a fixed little-endian layout.
//!
//! # File layout
//!
//! ```text
//! block 0   [HEADER 20B][TRAILER 12B][reserved ..................]
//! block 1.. [ID u32][NEXT u32][FLAGS u8][NUM_RECORDS u8][RECORD][RECORD]...[free]
//! ```
//!
//! # Header region
//!
//! ```text
//! [LAST_TX i64][FREE_BLOCK u32][CURRENT_DATA_BLOCK u32][LAST_BLOCK u32]   (HeaderBlock)
//! [LIST_HEAD_BLOCK u32][LIST_HEAD_OFFSET u32][CRC32 u32]                   (trailer)
//! ```
//!
//! The trailer lives in block 0's reserved area. The CRC covers the first
//! 28 bytes. Header and trailer are always written together, in one copy,
//! which makes that write the single commit point of the database.
//!
//! # Record layout
//!
//! ```text
//! [CREATED i64][DELETED i64][PREV u32][NEXT u32][KEY_LEN u32][KEY][VALUE_LEN u32][VALUE]
//! ```
//!
//! The *head* of a record is everything up to and including `VALUE_LEN`.
//! Writers keep a record head inside the block where the record starts;
//! only value bytes may continue into overflow blocks.


use std::cmp::Ordering;

use crc32fast::Hasher as Crc32;
use thiserror::Error;

use crate::encoding::{self, Decode, Encode, EncodingError};

// ------------------------------------------------------------------------------------------------
// Identifiers
// ------------------------------------------------------------------------------------------------

/// Logical block identifier; block `id` lives at byte offset `id * BLOCK_SIZE`.
pub type BlockId = u32;

/// Monotonically increasing transaction identifier.
pub type TxId = i64;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Size of every block in the file.
pub const BLOCK_SIZE: usize = 16 * 1024;

/// Encoded size of [`HeaderBlock`].
pub const HEADER_SIZE: usize = 8 + 4 + 4 + 4;

/// Encoded size of the header trailer (list head locator + CRC32).
pub const HEADER_TRAILER_SIZE: usize = 4 + 4 + 4;

/// Bytes of block 0 written by every header publish.
pub const HEADER_REGION_SIZE: usize = HEADER_SIZE + HEADER_TRAILER_SIZE;

/// Encoded size of [`BlockHeader`].
pub const BLOCK_HEADER_SIZE: usize = 4 + 4 + 1 + 1;

/// Bytes available for records after the block header.
pub const BLOCK_PAYLOAD_SIZE: usize = BLOCK_SIZE - BLOCK_HEADER_SIZE;

/// Fixed leading fields of a record: created, deleted, prev, next.
pub const RECORD_FIXED_SIZE: usize = 8 + 8 + 4 + 4;

/// Size of a key or value length prefix.
pub const LEN_PREFIX_SIZE: usize = 4;

/// Bytes a record occupies besides its key and value.
pub const RECORD_OVERHEAD: usize = RECORD_FIXED_SIZE + 2 * LEN_PREFIX_SIZE;

/// Offset of the `deleted` field from the start of a record.
pub const RECORD_DELETED_OFFSET: usize = 8;

/// Offset of the `prev` field from the start of a record.
pub const RECORD_PREV_OFFSET: usize = 16;

/// Offset of the `next` field from the start of a record.
pub const RECORD_NEXT_OFFSET: usize = 20;

/// Largest key whose record head still fits in an empty block.
pub const MAX_KEY_LEN: usize = BLOCK_PAYLOAD_SIZE - RECORD_OVERHEAD;

/// Largest value accepted by the record decoder.
pub const MAX_VALUE_LEN: usize = encoding::MAX_BYTE_LEN as usize;

/// `num_records` is a single byte.
pub const MAX_RECORDS_PER_BLOCK: u8 = u8::MAX;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced while encoding or decoding on-disk structures.
#[derive(Debug, Error)]
pub enum FormatError {
    /// The buffer is shorter than the fixed size of the structure.
    #[error("{what} needs {needed} bytes, buffer has {available}")]
    TooShort {
        /// Structure being decoded.
        what: &'static str,
        /// Fixed encoded size.
        needed: usize,
        /// Bytes supplied.
        available: usize,
    },

    /// A block's embedded id disagrees with the id used to locate it.
    #[error("block id mismatch: expected {expected}, found {found}")]
    BlockIdMismatch {
        /// Id the caller read from.
        expected: BlockId,
        /// Id stored in the block.
        found: BlockId,
    },

    /// The header region checksum does not match its contents.
    #[error("header checksum mismatch")]
    ChecksumMismatch,

    /// Low-level encoding failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
}

fn require(what: &'static str, buf: &[u8], needed: usize) -> Result<(), FormatError> {
    if buf.len() < needed {
        return Err(FormatError::TooShort {
            what,
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Header block
// ------------------------------------------------------------------------------------------------

/// Process-wide metadata stored at offset 0 of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderBlock {
    /// Highest committed transaction.
    pub last_tx: TxId,

    /// Head of the free list, or 0 if empty.
    pub free_block: BlockId,

    /// Block currently accepting new records.
    pub current_data_block: BlockId,

    /// Highest block id ever allocated.
    pub last_block: BlockId,
}

impl HeaderBlock {
    /// Header of a freshly initialized file.
    pub fn initial() -> Self {
        Self {
            last_tx: 0,
            free_block: 0,
            current_data_block: 1,
            last_block: 0,
        }
    }

    /// Encodes into exactly [`HEADER_SIZE`] bytes.
    pub fn encode(&self) -> Result<Vec<u8>, FormatError> {
        Ok(encoding::encode_to_vec(self)?)
    }

    /// Decodes from the first [`HEADER_SIZE`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, FormatError> {
        require("header block", buf, HEADER_SIZE)?;
        let (header, _) = encoding::decode_from_slice::<Self>(buf)?;
        Ok(header)
    }
}

impl Encode for HeaderBlock {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.last_tx.encode_to(buf)?;
        self.free_block.encode_to(buf)?;
        self.current_data_block.encode_to(buf)?;
        self.last_block.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for HeaderBlock {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (last_tx, n) = i64::decode_from(&buf[off..])?;
        off += n;
        let (free_block, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (current_data_block, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (last_block, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                last_tx,
                free_block,
                current_data_block,
                last_block,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Header region (header + trailer)
// ------------------------------------------------------------------------------------------------

/// Position of a record: the block it starts in and its byte offset from
/// the start of that block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordLocator {
    /// Starting block.
    pub block: BlockId,
    /// Offset from the block start (≥ [`BLOCK_HEADER_SIZE`]).
    pub offset: usize,
}

/// Everything published by a single header write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderRegion {
    /// The 20-byte header block.
    pub header: HeaderBlock,

    /// First record of the logical record list, if any.
    pub list_head: Option<RecordLocator>,
}

impl HeaderRegion {
    /// Encodes header and trailer into [`HEADER_REGION_SIZE`] bytes, with
    /// the CRC32 of the first 28 bytes in the last four.
    pub fn encode(&self) -> Result<Vec<u8>, FormatError> {
        let mut buf = self.header.encode()?;
        let (block, offset) = match self.list_head {
            Some(loc) => (loc.block, encoding::len_to_u32(loc.offset)?),
            None => (0, 0),
        };
        block.encode_to(&mut buf)?;
        offset.encode_to(&mut buf)?;

        let mut hasher = Crc32::new();
        hasher.update(&buf);
        hasher.finalize().encode_to(&mut buf)?;
        Ok(buf)
    }

    /// Decodes a header region.
    ///
    /// Returns `Ok(None)` if every byte is zero (a file that was never
    /// initialized) and [`FormatError::ChecksumMismatch`] if the trailer
    /// CRC does not match.
    pub fn decode(buf: &[u8]) -> Result<Option<Self>, FormatError> {
        require("header region", buf, HEADER_REGION_SIZE)?;
        let region = &buf[..HEADER_REGION_SIZE];
        if region.iter().all(|&b| b == 0) {
            return Ok(None);
        }

        let header = HeaderBlock::decode(region)?;
        let mut off = HEADER_SIZE;
        let (head_block, n) = u32::decode_from(&region[off..])?;
        off += n;
        let (head_offset, n) = u32::decode_from(&region[off..])?;
        off += n;
        let (checksum, _) = u32::decode_from(&region[off..])?;

        let mut hasher = Crc32::new();
        hasher.update(&region[..off]);
        if hasher.finalize() != checksum {
            return Err(FormatError::ChecksumMismatch);
        }

        let list_head = (head_block != 0).then_some(RecordLocator {
            block: head_block,
            offset: head_offset as usize,
        });
        Ok(Some(Self { header, list_head }))
    }
}

// ------------------------------------------------------------------------------------------------
// Block header
// ------------------------------------------------------------------------------------------------

/// Role/state bits of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockFlags(pub u8);

impl BlockFlags {
    /// Holds records that begin in this block.
    pub const DATA: Self = Self(0x01);
    /// Holds continuation bytes of a record that began in an earlier block.
    pub const OVERFLOW: Self = Self(0x02);
    /// Member of the free list.
    pub const FREE: Self = Self(0x04);
    /// Unlinked from the record list, waiting for older snapshots to finish.
    pub const RETIRED: Self = Self(0x08);

    /// Freshly zeroed block with no role yet.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// True if every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Bitwise union.
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// The 10-byte prefix of every data, overflow or free block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Self-identifying id; must match the block's position.
    pub id: BlockId,

    /// Overflow continuation or next free block, 0 if none.
    pub next_block: BlockId,

    /// Role of the block.
    pub flags: BlockFlags,

    /// Records whose head begins in this block.
    pub num_records: u8,
}

impl BlockHeader {
    /// Header of a freshly zeroed block.
    pub fn empty(id: BlockId) -> Self {
        Self {
            id,
            next_block: 0,
            flags: BlockFlags::empty(),
            num_records: 0,
        }
    }

    /// Encodes into exactly [`BLOCK_HEADER_SIZE`] bytes.
    pub fn encode(&self) -> Result<Vec<u8>, FormatError> {
        Ok(encoding::encode_to_vec(self)?)
    }

    /// Decodes a block header and verifies it belongs to `expected`.
    pub fn decode_checked(buf: &[u8], expected: BlockId) -> Result<Self, FormatError> {
        require("block header", buf, BLOCK_HEADER_SIZE)?;
        let (header, _) = encoding::decode_from_slice::<Self>(buf)?;
        if header.id != expected {
            return Err(FormatError::BlockIdMismatch {
                expected,
                found: header.id,
            });
        }
        Ok(header)
    }
}

impl Encode for BlockHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.id.encode_to(buf)?;
        self.next_block.encode_to(buf)?;
        self.flags.0.encode_to(buf)?;
        self.num_records.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for BlockHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (id, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (next_block, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (flags, n) = u8::decode_from(&buf[off..])?;
        off += n;
        let (num_records, n) = u8::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                id,
                next_block,
                flags: BlockFlags(flags),
                num_records,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Records
// ------------------------------------------------------------------------------------------------

/// One versioned key/value entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record {
    /// Position within the owning block (not persisted).
    pub offset: usize,
    /// Transaction that produced this version.
    pub created: TxId,
    /// Transaction that superseded or removed it, 0 if live.
    pub deleted: TxId,
    /// Block of the previous record in list order, 0 if none.
    pub prev: BlockId,
    /// Block of the next record in list order, 0 if none.
    pub next: BlockId,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Record {
    /// A new, unlinked, live version.
    pub fn new(key: Vec<u8>, value: Vec<u8>, created: TxId) -> Self {
        Self {
            created,
            key,
            value,
            ..Self::default()
        }
    }

    /// Total encoded size.
    pub fn encoded_len(&self) -> usize {
        RECORD_OVERHEAD + self.key.len() + self.value.len()
    }

    /// Encoded size of the head (everything before the value bytes).
    pub fn head_len(&self) -> usize {
        RECORD_OVERHEAD + self.key.len()
    }
}

impl Encode for Record {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.created.encode_to(buf)?;
        self.deleted.encode_to(buf)?;
        self.prev.encode_to(buf)?;
        self.next.encode_to(buf)?;
        self.key.encode_to(buf)?;
        self.value.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for Record {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (fixed, mut off) = FixedFields::decode_from(buf)?;
        let (key, n) = <Vec<u8>>::decode_from(&buf[off..])?;
        off += n;
        let (value, n) = <Vec<u8>>::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                offset: 0,
                created: fixed.created,
                deleted: fixed.deleted,
                prev: fixed.prev,
                next: fixed.next,
                key,
                value,
            },
            off,
        ))
    }
}

/// The four fixed-width leading fields of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedFields {
    pub created: TxId,
    pub deleted: TxId,
    pub prev: BlockId,
    pub next: BlockId,
}

impl Decode for FixedFields {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        encoding::require(buf, RECORD_FIXED_SIZE)?;
        let mut off = 0;
        let (created, n) = i64::decode_from(&buf[off..])?;
        off += n;
        let (deleted, n) = i64::decode_from(&buf[off..])?;
        off += n;
        let (prev, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (next, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                created,
                deleted,
                prev,
                next,
            },
            off,
        ))
    }
}

/// A record without its value bytes, as produced by block scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHead {
    /// Block the record starts in.
    pub block: BlockId,
    /// Offset from the block start.
    pub offset: usize,
    pub created: TxId,
    pub deleted: TxId,
    pub prev: BlockId,
    pub next: BlockId,
    pub key: Vec<u8>,
    /// Declared value length.
    pub value_len: usize,
}

impl RecordHead {
    /// Locator of this record.
    pub fn locator(&self) -> RecordLocator {
        RecordLocator {
            block: self.block,
            offset: self.offset,
        }
    }

    /// Total encoded size of the full record.
    pub fn encoded_len(&self) -> usize {
        RECORD_OVERHEAD + self.key.len() + self.value_len
    }

    /// Position of this record in list order: key ascending, then newest
    /// version first.
    pub fn list_cmp(&self, key: &[u8], created: TxId) -> Ordering {
        self.key
            .as_slice()
            .cmp(key)
            .then_with(|| created.cmp(&self.created))
    }
}
