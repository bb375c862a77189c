//! Block Store
//!
//! Maps the data file into memory once and translates block ids into byte
//! ranges of that mapping.
//!
//! # Concurrency model
//!
//! The mapping sits behind an `RwLock`. Every load copies bytes out under a
//! short read guard and every store copies bytes in under a short write
//! guard, so no reference into the mapping ever escapes this module. This
//! keeps a concurrent reader from observing a torn field while the single
//! writer is mutating a block, and lets [`BlockStore::grow`] replace the
//! mapping without invalidating anyone.
//!
//! The store itself has no notion of transactions: the caller decides when
//! a [`write_header`](BlockStore::write_header) publishes a set of changes.
//!
//! # Lifecycle
//!
//! [`BlockStore::close`] flushes the mapping, unmaps it and closes the file
//! handle in one step. Every later call fails with [`StorageError::Closed`].
//!
//! # Durability
//!
//! Every store records the touched block in a dirty set. [`BlockStore::sync`]
//! flushes exactly those block ranges; it is called before a header publish
//! so the header never points at bytes that are not yet on disk.

#[cfg(test)]
pub(crate) mod tests;

use std::{
    collections::BTreeSet,
    fs::{File, OpenOptions},
    io,
    ops::Range,
    path::{Path, PathBuf},
    sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use memmap2::{MmapMut, MmapOptions};
use thiserror::Error;
use tracing::{info, trace, warn};

use crate::format::{
    BLOCK_HEADER_SIZE, BLOCK_SIZE, BlockHeader, BlockId, FormatError, HEADER_REGION_SIZE,
    HeaderRegion,
};

/// Smallest usable file: the header block plus one data block.
pub const MIN_BLOCKS: u32 = 2;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by the storage layer (store, allocator, records, visibility).
#[derive(Debug, Error)]
pub enum StorageError {
    /// The file is too small or not in the expected format.
    #[error("invalid file: {0}")]
    InvalidFile(String),

    /// The platform refused to map the file.
    #[error("failed to map file: {0}")]
    Mapping(#[source] io::Error),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A block's contents contradict its position or role.
    #[error("corruption in block {block}: {detail}")]
    Corruption {
        /// Block that failed validation.
        block: BlockId,
        /// What was wrong with it.
        detail: String,
    },

    /// An overflow chain ended before the record's declared bytes were read.
    #[error(
        "record at block {block} offset {offset} truncated: chain ended after {read} of {needed} bytes"
    )]
    TruncatedRecord {
        /// Block the record starts in.
        block: BlockId,
        /// Offset of the record in that block.
        offset: usize,
        /// Bytes the record declares.
        needed: usize,
        /// Bytes available before the chain ended.
        read: usize,
    },

    /// Neither the free list nor the high-water mark can produce a block.
    #[error("allocation exhausted: last block {last_block}, capacity {capacity} blocks")]
    AllocationExhausted {
        /// Current high-water mark.
        last_block: BlockId,
        /// Largest number of blocks the file may hold.
        capacity: u32,
    },

    /// A block id outside the mapped region (or the header block).
    #[error("block {block} out of bounds (file has {block_count} blocks)")]
    OutOfBounds {
        /// Requested block.
        block: BlockId,
        /// Blocks currently mapped.
        block_count: u32,
    },

    /// Codec failure other than an id mismatch.
    #[error("format error: {0}")]
    Format(FormatError),

    /// The store was closed; the file is no longer mapped.
    #[error("data file is closed")]
    Closed,

    /// Poisoned lock or violated internal invariant.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<FormatError> for StorageError {
    fn from(err: FormatError) -> Self {
        match err {
            FormatError::BlockIdMismatch { expected, found } => StorageError::Corruption {
                block: expected,
                detail: format!("embedded block id is {found}"),
            },
            other => StorageError::Format(other),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Block
// ------------------------------------------------------------------------------------------------

/// A decoded copy of one block.
#[derive(Debug, Clone)]
pub struct Block {
    /// Verified block header.
    pub header: BlockHeader,

    /// Every byte after the 10-byte header.
    pub payload: Vec<u8>,
}

impl Block {
    /// Byte at `offset` from the block start lives at `payload[offset - BLOCK_HEADER_SIZE]`.
    pub fn payload_from(&self, offset: usize) -> &[u8] {
        let start = offset.saturating_sub(BLOCK_HEADER_SIZE).min(self.payload.len());
        &self.payload[start..]
    }
}

// ------------------------------------------------------------------------------------------------
// BlockStore
// ------------------------------------------------------------------------------------------------

/// The memory-mapped data file.
///
/// Owns the file handle and the mapping; both are released together by
/// [`BlockStore::close`], or on drop.
#[derive(Debug)]
pub struct BlockStore {
    /// Open read/write handle, kept for `set_len` and remapping. `None` once
    /// closed.
    file: Mutex<Option<File>>,

    /// Path of the data file.
    path: PathBuf,

    /// Shared mapping of the whole blocks of the file. `None` once closed.
    map: RwLock<Option<MmapMut>>,

    /// Blocks written since the last [`BlockStore::sync`].
    dirty: Mutex<BTreeSet<BlockId>>,
}

impl BlockStore {
    /// Creates a new zero-filled data file of `blocks` blocks and opens it.
    ///
    /// Fails if the file already exists.
    pub fn create(path: impl AsRef<Path>, blocks: u32) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if blocks < MIN_BLOCKS {
            return Err(StorageError::InvalidFile(format!(
                "a data file needs at least {MIN_BLOCKS} blocks, requested {blocks}"
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(u64::from(blocks) * BLOCK_SIZE as u64)?;
        file.sync_all()?;
        drop(file);

        info!(path = %path.display(), blocks, "created data file");
        Self::open(path)
    }

    /// Opens and maps an existing data file.
    ///
    /// # Errors
    ///
    /// - [`StorageError::InvalidFile`] if the file is smaller than two blocks.
    /// - [`StorageError::Mapping`] if the platform refuses the mapping.
    ///
    /// # Safety
    ///
    /// Uses `unsafe { MmapMut::map_mut(...) }`. The mapping is only touched
    /// through copies taken under `map`'s lock, and the file is owned by this
    /// handle; external processes modifying the file while it is open are
    /// not supported.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let len = file.metadata()?.len();
        if len < u64::from(MIN_BLOCKS) * BLOCK_SIZE as u64 {
            return Err(StorageError::InvalidFile(format!(
                "file is {len} bytes, at least {} required",
                u64::from(MIN_BLOCKS) * BLOCK_SIZE as u64
            )));
        }
        let blocks = len / BLOCK_SIZE as u64;
        if blocks > u64::from(u32::MAX) {
            return Err(StorageError::InvalidFile(format!(
                "file size {len} exceeds the addressable block range"
            )));
        }
        let tail = len % BLOCK_SIZE as u64;
        if tail != 0 {
            warn!(path = %path.display(), tail, "ignoring bytes past the last whole block");
        }

        let map = unsafe {
            MmapOptions::new()
                .len((blocks * BLOCK_SIZE as u64) as usize)
                .map_mut(&file)
        }
        .map_err(StorageError::Mapping)?;

        info!(path = %path.display(), bytes = len, blocks, "mapped data file");

        Ok(Self {
            file: Mutex::new(Some(file)),
            path: path.to_path_buf(),
            map: RwLock::new(Some(map)),
            dirty: Mutex::new(BTreeSet::new()),
        })
    }

    /// Flushes the mapping, then unmaps it and closes the file handle.
    ///
    /// Closing an already closed store does nothing. If the flush fails the
    /// store stays open.
    pub fn close(&self) -> Result<(), StorageError> {
        let mut map = self.write_map()?;
        let Some(mapping) = map.as_ref() else {
            return Ok(());
        };
        mapping.flush()?;
        *map = None;
        drop(map);

        self.file
            .lock()
            .map_err(|_| StorageError::Internal("file mutex poisoned".into()))?
            .take();
        if let Ok(mut dirty) = self.dirty.lock() {
            dirty.clear();
        }
        info!(path = %self.path.display(), "closed data file");
        Ok(())
    }

    /// Path of the data file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    // --------------------------------------------------------------------------------------------
    // Lock helpers
    // --------------------------------------------------------------------------------------------

    fn read_map(&self) -> Result<RwLockReadGuard<'_, Option<MmapMut>>, StorageError> {
        self.map
            .read()
            .map_err(|_| StorageError::Internal("map RwLock poisoned".into()))
    }

    fn write_map(&self) -> Result<RwLockWriteGuard<'_, Option<MmapMut>>, StorageError> {
        self.map
            .write()
            .map_err(|_| StorageError::Internal("map RwLock poisoned".into()))
    }

    fn mapped(slot: &Option<MmapMut>) -> Result<&MmapMut, StorageError> {
        slot.as_ref().ok_or(StorageError::Closed)
    }

    fn mapped_mut(slot: &mut Option<MmapMut>) -> Result<&mut MmapMut, StorageError> {
        slot.as_mut().ok_or(StorageError::Closed)
    }

    fn mark_dirty(&self, id: BlockId) -> Result<(), StorageError> {
        self.dirty
            .lock()
            .map_err(|_| StorageError::Internal("dirty set mutex poisoned".into()))?
            .insert(id);
        Ok(())
    }

    /// Byte range of block `id`, rejecting the header block and ids past
    /// the end of the mapping.
    fn block_range(id: BlockId, map_len: usize) -> Result<Range<usize>, StorageError> {
        let block_count = (map_len / BLOCK_SIZE) as u32;
        if id == 0 || id >= block_count {
            return Err(StorageError::OutOfBounds {
                block: id,
                block_count,
            });
        }
        let start = id as usize * BLOCK_SIZE;
        Ok(start..start + BLOCK_SIZE)
    }

    /// Number of blocks currently mapped, header block included.
    pub fn block_count(&self) -> Result<u32, StorageError> {
        Ok((Self::mapped(&*self.read_map()?)?.len() / BLOCK_SIZE) as u32)
    }

    // --------------------------------------------------------------------------------------------
    // Header block
    // --------------------------------------------------------------------------------------------

    /// Reads the published header region.
    ///
    /// Returns `Ok(None)` for a file whose header was never written.
    pub fn read_header(&self) -> Result<Option<HeaderRegion>, StorageError> {
        let mut raw = [0u8; HEADER_REGION_SIZE];
        raw.copy_from_slice(&Self::mapped(&*self.read_map()?)?[..HEADER_REGION_SIZE]);

        match HeaderRegion::decode(&raw) {
            Ok(region) => Ok(region),
            Err(FormatError::ChecksumMismatch) => Err(StorageError::InvalidFile(
                "header checksum mismatch".into(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Publishes a header region at offset 0.
    ///
    /// This is the commit point: the region is copied in a single store, so
    /// a reader either sees all of the old values or all of the new ones.
    /// With `durable` the header range is flushed before returning.
    pub fn write_header(&self, region: &HeaderRegion, durable: bool) -> Result<(), StorageError> {
        let bytes = region.encode()?;
        {
            let mut guard = self.write_map()?;
            Self::mapped_mut(&mut guard)?[..HEADER_REGION_SIZE].copy_from_slice(&bytes);
        }

        if durable {
            Self::mapped(&*self.read_map()?)?.flush_range(0, HEADER_REGION_SIZE)?;
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Data blocks
    // --------------------------------------------------------------------------------------------

    /// Reads block `id` and verifies its self-identifying id.
    ///
    /// # Errors
    ///
    /// - [`StorageError::OutOfBounds`] for block 0 or ids past the end.
    /// - [`StorageError::Corruption`] if the embedded id differs from `id`.
    pub fn read_block(&self, id: BlockId) -> Result<Block, StorageError> {
        let raw = {
            let guard = self.read_map()?;
            let map = Self::mapped(&guard)?;
            let range = Self::block_range(id, map.len())?;
            map[range].to_vec()
        };

        let header = BlockHeader::decode_checked(&raw, id)?;
        let mut payload = raw;
        payload.drain(..BLOCK_HEADER_SIZE);
        Ok(Block { header, payload })
    }

    /// Reads only the 10-byte header of block `id`.
    pub fn read_block_header(&self, id: BlockId) -> Result<BlockHeader, StorageError> {
        let mut raw = [0u8; BLOCK_HEADER_SIZE];
        {
            let guard = self.read_map()?;
            let map = Self::mapped(&guard)?;
            let range = Self::block_range(id, map.len())?;
            raw.copy_from_slice(&map[range.start..range.start + BLOCK_HEADER_SIZE]);
        }
        Ok(BlockHeader::decode_checked(&raw, id)?)
    }

    /// Zeroes block `id` and stamps its id, bringing it into use.
    pub fn allocate_raw_block(&self, id: BlockId) -> Result<(), StorageError> {
        let header = BlockHeader::empty(id).encode()?;
        {
            let mut guard = self.write_map()?;
            let map = Self::mapped_mut(&mut guard)?;
            let range = Self::block_range(id, map.len())?;
            let block = &mut map[range];
            block.fill(0);
            block[..BLOCK_HEADER_SIZE].copy_from_slice(&header);
        }
        self.mark_dirty(id)?;
        trace!(block = id, "initialized raw block");
        Ok(())
    }

    /// Overwrites the 10-byte header of block `header.id`.
    pub fn write_block_header(&self, header: &BlockHeader) -> Result<(), StorageError> {
        let bytes = header.encode()?;
        self.write_bytes(header.id, 0, &bytes)
    }

    /// Copies `bytes` into block `id` at `offset` from the block start.
    pub fn write_bytes(&self, id: BlockId, offset: usize, bytes: &[u8]) -> Result<(), StorageError> {
        if offset + bytes.len() > BLOCK_SIZE {
            return Err(StorageError::Internal(format!(
                "write of {} bytes at offset {offset} crosses the end of block {id}",
                bytes.len()
            )));
        }
        {
            let mut guard = self.write_map()?;
            let map = Self::mapped_mut(&mut guard)?;
            let range = Self::block_range(id, map.len())?;
            let start = range.start + offset;
            map[start..start + bytes.len()].copy_from_slice(bytes);
        }
        self.mark_dirty(id)
    }

    // --------------------------------------------------------------------------------------------
    // File size and durability
    // --------------------------------------------------------------------------------------------

    /// Extends the file by `additional` blocks and remaps it.
    ///
    /// Returns the new block count. Readers are excluded for the duration
    /// of the remap by the map write guard.
    pub fn grow(&self, additional: u32) -> Result<u32, StorageError> {
        let mut guard = self.write_map()?;
        let map = Self::mapped_mut(&mut guard)?;
        let current = (map.len() / BLOCK_SIZE) as u32;
        let target = current.checked_add(additional).ok_or_else(|| {
            StorageError::InvalidFile("block count would overflow u32".into())
        })?;

        map.flush()?;
        let file = self
            .file
            .lock()
            .map_err(|_| StorageError::Internal("file mutex poisoned".into()))?;
        let file = file.as_ref().ok_or(StorageError::Closed)?;
        file.set_len(u64::from(target) * BLOCK_SIZE as u64)?;
        *map = unsafe { MmapMut::map_mut(file) }.map_err(StorageError::Mapping)?;

        info!(path = %self.path.display(), from = current, to = target, "grew data file");
        Ok(target)
    }

    /// Flushes every block written since the previous call.
    pub fn sync(&self) -> Result<(), StorageError> {
        let dirty = std::mem::take(
            &mut *self
                .dirty
                .lock()
                .map_err(|_| StorageError::Internal("dirty set mutex poisoned".into()))?,
        );
        if dirty.is_empty() {
            return Ok(());
        }

        let guard = self.read_map()?;
        let map = Self::mapped(&guard)?;
        for id in &dirty {
            map.flush_range(*id as usize * BLOCK_SIZE, BLOCK_SIZE)?;
        }
        trace!(blocks = dirty.len(), "synced dirty blocks");
        Ok(())
    }

    /// Flushes the entire mapping.
    pub fn flush(&self) -> Result<(), StorageError> {
        Self::mapped(&*self.read_map()?)?.flush()?;
        if let Ok(mut dirty) = self.dirty.lock() {
            dirty.clear();
        }
        Ok(())
    }
}
