//! # BlockmapDB
//!
//! An embeddable, single-file key-value store built on a **memory-mapped
//! file of fixed 16 KiB blocks**. Records carry the transaction that created
//! them and the transaction that deleted them, so readers get consistent
//! **MVCC snapshots** without ever blocking the writer.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use blockmapdb::{Db, DbConfig};
//!
//! let db = Db::create("/tmp/my.db", 16, DbConfig::default()).unwrap();
//!
//! // Write
//! let tx = db.put(b"hello", b"world").unwrap();
//!
//! // Read at a snapshot
//! let snapshot = db.begin_snapshot().unwrap();
//! assert_eq!(snapshot.tx(), tx);
//! assert_eq!(db.get(b"hello", &snapshot).unwrap(), Some(b"world".to_vec()));
//!
//! // Delete; the old snapshot still sees the value
//! db.delete(b"hello").unwrap();
//! assert_eq!(db.get_latest(b"hello").unwrap(), None);
//! assert_eq!(db.get(b"hello", &snapshot).unwrap(), Some(b"world".to_vec()));
//!
//! // Scan
//! db.put(b"a", b"1").unwrap();
//! db.put(b"b", b"2").unwrap();
//! let now = db.begin_snapshot().unwrap();
//! let pairs: Vec<_> = db.scan(&now).unwrap().collect::<Result<_, _>>().unwrap();
//! assert_eq!(pairs.len(), 2);
//!
//! // Give space held by dead versions back to the free list
//! drop((snapshot, now));
//! db.reclaim().unwrap();
//!
//! db.close().unwrap();
//! ```
//!
//! ## Features
//!
//! - **Single file**: block 0 holds the header; every other block is data,
//!   overflow or free.
//! - **Snapshot reads**: readers see exactly the transactions committed
//!   before their snapshot, however many commits follow.
//! - **Large values**: records that do not fit a block continue in chained
//!   overflow blocks.
//! - **Space reuse**: blocks whose versions no snapshot can see are
//!   returned to a free list.
//! - **CRC32 header**: the commit point is a single checksummed header write.

#![allow(dead_code)]

pub(crate) mod encoding;
pub(crate) mod engine;
pub(crate) mod format;
pub(crate) mod freelist;
pub(crate) mod mvcc;
pub(crate) mod record;
pub(crate) mod recovery;
pub(crate) mod store;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use engine::{Engine, EngineConfig, EngineScan};
use thiserror::Error;
use tracing::{error, info};

pub use encoding::EncodingError;
pub use engine::{EngineError, EngineStats as Stats, KeyValue, ReclaimStats};
pub use format::{BLOCK_SIZE, BlockId, FormatError, MAX_KEY_LEN, MAX_VALUE_LEN, TxId};
pub use mvcc::Snapshot;
pub use store::{MIN_BLOCKS, StorageError};

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Db`] instance.
///
/// All fields have sensible defaults via [`DbConfig::default()`].
/// The configuration is validated when passed to [`Db::create`] or
/// [`Db::open`].
///
/// # Example
///
/// ```rust
/// use blockmapdb::DbConfig;
///
/// // Use defaults (grow by 64 blocks, fsync every commit)
/// let config = DbConfig::default();
///
/// // Or customize
/// let config = DbConfig {
///     growth_blocks: 0,
///     sync_on_commit: false,
///     ..DbConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Blocks appended to the file when every block is in use.
    ///
    /// Default: 64. `0` keeps the file at its initial size, so writes fail
    /// with `AllocationExhausted` once it is full.
    pub growth_blocks: u32,

    /// Upper bound on the file size, in blocks.
    ///
    /// Default: 1 Mi blocks (16 GiB). Must be ≥ 2 and ≥ `growth_blocks`.
    pub max_blocks: u32,

    /// Flush written blocks and the header to disk on every commit.
    ///
    /// Default: `true`.
    pub sync_on_commit: bool,

    /// Run a reclamation round after every delete.
    ///
    /// Default: `false`.
    pub reclaim_on_delete: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            growth_blocks: engine.growth_blocks,
            max_blocks: engine.max_blocks,
            sync_on_commit: engine.sync_on_commit,
            reclaim_on_delete: engine.reclaim_on_delete,
        }
    }
}

impl DbConfig {
    /// Validates all configuration parameters.
    fn validate(&self) -> Result<(), DbError> {
        if self.max_blocks < MIN_BLOCKS {
            return Err(DbError::InvalidConfig(format!(
                "max_blocks must be >= {MIN_BLOCKS}"
            )));
        }
        if self.growth_blocks > self.max_blocks {
            return Err(DbError::InvalidConfig(
                "growth_blocks must be <= max_blocks".into(),
            ));
        }
        Ok(())
    }

    /// Converts to the internal engine configuration.
    fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            growth_blocks: self.growth_blocks,
            max_blocks: self.max_blocks,
            sync_on_commit: self.sync_on_commit,
            reclaim_on_delete: self.reclaim_on_delete,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Db`] operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// The database has been closed.
    #[error("database is closed")]
    Closed,

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Key or value constraint violated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `delete` found no live version of the key.
    #[error("key not found")]
    KeyNotFound,

    /// An engine-internal error occurred.
    #[error("{0}")]
    Engine(EngineError),
}

impl From<EngineError> for DbError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::KeyNotFound => DbError::KeyNotFound,
            other => DbError::Engine(other),
        }
    }
}

impl DbError {
    /// The storage-level cause, if this error came from the data file.
    pub fn storage(&self) -> Option<&StorageError> {
        match self {
            DbError::Engine(EngineError::Storage(e)) => Some(e),
            _ => None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Database handle
// ------------------------------------------------------------------------------------------------

/// The main database handle.
///
/// # Thread safety
///
/// `Db` is `Send + Sync`; share it across threads via `Arc<Db>`. Writes are
/// serialized internally. Reads never wait for a writer.
///
/// # Shutdown
///
/// Call [`Db::close`] to flush the mapping and get any error back. If the
/// handle is dropped without calling `close`, the destructor flushes and
/// logs failures.
pub struct Db {
    engine: Engine,
    closed: AtomicBool,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("path", &self.engine.path())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Db {
    /// Creates a new data file of `blocks` blocks (header block included)
    /// and opens it.
    ///
    /// # Errors
    ///
    /// - [`DbError::InvalidConfig`] if `config` is out of range or `blocks`
    ///   exceeds `config.max_blocks`.
    /// - [`StorageError::InvalidFile`] if `blocks < 2`, and an I/O error if
    ///   the file already exists.
    pub fn create(path: impl AsRef<Path>, blocks: u32, config: DbConfig) -> Result<Self, DbError> {
        config.validate()?;
        if blocks > config.max_blocks {
            return Err(DbError::InvalidConfig(format!(
                "initial size of {blocks} blocks exceeds max_blocks {}",
                config.max_blocks
            )));
        }

        let engine = Engine::create(&path, blocks, config.to_engine_config())?;
        info!(path = %path.as_ref().display(), blocks, "database created");
        Ok(Self::from_engine(engine))
    }

    /// Opens an existing data file.
    ///
    /// A file whose header block is all zeroes is initialized as an empty
    /// database.
    ///
    /// # Errors
    ///
    /// - [`DbError::InvalidConfig`] if `config` is out of range.
    /// - [`StorageError::InvalidFile`] if the file is smaller than two blocks
    ///   or its header is damaged. Bytes past the last whole block are
    ///   ignored.
    pub fn open(path: impl AsRef<Path>, config: DbConfig) -> Result<Self, DbError> {
        config.validate()?;
        let engine = Engine::open(&path, config.to_engine_config())?;
        info!(path = %path.as_ref().display(), "database opened");
        Ok(Self::from_engine(engine))
    }

    fn from_engine(engine: Engine) -> Self {
        Self {
            engine,
            closed: AtomicBool::new(false),
        }
    }

    /// Flushes the mapping to disk, then unmaps the file and closes its
    /// handle.
    ///
    /// Subsequent operations on this handle return [`DbError::Closed`].
    /// Calling `close` more than once is harmless.
    pub fn close(&self) -> Result<(), DbError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.engine.close()?;
        info!("database closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Write operations
    // --------------------------------------------------------------------------------------------

    /// Writes `value` under `key` and returns the committing transaction id.
    ///
    /// A live version of `key` is superseded; snapshots taken before this
    /// call keep seeing it.
    ///
    /// # Errors
    ///
    /// - [`DbError::InvalidArgument`] if `key` is empty or longer than
    ///   [`MAX_KEY_LEN`], or `value` is longer than [`MAX_VALUE_LEN`].
    /// - [`StorageError::AllocationExhausted`] if the file is full. Nothing
    ///   is written in that case.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<TxId, DbError> {
        self.check_open()?;
        check_key(key)?;
        if value.len() > MAX_VALUE_LEN {
            return Err(DbError::InvalidArgument(format!(
                "value of {} bytes exceeds {MAX_VALUE_LEN}",
                value.len()
            )));
        }

        Ok(self.engine.put(key.to_vec(), value.to_vec())?)
    }

    /// Deletes the live version of `key` and returns the committing
    /// transaction id.
    ///
    /// # Errors
    ///
    /// - [`DbError::InvalidArgument`] if `key` is empty or too long.
    /// - [`DbError::KeyNotFound`] if `key` has no live version. No
    ///   transaction id is consumed.
    pub fn delete(&self, key: &[u8]) -> Result<TxId, DbError> {
        self.check_open()?;
        check_key(key)?;

        Ok(self.engine.delete(key.to_vec())?)
    }

    // --------------------------------------------------------------------------------------------
    // Read operations
    // --------------------------------------------------------------------------------------------

    /// Takes a read snapshot at the last committed transaction.
    ///
    /// The snapshot pins every version it can see until it is dropped.
    pub fn begin_snapshot(&self) -> Result<Snapshot, DbError> {
        self.check_open()?;
        Ok(self.engine.begin_snapshot()?)
    }

    /// The value of `key` as of `snapshot`.
    ///
    /// Returns `Ok(None)` if the key did not exist or was deleted at that
    /// point.
    pub fn get(&self, key: &[u8], snapshot: &Snapshot) -> Result<Option<Vec<u8>>, DbError> {
        self.check_open()?;
        check_key(key)?;
        Ok(self.engine.get(key, snapshot)?)
    }

    /// The latest committed value of `key`, read through a short-lived
    /// snapshot.
    pub fn get_latest(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        let snapshot = self.begin_snapshot()?;
        self.get(key, &snapshot)
    }

    /// Lazily iterates every key/value pair visible at `snapshot`, in
    /// ascending key order.
    ///
    /// Writes committed while the scan is in progress are not observed.
    pub fn scan<'a>(&'a self, snapshot: &'a Snapshot) -> Result<Scan<'a>, DbError> {
        self.check_open()?;
        Ok(Scan {
            inner: self.engine.scan(snapshot)?,
        })
    }

    // --------------------------------------------------------------------------------------------
    // Maintenance
    // --------------------------------------------------------------------------------------------

    /// Returns blocks that hold only versions no snapshot can see to the
    /// free list.
    ///
    /// Blocks that active snapshots might still be reading are set aside and
    /// released by a later call once those snapshots have been dropped.
    pub fn reclaim(&self) -> Result<ReclaimStats, DbError> {
        self.check_open()?;
        Ok(self.engine.reclaim()?)
    }

    /// File and record statistics.
    pub fn stats(&self) -> Result<Stats, DbError> {
        self.check_open()?;
        Ok(self.engine.stats()?)
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    /// Returns `Err(DbError::Closed)` if the database has been closed.
    fn check_open(&self) -> Result<(), DbError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DbError::Closed);
        }
        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire)
            && let Err(e) = self.engine.close()
        {
            error!(path = %self.engine.path().display(), "flush on drop failed: {e}");
        }
    }
}

fn check_key(key: &[u8]) -> Result<(), DbError> {
    if key.is_empty() {
        return Err(DbError::InvalidArgument("key must not be empty".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(DbError::InvalidArgument(format!(
            "key of {} bytes exceeds {MAX_KEY_LEN}",
            key.len()
        )));
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Scan iterator
// ------------------------------------------------------------------------------------------------

/// Iterator returned by [`Db::scan`].
#[derive(Debug)]
pub struct Scan<'a> {
    inner: EngineScan<'a>,
}

impl Iterator for Scan<'_> {
    type Item = Result<KeyValue, DbError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|item| item.map_err(DbError::from))
    }
}
