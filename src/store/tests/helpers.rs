use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

use crate::store::BlockStore;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times. Only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Path of the data file inside a scratch directory.
pub fn data_path(tmp: &TempDir) -> PathBuf {
    tmp.path().join("data.db")
}

/// Create a zero-filled store of `blocks` blocks.
pub fn fresh_store(tmp: &TempDir, blocks: u32) -> BlockStore {
    init_tracing();
    BlockStore::create(data_path(tmp), blocks).expect("create store")
}

/// Overwrite bytes of a closed data file at an absolute offset.
pub fn poke(path: &Path, offset: u64, bytes: &[u8]) {
    let mut f = OpenOptions::new().write(true).open(path).unwrap();
    f.seek(SeekFrom::Start(offset)).unwrap();
    f.write_all(bytes).unwrap();
    f.sync_all().unwrap();
}
