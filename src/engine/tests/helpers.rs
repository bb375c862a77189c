use std::path::PathBuf;

use tempfile::TempDir;

use crate::engine::{Engine, EngineConfig};
pub use crate::store::tests::helpers::{init_tracing, poke};

/// Path of the data file inside a scratch directory.
pub fn db_path(tmp: &TempDir) -> PathBuf {
    tmp.path().join("engine.db")
}

/// Growable file, no fsync: the default for functional tests.
pub fn test_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        growth_blocks: 8,
        max_blocks: 4096,
        sync_on_commit: false,
        reclaim_on_delete: false,
    }
}

/// A file that never grows past its initial size.
pub fn fixed_config() -> EngineConfig {
    EngineConfig {
        growth_blocks: 0,
        ..test_config()
    }
}

/// Creates an engine on a fresh `blocks`-block file.
pub fn fresh_engine(tmp: &TempDir, blocks: u32, config: EngineConfig) -> Engine {
    Engine::create(db_path(tmp), blocks, config).expect("create engine")
}

/// Latest committed value of `key`.
pub fn get_latest(engine: &Engine, key: &[u8]) -> Option<Vec<u8>> {
    let snapshot = engine.begin_snapshot().unwrap();
    engine.get(key, &snapshot).unwrap()
}
