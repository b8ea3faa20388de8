//! Shared helpers for integration tests.

use std::sync::Arc;

use holo_gc::{FjallEngine, RangeDescriptor, RangeId, Replica, Timestamp};
use tempfile::TempDir;

/// Range used by most tests: `[b, m)` with id 42.
pub const RANGE_ID: RangeId = RangeId(42);

pub fn ts(wall: u64) -> Timestamp {
    Timestamp::from_wall(wall)
}

pub fn descriptor() -> RangeDescriptor {
    RangeDescriptor::new(RANGE_ID, b"b".to_vec(), b"m".to_vec())
}

/// A fjall-backed replica living in a temporary directory.
pub struct TestRange {
    pub dir: TempDir,
    pub engine: Arc<FjallEngine>,
    pub replica: Replica<FjallEngine>,
}

impl TestRange {
    pub fn open() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let engine = Arc::new(FjallEngine::open(dir.path()).expect("open fjall engine"));
        let replica = Replica::load(descriptor(), engine.clone()).expect("load replica");
        Self {
            dir,
            engine,
            replica,
        }
    }

    /// Drop the replica and engine, then reopen both from the same directory.
    pub fn reopen(self) -> Self {
        let Self {
            dir,
            engine,
            replica,
        } = self;
        engine.persist().expect("persist before reopen");
        drop(replica);
        drop(engine);
        let engine = Arc::new(FjallEngine::open(dir.path()).expect("reopen fjall engine"));
        let replica = Replica::load(descriptor(), engine.clone()).expect("reload replica");
        Self {
            dir,
            engine,
            replica,
        }
    }

    pub fn write(&self, key: &[u8], wall: u64, value: &[u8]) {
        self.replica
            .write(key, ts(wall), value)
            .expect("write version");
    }

    pub fn version_count(&self, key: &[u8]) -> usize {
        use holo_gc::engine::Reader;
        self.engine
            .mvcc_versions(key)
            .expect("read versions")
            .len()
    }
}
