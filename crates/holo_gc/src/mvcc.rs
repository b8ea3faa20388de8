//! MVCC write primitives and the version erase primitive used by GC.

use std::ops::AddAssign;

use anyhow::Context;

use crate::api::GcKey;
use crate::engine::{ReadWriter, Reader};
use crate::hlc::{Timestamp, TIMESTAMP_ENCODED_LEN};
use crate::keys;

/// Signed accounting deltas for a range. Local-keyspace data is tracked in
/// the `sys_*` fields, user data in the others.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MvccStats {
    pub key_bytes: i64,
    pub key_count: i64,
    pub val_bytes: i64,
    pub val_count: i64,
    pub sys_bytes: i64,
    pub sys_count: i64,
}

impl MvccStats {
    fn account(
        &mut self,
        key: &[u8],
        key_bytes: i64,
        key_count: i64,
        val_bytes: i64,
        val_count: i64,
    ) {
        if keys::is_local(key) {
            self.sys_bytes += key_bytes + val_bytes;
            self.sys_count += key_count;
        } else {
            self.key_bytes += key_bytes;
            self.key_count += key_count;
            self.val_bytes += val_bytes;
            self.val_count += val_count;
        }
    }
}

impl AddAssign for MvccStats {
    fn add_assign(&mut self, other: Self) {
        self.key_bytes += other.key_bytes;
        self.key_count += other.key_count;
        self.val_bytes += other.val_bytes;
        self.val_count += other.val_count;
        self.sys_bytes += other.sys_bytes;
        self.sys_count += other.sys_count;
    }
}

/// What one GC erase pass removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcCount {
    /// Keys that lost at least one version.
    pub keys: u64,
    pub versions: u64,
    pub bytes: u64,
}

impl AddAssign for GcCount {
    fn add_assign(&mut self, other: Self) {
        self.keys += other.keys;
        self.versions += other.versions;
        self.bytes += other.bytes;
    }
}

fn version_key_bytes(key: &[u8]) -> i64 {
    (key.len() + TIMESTAMP_ENCODED_LEN) as i64
}

/// Write `value` for `key` at `timestamp`, maintaining `stats`.
pub fn put(
    rw: &mut dyn ReadWriter,
    stats: &mut MvccStats,
    key: &[u8],
    timestamp: Timestamp,
    value: &[u8],
) -> anyhow::Result<()> {
    anyhow::ensure!(!timestamp.is_empty(), "cannot write {key:?} at an empty timestamp");
    let versions = rw.mvcc_versions(key)?;
    match versions.iter().find(|v| v.timestamp == timestamp) {
        Some(existing) => {
            let delta = value.len() as i64 - existing.value.len() as i64;
            stats.account(key, 0, 0, delta, 0);
        }
        None => {
            let new_key = i64::from(versions.is_empty());
            stats.account(key, version_key_bytes(key), new_key, value.len() as i64, 1);
        }
    }
    rw.put_mvcc(key, timestamp, value)
}

/// Write a deletion tombstone for `key` at `timestamp`.
pub fn delete(
    rw: &mut dyn ReadWriter,
    stats: &mut MvccStats,
    key: &[u8],
    timestamp: Timestamp,
) -> anyhow::Result<()> {
    put(rw, stats, key, timestamp, &[])
}

/// Value of `key` as of `timestamp`. A tombstone reads as `None`.
pub fn get(reader: &dyn Reader, key: &[u8], timestamp: Timestamp) -> anyhow::Result<Option<Vec<u8>>> {
    let versions = reader.mvcc_versions(key)?;
    Ok(versions
        .into_iter()
        .find(|v| v.timestamp <= timestamp)
        .filter(|v| !v.is_tombstone())
        .map(|v| v.value))
}

/// Erase every version at or below each key's expiration timestamp.
///
/// `timestamp` is the batch timestamp of the GC command and bounds every
/// expiration from above. All keys of one call must be of the same kind
/// (all local or all global). Collecting the newest version of a key is only
/// allowed when it is a deletion tombstone.
pub fn garbage_collect(
    rw: &mut dyn ReadWriter,
    stats: &mut MvccStats,
    gc_keys: &[GcKey],
    timestamp: Timestamp,
) -> anyhow::Result<GcCount> {
    let mut count = GcCount::default();
    let Some(first) = gc_keys.first() else {
        return Ok(count);
    };
    let local = keys::is_local(&first.key);
    anyhow::ensure!(
        gc_keys.iter().all(|k| keys::is_local(&k.key) == local),
        "cannot garbage collect local and global keys in the same call"
    );

    for gc_key in gc_keys {
        anyhow::ensure!(
            gc_key.timestamp <= timestamp,
            "gc expiration {} of {:?} is above the batch timestamp {}",
            gc_key.timestamp,
            gc_key.key,
            timestamp
        );
        let versions = rw
            .mvcc_versions(&gc_key.key)
            .with_context(|| format!("read versions of {:?}", gc_key.key))?;
        let Some(newest) = versions.first() else {
            continue;
        };
        if newest.timestamp <= gc_key.timestamp && !newest.is_tombstone() {
            anyhow::bail!(
                "request to GC non-deleted, latest value of {:?}",
                gc_key.key
            );
        }

        let total = versions.len();
        let mut erased = 0usize;
        for version in versions.iter().filter(|v| v.timestamp <= gc_key.timestamp) {
            rw.clear_mvcc(&gc_key.key, version.timestamp)?;
            let key_bytes = version_key_bytes(&gc_key.key);
            let val_bytes = version.value.len() as i64;
            erased += 1;
            let key_gone = i64::from(erased == total);
            stats.account(&gc_key.key, -key_bytes, -key_gone, -val_bytes, -1);
            count.versions += 1;
            count.bytes += (key_bytes + val_bytes) as u64;
        }
        if erased > 0 {
            count.keys += 1;
        }
    }
    Ok(count)
}
