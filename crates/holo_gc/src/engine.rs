//! Versioned storage engines and write batches.
//!
//! Engines expose two keyspaces: MVCC data (one entry per `(key, timestamp)`)
//! and unversioned metadata (range state such as the GC threshold). Commands
//! never write to an engine directly; they stage mutations in a `Batch` that
//! is applied atomically once evaluation succeeds, or dropped on failure.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PersistMode};

use crate::hlc::{Timestamp, TIMESTAMP_ENCODED_LEN};

/// One stored version of a key. An empty value is a deletion tombstone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MvccVersion {
    pub timestamp: Timestamp,
    pub value: Vec<u8>,
}

impl MvccVersion {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_empty()
    }
}

pub trait Reader {
    /// All versions of `key`, newest first.
    fn mvcc_versions(&self, key: &[u8]) -> anyhow::Result<Vec<MvccVersion>>;
    fn get_unversioned(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;
}

pub trait Writer {
    fn put_mvcc(&mut self, key: &[u8], timestamp: Timestamp, value: &[u8]) -> anyhow::Result<()>;
    fn clear_mvcc(&mut self, key: &[u8], timestamp: Timestamp) -> anyhow::Result<()>;
    fn put_unversioned(&mut self, key: &[u8], value: &[u8]) -> anyhow::Result<()>;
}

pub trait ReadWriter: Reader + Writer {}

impl<T: Reader + Writer + ?Sized> ReadWriter for T {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    PutMvcc {
        key: Vec<u8>,
        timestamp: Timestamp,
        value: Vec<u8>,
    },
    ClearMvcc {
        key: Vec<u8>,
        timestamp: Timestamp,
    },
    PutUnversioned {
        key: Vec<u8>,
        value: Vec<u8>,
    },
}

pub trait Engine: Reader + Send + Sync + 'static {
    /// Apply `ops` atomically: readers observe all of them or none.
    fn apply_batch(&self, ops: Vec<BatchOp>) -> anyhow::Result<()>;
}

/// Staged mutations over an engine, readable before commit.
pub struct Batch<'a> {
    engine: &'a dyn Engine,
    ops: Vec<BatchOp>,
}

impl<'a> Batch<'a> {
    pub fn new(engine: &'a dyn Engine) -> Self {
        Self {
            engine,
            ops: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn commit(self) -> anyhow::Result<()> {
        if self.ops.is_empty() {
            return Ok(());
        }
        self.engine.apply_batch(self.ops)
    }
}

impl Reader for Batch<'_> {
    fn mvcc_versions(&self, key: &[u8]) -> anyhow::Result<Vec<MvccVersion>> {
        let mut versions = self.engine.mvcc_versions(key)?;
        for op in &self.ops {
            match op {
                BatchOp::PutMvcc {
                    key: op_key,
                    timestamp,
                    value,
                } if op_key.as_slice() == key => {
                    versions.retain(|v| v.timestamp != *timestamp);
                    versions.push(MvccVersion {
                        timestamp: *timestamp,
                        value: value.clone(),
                    });
                }
                BatchOp::ClearMvcc {
                    key: op_key,
                    timestamp,
                } if op_key.as_slice() == key => {
                    versions.retain(|v| v.timestamp != *timestamp);
                }
                _ => {}
            }
        }
        versions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(versions)
    }

    fn get_unversioned(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let staged = self.ops.iter().rev().find_map(|op| match op {
            BatchOp::PutUnversioned {
                key: op_key,
                value,
            } if op_key.as_slice() == key => Some(value.clone()),
            _ => None,
        });
        match staged {
            Some(value) => Ok(Some(value)),
            None => self.engine.get_unversioned(key),
        }
    }
}

impl Writer for Batch<'_> {
    fn put_mvcc(&mut self, key: &[u8], timestamp: Timestamp, value: &[u8]) -> anyhow::Result<()> {
        self.ops.push(BatchOp::PutMvcc {
            key: key.to_vec(),
            timestamp,
            value: value.to_vec(),
        });
        Ok(())
    }

    fn clear_mvcc(&mut self, key: &[u8], timestamp: Timestamp) -> anyhow::Result<()> {
        self.ops.push(BatchOp::ClearMvcc {
            key: key.to_vec(),
            timestamp,
        });
        Ok(())
    }

    fn put_unversioned(&mut self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        self.ops.push(BatchOp::PutUnversioned {
            key: key.to_vec(),
            value: value.to_vec(),
        });
        Ok(())
    }
}

/// In-memory engine. Versions are kept sorted oldest first per key.
#[derive(Default)]
pub struct MemEngine {
    versions: RwLock<BTreeMap<Vec<u8>, Vec<MvccVersion>>>,
    unversioned: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow::anyhow!("mem engine lock poisoned")
}

impl Reader for MemEngine {
    fn mvcc_versions(&self, key: &[u8]) -> anyhow::Result<Vec<MvccVersion>> {
        let guard = self.versions.read().map_err(poisoned)?;
        Ok(guard
            .get(key)
            .map(|versions| versions.iter().rev().cloned().collect())
            .unwrap_or_default())
    }

    fn get_unversioned(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let guard = self.unversioned.read().map_err(poisoned)?;
        Ok(guard.get(key).cloned())
    }
}

impl Engine for MemEngine {
    fn apply_batch(&self, ops: Vec<BatchOp>) -> anyhow::Result<()> {
        let mut versions = self.versions.write().map_err(poisoned)?;
        let mut unversioned = self.unversioned.write().map_err(poisoned)?;
        for op in ops {
            match op {
                BatchOp::PutMvcc {
                    key,
                    timestamp,
                    value,
                } => {
                    let entry = versions.entry(key).or_default();
                    match entry.binary_search_by(|v| v.timestamp.cmp(&timestamp)) {
                        Ok(idx) => entry[idx].value = value,
                        Err(idx) => entry.insert(idx, MvccVersion { timestamp, value }),
                    }
                }
                BatchOp::ClearMvcc { key, timestamp } => {
                    let Some(entry) = versions.get_mut(&key) else {
                        continue;
                    };
                    if let Ok(idx) = entry.binary_search_by(|v| v.timestamp.cmp(&timestamp)) {
                        entry.remove(idx);
                    }
                    if entry.is_empty() {
                        versions.remove(&key);
                    }
                }
                BatchOp::PutUnversioned { key, value } => {
                    unversioned.insert(key, value);
                }
            }
        }
        Ok(())
    }
}

/// fjall-backed engine with one partition per keyspace.
pub struct FjallEngine {
    keyspace: Keyspace,
    versions: fjall::PartitionHandle,
    unversioned: fjall::PartitionHandle,
}

impl FjallEngine {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let keyspace = fjall::Config::new(path)
            .open()
            .with_context(|| format!("open fjall keyspace at {}", path.display()))?;
        Self::from_keyspace(keyspace)
    }

    pub fn from_keyspace(keyspace: Keyspace) -> anyhow::Result<Self> {
        let versions =
            keyspace.open_partition("mvcc_versions", PartitionCreateOptions::default())?;
        let unversioned =
            keyspace.open_partition("unversioned", PartitionCreateOptions::default())?;
        Ok(Self {
            keyspace,
            versions,
            unversioned,
        })
    }

    /// Flush the journal to disk.
    pub fn persist(&self) -> anyhow::Result<()> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .context("persist fjall keyspace")
    }
}

impl Reader for FjallEngine {
    fn mvcc_versions(&self, key: &[u8]) -> anyhow::Result<Vec<MvccVersion>> {
        let prefix = encode_key_prefix(key);
        let mut out = Vec::new();
        for item in self.versions.prefix(prefix).rev() {
            let (entry_key, entry_value) = item?;
            let timestamp = decode_version_from_key(key, &entry_key)
                .with_context(|| format!("corrupt mvcc version key for {key:?}"))?;
            out.push(MvccVersion {
                timestamp,
                value: entry_value.to_vec(),
            });
        }
        Ok(out)
    }

    fn get_unversioned(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.unversioned.get(key)?.map(|value| value.to_vec()))
    }
}

impl Engine for FjallEngine {
    fn apply_batch(&self, ops: Vec<BatchOp>) -> anyhow::Result<()> {
        let mut batch = self.keyspace.batch();
        for op in ops {
            match op {
                BatchOp::PutMvcc {
                    key,
                    timestamp,
                    value,
                } => batch.insert(&self.versions, encode_version_key(&key, timestamp), value),
                BatchOp::ClearMvcc { key, timestamp } => {
                    batch.remove(&self.versions, encode_version_key(&key, timestamp))
                }
                BatchOp::PutUnversioned { key, value } => {
                    batch.insert(&self.unversioned, key, value)
                }
            }
        }
        batch.commit().context("commit fjall write batch")
    }
}

fn encode_key_prefix(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + key.len());
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key);
    out
}

fn encode_version_key(key: &[u8], timestamp: Timestamp) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + key.len() + TIMESTAMP_ENCODED_LEN);
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(&timestamp.encode());
    out
}

fn decode_version_from_key(key: &[u8], entry_key: &[u8]) -> anyhow::Result<Timestamp> {
    let mut offset = 0usize;
    let key_len = read_u32(entry_key, &mut offset)? as usize;
    anyhow::ensure!(
        offset + key_len + TIMESTAMP_ENCODED_LEN == entry_key.len(),
        "bad version key length"
    );
    anyhow::ensure!(
        &entry_key[offset..offset + key_len] == key,
        "version key belongs to another key"
    );
    offset += key_len;
    Timestamp::decode(&entry_key[offset..])
}

fn read_u32(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= data.len(), "short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}
