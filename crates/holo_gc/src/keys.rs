//! Keyspace layout and range descriptors.
//!
//! Keys that start with `LOCAL_PREFIX` belong to the local (metadata)
//! keyspace and are never routed by clients. Two local families matter here:
//!
//! - range-ID-local keys: `LOCAL_PREFIX 'i' <range_id u64 BE> 'r' <suffix>`,
//!   owned by one range regardless of its bounds (e.g. the GC threshold);
//! - range-local keys: `LOCAL_PREFIX 'k' <len u32 BE> <key> <suffix>`,
//!   anchored to a global key and owned by whichever range contains it
//!   (e.g. the range descriptor).
//!
//! Everything else is a global (user) key.

use std::fmt;

pub const LOCAL_PREFIX: &[u8] = b"\x01";
const RANGE_ID_INFIX: u8 = b'i';
const RANGE_ID_REPLICATED_INFIX: u8 = b'r';
const RANGE_LOCAL_INFIX: u8 = b'k';

const RANGE_GC_THRESHOLD_SUFFIX: &[u8] = b"lgc-";
const RANGE_DESCRIPTOR_SUFFIX: &[u8] = b"rdsc";

/// Logical identifier for a range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RangeId(pub u64);

impl fmt::Display for RangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

pub fn is_local(key: &[u8]) -> bool {
    key.starts_with(LOCAL_PREFIX)
}

/// Prefix shared by every replicated range-ID-local key of `range_id`.
pub fn range_id_replicated_prefix(range_id: RangeId) -> Vec<u8> {
    let mut out = Vec::with_capacity(LOCAL_PREFIX.len() + 1 + 8 + 1);
    out.extend_from_slice(LOCAL_PREFIX);
    out.push(RANGE_ID_INFIX);
    out.extend_from_slice(&range_id.0.to_be_bytes());
    out.push(RANGE_ID_REPLICATED_INFIX);
    out
}

/// Metadata key holding the persisted GC threshold of `range_id`.
pub fn range_gc_threshold_key(range_id: RangeId) -> Vec<u8> {
    let mut out = range_id_replicated_prefix(range_id);
    out.extend_from_slice(RANGE_GC_THRESHOLD_SUFFIX);
    out
}

/// Range-local key anchored at `key` with the given suffix.
pub fn make_range_key(key: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LOCAL_PREFIX.len() + 1 + 4 + key.len() + suffix.len());
    out.extend_from_slice(LOCAL_PREFIX);
    out.push(RANGE_LOCAL_INFIX);
    out.extend_from_slice(&(key.len() as u32).to_be_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(suffix);
    out
}

/// Metadata key holding the descriptor of the range starting at `start_key`.
pub fn range_descriptor_key(start_key: &[u8]) -> Vec<u8> {
    make_range_key(start_key, RANGE_DESCRIPTOR_SUFFIX)
}

fn is_range_id_local(key: &[u8]) -> bool {
    key.len() > LOCAL_PREFIX.len()
        && is_local(key)
        && key[LOCAL_PREFIX.len()] == RANGE_ID_INFIX
}

fn range_id_of(key: &[u8]) -> Option<RangeId> {
    if !is_range_id_local(key) {
        return None;
    }
    let start = LOCAL_PREFIX.len() + 1;
    let bytes = key.get(start..start + 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    Some(RangeId(u64::from_be_bytes(buf)))
}

/// Resolve `key` to the global address used for range routing.
///
/// Global keys address themselves and range-local keys address their anchor.
/// Range-ID-local and malformed local keys have no address.
pub fn addr(key: &[u8]) -> Option<&[u8]> {
    if !is_local(key) {
        return Some(key);
    }
    let rest = &key[LOCAL_PREFIX.len()..];
    let (infix, rest) = rest.split_first()?;
    if *infix != RANGE_LOCAL_INFIX {
        return None;
    }
    let len_bytes = rest.get(..4)?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(len_bytes);
    let len = u32::from_be_bytes(buf) as usize;
    rest.get(4..4 + len)
}

/// Bounds and identity of one range. An empty `end_key` is unbounded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeDescriptor {
    pub range_id: RangeId,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
}

impl RangeDescriptor {
    pub fn new(range_id: RangeId, start_key: Vec<u8>, end_key: Vec<u8>) -> Self {
        Self {
            range_id,
            start_key,
            end_key,
        }
    }

    /// Whether the resolved global address falls inside `[start_key, end_key)`.
    pub fn contains_addr(&self, addr: &[u8]) -> bool {
        addr >= self.start_key.as_slice()
            && (self.end_key.is_empty() || addr < self.end_key.as_slice())
    }

    /// Whether `key` (global or local) is owned by this range.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        if is_range_id_local(key) {
            return range_id_of(key) == Some(self.range_id);
        }
        match addr(key) {
            Some(addr) => self.contains_addr(addr),
            None => false,
        }
    }
}
