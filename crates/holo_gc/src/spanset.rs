//! Latch span sets.
//!
//! A command declares the spans it will touch before evaluation; the latch
//! manager acquires them, and `SpanSetReadWriter` asserts during evaluation
//! that nothing outside the declaration is touched.
//!
//! Conflict rules between two latches on overlapping spans:
//! - two reads never conflict;
//! - a non-MVCC latch conflicts with everything;
//! - two MVCC writes conflict;
//! - an MVCC read at `r` conflicts with an MVCC write at `w` only if `w <= r`.
//!
//! The last rule means a writer latched at `t` does not serialize with
//! readers below `t`.

use crate::batcheval::AssertionFailure;
use crate::engine::{MvccVersion, Reader, ReadWriter, Writer};
use crate::hlc::Timestamp;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SpanAccess {
    ReadOnly,
    ReadWrite,
}

/// `[key, end_key)`, or the single key `key` when `end_key` is empty.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Span {
    pub key: Vec<u8>,
    pub end_key: Vec<u8>,
}

impl Span {
    pub fn point(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            end_key: Vec::new(),
        }
    }

    pub fn range(key: impl Into<Vec<u8>>, end_key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            end_key: end_key.into(),
        }
    }

    pub fn is_point(&self) -> bool {
        self.end_key.is_empty()
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        if self.is_point() {
            return self.key.as_slice() == key;
        }
        key >= self.key.as_slice() && key < self.end_key.as_slice()
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        match (self.is_point(), other.is_point()) {
            (true, true) => self.key == other.key,
            (true, false) => other.contains_key(&self.key),
            (false, true) => self.contains_key(&other.key),
            (false, false) => self.key < other.end_key && other.key < self.end_key,
        }
    }
}

/// One declared latch. `timestamp == None` marks a non-MVCC latch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LatchSpan {
    pub span: Span,
    pub access: SpanAccess,
    pub timestamp: Option<Timestamp>,
}

impl LatchSpan {
    pub fn is_mvcc(&self) -> bool {
        self.timestamp.is_some()
    }

    pub fn conflicts_with(&self, other: &LatchSpan) -> bool {
        if !self.span.overlaps(&other.span) {
            return false;
        }
        match (self.access, other.access) {
            (SpanAccess::ReadOnly, SpanAccess::ReadOnly) => false,
            (SpanAccess::ReadWrite, SpanAccess::ReadWrite) => true,
            (SpanAccess::ReadOnly, SpanAccess::ReadWrite) => {
                read_write_conflict(self.timestamp, other.timestamp)
            }
            (SpanAccess::ReadWrite, SpanAccess::ReadOnly) => {
                read_write_conflict(other.timestamp, self.timestamp)
            }
        }
    }
}

fn read_write_conflict(read_ts: Option<Timestamp>, write_ts: Option<Timestamp>) -> bool {
    match (read_ts, write_ts) {
        (Some(read_ts), Some(write_ts)) => write_ts <= read_ts,
        _ => true,
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpanSet {
    spans: Vec<LatchSpan>,
}

impl SpanSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a latch that conflicts regardless of timestamp.
    pub fn add_non_mvcc(&mut self, access: SpanAccess, span: Span) {
        self.spans.push(LatchSpan {
            span,
            access,
            timestamp: None,
        });
    }

    /// Declare a latch that only conflicts at or above `timestamp`.
    pub fn add_mvcc(&mut self, access: SpanAccess, span: Span, timestamp: Timestamp) {
        self.spans.push(LatchSpan {
            span,
            access,
            timestamp: Some(timestamp),
        });
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LatchSpan> {
        self.spans.iter()
    }

    /// Whether some declared span covering `key` grants `access`.
    pub fn contains(&self, access: SpanAccess, key: &[u8]) -> bool {
        self.spans
            .iter()
            .any(|s| s.access >= access && s.span.contains_key(key))
    }

    pub fn check_allowed(&self, access: SpanAccess, key: &[u8]) -> anyhow::Result<()> {
        if self.contains(access, key) {
            return Ok(());
        }
        Err(AssertionFailure::new(format!(
            "cannot access undeclared key {key:?} with {access:?}"
        ))
        .into())
    }

    /// Whether any latch of `self` conflicts with any latch of `other`.
    pub fn conflicts_with(&self, other: &SpanSet) -> bool {
        self.spans
            .iter()
            .any(|a| other.spans.iter().any(|b| a.conflicts_with(b)))
    }
}

/// Storage wrapper that only permits accesses covered by a `SpanSet`.
pub struct SpanSetReadWriter<'a> {
    inner: &'a mut dyn ReadWriter,
    spans: &'a SpanSet,
}

impl<'a> SpanSetReadWriter<'a> {
    pub fn new(inner: &'a mut dyn ReadWriter, spans: &'a SpanSet) -> Self {
        Self { inner, spans }
    }
}

impl Reader for SpanSetReadWriter<'_> {
    fn mvcc_versions(&self, key: &[u8]) -> anyhow::Result<Vec<MvccVersion>> {
        self.spans.check_allowed(SpanAccess::ReadOnly, key)?;
        self.inner.mvcc_versions(key)
    }

    fn get_unversioned(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        self.spans.check_allowed(SpanAccess::ReadOnly, key)?;
        self.inner.get_unversioned(key)
    }
}

impl Writer for SpanSetReadWriter<'_> {
    fn put_mvcc(&mut self, key: &[u8], timestamp: Timestamp, value: &[u8]) -> anyhow::Result<()> {
        self.spans.check_allowed(SpanAccess::ReadWrite, key)?;
        self.inner.put_mvcc(key, timestamp, value)
    }

    fn clear_mvcc(&mut self, key: &[u8], timestamp: Timestamp) -> anyhow::Result<()> {
        self.spans.check_allowed(SpanAccess::ReadWrite, key)?;
        self.inner.clear_mvcc(key, timestamp)
    }

    fn put_unversioned(&mut self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        self.spans.check_allowed(SpanAccess::ReadWrite, key)?;
        self.inner.put_unversioned(key, value)
    }
}
