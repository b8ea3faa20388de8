//! Request types for the GC command.

use crate::hlc::Timestamp;

/// One key to collect: every version at or below `timestamp` may be erased.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GcKey {
    pub key: Vec<u8>,
    pub timestamp: Timestamp,
}

impl GcKey {
    pub fn new(key: impl Into<Vec<u8>>, timestamp: Timestamp) -> Self {
        Self {
            key: key.into(),
            timestamp,
        }
    }
}

/// Header shared by every request in a batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchHeader {
    pub timestamp: Timestamp,
}

impl BatchHeader {
    pub fn at(timestamp: Timestamp) -> Self {
        Self { timestamp }
    }
}

/// A GC command as produced by the GC queue's scan.
///
/// A request either erases `keys` or advances the range's GC threshold to
/// `threshold`; evaluation rejects requests that try to do both.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcRequest {
    pub keys: Vec<GcKey>,
    pub threshold: Option<Timestamp>,
}

impl GcRequest {
    pub fn collect_keys(keys: Vec<GcKey>) -> Self {
        Self {
            keys,
            threshold: None,
        }
    }

    pub fn advance_threshold(threshold: Timestamp) -> Self {
        Self {
            keys: Vec::new(),
            threshold: Some(threshold),
        }
    }

    /// The requested threshold, treating an empty timestamp as absent.
    pub fn new_threshold(&self) -> Option<Timestamp> {
        self.threshold.filter(|ts| !ts.is_empty())
    }
}
