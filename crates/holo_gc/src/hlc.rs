//! Hybrid logical clock timestamps.
//!
//! Every MVCC version, batch header and GC threshold is stamped with a
//! `Timestamp`. Ordering is `(wall_time, logical)`; the zero timestamp doubles
//! as the "empty" value.

use std::fmt;
use std::str::FromStr;

/// Number of bytes in the big-endian encoding produced by `Timestamp::encode`.
pub const TIMESTAMP_ENCODED_LEN: usize = 12;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timestamp {
    pub wall_time: u64,
    pub logical: u32,
}

impl Timestamp {
    pub const fn new(wall_time: u64, logical: u32) -> Self {
        Self { wall_time, logical }
    }

    pub const fn zero() -> Self {
        Self {
            wall_time: 0,
            logical: 0,
        }
    }

    pub const fn from_wall(wall_time: u64) -> Self {
        Self::new(wall_time, 0)
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::zero()
    }

    /// Ratchet `self` up to `other`. Returns `true` when `self` changed.
    pub fn forward(&mut self, other: Timestamp) -> bool {
        if *self < other {
            *self = other;
            return true;
        }
        false
    }

    pub fn encode(&self) -> [u8; TIMESTAMP_ENCODED_LEN] {
        let mut out = [0u8; TIMESTAMP_ENCODED_LEN];
        out[..8].copy_from_slice(&self.wall_time.to_be_bytes());
        out[8..].copy_from_slice(&self.logical.to_be_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        anyhow::ensure!(
            data.len() == TIMESTAMP_ENCODED_LEN,
            "timestamp encoding must be {TIMESTAMP_ENCODED_LEN} bytes, got {}",
            data.len()
        );
        let mut wall = [0u8; 8];
        wall.copy_from_slice(&data[..8]);
        let mut logical = [0u8; 4];
        logical.copy_from_slice(&data[8..]);
        Ok(Self {
            wall_time: u64::from_be_bytes(wall),
            logical: u32::from_be_bytes(logical),
        })
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.wall_time, self.logical)
    }
}

impl FromStr for Timestamp {
    type Err = anyhow::Error;

    /// Accepts `wall` or `wall,logical`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        let (wall, logical) = match raw.split_once(',') {
            Some((wall, logical)) => (wall, Some(logical)),
            None => (raw, None),
        };
        let wall_time = wall
            .trim()
            .parse::<u64>()
            .map_err(|err| anyhow::anyhow!("invalid wall time {wall:?}: {err}"))?;
        let logical = match logical {
            Some(logical) => logical
                .trim()
                .parse::<u32>()
                .map_err(|err| anyhow::anyhow!("invalid logical {logical:?}: {err}"))?,
            None => 0,
        };
        Ok(Self::new(wall_time, logical))
    }
}
