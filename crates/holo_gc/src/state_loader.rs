//! Loads and persists replicated range state stored under range-ID-local keys.

use anyhow::Context;

use crate::engine::{ReadWriter, Reader};
use crate::hlc::{Timestamp, TIMESTAMP_ENCODED_LEN};
use crate::keys::{self, RangeId};
use crate::mvcc::MvccStats;

#[derive(Clone, Copy, Debug)]
pub struct StateLoader {
    range_id: RangeId,
}

impl StateLoader {
    pub fn new(range_id: RangeId) -> Self {
        Self { range_id }
    }

    /// Persisted GC threshold, or the zero timestamp if none was ever written.
    pub fn load_gc_threshold(&self, reader: &dyn Reader) -> anyhow::Result<Timestamp> {
        let key = keys::range_gc_threshold_key(self.range_id);
        match reader.get_unversioned(&key)? {
            Some(bytes) => Timestamp::decode(&bytes)
                .with_context(|| format!("decode gc threshold of {}", self.range_id)),
            None => Ok(Timestamp::zero()),
        }
    }

    pub fn set_gc_threshold(
        &self,
        rw: &mut dyn ReadWriter,
        stats: &mut MvccStats,
        threshold: &Timestamp,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(
            !threshold.is_empty(),
            "cannot persist an empty gc threshold for {}",
            self.range_id
        );
        let key = keys::range_gc_threshold_key(self.range_id);
        if rw.get_unversioned(&key)?.is_none() {
            stats.sys_bytes += (key.len() + TIMESTAMP_ENCODED_LEN) as i64;
            stats.sys_count += 1;
        }
        rw.put_unversioned(&key, &threshold.encode())
            .with_context(|| format!("persist gc threshold of {}", self.range_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Batch, MemEngine};

    #[test]
    fn missing_threshold_loads_as_zero() {
        let engine = MemEngine::new();
        let loader = StateLoader::new(RangeId(3));
        assert!(loader.load_gc_threshold(&engine).expect("load").is_empty());
    }

    #[test]
    fn threshold_round_trips_and_counts_once() {
        let engine = MemEngine::new();
        let loader = StateLoader::new(RangeId(3));
        let mut stats = MvccStats::default();

        let mut batch = Batch::new(&engine);
        loader
            .set_gc_threshold(&mut batch, &mut stats, &Timestamp::new(40, 2))
            .expect("set");
        loader
            .set_gc_threshold(&mut batch, &mut stats, &Timestamp::new(41, 0))
            .expect("set again");
        batch.commit().expect("commit");

        assert_eq!(
            loader.load_gc_threshold(&engine).expect("load"),
            Timestamp::new(41, 0)
        );
        assert_eq!(stats.sys_count, 1);
        assert_eq!(
            StateLoader::new(RangeId(4))
                .load_gc_threshold(&engine)
                .expect("load other range"),
            Timestamp::zero()
        );
    }

    #[test]
    fn empty_threshold_is_rejected() {
        let engine = MemEngine::new();
        let mut batch = Batch::new(&engine);
        let mut stats = MvccStats::default();
        assert!(StateLoader::new(RangeId(1))
            .set_gc_threshold(&mut batch, &mut stats, &Timestamp::zero())
            .is_err());
    }
}
