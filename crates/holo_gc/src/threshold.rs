//! The per-range GC threshold watermark.
//!
//! Reads at or below the threshold must be rejected because the versions they
//! would need may already be gone. The threshold only ever moves forward: out
//! of order advancement requests commute, and only the maximum survives.

use crate::hlc::Timestamp;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct GcThreshold(Timestamp);

impl GcThreshold {
    pub const fn new(timestamp: Timestamp) -> Self {
        Self(timestamp)
    }

    pub fn timestamp(&self) -> Timestamp {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Join `other` into the watermark. Returns `true` when it strictly advanced.
    pub fn forward(&mut self, other: Timestamp) -> bool {
        self.0.forward(other)
    }

    /// Whether a read at `ts` can still observe complete history.
    pub fn permits_read_at(&self, ts: Timestamp) -> bool {
        self.is_empty() || ts > self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_is_order_independent() {
        let t1 = Timestamp::from_wall(50);
        let t2 = Timestamp::from_wall(20);

        let mut a = GcThreshold::default();
        a.forward(t1);
        a.forward(t2);

        let mut b = GcThreshold::default();
        b.forward(t2);
        b.forward(t1);

        assert_eq!(a, b);
        assert_eq!(a.timestamp(), t1);
    }

    #[test]
    fn forward_reports_strict_increase_only() {
        let mut threshold = GcThreshold::new(Timestamp::from_wall(30));
        assert!(!threshold.forward(Timestamp::from_wall(30)));
        assert!(!threshold.forward(Timestamp::from_wall(10)));
        assert!(threshold.forward(Timestamp::from_wall(31)));
    }

    #[test]
    fn reads_at_or_below_threshold_are_refused() {
        let threshold = GcThreshold::new(Timestamp::from_wall(30));
        assert!(!threshold.permits_read_at(Timestamp::from_wall(29)));
        assert!(!threshold.permits_read_at(Timestamp::from_wall(30)));
        assert!(threshold.permits_read_at(Timestamp::new(30, 1)));
        assert!(GcThreshold::default().permits_read_at(Timestamp::zero()));
    }
}
