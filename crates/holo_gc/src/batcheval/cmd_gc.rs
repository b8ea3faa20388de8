//! The GC command: erases old MVCC versions and advances the range's GC
//! threshold.

use tracing::{debug, info};

use crate::api::{BatchHeader, GcKey, GcRequest};
use crate::batcheval::result::{EvalResult, ReplicaStateDelta, ReplicatedEvalResult};
use crate::batcheval::{AssertionFailure, CommandArgs, ImmutableRangeState};
use crate::engine::ReadWriter;
use crate::keys;
use crate::mvcc;
use crate::spanset::{Span, SpanAccess, SpanSet};
use crate::state_loader::StateLoader;
use crate::threshold::GcThreshold;

/// Declare the latches a GC request needs.
///
/// The header's key span is deliberately ignored: GC requests are usually
/// addressed to the whole range, and latching all of it would stall foreground
/// traffic.
pub fn declare_keys_gc(
    rs: &dyn ImmutableRangeState,
    header: &BatchHeader,
    req: &GcRequest,
    latch_spans: &mut SpanSet,
) {
    for gc_key in &req.keys {
        if keys::is_local(&gc_key.key) {
            latch_spans.add_non_mvcc(SpanAccess::ReadWrite, Span::point(gc_key.key.clone()));
        } else {
            latch_spans.add_mvcc(
                SpanAccess::ReadWrite,
                Span::point(gc_key.key.clone()),
                header.timestamp,
            );
        }
    }
    // Only latch the threshold key when it may be written. The GC queue sends
    // a threshold-only request first and then key-only requests, which must
    // not serialize behind each other.
    if req.new_threshold().is_some() {
        latch_spans.add_non_mvcc(
            SpanAccess::ReadWrite,
            Span::point(keys::range_gc_threshold_key(rs.range_id())),
        );
    }
    // Needed for range bounds checks in `EvalContext::contains_key`.
    latch_spans.add_non_mvcc(
        SpanAccess::ReadOnly,
        Span::point(keys::range_descriptor_key(rs.start_key())),
    );
}

/// Evaluate a GC request: collect the listed keys up to their expiration
/// timestamps, then optionally forward the persisted GC threshold.
pub fn gc(rw: &mut dyn ReadWriter, cargs: CommandArgs<'_>) -> anyhow::Result<EvalResult> {
    let CommandArgs {
        eval_ctx,
        header,
        args,
        stats,
    } = cargs;
    let new_threshold = args.new_threshold();

    // A request may bump the threshold or collect keys, never both. Doing both
    // lets a read evaluate without error while missing versions that were
    // concurrently collected.
    //
    // Foreground reads consult the replica's in-memory GC threshold, which is
    // installed after the command's write batch is applied to storage, not
    // atomically with it. A read can therefore observe the erased versions
    // while still checking against the old threshold.
    //
    // Latches do not close this window:
    // 1. an MVCC latch at the batch timestamp only conflicts with readers at
    //    or above it, not with reads below it;
    // 2. the read may be served by a follower applying this command from the
    //    log, where no latch taken on the leaseholder applies.
    if new_threshold.is_some()
        && !args.keys.is_empty()
        && !eval_ctx.eval_knobs().allow_gc_with_new_threshold_and_keys
    {
        return Err(AssertionFailure::new(
            "GC request can set threshold or it can GC keys, but it is unsafe for it to do both",
        )
        .into());
    }

    // Keys outside the range are dropped. They are left over from a split
    // that raced with the GC scan and will be collected again by the range
    // that owns them now.
    let mut local_keys: Vec<GcKey> = Vec::new();
    let mut global_keys: Vec<GcKey> = Vec::with_capacity(args.keys.len());
    let mut dropped = 0usize;
    for gc_key in &args.keys {
        if !eval_ctx.contains_key(&gc_key.key) {
            dropped += 1;
            continue;
        }
        if keys::is_local(&gc_key.key) {
            local_keys.push(gc_key.clone());
        } else {
            global_keys.push(gc_key.clone());
        }
    }
    if dropped > 0 {
        debug!(
            range_id = %eval_ctx.range_id(),
            dropped,
            "dropping gc keys outside of range bounds"
        );
    }

    let mut res = EvalResult::default();
    for gc_keys in [&local_keys, &global_keys] {
        if gc_keys.is_empty() {
            continue;
        }
        res.gc += mvcc::garbage_collect(rw, stats, gc_keys, header.timestamp)?;
    }

    if let Some(requested) = new_threshold {
        // Requests can arrive out of order; keep the maximum.
        // The threshold key latch is held, so this equals the persisted value.
        let current = eval_ctx.gc_threshold();
        let mut threshold = GcThreshold::new(current);
        if threshold.forward(requested) {
            let updated = threshold.timestamp();
            StateLoader::new(eval_ctx.range_id()).set_gc_threshold(rw, stats, &updated)?;
            info!(
                range_id = %eval_ctx.range_id(),
                old = %current,
                new = %updated,
                "advancing gc threshold"
            );
            res.replicated = ReplicatedEvalResult {
                state: Some(ReplicaStateDelta {
                    gc_threshold: Some(updated),
                }),
            };
        } else {
            debug!(
                range_id = %eval_ctx.range_id(),
                current = %current,
                requested = %requested,
                "gc threshold already at or above requested value"
            );
        }
    }

    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcheval::{is_assertion_failure, EvalContext, EvalKnobs};
    use crate::engine::{Batch, BatchOp, Engine, MemEngine, MvccVersion, Reader, Writer};
    use crate::hlc::Timestamp;
    use crate::keys::{RangeDescriptor, RangeId};
    use crate::mvcc::MvccStats;

    fn ts(wall: u64) -> Timestamp {
        Timestamp::from_wall(wall)
    }

    struct TestContext {
        desc: RangeDescriptor,
        threshold: Timestamp,
        knobs: EvalKnobs,
    }

    impl TestContext {
        fn new(threshold: u64) -> Self {
            Self {
                desc: RangeDescriptor::new(RangeId(5), b"a".to_vec(), b"m".to_vec()),
                threshold: ts(threshold),
                knobs: EvalKnobs::default(),
            }
        }
    }

    impl EvalContext for TestContext {
        fn range_id(&self) -> RangeId {
            self.desc.range_id
        }

        fn contains_key(&self, key: &[u8]) -> bool {
            self.desc.contains_key(key)
        }

        fn gc_threshold(&self) -> Timestamp {
            self.threshold
        }

        fn eval_knobs(&self) -> &EvalKnobs {
            &self.knobs
        }
    }

    /// Records every call the erase primitive makes into storage.
    struct Recorder<'a> {
        inner: Batch<'a>,
        cleared: Vec<Vec<u8>>,
        writes: usize,
    }

    impl Reader for Recorder<'_> {
        fn mvcc_versions(&self, key: &[u8]) -> anyhow::Result<Vec<MvccVersion>> {
            self.inner.mvcc_versions(key)
        }

        fn get_unversioned(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
            self.inner.get_unversioned(key)
        }
    }

    impl Writer for Recorder<'_> {
        fn put_mvcc(&mut self, key: &[u8], ts: Timestamp, value: &[u8]) -> anyhow::Result<()> {
            self.writes += 1;
            self.inner.put_mvcc(key, ts, value)
        }

        fn clear_mvcc(&mut self, key: &[u8], ts: Timestamp) -> anyhow::Result<()> {
            self.writes += 1;
            self.cleared.push(key.to_vec());
            self.inner.clear_mvcc(key, ts)
        }

        fn put_unversioned(&mut self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
            self.writes += 1;
            self.inner.put_unversioned(key, value)
        }
    }

    fn seed(engine: &MemEngine, key: &[u8], wall: u64, value: &[u8]) {
        engine
            .apply_batch(vec![BatchOp::PutMvcc {
                key: key.to_vec(),
                timestamp: ts(wall),
                value: value.to_vec(),
            }])
            .expect("seed");
    }

    fn eval(
        engine: &MemEngine,
        ctx: &TestContext,
        batch_ts: u64,
        req: &GcRequest,
    ) -> (anyhow::Result<EvalResult>, Vec<Vec<u8>>, usize) {
        let mut rec = Recorder {
            inner: Batch::new(engine),
            cleared: Vec::new(),
            writes: 0,
        };
        let mut stats = MvccStats::default();
        let res = gc(
            &mut rec,
            CommandArgs {
                eval_ctx: ctx,
                header: BatchHeader::at(ts(batch_ts)),
                args: req,
                stats: &mut stats,
            },
        );
        if res.is_ok() {
            rec.inner.commit().expect("commit");
        }
        (res, rec.cleared, rec.writes)
    }

    #[test]
    fn declares_mvcc_latch_for_global_keys_and_descriptor_read() {
        let desc = RangeDescriptor::new(RangeId(5), b"a".to_vec(), b"m".to_vec());
        let local = keys::make_range_key(b"b", b"txn-");
        let req = GcRequest::collect_keys(vec![
            GcKey::new("b", ts(10)),
            GcKey::new(local.clone(), ts(10)),
        ]);
        let mut spans = SpanSet::new();
        declare_keys_gc(&desc, &BatchHeader::at(ts(100)), &req, &mut spans);

        let declared: Vec<_> = spans.iter().cloned().collect();
        assert_eq!(declared.len(), 3);
        assert_eq!(declared[0].span, Span::point(b"b".to_vec()));
        assert_eq!(declared[0].access, SpanAccess::ReadWrite);
        assert_eq!(declared[0].timestamp, Some(ts(100)));
        assert_eq!(declared[1].span, Span::point(local));
        assert!(!declared[1].is_mvcc());
        assert_eq!(declared[2].span, Span::point(keys::range_descriptor_key(b"a")));
        assert_eq!(declared[2].access, SpanAccess::ReadOnly);
        assert!(!declared[2].is_mvcc());
        assert!(!spans.contains(SpanAccess::ReadOnly, &keys::range_gc_threshold_key(RangeId(5))));
    }

    #[test]
    fn threshold_latch_only_when_threshold_requested() {
        let desc = RangeDescriptor::new(RangeId(5), b"a".to_vec(), b"m".to_vec());
        let threshold_key = keys::range_gc_threshold_key(RangeId(5));

        let mut spans = SpanSet::new();
        let req = GcRequest::advance_threshold(ts(50));
        declare_keys_gc(&desc, &BatchHeader::at(ts(100)), &req, &mut spans);
        assert!(spans.contains(SpanAccess::ReadWrite, &threshold_key));
        assert_eq!(spans.len(), 2);

        let mut spans = SpanSet::new();
        let req = GcRequest {
            keys: Vec::new(),
            threshold: Some(Timestamp::zero()),
        };
        declare_keys_gc(&desc, &BatchHeader::at(ts(100)), &req, &mut spans);
        assert!(!spans.contains(SpanAccess::ReadOnly, &threshold_key));
        assert_eq!(spans.len(), 1);
    }

    #[test]
    fn collects_single_key_without_threshold_delta() {
        let engine = MemEngine::new();
        seed(&engine, b"k1", 100, b"");
        seed(&engine, b"k1", 50, b"v");
        let ctx = TestContext::new(0);
        let req = GcRequest::collect_keys(vec![GcKey::new("k1", ts(100))]);

        let (res, cleared, _) = eval(&engine, &ctx, 200, &req);
        let res = res.expect("gc");
        assert_eq!(cleared, vec![b"k1".to_vec(), b"k1".to_vec()]);
        assert_eq!(res.gc.keys, 1);
        assert_eq!(res.gc.versions, 2);
        assert!(res.replicated.is_empty());
        assert!(engine.mvcc_versions(b"k1").expect("versions").is_empty());
    }

    #[test]
    fn advances_threshold_and_emits_delta() {
        let engine = MemEngine::new();
        let ctx = TestContext::new(30);
        let (res, _, _) = eval(&engine, &ctx, 200, &GcRequest::advance_threshold(ts(50)));
        let res = res.expect("gc");
        assert_eq!(res.new_gc_threshold(), Some(ts(50)));
        assert_eq!(
            StateLoader::new(RangeId(5))
                .load_gc_threshold(&engine)
                .expect("load"),
            ts(50)
        );
    }

    #[test]
    fn stale_threshold_is_a_silent_noop() {
        let engine = MemEngine::new();
        let ctx = TestContext::new(30);
        for stale in [20, 30] {
            let (res, _, writes) =
                eval(&engine, &ctx, 200, &GcRequest::advance_threshold(ts(stale)));
            let res = res.expect("gc");
            assert_eq!(res, EvalResult::default());
            assert_eq!(writes, 0);
        }
        assert!(StateLoader::new(RangeId(5))
            .load_gc_threshold(&engine)
            .expect("load")
            .is_empty());
    }

    #[test]
    fn keys_and_threshold_together_fail_without_writes() {
        let engine = MemEngine::new();
        seed(&engine, b"k1", 10, b"");
        seed(&engine, b"k1", 5, b"v");
        let ctx = TestContext::new(0);
        let req = GcRequest {
            keys: vec![GcKey::new("k1", ts(10))],
            threshold: Some(ts(50)),
        };
        let (res, cleared, writes) = eval(&engine, &ctx, 200, &req);
        let err = res.expect_err("must be rejected");
        assert!(is_assertion_failure(&err));
        assert!(cleared.is_empty());
        assert_eq!(writes, 0);
        assert_eq!(engine.mvcc_versions(b"k1").expect("versions").len(), 2);
    }

    #[test]
    fn knob_allows_keys_and_threshold_together() {
        let engine = MemEngine::new();
        seed(&engine, b"k1", 10, b"");
        let mut ctx = TestContext::new(0);
        ctx.knobs.allow_gc_with_new_threshold_and_keys = true;
        let req = GcRequest {
            keys: vec![GcKey::new("k1", ts(10))],
            threshold: Some(ts(50)),
        };
        let (res, cleared, _) = eval(&engine, &ctx, 200, &req);
        let res = res.expect("gc");
        assert_eq!(cleared.len(), 1);
        assert_eq!(res.new_gc_threshold(), Some(ts(50)));
    }

    #[test]
    fn keys_outside_range_are_dropped() {
        let engine = MemEngine::new();
        seed(&engine, b"zebra", 10, b"");
        let ctx = TestContext::new(0);
        let req = GcRequest::collect_keys(vec![GcKey::new("zebra", ts(10))]);
        let (res, cleared, writes) = eval(&engine, &ctx, 200, &req);
        let res = res.expect("gc");
        assert_eq!(res.gc.bytes, 0);
        assert!(cleared.is_empty());
        assert_eq!(writes, 0);
        assert_eq!(engine.mvcc_versions(b"zebra").expect("versions").len(), 1);
    }

    #[test]
    fn local_partition_is_collected_before_global() {
        let engine = MemEngine::new();
        let local_a = keys::make_range_key(b"c", b"txn-");
        let local_b = keys::make_range_key(b"d", b"txn-");
        for key in [
            b"b".as_slice(),
            local_a.as_slice(),
            b"c".as_slice(),
            local_b.as_slice(),
        ] {
            seed(&engine, key, 10, b"");
        }
        let ctx = TestContext::new(0);
        let req = GcRequest::collect_keys(vec![
            GcKey::new("b", ts(10)),
            GcKey::new(local_a.clone(), ts(10)),
            GcKey::new("c", ts(10)),
            GcKey::new(local_b.clone(), ts(10)),
        ]);
        let (res, cleared, _) = eval(&engine, &ctx, 200, &req);
        res.expect("mixed request is partitioned, not rejected");
        assert_eq!(cleared, vec![local_a, local_b, b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn erase_failure_aborts_the_command() {
        let engine = MemEngine::new();
        seed(&engine, b"b", 10, b"");
        seed(&engine, b"c", 10, b"live");
        let ctx = TestContext::new(0);
        let req = GcRequest::collect_keys(vec![GcKey::new("b", ts(10)), GcKey::new("c", ts(10))]);
        let (res, _, _) = eval(&engine, &ctx, 200, &req);
        let err = res.expect_err("latest live value");
        assert!(!is_assertion_failure(&err));
        assert_eq!(engine.mvcc_versions(b"b").expect("versions").len(), 1);
    }
}
