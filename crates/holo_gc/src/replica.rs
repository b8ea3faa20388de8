//! A single replica of a range: descriptor, storage and in-memory state.
//!
//! The in-memory GC threshold mirrors the persisted one but is only updated
//! after a command's write batch has been applied. Foreground reads check the
//! in-memory copy, so between those two steps a read may see erased history
//! while the old threshold still admits it. `batcheval::cmd_gc::gc` refuses
//! requests that would erase keys and advance the threshold together for that
//! reason.
//!
//! Every operation holds its latches from before it reads replica state until
//! its in-memory side effects are installed, so conflicting commands apply
//! one at a time.

use std::sync::{Arc, Mutex, RwLock};

use anyhow::Context;
use tracing::debug;

use crate::api::{BatchHeader, GcRequest};
use crate::batcheval::cmd_gc;
use crate::batcheval::result::{EvalResult, ReplicatedEvalResult};
use crate::batcheval::{CommandArgs, EvalContext, EvalKnobs};
use crate::engine::{Batch, Engine};
use crate::hlc::Timestamp;
use crate::keys::{self, RangeDescriptor, RangeId};
use crate::latch::LatchManager;
use crate::mvcc::{self, MvccStats};
use crate::spanset::{Span, SpanAccess, SpanSet, SpanSetReadWriter};
use crate::state_loader::StateLoader;
use crate::threshold::GcThreshold;

#[derive(Clone, Debug)]
pub struct ReplicaState {
    pub desc: RangeDescriptor,
    pub gc_threshold: GcThreshold,
}

pub struct Replica<E: Engine> {
    engine: Arc<E>,
    state: RwLock<ReplicaState>,
    stats: Mutex<MvccStats>,
    knobs: EvalKnobs,
    latches: LatchManager,
}

/// Snapshot of replica state used for one evaluation.
struct ReplicaEvalContext<'a> {
    desc: RangeDescriptor,
    gc_threshold: Timestamp,
    knobs: &'a EvalKnobs,
}

impl EvalContext for ReplicaEvalContext<'_> {
    fn range_id(&self) -> RangeId {
        self.desc.range_id
    }

    fn contains_key(&self, key: &[u8]) -> bool {
        self.desc.contains_key(key)
    }

    fn gc_threshold(&self) -> Timestamp {
        self.gc_threshold
    }

    fn eval_knobs(&self) -> &EvalKnobs {
        self.knobs
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow::anyhow!("replica lock poisoned")
}

fn point_latch(access: SpanAccess, key: &[u8], ts: Timestamp) -> SpanSet {
    let mut spans = SpanSet::new();
    spans.add_mvcc(access, Span::point(key.to_vec()), ts);
    spans
}

impl<E: Engine> Replica<E> {
    /// Open a replica, seeding in-memory state from what storage persisted.
    pub fn load(desc: RangeDescriptor, engine: Arc<E>) -> anyhow::Result<Self> {
        Self::load_with_knobs(desc, engine, EvalKnobs::default())
    }

    pub fn load_with_knobs(
        desc: RangeDescriptor,
        engine: Arc<E>,
        knobs: EvalKnobs,
    ) -> anyhow::Result<Self> {
        let gc_threshold = StateLoader::new(desc.range_id)
            .load_gc_threshold(engine.as_ref())
            .with_context(|| format!("load replica state of {}", desc.range_id))?;
        Ok(Self {
            engine,
            state: RwLock::new(ReplicaState {
                desc,
                gc_threshold: GcThreshold::new(gc_threshold),
            }),
            stats: Mutex::new(MvccStats::default()),
            knobs,
            latches: LatchManager::new(),
        })
    }

    pub fn descriptor(&self) -> anyhow::Result<RangeDescriptor> {
        Ok(self.state.read().map_err(poisoned)?.desc.clone())
    }

    /// Replace the descriptor, e.g. after a split shrank the range.
    pub fn set_descriptor(&self, desc: RangeDescriptor) -> anyhow::Result<()> {
        let current = self.descriptor()?;
        let mut spans = SpanSet::new();
        spans.add_non_mvcc(
            SpanAccess::ReadWrite,
            Span::point(keys::range_descriptor_key(&current.start_key)),
        );
        let _latches = self.latches.acquire(spans);
        let mut state = self.state.write().map_err(poisoned)?;
        anyhow::ensure!(
            desc.range_id == state.desc.range_id,
            "descriptor for {} cannot replace {}",
            desc.range_id,
            state.desc.range_id
        );
        state.desc = desc;
        Ok(())
    }

    /// In-memory GC threshold as seen by foreground traffic.
    pub fn gc_threshold(&self) -> anyhow::Result<Timestamp> {
        Ok(self.state.read().map_err(poisoned)?.gc_threshold.timestamp())
    }

    /// Stats accumulated by commands applied through this replica.
    pub fn stats(&self) -> anyhow::Result<MvccStats> {
        Ok(*self.stats.lock().map_err(poisoned)?)
    }

    fn declare_gc_latches(
        &self,
        header: &BatchHeader,
        req: &GcRequest,
    ) -> anyhow::Result<SpanSet> {
        let desc = self.descriptor()?;
        let mut spans = SpanSet::new();
        cmd_gc::declare_keys_gc(&desc, header, req, &mut spans);
        Ok(spans)
    }

    /// Evaluate and apply a GC request, blocking while a conflicting command
    /// holds its latches.
    pub fn execute_gc(&self, header: BatchHeader, req: &GcRequest) -> anyhow::Result<EvalResult> {
        let latches = self.latches.acquire(self.declare_gc_latches(&header, req)?);
        let ctx = {
            let state = self.state.read().map_err(poisoned)?;
            ReplicaEvalContext {
                desc: state.desc.clone(),
                gc_threshold: state.gc_threshold.timestamp(),
                knobs: &self.knobs,
            }
        };

        let mut batch = Batch::new(self.engine.as_ref());
        let mut delta = MvccStats::default();
        let res = {
            let mut rw = SpanSetReadWriter::new(&mut batch, latches.spans());
            cmd_gc::gc(
                &mut rw,
                CommandArgs {
                    eval_ctx: &ctx,
                    header,
                    args: req,
                    stats: &mut delta,
                },
            )?
        };

        debug!(
            range_id = %ctx.desc.range_id,
            ops = batch.len(),
            versions = res.gc.versions,
            bytes = res.gc.bytes,
            "applying gc batch"
        );
        batch
            .commit()
            .with_context(|| format!("apply gc batch to {}", ctx.desc.range_id))?;
        *self.stats.lock().map_err(poisoned)? += delta;
        self.handle_replicated_result(&res.replicated)?;
        Ok(res)
    }

    /// Install the in-memory side effects of an applied command.
    pub fn handle_replicated_result(&self, replicated: &ReplicatedEvalResult) -> anyhow::Result<()> {
        let Some(threshold) = replicated
            .state
            .as_ref()
            .and_then(|state| state.gc_threshold)
        else {
            return Ok(());
        };
        let mut state = self.state.write().map_err(poisoned)?;
        state.gc_threshold.forward(threshold);
        Ok(())
    }

    /// Reject operations at or below the GC threshold.
    pub fn check_read_timestamp(&self, ts: Timestamp) -> anyhow::Result<()> {
        let state = self.state.read().map_err(poisoned)?;
        anyhow::ensure!(
            state.gc_threshold.permits_read_at(ts),
            "batch timestamp {ts} must be after replica GC threshold {}",
            state.gc_threshold.timestamp()
        );
        Ok(())
    }

    pub fn read(&self, key: &[u8], ts: Timestamp) -> anyhow::Result<Option<Vec<u8>>> {
        let _latches = self.latches.acquire(point_latch(SpanAccess::ReadOnly, key, ts));
        self.check_key(key)?;
        self.check_read_timestamp(ts)?;
        mvcc::get(self.engine.as_ref(), key, ts)
    }

    /// Write `value` at `ts`; an empty value writes a tombstone.
    pub fn write(&self, key: &[u8], ts: Timestamp, value: &[u8]) -> anyhow::Result<()> {
        let _latches = self.latches.acquire(point_latch(SpanAccess::ReadWrite, key, ts));
        self.check_key(key)?;
        self.check_read_timestamp(ts)?;
        let mut batch = Batch::new(self.engine.as_ref());
        let mut delta = MvccStats::default();
        mvcc::put(&mut batch, &mut delta, key, ts, value)?;
        batch.commit()?;
        *self.stats.lock().map_err(poisoned)? += delta;
        Ok(())
    }

    fn check_key(&self, key: &[u8]) -> anyhow::Result<()> {
        let state = self.state.read().map_err(poisoned)?;
        anyhow::ensure!(
            state.desc.contains_key(key),
            "key {key:?} is outside of {}",
            state.desc.range_id
        );
        Ok(())
    }
}
