//! MVCC garbage collection for HoloStore ranges.
//!
//! The GC queue scans a range, finds versions that fell out of the retention
//! window, and sends them back as `GcRequest`s. Each request is processed in
//! two steps: `batcheval::cmd_gc::declare_keys_gc` computes the latches it
//! needs, and once those are held `batcheval::cmd_gc::gc` erases the versions
//! and/or advances the range's GC threshold, producing a write batch and an
//! `EvalResult` for replication. `replica::Replica` ties both steps to a
//! storage engine for single-node use, holding the declared latches in a
//! `latch::LatchManager` for the whole command.

pub mod api;
pub mod batcheval;
pub mod engine;
pub mod hlc;
pub mod keys;
pub mod latch;
pub mod mvcc;
pub mod replica;
pub mod spanset;
pub mod state_loader;
pub mod threshold;

pub use api::{BatchHeader, GcKey, GcRequest};
pub use batcheval::result::{EvalResult, ReplicaStateDelta, ReplicatedEvalResult};
pub use batcheval::{is_assertion_failure, AssertionFailure, EvalContext, EvalKnobs};
pub use engine::{Batch, Engine, FjallEngine, MemEngine};
pub use hlc::Timestamp;
pub use keys::{RangeDescriptor, RangeId};
pub use mvcc::{GcCount, MvccStats};
pub use replica::Replica;
pub use threshold::GcThreshold;
