//! Command evaluation against a range.
//!
//! Each command comes in two halves: a declaration that maps the request to
//! the latches it needs, and an evaluation that runs once those latches are
//! held and turns the request into a write batch plus an `EvalResult`.
//! Acquiring latches and replicating the result belong to the caller.

pub mod cmd_gc;
pub mod result;

use std::fmt;

use crate::api::{BatchHeader, GcRequest};
use crate::hlc::Timestamp;
use crate::keys::{RangeDescriptor, RangeId};
use crate::mvcc::MvccStats;

/// Range identity needed while declaring latches.
pub trait ImmutableRangeState {
    fn range_id(&self) -> RangeId;
    fn start_key(&self) -> &[u8];
}

impl ImmutableRangeState for RangeDescriptor {
    fn range_id(&self) -> RangeId {
        self.range_id
    }

    fn start_key(&self) -> &[u8] {
        &self.start_key
    }
}

/// Testing knobs for command evaluation. Every knob defaults to off.
#[derive(Clone, Debug, Default)]
pub struct EvalKnobs {
    /// Let a single GC request both advance the threshold and collect keys.
    pub allow_gc_with_new_threshold_and_keys: bool,
}

/// Replica-scoped view used while evaluating a command.
pub trait EvalContext {
    fn range_id(&self) -> RangeId;
    /// Whether `key` is inside the range's current bounds.
    fn contains_key(&self, key: &[u8]) -> bool;
    /// Current GC threshold of the range.
    fn gc_threshold(&self) -> Timestamp;
    fn eval_knobs(&self) -> &EvalKnobs;
}

pub struct CommandArgs<'a> {
    pub eval_ctx: &'a dyn EvalContext,
    pub header: BatchHeader,
    pub args: &'a GcRequest,
    /// Accounting sink for everything the command writes or erases.
    pub stats: &'a mut MvccStats,
}

/// An internal invariant was violated. Indicates a caller bug rather than a
/// transient failure, so it must never be retried.
#[derive(Debug, Clone)]
pub struct AssertionFailure {
    message: String,
}

impl AssertionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for AssertionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "assertion failed: {}", self.message)
    }
}

impl std::error::Error for AssertionFailure {}

/// Returns `true` when `err` (or anything in its chain) is an `AssertionFailure`.
pub fn is_assertion_failure(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<AssertionFailure>().is_some())
}
