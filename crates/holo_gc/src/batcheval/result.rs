//! Evaluation results handed to the replication layer.

use crate::hlc::Timestamp;
use crate::mvcc::GcCount;

/// In-memory replica state changes that every replica must install when it
/// applies the command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicaStateDelta {
    pub gc_threshold: Option<Timestamp>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicatedEvalResult {
    pub state: Option<ReplicaStateDelta>,
}

impl ReplicatedEvalResult {
    pub fn is_empty(&self) -> bool {
        self.state.is_none()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EvalResult {
    /// What the erase pass removed.
    pub gc: GcCount,
    pub replicated: ReplicatedEvalResult,
}

impl EvalResult {
    pub fn new_gc_threshold(&self) -> Option<Timestamp> {
        self.replicated
            .state
            .as_ref()
            .and_then(|state| state.gc_threshold)
    }
}
