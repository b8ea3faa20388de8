//! In-process latch table.
//!
//! A command declares its spans up front and blocks in `acquire` until no
//! held span set conflicts with them. The returned guard releases the spans
//! on drop and wakes every waiter so each can re-check its own conflicts.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::spanset::SpanSet;

#[derive(Debug, Default)]
struct LatchTable {
    next_id: u64,
    held: Vec<(u64, Arc<SpanSet>)>,
}

#[derive(Debug, Default)]
pub struct LatchManager {
    table: Mutex<LatchTable>,
    released: Condvar,
}

impl LatchManager {
    pub fn new() -> Self {
        Self::default()
    }

    // The table is plain bookkeeping, so a panic elsewhere cannot leave it
    // half-updated.
    fn lock(&self) -> MutexGuard<'_, LatchTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until `spans` conflicts with no held latch, then hold it.
    pub fn acquire(&self, spans: SpanSet) -> LatchGuard<'_> {
        let spans = Arc::new(spans);
        let mut table = self.lock();
        while table
            .held
            .iter()
            .any(|(_, held)| held.conflicts_with(&spans))
        {
            table = self
                .released
                .wait(table)
                .unwrap_or_else(PoisonError::into_inner);
        }
        let id = table.next_id;
        table.next_id += 1;
        table.held.push((id, Arc::clone(&spans)));
        LatchGuard {
            manager: self,
            id,
            spans,
        }
    }

    /// Number of span sets currently held.
    pub fn held(&self) -> usize {
        self.lock().held.len()
    }
}

/// Held latches; released when dropped.
#[derive(Debug)]
pub struct LatchGuard<'a> {
    manager: &'a LatchManager,
    id: u64,
    spans: Arc<SpanSet>,
}

impl LatchGuard<'_> {
    pub fn spans(&self) -> &SpanSet {
        &self.spans
    }
}

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        {
            let mut table = self.manager.lock();
            table.held.retain(|(id, _)| *id != self.id);
        }
        self.manager.released.notify_all();
    }
}
