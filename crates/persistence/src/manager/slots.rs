use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use tracing::debug;

use crate::error::{OperationKind, SaveError, SaveResult};
use crate::sync;

#[derive(Debug)]
struct SlotCounts {
    max_saves: usize,
    max_loads: usize,
    active_saves: usize,
    active_loads: usize,
    peak: usize,
}

impl SlotCounts {
    fn has_room(&self, kind: OperationKind) -> bool {
        match kind {
            OperationKind::Save => self.active_saves < self.max_saves,
            OperationKind::Load => self.active_loads < self.max_loads,
        }
    }

    fn active_mut(&mut self, kind: OperationKind) -> &mut usize {
        match kind {
            OperationKind::Save => &mut self.active_saves,
            OperationKind::Load => &mut self.active_loads,
        }
    }
}

/// Counting semaphore with independent save and load limits.
#[derive(Debug)]
pub(crate) struct SlotPool {
    counts: Mutex<SlotCounts>,
    released: Condvar,
}

impl SlotPool {
    pub(crate) fn new(max_saves: usize, max_loads: usize) -> Arc<Self> {
        Arc::new(Self {
            counts: Mutex::new(SlotCounts {
                max_saves,
                max_loads,
                active_saves: 0,
                active_loads: 0,
                peak: 0,
            }),
            released: Condvar::new(),
        })
    }

    /// Blocks until a slot of `kind` frees up or `deadline` passes.
    pub(crate) fn acquire(self: &Arc<Self>, kind: OperationKind, deadline: Instant) -> SaveResult<SlotGuard> {
        let started = Instant::now();
        let mut counts = sync::lock(&self.counts, "slot_acquire");
        while !counts.has_room(kind) {
            let now = Instant::now();
            if now >= deadline {
                return Err(SaveError::ConcurrencyLimitExceeded {
                    kind,
                    timeout: deadline.saturating_duration_since(started),
                });
            }
            counts = match self.released.wait_timeout(counts, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }

        *counts.active_mut(kind) += 1;
        let in_flight = counts.active_saves + counts.active_loads;
        counts.peak = counts.peak.max(in_flight);
        debug!(kind = %kind, in_flight, "slot_acquired");
        Ok(SlotGuard {
            pool: Arc::clone(self),
            kind,
        })
    }

    pub(crate) fn set_limits(&self, max_saves: usize, max_loads: usize) {
        {
            let mut counts = sync::lock(&self.counts, "slot_set_limits");
            counts.max_saves = max_saves;
            counts.max_loads = max_loads;
        }
        self.released.notify_all();
    }

    pub(crate) fn active(&self) -> (usize, usize) {
        let counts = sync::lock(&self.counts, "slot_active");
        (counts.active_saves, counts.active_loads)
    }

    pub(crate) fn peak(&self) -> usize {
        sync::lock(&self.counts, "slot_peak").peak
    }

    pub(crate) fn reset_peak(&self) {
        let mut counts = sync::lock(&self.counts, "slot_reset_peak");
        counts.peak = counts.active_saves + counts.active_loads;
    }

    fn release(&self, kind: OperationKind) {
        {
            let mut counts = sync::lock(&self.counts, "slot_release");
            let active = counts.active_mut(kind);
            *active = active.saturating_sub(1);
        }
        self.released.notify_all();
    }
}

/// Held for the duration of one operation; dropping it frees the slot even
/// when the operation fails or panics.
#[derive(Debug)]
pub(crate) struct SlotGuard {
    pool: Arc<SlotPool>,
    kind: OperationKind,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.pool.release(self.kind);
    }
}
