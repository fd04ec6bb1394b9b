use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::error::{OperationKind, SaveError, SaveResult};
use crate::sync;

const PERMILLE_SCALE: f32 = 10.0;
/// Upper bound on any deadline offset; `Instant` addition panics on overflow.
const MAX_DEADLINE_OFFSET: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `start + timeout`, saturating at a century out instead of overflowing.
pub(crate) fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout.min(MAX_DEADLINE_OFFSET))
        .or_else(|| start.checked_add(Duration::from_secs(24 * 60 * 60)))
        .unwrap_or(start)
}

/// Shared progress handle for one running operation.
#[derive(Debug)]
pub struct OperationProgress {
    cancelled: AtomicBool,
    completed: AtomicBool,
    permille: AtomicU32,
    stage: Mutex<String>,
    started: Instant,
}

impl Default for OperationProgress {
    fn default() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            permille: AtomicU32::new(0),
            stage: Mutex::new(String::new()),
            started: Instant::now(),
        }
    }
}

impl OperationProgress {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_complete(&self) {
        self.update(100.0, "complete");
        self.completed.store(true, Ordering::SeqCst);
    }

    /// `percent` is clamped to 0..=100.
    pub fn update(&self, percent: f32, stage: &str) {
        let permille = (percent.clamp(0.0, 100.0) * PERMILLE_SCALE).round() as u32;
        self.permille.store(permille, Ordering::SeqCst);
        let mut current = sync::lock(&self.stage, "progress_stage_write");
        current.clear();
        current.push_str(stage);
    }

    pub fn percent(&self) -> f32 {
        self.permille.load(Ordering::SeqCst) as f32 / PERMILLE_SCALE
    }

    pub fn stage(&self) -> String {
        sync::lock(&self.stage, "progress_stage_read").clone()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Linear extrapolation from elapsed time and percent done.
    pub fn estimated_remaining(&self) -> Option<Duration> {
        let percent = self.percent();
        if percent <= 0.0 {
            return None;
        }
        let elapsed = self.elapsed().as_secs_f64();
        let total = elapsed * 100.0 / f64::from(percent);
        Some(Duration::from_secs_f64((total - elapsed).max(0.0)))
    }
}

#[derive(Debug, Clone)]
pub struct OperationRecord {
    pub id: String,
    pub filename: String,
    pub kind: OperationKind,
    pub progress: Arc<OperationProgress>,
    pub started_at: Instant,
    pub deadline: Instant,
}

/// Serializable view of a running operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationSnapshot {
    pub id: String,
    pub filename: String,
    pub kind: &'static str,
    pub percent: f32,
    pub stage: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Default)]
pub(crate) struct OperationTable {
    records: RwLock<HashMap<String, OperationRecord>>,
    counter: AtomicU64,
}

impl OperationTable {
    pub(crate) fn next_id(&self, kind: OperationKind) -> String {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_nanos());
        format!("{}_{counter}_{nanos}", kind.as_str())
    }

    pub(crate) fn register(
        self: &Arc<Self>,
        kind: OperationKind,
        filename: &str,
        timeout: Duration,
    ) -> OperationRegistration {
        let started_at = Instant::now();
        let record = OperationRecord {
            id: self.next_id(kind),
            filename: filename.to_string(),
            kind,
            progress: Arc::new(OperationProgress::default()),
            started_at,
            deadline: deadline_after(started_at, timeout),
        };
        sync::write(&self.records, "operations_register").insert(record.id.clone(), record.clone());
        OperationRegistration {
            table: Arc::clone(self),
            record,
        }
    }

    pub(crate) fn get(&self, id: &str) -> Option<OperationRecord> {
        sync::read(&self.records, "operations_get").get(id).cloned()
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        let mut ids = sync::read(&self.records, "operations_ids")
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub(crate) fn snapshots(&self) -> Vec<OperationSnapshot> {
        let mut snapshots = sync::read(&self.records, "operations_snapshots")
            .values()
            .map(|record| OperationSnapshot {
                id: record.id.clone(),
                filename: record.filename.clone(),
                kind: record.kind.as_str(),
                percent: record.progress.percent(),
                stage: record.progress.stage(),
                elapsed_ms: record.started_at.elapsed().as_millis() as u64,
            })
            .collect::<Vec<_>>();
        snapshots.sort_by(|left, right| left.id.cmp(&right.id));
        snapshots
    }

    pub(crate) fn cancel(&self, id: &str) -> bool {
        match sync::read(&self.records, "operations_cancel").get(id) {
            Some(record) => {
                record.progress.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn cancel_all(&self) -> usize {
        let records = sync::read(&self.records, "operations_cancel_all");
        for record in records.values() {
            record.progress.cancel();
        }
        records.len()
    }

    pub(crate) fn len(&self) -> usize {
        sync::read(&self.records, "operations_len").len()
    }

    fn remove(&self, id: &str) {
        sync::write(&self.records, "operations_remove").remove(id);
    }
}

/// Active-operation entry; dropping it unregisters the operation.
#[derive(Debug)]
pub(crate) struct OperationRegistration {
    table: Arc<OperationTable>,
    record: OperationRecord,
}

impl OperationRegistration {
    pub(crate) fn record(&self) -> &OperationRecord {
        &self.record
    }

    pub(crate) fn id(&self) -> &str {
        &self.record.id
    }

    pub(crate) fn progress(&self) -> &OperationProgress {
        &self.record.progress
    }

    /// Cooperative cancellation and deadline checkpoint.
    pub(crate) fn checkpoint(&self) -> SaveResult<()> {
        if self.record.progress.is_cancelled() {
            return Err(SaveError::OperationCancelled {
                operation_id: self.record.id.clone(),
            });
        }
        if Instant::now() >= self.record.deadline {
            return Err(SaveError::ConcurrencyLimitExceeded {
                kind: self.record.kind,
                timeout: self.record.deadline - self.record.started_at,
            });
        }
        Ok(())
    }
}

impl Drop for OperationRegistration {
    fn drop(&mut self) {
        self.table.remove(&self.record.id);
    }
}

/// Handle to an operation running on a worker thread.
#[derive(Debug)]
pub struct PendingOperation<T> {
    operation_id: String,
    progress: Arc<OperationProgress>,
    handle: JoinHandle<SaveResult<T>>,
}

impl<T> PendingOperation<T> {
    pub(crate) fn new(
        operation_id: String,
        progress: Arc<OperationProgress>,
        handle: JoinHandle<SaveResult<T>>,
    ) -> Self {
        Self {
            operation_id,
            progress,
            handle,
        }
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn progress(&self) -> &OperationProgress {
        &self.progress
    }

    pub fn cancel(&self) {
        self.progress.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Blocks until the worker finishes.
    pub fn wait(self) -> SaveResult<T> {
        match self.handle.join() {
            Ok(result) => result,
            Err(_) => Err(SaveError::Unknown {
                message: format!("worker for {} panicked", self.operation_id),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_kind_and_counter() {
        let table = OperationTable::default();
        let first = table.next_id(OperationKind::Save);
        let second = table.next_id(OperationKind::Load);
        assert!(first.starts_with("save_1_"));
        assert!(second.starts_with("load_2_"));
    }

    #[test]
    fn registration_unregisters_on_drop() {
        let table = Arc::new(OperationTable::default());
        let registration = table.register(OperationKind::Save, "slot", Duration::from_secs(5));
        let id = registration.id().to_string();
        assert_eq!(table.ids(), vec![id.clone()]);
        assert!(table.cancel(&id));
        assert!(registration.checkpoint().expect_err("cancelled").is_cancelled());
        drop(registration);
        assert_eq!(table.len(), 0);
        assert!(!table.cancel(&id));
    }

    #[test]
    fn expired_deadline_fails_checkpoint() {
        let table = Arc::new(OperationTable::default());
        let registration = table.register(OperationKind::Load, "slot", Duration::ZERO);
        assert!(matches!(
            registration.checkpoint(),
            Err(SaveError::ConcurrencyLimitExceeded { kind: OperationKind::Load, .. })
        ));
    }

    #[test]
    fn unbounded_timeout_saturates_instead_of_overflowing() {
        let table = Arc::new(OperationTable::default());
        let registration = table.register(OperationKind::Save, "slot", Duration::MAX);
        assert!(registration.record().deadline > Instant::now() + Duration::from_secs(3600));
        registration.checkpoint().expect("far deadline");

        let start = Instant::now();
        assert_eq!(deadline_after(start, Duration::from_secs(5)), start + Duration::from_secs(5));
    }

    #[test]
    fn progress_clamps_and_estimates() {
        let progress = OperationProgress::default();
        assert!(progress.estimated_remaining().is_none());
        progress.update(150.0, "writing");
        assert_eq!(progress.percent(), 100.0);
        assert_eq!(progress.stage(), "writing");
        progress.update(42.5, "encoding");
        assert!((progress.percent() - 42.5).abs() < 0.01);
        assert!(progress.estimated_remaining().is_some());
        progress.mark_complete();
        assert!(progress.is_complete());
    }
}
