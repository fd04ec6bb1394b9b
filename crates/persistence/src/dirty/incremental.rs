use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use super::{DirtyTracker, SaveStrategy, SubsystemState};
use crate::error::SaveResult;
use crate::sync;

const CRITICAL_PRIORITY: u64 = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PerformanceMetrics {
    pub incremental_saves: u64,
    pub full_saves: u64,
    pub total_incremental_time: Duration,
    pub total_full_time: Duration,
    pub incremental_bytes: u64,
    pub full_bytes: u64,
}

impl PerformanceMetrics {
    pub fn average_incremental_time(&self) -> Duration {
        average(self.total_incremental_time, self.incremental_saves)
    }

    pub fn average_full_time(&self) -> Duration {
        average(self.total_full_time, self.full_saves)
    }

    /// Average full-save time over average incremental-save time. Zero until
    /// both kinds have run at least once.
    pub fn speedup_ratio(&self) -> f64 {
        let incremental = self.average_incremental_time().as_secs_f64();
        let full = self.average_full_time().as_secs_f64();
        if incremental > 0.0 && full > 0.0 {
            full / incremental
        } else {
            0.0
        }
    }
}

fn average(total: Duration, count: u64) -> Duration {
    match u32::try_from(count) {
        Ok(0) => Duration::ZERO,
        Ok(count) => total / count,
        Err(_) => Duration::from_secs_f64(total.as_secs_f64() / count as f64),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutoSaveSchedule {
    pub should_save_now: bool,
    pub strategy: SaveStrategy,
    pub reason: String,
    pub systems_to_save: Vec<String>,
    pub estimated_duration_ms: u64,
}

/// Drives incremental and full saves off a [`DirtyTracker`]. The actual
/// write is delegated to the supplied closures.
#[derive(Debug)]
pub struct IncrementalSaver<'a> {
    tracker: &'a DirtyTracker,
    metrics: Mutex<PerformanceMetrics>,
}

impl<'a> IncrementalSaver<'a> {
    pub fn new(tracker: &'a DirtyTracker) -> Self {
        Self {
            tracker,
            metrics: Mutex::new(PerformanceMetrics::default()),
        }
    }

    pub fn tracker(&self) -> &DirtyTracker {
        self.tracker
    }

    /// Saves only the dirty systems and marks them clean on success. On
    /// failure the systems stay dirty.
    pub fn perform_incremental_save<F>(&self, save: F) -> SaveResult<Vec<String>>
    where
        F: FnOnce(&[String]) -> SaveResult<()>,
    {
        let dirty = self.tracker.dirty_systems();
        if dirty.is_empty() {
            return Ok(dirty);
        }

        let started = Instant::now();
        save(&dirty)?;
        let bytes = self.bytes_of(&dirty);
        self.tracker.mark_many_clean(&dirty);

        let elapsed = started.elapsed();
        {
            let mut metrics = sync::lock(&self.metrics, "incremental_metrics");
            metrics.incremental_saves += 1;
            metrics.total_incremental_time += elapsed;
            metrics.incremental_bytes += bytes;
        }
        info!(
            systems = dirty.len(),
            bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            "incremental_save_completed"
        );
        Ok(dirty)
    }

    /// Runs the strategy the tracker recommends. A full save hands every
    /// registered system to `save_full`; everything else goes through the
    /// incremental path.
    pub fn perform_smart_save<Full, Partial>(
        &self,
        save_full: Full,
        save_partial: Partial,
    ) -> SaveResult<(SaveStrategy, Vec<String>)>
    where
        Full: FnOnce(&[String]) -> SaveResult<()>,
        Partial: FnOnce(&[String]) -> SaveResult<()>,
    {
        let strategy = self.tracker.recommend_save_strategy();
        debug!(strategy = ?strategy, "smart_save_strategy");
        match strategy {
            SaveStrategy::NoSaveNeeded => Ok((strategy, Vec::new())),
            SaveStrategy::Full => {
                let all = self.tracker.system_names();
                let started = Instant::now();
                save_full(&all)?;
                let bytes = self.bytes_of(&all);
                self.tracker.mark_all_clean();
                let elapsed = started.elapsed();
                {
                    let mut metrics = sync::lock(&self.metrics, "full_metrics");
                    metrics.full_saves += 1;
                    metrics.total_full_time += elapsed;
                    metrics.full_bytes += bytes;
                }
                info!(
                    systems = all.len(),
                    bytes,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "full_save_completed"
                );
                Ok((strategy, all))
            }
            SaveStrategy::Priority | SaveStrategy::Incremental => self
                .perform_incremental_save(save_partial)
                .map(|saved| (strategy, saved)),
        }
    }

    pub fn evaluate_auto_save_schedule(&self) -> AutoSaveSchedule {
        let should_save_now =
            self.tracker.should_trigger_auto_save() || self.tracker.should_trigger_immediate_save();
        let strategy = self.tracker.recommend_save_strategy();
        let hints = self.tracker.save_optimization_hints();
        let systems_to_save = match strategy {
            SaveStrategy::Priority | SaveStrategy::Incremental => self.tracker.dirty_systems(),
            SaveStrategy::Full => self.tracker.system_names(),
            SaveStrategy::NoSaveNeeded => Vec::new(),
        };
        AutoSaveSchedule {
            should_save_now,
            strategy,
            reason: self.tracker.auto_save_trigger_reason(),
            systems_to_save,
            estimated_duration_ms: hints.estimated_save_time_ms,
        }
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        *sync::lock(&self.metrics, "saver_metrics_read")
    }

    pub fn reset_metrics(&self) {
        *sync::lock(&self.metrics, "saver_metrics_reset") = PerformanceMetrics::default();
    }

    fn bytes_of(&self, names: &[String]) -> u64 {
        names
            .iter()
            .filter_map(|name| self.tracker.state(name))
            .map(|state| state.estimated_bytes as u64)
            .sum()
    }
}

/// Views over tracker state for callers that schedule saves themselves.
pub struct DirtySystemFilter;

impl DirtySystemFilter {
    pub fn dirty(states: &[SubsystemState]) -> Vec<SubsystemState> {
        states.iter().filter(|state| state.is_dirty()).cloned().collect()
    }

    pub fn clean(states: &[SubsystemState]) -> Vec<SubsystemState> {
        states.iter().filter(|state| !state.is_dirty()).cloned().collect()
    }

    pub fn critical(states: &[SubsystemState]) -> Vec<SubsystemState> {
        states.iter().filter(|state| state.is_critical()).cloned().collect()
    }

    /// Critical first, then dirty systems oldest first, clean last.
    pub fn sort_by_priority(states: &mut [SubsystemState]) {
        states.sort_by_key(|state| std::cmp::Reverse(priority_score(state)));
    }

    pub fn sort_by_size(states: &mut [SubsystemState], largest_first: bool) {
        if largest_first {
            states.sort_by_key(|state| std::cmp::Reverse(state.estimated_bytes));
        } else {
            states.sort_by_key(|state| state.estimated_bytes);
        }
    }
}

fn priority_score(state: &SubsystemState) -> u64 {
    if state.is_critical() {
        CRITICAL_PRIORITY
    } else if state.is_dirty() {
        state.time_since_last_save().as_secs().min(CRITICAL_PRIORITY - 1)
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::dirty::{DirtyLevel, DirtyTrackerConfig};
    use crate::error::SaveError;

    fn tracker(systems: &[(&str, usize)]) -> DirtyTracker {
        let tracker = DirtyTracker::new(DirtyTrackerConfig {
            max_dirty_systems: 10,
            max_dirty_bytes: usize::MAX,
            ..DirtyTrackerConfig::default()
        });
        for (name, bytes) in systems {
            tracker.register_system(name, *bytes);
        }
        tracker
    }

    #[test]
    fn incremental_save_passes_only_dirty_systems() {
        let tracker = tracker(&[("economy", 100), ("military", 100), ("population", 100)]);
        tracker.mark_dirty("military", DirtyLevel::Dirty);
        let saver = IncrementalSaver::new(&tracker);

        let seen = RefCell::new(Vec::new());
        let saved = saver
            .perform_incremental_save(|names| {
                seen.borrow_mut().extend_from_slice(names);
                Ok(())
            })
            .expect("save");
        assert_eq!(saved, vec!["military".to_string()]);
        assert_eq!(*seen.borrow(), vec!["military".to_string()]);
        assert!(!tracker.has_dirty_systems());

        let metrics = saver.metrics();
        assert_eq!(metrics.incremental_saves, 1);
        assert_eq!(metrics.incremental_bytes, 100);
    }

    #[test]
    fn nothing_dirty_skips_the_callback() {
        let tracker = tracker(&[("economy", 1)]);
        let saver = IncrementalSaver::new(&tracker);
        let saved = saver
            .perform_incremental_save(|_| panic!("must not be called"))
            .expect("save");
        assert!(saved.is_empty());
        assert_eq!(saver.metrics().incremental_saves, 0);
    }

    #[test]
    fn failed_save_leaves_systems_dirty() {
        let tracker = tracker(&[("economy", 1)]);
        tracker.mark_dirty("economy", DirtyLevel::Dirty);
        let saver = IncrementalSaver::new(&tracker);
        let error = saver
            .perform_incremental_save(|_| {
                Err(SaveError::Unknown {
                    message: "disk gone".to_string(),
                })
            })
            .expect_err("should fail");
        assert!(matches!(error, SaveError::Unknown { .. }));
        assert!(tracker.is_dirty("economy"));
    }

    #[test]
    fn smart_save_picks_full_when_most_bytes_are_dirty() {
        let tracker = tracker(&[("map", 900), ("ui", 100)]);
        tracker.mark_dirty("map", DirtyLevel::Dirty);
        let saver = IncrementalSaver::new(&tracker);

        let (strategy, saved) = saver
            .perform_smart_save(|_| Ok(()), |_| panic!("incremental path not expected"))
            .expect("smart save");
        assert_eq!(strategy, SaveStrategy::Full);
        assert_eq!(saved.len(), 2);
        assert_eq!(saver.metrics().full_saves, 1);
        assert_eq!(saver.metrics().full_bytes, 1000);
        assert!(!tracker.has_dirty_systems());

        let (strategy, saved) = saver
            .perform_smart_save(|_| panic!("nothing to save"), |_| panic!("nothing to save"))
            .expect("noop");
        assert_eq!(strategy, SaveStrategy::NoSaveNeeded);
        assert!(saved.is_empty());
    }

    #[test]
    fn critical_change_schedules_priority_save_now() {
        let tracker = tracker(&[("tech", 10), ("map", 1000)]);
        tracker.mark_dirty("tech", DirtyLevel::Critical);
        let saver = IncrementalSaver::new(&tracker);

        let schedule = saver.evaluate_auto_save_schedule();
        assert!(schedule.should_save_now);
        assert_eq!(schedule.strategy, SaveStrategy::Priority);
        assert_eq!(schedule.systems_to_save, vec!["tech".to_string()]);
        assert_eq!(schedule.reason, "critical changes detected");
    }

    #[test]
    fn filter_orders_by_priority_and_size() {
        let tracker = tracker(&[("a", 5), ("b", 50), ("c", 500)]);
        tracker.mark_dirty("a", DirtyLevel::Dirty);
        tracker.mark_dirty("b", DirtyLevel::Critical);
        let mut states = tracker.all_states();

        assert_eq!(DirtySystemFilter::dirty(&states).len(), 2);
        assert_eq!(DirtySystemFilter::clean(&states).len(), 1);
        assert_eq!(DirtySystemFilter::critical(&states)[0].name, "b");

        DirtySystemFilter::sort_by_priority(&mut states);
        assert_eq!(states[0].name, "b");

        DirtySystemFilter::sort_by_size(&mut states, true);
        assert_eq!(states[0].name, "c");
        DirtySystemFilter::sort_by_size(&mut states, false);
        assert_eq!(states[0].name, "a");
    }

    #[test]
    fn speedup_ratio_needs_both_kinds() {
        let mut metrics = PerformanceMetrics::default();
        assert_eq!(metrics.speedup_ratio(), 0.0);
        metrics.incremental_saves = 2;
        metrics.total_incremental_time = Duration::from_millis(20);
        metrics.full_saves = 1;
        metrics.total_full_time = Duration::from_millis(50);
        assert!((metrics.speedup_ratio() - 5.0).abs() < 1e-9);
    }
}
