//! Per-subsystem dirty tracking that drives auto-save and incremental saves.

mod incremental;

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use tracing::{debug, warn};

use crate::canonical::Fnv1a;
use crate::sync;

pub use incremental::{
    AutoSaveSchedule, DirtySystemFilter, IncrementalSaver, PerformanceMetrics,
};

const FULL_SAVE_DIRTY_RATIO: f64 = 0.60;
const BYTES_PER_ESTIMATED_MS: usize = 100 * 1024;
const FAST_HASH_HEAD: usize = 256;
const FAST_HASH_TAIL: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum DirtyLevel {
    Clean,
    Dirty,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubsystemState {
    pub name: String,
    pub level: DirtyLevel,
    pub estimated_bytes: usize,
    pub change_count: u64,
    pub content_hash: u64,
    #[serde(skip)]
    pub last_modified_at: Instant,
    #[serde(skip)]
    pub last_saved_at: Instant,
}

impl SubsystemState {
    fn new(name: &str, estimated_bytes: usize, now: Instant) -> Self {
        Self {
            name: name.to_string(),
            level: DirtyLevel::Clean,
            estimated_bytes,
            change_count: 0,
            content_hash: 0,
            last_modified_at: now,
            last_saved_at: now,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.level != DirtyLevel::Clean
    }

    pub fn is_critical(&self) -> bool {
        self.level == DirtyLevel::Critical
    }

    pub fn time_since_last_save(&self) -> Duration {
        self.last_saved_at.elapsed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeKind {
    Modified,
    Created,
    Deleted,
    BulkUpdate,
    StateReset,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    pub system: String,
    pub kind: ChangeKind,
    pub affected_entities: usize,
    pub size_delta: isize,
    pub description: String,
    pub at: SystemTime,
}

impl ChangeEvent {
    pub fn new(system: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            system: system.into(),
            kind,
            affected_entities: 1,
            size_delta: 0,
            description: String::new(),
            at: SystemTime::now(),
        }
    }

    pub fn with_size_delta(mut self, delta: isize) -> Self {
        self.size_delta = delta;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct DirtyTrackerConfig {
    pub enable_auto_save: bool,
    pub dirty_time_threshold: Duration,
    pub max_dirty_systems: usize,
    pub max_dirty_bytes: usize,
    pub immediate_save_on_critical: bool,
    pub enable_content_hashing: bool,
    pub fast_hash_mode: bool,
    pub max_history: usize,
}

impl Default for DirtyTrackerConfig {
    fn default() -> Self {
        Self {
            enable_auto_save: true,
            dirty_time_threshold: Duration::from_secs(300),
            max_dirty_systems: 3,
            max_dirty_bytes: 1024 * 1024,
            immediate_save_on_critical: true,
            enable_content_hashing: true,
            fast_hash_mode: true,
            max_history: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SaveStrategy {
    NoSaveNeeded,
    Priority,
    Full,
    Incremental,
}

impl SaveStrategy {
    pub fn description(self) -> &'static str {
        match self {
            Self::NoSaveNeeded => "no save needed, all systems clean",
            Self::Priority => "priority save, critical systems first",
            Self::Full => "full save of every system",
            Self::Incremental => "incremental save of dirty systems",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SaveOptimizationHints {
    pub recommend_full_save: bool,
    pub recommend_incremental_save: bool,
    pub priority_systems: Vec<String>,
    pub deferrable_systems: Vec<String>,
    pub total_dirty_bytes: usize,
    pub dirty_byte_ratio: f64,
    pub estimated_save_time_ms: u64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackerStats {
    pub total_systems: usize,
    pub dirty_systems: usize,
    pub clean_systems: usize,
    pub critical_systems: usize,
    pub total_changes_tracked: u64,
    pub auto_save_triggers: u64,
    pub immediate_save_triggers: u64,
    pub estimated_dirty_bytes: usize,
    pub estimated_total_bytes: usize,
    pub time_since_last_save: Option<Duration>,
}

impl TrackerStats {
    pub fn render_human_readable(&self) -> String {
        let last_save = self
            .time_since_last_save
            .map_or_else(|| "never".to_string(), |age| format!("{}s ago", age.as_secs()));
        format!(
            "systems={} dirty={} critical={} clean={} changes={} dirty_bytes={} total_bytes={} last_save={}",
            self.total_systems,
            self.dirty_systems,
            self.critical_systems,
            self.clean_systems,
            self.total_changes_tracked,
            self.estimated_dirty_bytes,
            self.estimated_total_bytes,
            last_save
        )
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    systems: BTreeMap<String, SubsystemState>,
    events: VecDeque<ChangeEvent>,
    total_changes: u64,
    last_save: Option<Instant>,
}

/// Thread-safe registry of subsystem dirty state.
pub struct DirtyTracker {
    config: RwLock<DirtyTrackerConfig>,
    state: Mutex<TrackerState>,
    callback: RwLock<Option<ChangeCallback>>,
    auto_save_triggers: AtomicU64,
    immediate_save_triggers: AtomicU64,
}

impl std::fmt::Debug for DirtyTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirtyTracker")
            .field("config", &self.config())
            .field("systems", &self.system_names())
            .finish_non_exhaustive()
    }
}

impl Default for DirtyTracker {
    fn default() -> Self {
        Self::new(DirtyTrackerConfig::default())
    }
}

impl DirtyTracker {
    pub fn new(config: DirtyTrackerConfig) -> Self {
        Self {
            config: RwLock::new(config),
            state: Mutex::new(TrackerState::default()),
            callback: RwLock::new(None),
            auto_save_triggers: AtomicU64::new(0),
            immediate_save_triggers: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> DirtyTrackerConfig {
        sync::read(&self.config, "tracker_config_read").clone()
    }

    pub fn update_config(&self, config: DirtyTrackerConfig) {
        *sync::write(&self.config, "tracker_config_write") = config;
        let max_history = self.config().max_history;
        let mut state = sync::lock(&self.state, "tracker_trim_history");
        while state.events.len() > max_history {
            state.events.pop_front();
        }
    }

    /// Registering an existing name is a no-op.
    pub fn register_system(&self, name: &str, estimated_bytes: usize) {
        let mut state = sync::lock(&self.state, "tracker_register");
        if state.systems.contains_key(name) {
            return;
        }
        state
            .systems
            .insert(name.to_string(), SubsystemState::new(name, estimated_bytes, Instant::now()));
        debug!(system = name, estimated_bytes, "dirty_tracker_registered");
    }

    pub fn unregister_system(&self, name: &str) -> bool {
        sync::lock(&self.state, "tracker_unregister")
            .systems
            .remove(name)
            .is_some()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        sync::lock(&self.state, "tracker_is_registered")
            .systems
            .contains_key(name)
    }

    pub fn system_names(&self) -> Vec<String> {
        sync::lock(&self.state, "tracker_names")
            .systems
            .keys()
            .cloned()
            .collect()
    }

    /// Raises `name` to at least `level`. A Dirty mark never downgrades a
    /// Critical system. Returns false for unregistered names.
    pub fn mark_dirty(&self, name: &str, level: DirtyLevel) -> bool {
        if level == DirtyLevel::Clean {
            return self.mark_clean(name);
        }
        let immediate_on_critical = self.config().immediate_save_on_critical;
        let mut state = sync::lock(&self.state, "tracker_mark_dirty");
        let Some(system) = state.systems.get_mut(name) else {
            warn!(system = name, "mark_dirty_unregistered_system");
            return false;
        };

        let became_critical = level == DirtyLevel::Critical && !system.is_critical();
        system.level = system.level.max(level);
        system.change_count += 1;
        system.last_modified_at = Instant::now();
        state.total_changes += 1;

        if became_critical && immediate_on_critical {
            self.immediate_save_triggers.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    pub fn mark_many_dirty(&self, names: &[String], level: DirtyLevel) {
        for name in names {
            self.mark_dirty(name, level);
        }
    }

    pub fn mark_clean(&self, name: &str) -> bool {
        let now = Instant::now();
        let mut state = sync::lock(&self.state, "tracker_mark_clean");
        let Some(system) = state.systems.get_mut(name) else {
            return false;
        };
        let was_dirty = system.is_dirty();
        system.level = DirtyLevel::Clean;
        system.last_saved_at = now;
        if was_dirty {
            state.last_save = Some(now);
        }
        true
    }

    pub fn mark_many_clean(&self, names: &[String]) {
        for name in names {
            self.mark_clean(name);
        }
    }

    pub fn mark_all_clean(&self) {
        let now = Instant::now();
        let mut state = sync::lock(&self.state, "tracker_mark_all_clean");
        for system in state.systems.values_mut() {
            system.level = DirtyLevel::Clean;
            system.last_saved_at = now;
        }
        state.last_save = Some(now);
    }

    pub fn set_estimated_size(&self, name: &str, estimated_bytes: usize) -> bool {
        let mut state = sync::lock(&self.state, "tracker_set_size");
        match state.systems.get_mut(name) {
            Some(system) => {
                system.estimated_bytes = estimated_bytes;
                true
            }
            None => false,
        }
    }

    /// Records a change event, marks the system dirty and applies the size
    /// delta. History is capped at `max_history` entries.
    pub fn record_change(&self, event: ChangeEvent) -> bool {
        let max_history = self.config().max_history;
        {
            let mut state = sync::lock(&self.state, "tracker_record_change");
            let Some(system) = state.systems.get_mut(&event.system) else {
                warn!(system = %event.system, "change_event_for_unregistered_system");
                return false;
            };
            system.estimated_bytes = system.estimated_bytes.saturating_add_signed(event.size_delta);
            system.level = system.level.max(DirtyLevel::Dirty);
            system.change_count += 1;
            system.last_modified_at = Instant::now();
            state.total_changes += 1;
            state.events.push_back(event.clone());
            while state.events.len() > max_history {
                state.events.pop_front();
            }
        }

        let callback = sync::read(&self.callback, "tracker_callback_read").clone();
        if let Some(callback) = callback {
            callback(&event);
        }
        true
    }

    pub fn set_change_callback<F>(&self, callback: F)
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        *sync::write(&self.callback, "tracker_callback_write") = Some(Arc::new(callback));
    }

    pub fn recent_events(&self, count: usize) -> Vec<ChangeEvent> {
        let state = sync::lock(&self.state, "tracker_recent_events");
        let skip = state.events.len().saturating_sub(count);
        state.events.iter().skip(skip).cloned().collect()
    }

    pub fn clear_event_history(&self) {
        sync::lock(&self.state, "tracker_clear_events").events.clear();
    }

    /// Stores a new content hash for `name`. Returns true, and marks the
    /// system dirty, when the hash differs from the stored one.
    pub fn update_content_hash(&self, name: &str, bytes: &[u8]) -> bool {
        let config = self.config();
        if !config.enable_content_hashing {
            return false;
        }
        let hash = content_hash(bytes, config.fast_hash_mode);
        let mut state = sync::lock(&self.state, "tracker_update_hash");
        let Some(system) = state.systems.get_mut(name) else {
            return false;
        };
        if system.content_hash == hash {
            return false;
        }
        system.content_hash = hash;
        system.estimated_bytes = bytes.len();
        system.level = system.level.max(DirtyLevel::Dirty);
        system.change_count += 1;
        system.last_modified_at = Instant::now();
        state.total_changes += 1;
        true
    }

    pub fn update_content_hash_from_json(&self, name: &str, value: &serde_json::Value) -> bool {
        match serde_json::to_vec(value) {
            Ok(bytes) => self.update_content_hash(name, &bytes),
            Err(error) => {
                warn!(system = name, error = %error, "content_hash_serialize_failed");
                false
            }
        }
    }

    /// Unknown systems and disabled hashing report "changed".
    pub fn has_content_changed(&self, name: &str, bytes: &[u8]) -> bool {
        let config = self.config();
        if !config.enable_content_hashing || bytes.is_empty() {
            return true;
        }
        let hash = content_hash(bytes, config.fast_hash_mode);
        sync::lock(&self.state, "tracker_has_changed")
            .systems
            .get(name)
            .map_or(true, |system| system.content_hash != hash)
    }

    pub fn state(&self, name: &str) -> Option<SubsystemState> {
        sync::lock(&self.state, "tracker_state").systems.get(name).cloned()
    }

    pub fn all_states(&self) -> Vec<SubsystemState> {
        sync::lock(&self.state, "tracker_all_states")
            .systems
            .values()
            .cloned()
            .collect()
    }

    pub fn is_dirty(&self, name: &str) -> bool {
        self.state(name).is_some_and(|system| system.is_dirty())
    }

    pub fn has_dirty_systems(&self) -> bool {
        self.dirty_count() > 0
    }

    pub fn has_critical_changes(&self) -> bool {
        sync::lock(&self.state, "tracker_has_critical")
            .systems
            .values()
            .any(SubsystemState::is_critical)
    }

    pub fn dirty_count(&self) -> usize {
        sync::lock(&self.state, "tracker_dirty_count")
            .systems
            .values()
            .filter(|system| system.is_dirty())
            .count()
    }

    pub fn dirty_systems(&self) -> Vec<String> {
        self.names_where(SubsystemState::is_dirty)
    }

    pub fn critical_systems(&self) -> Vec<String> {
        self.names_where(SubsystemState::is_critical)
    }

    pub fn clean_systems(&self) -> Vec<String> {
        self.names_where(|system| !system.is_dirty())
    }

    fn names_where(&self, predicate: impl Fn(&SubsystemState) -> bool) -> Vec<String> {
        sync::lock(&self.state, "tracker_names_where")
            .systems
            .values()
            .filter(|system| predicate(system))
            .map(|system| system.name.clone())
            .collect()
    }

    /// True when a dirty system has gone unsaved past the time threshold or
    /// the dirty count or dirty bytes reach their limits.
    pub fn should_trigger_auto_save(&self) -> bool {
        let config = self.config();
        if !config.enable_auto_save {
            return false;
        }
        let triggered = {
            let state = sync::lock(&self.state, "tracker_auto_save");
            let mut dirty_count = 0usize;
            let mut dirty_bytes = 0usize;
            let mut aged = false;
            for system in state.systems.values().filter(|system| system.is_dirty()) {
                dirty_count += 1;
                dirty_bytes = dirty_bytes.saturating_add(system.estimated_bytes);
                aged |= system.time_since_last_save() >= config.dirty_time_threshold;
            }
            aged || dirty_count >= config.max_dirty_systems || dirty_bytes >= config.max_dirty_bytes
        };
        if triggered {
            self.auto_save_triggers.fetch_add(1, Ordering::Relaxed);
        }
        triggered
    }

    pub fn should_trigger_immediate_save(&self) -> bool {
        self.config().immediate_save_on_critical && self.has_critical_changes()
    }

    pub fn auto_save_trigger_reason(&self) -> String {
        let config = self.config();
        let state = sync::lock(&self.state, "tracker_trigger_reason");
        let dirty = state
            .systems
            .values()
            .filter(|system| system.is_dirty())
            .collect::<Vec<_>>();
        let dirty_bytes = dirty
            .iter()
            .fold(0usize, |sum, system| sum.saturating_add(system.estimated_bytes));

        if dirty.iter().any(|system| system.is_critical()) {
            "critical changes detected".to_string()
        } else if dirty
            .iter()
            .any(|system| system.time_since_last_save() >= config.dirty_time_threshold)
        {
            format!(
                "changes older than {} seconds",
                config.dirty_time_threshold.as_secs()
            )
        } else if dirty.len() >= config.max_dirty_systems {
            format!(
                "{} dirty systems (threshold: {})",
                dirty.len(),
                config.max_dirty_systems
            )
        } else if dirty_bytes >= config.max_dirty_bytes {
            format!(
                "estimated dirty size {dirty_bytes} bytes (threshold: {})",
                config.max_dirty_bytes
            )
        } else {
            "no auto-save trigger met".to_string()
        }
    }

    pub fn save_optimization_hints(&self) -> SaveOptimizationHints {
        let config = self.config();
        let state = sync::lock(&self.state, "tracker_hints");

        let mut dirty_count = 0usize;
        let mut dirty_bytes = 0usize;
        let mut total_bytes = 0usize;
        for system in state.systems.values() {
            total_bytes = total_bytes.saturating_add(system.estimated_bytes);
            if system.is_dirty() {
                dirty_count += 1;
                dirty_bytes = dirty_bytes.saturating_add(system.estimated_bytes);
            }
        }

        if dirty_count == 0 {
            return SaveOptimizationHints {
                reason: "no dirty systems".to_string(),
                ..SaveOptimizationHints::default()
            };
        }

        let ratio = if total_bytes > 0 {
            dirty_bytes as f64 / total_bytes as f64
        } else {
            0.0
        };
        let recommend_full_save = ratio > FULL_SAVE_DIRTY_RATIO;

        let mut critical = Vec::new();
        let mut aged = Vec::new();
        let mut deferrable = Vec::new();
        for system in state.systems.values().filter(|system| system.is_dirty()) {
            if system.is_critical() {
                critical.push(system);
            } else if system.time_since_last_save() > config.dirty_time_threshold {
                aged.push(system);
            } else {
                deferrable.push(system.name.clone());
            }
        }
        let priority_bytes = critical
            .iter()
            .chain(aged.iter())
            .fold(0usize, |sum, system| sum.saturating_add(system.estimated_bytes));
        let priority_systems = critical
            .into_iter()
            .chain(aged)
            .map(|system| system.name.clone())
            .collect();

        let reason = if recommend_full_save {
            "over 60% of data dirty by bytes, full save is cheaper".to_string()
        } else {
            format!(
                "{dirty_count} dirty systems ({}% by bytes), incremental save recommended",
                (ratio * 100.0) as u32
            )
        };

        SaveOptimizationHints {
            recommend_full_save,
            recommend_incremental_save: !recommend_full_save,
            priority_systems,
            deferrable_systems: deferrable,
            total_dirty_bytes: dirty_bytes,
            dirty_byte_ratio: ratio,
            estimated_save_time_ms: (priority_bytes / BYTES_PER_ESTIMATED_MS) as u64,
            reason,
        }
    }

    pub fn recommend_save_strategy(&self) -> SaveStrategy {
        if !self.has_dirty_systems() {
            return SaveStrategy::NoSaveNeeded;
        }
        if self.has_critical_changes() {
            return SaveStrategy::Priority;
        }
        if self.save_optimization_hints().recommend_full_save {
            SaveStrategy::Full
        } else {
            SaveStrategy::Incremental
        }
    }

    pub fn stats(&self) -> TrackerStats {
        let state = sync::lock(&self.state, "tracker_stats");
        let mut stats = TrackerStats {
            total_systems: state.systems.len(),
            total_changes_tracked: state.total_changes,
            auto_save_triggers: self.auto_save_triggers.load(Ordering::Relaxed),
            immediate_save_triggers: self.immediate_save_triggers.load(Ordering::Relaxed),
            time_since_last_save: state.last_save.map(|at| at.elapsed()),
            ..TrackerStats::default()
        };
        for system in state.systems.values() {
            stats.estimated_total_bytes = stats.estimated_total_bytes.saturating_add(system.estimated_bytes);
            match system.level {
                DirtyLevel::Clean => stats.clean_systems += 1,
                DirtyLevel::Dirty => stats.dirty_systems += 1,
                DirtyLevel::Critical => {
                    stats.dirty_systems += 1;
                    stats.critical_systems += 1;
                }
            }
            if system.is_dirty() {
                stats.estimated_dirty_bytes =
                    stats.estimated_dirty_bytes.saturating_add(system.estimated_bytes);
            }
        }
        stats
    }

    pub fn reset_stats(&self) {
        self.auto_save_triggers.store(0, Ordering::Relaxed);
        self.immediate_save_triggers.store(0, Ordering::Relaxed);
        sync::lock(&self.state, "tracker_reset_stats").total_changes = 0;
    }
}

/// Content hash used for change detection.
pub fn content_hash(bytes: &[u8], fast: bool) -> u64 {
    if fast {
        hash_fast(bytes)
    } else {
        hash_fnv1a(bytes)
    }
}

pub fn hash_fnv1a(bytes: &[u8]) -> u64 {
    let mut hasher = Fnv1a::default();
    hasher.write(bytes);
    hasher.finish()
}

/// Samples the head, the middle and the last 1KB instead of every byte.
pub fn hash_fast(bytes: &[u8]) -> u64 {
    let size = bytes.len();
    let mut hash = size as u64;
    for byte in &bytes[..size.min(FAST_HASH_HEAD)] {
        hash = hash.wrapping_mul(31).wrapping_add(u64::from(*byte));
    }
    if size > FAST_HASH_HEAD * 3 {
        let start = size / 2 - FAST_HASH_HEAD / 2;
        for byte in &bytes[start..start + FAST_HASH_HEAD] {
            hash = hash.wrapping_mul(31).wrapping_add(u64::from(*byte));
        }
    }
    if size > FAST_HASH_TAIL {
        hash ^= hash_fnv1a(&bytes[size - FAST_HASH_TAIL..]);
    }
    hash
}
