//! Save/load orchestration over registered subsystems.

mod files;
mod load;
mod operations;
mod save;
mod slots;
mod stats;

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::canonical::CanonicalEncoder;
use crate::config::{SaveCompression, SaveManagerConfig};
use crate::error::{OperationKind, SaveError, SaveResult};
use crate::migration::MigrationRegistry;
use crate::recovery::{CrashRecoveryManager, RecoveryReport};
use crate::storage::{OsStorage, SecurePathResolver, StorageBackend};
use crate::sync;
use crate::validation::{ValidationReport, ValidatorRegistry};
use crate::version::SaveVersion;

pub use files::SaveFileInfo;
pub use operations::{OperationProgress, OperationRecord, OperationSnapshot, PendingOperation};
pub use stats::{SaveOperationResult, SaveStats};

use operations::{OperationRegistration, OperationTable};
use slots::SlotPool;
use stats::Outcome;

const OPERATION_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A simulation subsystem whose state is persisted under a stable name.
///
/// `decode` must either apply the whole payload or leave state untouched.
/// `check_payload` runs for every present subsystem before any `decode`, so a
/// load that would fail halfway is rejected up front.
pub trait Persistable: Send + Sync {
    fn name(&self) -> &str;

    fn encode(&self, format_version: u32) -> Result<Value, String>;

    fn decode(&self, data: &Value, format_version: u32) -> Result<(), String>;

    fn check_payload(&self, _data: &Value, _format_version: u32) -> Result<(), String> {
        Ok(())
    }

    /// Called when a loaded save has no entry for this subsystem.
    fn load_default(&self) {}
}

#[derive(Debug, Clone)]
struct ValidationCacheEntry {
    modified: SystemTime,
    size: u64,
    /// Digest of the content the report was computed for.
    digest: String,
    report: ValidationReport,
}

struct Inner {
    config: RwLock<SaveManagerConfig>,
    resolver: SecurePathResolver,
    storage: Arc<dyn StorageBackend>,
    encoder: Arc<CanonicalEncoder>,
    migrations: Arc<MigrationRegistry>,
    validators: ValidatorRegistry,
    recovery: CrashRecoveryManager,
    systems: RwLock<Vec<Arc<dyn Persistable>>>,
    slots: Arc<SlotPool>,
    operations: Arc<OperationTable>,
    stats: Mutex<SaveStats>,
    validation_cache: Mutex<HashMap<PathBuf, ValidationCacheEntry>>,
    encoded_systems: Mutex<HashMap<String, Value>>,
    shutting_down: AtomicBool,
}

/// Cheaply cloneable handle; clones share all state.
#[derive(Clone)]
pub struct SaveManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SaveManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveManager")
            .field("save_dir", &self.inner.resolver.root())
            .field("systems", &self.registered_system_names())
            .field("active_operations", &self.inner.operations.len())
            .finish_non_exhaustive()
    }
}

fn check_concurrency_limits(saves: usize, loads: usize) -> SaveResult<()> {
    if saves == 0 || loads == 0 {
        return Err(SaveError::ValidationFailed {
            summary: format!("concurrency limits must be positive (saves={saves}, loads={loads})"),
            suggested_fix: Some("use at least one save and one load slot".to_string()),
        });
    }
    Ok(())
}

/// Wires explicit service instances into a [`SaveManager`].
pub struct SaveManagerBuilder {
    config: SaveManagerConfig,
    storage: Option<Arc<dyn StorageBackend>>,
    encoder: Option<Arc<CanonicalEncoder>>,
    migrations: Option<Arc<MigrationRegistry>>,
}

impl SaveManagerBuilder {
    pub fn storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn encoder(mut self, encoder: Arc<CanonicalEncoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub fn migrations(mut self, migrations: Arc<MigrationRegistry>) -> Self {
        self.migrations = Some(migrations);
        self
    }

    /// Rejects zero concurrency limits, then creates the save directory if it
    /// does not exist yet.
    pub fn build(self) -> SaveResult<SaveManager> {
        let config = self.config;
        check_concurrency_limits(config.max_concurrent_saves, config.max_concurrent_loads)?;
        fs::create_dir_all(&config.save_dir)
            .map_err(|source| SaveError::from_io(&config.save_dir, source))?;

        let encoder = self
            .encoder
            .unwrap_or_else(|| Arc::new(CanonicalEncoder::new(config.json_cache_size)));
        let migrations = self
            .migrations
            .unwrap_or_else(|| Arc::new(MigrationRegistry::with_default_migrations()));
        let storage = self.storage.unwrap_or_else(|| Arc::new(OsStorage));

        info!(
            save_dir = %config.save_dir.display(),
            version = %config.current_version,
            max_saves = config.max_concurrent_saves,
            max_loads = config.max_concurrent_loads,
            atomic = config.enable_atomic_writes,
            auto_backup = config.enable_auto_backup,
            "save_manager_initialized"
        );

        Ok(SaveManager {
            inner: Arc::new(Inner {
                resolver: SecurePathResolver::new(&config.save_dir),
                recovery: CrashRecoveryManager::new(&config.save_dir, Arc::clone(&encoder)),
                slots: SlotPool::new(config.max_concurrent_saves, config.max_concurrent_loads),
                config: RwLock::new(config),
                storage,
                encoder,
                migrations,
                validators: ValidatorRegistry::with_builtin_validators(),
                systems: RwLock::new(Vec::new()),
                operations: Arc::new(OperationTable::default()),
                stats: Mutex::new(SaveStats::default()),
                validation_cache: Mutex::new(HashMap::new()),
                encoded_systems: Mutex::new(HashMap::new()),
                shutting_down: AtomicBool::new(false),
            }),
        })
    }
}

impl SaveManager {
    pub fn new(config: SaveManagerConfig) -> SaveResult<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: SaveManagerConfig) -> SaveManagerBuilder {
        SaveManagerBuilder {
            config,
            storage: None,
            encoder: None,
            migrations: None,
        }
    }

    pub fn config(&self) -> SaveManagerConfig {
        sync::read(&self.inner.config, "manager_config_read").clone()
    }

    pub fn save_dir(&self) -> PathBuf {
        self.inner.resolver.root().to_path_buf()
    }

    pub fn encoder(&self) -> &Arc<CanonicalEncoder> {
        &self.inner.encoder
    }

    pub fn migrations(&self) -> &Arc<MigrationRegistry> {
        &self.inner.migrations
    }

    /// Replaces any subsystem already registered under the same name.
    pub fn register_system(&self, system: Arc<dyn Persistable>) {
        let name = system.name().to_string();
        let mut systems = sync::write(&self.inner.systems, "manager_register_system");
        systems.retain(|existing| existing.name() != name);
        systems.push(system);
        sync::lock(&self.inner.encoded_systems, "manager_encoded_forget").remove(&name);
        debug!(system = %name, "system_registered");
    }

    pub fn unregister_system(&self, name: &str) -> bool {
        let mut systems = sync::write(&self.inner.systems, "manager_unregister_system");
        let before = systems.len();
        systems.retain(|existing| existing.name() != name);
        sync::lock(&self.inner.encoded_systems, "manager_encoded_forget").remove(name);
        systems.len() != before
    }

    pub fn registered_system_names(&self) -> Vec<String> {
        sync::read(&self.inner.systems, "manager_system_names")
            .iter()
            .map(|system| system.name().to_string())
            .collect()
    }

    pub fn register_validator<F>(&self, name: &str, validator: F)
    where
        F: Fn(&Value, &[String]) -> ValidationReport + Send + Sync + 'static,
    {
        self.inner.validators.register(name, validator);
        self.clear_validation_cache();
    }

    pub fn set_auto_backup(&self, enabled: bool, max_backups: usize) {
        let mut config = sync::write(&self.inner.config, "manager_set_auto_backup");
        config.enable_auto_backup = enabled;
        config.max_backups = max_backups;
    }

    pub fn set_atomic_writes(&self, enabled: bool) {
        sync::write(&self.inner.config, "manager_set_atomic").enable_atomic_writes = enabled;
    }

    pub fn set_compression(&self, compression: SaveCompression) {
        sync::write(&self.inner.config, "manager_set_compression").compression = compression;
    }

    pub fn set_current_version(&self, version: SaveVersion) {
        sync::write(&self.inner.config, "manager_set_version").current_version = version;
    }

    pub fn set_json_cache_size(&self, max_entries: usize) {
        sync::write(&self.inner.config, "manager_set_cache").json_cache_size = max_entries;
        self.inner.encoder.set_cache_size(max_entries);
    }

    /// Zero limits are rejected. Waiting operations re-check the new limits.
    pub fn set_max_concurrent_operations(&self, saves: usize, loads: usize) -> SaveResult<()> {
        check_concurrency_limits(saves, loads)?;
        {
            let mut config = sync::write(&self.inner.config, "manager_set_limits");
            config.max_concurrent_saves = saves;
            config.max_concurrent_loads = loads;
        }
        self.inner.slots.set_limits(saves, loads);
        Ok(())
    }

    pub fn cancel_operation(&self, operation_id: &str) -> bool {
        let cancelled = self.inner.operations.cancel(operation_id);
        if cancelled {
            info!(operation_id, "operation_cancel_requested");
        }
        cancelled
    }

    pub fn cancel_all_operations(&self) -> usize {
        let cancelled = self.inner.operations.cancel_all();
        if cancelled > 0 {
            info!(cancelled, "all_operations_cancel_requested");
        }
        cancelled
    }

    pub fn active_operations(&self) -> Vec<OperationSnapshot> {
        self.inner.operations.snapshots()
    }

    pub fn active_operation_ids(&self) -> Vec<String> {
        self.inner.operations.ids()
    }

    pub fn is_operation_active(&self, operation_id: &str) -> bool {
        self.inner.operations.get(operation_id).is_some()
    }

    pub fn operation_progress(&self, operation_id: &str) -> Option<Arc<OperationProgress>> {
        self.inner
            .operations
            .get(operation_id)
            .map(|record| record.progress)
    }

    pub fn recover_from_crash(&self) -> SaveResult<RecoveryReport> {
        let report = self.inner.recovery.recover_all()?;
        sync::lock(&self.inner.stats, "manager_stats_recovered").corrupted_saves_recovered +=
            report.recovered.len() as u64;
        self.clear_validation_cache();
        Ok(report)
    }

    pub fn recovery(&self) -> &CrashRecoveryManager {
        &self.inner.recovery
    }

    pub fn save_stats(&self) -> SaveStats {
        let mut stats = sync::lock(&self.inner.stats, "manager_stats_read").clone();
        stats.json_cache = self.inner.encoder.cache_stats();
        stats.concurrent_operations_peak = self.inner.slots.peak();
        stats
    }

    pub fn reset_save_stats(&self) {
        *sync::lock(&self.inner.stats, "manager_stats_reset") = SaveStats::default();
        self.inner.slots.reset_peak();
    }

    /// Polls until no operation is active or `timeout` elapses. Returns
    /// true when everything finished.
    pub fn wait_for_operations(&self, timeout: Duration) -> bool {
        let deadline = operations::deadline_after(Instant::now(), timeout);
        loop {
            if self.inner.operations.len() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(OPERATION_POLL_INTERVAL);
        }
    }

    /// Cancels everything in flight and waits for it to wind down. New
    /// operations are refused afterwards.
    pub fn shutdown(&self) -> bool {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.cancel_all_operations();
        let timeout = self.config().operation_timeout;
        let drained = self.wait_for_operations(timeout);
        if !drained {
            warn!(remaining = self.inner.operations.len(), "shutdown_timed_out");
        }
        info!("save_manager_shutdown");
        drained
    }

    fn begin_operation(&self, kind: OperationKind, filename: &str) -> SaveResult<OperationRegistration> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(SaveError::OperationCancelled {
                operation_id: format!("{} of {filename} refused during shutdown", kind.as_str()),
            });
        }
        let timeout = self.config().operation_timeout;
        Ok(self.inner.operations.register(kind, filename, timeout))
    }

    /// Records the outcome in stats and logs it.
    fn finish_operation<T>(
        &self,
        kind: OperationKind,
        operation_id: &str,
        started: Instant,
        result: SaveResult<T>,
    ) -> SaveResult<T> {
        let elapsed = started.elapsed();
        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(error) if error.is_cancelled() => Outcome::Cancelled,
            Err(_) => Outcome::Failed,
        };
        sync::lock(&self.inner.stats, "manager_stats_record").record(kind, outcome, elapsed);
        match &result {
            Ok(_) => debug!(operation_id, kind = %kind, elapsed_ms = elapsed.as_millis() as u64, "operation_finished"),
            Err(error) => warn!(operation_id, kind = %kind, error = %error, "operation_failed"),
        }
        result
    }

    fn spawn_worker<T, F>(
        &self,
        registration: OperationRegistration,
        thread_name: &str,
        work: F,
    ) -> SaveResult<PendingOperation<T>>
    where
        T: Send + 'static,
        F: FnOnce(SaveManager, OperationRegistration) -> SaveResult<T> + Send + 'static,
    {
        let operation_id = registration.id().to_string();
        let progress = Arc::clone(&registration.record().progress);
        let manager = self.clone();
        let handle = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || work(manager, registration))
            .map_err(|error| SaveError::Unknown {
                message: format!("failed to spawn {thread_name}: {error}"),
            })?;
        Ok(PendingOperation::new(operation_id, progress, handle))
    }

    fn clear_validation_cache(&self) {
        sync::lock(&self.inner.validation_cache, "validation_cache_clear").clear();
    }

    fn systems_snapshot(&self) -> Vec<Arc<dyn Persistable>> {
        sync::read(&self.inner.systems, "manager_systems_snapshot").clone()
    }
}
