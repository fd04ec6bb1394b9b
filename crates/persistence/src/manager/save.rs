use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::operations::{deadline_after, OperationRegistration};
use super::{Persistable, PendingOperation, SaveManager, SaveOperationResult};
use crate::canonical::seal_document;
use crate::config::{SaveCompression, SaveManagerConfig};
use crate::document::{encode_save_bytes, new_document};
use crate::error::{OperationKind, SaveError, SaveResult};
use crate::storage::check_space;
use crate::sync;

const ENCODE_START_PERCENT: f32 = 10.0;
const ENCODE_SPAN_PERCENT: f32 = 60.0;

/// Which subsystems get re-encoded on this save.
#[derive(Debug, Clone)]
enum EncodeScope {
    All,
    /// Only these; everything else reuses its last encoding when one exists.
    Only(HashSet<String>),
}

impl EncodeScope {
    fn needs_encode(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(names) => names.contains(name),
        }
    }
}

impl SaveManager {
    /// Encodes every registered subsystem and writes `filename` durably.
    pub fn save_game(&self, filename: &str) -> SaveResult<SaveOperationResult> {
        let registration = self.begin_operation(OperationKind::Save, filename)?;
        self.run_save(&registration, filename, EncodeScope::All)
    }

    /// Like [`save_game`](Self::save_game) but only re-encodes `systems`;
    /// other subsystems reuse the payload from their last save.
    pub fn save_incremental(&self, filename: &str, systems: &[String]) -> SaveResult<SaveOperationResult> {
        let registration = self.begin_operation(OperationKind::Save, filename)?;
        let scope = EncodeScope::Only(systems.iter().cloned().collect());
        self.run_save(&registration, filename, scope)
    }

    /// Runs the save on a `save-worker` thread. The operation is registered
    /// before this returns, so its id is immediately cancellable.
    pub fn save_game_async(&self, filename: &str) -> SaveResult<PendingOperation<SaveOperationResult>> {
        let registration = self.begin_operation(OperationKind::Save, filename)?;
        let filename = filename.to_string();
        self.spawn_worker(registration, "save-worker", move |manager, registration| {
            manager.run_save(&registration, &filename, EncodeScope::All)
        })
    }

    fn run_save(
        &self,
        registration: &OperationRegistration,
        filename: &str,
        scope: EncodeScope,
    ) -> SaveResult<SaveOperationResult> {
        let started = Instant::now();
        let result = self.save_inner(registration, filename, scope);
        if result.is_ok() {
            registration.progress().mark_complete();
        }
        self.finish_operation(OperationKind::Save, registration.id(), started, result)
            .map(|mut result| {
                result.operation_time = started.elapsed();
                result
            })
    }

    fn save_inner(
        &self,
        registration: &OperationRegistration,
        filename: &str,
        scope: EncodeScope,
    ) -> SaveResult<SaveOperationResult> {
        let progress = registration.progress();
        let config = self.config();
        progress.update(0.0, "resolving path");
        let path = self.inner.resolver.resolve_save_target(filename)?;

        progress.update(5.0, "waiting for save slot");
        let slot_deadline = registration
            .record()
            .deadline
            .min(deadline_after(Instant::now(), config.effective_slot_timeout()));
        let _slot = self.inner.slots.acquire(OperationKind::Save, slot_deadline)?;
        registration.checkpoint()?;

        let systems = self.systems_snapshot();
        let encoded = self.encode_systems(registration, &systems, &config, &scope)?;
        let system_names = encoded.keys().cloned().collect::<Vec<_>>();

        progress.update(72.0, "sealing document");
        let mut document = new_document(&config.current_version, &config.product, encoded);
        let sealed = seal_document(&self.inner.encoder, &mut document)?;
        let bytes = encode_save_bytes(&sealed.text, config.compression)?;
        registration.checkpoint()?;

        // No checkpoints past this point: the file is either fully replaced or untouched.
        let backup_created = self.commit_save_bytes(registration, &path, &bytes, &config)?;

        sync::lock(&self.inner.stats, "manager_stats_bytes").total_bytes_saved += bytes.len() as u64;
        info!(
            operation_id = registration.id(),
            file = %path.display(),
            bytes = bytes.len(),
            systems = system_names.len(),
            atomic = config.enable_atomic_writes,
            "save_completed"
        );

        Ok(SaveOperationResult {
            operation_id: registration.id().to_string(),
            message: format!("saved {} systems to {}", system_names.len(), path.display()),
            path,
            version_saved: Some(config.current_version.clone()),
            atomic_write_used: config.enable_atomic_writes,
            backup_created,
            compressed: config.compression != SaveCompression::Off,
            bytes_written: bytes.len() as u64,
            estimated_size: sealed.text.len() as u64,
            checksum: sealed.checksum,
            systems: system_names,
            ..SaveOperationResult::default()
        })
    }

    fn encode_systems(
        &self,
        registration: &OperationRegistration,
        systems: &[Arc<dyn Persistable>],
        config: &SaveManagerConfig,
        scope: &EncodeScope,
    ) -> SaveResult<Map<String, Value>> {
        let format_version = config.current_version.to_int();
        let total = systems.len().max(1) as f32;
        let mut encoded = Map::new();

        for (index, system) in systems.iter().enumerate() {
            registration.checkpoint()?;
            let name = system.name();
            registration.progress().update(
                ENCODE_START_PERCENT + ENCODE_SPAN_PERCENT * index as f32 / total,
                &format!("encoding {name}"),
            );

            let cached = if scope.needs_encode(name) {
                None
            } else {
                sync::lock(&self.inner.encoded_systems, "encoded_systems_read")
                    .get(name)
                    .cloned()
            };
            let payload = match cached {
                Some(payload) => {
                    debug!(system = name, "system_encoding_reused");
                    payload
                }
                None => {
                    let payload = system.encode(format_version).map_err(|message| {
                        SaveError::SerializationFailed {
                            message: format!("system '{name}' failed to encode: {message}"),
                        }
                    })?;
                    sync::lock(&self.inner.encoded_systems, "encoded_systems_write")
                        .insert(name.to_string(), payload.clone());
                    payload
                }
            };
            encoded.insert(name.to_string(), payload);
        }
        Ok(encoded)
    }

    /// Space check, optional backup, write, then backup pruning. Returns the
    /// backup taken of the previous file, if any.
    pub(super) fn commit_save_bytes(
        &self,
        registration: &OperationRegistration,
        path: &Path,
        bytes: &[u8],
        config: &SaveManagerConfig,
    ) -> SaveResult<Option<PathBuf>> {
        let progress = registration.progress();
        progress.update(80.0, "checking disk space");
        let dir = path.parent().unwrap_or(self.inner.resolver.root());
        let backup_needed = config.enable_auto_backup && path.exists();
        check_space(
            self.inner.storage.as_ref(),
            dir,
            bytes.len() as u64,
            backup_needed,
            config.enable_atomic_writes,
        )
        .map_err(|(required, available)| SaveError::InsufficientSpace { required, available })?;

        let backup_created = if backup_needed {
            progress.update(85.0, "creating backup");
            Some(self.inner.recovery.create_backup(path)?)
        } else {
            None
        };

        progress.update(90.0, "writing");
        self.write_save_bytes(path, bytes, config.enable_atomic_writes)?;
        self.forget_validation(path);

        if config.enable_auto_backup {
            if let Err(error) = self.inner.recovery.prune_backups(path, config.max_backups) {
                warn!(file = %path.display(), error = %error, "backup_prune_failed");
            }
        }
        Ok(backup_created)
    }

    pub(super) fn write_save_bytes(&self, path: &Path, bytes: &[u8], atomic: bool) -> SaveResult<()> {
        let written = if atomic {
            self.inner.storage.write_atomic(path, bytes)
        } else {
            self.inner.storage.write_direct(path, bytes)
        };
        written.map_err(|source| SaveError::from_io(path, source))
    }
}
