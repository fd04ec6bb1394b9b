use std::fs;
use std::path::Path;
use std::time::{Instant, SystemTime};

use serde_json::Value;
use tracing::{error, info, warn};

use super::operations::{deadline_after, OperationRegistration};
use super::{PendingOperation, SaveManager, SaveOperationResult, ValidationCacheEntry};
use crate::canonical::{checksum_status, document_checksum, ChecksumStatus, CHECKSUM_FIELD};
use crate::compression::is_compressed_block;
use crate::document::{decode_save_bytes, document_systems, document_version};
use crate::error::{OperationKind, SaveError, SaveResult};
use crate::sync;
use crate::validation::{Severity, ValidationReport};

/// Raw file contents after envelope handling.
pub(super) struct ReadDocument {
    pub(super) document: Value,
    pub(super) size: u64,
    pub(super) compressed: bool,
}

impl SaveManager {
    /// Reads, verifies and migrates `filename`, then hands each subsystem
    /// its payload.
    pub fn load_game(&self, filename: &str) -> SaveResult<SaveOperationResult> {
        let registration = self.begin_operation(OperationKind::Load, filename)?;
        self.run_load(&registration, filename)
    }

    pub fn load_game_async(&self, filename: &str) -> SaveResult<PendingOperation<SaveOperationResult>> {
        let registration = self.begin_operation(OperationKind::Load, filename)?;
        let filename = filename.to_string();
        self.spawn_worker(registration, "load-worker", move |manager, registration| {
            manager.run_load(&registration, &filename)
        })
    }

    fn run_load(
        &self,
        registration: &OperationRegistration,
        filename: &str,
    ) -> SaveResult<SaveOperationResult> {
        let started = Instant::now();
        let result = self.load_inner(registration, filename);
        if result.is_ok() {
            registration.progress().mark_complete();
        }
        self.finish_operation(OperationKind::Load, registration.id(), started, result)
            .map(|mut result| {
                result.operation_time = started.elapsed();
                result
            })
    }

    fn load_inner(
        &self,
        registration: &OperationRegistration,
        filename: &str,
    ) -> SaveResult<SaveOperationResult> {
        let progress = registration.progress();
        let config = self.config();
        progress.update(0.0, "resolving path");
        let path = self.inner.resolver.resolve(filename)?;

        progress.update(5.0, "waiting for load slot");
        let slot_deadline = registration
            .record()
            .deadline
            .min(deadline_after(Instant::now(), config.effective_slot_timeout()));
        let _slot = self.inner.slots.acquire(OperationKind::Load, slot_deadline)?;
        registration.checkpoint()?;

        progress.update(10.0, "reading");
        let ReadDocument {
            mut document,
            size,
            compressed,
        } = self.read_document(&path)?;

        progress.update(25.0, "validating");
        let mut warnings = Vec::new();
        let (report, checksum) = self.inspect_document(&path, &document)?;
        match checksum {
            ChecksumStatus::Valid => {}
            ChecksumStatus::Missing => {
                warnings.push("save has no checksum; integrity not verified".to_string());
            }
            ChecksumStatus::Mismatch { expected, actual } => {
                return Err(SaveError::ChecksumMismatch { expected, actual });
            }
        }
        if !report.is_valid() {
            return Err(SaveError::ValidationFailed {
                summary: report.summary(),
                suggested_fix: report.first_suggested_fix().map(str::to_string),
            });
        }
        warnings.extend(
            report
                .issues
                .iter()
                .filter(|issue| issue.severity == Severity::Warning)
                .map(|issue| format!("{}: {}", issue.field_path, issue.message)),
        );
        registration.checkpoint()?;

        let loaded_version = document_version(&document)?;
        let current = config.current_version.clone();
        if loaded_version > current {
            return Err(SaveError::VersionError {
                message: format!("save version {loaded_version} is newer than supported {current}"),
            });
        }
        let mut migration_steps = Vec::new();
        if loaded_version != current {
            progress.update(40.0, "migrating");
            let outcome = self
                .inner
                .migrations
                .apply(&mut document, &loaded_version, &current)?;
            sync::lock(&self.inner.stats, "manager_stats_migrations").migrations_performed += 1;
            migration_steps = outcome.applied;
        }
        registration.checkpoint()?;

        let loaded_systems = self.apply_systems(registration, &document, current.to_int(), &mut warnings)?;

        info!(
            operation_id = registration.id(),
            file = %path.display(),
            version = %loaded_version,
            migrated = !migration_steps.is_empty(),
            systems = loaded_systems.len(),
            "load_completed"
        );

        Ok(SaveOperationResult {
            operation_id: registration.id().to_string(),
            message: format!("loaded {} systems from {}", loaded_systems.len(), path.display()),
            path,
            warnings,
            version_loaded: Some(loaded_version),
            migration_performed: !migration_steps.is_empty(),
            migration_steps,
            compressed,
            estimated_size: size,
            checksum: document
                .get(CHECKSUM_FIELD)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            systems: loaded_systems,
            validation: Some(report),
            ..SaveOperationResult::default()
        })
    }

    /// Checks every present payload before any subsystem is touched, then
    /// decodes in registration order.
    fn apply_systems(
        &self,
        registration: &OperationRegistration,
        document: &Value,
        format_version: u32,
        warnings: &mut Vec<String>,
    ) -> SaveResult<Vec<String>> {
        let payloads = document_systems(document)
            .ok_or_else(|| SaveError::corruption("save has no systems object"))?;
        let systems = self.systems_snapshot();
        let total = systems.len().max(1) as f32;

        for (index, system) in systems.iter().enumerate() {
            registration.checkpoint()?;
            let name = system.name();
            registration.progress().update(
                50.0 + 30.0 * index as f32 / total,
                &format!("checking {name}"),
            );
            if let Some(data) = payloads.get(name) {
                system
                    .check_payload(data, format_version)
                    .map_err(|message| SaveError::SerializationFailed {
                        message: format!("system '{name}' rejected its payload: {message}"),
                    })?;
            }
        }

        registration.progress().update(85.0, "applying systems");
        let mut loaded = Vec::new();
        for system in &systems {
            let name = system.name();
            match payloads.get(name) {
                Some(data) => {
                    system.decode(data, format_version).map_err(|message| {
                        error!(system = name, error = %message, "system_decode_failed");
                        SaveError::SerializationFailed {
                            message: format!("system '{name}' failed to decode: {message}"),
                        }
                    })?;
                    loaded.push(name.to_string());
                }
                None => {
                    warn!(system = name, "system_missing_from_save");
                    warnings.push(format!("system '{name}' missing from save; defaults loaded"));
                    system.load_default();
                }
            }
        }
        // encodings from an earlier save no longer match the loaded state
        sync::lock(&self.inner.encoded_systems, "encoded_systems_clear").clear();
        Ok(loaded)
    }

    pub(super) fn read_document(&self, path: &Path) -> SaveResult<ReadDocument> {
        let bytes = self
            .inner
            .storage
            .read(path)
            .map_err(|source| SaveError::from_io(path, source))?;
        let compressed = is_compressed_block(&bytes);
        let document = decode_save_bytes(&bytes)?;
        Ok(ReadDocument {
            document,
            size: bytes.len() as u64,
            compressed,
        })
    }

    /// Runs the validators and the checksum check. The digest is always
    /// recomputed from `document`; only the validator report is reused, and
    /// only while the file's size, mtime and content digest are unchanged.
    pub(super) fn inspect_document(
        &self,
        path: &Path,
        document: &Value,
    ) -> SaveResult<(ValidationReport, ChecksumStatus)> {
        let digest = document_checksum(&self.inner.encoder, document)?;
        let checksum = checksum_status(document, digest.clone());
        let caching = self.config().enable_validation_caching;
        let stamp = file_stamp(path);

        if caching {
            if let Some((modified, size)) = stamp {
                let cached = sync::lock(&self.inner.validation_cache, "validation_cache_read")
                    .get(path)
                    .filter(|entry| {
                        entry.modified == modified && entry.size == size && entry.digest == digest
                    })
                    .map(|entry| entry.report.clone());
                let mut stats = sync::lock(&self.inner.stats, "manager_stats_validation");
                if let Some(report) = cached {
                    stats.validation_cache_hits += 1;
                    return Ok((report, checksum));
                }
                stats.validation_cache_misses += 1;
            }
        }

        let expected = self.registered_system_names();
        let report = self.inner.validators.run(document, &expected);

        if let (true, Some((modified, size))) = (caching, stamp) {
            sync::lock(&self.inner.validation_cache, "validation_cache_write").insert(
                path.to_path_buf(),
                ValidationCacheEntry {
                    modified,
                    size,
                    digest,
                    report: report.clone(),
                },
            );
        }
        Ok((report, checksum))
    }

    pub(super) fn forget_validation(&self, path: &Path) {
        sync::lock(&self.inner.validation_cache, "validation_cache_forget").remove(path);
    }
}

fn file_stamp(path: &Path) -> Option<(SystemTime, u64)> {
    let metadata = fs::metadata(path).ok()?;
    Some((metadata.modified().ok()?, metadata.len()))
}
