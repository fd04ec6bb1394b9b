use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};

use tracing::{info, warn};

use super::load::ReadDocument;
use super::operations::{deadline_after, OperationRegistration};
use super::{SaveManager, SaveOperationResult};
use crate::canonical::{seal_document, ChecksumStatus, CHECKSUM_FIELD};
use crate::document::{
    check_required_fields, document_systems, document_timestamp, document_version, encode_save_bytes,
};
use crate::error::{OperationKind, SaveError, SaveResult};
use crate::recovery::is_primary_save_name;
use crate::storage::SecurePathResolver;
use crate::sync;
use crate::validation::{ValidationReport, VerificationOptions};
use crate::version::SaveVersion;

/// Metadata gathered from a save file without loading it into subsystems.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveFileInfo {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub version: Option<SaveVersion>,
    pub product: Option<String>,
    pub timestamp: Option<i64>,
    pub systems: Vec<String>,
    pub compressed: bool,
    pub checksum_valid: Option<bool>,
    /// Why the document could not be read, when it could not.
    pub error: Option<String>,
}

impl SaveManager {
    /// Copies `filename` to `backup_name`, or to a fresh timestamped backup
    /// when no name is given.
    pub fn create_backup(&self, filename: &str, backup_name: Option<&str>) -> SaveResult<PathBuf> {
        let path = self.existing_save(filename)?;
        let backup = match backup_name {
            Some(name) => {
                let target = self.inner.resolver.resolve(name)?;
                fs::copy(&path, &target).map_err(|source| SaveError::from_io(&path, source))?;
                target
            }
            None => self.inner.recovery.create_backup(&path)?,
        };
        self.sync_save_dir();
        info!(file = %path.display(), backup = %backup.display(), "backup_created");
        Ok(backup)
    }

    /// Replaces `filename` with `backup_name` after checking the backup's
    /// integrity. The replacement is atomic.
    pub fn restore_backup(&self, filename: &str, backup_name: &str) -> SaveResult<()> {
        let path = self.inner.resolver.resolve(filename)?;
        let backup = self.existing_save(backup_name)?;
        self.inner.recovery.validate_save_integrity(&backup)?;
        let bytes = self
            .inner
            .storage
            .read(&backup)
            .map_err(|source| SaveError::from_io(&backup, source))?;
        self.write_save_bytes(&path, &bytes, true)?;
        self.forget_validation(&path);
        info!(file = %path.display(), backup = %backup.display(), "backup_restored");
        Ok(())
    }

    /// Backup file names for `filename`, newest first.
    pub fn backup_list(&self, filename: &str) -> SaveResult<Vec<String>> {
        let path = self.inner.resolver.resolve(filename)?;
        Ok(self
            .inner
            .recovery
            .find_backups(&path)?
            .iter()
            .filter_map(|backup| file_name(backup))
            .collect())
    }

    /// Prunes backups of `filename` down to the configured maximum.
    pub fn cleanup_old_backups(&self, filename: &str) -> SaveResult<usize> {
        let path = self.inner.resolver.resolve(filename)?;
        let keep = self.config().max_backups;
        self.inner.recovery.prune_backups(&path, keep)
    }

    /// Primary save files in the save directory, sorted by name.
    pub fn save_file_list(&self) -> SaveResult<Vec<String>> {
        let root = self.inner.resolver.root();
        let entries = fs::read_dir(root).map_err(|source| SaveError::from_io(root, source))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| SaveError::from_io(root, source))?;
            if !entry.file_type().is_ok_and(|kind| kind.is_file()) {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if is_primary_save_name(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn save_file_exists(&self, filename: &str) -> bool {
        self.inner
            .resolver
            .resolve(filename)
            .is_ok_and(|path| path.is_file())
    }

    pub fn save_file_version(&self, filename: &str) -> SaveResult<SaveVersion> {
        let path = self.existing_save(filename)?;
        document_version(&self.read_document(&path)?.document)
    }

    pub fn save_file_size(&self, filename: &str) -> SaveResult<u64> {
        let path = self.existing_save(filename)?;
        fs::metadata(&path)
            .map(|metadata| metadata.len())
            .map_err(|source| SaveError::from_io(&path, source))
    }

    pub fn save_file_timestamp(&self, filename: &str) -> SaveResult<SystemTime> {
        let path = self.existing_save(filename)?;
        fs::metadata(&path)
            .and_then(|metadata| metadata.modified())
            .map_err(|source| SaveError::from_io(&path, source))
    }

    pub fn delete_save_file(&self, filename: &str) -> SaveResult<()> {
        let path = self.existing_save(filename)?;
        fs::remove_file(&path).map_err(|source| SaveError::from_io(&path, source))?;
        self.forget_validation(&path);
        self.sync_save_dir();
        info!(file = %path.display(), "save_deleted");
        Ok(())
    }

    /// Never fails on unreadable contents; those land in `error`.
    pub fn save_file_info(&self, filename: &str) -> SaveResult<SaveFileInfo> {
        let path = self.existing_save(filename)?;
        let metadata = fs::metadata(&path).map_err(|source| SaveError::from_io(&path, source))?;
        let mut info = SaveFileInfo {
            name: file_name(&path).unwrap_or_default(),
            size: metadata.len(),
            modified: metadata.modified().ok(),
            path: path.clone(),
            ..SaveFileInfo::default()
        };

        let ReadDocument {
            document,
            compressed,
            ..
        } = match self.read_document(&path) {
            Ok(read) => read,
            Err(error) => {
                info.error = Some(error.to_string());
                return Ok(info);
            }
        };
        info.compressed = compressed;
        info.version = document_version(&document).ok();
        info.timestamp = document_timestamp(&document);
        info.product = document
            .get("header")
            .and_then(|header| header.get("product"))
            .and_then(|product| product.as_str())
            .map(str::to_string);
        info.systems = document_systems(&document)
            .map(|systems| systems.keys().cloned().collect())
            .unwrap_or_default();
        info.checksum_valid = match self.inspect_document(&path, &document) {
            Ok((_, ChecksumStatus::Valid)) => Some(true),
            Ok((_, ChecksumStatus::Mismatch { .. })) => Some(false),
            Ok((_, ChecksumStatus::Missing)) => None,
            Err(error) => {
                info.error = Some(error.to_string());
                None
            }
        };
        Ok(info)
    }

    /// Runs the registered validators and the checksum check on `filename`.
    pub fn validate_save(&self, filename: &str) -> SaveResult<ValidationReport> {
        let path = self.existing_save(filename)?;
        let document = self.read_document(&path)?.document;
        let (mut report, checksum) = self.inspect_document(&path, &document)?;
        add_checksum_issue(&mut report, &checksum);
        Ok(report)
    }

    pub fn verify_checksum(&self, filename: &str) -> SaveResult<bool> {
        let path = self.existing_save(filename)?;
        let document = self.read_document(&path)?.document;
        let (_, checksum) = self.inspect_document(&path, &document)?;
        Ok(checksum == ChecksumStatus::Valid)
    }

    /// Tooling-oriented check that reports every problem it finds instead
    /// of failing. Only an unusable filename is an error.
    pub fn verify_file(&self, filename: &str, options: &VerificationOptions) -> SaveResult<ValidationReport> {
        const NAME: &str = "verify";
        let started = Instant::now();
        let path = self.inner.resolver.resolve(filename)?;
        let mut report = ValidationReport::new();
        if options.verbose {
            report.merge(SecurePathResolver::validate_filename(filename));
        }
        if !path.is_file() {
            report.add_critical(NAME, "", "File does not exist", Some("Check the file name"));
            return Ok(finish_report(report, started));
        }

        let document = match self.read_document(&path) {
            Ok(read) => read.document,
            Err(error) => {
                report.add_critical(NAME, "", error.to_string(), Some("Restore from a backup"));
                return Ok(finish_report(report, started));
            }
        };

        if options.check_structure {
            if let Err(message) = check_required_fields(&document) {
                report.add_critical(NAME, "", message, Some("Restore from a backup"));
            }
        }
        if options.check_checksums || options.run_validators {
            let (validators, checksum) = self.inspect_document(&path, &document)?;
            if options.run_validators {
                report.merge(validators);
            }
            if options.check_checksums {
                add_checksum_issue(&mut report, &checksum);
            }
        }
        if options.check_migrations {
            let current = self.config().current_version;
            match document_version(&document) {
                Ok(version) if version > current => report.add_error(
                    NAME,
                    "header.version",
                    format!("Save version {version} is newer than supported {current}"),
                    Some("Update the application"),
                ),
                Ok(version) if version != current && !self.inner.migrations.is_supported(&version, &current) => {
                    report.add_error(
                        NAME,
                        "header.version",
                        format!("No migration path from {version} to {current}"),
                        None,
                    );
                }
                Ok(version) if version != current => report.add_warning(
                    NAME,
                    "header.version",
                    format!("Save will be migrated from {version} to {current}"),
                    None,
                ),
                Ok(_) => {}
                Err(error) => report.add_error(NAME, "header.version", error.to_string(), None),
            }
        }
        Ok(finish_report(report, started))
    }

    pub fn is_migration_required(&self, filename: &str) -> SaveResult<bool> {
        Ok(self.save_file_version(filename)? != self.config().current_version)
    }

    /// Step summaries that loading `filename` would apply.
    pub fn migration_preview(&self, filename: &str) -> SaveResult<Vec<String>> {
        let version = self.save_file_version(filename)?;
        self.inner
            .migrations
            .preview(&version, &self.config().current_version)
    }

    /// Rewrites `filename` at `target` in place. The original is backed up
    /// first when auto-backup is on.
    pub fn migrate_save(&self, filename: &str, target: &SaveVersion) -> SaveResult<SaveOperationResult> {
        let registration = self.begin_operation(OperationKind::Save, filename)?;
        let started = Instant::now();
        let result = self.migrate_inner(&registration, filename, target);
        if result.is_ok() {
            registration.progress().mark_complete();
        }
        self.finish_operation(OperationKind::Save, registration.id(), started, result)
            .map(|mut result| {
                result.operation_time = started.elapsed();
                result
            })
    }

    fn migrate_inner(
        &self,
        registration: &OperationRegistration,
        filename: &str,
        target: &SaveVersion,
    ) -> SaveResult<SaveOperationResult> {
        let config = self.config();
        let path = self.existing_save(filename)?;
        let slot_deadline = registration
            .record()
            .deadline
            .min(deadline_after(Instant::now(), config.effective_slot_timeout()));
        let _slot = self.inner.slots.acquire(OperationKind::Save, slot_deadline)?;

        registration.progress().update(10.0, "reading");
        let mut document = self.read_document(&path)?.document;
        if let (_, ChecksumStatus::Mismatch { expected, actual }) = self.inspect_document(&path, &document)? {
            return Err(SaveError::ChecksumMismatch { expected, actual });
        }
        let from = document_version(&document)?;
        let mut result = SaveOperationResult {
            operation_id: registration.id().to_string(),
            path: path.clone(),
            version_loaded: Some(from.clone()),
            version_saved: Some(target.clone()),
            ..SaveOperationResult::default()
        };
        if &from == target {
            result.message = format!("{} already at {target}", path.display());
            return Ok(result);
        }
        registration.checkpoint()?;

        registration.progress().update(40.0, "migrating");
        let outcome = self.inner.migrations.apply(&mut document, &from, target)?;
        if let Some(map) = document.as_object_mut() {
            map.remove(CHECKSUM_FIELD);
        }
        let sealed = seal_document(&self.inner.encoder, &mut document)?;
        let bytes = encode_save_bytes(&sealed.text, config.compression)?;
        registration.checkpoint()?;

        result.backup_created = self.commit_save_bytes(registration, &path, &bytes, &config)?;
        sync::lock(&self.inner.stats, "manager_stats_migrations").migrations_performed += 1;
        info!(file = %path.display(), from = %from, to = %target, steps = outcome.applied.len(), "save_migrated");

        result.message = format!("migrated {} from {from} to {target}", path.display());
        result.migration_performed = true;
        result.migration_steps = outcome.applied;
        result.atomic_write_used = config.enable_atomic_writes;
        result.bytes_written = bytes.len() as u64;
        result.estimated_size = sealed.text.len() as u64;
        result.checksum = sealed.checksum;
        Ok(result)
    }

    fn existing_save(&self, filename: &str) -> SaveResult<PathBuf> {
        let path = self.inner.resolver.resolve(filename)?;
        if !path.is_file() {
            return Err(SaveError::FileNotFound { path });
        }
        Ok(path)
    }

    fn sync_save_dir(&self) {
        let root = self.inner.resolver.root();
        if let Err(error) = self.inner.storage.sync_directory(root) {
            warn!(dir = %root.display(), error = %error, "directory_sync_failed");
        }
    }
}

fn add_checksum_issue(report: &mut ValidationReport, checksum: &ChecksumStatus) {
    match checksum {
        ChecksumStatus::Valid => {}
        ChecksumStatus::Missing => report.add_warning(
            "checksum",
            CHECKSUM_FIELD,
            "Save has no checksum",
            Some("Re-save the file to add one"),
        ),
        ChecksumStatus::Mismatch { expected, actual } => report.add_critical(
            "checksum",
            CHECKSUM_FIELD,
            format!("Checksum mismatch (stored {expected}, calculated {actual})"),
            Some("Restore from a backup"),
        ),
    }
}

fn finish_report(mut report: ValidationReport, started: Instant) -> ValidationReport {
    report.validation_time = started.elapsed();
    report
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
}
