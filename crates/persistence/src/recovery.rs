//! Crash recovery: sweeps leftovers of interrupted writes and restores
//! corrupted saves from their newest intact backup.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Local;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::canonical::{check_document_checksum, CanonicalEncoder, ChecksumStatus};
use crate::document::{check_required_fields, decode_save_bytes};
use crate::error::{SaveError, SaveResult};
use crate::storage::SAVE_EXTENSION;
use crate::sync;

pub const BACKUP_MARKER: &str = "_backup_";
pub const CORRUPTED_MARKER: &str = "_corrupted_";
const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%3f";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryStats {
    pub corrupted_files_found: u64,
    pub successful_recoveries: u64,
    pub failed_recoveries: u64,
    pub temp_files_cleaned: u64,
    pub backups_cleaned: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveredFile {
    pub file: PathBuf,
    pub backup: PathBuf,
    pub quarantined_copy: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub temp_files_removed: usize,
    pub corrupted_files: Vec<PathBuf>,
    pub recovered: Vec<RecoveredFile>,
    pub failed: Vec<(PathBuf, String)>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.corrupted_files.is_empty() && self.temp_files_removed == 0
    }
}

/// Leftovers of interrupted writes. A name ending in the save extension is
/// never a temp file, whatever else it contains.
pub fn is_temp_file_name(name: &str) -> bool {
    !name.ends_with(SAVE_EXTENSION)
        && (name.ends_with(".tmp") || name.ends_with(".partial") || name.ends_with(".writing"))
}

/// `<stem>_backup_<YYYYmmdd_HHMMSS_mmm>[_<n>].save`
pub fn is_backup_name(name: &str) -> bool {
    parse_derived_name(name, BACKUP_MARKER).is_some()
}

/// `<stem>_corrupted_<YYYYmmdd_HHMMSS_mmm>[_<n>].save`
pub fn is_quarantine_name(name: &str) -> bool {
    parse_derived_name(name, CORRUPTED_MARKER).is_some()
}

/// Primary save files only: no backups, quarantined copies or hidden files.
pub fn is_primary_save_name(name: &str) -> bool {
    name.ends_with(SAVE_EXTENSION)
        && !name.starts_with('.')
        && !is_backup_name(name)
        && !is_quarantine_name(name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DerivedName<'a> {
    stem: &'a str,
    stamp: &'a str,
    counter: u32,
}

fn parse_derived_name<'a>(name: &'a str, marker: &str) -> Option<DerivedName<'a>> {
    let body = name.strip_suffix(SAVE_EXTENSION)?;
    let (stem, tail) = body.rsplit_once(marker)?;
    if stem.is_empty() {
        return None;
    }
    let mut parts = tail.split('_');
    for width in [8usize, 6, 3] {
        match parts.next() {
            Some(part) if part.len() == width && part.bytes().all(|b| b.is_ascii_digit()) => {}
            _ => return None,
        }
    }
    let stamp = &tail[..19];
    let counter = match (parts.next(), parts.next()) {
        (None, _) => 0,
        (Some(counter), None) if !counter.is_empty() && counter.bytes().all(|b| b.is_ascii_digit()) => {
            counter.parse().ok()?
        }
        _ => return None,
    };
    Some(DerivedName {
        stem,
        stamp,
        counter,
    })
}

#[derive(Debug)]
pub struct CrashRecoveryManager {
    save_dir: PathBuf,
    encoder: Arc<CanonicalEncoder>,
    stats: Mutex<RecoveryStats>,
}

impl CrashRecoveryManager {
    pub fn new(save_dir: impl Into<PathBuf>, encoder: Arc<CanonicalEncoder>) -> Self {
        Self {
            save_dir: save_dir.into(),
            encoder,
            stats: Mutex::new(RecoveryStats::default()),
        }
    }

    pub fn save_dir(&self) -> &Path {
        &self.save_dir
    }

    pub fn stats(&self) -> RecoveryStats {
        *sync::lock(&self.stats, "recovery_stats_read")
    }

    pub fn reset_stats(&self) {
        *sync::lock(&self.stats, "recovery_stats_reset") = RecoveryStats::default();
    }

    /// Deletes temp and partial files left by interrupted writes.
    pub fn cleanup_temp_files(&self) -> SaveResult<usize> {
        let mut removed = 0usize;
        for path in self.list_files()? {
            let Some(name) = file_name(&path) else {
                continue;
            };
            if !is_temp_file_name(name) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    removed += 1;
                    debug!(file = %path.display(), "temp_file_removed");
                }
                Err(error) => {
                    warn!(file = %path.display(), error = %error, "temp_file_remove_failed");
                }
            }
        }
        sync::lock(&self.stats, "recovery_stats_temp").temp_files_cleaned += removed as u64;
        if removed > 0 {
            info!(removed, dir = %self.save_dir.display(), "temp_files_cleaned");
        }
        Ok(removed)
    }

    /// Primary saves that fail [`validate_save_integrity`](Self::validate_save_integrity).
    pub fn find_corrupted_saves(&self) -> SaveResult<Vec<PathBuf>> {
        let mut corrupted = Vec::new();
        for path in self.list_files()? {
            if !file_name(&path).is_some_and(is_primary_save_name) {
                continue;
            }
            if let Err(error) = self.validate_save_integrity(&path) {
                warn!(file = %path.display(), error = %error, "corrupted_save_detected");
                corrupted.push(path);
            }
        }
        sync::lock(&self.stats, "recovery_stats_found").corrupted_files_found +=
            corrupted.len() as u64;
        Ok(corrupted)
    }

    /// Non-empty, parseable, carries the required header fields and a
    /// `systems` object, and its checksum matches when one is stored.
    pub fn validate_save_integrity(&self, path: &Path) -> SaveResult<()> {
        let bytes = fs::read(path).map_err(|source| SaveError::from_io(path, source))?;
        let document = decode_save_bytes(&bytes)?;
        check_required_fields(&document).map_err(SaveError::corruption)?;
        match check_document_checksum(&self.encoder, &document)? {
            ChecksumStatus::Valid | ChecksumStatus::Missing => Ok(()),
            ChecksumStatus::Mismatch { expected, actual } => {
                Err(SaveError::ChecksumMismatch { expected, actual })
            }
        }
    }

    pub fn is_intact(&self, path: &Path) -> bool {
        self.validate_save_integrity(path).is_ok()
    }

    /// Timestamped backups of `save_path`, newest first.
    pub fn find_backups(&self, save_path: &Path) -> SaveResult<Vec<PathBuf>> {
        let stem = file_stem(save_path);
        let mut backups = self
            .list_files()?
            .into_iter()
            .filter_map(|path| {
                let derived = parse_derived_name(file_name(&path)?, BACKUP_MARKER)?;
                if derived.stem != stem {
                    return None;
                }
                let key = (derived.stamp.to_string(), derived.counter);
                let modified = fs::metadata(&path).and_then(|meta| meta.modified()).ok();
                Some((path, key, modified))
            })
            .collect::<Vec<_>>();
        backups.sort_by(|(_, left_key, left_time), (_, right_key, right_time)| {
            right_key
                .cmp(left_key)
                .then_with(|| right_time.cmp(left_time))
        });
        Ok(backups.into_iter().map(|(path, _, _)| path).collect())
    }

    /// Fresh backup path for `save_path`; never collides with an existing file.
    pub fn backup_path_for(&self, save_path: &Path) -> PathBuf {
        let stem = file_stem(save_path);
        let stamp = Local::now().format(BACKUP_TIMESTAMP_FORMAT);
        let dir = save_path.parent().unwrap_or(self.save_dir.as_path());
        let mut candidate = dir.join(format!("{stem}{BACKUP_MARKER}{stamp}{SAVE_EXTENSION}"));
        let mut counter = 1u32;
        while candidate.exists() {
            candidate = dir.join(format!("{stem}{BACKUP_MARKER}{stamp}_{counter}{SAVE_EXTENSION}"));
            counter += 1;
        }
        candidate
    }

    /// Copies `save_path` to a new timestamped backup.
    pub fn create_backup(&self, save_path: &Path) -> SaveResult<PathBuf> {
        let backup = self.backup_path_for(save_path);
        fs::copy(save_path, &backup).map_err(|source| SaveError::from_io(save_path, source))?;
        debug!(file = %save_path.display(), backup = %backup.display(), "backup_created");
        Ok(backup)
    }

    /// Restores `save_path` from the newest backup that passes the integrity
    /// check. The corrupted file is kept aside as `<stem>_corrupted_<ts>.save`.
    pub fn recover_file(&self, save_path: &Path) -> SaveResult<RecoveredFile> {
        let result = self.recover_file_inner(save_path);
        let mut stats = sync::lock(&self.stats, "recovery_stats_recover");
        match &result {
            Ok(recovered) => {
                stats.successful_recoveries += 1;
                info!(
                    file = %save_path.display(),
                    backup = %recovered.backup.display(),
                    "save_recovered_from_backup"
                );
            }
            Err(err) => {
                stats.failed_recoveries += 1;
                error!(file = %save_path.display(), error = %err, "save_recovery_failed");
            }
        }
        result
    }

    fn recover_file_inner(&self, save_path: &Path) -> SaveResult<RecoveredFile> {
        let backup = self
            .find_backups(save_path)?
            .into_iter()
            .find(|candidate| match self.validate_save_integrity(candidate) {
                Ok(()) => true,
                Err(error) => {
                    debug!(backup = %candidate.display(), error = %error, "backup_rejected");
                    false
                }
            })
            .ok_or_else(|| {
                SaveError::corruption(format!(
                    "no valid backup found for {}",
                    save_path.display()
                ))
            })?;

        let quarantined_copy = if save_path.exists() {
            let stamp = Local::now().format(BACKUP_TIMESTAMP_FORMAT);
            let dir = save_path.parent().unwrap_or(self.save_dir.as_path());
            let aside = dir.join(format!(
                "{}{CORRUPTED_MARKER}{stamp}{SAVE_EXTENSION}",
                file_stem(save_path)
            ));
            match fs::copy(save_path, &aside) {
                Ok(_) => Some(aside),
                Err(error) => {
                    warn!(file = %save_path.display(), error = %error, "corrupted_copy_failed");
                    None
                }
            }
        } else {
            None
        };

        fs::copy(&backup, save_path).map_err(|source| SaveError::from_io(save_path, source))?;
        Ok(RecoveredFile {
            file: save_path.to_path_buf(),
            backup,
            quarantined_copy,
        })
    }

    /// Full sweep: temp cleanup, corruption scan, then recovery of each
    /// corrupted save. Individual recovery failures are reported, not raised.
    pub fn recover_all(&self) -> SaveResult<RecoveryReport> {
        if !self.save_dir.exists() {
            return Ok(RecoveryReport::default());
        }
        let mut report = RecoveryReport {
            temp_files_removed: self.cleanup_temp_files()?,
            corrupted_files: self.find_corrupted_saves()?,
            ..RecoveryReport::default()
        };
        for path in report.corrupted_files.clone() {
            match self.recover_file(&path) {
                Ok(recovered) => report.recovered.push(recovered),
                Err(error) => report.failed.push((path, error.to_string())),
            }
        }
        info!(
            temp_files = report.temp_files_removed,
            corrupted = report.corrupted_files.len(),
            recovered = report.recovered.len(),
            failed = report.failed.len(),
            "crash_recovery_completed"
        );
        Ok(report)
    }

    /// Deletes all but the newest `keep` backups of `save_path`.
    pub fn prune_backups(&self, save_path: &Path, keep: usize) -> SaveResult<usize> {
        let backups = self.find_backups(save_path)?;
        let mut removed = 0usize;
        for stale in backups.iter().skip(keep) {
            match fs::remove_file(stale) {
                Ok(()) => removed += 1,
                Err(error) => {
                    warn!(backup = %stale.display(), error = %error, "backup_prune_failed");
                }
            }
        }
        if removed > 0 {
            sync::lock(&self.stats, "recovery_stats_prune").backups_cleaned += removed as u64;
            debug!(file = %save_path.display(), removed, keep, "backups_pruned");
        }
        Ok(removed)
    }

    fn list_files(&self) -> SaveResult<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.save_dir)
            .map_err(|source| SaveError::from_io(&self.save_dir, source))?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| SaveError::from_io(&self.save_dir, source))?;
            if entry.file_type().is_ok_and(|kind| kind.is_file()) {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::canonical::seal_document;

    fn write_valid_save(encoder: &CanonicalEncoder, path: &Path, gold: u64) {
        let mut document = json!({
            "header": {"version": "1.2.0", "product": "test", "timestamp": 1},
            "systems": {"economy": {"gold": gold}},
        });
        let sealed = seal_document(encoder, &mut document).expect("seal");
        fs::write(path, sealed.text).expect("write save");
    }

    fn manager(dir: &Path) -> CrashRecoveryManager {
        CrashRecoveryManager::new(dir, Arc::new(CanonicalEncoder::new(0)))
    }

    #[test]
    fn temp_files_are_removed_and_saves_kept() {
        let temp = TempDir::new().expect("temp");
        for name in ["a.save.tmp", ".0f3c9a.tmp", "c.partial", "d.writing", "keep.save", "draft.tmp.v2.save"] {
            fs::write(temp.path().join(name), b"x").expect("write");
        }
        let recovery = manager(temp.path());
        assert_eq!(recovery.cleanup_temp_files().expect("cleanup"), 4);
        assert!(temp.path().join("keep.save").exists());
        assert!(temp.path().join("draft.tmp.v2.save").exists());
        assert_eq!(recovery.stats().temp_files_cleaned, 4);
    }

    #[test]
    fn derived_names_need_a_full_timestamp() {
        assert!(is_backup_name("slot_backup_20260101_120000_000.save"));
        assert!(is_backup_name("slot_backup_20260101_120000_000_12.save"));
        assert!(!is_backup_name("my_backup_plan.save"));
        assert!(!is_backup_name("slot_backup_2026.save"));
        assert!(!is_backup_name("slot_backup_20260101_120000_000_x.save"));
        assert!(!is_backup_name("_backup_20260101_120000_000.save"));
        assert!(is_quarantine_name("slot_corrupted_20260101_120000_000.save"));
        assert!(!is_quarantine_name("not_corrupted_yet.save"));

        assert!(is_primary_save_name("my_backup_plan.save"));
        assert!(is_primary_save_name("not_corrupted_yet.save"));
        assert!(!is_primary_save_name("slot_backup_20260101_120000_000.save"));
        assert!(!is_primary_save_name(".hidden.save"));
    }

    #[test]
    fn saves_that_merely_mention_backup_are_left_alone() {
        let temp = TempDir::new().expect("temp");
        let recovery = manager(temp.path());
        let encoder = CanonicalEncoder::new(0);
        let save = temp.path().join("my.save");
        let plan = temp.path().join("my_backup_plan.save");
        write_valid_save(&encoder, &plan, 7);
        fs::write(&save, b"{broken").expect("write corrupted save");

        assert!(recovery.find_backups(&save).expect("backups").is_empty());
        assert_eq!(recovery.prune_backups(&save, 0).expect("prune"), 0);
        assert!(plan.exists());

        let report = recovery.recover_all().expect("recover all");
        assert_eq!(report.corrupted_files, vec![save.clone()]);
        assert!(report.recovered.is_empty());
        assert_eq!(fs::read(&save).expect("unchanged"), b"{broken");
    }

    #[test]
    fn backup_counters_order_numerically() {
        let temp = TempDir::new().expect("temp");
        let recovery = manager(temp.path());
        let save = temp.path().join("slot.save");
        for name in [
            "slot_backup_20260101_000000_000.save",
            "slot_backup_20260101_000000_000_9.save",
            "slot_backup_20260101_000000_000_10.save",
        ] {
            fs::write(temp.path().join(name), b"{}").expect("write backup");
        }
        let backups = recovery.find_backups(&save).expect("backups");
        assert!(backups[0].ends_with("slot_backup_20260101_000000_000_10.save"));
        assert!(backups[2].ends_with("slot_backup_20260101_000000_000.save"));
    }

    #[test]
    fn integrity_check_catches_parse_header_and_checksum_problems() {
        let temp = TempDir::new().expect("temp");
        let recovery = manager(temp.path());
        let encoder = CanonicalEncoder::new(0);

        let good = temp.path().join("good.save");
        write_valid_save(&encoder, &good, 10);
        assert!(recovery.is_intact(&good));

        let garbage = temp.path().join("garbage.save");
        fs::write(&garbage, b"not json").expect("write");
        assert!(matches!(
            recovery.validate_save_integrity(&garbage),
            Err(SaveError::CorruptionDetected { .. })
        ));

        let tampered = temp.path().join("tampered.save");
        let text = fs::read_to_string(&good).expect("read").replace("\"gold\":10", "\"gold\":99");
        fs::write(&tampered, text).expect("write");
        assert!(matches!(
            recovery.validate_save_integrity(&tampered),
            Err(SaveError::ChecksumMismatch { .. })
        ));

        let headless = temp.path().join("headless.save");
        fs::write(&headless, br#"{"systems":{}}"#).expect("write");
        assert!(!recovery.is_intact(&headless));

        let corrupted = recovery.find_corrupted_saves().expect("scan");
        assert_eq!(corrupted.len(), 3);
        assert!(!corrupted.contains(&good));
    }

    #[test]
    fn recovery_uses_newest_intact_backup_and_quarantines_original() {
        let temp = TempDir::new().expect("temp");
        let recovery = manager(temp.path());
        let encoder = CanonicalEncoder::new(0);
        let save = temp.path().join("campaign.save");

        write_valid_save(&encoder, &temp.path().join("campaign_backup_20260101_000000_000.save"), 1);
        write_valid_save(&encoder, &temp.path().join("campaign_backup_20260102_000000_000.save"), 2);
        fs::write(temp.path().join("campaign_backup_20260103_000000_000.save"), b"{broken")
            .expect("write broken backup");
        fs::write(&save, b"\0\0\0").expect("write corrupted save");

        let backups = recovery.find_backups(&save).expect("backups");
        assert_eq!(backups.len(), 3);
        assert!(backups[0].ends_with("campaign_backup_20260103_000000_000.save"));

        let recovered = recovery.recover_file(&save).expect("recover");
        assert!(recovered.backup.ends_with("campaign_backup_20260102_000000_000.save"));
        let quarantined = recovered.quarantined_copy.expect("quarantined copy");
        assert_eq!(fs::read(&quarantined).expect("read quarantined"), b"\0\0\0");
        assert!(recovery.is_intact(&save));
        let restored: serde_json::Value =
            serde_json::from_slice(&fs::read(&save).expect("read restored")).expect("parse");
        assert_eq!(restored["systems"]["economy"]["gold"], json!(2));
        assert_eq!(recovery.stats().successful_recoveries, 1);

        // the quarantined copy is not itself treated as a primary save
        assert!(recovery.find_corrupted_saves().expect("rescan").is_empty());
    }

    #[test]
    fn recovery_without_valid_backup_is_corruption() {
        let temp = TempDir::new().expect("temp");
        let recovery = manager(temp.path());
        let save = temp.path().join("lonely.save");
        fs::write(&save, b"oops").expect("write");

        let report = recovery.recover_all().expect("recover all");
        assert_eq!(report.corrupted_files, vec![save.clone()]);
        assert!(report.recovered.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(
            recovery.recover_file(&save),
            Err(SaveError::CorruptionDetected { .. })
        ));
        assert_eq!(recovery.stats().failed_recoveries, 2);
        assert_eq!(fs::read(&save).expect("unchanged"), b"oops");
    }

    #[test]
    fn pruning_keeps_newest_backups() {
        let temp = TempDir::new().expect("temp");
        let recovery = manager(temp.path());
        let save = temp.path().join("slot.save");
        for day in 1..=5 {
            fs::write(
                temp.path().join(format!("slot_backup_2026010{day}_000000_000.save")),
                b"{}",
            )
            .expect("write backup");
        }
        fs::write(temp.path().join("slot2_backup_20260101_000000_000.save"), b"{}").expect("other");

        assert_eq!(recovery.prune_backups(&save, 2).expect("prune"), 3);
        let remaining = recovery.find_backups(&save).expect("list");
        assert_eq!(remaining.len(), 2);
        assert!(remaining[0].ends_with("slot_backup_20260105_000000_000.save"));
        assert!(temp.path().join("slot2_backup_20260101_000000_000.save").exists());
        assert_eq!(recovery.stats().backups_cleaned, 3);
    }

    #[test]
    fn backup_paths_never_collide() {
        let temp = TempDir::new().expect("temp");
        let recovery = manager(temp.path());
        let save = temp.path().join("slot.save");
        fs::write(&save, b"{}").expect("write");
        let first = recovery.create_backup(&save).expect("first");
        let second = recovery.create_backup(&save).expect("second");
        assert_ne!(first, second);
        assert_eq!(recovery.find_backups(&save).expect("list").len(), 2);
    }
}
