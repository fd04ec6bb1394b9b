use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};

use crate::canonical::CacheStats;
use crate::error::OperationKind;
use crate::validation::ValidationReport;
use crate::version::SaveVersion;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SaveStats {
    pub total_saves: u64,
    pub successful_saves: u64,
    pub failed_saves: u64,
    pub cancelled_saves: u64,
    pub total_loads: u64,
    pub successful_loads: u64,
    pub failed_loads: u64,
    pub cancelled_loads: u64,
    pub corrupted_saves_recovered: u64,
    pub migrations_performed: u64,
    pub average_save_time: Duration,
    pub average_load_time: Duration,
    pub total_bytes_saved: u64,
    pub json_cache: CacheStats,
    pub validation_cache_hits: u64,
    pub validation_cache_misses: u64,
    pub concurrent_operations_peak: usize,
}

/// How an operation ended, for statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success,
    Failed,
    Cancelled,
}

impl SaveStats {
    pub fn save_success_rate(&self) -> f64 {
        rate(self.successful_saves, self.total_saves)
    }

    pub fn load_success_rate(&self) -> f64 {
        rate(self.successful_loads, self.total_loads)
    }

    pub fn validation_cache_hit_ratio(&self) -> f64 {
        rate(
            self.validation_cache_hits,
            self.validation_cache_hits + self.validation_cache_misses,
        )
    }

    pub(crate) fn record(&mut self, kind: OperationKind, outcome: Outcome, elapsed: Duration) {
        let (total, succeeded, failed, cancelled, average) = match kind {
            OperationKind::Save => (
                &mut self.total_saves,
                &mut self.successful_saves,
                &mut self.failed_saves,
                &mut self.cancelled_saves,
                &mut self.average_save_time,
            ),
            OperationKind::Load => (
                &mut self.total_loads,
                &mut self.successful_loads,
                &mut self.failed_loads,
                &mut self.cancelled_loads,
                &mut self.average_load_time,
            ),
        };
        *total += 1;
        match outcome {
            Outcome::Success => {
                *succeeded += 1;
                // running mean over successful operations
                let count = (*succeeded).min(u64::from(u32::MAX)) as u32;
                *average = (*average * (count - 1) + elapsed) / count;
            }
            Outcome::Failed => *failed += 1,
            Outcome::Cancelled => *cancelled += 1,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "saves": {
                "total": self.total_saves,
                "successful": self.successful_saves,
                "failed": self.failed_saves,
                "cancelled": self.cancelled_saves,
                "success_rate": self.save_success_rate(),
                "average_time_ms": self.average_save_time.as_millis() as u64,
                "total_bytes": self.total_bytes_saved,
            },
            "loads": {
                "total": self.total_loads,
                "successful": self.successful_loads,
                "failed": self.failed_loads,
                "cancelled": self.cancelled_loads,
                "success_rate": self.load_success_rate(),
                "average_time_ms": self.average_load_time.as_millis() as u64,
            },
            "corrupted_saves_recovered": self.corrupted_saves_recovered,
            "migrations_performed": self.migrations_performed,
            "json_cache": {
                "hits": self.json_cache.hits,
                "misses": self.json_cache.misses,
                "evictions": self.json_cache.evictions,
                "hit_ratio": self.json_cache.hit_ratio(),
            },
            "validation_cache_hit_ratio": self.validation_cache_hit_ratio(),
            "concurrent_operations_peak": self.concurrent_operations_peak,
        })
    }
}

fn rate(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Details of a completed save or load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveOperationResult {
    pub operation_id: String,
    pub path: PathBuf,
    pub message: String,
    pub warnings: Vec<String>,
    pub version_loaded: Option<SaveVersion>,
    pub version_saved: Option<SaveVersion>,
    pub migration_performed: bool,
    pub migration_steps: Vec<String>,
    pub atomic_write_used: bool,
    pub backup_created: Option<PathBuf>,
    pub compressed: bool,
    pub bytes_written: u64,
    pub estimated_size: u64,
    pub checksum: String,
    pub systems: Vec<String>,
    pub validation: Option<ValidationReport>,
    pub operation_time: Duration,
}

impl SaveOperationResult {
    pub fn full_report(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Operation ID: {}", self.operation_id);
        let _ = writeln!(out, "File: {}", self.path.display());
        if !self.message.is_empty() {
            let _ = writeln!(out, "Message: {}", self.message);
        }
        let _ = writeln!(out, "Duration: {}ms", self.operation_time.as_millis());
        if let Some(version) = &self.version_saved {
            let _ = writeln!(out, "Version saved: {version}");
        }
        if let Some(version) = &self.version_loaded {
            let _ = writeln!(out, "Version loaded: {version}");
        }
        if self.bytes_written > 0 {
            let _ = writeln!(out, "Bytes written: {}", self.bytes_written);
        }
        if !self.checksum.is_empty() {
            let _ = writeln!(out, "SHA-256: {}", self.checksum);
        }
        if self.atomic_write_used {
            out.push_str("Atomic write: yes\n");
        }
        if let Some(backup) = &self.backup_created {
            let _ = writeln!(out, "Backup: {}", backup.display());
        }
        if self.migration_performed {
            out.push_str("Migration steps:\n");
            for step in &self.migration_steps {
                let _ = writeln!(out, "  - {step}");
            }
        }
        if !self.warnings.is_empty() {
            out.push_str("Warnings:\n");
            for warning in &self.warnings {
                let _ = writeln!(out, "  - {warning}");
            }
        }
        out
    }

    pub fn to_json(&self) -> Value {
        json!({
            "operation_id": self.operation_id,
            "path": self.path.display().to_string(),
            "message": self.message,
            "warnings": self.warnings,
            "version_loaded": self.version_loaded.as_ref().map(ToString::to_string),
            "version_saved": self.version_saved.as_ref().map(ToString::to_string),
            "migration_performed": self.migration_performed,
            "migration_steps": self.migration_steps,
            "atomic_write_used": self.atomic_write_used,
            "backup_created": self.backup_created.as_ref().map(|path| path.display().to_string()),
            "compressed": self.compressed,
            "bytes_written": self.bytes_written,
            "estimated_size": self.estimated_size,
            "sha256_checksum": self.checksum,
            "systems": self.systems,
            "operation_time_ms": self.operation_time.as_millis() as u64,
            "validation": self.validation.as_ref().map(ValidationReport::to_json),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_mean_and_success_rates() {
        let mut stats = SaveStats::default();
        stats.record(OperationKind::Save, Outcome::Success, Duration::from_millis(10));
        stats.record(OperationKind::Save, Outcome::Success, Duration::from_millis(30));
        stats.record(OperationKind::Save, Outcome::Failed, Duration::from_millis(999));
        stats.record(OperationKind::Load, Outcome::Cancelled, Duration::ZERO);

        assert_eq!(stats.average_save_time, Duration::from_millis(20));
        assert!((stats.save_success_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.cancelled_loads, 1);
        assert_eq!(stats.load_success_rate(), 0.0);

        let value = stats.to_json();
        assert_eq!(value["saves"]["failed"], json!(1));
        assert_eq!(value["saves"]["average_time_ms"], json!(20));
    }

    #[test]
    fn report_lists_migration_steps() {
        let result = SaveOperationResult {
            operation_id: "load_1_0".to_string(),
            migration_performed: true,
            migration_steps: vec!["1.0.0 -> 1.1.0: x".to_string()],
            ..SaveOperationResult::default()
        };
        let report = result.full_report();
        assert!(report.contains("Operation ID: load_1_0"));
        assert!(report.contains("  - 1.0.0 -> 1.1.0: x"));
        assert_eq!(result.to_json()["migration_steps"][0], json!("1.0.0 -> 1.1.0: x"));
    }
}
