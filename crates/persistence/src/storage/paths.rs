use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{SaveError, SaveResult};
use crate::recovery::{is_backup_name, is_quarantine_name};
use crate::validation::ValidationReport;

pub const SAVE_EXTENSION: &str = ".save";
/// Filesystem limit on one path component, in bytes.
pub const MAX_FILENAME_LEN: usize = 255;
/// Bytes kept free for the longest derived sibling, a backup with a counter.
const DERIVED_NAME_HEADROOM: usize = 40;
/// Longest stored save name, extension included.
pub const MAX_SAVE_NAME_LEN: usize = MAX_FILENAME_LEN - DERIVED_NAME_HEADROOM;
const FORBIDDEN_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Maps user-supplied save names onto paths inside a single save root.
#[derive(Debug, Clone)]
pub struct SecurePathResolver {
    root: PathBuf,
}

impl SecurePathResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rejects unsafe names before touching the filesystem, appends the save
    /// extension and confirms the result stays under the root.
    pub fn resolve(&self, filename: &str) -> SaveResult<PathBuf> {
        check_filename(filename)?;

        let file_name = with_save_extension(filename);
        let canonical_root = fs::canonicalize(&self.root)
            .map_err(|source| SaveError::from_io(&self.root, source))?;
        let candidate = canonical_root.join(&file_name);

        // An existing entry may be a symlink pointing elsewhere.
        let resolved = match fs::symlink_metadata(&candidate) {
            Ok(metadata) if metadata.file_type().is_symlink() => fs::canonicalize(&candidate)
                .map_err(|source| SaveError::from_io(&candidate, source))?,
            _ => candidate,
        };
        if !resolved.starts_with(&canonical_root) {
            warn!(
                filename,
                resolved = %resolved.display(),
                "save_path_escapes_root"
            );
            return Err(SaveError::PathEscape { path: resolved });
        }
        Ok(resolved)
    }

    /// [`resolve`](Self::resolve) for a name a new save is written under.
    /// Also refuses names shaped like backups or quarantined copies.
    pub fn resolve_save_target(&self, filename: &str) -> SaveResult<PathBuf> {
        if is_derived_name(filename) {
            return Err(SaveError::InvalidFilename {
                name: filename.to_string(),
                reason: "name is reserved for backups and quarantined copies".to_string(),
            });
        }
        self.resolve(filename)
    }

    /// Advisory report for tooling. Unlike [`resolve`](Self::resolve) it
    /// collects every problem instead of stopping at the first.
    pub fn validate_filename(filename: &str) -> ValidationReport {
        const NAME: &str = "filename";
        let mut report = ValidationReport::new();
        if filename.is_empty() {
            report.add_error(NAME, "", "Filename is empty", Some("Provide a valid filename"));
            return report;
        }
        let stored_len = with_save_extension(filename).len();
        if stored_len > MAX_SAVE_NAME_LEN {
            report.add_error(
                NAME,
                "",
                format!("Filename too long ({stored_len} bytes with extension)"),
                Some("Use a shorter filename; the limit includes the .save extension"),
            );
        }
        if is_derived_name(filename) {
            report.add_error(
                NAME,
                "",
                "Filename has the shape of a backup or quarantined copy",
                Some("Choose a name without a _backup_ or _corrupted_ timestamp suffix"),
            );
        }
        if let Some(bad) = filename.chars().find(|c| is_forbidden(*c)) {
            report.add_error(
                NAME,
                "",
                format!("Filename contains invalid character: {bad:?}"),
                Some("Remove special characters from filename"),
            );
        }
        if filename.contains("..") {
            report.add_critical(
                NAME,
                "",
                "Path traversal attempt detected (..) in filename",
                Some("Remove directory navigation from filename"),
            );
        }
        if filename.contains(['/', '\\']) {
            report.add_error(
                NAME,
                "",
                "Filename contains path separators",
                Some("Use only the filename without path"),
            );
        }
        if is_reserved_name(filename) {
            report.add_error(NAME, "", "Filename is a reserved device name", Some("Choose a different filename"));
        }
        if filename.ends_with(['.', ' ']) {
            report.add_warning(
                NAME,
                "",
                "Filename ends with dot or space",
                Some("Remove trailing dots or spaces"),
            );
        }
        if filename.starts_with('.') {
            report.add_warning(NAME, "", "Filename starts with dot (hidden file)", None);
        }
        if !filename.ends_with(SAVE_EXTENSION) {
            report.add_warning(
                NAME,
                "",
                "Filename missing .save extension",
                Some("Extension will be added automatically"),
            );
        }
        report
    }
}

pub fn with_save_extension(filename: &str) -> String {
    if filename.ends_with(SAVE_EXTENSION) {
        filename.to_string()
    } else {
        format!("{filename}{SAVE_EXTENSION}")
    }
}

/// Reserved device names match case-insensitively on the part before the
/// first dot, so `con.save` and `Com1.tar.save` are both reserved.
pub fn is_reserved_name(filename: &str) -> bool {
    let stem = filename.split('.').next().unwrap_or(filename);
    RESERVED_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(stem))
}

fn is_forbidden(c: char) -> bool {
    c.is_control() || FORBIDDEN_CHARS.contains(&c)
}

fn check_filename(filename: &str) -> SaveResult<()> {
    let invalid = |reason: &str| SaveError::InvalidFilename {
        name: filename.to_string(),
        reason: reason.to_string(),
    };
    if filename.is_empty() {
        return Err(invalid("name is empty"));
    }
    if with_save_extension(filename).len() > MAX_SAVE_NAME_LEN {
        return Err(invalid(&format!(
            "name is longer than {MAX_SAVE_NAME_LEN} bytes including the extension"
        )));
    }
    if filename.contains("..") || filename.contains(['/', '\\']) {
        return Err(SaveError::PathEscape {
            path: PathBuf::from(filename),
        });
    }
    if filename.chars().any(is_forbidden) {
        return Err(invalid("name contains control characters or one of <>:\"|?*"));
    }
    if is_reserved_name(filename) {
        return Err(invalid("name is a reserved device name"));
    }
    Ok(())
}

fn is_derived_name(filename: &str) -> bool {
    let stored = with_save_extension(filename);
    is_backup_name(&stored) || is_quarantine_name(&stored)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::validation::Severity;

    #[test]
    fn resolves_plain_names_inside_root_with_extension() {
        let temp = TempDir::new().expect("temp");
        let resolver = SecurePathResolver::new(temp.path());
        let path = resolver.resolve("campaign").expect("resolve");
        let root = fs::canonicalize(temp.path()).expect("canonical root");
        assert_eq!(path, root.join("campaign.save"));
        assert_eq!(
            resolver.resolve("campaign.save").expect("resolve with ext"),
            root.join("campaign.save")
        );
    }

    #[test]
    fn rejects_traversal_separators_and_reserved_names() {
        let temp = TempDir::new().expect("temp");
        let resolver = SecurePathResolver::new(temp.path());

        assert!(matches!(
            resolver.resolve("../../etc/passwd"),
            Err(SaveError::PathEscape { .. })
        ));
        assert!(matches!(
            resolver.resolve("a/b.save"),
            Err(SaveError::PathEscape { .. })
        ));
        assert!(matches!(
            resolver.resolve("CON.save"),
            Err(SaveError::InvalidFilename { .. })
        ));
        assert!(matches!(
            resolver.resolve("lpt9"),
            Err(SaveError::InvalidFilename { .. })
        ));
        assert!(matches!(
            resolver.resolve("what?.save"),
            Err(SaveError::InvalidFilename { .. })
        ));
        assert!(matches!(resolver.resolve(""), Err(SaveError::InvalidFilename { .. })));
        assert!(matches!(
            resolver.resolve(&"x".repeat(256)),
            Err(SaveError::InvalidFilename { .. })
        ));
        assert_eq!(fs::read_dir(temp.path()).expect("list").count(), 0);
    }

    #[test]
    fn length_limit_counts_the_extension() {
        let temp = TempDir::new().expect("temp");
        let resolver = SecurePathResolver::new(temp.path());
        let longest = "a".repeat(MAX_SAVE_NAME_LEN - SAVE_EXTENSION.len());
        assert!(resolver.resolve(&longest).is_ok());
        assert!(matches!(
            resolver.resolve(&format!("{longest}b")),
            Err(SaveError::InvalidFilename { .. })
        ));
        assert!(matches!(
            resolver.resolve(&"a".repeat(230)),
            Err(SaveError::InvalidFilename { .. })
        ));
        assert_eq!(SecurePathResolver::validate_filename(&"a".repeat(230)).error_count(), 1);
    }

    #[test]
    fn backup_shaped_names_cannot_be_save_targets() {
        let temp = TempDir::new().expect("temp");
        let resolver = SecurePathResolver::new(temp.path());
        assert!(matches!(
            resolver.resolve_save_target("slot_backup_20260101_120000_000"),
            Err(SaveError::InvalidFilename { .. })
        ));
        assert!(matches!(
            resolver.resolve_save_target("slot_corrupted_20260101_120000_000.save"),
            Err(SaveError::InvalidFilename { .. })
        ));
        assert!(resolver.resolve_save_target("my_backup_plan").is_ok());
        // existing backups stay readable by name
        assert!(resolver.resolve("slot_backup_20260101_120000_000").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_out_of_root_is_an_escape() {
        let root = TempDir::new().expect("root");
        let outside = TempDir::new().expect("outside");
        let target = outside.path().join("secret.save");
        fs::write(&target, b"{}").expect("write target");
        std::os::unix::fs::symlink(&target, root.path().join("link.save")).expect("symlink");

        let resolver = SecurePathResolver::new(root.path());
        assert!(matches!(
            resolver.resolve("link"),
            Err(SaveError::PathEscape { .. })
        ));
    }

    #[test]
    fn filename_report_collects_every_problem() {
        let report = SecurePathResolver::validate_filename("../x|y");
        assert!(!report.passed);
        assert_eq!(report.critical_count(), 1);
        assert_eq!(report.error_count(), 2);
        assert!(report
            .issues
            .iter()
            .any(|issue| issue.severity == Severity::Warning
                && issue.message.contains(".save extension")));

        let hidden = SecurePathResolver::validate_filename(".quick.save");
        assert!(hidden.passed);
        assert_eq!(hidden.warning_count(), 1);

        assert!(SecurePathResolver::validate_filename("autosave_3.save").issues.is_empty());
        assert_eq!(SecurePathResolver::validate_filename("").error_count(), 1);
    }
}
