use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::compression::CompressionError;
use crate::version::{SaveVersion, VersionParseError};

pub type SaveResult<T> = Result<T, SaveError>;

/// Coarse grouping of [`SaveError`] variants, used for statistics and CLI exit reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveErrorKind {
    Filesystem,
    Integrity,
    Concurrency,
    Compatibility,
    Unclassified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Save,
    Load,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Save => "save",
            Self::Load => "load",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("invalid save filename '{name}': {reason}")]
    InvalidFilename { name: String, reason: String },
    #[error("resolved path escapes the save directory: {path}")]
    PathEscape { path: PathBuf },
    #[error("save file not found: {path}")]
    FileNotFound { path: PathBuf },
    #[error("permission denied for {path}: {source}")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("insufficient disk space: need {required} bytes, have {available} bytes")]
    InsufficientSpace { required: u64, available: u64 },
    #[error("failed to read/write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("checksum mismatch (expected {expected}, calculated {actual})")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("corruption detected: {message}")]
    CorruptionDetected { message: String },
    #[error("validation failed: {summary}")]
    ValidationFailed {
        summary: String,
        suggested_fix: Option<String>,
    },
    #[error("serialization failed: {message}")]
    SerializationFailed { message: String },
    #[error("migration {from} -> {to} failed at step {step}: {message}")]
    MigrationFailed {
        from: SaveVersion,
        to: SaveVersion,
        step: usize,
        message: String,
    },
    #[error("version error: {message}")]
    VersionError { message: String },
    #[error("{kind} slot not acquired within {timeout:?}")]
    ConcurrencyLimitExceeded {
        kind: OperationKind,
        timeout: Duration,
    },
    #[error("operation {operation_id} was cancelled")]
    OperationCancelled { operation_id: String },
    #[error(transparent)]
    Compression(#[from] CompressionError),
    #[error("unknown error: {message}")]
    Unknown { message: String },
}

impl SaveError {
    pub fn kind(&self) -> SaveErrorKind {
        match self {
            Self::InvalidFilename { .. }
            | Self::PathEscape { .. }
            | Self::FileNotFound { .. }
            | Self::PermissionDenied { .. }
            | Self::InsufficientSpace { .. }
            | Self::Io { .. } => SaveErrorKind::Filesystem,
            Self::ChecksumMismatch { .. }
            | Self::CorruptionDetected { .. }
            | Self::ValidationFailed { .. }
            | Self::SerializationFailed { .. }
            | Self::Compression(_) => SaveErrorKind::Integrity,
            Self::ConcurrencyLimitExceeded { .. } | Self::OperationCancelled { .. } => {
                SaveErrorKind::Concurrency
            }
            Self::MigrationFailed { .. } | Self::VersionError { .. } => {
                SaveErrorKind::Compatibility
            }
            Self::Unknown { .. } => SaveErrorKind::Unclassified,
        }
    }

    pub fn suggested_fix(&self) -> Option<&str> {
        match self {
            Self::ValidationFailed { suggested_fix, .. } => suggested_fix.as_deref(),
            Self::InvalidFilename { .. } => {
                Some("use a plain file name without separators or reserved names")
            }
            Self::InsufficientSpace { .. } => Some("free disk space or disable auto-backup"),
            Self::ChecksumMismatch { .. } | Self::CorruptionDetected { .. } => {
                Some("restore the save from a backup")
            }
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::OperationCancelled { .. })
    }

    pub(crate) fn from_io(path: &Path, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => Self::FileNotFound {
                path: path.to_path_buf(),
            },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                path: path.to_path_buf(),
                source,
            },
            _ => Self::Io {
                path: path.to_path_buf(),
                source,
            },
        }
    }

    pub(crate) fn corruption(message: impl Into<String>) -> Self {
        Self::CorruptionDetected {
            message: message.into(),
        }
    }
}

impl From<VersionParseError> for SaveError {
    fn from(error: VersionParseError) -> Self {
        Self::VersionError {
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_onto_filesystem_variants() {
        let path = Path::new("slot.save");
        let not_found = SaveError::from_io(path, io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(not_found, SaveError::FileNotFound { .. }));

        let denied = SaveError::from_io(path, io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(denied, SaveError::PermissionDenied { .. }));

        let other = SaveError::from_io(path, io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(matches!(other, SaveError::Io { .. }));
        assert_eq!(other.kind(), SaveErrorKind::Filesystem);
    }

    #[test]
    fn kinds_group_taxonomy() {
        let cancelled = SaveError::OperationCancelled {
            operation_id: "save_1_0".to_string(),
        };
        assert_eq!(cancelled.kind(), SaveErrorKind::Concurrency);
        assert!(cancelled.is_cancelled());

        let mismatch = SaveError::ChecksumMismatch {
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        assert_eq!(mismatch.kind(), SaveErrorKind::Integrity);
        assert!(mismatch.suggested_fix().is_some());

        let version: SaveError = VersionParseError::Malformed("x".to_string()).into();
        assert_eq!(version.kind(), SaveErrorKind::Compatibility);
    }
}
