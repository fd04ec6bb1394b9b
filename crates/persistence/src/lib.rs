//! Save/load engine for simulation state: canonical JSON with a SHA-256
//! seal, optional compression, versioned migrations, dirty tracking and
//! crash recovery, coordinated by [`SaveManager`].

pub mod canonical;
pub mod compression;
pub mod config;
pub mod dirty;
pub mod document;
pub mod error;
pub mod manager;
pub mod migration;
pub mod recovery;
pub mod storage;
mod sync;
pub mod validation;
pub mod version;

pub use canonical::{
    canonicalize, sha256_hex, CacheStats, CanonicalEncoder, ChecksumStatus, SealedDocument,
    CHECKSUM_FIELD,
};
pub use compression::{
    CompressedBlock, CompressionAlgorithm, CompressionError, CompressionStats, Compressor,
};
pub use config::{SaveCompression, SaveManagerConfig, CURRENT_SAVE_VERSION};
pub use dirty::{
    ChangeEvent, ChangeKind, DirtyLevel, DirtySystemFilter, DirtyTracker, DirtyTrackerConfig,
    IncrementalSaver, SaveOptimizationHints, SaveStrategy, SubsystemState, TrackerStats,
};
pub use error::{OperationKind, SaveError, SaveErrorKind, SaveResult};
pub use manager::{
    OperationProgress, OperationSnapshot, PendingOperation, Persistable, SaveFileInfo,
    SaveManager, SaveManagerBuilder, SaveOperationResult, SaveStats,
};
pub use migration::{MigrationOutcome, MigrationRegistry};
pub use recovery::{CrashRecoveryManager, RecoveryReport, RecoveryStats};
pub use storage::{OsStorage, SecurePathResolver, StorageBackend};
pub use validation::{
    Severity, ValidationIssue, ValidationReport, ValidatorRegistry, VerificationOptions,
};
pub use version::SaveVersion;
