//! Filesystem access for the save manager: safe path resolution plus the
//! platform write capability, kept behind a trait so tests can inject faults.

mod atomic_io;
mod paths;

use std::fs;
use std::io;
use std::path::Path;

use tracing::warn;

pub use paths::{
    is_reserved_name, with_save_extension, SecurePathResolver, MAX_FILENAME_LEN, MAX_SAVE_NAME_LEN,
    SAVE_EXTENSION,
};

pub const SPACE_SAFETY_MARGIN: u64 = 50 * 1024 * 1024;
pub const LOW_SPACE_WARNING: u64 = 100 * 1024 * 1024;

/// Durable file primitives the save manager depends on.
pub trait StorageBackend: Send + Sync {
    /// Temp file, fsync, rename, directory fsync.
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;
    fn write_direct(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn sync_directory(&self, dir: &Path) -> io::Result<()>;
    fn available_space(&self, dir: &Path) -> io::Result<u64>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OsStorage;

impl StorageBackend for OsStorage {
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        atomic_io::write_bytes_atomic(path, bytes)
    }

    fn write_direct(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        atomic_io::write_bytes_direct(path, bytes)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn sync_directory(&self, dir: &Path) -> io::Result<()> {
        atomic_io::sync_directory(dir)
    }

    fn available_space(&self, dir: &Path) -> io::Result<u64> {
        fs2::available_space(dir)
    }
}

/// Bytes that must be free before writing a payload of `payload_size`.
pub fn required_space(payload_size: u64, auto_backup: bool, atomic: bool) -> u64 {
    let mut required = if auto_backup {
        payload_size.saturating_mul(2)
    } else {
        payload_size
    };
    if atomic {
        required = required.saturating_add(payload_size);
    }
    required.saturating_add(SPACE_SAFETY_MARGIN)
}

/// Returns `(required, available)` when there is not enough room.
pub(crate) fn check_space(
    storage: &dyn StorageBackend,
    dir: &Path,
    payload_size: u64,
    auto_backup: bool,
    atomic: bool,
) -> Result<(), (u64, u64)> {
    let required = required_space(payload_size, auto_backup, atomic);
    let available = match storage.available_space(dir) {
        Ok(available) => available,
        Err(error) => {
            warn!(dir = %dir.display(), error = %error, "free_space_query_failed");
            return Ok(());
        }
    };
    if available < LOW_SPACE_WARNING {
        warn!(available, dir = %dir.display(), "low_disk_space");
    }
    if available < required {
        return Err((required, available));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSpace(u64);

    impl StorageBackend for FixedSpace {
        fn write_atomic(&self, _path: &Path, _bytes: &[u8]) -> io::Result<()> {
            Ok(())
        }
        fn write_direct(&self, _path: &Path, _bytes: &[u8]) -> io::Result<()> {
            Ok(())
        }
        fn read(&self, _path: &Path) -> io::Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn sync_directory(&self, _dir: &Path) -> io::Result<()> {
            Ok(())
        }
        fn available_space(&self, _dir: &Path) -> io::Result<u64> {
            Ok(self.0)
        }
    }

    #[test]
    fn required_space_scales_with_backup_and_atomic() {
        assert_eq!(required_space(100, false, false), 100 + SPACE_SAFETY_MARGIN);
        assert_eq!(required_space(100, true, false), 200 + SPACE_SAFETY_MARGIN);
        assert_eq!(required_space(100, true, true), 300 + SPACE_SAFETY_MARGIN);
        assert_eq!(required_space(100, false, true), 200 + SPACE_SAFETY_MARGIN);
    }

    #[test]
    fn space_check_fails_closed() {
        let dir = Path::new(".");
        let tight = FixedSpace(SPACE_SAFETY_MARGIN + 150);
        assert!(check_space(&tight, dir, 100, false, false).is_ok());
        assert_eq!(
            check_space(&tight, dir, 100, true, true),
            Err((SPACE_SAFETY_MARGIN + 300, SPACE_SAFETY_MARGIN + 150))
        );
    }
}
