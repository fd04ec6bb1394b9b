use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Writes `bytes` to a unique temp file next to `path`, syncs it and renames
/// it over the destination. An interrupted write leaves the old file intact.
pub(crate) fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = temp_path_for(path);
    if let Err(error) = write_and_sync(&tmp_path, bytes) {
        let _ = fs::remove_file(&tmp_path);
        return Err(error);
    }
    replace_file(&tmp_path, path)?;
    sync_parent(path)
}

pub(crate) fn write_bytes_direct(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    write_and_sync(path, bytes)?;
    sync_parent(path)
}

fn write_and_sync(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn replace_file(tmp_path: &Path, final_path: &Path) -> io::Result<()> {
    // rename replaces atomically on unix; Windows refuses an existing target.
    #[cfg(windows)]
    match fs::remove_file(final_path) {
        Ok(_) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => {
            let _ = fs::remove_file(tmp_path);
            return Err(error);
        }
    }

    if let Err(error) = fs::rename(tmp_path, final_path) {
        let _ = fs::remove_file(tmp_path);
        return Err(error);
    }
    Ok(())
}

fn sync_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => sync_directory(parent),
        _ => Ok(()),
    }
}

#[cfg(unix)]
pub(crate) fn sync_directory(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub(crate) fn sync_directory(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// Fixed-length hidden sibling, so the target name length never matters.
fn temp_path_for(path: &Path) -> PathBuf {
    let tmp_name = format!(".{}.tmp", Uuid::new_v4().simple());
    match path.parent() {
        Some(parent) => parent.join(tmp_name),
        None => PathBuf::from(tmp_name),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn atomic_write_replaces_content_and_leaves_no_temp_files() {
        let temp = TempDir::new().expect("temp");
        let target = temp.path().join("slot.save");
        write_bytes_atomic(&target, b"first").expect("first write");
        write_bytes_atomic(&target, b"second").expect("second write");

        assert_eq!(fs::read(&target).expect("read"), b"second");
        let leftovers = fs::read_dir(temp.path())
            .expect("list")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn temp_names_are_unique_hidden_siblings() {
        let target = Path::new("/saves/slot.save");
        let first = temp_path_for(target);
        let second = temp_path_for(target);
        assert_ne!(first, second);
        assert_eq!(first.parent(), Some(Path::new("/saves")));
        let name = first.file_name().and_then(|n| n.to_str()).expect("name");
        assert!(name.starts_with('.'));
        assert!(name.ends_with(".tmp"));
        assert_eq!(name.len(), 37);
    }

    #[test]
    fn direct_write_creates_parent_dirs() {
        let temp = TempDir::new().expect("temp");
        let target = temp.path().join("nested").join("slot.save");
        write_bytes_direct(&target, b"payload").expect("write");
        assert_eq!(fs::read(&target).expect("read"), b"payload");
    }
}
