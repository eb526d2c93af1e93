//! Durable write helpers.
//!
//! Creating, renaming or deleting a file changes its directory, and that
//! change is only durable once the directory itself is synced. Every helper
//! here syncs both the data and the directory entry it touches.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Syncs the entries of `dir` to disk.
pub fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// `<path>.tmp`, the staging name used while writing `path`.
fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Stages `bytes` for `path` in a synced `<path>.tmp` and returns its path.
///
/// The staging name is shared, so `path` must have a single writer.
fn write_temp(path: &Path, bytes: &[u8]) -> io::Result<PathBuf> {
    let staged = temp_path_for(path);
    let mut file = File::create(&staged)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(staged)
}

/// Replaces the contents of `path` so that readers see either the old or the
/// new bytes, never a mix: stage, sync, rename over, sync the directory.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let staged = write_temp(path, bytes)?;
    std::fs::rename(&staged, path)?;
    fsync_dir(dir)
}
