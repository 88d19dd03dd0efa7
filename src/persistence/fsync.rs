//! fsync helpers for the snapshot writer.
//!
//! A rename only survives power loss once the directory holding it has been
//! synced, so both the file and its parent directory are flushed.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// Flushes a file's contents and metadata.
pub fn fsync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}

/// Flushes a directory's entries (creations, renames, removals).
pub fn fsync_dir(dir_path: &Path) -> io::Result<()> {
    OpenOptions::new().read(true).open(dir_path)?.sync_all()
}
