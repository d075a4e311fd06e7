use crate::prelude::*;
use std::path::Path;

/// Removes a job's workspace directory on every executor exit path
/// (success, failure, or shutdown). Uses `remove_dir_all` rather than
/// `std::fs::remove_dir_all` because it tolerates the transient "directory
/// not empty" errors Windows and some container filesystems raise while a
/// child process is still releasing file handles.
pub(crate) fn remove_workspace(dir: &Path) -> Fallible<()> {
    if !dir.exists() {
        return Ok(());
    }
    remove_dir_all::remove_dir_all(dir)
        .with_context(|| format!("unable to remove workspace directory {}", dir.display()))
}
