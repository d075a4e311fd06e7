use lazy_static::lazy_static;
use std::path::PathBuf;

lazy_static! {
    /// Root of all persistent, per-instance state: the sqlite database and
    /// nothing else survives a restart.
    pub static ref WORK_DIR: PathBuf = std::env::var_os("BISECTBOT_WORK_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./work"));

    /// Per-job scratch directory root: `{workspace_root}/{job_id}/`. Transient,
    /// deleted on executor exit regardless of outcome.
    pub static ref WORKSPACE_ROOT: PathBuf = WORK_DIR.join("workspaces");
}

pub fn workspace_for(job_id: i64) -> PathBuf {
    WORKSPACE_ROOT.join(job_id.to_string())
}
