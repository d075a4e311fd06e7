mod docker;
mod local;

pub use docker::DockerSandbox;
pub use local::LocalSandbox;

use crate::errors::SandboxError;
use crate::prelude::*;
use std::path::Path;
use std::time::Duration;

/// Resource ceiling applied to every probe. Values are fixed; only the
/// per-probe wall clock varies with remaining job budget.
#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub cpus: u32,
    pub memory_bytes: u64,
    pub max_pids: u32,
    pub wall_clock: Duration,
}

impl SandboxLimits {
    pub fn for_remaining_budget(remaining: Duration) -> Self {
        SandboxLimits {
            cpus: 1,
            memory_bytes: 2 * 1024 * 1024 * 1024,
            max_pids: 256,
            wall_clock: remaining,
        }
    }
}

/// exit code the bisect loop treats as an explicit "skip this commit"
/// signal from the test command itself, distinct from a timeout/OOM skip.
pub const SKIP_EXIT_CODE: i32 = 125;

/// The tri-valued result of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Good,
    Bad,
    Skip { reason: String },
}

/// The single operation the bisect executor depends on. Implementations
/// vary in how they isolate the process; all must release every resource
/// on every exit path, including a panic or process crash in the caller.
pub trait Sandbox: Send + Sync {
    fn run(
        &self,
        worktree: &Path,
        command: &str,
        limits: SandboxLimits,
    ) -> Fallible<Verdict>;

    /// Used by `GET /health`: a cheap probe that the backend's runtime
    /// (container daemon, etc.) is reachable, without running a command.
    fn health_check(&self) -> Result<(), SandboxError>;
}

pub(crate) fn verdict_from_exit(code: Option<i32>, timed_out: bool, reason: &str) -> Verdict {
    if timed_out {
        return Verdict::Skip {
            reason: reason.to_string(),
        };
    }
    match code {
        Some(0) => Verdict::Good,
        Some(SKIP_EXIT_CODE) => Verdict::Skip {
            reason: "test command exited with the reserved skip code".into(),
        },
        Some(_) => Verdict::Bad,
        None => Verdict::Skip {
            reason: reason.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_zero_is_good() {
        assert_eq!(verdict_from_exit(Some(0), false, ""), Verdict::Good);
    }

    #[test]
    fn nonzero_is_bad() {
        assert_eq!(verdict_from_exit(Some(1), false, ""), Verdict::Bad);
    }

    #[test]
    fn reserved_skip_code_is_skip() {
        assert!(matches!(
            verdict_from_exit(Some(SKIP_EXIT_CODE), false, ""),
            Verdict::Skip { .. }
        ));
    }

    #[test]
    fn timeout_is_skip_not_bad() {
        assert!(matches!(
            verdict_from_exit(None, true, "timed out"),
            Verdict::Skip { .. }
        ));
    }
}
