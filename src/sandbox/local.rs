use crate::errors::SandboxError;
use crate::prelude::*;
use crate::sandbox::{verdict_from_exit, Sandbox, SandboxLimits, Verdict};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Runs the test command as a plain child process with no resource
/// isolation at all. Exists only so the bisect loop can be exercised in
/// `#[cfg(test)]` without a container runtime on the test machine; never
/// selected by the `check-config`/`serve` CLI paths.
pub struct LocalSandbox;

impl Sandbox for LocalSandbox {
    fn run(&self, worktree: &Path, command: &str, limits: SandboxLimits) -> Fallible<Verdict> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(worktree)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SandboxError::Spawn(e.to_string()))?;

        let start = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait().context("polling sandbox process")? {
                break Some(status);
            }
            if start.elapsed() >= limits.wall_clock {
                let _ = child.kill();
                let _ = child.wait();
                break None;
            }
            std::thread::sleep(Duration::from_millis(50));
        };

        match status {
            None => Ok(Verdict::Skip {
                reason: format!("{} ({:?})", SandboxError::Timeout, limits.wall_clock),
            }),
            Some(status) => Ok(verdict_from_exit(status.code(), false, "")),
        }
    }

    fn health_check(&self) -> Result<(), SandboxError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn limits(wall_clock: StdDuration) -> SandboxLimits {
        SandboxLimits {
            cpus: 1,
            memory_bytes: 1024 * 1024,
            max_pids: 32,
            wall_clock,
        }
    }

    #[test]
    fn exit_zero_is_good() {
        let dir = tempfile::tempdir().unwrap();
        let verdict = LocalSandbox
            .run(dir.path(), "true", limits(StdDuration::from_secs(5)))
            .unwrap();
        assert_eq!(verdict, Verdict::Good);
    }

    #[test]
    fn nonzero_exit_is_bad() {
        let dir = tempfile::tempdir().unwrap();
        let verdict = LocalSandbox
            .run(dir.path(), "false", limits(StdDuration::from_secs(5)))
            .unwrap();
        assert_eq!(verdict, Verdict::Bad);
    }

    #[test]
    fn reserved_skip_code_is_skip() {
        let dir = tempfile::tempdir().unwrap();
        let verdict = LocalSandbox
            .run(dir.path(), "exit 125", limits(StdDuration::from_secs(5)))
            .unwrap();
        assert!(matches!(verdict, Verdict::Skip { .. }));
    }

    #[test]
    fn slow_command_is_skipped_on_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let verdict = LocalSandbox
            .run(dir.path(), "sleep 5", limits(StdDuration::from_millis(100)))
            .unwrap();
        assert!(matches!(verdict, Verdict::Skip { .. }));
    }
}
