use crate::errors::SandboxError;
use crate::prelude::*;
use crate::sandbox::{verdict_from_exit, Sandbox, SandboxLimits, Verdict};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Runs the test command in a container created with `docker create` (no
/// shell interpolation -- argv vector built directly) and started with
/// `docker start -a`, one container per probe. The container id is
/// captured up front and `docker rm -f` is deferred so the container is
/// force-removed on every exit path -- including a timeout, where killing
/// the attached `docker start` client leaves the container itself running
/// server-side unless explicitly torn down. Bind mounts are split
/// read-only source/read-write scratch, with fixed cpu/memory/pid limits
/// and networking disabled. Uses a plain blocking call since probes here
/// always run inside `tokio::task::spawn_blocking` rather than on the
/// async runtime itself.
pub struct DockerSandbox {
    image: String,
}

impl DockerSandbox {
    pub fn new(image: String) -> Self {
        DockerSandbox { image }
    }

    fn create_container(&self, worktree: &Path, scratch: &Path, command: &str, limits: &SandboxLimits) -> Fallible<String> {
        let output = Command::new("docker")
            .arg("create")
            .arg("--cpus")
            .arg(limits.cpus.to_string())
            .arg("--memory")
            .arg(limits.memory_bytes.to_string())
            .arg("--pids-limit")
            .arg(limits.max_pids.to_string())
            .arg("--read-only")
            .arg("--security-opt")
            .arg("no-new-privileges")
            .arg("--user")
            .arg("1000:1000")
            .arg("--network")
            .arg("none")
            .arg("-v")
            .arg(format!("{}:/work:ro", worktree.display()))
            .arg("-v")
            .arg(format!("{}:/scratch:rw", scratch.display()))
            .arg("-w")
            .arg("/work")
            .arg(&self.image)
            .arg("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|e| SandboxError::Spawn(e.to_string()))?;

        if !output.status.success() {
            bail!(
                "docker create failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Sandbox for DockerSandbox {
    fn run(&self, worktree: &Path, command: &str, limits: SandboxLimits) -> Fallible<Verdict> {
        let scratch = worktree.join(".bisect-scratch");
        std::fs::create_dir_all(&scratch)
            .with_context(|| format!("creating scratch dir under {}", worktree.display()))?;

        let container_id = self.create_container(worktree, &scratch, command, &limits)?;

        scopeguard::defer! {
            let _ = Command::new("docker")
                .arg("rm")
                .arg("-f")
                .arg(&container_id)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        }

        let mut child = Command::new("docker")
            .arg("start")
            .arg("-a")
            .arg(&container_id)
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
            std::thread::sleep(Duration::from_millis(200));
        };

        let _ = std::fs::remove_dir_all(&scratch);

        // docker reports a container OOM-killed by the kernel as exit 137
        // (128 + SIGKILL); surfaced as `skip`, same as any other probe that
        // never produced a usable verdict.
        const OOM_EXIT_CODE: i32 = 137;
        match status {
            None => Ok(Verdict::Skip {
                reason: format!("{} ({:?})", SandboxError::Timeout, limits.wall_clock),
            }),
            Some(status) if status.code() == Some(OOM_EXIT_CODE) => Ok(Verdict::Skip {
                reason: SandboxError::OomKilled.to_string(),
            }),
            Some(status) => Ok(verdict_from_exit(status.code(), false, "")),
        }
    }

    fn health_check(&self) -> Result<(), SandboxError> {
        let output = Command::new("docker")
            .arg("info")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| SandboxError::RuntimeMissing(e.to_string()))?;
        if output.success() {
            Ok(())
        } else {
            Err(SandboxError::RuntimeMissing(
                "docker info exited non-zero".into(),
            ))
        }
    }
}
