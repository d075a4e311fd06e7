use crate::prelude::*;
use std::path::Path;
use std::process::{Command, Stdio};

/// Thin wrapper around the system `git`, invoked with an explicit argv
/// (no shell interpolation), as a plain blocking call since bisect steps
/// always run inside `tokio::task::spawn_blocking` rather than on an
/// async reactor.
fn git(dir: &Path, args: &[&str]) -> Fallible<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("running git {}", args.join(" ")))?;

    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Clones `url` (with the token embedded, per the forge client) into
/// `dir`. The URL is never logged.
pub fn clone(url: &str, dir: &Path) -> Fallible<()> {
    let output = Command::new("git")
        .args(["clone", "--no-checkout", url, &dir.to_string_lossy()])
        .stdin(Stdio::null())
        .output()
        .context("running git clone")?;

    if !output.status.success() {
        bail!(
            "git clone failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

pub fn checkout(dir: &Path, sha: &str) -> Fallible<()> {
    git(dir, &["checkout", "--force", sha])?;
    Ok(())
}

pub fn bisect_start(dir: &Path, bad_sha: &str, good_sha: &str) -> Fallible<()> {
    git(dir, &["bisect", "start", bad_sha, good_sha])?;
    Ok(())
}

pub fn bisect_good(dir: &Path) -> Fallible<String> {
    bisect_mark(dir, "good")
}

pub fn bisect_bad(dir: &Path) -> Fallible<String> {
    bisect_mark(dir, "bad")
}

pub fn bisect_skip(dir: &Path) -> Fallible<String> {
    bisect_mark(dir, "skip")
}

fn bisect_mark(dir: &Path, verdict: &str) -> Fallible<String> {
    let out = git(dir, &["bisect", verdict])?;
    Ok(out)
}

/// `true` once `git bisect` has narrowed the range to a single commit.
/// git prints a line starting with "<sha> is the first bad commit" at that
/// point; absence of that line means bisection is still in progress.
pub fn bisect_is_done(log: &str) -> Option<String> {
    log.lines()
        .find_map(|line| line.strip_suffix(" is the first bad commit"))
        .map(|sha| sha.to_string())
}

pub fn bisect_reset(dir: &Path) -> Fallible<()> {
    let _ = git(dir, &["bisect", "reset"]);
    Ok(())
}

pub fn rev_parse(dir: &Path, rev: &str) -> Fallible<String> {
    git(dir, &["rev-parse", rev])
}

pub struct CommitInfo {
    pub sha: String,
    pub author: String,
    pub subject: String,
}

pub fn show_commit(dir: &Path, sha: &str) -> Fallible<CommitInfo> {
    let out = git(dir, &["show", "-s", "--format=%H%n%an%n%s", sha])?;
    let mut lines = out.lines();
    let sha = lines.next().unwrap_or(sha).to_string();
    let author = lines.next().unwrap_or("unknown").to_string();
    let subject = lines.collect::<Vec<_>>().join(" ");
    Ok(CommitInfo {
        sha,
        author,
        subject,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_the_terminal_bisect_log_line() {
        let log = "Bisecting: 0 revisions left to test\n\
                    a1b2c3d4 is the first bad commit\n\
                    commit a1b2c3d4";
        assert_eq!(bisect_is_done(log), Some("a1b2c3d4".to_string()));
    }

    #[test]
    fn returns_none_while_still_bisecting() {
        let log = "Bisecting: 3 revisions left to test after this (roughly 2 steps)";
        assert_eq!(bisect_is_done(log), None);
    }
}
