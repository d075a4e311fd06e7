use thiserror::Error;

/// Domain errors the bisect loop needs to pattern-match on to pick a terminal
/// job status. Anything else propagates as a plain `anyhow::Error`.
#[derive(Debug, Error)]
pub enum BisectError {
    #[error("endpoints inconsistent")]
    EndpointsInconsistent,

    #[error("untestable range")]
    UntestableRange,

    #[error("wall-clock timeout")]
    WallClockTimeout,

    #[error("retry limit exceeded")]
    RetryLimitExceeded,
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("probe exceeded its time limit")]
    Timeout,

    #[error("probe was killed for exceeding its memory limit")]
    OomKilled,

    #[error("sandbox runtime is not available: {0}")]
    RuntimeMissing(String),

    #[error("sandbox process could not be started: {0}")]
    Spawn(String),
}

#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("transient forge error: {0}")]
    Transient(String),

    #[error("forge request rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("missing `/bisect <good_sha> <bad_sha> <test_command>`")]
    Malformed,

    #[error("invalid commit sha: {0}")]
    InvalidSha(String),

    #[error("invalid repository owner: {0}")]
    InvalidOwner(String),

    #[error("invalid repository name: {0}")]
    InvalidRepoName(String),

    #[error("test command is not allowed: {0}")]
    DisallowedCommand(String),
}
