mod command;
mod signature;

use crate::config::Config;
use crate::db::{jobs, Database};
use crate::forge::ForgeClient;
use crate::model::{self, JobSpec};
use crate::prelude::*;
use serde_derive::Deserialize;

pub use command::{parse as parse_command, BisectCommand};
pub use signature::verify_signature;

#[derive(Debug, Deserialize)]
pub struct IssueCommentEvent {
    pub action: String,
    pub comment: Comment,
    pub issue: Issue,
    pub repository: Repository,
    pub installation: Installation,
}

#[derive(Debug, Deserialize)]
pub struct Comment {
    pub body: String,
    pub user: User,
}

#[derive(Debug, Deserialize)]
pub struct User {
    pub login: String,
}

#[derive(Debug, Deserialize)]
pub struct Issue {
    pub number: i64,
}

#[derive(Debug, Deserialize)]
pub struct Repository {
    pub name: String,
    pub owner: User,
}

#[derive(Debug, Deserialize)]
pub struct Installation {
    pub id: i64,
}

/// What the HTTP layer needs to decide on a response: 200 on accepted or
/// silently-ignored, 401 on bad signature, 400 on malformed payload. Job
/// creation itself never fails the request -- the comment posted in
/// response to a malformed command is a courtesy, not a retry signal.
pub enum Outcome {
    Accepted { job_id: Option<i64> },
    Ignored,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("invalid webhook signature")]
    BadSignature,
    #[error("malformed webhook payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Entry point for `POST /webhook`: verify, dispatch by event kind,
/// translate a recognized command into a job row, and -- on a malformed
/// command specifically -- post an explanatory reply instead of a job.
///
/// `remote` is logged, never used for any decision -- a bad signature is
/// rejected regardless of where it claims to come from. On a signature
/// failure only the event kind and source address are logged; the
/// delivery id and payload are withheld since the request hasn't proven
/// it actually came from the configured forge.
pub fn ingest(
    db: &Database,
    forge: &ForgeClient,
    config: &Config,
    event_kind: &str,
    delivery_id: &str,
    signature: &str,
    remote: Option<std::net::SocketAddr>,
    body: &[u8],
) -> Result<Outcome, IngestError> {
    if !verify_signature(&config.forge_webhook_secret, body, signature) {
        let addr = remote.map(|a| a.to_string()).unwrap_or_else(|| "unknown".to_string());
        warn!("rejected webhook: bad signature (event={event_kind}, source={addr})");
        return Err(IngestError::BadSignature);
    }

    if event_kind == "ping" {
        info!("webhook ping received, configuration looks correct");
        return Ok(Outcome::Ignored);
    }

    if event_kind != "issue_comment" {
        return Ok(Outcome::Ignored);
    }

    let event: IssueCommentEvent = serde_json::from_slice(body)?;
    if event.action != "created" {
        return Ok(Outcome::Ignored);
    }

    let parsed = command::parse(&event.comment.body).and_then(|maybe_cmd| {
        let Some(cmd) = maybe_cmd else {
            return Ok(None);
        };
        model::validate_owner(&event.repository.owner.login)?;
        model::validate_repo_name(&event.repository.name)?;
        Ok(Some(cmd))
    });

    match parsed {
        Ok(None) => Ok(Outcome::Ignored),
        Ok(Some(cmd)) => {
            let spec = JobSpec {
                repo_owner: event.repository.owner.login,
                repo_name: event.repository.name,
                installation_id: event.installation.id,
                issue_number: event.issue.number,
                requester: event.comment.user.login,
                good_sha: cmd.good_sha,
                bad_sha: cmd.bad_sha,
                test_command: cmd.test_command,
                delivery_id: delivery_id.to_string(),
            };
            match jobs::create(db, spec) {
                Ok(job_id) => Ok(Outcome::Accepted { job_id }),
                Err(err) => {
                    error!("failed to record job for delivery {delivery_id}: {err:#}");
                    Ok(Outcome::Accepted { job_id: None })
                }
            }
        }
        Err(reason) => {
            let _ = forge.create_comment(
                &event.repository.owner.login,
                &event.repository.name,
                event.issue.number,
                event.installation.id,
                &format!(
                    "Couldn't start a bisect: {reason}.\n\n\
                     Usage: `/bisect <good_sha> <bad_sha> <test_command>`"
                ),
            );
            Ok(Outcome::Ignored)
        }
    }
}
