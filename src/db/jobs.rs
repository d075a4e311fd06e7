use crate::config::MAX_ATTEMPTS;
use crate::db::{Database, QueryUtils, TransactionHandle};
use crate::model::{Job, JobOutcome, JobSpec, JobStatus};
use crate::prelude::*;
use chrono::Utc;
use rusqlite::Row;
use std::str::FromStr;

fn from_row(row: &Row) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get("id")?,
        status: JobStatus::from_str(&row.get::<_, String>("status")?).map_err(|e| {
            rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text)
        })?,
        repo_owner: row.get("repo_owner")?,
        repo_name: row.get("repo_name")?,
        installation_id: row.get("installation_id")?,
        issue_number: row.get("issue_number")?,
        requester: row.get("requester")?,
        good_sha: row.get("good_sha")?,
        bad_sha: row.get("bad_sha")?,
        test_command: row.get("test_command")?,
        worker_id: row.get("worker_id")?,
        attempt_count: row.get("attempt_count")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        heartbeat_at: row.get("heartbeat_at")?,
        finished_at: row.get("finished_at")?,
        culprit_sha: row.get("culprit_sha")?,
        error_message: row.get("error_message")?,
        progress_log: row.get("progress_log")?,
        comment_id: row.get("comment_id")?,
        delivery_id: row.get("delivery_id")?,
    })
}

const SELECT_COLUMNS: &str = "id, status, repo_owner, repo_name, installation_id, issue_number, \
    requester, good_sha, bad_sha, test_command, worker_id, attempt_count, created_at, \
    started_at, heartbeat_at, finished_at, culprit_sha, error_message, progress_log, \
    comment_id, delivery_id";

fn get_in(t: &TransactionHandle, id: i64) -> Fallible<Option<Job>> {
    t.query_row(
        &format!("SELECT {SELECT_COLUMNS} FROM jobs WHERE id = ?1"),
        [id],
        |row| from_row(row).map_err(Into::into),
    )
}

/// The dedup window's lower bound: a repeat of the same
/// `(installation_id, issue_number, good_sha, bad_sha, test_command,
/// requester)` tuple within this many seconds of an existing job does not
/// insert a second row. `delivery_id` is recorded on the row for
/// debugging a specific delivery but plays no part in this decision.
const DEDUP_WINDOW_SECONDS: i64 = 60;

/// Inserts a new job in `pending` status. Returns `Ok(None)` instead of
/// creating a duplicate if an equivalent job was created within the dedup
/// window, making webhook redelivery (and rapid re-posting of the same
/// command) idempotent.
pub fn create(db: &Database, spec: JobSpec) -> Fallible<Option<i64>> {
    db.transaction(true, |t| {
        let window_start = Utc::now() - chrono::Duration::seconds(DEDUP_WINDOW_SECONDS);
        if t.exists(
            "SELECT 1 FROM jobs
             WHERE installation_id = ?1 AND issue_number = ?2 AND good_sha = ?3
               AND bad_sha = ?4 AND test_command = ?5 AND requester = ?6
               AND created_at >= ?7",
            &[
                &spec.installation_id,
                &spec.issue_number,
                &spec.good_sha,
                &spec.bad_sha,
                &spec.test_command,
                &spec.requester,
                &window_start,
            ],
        )? {
            return Ok(None);
        }

        t.execute(
            "INSERT INTO jobs (
                status, repo_owner, repo_name, installation_id, issue_number, requester,
                good_sha, bad_sha, test_command, attempt_count, created_at, delivery_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?11)",
            &[
                &JobStatus::Pending.as_str(),
                &spec.repo_owner,
                &spec.repo_name,
                &spec.installation_id,
                &spec.issue_number,
                &spec.requester,
                &spec.good_sha,
                &spec.bad_sha,
                &spec.test_command,
                &Utc::now(),
                &spec.delivery_id,
            ],
        )?;

        let id = t.with_conn(|conn| Ok(conn.last_insert_rowid()))?;
        Ok(Some(id))
    })
}

pub fn get(db: &Database, id: i64) -> Fallible<Option<Job>> {
    db.query_row(
        &format!("SELECT {SELECT_COLUMNS} FROM jobs WHERE id = ?1"),
        [id],
        |row| from_row(row).map_err(Into::into),
    )
}

pub fn attach_comment(db: &Database, id: i64, comment_id: i64) -> Fallible<()> {
    db.execute(
        "UPDATE jobs SET comment_id = ?1 WHERE id = ?2",
        &[&comment_id, &id],
    )?;
    Ok(())
}

/// Atomically claims up to `limit` eligible jobs for `worker_id`: `pending`
/// rows older than `pending_grace`, and `running` rows whose last
/// heartbeat predates `stale_after` (an instance that crashed mid-job,
/// recovered here rather than by a separate sweep). Lowest `id` first.
/// Runs inside a single `BEGIN IMMEDIATE` transaction so two instances
/// racing against the same database never claim the same row.
pub fn claim(
    db: &Database,
    worker_id: &str,
    limit: i64,
    pending_grace: chrono::Duration,
    stale_after: chrono::Duration,
) -> Fallible<Vec<Job>> {
    db.transaction(true, |t| {
        let pending_cutoff = Utc::now() - pending_grace;
        let stale_cutoff = Utc::now() - stale_after;

        let candidate_ids: Vec<i64> = t.query(
            "SELECT id FROM jobs
             WHERE (status = 'pending' AND created_at < ?1)
                OR (status = 'running' AND heartbeat_at < ?2)
             ORDER BY id ASC
             LIMIT ?3",
            (pending_cutoff, stale_cutoff, limit),
            |row| row.get(0),
        )?;

        let now = Utc::now();
        let mut claimed = Vec::with_capacity(candidate_ids.len());
        for id in candidate_ids {
            let previous_status: String = t
                .query_row(
                    "SELECT status FROM jobs WHERE id = ?1",
                    [id],
                    |row| row.get(0).map_err(Into::into),
                )?
                .ok_or_else(|| anyhow!("candidate job {id} vanished inside claim transaction"))?;

            t.execute(
                "UPDATE jobs SET status = 'running', worker_id = ?1,
                    started_at = COALESCE(started_at, ?2), heartbeat_at = ?2,
                    attempt_count = attempt_count + 1
                 WHERE id = ?3",
                &[&worker_id, &now, &id],
            )?;

            if previous_status == "running" {
                debug!("reclaimed job {id} from a stale heartbeat");
            }

            if let Some(job) = get_in(t, id)? {
                claimed.push(job);
            }
        }

        Ok(claimed)
    })
}

/// Extends a running job's lease and optionally appends to its progress
/// log. Called both from the scheduler's own periodic tick and from the
/// executor at each bisect step, so the lease renews even if one of the
/// two callers stalls. Returns `false` if `worker_id` no longer owns the
/// row — the caller must abandon the job.
pub fn heartbeat(
    db: &Database,
    id: i64,
    worker_id: &str,
    progress_append: Option<&str>,
) -> Fallible<bool> {
    db.transaction(true, |t| {
        let changed = if let Some(line) = progress_append {
            t.execute(
                "UPDATE jobs SET heartbeat_at = ?1,
                    progress_log = COALESCE(progress_log, '') || ?2 || char(10)
                 WHERE id = ?3 AND worker_id = ?4 AND status = 'running'",
                &[&Utc::now(), &line, &id, &worker_id],
            )?
        } else {
            t.execute(
                "UPDATE jobs SET heartbeat_at = ?1
                 WHERE id = ?2 AND worker_id = ?3 AND status = 'running'",
                &[&Utc::now(), &id, &worker_id],
            )?
        };
        Ok(changed == 1)
    })
}

/// Marks a job as terminal. Only succeeds if `worker_id` still owns the
/// row, so a worker whose lease was already reclaimed as stale can't
/// overwrite another instance's result out from under it.
pub fn finish(db: &Database, id: i64, worker_id: &str, outcome: JobOutcome) -> Fallible<bool> {
    let (status, culprit_sha, error_message): (&str, Option<String>, Option<String>) =
        match outcome {
            JobOutcome::Completed { culprit_sha } => ("completed", Some(culprit_sha), None),
            JobOutcome::Failed { reason } => ("failed", None, Some(reason)),
            JobOutcome::Cancelled => ("cancelled", None, None),
        };

    db.transaction(true, |t| {
        let changed = t.execute(
            "UPDATE jobs SET status = ?1, culprit_sha = ?2, error_message = ?3, finished_at = ?4
             WHERE id = ?5 AND worker_id = ?6 AND status = 'running'",
            &[
                &status,
                &culprit_sha,
                &error_message,
                &Utc::now(),
                &id,
                &worker_id,
            ],
        )?;
        Ok(changed == 1)
    })
}

/// Returns a running job to `pending` without counting it as a failed
/// attempt: clears `worker_id`, `started_at` and `heartbeat_at`, and
/// decrements `attempt_count`. Used on graceful shutdown so a draining
/// instance's in-flight jobs are immediately available to others.
pub fn release(db: &Database, id: i64, worker_id: &str) -> Fallible<bool> {
    db.transaction(true, |t| {
        let changed = t.execute(
            "UPDATE jobs SET status = 'pending', worker_id = NULL, started_at = NULL,
                heartbeat_at = NULL, attempt_count = attempt_count - 1
             WHERE id = ?1 AND worker_id = ?2 AND status = 'running'",
            &[&id, &worker_id],
        )?;
        Ok(changed == 1)
    })
}

/// Invoked by the claimer, before handing a freshly-claimed job to an
/// executor, when its post-claim `attempt_count` has exceeded
/// `MAX_ATTEMPTS`. Transitions the row directly to `failed` with reason
/// "retry limit exceeded" rather than running it a fourth time. Returns
/// whether the job was exhausted.
pub fn fail_if_exhausted(db: &Database, id: i64, worker_id: &str) -> Fallible<bool> {
    db.transaction(true, |t| {
        let attempt_count: Option<i64> = t.query_row(
            "SELECT attempt_count FROM jobs WHERE id = ?1 AND worker_id = ?2 AND status = 'running'",
            (id, worker_id),
            |row| row.get(0).map_err(Into::into),
        )?;

        let Some(attempt_count) = attempt_count else {
            return Ok(false);
        };

        if attempt_count <= MAX_ATTEMPTS {
            return Ok(false);
        }

        t.execute(
            "UPDATE jobs SET status = 'failed', error_message = ?1, finished_at = ?2
             WHERE id = ?3 AND worker_id = ?4",
            &[
                &crate::errors::BisectError::RetryLimitExceeded.to_string(),
                &Utc::now(),
                &id,
                &worker_id,
            ],
        )?;
        Ok(true)
    })
}

pub fn list_recent(db: &Database, limit: i64) -> Fallible<Vec<Job>> {
    db.query(
        &format!("SELECT {SELECT_COLUMNS} FROM jobs ORDER BY id DESC LIMIT ?1"),
        [limit],
        from_row,
    )
}

pub fn counts_by_status(db: &Database) -> Fallible<Vec<(JobStatus, i64)>> {
    let rows = db.query(
        "SELECT status, COUNT(*) FROM jobs GROUP BY status",
        [],
        |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
    )?;
    rows.into_iter()
        .map(|(status, count)| Ok((JobStatus::from_str(&status)?, count)))
        .collect()
}

pub fn count_in_flight_for(db: &Database, worker_id: &str) -> Fallible<i64> {
    Ok(db
        .query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = 'running' AND worker_id = ?1",
            [worker_id],
            |row| row.get(0).map_err(Into::into),
        )?
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    const NO_GRACE: chrono::Duration = chrono::Duration::seconds(-1);

    fn spec(delivery_id: &str) -> JobSpec {
        JobSpec {
            repo_owner: "rust-lang".into(),
            repo_name: "example".into(),
            installation_id: 1,
            issue_number: 42,
            requester: "octocat".into(),
            good_sha: "a".repeat(40),
            bad_sha: "b".repeat(40),
            test_command: "cargo test".into(),
            delivery_id: delivery_id.into(),
        }
    }

    fn claim_one(db: &Database, worker_id: &str) -> Option<Job> {
        claim(db, worker_id, 1, NO_GRACE, chrono::Duration::seconds(300))
            .unwrap()
            .into_iter()
            .next()
    }

    #[test]
    fn create_is_idempotent_per_delivery() {
        let db = Database::temp().unwrap();
        let first = create(&db, spec("delivery-1")).unwrap();
        let second = create(&db, spec("delivery-1")).unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[test]
    fn claim_then_heartbeat_then_finish() {
        let db = Database::temp().unwrap();
        let id = create(&db, spec("delivery-2")).unwrap().unwrap();

        let claimed = claim_one(&db, "worker-a").unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempt_count, 1);

        assert!(heartbeat(&db, id, "worker-a", Some("cloning")).unwrap());

        assert!(finish(
            &db,
            id,
            "worker-a",
            JobOutcome::Completed {
                culprit_sha: "c".repeat(40)
            }
        )
        .unwrap());

        let job = get(&db, id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.culprit_sha.is_some());
    }

    #[test]
    fn claim_respects_limit_and_fifo_order() {
        let db = Database::temp().unwrap();
        let first = create(&db, spec("delivery-a")).unwrap().unwrap();
        let second = create(&db, spec("delivery-b")).unwrap().unwrap();
        let _third = create(&db, spec("delivery-c")).unwrap().unwrap();

        let claimed = claim(&db, "worker-a", 2, NO_GRACE, chrono::Duration::seconds(300)).unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].id, first);
        assert_eq!(claimed[1].id, second);
    }

    #[test]
    fn claim_reclaims_stale_running_job() {
        let db = Database::temp().unwrap();
        let id = create(&db, spec("delivery-3")).unwrap().unwrap();
        claim(&db, "worker-a", 1, NO_GRACE, chrono::Duration::seconds(0)).unwrap();

        // worker-a's heartbeat is already "stale" relative to a zero window.
        let reclaimed = claim(&db, "worker-b", 1, NO_GRACE, chrono::Duration::seconds(0))
            .unwrap()
            .into_iter()
            .next()
            .unwrap();
        assert_eq!(reclaimed.id, id);
        assert_eq!(reclaimed.worker_id.as_deref(), Some("worker-b"));
        assert_eq!(reclaimed.attempt_count, 2);
    }

    #[test]
    fn pending_jobs_are_not_claimable_before_grace_period() {
        let db = Database::temp().unwrap();
        create(&db, spec("delivery-grace")).unwrap().unwrap();

        let claimed = claim(
            &db,
            "worker-a",
            1,
            chrono::Duration::seconds(300),
            chrono::Duration::seconds(300),
        )
        .unwrap();
        assert!(claimed.is_empty());
    }

    #[test]
    fn fail_if_exhausted_fails_job_once_over_the_cap() {
        let db = Database::temp().unwrap();
        let id = create(&db, spec("delivery-4")).unwrap().unwrap();

        for attempt in 1..=MAX_ATTEMPTS + 1 {
            let job = claim(&db, "worker-a", 1, NO_GRACE, chrono::Duration::seconds(0))
                .unwrap()
                .into_iter()
                .next()
                .unwrap();
            assert_eq!(job.attempt_count, attempt);

            if fail_if_exhausted(&db, id, "worker-a").unwrap() {
                break;
            }
        }

        let job = get(&db, id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("retry limit exceeded"));
    }

    #[test]
    fn release_returns_job_to_pending_without_counting_attempt() {
        let db = Database::temp().unwrap();
        let id = create(&db, spec("delivery-5")).unwrap().unwrap();
        claim_one(&db, "worker-a").unwrap();
        assert!(release(&db, id, "worker-a").unwrap());

        let job = get(&db, id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt_count, 0);
    }
}
