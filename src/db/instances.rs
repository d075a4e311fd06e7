use crate::db::{Database, QueryUtils};
use crate::prelude::*;
use chrono::{DateTime, Utc};

/// A live instance as reported by `/stats`. Populated purely from each
/// instance's own heartbeat, not derived from its in-flight jobs, so the
/// count stays accurate even between claims.
#[derive(Debug, Clone, Serialize)]
pub struct Instance {
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Upserts this instance's row. Called on the same tick as the job-lease
/// heartbeat so a dead instance drops out of `/stats` at the same
/// `heartbeat_stale_after` horizon its orphaned jobs become reclaimable.
pub fn record_heartbeat(db: &Database, worker_id: &str) -> Fallible<()> {
    db.execute(
        "INSERT INTO instances (worker_id, started_at, last_seen_at) VALUES (?1, ?2, ?2)
         ON CONFLICT(worker_id) DO UPDATE SET last_seen_at = excluded.last_seen_at",
        &[&worker_id, &Utc::now()],
    )?;
    Ok(())
}

pub fn list_live(db: &Database, stale_after: chrono::Duration) -> Fallible<Vec<Instance>> {
    let cutoff = Utc::now() - stale_after;
    db.query(
        "SELECT worker_id, started_at, last_seen_at FROM instances
         WHERE last_seen_at >= ?1 ORDER BY worker_id",
        [cutoff],
        |row| {
            Ok(Instance {
                worker_id: row.get("worker_id")?,
                started_at: row.get("started_at")?,
                last_seen_at: row.get("last_seen_at")?,
            })
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_is_idempotent_and_visible() {
        let db = Database::temp().unwrap();
        record_heartbeat(&db, "worker-a").unwrap();
        record_heartbeat(&db, "worker-a").unwrap();

        let live = list_live(&db, chrono::Duration::seconds(300)).unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].worker_id, "worker-a");
    }

    #[test]
    fn stale_instances_are_excluded() {
        let db = Database::temp().unwrap();
        record_heartbeat(&db, "worker-a").unwrap();

        let live = list_live(&db, chrono::Duration::seconds(-1)).unwrap();
        assert!(live.is_empty());
    }
}
