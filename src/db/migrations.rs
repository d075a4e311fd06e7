use crate::prelude::*;
use rusqlite::Connection;
use std::collections::HashSet;

enum MigrationKind {
    SQL(&'static str),
}

fn migrations() -> Vec<(&'static str, MigrationKind)> {
    let mut migrations = Vec::new();

    migrations.push((
        "initial",
        MigrationKind::SQL(
            "
            CREATE TABLE jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                status TEXT NOT NULL,

                repo_owner TEXT NOT NULL,
                repo_name TEXT NOT NULL,
                installation_id INTEGER NOT NULL,
                issue_number INTEGER NOT NULL,
                requester TEXT NOT NULL,

                good_sha TEXT NOT NULL,
                bad_sha TEXT NOT NULL,
                test_command TEXT NOT NULL,

                worker_id TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 0,

                created_at DATETIME NOT NULL,
                started_at DATETIME,
                heartbeat_at DATETIME,
                finished_at DATETIME,

                culprit_sha TEXT,
                error_message TEXT,
                progress_log TEXT,
                comment_id INTEGER,

                delivery_id TEXT
            );

            CREATE INDEX jobs__status_id ON jobs (status, id);
            CREATE INDEX jobs__delivery_id ON jobs (delivery_id);

            CREATE TABLE instances (
                worker_id TEXT PRIMARY KEY,
                started_at DATETIME NOT NULL,
                last_seen_at DATETIME NOT NULL
            );
            ",
        ),
    ));

    migrations.push((
        "jobs_dedup_window_index",
        MigrationKind::SQL(
            "
            CREATE INDEX jobs__dedup_lookup
            ON jobs (installation_id, issue_number, good_sha, bad_sha, test_command, requester, created_at);
            ",
        ),
    ));

    migrations
}

pub fn execute(db: &mut Connection) -> Fallible<()> {
    // If the database version is 0, create the migrations table and bump it
    let version: i32 = db.query_row("PRAGMA user_version;", [], |r| r.get(0))?;
    if version == 0 {
        db.execute("CREATE TABLE migrations (name TEXT PRIMARY KEY);", [])?;
        db.execute("PRAGMA user_version = 1;", [])?;
    }

    let executed_migrations = {
        let mut prepared = db.prepare("SELECT name FROM migrations;")?;
        let mut result = HashSet::new();
        for value in prepared.query_map([], |row| row.get::<_, String>(0))? {
            result.insert(value?);
        }

        result
    };

    for &(name, ref migration) in &migrations() {
        if !executed_migrations.contains(name) {
            let t = db.transaction()?;
            match migration {
                MigrationKind::SQL(sql) => t.execute_batch(sql),
            }
            .with_context(|| format!("error running migration: {name}"))?;

            t.execute("INSERT INTO migrations (name) VALUES (?1)", [&name])?;
            t.commit()?;

            info!("executed migration: {}", name);
        }
    }

    Ok(())
}
