use crate::bisect;
use crate::config::Config;
use crate::db::{instances, jobs, Database};
use crate::forge::ForgeClient;
use crate::metrics::Metrics;
use crate::prelude::*;
use crate::sandbox::Sandbox;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// The single long-lived control loop per instance, built around the job
/// store's `claim`/`heartbeat`/`release` contract. Owns no state itself
/// beyond the in-flight table; everything that must survive a crash lives
/// in the shared database.
pub struct Scheduler {
    db: Database,
    forge: Arc<ForgeClient>,
    sandbox: Arc<dyn Sandbox>,
    config: Config,
    metrics: Metrics,
    worker_id: &'static str,
    in_flight: Mutex<HashMap<i64, InFlight>>,
}

struct InFlight {
    handle: JoinHandle<()>,
    ownership_lost: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(
        db: Database,
        forge: Arc<ForgeClient>,
        sandbox: Arc<dyn Sandbox>,
        config: Config,
        metrics: Metrics,
    ) -> Self {
        Scheduler {
            db,
            forge,
            sandbox,
            config,
            metrics,
            worker_id: crate::worker_identity::worker_id(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Runs until `shutdown` resolves, then drains. Intended to be spawned
    /// as one of the instance's long-lived tokio tasks alongside the warp
    /// server.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut recovery_tick = tokio::time::interval(self.config.recovery_interval);
        let mut heartbeat_tick = tokio::time::interval(self.config.heartbeat_interval);

        loop {
            tokio::select! {
                _ = recovery_tick.tick() => {
                    self.claim_tick().await;
                }
                _ = heartbeat_tick.tick() => {
                    self.heartbeat_tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_ok() && *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.drain().await;
    }

    async fn claim_tick(&self) {
        let in_flight_count = self.in_flight.lock().await.len() as i64;
        let limit = self.config.max_concurrent_jobs as i64 - in_flight_count;
        if limit <= 0 {
            return;
        }

        let (Ok(pending_grace), Ok(stale_after)) = (
            chrono::Duration::from_std(self.config.pending_grace),
            chrono::Duration::from_std(self.config.heartbeat_stale_after),
        ) else {
            error!("configured grace/stale durations do not fit in a chrono::Duration");
            return;
        };

        let claimed = {
            let db = self.db.clone();
            let worker_id = self.worker_id;
            tokio::task::spawn_blocking(move || {
                jobs::claim(&db, worker_id, limit, pending_grace, stale_after)
            })
            .await
        };

        let claimed = match claimed {
            Ok(Ok(jobs)) => jobs,
            Ok(Err(err)) => {
                error!("claim failed: {err:#}");
                return;
            }
            Err(err) => {
                error!("claim task panicked: {err}");
                return;
            }
        };

        for job in claimed {
            self.metrics
                .observe_claim_latency(chrono::Utc::now() - job.created_at);
            self.spawn_executor(job).await;
        }

        self.metrics.set_in_flight(self.in_flight.lock().await.len() as i64);
    }

    async fn spawn_executor(&self, job: crate::model::Job) {
        let job_id = job.id;
        let db = self.db.clone();
        let worker_id = self.worker_id;

        let exhausted = {
            let db = db.clone();
            tokio::task::spawn_blocking(move || jobs::fail_if_exhausted(&db, job_id, worker_id))
                .await
        };
        match exhausted {
            Ok(Ok(true)) => {
                info!("job {job_id} failed: retry limit exceeded");
                self.metrics.record_terminal("failed");
                return;
            }
            Ok(Ok(false)) => {}
            Ok(Err(err)) => {
                error!("fail_if_exhausted errored for job {job_id}: {err:#}");
                return;
            }
            Err(err) => {
                error!("fail_if_exhausted task panicked for job {job_id}: {err}");
                return;
            }
        }

        let forge = Arc::clone(&self.forge);
        let sandbox = Arc::clone(&self.sandbox);
        let config = self.config.clone();
        let ownership_lost = Arc::new(AtomicBool::new(false));
        let ownership_lost_task = Arc::clone(&ownership_lost);

        let metrics = self.metrics.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let outcome = bisect::execute(&db, &forge, &*sandbox, &config, &job, &ownership_lost_task, &metrics);
            if let Err(err) = outcome {
                error!("job {job_id} executor errored: {err:#}");
            }
        });

        let wrapped = tokio::spawn(async move {
            if let Err(err) = handle.await {
                error!("job {job_id} executor task panicked: {err}");
            }
        });

        self.in_flight.lock().await.insert(
            job_id,
            InFlight {
                handle: wrapped,
                ownership_lost,
            },
        );
    }

    async fn heartbeat_tick(&self) {
        instances::record_heartbeat(&self.db, self.worker_id).ok();

        let mut in_flight = self.in_flight.lock().await;
        in_flight.retain(|_, slot| !slot.handle.is_finished());

        for (&job_id, slot) in in_flight.iter() {
            let db = self.db.clone();
            let worker_id = self.worker_id;
            let ownership_lost = Arc::clone(&slot.ownership_lost);
            tokio::task::spawn_blocking(move || {
                match jobs::heartbeat(&db, job_id, worker_id, None) {
                    Ok(true) => {}
                    Ok(false) => ownership_lost.store(true, Ordering::SeqCst),
                    Err(err) => error!("heartbeat failed for job {job_id}: {err:#}"),
                }
            });
        }
    }

    /// Graceful-shutdown path: release every in-flight job so another
    /// instance can pick it up immediately, rather than waiting out the
    /// stale-heartbeat grace period.
    async fn drain(&self) {
        let in_flight = std::mem::take(&mut *self.in_flight.lock().await);
        for (job_id, slot) in in_flight {
            let db = self.db.clone();
            let worker_id = self.worker_id;
            let _ = tokio::task::spawn_blocking(move || jobs::release(&db, job_id, worker_id)).await;
            let _ = slot.handle.await;
        }
    }
}
