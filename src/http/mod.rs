use crate::db::{instances, jobs, Database, QueryUtils};
use crate::forge::ForgeClient;
use crate::metrics::Metrics;
use crate::model::JobStatus;
use crate::prelude::*;
use crate::sandbox::Sandbox;
use crate::webhook;
use serde_derive::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

/// Everything a route handler needs, threaded through `warp::any().map(...)`
/// filters.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub forge: Arc<ForgeClient>,
    pub sandbox: Arc<dyn Sandbox>,
    pub config: crate::config::Config,
    pub metrics: Metrics,
}

pub fn routes(
    state: AppState,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let state_filter = warp::any().map(move || state.clone());

    let webhook = warp::post()
        .and(warp::path("webhook"))
        .and(warp::path::end())
        .and(state_filter.clone())
        .and(warp::header::<String>("x-github-event"))
        .and(warp::header::<String>("x-github-delivery"))
        .and(warp::header::<String>("x-hub-signature-256"))
        .and(warp::filters::addr::remote())
        .and(warp::body::bytes())
        .map(handle_webhook);

    let health = warp::get()
        .and(warp::path("health"))
        .and(warp::path::end())
        .and(state_filter.clone())
        .map(handle_health);

    let stats = warp::get()
        .and(warp::path("stats"))
        .and(warp::path::end())
        .and(state_filter.clone())
        .map(handle_stats);

    let job = warp::get()
        .and(warp::path("job"))
        .and(warp::path::param())
        .and(warp::path::end())
        .and(state_filter.clone())
        .map(handle_job);

    let metrics = warp::get()
        .and(warp::path("metrics"))
        .and(warp::path::end())
        .and(state_filter)
        .map(handle_metrics);

    webhook.or(health).or(stats).or(job).or(metrics)
}

fn handle_webhook(
    state: AppState,
    event: String,
    delivery_id: String,
    signature: String,
    remote: Option<std::net::SocketAddr>,
    body: bytes::Bytes,
) -> impl Reply {
    let result = webhook::ingest(
        &state.db,
        &state.forge,
        &state.config,
        &event,
        &delivery_id,
        &signature,
        remote,
        &body[..],
    );

    let addr = remote.map(|a| a.to_string()).unwrap_or_else(|| "unknown".to_string());
    let outcome = match &result {
        Ok(webhook::Outcome::Accepted { job_id: Some(_) }) => "accepted:job_created",
        Ok(webhook::Outcome::Accepted { job_id: None }) => "accepted:duplicate_or_failed",
        Ok(webhook::Outcome::Ignored) => "ignored",
        Err(webhook::IngestError::BadSignature) => "rejected:bad_signature",
        Err(webhook::IngestError::Malformed(_)) => "rejected:malformed",
    };
    info!("webhook request: event={event} delivery={delivery_id} source={addr} outcome={outcome}");

    match result {
        Ok(_) => warp::reply::with_status("accepted\n".to_string(), StatusCode::OK),
        Err(webhook::IngestError::BadSignature) => {
            warp::reply::with_status("invalid signature\n".to_string(), StatusCode::UNAUTHORIZED)
        }
        Err(webhook::IngestError::Malformed(err)) => warp::reply::with_status(
            format!("malformed payload: {err}\n"),
            StatusCode::BAD_REQUEST,
        ),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    reason: Option<String>,
}

fn handle_health(state: AppState) -> impl Reply {
    let sandbox_ok = state.sandbox.health_check();
    let db_ok = state.db.exists("SELECT 1", &[]);

    let (status, reason, code) = match (sandbox_ok, db_ok) {
        (Ok(()), Ok(true)) => ("healthy", None, StatusCode::OK),
        (Err(e), _) => ("degraded", Some(e.to_string()), StatusCode::SERVICE_UNAVAILABLE),
        (_, Err(e)) => ("degraded", Some(e.to_string()), StatusCode::SERVICE_UNAVAILABLE),
        (_, Ok(false)) => (
            "degraded",
            Some("job store trivial query returned no row".to_string()),
            StatusCode::SERVICE_UNAVAILABLE,
        ),
    };

    warp::reply::with_status(
        warp::reply::json(&HealthResponse {
            status,
            reason,
        }),
        code,
    )
}

#[derive(Serialize)]
struct StatsResponse {
    by_status: std::collections::HashMap<String, i64>,
    in_flight_here: i64,
    live_instances: usize,
}

fn handle_stats(state: AppState) -> impl Reply {
    let result = (|| -> Fallible<StatsResponse> {
        let counts = jobs::counts_by_status(&state.db)?;
        let in_flight_here =
            jobs::count_in_flight_for(&state.db, crate::worker_identity::worker_id())?;
        let live_instances =
            instances::list_live(&state.db, chrono::Duration::from_std(state.config.heartbeat_stale_after)?)?
                .len();

        let mut by_status = std::collections::HashMap::new();
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            by_status.insert(status.as_str().to_string(), 0);
        }
        for (status, count) in counts {
            by_status.insert(status.as_str().to_string(), count);
        }

        Ok(StatsResponse {
            by_status,
            in_flight_here,
            live_instances,
        })
    })();

    match result {
        Ok(stats) => {
            warp::reply::with_status(warp::reply::json(&stats), StatusCode::OK).into_response()
        }
        Err(err) => {
            error!("stats query failed: {err:#}");
            warp::reply::with_status(
                warp::reply::json(&serde_json::json!({"error": err.to_string()})),
                StatusCode::INTERNAL_SERVER_ERROR,
            )
            .into_response()
        }
    }
}

fn handle_job(id: i64, state: AppState) -> impl Reply {
    match jobs::get(&state.db, id) {
        Ok(Some(job)) => {
            warp::reply::with_status(warp::reply::json(&job.redacted()), StatusCode::OK)
                .into_response()
        }
        Ok(None) => warp::reply::with_status(
            warp::reply::json(&serde_json::json!({"error": "not found"})),
            StatusCode::NOT_FOUND,
        )
        .into_response(),
        Err(err) => {
            error!("job lookup failed: {err:#}");
            warp::reply::with_status(
                warp::reply::json(&serde_json::json!({"error": err.to_string()})),
                StatusCode::INTERNAL_SERVER_ERROR,
            )
            .into_response()
        }
    }
}

fn handle_metrics(state: AppState) -> impl Reply {
    match state.metrics.gather_text() {
        Ok(buffer) => warp::reply::with_status(buffer, StatusCode::OK).into_response(),
        Err(err) => {
            error!("metrics gather failed: {err:#}");
            warp::reply::with_status(
                format!("error: {err}\n"),
                StatusCode::INTERNAL_SERVER_ERROR,
            )
            .into_response()
        }
    }
}

pub async fn recover(err: Rejection) -> Result<impl Reply, Infallible> {
    if err.is_not_found() {
        Ok(warp::reply::with_status(
            "not found\n".to_string(),
            StatusCode::NOT_FOUND,
        ))
    } else {
        error!("unhandled rejection: {err:?}");
        Ok(warp::reply::with_status(
            "internal error\n".to_string(),
            StatusCode::INTERNAL_SERVER_ERROR,
        ))
    }
}
