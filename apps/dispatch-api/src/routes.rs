//! HTTP routes for the dispatch API.
//!
//! The process endpoints are designed to be hit by an external cron:
//! each run takes a distributed lock so overlapping triggers (or a
//! second deployment) collapse to one worker doing the round.

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use core_config::dispatch::DispatchTuning;
use docstore::DocumentStore;
use domain_dispatch::{
    flags, lock_keys, metrics, DisasterBank, DispatchError, HealthCheck, HealthReport, JobKind,
    LockManager, MailScheduler, NewJob, ProviderRegistry, QueueReport, RecoveryReport, SmartSender,
    TemplateEngine,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub scheduler: MailScheduler,
    pub disaster: DisasterBank,
    pub sender: SmartSender,
    pub templates: Arc<TemplateEngine>,
    pub health: HealthCheck,
    pub locks: LockManager,
    pub registry: ProviderRegistry,
    pub tuning: DispatchTuning,
    pub cron_secret: Arc<String>,
}

/// Error envelope returned on every failure.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

struct ApiError(DispatchError);

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DispatchError::NoProvidersAvailable => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::AllProvidersFailed { .. } => StatusCode::BAD_GATEWAY,
            DispatchError::LockConflict { .. } => StatusCode::CONFLICT,
            DispatchError::LockBackend { .. } | DispatchError::Store(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            DispatchError::TransportTimeout { .. } | DispatchError::TransportError { .. } => {
                StatusCode::BAD_GATEWAY
            }
            DispatchError::Template(_) => StatusCode::BAD_REQUEST,
            DispatchError::Config(_) | DispatchError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorBody {
            error: self.0.to_string(),
            code: self.0.code(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    let guarded = Router::new()
        .route("/scheduler/process", post(process_queue))
        .route("/disaster-bank/process", post(process_disaster))
        .route("/health-check", post(run_health_check))
        .route("/jobs", post(enqueue_job))
        .route("/jobs/{id}", delete(cancel_job))
        .route("/flags/suspend", post(set_suspended))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_cron_secret,
        ));

    Router::new()
        .route("/health", get(liveness))
        .route("/metrics", get(render_metrics))
        .merge(guarded)
        .with_state(state)
}

/// Shared-secret gate for the trigger and operator endpoints.
async fn require_cron_secret(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get("x-cron-secret")
        .and_then(|v| v.to_str().ok());
    if presented != Some(state.cron_secret.as_str()) {
        warn!(path = %request.uri().path(), "Rejected trigger with bad or missing secret");
        let body = ErrorBody {
            error: "missing or invalid x-cron-secret header".to_string(),
            code: "UNAUTHORIZED",
        };
        return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
    }
    next.run(request).await
}

async fn liveness() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn render_metrics() -> String {
    metrics::render_metrics()
}

async fn process_queue(State(state): State<AppState>) -> ApiResult<Json<QueueReport>> {
    let now = Utc::now();
    let ttl = Duration::seconds(state.tuning.claim_lease_secs as i64);
    let scheduler = state.scheduler.clone();
    let report = state
        .locks
        .run_with_lock(lock_keys::QUEUE_DRAIN, ttl, now, || async move {
            scheduler.process_queue(now).await
        })
        .await?;
    Ok(Json(report))
}

async fn process_disaster(State(state): State<AppState>) -> ApiResult<Json<RecoveryReport>> {
    let now = Utc::now();
    let ttl = Duration::seconds(state.tuning.disaster_lease_secs as i64);
    let disaster = state.disaster.clone();
    let sender = state.sender.clone();
    let templates = state.templates.clone();
    let report = state
        .locks
        .run_with_lock(lock_keys::DISASTER_SWEEP, ttl, now, || async move {
            disaster.process(&sender, &templates, now).await
        })
        .await?;
    Ok(Json(report))
}

async fn run_health_check(State(state): State<AppState>) -> ApiResult<Json<HealthReport>> {
    let now = Utc::now();
    let health = state.health.clone();
    let report = state
        .locks
        .run_with_lock(
            lock_keys::HEALTH_SWEEP,
            Duration::seconds(120),
            now,
            || async move { health.run(now).await },
        )
        .await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct EnqueueRequest {
    #[serde(default = "default_kind")]
    kind: JobKind,
    to_email: String,
    to_name: String,
    subject: String,
    body_template: String,
    #[serde(default)]
    variables: BTreeMap<String, String>,
    scheduled_time: DateTime<Utc>,
    idempotency_key: String,
}

fn default_kind() -> JobKind {
    JobKind::Manual
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
    status: String,
}

async fn enqueue_job(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> ApiResult<(StatusCode, Json<EnqueueResponse>)> {
    let new = NewJob {
        kind: request.kind,
        to_email: request.to_email,
        to_name: request.to_name,
        subject: request.subject,
        body_template: request.body_template,
        variables: request.variables,
        scheduled_time: request.scheduled_time,
        idempotency_key: request.idempotency_key,
    };
    let job = state.scheduler.enqueue(new, Utc::now()).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            job_id: job.id,
            status: job.status.to_string(),
        }),
    ))
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    cancelled: bool,
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    let cancelled = state.scheduler.cancel(&job_id).await?;
    Ok(Json(CancelResponse { cancelled }))
}

#[derive(Debug, Deserialize)]
struct SuspendRequest {
    suspended: bool,
}

async fn set_suspended(
    State(state): State<AppState>,
    Json(request): Json<SuspendRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    flags::set_suspended(state.store.as_ref(), request.suspended).await?;
    Ok(Json(
        serde_json::json!({ "suspended": request.suspended }),
    ))
}
