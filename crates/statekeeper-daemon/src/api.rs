//! HTTP surface for the reconciliation engine.
//!
//! Every engine call touches the filesystem or spawns `zfs`, so handlers hop
//! onto the blocking pool before calling into the service.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use statekeeper_core::drift::{DriftBroadcaster, DriftDetector, DriftResult};
use statekeeper_core::error::{StatekeeperError, StatekeeperResult};
use statekeeper_core::plan::{item_key, ResourceKind};
use statekeeper_core::provider::{ShareProvider, ZfsProvider};
use statekeeper_core::service::ReconcileService;
use std::sync::Arc;
use tokio::sync::watch;

pub struct AppState<Z: ZfsProvider, S: ShareProvider> {
    service: Arc<ReconcileService<Z, S>>,
    detector: Arc<DriftDetector>,
    health: watch::Receiver<bool>,
}

impl<Z: ZfsProvider, S: ShareProvider> AppState<Z, S> {
    pub fn new(
        service: Arc<ReconcileService<Z, S>>,
        detector: Arc<DriftDetector>,
        health: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            service,
            detector,
            health,
        })
    }
}

/// Feeds the `/health` watch channel from drift transitions.
pub struct HealthBroadcaster {
    tx: watch::Sender<bool>,
}

impl HealthBroadcaster {
    pub fn new(tx: watch::Sender<bool>) -> Self {
        Self { tx }
    }
}

impl DriftBroadcaster for HealthBroadcaster {
    fn notify_drift(&self, result: &DriftResult) {
        let healthy = result.error.is_none() && !result.has_blocked();
        self.tx.send_replace(healthy);
    }
}

pub fn router<Z, S>(state: Arc<AppState<Z, S>>) -> Router
where
    Z: ZfsProvider + 'static,
    S: ShareProvider + 'static,
{
    let reconcile = Router::new()
        .route("/status", get(status::<Z, S>))
        .route("/plan", get(plan::<Z, S>))
        .route("/apply", post(apply::<Z, S>))
        .route("/approve", post(approve::<Z, S>))
        .route("/check", post(check::<Z, S>))
        .route("/state", get(get_state::<Z, S>).put(put_state::<Z, S>));

    Router::new()
        .route("/health", get(health::<Z, S>))
        .nest("/api/reconcile", reconcile)
        .with_state(state)
}

pub struct ApiError {
    status: StatusCode,
    message: String,
    code: Option<&'static str>,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: None,
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: None,
        }
    }
}

impl From<StatekeeperError> for ApiError {
    fn from(err: StatekeeperError) -> Self {
        let status = match &err {
            e if e.is_state_error() => StatusCode::UNPROCESSABLE_ENTITY,
            StatekeeperError::UnknownKind(_) => StatusCode::BAD_REQUEST,
            StatekeeperError::NotBlocked { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("request failed: {err}");
        }
        Self {
            status,
            message: err.to_string(),
            code: Some(err.code()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "error": self.message,
            "code": self.code,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

async fn blocking<T, F>(job: F) -> Result<T, ApiError>
where
    F: FnOnce() -> StatekeeperResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|err| ApiError::internal(format!("engine task failed: {err}")))?
        .map_err(ApiError::from)
}

fn drift_body(result: &DriftResult) -> Value {
    json!({
        "success": true,
        "status": "checked",
        "drifted": result.drifted,
        "checked_at": result.checked_at,
        "error": result.error,
        "state_path": result.state_path,
        "plan_summary": result.plan.as_ref().map(|plan| plan.summary),
    })
}

async fn health<Z: ZfsProvider, S: ShareProvider>(
    State(state): State<Arc<AppState<Z, S>>>,
) -> &'static str {
    if *state.health.borrow() {
        "OK"
    } else {
        "DEGRADED"
    }
}

async fn status<Z: ZfsProvider, S: ShareProvider>(
    State(state): State<Arc<AppState<Z, S>>>,
) -> Json<Value> {
    let mut body = match state.detector.last_result() {
        Some(result) => drift_body(&result),
        None => json!({
            "success": true,
            "status": "pending",
            "message": "first drift check has not completed yet",
        }),
    };
    body["detector_running"] = json!(state.detector.is_running());
    Json(body)
}

async fn plan<Z: ZfsProvider + 'static, S: ShareProvider + 'static>(
    State(state): State<Arc<AppState<Z, S>>>,
) -> ApiResult {
    let service = Arc::clone(&state.service);
    let plan = blocking(move || service.plan()).await?;
    Ok(Json(json!({ "success": true, "plan": plan })))
}

async fn apply<Z: ZfsProvider + 'static, S: ShareProvider + 'static>(
    State(state): State<Arc<AppState<Z, S>>>,
) -> ApiResult {
    let service = Arc::clone(&state.service);
    let report = blocking(move || service.apply()).await?;

    if !report.unapproved.is_empty() {
        return Ok(Json(json!({
            "success": false,
            "error": "plan contains blocked items that require explicit approval",
            "unapproved": report.unapproved,
            "hint": "POST /api/reconcile/approve with {kind, name, reason} for each blocked item, then apply again",
        })));
    }

    if report.success() {
        info!(
            "apply finished: {} step(s) in {:?}",
            report.applied.len(),
            report.duration
        );
    } else {
        warn!("apply halted with {} failed step(s)", report.failed.len());
    }
    Ok(Json(json!({
        "success": report.success(),
        "applied": report.applied,
        "failed": report.failed,
        "count": report.applied.len(),
        "duration_ms": report.duration.as_millis() as u64,
    })))
}

#[derive(Debug, Deserialize)]
struct ApproveRequest {
    kind: String,
    name: String,
    #[serde(default)]
    reason: String,
}

async fn approve<Z: ZfsProvider + 'static, S: ShareProvider + 'static>(
    State(state): State<Arc<AppState<Z, S>>>,
    Json(request): Json<ApproveRequest>,
) -> ApiResult {
    if request.kind.trim().is_empty() || request.name.trim().is_empty() {
        return Err(ApiError::bad_request("kind and name are required"));
    }
    let kind: ResourceKind = request.kind.parse()?;
    let key = item_key(kind, &request.name);

    let service = Arc::clone(&state.service);
    let ApproveRequest { name, reason, .. } = request;
    let block_reason = blocking(move || service.approve(kind, &name, &reason)).await?;

    Ok(Json(json!({
        "success": true,
        "approved": key,
        "block_reason": block_reason,
        "message": format!("{key} approved; apply the plan to execute it"),
    })))
}

async fn check<Z: ZfsProvider, S: ShareProvider>(
    State(state): State<Arc<AppState<Z, S>>>,
) -> ApiResult {
    let detector = Arc::clone(&state.detector);
    let result = blocking(move || Ok(detector.check_now())).await?;
    Ok(Json(drift_body(&result)))
}

async fn get_state<Z: ZfsProvider + 'static, S: ShareProvider + 'static>(
    State(state): State<Arc<AppState<Z, S>>>,
) -> ApiResult {
    let service = Arc::clone(&state.service);
    let doc = blocking(move || service.get_state()).await?;
    Ok(Json(json!({
        "success": true,
        "path": doc.path,
        "exists": doc.exists,
        "content": doc.content,
    })))
}

#[derive(Debug, Deserialize)]
struct PutStateRequest {
    content: String,
    #[serde(default)]
    dry_run: bool,
}

async fn put_state<Z: ZfsProvider + 'static, S: ShareProvider + 'static>(
    State(state): State<Arc<AppState<Z, S>>>,
    Json(request): Json<PutStateRequest>,
) -> Result<Response, ApiError> {
    if request.content.trim().is_empty() {
        return Err(ApiError::bad_request("content is required"));
    }

    let service = Arc::clone(&state.service);
    let PutStateRequest { content, dry_run } = request;
    let outcome = blocking(move || service.put_state(&content, dry_run)).await?;

    if !outcome.valid {
        let body = json!({
            "success": false,
            "valid": false,
            "written": false,
            "error": outcome.error,
            "field": outcome.field,
        });
        return Ok((StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response());
    }

    if outcome.written {
        let detector = Arc::clone(&state.detector);
        tokio::task::spawn_blocking(move || {
            detector.check_now();
        });
    }

    Ok(Json(json!({
        "success": true,
        "valid": true,
        "written": outcome.written,
        "dry_run": dry_run,
        "summary": outcome.summary,
    }))
    .into_response())
}
