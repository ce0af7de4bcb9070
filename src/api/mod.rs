//! Control-plane HTTP API
//!
//! Read endpoints serve straight from the cache; write endpoints drive the
//! claim coordinator, the reconciler, and the lifecycle primitives. A single
//! shared bearer token guards everything that mutates the pool.

pub mod dashboard;

use std::sync::Arc;

use axum::{
    extract::{Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::pool::{
    ClaimError, ClaimRequest, Instance, LifecycleError, PoolCounts, PoolManager,
};

/// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<PoolManager>,
}

/// Build the full control-plane router
pub fn create_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/", get(dashboard_page))
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/metrics", get(metrics_text))
        .route("/pool/counts", get(counts))
        .route("/pool/agents", get(agents));

    let authed = Router::new()
        .route("/pool/claim", post(claim))
        .route("/pool/replenish", post(replenish))
        .route("/pool/drain", post(drain))
        .route("/pool/reconcile", post(reconcile))
        .route("/pool/status", get(status))
        .route("/pool/instances/:id", delete(recycle_instance))
        .route("/pool/instances/:id/destroy", delete(destroy_instance))
        .route("/pool/crashed/:id", delete(dismiss_crashed))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    public.merge(authed).with_state(state)
}

/// Error responses for the control plane
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    NotFound,
    Conflict(String),
    NoIdleAvailable,
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "instance not found".to_string()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::NoIdleAvailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "no idle instance available".to_string(),
            ),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => {
                warn!(error = %msg, "internal error on control plane");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<ClaimError> for ApiError {
    fn from(e: ClaimError) -> Self {
        match e {
            ClaimError::NoIdleAvailable => ApiError::NoIdleAvailable,
            ClaimError::AlreadyBound => {
                ApiError::Conflict("instance already bound to a conversation".to_string())
            }
            ClaimError::Provider(p) if p.is_transient() => {
                ApiError::Unavailable(format!("provider error: {}", p))
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<LifecycleError> for ApiError {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::NotFound => ApiError::NotFound,
            LifecycleError::Busy => {
                ApiError::Conflict("instance is busy with another operation".to_string())
            }
            LifecycleError::NotCrashed => {
                ApiError::Conflict("instance is not in the crashed state".to_string())
            }
            LifecycleError::Provider(p) if p.is_transient() => {
                ApiError::Unavailable(format!("provider error: {}", p))
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// Bearer-token check for the authenticated route set
async fn require_bearer(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let expected = &state.manager.config().bearer_token;
    // An empty configured token disables auth; main() warns about it loudly
    if expected.is_empty() {
        return Ok(next.run(req).await);
    }

    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if token == expected => Ok(next.run(req).await),
        _ => Err(ApiError::Unauthorized),
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "ok": true }))
}

#[derive(Serialize)]
struct VersionResponse {
    version: &'static str,
    environment: String,
}

async fn version(State(state): State<AppState>) -> impl IntoResponse {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
        environment: state.manager.config().environment.clone(),
    })
}

async fn metrics_text() -> impl IntoResponse {
    use prometheus::Encoder;
    let mut buffer = Vec::new();
    let encoder = prometheus::TextEncoder::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        return ApiError::Internal(format!("metrics encoding failed: {}", e)).into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buffer,
    )
        .into_response()
}

async fn counts(State(state): State<AppState>) -> Json<PoolCounts> {
    Json(state.manager.counts())
}

/// One claimed agent as shown on the dashboard
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentView {
    instance_id: String,
    agent_name: Option<String>,
    conversation_id: Option<String>,
    invite_url: Option<String>,
    url: Option<String>,
    claimed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<Instance> for AgentView {
    fn from(i: Instance) -> Self {
        Self {
            instance_id: i.id,
            agent_name: i.agent_name,
            conversation_id: i.conversation_id,
            invite_url: i.invite_url,
            url: i.url,
            claimed_at: i.claimed_at,
        }
    }
}

async fn agents(State(state): State<AppState>) -> Json<Vec<AgentView>> {
    Json(
        state
            .manager
            .claimed_agents()
            .into_iter()
            .map(AgentView::from)
            .collect(),
    )
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClaimBody {
    agent_name: String,
    instructions: String,
    #[serde(default)]
    join_url: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClaimResponse {
    conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    invite_url: Option<String>,
    instance_id: String,
    joined: bool,
}

async fn claim(
    State(state): State<AppState>,
    Json(body): Json<ClaimBody>,
) -> Result<Json<ClaimResponse>, ApiError> {
    if body.agent_name.trim().is_empty() {
        return Err(ApiError::BadRequest("agentName must not be empty".to_string()));
    }
    if body.instructions.trim().is_empty() {
        return Err(ApiError::BadRequest("instructions must not be empty".to_string()));
    }

    let outcome = state
        .manager
        .claim(ClaimRequest {
            agent_name: body.agent_name.trim().to_string(),
            instructions: body.instructions,
            join_url: body.join_url.filter(|u| !u.trim().is_empty()),
        })
        .await?;

    Ok(Json(ClaimResponse {
        conversation_id: outcome.conversation_id,
        invite_url: outcome.invite_url,
        instance_id: outcome.instance_id,
        joined: outcome.joined,
    }))
}

#[derive(Deserialize)]
struct CountBody {
    count: usize,
}

#[derive(Serialize)]
struct ReplenishResponse {
    scheduled: usize,
}

async fn replenish(
    State(state): State<AppState>,
    Json(body): Json<CountBody>,
) -> Result<Json<ReplenishResponse>, ApiError> {
    if body.count == 0 {
        return Err(ApiError::BadRequest("count must be positive".to_string()));
    }
    let manager = &state.manager;
    let capacity = manager
        .config()
        .max_total
        .saturating_sub(manager.counts().total());
    let scheduled = body.count.min(capacity);
    for _ in 0..scheduled {
        manager.spawn_create();
    }
    Ok(Json(ReplenishResponse { scheduled }))
}

#[derive(Serialize)]
struct DrainResponse {
    drained: usize,
}

async fn drain(
    State(state): State<AppState>,
    Json(body): Json<CountBody>,
) -> Result<Json<DrainResponse>, ApiError> {
    if body.count == 0 {
        return Err(ApiError::BadRequest("count must be positive".to_string()));
    }
    let drained = state.manager.drain(body.count).await;
    Ok(Json(DrainResponse { drained }))
}

async fn reconcile(State(state): State<AppState>) -> impl IntoResponse {
    state.manager.tick().await;
    Json(serde_json::json!({ "ok": true }))
}

#[derive(Serialize)]
struct StatusResponse {
    counts: PoolCounts,
    instances: Vec<Instance>,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        counts: state.manager.counts(),
        instances: state.manager.instances(),
    })
}

#[derive(Serialize)]
struct RecycleResponse {
    recycled: bool,
}

async fn recycle_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RecycleResponse>, ApiError> {
    let recycled = state.manager.recycle_or_destroy(&id).await?;
    Ok(Json(RecycleResponse { recycled }))
}

async fn destroy_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.manager.destroy(&id, true).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn dismiss_crashed(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.manager.dismiss_crashed(&id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn dashboard_page() -> Html<&'static str> {
    Html(dashboard::DASHBOARD_HTML)
}
