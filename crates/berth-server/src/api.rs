// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP boundary.
//!
//! A thin axum surface over [`ServiceControl`] and [`DeploymentDispatcher`].
//! Handlers translate between wire DTOs and core types and map [`CoreError`]
//! onto status codes; infrastructure failures are logged with full context
//! and answered with an opaque 500 so internals never leak into responses.
//!
//! The two `/stream` routes speak SSE. Each spawns a driver task owning the
//! event source and hands the response a channel plus a cancellation guard;
//! dropping the response body cancels the driver, which releases the source.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use berth_core::CoreError;
use berth_core::model::{
    ContainerInfo, DeploymentRecord, DeploymentStatus, ServiceKind, ServiceRecord, ServiceStatus,
};
use berth_core::persistence::{NewService, Repository};
use berth_runtime::ContainerRuntime;

use crate::access;
use crate::auth::{AuthError, Identity, TokenVerifier};
use crate::control::{ServiceControl, ServiceView};
use crate::dispatcher::DeploymentDispatcher;
use crate::redis::LogSubscription;
use crate::stream::{
    BearerValidator, ChannelSink, StreamEvent, StreamLimits, channel_events, drive, logs, metrics,
};

/// Shared handles behind every request.
#[derive(Clone)]
pub struct AppState {
    /// Persistence.
    pub repo: Arc<dyn Repository>,
    /// Container engine.
    pub runtime: Arc<dyn ContainerRuntime>,
    /// Bearer-token verification.
    pub verifier: Arc<dyn TokenVerifier>,
    /// Deployment dispatch and history.
    pub dispatcher: Arc<DeploymentDispatcher>,
    /// Service CRUD and runtime workflows.
    pub control: Arc<ServiceControl>,
    /// Client for dedicated pub/sub connections. Lazy; opening a
    /// subscription is what actually connects.
    pub redis_client: redis::Client,
    /// Caps applied to every push stream.
    pub stream_limits: StreamLimits,
    /// Metrics snapshot cadence.
    pub metrics_interval: Duration,
}

/// Wire-level error: a status code, a stable machine code, and a message
/// that is safe to show the caller.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
            "code": self.code,
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let code = err.error_code();
        match &err {
            CoreError::NotFound { .. } => Self::new(StatusCode::NOT_FOUND, code, err.to_string()),
            CoreError::Forbidden { .. } => Self::new(StatusCode::FORBIDDEN, code, err.to_string()),
            CoreError::Validation { .. } => {
                Self::new(StatusCode::BAD_REQUEST, code, err.to_string())
            }
            CoreError::LockUnavailable { .. } => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, code, err.to_string())
            }
            CoreError::RuntimeUnavailable(detail) => {
                warn!(detail, "Container engine unavailable during request");
                Self::new(StatusCode::BAD_GATEWAY, code, "Container engine is unavailable")
            }
            _ => {
                error!(error = %err, "Request failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, "Internal server error")
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", err.to_string())
    }
}

/// Caller identity taken from the `Authorization: Bearer` header.
pub struct AuthedUser(pub Identity);

impl FromRequestParts<AppState> for AuthedUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let token = bearer_token(&parts.headers).ok_or(AuthError::MissingToken)?;
        let identity = state.verifier.verify(&token).await?;
        Ok(Self(identity))
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/services", get(list_services).post(create_service))
        .route("/api/services/{id}", get(get_service).delete(delete_service))
        .route("/api/services/{id}/restart", post(restart_service))
        .route("/api/services/{id}/stop", post(stop_service))
        .route(
            "/api/services/{id}/deployments",
            get(list_deployments)
                .post(create_deployment)
                .delete(clear_deployments),
        )
        .route("/api/deployments/{id}", get(get_deployment))
        .route("/api/deployments/{id}/logs/stream", get(stream_deployment_logs))
        .route("/api/metrics/stream", get(stream_metrics))
        .route(
            "/api/internal/deployments/{id}/status",
            post(report_deployment_status),
        )
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

// Wire DTOs.

/// Component health, reported without tearing the endpoint down when a
/// dependency is unreachable.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    database: bool,
    runtime: bool,
}

/// Payload for creating a service.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateServiceRequest {
    name: String,
    kind: ServiceKind,
    #[serde(default)]
    repo_url: Option<String>,
    #[serde(default)]
    branch: Option<String>,
    #[serde(default)]
    build_command: Option<String>,
    #[serde(default)]
    start_command: Option<String>,
    #[serde(default)]
    port: Option<i32>,
    #[serde(default)]
    env_vars: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    volumes: Vec<String>,
    #[serde(default)]
    custom_domain: Option<String>,
    #[serde(default)]
    static_output_dir: Option<String>,
}

impl From<CreateServiceRequest> for NewService {
    fn from(req: CreateServiceRequest) -> Self {
        NewService {
            // Overwritten with the authenticated caller by ServiceControl.
            owner_id: Uuid::nil(),
            name: req.name,
            kind: req.kind,
            repo_url: req.repo_url,
            branch: req.branch,
            build_command: req.build_command,
            start_command: req.start_command,
            port: req.port,
            env_vars: req.env_vars,
            volumes: req.volumes,
            custom_domain: req.custom_domain,
            static_output_dir: req.static_output_dir,
        }
    }
}

/// A service as returned to its owner: the stored row plus resolved status
/// and live container detail.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceResponse {
    service: ServiceRecord,
    status: ServiceStatus,
    containers: Vec<ContainerInfo>,
    latest_deployment: Option<DeploymentRecord>,
    live: bool,
}

impl From<ServiceView> for ServiceResponse {
    fn from(view: ServiceView) -> Self {
        Self {
            service: view.service,
            status: view.status,
            containers: view.containers,
            latest_deployment: view.latest_deployment,
            live: view.live,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RestartResponse {
    status: ServiceStatus,
    replacement_id: String,
    replacement_name: String,
    replaced: usize,
    cleanup_clean: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StopResponse {
    status: ServiceStatus,
    stopped: usize,
    failures: usize,
}

/// Optional body for dispatching a deployment.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateDeploymentRequest {
    #[serde(default)]
    commit_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentListResponse {
    deployments: Vec<DeploymentRecord>,
    total: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClearedResponse {
    removed: u64,
}

/// Worker-side status report.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusReportRequest {
    status: DeploymentStatus,
    #[serde(default)]
    logs: Option<String>,
}

/// Streams authenticate with either the bearer header or a `token` query
/// parameter, since EventSource clients cannot set headers.
#[derive(Debug, Deserialize)]
struct StreamQuery {
    token: Option<String>,
}

// Handlers.

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = state.repo.ping().await.is_ok();
    let runtime = state.runtime.ping().await.is_ok();
    let status = if database && runtime { "ok" } else { "degraded" };
    if status != "ok" {
        warn!(database, runtime, "Health check degraded");
    }
    Json(HealthResponse {
        status,
        database,
        runtime,
    })
}

async fn list_services(
    State(state): State<AppState>,
    AuthedUser(identity): AuthedUser,
) -> Result<Json<Vec<ServiceResponse>>, ApiError> {
    let views = state.control.list_services(identity.user_id).await?;
    Ok(Json(views.into_iter().map(ServiceResponse::from).collect()))
}

async fn create_service(
    State(state): State<AppState>,
    AuthedUser(identity): AuthedUser,
    Json(req): Json<CreateServiceRequest>,
) -> Result<(StatusCode, Json<ServiceRecord>), ApiError> {
    let service = state
        .control
        .create_service(identity.user_id, req.into())
        .await?;
    Ok((StatusCode::CREATED, Json(service)))
}

async fn get_service(
    State(state): State<AppState>,
    AuthedUser(identity): AuthedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ServiceResponse>, ApiError> {
    let view = state.control.get_service(id, identity.user_id).await?;
    Ok(Json(view.into()))
}

async fn delete_service(
    State(state): State<AppState>,
    AuthedUser(identity): AuthedUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.control.delete_service(id, identity.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn restart_service(
    State(state): State<AppState>,
    AuthedUser(identity): AuthedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<RestartResponse>, ApiError> {
    let report = state.control.restart(id, identity.user_id).await?;
    Ok(Json(RestartResponse {
        status: ServiceStatus::Running,
        replacement_id: report.replacement_id,
        replacement_name: report.replacement_name,
        replaced: report.replaced.len(),
        cleanup_clean: report.cleanup.is_clean(),
    }))
}

async fn stop_service(
    State(state): State<AppState>,
    AuthedUser(identity): AuthedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<StopResponse>, ApiError> {
    let report = state.control.stop(id, identity.user_id).await?;
    Ok(Json(StopResponse {
        status: ServiceStatus::Stopped,
        stopped: report.stopped.len(),
        failures: report.failures.len(),
    }))
}

async fn list_deployments(
    State(state): State<AppState>,
    AuthedUser(identity): AuthedUser,
    Path(id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<DeploymentListResponse>, ApiError> {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let deployments = state
        .dispatcher
        .get_service_deployments(id, identity.user_id, limit)
        .await?;
    let total = state
        .dispatcher
        .count_deployments(id, identity.user_id)
        .await?;
    Ok(Json(DeploymentListResponse { deployments, total }))
}

async fn create_deployment(
    State(state): State<AppState>,
    AuthedUser(identity): AuthedUser,
    Path(id): Path<Uuid>,
    body: Option<Json<CreateDeploymentRequest>>,
) -> Result<(StatusCode, Json<DeploymentRecord>), ApiError> {
    let commit = body.as_ref().and_then(|b| b.commit_hash.as_deref());
    let deployment = state
        .dispatcher
        .create_and_queue_deployment(id, identity.user_id, commit)
        .await?;
    Ok((StatusCode::CREATED, Json(deployment)))
}

async fn clear_deployments(
    State(state): State<AppState>,
    AuthedUser(identity): AuthedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ClearedResponse>, ApiError> {
    let removed = state
        .dispatcher
        .clear_deployments(id, identity.user_id)
        .await?;
    Ok(Json(ClearedResponse { removed }))
}

async fn get_deployment(
    State(state): State<AppState>,
    AuthedUser(identity): AuthedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<DeploymentRecord>, ApiError> {
    let deployment = state.dispatcher.get_deployment(id, identity.user_id).await?;
    Ok(Json(deployment))
}

/// Worker status-update path. Served on the internal listener only; the
/// edge proxy must never route `/api/internal/` to it.
async fn report_deployment_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<StatusReportRequest>,
) -> Result<Json<DeploymentRecord>, ApiError> {
    info!(deployment_id = %id, status = %req.status, "Worker reported deployment status");
    let deployment = state
        .dispatcher
        .update_deployment_status(id, req.status, req.logs.as_deref())
        .await?;
    Ok(Json(deployment))
}

async fn stream_deployment_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static>, ApiError> {
    let token = bearer_token(&headers)
        .or(query.token)
        .ok_or(AuthError::MissingToken)?;
    let identity = state.verifier.verify(&token).await?;
    access::owned_deployment(state.repo.as_ref(), id, identity.user_id).await?;

    let subscription = LogSubscription::open(&state.redis_client, id).await?;
    info!(deployment_id = %id, user_id = %identity.user_id, "Log stream opened");

    let (event_tx, event_rx) = mpsc::channel(64);
    logs::spawn_tail(subscription, event_tx);

    Ok(sse_connection(
        state.verifier.clone(),
        token,
        state.stream_limits,
        format!("logs:{id}"),
        channel_events(event_rx),
    ))
}

async fn stream_metrics(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static>, ApiError> {
    let token = bearer_token(&headers)
        .or(query.token)
        .ok_or(AuthError::MissingToken)?;
    let identity = state.verifier.verify(&token).await?;
    info!(user_id = %identity.user_id, "Metrics stream opened");

    let source = metrics::snapshot_events(
        state.repo.clone(),
        state.runtime.clone(),
        identity.user_id,
        state.metrics_interval,
    );

    Ok(sse_connection(
        state.verifier.clone(),
        token,
        state.stream_limits,
        format!("metrics:{}", identity.user_id),
        source,
    ))
}

/// Wire a stream source to an SSE response through the lifecycle driver.
///
/// The driver task owns the source and re-validates the token as it runs.
/// The response body holds a drop guard on the cancellation token, so a
/// client that goes away tears the driver down on its next loop turn.
fn sse_connection<E>(
    verifier: Arc<dyn TokenVerifier>,
    token: String,
    limits: StreamLimits,
    label: String,
    source: E,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static>
where
    E: Stream<Item = StreamEvent> + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::channel::<StreamEvent>(64);
    let disconnected = CancellationToken::new();
    let drive_token = disconnected.clone();

    tokio::spawn(async move {
        let validator = BearerValidator::new(verifier, token);
        let mut sink = ChannelSink::new(out_tx);
        let summary = drive(source, &mut sink, &validator, limits, drive_token).await;
        info!(
            stream = %label,
            outcome = ?summary.outcome,
            messages = summary.messages_sent,
            write_errors = summary.write_errors,
            duration_ms = summary.duration.as_millis() as u64,
            "Stream closed"
        );
    });

    let body = async_stream::stream! {
        let _disconnect_guard = disconnected.drop_guard();
        while let Some(event) = out_rx.recv().await {
            let terminal = event.is_terminal();
            yield Ok::<Event, Infallible>(to_sse_event(event));
            if terminal {
                break;
            }
        }
    };

    Sse::new(body).keep_alive(KeepAlive::default())
}

fn to_sse_event(event: StreamEvent) -> Event {
    match event {
        StreamEvent::Data(payload) => Event::default().data(payload),
        StreamEvent::Error { message, code } => Event::default().event("error").data(
            serde_json::json!({ "message": message, "code": code }).to_string(),
        ),
    }
}
