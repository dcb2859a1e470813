//! HTTP/WS router (spec §6.1 transport binding): REST endpoints over the
//! four control-plane components plus the `/ws` realtime upgrade, built the
//! way `at-bridge::http_api` builds its router — one function assembling
//! routes and layers, handlers grouped by resource below it.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use fc_api_types::{Envelope, PageRequest, PagedResponse};
use fc_core::persistence::Store;
use fc_core::types::{
    ApprovalAction, ApprovalDecision, Build, Channel, CompatibilityResult, OrgRuntimeConfig, ProviderId, RepoRef,
    RunnerCapabilities, RunnerLoad, SessionState, Usage,
};
use fc_realtime::protocol::ClientMessage;
use fc_update::sweep::{OptedInRepo, RepoSweepResult, RepoSweepStatus, SweepType, TriggerOptions};
use fc_update::version_watcher::{VersionWatcher, WatchEvent};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::daemon::AppState;
use crate::error::ApiError;
use crate::rate_limit_middleware::{limiter_from_config, RateLimitLayer};

pub fn router(state: Arc<AppState>) -> Router {
    let rate_limiter = Arc::new(limiter_from_config(&state.config.daemon.rate_limit));
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/metrics", get(get_metrics))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/stop", post(stop_session))
        .route("/api/sessions/{id}/pause", post(pause_session))
        .route("/api/sessions/{id}/resume", post(resume_session))
        .route("/api/sessions/{id}/report-state", post(report_session_state))
        .route("/api/sessions/{id}/usage", post(report_session_usage))
        .route("/api/sessions/{id}/approvals", post(request_approval))
        .route("/api/sessions/{id}/approvals/{approval_id}", post(resolve_approval))
        .route("/api/runners", get(list_runners).post(register_runner))
        .route("/api/runners/{id}", get(get_runner).delete(remove_runner))
        .route("/api/runners/{id}/heartbeat", post(heartbeat))
        .route("/api/runners/{id}/drain", post(drain_runner))
        .route("/api/runners/{id}/maintenance", post(set_maintenance))
        .route("/api/builds", post(register_build))
        .route("/api/builds/recommended", get(recommended_build))
        .route("/api/builds/{id}", get(get_build))
        .route("/api/builds/{id}/compat-results", post(add_compatibility_result))
        .route("/api/builds/{id}/promote", post(promote_build))
        .route("/api/builds/{id}/deprecate", post(deprecate_build))
        .route("/api/orgs", post(upsert_org))
        .route("/api/sweeps", post(trigger_sweep))
        .route("/api/sweeps/{id}", get(get_sweep_results))
        .route("/api/sweeps/{id}/cancel", post(cancel_sweep))
        .route("/api/canary/runs", post(trigger_canary_run))
        .route("/api/canary/runs/{id}", get(get_canary_run))
        .route("/api/rollouts", post(initiate_rollout))
        .route("/api/rollouts/{id}", get(get_rollout))
        .route("/api/rollouts/{id}/advance", post(advance_rollout))
        .route("/api/rollouts/{id}/pause", post(pause_rollout))
        .route("/api/rollouts/{id}/resume", post(resume_rollout))
        .route("/api/rollouts/{id}/rollback", post(rollback_rollout))
        .route("/api/rollouts/{id}/events", get(rollout_events))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(RateLimitLayer::new(rate_limiter))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    org_id: String,
    provider_id: ProviderId,
    repo: RepoRef,
    task: Option<String>,
    #[serde(default)]
    required_features: Vec<String>,
    timeout_minutes: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ListSessionsQuery {
    org_id: Option<String>,
    #[serde(flatten)]
    page: PageRequest,
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .sessions
        .create_with_timeout(req.org_id, req.provider_id, req.repo, req.task, &req.required_features, req.timeout_minutes)
        .await?;
    state.metrics.incr("sessions_created");
    Ok((StatusCode::CREATED, Json(Envelope::ok(session))))
}

async fn list_sessions(State(state): State<Arc<AppState>>, Query(q): Query<ListSessionsQuery>) -> impl IntoResponse {
    let sessions = state.sessions.list(q.org_id.as_deref()).await;
    Json(Envelope::ok(PagedResponse::paginate(sessions, &q.page)))
}

async fn get_session(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(Envelope::ok(state.sessions.get(id).await?)))
}

#[derive(Debug, Deserialize, Default)]
struct StopSessionRequest {
    reason: Option<String>,
}

async fn stop_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    body: Option<Json<StopSessionRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let reason = body.map(|Json(b)| b.reason).unwrap_or(None);
    let session = state.sessions.stop(id, reason).await?;
    state.metrics.incr("sessions_stop_requested");
    state
        .hub
        .broadcast_session_event(id, fc_realtime::protocol::SessionAction::Completed, serde_json::json!({ "state": session.state }))
        .await;
    Ok(Json(Envelope::ok(session)))
}

async fn pause_session(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(Envelope::ok(state.sessions.pause(id).await?)))
}

async fn resume_session(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(Envelope::ok(state.sessions.resume(id).await?)))
}

#[derive(Debug, Deserialize)]
struct ReportStateRequest {
    state: SessionState,
}

async fn report_session_state(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ReportStateRequest>,
) -> impl IntoResponse {
    state.sessions.report_state(id, req.state).await;
    if let Ok(session) = state.sessions.get(id).await {
        state
            .hub
            .broadcast_session_event(id, fc_realtime::protocol::SessionAction::StateChange, serde_json::json!({ "state": session.state }))
            .await;
    }
    StatusCode::ACCEPTED
}

async fn report_session_usage(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(delta): Json<Usage>,
) -> impl IntoResponse {
    state.sessions.report_usage(id, delta).await;
    StatusCode::ACCEPTED
}

#[derive(Debug, Deserialize)]
struct RequestApprovalRequest {
    action: ApprovalAction,
    description: String,
    context: Option<serde_json::Value>,
}

async fn request_approval(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<RequestApprovalRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let approval = state.sessions.request_approval(id, req.action, req.description, req.context).await?;
    state
        .hub
        .broadcast_session_event(id, fc_realtime::protocol::SessionAction::ApprovalRequest, serde_json::to_value(&approval).unwrap_or_default())
        .await;
    Ok((StatusCode::CREATED, Json(Envelope::ok(approval))))
}

#[derive(Debug, Deserialize)]
struct ResolveApprovalRequest {
    decision: ApprovalDecision,
}

async fn resolve_approval(
    State(state): State<Arc<AppState>>,
    Path((id, approval_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<ResolveApprovalRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(Envelope::ok(state.sessions.resolve_approval(id, approval_id, req.decision).await?)))
}

// ---------------------------------------------------------------------------
// Runners
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RegisterRunnerRequest {
    hostname: String,
    capabilities: RunnerCapabilities,
    #[serde(default)]
    metadata: std::collections::HashMap<String, String>,
}

async fn register_runner(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRunnerRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let runner = state.fleet.register_runner(req.hostname, req.capabilities, req.metadata).await?;
    state.metrics.incr("runners_registered");
    Ok((StatusCode::CREATED, Json(Envelope::ok(runner))))
}

async fn list_runners(State(state): State<Arc<AppState>>, Query(page): Query<PageRequest>) -> impl IntoResponse {
    Json(Envelope::ok(PagedResponse::paginate(state.fleet.list_runners().await, &page)))
}

async fn get_runner(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(Envelope::ok(state.fleet.get_runner(id).await?)))
}

async fn remove_runner(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, ApiError> {
    state.fleet.remove_runner(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn drain_runner(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(Envelope::ok(state.fleet.drain_runner(id).await?)))
}

#[derive(Debug, Deserialize)]
struct MaintenanceRequest {
    on: bool,
}

async fn set_maintenance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<MaintenanceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(Envelope::ok(state.fleet.set_maintenance(id, req.on).await?)))
}

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    load: RunnerLoad,
    #[serde(default)]
    active_sessions: Vec<Uuid>,
    #[serde(default)]
    runtime_versions: std::collections::HashMap<ProviderId, String>,
}

#[derive(Debug, Serialize)]
struct HeartbeatResponse {
    commands: Vec<fc_fleet::RunnerCommand>,
}

async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.metrics.incr("heartbeats_received");
    let changed = state.fleet.heartbeat(id, req.load, req.active_sessions, req.runtime_versions).await?;
    for (provider_id, version) in &changed {
        if let Some(WatchEvent::VersionDiscovered { provider_id, version, source_url, .. }) =
            state.version_watcher.register_heartbeat_version(*provider_id, version.clone())
        {
            let record = VersionWatcher::to_version_record(provider_id, version.clone(), source_url);
            state.registry.register_version(record).await;
            state
                .hub
                .broadcast_event("version_discovered", Some(serde_json::json!({ "provider_id": provider_id, "version": version })))
                .await;
        }
    }
    let commands = state.fleet.drain_commands(id);
    Ok((StatusCode::ACCEPTED, Json(HeartbeatResponse { commands })))
}

// ---------------------------------------------------------------------------
// Registry / builds
// ---------------------------------------------------------------------------

async fn register_build(State(state): State<Arc<AppState>>, Json(build): Json<Build>) -> impl IntoResponse {
    let build_id = state.registry.register_build(build);
    (StatusCode::CREATED, Json(Envelope::ok(build_id)))
}

async fn get_build(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(Envelope::ok(state.registry.get_build(&id).await?)))
}

async fn add_compatibility_result(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(result): Json<CompatibilityResult>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry.add_compatibility_result(&id, result).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn promote_build(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    state.registry.promote_build(&id).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct DeprecateBuildRequest {
    reason: String,
}

async fn deprecate_build(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<DeprecateBuildRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.registry.deprecate_build(&id, req.reason).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct RecommendedBuildQuery {
    channel: Channel,
}

async fn recommended_build(State(state): State<Arc<AppState>>, Query(q): Query<RecommendedBuildQuery>) -> impl IntoResponse {
    Json(Envelope::ok(state.registry.recommended_build(q.channel).await))
}

// ---------------------------------------------------------------------------
// Orgs (just enough CRUD to feed rollout eligibility; org lifecycle itself
// is owned by whatever provisions tenants, out of scope here)
// ---------------------------------------------------------------------------

async fn upsert_org(State(state): State<Arc<AppState>>, Json(org): Json<OrgRuntimeConfig>) -> impl IntoResponse {
    state.orgs.put(org.org_id.clone(), org).await;
    StatusCode::ACCEPTED
}

// ---------------------------------------------------------------------------
// Sweeps
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum SweepTypeDto {
    Maintenance,
    LintFix,
    DependencyUpdate,
    Custom,
}

impl From<SweepTypeDto> for SweepType {
    fn from(v: SweepTypeDto) -> Self {
        match v {
            SweepTypeDto::Maintenance => SweepType::Maintenance,
            SweepTypeDto::LintFix => SweepType::LintFix,
            SweepTypeDto::DependencyUpdate => SweepType::DependencyUpdate,
            SweepTypeDto::Custom => SweepType::Custom,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum RepoSweepStatusDto {
    Success,
    Failed,
    Skipped,
    NoChanges,
}

impl From<RepoSweepStatus> for RepoSweepStatusDto {
    fn from(v: RepoSweepStatus) -> Self {
        match v {
            RepoSweepStatus::Success => RepoSweepStatusDto::Success,
            RepoSweepStatus::Failed => RepoSweepStatusDto::Failed,
            RepoSweepStatus::Skipped => RepoSweepStatusDto::Skipped,
            RepoSweepStatus::NoChanges => RepoSweepStatusDto::NoChanges,
        }
    }
}

#[derive(Debug, Serialize)]
struct RepoSweepResultDto {
    repo_url: String,
    status: RepoSweepStatusDto,
    pr_url: Option<String>,
}

impl From<RepoSweepResult> for RepoSweepResultDto {
    fn from(r: RepoSweepResult) -> Self {
        Self { repo_url: r.repo_url, status: r.status.into(), pr_url: r.pr_url }
    }
}

#[derive(Debug, Deserialize)]
struct TriggerSweepRequest {
    build_id: String,
    sweep_type: SweepTypeDto,
    repos: Vec<RepoRef>,
    #[serde(default)]
    create_prs: bool,
    max_repos_per_run: Option<u32>,
    rate_limit_per_minute: Option<u32>,
}

/// The actual git-clone / lint-fix / PR-open work lives outside this crate;
/// here `run_one` is a stub that marks every repo skipped so the endpoint is
/// exercisable without a real execution backend wired in.
async fn trigger_sweep(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TriggerSweepRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let repos: Vec<OptedInRepo> = req.repos.into_iter().map(|repo| OptedInRepo { repo, opted_in: true }).collect();
    let options = TriggerOptions {
        max_repos_per_run: req.max_repos_per_run,
        rate_limit_per_minute: req.rate_limit_per_minute,
        create_prs: req.create_prs,
    };
    let job_id = state
        .sweeps
        .trigger_post_update_sweep(req.build_id, req.sweep_type.into(), &repos, options, |repo, _sweep_type, _create_prs| {
            let repo_url = repo.url.clone();
            async move { Ok(RepoSweepResult { repo_url, status: RepoSweepStatus::Skipped, pr_url: None }) }
        })
        .await?;
    Ok((StatusCode::CREATED, Json(Envelope::ok(job_id))))
}

async fn get_sweep_results(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> impl IntoResponse {
    let results = state.sweeps.results(id).await.map(|rs| rs.into_iter().map(RepoSweepResultDto::from).collect::<Vec<_>>());
    Json(Envelope::ok(results))
}

async fn cancel_sweep(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, ApiError> {
    state.sweeps.cancel(id).await?;
    Ok(StatusCode::ACCEPTED)
}

// ---------------------------------------------------------------------------
// Rollouts
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TriggerCanaryRunRequest {
    build_id: String,
    provider_id: ProviderId,
    #[serde(default = "default_suite_name")]
    suite_name: String,
}

fn default_suite_name() -> String {
    "golden_path".to_string()
}

/// Actually drives [`fc_update::canary::run_suite`] (via the Fleet Manager's
/// real placement check as the case body) and records the result under a
/// run ID. `initiate_rollout` only accepts a `canary_run_id` produced here —
/// it never trusts a client-reported pass/fail claim.
async fn trigger_canary_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TriggerCanaryRunRequest>,
) -> impl IntoResponse {
    let cases = fc_update::canary::default_suite_cases(&req.suite_name, req.provider_id);
    let fleet = state.fleet.clone();
    let provider_id = req.provider_id;
    let run_id = state
        .canary
        .trigger_run(req.build_id, &req.suite_name, &cases, provider_id, &state.config.update_pipeline.canary, move |_case| {
            let fleet = fleet.clone();
            async move {
                let outcome =
                    if fleet.select(provider_id, &[]).await.is_some() { fc_update::canary::CaseOutcome::Passed } else { fc_update::canary::CaseOutcome::Errored };
                Ok(fc_update::canary::CaseAttempt { outcome, session_start_ms: None, time_to_first_output_ms: None, disconnected: false })
            }
        })
        .await;
    state.metrics.incr("canary_runs_triggered");
    (StatusCode::CREATED, Json(Envelope::ok(run_id)))
}

async fn get_canary_run(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, ApiError> {
    let record = state.canary.get(id).ok_or_else(|| ApiError::BadRequest("canary run not found".into()))?;
    Ok(Json(Envelope::ok(record)))
}

#[derive(Debug, Deserialize)]
struct InitiateRolloutRequest {
    channel: Channel,
    target_build_id: String,
    canary_run_id: Uuid,
}

async fn initiate_rollout(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InitiateRolloutRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.canary.get(req.canary_run_id).ok_or_else(|| ApiError::BadRequest("canary run not found".into()))?;
    if record.build_id != req.target_build_id {
        return Err(ApiError::BadRequest("canary run was not recorded for this build".into()));
    }
    let eligible = state.orgs.list().await.into_iter().filter(|o| o.channel == req.channel).collect::<Vec<_>>();
    let rollout = state.rollouts.initiate_rollout(req.channel, req.target_build_id, Some(&record.result), &eligible).await?;
    state.metrics.incr("rollouts_initiated");
    Ok((StatusCode::CREATED, Json(Envelope::ok(rollout))))
}

async fn get_rollout(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(Envelope::ok(state.rollouts.get(id).await?)))
}

async fn advance_rollout(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, ApiError> {
    let rollout = state.rollouts.get(id).await?;
    let eligible = state.orgs.list().await.into_iter().filter(|o| o.channel == rollout.channel).collect::<Vec<_>>();
    Ok(Json(Envelope::ok(state.rollouts.advance_rollout(id, &eligible).await?)))
}

async fn pause_rollout(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(Envelope::ok(state.rollouts.pause_rollout(id).await?)))
}

async fn resume_rollout(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(Envelope::ok(state.rollouts.resume_rollout(id).await?)))
}

#[derive(Debug, Deserialize)]
struct RollbackRequest {
    reason: String,
}

async fn rollback_rollout(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<RollbackRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(Envelope::ok(state.rollouts.rollback(id, req.reason).await?)))
}

async fn rollout_events(State(state): State<Arc<AppState>>, Path(_id): Path<Uuid>) -> impl IntoResponse {
    Json(Envelope::ok(state.rollouts.events().await))
}

// ---------------------------------------------------------------------------
// WebSocket (spec §4.4)
// ---------------------------------------------------------------------------

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let conn = state.hub.connect();
    let client_id = conn.client_id;
    let (mut ws_tx, mut ws_rx) = socket.split();

    let greeting = serde_json::to_string(&fc_realtime::protocol::ServerMessage::Event {
        event: "connected".into(),
        payload: Some(serde_json::json!({ "client_id": client_id })),
    })
    .unwrap_or_default();
    if ws_tx.send(Message::Text(greeting.into())).await.is_err() {
        state.hub.disconnect(client_id);
        return;
    }

    let mut drain_tick = tokio::time::interval(Duration::from_millis(50));

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(msg) => {
                                if let Err(err) = state.hub.dispatch(client_id, msg).await {
                                    tracing::debug!(%client_id, %err, "client message rejected");
                                }
                            }
                            Err(_) => {
                                tracing::debug!(%client_id, "dropped malformed client message");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            _ = drain_tick.tick() => {
                for msg in conn.drain_outbound().await {
                    let text = serde_json::to_string(&msg).unwrap_or_default();
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        state.hub.disconnect(client_id);
                        return;
                    }
                }
            }
        }
    }

    state.hub.disconnect(client_id);
}
