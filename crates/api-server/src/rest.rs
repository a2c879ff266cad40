//! REST API handlers for the periodic triggers, conflict and lifecycle
//! commands, alerts and operational endpoints.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

use campaign_core::types::{
    Business, Campaign, CampaignStatus, Channel, Customer, Job, SmsConsent, StopReason, TouchDefinition,
};
use campaign_core::CampaignError;
use campaign_enrollment::{
    JobOutcome, LifecycleReport, ResolveAction, RetryReport, SequencerEngine, SweepReport,
    TouchResults,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

/// Upper bound on touches claimed by a single trigger.
const MAX_BATCH_LIMIT: usize = 1000;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SequencerEngine>,
    pub node_id: String,
    pub cron_secret: String,
    pub start_time: Instant,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> axum::response::Response {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(self)).into_response()
    }
}

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
}

/// `{success, error?}` result of a command.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CommandResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResponse {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }
}

type CommandResult = Result<Json<CommandResponse>, (StatusCode, Json<CommandResponse>)>;

fn status_for(err: &CampaignError) -> StatusCode {
    match err {
        CampaignError::NotFound { .. } => StatusCode::NOT_FOUND,
        CampaignError::Validation(_) => StatusCode::BAD_REQUEST,
        CampaignError::InvalidTransition { .. } | CampaignError::Conflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn command_error(err: CampaignError) -> (StatusCode, Json<CommandResponse>) {
    let status = status_for(&err);
    if status.is_server_error() {
        error!(error = %err, "Command failed");
        metrics::counter!("api.errors").increment(1);
    }
    (
        status,
        Json(CommandResponse {
            success: false,
            error: Some(err.to_string()),
        }),
    )
}

fn api_error(err: CampaignError, code: &str) -> (StatusCode, Json<ErrorResponse>) {
    let status = status_for(&err);
    if status.is_server_error() {
        error!(error = %err, code, "Request failed");
        metrics::counter!("api.errors").increment(1);
    }
    (
        status,
        Json(ErrorResponse {
            error: code.to_string(),
            message: err.to_string(),
        }),
    )
}

// ─── Records ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, ToSchema)]
pub struct BusinessRequest {
    pub name: String,
    pub timezone: Option<String>,
    /// Hours from enrollment to the first touch, keyed by service type.
    #[serde(default)]
    pub service_type_timing: HashMap<String, u32>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CampaignRequest {
    pub owner_id: Uuid,
    pub name: String,
    /// Omit to apply the campaign to every service type.
    pub service_type: Option<String>,
    pub touches: Vec<TouchDefinition>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CustomerRequest {
    pub owner_id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    #[serde(default)]
    pub opted_out: bool,
    #[serde(default)]
    pub sms_consent: SmsConsent,
    pub timezone: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct JobRequest {
    pub owner_id: Uuid,
    pub customer_id: Uuid,
    pub service_type: String,
    pub completed_at: Option<DateTime<Utc>>,
}

/// PUT /v1/businesses/{id} — Create or replace a business.
#[utoipa::path(
    put,
    path = "/v1/businesses/{id}",
    tag = "Records",
    params(("id" = Uuid, Path, description = "Business ID")),
    request_body = BusinessRequest,
    responses((status = 200, description = "Business stored", body = Business)),
    security(("cron_secret" = []))
)]
pub async fn put_business(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<BusinessRequest>,
) -> Json<Business> {
    Json(state.engine.put_business(Business {
        id,
        name: req.name,
        timezone: req.timezone,
        service_type_timing: req.service_type_timing,
    }))
}

/// PUT /v1/campaigns/{id} — Create or replace a campaign definition.
#[utoipa::path(
    put,
    path = "/v1/campaigns/{id}",
    tag = "Records",
    params(("id" = Uuid, Path, description = "Campaign ID")),
    request_body = CampaignRequest,
    responses(
        (status = 200, description = "Campaign stored", body = Campaign),
        (status = 400, description = "Touches out of sequence", body = ErrorResponse),
        (status = 404, description = "Owner not found", body = ErrorResponse),
    ),
    security(("cron_secret" = []))
)]
pub async fn put_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CampaignRequest>,
) -> Result<Json<Campaign>, (StatusCode, Json<ErrorResponse>)> {
    let now = Utc::now();
    let campaign = Campaign {
        id,
        owner_id: req.owner_id,
        name: req.name,
        service_type: req.service_type,
        status: CampaignStatus::Active,
        touches: req.touches,
        created_at: now,
        updated_at: now,
    };
    state
        .engine
        .put_campaign(campaign, now)
        .map(Json)
        .map_err(|e| api_error(e, "campaign_rejected"))
}

/// PUT /v1/customers/{id} — Create or replace a customer.
#[utoipa::path(
    put,
    path = "/v1/customers/{id}",
    tag = "Records",
    params(("id" = Uuid, Path, description = "Customer ID")),
    request_body = CustomerRequest,
    responses(
        (status = 200, description = "Customer stored", body = Customer),
        (status = 404, description = "Owner not found", body = ErrorResponse),
    ),
    security(("cron_secret" = []))
)]
pub async fn put_customer(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CustomerRequest>,
) -> Result<Json<Customer>, (StatusCode, Json<ErrorResponse>)> {
    state
        .engine
        .put_customer(Customer {
            id,
            owner_id: req.owner_id,
            name: req.name,
            email: req.email,
            phone: req.phone,
            opted_out: req.opted_out,
            sms_consent: req.sms_consent,
            timezone: req.timezone,
        })
        .map(Json)
        .map_err(|e| api_error(e, "customer_rejected"))
}

/// PUT /v1/jobs/{id} — Create or update a service job.
#[utoipa::path(
    put,
    path = "/v1/jobs/{id}",
    tag = "Records",
    params(("id" = Uuid, Path, description = "Job ID")),
    request_body = JobRequest,
    responses(
        (status = 200, description = "Job stored", body = Job),
        (status = 400, description = "Customer belongs to another owner", body = ErrorResponse),
        (status = 404, description = "Owner or customer not found", body = ErrorResponse),
    ),
    security(("cron_secret" = []))
)]
pub async fn put_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<JobRequest>,
) -> Result<Json<Job>, (StatusCode, Json<ErrorResponse>)> {
    state
        .engine
        .put_job(Job {
            id,
            owner_id: req.owner_id,
            customer_id: req.customer_id,
            service_type: req.service_type,
            completed_at: req.completed_at,
            enrollment_resolution: None,
            conflict_detected_at: None,
            enrollment_id: None,
        })
        .map(Json)
        .map_err(|e| api_error(e, "job_rejected"))
}

// ─── Triggers ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, IntoParams)]
pub struct ProcessParams {
    /// Maximum touches to claim; defaults to the configured batch size.
    pub limit: Option<usize>,
}

#[derive(Serialize, ToSchema)]
pub struct ProcessTouchesResponse {
    pub ok: bool,
    pub timestamp: DateTime<Utc>,
    pub recovered: usize,
    pub claimed: usize,
    pub results: TouchResults,
    pub retries: RetryReport,
}

#[derive(Serialize, ToSchema)]
pub struct TriggerFailure {
    pub ok: bool,
    pub timestamp: DateTime<Utc>,
    pub error: String,
}

/// POST /v1/cron/process-touches — Claim and process due touches.
#[utoipa::path(
    post,
    path = "/v1/cron/process-touches",
    tag = "Triggers",
    params(ProcessParams),
    responses(
        (status = 200, description = "Batch processed", body = ProcessTouchesResponse),
        (status = 400, description = "Invalid limit", body = TriggerFailure),
        (status = 401, description = "Missing or invalid secret", body = ErrorResponse),
        (status = 500, description = "Claim failed; batch aborted", body = TriggerFailure),
    ),
    security(("cron_secret" = []))
)]
pub async fn process_touches(
    State(state): State<AppState>,
    Query(params): Query<ProcessParams>,
) -> Result<Json<ProcessTouchesResponse>, (StatusCode, Json<TriggerFailure>)> {
    let now = Utc::now();
    if let Some(limit) = params.limit {
        if limit == 0 || limit > MAX_BATCH_LIMIT {
            metrics::counter!("api.validation_errors").increment(1);
            return Err((
                StatusCode::BAD_REQUEST,
                Json(TriggerFailure {
                    ok: false,
                    timestamp: now,
                    error: format!("limit must be between 1 and {MAX_BATCH_LIMIT}"),
                }),
            ));
        }
    }

    match state.engine.run_batch(now, params.limit).await {
        Ok(summary) => Ok(Json(ProcessTouchesResponse {
            ok: true,
            timestamp: now,
            recovered: summary.recovered,
            claimed: summary.claimed,
            results: summary.results,
            retries: summary.retries,
        })),
        Err(e) => {
            error!(error = %e, "Touch batch aborted");
            metrics::counter!("api.errors").increment(1);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(TriggerFailure {
                    ok: false,
                    timestamp: now,
                    error: e.to_string(),
                }),
            ))
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct ConflictSweepResponse {
    pub ok: bool,
    pub timestamp: DateTime<Utc>,
    pub queue_after: SweepReport,
    pub stale_conflicts: SweepReport,
}

/// POST /v1/cron/resolve-conflicts — Sweep queued and stale conflicts.
#[utoipa::path(
    post,
    path = "/v1/cron/resolve-conflicts",
    tag = "Triggers",
    responses(
        (status = 200, description = "Sweep finished", body = ConflictSweepResponse),
        (status = 401, description = "Missing or invalid secret", body = ErrorResponse),
    ),
    security(("cron_secret" = []))
)]
pub async fn resolve_conflicts(State(state): State<AppState>) -> Json<ConflictSweepResponse> {
    let now = Utc::now();
    let sweep = state.engine.run_conflict_sweep(now);
    Json(ConflictSweepResponse {
        ok: true,
        timestamp: now,
        queue_after: sweep.queue_after,
        stale_conflicts: sweep.stale_conflicts,
    })
}

// ─── Conflicts and jobs ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize, ToSchema)]
pub struct ResolveRequest {
    pub job_id: Uuid,
    pub action: ResolveAction,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RevertRequest {
    pub job_id: Uuid,
}

/// POST /v1/conflicts/resolve — Apply replace, skip or queue_after to a conflicted job.
#[utoipa::path(
    post,
    path = "/v1/conflicts/resolve",
    tag = "Conflicts",
    request_body = ResolveRequest,
    responses(
        (status = 200, description = "Resolution applied", body = CommandResponse),
        (status = 400, description = "Job has no pending conflict", body = CommandResponse),
        (status = 404, description = "Job not found", body = CommandResponse),
    ),
    security(("cron_secret" = []))
)]
pub async fn resolve_conflict(State(state): State<AppState>, Json(req): Json<ResolveRequest>) -> CommandResult {
    state
        .engine
        .resolve_conflict(req.job_id, req.action, Utc::now())
        .map(|()| Json(CommandResponse::ok()))
        .map_err(command_error)
}

/// POST /v1/conflicts/revert — Undo a conflict resolution.
#[utoipa::path(
    post,
    path = "/v1/conflicts/revert",
    tag = "Conflicts",
    request_body = RevertRequest,
    responses(
        (status = 200, description = "Resolution reverted", body = CommandResponse),
        (status = 400, description = "Nothing to revert", body = CommandResponse),
        (status = 404, description = "Job not found", body = CommandResponse),
    ),
    security(("cron_secret" = []))
)]
pub async fn revert_conflict(State(state): State<AppState>, Json(req): Json<RevertRequest>) -> CommandResult {
    state
        .engine
        .revert_conflict(req.job_id, Utc::now())
        .map(|()| Json(CommandResponse::ok()))
        .map_err(command_error)
}

/// POST /v1/jobs/{id}/complete — Job completion event.
#[utoipa::path(
    post,
    path = "/v1/jobs/{id}/complete",
    tag = "Conflicts",
    params(("id" = Uuid, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Enrollment outcome", body = JobOutcome),
        (status = 404, description = "Job not found", body = ErrorResponse),
    ),
    security(("cron_secret" = []))
)]
pub async fn complete_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobOutcome>, (StatusCode, Json<ErrorResponse>)> {
    state
        .engine
        .complete_job(id, Utc::now())
        .map(Json)
        .map_err(|e| api_error(e, "job_completion_failed"))
}

// ─── Campaign lifecycle ─────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct PauseParams {
    /// Stop live enrollments instead of freezing them.
    #[serde(default)]
    pub stop: bool,
}

/// POST /v1/campaigns/{id}/pause — Pause a campaign, freezing (or stopping) its enrollments.
#[utoipa::path(
    post,
    path = "/v1/campaigns/{id}/pause",
    tag = "Campaigns",
    params(("id" = Uuid, Path, description = "Campaign ID"), PauseParams),
    responses(
        (status = 200, description = "Campaign paused", body = LifecycleReport),
        (status = 404, description = "Campaign not found", body = ErrorResponse),
    ),
    security(("cron_secret" = []))
)]
pub async fn pause_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(params): Query<PauseParams>,
) -> Result<Json<LifecycleReport>, (StatusCode, Json<ErrorResponse>)> {
    let now = Utc::now();
    let result = if params.stop {
        state.engine.pause_and_stop_campaign(id, now)
    } else {
        state.engine.pause_campaign(id, now)
    };
    result.map(Json).map_err(|e| api_error(e, "pause_failed"))
}

/// POST /v1/campaigns/{id}/resume — Resume a paused campaign.
#[utoipa::path(
    post,
    path = "/v1/campaigns/{id}/resume",
    tag = "Campaigns",
    params(("id" = Uuid, Path, description = "Campaign ID")),
    responses(
        (status = 200, description = "Campaign resumed", body = LifecycleReport),
        (status = 404, description = "Campaign not found", body = ErrorResponse),
    ),
    security(("cron_secret" = []))
)]
pub async fn resume_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<LifecycleReport>, (StatusCode, Json<ErrorResponse>)> {
    state
        .engine
        .resume_campaign(id, Utc::now())
        .map(Json)
        .map_err(|e| api_error(e, "resume_failed"))
}

/// DELETE /v1/campaigns/{id} — Stop all enrollments and delete the campaign.
#[utoipa::path(
    delete,
    path = "/v1/campaigns/{id}",
    tag = "Campaigns",
    params(("id" = Uuid, Path, description = "Campaign ID")),
    responses(
        (status = 200, description = "Campaign deleted", body = LifecycleReport),
        (status = 404, description = "Campaign not found", body = ErrorResponse),
    ),
    security(("cron_secret" = []))
)]
pub async fn delete_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<LifecycleReport>, (StatusCode, Json<ErrorResponse>)> {
    state
        .engine
        .delete_campaign(id, Utc::now())
        .map(Json)
        .map_err(|e| api_error(e, "delete_failed"))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct StopRequest {
    pub reason: StopReason,
}

/// POST /v1/enrollments/{id}/stop — Stop one enrollment.
#[utoipa::path(
    post,
    path = "/v1/enrollments/{id}/stop",
    tag = "Campaigns",
    params(("id" = Uuid, Path, description = "Enrollment ID")),
    request_body = StopRequest,
    responses(
        (status = 200, description = "Enrollment stopped", body = CommandResponse),
        (status = 404, description = "Enrollment not found", body = CommandResponse),
        (status = 409, description = "Enrollment already ended", body = CommandResponse),
    ),
    security(("cron_secret" = []))
)]
pub async fn stop_enrollment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<StopRequest>,
) -> CommandResult {
    match state.engine.stop_enrollment(id, req.reason, Utc::now()) {
        Ok(true) => Ok(Json(CommandResponse::ok())),
        Ok(false) => {
            warn!(enrollment_id = %id, "Stop requested for ended enrollment");
            Err((
                StatusCode::CONFLICT,
                Json(CommandResponse {
                    success: false,
                    error: Some("enrollment already ended".to_string()),
                }),
            ))
        }
        Err(e) => Err(command_error(e)),
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct OptOutRequest {
    pub channel: Channel,
}

#[derive(Serialize, ToSchema)]
pub struct OptOutResponse {
    pub success: bool,
    /// Enrollment stopped by the opt-out, if one was live.
    pub stopped_enrollment_id: Option<Uuid>,
}

/// POST /v1/customers/{id}/opt-out — Record a channel opt-out and stop the live sequence.
#[utoipa::path(
    post,
    path = "/v1/customers/{id}/opt-out",
    tag = "Campaigns",
    params(("id" = Uuid, Path, description = "Customer ID")),
    request_body = OptOutRequest,
    responses(
        (status = 200, description = "Opt-out recorded", body = OptOutResponse),
        (status = 404, description = "Customer not found", body = ErrorResponse),
    ),
    security(("cron_secret" = []))
)]
pub async fn opt_out(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<OptOutRequest>,
) -> Result<Json<OptOutResponse>, (StatusCode, Json<ErrorResponse>)> {
    state
        .engine
        .opt_out(id, req.channel, Utc::now())
        .map(|stopped| {
            Json(OptOutResponse {
                success: true,
                stopped_enrollment_id: stopped,
            })
        })
        .map_err(|e| api_error(e, "opt_out_failed"))
}

// ─── Alerts ─────────────────────────────────────────────────────────────────

/// POST /v1/alerts/{id}/retry — Requeue the failed send behind an alert.
#[utoipa::path(
    post,
    path = "/v1/alerts/{id}/retry",
    tag = "Alerts",
    params(("id" = Uuid, Path, description = "Alert ID")),
    responses(
        (status = 200, description = "Send requeued", body = CommandResponse),
        (status = 404, description = "Alert not found", body = CommandResponse),
        (status = 409, description = "Alert already closed", body = CommandResponse),
    ),
    security(("cron_secret" = []))
)]
pub async fn retry_alert(State(state): State<AppState>, Path(id): Path<Uuid>) -> CommandResult {
    state
        .engine
        .retry_alert(id, Utc::now())
        .map(|_| Json(CommandResponse::ok()))
        .map_err(command_error)
}

/// POST /v1/alerts/{id}/acknowledge — Close an alert without retrying.
#[utoipa::path(
    post,
    path = "/v1/alerts/{id}/acknowledge",
    tag = "Alerts",
    params(("id" = Uuid, Path, description = "Alert ID")),
    responses(
        (status = 200, description = "Alert acknowledged", body = CommandResponse),
        (status = 404, description = "Alert not found", body = CommandResponse),
        (status = 409, description = "Alert already closed", body = CommandResponse),
    ),
    security(("cron_secret" = []))
)]
pub async fn acknowledge_alert(State(state): State<AppState>, Path(id): Path<Uuid>) -> CommandResult {
    state
        .engine
        .acknowledge_alert(id, Utc::now())
        .map(|_| Json(CommandResponse::ok()))
        .map_err(command_error)
}

// ─── Operations ─────────────────────────────────────────────────────────────

/// GET /health — Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Operations",
    responses((status = 200, description = "Service is healthy", body = HealthResponse))
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// GET /live — Liveness check for Kubernetes.
#[utoipa::path(
    get,
    path = "/live",
    tag = "Operations",
    responses((status = 200, description = "Process is alive"))
)]
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}
