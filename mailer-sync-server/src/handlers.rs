//! JSON handlers for the orchestrator invocation surface.

use crate::{auth::AuthError, server::AppState};
use actix_web::{
    http::StatusCode, web, web::Data, web::Json, HttpRequest, HttpResponse, ResponseError,
};
use mailer_sync_logic::{
    error::SyncError,
    orchestrator::{backfill, bidirectional::BidirectionalParams},
    record_sync::ConflictResolution,
    repository::{clients, conflicts, crosswalk, shadows},
    status,
    types::SyncDirection,
};
use serde::Deserialize;
use serde_with::serde_as;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("conflict not found")]
    ConflictNotFound,
    #[error("{0}")]
    ConflictGone(String),
    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::ConflictNotFound { .. } => ApiError::ConflictNotFound,
            SyncError::ConflictNotPending { id } => {
                ApiError::ConflictGone(format!("conflict {id} is already resolved"))
            }
            other => ApiError::Internal(other.into()),
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Auth(AuthError::Unauthorized(_)) => StatusCode::UNAUTHORIZED,
            ApiError::Auth(AuthError::Forbidden(_)) => StatusCode::FORBIDDEN,
            ApiError::Auth(AuthError::Backend(_)) => StatusCode::BAD_GATEWAY,
            ApiError::ConflictNotFound => StatusCode::NOT_FOUND,
            ApiError::ConflictGone(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .json(serde_json::json!({"error": self.to_string()}))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BackfillRequest {
    #[serde(default)]
    pub auto_continue: bool,
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BidirectionalRequest {
    pub direction: SyncDirection,
    pub max_records: Option<u64>,
    #[serde_as(as = "Option<serde_with::DurationMilliSeconds<u64>>")]
    #[serde(default, rename = "maxDurationMs")]
    pub max_duration: Option<Duration>,
    #[serde(default)]
    pub dry_run: bool,
    pub cursor: Option<String>,
}

impl From<BidirectionalRequest> for BidirectionalParams {
    fn from(request: BidirectionalRequest) -> Self {
        let defaults = BidirectionalParams::default();
        BidirectionalParams {
            direction: request.direction,
            max_records: request.max_records.unwrap_or(defaults.max_records),
            max_duration: request.max_duration.unwrap_or(defaults.max_duration),
            dry_run: request.dry_run,
            cursor: request.cursor,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DiagnosticRequest {
    pub batch_size: Option<u64>,
    #[serde(default)]
    pub offset: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResolveConflictRequest {
    pub resolution: ConflictResolution,
}

pub async fn run_backfill(
    req: HttpRequest,
    state: Data<AppState>,
    body: Option<Json<BackfillRequest>>,
) -> Result<HttpResponse, ApiError> {
    state.gate.require_admin(&req).await?;
    let request = body.map(Json::into_inner).unwrap_or_default();

    let mut outcome = state.backfill.run_chunk(false).await?;
    if request.auto_continue && outcome.continue_backfill {
        backfill::spawn_chain(state.backfill.clone());
        outcome.auto_continuing = Some(true);
    }
    Ok(HttpResponse::Ok().json(outcome))
}

pub async fn run_bidirectional(
    req: HttpRequest,
    state: Data<AppState>,
    body: Json<BidirectionalRequest>,
) -> Result<HttpResponse, ApiError> {
    state.gate.require_admin(&req).await?;
    let outcome = state.bidirectional.run(&body.into_inner().into()).await?;
    Ok(HttpResponse::Ok().json(outcome))
}

pub async fn run_id_repair(
    req: HttpRequest,
    state: Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    state.gate.require_admin(&req).await?;
    let outcome = state.id_repair.run().await?;
    Ok(HttpResponse::Ok().json(outcome))
}

pub async fn run_diagnostic(
    req: HttpRequest,
    state: Data<AppState>,
    body: Option<Json<DiagnosticRequest>>,
) -> Result<HttpResponse, ApiError> {
    state.gate.require_admin(&req).await?;
    let request = body.map(Json::into_inner).unwrap_or_default();
    let outcome = state
        .diagnostic
        .run(request.batch_size, request.offset)
        .await?;
    Ok(HttpResponse::Ok().json(outcome))
}

pub async fn resolve_conflict(
    req: HttpRequest,
    state: Data<AppState>,
    path: web::Path<i64>,
    body: Json<ResolveConflictRequest>,
) -> Result<HttpResponse, ApiError> {
    state.gate.require_admin(&req).await?;
    let report = state
        .synchronizer
        .resolve_conflict(path.into_inner(), body.resolution, "conflict_resolution")
        .await?;
    Ok(HttpResponse::Ok().json(report))
}

/// The consolidated operator view, with store statistics refreshed on read.
pub async fn sync_status(
    req: HttpRequest,
    state: Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    state.gate.require_admin(&req).await?;
    let db = state.db.as_ref();

    let mut document = status::load(db).await.map_err(ApiError::Internal)?;
    document.statistics = status::Statistics {
        clients: clients::count(db).await?,
        crosswalk_pairs: crosswalk::count_pairs(db).await?,
        shadows: shadows::count(db).await?,
        pending_conflicts: conflicts::count_pending(db).await?,
    };
    status::save(db, &document).await?;
    Ok(HttpResponse::Ok().json(document))
}
