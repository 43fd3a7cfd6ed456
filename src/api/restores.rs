use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::validation::{validate_id, validate_restore_filter};
use super::{ApiError, AppState, AuthContext, CancelResponse, Pagination, TransitionDto};
use crate::db::RestoreJob;
use crate::db::repositories::restore::RestoreFilter;
use crate::domain::{JobKind, JobStatus, Role};
use crate::services::{RestoreError, RestoreRequest};

#[derive(Debug, Serialize)]
pub struct RestoreJobDto {
    pub id: i32,
    pub backup_id: i32,
    pub ldap_server_id: i32,
    pub status: String,
    pub selective_restore: bool,
    pub restore_filter: Option<String>,
    pub point_in_time: Option<DateTime<Utc>>,
    pub entries_restored: i64,
    pub entries_skipped: i64,
    pub entries_failed: i64,
    pub created_by: Option<i32>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<RestoreJob> for RestoreJobDto {
    fn from(r: RestoreJob) -> Self {
        Self {
            id: r.id,
            backup_id: r.backup_id,
            ldap_server_id: r.ldap_server_id,
            status: r.status,
            selective_restore: r.selective_restore,
            restore_filter: r.restore_filter,
            point_in_time: r.point_in_time,
            entries_restored: r.entries_restored,
            entries_skipped: r.entries_skipped,
            entries_failed: r.entries_failed,
            created_by: r.created_by,
            error_message: r.error_message,
            started_at: r.started_at,
            completed_at: r.completed_at,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RestoreListQuery {
    pub backup_id: Option<i32>,
    pub ldap_server_id: Option<i32>,
    pub status: Option<String>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRestoreRequest {
    pub backup_id: i32,
    pub ldap_server_id: i32,
    #[serde(default)]
    pub selective_restore: bool,
    pub restore_filter: Option<String>,
    pub point_in_time: Option<DateTime<Utc>>,
}

impl From<RestoreError> for ApiError {
    fn from(err: RestoreError) -> Self {
        let kind = err.kind();
        match err {
            RestoreError::BackupNotFound(id) => Self::not_found("Backup", id),
            RestoreError::ServerNotFound(id) => Self::not_found("LDAP server", id),
            RestoreError::BackupNotCompleted { .. } => Self::validation(format!("{kind}: {err}")),
            RestoreError::Validation(msg) => Self::ValidationError(msg),
            RestoreError::ServerUnavailable(msg) | RestoreError::ConnectorAuthFailed(msg) => {
                Self::directory_error(kind, msg)
            }
            RestoreError::ArtifactCorrupted(msg) => Self::Unprocessable(format!("{kind}: {msg}")),
            RestoreError::Cancelled | RestoreError::EntriesFailed { .. } => {
                Self::conflict(format!("{kind}: {err}"))
            }
            RestoreError::Ledger(e) => e.into(),
            RestoreError::Credential(e) => Self::internal(e.to_string()),
            RestoreError::Internal(e) => e.into(),
        }
    }
}

/// GET /restores/
pub async fn list_restores(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RestoreListQuery>,
) -> Result<Json<Vec<RestoreJobDto>>, ApiError> {
    if let Some(status) = &query.status {
        status.parse::<JobStatus>().map_err(ApiError::validation)?;
    }

    let filter = RestoreFilter {
        backup_id: query.backup_id,
        ldap_server_id: query.ldap_server_id,
        status: query.status,
    };
    let page = Pagination {
        skip: query.skip,
        limit: query.limit,
    };
    let restores = state
        .shared
        .ledger
        .list_restores(&filter, page.skip(), page.limit())
        .await?;

    Ok(Json(restores.into_iter().map(RestoreJobDto::from).collect()))
}

/// GET /restores/{id}
pub async fn get_restore(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> Result<Json<RestoreJobDto>, ApiError> {
    let id = validate_id("restore", id)?;
    Ok(Json(state.shared.ledger.get_restore(id).await?.into()))
}

/// POST /restores/
pub async fn create_restore(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Json(payload): Json<CreateRestoreRequest>,
) -> Result<(StatusCode, Json<RestoreJobDto>), ApiError> {
    ctx.require(Role::Operator)?;
    let backup_id = validate_id("backup", payload.backup_id)?;
    let ldap_server_id = validate_id("LDAP server", payload.ldap_server_id)?;
    validate_restore_filter(payload.restore_filter.as_deref())?;

    let restore = state
        .shared
        .restore_engine
        .request(
            RestoreRequest {
                backup_id,
                ldap_server_id,
                selective_restore: payload.selective_restore,
                restore_filter: payload.restore_filter,
                point_in_time: payload.point_in_time,
            },
            ctx.user_id(),
        )
        .await?;

    state.shared.queue.enqueue(JobKind::Restore, restore.id);

    ctx.audit(
        &state,
        "restore.created",
        "restore_job",
        Some(restore.id.to_string()),
        Some(serde_json::json!({
            "backup_id": restore.backup_id,
            "ldap_server_id": restore.ldap_server_id,
            "selective_restore": restore.selective_restore,
            "restore_filter": restore.restore_filter,
            "point_in_time": restore.point_in_time,
        })),
    )
    .await?;

    Ok((StatusCode::CREATED, Json(restore.into())))
}

/// POST /restores/{id}/cancel
pub async fn cancel_restore(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i32>,
) -> Result<Json<CancelResponse>, ApiError> {
    ctx.require(Role::Operator)?;
    let id = validate_id("restore", id)?;

    let status = state.shared.ledger.cancel(JobKind::Restore, id).await?;
    ctx.audit(
        &state,
        "restore.cancelled",
        "restore_job",
        Some(id.to_string()),
        Some(serde_json::json!({ "status": status })),
    )
    .await?;

    Ok(Json(CancelResponse { id, status }))
}

/// GET /restores/{id}/transitions
pub async fn list_transitions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> Result<Json<Vec<TransitionDto>>, ApiError> {
    let id = validate_id("restore", id)?;
    let transitions = state.shared.ledger.transitions(JobKind::Restore, id).await?;
    Ok(Json(transitions.into_iter().map(TransitionDto::from).collect()))
}
