use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::validation::{validate_backup_type, validate_id};
use super::{
    ApiError, AppState, AuthContext, CancelResponse, MessageResponse, Pagination, TransitionDto,
};
use crate::db::Backup;
use crate::db::repositories::backup::BackupFilter;
use crate::domain::{BackupType, JobKind, JobStatus, Role};
use crate::services::{BackupError, BackupRequest, RetentionError};

#[derive(Debug, Serialize)]
pub struct BackupDto {
    pub id: i32,
    pub ldap_server_id: i32,
    pub backup_type: String,
    pub status: String,
    pub file_path: Option<String>,
    pub file_size: Option<i64>,
    pub entry_count: Option<i64>,
    pub encrypted: bool,
    pub compression_enabled: bool,
    pub checksum: Option<String>,
    pub parent_backup_id: Option<i32>,
    pub scheduled_backup_id: Option<i32>,
    pub created_by: Option<i32>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Backup> for BackupDto {
    fn from(b: Backup) -> Self {
        Self {
            id: b.id,
            ldap_server_id: b.ldap_server_id,
            backup_type: b.backup_type,
            status: b.status,
            file_path: b.file_path,
            file_size: b.file_size,
            entry_count: b.entry_count,
            encrypted: b.encrypted,
            compression_enabled: b.compression_enabled,
            checksum: b.checksum,
            parent_backup_id: b.parent_backup_id,
            scheduled_backup_id: b.scheduled_backup_id,
            created_by: b.created_by,
            error_message: b.error_message,
            started_at: b.started_at,
            completed_at: b.completed_at,
            created_at: b.created_at,
            updated_at: b.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BackupListQuery {
    pub ldap_server_id: Option<i32>,
    pub status: Option<String>,
    pub backup_type: Option<String>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateBackupRequest {
    pub ldap_server_id: i32,
    pub backup_type: Option<String>,
    pub encrypted: Option<bool>,
    pub compression_enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct BatchDeleteRequest {
    pub backup_ids: Vec<i32>,
}

#[derive(Debug, Serialize)]
pub struct BatchDeleteResponse {
    pub deleted: usize,
    pub message: String,
}

impl From<BackupError> for ApiError {
    fn from(err: BackupError) -> Self {
        match err {
            BackupError::ServerNotFound(id) => Self::not_found("LDAP server", id),
            BackupError::ServerUnavailable(msg) => Self::directory_error("ServerUnavailable", msg),
            BackupError::ConnectorAuthFailed(msg) => {
                Self::directory_error("ConnectorAuthFailed", msg)
            }
            BackupError::Cancelled => Self::conflict("Backup was cancelled"),
            BackupError::Ledger(e) => e.into(),
            BackupError::Artifact(e) => Self::internal(e.to_string()),
            BackupError::Credential(e) => Self::internal(e.to_string()),
            BackupError::Internal(e) => e.into(),
        }
    }
}

impl From<RetentionError> for ApiError {
    fn from(err: RetentionError) -> Self {
        match err {
            RetentionError::NotFound(id) => Self::not_found("Backup", id),
            RetentionError::Conflict(msg) => Self::Conflict(msg),
            RetentionError::RetentionViolation(msg) => {
                Self::Conflict(format!("RetentionViolation: {msg}"))
            }
            RetentionError::Internal(e) => e.into(),
        }
    }
}

/// GET /backups/
pub async fn list_backups(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BackupListQuery>,
) -> Result<Json<Vec<BackupDto>>, ApiError> {
    if let Some(status) = &query.status {
        status
            .parse::<JobStatus>()
            .map_err(ApiError::validation)?;
    }
    if let Some(backup_type) = &query.backup_type {
        validate_backup_type(backup_type)?;
    }

    let filter = BackupFilter {
        ldap_server_id: query.ldap_server_id,
        status: query.status,
        backup_type: query.backup_type,
    };
    let page = Pagination {
        skip: query.skip,
        limit: query.limit,
    };
    let backups = state
        .shared
        .ledger
        .list_backups(&filter, page.skip(), page.limit())
        .await?;

    Ok(Json(backups.into_iter().map(BackupDto::from).collect()))
}

/// GET /backups/{id}
pub async fn get_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> Result<Json<BackupDto>, ApiError> {
    let id = validate_id("backup", id)?;
    let backup = state.shared.ledger.get_backup(id).await?;
    Ok(Json(backup.into()))
}

/// POST /backups/
///
/// Creates the pending job and hands it to the worker pool.
pub async fn create_backup(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Json(payload): Json<CreateBackupRequest>,
) -> Result<(StatusCode, Json<BackupDto>), ApiError> {
    ctx.require(Role::Operator)?;
    let ldap_server_id = validate_id("LDAP server", payload.ldap_server_id)?;
    let backup_type = payload
        .backup_type
        .as_deref()
        .map(validate_backup_type)
        .transpose()?
        .unwrap_or(BackupType::Full);

    let backup = state
        .shared
        .backup_engine
        .request(
            BackupRequest {
                ldap_server_id,
                backup_type,
                encrypted: payload.encrypted.unwrap_or(true),
                compression_enabled: payload.compression_enabled.unwrap_or(true),
                scheduled_backup_id: None,
            },
            ctx.user_id(),
        )
        .await?;

    state.shared.queue.enqueue(JobKind::Backup, backup.id);

    ctx.audit(
        &state,
        "backup.created",
        "backup",
        Some(backup.id.to_string()),
        Some(serde_json::json!({
            "ldap_server_id": backup.ldap_server_id,
            "backup_type": backup.backup_type,
        })),
    )
    .await?;

    Ok((StatusCode::CREATED, Json(backup.into())))
}

/// DELETE /backups/{id}
pub async fn delete_backup(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i32>,
) -> Result<Json<MessageResponse>, ApiError> {
    ctx.require(Role::Admin)?;
    let id = validate_id("backup", id)?;

    state
        .shared
        .retention
        .delete_backup(id, &ctx.deletion_actor())
        .await?;

    Ok(Json(MessageResponse::new(format!("Backup {id} deleted"))))
}

/// POST /backups/batch-delete
pub async fn batch_delete(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Json(payload): Json<BatchDeleteRequest>,
) -> Result<Json<BatchDeleteResponse>, ApiError> {
    ctx.require(Role::Admin)?;
    if payload.backup_ids.is_empty() {
        return Err(ApiError::validation("backup_ids cannot be empty"));
    }

    let deleted = state
        .shared
        .retention
        .delete_backups(&payload.backup_ids, &ctx.deletion_actor())
        .await?;
    let ids: Vec<i32> = deleted.iter().map(|b| b.id).collect();

    ctx.audit(
        &state,
        "backup.batch_deleted",
        "backup",
        None,
        Some(serde_json::json!({ "requested": payload.backup_ids, "deleted": ids })),
    )
    .await?;

    Ok(Json(BatchDeleteResponse {
        deleted: ids.len(),
        message: format!("Deleted {} backup(s)", ids.len()),
    }))
}

/// POST /backups/{id}/cancel
pub async fn cancel_backup(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i32>,
) -> Result<Json<CancelResponse>, ApiError> {
    ctx.require(Role::Operator)?;
    let id = validate_id("backup", id)?;

    let status = state.shared.ledger.cancel(JobKind::Backup, id).await?;
    ctx.audit(
        &state,
        "backup.cancelled",
        "backup",
        Some(id.to_string()),
        Some(serde_json::json!({ "status": status })),
    )
    .await?;

    Ok(Json(CancelResponse { id, status }))
}

/// GET /backups/{id}/transitions
pub async fn list_transitions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> Result<Json<Vec<TransitionDto>>, ApiError> {
    let id = validate_id("backup", id)?;
    let transitions = state.shared.ledger.transitions(JobKind::Backup, id).await?;
    Ok(Json(transitions.into_iter().map(TransitionDto::from).collect()))
}
