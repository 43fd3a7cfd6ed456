use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::backups::BackupDto;
use super::validation::{validate_backup_type, validate_id, validate_name, validate_retention_days};
use super::{ApiError, AppState, AuthContext, DeleteResponse, Pagination};
use crate::constants::limits::DEFAULT_RETENTION_DAYS;
use crate::db::ScheduledBackup;
use crate::db::repositories::schedule::{NewSchedule, ScheduleUpdate};
use crate::domain::{BackupType, Role};
use crate::services::scheduler::{ScheduleError, next_run};

#[derive(Debug, Serialize)]
pub struct ScheduleDto {
    pub id: i32,
    pub name: String,
    pub ldap_server_id: i32,
    pub backup_type: String,
    pub cron_expression: String,
    pub retention_days: i32,
    pub encrypted: bool,
    pub compression_enabled: bool,
    pub is_active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_by: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ScheduledBackup> for ScheduleDto {
    fn from(s: ScheduledBackup) -> Self {
        Self {
            id: s.id,
            name: s.name,
            ldap_server_id: s.ldap_server_id,
            backup_type: s.backup_type,
            cron_expression: s.cron_expression,
            retention_days: s.retention_days,
            encrypted: s.encrypted,
            compression_enabled: s.compression_enabled,
            is_active: s.is_active,
            last_run_at: s.last_run_at,
            next_run_at: s.next_run_at,
            created_by: s.created_by,
            created_at: s.created_at,
            updated_at: s.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub name: String,
    pub ldap_server_id: i32,
    pub cron_expression: String,
    pub backup_type: Option<String>,
    pub retention_days: Option<i32>,
    pub encrypted: Option<bool>,
    pub compression_enabled: Option<bool>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateScheduleRequest {
    pub name: Option<String>,
    pub cron_expression: Option<String>,
    pub backup_type: Option<String>,
    pub retention_days: Option<i32>,
    pub encrypted: Option<bool>,
    pub compression_enabled: Option<bool>,
    pub is_active: Option<bool>,
}

impl From<ScheduleError> for ApiError {
    fn from(err: ScheduleError) -> Self {
        match err {
            ScheduleError::NotFound(id) => Self::not_found("Scheduled backup", id),
            ScheduleError::ScheduleInvalid(msg) => {
                Self::validation(format!("ScheduleInvalid: {msg}"))
            }
            ScheduleError::Validation(msg) => Self::ValidationError(msg),
            ScheduleError::Conflict(msg) => Self::Conflict(msg),
            ScheduleError::Backup(e) => e.into(),
            ScheduleError::Internal(e) => e.into(),
        }
    }
}

async fn load(state: &AppState, id: i32) -> Result<ScheduledBackup, ApiError> {
    state
        .store()
        .schedules()
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Scheduled backup", id))
}

async fn ensure_unique_name(
    state: &AppState,
    name: &str,
    current: Option<i32>,
) -> Result<(), ApiError> {
    if let Some(existing) = state.store().schedules().get_by_name(name).await?
        && Some(existing.id) != current
    {
        return Err(ApiError::conflict(format!(
            "Scheduled backup '{name}' already exists"
        )));
    }
    Ok(())
}

/// GET /scheduled-backups/
pub async fn list_schedules(
    State(state): State<Arc<AppState>>,
    Query(page): Query<Pagination>,
) -> Result<Json<Vec<ScheduleDto>>, ApiError> {
    let schedules = state
        .store()
        .schedules()
        .list(page.skip(), page.limit())
        .await?;
    Ok(Json(schedules.into_iter().map(ScheduleDto::from).collect()))
}

/// GET /scheduled-backups/{id}
pub async fn get_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> Result<Json<ScheduleDto>, ApiError> {
    let id = validate_id("scheduled backup", id)?;
    Ok(Json(load(&state, id).await?.into()))
}

/// POST /scheduled-backups/
pub async fn create_schedule(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Json(payload): Json<CreateScheduleRequest>,
) -> Result<(StatusCode, Json<ScheduleDto>), ApiError> {
    ctx.require(Role::Admin)?;
    let name = validate_name("Name", &payload.name)?.to_string();
    let ldap_server_id = validate_id("LDAP server", payload.ldap_server_id)?;
    let backup_type = payload
        .backup_type
        .as_deref()
        .map(validate_backup_type)
        .transpose()?
        .unwrap_or(BackupType::Full);
    let retention_days =
        validate_retention_days(payload.retention_days.unwrap_or(DEFAULT_RETENTION_DAYS))?;
    let cron_expression = payload.cron_expression.trim().to_string();
    let is_active = payload.is_active.unwrap_or(true);
    let next_run_at = next_run(&cron_expression, is_active, Utc::now())?;

    if state
        .store()
        .ldap_servers()
        .get(ldap_server_id)
        .await?
        .is_none()
    {
        return Err(ApiError::not_found("LDAP server", ldap_server_id));
    }
    ensure_unique_name(&state, &name, None).await?;

    let schedule = state
        .store()
        .schedules()
        .create(NewSchedule {
            name,
            ldap_server_id,
            backup_type: backup_type.to_string(),
            cron_expression,
            retention_days,
            encrypted: payload.encrypted.unwrap_or(true),
            compression_enabled: payload.compression_enabled.unwrap_or(true),
            is_active,
            next_run_at,
            created_by: ctx.user_id(),
        })
        .await?;

    ctx.audit(
        &state,
        "scheduled_backup.created",
        "scheduled_backup",
        Some(schedule.id.to_string()),
        Some(serde_json::json!({
            "name": schedule.name,
            "cron_expression": schedule.cron_expression,
            "ldap_server_id": schedule.ldap_server_id,
        })),
    )
    .await?;

    tracing::info!(
        schedule_id = schedule.id,
        next_run_at = ?schedule.next_run_at,
        "Scheduled backup created"
    );
    Ok((StatusCode::CREATED, Json(schedule.into())))
}

/// PUT /scheduled-backups/{id}
///
/// `next_run_at` is recomputed whenever the cron expression or activation
/// changes.
pub async fn update_schedule(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i32>,
    Json(payload): Json<UpdateScheduleRequest>,
) -> Result<Json<ScheduleDto>, ApiError> {
    ctx.require(Role::Admin)?;
    let id = validate_id("scheduled backup", id)?;
    let current = load(&state, id).await?;

    let name = payload
        .name
        .as_deref()
        .map(|n| validate_name("Name", n).map(str::to_string))
        .transpose()?;
    if let Some(name) = &name {
        ensure_unique_name(&state, name, Some(id)).await?;
    }
    let backup_type = payload
        .backup_type
        .as_deref()
        .map(validate_backup_type)
        .transpose()?
        .map(|t| t.to_string());
    let retention_days = payload
        .retention_days
        .map(validate_retention_days)
        .transpose()?;
    let cron_expression = payload.cron_expression.map(|c| c.trim().to_string());

    let next_run_at = if cron_expression.is_some() || payload.is_active.is_some() {
        let expr = cron_expression
            .as_deref()
            .unwrap_or(&current.cron_expression);
        let active = payload.is_active.unwrap_or(current.is_active);
        Some(next_run(expr, active, Utc::now())?)
    } else {
        None
    };

    let schedule = state
        .store()
        .schedules()
        .update(
            id,
            ScheduleUpdate {
                name,
                backup_type,
                cron_expression,
                retention_days,
                encrypted: payload.encrypted,
                compression_enabled: payload.compression_enabled,
                is_active: payload.is_active,
                next_run_at,
            },
        )
        .await?
        .ok_or_else(|| ApiError::not_found("Scheduled backup", id))?;

    ctx.audit(
        &state,
        "scheduled_backup.updated",
        "scheduled_backup",
        Some(id.to_string()),
        Some(serde_json::json!({
            "name": schedule.name,
            "cron_expression": schedule.cron_expression,
            "is_active": schedule.is_active,
        })),
    )
    .await?;

    Ok(Json(schedule.into()))
}

/// DELETE /scheduled-backups/{id}
///
/// A schedule that already produced backups is deactivated so the history
/// keeps its reference.
pub async fn delete_schedule(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i32>,
) -> Result<Json<DeleteResponse>, ApiError> {
    ctx.require(Role::Admin)?;
    let id = validate_id("scheduled backup", id)?;
    let schedule = load(&state, id).await?;

    if state.store().backups().has_any_for_schedule(id).await? {
        state
            .store()
            .schedules()
            .update(
                id,
                ScheduleUpdate {
                    is_active: Some(false),
                    next_run_at: Some(None),
                    ..ScheduleUpdate::default()
                },
            )
            .await?;

        ctx.audit(
            &state,
            "scheduled_backup.deactivated",
            "scheduled_backup",
            Some(id.to_string()),
            Some(serde_json::json!({ "name": schedule.name })),
        )
        .await?;

        return Ok(Json(DeleteResponse {
            message: format!(
                "Scheduled backup '{}' has backup history and was deactivated",
                schedule.name
            ),
            deactivated: true,
        }));
    }

    state.store().schedules().delete(id).await?;
    ctx.audit(
        &state,
        "scheduled_backup.deleted",
        "scheduled_backup",
        Some(id.to_string()),
        Some(serde_json::json!({ "name": schedule.name })),
    )
    .await?;

    Ok(Json(DeleteResponse {
        message: format!("Scheduled backup '{}' deleted", schedule.name),
        deactivated: false,
    }))
}

/// POST /scheduled-backups/{id}/run
pub async fn run_schedule(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i32>,
) -> Result<(StatusCode, Json<BackupDto>), ApiError> {
    ctx.require(Role::Operator)?;
    let id = validate_id("scheduled backup", id)?;

    let backup = state
        .shared
        .schedule_runner
        .run_now(id, ctx.user_id())
        .await?;

    ctx.audit(
        &state,
        "scheduled_backup.run",
        "scheduled_backup",
        Some(id.to_string()),
        Some(serde_json::json!({ "backup_id": backup.id })),
    )
    .await?;

    Ok((StatusCode::ACCEPTED, Json(backup.into())))
}
