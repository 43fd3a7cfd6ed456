use axum::{
    Extension, Json,
    extract::{Path, Query, State},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{ApiError, AppState, AuthContext, Pagination};
use crate::db::AuditLog;
use crate::db::repositories::audit::AuditFilter;
use crate::domain::Role;

#[derive(Debug, Serialize)]
pub struct AuditLogDto {
    pub id: i64,
    pub user_id: Option<i32>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub details: Option<serde_json::Value>,
    pub ip_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<AuditLog> for AuditLogDto {
    fn from(log: AuditLog) -> Self {
        // Rows written before details were JSON come back as plain strings.
        let details = log.details.map(|raw| {
            serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw))
        });

        Self {
            id: log.id,
            user_id: log.user_id,
            action: log.action,
            resource_type: log.resource_type,
            resource_id: log.resource_id,
            details,
            ip_address: log.ip_address,
            created_at: log.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AuditLogQuery {
    pub action: Option<String>,
    pub resource_type: Option<String>,
    pub user_id: Option<i32>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
}

/// GET /audit-logs/
pub async fn list_audit_logs(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<AuditLogQuery>,
) -> Result<Json<Vec<AuditLogDto>>, ApiError> {
    ctx.require(Role::Admin)?;

    let filter = AuditFilter {
        action: query.action.filter(|a| !a.is_empty()),
        resource_type: query.resource_type.filter(|r| !r.is_empty()),
        user_id: query.user_id,
    };
    let page = Pagination {
        skip: query.skip,
        limit: query.limit,
    };

    let logs = state
        .store()
        .list_audit(&filter, page.skip(), page.limit())
        .await?;
    Ok(Json(logs.into_iter().map(AuditLogDto::from).collect()))
}

/// GET /audit-logs/{id}
pub async fn get_audit_log(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i64>,
) -> Result<Json<AuditLogDto>, ApiError> {
    ctx.require(Role::Admin)?;

    let log = state
        .store()
        .get_audit(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Audit log", id))?;
    Ok(Json(log.into()))
}
