use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::validation::{validate_id, validate_name, validate_permissions};
use super::{ApiError, AppState, AuthContext, MessageResponse, Pagination};
use crate::db::ApiKey;
use crate::domain::Role;
use crate::services::auth_service::NewApiKeyRequest;

#[derive(Debug, Serialize)]
pub struct ApiKeyDto {
    pub id: i32,
    pub name: String,
    pub key_prefix: String,
    pub permissions: String,
    pub created_by: Option<i32>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<ApiKey> for ApiKeyDto {
    fn from(k: ApiKey) -> Self {
        Self {
            id: k.id,
            name: k.name,
            key_prefix: k.key_prefix,
            permissions: k.permissions,
            created_by: k.created_by,
            expires_at: k.expires_at,
            last_used_at: k.last_used_at,
            is_active: k.is_active,
            created_at: k.created_at,
        }
    }
}

/// Returned once on creation; the plaintext key is not stored.
#[derive(Debug, Serialize)]
pub struct CreatedApiKey {
    #[serde(flatten)]
    pub record: ApiKeyDto,
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    pub name: String,
    pub permissions: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// GET /api-keys/
pub async fn list_api_keys(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Query(page): Query<Pagination>,
) -> Result<Json<Vec<ApiKeyDto>>, ApiError> {
    ctx.require(Role::Admin)?;
    let keys = state
        .store()
        .api_keys()
        .list(page.skip(), page.limit())
        .await?;
    Ok(Json(keys.into_iter().map(ApiKeyDto::from).collect()))
}

/// POST /api-keys/
pub async fn create_api_key(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Json(payload): Json<CreateApiKeyRequest>,
) -> Result<(StatusCode, Json<CreatedApiKey>), ApiError> {
    ctx.require(Role::Admin)?;
    let name = validate_name("Name", &payload.name)?.to_string();
    let permissions = payload
        .permissions
        .as_deref()
        .map(validate_permissions)
        .transpose()?
        .map(str::to_string);
    if let Some(expires_at) = payload.expires_at
        && expires_at <= Utc::now()
    {
        return Err(ApiError::validation("expires_at must be in the future"));
    }

    let issued = state
        .auth()
        .create_api_key(
            &ctx.principal,
            NewApiKeyRequest {
                name,
                permissions,
                expires_at: payload.expires_at,
            },
        )
        .await?;

    ctx.audit(
        &state,
        "api_key.created",
        "api_key",
        Some(issued.record.id.to_string()),
        Some(serde_json::json!({
            "name": issued.record.name,
            "permissions": issued.record.permissions,
        })),
    )
    .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreatedApiKey {
            record: issued.record.into(),
            key: issued.key,
        }),
    ))
}

/// PATCH /api-keys/{id}/revoke
pub async fn revoke_api_key(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i32>,
) -> Result<Json<MessageResponse>, ApiError> {
    ctx.require(Role::Admin)?;
    let id = validate_id("API key", id)?;

    if !state.store().api_keys().revoke(id).await? {
        return Err(ApiError::not_found("API key", id));
    }
    ctx.audit(&state, "api_key.revoked", "api_key", Some(id.to_string()), None)
        .await?;

    Ok(Json(MessageResponse::new("API key revoked")))
}

/// DELETE /api-keys/{id}
pub async fn delete_api_key(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i32>,
) -> Result<Json<MessageResponse>, ApiError> {
    ctx.require(Role::Admin)?;
    let id = validate_id("API key", id)?;

    if !state.store().api_keys().delete(id).await? {
        return Err(ApiError::not_found("API key", id));
    }
    ctx.audit(&state, "api_key.deleted", "api_key", Some(id.to_string()), None)
        .await?;

    Ok(Json(MessageResponse::new("API key deleted")))
}
