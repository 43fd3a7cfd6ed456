use axum::{
    Extension, Json,
    extract::{Path, State},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::validation::validate_setting_key;
use super::{ApiError, AppState, AuthContext, MessageResponse};
use crate::db::Setting;
use crate::domain::Role;

#[derive(Debug, Serialize)]
pub struct SettingDto {
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

impl From<Setting> for SettingDto {
    fn from(s: Setting) -> Self {
        Self {
            key: s.key,
            value: s.value,
            updated_at: s.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SettingPayload {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Serialize)]
pub struct BatchUpdateResponse {
    pub updated: usize,
}

/// GET /settings/
pub async fn list_settings(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Vec<SettingDto>>, ApiError> {
    ctx.require(Role::Admin)?;
    let settings = state.store().settings().list().await?;
    Ok(Json(settings.into_iter().map(SettingDto::from).collect()))
}

/// GET /settings/{key}
pub async fn get_setting(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(key): Path<String>,
) -> Result<Json<SettingDto>, ApiError> {
    ctx.require(Role::Admin)?;
    let key = validate_setting_key(&key)?;

    let setting = state
        .store()
        .settings()
        .get(key)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Setting '{key}' not found")))?;
    Ok(Json(setting.into()))
}

/// POST|PUT /settings/
pub async fn upsert_setting(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Json(payload): Json<SettingPayload>,
) -> Result<Json<SettingDto>, ApiError> {
    ctx.require(Role::Admin)?;
    let key = validate_setting_key(&payload.key)?;

    let setting = state.store().settings().upsert(key, &payload.value).await?;
    ctx.audit(
        &state,
        "setting.updated",
        "setting",
        Some(setting.key.clone()),
        Some(serde_json::json!({ "value": setting.value })),
    )
    .await?;

    Ok(Json(setting.into()))
}

/// POST /settings/batch
///
/// All pairs are validated before any is written.
pub async fn batch_update(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Json(payload): Json<Vec<SettingPayload>>,
) -> Result<Json<BatchUpdateResponse>, ApiError> {
    ctx.require(Role::Admin)?;
    if payload.is_empty() {
        return Err(ApiError::validation("No settings provided"));
    }

    let pairs = payload
        .into_iter()
        .map(|s| Ok((validate_setting_key(&s.key)?.to_string(), s.value)))
        .collect::<Result<Vec<_>, ApiError>>()?;

    let updated = state.store().settings().upsert_many(&pairs).await?;
    let keys: Vec<&str> = pairs.iter().map(|(k, _)| k.as_str()).collect();
    ctx.audit(
        &state,
        "setting.batch_updated",
        "setting",
        None,
        Some(serde_json::json!({ "keys": keys })),
    )
    .await?;

    Ok(Json(BatchUpdateResponse { updated }))
}

/// DELETE /settings/{key}
pub async fn delete_setting(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(key): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    ctx.require(Role::Admin)?;
    let key = validate_setting_key(&key)?;

    if !state.store().settings().delete(key).await? {
        return Err(ApiError::NotFound(format!("Setting '{key}' not found")));
    }
    ctx.audit(&state, "setting.deleted", "setting", Some(key.to_string()), None)
        .await?;

    Ok(Json(MessageResponse::new(format!("Setting '{key}' deleted"))))
}
