use axum::{
    Extension, Json,
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

use super::validation::{validate_email, validate_id, validate_role};
use super::{ApiError, AppState, MessageResponse, Pagination};
use crate::db::User;
use crate::db::repositories::audit::NewAuditLog;
use crate::domain::Role;
use crate::services::auth_service::{LoginResult, NewUserRequest, UserChanges};
use crate::services::{AuthError, DeletionActor, Principal};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct MeResponse {
    pub id: Option<i32>,
    pub username: String,
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub role: String,
    pub is_active: bool,
}

#[derive(Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Deserialize)]
pub struct ResetPasswordRequest {
    pub new_password: String,
}

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub role: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Deserialize)]
pub struct UpdateUserRequest {
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub role: Option<String>,
    pub is_active: Option<bool>,
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::InvalidCredentials => {
                Self::Unauthorized("Incorrect username or password".to_string())
            }
            AuthError::Inactive => Self::Forbidden("User account is inactive".to_string()),
            AuthError::Unauthorized(msg) => Self::Unauthorized(msg),
            AuthError::Forbidden(msg) => Self::Forbidden(msg),
            AuthError::UserNotFound => Self::NotFound("User not found".to_string()),
            AuthError::Validation(msg) => Self::ValidationError(msg),
            AuthError::Conflict(msg) => Self::Conflict(msg),
            AuthError::Internal(msg) => Self::InternalError(msg),
        }
    }
}

// ============================================================================
// Request context
// ============================================================================

/// The authenticated caller, inserted into request extensions by
/// [`auth_middleware`].
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub principal: Principal,
    pub ip_address: Option<String>,
}

impl AuthContext {
    pub fn require(&self, role: Role) -> Result<(), ApiError> {
        if self.principal.allows(role) {
            Ok(())
        } else {
            Err(ApiError::forbidden(format!(
                "This action requires the {role} role"
            )))
        }
    }

    #[must_use]
    pub const fn user_id(&self) -> Option<i32> {
        self.principal.user_id
    }

    #[must_use]
    pub fn deletion_actor(&self) -> DeletionActor {
        DeletionActor {
            user_id: self.principal.user_id,
            api_key_id: self.principal.api_key_id,
            ip_address: self.ip_address.clone(),
        }
    }

    /// Appends an audit record attributed to this caller.
    pub async fn audit(
        &self,
        state: &AppState,
        action: &str,
        resource_type: &str,
        resource_id: Option<String>,
        details: Option<serde_json::Value>,
    ) -> Result<(), ApiError> {
        let mut details = details.unwrap_or_else(|| serde_json::json!({}));
        if let (Some(key_id), Some(map)) = (self.principal.api_key_id, details.as_object_mut()) {
            map.insert("api_key_id".to_string(), serde_json::json!(key_id));
        }

        state
            .store()
            .add_audit(NewAuditLog {
                user_id: self.principal.user_id,
                action: action.to_string(),
                resource_type: resource_type.to_string(),
                resource_id,
                details: Some(details),
                ip_address: self.ip_address.clone(),
            })
            .await?;
        Ok(())
    }
}

// ============================================================================
// Middleware
// ============================================================================

/// Resolves `Authorization: Bearer <token>` (access token or API key) or an
/// `X-Api-Key` header to a principal.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Result<impl IntoResponse, ApiError> {
    let token = extract_token(&headers)
        .ok_or_else(|| ApiError::Unauthorized("Not authenticated".to_string()))?;

    let principal = state.auth().authenticate(&token).await?;
    tracing::Span::current().record("user_id", principal.username.as_str());

    let ip_address = client_ip(&headers).or_else(|| {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
    });

    request.extensions_mut().insert(AuthContext {
        principal,
        ip_address,
    });

    Ok(next.run(request).await)
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(auth_header) = headers.get("Authorization")
        && let Ok(auth_str) = auth_header.to_str()
        && let Some(token) = auth_str
            .strip_prefix("Bearer ")
            .or_else(|| auth_str.strip_prefix("bearer "))
    {
        return Some(token.trim().to_string());
    }

    if let Some(api_key) = headers.get("X-Api-Key")
        && let Ok(key_str) = api_key.to_str()
    {
        return Some(key_str.trim().to_string());
    }

    None
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("X-Forwarded-For")
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("X-Real-IP").and_then(|h| h.to_str().ok()))
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /auth/login
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<LoginResult>, ApiError> {
    if payload.username.trim().is_empty() {
        return Err(ApiError::validation("Username is required"));
    }
    if payload.password.is_empty() {
        return Err(ApiError::validation("Password is required"));
    }

    let result = state
        .auth()
        .login(payload.username.trim(), &payload.password)
        .await?;

    tracing::info!(username = %payload.username.trim(), "User logged in");
    Ok(Json(result))
}

/// GET /auth/me
pub async fn me(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<MeResponse>, ApiError> {
    let principal = &ctx.principal;

    if principal.api_key_id.is_none()
        && let Some(user_id) = principal.user_id
    {
        let user = state.auth().get_user(user_id).await?;
        return Ok(Json(MeResponse {
            id: Some(user.id),
            username: user.username,
            email: user.email,
            full_name: user.full_name,
            role: user.role,
            is_active: user.is_active,
        }));
    }

    Ok(Json(MeResponse {
        id: principal.user_id,
        username: principal.username.clone(),
        email: None,
        full_name: None,
        role: principal.role.to_string(),
        is_active: true,
    }))
}

/// POST /auth/change-password
pub async fn change_password(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    if ctx.principal.api_key_id.is_some() {
        return Err(ApiError::forbidden("API keys cannot change passwords"));
    }
    let user_id = ctx
        .user_id()
        .ok_or_else(|| ApiError::Unauthorized("Not authenticated".to_string()))?;

    state
        .auth()
        .change_password(user_id, &payload.current_password, &payload.new_password)
        .await?;

    ctx.audit(
        &state,
        "user.password_changed",
        "user",
        Some(user_id.to_string()),
        None,
    )
    .await?;
    tracing::info!(user_id, "Password changed");

    Ok(Json(MessageResponse::new("Password updated successfully")))
}

/// GET /auth/users/
pub async fn list_users(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Query(page): Query<Pagination>,
) -> Result<Json<Vec<User>>, ApiError> {
    ctx.require(Role::Admin)?;
    let users = state.auth().list_users(page.skip(), page.limit()).await?;
    Ok(Json(users))
}

/// GET /auth/users/{id}
pub async fn get_user(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i32>,
) -> Result<Json<User>, ApiError> {
    ctx.require(Role::Admin)?;
    let id = validate_id("user", id)?;
    Ok(Json(state.auth().get_user(id).await?))
}

/// POST /auth/users/
pub async fn create_user(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Json(payload): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    ctx.require(Role::Admin)?;

    let email = payload
        .email
        .as_deref()
        .filter(|e| !e.trim().is_empty())
        .map(validate_email)
        .transpose()?
        .map(str::to_string);
    let role = payload
        .role
        .as_deref()
        .map(validate_role)
        .transpose()?
        .unwrap_or(Role::Viewer);

    let user = state
        .auth()
        .create_user(NewUserRequest {
            username: payload.username,
            password: payload.password,
            email,
            full_name: payload.full_name,
            role,
            is_active: payload.is_active.unwrap_or(true),
        })
        .await?;

    ctx.audit(
        &state,
        "user.created",
        "user",
        Some(user.id.to_string()),
        Some(serde_json::json!({ "username": user.username, "role": user.role })),
    )
    .await?;

    Ok((StatusCode::CREATED, Json(user)))
}

/// PUT /auth/users/{id}
pub async fn update_user(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i32>,
    Json(payload): Json<UpdateUserRequest>,
) -> Result<Json<User>, ApiError> {
    ctx.require(Role::Admin)?;
    let id = validate_id("user", id)?;

    let email = payload
        .email
        .as_deref()
        .map(validate_email)
        .transpose()?
        .map(str::to_string);
    let role = payload.role.as_deref().map(validate_role).transpose()?;

    let user = state
        .auth()
        .update_user(
            &ctx.principal,
            id,
            UserChanges {
                email,
                full_name: payload.full_name,
                role,
                is_active: payload.is_active,
            },
        )
        .await?;

    ctx.audit(
        &state,
        "user.updated",
        "user",
        Some(user.id.to_string()),
        Some(serde_json::json!({ "role": user.role, "is_active": user.is_active })),
    )
    .await?;

    Ok(Json(user))
}

/// DELETE /auth/users/{id}
pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i32>,
) -> Result<Json<MessageResponse>, ApiError> {
    ctx.require(Role::Admin)?;
    let id = validate_id("user", id)?;

    state.auth().delete_user(&ctx.principal, id).await?;
    ctx.audit(&state, "user.deleted", "user", Some(id.to_string()), None)
        .await?;

    Ok(Json(MessageResponse::new("User deleted")))
}

/// POST /auth/users/{id}/reset-password
pub async fn reset_password(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i32>,
    Json(payload): Json<ResetPasswordRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    ctx.require(Role::Admin)?;
    let id = validate_id("user", id)?;

    state.auth().reset_password(id, &payload.new_password).await?;
    ctx.audit(
        &state,
        "user.password_reset",
        "user",
        Some(id.to_string()),
        None,
    )
    .await?;

    Ok(Json(MessageResponse::new("Password reset successfully")))
}
