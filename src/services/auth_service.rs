//! Domain service for authentication and user management.
//!
//! Handles login, bearer-token verification (JWT or API key), password
//! changes, user administration and API key issuance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::{ApiKey, User};
use crate::domain::Role;

/// Errors specific to authentication operations.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("User account is inactive")]
    Inactive,

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("User not found")]
    UserNotFound,

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidCredentials | Self::Unauthorized(_) => "Unauthorized",
            Self::Inactive | Self::Forbidden(_) => "Forbidden",
            Self::UserNotFound => "NotFound",
            Self::Validation(_) => "Validation",
            Self::Conflict(_) => "Conflict",
            Self::Internal(_) => "Internal",
        }
    }
}

impl From<sea_orm::DbErr> for AuthError {
    fn from(err: sea_orm::DbErr) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<anyhow::Error> for AuthError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}

/// The caller behind a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// User id; for API keys, the user that created the key.
    pub user_id: Option<i32>,
    pub username: String,
    pub role: Role,
    pub api_key_id: Option<i32>,
}

impl Principal {
    #[must_use]
    pub fn allows(&self, required: Role) -> bool {
        self.role.allows(required)
    }
}

/// JWT claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub exp: i64,
    pub iat: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginResult {
    pub access_token: String,
    pub token_type: String,
}

#[derive(Debug, Clone)]
pub struct NewUserRequest {
    pub username: String,
    pub password: String,
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub role: Role,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UserChanges {
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub role: Option<Role>,
    pub is_active: Option<bool>,
}

/// A freshly issued key. `key` is never retrievable again.
#[derive(Debug, Clone)]
pub struct IssuedApiKey {
    pub record: ApiKey,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct NewApiKeyRequest {
    pub name: String,
    pub permissions: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Domain service trait for authentication.
#[async_trait::async_trait]
pub trait AuthService: Send + Sync {
    /// Verifies credentials and issues an access token.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredentials`] if login fails and
    /// [`AuthError::Inactive`] for deactivated accounts.
    async fn login(&self, username: &str, password: &str) -> Result<LoginResult, AuthError>;

    /// Resolves a bearer token (access token or API key) to a principal.
    async fn authenticate(&self, bearer: &str) -> Result<Principal, AuthError>;

    async fn get_user(&self, id: i32) -> Result<User, AuthError>;

    async fn list_users(&self, skip: u64, limit: u64) -> Result<Vec<User>, AuthError>;

    async fn create_user(&self, request: NewUserRequest) -> Result<User, AuthError>;

    /// Admins cannot deactivate or demote themselves.
    async fn update_user(
        &self,
        actor: &Principal,
        id: i32,
        changes: UserChanges,
    ) -> Result<User, AuthError>;

    async fn delete_user(&self, actor: &Principal, id: i32) -> Result<(), AuthError>;

    /// Changes a user's own password.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Validation`] if current password is incorrect or new password invalid.
    async fn change_password(
        &self,
        user_id: i32,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), AuthError>;

    /// Admin reset, no current password required.
    async fn reset_password(&self, user_id: i32, new_password: &str) -> Result<(), AuthError>;

    async fn create_api_key(
        &self,
        actor: &Principal,
        request: NewApiKeyRequest,
    ) -> Result<IssuedApiKey, AuthError>;
}
