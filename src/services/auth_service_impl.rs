//! `SeaORM` implementation of the `AuthService` trait.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use tokio::task;

use crate::config::SecurityConfig;
use crate::constants::auth::{API_KEY_PREFIX, DEFAULT_API_KEY_PERMISSIONS, MIN_PASSWORD_LENGTH};
use crate::db::repositories::api_key::NewApiKey;
use crate::db::repositories::user::{NewUser, UserUpdate, hash_password};
use crate::db::{Store, User};
use crate::domain::Role;
use crate::services::auth_service::{
    AuthError, AuthService, Claims, IssuedApiKey, LoginResult, NewApiKeyRequest, NewUserRequest,
    Principal, UserChanges,
};
use crate::services::credentials::{api_key_display_prefix, generate_api_key, hash_api_key};

pub struct SeaOrmAuthService {
    store: Store,
    security: SecurityConfig,
}

impl SeaOrmAuthService {
    #[must_use]
    pub const fn new(store: Store, security: SecurityConfig) -> Self {
        Self { store, security }
    }

    pub fn issue_token(&self, user: &User) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user.username.clone(),
            role: user.role.clone(),
            iat: now.timestamp(),
            exp: (now + Duration::minutes(self.security.access_token_expire_minutes.max(1)))
                .timestamp(),
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.security.jwt_secret.as_bytes()),
        )
        .map_err(|e| AuthError::Internal(format!("Failed to sign token: {e}")))
    }

    async fn authenticate_api_key(&self, key: &str) -> Result<Principal, AuthError> {
        let record = self
            .store
            .api_keys()
            .find_by_hash(&hash_api_key(key))
            .await?
            .ok_or_else(|| AuthError::Unauthorized("Invalid API key".to_string()))?;

        if !record.is_active {
            return Err(AuthError::Unauthorized("API key has been revoked".to_string()));
        }
        if record.expires_at.is_some_and(|at| at <= Utc::now()) {
            return Err(AuthError::Unauthorized("API key has expired".to_string()));
        }

        self.store.api_keys().touch(record.id).await?;

        Ok(Principal {
            user_id: record.created_by,
            username: format!("api-key:{}", record.name),
            role: Role::from_permissions(&record.permissions),
            api_key_id: Some(record.id),
        })
    }

    async fn authenticate_token(&self, token: &str) -> Result<Principal, AuthError> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.security.jwt_secret.as_bytes()),
            &Validation::new(Algorithm::HS256),
        )
        .map_err(|_| AuthError::Unauthorized("Could not validate credentials".to_string()))?;

        // Role and activation come from the database, not the token.
        let user = self
            .store
            .users()
            .get_by_username(&data.claims.sub)
            .await?
            .ok_or_else(|| AuthError::Unauthorized("Could not validate credentials".to_string()))?;
        if !user.is_active {
            return Err(AuthError::Inactive);
        }

        Ok(Principal {
            user_id: Some(user.id),
            role: parse_role(&user.role)?,
            username: user.username,
            api_key_id: None,
        })
    }

    async fn hash(&self, password: &str) -> Result<String, AuthError> {
        let password = password.to_string();
        let security = self.security.clone();
        let hash = task::spawn_blocking(move || hash_password(&password, Some(&security)))
            .await
            .context("Password hashing task panicked")??;
        Ok(hash)
    }
}

fn parse_role(role: &str) -> Result<Role, AuthError> {
    role.parse::<Role>().map_err(AuthError::Internal)
}

fn check_password(password: &str) -> Result<(), AuthError> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(AuthError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }
    Ok(())
}

#[async_trait]
impl AuthService for SeaOrmAuthService {
    async fn login(&self, username: &str, password: &str) -> Result<LoginResult, AuthError> {
        let user = self
            .store
            .users()
            .verify_password(username, password)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        if !user.is_active {
            return Err(AuthError::Inactive);
        }

        Ok(LoginResult {
            access_token: self.issue_token(&user)?,
            token_type: "bearer".to_string(),
        })
    }

    async fn authenticate(&self, bearer: &str) -> Result<Principal, AuthError> {
        let bearer = bearer.trim();
        if bearer.starts_with(API_KEY_PREFIX) {
            self.authenticate_api_key(bearer).await
        } else {
            self.authenticate_token(bearer).await
        }
    }

    async fn get_user(&self, id: i32) -> Result<User, AuthError> {
        self.store
            .users()
            .get_by_id(id)
            .await?
            .ok_or(AuthError::UserNotFound)
    }

    async fn list_users(&self, skip: u64, limit: u64) -> Result<Vec<User>, AuthError> {
        Ok(self.store.users().list(skip, limit).await?)
    }

    async fn create_user(&self, request: NewUserRequest) -> Result<User, AuthError> {
        let username = request.username.trim().to_string();
        if username.is_empty() {
            return Err(AuthError::Validation("Username is required".to_string()));
        }
        check_password(&request.password)?;

        if self.store.users().get_by_username(&username).await?.is_some() {
            return Err(AuthError::Conflict(format!("Username '{username}' already exists")));
        }

        let hash = self.hash(&request.password).await?;
        let user = self
            .store
            .users()
            .create(
                NewUser {
                    username,
                    email: request.email,
                    full_name: request.full_name,
                    role: request.role.as_str().to_string(),
                    is_active: request.is_active,
                },
                hash,
            )
            .await?;

        Ok(user)
    }

    async fn update_user(
        &self,
        actor: &Principal,
        id: i32,
        changes: UserChanges,
    ) -> Result<User, AuthError> {
        if actor.user_id == Some(id) {
            if changes.is_active == Some(false) {
                return Err(AuthError::Validation(
                    "You cannot deactivate your own account".to_string(),
                ));
            }
            if changes.role.is_some_and(|role| role != Role::Admin) && actor.role == Role::Admin {
                return Err(AuthError::Validation(
                    "You cannot change your own admin role".to_string(),
                ));
            }
        }

        self.store
            .users()
            .update(
                id,
                UserUpdate {
                    email: changes.email,
                    full_name: changes.full_name,
                    role: changes.role.map(|r| r.as_str().to_string()),
                    is_active: changes.is_active,
                },
            )
            .await?
            .ok_or(AuthError::UserNotFound)
    }

    async fn delete_user(&self, actor: &Principal, id: i32) -> Result<(), AuthError> {
        if actor.user_id == Some(id) {
            return Err(AuthError::Validation(
                "You cannot delete your own account".to_string(),
            ));
        }
        if !self.store.users().delete(id).await? {
            return Err(AuthError::UserNotFound);
        }
        Ok(())
    }

    async fn change_password(
        &self,
        user_id: i32,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        check_password(new_password)?;
        if current_password == new_password {
            return Err(AuthError::Validation(
                "New password must be different from current password".to_string(),
            ));
        }

        let user = self.get_user(user_id).await?;
        if self
            .store
            .users()
            .verify_password(&user.username, current_password)
            .await?
            .is_none()
        {
            return Err(AuthError::Validation("Current password is incorrect".to_string()));
        }

        self.store
            .users()
            .update_password(user_id, new_password, &self.security)
            .await?;
        Ok(())
    }

    async fn reset_password(&self, user_id: i32, new_password: &str) -> Result<(), AuthError> {
        check_password(new_password)?;
        if !self
            .store
            .users()
            .update_password(user_id, new_password, &self.security)
            .await?
        {
            return Err(AuthError::UserNotFound);
        }
        Ok(())
    }

    async fn create_api_key(
        &self,
        actor: &Principal,
        request: NewApiKeyRequest,
    ) -> Result<IssuedApiKey, AuthError> {
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(AuthError::Validation("API key name is required".to_string()));
        }
        if request.expires_at.is_some_and(|at| at <= Utc::now()) {
            return Err(AuthError::Validation(
                "expires_at must be in the future".to_string(),
            ));
        }

        let permissions = request
            .permissions
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_KEY_PERMISSIONS.to_string());
        // A key never grants more than its creator holds.
        if !actor.allows(Role::from_permissions(&permissions)) {
            return Err(AuthError::Forbidden(
                "Cannot issue a key with more permissions than your own".to_string(),
            ));
        }

        let key = generate_api_key();
        let record = self
            .store
            .api_keys()
            .create(NewApiKey {
                name,
                key_hash: hash_api_key(&key),
                key_prefix: api_key_display_prefix(&key),
                permissions,
                created_by: actor.user_id,
                expires_at: request.expires_at,
            })
            .await?;

        Ok(IssuedApiKey { record, key })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service() -> SeaOrmAuthService {
        let store = Store::new("sqlite::memory:").await.unwrap();
        let security = SecurityConfig {
            argon2_memory_cost_kib: 1024,
            argon2_time_cost: 1,
            ..SecurityConfig::default()
        };
        SeaOrmAuthService::new(store, security)
    }

    #[tokio::test]
    async fn test_login_issues_token_that_authenticates() {
        let auth = service().await;
        let login = auth.login("admin", "password").await.unwrap();
        assert_eq!(login.token_type, "bearer");

        let principal = auth.authenticate(&login.access_token).await.unwrap();
        assert_eq!(principal.username, "admin");
        assert_eq!(principal.role, Role::Admin);
        assert!(matches!(
            auth.login("admin", "wrong").await,
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_api_key_roles_follow_permissions() {
        let auth = service().await;
        let admin = auth
            .authenticate(&auth.login("admin", "password").await.unwrap().access_token)
            .await
            .unwrap();

        let issued = auth
            .create_api_key(
                &admin,
                NewApiKeyRequest {
                    name: "ci".to_string(),
                    permissions: Some("read".to_string()),
                    expires_at: None,
                },
            )
            .await
            .unwrap();
        assert!(issued.key.starts_with(API_KEY_PREFIX));
        assert_eq!(issued.record.key_prefix.len(), 10);
        assert_ne!(issued.record.key_hash, issued.key);

        let principal = auth.authenticate(&issued.key).await.unwrap();
        assert_eq!(principal.role, Role::Viewer);
        assert_eq!(principal.api_key_id, Some(issued.record.id));

        auth.store.api_keys().revoke(issued.record.id).await.unwrap();
        assert!(auth.authenticate(&issued.key).await.is_err());
    }

    #[tokio::test]
    async fn test_admin_cannot_deactivate_self() {
        let auth = service().await;
        let admin = auth
            .authenticate(&auth.login("admin", "password").await.unwrap().access_token)
            .await
            .unwrap();
        let id = admin.user_id.unwrap();

        let err = auth
            .update_user(
                &admin,
                id,
                UserChanges {
                    is_active: Some(false),
                    ..UserChanges::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Validation(_)));
        assert!(auth.delete_user(&admin, id).await.is_err());
    }
}
