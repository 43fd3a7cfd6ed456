//! LDAP server registry endpoints.
//!
//! Bind passwords are sealed with the credential store before they are
//! persisted and never appear in a response.

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::validation::{validate_dn, validate_host, validate_id, validate_name, validate_port};
use super::{ApiError, AppState, AuthContext, DeleteResponse, Pagination};
use crate::constants::ldap::{DEFAULT_PORT, DEFAULT_SSL_PORT};
use crate::db::LdapServer;
use crate::db::repositories::ldap_server::{LdapServerUpdate, NewLdapServer};
use crate::domain::Role;
use crate::services::DirectoryTarget;
use crate::services::connector::{self, ConnectionTestResult, ConnectorError};
use crate::services::credentials::CredentialError;

#[derive(Debug, Serialize)]
pub struct LdapServerDto {
    pub id: i32,
    pub name: String,
    pub host: String,
    pub port: i32,
    pub use_ssl: bool,
    pub base_dn: String,
    pub bind_dn: Option<String>,
    pub has_bind_password: bool,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<LdapServer> for LdapServerDto {
    fn from(server: LdapServer) -> Self {
        Self {
            has_bind_password: server.bind_password.as_deref().is_some_and(|p| !p.is_empty()),
            id: server.id,
            name: server.name,
            host: server.host,
            port: server.port,
            use_ssl: server.use_ssl,
            base_dn: server.base_dn,
            bind_dn: server.bind_dn,
            description: server.description,
            is_active: server.is_active,
            created_at: server.created_at,
            updated_at: server.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateServerRequest {
    pub name: String,
    pub host: String,
    pub port: Option<i32>,
    #[serde(default)]
    pub use_ssl: bool,
    pub base_dn: String,
    pub bind_dn: Option<String>,
    pub bind_password: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateServerRequest {
    pub name: Option<String>,
    pub host: Option<String>,
    pub port: Option<i32>,
    pub use_ssl: Option<bool>,
    pub base_dn: Option<String>,
    pub bind_dn: Option<String>,
    pub bind_password: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

/// Either a stored server or ad-hoc connection parameters.
#[derive(Debug, Deserialize)]
pub struct TestConnectionRequest {
    pub server_id: Option<i32>,
    pub host: Option<String>,
    pub port: Option<i32>,
    #[serde(default)]
    pub use_ssl: bool,
    pub base_dn: Option<String>,
    pub bind_dn: Option<String>,
    pub bind_password: Option<String>,
}

impl From<CredentialError> for ApiError {
    fn from(err: CredentialError) -> Self {
        Self::internal(format!("Credential store failure: {err}"))
    }
}

async fn load(state: &AppState, id: i32) -> Result<LdapServer, ApiError> {
    state
        .store()
        .ldap_servers()
        .get(id)
        .await?
        .ok_or_else(|| ApiError::not_found("LDAP server", id))
}

fn default_port(use_ssl: bool) -> i32 {
    if use_ssl { DEFAULT_SSL_PORT } else { DEFAULT_PORT }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// GET /ldap-servers/
pub async fn list_servers(
    State(state): State<Arc<AppState>>,
    Query(page): Query<Pagination>,
) -> Result<Json<Vec<LdapServerDto>>, ApiError> {
    let servers = state
        .store()
        .ldap_servers()
        .list(page.skip(), page.limit())
        .await?;
    Ok(Json(servers.into_iter().map(LdapServerDto::from).collect()))
}

/// GET /ldap-servers/{id}
pub async fn get_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> Result<Json<LdapServerDto>, ApiError> {
    let id = validate_id("LDAP server", id)?;
    Ok(Json(load(&state, id).await?.into()))
}

/// POST /ldap-servers/
pub async fn create_server(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Json(payload): Json<CreateServerRequest>,
) -> Result<(StatusCode, Json<LdapServerDto>), ApiError> {
    ctx.require(Role::Admin)?;

    let name = validate_name("Server name", &payload.name)?.to_string();
    let host = validate_host(&payload.host)?.to_string();
    let port = validate_port(payload.port.unwrap_or_else(|| default_port(payload.use_ssl)))?;
    let base_dn = validate_dn("base_dn", &payload.base_dn)?.to_string();
    let bind_dn = non_empty(payload.bind_dn);
    if let Some(dn) = &bind_dn {
        validate_dn("bind_dn", dn)?;
    }

    if state.store().ldap_servers().get_by_name(&name).await?.is_some() {
        return Err(ApiError::conflict(format!(
            "An LDAP server named '{name}' already exists"
        )));
    }

    let bind_password = payload
        .bind_password
        .filter(|p| !p.is_empty())
        .map(|p| state.shared.credentials.seal(&p))
        .transpose()?;

    let server = state
        .store()
        .ldap_servers()
        .create(NewLdapServer {
            name,
            host,
            port,
            use_ssl: payload.use_ssl,
            base_dn,
            bind_dn,
            bind_password,
            description: payload.description,
            is_active: payload.is_active.unwrap_or(true),
        })
        .await?;

    ctx.audit(
        &state,
        "ldap_server.created",
        "ldap_server",
        Some(server.id.to_string()),
        Some(serde_json::json!({ "name": server.name, "host": server.host })),
    )
    .await?;
    tracing::info!(ldap_server_id = server.id, name = %server.name, "LDAP server registered");

    Ok((StatusCode::CREATED, Json(server.into())))
}

/// PUT /ldap-servers/{id}
pub async fn update_server(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i32>,
    Json(payload): Json<UpdateServerRequest>,
) -> Result<Json<LdapServerDto>, ApiError> {
    ctx.require(Role::Admin)?;
    let id = validate_id("LDAP server", id)?;
    let current = load(&state, id).await?;

    // Backups are tied to the directory they were taken from.
    let moved = payload.host.as_deref().is_some_and(|h| h.trim() != current.host)
        || payload.port.is_some_and(|p| p != current.port)
        || payload
            .base_dn
            .as_deref()
            .is_some_and(|dn| dn.trim() != current.base_dn);
    if moved {
        return Err(ApiError::validation(
            "host, port and base_dn cannot be changed; register a new server instead",
        ));
    }

    let name = match payload.name.as_deref() {
        Some(name) => {
            let name = validate_name("Server name", name)?.to_string();
            if name != current.name
                && state.store().ldap_servers().get_by_name(&name).await?.is_some()
            {
                return Err(ApiError::conflict(format!(
                    "An LDAP server named '{name}' already exists"
                )));
            }
            Some(name)
        }
        None => None,
    };

    let bind_dn = match payload.bind_dn {
        Some(dn) if !dn.trim().is_empty() => Some(validate_dn("bind_dn", &dn)?.to_string()),
        Some(_) => Some(String::new()),
        None => None,
    };

    // An empty password clears the stored one.
    let bind_password = match payload.bind_password {
        Some(p) if p.is_empty() => Some(String::new()),
        Some(p) => Some(state.shared.credentials.seal(&p)?),
        None => None,
    };
    let password_changed = bind_password.is_some();

    let server = state
        .store()
        .ldap_servers()
        .update(
            id,
            LdapServerUpdate {
                name,
                use_ssl: payload.use_ssl,
                bind_dn,
                bind_password,
                description: payload.description,
                is_active: payload.is_active,
            },
        )
        .await?
        .ok_or_else(|| ApiError::not_found("LDAP server", id))?;

    ctx.audit(
        &state,
        "ldap_server.updated",
        "ldap_server",
        Some(id.to_string()),
        Some(serde_json::json!({
            "name": server.name,
            "is_active": server.is_active,
            "bind_password_changed": password_changed,
        })),
    )
    .await?;

    Ok(Json(server.into()))
}

/// DELETE /ldap-servers/{id}
///
/// A server that backups or schedules still point at is deactivated instead.
pub async fn delete_server(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i32>,
) -> Result<Json<DeleteResponse>, ApiError> {
    ctx.require(Role::Admin)?;
    let id = validate_id("LDAP server", id)?;
    let server = load(&state, id).await?;
    let repo = state.store().ldap_servers();

    if repo.is_referenced(id).await? {
        repo.update(
            id,
            LdapServerUpdate {
                is_active: Some(false),
                ..LdapServerUpdate::default()
            },
        )
        .await?;
        ctx.audit(
            &state,
            "ldap_server.deactivated",
            "ldap_server",
            Some(id.to_string()),
            Some(serde_json::json!({ "name": server.name })),
        )
        .await?;

        return Ok(Json(DeleteResponse {
            message: format!(
                "LDAP server '{}' has backup history and was deactivated",
                server.name
            ),
            deactivated: true,
        }));
    }

    repo.delete(id).await?;
    ctx.audit(
        &state,
        "ldap_server.deleted",
        "ldap_server",
        Some(id.to_string()),
        Some(serde_json::json!({ "name": server.name })),
    )
    .await?;

    Ok(Json(DeleteResponse {
        message: format!("LDAP server '{}' deleted", server.name),
        deactivated: false,
    }))
}

/// POST /ldap-servers/test
///
/// Connection failures are reported in the body, not as an error status.
pub async fn test_connection(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Json(payload): Json<TestConnectionRequest>,
) -> Result<Json<ConnectionTestResult>, ApiError> {
    ctx.require(Role::Operator)?;

    let target = if let Some(server_id) = payload.server_id {
        let server = load(&state, validate_id("LDAP server", server_id)?).await?;
        let mut target = DirectoryTarget::from_server(&server, &state.shared.credentials)?;
        if let Some(password) = payload.bind_password.filter(|p| !p.is_empty()) {
            target.bind_password = Some(password);
        }
        target
    } else {
        let host = validate_host(payload.host.as_deref().unwrap_or_default())?.to_string();
        let port = validate_port(payload.port.unwrap_or_else(|| default_port(payload.use_ssl)))?;
        let base_dn =
            validate_dn("base_dn", payload.base_dn.as_deref().unwrap_or_default())?.to_string();
        DirectoryTarget {
            host,
            port: u16::try_from(port).map_err(|_| ApiError::validation("Invalid port"))?,
            use_ssl: payload.use_ssl,
            base_dn,
            bind_dn: non_empty(payload.bind_dn),
            bind_password: payload.bind_password.filter(|p| !p.is_empty()),
        }
    };

    Ok(Json(run_connection_test(&state, &target).await))
}

/// POST /ldap-servers/{id}/test
pub async fn test_stored_server(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<i32>,
) -> Result<Json<ConnectionTestResult>, ApiError> {
    ctx.require(Role::Operator)?;
    let server = load(&state, validate_id("LDAP server", id)?).await?;
    let target = DirectoryTarget::from_server(&server, &state.shared.credentials)?;
    Ok(Json(run_connection_test(&state, &target).await))
}

async fn run_connection_test(state: &AppState, target: &DirectoryTarget) -> ConnectionTestResult {
    let page_size = state.config().read().await.ldap.page_size;

    match connector::test_connection(state.shared.connector.as_ref(), target, page_size).await {
        Ok(result) => result,
        Err(e) => {
            tracing::info!(server = %target.url(), kind = e.kind(), "LDAP connection test failed");
            let kind = match e {
                ConnectorError::AuthFailed(_) => "ConnectorAuthFailed",
                _ => "ServerUnavailable",
            };
            ConnectionTestResult {
                success: false,
                message: format!("{kind}: {e}"),
                entries_found: 0,
            }
        }
    }
}
