use axum::{Extension, Json, extract::State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use super::validation::{
    validate_backup_type, validate_dn, validate_host, validate_name, validate_port,
    validate_retention_days, validate_role,
};
use super::{ApiError, AppState, AuthContext};
use crate::db::repositories::ldap_server::NewLdapServer;
use crate::db::repositories::schedule::NewSchedule;
use crate::db::repositories::user::{NewUser, hash_password};
use crate::domain::Role;
use crate::services::scheduler::next_run;

const EXPORT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default)]
    pub version: u32,
    pub exported_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ldap_servers: Vec<ServerExport>,
    #[serde(default)]
    pub scheduled_backups: Vec<ScheduleExport>,
    #[serde(default)]
    pub users: Vec<UserExport>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerExport {
    pub name: String,
    pub host: String,
    pub port: i32,
    #[serde(default)]
    pub use_ssl: bool,
    pub base_dn: String,
    pub bind_dn: Option<String>,
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScheduleExport {
    pub name: String,
    pub ldap_server_name: String,
    #[serde(default = "default_backup_type")]
    pub backup_type: String,
    pub cron_expression: String,
    #[serde(default = "default_retention")]
    pub retention_days: i32,
    #[serde(default = "default_true")]
    pub encrypted: bool,
    #[serde(default = "default_true")]
    pub compression_enabled: bool,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserExport {
    pub username: String,
    pub email: Option<String>,
    pub full_name: Option<String>,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

const fn default_true() -> bool {
    true
}

fn default_backup_type() -> String {
    "full".to_string()
}

const fn default_retention() -> i32 {
    30
}

fn default_role() -> String {
    Role::Viewer.to_string()
}

#[derive(Debug, Default, Serialize)]
pub struct ImportCounts {
    pub servers: usize,
    pub scheduled_backups: usize,
    pub users: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ImportResponse {
    pub message: String,
    pub imported: ImportCounts,
}

/// GET /config/export
///
/// Bind passwords and password hashes never leave the server.
pub async fn export_config(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<ConfigDocument>, ApiError> {
    ctx.require(Role::Admin)?;
    let store = state.store();

    let servers = store.ldap_servers().list_all().await?;
    let names: HashMap<i32, String> = servers.iter().map(|s| (s.id, s.name.clone())).collect();

    let scheduled_backups = store
        .schedules()
        .list_all()
        .await?
        .into_iter()
        .filter_map(|s| {
            let ldap_server_name = names.get(&s.ldap_server_id)?.clone();
            Some(ScheduleExport {
                name: s.name,
                ldap_server_name,
                backup_type: s.backup_type,
                cron_expression: s.cron_expression,
                retention_days: s.retention_days,
                encrypted: s.encrypted,
                compression_enabled: s.compression_enabled,
                is_active: s.is_active,
            })
        })
        .collect();

    let users = store
        .users()
        .list_all()
        .await?
        .into_iter()
        .map(|u| UserExport {
            username: u.username,
            email: u.email,
            full_name: u.full_name,
            role: u.role,
            is_active: u.is_active,
        })
        .collect();

    let ldap_servers = servers
        .into_iter()
        .map(|s| ServerExport {
            name: s.name,
            host: s.host,
            port: s.port,
            use_ssl: s.use_ssl,
            base_dn: s.base_dn,
            bind_dn: s.bind_dn,
            description: s.description,
            is_active: s.is_active,
        })
        .collect::<Vec<_>>();

    ctx.audit(
        &state,
        "config.exported",
        "config",
        None,
        Some(serde_json::json!({ "ldap_servers": ldap_servers.len() })),
    )
    .await?;

    Ok(Json(ConfigDocument {
        version: EXPORT_VERSION,
        exported_at: Some(Utc::now()),
        ldap_servers,
        scheduled_backups,
        users,
    }))
}

/// POST /config/import
///
/// Entries whose name already exists are skipped. Invalid entries are
/// reported in `errors` without aborting the rest.
pub async fn import_config(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AuthContext>,
    Json(doc): Json<ConfigDocument>,
) -> Result<Json<ImportResponse>, ApiError> {
    ctx.require(Role::Admin)?;

    let mut counts = ImportCounts::default();
    import_servers(&state, doc.ldap_servers, &mut counts).await?;
    import_schedules(&state, doc.scheduled_backups, ctx.user_id(), &mut counts).await?;
    import_users(&state, doc.users, &mut counts).await?;

    ctx.audit(
        &state,
        "config.imported",
        "config",
        None,
        Some(serde_json::json!({
            "servers": counts.servers,
            "scheduled_backups": counts.scheduled_backups,
            "users": counts.users,
            "errors": counts.errors.len(),
        })),
    )
    .await?;

    tracing::info!(
        servers = counts.servers,
        scheduled_backups = counts.scheduled_backups,
        users = counts.users,
        errors = counts.errors.len(),
        "Configuration imported"
    );

    Ok(Json(ImportResponse {
        message: "Configuration imported".to_string(),
        imported: counts,
    }))
}

async fn import_servers(
    state: &AppState,
    servers: Vec<ServerExport>,
    counts: &mut ImportCounts,
) -> Result<(), ApiError> {
    let repo = state.store().ldap_servers();

    for server in servers {
        let validated = (|| {
            Ok::<_, ApiError>(NewLdapServer {
                name: validate_name("Name", &server.name)?.to_string(),
                host: validate_host(&server.host)?.to_string(),
                port: validate_port(server.port)?,
                use_ssl: server.use_ssl,
                base_dn: validate_dn("base_dn", &server.base_dn)?.to_string(),
                bind_dn: server
                    .bind_dn
                    .as_deref()
                    .map(|dn| validate_dn("bind_dn", dn).map(str::to_string))
                    .transpose()?,
                bind_password: None,
                description: server.description.clone(),
                is_active: server.is_active,
            })
        })();

        let new = match validated {
            Ok(new) => new,
            Err(e) => {
                counts.errors.push(format!("ldap server '{}': {e}", server.name));
                continue;
            }
        };

        if repo.get_by_name(&new.name).await?.is_some() {
            continue;
        }
        repo.create(new).await?;
        counts.servers += 1;
    }
    Ok(())
}

async fn import_schedules(
    state: &AppState,
    schedules: Vec<ScheduleExport>,
    created_by: Option<i32>,
    counts: &mut ImportCounts,
) -> Result<(), ApiError> {
    let store = state.store();
    let now = Utc::now();

    for schedule in schedules {
        if store.schedules().get_by_name(&schedule.name).await?.is_some() {
            continue;
        }

        let Some(server) = store
            .ldap_servers()
            .get_by_name(&schedule.ldap_server_name)
            .await?
        else {
            counts.errors.push(format!(
                "scheduled backup '{}': unknown ldap server '{}'",
                schedule.name, schedule.ldap_server_name
            ));
            continue;
        };

        let validated = (|| {
            let name = validate_name("Name", &schedule.name)?.to_string();
            let backup_type = validate_backup_type(&schedule.backup_type)?;
            let retention_days = validate_retention_days(schedule.retention_days)?;
            let next_run_at = next_run(&schedule.cron_expression, schedule.is_active, now)?;
            Ok::<_, ApiError>((name, backup_type, retention_days, next_run_at))
        })();

        let (name, backup_type, retention_days, next_run_at) = match validated {
            Ok(v) => v,
            Err(e) => {
                counts
                    .errors
                    .push(format!("scheduled backup '{}': {e}", schedule.name));
                continue;
            }
        };

        store
            .schedules()
            .create(NewSchedule {
                name,
                ldap_server_id: server.id,
                backup_type: backup_type.to_string(),
                cron_expression: schedule.cron_expression,
                retention_days,
                encrypted: schedule.encrypted,
                compression_enabled: schedule.compression_enabled,
                is_active: schedule.is_active,
                next_run_at,
                created_by,
            })
            .await?;
        counts.scheduled_backups += 1;
    }
    Ok(())
}

async fn import_users(
    state: &AppState,
    users: Vec<UserExport>,
    counts: &mut ImportCounts,
) -> Result<(), ApiError> {
    let security = state.config().read().await.security.clone();
    let repo = state.store().users();

    for user in users {
        if repo.get_by_username(&user.username).await?.is_some() {
            continue;
        }

        let validated = validate_name("Username", &user.username)
            .map(str::to_string)
            .and_then(|username| Ok((username, validate_role(&user.role)?)));
        let (username, role) = match validated {
            Ok(v) => v,
            Err(e) => {
                counts.errors.push(format!("user '{}': {e}", user.username));
                continue;
            }
        };

        let password_hash = hash_password(&security.imported_user_password, Some(&security))?;
        repo.create(
            NewUser {
                username,
                email: user.email,
                full_name: user.full_name,
                role: role.to_string(),
                is_active: user.is_active,
            },
            password_hash,
        )
        .await?;
        counts.users += 1;
    }
    Ok(())
}
