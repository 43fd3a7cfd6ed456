use anyhow::{Context, Result};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};

use crate::entities::{backups, ldap_servers, prelude::*, scheduled_backups};

#[derive(Debug, Clone)]
pub struct NewLdapServer {
    pub name: String,
    pub host: String,
    pub port: i32,
    pub use_ssl: bool,
    pub base_dn: String,
    pub bind_dn: Option<String>,
    /// Already sealed by the credential store.
    pub bind_password: Option<String>,
    pub description: Option<String>,
    pub is_active: bool,
}

/// Mutable fields only. Host, port and base DN are fixed at creation.
#[derive(Debug, Clone, Default)]
pub struct LdapServerUpdate {
    pub name: Option<String>,
    pub use_ssl: Option<bool>,
    pub bind_dn: Option<String>,
    pub bind_password: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
}

pub struct LdapServerRepository {
    conn: DatabaseConnection,
}

impl LdapServerRepository {
    #[must_use]
    pub const fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    pub async fn list(&self, skip: u64, limit: u64) -> Result<Vec<ldap_servers::Model>> {
        LdapServers::find()
            .order_by_asc(ldap_servers::Column::Name)
            .offset(skip)
            .limit(limit)
            .all(&self.conn)
            .await
            .context("Failed to list LDAP servers")
    }

    pub async fn list_all(&self) -> Result<Vec<ldap_servers::Model>> {
        LdapServers::find()
            .order_by_asc(ldap_servers::Column::Id)
            .all(&self.conn)
            .await
            .context("Failed to list LDAP servers")
    }

    pub async fn get(&self, id: i32) -> Result<Option<ldap_servers::Model>> {
        LdapServers::find_by_id(id)
            .one(&self.conn)
            .await
            .context("Failed to query LDAP server")
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<ldap_servers::Model>> {
        LdapServers::find()
            .filter(ldap_servers::Column::Name.eq(name))
            .one(&self.conn)
            .await
            .context("Failed to query LDAP server by name")
    }

    pub async fn create(&self, server: NewLdapServer) -> Result<ldap_servers::Model> {
        let now = Utc::now();
        let active = ldap_servers::ActiveModel {
            name: Set(server.name),
            host: Set(server.host),
            port: Set(server.port),
            use_ssl: Set(server.use_ssl),
            base_dn: Set(server.base_dn),
            bind_dn: Set(server.bind_dn),
            bind_password: Set(server.bind_password),
            description: Set(server.description),
            is_active: Set(server.is_active),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        active
            .insert(&self.conn)
            .await
            .context("Failed to insert LDAP server")
    }

    pub async fn update(
        &self,
        id: i32,
        update: LdapServerUpdate,
    ) -> Result<Option<ldap_servers::Model>> {
        let Some(server) = self.get(id).await? else {
            return Ok(None);
        };

        let mut active: ldap_servers::ActiveModel = server.into();
        if let Some(name) = update.name {
            active.name = Set(name);
        }
        if let Some(use_ssl) = update.use_ssl {
            active.use_ssl = Set(use_ssl);
        }
        if let Some(bind_dn) = update.bind_dn {
            active.bind_dn = Set(Some(bind_dn));
        }
        if let Some(bind_password) = update.bind_password {
            active.bind_password = Set(Some(bind_password));
        }
        if let Some(description) = update.description {
            active.description = Set(Some(description));
        }
        if let Some(is_active) = update.is_active {
            active.is_active = Set(is_active);
        }
        active.updated_at = Set(Utc::now());

        let model = active
            .update(&self.conn)
            .await
            .context("Failed to update LDAP server")?;

        Ok(Some(model))
    }

    /// Whether any backup or schedule still points at the server.
    pub async fn is_referenced(&self, id: i32) -> Result<bool> {
        let backups = Backups::find()
            .filter(backups::Column::LdapServerId.eq(id))
            .count(&self.conn)
            .await
            .context("Failed to count backups for server")?;
        let schedules = ScheduledBackups::find()
            .filter(scheduled_backups::Column::LdapServerId.eq(id))
            .count(&self.conn)
            .await
            .context("Failed to count schedules for server")?;

        Ok(backups + schedules > 0)
    }

    pub async fn delete(&self, id: i32) -> Result<bool> {
        let result = LdapServers::delete_by_id(id)
            .exec(&self.conn)
            .await
            .context("Failed to delete LDAP server")?;

        Ok(result.rows_affected > 0)
    }
}
