use anyhow::{Context, Result};
use chrono::Utc;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};

use crate::entities::{audit_logs, prelude::*};

#[derive(Debug, Clone, Default)]
pub struct NewAuditLog {
    pub user_id: Option<i32>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub details: Option<serde_json::Value>,
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub action: Option<String>,
    pub resource_type: Option<String>,
    pub user_id: Option<i32>,
}

/// Append-only: there is no update or delete.
pub struct AuditRepository {
    conn: DatabaseConnection,
}

impl AuditRepository {
    #[must_use]
    pub const fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    pub async fn add(&self, entry: NewAuditLog) -> Result<()> {
        let active_model = audit_logs::ActiveModel {
            user_id: Set(entry.user_id),
            action: Set(entry.action),
            resource_type: Set(entry.resource_type),
            resource_id: Set(entry.resource_id),
            details: Set(entry.details.map(|d| d.to_string())),
            ip_address: Set(entry.ip_address),
            created_at: Set(Utc::now()),
            ..Default::default()
        };

        AuditLogs::insert(active_model)
            .exec(&self.conn)
            .await
            .context("Failed to insert audit log")?;
        Ok(())
    }

    pub async fn list(
        &self,
        filter: &AuditFilter,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<audit_logs::Model>> {
        let mut query = AuditLogs::find()
            .order_by_desc(audit_logs::Column::CreatedAt)
            .order_by_desc(audit_logs::Column::Id);

        if let Some(action) = &filter.action {
            query = query.filter(audit_logs::Column::Action.eq(action.as_str()));
        }
        if let Some(resource_type) = &filter.resource_type {
            query = query.filter(audit_logs::Column::ResourceType.eq(resource_type.as_str()));
        }
        if let Some(user_id) = filter.user_id {
            query = query.filter(audit_logs::Column::UserId.eq(user_id));
        }

        query
            .offset(skip)
            .limit(limit)
            .all(&self.conn)
            .await
            .context("Failed to list audit logs")
    }

    pub async fn get(&self, id: i64) -> Result<Option<audit_logs::Model>> {
        AuditLogs::find_by_id(id)
            .one(&self.conn)
            .await
            .context("Failed to query audit log")
    }
}
