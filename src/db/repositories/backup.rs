use anyhow::{Context, Result};
use chrono::Utc;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, sea_query::Expr,
};

use crate::domain::JobStatus;
use crate::entities::{backups, prelude::*};

#[derive(Debug, Clone, Default)]
pub struct BackupFilter {
    pub ldap_server_id: Option<i32>,
    pub status: Option<String>,
    pub backup_type: Option<String>,
}

pub struct BackupRepository {
    conn: DatabaseConnection,
}

impl BackupRepository {
    #[must_use]
    pub const fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    pub async fn get(&self, id: i32) -> Result<Option<backups::Model>> {
        Backups::find_by_id(id)
            .one(&self.conn)
            .await
            .context("Failed to query backup")
    }

    pub async fn get_many(&self, ids: &[i32]) -> Result<Vec<backups::Model>> {
        Backups::find()
            .filter(backups::Column::Id.is_in(ids.iter().copied()))
            .order_by_asc(backups::Column::Id)
            .all(&self.conn)
            .await
            .context("Failed to query backups by id")
    }

    pub async fn list(
        &self,
        filter: &BackupFilter,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<backups::Model>> {
        let mut query = Backups::find()
            .order_by_desc(backups::Column::CreatedAt)
            .order_by_desc(backups::Column::Id);

        if let Some(server_id) = filter.ldap_server_id {
            query = query.filter(backups::Column::LdapServerId.eq(server_id));
        }
        if let Some(status) = &filter.status {
            query = query.filter(backups::Column::Status.eq(status.as_str()));
        }
        if let Some(backup_type) = &filter.backup_type {
            query = query.filter(backups::Column::BackupType.eq(backup_type.as_str()));
        }

        query
            .offset(skip)
            .limit(limit)
            .all(&self.conn)
            .await
            .context("Failed to list backups")
    }

    /// Newest completed backup for a server, the base for an incremental.
    pub async fn latest_completed(&self, ldap_server_id: i32) -> Result<Option<backups::Model>> {
        Backups::find()
            .filter(backups::Column::LdapServerId.eq(ldap_server_id))
            .filter(backups::Column::Status.eq(JobStatus::Completed.as_str()))
            .order_by_desc(backups::Column::StartedAt)
            .order_by_desc(backups::Column::Id)
            .one(&self.conn)
            .await
            .context("Failed to query latest completed backup")
    }

    /// Completed backups for a server, oldest first.
    pub async fn completed_for_server(&self, ldap_server_id: i32) -> Result<Vec<backups::Model>> {
        Backups::find()
            .filter(backups::Column::LdapServerId.eq(ldap_server_id))
            .filter(backups::Column::Status.eq(JobStatus::Completed.as_str()))
            .order_by_asc(backups::Column::CreatedAt)
            .order_by_asc(backups::Column::Id)
            .all(&self.conn)
            .await
            .context("Failed to list completed backups")
    }

    pub async fn count_completed_for_server(&self, ldap_server_id: i32) -> Result<u64> {
        Backups::find()
            .filter(backups::Column::LdapServerId.eq(ldap_server_id))
            .filter(backups::Column::Status.eq(JobStatus::Completed.as_str()))
            .count(&self.conn)
            .await
            .context("Failed to count completed backups")
    }

    /// Whether a run started by the schedule has not reached a terminal state yet.
    pub async fn has_outstanding_for_schedule(&self, scheduled_backup_id: i32) -> Result<bool> {
        let count = Backups::find()
            .filter(backups::Column::ScheduledBackupId.eq(scheduled_backup_id))
            .filter(backups::Column::Status.is_in([
                JobStatus::Pending.as_str(),
                JobStatus::InProgress.as_str(),
                JobStatus::Cancelling.as_str(),
            ]))
            .count(&self.conn)
            .await
            .context("Failed to count outstanding scheduled backups")?;

        Ok(count > 0)
    }

    pub async fn has_any_for_schedule(&self, scheduled_backup_id: i32) -> Result<bool> {
        let count = Backups::find()
            .filter(backups::Column::ScheduledBackupId.eq(scheduled_backup_id))
            .count(&self.conn)
            .await
            .context("Failed to count scheduled backups")?;

        Ok(count > 0)
    }

    /// Records the type actually performed and its parent. Only rows still in
    /// progress are touched.
    pub async fn set_plan(
        &self,
        id: i32,
        backup_type: &str,
        parent_backup_id: Option<i32>,
    ) -> Result<()> {
        Backups::update_many()
            .col_expr(backups::Column::BackupType, Expr::value(backup_type))
            .col_expr(backups::Column::ParentBackupId, Expr::value(parent_backup_id))
            .col_expr(backups::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(backups::Column::Id.eq(id))
            .filter(backups::Column::Status.eq(JobStatus::InProgress.as_str()))
            .exec(&self.conn)
            .await
            .context("Failed to record backup plan")?;

        Ok(())
    }

    /// Marks a running job as alive so recovery sweeps leave it alone.
    pub async fn touch(&self, id: i32) -> Result<()> {
        Backups::update_many()
            .col_expr(backups::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(backups::Column::Id.eq(id))
            .filter(backups::Column::Status.is_in([
                JobStatus::InProgress.as_str(),
                JobStatus::Cancelling.as_str(),
            ]))
            .exec(&self.conn)
            .await
            .context("Failed to record backup progress")?;

        Ok(())
    }

    /// Removes the row only; the caller owns the artifact file.
    pub async fn delete(&self, id: i32) -> Result<bool> {
        let result = Backups::delete_by_id(id)
            .exec(&self.conn)
            .await
            .context("Failed to delete backup")?;

        Ok(result.rows_affected > 0)
    }
}
