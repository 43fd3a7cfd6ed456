use anyhow::{Context, Result};
use chrono::Utc;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
    sea_query::Expr,
};

use crate::domain::JobStatus;
use crate::entities::{prelude::*, restore_jobs};

#[derive(Debug, Clone, Default)]
pub struct RestoreFilter {
    pub backup_id: Option<i32>,
    pub ldap_server_id: Option<i32>,
    pub status: Option<String>,
}

/// Running totals of a restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreCounts {
    pub restored: i64,
    pub skipped: i64,
    pub failed: i64,
}

pub struct RestoreRepository {
    conn: DatabaseConnection,
}

impl RestoreRepository {
    #[must_use]
    pub const fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    pub async fn get(&self, id: i32) -> Result<Option<restore_jobs::Model>> {
        RestoreJobs::find_by_id(id)
            .one(&self.conn)
            .await
            .context("Failed to query restore job")
    }

    pub async fn list(
        &self,
        filter: &RestoreFilter,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<restore_jobs::Model>> {
        let mut query = RestoreJobs::find()
            .order_by_desc(restore_jobs::Column::CreatedAt)
            .order_by_desc(restore_jobs::Column::Id);

        if let Some(backup_id) = filter.backup_id {
            query = query.filter(restore_jobs::Column::BackupId.eq(backup_id));
        }
        if let Some(server_id) = filter.ldap_server_id {
            query = query.filter(restore_jobs::Column::LdapServerId.eq(server_id));
        }
        if let Some(status) = &filter.status {
            query = query.filter(restore_jobs::Column::Status.eq(status.as_str()));
        }

        query
            .offset(skip)
            .limit(limit)
            .all(&self.conn)
            .await
            .context("Failed to list restore jobs")
    }

    /// Publishes partial progress while the job is still running.
    pub async fn update_progress(&self, id: i32, counts: RestoreCounts) -> Result<()> {
        RestoreJobs::update_many()
            .col_expr(restore_jobs::Column::EntriesRestored, Expr::value(counts.restored))
            .col_expr(restore_jobs::Column::EntriesSkipped, Expr::value(counts.skipped))
            .col_expr(restore_jobs::Column::EntriesFailed, Expr::value(counts.failed))
            .col_expr(restore_jobs::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(restore_jobs::Column::Id.eq(id))
            .filter(restore_jobs::Column::Status.is_in([
                JobStatus::InProgress.as_str(),
                JobStatus::Cancelling.as_str(),
            ]))
            .exec(&self.conn)
            .await
            .context("Failed to update restore progress")?;

        Ok(())
    }
}
