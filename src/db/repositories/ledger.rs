//! Status projection and transition log for backup and restore jobs.
//!
//! Every status change is a conditional `UPDATE ... WHERE status = <from>`
//! followed by an insert into `job_transitions`, both inside one
//! transaction. The update runs first so SQLite takes the write lock before
//! anything is read, which lets concurrent claimers queue on the busy
//! handler instead of failing.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait, sea_query::Expr,
};

use crate::db::repositories::restore::RestoreCounts;
use crate::domain::{JobKind, JobStatus};
use crate::entities::{backups, job_transitions, prelude::*, restore_jobs};

#[derive(Debug, Clone)]
pub struct NewBackupJob {
    pub ldap_server_id: i32,
    pub backup_type: String,
    pub encrypted: bool,
    pub compression_enabled: bool,
    pub scheduled_backup_id: Option<i32>,
    pub created_by: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct NewRestoreJob {
    pub backup_id: i32,
    pub ldap_server_id: i32,
    pub selective_restore: bool,
    pub restore_filter: Option<String>,
    pub point_in_time: Option<DateTime<Utc>>,
    pub created_by: Option<i32>,
}

/// Where a finished artifact landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactInfo {
    pub file_path: String,
    pub file_size: i64,
    pub entry_count: i64,
    pub checksum: String,
}

/// Columns written together with a status change.
#[derive(Debug, Clone, Default)]
pub struct TransitionPatch {
    pub error_message: Option<String>,
    pub artifact: Option<ArtifactInfo>,
    pub counts: Option<RestoreCounts>,
}

impl TransitionPatch {
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::default()
        }
    }
}

pub struct LedgerRepository {
    conn: DatabaseConnection,
}

impl LedgerRepository {
    #[must_use]
    pub const fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    pub async fn create_backup(&self, job: NewBackupJob) -> Result<backups::Model> {
        let now = Utc::now();
        let txn = self.conn.begin().await.context("Failed to begin transaction")?;

        let model = backups::ActiveModel {
            ldap_server_id: Set(job.ldap_server_id),
            backup_type: Set(job.backup_type),
            status: Set(JobStatus::Pending.as_str().to_string()),
            encrypted: Set(job.encrypted),
            compression_enabled: Set(job.compression_enabled),
            scheduled_backup_id: Set(job.scheduled_backup_id),
            created_by: Set(job.created_by),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await
        .context("Failed to insert backup job")?;

        record(&txn, JobKind::Backup, model.id, None, JobStatus::Pending, Some("created")).await?;
        txn.commit().await.context("Failed to commit backup job")?;

        Ok(model)
    }

    pub async fn create_restore(&self, job: NewRestoreJob) -> Result<restore_jobs::Model> {
        let now = Utc::now();
        let txn = self.conn.begin().await.context("Failed to begin transaction")?;

        let model = restore_jobs::ActiveModel {
            backup_id: Set(job.backup_id),
            ldap_server_id: Set(job.ldap_server_id),
            status: Set(JobStatus::Pending.as_str().to_string()),
            selective_restore: Set(job.selective_restore),
            restore_filter: Set(job.restore_filter),
            point_in_time: Set(job.point_in_time),
            entries_restored: Set(0),
            entries_skipped: Set(0),
            entries_failed: Set(0),
            created_by: Set(job.created_by),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await
        .context("Failed to insert restore job")?;

        record(&txn, JobKind::Restore, model.id, None, JobStatus::Pending, Some("created")).await?;
        txn.commit().await.context("Failed to commit restore job")?;

        Ok(model)
    }

    /// Moves a job from `from` to `to`. Returns `false` when the row was not
    /// in `from` (or does not exist); nothing is written in that case.
    pub async fn transition(
        &self,
        kind: JobKind,
        id: i32,
        from: JobStatus,
        to: JobStatus,
        reason: Option<&str>,
        patch: &TransitionPatch,
    ) -> Result<bool> {
        let now = Utc::now();
        let txn = self.conn.begin().await.context("Failed to begin transaction")?;

        let rows = match kind {
            JobKind::Backup => {
                let mut update = Backups::update_many()
                    .col_expr(backups::Column::Status, Expr::value(to.as_str()))
                    .col_expr(backups::Column::UpdatedAt, Expr::value(now));
                if to == JobStatus::InProgress {
                    update = update.col_expr(backups::Column::StartedAt, Expr::value(now));
                }
                if to.is_terminal() {
                    update = update.col_expr(backups::Column::CompletedAt, Expr::value(now));
                }
                if let Some(message) = &patch.error_message {
                    update = update
                        .col_expr(backups::Column::ErrorMessage, Expr::value(message.as_str()));
                }
                if let Some(artifact) = &patch.artifact {
                    update = update
                        .col_expr(
                            backups::Column::FilePath,
                            Expr::value(artifact.file_path.as_str()),
                        )
                        .col_expr(backups::Column::FileSize, Expr::value(artifact.file_size))
                        .col_expr(backups::Column::EntryCount, Expr::value(artifact.entry_count))
                        .col_expr(
                            backups::Column::Checksum,
                            Expr::value(artifact.checksum.as_str()),
                        );
                }
                update
                    .filter(backups::Column::Id.eq(id))
                    .filter(backups::Column::Status.eq(from.as_str()))
                    .exec(&txn)
                    .await
                    .context("Failed to update backup status")?
                    .rows_affected
            }
            JobKind::Restore => {
                let mut update = RestoreJobs::update_many()
                    .col_expr(restore_jobs::Column::Status, Expr::value(to.as_str()))
                    .col_expr(restore_jobs::Column::UpdatedAt, Expr::value(now));
                if to == JobStatus::InProgress {
                    update = update.col_expr(restore_jobs::Column::StartedAt, Expr::value(now));
                }
                if to.is_terminal() {
                    update = update.col_expr(restore_jobs::Column::CompletedAt, Expr::value(now));
                }
                if let Some(message) = &patch.error_message {
                    update = update.col_expr(
                        restore_jobs::Column::ErrorMessage,
                        Expr::value(message.as_str()),
                    );
                }
                if let Some(counts) = patch.counts {
                    update = update
                        .col_expr(
                            restore_jobs::Column::EntriesRestored,
                            Expr::value(counts.restored),
                        )
                        .col_expr(
                            restore_jobs::Column::EntriesSkipped,
                            Expr::value(counts.skipped),
                        )
                        .col_expr(restore_jobs::Column::EntriesFailed, Expr::value(counts.failed));
                }
                update
                    .filter(restore_jobs::Column::Id.eq(id))
                    .filter(restore_jobs::Column::Status.eq(from.as_str()))
                    .exec(&txn)
                    .await
                    .context("Failed to update restore status")?
                    .rows_affected
            }
        };

        if rows == 0 {
            txn.rollback().await.context("Failed to roll back transition")?;
            return Ok(false);
        }

        record(&txn, kind, id, Some(from), to, reason).await?;
        txn.commit().await.context("Failed to commit transition")?;

        Ok(true)
    }

    pub async fn current_status(&self, kind: JobKind, id: i32) -> Result<Option<String>> {
        let status = match kind {
            JobKind::Backup => Backups::find_by_id(id)
                .one(&self.conn)
                .await
                .context("Failed to query backup status")?
                .map(|b| b.status),
            JobKind::Restore => RestoreJobs::find_by_id(id)
                .one(&self.conn)
                .await
                .context("Failed to query restore status")?
                .map(|r| r.status),
        };
        Ok(status)
    }

    pub async fn transitions(&self, kind: JobKind, id: i32) -> Result<Vec<job_transitions::Model>> {
        JobTransitions::find()
            .filter(job_transitions::Column::JobKind.eq(kind.as_str()))
            .filter(job_transitions::Column::JobId.eq(id))
            .order_by_asc(job_transitions::Column::Id)
            .all(&self.conn)
            .await
            .context("Failed to list job transitions")
    }

    /// Ids of jobs currently in `status`, oldest first.
    pub async fn ids_with_status(
        &self,
        kind: JobKind,
        status: JobStatus,
        limit: u64,
    ) -> Result<Vec<i32>> {
        let ids = match kind {
            JobKind::Backup => Backups::find()
                .select_only()
                .column(backups::Column::Id)
                .filter(backups::Column::Status.eq(status.as_str()))
                .order_by_asc(backups::Column::Id)
                .limit(limit)
                .into_tuple::<i32>()
                .all(&self.conn)
                .await,
            JobKind::Restore => RestoreJobs::find()
                .select_only()
                .column(restore_jobs::Column::Id)
                .filter(restore_jobs::Column::Status.eq(status.as_str()))
                .order_by_asc(restore_jobs::Column::Id)
                .limit(limit)
                .into_tuple::<i32>()
                .all(&self.conn)
                .await,
        };
        ids.context("Failed to list jobs by status")
    }

    /// Jobs in `status` not updated since `before`.
    pub async fn stale(
        &self,
        kind: JobKind,
        status: JobStatus,
        before: DateTime<Utc>,
    ) -> Result<Vec<i32>> {
        let ids = match kind {
            JobKind::Backup => Backups::find()
                .select_only()
                .column(backups::Column::Id)
                .filter(backups::Column::Status.eq(status.as_str()))
                .filter(backups::Column::UpdatedAt.lt(before))
                .into_tuple::<i32>()
                .all(&self.conn)
                .await,
            JobKind::Restore => RestoreJobs::find()
                .select_only()
                .column(restore_jobs::Column::Id)
                .filter(restore_jobs::Column::Status.eq(status.as_str()))
                .filter(restore_jobs::Column::UpdatedAt.lt(before))
                .into_tuple::<i32>()
                .all(&self.conn)
                .await,
        };
        ids.context("Failed to list stale jobs")
    }
}

async fn record(
    txn: &DatabaseTransaction,
    kind: JobKind,
    id: i32,
    from: Option<JobStatus>,
    to: JobStatus,
    reason: Option<&str>,
) -> Result<()> {
    job_transitions::ActiveModel {
        job_kind: Set(kind.as_str().to_string()),
        job_id: Set(id),
        from_status: Set(from.map(|s| s.as_str().to_string())),
        to_status: Set(to.as_str().to_string()),
        reason: Set(reason.map(ToString::to_string)),
        created_at: Set(Utc::now()),
        ..Default::default()
    }
    .insert(txn)
    .await
    .context("Failed to record job transition")?;

    Ok(())
}
