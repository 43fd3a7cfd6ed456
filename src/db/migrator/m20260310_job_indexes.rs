use crate::entities::prelude::*;
use crate::entities::{audit_logs, backups, job_transitions, restore_jobs};
use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Retention and incremental-parent lookups
        manager
            .create_index(
                Index::create()
                    .name("idx_backups_server_status_created")
                    .table(Backups)
                    .col(backups::Column::LdapServerId)
                    .col(backups::Column::Status)
                    .col(backups::Column::CreatedAt)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_restore_jobs_status")
                    .table(RestoreJobs)
                    .col(restore_jobs::Column::Status)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_job_transitions_job")
                    .table(JobTransitions)
                    .col(job_transitions::Column::JobKind)
                    .col(job_transitions::Column::JobId)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_audit_logs_created_at")
                    .table(AuditLogs)
                    .col(audit_logs::Column::CreatedAt)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_audit_logs_created_at")
                    .table(AuditLogs)
                    .to_owned(),
            )
            .await?;
        manager
            .drop_index(
                Index::drop()
                    .name("idx_job_transitions_job")
                    .table(JobTransitions)
                    .to_owned(),
            )
            .await?;
        manager
            .drop_index(
                Index::drop()
                    .name("idx_restore_jobs_status")
                    .table(RestoreJobs)
                    .to_owned(),
            )
            .await?;
        manager
            .drop_index(
                Index::drop()
                    .name("idx_backups_server_status_created")
                    .table(Backups)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }
}
