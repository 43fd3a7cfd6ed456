//! Job ledger: the durable record of backup and restore jobs.
//!
//! The conditional [`JobLedger::transition`] is the only mutual-exclusion
//! primitive between workers. A worker owns a job once it has moved it from
//! `pending` to `in_progress`; everyone else racing for it gets
//! [`LedgerError::InvalidTransition`].

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info};

use crate::db::repositories::backup::BackupFilter;
use crate::db::repositories::ledger::{NewBackupJob, NewRestoreJob, TransitionPatch};
use crate::db::repositories::restore::RestoreFilter;
use crate::db::{Backup, JobTransition, RestoreJob, Store};
use crate::domain::{JobKind, JobStatus};

pub const CANCELLED: &str = "cancelled";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("{kind} job {id} not found")]
    NotFound { kind: JobKind, id: i32 },

    #[error("{kind} job {id} cannot move from {from} to {to} (currently {actual})")]
    InvalidTransition {
        kind: JobKind,
        id: i32,
        from: JobStatus,
        to: JobStatus,
        actual: String,
    },

    #[error(transparent)]
    Database(#[from] anyhow::Error),
}

impl LedgerError {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NotFound",
            Self::InvalidTransition { .. } => "InvalidTransition",
            Self::Database(_) => "Internal",
        }
    }
}

#[derive(Clone)]
pub struct JobLedger {
    store: Store,
}

impl JobLedger {
    #[must_use]
    pub const fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn create_backup(&self, job: NewBackupJob) -> Result<Backup, LedgerError> {
        let backup = self.store.ledger().create_backup(job).await?;
        debug!(job_kind = "backup", job_id = backup.id, "Job created");
        Ok(backup)
    }

    pub async fn create_restore(&self, job: NewRestoreJob) -> Result<RestoreJob, LedgerError> {
        let restore = self.store.ledger().create_restore(job).await?;
        debug!(job_kind = "restore", job_id = restore.id, "Job created");
        Ok(restore)
    }

    /// Compare-and-swap on the job status. Fails with `InvalidTransition`
    /// when the edge is illegal or the job is no longer in `from`.
    pub async fn transition(
        &self,
        kind: JobKind,
        id: i32,
        from: JobStatus,
        to: JobStatus,
        reason: Option<&str>,
        patch: TransitionPatch,
    ) -> Result<(), LedgerError> {
        if !from.can_transition_to(to) {
            let actual = self.status_string(kind, id).await?;
            return Err(LedgerError::InvalidTransition {
                kind,
                id,
                from,
                to,
                actual,
            });
        }

        let applied = self
            .store
            .ledger()
            .transition(kind, id, from, to, reason, &patch)
            .await?;

        if !applied {
            let actual = self.status_string(kind, id).await?;
            return Err(LedgerError::InvalidTransition {
                kind,
                id,
                from,
                to,
                actual,
            });
        }

        debug!(job_kind = %kind, job_id = id, from = %from, to = %to, "Job transition");
        Ok(())
    }

    /// Attempts to take ownership of a pending job.
    pub async fn claim(&self, kind: JobKind, id: i32) -> Result<bool, LedgerError> {
        match self
            .transition(
                kind,
                id,
                JobStatus::Pending,
                JobStatus::InProgress,
                Some("claimed"),
                TransitionPatch::default(),
            )
            .await
        {
            Ok(()) => Ok(true),
            Err(LedgerError::InvalidTransition { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn status_string(&self, kind: JobKind, id: i32) -> Result<String, LedgerError> {
        self.store
            .ledger()
            .current_status(kind, id)
            .await?
            .ok_or(LedgerError::NotFound { kind, id })
    }

    pub async fn status(&self, kind: JobKind, id: i32) -> Result<JobStatus, LedgerError> {
        let raw = self.status_string(kind, id).await?;
        raw.parse()
            .map_err(|e: String| LedgerError::Database(anyhow::anyhow!(e)))
    }

    pub async fn is_cancelling(&self, kind: JobKind, id: i32) -> Result<bool, LedgerError> {
        Ok(self.status(kind, id).await? == JobStatus::Cancelling)
    }

    pub async fn get_backup(&self, id: i32) -> Result<Backup, LedgerError> {
        self.store
            .backups()
            .get(id)
            .await?
            .ok_or(LedgerError::NotFound {
                kind: JobKind::Backup,
                id,
            })
    }

    pub async fn get_restore(&self, id: i32) -> Result<RestoreJob, LedgerError> {
        self.store
            .restores()
            .get(id)
            .await?
            .ok_or(LedgerError::NotFound {
                kind: JobKind::Restore,
                id,
            })
    }

    pub async fn list_backups(
        &self,
        filter: &BackupFilter,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<Backup>, LedgerError> {
        Ok(self.store.backups().list(filter, skip, limit).await?)
    }

    pub async fn list_restores(
        &self,
        filter: &RestoreFilter,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<RestoreJob>, LedgerError> {
        Ok(self.store.restores().list(filter, skip, limit).await?)
    }

    pub async fn transitions(
        &self,
        kind: JobKind,
        id: i32,
    ) -> Result<Vec<JobTransition>, LedgerError> {
        // Distinguish "no such job" from "no history".
        self.status_string(kind, id).await?;
        Ok(self.store.ledger().transitions(kind, id).await?)
    }

    /// Pending jobs fail immediately; running jobs are flagged and stop at
    /// their next checkpoint. Returns the status the job was moved to.
    pub async fn cancel(&self, kind: JobKind, id: i32) -> Result<JobStatus, LedgerError> {
        // A pending job can be claimed between our read and our write; one
        // retry with the fresh status settles it.
        for _ in 0..2 {
            let current = self.status(kind, id).await?;
            let (to, patch) = match current {
                JobStatus::Pending => (
                    JobStatus::Failed,
                    TransitionPatch::error("Cancelled: cancelled before start"),
                ),
                JobStatus::InProgress => (JobStatus::Cancelling, TransitionPatch::default()),
                JobStatus::Cancelling => return Ok(JobStatus::Cancelling),
                JobStatus::Completed | JobStatus::Failed => {
                    return Err(LedgerError::InvalidTransition {
                        kind,
                        id,
                        from: current,
                        to: JobStatus::Cancelling,
                        actual: current.to_string(),
                    });
                }
            };

            match self
                .transition(kind, id, current, to, Some(CANCELLED), patch)
                .await
            {
                Ok(()) => {
                    info!(
                        job_kind = %kind,
                        job_id = id,
                        status = %to,
                        "Job cancellation requested"
                    );
                    return Ok(to);
                }
                Err(LedgerError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let actual = self.status(kind, id).await?;
        Err(LedgerError::InvalidTransition {
            kind,
            id,
            from: actual,
            to: JobStatus::Cancelling,
            actual: actual.to_string(),
        })
    }

    /// Fails jobs left running by a previous process. Returns how many were
    /// recovered.
    pub async fn recover_stale(&self, stale_after: chrono::Duration) -> Result<usize, LedgerError> {
        let cutoff = Utc::now() - stale_after;
        let mut recovered = 0;

        for kind in [JobKind::Backup, JobKind::Restore] {
            for status in [JobStatus::InProgress, JobStatus::Cancelling] {
                for id in self.store.ledger().stale(kind, status, cutoff).await? {
                    let result = self
                        .transition(
                            kind,
                            id,
                            status,
                            JobStatus::Failed,
                            Some("recovery"),
                            TransitionPatch::error(
                                "Interrupted: stale job recovered at startup",
                            ),
                        )
                        .await;
                    match result {
                        Ok(()) => {
                            info!(
                                event = "job_recovered",
                                job_kind = %kind,
                                job_id = id,
                                "Recovered stale job"
                            );
                            recovered += 1;
                        }
                        // Finished on its own in the meantime.
                        Err(LedgerError::InvalidTransition { .. }) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        Ok(recovered)
    }

    pub async fn pending_ids(&self, kind: JobKind, limit: u64) -> Result<Vec<i32>, LedgerError> {
        Ok(self
            .store
            .ledger()
            .ids_with_status(kind, JobStatus::Pending, limit)
            .await?)
    }
}
