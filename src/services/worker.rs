//! Job queue and worker pool.
//!
//! The queue is only a hint: workers claim through the ledger, so a job that
//! is enqueued twice, or picked up by the poller while already queued, is
//! still executed once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::JobsConfig;
use crate::db::Store;
use crate::domain::{JobKind, JobStatus};
use crate::services::backup_engine::{BackupEngine, BackupError};
use crate::services::ledger::{JobLedger, LedgerError};
use crate::services::restore_engine::{RestoreEngine, RestoreError};
use crate::services::retention::RetentionService;

pub type QueuedJob = (JobKind, i32);

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<QueuedJob>,
}

impl JobQueue {
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<QueuedJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Returns false when the job was not queued; the poller will find it.
    pub fn enqueue(&self, kind: JobKind, id: i32) -> bool {
        match self.tx.try_send((kind, id)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(job_kind = %kind, job_id = id, "Job queue full, leaving job to the poller");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(job_kind = %kind, job_id = id, "Job queue closed");
                false
            }
        }
    }
}

#[derive(Clone)]
pub struct JobRunner {
    store: Store,
    ledger: JobLedger,
    backups: BackupEngine,
    restores: RestoreEngine,
    retention: RetentionService,
}

impl JobRunner {
    #[must_use]
    pub const fn new(
        store: Store,
        ledger: JobLedger,
        backups: BackupEngine,
        restores: RestoreEngine,
        retention: RetentionService,
    ) -> Self {
        Self {
            store,
            ledger,
            backups,
            restores,
            retention,
        }
    }

    pub async fn execute(&self, kind: JobKind, id: i32) {
        match kind {
            JobKind::Backup => self.execute_backup(id).await,
            JobKind::Restore => self.execute_restore(id).await,
        }
    }

    async fn execute_backup(&self, id: i32) {
        let backup = match self.backups.run(id).await {
            Ok(backup) => backup,
            Err(BackupError::Ledger(LedgerError::InvalidTransition { actual, .. })) => {
                debug!(job_id = id, status = %actual, "Backup already claimed");
                return;
            }
            Err(e) => {
                error!(
                    event = "job_failed",
                    job_kind = "backup",
                    job_id = id,
                    error = %e,
                    "Backup could not be run"
                );
                return;
            }
        };

        if backup.status != JobStatus::Completed.as_str() {
            return;
        }
        let Some(schedule_id) = backup.scheduled_backup_id else {
            return;
        };

        match self.store.schedules().get(schedule_id).await {
            Ok(Some(schedule)) => {
                if let Err(e) = self
                    .retention
                    .enforce(backup.ldap_server_id, schedule.retention_days)
                    .await
                {
                    error!(schedule_id, error = %e, "Retention after scheduled backup failed");
                }
            }
            Ok(None) => {}
            Err(e) => error!(schedule_id, error = %e, "Failed to load schedule for retention"),
        }
    }

    async fn execute_restore(&self, id: i32) {
        match self.restores.run(id).await {
            Ok(_) => {}
            Err(RestoreError::Ledger(LedgerError::InvalidTransition { actual, .. })) => {
                debug!(job_id = id, status = %actual, "Restore already claimed");
            }
            Err(e) => {
                error!(
                    event = "job_failed",
                    job_kind = "restore",
                    job_id = id,
                    error = %e,
                    "Restore could not be run"
                );
            }
        }
    }

    /// Fails jobs left running by a previous process.
    pub async fn recover(&self, stale_after_minutes: i64) -> Result<usize, LedgerError> {
        let recovered = self
            .ledger
            .recover_stale(chrono::Duration::minutes(stale_after_minutes.max(0)))
            .await?;
        if recovered > 0 {
            warn!(recovered, "Recovered stale jobs from a previous run");
        }
        Ok(recovered)
    }

    /// Queues every pending job.
    pub async fn requeue_pending(
        &self,
        queue: &JobQueue,
        limit: u64,
    ) -> Result<usize, LedgerError> {
        let mut queued = 0;
        for kind in [JobKind::Backup, JobKind::Restore] {
            for id in self.ledger.pending_ids(kind, limit).await? {
                if queue.enqueue(kind, id) {
                    queued += 1;
                }
            }
        }
        Ok(queued)
    }
}

pub struct WorkerPool {
    runner: JobRunner,
    queue: JobQueue,
    config: JobsConfig,
    running: Arc<RwLock<bool>>,
}

impl WorkerPool {
    #[must_use]
    pub fn new(runner: JobRunner, queue: JobQueue, config: JobsConfig) -> Self {
        Self {
            runner,
            queue,
            config,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Runs recovery, then spawns the workers and the pending-job poller.
    pub async fn start(
        &self,
        rx: mpsc::Receiver<QueuedJob>,
    ) -> anyhow::Result<Vec<JoinHandle<()>>> {
        *self.running.write().await = true;

        self.runner.recover(self.config.stale_after_minutes).await?;

        let rx = Arc::new(Mutex::new(rx));
        let mut handles = Vec::with_capacity(self.config.workers + 1);

        for worker in 0..self.config.workers.max(1) {
            let rx = Arc::clone(&rx);
            let runner = self.runner.clone();
            let running = Arc::clone(&self.running);
            handles.push(tokio::spawn(async move {
                debug!(worker, "Job worker started");
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some((kind, id)) = next else { break };
                    if !*running.read().await {
                        break;
                    }
                    runner.execute(kind, id).await;
                }
                debug!(worker, "Job worker stopped");
            }));
        }

        let runner = self.runner.clone();
        let queue = self.queue.clone();
        let running = Arc::clone(&self.running);
        let limit = u64::try_from(self.config.queue_capacity).unwrap_or(u64::MAX);
        let poll = Duration::from_secs(self.config.poll_interval_seconds.max(1));
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll);
            loop {
                interval.tick().await;
                if !*running.read().await {
                    break;
                }
                if let Err(e) = runner.requeue_pending(&queue, limit).await {
                    warn!(error = %e, "Pending job poll failed");
                }
            }
        }));

        info!(workers = self.config.workers.max(1), "Worker pool started");
        Ok(handles)
    }

    pub async fn stop(&self) {
        info!("Stopping worker pool...");
        *self.running.write().await = false;
    }
}
