use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{RwLock, broadcast};
use tokio::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::SchedulerConfig;
use crate::db::repositories::audit::NewAuditLog;
use crate::db::{Backup, ScheduledBackup, Store};
use crate::domain::events::JobEvent;
use crate::domain::{BackupType, JobKind};
use crate::parser::cron::CronSchedule;
use crate::services::backup_engine::{BackupEngine, BackupError, BackupRequest};
use crate::services::retention::RetentionService;
use crate::services::worker::JobQueue;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("scheduled backup {0} not found")]
    NotFound(i32),

    #[error("invalid cron expression: {0}")]
    ScheduleInvalid(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ScheduleError {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::ScheduleInvalid(_) => "ScheduleInvalid",
            Self::Validation(_) => "Validation",
            Self::Conflict(_) => "Conflict",
            Self::Backup(e) => e.kind(),
            Self::Internal(_) => "Internal",
        }
    }
}

/// Parses a schedule's cron expression, mapping failures to `ScheduleInvalid`.
pub fn parse_cron(expr: &str) -> Result<CronSchedule, ScheduleError> {
    CronSchedule::parse(expr).map_err(|e| ScheduleError::ScheduleInvalid(e.to_string()))
}

/// First fire time strictly after `now`, or `None` for inactive schedules.
pub fn next_run(
    expr: &str,
    is_active: bool,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let cron = parse_cron(expr)?;
    Ok(if is_active { cron.next_after(now) } else { None })
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub enqueued: usize,
    pub missed: usize,
    pub skipped: usize,
}

/// Turns due schedules into backup jobs.
#[derive(Clone)]
pub struct ScheduleRunner {
    store: Store,
    backups: BackupEngine,
    queue: JobQueue,
    events: broadcast::Sender<JobEvent>,
}

impl ScheduleRunner {
    #[must_use]
    pub const fn new(
        store: Store,
        backups: BackupEngine,
        queue: JobQueue,
        events: broadcast::Sender<JobEvent>,
    ) -> Self {
        Self {
            store,
            backups,
            queue,
            events,
        }
    }

    /// Handles every schedule whose `next_run_at` has passed. A schedule
    /// whose previous run has not finished records a missed run instead of
    /// queueing a second one. Either way its timeline moves forward.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickSummary> {
        let mut summary = TickSummary::default();

        for schedule in self.store.schedules().due(now).await? {
            let next = match CronSchedule::parse(&schedule.cron_expression) {
                Ok(cron) => cron.next_after(now),
                Err(e) => {
                    warn!(
                        schedule_id = schedule.id,
                        error = %e,
                        "Schedule has an invalid cron expression, disabling its timeline"
                    );
                    None
                }
            };

            if self
                .store
                .backups()
                .has_outstanding_for_schedule(schedule.id)
                .await?
            {
                self.record_missed_run(&schedule).await?;
                summary.missed += 1;
            } else {
                match self.enqueue(&schedule).await {
                    Ok(_) => summary.enqueued += 1,
                    Err(
                        BackupError::ServerUnavailable(msg)
                        | BackupError::ConnectorAuthFailed(msg),
                    ) => {
                        warn!(
                            schedule_id = schedule.id,
                            reason = %msg,
                            "Skipping scheduled backup"
                        );
                        summary.skipped += 1;
                    }
                    Err(BackupError::ServerNotFound(id)) => {
                        warn!(
                            schedule_id = schedule.id,
                            ldap_server_id = id,
                            "Skipping scheduled backup, server is gone"
                        );
                        summary.skipped += 1;
                    }
                    Err(e) => return Err(anyhow::Error::new(e)),
                }
            }

            self.store.schedules().mark_run(schedule.id, now, next).await?;
        }

        Ok(summary)
    }

    /// Immediate run requested through the API.
    pub async fn run_now(
        &self,
        schedule_id: i32,
        created_by: Option<i32>,
    ) -> Result<Backup, ScheduleError> {
        let schedule = self
            .store
            .schedules()
            .get(schedule_id)
            .await?
            .ok_or(ScheduleError::NotFound(schedule_id))?;

        if self
            .store
            .backups()
            .has_outstanding_for_schedule(schedule.id)
            .await?
        {
            return Err(ScheduleError::Conflict(format!(
                "scheduled backup '{}' already has a run in progress",
                schedule.name
            )));
        }

        let backup = self.request(&schedule, created_by).await?;
        self.queue.enqueue(JobKind::Backup, backup.id);
        Ok(backup)
    }

    async fn enqueue(&self, schedule: &ScheduledBackup) -> Result<Backup, BackupError> {
        let backup = self.request(schedule, schedule.created_by).await?;
        self.queue.enqueue(JobKind::Backup, backup.id);
        info!(
            schedule_id = schedule.id,
            backup_id = backup.id,
            "Scheduled backup queued"
        );
        Ok(backup)
    }

    async fn request(
        &self,
        schedule: &ScheduledBackup,
        created_by: Option<i32>,
    ) -> Result<Backup, BackupError> {
        let backup_type = schedule
            .backup_type
            .parse::<BackupType>()
            .unwrap_or(BackupType::Full);

        self.backups
            .request(
                BackupRequest {
                    ldap_server_id: schedule.ldap_server_id,
                    backup_type,
                    encrypted: schedule.encrypted,
                    compression_enabled: schedule.compression_enabled,
                    scheduled_backup_id: Some(schedule.id),
                },
                created_by,
            )
            .await
    }

    async fn record_missed_run(&self, schedule: &ScheduledBackup) -> Result<()> {
        warn!(
            event = "missed_run",
            schedule_id = schedule.id,
            schedule = %schedule.name,
            "Previous run still outstanding, skipping this tick"
        );
        metrics::counter!("ldapguard_scheduler_missed_runs_total").increment(1);

        self.store
            .add_audit(NewAuditLog {
                action: "schedule.missed_run".to_string(),
                resource_type: "scheduled_backup".to_string(),
                resource_id: Some(schedule.id.to_string()),
                details: Some(serde_json::json!({ "name": schedule.name })),
                ..NewAuditLog::default()
            })
            .await?;

        let _ = self.events.send(JobEvent::ScheduleMissedRun {
            schedule_id: schedule.id,
            schedule_name: schedule.name.clone(),
        });
        Ok(())
    }
}

pub struct Scheduler {
    runner: ScheduleRunner,
    retention: RetentionService,
    config: SchedulerConfig,
    running: Arc<RwLock<bool>>,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        runner: ScheduleRunner,
        retention: RetentionService,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            runner,
            retention,
            config,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Runs until [`Scheduler::stop`] is called.
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            info!("Scheduler is disabled in config");
            return Ok(());
        }

        *self.running.write().await = true;
        info!("Starting background scheduler");

        let mut sched = JobScheduler::new().await?;

        let runner = self.runner.clone();
        let running = Arc::clone(&self.running);
        let tick_job = Job::new_async(self.config.tick_cron.as_str(), move |_uuid, _lock| {
            let runner = runner.clone();
            let running = Arc::clone(&running);
            Box::pin(async move {
                if !*running.read().await {
                    return;
                }
                match runner.tick(Utc::now()).await {
                    Ok(summary) if summary != TickSummary::default() => {
                        info!(
                            event = "job_finished",
                            job_name = "schedule_tick",
                            enqueued = summary.enqueued,
                            missed = summary.missed,
                            skipped = summary.skipped,
                            "Schedule tick finished"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(
                            event = "job_failed",
                            job_name = "schedule_tick",
                            error = %e,
                            "Schedule tick failed"
                        );
                    }
                }
            })
        })?;

        let retention = self.retention.clone();
        let running = Arc::clone(&self.running);
        let retention_job =
            Job::new_async(self.config.retention_cron.as_str(), move |_uuid, _lock| {
                let retention = retention.clone();
                let running = Arc::clone(&running);
                Box::pin(async move {
                    if !*running.read().await {
                        return;
                    }
                    let start = std::time::Instant::now();
                    info!(
                        event = "job_started",
                        job_name = "retention_sweep",
                        "Starting retention sweep"
                    );

                    match retention.sweep().await {
                        Ok(deleted) => info!(
                            event = "job_finished",
                            job_name = "retention_sweep",
                            deleted,
                            duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
                            "Retention sweep finished"
                        ),
                        Err(e) => {
                            error!(
                                event = "job_failed",
                                job_name = "retention_sweep",
                                error = %e,
                                "Retention sweep failed"
                            );
                        }
                    }
                })
            })?;

        sched.add(tick_job).await?;
        sched.add(retention_job).await?;
        sched.start().await?;

        info!("Schedule tick running with cron: {}", self.config.tick_cron);
        info!("Retention sweep scheduled: {}", self.config.retention_cron);

        loop {
            if !*self.running.read().await {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        sched.shutdown().await?;
        Ok(())
    }

    pub async fn stop(&self) {
        info!("Stopping scheduler...");
        *self.running.write().await = false;
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_next_run_respects_activation() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 1, 30, 0).unwrap();
        let next = next_run("0 2 * * *", true, now).unwrap();
        assert_eq!(next, Some(Utc.with_ymd_and_hms(2026, 3, 1, 2, 0, 0).unwrap()));
        assert_eq!(next_run("0 2 * * *", false, now).unwrap(), None);
    }

    #[test]
    fn test_invalid_cron_is_schedule_invalid() {
        let err = next_run("61 * * * *", true, Utc::now()).unwrap_err();
        assert_eq!(err.kind(), "ScheduleInvalid");
    }
}
