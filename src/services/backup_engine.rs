//! Backup engine.
//!
//! A backup is requested (row created in `pending`), later claimed by a
//! worker and executed: page through the directory, stream LDIF into the
//! payload writer, seal it, write the artifact, then move the job to
//! `completed` together with the artifact columns. Every failure after the
//! claim ends in `failed` with a recorded cause.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::repositories::ledger::{ArtifactInfo, NewBackupJob, TransitionPatch};
use crate::db::{Backup, Store};
use crate::domain::entry::generalized_time;
use crate::domain::events::JobEvent;
use crate::domain::{BackupType, JobKind, JobStatus};
use crate::services::artifact::{self, ArtifactError, FORMAT_VERSION, Manifest, PayloadWriter};
use crate::services::connector::{
    ConnectorError, DirectoryConnector, DirectorySession, DirectoryTarget, SearchRequest,
};
use crate::services::credentials::{CredentialError, CredentialStore};
use crate::services::ledger::{CANCELLED, JobLedger, LedgerError};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub backup_dir: PathBuf,
    pub page_size: u32,
}

impl EngineSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            backup_dir: PathBuf::from(&config.storage.backup_dir),
            page_size: config.ldap.page_size.max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub ldap_server_id: i32,
    pub backup_type: BackupType,
    pub encrypted: bool,
    pub compression_enabled: bool,
    pub scheduled_backup_id: Option<i32>,
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("LDAP server {0} not found")]
    ServerNotFound(i32),

    #[error("{0}")]
    ServerUnavailable(String),

    #[error("{0}")]
    ConnectorAuthFailed(String),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("stored bind password could not be read: {0}")]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BackupError {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ServerNotFound(_) => "NotFound",
            Self::ServerUnavailable(_) => "ServerUnavailable",
            Self::ConnectorAuthFailed(_) => "ConnectorAuthFailed",
            Self::Cancelled => "Cancelled",
            Self::Ledger(e) => e.kind(),
            Self::Artifact(_) => "ArtifactWriteFailed",
            Self::Credential(_) => "CredentialError",
            Self::Internal(_) => "Internal",
        }
    }

    /// Cause as stored on the job row. Internal errors stay in the logs.
    #[must_use]
    pub fn job_message(&self) -> String {
        match self {
            Self::Internal(_) | Self::Ledger(LedgerError::Database(_)) => {
                "Internal: unexpected error, see server logs".to_string()
            }
            other => format!("{}: {other}", other.kind()),
        }
    }
}

impl From<ConnectorError> for BackupError {
    fn from(err: ConnectorError) -> Self {
        match err {
            ConnectorError::AuthFailed(msg) => Self::ConnectorAuthFailed(msg),
            other => Self::ServerUnavailable(other.to_string()),
        }
    }
}

struct Finished {
    server_name: String,
    backup_type: BackupType,
    artifact: ArtifactInfo,
}

#[derive(Clone)]
pub struct BackupEngine {
    store: Store,
    ledger: JobLedger,
    credentials: CredentialStore,
    connector: Arc<dyn DirectoryConnector>,
    events: broadcast::Sender<JobEvent>,
    settings: EngineSettings,
}

impl BackupEngine {
    #[must_use]
    pub fn new(
        store: Store,
        ledger: JobLedger,
        credentials: CredentialStore,
        connector: Arc<dyn DirectoryConnector>,
        events: broadcast::Sender<JobEvent>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            ledger,
            credentials,
            connector,
            events,
            settings,
        }
    }

    /// Creates the pending job. Fails fast when the server cannot be used.
    pub async fn request(
        &self,
        request: BackupRequest,
        created_by: Option<i32>,
    ) -> Result<Backup, BackupError> {
        let server = self
            .store
            .ldap_servers()
            .get(request.ldap_server_id)
            .await?
            .ok_or(BackupError::ServerNotFound(request.ldap_server_id))?;

        if !server.is_active {
            return Err(BackupError::ServerUnavailable(format!(
                "LDAP server '{}' is inactive",
                server.name
            )));
        }

        let backup = self
            .ledger
            .create_backup(NewBackupJob {
                ldap_server_id: server.id,
                backup_type: request.backup_type.as_str().to_string(),
                encrypted: request.encrypted,
                compression_enabled: request.compression_enabled,
                scheduled_backup_id: request.scheduled_backup_id,
                created_by,
            })
            .await?;

        Ok(backup)
    }

    /// Request and execute in one go.
    pub async fn run_backup(
        &self,
        request: BackupRequest,
        created_by: Option<i32>,
    ) -> Result<Backup, BackupError> {
        let backup = self.request(request, created_by).await?;
        self.run(backup.id).await
    }

    /// Claims a pending backup and runs it to a terminal state. The returned
    /// row is `completed` or `failed`; `Err` means the job was not ours to
    /// run or the ledger itself is unreachable.
    pub async fn run(&self, backup_id: i32) -> Result<Backup, BackupError> {
        if !self.ledger.claim(JobKind::Backup, backup_id).await? {
            let actual = self.ledger.status(JobKind::Backup, backup_id).await?;
            return Err(LedgerError::InvalidTransition {
                kind: JobKind::Backup,
                id: backup_id,
                from: JobStatus::Pending,
                to: JobStatus::InProgress,
                actual: actual.to_string(),
            }
            .into());
        }

        let start = Instant::now();
        metrics::gauge!("ldapguard_active_backups").increment(1.0);
        let outcome = self.execute(backup_id).await;
        metrics::gauge!("ldapguard_active_backups").decrement(1.0);
        let elapsed = start.elapsed();

        match outcome {
            Ok(done) => {
                record_completed(&done, elapsed.as_secs_f64());
                info!(
                    event = "job_finished",
                    job_kind = "backup",
                    job_id = backup_id,
                    backup_type = done.backup_type.as_str(),
                    entry_count = done.artifact.entry_count,
                    file_size = done.artifact.file_size,
                    duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    "Backup completed"
                );
                let _ = self.events.send(JobEvent::BackupCompleted {
                    backup_id,
                    server_name: done.server_name,
                    backup_type: done.backup_type.as_str().to_string(),
                    file_size: done.artifact.file_size,
                    entry_count: done.artifact.entry_count,
                });
            }
            Err(e) => {
                self.fail(backup_id, &e).await;
                let backup_type = self
                    .ledger
                    .get_backup(backup_id)
                    .await
                    .map_or_else(|_| "unknown".to_string(), |b| b.backup_type);
                metrics::counter!(
                    "ldapguard_backup_total",
                    "status" => "failed",
                    "backup_type" => backup_type
                )
                .increment(1);
                let _ = self.events.send(JobEvent::BackupFailed {
                    backup_id,
                    server_name: self.server_name_for(backup_id).await,
                    error: e.job_message(),
                });
            }
        }

        Ok(self.ledger.get_backup(backup_id).await?)
    }

    async fn execute(&self, backup_id: i32) -> Result<Finished, BackupError> {
        let backup = self.ledger.get_backup(backup_id).await?;
        let server = self
            .store
            .ldap_servers()
            .get(backup.ldap_server_id)
            .await?
            .ok_or(BackupError::ServerNotFound(backup.ldap_server_id))?;
        if !server.is_active {
            return Err(BackupError::ServerUnavailable(format!(
                "LDAP server '{}' is inactive",
                server.name
            )));
        }

        let requested: BackupType = backup
            .backup_type
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        let parent = match requested {
            BackupType::Full => None,
            BackupType::Incremental => {
                let parent = self.store.backups().latest_completed(server.id).await?;
                if parent.is_none() {
                    info!(
                        job_id = backup_id,
                        server = %server.name,
                        "No completed backup to build on, running a full backup instead"
                    );
                }
                parent
            }
        };
        let backup_type = if parent.is_some() {
            BackupType::Incremental
        } else {
            BackupType::Full
        };
        self.store
            .backups()
            .set_plan(backup_id, backup_type.as_str(), parent.as_ref().map(|p| p.id))
            .await?;

        let since = parent.as_ref().map(|p| p.started_at.unwrap_or(p.created_at));
        let filter = since.map_or_else(
            || "(objectClass=*)".to_string(),
            |ts| format!("(&(objectClass=*)(modifyTimestamp>={}))", generalized_time(ts)),
        );

        info!(
            event = "job_started",
            job_kind = "backup",
            job_id = backup_id,
            server = %server.name,
            backup_type = backup_type.as_str(),
            "Backup started"
        );
        let _ = self.events.send(JobEvent::BackupStarted {
            backup_id,
            server_name: server.name.clone(),
            backup_type: backup_type.as_str().to_string(),
        });

        let target = DirectoryTarget::from_server(&server, &self.credentials)?;
        let request = SearchRequest::subtree(&server.base_dn, &filter, self.settings.page_size);

        let mut session = self.connector.connect(&target).await?;
        let streamed = self
            .stream(backup_id, session.as_mut(), &request, backup.compression_enabled)
            .await;
        if let Err(e) = session.close().await {
            warn!(job_id = backup_id, error = %e, "Failed to close LDAP session");
        }
        let writer = streamed?;

        let started_at = backup.started_at.unwrap_or_else(Utc::now);
        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            backup_id,
            server_id: server.id,
            server_name: server.name.clone(),
            backup_type: backup_type.as_str().to_string(),
            entry_count: writer.entry_count(),
            created_at: started_at,
            since,
            parent_backup_id: parent.as_ref().map(|p| p.id),
            transforms: Vec::new(),
            payload_size: 0,
            payload_sha256: String::new(),
        };

        let (payload, manifest) = self.seal(writer, manifest, backup.encrypted).await?;

        let path = self.settings.backup_dir.join(artifact::file_name(
            &server.name,
            backup_type.as_str(),
            started_at,
            backup_id,
        ));
        let file_size = artifact::write(&path, &manifest, &payload).await?;

        let artifact = ArtifactInfo {
            file_path: path.display().to_string(),
            file_size: i64::try_from(file_size).unwrap_or(i64::MAX),
            entry_count: i64::try_from(manifest.entry_count).unwrap_or(i64::MAX),
            checksum: manifest.payload_sha256.clone(),
        };

        let completed = self
            .ledger
            .transition(
                JobKind::Backup,
                backup_id,
                JobStatus::InProgress,
                JobStatus::Completed,
                Some("finished"),
                TransitionPatch {
                    artifact: Some(artifact.clone()),
                    ..TransitionPatch::default()
                },
            )
            .await;

        match completed {
            Ok(()) => Ok(Finished {
                server_name: server.name,
                backup_type,
                artifact,
            }),
            Err(e) => {
                tokio::fs::remove_file(&path).await.ok();
                match e {
                    LedgerError::InvalidTransition { ref actual, .. }
                        if actual == JobStatus::Cancelling.as_str() =>
                    {
                        Err(BackupError::Cancelled)
                    }
                    other => Err(other.into()),
                }
            }
        }
    }

    /// Pages through the directory. Cancellation is honoured between pages
    /// and every page refreshes the job's heartbeat.
    async fn stream(
        &self,
        backup_id: i32,
        session: &mut dyn DirectorySession,
        request: &SearchRequest,
        compress: bool,
    ) -> Result<PayloadWriter, BackupError> {
        let mut writer =
            PayloadWriter::new(compress).context("Failed to initialise payload writer")?;
        let mut cookie: Option<Vec<u8>> = None;

        loop {
            if self.ledger.is_cancelling(JobKind::Backup, backup_id).await? {
                return Err(BackupError::Cancelled);
            }

            let page = session.search_page(request, cookie.as_deref()).await?;
            writer
                .write_entries(&page.entries)
                .context("Failed to serialize directory entries")?;
            self.store.backups().touch(backup_id).await?;

            match page.cookie {
                Some(next) => cookie = Some(next),
                None => break,
            }
        }

        Ok(writer)
    }

    /// Compression finish, encryption and hashing are CPU bound.
    async fn seal(
        &self,
        writer: PayloadWriter,
        mut manifest: Manifest,
        encrypted: bool,
    ) -> Result<(Vec<u8>, Manifest), BackupError> {
        let credentials = encrypted.then(|| self.credentials.clone());

        let sealed = tokio::task::spawn_blocking(move || {
            let (payload, transforms) = writer.finish()?;
            let payload =
                artifact::seal_payload(payload, transforms, credentials.as_ref(), &mut manifest)?;
            Ok::<_, ArtifactError>((payload, manifest))
        })
        .await
        .context("Artifact sealing task panicked")??;

        Ok(sealed)
    }

    async fn fail(&self, backup_id: i32, err: &BackupError) {
        let message = err.job_message();
        let reason = if matches!(err, BackupError::Cancelled) {
            CANCELLED
        } else {
            "error"
        };

        match err {
            BackupError::Cancelled => {
                info!(
                    event = "job_cancelled",
                    job_kind = "backup",
                    job_id = backup_id,
                    "Backup cancelled"
                );
            }
            _ => {
                error!(
                    event = "job_failed",
                    job_kind = "backup",
                    job_id = backup_id,
                    error = %err,
                    "Backup failed"
                );
            }
        }

        for from in [JobStatus::InProgress, JobStatus::Cancelling] {
            match self
                .ledger
                .transition(
                    JobKind::Backup,
                    backup_id,
                    from,
                    JobStatus::Failed,
                    Some(reason),
                    TransitionPatch::error(message.clone()),
                )
                .await
            {
                Ok(()) => return,
                Err(LedgerError::InvalidTransition { .. }) => {}
                Err(e) => {
                    error!(job_id = backup_id, error = %e, "Failed to record backup failure");
                    return;
                }
            }
        }
    }

    async fn server_name_for(&self, backup_id: i32) -> String {
        let Ok(backup) = self.ledger.get_backup(backup_id).await else {
            return String::new();
        };
        self.store
            .ldap_servers()
            .get(backup.ldap_server_id)
            .await
            .ok()
            .flatten()
            .map(|s| s.name)
            .unwrap_or_default()
    }
}

#[allow(clippy::cast_precision_loss)]
fn record_completed(done: &Finished, seconds: f64) {
    let backup_type = done.backup_type.as_str();
    metrics::counter!(
        "ldapguard_backup_total",
        "status" => "completed",
        "backup_type" => backup_type
    )
    .increment(1);
    metrics::histogram!("ldapguard_backup_duration_seconds", "backup_type" => backup_type)
        .record(seconds);
    metrics::gauge!("ldapguard_backup_size_bytes", "server_name" => done.server_name.clone())
        .set(done.artifact.file_size as f64);
    metrics::gauge!("ldapguard_backup_entries", "server_name" => done.server_name.clone())
        .set(done.artifact.entry_count as f64);
}
