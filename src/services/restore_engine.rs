//! Restore engine.
//!
//! Every artifact a restore needs is read and verified before the target
//! server is contacted, so a corrupted artifact never results in a partial
//! apply. Replay is best-effort: entries that fail are counted and the job
//! ends `failed` if any did.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::constants::limits::RESTORE_BATCH_SIZE;
use crate::db::repositories::ledger::{NewRestoreJob, TransitionPatch};
use crate::db::repositories::restore::RestoreCounts;
use crate::db::{Backup, RestoreJob, Store};
use crate::domain::entry::{DirectoryEntry, parse_generalized_time};
use crate::domain::events::JobEvent;
use crate::domain::{JobKind, JobStatus};
use crate::parser::ldap_filter::Filter;
use crate::services::artifact::{self, ArtifactError};
use crate::services::connector::{
    ConnectorError, DirectoryConnector, DirectorySession, DirectoryTarget,
};
use crate::services::credentials::{CredentialError, CredentialStore};
use crate::services::ledger::{CANCELLED, JobLedger, LedgerError};

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub backup_id: i32,
    pub ldap_server_id: i32,
    pub selective_restore: bool,
    pub restore_filter: Option<String>,
    pub point_in_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("backup {0} not found")]
    BackupNotFound(i32),

    #[error("LDAP server {0} not found")]
    ServerNotFound(i32),

    #[error("backup {id} is {status}, only completed backups can be restored")]
    BackupNotCompleted { id: i32, status: String },

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    ServerUnavailable(String),

    #[error("{0}")]
    ConnectorAuthFailed(String),

    #[error("{0}")]
    ArtifactCorrupted(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{failed} of {total} entries could not be written")]
    EntriesFailed { failed: i64, total: usize },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("stored bind password could not be read: {0}")]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RestoreError {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::BackupNotFound(_) | Self::ServerNotFound(_) => "NotFound",
            Self::BackupNotCompleted { .. } => "BackupNotCompleted",
            Self::Validation(_) => "Validation",
            Self::ServerUnavailable(_) => "ServerUnavailable",
            Self::ConnectorAuthFailed(_) => "ConnectorAuthFailed",
            Self::ArtifactCorrupted(_) => "ArtifactCorrupted",
            Self::Cancelled => "Cancelled",
            Self::EntriesFailed { .. } => "EntriesFailed",
            Self::Ledger(e) => e.kind(),
            Self::Credential(_) => "CredentialError",
            Self::Internal(_) => "Internal",
        }
    }

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

impl From<ConnectorError> for RestoreError {
    fn from(err: ConnectorError) -> Self {
        match err {
            ConnectorError::AuthFailed(msg) => Self::ConnectorAuthFailed(msg),
            other => Self::ServerUnavailable(other.to_string()),
        }
    }
}

impl From<ArtifactError> for RestoreError {
    fn from(err: ArtifactError) -> Self {
        match err {
            ArtifactError::Io(e) => Self::ArtifactCorrupted(format!("artifact unreadable: {e}")),
            other => Self::ArtifactCorrupted(other.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct RestoreEngine {
    store: Store,
    ledger: JobLedger,
    credentials: CredentialStore,
    connector: Arc<dyn DirectoryConnector>,
    events: broadcast::Sender<JobEvent>,
}

impl RestoreEngine {
    #[must_use]
    pub fn new(
        store: Store,
        ledger: JobLedger,
        credentials: CredentialStore,
        connector: Arc<dyn DirectoryConnector>,
        events: broadcast::Sender<JobEvent>,
    ) -> Self {
        Self {
            store,
            ledger,
            credentials,
            connector,
            events,
        }
    }

    /// Validates the request and creates the pending job.
    pub async fn request(
        &self,
        request: RestoreRequest,
        created_by: Option<i32>,
    ) -> Result<RestoreJob, RestoreError> {
        let restore_filter = request
            .restore_filter
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string);

        match (request.selective_restore, &restore_filter) {
            (true, None) => {
                return Err(RestoreError::Validation(
                    "restore_filter is required for a selective restore".to_string(),
                ));
            }
            (false, Some(_)) => {
                return Err(RestoreError::Validation(
                    "restore_filter is only allowed with selective_restore".to_string(),
                ));
            }
            (true, Some(filter)) => {
                Filter::parse(filter).map_err(|e| {
                    RestoreError::Validation(format!("invalid restore_filter: {e}"))
                })?;
            }
            (false, None) => {}
        }

        let backup = self.completed_backup(request.backup_id).await?;
        self.active_server(request.ldap_server_id).await?;

        if let Some(pit) = request.point_in_time {
            self.chain(&backup, pit).await?;
        }

        let restore = self
            .ledger
            .create_restore(NewRestoreJob {
                backup_id: backup.id,
                ldap_server_id: request.ldap_server_id,
                selective_restore: request.selective_restore,
                restore_filter,
                point_in_time: request.point_in_time,
                created_by,
            })
            .await?;

        Ok(restore)
    }

    pub async fn run_restore(
        &self,
        request: RestoreRequest,
        created_by: Option<i32>,
    ) -> Result<RestoreJob, RestoreError> {
        let restore = self.request(request, created_by).await?;
        self.run(restore.id).await
    }

    /// Claims a pending restore and drives it to a terminal state.
    pub async fn run(&self, restore_id: i32) -> Result<RestoreJob, RestoreError> {
        if !self.ledger.claim(JobKind::Restore, restore_id).await? {
            let actual = self.ledger.status(JobKind::Restore, restore_id).await?;
            return Err(LedgerError::InvalidTransition {
                kind: JobKind::Restore,
                id: restore_id,
                from: JobStatus::Pending,
                to: JobStatus::InProgress,
                actual: actual.to_string(),
            }
            .into());
        }

        let start = Instant::now();
        metrics::gauge!("ldapguard_active_restores").increment(1.0);
        let outcome = self.execute(restore_id).await;
        metrics::gauge!("ldapguard_active_restores").decrement(1.0);
        let elapsed = start.elapsed();
        metrics::histogram!("ldapguard_restore_duration_seconds").record(elapsed.as_secs_f64());

        let restore = self.ledger.get_restore(restore_id).await?;
        match outcome {
            Ok(counts) => {
                metrics::counter!("ldapguard_restore_total", "status" => "completed").increment(1);
                info!(
                    event = "job_finished",
                    job_kind = "restore",
                    job_id = restore_id,
                    entries_restored = counts.restored,
                    entries_skipped = counts.skipped,
                    duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    "Restore completed"
                );
                let _ = self.events.send(JobEvent::RestoreCompleted {
                    restore_id,
                    backup_id: restore.backup_id,
                    entries_restored: counts.restored,
                });
            }
            Err(e) => {
                self.fail(restore_id, &e).await;
                metrics::counter!("ldapguard_restore_total", "status" => "failed").increment(1);
                let _ = self.events.send(JobEvent::RestoreFailed {
                    restore_id,
                    backup_id: restore.backup_id,
                    error: e.job_message(),
                });
            }
        }

        Ok(self.ledger.get_restore(restore_id).await?)
    }

    async fn execute(&self, restore_id: i32) -> Result<RestoreCounts, RestoreError> {
        let restore = self.ledger.get_restore(restore_id).await?;
        let backup = self.completed_backup(restore.backup_id).await?;
        let server = self.active_server(restore.ldap_server_id).await?;

        let chain = match restore.point_in_time {
            Some(pit) => self.chain(&backup, pit).await?,
            None => vec![backup.clone()],
        };

        let mut layers = Vec::with_capacity(chain.len());
        for link in &chain {
            layers.push(self.load(link).await?);
        }

        let mut entries = match restore.point_in_time {
            Some(pit) => merge_point_in_time(layers, pit),
            None => layers.into_iter().flatten().collect(),
        };

        if restore.selective_restore {
            let expr = restore.restore_filter.as_deref().unwrap_or_default();
            let filter = Filter::parse(expr)
                .map_err(|e| RestoreError::Validation(format!("invalid restore_filter: {e}")))?;
            entries.retain(|entry| filter.matches(entry));
        }

        let entries = prepare_for_replay(entries);

        info!(
            event = "job_started",
            job_kind = "restore",
            job_id = restore_id,
            backup_id = backup.id,
            server = %server.name,
            entries = entries.len(),
            chain_length = chain.len(),
            "Restore started"
        );
        let _ = self.events.send(JobEvent::RestoreStarted {
            restore_id,
            backup_id: backup.id,
        });

        let target = DirectoryTarget::from_server(&server, &self.credentials)?;
        let mut session = self.connector.connect(&target).await?;
        let replayed = self.replay(restore_id, session.as_mut(), &entries).await;
        if let Err(e) = session.close().await {
            warn!(job_id = restore_id, error = %e, "Failed to close LDAP session");
        }
        let counts = replayed?;

        if counts.failed > 0 {
            return Err(RestoreError::EntriesFailed {
                failed: counts.failed,
                total: entries.len(),
            });
        }

        let completed = self
            .ledger
            .transition(
                JobKind::Restore,
                restore_id,
                JobStatus::InProgress,
                JobStatus::Completed,
                Some("finished"),
                TransitionPatch {
                    counts: Some(counts),
                    ..TransitionPatch::default()
                },
            )
            .await;

        match completed {
            Ok(()) => Ok(counts),
            Err(LedgerError::InvalidTransition { ref actual, .. })
                if actual == JobStatus::Cancelling.as_str() =>
            {
                Err(RestoreError::Cancelled)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Writes entries batch by batch, persisting counts after each batch.
    async fn replay(
        &self,
        restore_id: i32,
        session: &mut dyn DirectorySession,
        entries: &[DirectoryEntry],
    ) -> Result<RestoreCounts, RestoreError> {
        let mut counts = RestoreCounts::default();

        for batch in entries.chunks(RESTORE_BATCH_SIZE) {
            if self.ledger.is_cancelling(JobKind::Restore, restore_id).await? {
                return Err(RestoreError::Cancelled);
            }

            for entry in batch {
                match session.add(entry).await {
                    Ok(()) => counts.restored += 1,
                    Err(ConnectorError::AlreadyExists(_)) => counts.skipped += 1,
                    Err(e) => {
                        counts.failed += 1;
                        warn!(
                            job_id = restore_id,
                            dn = %entry.dn,
                            error = %e,
                            "Entry restore failed"
                        );
                    }
                }
            }

            self.store.restores().update_progress(restore_id, counts).await?;
        }

        Ok(counts)
    }

    async fn load(&self, backup: &Backup) -> Result<Vec<DirectoryEntry>, RestoreError> {
        let path = backup.file_path.as_deref().ok_or_else(|| {
            RestoreError::ArtifactCorrupted(format!("backup {} has no artifact", backup.id))
        })?;

        let (manifest, entries) =
            artifact::read_and_decode(Path::new(path), &self.credentials).await?;

        if manifest.backup_id != backup.id {
            return Err(RestoreError::ArtifactCorrupted(format!(
                "artifact belongs to backup {}, expected {}",
                manifest.backup_id, backup.id
            )));
        }
        if let Some(checksum) = &backup.checksum
            && *checksum != manifest.payload_sha256
        {
            return Err(RestoreError::ArtifactCorrupted(
                "payload checksum does not match the recorded checksum".to_string(),
            ));
        }

        Ok(entries)
    }

    /// Backups to replay for a point in time, full backup first.
    async fn chain(
        &self,
        selected: &Backup,
        point_in_time: DateTime<Utc>,
    ) -> Result<Vec<Backup>, RestoreError> {
        let mut chain = vec![selected.clone()];
        let mut seen = HashSet::from([selected.id]);
        let mut cursor = selected.parent_backup_id;

        while let Some(parent_id) = cursor {
            if !seen.insert(parent_id) {
                return Err(RestoreError::Validation(format!(
                    "backup chain of {} loops at {parent_id}",
                    selected.id
                )));
            }
            let parent = self.store.backups().get(parent_id).await?.ok_or_else(|| {
                RestoreError::Validation(format!("backup chain is broken: {parent_id} is missing"))
            })?;
            if parent.status != JobStatus::Completed.as_str() {
                return Err(RestoreError::Validation(format!(
                    "backup chain is broken: {parent_id} is {}",
                    parent.status
                )));
            }
            cursor = parent.parent_backup_id;
            chain.push(parent);
        }

        chain.reverse();
        chain.retain(|b| b.started_at.unwrap_or(b.created_at) <= point_in_time);

        if chain.is_empty() {
            return Err(RestoreError::Validation(format!(
                "no backup in the chain of {} was taken before {}",
                selected.id,
                point_in_time.to_rfc3339()
            )));
        }
        Ok(chain)
    }

    async fn completed_backup(&self, backup_id: i32) -> Result<Backup, RestoreError> {
        let backup = self
            .store
            .backups()
            .get(backup_id)
            .await?
            .ok_or(RestoreError::BackupNotFound(backup_id))?;

        if backup.status != JobStatus::Completed.as_str() {
            return Err(RestoreError::BackupNotCompleted {
                id: backup.id,
                status: backup.status,
            });
        }
        Ok(backup)
    }

    async fn active_server(&self, server_id: i32) -> Result<crate::db::LdapServer, RestoreError> {
        let server = self
            .store
            .ldap_servers()
            .get(server_id)
            .await?
            .ok_or(RestoreError::ServerNotFound(server_id))?;

        if !server.is_active {
            return Err(RestoreError::ServerUnavailable(format!(
                "LDAP server '{}' is inactive",
                server.name
            )));
        }
        Ok(server)
    }

    async fn fail(&self, restore_id: i32, err: &RestoreError) {
        let message = err.job_message();
        let reason = if matches!(err, RestoreError::Cancelled) {
            CANCELLED
        } else {
            "error"
        };

        if matches!(err, RestoreError::Cancelled) {
            info!(
                event = "job_cancelled",
                job_kind = "restore",
                job_id = restore_id,
                "Restore cancelled"
            );
        } else {
            error!(
                event = "job_failed",
                job_kind = "restore",
                job_id = restore_id,
                error = %err,
                "Restore failed"
            );
        }

        for from in [JobStatus::InProgress, JobStatus::Cancelling] {
            match self
                .ledger
                .transition(
                    JobKind::Restore,
                    restore_id,
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
                    error!(job_id = restore_id, error = %e, "Failed to record restore failure");
                    return;
                }
            }
        }
    }
}

/// Folds backup layers (oldest first) into the directory state as of
/// `point_in_time`. Later layers win unless they carry an older
/// `modifyTimestamp`; versions modified after the cutoff are ignored.
#[must_use]
pub fn merge_point_in_time(
    layers: Vec<Vec<DirectoryEntry>>,
    point_in_time: DateTime<Utc>,
) -> Vec<DirectoryEntry> {
    let mut merged: BTreeMap<String, DirectoryEntry> = BTreeMap::new();

    for entry in layers.into_iter().flatten() {
        let modified = entry
            .modify_timestamp()
            .and_then(|ts| parse_generalized_time(&ts));
        if modified.is_some_and(|ts| ts > point_in_time) {
            continue;
        }

        let key = entry.normalized_dn();
        let replace = match merged
            .get(&key)
            .and_then(DirectoryEntry::modify_timestamp)
            .and_then(|ts| parse_generalized_time(&ts))
        {
            Some(existing) => modified.is_none_or(|ts| ts >= existing),
            None => true,
        };
        if replace {
            merged.insert(key, entry);
        }
    }

    merged.into_values().collect()
}

/// Strips operational attributes and orders entries parents-first.
#[must_use]
pub fn prepare_for_replay(entries: Vec<DirectoryEntry>) -> Vec<DirectoryEntry> {
    let mut entries: Vec<DirectoryEntry> = entries
        .into_iter()
        .map(DirectoryEntry::without_operational)
        .collect();
    entries.sort_by_cached_key(|e| (e.depth(), e.normalized_dn()));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn person(cn: &str, modified: &str, mail: &str) -> DirectoryEntry {
        DirectoryEntry::new(format!("cn={cn},ou=people,dc=example,dc=org"))
            .with_attr("cn", [cn])
            .with_attr("mail", [mail])
            .with_attr("modifyTimestamp", [modified])
    }

    #[test]
    fn test_point_in_time_last_write_wins() {
        let full = vec![
            person("alice", "20260101000000Z", "alice@old"),
            person("bob", "20260101000000Z", "bob@old"),
        ];
        let incr1 = vec![person("alice", "20260105000000Z", "alice@jan5")];
        let incr2 = vec![
            person("alice", "20260110000000Z", "alice@jan10"),
            person("carol", "20260110000000Z", "carol@jan10"),
        ];

        let pit = Utc.with_ymd_and_hms(2026, 1, 7, 0, 0, 0).unwrap();
        let merged = merge_point_in_time(vec![full, incr1, incr2], pit);

        assert_eq!(merged.len(), 2);
        let alice = merged.iter().find(|e| e.dn.starts_with("cn=alice")).unwrap();
        assert_eq!(alice.first_text("mail").as_deref(), Some("alice@jan5"));
        assert!(!merged.iter().any(|e| e.dn.starts_with("cn=carol")));
    }

    #[test]
    fn test_point_in_time_keeps_entries_without_timestamp() {
        let root = DirectoryEntry::new("dc=example,dc=org").with_attr("dc", ["example"]);
        let pit = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let merged = merge_point_in_time(vec![vec![root.clone()]], pit);
        assert_eq!(merged, vec![root]);
    }

    #[test]
    fn test_replay_order_is_parents_first() {
        let entries = vec![
            DirectoryEntry::new("cn=a,ou=people,dc=example,dc=org")
                .with_attr("entryUUID", ["1"]),
            DirectoryEntry::new("dc=example,dc=org"),
            DirectoryEntry::new("ou=people,dc=example,dc=org"),
        ];
        let ordered = prepare_for_replay(entries);
        let dns: Vec<&str> = ordered.iter().map(|e| e.dn.as_str()).collect();
        assert_eq!(
            dns,
            vec![
                "dc=example,dc=org",
                "ou=people,dc=example,dc=org",
                "cn=a,ou=people,dc=example,dc=org"
            ]
        );
        assert!(!ordered[2].has_attribute("entryUUID"));
    }

    #[test]
    fn test_error_messages_carry_kind() {
        let err = RestoreError::EntriesFailed { failed: 2, total: 10 };
        assert_eq!(err.job_message(), "EntriesFailed: 2 of 10 entries could not be written");
        let err = RestoreError::Internal(anyhow::anyhow!("sql: no such column"));
        assert!(!err.job_message().contains("sql"));
    }
}
