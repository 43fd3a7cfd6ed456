//! Backup expiry and deletion.

use std::collections::{BTreeMap, HashSet};
use std::io::ErrorKind;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::db::repositories::audit::NewAuditLog;
use crate::db::{Backup, Store};
use crate::domain::JobStatus;

#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("backup {0} not found")]
    NotFound(i32),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    RetentionViolation(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RetentionError {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NotFound",
            Self::Conflict(_) => "Conflict",
            Self::RetentionViolation(_) => "RetentionViolation",
            Self::Internal(_) => "Internal",
        }
    }
}

/// Who asked for a deletion. Copied onto the audit row of every backup
/// removed on their behalf.
#[derive(Debug, Clone, Default)]
pub struct DeletionActor {
    pub user_id: Option<i32>,
    pub api_key_id: Option<i32>,
    pub ip_address: Option<String>,
}

/// Picks the completed backups of one server that have outlived
/// `retention_days`, oldest first.
///
/// The newest backup is always kept, and so is every parent of a kept
/// incremental. Running the selection again over what is left selects
/// nothing new.
#[must_use]
pub fn select_expired(backups: &[Backup], retention_days: i32, now: DateTime<Utc>) -> Vec<i32> {
    let mut ordered: Vec<&Backup> = backups
        .iter()
        .filter(|b| b.status == JobStatus::Completed.as_str())
        .collect();
    ordered.sort_by_key(|b| (b.created_at, b.id));

    let Some(newest) = ordered.last().map(|b| b.id) else {
        return Vec::new();
    };

    let cutoff = now - Duration::days(i64::from(retention_days.max(0)));
    let mut expired: HashSet<i32> = ordered
        .iter()
        .filter(|b| b.id != newest && b.created_at < cutoff)
        .map(|b| b.id)
        .collect();

    loop {
        let protected: Vec<i32> = ordered
            .iter()
            .filter(|b| !expired.contains(&b.id))
            .filter_map(|b| b.parent_backup_id)
            .filter(|parent| expired.contains(parent))
            .collect();
        if protected.is_empty() {
            break;
        }
        for id in protected {
            expired.remove(&id);
        }
    }

    ordered
        .iter()
        .filter(|b| expired.contains(&b.id))
        .map(|b| b.id)
        .collect()
}

#[derive(Clone)]
pub struct RetentionService {
    store: Store,
}

impl RetentionService {
    #[must_use]
    pub const fn new(store: Store) -> Self {
        Self { store }
    }

    /// Expires old backups of one server. Returns how many were deleted.
    pub async fn enforce(&self, ldap_server_id: i32, retention_days: i32) -> anyhow::Result<usize> {
        let backups = self
            .store
            .backups()
            .completed_for_server(ldap_server_id)
            .await?;
        let expired = select_expired(&backups, retention_days, Utc::now());

        let mut deleted = 0;
        for backup in backups.iter().filter(|b| expired.contains(&b.id)) {
            self.remove(backup).await?;
            self.store
                .add_audit(NewAuditLog {
                    action: "backup.expired".to_string(),
                    resource_type: "backup".to_string(),
                    resource_id: Some(backup.id.to_string()),
                    details: Some(serde_json::json!({
                        "ldap_server_id": ldap_server_id,
                        "retention_days": retention_days,
                        "created_at": backup.created_at,
                    })),
                    ..NewAuditLog::default()
                })
                .await?;
            deleted += 1;
        }

        if deleted > 0 {
            metrics::counter!("ldapguard_retention_deleted_total")
                .increment(u64::try_from(deleted).unwrap_or(u64::MAX));
            info!(
                ldap_server_id,
                retention_days,
                deleted,
                "Expired backups removed"
            );
        }
        Ok(deleted)
    }

    /// Applies, per server, the longest retention among its active schedules.
    pub async fn sweep(&self) -> anyhow::Result<usize> {
        let mut per_server: BTreeMap<i32, i32> = BTreeMap::new();
        for schedule in self.store.schedules().list_active().await? {
            per_server
                .entry(schedule.ldap_server_id)
                .and_modify(|days| *days = (*days).max(schedule.retention_days))
                .or_insert(schedule.retention_days);
        }

        let mut total = 0;
        for (server_id, days) in per_server {
            total += self.enforce(server_id, days).await?;
        }
        Ok(total)
    }

    /// Explicit deletion requested by a user. Refuses to touch running jobs
    /// and to remove the last completed backup of a scheduled server.
    ///
    /// Each removal is audited as it happens, so a batch that stops halfway
    /// still leaves a record of what is gone.
    pub async fn delete_backups(
        &self,
        ids: &[i32],
        actor: &DeletionActor,
    ) -> Result<Vec<Backup>, RetentionError> {
        let unique: Vec<i32> = {
            let mut seen = HashSet::new();
            ids.iter().copied().filter(|id| seen.insert(*id)).collect()
        };
        let backups = self.store.backups().get_many(&unique).await?;

        if let Some(busy) = backups.iter().find(|b| {
            b.status
                .parse::<JobStatus>()
                .is_ok_and(|status| !status.is_terminal())
        }) {
            return Err(RetentionError::Conflict(format!(
                "backup {} is {}; cancel it before deleting",
                busy.id, busy.status
            )));
        }

        let scheduled: HashSet<i32> = self
            .store
            .schedules()
            .list_active()
            .await?
            .into_iter()
            .map(|s| s.ldap_server_id)
            .collect();

        let mut removing: BTreeMap<i32, u64> = BTreeMap::new();
        for backup in &backups {
            if backup.status == JobStatus::Completed.as_str() {
                *removing.entry(backup.ldap_server_id).or_default() += 1;
            }
        }
        for (server_id, count) in removing {
            if !scheduled.contains(&server_id) {
                continue;
            }
            let total = self
                .store
                .backups()
                .count_completed_for_server(server_id)
                .await?;
            if count >= total {
                return Err(RetentionError::RetentionViolation(format!(
                    "refusing to delete the last completed backup of LDAP server {server_id} \
                     while it has an active schedule"
                )));
            }
        }

        for backup in &backups {
            self.remove(backup).await?;

            let mut details = serde_json::json!({
                "ldap_server_id": backup.ldap_server_id,
                "backup_type": backup.backup_type,
                "status": backup.status,
            });
            if let (Some(key_id), Some(map)) = (actor.api_key_id, details.as_object_mut()) {
                map.insert("api_key_id".to_string(), serde_json::json!(key_id));
            }
            self.store
                .add_audit(NewAuditLog {
                    user_id: actor.user_id,
                    action: "backup.deleted".to_string(),
                    resource_type: "backup".to_string(),
                    resource_id: Some(backup.id.to_string()),
                    details: Some(details),
                    ip_address: actor.ip_address.clone(),
                })
                .await?;
        }
        Ok(backups)
    }

    pub async fn delete_backup(
        &self,
        id: i32,
        actor: &DeletionActor,
    ) -> Result<Backup, RetentionError> {
        if self.store.backups().get(id).await?.is_none() {
            return Err(RetentionError::NotFound(id));
        }
        let mut deleted = self.delete_backups(&[id], actor).await?;
        deleted.pop().ok_or(RetentionError::NotFound(id))
    }

    async fn remove(&self, backup: &Backup) -> anyhow::Result<()> {
        if let Some(path) = &backup.file_path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    warn!(backup_id = backup.id, path = %path, "Artifact already missing");
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("Failed to delete artifact {path}")));
                }
            }
        }
        self.store.backups().delete(backup.id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backup(id: i32, age_days: i64, parent: Option<i32>, now: DateTime<Utc>) -> Backup {
        let at = now - Duration::days(age_days);
        Backup {
            id,
            ldap_server_id: 1,
            backup_type: if parent.is_some() { "incremental" } else { "full" }.to_string(),
            status: "completed".to_string(),
            file_path: None,
            file_size: Some(10),
            entry_count: Some(1),
            encrypted: false,
            compression_enabled: true,
            checksum: None,
            parent_backup_id: parent,
            scheduled_backup_id: None,
            created_by: None,
            error_message: None,
            started_at: Some(at),
            completed_at: Some(at),
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn test_keeps_newest_even_when_everything_is_old() {
        let now = Utc::now();
        let backups: Vec<Backup> = (1..=5)
            .map(|i| backup(i, 30 - i64::from(i), None, now))
            .collect();

        let expired = select_expired(&backups, 7, now);
        assert_eq!(expired, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_protects_parents_of_retained_incrementals() {
        let now = Utc::now();
        let backups = vec![
            backup(1, 20, None, now),
            backup(2, 15, Some(1), now),
            backup(3, 10, None, now),
            backup(4, 1, Some(3), now),
        ];

        // 3 is old but parents 4, which is recent.
        assert_eq!(select_expired(&backups, 7, now), vec![1, 2]);
    }

    #[test]
    fn test_selection_is_idempotent() {
        let now = Utc::now();
        let mut backups: Vec<Backup> = (1..=10)
            .map(|i| backup(i, 40 - i64::from(i), None, now))
            .collect();
        backups.push(backup(11, 1, None, now));

        let first = select_expired(&backups, 7, now);
        assert_eq!(first.len(), 10);
        backups.retain(|b| !first.contains(&b.id));
        assert!(select_expired(&backups, 7, now).is_empty());
    }

    #[test]
    fn test_ignores_unfinished_backups() {
        let now = Utc::now();
        let mut failed = backup(1, 100, None, now);
        failed.status = "failed".to_string();
        assert!(select_expired(&[failed, backup(2, 50, None, now)], 7, now).is_empty());
    }
}
