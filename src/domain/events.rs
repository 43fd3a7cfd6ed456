//! Job lifecycle events.
//!
//! Engines publish these on the shared broadcast bus. The webhook notifier and
//! the `/api/events` stream are the subscribers.

use serde::Serialize;

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event")]
pub enum JobEvent {
    #[serde(rename = "backup.started")]
    BackupStarted {
        backup_id: i32,
        server_name: String,
        backup_type: String,
    },

    #[serde(rename = "backup.completed")]
    BackupCompleted {
        backup_id: i32,
        server_name: String,
        backup_type: String,
        file_size: i64,
        entry_count: i64,
    },

    #[serde(rename = "backup.failed")]
    BackupFailed {
        backup_id: i32,
        server_name: String,
        error: String,
    },

    #[serde(rename = "restore.started")]
    RestoreStarted { restore_id: i32, backup_id: i32 },

    #[serde(rename = "restore.completed")]
    RestoreCompleted {
        restore_id: i32,
        backup_id: i32,
        entries_restored: i64,
    },

    #[serde(rename = "restore.failed")]
    RestoreFailed {
        restore_id: i32,
        backup_id: i32,
        error: String,
    },

    #[serde(rename = "schedule.missed_run")]
    ScheduleMissedRun {
        schedule_id: i32,
        schedule_name: String,
    },
}

impl JobEvent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::BackupStarted { .. } => "backup.started",
            Self::BackupCompleted { .. } => "backup.completed",
            Self::BackupFailed { .. } => "backup.failed",
            Self::RestoreStarted { .. } => "restore.started",
            Self::RestoreCompleted { .. } => "restore.completed",
            Self::RestoreFailed { .. } => "restore.failed",
            Self::ScheduleMissedRun { .. } => "schedule.missed_run",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_is_tagged_with_dotted_name() {
        let event = JobEvent::RestoreCompleted {
            restore_id: 4,
            backup_id: 2,
            entries_restored: 17,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "restore.completed");
        assert_eq!(json["entries_restored"], 17);
        assert_eq!(event.name(), "restore.completed");
    }
}
