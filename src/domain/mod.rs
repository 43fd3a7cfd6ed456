//! Domain types shared by the engines, the job ledger and the API.
//!
//! Statuses, kinds and roles are persisted as lowercase strings; the enums
//! here are the only place those strings are spelled out.

pub mod entry;
pub mod events;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Access level of a user or API key.
///
/// Roles are ordered: a role may do everything the roles below it can.
///
/// ```rust
/// use ldapguard::domain::Role;
///
/// assert!(Role::Admin.allows(Role::Operator));
/// assert!(!Role::Viewer.allows(Role::Operator));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Operator,
    Admin,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Operator => "operator",
            Self::Admin => "admin",
        }
    }

    /// Whether this role satisfies a requirement of `required`.
    #[must_use]
    pub fn allows(self, required: Self) -> bool {
        self >= required
    }

    /// Maps a comma separated API key permission list onto a role.
    #[must_use]
    pub fn from_permissions(permissions: &str) -> Self {
        let perms: Vec<&str> = permissions.split(',').map(str::trim).collect();
        if perms.contains(&"admin") {
            Self::Admin
        } else if perms.contains(&"write") {
            Self::Operator
        } else {
            Self::Viewer
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "viewer" => Ok(Self::Viewer),
            "operator" => Ok(Self::Operator),
            "admin" => Ok(Self::Admin),
            other => Err(format!("Unknown role '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Incremental,
}

impl BackupType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            other => Err(format!("Unknown backup type '{other}'")),
        }
    }
}

/// Which table a ledger entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Backup,
    Restore,
}

impl JobKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backup" => Ok(Self::Backup),
            "restore" => Ok(Self::Restore),
            other => Err(format!("Unknown job kind '{other}'")),
        }
    }
}

/// Lifecycle of a backup or restore job.
///
/// Jobs only move forward:
///
/// ```text
/// pending -> in_progress -> completed
///    |           |  \
///    |           |   -> cancelling -> failed
///    |            -> failed
///     -> failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Cancelling,
    Completed,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the ledger accepts a move from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress | Self::Failed)
                | (
                    Self::InProgress,
                    Self::Completed | Self::Failed | Self::Cancelling
                )
                | (Self::Cancelling, Self::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "cancelling" => Ok(Self::Cancelling),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("Unknown job status '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_edges_only_move_forward() {
        use JobStatus::{Cancelling, Completed, Failed, InProgress, Pending};

        assert!(Pending.can_transition_to(InProgress));
        assert!(Pending.can_transition_to(Failed));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Cancelling));
        assert!(Cancelling.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!InProgress.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(InProgress));
        assert!(!Cancelling.can_transition_to(Completed));
    }

    #[test]
    fn test_role_from_permissions() {
        assert_eq!(Role::from_permissions("read"), Role::Viewer);
        assert_eq!(Role::from_permissions("read,write"), Role::Operator);
        assert_eq!(Role::from_permissions("read, write, admin"), Role::Admin);
        assert_eq!(Role::from_permissions(""), Role::Viewer);
    }

    #[test]
    fn test_status_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::InProgress,
            JobStatus::Cancelling,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
        }
        assert!("done".parse::<JobStatus>().is_err());
    }
}
