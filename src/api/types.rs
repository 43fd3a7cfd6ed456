use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::limits::{DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};
use crate::db::JobTransition;
use crate::domain::JobStatus;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Deleting a resource that still has history deactivates it instead.
#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub message: String,
    pub deactivated: bool,
}

/// One row of a job's status history.
#[derive(Debug, Serialize)]
pub struct TransitionDto {
    pub from_status: Option<String>,
    pub to_status: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<JobTransition> for TransitionDto {
    fn from(t: JobTransition) -> Self {
        Self {
            from_status: t.from_status,
            to_status: t.to_status,
            reason: t.reason,
            created_at: t.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub id: i32,
    pub status: JobStatus,
}

/// `?skip=&limit=` on every list endpoint.
#[derive(Debug, Default, Clone, Copy, Deserialize)]
pub struct Pagination {
    pub skip: Option<u64>,
    pub limit: Option<u64>,
}

impl Pagination {
    #[must_use]
    pub fn skip(&self) -> u64 {
        self.skip.unwrap_or(0)
    }

    #[must_use]
    pub fn limit(&self) -> u64 {
        self.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_defaults_and_clamps() {
        let default = Pagination::default();
        assert_eq!(default.skip(), 0);
        assert_eq!(default.limit(), DEFAULT_PAGE_LIMIT);

        let huge = Pagination {
            skip: Some(5),
            limit: Some(50_000),
        };
        assert_eq!(huge.skip(), 5);
        assert_eq!(huge.limit(), MAX_PAGE_LIMIT);

        let zero = Pagination {
            skip: None,
            limit: Some(0),
        };
        assert_eq!(zero.limit(), 1);
    }
}
