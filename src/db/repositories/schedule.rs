use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, sea_query::Expr,
};

use crate::entities::{prelude::*, scheduled_backups};

#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub name: String,
    pub ldap_server_id: i32,
    pub backup_type: String,
    pub cron_expression: String,
    pub retention_days: i32,
    pub encrypted: bool,
    pub compression_enabled: bool,
    pub is_active: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_by: Option<i32>,
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleUpdate {
    pub name: Option<String>,
    pub backup_type: Option<String>,
    pub cron_expression: Option<String>,
    pub retention_days: Option<i32>,
    pub encrypted: Option<bool>,
    pub compression_enabled: Option<bool>,
    pub is_active: Option<bool>,
    /// Recomputed by the caller whenever the cron or activation changes.
    pub next_run_at: Option<Option<DateTime<Utc>>>,
}

pub struct ScheduleRepository {
    conn: DatabaseConnection,
}

impl ScheduleRepository {
    #[must_use]
    pub const fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    pub async fn list(&self, skip: u64, limit: u64) -> Result<Vec<scheduled_backups::Model>> {
        ScheduledBackups::find()
            .order_by_asc(scheduled_backups::Column::Name)
            .offset(skip)
            .limit(limit)
            .all(&self.conn)
            .await
            .context("Failed to list scheduled backups")
    }

    pub async fn list_all(&self) -> Result<Vec<scheduled_backups::Model>> {
        ScheduledBackups::find()
            .order_by_asc(scheduled_backups::Column::Id)
            .all(&self.conn)
            .await
            .context("Failed to list scheduled backups")
    }

    pub async fn list_active(&self) -> Result<Vec<scheduled_backups::Model>> {
        ScheduledBackups::find()
            .filter(scheduled_backups::Column::IsActive.eq(true))
            .order_by_asc(scheduled_backups::Column::Id)
            .all(&self.conn)
            .await
            .context("Failed to list active schedules")
    }

    /// Active schedules whose next run is at or before `now`.
    pub async fn due(&self, now: DateTime<Utc>) -> Result<Vec<scheduled_backups::Model>> {
        ScheduledBackups::find()
            .filter(scheduled_backups::Column::IsActive.eq(true))
            .filter(scheduled_backups::Column::NextRunAt.lte(now))
            .order_by_asc(scheduled_backups::Column::NextRunAt)
            .all(&self.conn)
            .await
            .context("Failed to query due schedules")
    }

    pub async fn get(&self, id: i32) -> Result<Option<scheduled_backups::Model>> {
        ScheduledBackups::find_by_id(id)
            .one(&self.conn)
            .await
            .context("Failed to query scheduled backup")
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<scheduled_backups::Model>> {
        ScheduledBackups::find()
            .filter(scheduled_backups::Column::Name.eq(name))
            .one(&self.conn)
            .await
            .context("Failed to query scheduled backup by name")
    }

    pub async fn create(&self, schedule: NewSchedule) -> Result<scheduled_backups::Model> {
        let now = Utc::now();
        scheduled_backups::ActiveModel {
            name: Set(schedule.name),
            ldap_server_id: Set(schedule.ldap_server_id),
            backup_type: Set(schedule.backup_type),
            cron_expression: Set(schedule.cron_expression),
            retention_days: Set(schedule.retention_days),
            encrypted: Set(schedule.encrypted),
            compression_enabled: Set(schedule.compression_enabled),
            is_active: Set(schedule.is_active),
            next_run_at: Set(schedule.next_run_at),
            created_by: Set(schedule.created_by),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&self.conn)
        .await
        .context("Failed to insert scheduled backup")
    }

    pub async fn update(
        &self,
        id: i32,
        update: ScheduleUpdate,
    ) -> Result<Option<scheduled_backups::Model>> {
        let Some(schedule) = self.get(id).await? else {
            return Ok(None);
        };

        let mut active: scheduled_backups::ActiveModel = schedule.into();
        if let Some(name) = update.name {
            active.name = Set(name);
        }
        if let Some(backup_type) = update.backup_type {
            active.backup_type = Set(backup_type);
        }
        if let Some(cron) = update.cron_expression {
            active.cron_expression = Set(cron);
        }
        if let Some(days) = update.retention_days {
            active.retention_days = Set(days);
        }
        if let Some(encrypted) = update.encrypted {
            active.encrypted = Set(encrypted);
        }
        if let Some(compression) = update.compression_enabled {
            active.compression_enabled = Set(compression);
        }
        if let Some(is_active) = update.is_active {
            active.is_active = Set(is_active);
        }
        if let Some(next) = update.next_run_at {
            active.next_run_at = Set(next);
        }
        active.updated_at = Set(Utc::now());

        let model = active
            .update(&self.conn)
            .await
            .context("Failed to update scheduled backup")?;

        Ok(Some(model))
    }

    /// Advances a schedule's own timeline after a tick handled it.
    pub async fn mark_run(
        &self,
        id: i32,
        ran_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        ScheduledBackups::update_many()
            .col_expr(scheduled_backups::Column::LastRunAt, Expr::value(Some(ran_at)))
            .col_expr(scheduled_backups::Column::NextRunAt, Expr::value(next_run_at))
            .col_expr(scheduled_backups::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(scheduled_backups::Column::Id.eq(id))
            .exec(&self.conn)
            .await
            .context("Failed to advance schedule")?;

        Ok(())
    }

    pub async fn delete(&self, id: i32) -> Result<bool> {
        let result = ScheduledBackups::delete_by_id(id)
            .exec(&self.conn)
            .await
            .context("Failed to delete scheduled backup")?;

        Ok(result.rows_affected > 0)
    }
}
