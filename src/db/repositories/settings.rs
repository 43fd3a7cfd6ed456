use anyhow::{Context, Result};
use chrono::Utc;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait, sea_query::OnConflict,
};

use crate::entities::{prelude::*, system_settings};

pub struct SettingsRepository {
    conn: DatabaseConnection,
}

impl SettingsRepository {
    #[must_use]
    pub const fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    pub async fn list(&self) -> Result<Vec<system_settings::Model>> {
        SystemSettings::find()
            .order_by_asc(system_settings::Column::Key)
            .all(&self.conn)
            .await
            .context("Failed to list settings")
    }

    pub async fn get(&self, key: &str) -> Result<Option<system_settings::Model>> {
        SystemSettings::find()
            .filter(system_settings::Column::Key.eq(key))
            .one(&self.conn)
            .await
            .context("Failed to query setting")
    }

    pub async fn upsert(&self, key: &str, value: &str) -> Result<system_settings::Model> {
        upsert_on(&self.conn, key, value).await?;
        self.get(key)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Setting {key} vanished after upsert"))
    }

    /// Writes all pairs or none.
    pub async fn upsert_many(&self, pairs: &[(String, String)]) -> Result<usize> {
        let txn = self.conn.begin().await.context("Failed to begin transaction")?;
        for (key, value) in pairs {
            upsert_on(&txn, key, value).await?;
        }
        txn.commit().await.context("Failed to commit settings")?;
        Ok(pairs.len())
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let result = SystemSettings::delete_many()
            .filter(system_settings::Column::Key.eq(key))
            .exec(&self.conn)
            .await
            .context("Failed to delete setting")?;

        Ok(result.rows_affected > 0)
    }
}

async fn upsert_on<C: ConnectionTrait>(conn: &C, key: &str, value: &str) -> Result<()> {
    let model = system_settings::ActiveModel {
        key: Set(key.to_string()),
        value: Set(value.to_string()),
        updated_at: Set(Utc::now()),
        ..Default::default()
    };

    SystemSettings::insert(model)
        .on_conflict(
            OnConflict::column(system_settings::Column::Key)
                .update_columns([
                    system_settings::Column::Value,
                    system_settings::Column::UpdatedAt,
                ])
                .to_owned(),
        )
        .exec(conn)
        .await
        .with_context(|| format!("Failed to upsert setting {key}"))?;

    Ok(())
}
