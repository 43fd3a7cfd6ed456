use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, sea_query::Expr,
};

use crate::entities::{api_keys, prelude::*};

#[derive(Debug, Clone)]
pub struct NewApiKey {
    pub name: String,
    pub key_hash: String,
    pub key_prefix: String,
    pub permissions: String,
    pub created_by: Option<i32>,
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct ApiKeyRepository {
    conn: DatabaseConnection,
}

impl ApiKeyRepository {
    #[must_use]
    pub const fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    pub async fn create(&self, key: NewApiKey) -> Result<api_keys::Model> {
        api_keys::ActiveModel {
            name: Set(key.name),
            key_hash: Set(key.key_hash),
            key_prefix: Set(key.key_prefix),
            permissions: Set(key.permissions),
            created_by: Set(key.created_by),
            expires_at: Set(key.expires_at),
            is_active: Set(true),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&self.conn)
        .await
        .context("Failed to insert API key")
    }

    pub async fn list(&self, skip: u64, limit: u64) -> Result<Vec<api_keys::Model>> {
        ApiKeys::find()
            .order_by_desc(api_keys::Column::CreatedAt)
            .offset(skip)
            .limit(limit)
            .all(&self.conn)
            .await
            .context("Failed to list API keys")
    }

    pub async fn get(&self, id: i32) -> Result<Option<api_keys::Model>> {
        ApiKeys::find_by_id(id)
            .one(&self.conn)
            .await
            .context("Failed to query API key")
    }

    pub async fn find_by_hash(&self, key_hash: &str) -> Result<Option<api_keys::Model>> {
        ApiKeys::find()
            .filter(api_keys::Column::KeyHash.eq(key_hash))
            .one(&self.conn)
            .await
            .context("Failed to query API key by hash")
    }

    pub async fn touch(&self, id: i32) -> Result<()> {
        ApiKeys::update_many()
            .col_expr(api_keys::Column::LastUsedAt, Expr::value(Some(Utc::now())))
            .filter(api_keys::Column::Id.eq(id))
            .exec(&self.conn)
            .await
            .context("Failed to record API key use")?;

        Ok(())
    }

    pub async fn revoke(&self, id: i32) -> Result<bool> {
        let result = ApiKeys::update_many()
            .col_expr(api_keys::Column::IsActive, Expr::value(false))
            .filter(api_keys::Column::Id.eq(id))
            .exec(&self.conn)
            .await
            .context("Failed to revoke API key")?;

        Ok(result.rows_affected > 0)
    }

    pub async fn delete(&self, id: i32) -> Result<bool> {
        let result = ApiKeys::delete_by_id(id)
            .exec(&self.conn)
            .await
            .context("Failed to delete API key")?;

        Ok(result.rows_affected > 0)
    }
}
