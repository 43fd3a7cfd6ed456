use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "api_keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    pub name: String,

    /// SHA-256 hex digest of the full key
    #[sea_orm(unique)]
    pub key_hash: String,

    /// Leading characters of the key, kept for display only
    pub key_prefix: String,

    /// Comma separated: `read`, `write`, `admin`
    pub permissions: String,

    pub created_by: Option<i32>,

    pub expires_at: Option<DateTimeUtc>,

    pub last_used_at: Option<DateTimeUtc>,

    pub is_active: bool,

    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
