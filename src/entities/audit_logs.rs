use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "audit_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// `None` for actions taken by the system (scheduler, recovery sweep).
    pub user_id: Option<i32>,

    pub action: String,

    pub resource_type: String,

    pub resource_id: Option<String>,

    /// JSON document
    pub details: Option<String>,

    pub ip_address: Option<String>,

    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
