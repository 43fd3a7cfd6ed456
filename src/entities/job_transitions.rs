use sea_orm::entity::prelude::*;

/// Append-only history of job status changes.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "job_transitions")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// `backup` or `restore`
    pub job_kind: String,

    pub job_id: i32,

    /// `None` for the creation record.
    pub from_status: Option<String>,

    pub to_status: String,

    pub reason: Option<String>,

    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
