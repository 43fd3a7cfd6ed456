use sea_orm::entity::prelude::*;

// No foreign key to `backups`: retention may expire a backup while its
// restore history is kept.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "restore_jobs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    pub backup_id: i32,

    /// Target server the entries are written to.
    pub ldap_server_id: i32,

    pub status: String,

    pub selective_restore: bool,

    pub restore_filter: Option<String>,

    pub point_in_time: Option<DateTimeUtc>,

    pub entries_restored: i64,

    pub entries_skipped: i64,

    pub entries_failed: i64,

    pub created_by: Option<i32>,

    pub error_message: Option<String>,

    pub started_at: Option<DateTimeUtc>,

    pub completed_at: Option<DateTimeUtc>,

    pub created_at: DateTimeUtc,

    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
