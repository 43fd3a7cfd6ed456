use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "backups")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    pub ldap_server_id: i32,

    /// Type actually performed; an incremental without a parent is recorded as `full`.
    pub backup_type: String,

    pub status: String,

    pub file_path: Option<String>,

    pub file_size: Option<i64>,

    pub entry_count: Option<i64>,

    pub encrypted: bool,

    pub compression_enabled: bool,

    /// SHA-256 of the post-transform payload, mirrored from the manifest.
    pub checksum: Option<String>,

    /// Backup this incremental was taken against.
    pub parent_backup_id: Option<i32>,

    /// Set when the run was started by a schedule.
    pub scheduled_backup_id: Option<i32>,

    pub created_by: Option<i32>,

    pub error_message: Option<String>,

    pub started_at: Option<DateTimeUtc>,

    pub completed_at: Option<DateTimeUtc>,

    pub created_at: DateTimeUtc,

    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::ldap_servers::Entity",
        from = "Column::LdapServerId",
        to = "super::ldap_servers::Column::Id",
        on_update = "NoAction",
        on_delete = "NoAction"
    )]
    LdapServers,
}

impl Related<super::ldap_servers::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::LdapServers.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
