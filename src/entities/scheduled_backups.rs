use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "scheduled_backups")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    #[sea_orm(unique)]
    pub name: String,

    pub ldap_server_id: i32,

    pub backup_type: String,

    pub cron_expression: String,

    pub retention_days: i32,

    pub encrypted: bool,

    pub compression_enabled: bool,

    pub is_active: bool,

    pub last_run_at: Option<DateTimeUtc>,

    pub next_run_at: Option<DateTimeUtc>,

    pub created_by: Option<i32>,

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
