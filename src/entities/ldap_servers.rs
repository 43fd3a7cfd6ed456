use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "ldap_servers")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    #[sea_orm(unique)]
    pub name: String,

    pub host: String,

    pub port: i32,

    pub use_ssl: bool,

    pub base_dn: String,

    pub bind_dn: Option<String>,

    /// Sealed with the credential store; never leaves the process in clear.
    pub bind_password: Option<String>,

    pub description: Option<String>,

    pub is_active: bool,

    pub created_at: DateTimeUtc,

    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::backups::Entity")]
    Backups,
    #[sea_orm(has_many = "super::scheduled_backups::Entity")]
    ScheduledBackups,
}

impl Related<super::backups::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Backups.def()
    }
}

impl Related<super::scheduled_backups::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ScheduledBackups.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
