use anyhow::Result;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Statement};
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub mod migrator;
pub mod repositories;

pub use crate::entities::api_keys::Model as ApiKey;
pub use crate::entities::audit_logs::Model as AuditLog;
pub use crate::entities::backups::Model as Backup;
pub use crate::entities::job_transitions::Model as JobTransition;
pub use crate::entities::ldap_servers::Model as LdapServer;
pub use crate::entities::restore_jobs::Model as RestoreJob;
pub use crate::entities::scheduled_backups::Model as ScheduledBackup;
pub use crate::entities::system_settings::Model as Setting;
pub use repositories::user::User;

#[derive(Clone)]
pub struct Store {
    pub conn: DatabaseConnection,
}

impl Store {
    pub async fn new(db_url: &str) -> Result<Self> {
        Self::with_pool_options(db_url, 5, 1).await
    }

    pub async fn with_pool_options(
        db_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self> {
        use sea_orm_migration::MigratorTrait;

        if !db_url.contains(":memory:") {
            let path_str = db_url.trim_start_matches("sqlite://").trim_start_matches("sqlite:");
            let path_str = path_str.split('?').next().unwrap_or(path_str);
            if let Some(parent) = Path::new(path_str).parent() {
                tokio::fs::create_dir_all(parent).await.ok();
            }
            if !Path::new(path_str).exists() {
                std::fs::File::create(path_str)?;
            }
        }

        let mut opt = ConnectOptions::new(db_url.to_string());
        opt.max_connections(max_connections)
            .min_connections(min_connections)
            .connect_timeout(Duration::from_secs(10))
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300))
            .max_lifetime(Duration::from_secs(600))
            .sqlx_logging(false);

        let conn = Database::connect(opt).await?;

        migrator::Migrator::up(&conn, None).await?;

        info!(
            "Database connected & migrations applied (pool: {}-{})",
            min_connections, max_connections
        );

        Ok(Self { conn })
    }

    pub async fn ping(&self) -> Result<()> {
        let backend = self.conn.get_database_backend();
        self.conn
            .query_one(Statement::from_string(backend, "SELECT 1".to_string()))
            .await?;
        Ok(())
    }

    #[must_use]
    pub fn users(&self) -> repositories::user::UserRepository {
        repositories::user::UserRepository::new(self.conn.clone())
    }

    #[must_use]
    pub fn ldap_servers(&self) -> repositories::ldap_server::LdapServerRepository {
        repositories::ldap_server::LdapServerRepository::new(self.conn.clone())
    }

    #[must_use]
    pub fn backups(&self) -> repositories::backup::BackupRepository {
        repositories::backup::BackupRepository::new(self.conn.clone())
    }

    #[must_use]
    pub fn restores(&self) -> repositories::restore::RestoreRepository {
        repositories::restore::RestoreRepository::new(self.conn.clone())
    }

    #[must_use]
    pub fn schedules(&self) -> repositories::schedule::ScheduleRepository {
        repositories::schedule::ScheduleRepository::new(self.conn.clone())
    }

    #[must_use]
    pub fn api_keys(&self) -> repositories::api_key::ApiKeyRepository {
        repositories::api_key::ApiKeyRepository::new(self.conn.clone())
    }

    #[must_use]
    pub fn settings(&self) -> repositories::settings::SettingsRepository {
        repositories::settings::SettingsRepository::new(self.conn.clone())
    }

    #[must_use]
    pub fn ledger(&self) -> repositories::ledger::LedgerRepository {
        repositories::ledger::LedgerRepository::new(self.conn.clone())
    }

    fn audit_repo(&self) -> repositories::audit::AuditRepository {
        repositories::audit::AuditRepository::new(self.conn.clone())
    }

    pub async fn add_audit(&self, entry: repositories::audit::NewAuditLog) -> Result<()> {
        self.audit_repo().add(entry).await
    }

    pub async fn list_audit(
        &self,
        filter: &repositories::audit::AuditFilter,
        skip: u64,
        limit: u64,
    ) -> Result<Vec<AuditLog>> {
        self.audit_repo().list(filter, skip, limit).await
    }

    pub async fn get_audit(&self, id: i64) -> Result<Option<AuditLog>> {
        self.audit_repo().get(id).await
    }
}
