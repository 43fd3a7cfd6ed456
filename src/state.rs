use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};

use crate::config::Config;
use crate::db::Store;
use crate::domain::events::JobEvent;
use crate::services::connector::RetryPolicy;
use crate::services::connector::ldap::LdapDirectoryConnector;
use crate::services::credentials::CredentialStore;
use crate::services::ledger::JobLedger;
use crate::services::worker::QueuedJob;
use crate::services::{
    AuthService, BackupEngine, DirectoryConnector, EngineSettings, JobQueue, JobRunner,
    ResilientConnector, RestoreEngine, RetentionService, ScheduleRunner, SeaOrmAuthService,
};

#[derive(Clone)]
pub struct SharedState {
    pub config: Arc<RwLock<Config>>,

    pub store: Store,

    pub credentials: CredentialStore,

    /// Retrying wrapper around the real directory connector.
    pub connector: Arc<dyn DirectoryConnector>,

    pub ledger: JobLedger,

    pub backup_engine: BackupEngine,

    pub restore_engine: RestoreEngine,

    pub retention: RetentionService,

    pub queue: JobQueue,

    /// Consumer side of `queue`, taken once by the worker pool.
    job_receiver: Arc<Mutex<Option<mpsc::Receiver<QueuedJob>>>>,

    pub schedule_runner: ScheduleRunner,

    pub auth_service: Arc<dyn AuthService>,

    pub event_bus: broadcast::Sender<JobEvent>,
}

impl SharedState {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let connector = Arc::new(LdapDirectoryConnector::new(&config.ldap));
        Self::with_connector(config, connector).await
    }

    /// Builds the state around a caller-supplied connector.
    pub async fn with_connector(
        config: Config,
        connector: Arc<dyn DirectoryConnector>,
    ) -> anyhow::Result<Self> {
        let store = Store::with_pool_options(
            &config.general.database_path,
            config.general.max_db_connections,
            config.general.min_db_connections,
        )
        .await?;

        let credentials = CredentialStore::from_secret(&config.security.encryption_key)
            .map_err(|e| anyhow::anyhow!("Invalid security.encryption_key: {e}"))?;

        let connector: Arc<dyn DirectoryConnector> = Arc::new(ResilientConnector::new(
            connector,
            RetryPolicy::from_config(&config.ldap),
        ));

        let (event_bus, _) = broadcast::channel(config.general.event_bus_buffer_size.max(1));
        let ledger = JobLedger::new(store.clone());

        let backup_engine = BackupEngine::new(
            store.clone(),
            ledger.clone(),
            credentials.clone(),
            connector.clone(),
            event_bus.clone(),
            EngineSettings::from_config(&config),
        );

        let restore_engine = RestoreEngine::new(
            store.clone(),
            ledger.clone(),
            credentials.clone(),
            connector.clone(),
            event_bus.clone(),
        );

        let retention = RetentionService::new(store.clone());

        let (queue, job_receiver) = JobQueue::new(config.jobs.queue_capacity);

        let schedule_runner = ScheduleRunner::new(
            store.clone(),
            backup_engine.clone(),
            queue.clone(),
            event_bus.clone(),
        );

        let auth_service = Arc::new(SeaOrmAuthService::new(
            store.clone(),
            config.security.clone(),
        )) as Arc<dyn AuthService + Send + Sync + 'static>;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            store,
            credentials,
            connector,
            ledger,
            backup_engine,
            restore_engine,
            retention,
            queue,
            job_receiver: Arc::new(Mutex::new(Some(job_receiver))),
            schedule_runner,
            auth_service,
            event_bus,
        })
    }

    pub async fn config(&self) -> Config {
        self.config.read().await.clone()
    }

    #[must_use]
    pub fn job_runner(&self) -> JobRunner {
        JobRunner::new(
            self.store.clone(),
            self.ledger.clone(),
            self.backup_engine.clone(),
            self.restore_engine.clone(),
            self.retention.clone(),
        )
    }

    /// Hands the queue's receiver to the worker pool. `None` once taken.
    pub async fn take_job_receiver(&self) -> Option<mpsc::Receiver<QueuedJob>> {
        self.job_receiver.lock().await.take()
    }
}
