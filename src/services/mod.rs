pub mod artifact;
pub mod credentials;
pub mod ledger;

pub mod connector;
pub use connector::{DirectoryConnector, DirectorySession, DirectoryTarget, ResilientConnector};

pub mod backup_engine;
pub use backup_engine::{BackupEngine, BackupError, BackupRequest, EngineSettings};

pub mod restore_engine;
pub use restore_engine::{RestoreEngine, RestoreError, RestoreRequest};

pub mod retention;
pub use retention::{DeletionActor, RetentionError, RetentionService};

pub mod worker;
pub use worker::{JobQueue, JobRunner, WorkerPool};

pub mod scheduler;
pub use scheduler::{ScheduleError, ScheduleRunner, Scheduler};

pub mod notifier;
pub use notifier::WebhookNotifier;

pub mod auth_service;
pub mod auth_service_impl;
pub use auth_service::{AuthError, AuthService, LoginResult, Principal};
pub use auth_service_impl::SeaOrmAuthService;
