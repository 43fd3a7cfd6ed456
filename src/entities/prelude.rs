pub use super::api_keys::Entity as ApiKeys;
pub use super::audit_logs::Entity as AuditLogs;
pub use super::backups::Entity as Backups;
pub use super::job_transitions::Entity as JobTransitions;
pub use super::ldap_servers::Entity as LdapServers;
pub use super::restore_jobs::Entity as RestoreJobs;
pub use super::scheduled_backups::Entity as ScheduledBackups;
pub use super::system_settings::Entity as SystemSettings;
pub use super::users::Entity as Users;
