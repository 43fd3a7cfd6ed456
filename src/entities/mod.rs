pub mod prelude;

pub mod api_keys;
pub mod audit_logs;
pub mod backups;
pub mod job_transitions;
pub mod ldap_servers;
pub mod restore_jobs;
pub mod scheduled_backups;
pub mod system_settings;
pub mod users;
