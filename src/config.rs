use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::parser::cron::CronSchedule;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,

    pub server: ServerConfig,

    pub security: SecurityConfig,

    pub storage: StorageConfig,

    pub jobs: JobsConfig,

    pub scheduler: SchedulerConfig,

    pub ldap: LdapConfig,

    pub webhooks: WebhookConfig,

    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub database_path: String,

    pub log_level: String,

    /// Event bus buffer size (default: 100)
    pub event_bus_buffer_size: usize,

    /// Number of tokio worker threads (default: 2)
    /// Set to 0 to use the number of CPU cores
    pub worker_threads: usize,

    pub max_db_connections: u32,

    pub min_db_connections: u32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            database_path: "sqlite:data/ldapguard.db".to_string(),
            log_level: "info".to_string(),
            event_bus_buffer_size: 100,
            worker_threads: 2,
            max_db_connections: 5,
            min_db_connections: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,

    pub port: u16,

    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8000,
            cors_allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// HS256 signing secret for access tokens.
    /// Overridden by `LDAPGUARD_JWT_SECRET`.
    pub jwt_secret: String,

    pub access_token_expire_minutes: i64,

    /// Secret the AES-256-GCM key for bind passwords and artifacts is derived from.
    /// Overridden by `LDAPGUARD_ENCRYPTION_KEY`. Changing it makes existing
    /// encrypted artifacts and stored bind passwords unreadable.
    pub encryption_key: String,

    /// Argon2 memory cost in KiB
    pub argon2_memory_cost_kib: u32,

    pub argon2_time_cost: u32,

    pub argon2_parallelism: u32,

    /// Password given to users created through config import.
    pub imported_user_password: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "change-me-jwt-secret".to_string(),
            access_token_expire_minutes: 30,
            encryption_key: "change-me-encryption-key".to_string(),
            argon2_memory_cost_kib: 8192,
            argon2_time_cost: 3,
            argon2_parallelism: 1,
            imported_user_password: "changeme123".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backup_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backup_dir: "./backups".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Number of concurrent job workers.
    pub workers: usize,

    /// Bounded capacity of the in-process job queue.
    pub queue_capacity: usize,

    /// How often pending jobs are re-enqueued from the database.
    pub poll_interval_seconds: u64,

    /// Jobs stuck in `in_progress`/`cancelling` longer than this are failed at startup.
    pub stale_after_minutes: i64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 64,
            poll_interval_seconds: 15,
            stale_after_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,

    /// Six-field (with seconds) expression driving the due-schedule check.
    pub tick_cron: String,

    /// Six-field expression for the daily retention sweep.
    pub retention_cron: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_cron: "0 * * * * *".to_string(),
            retention_cron: "0 30 3 * * *".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LdapConfig {
    pub page_size: u32,

    pub connect_timeout_seconds: u64,

    pub operation_timeout_seconds: u64,

    /// Total attempts for transient connector failures (including the first).
    pub retry_attempts: u32,

    pub retry_initial_delay_ms: u64,

    pub retry_max_delay_ms: u64,

    /// Verify server certificates for `ldaps://` connections.
    pub tls_verify: bool,
}

impl Default for LdapConfig {
    fn default() -> Self {
        Self {
            page_size: 500,
            connect_timeout_seconds: 10,
            operation_timeout_seconds: 60,
            retry_attempts: 3,
            retry_initial_delay_ms: 200,
            retry_max_delay_ms: 5_000,
            tls_verify: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,

    pub url: String,

    pub timeout_seconds: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub metrics_enabled: bool,

    /// `text` or `json`
    pub log_format: String,

    pub loki_enabled: bool,

    pub loki_url: String,

    pub loki_labels: std::collections::HashMap<String, String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        let mut labels = std::collections::HashMap::new();
        labels.insert("app".to_string(), "ldapguard".to_string());

        Self {
            metrics_enabled: true,
            log_format: "text".to_string(),
            loki_enabled: false,
            loki_url: "http://localhost:3100".to_string(),
            loki_labels: labels,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let paths = Self::config_paths();

        let mut config = None;
        for path in &paths {
            if path.exists() {
                info!("Loading config from: {}", path.display());
                config = Some(Self::load_from_path(path)?);
                break;
            }
        }

        let mut config = config.unwrap_or_else(|| {
            info!("No config file found, using defaults");
            Self::default()
        });
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(secret) = std::env::var("LDAPGUARD_JWT_SECRET")
            && !secret.is_empty()
        {
            self.security.jwt_secret = secret;
        }
        if let Ok(key) = std::env::var("LDAPGUARD_ENCRYPTION_KEY")
            && !key.is_empty()
        {
            self.security.encryption_key = key;
        }
        if let Ok(path) = std::env::var("LDAPGUARD_DATABASE_PATH")
            && !path.is_empty()
        {
            self.general.database_path = path;
        }
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Config saved to: {}", path.display());
        Ok(())
    }

    fn config_paths() -> Vec<PathBuf> {
        let mut paths = vec![];

        paths.push(PathBuf::from("config.toml"));

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("ldapguard").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".ldapguard").join("config.toml"));
        }

        paths
    }

    fn default_config_path() -> PathBuf {
        PathBuf::from("config.toml")
    }

    pub fn create_default_if_missing() -> Result<bool> {
        let path = Self::default_config_path();
        if path.exists() {
            Ok(false)
        } else {
            let config = Self::default();
            config.save_to_path(&path)?;
            info!("Created default config file: {}", path.display());
            Ok(true)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.enabled && self.security.jwt_secret.trim().is_empty() {
            anyhow::bail!("security.jwt_secret cannot be empty when the server is enabled");
        }

        if self.security.encryption_key.trim().is_empty() {
            anyhow::bail!("security.encryption_key cannot be empty");
        }

        if self.security.access_token_expire_minutes <= 0 {
            anyhow::bail!("security.access_token_expire_minutes must be > 0");
        }

        if self.ldap.page_size == 0 {
            anyhow::bail!("ldap.page_size must be > 0");
        }

        if self.ldap.retry_attempts == 0 {
            anyhow::bail!("ldap.retry_attempts must be at least 1");
        }

        if self.jobs.workers == 0 {
            anyhow::bail!("jobs.workers must be > 0");
        }

        if self.webhooks.enabled && url::Url::parse(&self.webhooks.url).is_err() {
            anyhow::bail!("webhooks.url must be a valid URL when webhooks are enabled");
        }

        if self.scheduler.enabled {
            // tokio-cron-scheduler expects a seconds field; validate the
            // remaining five with our own parser.
            for expr in [&self.scheduler.tick_cron, &self.scheduler.retention_cron] {
                let fields: Vec<&str> = expr.split_whitespace().collect();
                if fields.len() != 6 {
                    anyhow::bail!("scheduler cron '{expr}' must have six fields (with seconds)");
                }
                CronSchedule::parse(&fields[1..].join(" "))
                    .map_err(|e| anyhow::anyhow!("scheduler cron '{expr}' is invalid: {e}"))?;
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn jwt_secret_is_default(&self) -> bool {
        self.security.jwt_secret == SecurityConfig::default().jwt_secret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.ldap.page_size, 500);
        assert_eq!(config.ldap.retry_attempts, 3);
        assert_eq!(config.security.access_token_expire_minutes, 30);
        assert_eq!(config.jobs.stale_after_minutes, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[ldap]"));
        assert!(toml_str.contains("[scheduler]"));
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            [general]
            log_level = "debug"

            [ldap]
            page_size = 100
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.ldap.page_size, 100);

        assert_eq!(config.storage.backup_dir, "./backups");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.ldap.page_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.scheduler.tick_cron = "0 * * *".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.webhooks.enabled = true;
        config.webhooks.url = "not a url".to_string();
        assert!(config.validate().is_err());
    }
}
