#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use ldapguard::config::Config;
use ldapguard::db::LdapServer;
use ldapguard::db::repositories::ldap_server::NewLdapServer;
use ldapguard::domain::entry::DirectoryEntry;
use ldapguard::services::DirectoryTarget;
use ldapguard::services::connector::memory::MemoryConnector;
use ldapguard::state::SharedState;

pub const BASE_DN: &str = "dc=example,dc=org";

/// Scratch directory holding the database file and the artifacts of one test.
pub fn scratch_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("ldapguard-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn test_config(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.general.database_path = format!("sqlite:{}", dir.join("ldapguard.db").display());
    config.storage.backup_dir = dir.join("backups").display().to_string();
    config.ldap.page_size = 10;
    config.ldap.retry_initial_delay_ms = 1;
    config.ldap.retry_max_delay_ms = 5;
    config.security.argon2_memory_cost_kib = 1024;
    config.security.argon2_time_cost = 1;
    config
}

pub struct TestEnv {
    pub shared: Arc<SharedState>,
    pub memory: MemoryConnector,
    pub dir: PathBuf,
}

impl TestEnv {
    pub async fn new() -> Self {
        let dir = scratch_dir();
        let memory = MemoryConnector::new();
        let shared = SharedState::with_connector(test_config(&dir), Arc::new(memory.clone()))
            .await
            .unwrap();
        Self {
            shared: Arc::new(shared),
            memory,
            dir,
        }
    }

    /// Registers a stored server pointing at an in-memory directory, binding
    /// with the target's password.
    pub async fn add_server(&self, name: &str, target: &DirectoryTarget) -> LdapServer {
        let sealed = self
            .shared
            .credentials
            .seal(target.bind_password.as_deref().unwrap_or("secret"))
            .unwrap();
        self.shared
            .store
            .ldap_servers()
            .create(NewLdapServer {
                name: name.to_string(),
                host: target.host.clone(),
                port: i32::from(target.port),
                use_ssl: false,
                base_dn: target.base_dn.clone(),
                bind_dn: target.bind_dn.clone(),
                bind_password: Some(sealed),
                description: None,
                is_active: true,
            })
            .await
            .unwrap()
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.dir).ok();
    }
}

/// The base entry and `ou=people` without anyone in it.
pub fn skeleton() -> Vec<DirectoryEntry> {
    vec![
        DirectoryEntry::new(BASE_DN).with_attr("objectClass", ["domain"]),
        DirectoryEntry::new(format!("ou=people,{BASE_DN}"))
            .with_attr("objectClass", ["organizationalUnit"]),
    ]
}

pub fn person(cn: &str) -> DirectoryEntry {
    DirectoryEntry::new(format!("cn={cn},ou=people,{BASE_DN}"))
        .with_attr("objectClass", ["person"])
        .with_attr("cn", [cn])
        .with_attr("sn", ["Test"])
}

/// The skeleton plus `n` people named `user0`, `user1`, ...
pub fn people(n: usize) -> Vec<DirectoryEntry> {
    let mut entries = skeleton();
    entries.extend((0..n).map(|i| person(&format!("user{i}"))));
    entries
}
