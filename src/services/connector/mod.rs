//! Directory access.
//!
//! Engines only see [`DirectoryConnector`] and [`DirectorySession`]. The
//! production implementation speaks LDAP through `ldap3`; the in-memory one
//! backs the tests. [`ResilientConnector`] wraps either with bounded retries
//! for transient failures.

pub mod ldap;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::config::LdapConfig;
use crate::db::LdapServer;
use crate::domain::entry::DirectoryEntry;
use crate::services::credentials::{CredentialError, CredentialStore};

/// Where and as whom to connect. Carries the bind password in clear, so it
/// only lives for the duration of a job.
#[derive(Clone)]
pub struct DirectoryTarget {
    pub host: String,
    pub port: u16,
    pub use_ssl: bool,
    pub base_dn: String,
    pub bind_dn: Option<String>,
    pub bind_password: Option<String>,
}

impl DirectoryTarget {
    /// Builds a target from a stored server, unsealing its bind password.
    pub fn from_server(
        server: &LdapServer,
        credentials: &CredentialStore,
    ) -> Result<Self, CredentialError> {
        let bind_password = server
            .bind_password
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|sealed| credentials.open(sealed))
            .transpose()?;

        Ok(Self {
            host: server.host.clone(),
            port: u16::try_from(server.port).unwrap_or(389),
            use_ssl: server.use_ssl,
            base_dn: server.base_dn.clone(),
            bind_dn: server.bind_dn.clone().filter(|d| !d.is_empty()),
            bind_password,
        })
    }

    #[must_use]
    pub fn url(&self) -> String {
        let scheme = if self.use_ssl { "ldaps" } else { "ldap" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Debug for DirectoryTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryTarget")
            .field("url", &self.url())
            .field("base_dn", &self.base_dn)
            .field("bind_dn", &self.bind_dn)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub base_dn: String,
    pub filter: String,
    pub attributes: Vec<String>,
    pub page_size: u32,
}

impl SearchRequest {
    /// Whole subtree with user and operational attributes.
    #[must_use]
    pub fn subtree(base_dn: &str, filter: &str, page_size: u32) -> Self {
        Self {
            base_dn: base_dn.to_string(),
            filter: filter.to_string(),
            attributes: vec!["*".to_string(), "+".to_string()],
            page_size,
        }
    }
}

#[derive(Debug, Default)]
pub struct SearchPage {
    pub entries: Vec<DirectoryEntry>,
    /// Continuation cookie; `None` on the last page.
    pub cookie: Option<Vec<u8>>,
}

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("server unavailable: {0}")]
    Unavailable(String),

    #[error("bind rejected: {0}")]
    AuthFailed(String),

    /// Timeouts, resets and busy servers. Retried by [`ResilientConnector`].
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("entry already exists: {0}")]
    AlreadyExists(String),

    #[error("operation failed (rc={code}): {message}")]
    Operation { code: u32, message: String },
}

impl ConnectorError {
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::AuthFailed(_) => "auth_failed",
            Self::Transient(_) => "transient",
            Self::AlreadyExists(_) => "already_exists",
            Self::Operation { .. } => "operation",
        }
    }
}

#[async_trait::async_trait]
pub trait DirectoryConnector: Send + Sync {
    /// Opens and binds a session. The caller must `close` it on every path.
    async fn connect(
        &self,
        target: &DirectoryTarget,
    ) -> Result<Box<dyn DirectorySession>, ConnectorError>;
}

#[async_trait::async_trait]
pub trait DirectorySession: Send {
    async fn search_page(
        &mut self,
        request: &SearchRequest,
        cookie: Option<&[u8]>,
    ) -> Result<SearchPage, ConnectorError>;

    async fn add(&mut self, entry: &DirectoryEntry) -> Result<(), ConnectorError>;

    async fn close(&mut self) -> Result<(), ConnectorError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: u32,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &LdapConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts.max(1),
            initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            backoff_multiplier: 2,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

fn record_failure(op: &'static str, err: &ConnectorError) {
    metrics::counter!("ldapguard_ldap_connection_errors_total", "kind" => err.kind())
        .increment(1);
    if err.is_transient() {
        warn!(operation = op, error = %err, "Transient directory failure");
    }
}

/// Retries transient failures of the wrapped connector and of the sessions
/// it hands out. Other errors pass through untouched.
///
/// A transient failure inside a session is treated as a lost connection:
/// the session is reopened before the next attempt.
pub struct ResilientConnector {
    inner: Arc<dyn DirectoryConnector>,
    policy: RetryPolicy,
}

impl ResilientConnector {
    #[must_use]
    pub fn new(inner: Arc<dyn DirectoryConnector>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

async fn connect_with_retry(
    connector: &dyn DirectoryConnector,
    target: &DirectoryTarget,
    policy: RetryPolicy,
) -> Result<Box<dyn DirectorySession>, ConnectorError> {
    let mut attempt = 1;
    loop {
        match connector.connect(target).await {
            Ok(session) => return Ok(session),
            Err(e) => {
                record_failure("connect", &e);
                if !e.is_transient() || attempt >= policy.max_attempts {
                    return Err(e);
                }
                tokio::time::sleep(policy.delay_for(attempt)).await;
                attempt += 1;
            }
        }
    }
}

#[async_trait::async_trait]
impl DirectoryConnector for ResilientConnector {
    async fn connect(
        &self,
        target: &DirectoryTarget,
    ) -> Result<Box<dyn DirectorySession>, ConnectorError> {
        let session = connect_with_retry(self.inner.as_ref(), target, self.policy).await?;
        Ok(Box::new(ResilientSession {
            connector: Arc::clone(&self.inner),
            target: target.clone(),
            inner: session,
            policy: self.policy,
            delivered: 0,
            reconnected: false,
        }))
    }
}

struct ResilientSession {
    connector: Arc<dyn DirectoryConnector>,
    target: DirectoryTarget,
    inner: Box<dyn DirectorySession>,
    policy: RetryPolicy,
    /// Entries handed out by the current paged search.
    delivered: usize,
    /// Set when the connection was reopened since the last page.
    reconnected: bool,
}

impl ResilientSession {
    /// Drops the broken connection and opens a fresh one.
    async fn reconnect(&mut self) -> Result<(), ConnectorError> {
        self.inner.close().await.ok();
        self.inner =
            connect_with_retry(self.connector.as_ref(), &self.target, self.policy).await?;
        self.reconnected = true;
        Ok(())
    }

    /// Paging cookies are usually bound to the connection that issued them.
    /// After a reconnect the old cookie is tried first; when the server no
    /// longer accepts it the search starts over and skips what was already
    /// delivered.
    async fn fetch_page(
        &mut self,
        request: &SearchRequest,
        cookie: Option<&[u8]>,
    ) -> Result<SearchPage, ConnectorError> {
        let resumed = self.inner.search_page(request, cookie).await;
        let stale_cookie = cookie.is_some()
            && self.reconnected
            && matches!(resumed, Err(ConnectorError::Operation { .. }));
        if !stale_cookie {
            return resumed;
        }

        warn!(
            skipped = self.delivered,
            "Paging cookie rejected after reconnect, restarting search"
        );
        let mut skip = self.delivered;
        let mut restart: Option<Vec<u8>> = None;
        loop {
            let mut page = self.inner.search_page(request, restart.as_deref()).await?;
            if page.entries.len() > skip || page.cookie.is_none() {
                page.entries.drain(..skip.min(page.entries.len()));
                return Ok(page);
            }
            skip -= page.entries.len();
            restart = page.cookie;
        }
    }
}

#[async_trait::async_trait]
impl DirectorySession for ResilientSession {
    async fn search_page(
        &mut self,
        request: &SearchRequest,
        cookie: Option<&[u8]>,
    ) -> Result<SearchPage, ConnectorError> {
        if cookie.is_none() {
            self.delivered = 0;
        }

        let mut attempt = 1;
        loop {
            match self.fetch_page(request, cookie).await {
                Ok(page) => {
                    self.reconnected = false;
                    self.delivered += page.entries.len();
                    return Ok(page);
                }
                Err(e) => {
                    record_failure("search", &e);
                    if !e.is_transient() || attempt >= self.policy.max_attempts {
                        return Err(e);
                    }
                    tokio::time::sleep(self.policy.delay_for(attempt)).await;
                    self.reconnect().await?;
                    attempt += 1;
                }
            }
        }
    }

    async fn add(&mut self, entry: &DirectoryEntry) -> Result<(), ConnectorError> {
        let mut attempt = 1;
        loop {
            match self.inner.add(entry).await {
                Ok(()) => return Ok(()),
                Err(ConnectorError::AlreadyExists(dn)) => {
                    return Err(ConnectorError::AlreadyExists(dn));
                }
                Err(e) => {
                    record_failure("add", &e);
                    if !e.is_transient() || attempt >= self.policy.max_attempts {
                        return Err(e);
                    }
                    tokio::time::sleep(self.policy.delay_for(attempt)).await;
                    self.reconnect().await?;
                    attempt += 1;
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), ConnectorError> {
        self.inner.close().await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionTestResult {
    pub success: bool,
    pub message: String,
    pub entries_found: usize,
}

/// Binds, reads one page under the base DN and closes.
pub async fn test_connection(
    connector: &dyn DirectoryConnector,
    target: &DirectoryTarget,
    page_size: u32,
) -> Result<ConnectionTestResult, ConnectorError> {
    let mut session = connector.connect(target).await?;

    let request = SearchRequest {
        base_dn: target.base_dn.clone(),
        filter: "(objectClass=*)".to_string(),
        attributes: vec!["1.1".to_string()],
        page_size: page_size.min(100),
    };
    let result = session.search_page(&request, None).await;
    session.close().await.ok();

    let page = result?;
    Ok(ConnectionTestResult {
        success: true,
        message: format!("Connected to {}", target.url()),
        entries_found: page.entries.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryConnector;
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2,
        }
    }

    #[test]
    fn test_backoff_is_bounded() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(1000),
            backoff_multiplier: 2,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_transient_connect_failures_are_retried() {
        let memory = Arc::new(MemoryConnector::new());
        let target = memory.add_directory("dc=example,dc=org", Vec::new());
        memory.fail_next_connects(2);

        let connector = ResilientConnector::new(memory.clone(), policy());
        let mut session = connector.connect(&target).await.unwrap();
        session.close().await.unwrap();

        assert_eq!(memory.connect_attempts(), 3);
        assert_eq!(memory.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_retries_give_up_after_max_attempts() {
        let memory = Arc::new(MemoryConnector::new());
        let target = memory.add_directory("dc=example,dc=org", Vec::new());
        memory.fail_next_connects(10);

        let connector = ResilientConnector::new(memory.clone(), policy());
        let err = connector.connect(&target).await.err().unwrap();

        assert!(err.is_transient());
        assert_eq!(memory.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retried() {
        let memory = Arc::new(MemoryConnector::new());
        let mut target = memory.add_directory("dc=example,dc=org", Vec::new());
        target.bind_password = Some("wrong".to_string());

        let connector = ResilientConnector::new(memory.clone(), policy());
        let err = connector.connect(&target).await.err().unwrap();

        assert!(matches!(err, ConnectorError::AuthFailed(_)));
        assert_eq!(memory.connect_attempts(), 1);
    }

    fn directory(memory: &MemoryConnector, n: usize) -> DirectoryTarget {
        let mut entries = vec![DirectoryEntry::new("dc=example,dc=org")];
        for i in 0..n {
            entries.push(DirectoryEntry::new(format!("cn=user{i},dc=example,dc=org")));
        }
        memory.add_directory("dc=example,dc=org", entries)
    }

    async fn read_all(session: &mut Box<dyn DirectorySession>) -> Vec<String> {
        let request = SearchRequest::subtree("dc=example,dc=org", "(objectClass=*)", 4);
        let mut cookie: Option<Vec<u8>> = None;
        let mut seen = Vec::new();
        loop {
            let page = session
                .search_page(&request, cookie.as_deref())
                .await
                .unwrap();
            seen.extend(page.entries.into_iter().map(|e| e.dn));
            cookie = page.cookie;
            if cookie.is_none() {
                return seen;
            }
        }
    }

    #[tokio::test]
    async fn test_lost_session_is_reopened_mid_search() {
        let memory = Arc::new(MemoryConnector::new());
        let target = directory(&memory, 10);
        memory.reset_connection_after(2);

        let connector = ResilientConnector::new(memory.clone(), policy());
        let mut session = connector.connect(&target).await.unwrap();
        let mut seen = read_all(&mut session).await;
        session.close().await.unwrap();

        assert_eq!(seen.len(), 11);
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 11);
        assert_eq!(memory.connect_attempts(), 2);
        assert_eq!(memory.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_lost_session_without_retries_fails() {
        let memory = Arc::new(MemoryConnector::new());
        let target = directory(&memory, 10);
        memory.reset_connection_after(1);

        let single = RetryPolicy {
            max_attempts: 1,
            ..policy()
        };
        let connector = ResilientConnector::new(memory.clone(), single);
        let mut session = connector.connect(&target).await.unwrap();
        let request = SearchRequest::subtree("dc=example,dc=org", "(objectClass=*)", 4);

        let first = session.search_page(&request, None).await.unwrap();
        let err = session
            .search_page(&request, first.cookie.as_deref())
            .await
            .err()
            .unwrap();
        session.close().await.unwrap();

        assert!(err.is_transient());
        assert_eq!(memory.open_sessions(), 0);
    }
}
