//! In-process directory used by the test-suite and for dry runs.
//!
//! Each directory registered with [`MemoryConnector::add_directory`] gets its
//! own `memory:<port>` address. Sessions see a live view of the entries, so
//! backups and restores against it behave like against a real server:
//! parents must exist before children, duplicates are rejected and searches
//! are paged. Paging cookies are only valid on the session that issued them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::domain::entry::{DirectoryEntry, normalize_dn};
use crate::parser::ldap_filter::Filter;

use super::{
    ConnectorError, DirectoryConnector, DirectorySession, DirectoryTarget, SearchPage,
    SearchRequest,
};

const HOST: &str = "memory";
const FIRST_PORT: u16 = 10389;
const RC_NO_SUCH_OBJECT: u32 = 32;
const RC_OTHER: u32 = 80;

struct Directory {
    base_dn: String,
    bind_dn: String,
    bind_password: String,
    entries: BTreeMap<String, DirectoryEntry>,
    adds: usize,
}

#[derive(Default)]
struct MemoryState {
    directories: HashMap<u16, Directory>,
    next_port: u16,
    connect_failures: u32,
    search_failures: u32,
    failing_adds: HashSet<String>,
    search_delay: Option<Duration>,
    reset_after_pages: Option<u32>,
    next_session: u64,
    connect_attempts: usize,
    open_sessions: usize,
}

#[derive(Clone, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        lock(&self.state)
    }

    /// Registers a directory holding `entries` and returns a target that
    /// binds to it as `cn=admin,<base>` / `secret`.
    pub fn add_directory(&self, base_dn: &str, entries: Vec<DirectoryEntry>) -> DirectoryTarget {
        let mut state = self.lock();
        let port = FIRST_PORT + state.next_port;
        state.next_port += 1;

        let bind_dn = format!("cn=admin,{base_dn}");
        state.directories.insert(
            port,
            Directory {
                base_dn: base_dn.to_string(),
                bind_dn: bind_dn.clone(),
                bind_password: "secret".to_string(),
                entries: entries
                    .into_iter()
                    .map(|e| (e.normalized_dn(), e))
                    .collect(),
                adds: 0,
            },
        );

        DirectoryTarget {
            host: HOST.to_string(),
            port,
            use_ssl: false,
            base_dn: base_dn.to_string(),
            bind_dn: Some(bind_dn),
            bind_password: Some("secret".to_string()),
        }
    }

    /// The next `n` connection attempts fail as transient.
    pub fn fail_next_connects(&self, n: u32) {
        self.lock().connect_failures = n;
    }

    pub fn fail_next_searches(&self, n: u32) {
        self.lock().search_failures = n;
    }

    /// Adds of this DN are rejected by the server.
    pub fn fail_adds_of(&self, dn: &str) {
        self.lock().failing_adds.insert(normalize_dn(dn));
    }

    /// After `pages` more search pages are served, the connection carrying
    /// the next search drops: that call and every later one on the same
    /// session fail as transient.
    pub fn reset_connection_after(&self, pages: u32) {
        self.lock().reset_after_pages = Some(pages);
    }

    /// Slows every search page down, leaving room to cancel a running job.
    pub fn set_search_delay(&self, delay: Duration) {
        self.lock().search_delay = Some(delay);
    }

    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    /// Sessions opened and not yet closed.
    #[must_use]
    pub fn open_sessions(&self) -> usize {
        self.lock().open_sessions
    }

    #[must_use]
    pub fn entries(&self, target: &DirectoryTarget) -> Vec<DirectoryEntry> {
        self.lock()
            .directories
            .get(&target.port)
            .map(|d| d.entries.values().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn get_entry(&self, target: &DirectoryTarget, dn: &str) -> Option<DirectoryEntry> {
        self.lock()
            .directories
            .get(&target.port)
            .and_then(|d| d.entries.get(&normalize_dn(dn)).cloned())
    }

    /// Successful adds performed through sessions.
    #[must_use]
    pub fn add_count(&self, target: &DirectoryTarget) -> usize {
        self.lock()
            .directories
            .get(&target.port)
            .map_or(0, |d| d.adds)
    }

    /// Inserts or replaces an entry directly, bypassing the protocol rules.
    pub fn put_entry(&self, target: &DirectoryTarget, entry: DirectoryEntry) {
        if let Some(dir) = self.lock().directories.get_mut(&target.port) {
            dir.entries.insert(entry.normalized_dn(), entry);
        }
    }

    pub fn remove_entry(&self, target: &DirectoryTarget, dn: &str) {
        if let Some(dir) = self.lock().directories.get_mut(&target.port) {
            dir.entries.remove(&normalize_dn(dn));
        }
    }
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    // A panicking test thread must not wedge every other test.
    state
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait::async_trait]
impl DirectoryConnector for MemoryConnector {
    async fn connect(
        &self,
        target: &DirectoryTarget,
    ) -> Result<Box<dyn DirectorySession>, ConnectorError> {
        let mut state = self.lock();
        state.connect_attempts += 1;

        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(ConnectorError::Transient(format!(
                "connection to {} reset",
                target.address()
            )));
        }

        let dir = match state.directories.get(&target.port) {
            Some(dir) if target.host == HOST => dir,
            _ => {
                return Err(ConnectorError::Unavailable(format!(
                    "connection refused: {}",
                    target.address()
                )));
            }
        };

        if let Some(bind_dn) = &target.bind_dn {
            let password_ok = target.bind_password.as_deref() == Some(dir.bind_password.as_str());
            if normalize_dn(bind_dn) != normalize_dn(&dir.bind_dn) || !password_ok {
                return Err(ConnectorError::AuthFailed(
                    "invalid credentials (rc=49)".to_string(),
                ));
            }
        }

        state.open_sessions += 1;
        state.next_session += 1;
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
            port: target.port,
            id: state.next_session,
            closed: false,
            dropped: false,
        }))
    }
}

struct MemorySession {
    state: Arc<Mutex<MemoryState>>,
    port: u16,
    id: u64,
    closed: bool,
    /// The simulated connection was reset.
    dropped: bool,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<(), ConnectorError> {
        if self.closed {
            return Err(ConnectorError::Unavailable("session closed".to_string()));
        }
        if self.dropped {
            return Err(ConnectorError::Transient("connection reset by peer".to_string()));
        }
        Ok(())
    }

    fn decode_cookie(&self, raw: &[u8]) -> Result<usize, ConnectorError> {
        let invalid = || ConnectorError::Operation {
            code: RC_OTHER,
            message: "invalid paging cookie".to_string(),
        };
        let bytes: [u8; 16] = raw.try_into().map_err(|_| invalid())?;
        let (session, offset) = bytes.split_at(8);
        let session = u64::from_be_bytes(session.try_into().map_err(|_| invalid())?);
        let offset = u64::from_be_bytes(offset.try_into().map_err(|_| invalid())?);
        if session != self.id {
            return Err(invalid());
        }
        Ok(usize::try_from(offset).unwrap_or(usize::MAX))
    }

    fn encode_cookie(&self, offset: usize) -> Vec<u8> {
        let mut cookie = self.id.to_be_bytes().to_vec();
        cookie.extend_from_slice(&u64::try_from(offset).unwrap_or(u64::MAX).to_be_bytes());
        cookie
    }
}

fn in_scope(normalized_dn: &str, normalized_base: &str) -> bool {
    normalized_dn == normalized_base || normalized_dn.ends_with(&format!(",{normalized_base}"))
}

fn parent_of(normalized_dn: &str) -> Option<&str> {
    let mut escaped = false;
    for (i, c) in normalized_dn.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            ',' if !escaped => return Some(&normalized_dn[i + 1..]),
            _ => escaped = false,
        }
    }
    None
}

#[async_trait::async_trait]
impl DirectorySession for MemorySession {
    async fn search_page(
        &mut self,
        request: &SearchRequest,
        cookie: Option<&[u8]>,
    ) -> Result<SearchPage, ConnectorError> {
        self.ensure_open()?;

        let delay = {
            let mut state = lock(&self.state);
            match state.reset_after_pages {
                Some(0) => {
                    state.reset_after_pages = None;
                    self.dropped = true;
                    return Err(ConnectorError::Transient("connection reset by peer".to_string()));
                }
                Some(n) => state.reset_after_pages = Some(n - 1),
                None => {}
            }
            if state.search_failures > 0 {
                state.search_failures -= 1;
                return Err(ConnectorError::Transient("search timed out".to_string()));
            }
            state.search_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let filter = Filter::parse(&request.filter).map_err(|e| ConnectorError::Operation {
            code: 87,
            message: e.to_string(),
        })?;
        let offset = cookie.map_or(Ok(0), |raw| self.decode_cookie(raw))?;

        let state = lock(&self.state);
        let dir = state
            .directories
            .get(&self.port)
            .ok_or_else(|| ConnectorError::Unavailable("directory vanished".to_string()))?;

        let base = normalize_dn(&request.base_dn);
        let dn_only = request.attributes.iter().any(|a| a == "1.1");
        let mut matching: Vec<&DirectoryEntry> = dir
            .entries
            .iter()
            .filter(|(dn, _)| in_scope(dn, &base))
            .map(|(_, e)| e)
            .filter(|e| filter.matches(e))
            .collect();
        matching.sort_by_key(|e| (e.depth(), e.normalized_dn()));

        let page_size = usize::try_from(request.page_size.max(1)).unwrap_or(usize::MAX);
        let end = offset.saturating_add(page_size).min(matching.len());
        let entries = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|e| {
                if dn_only {
                    DirectoryEntry::new(e.dn.clone())
                } else {
                    (*e).clone()
                }
            })
            .collect();

        let cookie = (end < matching.len()).then(|| self.encode_cookie(end));
        Ok(SearchPage { entries, cookie })
    }

    async fn add(&mut self, entry: &DirectoryEntry) -> Result<(), ConnectorError> {
        self.ensure_open()?;

        let mut state = lock(&self.state);
        let failing = state.failing_adds.contains(&entry.normalized_dn());
        let dir = state
            .directories
            .get_mut(&self.port)
            .ok_or_else(|| ConnectorError::Unavailable("directory vanished".to_string()))?;

        let dn = entry.normalized_dn();
        if failing {
            return Err(ConnectorError::Operation {
                code: RC_OTHER,
                message: format!("add of {} rejected", entry.dn),
            });
        }
        if dir.entries.contains_key(&dn) {
            return Err(ConnectorError::AlreadyExists(entry.dn.clone()));
        }

        let base = normalize_dn(&dir.base_dn);
        if dn != base {
            let parent_exists = parent_of(&dn).is_some_and(|p| dir.entries.contains_key(p));
            if !in_scope(&dn, &base) || !parent_exists {
                return Err(ConnectorError::Operation {
                    code: RC_NO_SUCH_OBJECT,
                    message: format!("no such object: parent of {}", entry.dn),
                });
            }
        }

        dir.entries.insert(dn, entry.clone());
        dir.adds += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ConnectorError> {
        if !self.closed {
            self.closed = true;
            let mut state = lock(&self.state);
            state.open_sessions = state.open_sessions.saturating_sub(1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn people(n: usize) -> Vec<DirectoryEntry> {
        let mut entries = vec![
            DirectoryEntry::new("dc=example,dc=org").with_attr("objectClass", ["domain"]),
            DirectoryEntry::new("ou=people,dc=example,dc=org")
                .with_attr("objectClass", ["organizationalUnit"]),
        ];
        for i in 0..n {
            entries.push(
                DirectoryEntry::new(format!("cn=user{i},ou=people,dc=example,dc=org"))
                    .with_attr("objectClass", ["person"])
                    .with_attr("cn", [format!("user{i}")]),
            );
        }
        entries
    }

    #[tokio::test]
    async fn test_paged_search_visits_every_entry_once() {
        let memory = MemoryConnector::new();
        let target = memory.add_directory("dc=example,dc=org", people(25));
        let mut session = memory.connect(&target).await.unwrap();

        let request = SearchRequest::subtree("dc=example,dc=org", "(objectClass=*)", 10);
        let mut cookie: Option<Vec<u8>> = None;
        let mut seen = Vec::new();
        let mut pages = 0;
        loop {
            let page = session
                .search_page(&request, cookie.as_deref())
                .await
                .unwrap();
            pages += 1;
            seen.extend(page.entries.into_iter().map(|e| e.dn));
            cookie = page.cookie;
            if cookie.is_none() {
                break;
            }
        }
        session.close().await.unwrap();

        assert_eq!(pages, 3);
        assert_eq!(seen.len(), 27);
        assert_eq!(seen[0], "dc=example,dc=org");
        assert_eq!(memory.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_add_requires_parent_and_rejects_duplicates() {
        let memory = MemoryConnector::new();
        let target = memory.add_directory("dc=example,dc=org", Vec::new());
        let mut session = memory.connect(&target).await.unwrap();

        let orphan = DirectoryEntry::new("cn=a,ou=missing,dc=example,dc=org");
        assert!(matches!(
            session.add(&orphan).await,
            Err(ConnectorError::Operation { code: 32, .. })
        ));

        let base = DirectoryEntry::new("dc=example,dc=org");
        session.add(&base).await.unwrap();
        assert!(matches!(
            session.add(&base).await,
            Err(ConnectorError::AlreadyExists(_))
        ));
        session.close().await.unwrap();

        assert_eq!(memory.add_count(&target), 1);
    }

    #[tokio::test]
    async fn test_unknown_address_is_unavailable() {
        let memory = MemoryConnector::new();
        let mut target = memory.add_directory("dc=example,dc=org", Vec::new());
        target.port = 1;

        assert!(matches!(
            memory.connect(&target).await.err(),
            Some(ConnectorError::Unavailable(_))
        ));
    }
}
