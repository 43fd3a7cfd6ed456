//! `ldap3` backed connector.

use std::collections::HashSet;
use std::time::Duration;

use ldap3::controls::{Control, ControlType, PagedResults, RawControl};
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapError, ResultEntry, Scope, SearchEntry};
use tracing::debug;

use crate::config::LdapConfig;
use crate::constants::ldap::{
    RC_BUSY, RC_ENTRY_ALREADY_EXISTS, RC_INVALID_CREDENTIALS, RC_UNAVAILABLE,
};
use crate::domain::entry::DirectoryEntry;

use super::{
    ConnectorError, DirectoryConnector, DirectorySession, DirectoryTarget, SearchPage,
    SearchRequest,
};

pub struct LdapDirectoryConnector {
    connect_timeout: Duration,
    operation_timeout: Duration,
    tls_verify: bool,
}

impl LdapDirectoryConnector {
    #[must_use]
    pub const fn new(config: &LdapConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.connect_timeout_seconds),
            operation_timeout: Duration::from_secs(config.operation_timeout_seconds),
            tls_verify: config.tls_verify,
        }
    }
}

fn map_error(err: LdapError) -> ConnectorError {
    match err {
        LdapError::Io { source } => ConnectorError::Transient(source.to_string()),
        LdapError::Timeout { elapsed } => {
            ConnectorError::Transient(format!("operation timed out after {elapsed:?}"))
        }
        LdapError::LdapResult { result } => map_result_code(result.rc, result.text),
        // The connection task has ended; the session has to be reopened.
        err @ (LdapError::OpSend { .. }
        | LdapError::ResultRecv { .. }
        | LdapError::IdScrubSend { .. }
        | LdapError::MiscSend { .. }
        | LdapError::EndOfStream) => {
            ConnectorError::Transient(format!("connection lost: {err}"))
        }
        other => ConnectorError::Unavailable(other.to_string()),
    }
}

fn map_result_code(rc: u32, text: String) -> ConnectorError {
    match rc {
        RC_INVALID_CREDENTIALS => {
            ConnectorError::AuthFailed(format!("invalid credentials (rc=49) {text}"))
        }
        RC_ENTRY_ALREADY_EXISTS => ConnectorError::AlreadyExists(text),
        RC_BUSY | RC_UNAVAILABLE => {
            ConnectorError::Transient(format!("server busy (rc={rc}) {text}"))
        }
        code => ConnectorError::Operation { code, message: text },
    }
}

fn to_entry(raw: ResultEntry) -> DirectoryEntry {
    let search = SearchEntry::construct(raw);
    let mut entry = DirectoryEntry::new(search.dn);
    for (name, values) in search.attrs {
        for value in values {
            entry.add_value(&name, value.into_bytes());
        }
    }
    for (name, values) in search.bin_attrs {
        for value in values {
            entry.add_value(&name, value);
        }
    }
    entry
}

fn next_cookie(ctrls: &[Control]) -> Option<Vec<u8>> {
    ctrls.iter().find_map(|ctrl| match ctrl {
        Control(Some(ControlType::PagedResults), raw) => {
            let paged: PagedResults = raw.parse();
            (!paged.cookie.is_empty()).then_some(paged.cookie)
        }
        _ => None,
    })
}

#[async_trait::async_trait]
impl DirectoryConnector for LdapDirectoryConnector {
    async fn connect(
        &self,
        target: &DirectoryTarget,
    ) -> Result<Box<dyn DirectorySession>, ConnectorError> {
        let settings = LdapConnSettings::new()
            .set_conn_timeout(self.connect_timeout)
            .set_no_tls_verify(!self.tls_verify);

        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &target.url())
            .await
            .map_err(|e| match map_error(e) {
                ConnectorError::Transient(msg) => ConnectorError::Transient(msg),
                other => ConnectorError::Unavailable(other.to_string()),
            })?;

        ldap3::drive!(conn);

        if let Some(bind_dn) = &target.bind_dn {
            let password = target.bind_password.as_deref().unwrap_or_default();
            let result = ldap
                .with_timeout(self.operation_timeout)
                .simple_bind(bind_dn, password)
                .await
                .map_err(map_error)?;
            if result.rc != 0 {
                ldap.unbind().await.ok();
                return Err(map_result_code(result.rc, result.text));
            }
        }

        debug!(url = %target.url(), "LDAP session opened");

        Ok(Box::new(LdapSession {
            ldap,
            operation_timeout: self.operation_timeout,
            closed: false,
        }))
    }
}

struct LdapSession {
    ldap: Ldap,
    operation_timeout: Duration,
    closed: bool,
}

#[async_trait::async_trait]
impl DirectorySession for LdapSession {
    async fn search_page(
        &mut self,
        request: &SearchRequest,
        cookie: Option<&[u8]>,
    ) -> Result<SearchPage, ConnectorError> {
        let paged = PagedResults {
            size: i32::try_from(request.page_size).unwrap_or(i32::MAX),
            cookie: cookie.map(<[u8]>::to_vec).unwrap_or_default(),
        };

        let (entries, result) = self
            .ldap
            .with_controls(vec![RawControl::from(paged)])
            .with_timeout(self.operation_timeout)
            .search(
                &request.base_dn,
                Scope::Subtree,
                &request.filter,
                request.attributes.clone(),
            )
            .await
            .map_err(map_error)?
            .success()
            .map_err(map_error)?;

        Ok(SearchPage {
            entries: entries.into_iter().map(to_entry).collect(),
            cookie: next_cookie(&result.ctrls),
        })
    }

    async fn add(&mut self, entry: &DirectoryEntry) -> Result<(), ConnectorError> {
        let attrs: Vec<(Vec<u8>, HashSet<Vec<u8>>)> = entry
            .attributes
            .iter()
            .map(|(name, values)| (name.as_bytes().to_vec(), values.iter().cloned().collect()))
            .collect();

        let result = self
            .ldap
            .with_timeout(self.operation_timeout)
            .add(&entry.dn, attrs)
            .await
            .map_err(map_error)?;

        if result.rc == 0 {
            Ok(())
        } else {
            Err(map_result_code(result.rc, result.text))
        }
    }

    async fn close(&mut self) -> Result<(), ConnectorError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.ldap.unbind().await.map_err(map_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_codes_map_onto_error_kinds() {
        assert!(matches!(
            map_result_code(49, String::new()),
            ConnectorError::AuthFailed(_)
        ));
        assert!(matches!(
            map_result_code(68, "cn=x".to_string()),
            ConnectorError::AlreadyExists(_)
        ));
        assert!(map_result_code(51, String::new()).is_transient());
        assert!(matches!(
            map_result_code(32, String::new()),
            ConnectorError::Operation { code: 32, .. }
        ));
    }

    #[test]
    fn test_io_errors_are_transient() {
        let err = LdapError::Io {
            source: std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"),
        };
        assert!(map_error(err).is_transient());
        assert!(map_error(LdapError::EndOfStream).is_transient());
    }
}
