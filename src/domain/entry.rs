use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::constants::OPERATIONAL_ATTRIBUTES;

/// A directory entry as read from, or written to, an LDAP server.
///
/// Attribute names keep the casing the server sent them with; every lookup is
/// case-insensitive. Values are raw bytes so binary attributes (`jpegPhoto`,
/// `userCertificate`) survive a backup untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub dn: String,
    pub attributes: BTreeMap<String, Vec<Vec<u8>>>,
}

impl DirectoryEntry {
    #[must_use]
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Builder-style helper, mostly for tests and fixtures.
    #[must_use]
    pub fn with_attr<I, V>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Vec<u8>>,
    {
        for value in values {
            self.add_value(name, value);
        }
        self
    }

    pub fn add_value(&mut self, name: &str, value: impl Into<Vec<u8>>) {
        let key = self
            .attributes
            .keys()
            .find(|k| k.eq_ignore_ascii_case(name))
            .cloned()
            .unwrap_or_else(|| name.to_string());
        self.attributes.entry(key).or_default().push(value.into());
    }

    pub fn set_values(&mut self, name: &str, values: Vec<Vec<u8>>) {
        self.remove_attribute(name);
        self.attributes.insert(name.to_string(), values);
    }

    pub fn remove_attribute(&mut self, name: &str) {
        self.attributes.retain(|k, _| !k.eq_ignore_ascii_case(name));
    }

    #[must_use]
    pub fn has_attribute(&self, name: &str) -> bool {
        self.values(name).next().is_some()
    }

    pub fn values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.attributes
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.iter().map(Vec::as_slice))
    }

    #[must_use]
    pub fn text_values(&self, name: &str) -> Vec<String> {
        self.values(name)
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect()
    }

    #[must_use]
    pub fn first_text(&self, name: &str) -> Option<String> {
        self.values(name)
            .next()
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    /// `modifyTimestamp` in LDAP generalized time (`20260301120000Z`).
    #[must_use]
    pub fn modify_timestamp(&self) -> Option<String> {
        self.first_text("modifyTimestamp")
            .or_else(|| self.first_text("createTimestamp"))
    }

    /// Key used to match the same entry across backups.
    #[must_use]
    pub fn normalized_dn(&self) -> String {
        normalize_dn(&self.dn)
    }

    /// Number of RDN components; parents always sort before their children.
    #[must_use]
    pub fn depth(&self) -> usize {
        split_dn(&self.dn).len()
    }

    /// Drops server-maintained attributes that a target server would reject on add.
    #[must_use]
    pub fn without_operational(mut self) -> Self {
        self.attributes.retain(|k, _| {
            !OPERATIONAL_ATTRIBUTES
                .iter()
                .any(|op| op.eq_ignore_ascii_case(k))
        });
        self
    }
}

/// Splits a DN on unescaped commas.
fn split_dn(dn: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in dn.char_indices() {
        match c {
            '\\' if !escaped => escaped = true,
            ',' if !escaped => {
                parts.push(&dn[start..i]);
                start = i + 1;
            }
            _ => escaped = false,
        }
    }
    if !dn[start..].trim().is_empty() {
        parts.push(&dn[start..]);
    }
    parts
}

#[must_use]
pub fn normalize_dn(dn: &str) -> String {
    split_dn(dn)
        .into_iter()
        .map(|rdn| {
            rdn.split_once('=').map_or_else(
                || rdn.trim().to_lowercase(),
                |(attr, value)| {
                    format!("{}={}", attr.trim().to_lowercase(), value.trim().to_lowercase())
                },
            )
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Formats a timestamp as LDAP generalized time (`20260301120000Z`).
#[must_use]
pub fn generalized_time(ts: DateTime<Utc>) -> String {
    ts.format("%Y%m%d%H%M%SZ").to_string()
}

/// Reads the leading `YYYYmmddHHMMSS` of a generalized time value. Fractions
/// are dropped; values are taken as UTC.
#[must_use]
pub fn parse_generalized_time(value: &str) -> Option<DateTime<Utc>> {
    let digits = value.get(..14)?;
    NaiveDateTime::parse_from_str(digits, "%Y%m%d%H%M%S")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let entry = DirectoryEntry::new("cn=admin,dc=example,dc=org")
            .with_attr("objectClass", ["top", "person"])
            .with_attr("CN", ["admin"]);

        assert_eq!(entry.text_values("objectclass"), vec!["top", "person"]);
        assert_eq!(entry.first_text("cn").as_deref(), Some("admin"));
        assert!(!entry.has_attribute("mail"));
    }

    #[test]
    fn test_normalized_dn_and_depth() {
        assert_eq!(
            normalize_dn("CN=Admin , DC=Example,dc=org"),
            "cn=admin,dc=example,dc=org"
        );
        let entry = DirectoryEntry::new(r"cn=Smith\, John,ou=people,dc=example,dc=org");
        assert_eq!(entry.depth(), 4);
        assert_eq!(DirectoryEntry::new("dc=org").depth(), 1);
    }

    #[test]
    fn test_generalized_time() {
        let ts = parse_generalized_time("20260301120304.123Z").unwrap();
        assert_eq!(generalized_time(ts), "20260301120304Z");
        assert!(parse_generalized_time("2026").is_none());
        assert!(parse_generalized_time("2026130112030Zx").is_none());
    }

    #[test]
    fn test_operational_attributes_are_stripped() {
        let entry = DirectoryEntry::new("cn=a,dc=org")
            .with_attr("cn", ["a"])
            .with_attr("modifyTimestamp", ["20260101000000Z"])
            .with_attr("entryUUID", ["5b1c"])
            .without_operational();

        assert!(entry.has_attribute("cn"));
        assert!(!entry.has_attribute("modifytimestamp"));
        assert!(!entry.has_attribute("entryUUID"));
    }
}
