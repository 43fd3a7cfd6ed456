use regex::Regex;
use std::sync::OnceLock;

use super::ApiError;
use crate::constants::limits::MAX_FILTER_LENGTH;
use crate::domain::{BackupType, Role};

fn email_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("Invalid regex")
    })
}

/// One RDN component: `attr=value`, the value may contain escaped commas.
fn rdn_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z][A-Za-z0-9-]*(\.[0-9]+)*\s*=\s*\S").expect("Invalid regex")
    })
}

pub fn validate_id(resource: &str, id: i32) -> Result<i32, ApiError> {
    if id <= 0 {
        return Err(ApiError::validation(format!(
            "Invalid {resource} ID: {id}. ID must be a positive integer"
        )));
    }
    Ok(id)
}

pub fn validate_name<'a>(field: &str, name: &'a str) -> Result<&'a str, ApiError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ApiError::validation(format!("{field} cannot be empty")));
    }

    if trimmed.chars().count() > 100 {
        return Err(ApiError::validation(format!(
            "{field} must be 100 characters or less"
        )));
    }

    Ok(trimmed)
}

pub fn validate_host(host: &str) -> Result<&str, ApiError> {
    let trimmed = host.trim();
    if trimmed.is_empty() {
        return Err(ApiError::validation("Host cannot be empty"));
    }
    if trimmed.contains("://") || trimmed.chars().any(char::is_whitespace) {
        return Err(ApiError::validation(
            "Host must be a bare hostname or IP address, without scheme",
        ));
    }
    Ok(trimmed)
}

pub fn validate_port(port: i32) -> Result<i32, ApiError> {
    if !(1..=65535).contains(&port) {
        return Err(ApiError::validation(format!(
            "Invalid port: {port}. Port must be between 1 and 65535"
        )));
    }
    Ok(port)
}

/// Light syntactic check: every comma separated component looks like an RDN.
pub fn validate_dn<'a>(field: &str, dn: &'a str) -> Result<&'a str, ApiError> {
    let trimmed = dn.trim();
    if trimmed.is_empty() {
        return Err(ApiError::validation(format!("{field} cannot be empty")));
    }

    let mut component = String::new();
    let mut escaped = false;
    let mut components = Vec::new();
    for c in trimmed.chars() {
        if escaped {
            component.push(c);
            escaped = false;
        } else if c == '\\' {
            component.push(c);
            escaped = true;
        } else if c == ',' {
            components.push(std::mem::take(&mut component));
        } else {
            component.push(c);
        }
    }
    components.push(component);

    if components.iter().any(|rdn| !rdn_regex().is_match(rdn.trim())) {
        return Err(ApiError::validation(format!(
            "{field} '{trimmed}' is not a valid distinguished name"
        )));
    }

    Ok(trimmed)
}

pub fn validate_email(email: &str) -> Result<&str, ApiError> {
    let trimmed = email.trim();
    if !email_regex().is_match(trimmed) {
        return Err(ApiError::validation(format!(
            "Invalid email address: {trimmed}"
        )));
    }
    Ok(trimmed)
}

pub fn validate_role(role: &str) -> Result<Role, ApiError> {
    role.parse::<Role>().map_err(ApiError::validation)
}

pub fn validate_backup_type(backup_type: &str) -> Result<BackupType, ApiError> {
    backup_type.parse::<BackupType>().map_err(ApiError::validation)
}

pub fn validate_retention_days(days: i32) -> Result<i32, ApiError> {
    if !(0..=3650).contains(&days) {
        return Err(ApiError::validation(format!(
            "Invalid retention_days: {days}. Must be between 0 and 3650"
        )));
    }
    Ok(days)
}

/// Comma separated subset of `read`, `write`, `admin`.
pub fn validate_permissions(permissions: &str) -> Result<&str, ApiError> {
    let trimmed = permissions.trim();
    if trimmed.is_empty() {
        return Err(ApiError::validation("Permissions cannot be empty"));
    }
    for perm in trimmed.split(',').map(str::trim) {
        if !matches!(perm, "read" | "write" | "admin") {
            return Err(ApiError::validation(format!(
                "Unknown permission '{perm}'. Use read, write or admin"
            )));
        }
    }
    Ok(trimmed)
}

pub fn validate_setting_key(key: &str) -> Result<&str, ApiError> {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        return Err(ApiError::validation("Setting key cannot be empty"));
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
    {
        return Err(ApiError::validation(
            "Setting key can only contain letters, numbers, dots, hyphens, and underscores",
        ));
    }
    Ok(trimmed)
}

pub fn validate_restore_filter(filter: Option<&str>) -> Result<(), ApiError> {
    if filter.is_some_and(|f| f.len() > MAX_FILTER_LENGTH) {
        return Err(ApiError::validation(format!(
            "restore_filter must be {MAX_FILTER_LENGTH} bytes or less"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_port() {
        assert!(validate_port(389).is_ok());
        assert!(validate_port(636).is_ok());
        assert!(validate_port(0).is_err());
        assert!(validate_port(70000).is_err());
    }

    #[test]
    fn test_validate_dn() {
        assert!(validate_dn("base_dn", "dc=example,dc=com").is_ok());
        assert!(validate_dn("base_dn", "cn=Smith\\, John,ou=People,dc=example,dc=com").is_ok());
        assert!(validate_dn("bind_dn", "cn=admin, dc=example, dc=com").is_ok());
        assert!(validate_dn("base_dn", "").is_err());
        assert!(validate_dn("base_dn", "example.com").is_err());
        assert!(validate_dn("base_dn", "dc=example,,dc=com").is_err());
    }

    #[test]
    fn test_validate_email() {
        assert!(validate_email("ops@example.com").is_ok());
        assert!(validate_email("not-an-email").is_err());
        assert!(validate_email("a b@example.com").is_err());
    }

    #[test]
    fn test_validate_permissions() {
        assert_eq!(validate_permissions("read, write").unwrap(), "read, write");
        assert!(validate_permissions("read,delete").is_err());
        assert!(validate_permissions(" ").is_err());
    }

    #[test]
    fn test_validate_host() {
        assert!(validate_host("ldap.example.com").is_ok());
        assert!(validate_host("ldap://ldap.example.com").is_err());
        assert!(validate_host("  ").is_err());
    }

    #[test]
    fn test_validate_setting_key() {
        assert!(validate_setting_key("backup.default_retention").is_ok());
        assert!(validate_setting_key("bad key").is_err());
    }

    #[test]
    fn test_validate_restore_filter() {
        assert!(validate_restore_filter(None).is_ok());
        assert!(validate_restore_filter(Some("(cn=admin*)")).is_ok());
        let huge = "(!".repeat(MAX_FILTER_LENGTH);
        assert!(validate_restore_filter(Some(&huge)).is_err());
    }
}
