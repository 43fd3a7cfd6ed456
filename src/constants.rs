/// First line of every backup artifact.
pub const ARTIFACT_MAGIC: &str = "LDAPGUARD-ARTIFACT/1";

pub const ARTIFACT_EXTENSION: &str = "lgb";

/// Attributes maintained by the directory server itself. They are captured in
/// backups (point-in-time restore needs `modifyTimestamp`) but never written back.
pub const OPERATIONAL_ATTRIBUTES: &[&str] = &[
    "createTimestamp",
    "modifyTimestamp",
    "creatorsName",
    "modifiersName",
    "entryUUID",
    "entryCSN",
    "entryDN",
    "structuralObjectClass",
    "subschemaSubentry",
    "hasSubordinates",
    "numSubordinates",
    "contextCSN",
    "memberOf",
    "pwdChangedTime",
    "pwdHistory",
    "pwdFailureTime",
    "pwdAccountLockedTime",
];

pub mod auth {
    /// Prefix that marks a bearer token as an API key rather than a JWT.
    pub const API_KEY_PREFIX: &str = "ldapg_";

    /// Characters of the key kept in clear for display.
    pub const API_KEY_DISPLAY_PREFIX_LEN: usize = 10;

    pub const DEFAULT_API_KEY_PERMISSIONS: &str = "read,write";

    pub const MIN_PASSWORD_LENGTH: usize = 8;
}

pub mod ldap {
    pub const DEFAULT_PORT: i32 = 389;

    pub const DEFAULT_SSL_PORT: i32 = 636;

    /// Result codes from RFC 4511.
    pub const RC_INVALID_CREDENTIALS: u32 = 49;

    pub const RC_ENTRY_ALREADY_EXISTS: u32 = 68;

    pub const RC_BUSY: u32 = 51;

    pub const RC_UNAVAILABLE: u32 = 52;
}

pub mod limits {
    pub const DEFAULT_PAGE_LIMIT: u64 = 100;

    pub const MAX_PAGE_LIMIT: u64 = 1000;

    pub const DEFAULT_RETENTION_DAYS: i32 = 30;

    /// Longest accepted restore filter, in bytes.
    pub const MAX_FILTER_LENGTH: usize = 4096;

    /// Entries written between cancellation checks during a restore.
    pub const RESTORE_BATCH_SIZE: usize = 50;
}
