//! Backup artifact format.
//!
//! ```text
//! LDAPGUARD-ARTIFACT/1\n
//! {"format_version":1,"backup_id":7,...,"payload_sha256":"…"}\n
//! <payload bytes>
//! ```
//!
//! The payload is LDIF, then optionally zstd, then optionally AES-256-GCM,
//! in that order. The manifest lists the transforms that were applied and a
//! SHA-256 over the final payload bytes, so corruption is detected before
//! anything is decrypted or parsed.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{ARTIFACT_EXTENSION, ARTIFACT_MAGIC};
use crate::domain::entry::DirectoryEntry;
use crate::parser::ldif::{self, LdifError};
use crate::services::credentials::{CredentialError, CredentialStore, hex_digest};

pub const FORMAT_VERSION: u32 = 1;

const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transform {
    #[serde(rename = "zstd")]
    Zstd,
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub backup_id: i32,
    pub server_id: i32,
    pub server_name: String,
    pub backup_type: String,
    pub entry_count: u64,
    pub created_at: DateTime<Utc>,
    /// Lower bound of `modifyTimestamp` for incrementals.
    pub since: Option<DateTime<Utc>>,
    pub parent_backup_id: Option<i32>,
    /// In the order they were applied.
    pub transforms: Vec<Transform>,
    pub payload_size: u64,
    pub payload_sha256: String,
}

impl Manifest {
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.transforms.contains(&Transform::Aes256Gcm)
    }
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("artifact is corrupted: {0}")]
    Corrupted(String),

    #[error("artifact payload could not be decrypted: {0}")]
    Decryption(#[from] CredentialError),

    #[error("artifact payload is not valid LDIF: {0}")]
    Ldif(#[from] LdifError),
}

/// Streams LDIF records into an in-memory payload, compressing as it goes.
pub struct PayloadWriter {
    sink: Sink,
    entries: u64,
}

enum Sink {
    Plain(Vec<u8>),
    Zstd(zstd::Encoder<'static, Vec<u8>>),
}

impl Sink {
    fn writer(&mut self) -> &mut dyn Write {
        match self {
            Self::Plain(buf) => buf,
            Self::Zstd(encoder) => encoder,
        }
    }
}

impl PayloadWriter {
    pub fn new(compress: bool) -> io::Result<Self> {
        let mut sink = if compress {
            Sink::Zstd(zstd::Encoder::new(Vec::new(), ZSTD_LEVEL)?)
        } else {
            Sink::Plain(Vec::new())
        };
        ldif::write_version(sink.writer())?;
        Ok(Self { sink, entries: 0 })
    }

    pub fn write_entries(&mut self, entries: &[DirectoryEntry]) -> io::Result<()> {
        let out = self.sink.writer();
        for entry in entries {
            ldif::write_entry(out, entry)?;
        }
        self.entries += entries.len() as u64;
        Ok(())
    }

    #[must_use]
    pub const fn entry_count(&self) -> u64 {
        self.entries
    }

    /// Payload bytes plus the transforms applied so far.
    pub fn finish(self) -> io::Result<(Vec<u8>, Vec<Transform>)> {
        match self.sink {
            Sink::Plain(buf) => Ok((buf, Vec::new())),
            Sink::Zstd(encoder) => Ok((encoder.finish()?, vec![Transform::Zstd])),
        }
    }
}

/// Applies encryption on top of an already serialized (and maybe
/// compressed) payload and fills in the integrity fields of `manifest`.
pub fn seal_payload(
    mut payload: Vec<u8>,
    mut transforms: Vec<Transform>,
    encrypt: Option<&CredentialStore>,
    manifest: &mut Manifest,
) -> Result<Vec<u8>, ArtifactError> {
    if let Some(credentials) = encrypt {
        payload = credentials.seal_bytes(&payload)?;
        transforms.push(Transform::Aes256Gcm);
    }

    manifest.transforms = transforms;
    manifest.payload_size = payload.len() as u64;
    manifest.payload_sha256 = hex_digest(&payload);
    Ok(payload)
}

#[must_use]
pub fn file_name(
    server_name: &str,
    backup_type: &str,
    started_at: DateTime<Utc>,
    backup_id: i32,
) -> String {
    let server: String = server_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "{server}_{backup_type}_{}_{backup_id}.{ARTIFACT_EXTENSION}",
        started_at.format("%Y%m%d_%H%M%S")
    )
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

/// Writes the artifact to `<path>.partial` and renames it into place.
/// Returns the size of the finished file.
pub async fn write(path: &Path, manifest: &Manifest, payload: &[u8]) -> Result<u64, ArtifactError> {
    let header = serde_json::to_string(manifest)
        .map_err(|e| ArtifactError::Corrupted(format!("manifest serialization failed: {e}")))?;

    let mut bytes = Vec::with_capacity(ARTIFACT_MAGIC.len() + header.len() + payload.len() + 2);
    bytes.extend_from_slice(ARTIFACT_MAGIC.as_bytes());
    bytes.push(b'\n');
    bytes.extend_from_slice(header.as_bytes());
    bytes.push(b'\n');
    bytes.extend_from_slice(payload);

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let partial = partial_path(path);
    if let Err(e) = tokio::fs::write(&partial, &bytes).await {
        tokio::fs::remove_file(&partial).await.ok();
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&partial, path).await {
        tokio::fs::remove_file(&partial).await.ok();
        return Err(e.into());
    }

    Ok(bytes.len() as u64)
}

/// Splits an artifact into manifest and payload and checks the payload
/// against the manifest. Nothing is decrypted or parsed here.
pub fn open(bytes: &[u8]) -> Result<(Manifest, &[u8]), ArtifactError> {
    let (magic, rest) = split_line(bytes)
        .ok_or_else(|| ArtifactError::Corrupted("missing header".to_string()))?;
    if magic != ARTIFACT_MAGIC.as_bytes() {
        return Err(ArtifactError::Corrupted("unrecognised file format".to_string()));
    }

    let (header, payload) = split_line(rest)
        .ok_or_else(|| ArtifactError::Corrupted("missing manifest".to_string()))?;
    let manifest: Manifest = serde_json::from_slice(header)
        .map_err(|e| ArtifactError::Corrupted(format!("unreadable manifest: {e}")))?;

    if manifest.format_version != FORMAT_VERSION {
        return Err(ArtifactError::Corrupted(format!(
            "unsupported format version {}",
            manifest.format_version
        )));
    }
    if payload.len() as u64 != manifest.payload_size {
        return Err(ArtifactError::Corrupted(format!(
            "payload is {} bytes, manifest says {}",
            payload.len(),
            manifest.payload_size
        )));
    }
    if hex_digest(payload) != manifest.payload_sha256 {
        return Err(ArtifactError::Corrupted("payload checksum mismatch".to_string()));
    }

    Ok((manifest, payload))
}

/// Inverts the manifest's transforms, last applied first, and parses the LDIF.
pub fn decode(
    manifest: &Manifest,
    payload: &[u8],
    credentials: &CredentialStore,
) -> Result<Vec<DirectoryEntry>, ArtifactError> {
    let mut data = payload.to_vec();
    for transform in manifest.transforms.iter().rev() {
        data = match transform {
            Transform::Aes256Gcm => credentials.open_bytes(&data)?,
            Transform::Zstd => zstd::decode_all(data.as_slice())
                .map_err(|e| ArtifactError::Corrupted(format!("decompression failed: {e}")))?,
        };
    }

    Ok(ldif::parse_bytes(&data)?)
}

pub async fn read_and_decode(
    path: &Path,
    credentials: &CredentialStore,
) -> Result<(Manifest, Vec<DirectoryEntry>), ArtifactError> {
    let bytes = tokio::fs::read(path).await?;
    let credentials = credentials.clone();

    tokio::task::spawn_blocking(move || {
        let (manifest, payload) = open(&bytes)?;
        let entries = decode(&manifest, payload, &credentials)?;
        Ok((manifest, entries))
    })
    .await
    .map_err(|e| ArtifactError::Io(io::Error::other(e)))?
}

/// Checks magic, manifest and checksum of a file on disk.
pub fn verify_file(path: &Path) -> Result<Manifest, ArtifactError> {
    let bytes = std::fs::read(path)?;
    let (manifest, _) = open(&bytes)?;
    Ok(manifest)
}

fn split_line(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    let pos = bytes.iter().position(|b| *b == b'\n')?;
    Some((&bytes[..pos], &bytes[pos + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> Manifest {
        Manifest {
            format_version: FORMAT_VERSION,
            backup_id: 7,
            server_id: 1,
            server_name: "corp".to_string(),
            backup_type: "full".to_string(),
            entry_count: 0,
            created_at: Utc::now(),
            since: None,
            parent_backup_id: None,
            transforms: Vec::new(),
            payload_size: 0,
            payload_sha256: String::new(),
        }
    }

    fn entries() -> Vec<DirectoryEntry> {
        vec![
            DirectoryEntry::new("dc=example,dc=org").with_attr("objectClass", ["domain"]),
            DirectoryEntry::new("cn=admin,dc=example,dc=org")
                .with_attr("cn", ["admin"])
                .with_attr("jpegPhoto", [vec![0u8, 1, 2, 255]]),
        ]
    }

    fn build(compress: bool, encrypt: Option<&CredentialStore>) -> Vec<u8> {
        let mut writer = PayloadWriter::new(compress).unwrap();
        writer.write_entries(&entries()).unwrap();
        let mut m = manifest();
        m.entry_count = writer.entry_count();
        let (payload, transforms) = writer.finish().unwrap();
        let payload = seal_payload(payload, transforms, encrypt, &mut m).unwrap();

        let mut bytes = format!("{ARTIFACT_MAGIC}\n{}\n", serde_json::to_string(&m).unwrap())
            .into_bytes();
        bytes.extend_from_slice(&payload);
        bytes
    }

    #[test]
    fn test_transforms_compose_and_invert() {
        let credentials = CredentialStore::from_secret("artifact-test").unwrap();

        for (compress, encrypt) in [(false, false), (true, false), (false, true), (true, true)] {
            let bytes = build(compress, encrypt.then_some(&credentials));
            let (m, payload) = open(&bytes).unwrap();

            assert_eq!(m.entry_count, 2);
            assert_eq!(m.transforms.contains(&Transform::Zstd), compress);
            assert_eq!(m.is_encrypted(), encrypt);
            assert_eq!(decode(&m, payload, &credentials).unwrap(), entries());
        }
    }

    #[test]
    fn test_transform_order_is_compress_then_encrypt() {
        let credentials = CredentialStore::from_secret("artifact-test").unwrap();
        let bytes = build(true, Some(&credentials));
        let (m, _) = open(&bytes).unwrap();
        assert_eq!(m.transforms, vec![Transform::Zstd, Transform::Aes256Gcm]);
    }

    #[test]
    fn test_checksum_mismatch_is_corruption() {
        let mut bytes = build(false, None);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        let err = open(&bytes).unwrap_err();
        assert!(matches!(err, ArtifactError::Corrupted(ref msg) if msg.contains("checksum")));
    }

    #[test]
    fn test_foreign_files_are_rejected() {
        assert!(matches!(
            open(b"PK\x03\x04 not an artifact\n{}\n"),
            Err(ArtifactError::Corrupted(_))
        ));
        assert!(matches!(open(b""), Err(ArtifactError::Corrupted(_))));
    }

    #[test]
    fn test_file_name_is_sanitized() {
        let at = DateTime::parse_from_rfc3339("2026-03-01T02:00:05Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            file_name("corp ldap/1", "full", at, 42),
            "corp_ldap_1_full_20260301_020005_42.lgb"
        );
    }
}
