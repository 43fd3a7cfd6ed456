//! LDIF (RFC 2849) content records.
//!
//! The writer emits `version: 1`, base64-encodes any value that is not a
//! SAFE-STRING and folds lines at 76 columns. The reader accepts what the
//! writer produces plus comments and the common hand-edited variations.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use std::io::{self, Write};
use thiserror::Error;

use crate::domain::entry::DirectoryEntry;

const FOLD_WIDTH: usize = 76;

#[derive(Debug, Error)]
pub enum LdifError {
    #[error("line {line}: {reason}")]
    Syntax { line: usize, reason: String },

    #[error("LDIF payload is not valid UTF-8")]
    Encoding,
}

fn is_safe_init(b: u8) -> bool {
    b.is_ascii() && !matches!(b, b'\0' | b'\n' | b'\r' | b' ' | b':' | b'<')
}

fn is_safe(b: u8) -> bool {
    b.is_ascii() && !matches!(b, b'\0' | b'\n' | b'\r')
}

fn is_safe_string(value: &[u8]) -> bool {
    match value.split_first() {
        None => true,
        Some((first, rest)) => {
            is_safe_init(*first) && rest.iter().all(|b| is_safe(*b)) && value.last() != Some(&b' ')
        }
    }
}

fn write_folded<W: Write + ?Sized>(out: &mut W, line: &str) -> io::Result<()> {
    if line.len() <= FOLD_WIDTH {
        return writeln!(out, "{line}");
    }

    // Lines we produce are ASCII, so byte offsets are char boundaries.
    let (head, mut rest) = line.split_at(FOLD_WIDTH);
    writeln!(out, "{head}")?;
    while !rest.is_empty() {
        let take = rest.len().min(FOLD_WIDTH - 1);
        let (chunk, tail) = rest.split_at(take);
        writeln!(out, " {chunk}")?;
        rest = tail;
    }
    Ok(())
}

fn write_attr<W: Write + ?Sized>(out: &mut W, name: &str, value: &[u8]) -> io::Result<()> {
    if is_safe_string(value) {
        write_folded(out, &format!("{name}: {}", String::from_utf8_lossy(value)))
    } else {
        write_folded(out, &format!("{name}:: {}", STANDARD.encode(value)))
    }
}

pub fn write_version<W: Write + ?Sized>(out: &mut W) -> io::Result<()> {
    writeln!(out, "version: 1")?;
    writeln!(out)
}

/// Writes one content record followed by the separating blank line.
pub fn write_entry<W: Write + ?Sized>(out: &mut W, entry: &DirectoryEntry) -> io::Result<()> {
    write_attr(out, "dn", entry.dn.as_bytes())?;
    for (name, values) in &entry.attributes {
        for value in values {
            write_attr(out, name, value)?;
        }
    }
    writeln!(out)
}

/// Serializes a full LDIF document.
#[must_use]
pub fn to_string(entries: &[DirectoryEntry]) -> String {
    let mut buf = Vec::new();
    // Writing into a Vec cannot fail.
    let _ = write_version(&mut buf);
    for entry in entries {
        let _ = write_entry(&mut buf, entry);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Unfolds continuation lines, keeping the number of the line each logical
/// line started on.
fn logical_lines(input: &str) -> Vec<(usize, String)> {
    let mut lines: Vec<(usize, String)> = Vec::new();
    for (idx, raw) in input.lines().enumerate() {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        if let Some(cont) = raw.strip_prefix(' ')
            && let Some((_, last)) = lines.last_mut()
            && !last.is_empty()
        {
            last.push_str(cont);
            continue;
        }
        lines.push((idx + 1, raw.to_string()));
    }
    lines
}

fn parse_line(line_no: usize, line: &str) -> Result<(String, Vec<u8>), LdifError> {
    let (name, rest) = line.split_once(':').ok_or_else(|| LdifError::Syntax {
        line: line_no,
        reason: "expected 'attribute: value'".to_string(),
    })?;

    if name.is_empty() {
        return Err(LdifError::Syntax {
            line: line_no,
            reason: "missing attribute name".to_string(),
        });
    }

    if let Some(encoded) = rest.strip_prefix(':') {
        let value = STANDARD
            .decode(encoded.trim())
            .map_err(|e| LdifError::Syntax {
                line: line_no,
                reason: format!("invalid base64 value: {e}"),
            })?;
        Ok((name.to_string(), value))
    } else if rest.starts_with('<') {
        Err(LdifError::Syntax {
            line: line_no,
            reason: "URL values are not supported".to_string(),
        })
    } else {
        Ok((name.to_string(), rest.trim_start().as_bytes().to_vec()))
    }
}

/// Parses an LDIF document into entries, in file order.
pub fn parse(input: &str) -> Result<Vec<DirectoryEntry>, LdifError> {
    let mut entries = Vec::new();
    let mut current: Option<DirectoryEntry> = None;

    for (line_no, line) in logical_lines(input) {
        if line.starts_with('#') {
            continue;
        }

        if line.trim().is_empty() {
            if let Some(entry) = current.take() {
                entries.push(entry);
            }
            continue;
        }

        let (name, value) = parse_line(line_no, &line)?;

        match current.as_mut() {
            None if name.eq_ignore_ascii_case("version") => {}
            None if name.eq_ignore_ascii_case("dn") => {
                let dn = String::from_utf8(value).map_err(|_| LdifError::Syntax {
                    line: line_no,
                    reason: "dn is not valid UTF-8".to_string(),
                })?;
                current = Some(DirectoryEntry::new(dn));
            }
            None => {
                return Err(LdifError::Syntax {
                    line: line_no,
                    reason: format!("record must start with dn, found '{name}'"),
                });
            }
            Some(entry) => entry.add_value(&name, value),
        }
    }

    if let Some(entry) = current {
        entries.push(entry);
    }

    Ok(entries)
}

pub fn parse_bytes(input: &[u8]) -> Result<Vec<DirectoryEntry>, LdifError> {
    let text = std::str::from_utf8(input).map_err(|_| LdifError::Encoding)?;
    parse(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_and_unsafe_values_are_base64() {
        let entry = DirectoryEntry::new("cn=Zoë,dc=example,dc=org")
            .with_attr("cn", ["Zoë"])
            .with_attr("description", [" leading space"])
            .with_attr("jpegPhoto", [vec![0xff_u8, 0xd8, 0x00, 0x10]]);

        let text = to_string(std::slice::from_ref(&entry));
        assert!(text.starts_with("version: 1\n\ndn:: "));
        assert!(text.contains("description:: "));
        assert!(text.contains("jpegPhoto:: /9gAEA=="));

        let parsed = parse(&text).unwrap();
        assert_eq!(parsed, vec![entry]);
    }

    #[test]
    fn test_long_lines_fold_and_unfold() {
        let long = "x".repeat(200);
        let entry = DirectoryEntry::new("cn=long,dc=org").with_attr("description", [long.as_str()]);
        let text = to_string(std::slice::from_ref(&entry));

        assert!(text.lines().all(|l| l.len() <= FOLD_WIDTH));
        assert_eq!(parse(&text).unwrap()[0].first_text("description"), Some(long));
    }

    #[test]
    fn test_parse_hand_written_ldif() {
        let text = "\
# exported by slapcat
version: 1

dn: dc=example,dc=org
objectClass: top
objectClass: domain
dc: example

dn: ou=people,dc=example,dc=org
objectClass: organizationalUnit
ou: people
";
        let entries = parse(text).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].text_values("objectclass"), vec!["top", "domain"]);
        assert_eq!(entries[1].dn, "ou=people,dc=example,dc=org");
    }

    #[test]
    fn test_rejects_records_without_dn() {
        let err = parse("cn: orphan\n").unwrap_err();
        assert!(matches!(err, LdifError::Syntax { line: 1, .. }));
        assert!(parse("dn: cn=a\njpegPhoto:< file:///tmp/x\n").is_err());
    }
}
