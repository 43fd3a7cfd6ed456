//! RFC 4515 search filters.
//!
//! Used to validate restore filters up front and to evaluate them against
//! entries loaded from a backup artifact. Extensible matches (`:=`) are not
//! supported and are reported as syntax errors.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::char,
    combinator::{all_consuming, map},
    multi::many1,
    sequence::{delimited, preceded},
};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

use crate::domain::entry::DirectoryEntry;

/// Deepest nesting of `(...)` groups a filter may use.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("filter is empty")]
    Empty,

    #[error("malformed filter near '{0}'")]
    Syntax(String),

    #[error("invalid escape sequence in '{0}'")]
    InvalidEscape(String),

    #[error("filter nests deeper than {MAX_DEPTH} levels")]
    TooDeep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality {
        attr: String,
        value: String,
    },
    Substring {
        attr: String,
        initial: Option<String>,
        any: Vec<String>,
        last: Option<String>,
    },
    Present {
        attr: String,
    },
    GreaterOrEqual {
        attr: String,
        value: String,
    },
    LessOrEqual {
        attr: String,
        value: String,
    },
    Approx {
        attr: String,
        value: String,
    },
}

#[derive(Debug)]
enum RawFilter<'a> {
    And(Vec<RawFilter<'a>>),
    Or(Vec<RawFilter<'a>>),
    Not(Box<RawFilter<'a>>),
    Item {
        attr: &'a str,
        op: &'a str,
        value: &'a str,
    },
}

fn attribute(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == ';')
        .parse(input)
}

fn operator(input: &str) -> IResult<&str, &str> {
    alt((tag("~="), tag(">="), tag("<="), tag("="))).parse(input)
}

fn assertion_value(input: &str) -> IResult<&str, &str> {
    take_while(|c: char| c != '(' && c != ')').parse(input)
}

fn item(input: &str) -> IResult<&str, RawFilter<'_>> {
    map((attribute, operator, assertion_value), |(attr, op, value)| {
        RawFilter::Item { attr, op, value }
    })
    .parse(input)
}

fn component(input: &str) -> IResult<&str, RawFilter<'_>> {
    alt((
        map(preceded(char('&'), many1(filter)), RawFilter::And),
        map(preceded(char('|'), many1(filter)), RawFilter::Or),
        map(preceded(char('!'), filter), |f| RawFilter::Not(Box::new(f))),
        item,
    ))
    .parse(input)
}

fn filter(input: &str) -> IResult<&str, RawFilter<'_>> {
    delimited(char('('), component, char(')')).parse(input)
}

/// Decodes `\XX` hex escapes.
fn unescape(raw: &str) -> Result<String, FilterError> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let hex = raw
                .get(i + 1..i + 3)
                .ok_or_else(|| FilterError::InvalidEscape(raw.to_string()))?;
            let byte = u8::from_str_radix(hex, 16)
                .map_err(|_| FilterError::InvalidEscape(raw.to_string()))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\\' => out.push_str("\\5c"),
            '\0' => out.push_str("\\00"),
            other => out.push(other),
        }
    }
    out
}

fn lower(raw: RawFilter<'_>) -> Result<Filter, FilterError> {
    Ok(match raw {
        RawFilter::And(parts) => {
            Filter::And(parts.into_iter().map(lower).collect::<Result<_, _>>()?)
        }
        RawFilter::Or(parts) => {
            Filter::Or(parts.into_iter().map(lower).collect::<Result<_, _>>()?)
        }
        RawFilter::Not(inner) => Filter::Not(Box::new(lower(*inner)?)),
        RawFilter::Item { attr, op, value } => {
            let attr = attr.to_string();
            match op {
                "=" if value == "*" => Filter::Present { attr },
                "=" if value.contains('*') => {
                    let mut pieces: Vec<&str> = value.split('*').collect();
                    let last = pieces
                        .pop()
                        .filter(|s| !s.is_empty())
                        .map(unescape)
                        .transpose()?;
                    let initial = if pieces.is_empty() {
                        None
                    } else {
                        Some(pieces.remove(0))
                            .filter(|s| !s.is_empty())
                            .map(unescape)
                            .transpose()?
                    };
                    let any = pieces
                        .into_iter()
                        .filter(|s| !s.is_empty())
                        .map(unescape)
                        .collect::<Result<_, _>>()?;
                    Filter::Substring {
                        attr,
                        initial,
                        any,
                        last,
                    }
                }
                "=" => Filter::Equality {
                    attr,
                    value: unescape(value)?,
                },
                ">=" => Filter::GreaterOrEqual {
                    attr,
                    value: unescape(value)?,
                },
                "<=" => Filter::LessOrEqual {
                    attr,
                    value: unescape(value)?,
                },
                _ => Filter::Approx {
                    attr,
                    value: unescape(value)?,
                },
            }
        }
    })
}

/// Deepest parenthesis nesting in `input`. Literal parentheses in values
/// must be escaped as `\28`/`\29`, so every bare paren is structural.
fn nesting_depth(input: &str) -> usize {
    let mut depth = 0usize;
    let mut deepest = 0;
    for c in input.chars() {
        match c {
            '(' => {
                depth += 1;
                deepest = deepest.max(depth);
            }
            ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    deepest
}

/// Compares two assertion values: numerically when both sides are integers,
/// otherwise case-insensitively. Generalized time compares correctly as text.
fn compare_values(left: &str, right: &str) -> Ordering {
    match (left.trim().parse::<i64>(), right.trim().parse::<i64>()) {
        (Ok(l), Ok(r)) => l.cmp(&r),
        _ => left.to_lowercase().cmp(&right.to_lowercase()),
    }
}

fn squash(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

impl Filter {
    /// Parses a filter string. A bare item without parentheses (`cn=admin*`)
    /// is accepted and treated as if it were wrapped.
    ///
    /// ```rust
    /// use ldapguard::parser::ldap_filter::Filter;
    ///
    /// assert!(Filter::parse("(&(objectClass=person)(cn=admin*))").is_ok());
    /// assert!(Filter::parse("(cn=admin").is_err());
    /// ```
    pub fn parse(input: &str) -> Result<Self, FilterError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(FilterError::Empty);
        }

        let wrapped;
        let source = if trimmed.starts_with('(') {
            trimmed
        } else {
            wrapped = format!("({trimmed})");
            &wrapped
        };

        // The parser and the evaluator both recurse once per level.
        if nesting_depth(source) > MAX_DEPTH {
            return Err(FilterError::TooDeep);
        }

        let (_, raw) = all_consuming(filter)
            .parse(source)
            .map_err(|e| match e {
                nom::Err::Error(err) | nom::Err::Failure(err) => {
                    FilterError::Syntax(err.input.chars().take(20).collect())
                }
                nom::Err::Incomplete(_) => FilterError::Syntax(source.to_string()),
            })?;

        lower(raw)
    }

    /// Evaluates the filter against an entry. Attribute names and values
    /// are compared case-insensitively.
    #[must_use]
    pub fn matches(&self, entry: &DirectoryEntry) -> bool {
        match self {
            Self::And(parts) => parts.iter().all(|f| f.matches(entry)),
            Self::Or(parts) => parts.iter().any(|f| f.matches(entry)),
            Self::Not(inner) => !inner.matches(entry),
            Self::Present { attr } => {
                attr.eq_ignore_ascii_case("objectClass") || entry.has_attribute(attr)
            }
            Self::Equality { attr, value } => entry
                .text_values(attr)
                .iter()
                .any(|v| compare_values(v, value) == Ordering::Equal),
            Self::GreaterOrEqual { attr, value } => entry
                .text_values(attr)
                .iter()
                .any(|v| compare_values(v, value) != Ordering::Less),
            Self::LessOrEqual { attr, value } => entry
                .text_values(attr)
                .iter()
                .any(|v| compare_values(v, value) != Ordering::Greater),
            Self::Approx { attr, value } => {
                let wanted = squash(value);
                entry.text_values(attr).iter().any(|v| squash(v) == wanted)
            }
            Self::Substring {
                attr,
                initial,
                any,
                last,
            } => entry.text_values(attr).iter().any(|v| {
                substring_matches(
                    &v.to_lowercase(),
                    initial.as_deref(),
                    any,
                    last.as_deref(),
                )
            }),
        }
    }
}

fn substring_matches(
    value: &str,
    initial: Option<&str>,
    any: &[String],
    last: Option<&str>,
) -> bool {
    let mut rest = value;

    if let Some(initial) = initial {
        let initial = initial.to_lowercase();
        let Some(stripped) = rest.strip_prefix(initial.as_str()) else {
            return false;
        };
        rest = stripped;
    }

    for part in any {
        let part = part.to_lowercase();
        match rest.find(part.as_str()) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }

    last.is_none_or(|last| rest.ends_with(last.to_lowercase().as_str()))
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And(parts) => {
                f.write_str("(&")?;
                for part in parts {
                    write!(f, "{part}")?;
                }
                f.write_str(")")
            }
            Self::Or(parts) => {
                f.write_str("(|")?;
                for part in parts {
                    write!(f, "{part}")?;
                }
                f.write_str(")")
            }
            Self::Not(inner) => write!(f, "(!{inner})"),
            Self::Present { attr } => write!(f, "({attr}=*)"),
            Self::Equality { attr, value } => write!(f, "({attr}={})", escape(value)),
            Self::GreaterOrEqual { attr, value } => write!(f, "({attr}>={})", escape(value)),
            Self::LessOrEqual { attr, value } => write!(f, "({attr}<={})", escape(value)),
            Self::Approx { attr, value } => write!(f, "({attr}~={})", escape(value)),
            Self::Substring {
                attr,
                initial,
                any,
                last,
            } => {
                write!(f, "({attr}=")?;
                if let Some(initial) = initial {
                    f.write_str(&escape(initial))?;
                }
                f.write_str("*")?;
                for part in any {
                    write!(f, "{}*", escape(part))?;
                }
                if let Some(last) = last {
                    f.write_str(&escape(last))?;
                }
                f.write_str(")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person(cn: &str) -> DirectoryEntry {
        DirectoryEntry::new(format!("cn={cn},ou=people,dc=example,dc=org"))
            .with_attr("objectClass", ["top", "inetOrgPerson"])
            .with_attr("cn", [cn])
            .with_attr("uidNumber", ["1050"])
            .with_attr("modifyTimestamp", ["20260301101500Z"])
    }

    #[test]
    fn test_parse_compound_filter() {
        let filter =
            Filter::parse("(&(objectClass=person)(|(cn=admin*)(!(uid=guest))))").unwrap();
        let Filter::And(parts) = &filter else {
            panic!("expected and, got {filter:?}");
        };
        assert_eq!(parts.len(), 2);
        assert!(matches!(parts[1], Filter::Or(_)));
    }

    #[test]
    fn test_substring_components() {
        assert_eq!(
            Filter::parse("(cn=ad*m*n)").unwrap(),
            Filter::Substring {
                attr: "cn".to_string(),
                initial: Some("ad".to_string()),
                any: vec!["m".to_string()],
                last: Some("n".to_string()),
            }
        );
        assert_eq!(
            Filter::parse("(mail=*@example.org)").unwrap(),
            Filter::Substring {
                attr: "mail".to_string(),
                initial: None,
                any: vec![],
                last: Some("@example.org".to_string()),
            }
        );
    }

    #[test]
    fn test_matching() {
        let admin = person("Admin-Backup");
        let alice = person("alice");

        let filter = Filter::parse("(cn=admin*)").unwrap();
        assert!(filter.matches(&admin));
        assert!(!filter.matches(&alice));

        assert!(Filter::parse("(objectClass=*)").unwrap().matches(&alice));
        assert!(Filter::parse("(uidNumber>=1000)").unwrap().matches(&alice));
        assert!(!Filter::parse("(uidNumber<=999)").unwrap().matches(&alice));
        assert!(
            Filter::parse("(modifyTimestamp>=20260301000000Z)")
                .unwrap()
                .matches(&alice)
        );
        assert!(Filter::parse("(!(cn=alice))").unwrap().matches(&admin));
        assert!(Filter::parse("(cn~=A LICE)").unwrap().matches(&alice));
        assert!(!Filter::parse("(description=*)").unwrap().matches(&alice));
    }

    #[test]
    fn test_escapes() {
        let entry = DirectoryEntry::new("cn=x").with_attr("cn", ["a*b (c)"]);
        let filter = Filter::parse(r"(cn=a\2ab \28c\29)").unwrap();
        assert!(filter.matches(&entry));
        assert_eq!(filter.to_string(), r"(cn=a\2ab \28c\29)");

        assert_eq!(
            Filter::parse(r"(cn=bad\zz)"),
            Err(FilterError::InvalidEscape(r"bad\zz".to_string()))
        );
    }

    #[test]
    fn test_bare_item_is_wrapped() {
        assert_eq!(
            Filter::parse("uid=jdoe").unwrap(),
            Filter::Equality {
                attr: "uid".to_string(),
                value: "jdoe".to_string()
            }
        );
    }

    #[test]
    fn test_rejects_malformed_filters() {
        assert_eq!(Filter::parse("   "), Err(FilterError::Empty));
        assert!(Filter::parse("(cn=admin").is_err());
        assert!(Filter::parse("(&)").is_err());
        assert!(Filter::parse("(cn:dn:=admin)").is_err());
        assert!(Filter::parse("(cn=a)(cn=b)").is_err());
        assert!(Filter::parse("((cn=a))").is_err());
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let deep = format!("{}(cn=a){}", "(!".repeat(200_000), ")".repeat(200_000));
        assert_eq!(Filter::parse(&deep), Err(FilterError::TooDeep));

        let limit = MAX_DEPTH - 1;
        let nested = format!("{}(cn=a){}", "(!".repeat(limit), ")".repeat(limit));
        assert!(Filter::parse(&nested).is_ok());

        let over = format!("{}(cn=a){}", "(!".repeat(MAX_DEPTH), ")".repeat(MAX_DEPTH));
        assert_eq!(Filter::parse(&over), Err(FilterError::TooDeep));
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let text = "(&(objectClass=inetOrgPerson)(|(cn=ad*)(mail=*@x.org))(!(uid=guest)))";
        let filter = Filter::parse(text).unwrap();
        assert_eq!(filter.to_string(), text);
    }
}
