//! Five-field cron expressions (minute hour day-of-month month day-of-week).
//!
//! Parsing never panics; malformed input comes back as [`CronError`].
//! Evaluation is done in UTC.

use chrono::{DateTime, Datelike, Days, Duration, NaiveDate, Timelike, Utc};
use nom::{
    IResult, Parser,
    branch::alt,
    character::complete::{alphanumeric1, char, digit1},
    combinator::{all_consuming, map, map_res, opt},
    multi::separated_list1,
    sequence::preceded,
};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),

    #[error("invalid {field} field '{value}': {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },
}

const MONTH_NAMES: &[&str] = &[
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: &[&str] = &["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Furthest we search for a matching minute before giving up (e.g. `0 0 30 2 *`).
const SEARCH_HORIZON_DAYS: u64 = 366 * 5;

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// Offset of `names[0]`.
    names_base: u32,
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
    names_base: 0,
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
    names_base: 0,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
    names_base: 0,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: MONTH_NAMES,
    names_base: 1,
};
// 7 is accepted as an alias for Sunday and folded onto 0.
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: DAY_NAMES,
    names_base: 0,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    const fn contains(self, value: u32) -> bool {
        self.0 & (1u64 << value) != 0
    }

    const fn insert(&mut self, value: u32) {
        self.0 |= 1u64 << value;
    }
}

#[derive(Debug, Clone, Copy)]
enum RawBase<'a> {
    All,
    Single(&'a str),
    Range(&'a str, &'a str),
}

type RawItem<'a> = (RawBase<'a>, Option<u32>);

fn base(input: &str) -> IResult<&str, RawBase<'_>> {
    alt((
        map(char('*'), |_| RawBase::All),
        map(
            (alphanumeric1, opt(preceded(char('-'), alphanumeric1))),
            |(start, end)| match end {
                Some(end) => RawBase::Range(start, end),
                None => RawBase::Single(start),
            },
        ),
    ))
    .parse(input)
}

fn step(input: &str) -> IResult<&str, u32> {
    map_res(digit1, str::parse::<u32>).parse(input)
}

fn item(input: &str) -> IResult<&str, RawItem<'_>> {
    (base, opt(preceded(char('/'), step))).parse(input)
}

fn items(input: &str) -> IResult<&str, Vec<RawItem<'_>>> {
    all_consuming(separated_list1(char(','), item)).parse(input)
}

fn resolve_value(spec: &FieldSpec, token: &str, raw: &str) -> Result<u32, CronError> {
    let invalid = |reason: String| CronError::InvalidField {
        field: spec.name,
        value: raw.to_string(),
        reason,
    };

    let value = if let Ok(n) = token.parse::<u32>() {
        n
    } else {
        let lower = token.to_ascii_lowercase();
        let index = spec
            .names
            .iter()
            .position(|n| *n == lower)
            .ok_or_else(|| invalid(format!("unknown value '{token}'")))?;
        u32::try_from(index).map_err(|e| invalid(e.to_string()))? + spec.names_base
    };

    if value < spec.min || value > spec.max {
        return Err(invalid(format!(
            "{value} is outside {}-{}",
            spec.min, spec.max
        )));
    }
    Ok(value)
}

fn parse_field(spec: &FieldSpec, raw: &str) -> Result<FieldSet, CronError> {
    let invalid = |reason: &str| CronError::InvalidField {
        field: spec.name,
        value: raw.to_string(),
        reason: reason.to_string(),
    };

    let (_, parsed) = items(raw).map_err(|_| invalid("malformed expression"))?;

    let mut set = FieldSet(0);
    for (base, step) in parsed {
        let step = step.unwrap_or(1);
        if step == 0 {
            return Err(invalid("step must be greater than zero"));
        }
        if step > spec.max {
            return Err(invalid("step is larger than the field range"));
        }

        let (start, end) = match base {
            RawBase::All => (spec.min, spec.max),
            // `5/15` means "from 5 to the end, every 15".
            RawBase::Single(v) if step > 1 => (resolve_value(spec, v, raw)?, spec.max),
            RawBase::Single(v) => {
                let v = resolve_value(spec, v, raw)?;
                (v, v)
            }
            RawBase::Range(a, b) => (resolve_value(spec, a, raw)?, resolve_value(spec, b, raw)?),
        };

        if start > end {
            return Err(invalid("range start is after range end"));
        }

        let mut value = start;
        while value <= end {
            set.insert(value);
            let Some(next) = value.checked_add(step) else {
                break;
            };
            value = next;
        }
    }

    if spec.name == DAY_OF_WEEK.name && set.contains(7) {
        set.insert(0);
    }

    Ok(set)
}

fn expand_macro(expr: &str) -> Option<&'static str> {
    match expr {
        "@yearly" | "@annually" => Some("0 0 1 1 *"),
        "@monthly" => Some("0 0 1 * *"),
        "@weekly" => Some("0 0 * * 0"),
        "@daily" | "@midnight" => Some("0 0 * * *"),
        "@hourly" => Some("0 * * * *"),
        _ => None,
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    /// Parses a five-field expression or one of the `@daily`-style macros.
    ///
    /// ```rust
    /// use ldapguard::parser::cron::CronSchedule;
    ///
    /// assert!(CronSchedule::parse("0 2 * * *").is_ok());
    /// assert!(CronSchedule::parse("61 * * * *").is_err());
    /// ```
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let trimmed = expr.trim();
        let expanded = if trimmed.starts_with('@') {
            expand_macro(&trimmed.to_ascii_lowercase()).ok_or_else(|| CronError::InvalidField {
                field: "macro",
                value: trimmed.to_string(),
                reason: "unknown macro".to_string(),
            })?
        } else {
            trimmed
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        Ok(Self {
            source: trimmed.to_string(),
            minutes: parse_field(&MINUTE, fields[0])?,
            hours: parse_field(&HOUR, fields[1])?,
            days_of_month: parse_field(&DAY_OF_MONTH, fields[2])?,
            months: parse_field(&MONTH, fields[3])?,
            days_of_week: parse_field(&DAY_OF_WEEK, fields[4])?,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());

        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// First fire time strictly after `after`, or `None` if the expression
    /// never matches within five years (e.g. February 30th).
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let limit = after.checked_add_days(Days::new(SEARCH_HORIZON_DAYS))?;
        let mut t = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);

        while t <= limit {
            let date = t.date_naive();

            if !self.months.contains(t.month()) {
                let (year, month) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = NaiveDate::from_ymd_opt(year, month, 1)?
                    .and_hms_opt(0, 0, 0)?
                    .and_utc();
                continue;
            }

            if !self.day_matches(date) {
                t = date.checked_add_days(Days::new(1))?.and_hms_opt(0, 0, 0)?.and_utc();
                continue;
            }

            if !self.hours.contains(t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }

            if !self.minutes.contains(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }

            return Some(t);
        }

        None
    }

    /// The next `count` fire times after `after`.
    #[must_use]
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut times = Vec::with_capacity(count);
        let mut cursor = after;
        while times.len() < count {
            let Some(next) = self.next_after(cursor) else {
                break;
            };
            times.push(next);
            cursor = next;
        }
        times
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_daily_at_two() {
        let cron = CronSchedule::parse("0 2 * * *").unwrap();
        assert_eq!(
            cron.next_after(at(2026, 3, 10, 1, 30)),
            Some(at(2026, 3, 10, 2, 0))
        );
        assert_eq!(
            cron.next_after(at(2026, 3, 10, 2, 0)),
            Some(at(2026, 3, 11, 2, 0))
        );
    }

    #[test]
    fn test_steps_ranges_and_lists() {
        let cron = CronSchedule::parse("*/15 9-17 * * 1-5").unwrap();
        // Saturday 2026-03-14 rolls to Monday morning
        assert_eq!(
            cron.next_after(at(2026, 3, 14, 12, 0)),
            Some(at(2026, 3, 16, 9, 0))
        );
        assert_eq!(
            cron.next_after(at(2026, 3, 16, 9, 0)),
            Some(at(2026, 3, 16, 9, 15))
        );

        let cron = CronSchedule::parse("5,35 0 1,15 * *").unwrap();
        assert_eq!(
            cron.next_after(at(2026, 3, 1, 0, 5)),
            Some(at(2026, 3, 1, 0, 35))
        );
        assert_eq!(
            cron.next_after(at(2026, 3, 1, 0, 35)),
            Some(at(2026, 3, 15, 0, 5))
        );
    }

    #[test]
    fn test_names_and_sunday_alias() {
        let by_name = CronSchedule::parse("0 0 * jan-mar sun").unwrap();
        let by_number = CronSchedule::parse("0 0 * 1-3 7").unwrap();
        let from = at(2026, 1, 1, 0, 0);
        assert_eq!(by_name.next_after(from), by_number.next_after(from));
        // 2026-01-04 is a Sunday
        assert_eq!(by_name.next_after(from), Some(at(2026, 1, 4, 0, 0)));
    }

    #[test]
    fn test_day_of_month_or_day_of_week() {
        // Fires on the 13th and on every Friday.
        let cron = CronSchedule::parse("0 0 13 * 5").unwrap();
        // 2026-03-06 is a Friday, before the 13th
        assert_eq!(
            cron.next_after(at(2026, 3, 1, 0, 0)),
            Some(at(2026, 3, 6, 0, 0))
        );
        assert_eq!(
            cron.next_after(at(2026, 3, 10, 0, 0)),
            Some(at(2026, 3, 13, 0, 0))
        );
    }

    #[test]
    fn test_macros() {
        let cron = CronSchedule::parse("@daily").unwrap();
        assert_eq!(
            cron.next_after(at(2026, 5, 5, 13, 7)),
            Some(at(2026, 5, 6, 0, 0))
        );
        assert!(CronSchedule::parse("@fortnightly").is_err());
    }

    #[test]
    fn test_rejects_invalid_expressions() {
        assert_eq!(
            CronSchedule::parse("* * * *"),
            Err(CronError::FieldCount(4))
        );
        assert!(CronSchedule::parse("60 * * * *").is_err());
        assert!(CronSchedule::parse("* 24 * * *").is_err());
        assert!(CronSchedule::parse("* * 0 * *").is_err());
        assert!(CronSchedule::parse("*/0 * * * *").is_err());
        assert!(CronSchedule::parse("5/4294967295 * * * *").is_err());
        assert!(CronSchedule::parse("* */25 * * *").is_err());
        assert!(CronSchedule::parse("10-5 * * * *").is_err());
        assert!(CronSchedule::parse("* * * foo *").is_err());
        assert!(CronSchedule::parse("1,,2 * * * *").is_err());
        assert!(CronSchedule::parse("not a cron at all").is_err());
    }

    #[test]
    fn test_impossible_date_has_no_next_run() {
        let cron = CronSchedule::parse("0 0 30 2 *").unwrap();
        assert_eq!(cron.next_after(at(2026, 1, 1, 0, 0)), None);
    }

    #[test]
    fn test_upcoming() {
        let cron = CronSchedule::parse("0 */6 * * *").unwrap();
        let times = cron.upcoming(at(2026, 3, 10, 0, 0), 3);
        assert_eq!(
            times,
            vec![
                at(2026, 3, 10, 6, 0),
                at(2026, 3, 10, 12, 0),
                at(2026, 3, 10, 18, 0)
            ]
        );
    }
}
