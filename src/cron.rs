//! Five-field cron grammar: parsing, validation, and timezone-aware evaluation.
//!
//! Grounded in the same grammar (`*`, value, range `a-b`, step `a/b`, comma list)
//! used throughout this ecosystem, but evaluated with the day-of-month /
//! day-of-week tie-break rule real cron implementations use: when *both*
//! fields carry a non-`*` constraint, a day matches if it satisfies *either*
//! one, not both.

use crate::errors::CronParseError;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Search horizon for `next_after`: schedules that never fire within this
/// many minutes of the reference instant are treated as not due (§4.2).
const HORIZON_MINUTES: i64 = 4 * 366 * 24 * 60;

const FIELD_NAMES: [&str; 5] = ["minute", "hour", "day", "month", "weekday"];
const FIELD_RANGES: [(u32, u32); 5] = [(0, 59), (0, 23), (1, 31), (1, 12), (0, 6)];

#[derive(Debug, Clone, PartialEq, Eq)]
enum FieldSpec {
    Any,
    Set(Vec<u32>),
}

impl FieldSpec {
    fn matches(&self, value: u32) -> bool {
        match self {
            FieldSpec::Any => true,
            FieldSpec::Set(values) => values.binary_search(&value).is_ok(),
        }
    }

    fn is_any(&self) -> bool {
        matches!(self, FieldSpec::Any)
    }
}

/// A parsed, validated five-field cron expression (minute hour day month weekday).
///
/// Serializes as the original expression string so that `parse(format(schedule))
/// == schedule` round-trips (§8) and so the persisted `TaskJSON` carries the
/// human-authored form rather than a normalized/expanded one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CronSchedule {
    raw: String,
    #[serde(skip)]
    minute: FieldSpec,
    #[serde(skip)]
    hour: FieldSpec,
    #[serde(skip)]
    day_of_month: FieldSpec,
    #[serde(skip)]
    month: FieldSpec,
    #[serde(skip)]
    day_of_week: FieldSpec,
}

impl Default for FieldSpec {
    fn default() -> Self {
        FieldSpec::Any
    }
}

impl TryFrom<String> for CronSchedule {
    type Error = CronParseError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        parse(&value)
    }
}

impl From<CronSchedule> for String {
    fn from(value: CronSchedule) -> Self {
        value.raw
    }
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}
impl Eq for CronSchedule {}

impl CronSchedule {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// A human-facing rendering for common shapes, falling back to the raw
    /// expression when no template matches (§6.1 `schedule_display`).
    pub fn display(&self) -> String {
        let parts: Vec<&str> = self.raw.split_whitespace().collect();
        if parts.len() != 5 {
            return self.raw.clone();
        }
        if let Some(step) = parts[0].strip_prefix("*/") {
            if parts[1] == "*" && parts[2] == "*" && parts[3] == "*" && parts[4] == "*" {
                return format!("Every {step} minutes");
            }
        }
        if parts[0] == "0" && parts[1] == "*" && parts[2] == "*" && parts[3] == "*" && parts[4] == "*"
        {
            return "Every hour".to_string();
        }
        if let (Ok(min), Ok(hour)) = (parts[0].parse::<u32>(), parts[1].parse::<u32>()) {
            if parts[2] == "*" && parts[3] == "*" && parts[4] == "*" {
                return format!("Daily at {hour:02}:{min:02}");
            }
        }
        self.raw.clone()
    }
}

/// Parse and validate a five-field cron expression against the grammar in §4.2.
pub fn parse(expr: &str) -> Result<CronSchedule, CronParseError> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(CronParseError {
            field: "cron",
            reason: format!("expected 5 fields (minute hour day month weekday), got {}", fields.len()),
        });
    }

    let minute = parse_field(fields[0], FIELD_NAMES[0], FIELD_RANGES[0])?;
    let hour = parse_field(fields[1], FIELD_NAMES[1], FIELD_RANGES[1])?;
    let day_of_month = parse_field(fields[2], FIELD_NAMES[2], FIELD_RANGES[2])?;
    let month = parse_field(fields[3], FIELD_NAMES[3], FIELD_RANGES[3])?;
    let day_of_week = parse_field(fields[4], FIELD_NAMES[4], FIELD_RANGES[4])?;

    Ok(CronSchedule {
        raw: expr.to_string(),
        minute,
        hour,
        day_of_month,
        month,
        day_of_week,
    })
}

fn parse_field(field: &str, name: &'static str, (min, max): (u32, u32)) -> Result<FieldSpec, CronParseError> {
    if field == "*" {
        return Ok(FieldSpec::Any);
    }
    if let Some(step_s) = field.strip_prefix("*/") {
        let step: u32 = step_s.parse().map_err(|_| CronParseError {
            field: name,
            reason: format!("invalid step '*/{step_s}' — expected a number"),
        })?;
        if step == 0 || step > max {
            return Err(CronParseError {
                field: name,
                reason: format!("step {step} out of range 1..={max}"),
            });
        }
        let mut values: Vec<u32> = (min..=max).filter(|v| (v - min).is_multiple_of(step)).collect();
        values.sort_unstable();
        return Ok(FieldSpec::Set(values));
    }

    let mut values = Vec::new();
    for part in field.split(',') {
        if let Some((base, step_s)) = part.split_once('/') {
            let step: u32 = step_s
                .parse()
                .map_err(|_| CronParseError { field: name, reason: format!("invalid step '{part}' — expected a number") })?;
            if step == 0 {
                return Err(CronParseError { field: name, reason: format!("step {step} out of range 1..={max}") });
            }
            // `a/b` (no range) steps from `a` to the field's max, per the
            // grammar's `step a/b` form; `a-b/c` steps within the range.
            let (start, end) = match base.split_once('-') {
                Some((start_s, end_s)) => {
                    let start: u32 = start_s
                        .parse()
                        .map_err(|_| CronParseError { field: name, reason: format!("invalid range start '{start_s}'") })?;
                    let end: u32 = end_s
                        .parse()
                        .map_err(|_| CronParseError { field: name, reason: format!("invalid range end '{end_s}'") })?;
                    (start, end)
                }
                None => {
                    let start: u32 = base.parse().map_err(|_| CronParseError { field: name, reason: format!("invalid step base '{base}'") })?;
                    (start, max)
                }
            };
            if start < min || start > max || end < min || end > max {
                return Err(CronParseError {
                    field: name,
                    reason: format!("range {start}-{end} out of bounds {min}..={max}"),
                });
            }
            if start > end {
                return Err(CronParseError { field: name, reason: format!("range start {start} > end {end}") });
            }
            values.extend((start..=end).filter(|v| (v - start).is_multiple_of(step)));
        } else if let Some((start_s, end_s)) = part.split_once('-') {
            let start: u32 = start_s
                .parse()
                .map_err(|_| CronParseError { field: name, reason: format!("invalid range start '{start_s}'") })?;
            let end: u32 = end_s
                .parse()
                .map_err(|_| CronParseError { field: name, reason: format!("invalid range end '{end_s}'") })?;
            if start < min || start > max || end < min || end > max {
                return Err(CronParseError {
                    field: name,
                    reason: format!("range {start}-{end} out of bounds {min}..={max}"),
                });
            }
            if start > end {
                return Err(CronParseError { field: name, reason: format!("range start {start} > end {end}") });
            }
            values.extend(start..=end);
        } else {
            let n: u32 = part
                .parse()
                .map_err(|_| CronParseError { field: name, reason: format!("invalid value '{part}'") })?;
            if n < min || n > max {
                return Err(CronParseError { field: name, reason: format!("value {n} out of range {min}..={max}") });
            }
            values.push(n);
        }
    }
    values.sort_unstable();
    values.dedup();
    Ok(FieldSpec::Set(values))
}

/// Parse an IANA timezone name, for use when validating a `ScheduledTask`.
pub fn parse_timezone(tz: &str) -> Result<Tz, CronParseError> {
    tz.parse::<Tz>().map_err(|_| CronParseError {
        field: "timezone",
        reason: format!("invalid IANA timezone '{tz}'"),
    })
}

fn day_matches(schedule: &CronSchedule, date: NaiveDate) -> bool {
    let dom_any = schedule.day_of_month.is_any();
    let dow_any = schedule.day_of_week.is_any();
    let dom_match = schedule.day_of_month.matches(date.day());
    let dow_match = schedule
        .day_of_week
        .matches(date.weekday().num_days_from_sunday());

    match (dom_any, dow_any) {
        (true, true) => true,
        (true, false) => dow_match,
        (false, true) => dom_match,
        (false, false) => dom_match || dow_match,
    }
}

fn minute_matches(schedule: &CronSchedule, dt: &NaiveDateTime) -> bool {
    schedule.minute.matches(dt.minute())
        && schedule.hour.matches(dt.hour())
        && schedule.month.matches(dt.month())
        && day_matches(schedule, dt.date())
}

/// Smallest instant strictly greater than `reference` at which `schedule` fires,
/// evaluated in `tz`. Returns `None` if no firing exists within the search
/// horizon (schedule is unreachable, e.g. Feb 31).
pub fn next_after(schedule: &CronSchedule, tz: Tz, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let local_ref = reference.with_timezone(&tz);
    let mut candidate = local_ref
        .naive_local()
        .date()
        .and_time(NaiveTime::from_hms_opt(local_ref.hour(), local_ref.minute(), 0).unwrap())
        + chrono::Duration::minutes(1);

    for _ in 0..HORIZON_MINUTES {
        if minute_matches(schedule, &candidate) {
            match tz.from_local_datetime(&candidate) {
                chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                chrono::LocalResult::Ambiguous(earliest, _) => {
                    return Some(earliest.with_timezone(&Utc));
                }
                chrono::LocalResult::None => {
                    candidate += chrono::Duration::minutes(1);
                    continue;
                }
            }
        }
        candidate += chrono::Duration::minutes(1);
    }
    None
}

/// The firing instant in `(reference, reference + window]`, if any.
///
/// The upper bound is inclusive rather than the strict `<` a literal reading of
/// "fires within a window" might suggest: `TaskStore::due_tasks` is driven by
/// `check_schedule` with `reference = now - window`, so a firing that lands
/// exactly on `now` (the common case for round cron expressions evaluated on a
/// matching tick boundary) must still be picked up by the tick occurring at
/// `now`, or it is silently skipped forever on an exact-multiple schedule.
pub fn fire_within(schedule: &CronSchedule, tz: Tz, reference: DateTime<Utc>, window: Duration) -> Option<DateTime<Utc>> {
    let bound = reference + chrono::Duration::from_std(window).unwrap_or_default();
    next_after(schedule, tz, reference).filter(|fire_at| *fire_at <= bound)
}

/// True iff `schedule` has a firing in `(reference, reference + window]`.
pub fn fires_within(schedule: &CronSchedule, tz: Tz, reference: DateTime<Utc>, window: Duration) -> bool {
    fire_within(schedule, tz, reference, window).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone as _;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(parse("* * *").is_err());
        assert!(parse("* * * * * *").is_err());
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(parse("60 * * * *").is_err());
        assert!(parse("* 24 * * *").is_err());
        assert!(parse("* * 0 * *").is_err());
        assert!(parse("* * * 13 *").is_err());
        assert!(parse("* * * * 7").is_err());
        assert!(parse("*/0 * * * *").is_err());
    }

    #[test]
    fn step_with_explicit_base_parses_like_wildcard_step() {
        let explicit = parse("0/15 * * * *").unwrap();
        let wildcard = parse("*/15 * * * *").unwrap();
        assert_eq!(explicit.minute, wildcard.minute);
    }

    #[test]
    fn step_with_explicit_range_base_is_bounded_by_the_range() {
        let schedule = parse("9-17/4 * * * *").unwrap();
        assert_eq!(schedule.minute, FieldSpec::Set(vec![9, 13, 17]));
    }

    #[test]
    fn every_15_minutes_fires_four_times_per_hour() {
        let schedule = parse("*/15 * * * *").unwrap();
        let mut count = 0;
        let mut t = at(2024, 1, 1, 0, 0);
        let end = at(2024, 1, 1, 1, 0);
        while t < end {
            if fires_within(&schedule, Tz::UTC, t, Duration::from_secs(60)) {
                count += 1;
            }
            t += chrono::Duration::minutes(1);
        }
        assert_eq!(count, 4);
    }

    #[test]
    fn unreachable_schedule_never_fires_within_horizon() {
        let schedule = parse("0 0 29 2 *").unwrap();
        // 2023 is not a leap year; search forward from non-leap-year Jan 1.
        let next = next_after(&schedule, Tz::UTC, at(2023, 1, 1, 0, 0));
        // Feb 29 2024 is within 4 years, so it *will* be found — confirm it lands
        // on the correct leap day rather than silently skipping forever.
        assert_eq!(next, Some(at(2024, 2, 29, 0, 0)));
    }

    #[test]
    fn truly_unreachable_schedule_yields_none() {
        // day=31 + month=4 (April has 30 days) never occurs in any year.
        let schedule = parse("0 0 31 4 *").unwrap();
        let next = next_after(&schedule, Tz::UTC, at(2024, 1, 1, 0, 0));
        assert_eq!(next, None);
    }

    #[test]
    fn day_of_month_and_day_of_week_are_ored_when_both_restricted() {
        // 1st of the month OR Monday: day_matches must be true on both kinds of day.
        let schedule = parse("0 0 1 * 1").unwrap();
        assert!(day_matches(&schedule, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())); // Jan 1 2024 is a Monday AND the 1st
        assert!(day_matches(&schedule, NaiveDate::from_ymd_opt(2024, 1, 8).unwrap())); // a later Monday, not the 1st
        assert!(day_matches(&schedule, NaiveDate::from_ymd_opt(2024, 2, 1).unwrap())); // Feb 1 2024 is a Thursday, but the 1st
        assert!(!day_matches(&schedule, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap())); // neither
    }

    #[test]
    fn wildcard_day_field_defers_entirely_to_the_other() {
        let schedule = parse("0 0 * * 1").unwrap();
        assert!(day_matches(&schedule, NaiveDate::from_ymd_opt(2024, 1, 8).unwrap()));
        assert!(!day_matches(&schedule, NaiveDate::from_ymd_opt(2024, 1, 9).unwrap()));
    }

    #[test]
    fn dst_spring_forward_skips_nonexistent_hour() {
        let schedule = parse("30 2 * * *").unwrap();
        let tz: Tz = "America/New_York".parse().unwrap();
        // 2024-03-10: clocks jump from 2:00 to 3:00, so 2:30 never occurs.
        let next = next_after(&schedule, tz, at(2024, 3, 10, 0, 0));
        assert_eq!(next, Some(at(2024, 3, 11, 6, 30)));
    }

    #[test]
    fn dst_fall_back_takes_the_earlier_occurrence() {
        let schedule = parse("30 1 * * *").unwrap();
        let tz: Tz = "America/New_York".parse().unwrap();
        let next = next_after(&schedule, tz, at(2024, 11, 3, 0, 0));
        // 1:30 AM occurs twice on 2024-11-03; the earlier (EDT, UTC-4) occurrence wins.
        assert_eq!(next, Some(at(2024, 11, 3, 5, 30)));
    }

    #[test]
    fn tick_at_the_exact_firing_instant_catches_it() {
        // Mirrors the ScheduledTask::check_schedule convention: a tick at `now`
        // evaluates fires_within(schedule, tz, now - window, window).
        let schedule = parse("*/5 * * * *").unwrap();
        let now = at(2024, 1, 1, 0, 5);
        let window = Duration::from_secs(60);
        let reference = now - chrono::Duration::from_std(window).unwrap();
        assert!(fires_within(&schedule, Tz::UTC, reference, window));
    }

    #[test]
    fn round_trips_through_serde_as_raw_string() {
        let schedule = parse("*/5 9-17 * * 1-5").unwrap();
        let json = serde_json::to_string(&schedule).unwrap();
        assert_eq!(json, "\"*/5 9-17 * * 1-5\"");
        let back: CronSchedule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, schedule);
    }

    #[test]
    fn display_renders_common_templates() {
        assert_eq!(parse("*/15 * * * *").unwrap().display(), "Every 15 minutes");
        assert_eq!(parse("0 * * * *").unwrap().display(), "Every hour");
        assert_eq!(parse("30 9 * * *").unwrap().display(), "Daily at 09:30");
        assert_eq!(parse("5 4 1 * *").unwrap().display(), "5 4 1 * *");
    }
}
