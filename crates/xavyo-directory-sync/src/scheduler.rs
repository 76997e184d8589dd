//! Scheduling for automatic source runs.
//!
//! Schedules are five-field cron expressions evaluated in the schedule's
//! timezone: `UTC`, a fixed offset such as `+02:00`, or an IANA zone such
//! as `America/Chicago`.
//!
//! Across DST changes a cron time that falls in a spring-forward gap fires
//! at the first instant after the gap, and a time repeated by a fall-back
//! fires once, at its earlier instance.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DirectorySyncError, DirectorySyncResult};
use crate::models::{DirectorySource, SyncOptions, SyncSchedule};
use crate::service::DirectorySyncService;
use crate::types::Actor;

/// How far ahead a cron search looks before giving up.
const MAX_SEARCH_YEARS: i32 = 5;

/// Longest DST gap searched past when a local time does not exist.
const MAX_GAP_MINUTES: i64 = 180;

/// Schedule parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {message}")]
    InvalidCron { expression: String, message: String },

    #[error(
        "Invalid timezone '{0}': expected UTC, a fixed offset like +02:00 or an IANA zone like America/Chicago"
    )]
    InvalidTimezone(String),
}

/// Timezone a schedule is evaluated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleTimezone {
    Fixed(FixedOffset),
    /// IANA zone with DST rules.
    Named(Tz),
}

/// A parsed five-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days_of_month: BTreeSet<u32>,
    months: BTreeSet<u32>,
    /// 0 = Sunday.
    days_of_week: BTreeSet<u32>,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl FromStr for CronSchedule {
    type Err = ScheduleError;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let err = |message: String| ScheduleError::InvalidCron {
            expression: expression.to_string(),
            message,
        };
        if fields.len() != 5 {
            return Err(err(format!("expected 5 fields, found {}", fields.len())));
        }

        let minutes = parse_field(fields[0], 0, 59).map_err(&err)?;
        let hours = parse_field(fields[1], 0, 23).map_err(&err)?;
        let days_of_month = parse_field(fields[2], 1, 31).map_err(&err)?;
        let months = parse_field(fields[3], 1, 12).map_err(&err)?;
        let days_of_week = parse_field(fields[4], 0, 7)
            .map_err(&err)?
            .into_iter()
            .map(|d| d % 7)
            .collect();

        Ok(Self {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        })
    }
}

fn parse_field(expr: &str, min: u32, max: u32) -> Result<BTreeSet<u32>, String> {
    let mut values = BTreeSet::new();
    for part in expr.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{step}'"))?;
                if step == 0 {
                    return Err("step must be positive".to_string());
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let parse = |s: &str| -> Result<u32, String> {
            s.parse::<u32>().map_err(|_| format!("invalid value '{s}'"))
        };
        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse(a)?, parse(b)?)
        } else {
            let value = parse(range)?;
            // `5/15` means every 15 starting at 5.
            (value, if step.is_some() { max } else { value })
        };

        if lo < min || hi > max || lo > hi {
            return Err(format!("'{part}' is outside {min}-{max}"));
        }
        values.extend((lo..=hi).step_by(step.unwrap_or(1) as usize));
    }
    Ok(values)
}

impl CronSchedule {
    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(&date.day());
        let dow = self
            .days_of_week
            .contains(&date.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// First matching minute strictly after `from`.
    #[must_use]
    pub fn next_after(&self, from: NaiveDateTime) -> Option<NaiveDateTime> {
        let start = from.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let limit_year = start.year() + MAX_SEARCH_YEARS;
        let mut t = start;

        while t.year() <= limit_year {
            if !self.months.contains(&t.month()) {
                let (year, month) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hours.contains(&t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(&t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

/// Parse `UTC`, `Z`, a `±HH:MM` / `±HHMM` offset or an IANA zone name.
pub fn parse_timezone(tz: &str) -> Result<ScheduleTimezone, ScheduleError> {
    let tz = tz.trim();
    let invalid = || ScheduleError::InvalidTimezone(tz.to_string());
    if tz.is_empty() || tz.eq_ignore_ascii_case("utc") || tz == "Z" {
        return FixedOffset::east_opt(0)
            .map(ScheduleTimezone::Fixed)
            .ok_or_else(invalid);
    }

    let (sign, rest) = match tz.as_bytes().first() {
        Some(b'+') => (1, &tz[1..]),
        Some(b'-') => (-1, &tz[1..]),
        _ => return tz.parse::<Tz>().map(ScheduleTimezone::Named).map_err(|_| invalid()),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let hours: i32 = digits[..2].parse().map_err(|_| invalid())?;
    let minutes: i32 = digits[2..].parse().map_err(|_| invalid())?;
    if hours > 14 || minutes > 59 {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .map(ScheduleTimezone::Fixed)
        .ok_or_else(invalid)
}

/// First firing of `cron` in `tz` strictly after `from`.
fn next_fire<Z: TimeZone>(cron: &CronSchedule, tz: &Z, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let mut local = from.with_timezone(tz).naive_local();
    loop {
        let next = cron.next_after(local)?;
        let instant = tz
            .from_local_datetime(&next)
            .earliest()
            .or_else(|| after_gap(tz, next))
            .map(|t| t.with_timezone(&Utc));
        match instant {
            Some(instant) if instant > from => return Some(instant),
            // The earlier instance of a repeated hour has already passed.
            _ => local = next,
        }
    }
}

/// First valid instant after a local time skipped by a DST change.
fn after_gap<Z: TimeZone>(tz: &Z, skipped: NaiveDateTime) -> Option<DateTime<Z>> {
    (1..=MAX_GAP_MINUTES).find_map(|m| {
        tz.from_local_datetime(&(skipped + Duration::minutes(m)))
            .earliest()
    })
}

/// Check a schedule without evaluating it.
pub fn validate_schedule(schedule: &SyncSchedule) -> Result<(), ScheduleError> {
    CronSchedule::from_str(&schedule.cron)?;
    parse_timezone(&schedule.timezone)?;
    Ok(())
}

/// Summary of one scheduler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledRunReport {
    /// `(source_id, run_id)` of runs that completed.
    pub triggered: Vec<(Uuid, Uuid)>,
    /// Sources skipped because a run was already in progress.
    pub skipped: Vec<Uuid>,
    /// Sources whose run failed, with the error code.
    pub failed: Vec<(Uuid, String)>,
}

/// Scheduler for source runs.
pub struct SyncScheduler;

impl SyncScheduler {
    /// Next run strictly after `from`.
    pub fn calculate_next_run(
        schedule: &SyncSchedule,
        from: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        let cron = CronSchedule::from_str(&schedule.cron)?;
        Ok(match parse_timezone(&schedule.timezone)? {
            ScheduleTimezone::Fixed(offset) => next_fire(&cron, &offset, from),
            ScheduleTimezone::Named(tz) => next_fire(&cron, &tz, from),
        })
    }

    /// Whether an enabled, scheduled source should run at `now`.
    #[must_use]
    pub fn is_due(source: &DirectorySource, now: DateTime<Utc>) -> bool {
        if !source.enabled {
            return false;
        }
        let Some(schedule) = &source.schedule else {
            return false;
        };
        let anchor = source.last_run_at.unwrap_or(source.created_at);
        match Self::calculate_next_run(schedule, anchor) {
            Ok(Some(next)) => next <= now,
            Ok(None) => false,
            Err(e) => {
                warn!(source_id = %source.id, error = %e, "Ignoring unparsable schedule");
                false
            }
        }
    }

    /// Sources due at `now`.
    #[must_use]
    pub fn due_sources(sources: &[DirectorySource], now: DateTime<Utc>) -> Vec<&DirectorySource> {
        sources.iter().filter(|s| Self::is_due(s, now)).collect()
    }

    /// Trigger every due source as the system actor.
    pub async fn run_due(
        service: &DirectorySyncService,
        now: DateTime<Utc>,
    ) -> DirectorySyncResult<ScheduledRunReport> {
        let sources = service.list_scheduled_sources().await?;
        let mut report = ScheduledRunReport::default();

        for source in Self::due_sources(&sources, now) {
            let options = SyncOptions {
                deactivate_missing: source
                    .schedule
                    .as_ref()
                    .is_some_and(|s| s.deactivate_missing),
                dry_run: false,
            };
            let actor = Actor::system(source.scope());

            match service.sync_source(&actor, source.id, options).await {
                Ok(result) => {
                    info!(
                        source_id = %source.id,
                        run_id = %result.run_id,
                        requires_approval = result.requires_approval,
                        "Scheduled directory sync finished"
                    );
                    report.triggered.push((source.id, result.run_id));
                }
                Err(DirectorySyncError::RunInProgress { run_id, .. }) => {
                    debug!(source_id = %source.id, run_id = %run_id, "Skipping scheduled sync, run in progress");
                    report.skipped.push(source.id);
                }
                Err(e) => {
                    warn!(source_id = %source.id, code = e.code(), error = %e, "Scheduled directory sync failed");
                    report.failed.push((source.id, e.code().to_string()));
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn schedule(cron: &str, timezone: &str) -> SyncSchedule {
        SyncSchedule {
            cron: cron.to_string(),
            timezone: timezone.to_string(),
            deactivate_missing: false,
        }
    }

    #[test]
    fn test_daily_at_two() {
        let next = SyncScheduler::calculate_next_run(
            &schedule("0 2 * * *", "UTC"),
            at("2026-03-10T01:30:00Z"),
        )
        .unwrap();
        assert_eq!(next, Some(at("2026-03-10T02:00:00Z")));

        let next = SyncScheduler::calculate_next_run(
            &schedule("0 2 * * *", "UTC"),
            at("2026-03-10T02:00:00Z"),
        )
        .unwrap();
        assert_eq!(next, Some(at("2026-03-11T02:00:00Z")));
    }

    #[test]
    fn test_steps_and_lists() {
        let next = SyncScheduler::calculate_next_run(
            &schedule("*/15 8,12 * * *", "UTC"),
            at("2026-03-10T08:50:00Z"),
        )
        .unwrap();
        assert_eq!(next, Some(at("2026-03-10T12:00:00Z")));
    }

    #[test]
    fn test_weekday_range() {
        // 2026-03-14 is a Saturday.
        let next = SyncScheduler::calculate_next_run(
            &schedule("30 6 * * 1-5", "UTC"),
            at("2026-03-14T00:00:00Z"),
        )
        .unwrap();
        assert_eq!(next, Some(at("2026-03-16T06:30:00Z")));
    }

    #[test]
    fn test_month_rollover() {
        let next = SyncScheduler::calculate_next_run(
            &schedule("0 0 1 * *", "UTC"),
            at("2026-12-15T00:00:00Z"),
        )
        .unwrap();
        assert_eq!(next, Some(at("2027-01-01T00:00:00Z")));
    }

    #[test]
    fn test_fixed_offset_timezone() {
        // 02:00 at +02:00 is midnight UTC.
        let next = SyncScheduler::calculate_next_run(
            &schedule("0 2 * * *", "+02:00"),
            at("2026-03-09T23:00:00Z"),
        )
        .unwrap();
        assert_eq!(next, Some(at("2026-03-10T00:00:00Z")));
    }

    #[test]
    fn test_impossible_date_never_fires() {
        let next = SyncScheduler::calculate_next_run(
            &schedule("0 0 31 2 *", "UTC"),
            at("2026-01-01T00:00:00Z"),
        )
        .unwrap();
        assert_eq!(next, None);
    }

    #[test]
    fn test_invalid_expressions() {
        assert!("0 2 * *".parse::<CronSchedule>().is_err());
        assert!("61 * * * *".parse::<CronSchedule>().is_err());
        assert!("*/0 * * * *".parse::<CronSchedule>().is_err());
        assert!("5-1 * * * *".parse::<CronSchedule>().is_err());
        assert!(parse_timezone("Mars/Olympus_Mons").is_err());
        assert!(parse_timezone("+25:00").is_err());
        assert_eq!(
            parse_timezone("-0530").unwrap(),
            ScheduleTimezone::Fixed(FixedOffset::west_opt(5 * 3600 + 30 * 60).unwrap())
        );
        assert_eq!(
            parse_timezone("Europe/Paris").unwrap(),
            ScheduleTimezone::Named(chrono_tz::Europe::Paris)
        );
    }

    #[test]
    fn test_named_zone_follows_daylight_saving() {
        let nightly = schedule("0 2 * * *", "America/Chicago");
        // CST is UTC-6, CDT is UTC-5.
        let winter = SyncScheduler::calculate_next_run(&nightly, at("2026-01-10T00:00:00Z")).unwrap();
        assert_eq!(winter, Some(at("2026-01-10T08:00:00Z")));
        let summer = SyncScheduler::calculate_next_run(&nightly, at("2026-07-10T00:00:00Z")).unwrap();
        assert_eq!(summer, Some(at("2026-07-10T07:00:00Z")));
    }

    #[test]
    fn test_spring_forward_gap_fires_after_the_gap() {
        // 2026-03-08 02:30 does not exist in Chicago; clocks jump to 03:00 CDT.
        let nightly = schedule("30 2 * * *", "America/Chicago");
        let next = SyncScheduler::calculate_next_run(&nightly, at("2026-03-07T09:00:00Z")).unwrap();
        assert_eq!(next, Some(at("2026-03-08T08:00:00Z")));

        let following = SyncScheduler::calculate_next_run(&nightly, at("2026-03-08T08:00:00Z")).unwrap();
        assert_eq!(following, Some(at("2026-03-09T07:30:00Z")));
    }

    #[test]
    fn test_fall_back_overlap_fires_once_at_earliest() {
        // 2026-11-01 01:30 happens twice in Chicago: 06:30Z (CDT) and 07:30Z (CST).
        let nightly = schedule("30 1 * * *", "America/Chicago");
        let next = SyncScheduler::calculate_next_run(&nightly, at("2026-10-31T12:00:00Z")).unwrap();
        assert_eq!(next, Some(at("2026-11-01T06:30:00Z")));

        for from in ["2026-11-01T06:30:00Z", "2026-11-01T07:00:00Z"] {
            let next = SyncScheduler::calculate_next_run(&nightly, at(from)).unwrap();
            assert_eq!(next, Some(at("2026-11-02T07:30:00Z")), "from {from}");
        }
    }

    #[test]
    fn test_sunday_as_seven() {
        let cron: CronSchedule = "0 0 * * 7".parse().unwrap();
        assert!(cron.days_of_week.contains(&0));
    }
}
