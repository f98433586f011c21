//! Cron expressions for scheduled tasks.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{JobError, Result};

/// A parsed cron expression.
///
/// Accepts the classic five-field form (`min hour dom month dow`) as well as
/// the six/seven-field form with seconds (and year) understood by the `cron`
/// crate. Five-field expressions fire at second zero.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        let normalized = match trimmed.split_whitespace().count() {
            5 => format!("0 {trimmed}"),
            _ => trimmed.to_string(),
        };

        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|e| JobError::InvalidCron {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            expression: trimmed.to_string(),
            schedule,
        })
    }

    /// The expression as supplied (before seconds normalization).
    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Time to wait from `now` until the next firing.
    pub fn delay_until_next(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.next_after(now)
            .map(|next| (next - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Gap between the next two firings; `None` if the schedule has ended.
    ///
    /// Irregular schedules (e.g. "at 9:00 and 17:00") only yield the upcoming
    /// gap, which is what lease defaults are derived from.
    pub fn period(&self) -> Option<Duration> {
        let mut upcoming = self.schedule.upcoming(Utc);
        let first = upcoming.next()?;
        let second = upcoming.next()?;
        (second - first).to_std().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_five_field_expression_gets_seconds() {
        let schedule = CronSchedule::parse("*/5 * * * *").unwrap();
        assert_eq!(schedule.expression(), "*/5 * * * *");
        assert_eq!(schedule.period(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_six_field_expression() {
        let schedule = CronSchedule::parse("*/10 * * * * *").unwrap();
        assert_eq!(schedule.period(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_next_after_and_delay() {
        let schedule = CronSchedule::parse("0 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 15, 0).unwrap();

        assert_eq!(
            schedule.next_after(now),
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap())
        );
        assert_eq!(
            schedule.delay_until_next(now),
            Some(Duration::from_secs(45 * 60))
        );
    }

    #[test]
    fn test_invalid_expression() {
        let err = CronSchedule::parse("every tuesday").unwrap_err();
        assert!(matches!(err, JobError::InvalidCron { .. }));
    }
}
