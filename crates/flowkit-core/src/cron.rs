//! Cron engine: expression validation, timezone resolution, and next-tick
//! computation.
//!
//! Expressions use the classic five-field form (minute, hour, day-of-month,
//! month, day-of-week). The underlying parser wants a seconds field, so a `0`
//! is prepended internally; callers never see six-field syntax. All returned
//! instants are UTC-normalized so downstream comparisons are timezone
//! agnostic.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::constants::CATCH_UP_ITERATION_CAP;

pub const CRON_FIELD_COUNT: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum CronError {
    #[error("invalid cron expression: {0}")]
    InvalidExpression(String),

    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// The expression parses but never fires again (e.g. a fixed date in the
    /// past). Rejected at schedule creation so it never enters storage.
    #[error("cron expression has no upcoming tick")]
    NoUpcomingTick,

    #[error("cron catch-up exceeded {CATCH_UP_ITERATION_CAP} iterations")]
    CatchUpExceeded,
}

/// Validate a five-field cron expression.
///
/// The field count is checked before parsing so a six-field or truncated
/// expression produces a clear message instead of a generic parse failure.
pub fn validate_expression(expression: &str) -> Result<(), CronError> {
    parse_expression(expression).map(|_| ())
}

/// Resolve an IANA timezone name.
pub fn validate_timezone(timezone: &str) -> Result<Tz, CronError> {
    timezone
        .parse::<Tz>()
        .map_err(|_| CronError::InvalidTimezone(timezone.to_string()))
}

/// First trigger instant strictly after `from`, evaluated in `timezone`.
///
/// Deterministic: the same `(expression, timezone, from)` always yields the
/// same instant.
pub fn next_tick(
    expression: &str,
    timezone: &str,
    from: DateTime<Utc>,
) -> Result<DateTime<Utc>, CronError> {
    let schedule = parse_expression(expression)?;
    let tz = validate_timezone(timezone)?;
    schedule
        .after(&from.with_timezone(&tz))
        .next()
        .map(|local| local.with_timezone(&Utc))
        .ok_or(CronError::NoUpcomingTick)
}

/// Advance from `basis` until the computed tick is strictly after `now`.
///
/// This is the catch-up primitive: when ticks were missed, the result jumps
/// past all of them in one call instead of replaying a backlog. The loop is
/// hard-capped; an expression that cannot catch up within the cap is reported
/// as a configuration error rather than spinning.
pub fn advance_past(
    expression: &str,
    timezone: &str,
    basis: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, CronError> {
    let mut tick = next_tick(expression, timezone, basis)?;
    let mut iterations = 0u32;
    while tick <= now {
        iterations += 1;
        if iterations >= CATCH_UP_ITERATION_CAP {
            return Err(CronError::CatchUpExceeded);
        }
        tick = next_tick(expression, timezone, tick)?;
    }
    Ok(tick)
}

fn parse_expression(expression: &str) -> Result<Schedule, CronError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != CRON_FIELD_COUNT {
        return Err(CronError::InvalidExpression(format!(
            "expected {} fields, got {}",
            CRON_FIELD_COUNT,
            fields.len()
        )));
    }
    // Seconds pinned to zero; ticks land on minute boundaries.
    let with_seconds = format!("0 {}", fields.join(" "));
    Schedule::from_str(&with_seconds)
        .map_err(|e| CronError::InvalidExpression(format!("{}: {}", expression, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn rejects_wrong_field_count() {
        for expr in ["* * * *", "* * * * * *", "", "0 9"] {
            let err = validate_expression(expr).unwrap_err();
            assert!(
                matches!(err, CronError::InvalidExpression(ref m) if m.contains("fields")),
                "{expr:?} should fail the field-count check, got {err}"
            );
        }
    }

    #[test]
    fn rejects_garbage_fields() {
        assert!(matches!(
            validate_expression("61 * * * *"),
            Err(CronError::InvalidExpression(_))
        ));
        assert!(matches!(
            validate_expression("a b c d e"),
            Err(CronError::InvalidExpression(_))
        ));
    }

    #[test]
    fn accepts_common_expressions() {
        for expr in ["* * * * *", "0 9 * * *", "*/15 * * * *", "30 2 1 * *", "0 0 * * 1-5"] {
            assert!(validate_expression(expr).is_ok(), "{expr} should validate");
        }
    }

    #[test]
    fn rejects_unknown_timezone() {
        assert!(matches!(
            validate_timezone("Mars/Olympus_Mons"),
            Err(CronError::InvalidTimezone(_))
        ));
        assert!(validate_timezone("America/New_York").is_ok());
        assert!(validate_timezone("UTC").is_ok());
    }

    #[test]
    fn next_tick_respects_timezone() {
        // 09:30 in New York on a January date (EST, UTC-5) is 14:30 UTC.
        let from = utc(2024, 1, 15, 0, 0);
        let tick = next_tick("30 9 * * *", "America/New_York", from).unwrap();
        assert_eq!(tick, utc(2024, 1, 15, 14, 30));

        // Same wall-clock rule in July (EDT, UTC-4) is 13:30 UTC.
        let from = utc(2024, 7, 15, 0, 0);
        let tick = next_tick("30 9 * * *", "America/New_York", from).unwrap();
        assert_eq!(tick, utc(2024, 7, 15, 13, 30));
    }

    #[test]
    fn next_tick_is_strictly_after_from() {
        let from = utc(2024, 1, 15, 14, 30);
        let tick = next_tick("30 14 * * *", "UTC", from).unwrap();
        assert_eq!(tick, utc(2024, 1, 16, 14, 30));
    }

    #[test]
    fn next_tick_is_deterministic() {
        let from = utc(2024, 3, 1, 12, 0);
        let a = next_tick("*/10 * * * *", "Europe/Berlin", from).unwrap();
        let b = next_tick("*/10 * * * *", "Europe/Berlin", from).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn advance_past_jumps_over_missed_ticks() {
        // Hourly schedule, basis three days stale: one call lands in the future.
        let basis = utc(2024, 1, 1, 0, 0);
        let now = utc(2024, 1, 4, 7, 25);
        let tick = advance_past("0 * * * *", "UTC", basis, now).unwrap();
        assert_eq!(tick, utc(2024, 1, 4, 8, 0));
    }

    #[test]
    fn advance_past_without_backlog_is_plain_next_tick() {
        let basis = utc(2024, 1, 1, 0, 0);
        let now = utc(2024, 1, 1, 0, 0);
        let tick = advance_past("0 6 * * *", "UTC", basis, now).unwrap();
        assert_eq!(tick, utc(2024, 1, 1, 6, 0));
    }

    #[test]
    fn advance_past_hits_iteration_cap() {
        // Per-minute schedule more than 10_000 minutes behind cannot catch up.
        let basis = utc(2024, 1, 1, 0, 0);
        let now = utc(2024, 1, 9, 0, 0);
        assert!(matches!(
            advance_past("* * * * *", "UTC", basis, now),
            Err(CronError::CatchUpExceeded)
        ));
    }
}
