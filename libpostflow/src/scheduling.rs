//! Parsing of human-written schedule times
//!
//! Accepted forms, tried in order:
//! - RFC 3339 timestamps: "2026-11-20T15:00:00Z"
//! - Relative durations: "30m", "2h", "1d", "in 90 minutes"
//! - Natural language: "tomorrow 3pm", "next monday 10am", "2026-11-20 15:00"
//!
//! Relative and natural-language forms are resolved against the `now` the
//! caller passes, so the scheduler's clock decides what "tomorrow" means.

use chrono::{DateTime, Duration, Utc};

use crate::error::{PostflowError, Result};

/// Resolve `input` to an absolute UTC time
pub fn parse_schedule_time(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(PostflowError::InvalidInput(
            "Schedule time cannot be empty".to_string(),
        ));
    }

    if let Ok(time) = DateTime::parse_from_rfc3339(input) {
        return Ok(time.with_timezone(&Utc));
    }

    let relative = input.strip_prefix("in ").unwrap_or(input);
    if let Some(duration) = parse_duration(relative) {
        return Ok(now + duration);
    }

    chrono_english::parse_date_string(input, now, chrono_english::Dialect::Us).map_err(|e| {
        PostflowError::InvalidInput(format!("Could not parse schedule time '{}': {}", input, e))
    })
}

fn parse_duration(input: &str) -> Option<Duration> {
    let std_duration = humantime::parse_duration(input).ok()?;
    Duration::from_std(std_duration).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_rfc3339_is_taken_as_is() {
        let time = parse_schedule_time("2026-04-01T09:30:00+02:00", now()).unwrap();
        assert_eq!(time, Utc.with_ymd_and_hms(2026, 4, 1, 7, 30, 0).unwrap());
    }

    #[test]
    fn test_durations_are_relative_to_now() {
        assert_eq!(
            parse_schedule_time("30m", now()).unwrap(),
            now() + Duration::minutes(30)
        );
        assert_eq!(
            parse_schedule_time("2h", now()).unwrap(),
            now() + Duration::hours(2)
        );
        assert_eq!(
            parse_schedule_time("1d", now()).unwrap(),
            now() + Duration::days(1)
        );
        assert_eq!(
            parse_schedule_time("in 90 minutes", now()).unwrap(),
            now() + Duration::minutes(90)
        );
    }

    #[test]
    fn test_natural_language() {
        let tomorrow = parse_schedule_time("tomorrow", now()).unwrap();
        let hours = (tomorrow - now()).num_hours();
        assert!((12..=36).contains(&hours), "got {} hours", hours);

        let absolute = parse_schedule_time("2026-11-20 15:00", now()).unwrap();
        assert_eq!(absolute.date_naive().to_string(), "2026-11-20");
    }

    #[test]
    fn test_garbage_is_invalid_input() {
        for input in ["", "   ", "not a time at all", "random:10m-20m"] {
            let err = parse_schedule_time(input, now()).unwrap_err();
            assert!(matches!(err, PostflowError::InvalidInput(_)), "{}", input);
        }
    }
}
