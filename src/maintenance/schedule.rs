// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Cron schedule validation and next-run calculation.
//!
//! Accepted forms are what a Kubernetes CronJob accepts: five whitespace
//! separated fields, or one of the `@` aliases.

use crate::error::{MaintenanceError, Result};
use chrono::{DateTime, Utc};
use croner::Cron;

const ALIASES: &[(&str, &str)] = &[
    ("@yearly", "0 0 1 1 *"),
    ("@annually", "0 0 1 1 *"),
    ("@monthly", "0 0 1 * *"),
    ("@weekly", "0 0 * * 0"),
    ("@daily", "0 0 * * *"),
    ("@midnight", "0 0 * * *"),
    ("@hourly", "0 * * * *"),
];

/// Expand an alias to its five-field form; other input is returned trimmed
fn expand(schedule: &str) -> &str {
    let trimmed = schedule.trim();
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == trimmed)
        .map(|(_, expanded)| *expanded)
        .unwrap_or(trimmed)
}

fn invalid(schedule: &str, reason: impl Into<String>) -> MaintenanceError {
    MaintenanceError::InvalidSchedule {
        schedule: schedule.to_string(),
        reason: reason.into(),
    }
}

fn parse(schedule: &str) -> Result<Cron> {
    let expanded = expand(schedule);
    if expanded.starts_with('@') {
        return Err(invalid(schedule, "unknown alias"));
    }

    let fields: Vec<&str> = expanded.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(invalid(
            schedule,
            format!("expected 5 fields, found {}", fields.len()),
        ));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '*' | ',' | '-' | '/' | '?');
    if let Some(field) = fields.iter().find(|f| !f.chars().all(allowed)) {
        return Err(invalid(schedule, format!("unsupported field '{}'", field)));
    }

    Cron::new(&fields.join(" "))
        .parse()
        .map_err(|e| invalid(schedule, e.to_string()))
}

/// Validate a schedule before it is written to a CronJob
pub fn validate(schedule: &str) -> Result<()> {
    parse(schedule).map(|_| ())
}

/// Next time the schedule fires strictly after `after`
pub fn next_run(schedule: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    parse(schedule)
        .ok()?
        .find_next_occurrence(&after, false)
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_accepts_standard_expressions() {
        for schedule in [
            "0 2 * * *",
            "*/15 * * * *",
            "0 2 * * 0",
            "0 2 1 * *",
            "30 3 * * 1-5",
            "0 0,12 * * *",
        ] {
            assert!(validate(schedule).is_ok(), "{} should be valid", schedule);
        }
    }

    #[test]
    fn test_accepts_aliases() {
        for alias in ["@daily", "@weekly", "@monthly", "@yearly", "@annually", "@hourly"] {
            assert!(validate(alias).is_ok(), "{} should be valid", alias);
        }
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(validate("every night").is_err());
        assert!(validate("").is_err());
        assert!(validate("@fortnightly").is_err());
        assert!(validate("0 2 * *").is_err());
        assert!(validate("0 0 2 * * *").is_err());
        assert!(validate("61 2 * * *").is_err());
        assert!(validate("0 25 * * *").is_err());
        assert!(validate("0 2 * * 1#2").is_err());
    }

    #[test]
    fn test_error_names_the_schedule() {
        let err = validate("0 2 * *").unwrap_err();
        assert!(err.to_string().contains("0 2 * *"));
        assert!(err.to_string().contains("expected 5 fields"));
    }

    #[test]
    fn test_next_run_daily() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let next = next_run("0 2 * * *", now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 11, 2, 0, 0).unwrap());
    }

    #[test]
    fn test_next_run_alias() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 30, 0).unwrap();
        let next = next_run("@hourly", now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 10, 13, 0, 0).unwrap());
    }

    #[test]
    fn test_next_run_invalid_is_none() {
        assert!(next_run("nonsense", Utc::now()).is_none());
    }
}
