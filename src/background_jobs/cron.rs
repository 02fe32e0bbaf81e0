use chrono::{DateTime, Utc};
use std::str::FromStr;
use thiserror::Error;

/// An invalid cron expression. Returned as a value, never raised.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid cron expression '{expression}': {reason}")]
pub struct CronParseError {
    pub expression: String,
    pub reason: String,
}

/// A parsed cron expression, evaluated in UTC.
///
/// Accepts 6 fields (with seconds), 7 fields (with year), and the standard
/// 5-field form, which is treated as firing at second 0. In the 5-field form
/// day-of-week numbers follow standard cron: 0-6 from Sunday, 7 also Sunday.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, CronParseError> {
        let trimmed = expression.trim();
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        let normalized = match fields.len() {
            5 => {
                let day_of_week =
                    standard_day_of_week(fields[4]).map_err(|reason| CronParseError {
                        expression: expression.to_string(),
                        reason,
                    })?;
                format!("0 {} {}", fields[..4].join(" "), day_of_week)
            }
            6 | 7 => trimmed.to_string(),
            n => {
                return Err(CronParseError {
                    expression: expression.to_string(),
                    reason: format!("expected 5, 6 or 7 fields, found {}", n),
                })
            }
        };

        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| CronParseError {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Smallest trigger instant strictly after `after`, if any exists.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// Rewrite a standard day-of-week field into the day names the `cron` crate
/// understands, whose own numbering starts at 1 for Sunday.
fn standard_day_of_week(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days = [false; 7];
    for element in field.split(',') {
        let (base, step) = match element.split_once('/') {
            Some((base, step)) => {
                let step: usize = step
                    .parse()
                    .map_err(|_| format!("invalid day-of-week step '{}'", step))?;
                if step == 0 {
                    return Err("day-of-week step must be positive".to_string());
                }
                (base, Some(step))
            }
            None => (element, None),
        };

        let (start, end) = match base.split_once('-') {
            _ if base == "*" => (0, 6),
            Some((start, end)) => (day_number(start)?, day_number(end)?),
            // `N/step` runs from N to the end of the week
            None if step.is_some() => (day_number(base)?, 6),
            None => {
                let day = day_number(base)?;
                (day, day)
            }
        };
        if start > end {
            return Err(format!("day-of-week range '{}' is reversed", base));
        }

        for day in (start..=end).step_by(step.unwrap_or(1)) {
            days[day % 7] = true;
        }
    }

    let names: Vec<&str> = DAY_NAMES
        .iter()
        .zip(days)
        .filter_map(|(name, selected)| selected.then_some(*name))
        .collect();
    Ok(names.join(","))
}

/// 0-7 with 0 and 7 both Sunday, or a three-letter day name.
fn day_number(value: &str) -> Result<usize, String> {
    if let Ok(day) = value.parse::<usize>() {
        return if day <= 7 {
            Ok(day)
        } else {
            Err(format!("day of week {} is out of range 0-7", day))
        };
    }
    DAY_NAMES
        .iter()
        .position(|name| name.eq_ignore_ascii_case(value))
        .ok_or_else(|| format!("invalid day of week '{}'", value))
}

/// Parse `expression` and return the next trigger strictly after `after`.
///
/// An expression that parses but never fires again (e.g. a past year) is
/// reported as a parse error too: the caller cannot schedule it either way.
pub fn next_trigger(
    expression: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, CronParseError> {
    let schedule = CronSchedule::parse(expression)?;
    schedule.next_after(after).ok_or_else(|| CronParseError {
        expression: expression.to_string(),
        reason: "expression has no future trigger".to_string(),
    })
}
