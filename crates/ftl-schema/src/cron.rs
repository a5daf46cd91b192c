//! Cron expressions for `+cron` verbs.
//!
//! Accepted forms:
//! - 5 fields (`min hour dom mon dow`)
//! - 6 fields, either seconds first or a trailing 4-digit year
//! - 7 fields (`sec min hour dom mon dow year`)
//! - a single interval such as `30s`, `10m` or `12h`
//! - a weekday name such as `Mon`, which fires at midnight UTC

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use croner::Cron;
use thiserror::Error;

const MIN_YEAR: i32 = 1970;
const MAX_YEAR: i32 = 2099;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CronError {
    #[error("{0}")]
    Invalid(String),

    #[error("no occurrence of {0:?} after {1}")]
    NoOccurrence(String, DateTime<Utc>),
}

/// A parsed cron pattern.
#[derive(Clone)]
pub struct CronPattern {
    text: String,
    cron: Cron,
    years: Option<BTreeSet<i32>>,
}

impl fmt::Debug for CronPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronPattern")
            .field("text", &self.text)
            .field("years", &self.years)
            .finish()
    }
}

impl fmt::Display for CronPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl CronPattern {
    pub fn parse(text: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = text.split_whitespace().collect();
        let (pattern, years) = match fields.len() {
            1 => (shorthand(fields[0])?, None),
            5 => (fields.join(" "), None),
            6 if is_year(fields[5]) => (fields[..5].join(" "), parse_years(fields[5])?),
            6 => (fields.join(" "), None),
            7 => (fields[..6].join(" "), parse_years(fields[6])?),
            n => {
                return Err(CronError::Invalid(format!(
                    "expected 5, 6 or 7 fields but found {n}"
                )));
            }
        };
        let cron = Cron::new(&pattern)
            .with_seconds_optional()
            .parse()
            .map_err(|e| CronError::Invalid(e.to_string()))?;
        Ok(Self {
            text: text.to_string(),
            cron,
            years,
        })
    }

    /// The first firing strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
        let mut from = after;
        let mut inclusive = false;
        loop {
            let next = self
                .cron
                .find_next_occurrence(&from, inclusive)
                .map_err(|_| CronError::NoOccurrence(self.text.clone(), after))?;
            let Some(years) = &self.years else {
                return Ok(next);
            };
            if years.contains(&next.year()) {
                return Ok(next);
            }
            let year = years
                .range(next.year() + 1..)
                .next()
                .copied()
                .ok_or_else(|| CronError::NoOccurrence(self.text.clone(), after))?;
            from = Utc
                .with_ymd_and_hms(year, 1, 1, 0, 0, 0)
                .single()
                .ok_or_else(|| CronError::NoOccurrence(self.text.clone(), after))?;
            inclusive = true;
        }
    }
}

/// Parse and check that the pattern fires at least once after `origin`.
pub fn validate(text: &str, origin: DateTime<Utc>) -> Result<CronPattern, CronError> {
    let pattern = CronPattern::parse(text)?;
    pattern.next_after(origin)?;
    Ok(pattern)
}

/// The first firing of `text` strictly after `after`.
pub fn next_after(text: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
    CronPattern::parse(text)?.next_after(after)
}

fn is_year(field: &str) -> bool {
    field.len() == 4 && field.bytes().all(|b| b.is_ascii_digit())
}

fn shorthand(text: &str) -> Result<String, CronError> {
    if let Some(day) = weekday(text) {
        return Ok(format!("0 0 0 * * {day}"));
    }
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| CronError::Invalid(format!("invalid cron shorthand {text:?}")))?;
    let (digits, unit) = text.split_at(split);
    let value: u32 = digits
        .parse()
        .map_err(|_| CronError::Invalid(format!("invalid cron shorthand {text:?}")))?;
    let (limit, pattern) = match unit {
        "s" => (59, format!("*/{value} * * * * *")),
        "m" => (59, format!("0 */{value} * * * *")),
        "h" => (23, format!("0 0 */{value} * * *")),
        _ => {
            return Err(CronError::Invalid(format!(
                "invalid cron shorthand {text:?}: use a single 's', 'm' or 'h' interval or a weekday"
            )));
        }
    };
    if value == 0 || value > limit {
        return Err(CronError::Invalid(format!(
            "invalid cron shorthand {text:?}: interval must be between 1 and {limit}"
        )));
    }
    Ok(pattern)
}

fn weekday(text: &str) -> Option<u8> {
    let lower = text.to_ascii_lowercase();
    let days = [
        ("sun", "sunday"),
        ("mon", "monday"),
        ("tue", "tuesday"),
        ("wed", "wednesday"),
        ("thu", "thursday"),
        ("fri", "friday"),
        ("sat", "saturday"),
    ];
    days.iter()
        .position(|(short, long)| lower == *short || lower == *long)
        .map(|i| i as u8)
}

fn parse_years(field: &str) -> Result<Option<BTreeSet<i32>>, CronError> {
    if field == "*" {
        return Ok(None);
    }
    let invalid = || CronError::Invalid(format!("invalid year field {field:?}"));
    let mut years = BTreeSet::new();
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => (range, step.parse::<usize>().map_err(|_| invalid())?),
            None => (part, 1),
        };
        if step == 0 {
            return Err(invalid());
        }
        let (start, end) = match range {
            "*" => (MIN_YEAR, MAX_YEAR),
            range => match range.split_once('-') {
                Some((a, b)) => (
                    a.parse().map_err(|_| invalid())?,
                    b.parse().map_err(|_| invalid())?,
                ),
                None => {
                    let year: i32 = range.parse().map_err(|_| invalid())?;
                    (year, if part.contains('/') { MAX_YEAR } else { year })
                }
            },
        };
        if start < MIN_YEAR || end > MAX_YEAR || start > end {
            return Err(invalid());
        }
        years.extend((start..=end).step_by(step));
    }
    Ok(Some(years))
}
