//! Retry policy carried by `+retry` metadata.
//!
//! `+retry [count] [minBackoff] [maxBackoff] [catch <verb>]`, where backoffs
//! are written as `1d3h2m1s` with units ordered largest first.

use std::time::Duration;

use ftl_core::RefKey;
use serde::{Deserialize, Serialize};

use crate::model::MetadataRetry;

pub const DEFAULT_RETRY_COUNT: u32 = 100;
pub const MIN_BACKOFF_LIMIT: Duration = Duration::from_secs(1);
pub const MIN_BACKOFF_LIMIT_STR: &str = "1s";
pub const MAX_BACKOFF_LIMIT: Duration = Duration::from_secs(24 * 60 * 60);
pub const MAX_BACKOFF_LIMIT_STR: &str = "1d";
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Resolved retry parameters for a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryParams {
    pub count: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub catch: Option<RefKey>,
}

impl Default for RetryParams {
    /// No retries and no catch.
    fn default() -> Self {
        Self {
            count: 0,
            min_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            catch: None,
        }
    }
}

impl MetadataRetry {
    /// Resolve the metadata into concrete parameters.
    pub fn retry_params(&self) -> Result<RetryParams, String> {
        let count = match self.count {
            Some(count) if count < 0 => return Err("retry count can not be negative".into()),
            Some(count) => u32::try_from(count).map_err(|_| "retry count is too large".to_string())?,
            None => DEFAULT_RETRY_COUNT,
        };
        let catch = self.catch.as_ref().map(|c| c.key());
        if self.min_backoff.is_empty() {
            if count == 0 {
                return Ok(RetryParams {
                    count,
                    catch,
                    ..RetryParams::default()
                });
            }
            return Err("retry must have a minimum backoff".into());
        }
        let min_backoff = parse_retry_duration(&self.min_backoff)
            .map_err(|e| format!("could not parse min backoff duration: {e}"))?;
        let max_backoff = if self.max_backoff.is_empty() {
            min_backoff.max(DEFAULT_MAX_BACKOFF)
        } else {
            parse_retry_duration(&self.max_backoff)
                .map_err(|e| format!("could not parse max backoff duration: {e}"))?
        };
        Ok(RetryParams {
            count,
            min_backoff,
            max_backoff,
            catch,
        })
    }
}

/// Parse a retry duration such as `1d3h2m1s`.
pub fn parse_retry_duration(text: &str) -> Result<Duration, String> {
    let mut rest = text;
    let mut total = Duration::ZERO;
    let mut previous_unit: Option<Duration> = None;
    while !rest.is_empty() {
        let digits_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        let unit_end = rest[digits_end..]
            .find(|c: char| !c.is_ascii_alphabetic())
            .map_or(rest.len(), |i| digits_end + i);
        if digits_end == 0 || unit_end == digits_end {
            return Err(format!(
                "unable to parse retry duration {text:?} - expected duration in format like '1m' or '30s'"
            ));
        }
        let value: u64 = rest[..digits_end]
            .parse()
            .map_err(|_| format!("could not parse retry duration: invalid number in {text:?}"))?;
        let unit_str = &rest[digits_end..unit_end];
        let unit = match unit_str {
            "d" => Duration::from_secs(24 * 60 * 60),
            "h" => Duration::from_secs(60 * 60),
            "m" => Duration::from_secs(60),
            "s" => Duration::from_secs(1),
            _ => {
                return Err(format!(
                    "could not parse retry duration: duration has unknown unit {unit_str:?} - use 'd', 'h', 'm' or 's', eg '1d' or '30s'"
                ));
            }
        };
        if previous_unit.is_some_and(|previous| previous <= unit) {
            return Err(format!(
                "could not parse retry duration: duration has unit {unit_str:?} out of order - units need to be ordered from largest to smallest - eg '1d3h2m'"
            ));
        }
        previous_unit = Some(unit);
        total += unit * u32::try_from(value).unwrap_or(u32::MAX);
        rest = &rest[unit_end..];
    }
    if total < MIN_BACKOFF_LIMIT {
        return Err(format!(
            "retry must have a minimum backoff of {MIN_BACKOFF_LIMIT_STR}"
        ));
    }
    if total > MAX_BACKOFF_LIMIT {
        return Err(format!(
            "retry backoff can not be larger than {MAX_BACKOFF_LIMIT_STR}"
        ));
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry(count: Option<i64>, min: &str, max: &str) -> MetadataRetry {
        MetadataRetry {
            pos: Default::default(),
            count,
            min_backoff: min.into(),
            max_backoff: max.into(),
            catch: None,
        }
    }

    #[test]
    fn durations_combine_units() {
        assert_eq!(
            parse_retry_duration("1h30m5s").unwrap(),
            Duration::from_secs(3600 + 1800 + 5)
        );
        assert_eq!(parse_retry_duration("1d").unwrap(), MAX_BACKOFF_LIMIT);
    }

    #[test]
    fn duration_errors() {
        assert_eq!(
            parse_retry_duration("5s1m").unwrap_err(),
            "could not parse retry duration: duration has unit \"m\" out of order - units need to be ordered from largest to smallest - eg '1d3h2m'"
        );
        assert!(parse_retry_duration("20m20m").unwrap_err().contains("out of order"));
        assert!(parse_retry_duration("2mins").unwrap_err().contains("unknown unit \"mins\""));
        assert_eq!(
            parse_retry_duration("0h0m0s").unwrap_err(),
            "retry must have a minimum backoff of 1s"
        );
        assert_eq!(
            parse_retry_duration("1d1s").unwrap_err(),
            "retry backoff can not be larger than 1d"
        );
    }

    #[test]
    fn max_backoff_defaults_to_an_hour() {
        let params = retry(Some(3), "5s", "").retry_params().unwrap();
        assert_eq!(params.count, 3);
        assert_eq!(params.min_backoff, Duration::from_secs(5));
        assert_eq!(params.max_backoff, DEFAULT_MAX_BACKOFF);
    }

    #[test]
    fn min_backoff_is_required_unless_count_is_zero() {
        assert_eq!(
            retry(Some(1), "", "").retry_params().unwrap_err(),
            "retry must have a minimum backoff"
        );
        assert_eq!(
            retry(None, "", "").retry_params().unwrap_err(),
            "retry must have a minimum backoff"
        );
        assert_eq!(retry(Some(0), "", "").retry_params().unwrap().count, 0);
    }

    #[test]
    fn min_backoff_errors_are_prefixed() {
        assert_eq!(
            retry(Some(1), "1d1s", "").retry_params().unwrap_err(),
            "could not parse min backoff duration: retry backoff can not be larger than 1d"
        );
    }
}
