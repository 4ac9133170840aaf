//! Human-readable intervals and schedule times.
//!
//! Accepted interval forms:
//! - a bare integer, read as milliseconds: `"1500"`
//! - quantity + unit pairs: `"10 minutes"`, `"2.5 hours"`, `"90s"`
//! - English number words: `"one hour"`, `"twenty-five seconds"`, `"a day"`
//! - compounds joined by spaces, commas or "and": `"1 hour and 30 minutes"`
//! - an optional leading "in": `"in 1 second"`

use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;

use crate::SchedulerError;

const SECOND_MS: f64 = 1_000.0;
const MINUTE_MS: f64 = 60.0 * SECOND_MS;
const HOUR_MS: f64 = 60.0 * MINUTE_MS;
const DAY_MS: f64 = 24.0 * HOUR_MS;

/// A quantity glued to its unit, e.g. `90s` or `1.5h`.
static GLUED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+(?:\.\d+)?)([a-z]+)$").unwrap());

/// When a job should first run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum When {
    /// Immediately.
    Now,
    /// After a relative delay.
    In(Duration),
    /// At an absolute instant.
    At(DateTime<Utc>),
    /// After a human-readable delay such as `"in 5 minutes"`.
    Human(String),
}

impl When {
    /// Resolve to an absolute instant relative to `now`.
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, SchedulerError> {
        match self {
            When::Now => Ok(now),
            When::At(at) => Ok(*at),
            When::In(delay) => add_duration(now, *delay)
                .ok_or_else(|| SchedulerError::InvalidTime(format!("{:?} from now", delay))),
            When::Human(text) => {
                let delay = parse_human_interval(text)
                    .map_err(|_| SchedulerError::InvalidTime(text.clone()))?;
                add_duration(now, delay).ok_or_else(|| SchedulerError::InvalidTime(text.clone()))
            }
        }
    }
}

impl From<Duration> for When {
    fn from(delay: Duration) -> Self {
        When::In(delay)
    }
}

impl From<DateTime<Utc>> for When {
    fn from(at: DateTime<Utc>) -> Self {
        When::At(at)
    }
}

impl From<&str> for When {
    fn from(text: &str) -> Self {
        When::Human(text.to_string())
    }
}

impl From<String> for When {
    fn from(text: String) -> Self {
        When::Human(text)
    }
}

/// `at + delay`, or `None` if the result is out of range.
pub fn add_duration(at: DateTime<Utc>, delay: Duration) -> Option<DateTime<Utc>> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
}

/// `at - delay`, saturating at the earliest representable instant.
pub fn sub_duration(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| at.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Parse a human-readable interval.
pub fn parse_human_interval(input: &str) -> Result<Duration, SchedulerError> {
    let invalid = || SchedulerError::InvalidInterval(input.to_string());

    let normalized = input.trim().to_lowercase();
    if normalized.is_empty() {
        return Err(invalid());
    }
    if let Ok(ms) = normalized.parse::<u64>() {
        return Ok(Duration::from_millis(ms));
    }

    let spaced = normalized.replace(',', " ");
    let mut tokens: Vec<&str> = spaced
        .split_whitespace()
        .filter(|t| *t != "and")
        .collect();
    if tokens.first() == Some(&"in") {
        tokens.remove(0);
    }

    // Split glued tokens like "90s" into quantity and unit.
    let mut expanded: Vec<String> = Vec::with_capacity(tokens.len());
    for token in tokens {
        match GLUED_RE.captures(token) {
            Some(caps) => {
                expanded.push(caps[1].to_string());
                expanded.push(caps[2].to_string());
            }
            None => expanded.push(token.to_string()),
        }
    }

    if expanded.is_empty() || expanded.len() % 2 != 0 {
        return Err(invalid());
    }

    let mut total_ms = 0.0_f64;
    for pair in expanded.chunks(2) {
        let quantity = parse_quantity(&pair[0]).ok_or_else(invalid)?;
        let unit = unit_ms(&pair[1]).ok_or_else(invalid)?;
        total_ms += quantity * unit;
    }

    if !total_ms.is_finite() || total_ms < 0.0 || total_ms > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(Duration::from_millis(total_ms.round() as u64))
}

fn parse_quantity(token: &str) -> Option<f64> {
    if let Ok(n) = token.parse::<f64>() {
        return n.is_finite().then_some(n);
    }
    match token.split_once('-') {
        Some((tens, ones)) => {
            let tens = number_word(tens)?;
            let ones = number_word(ones)?;
            (tens >= 20 && tens % 10 == 0 && (1..10).contains(&ones)).then(|| (tens + ones) as f64)
        }
        None => number_word(token).map(|n| n as f64),
    }
}

fn number_word(word: &str) -> Option<u32> {
    let n = match word {
        "a" | "an" | "one" => 1,
        "zero" => 0,
        "two" => 2,
        "three" => 3,
        "four" => 4,
        "five" => 5,
        "six" => 6,
        "seven" => 7,
        "eight" => 8,
        "nine" => 9,
        "ten" => 10,
        "eleven" => 11,
        "twelve" => 12,
        "thirteen" => 13,
        "fourteen" => 14,
        "fifteen" => 15,
        "sixteen" => 16,
        "seventeen" => 17,
        "eighteen" => 18,
        "nineteen" => 19,
        "twenty" => 20,
        "thirty" => 30,
        "forty" => 40,
        "fifty" => 50,
        "sixty" => 60,
        "seventy" => 70,
        "eighty" => 80,
        "ninety" => 90,
        _ => return None,
    };
    Some(n)
}

fn unit_ms(unit: &str) -> Option<f64> {
    let ms = match unit {
        "ms" | "millisecond" | "milliseconds" => 1.0,
        "s" | "sec" | "secs" | "second" | "seconds" => SECOND_MS,
        "m" | "min" | "mins" | "minute" | "minutes" => MINUTE_MS,
        "h" | "hr" | "hrs" | "hour" | "hours" => HOUR_MS,
        "d" | "day" | "days" => DAY_MS,
        "w" | "week" | "weeks" => 7.0 * DAY_MS,
        "month" | "months" => 30.0 * DAY_MS,
        "y" | "year" | "years" => 365.0 * DAY_MS,
        _ => return None,
    };
    Some(ms)
}
