//! Time-window gates.
//!
//! A window is `[start, end)` on the listed week days. When `start > end`
//! the window wraps past midnight and the weekday is taken from the
//! moment being checked. Times are evaluated in UTC shifted by a fixed
//! offset.

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// `HH:MM`
    pub start: String,
    /// `HH:MM`
    pub end: String,
    /// Full English day names, e.g. `Monday`.
    pub week_days: Vec<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TimeWindowError {
    #[error("invalid time '{0}', expected HH:MM")]
    InvalidTime(String),
    #[error("invalid week day '{0}'")]
    InvalidWeekDay(String),
    #[error("window start and end are both {0}")]
    Empty(String),
    #[error("no week days given")]
    NoWeekDays,
}

impl TimeWindow {
    pub fn new(start: &str, end: &str, week_days: &[&str]) -> Self {
        Self {
            start: start.to_string(),
            end: end.to_string(),
            week_days: week_days.iter().map(|d| d.to_string()).collect(),
        }
    }

    pub fn validate(&self) -> Result<(), TimeWindowError> {
        self.parse().map(|_| ())
    }

    /// Whether `at`, seen from `offset`, falls inside the window.
    pub fn contains(&self, at: DateTime<Utc>, offset: FixedOffset) -> Result<bool, TimeWindowError> {
        let (start, end, days) = self.parse()?;
        let local = at.with_timezone(&offset);
        if !days.contains(&local.weekday()) {
            return Ok(false);
        }

        let now = local.time();
        Ok(if start < end {
            start <= now && now < end
        } else {
            now >= start || now < end
        })
    }

    fn parse(&self) -> Result<(NaiveTime, NaiveTime, Vec<Weekday>), TimeWindowError> {
        let start = parse_time(&self.start)?;
        let end = parse_time(&self.end)?;
        if start == end {
            return Err(TimeWindowError::Empty(self.start.clone()));
        }
        if self.week_days.is_empty() {
            return Err(TimeWindowError::NoWeekDays);
        }
        let days = self
            .week_days
            .iter()
            .map(|d| d.parse::<Weekday>().map_err(|_| TimeWindowError::InvalidWeekDay(d.clone())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((start, end, days))
    }
}

fn parse_time(value: &str) -> Result<NaiveTime, TimeWindowError> {
    NaiveTime::parse_from_str(value, "%H:%M").map_err(|_| TimeWindowError::InvalidTime(value.to_string()))
}
