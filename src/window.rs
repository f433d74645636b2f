// Time windows ("HH:MM-HH:MM") and the same-day validity rule

use std::{fmt, str::FromStr};

use chrono::{Duration, Local, NaiveDate, NaiveDateTime, NaiveTime};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// A same-day window stays bookable for this long after its nominal start.
pub const START_GRACE_MINUTES: i64 = 60;

// Half-open interval [start, end) on the target date.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, ConfigError> {
        if start >= end {
            return Err(ConfigError::InvalidWindow(format!(
                "{}-{}",
                start.format("%H:%M"),
                end.format("%H:%M")
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> NaiveTime {
        self.start
    }

    pub fn end(&self) -> NaiveTime {
        self.end
    }

    pub fn start_str(&self) -> String {
        self.start.format("%H:%M").to_string()
    }

    pub fn end_str(&self) -> String {
        self.end.format("%H:%M").to_string()
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        self.start <= t && t < self.end
    }

    // Whether the window can still be booked for `target_date` at wall-clock `now`.
    // Dates other than today are always valid. On the same day the window is
    // dropped only once `start + 1h` has passed.
    pub fn is_valid_on(&self, target_date: NaiveDate, now: NaiveDateTime) -> bool {
        if target_date != now.date() {
            return true;
        }
        let cutoff = target_date.and_time(self.start) + Duration::minutes(START_GRACE_MINUTES);
        now <= cutoff
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start_str(), self.end_str())
    }
}

impl FromStr for TimeWindow {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| ConfigError::InvalidWindow(s.to_string()))?;
        let parse = |part: &str| {
            NaiveTime::parse_from_str(part.trim(), "%H:%M")
                .map_err(|_| ConfigError::InvalidWindow(s.to_string()))
        };
        Self::new(parse(start)?, parse(end)?)
    }
}

impl TryFrom<String> for TimeWindow {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeWindow> for String {
    fn from(value: TimeWindow) -> Self {
        value.to_string()
    }
}

// Source of "now". The orchestrator and catalog never call Local::now directly.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

// Settable clock for tests and dry runs.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<NaiveDateTime>,
}

impl FixedClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: NaiveDateTime) {
        *self.now.lock() = now;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(date: &str, time: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M").unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let w: TimeWindow = "20:00-21:00".parse().unwrap();
        assert_eq!(w.start_str(), "20:00");
        assert_eq!(w.end_str(), "21:00");
        assert_eq!(w.to_string(), "20:00-21:00");

        let spaced: TimeWindow = " 08:00 - 09:00 ".parse().unwrap();
        assert_eq!(spaced.to_string(), "08:00-09:00");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("20:00".parse::<TimeWindow>().is_err());
        assert!("20:00-25:00".parse::<TimeWindow>().is_err());
        assert!("21:00-20:00".parse::<TimeWindow>().is_err());
        assert!("abc-def".parse::<TimeWindow>().is_err());
    }

    #[test]
    fn test_half_open_membership() {
        let w: TimeWindow = "20:00-21:00".parse().unwrap();
        assert!(w.contains(NaiveTime::from_hms_opt(20, 0, 0).unwrap()));
        assert!(w.contains(NaiveTime::from_hms_opt(20, 59, 59).unwrap()));
        assert!(!w.contains(NaiveTime::from_hms_opt(21, 0, 0).unwrap()));
    }

    #[test]
    fn test_same_day_window_past_grace_is_invalid() {
        let w: TimeWindow = "20:00-21:00".parse().unwrap();
        assert!(!w.is_valid_on(date("2025-06-10"), at("2025-06-10", "21:05")));
    }

    #[test]
    fn test_same_day_window_within_grace_is_valid() {
        let w: TimeWindow = "21:00-22:00".parse().unwrap();
        assert!(w.is_valid_on(date("2025-06-10"), at("2025-06-10", "21:05")));
        // exactly at the cutoff is still fine
        assert!(w.is_valid_on(date("2025-06-10"), at("2025-06-10", "22:00")));
        assert!(!w.is_valid_on(date("2025-06-10"), at("2025-06-10", "22:01")));
    }

    #[test]
    fn test_other_dates_always_valid() {
        let w: TimeWindow = "08:00-09:00".parse().unwrap();
        assert!(w.is_valid_on(date("2025-06-11"), at("2025-06-10", "23:59")));
        assert!(w.is_valid_on(date("2025-06-09"), at("2025-06-10", "23:59")));
    }

    #[test]
    fn test_serde_as_string() {
        let w: TimeWindow = serde_json::from_str("\"21:00-22:00\"").unwrap();
        assert_eq!(serde_json::to_string(&w).unwrap(), "\"21:00-22:00\"");
        assert!(serde_json::from_str::<TimeWindow>("\"nope\"").is_err());
    }

    #[test]
    fn test_fixed_clock() {
        let clock = FixedClock::new(at("2025-06-10", "08:00"));
        assert_eq!(clock.now(), at("2025-06-10", "08:00"));
        clock.set(at("2025-06-10", "09:30"));
        assert_eq!(clock.now(), at("2025-06-10", "09:30"));
    }
}
