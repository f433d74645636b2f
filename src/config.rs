// Booking configuration: defaults, JSON persistence, validation and the shared store

use std::{collections::HashSet, path::Path, sync::Arc, time::Duration};

use chrono::{Local, NaiveDate};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{error::ConfigError, window::TimeWindow};

pub const DEFAULT_BASE_URL: &str = "https://ehall.szu.edu.cn";

// Campus and sport codes understood by the upstream service
pub const CAMPUS_CODES: &[(&str, &str)] = &[("Yuehai", "1"), ("Lihu", "2")];
pub const SPORT_CODES: &[(&str, &str)] = &[("Badminton", "001")];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Requester {
    pub id: String,
    pub name: String,
}

// Immutable for the duration of one run; edited between runs through ConfigStore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BookingConfig {
    pub base_url: String,
    pub campus: String,
    pub booking_kind: String,
    pub sport_code: String,
    pub target_date: NaiveDate,
    pub preferred_windows: Vec<TimeWindow>,
    pub requester: Requester,
    pub max_retries: u32,
    pub retry_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub reservation_cap: usize,
    pub submit_delay_ms: u64,
    pub accept_invalid_certs: bool,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_secs: u64,
}

impl Default for BookingConfig {
    fn default() -> Self {
        let tomorrow = Local::now().date_naive().succ_opt().unwrap_or(NaiveDate::MAX);
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            campus: "2".to_string(),
            booking_kind: "1.0".to_string(),
            sport_code: "001".to_string(),
            target_date: tomorrow,
            preferred_windows: default_windows(),
            requester: Requester::default(),
            max_retries: 200,
            retry_interval_secs: 1,
            request_timeout_secs: 10,
            reservation_cap: 2,
            submit_delay_ms: 500,
            accept_invalid_certs: true,
            breaker_failure_threshold: 5,
            breaker_cooldown_secs: 10,
        }
    }
}

pub fn parse_target_date(s: &str) -> Result<NaiveDate, ConfigError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| ConfigError::InvalidDate(s.to_string()))
}

fn default_windows() -> Vec<TimeWindow> {
    ["20:00-21:00", "21:00-22:00"]
        .iter()
        .filter_map(|w| w.parse().ok())
        .collect()
}

impl BookingConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn submit_delay(&self) -> Duration {
        Duration::from_millis(self.submit_delay_ms)
    }

    pub fn target_date_str(&self) -> String {
        self.target_date.format("%Y-%m-%d").to_string()
    }

    pub fn campus_name(&self) -> &str {
        CAMPUS_CODES
            .iter()
            .find(|(_, code)| *code == self.campus)
            .map(|(name, _)| *name)
            .unwrap_or("unknown campus")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.preferred_windows.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one preferred window is required".into(),
            ));
        }

        let mut seen = HashSet::new();
        for window in &self.preferred_windows {
            if !seen.insert(window) {
                return Err(ConfigError::DuplicateWindow(window.to_string()));
            }
        }

        if self.reservation_cap == 0 {
            return Err(ConfigError::Invalid("reservation_cap must be >= 1".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_secs must be >= 1".into(),
            ));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be >= 1".into()));
        }
        if self.requester.id.trim().is_empty() || self.requester.name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "requester id and name must be set".into(),
            ));
        }
        if self.campus.trim().is_empty() || self.sport_code.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "campus and sport_code must be set".into(),
            ));
        }

        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: BookingConfig = serde_json::from_str(&raw)?;
        info!(path = %path.as_ref().display(), "loaded booking config");
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), raw)?;
        Ok(())
    }
}

// GetConfig / SetConfig surface. Readers get a cheap Arc clone of the current value.
#[derive(Debug, Default)]
pub struct ConfigStore {
    current: RwLock<Arc<BookingConfig>>,
}

impl ConfigStore {
    pub fn new(config: BookingConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn get(&self) -> Arc<BookingConfig> {
        self.current.read().clone()
    }

    // Validation is left to the caller; a running orchestration keeps its own copy.
    pub fn set(&self, config: BookingConfig) {
        *self.current.write() = Arc::new(config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> BookingConfig {
        BookingConfig {
            requester: Requester {
                id: "2300123009".into(),
                name: "Tester".into(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = BookingConfig::default();
        assert_eq!(config.reservation_cap, 2);
        assert_eq!(config.max_retries, 200);
        assert_eq!(config.retry_interval(), Duration::from_secs(1));
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(
            config
                .preferred_windows
                .iter()
                .map(|w| w.to_string())
                .collect::<Vec<_>>(),
            vec!["20:00-21:00", "21:00-22:00"]
        );
        assert_eq!(config.campus_name(), "Lihu");
        assert!(config.target_date > Local::now().date_naive());
    }

    #[test]
    fn test_validate() {
        assert!(valid().validate().is_ok());

        // missing requester
        assert!(BookingConfig::default().validate().is_err());

        let mut dup = valid();
        dup.preferred_windows.push("20:00-21:00".parse().unwrap());
        assert!(matches!(
            dup.validate(),
            Err(ConfigError::DuplicateWindow(w)) if w == "20:00-21:00"
        ));

        let mut empty = valid();
        empty.preferred_windows.clear();
        assert!(empty.validate().is_err());

        let mut no_cap = valid();
        no_cap.reservation_cap = 0;
        assert!(no_cap.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: BookingConfig = serde_json::from_str(
            r#"{
                "target_date": "2025-06-12",
                "preferred_windows": ["19:00-20:00"],
                "requester": {"id": "1", "name": "A"},
                "reservation_cap": 1
            }"#,
        )
        .unwrap();

        assert_eq!(config.target_date_str(), "2025-06-12");
        assert_eq!(config.preferred_windows.len(), 1);
        assert_eq!(config.reservation_cap, 1);
        assert_eq!(config.max_retries, 200);
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn test_bad_window_in_json_is_rejected() {
        let res = serde_json::from_str::<BookingConfig>(r#"{"preferred_windows": ["25:00-26:00"]}"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("venue_booker_cfg_{}.json", std::process::id()));
        let config = valid();
        config.save(&path).unwrap();
        let loaded = BookingConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_parse_target_date() {
        assert_eq!(
            parse_target_date(" 2025-06-12 ").unwrap(),
            NaiveDate::from_ymd_opt(2025, 6, 12).unwrap()
        );
        assert!(matches!(
            parse_target_date("12/06/2025"),
            Err(ConfigError::InvalidDate(_))
        ));
    }

    #[test]
    fn test_store_get_set() {
        let store = ConfigStore::new(valid());
        let before = store.get();

        let mut next = valid();
        next.max_retries = 3;
        store.set(next);

        // earlier handles keep the value they captured
        assert_eq!(before.max_retries, 200);
        assert_eq!(store.get().max_retries, 3);
    }
}
