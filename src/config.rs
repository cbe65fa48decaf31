//! Configuration management for Ratekeeper.
//!
//! A configuration file names one or more limiter classes, each with its own
//! burst capacity and sustained refill rate, plus settings for the idle-bucket
//! sweeper.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::{RateKeeperError, Result};

/// Validated parameters for a single token bucket limiter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimiterConfig {
    capacity: f64,
    refill_rate: f64,
}

impl LimiterConfig {
    /// Create a limiter configuration.
    ///
    /// `refill_rate` is in tokens per second. Both values must be positive
    /// and finite.
    pub fn new(capacity: f64, refill_rate: f64) -> Result<Self> {
        if !(capacity.is_finite() && capacity > 0.0) {
            return Err(RateKeeperError::InvalidConfig(format!(
                "capacity must be a positive finite number, got {}",
                capacity
            )));
        }
        if !(refill_rate.is_finite() && refill_rate > 0.0) {
            return Err(RateKeeperError::InvalidConfig(format!(
                "refill_rate must be a positive finite number, got {}",
                refill_rate
            )));
        }
        Ok(Self {
            capacity,
            refill_rate,
        })
    }

    /// Maximum tokens a bucket can hold.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }
}

/// Main configuration file for Ratekeeper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateKeeperConfig {
    /// Limiter classes by name
    #[serde(default)]
    pub limiters: BTreeMap<String, LimiterRule>,

    /// Idle bucket eviction settings
    #[serde(default)]
    pub eviction: EvictionConfig,
}

/// A limiter class as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterRule {
    /// Burst capacity in tokens
    pub capacity: f64,
    /// Tokens added per `unit`
    pub refill_rate: f64,
    /// Time unit the refill rate is expressed in
    #[serde(default)]
    pub unit: RefillUnit,
}

impl LimiterRule {
    /// Normalize the rule to tokens per second and validate it.
    pub fn to_limiter_config(&self) -> Result<LimiterConfig> {
        LimiterConfig::new(self.capacity, self.refill_rate / self.unit.duration().as_secs_f64())
    }
}

/// Time unit for refill rates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefillUnit {
    #[default]
    Second,
    Minute,
    Hour,
    Day,
}

impl RefillUnit {
    /// Get the duration of this unit.
    pub fn duration(&self) -> Duration {
        match self {
            RefillUnit::Second => Duration::from_secs(1),
            RefillUnit::Minute => Duration::from_secs(60),
            RefillUnit::Hour => Duration::from_secs(3600),
            RefillUnit::Day => Duration::from_secs(86400),
        }
    }
}

impl FromStr for RefillUnit {
    type Err = RateKeeperError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "second" | "sec" | "s" => Ok(RefillUnit::Second),
            "minute" | "min" | "m" => Ok(RefillUnit::Minute),
            "hour" | "h" => Ok(RefillUnit::Hour),
            "day" | "d" => Ok(RefillUnit::Day),
            other => Err(RateKeeperError::Config(format!(
                "unknown refill unit '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for RefillUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RefillUnit::Second => "second",
            RefillUnit::Minute => "minute",
            RefillUnit::Hour => "hour",
            RefillUnit::Day => "day",
        };
        f.write_str(name)
    }
}

/// Idle bucket eviction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionConfig {
    /// How often the sweeper runs, in seconds
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// How long a full bucket may sit untouched before it is dropped, in seconds
    #[serde(default = "default_max_idle")]
    pub max_idle_secs: u64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            max_idle_secs: default_max_idle(),
        }
    }
}

impl EvictionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }
}

fn default_interval() -> u64 {
    60
}

fn default_max_idle() -> u64 {
    300
}

impl RateKeeperConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RateKeeperError::Config(format!("Failed to parse limiter config: {}", e)))
    }

    /// Get the rule for a limiter class.
    pub fn rule(&self, class: &str) -> Option<&LimiterRule> {
        self.limiters.get(class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limiter_config_accepts_positive_values() {
        let config = LimiterConfig::new(10.0, 0.5).unwrap();
        assert_eq!(config.capacity(), 10.0);
        assert_eq!(config.refill_rate(), 0.5);
    }

    #[test]
    fn test_limiter_config_rejects_non_positive_values() {
        for (capacity, rate) in [
            (0.0, 1.0),
            (-1.0, 1.0),
            (1.0, 0.0),
            (1.0, -0.1),
            (f64::NAN, 1.0),
            (1.0, f64::NAN),
            (f64::INFINITY, 1.0),
            (1.0, f64::INFINITY),
        ] {
            let err = LimiterConfig::new(capacity, rate).unwrap_err();
            assert!(
                matches!(err, RateKeeperError::InvalidConfig(_)),
                "({}, {}) should be rejected",
                capacity,
                rate
            );
        }
    }

    #[test]
    fn test_parse_config() {
        let yaml = r#"
limiters:
  api:
    capacity: 10
    refill_rate: 10
    unit: minute
  login:
    capacity: 3
    refill_rate: 0.5
eviction:
  interval_secs: 5
"#;
        let config = RateKeeperConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limiters.len(), 2);

        let api = config.rule("api").unwrap();
        assert_eq!(api.unit, RefillUnit::Minute);
        let api = api.to_limiter_config().unwrap();
        assert_eq!(api.capacity(), 10.0);
        assert!((api.refill_rate() - 10.0 / 60.0).abs() < 1e-12);

        let login = config.rule("login").unwrap();
        assert_eq!(login.unit, RefillUnit::Second);
        assert_eq!(login.to_limiter_config().unwrap().refill_rate(), 0.5);

        assert_eq!(config.eviction.interval(), Duration::from_secs(5));
        assert_eq!(config.eviction.max_idle(), Duration::from_secs(300));
    }

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config = RateKeeperConfig::from_yaml("{}").unwrap();
        assert!(config.limiters.is_empty());
        assert_eq!(config.eviction.interval_secs, 60);
        assert!(config.rule("api").is_none());
    }

    #[test]
    fn test_parse_invalid_config() {
        let err = RateKeeperConfig::from_yaml("limiters: [1, 2]").unwrap_err();
        assert!(matches!(err, RateKeeperError::Config(_)));
    }

    #[test]
    fn test_rule_with_zero_rate_is_rejected() {
        let rule = LimiterRule {
            capacity: 5.0,
            refill_rate: 0.0,
            unit: RefillUnit::Hour,
        };
        assert!(matches!(
            rule.to_limiter_config(),
            Err(RateKeeperError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_refill_unit_parsing() {
        assert_eq!("minute".parse::<RefillUnit>().unwrap(), RefillUnit::Minute);
        assert_eq!("H".parse::<RefillUnit>().unwrap(), RefillUnit::Hour);
        assert!("fortnight".parse::<RefillUnit>().is_err());
        assert_eq!(RefillUnit::Day.to_string(), "day");
        assert_eq!(RefillUnit::Day.duration(), Duration::from_secs(86400));
    }
}
