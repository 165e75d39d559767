use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveTime;
use chrono_tz::Tz;

use crate::model::{Ms, ReservationStatus};

const MINUTE: Ms = 60_000;

/// Engine policy knobs. Everything time-based the lifecycle decides goes through here.
#[derive(Debug, Clone)]
pub struct Policy {
    /// Default timezone for reservations that don't name one.
    pub timezone: Tz,
    /// How long before the scheduled start staff may start a reservation.
    pub start_grace_ms: Ms,
    /// How long after the scheduled start an unstarted reservation survives.
    pub expiry_grace_ms: Ms,
    pub sweep_interval: Duration,
    /// Local time at which extensions are capped when nothing else caps them.
    pub business_day_end: Option<NaiveTime>,
    /// Whether Ongoing reservations show up in the day view.
    pub availability_includes_ongoing: bool,
    /// Whether an extension ceiling is recomputed when staff approve it.
    pub revalidate_extensions: bool,
    /// Where the sweeper moves an Ongoing reservation once its effective end passed.
    pub overdue_ongoing: ReservationStatus,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            timezone: Tz::UTC,
            start_grace_ms: 15 * MINUTE,
            expiry_grace_ms: 15 * MINUTE,
            sweep_interval: Duration::from_secs(30),
            business_day_end: None,
            availability_includes_ongoing: false,
            revalidate_extensions: true,
            overdue_ongoing: ReservationStatus::Completed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub policy: Policy,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let server = ServerConfig {
            bind: lookup("ROOMWISE_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&lookup, "ROOMWISE_PORT")?.unwrap_or(5433),
            data_dir: PathBuf::from(lookup("ROOMWISE_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: lookup("ROOMWISE_PASSWORD").unwrap_or_else(|| "roomwise".into()),
            max_connections: parsed(&lookup, "ROOMWISE_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parsed(&lookup, "ROOMWISE_COMPACT_THRESHOLD")?.unwrap_or(1000),
            tls_cert: lookup("ROOMWISE_TLS_CERT"),
            tls_key: lookup("ROOMWISE_TLS_KEY"),
            metrics_port: parsed(&lookup, "ROOMWISE_METRICS_PORT")?,
        };

        let defaults = Policy::default();
        let timezone = match lookup("ROOMWISE_TIMEZONE") {
            Some(tz) => tz
                .parse::<Tz>()
                .map_err(|_| ConfigError::Invalid("ROOMWISE_TIMEZONE", tz))?,
            None => defaults.timezone,
        };
        let business_day_end = match lookup("ROOMWISE_BUSINESS_DAY_END") {
            Some(s) if !s.trim().is_empty() => Some(
                NaiveTime::parse_from_str(s.trim(), "%H:%M")
                    .map_err(|_| ConfigError::Invalid("ROOMWISE_BUSINESS_DAY_END", s))?,
            ),
            _ => None,
        };
        let overdue_ongoing = match lookup("ROOMWISE_OVERDUE_ONGOING") {
            Some(s) => match ReservationStatus::parse(&s) {
                Some(status @ (ReservationStatus::Completed | ReservationStatus::Expired)) => status,
                _ => return Err(ConfigError::Invalid("ROOMWISE_OVERDUE_ONGOING", s)),
            },
            None => defaults.overdue_ongoing,
        };

        let policy = Policy {
            timezone,
            start_grace_ms: grace(&lookup, "ROOMWISE_START_GRACE_MS")?.unwrap_or(defaults.start_grace_ms),
            expiry_grace_ms: grace(&lookup, "ROOMWISE_EXPIRY_GRACE_MS")?.unwrap_or(defaults.expiry_grace_ms),
            sweep_interval: parsed::<u64>(&lookup, "ROOMWISE_SWEEP_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.sweep_interval),
            business_day_end,
            availability_includes_ongoing: flag(&lookup, "ROOMWISE_AVAILABILITY_INCLUDES_ONGOING")?
                .unwrap_or(defaults.availability_includes_ongoing),
            revalidate_extensions: flag(&lookup, "ROOMWISE_REVALIDATE_EXTENSIONS")?
                .unwrap_or(defaults.revalidate_extensions),
            overdue_ongoing,
        };

        if policy.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid("ROOMWISE_SWEEP_INTERVAL_MS", "0".into()));
        }

        Ok(Self { server, policy })
    }
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(key, raw)),
        None => Ok(None),
    }
}

/// A grace window in milliseconds; negative windows are rejected.
fn grace(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<Ms>, ConfigError> {
    match parsed::<Ms>(lookup, key)? {
        Some(ms) if ms < 0 => Err(ConfigError::Invalid(key, ms.to_string())),
        other => Ok(other),
    }
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<bool>, ConfigError> {
    match lookup(key) {
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::Invalid(key, raw)),
        },
        None => Ok(None),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Invalid(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid(key, value) => write!(f, "invalid value for {key}: {value:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio_test::{assert_err, assert_ok};

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.server.port, 5433);
        assert_eq!(cfg.server.addr(), "0.0.0.0:5433");
        assert_eq!(cfg.server.max_connections, 256);
        assert_eq!(cfg.policy.timezone, Tz::UTC);
        assert_eq!(cfg.policy.start_grace_ms, 15 * MINUTE);
        assert!(cfg.policy.business_day_end.is_none());
        assert!(!cfg.policy.availability_includes_ongoing);
        assert!(cfg.policy.revalidate_extensions);
        assert_eq!(cfg.policy.overdue_ongoing, ReservationStatus::Completed);
    }

    #[test]
    fn policy_overrides() {
        let cfg = Config::from_lookup(lookup(&[
            ("ROOMWISE_TIMEZONE", "Asia/Manila"),
            ("ROOMWISE_BUSINESS_DAY_END", "21:30"),
            ("ROOMWISE_AVAILABILITY_INCLUDES_ONGOING", "yes"),
            ("ROOMWISE_OVERDUE_ONGOING", "expired"),
            ("ROOMWISE_SWEEP_INTERVAL_MS", "500"),
        ]))
        .unwrap();
        assert_eq!(cfg.policy.timezone, chrono_tz::Asia::Manila);
        assert_eq!(cfg.policy.business_day_end, NaiveTime::from_hms_opt(21, 30, 0));
        assert!(cfg.policy.availability_includes_ongoing);
        assert_eq!(cfg.policy.overdue_ongoing, ReservationStatus::Expired);
        assert_eq!(cfg.policy.sweep_interval, Duration::from_millis(500));
    }

    #[test]
    fn garbage_is_an_error_not_a_default() {
        let err = Config::from_lookup(lookup(&[("ROOMWISE_PORT", "eighty")])).unwrap_err();
        assert!(err.to_string().contains("ROOMWISE_PORT"));
        assert!(Config::from_lookup(lookup(&[("ROOMWISE_TIMEZONE", "Mars/Olympus")])).is_err());
        assert!(Config::from_lookup(lookup(&[("ROOMWISE_OVERDUE_ONGOING", "cancelled")])).is_err());
        assert!(Config::from_lookup(lookup(&[("ROOMWISE_SWEEP_INTERVAL_MS", "0")])).is_err());
    }

    #[test]
    fn negative_grace_rejected() {
        let err = assert_err!(Config::from_lookup(lookup(&[("ROOMWISE_START_GRACE_MS", "-60000")])));
        assert!(err.to_string().contains("ROOMWISE_START_GRACE_MS"));
        let err = assert_err!(Config::from_lookup(lookup(&[("ROOMWISE_EXPIRY_GRACE_MS", "-1")])));
        assert!(err.to_string().contains("ROOMWISE_EXPIRY_GRACE_MS"));

        let cfg = assert_ok!(Config::from_lookup(lookup(&[
            ("ROOMWISE_START_GRACE_MS", "0"),
            ("ROOMWISE_EXPIRY_GRACE_MS", "0"),
        ])));
        assert_eq!(cfg.policy.start_grace_ms, 0);
        assert_eq!(cfg.policy.expiry_grace_ms, 0);
    }
}
