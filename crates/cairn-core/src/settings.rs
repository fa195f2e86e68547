//! Discovery Settings
//!
//! Immutable, validated configuration for one discovery backend instance.
//! Values come from [`SettingsBuilder`] or from `CAIRN_*` environment
//! variables; either way they pass through the same validation.
//!
//! Environment variables (durations in whole seconds, lists comma-separated):
//! - `CAIRN_ALIVE_INTERVAL`, `CAIRN_ALIVE_TIMEOUT`, `CAIRN_REFRESH_INTERVAL`
//! - `CAIRN_SERVICE_CHECK_TTL` (default: 3 × alive interval)
//! - `CAIRN_RESTART_INTERVAL` (unset or 0: never restart the client)
//! - `CAIRN_JOIN_RETRIES`, `CAIRN_JOIN_BACKOFF_INITIAL`, `CAIRN_JOIN_BACKOFF_MAX`
//! - `CAIRN_CALL_TIMEOUT`, `CAIRN_SHUTDOWN_GRACE`
//! - `CAIRN_ENDPOINTS`, `CAIRN_NAMESPACE`, `CAIRN_SERVICE_NAMES`
//!
//! Every duration must be at most [`MAX_DURATION`].

use crate::error::ConfigError;
use std::time::Duration;

/// Validated discovery settings
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    alive_interval: Duration,
    alive_timeout: Duration,
    refresh_interval: Duration,
    join_retries: u32,
    service_check_ttl: Duration,
    restart_interval: Option<Duration>,
    join_backoff_initial: Duration,
    join_backoff_max: Duration,
    call_timeout: Duration,
    shutdown_grace: Duration,
    endpoints: Vec<String>,
    namespace: String,
    service_names: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            alive_interval: DEFAULT_ALIVE_INTERVAL,
            alive_timeout: DEFAULT_ALIVE_TIMEOUT,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            join_retries: DEFAULT_JOIN_RETRIES,
            service_check_ttl: DEFAULT_ALIVE_INTERVAL * 3,
            restart_interval: None,
            join_backoff_initial: Duration::from_secs(1),
            join_backoff_max: Duration::from_secs(10),
            call_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            endpoints: vec![DEFAULT_ENDPOINT.to_string()],
            namespace: DEFAULT_NAMESPACE.to_string(),
            service_names: vec![DEFAULT_NAMESPACE.to_string()],
        }
    }
}

const DEFAULT_ALIVE_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_ALIVE_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_JOIN_RETRIES: u32 = 3;
const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:2379";
const DEFAULT_NAMESPACE: &str = "default";

/// Upper bound for every duration setting (one year)
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

impl Settings {
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::default()
    }

    /// Build settings from `CAIRN_*` environment variables over the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup (used by `from_env`)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::builder();

        if let Some(v) = lookup("CAIRN_ALIVE_INTERVAL") {
            builder = builder.alive_interval(parse_secs("CAIRN_ALIVE_INTERVAL", &v)?);
        }
        if let Some(v) = lookup("CAIRN_ALIVE_TIMEOUT") {
            builder = builder.alive_timeout(parse_secs("CAIRN_ALIVE_TIMEOUT", &v)?);
        }
        if let Some(v) = lookup("CAIRN_REFRESH_INTERVAL") {
            builder = builder.refresh_interval(parse_secs("CAIRN_REFRESH_INTERVAL", &v)?);
        }
        if let Some(v) = lookup("CAIRN_SERVICE_CHECK_TTL") {
            builder = builder.service_check_ttl(parse_secs("CAIRN_SERVICE_CHECK_TTL", &v)?);
        }
        if let Some(v) = lookup("CAIRN_RESTART_INTERVAL") {
            builder = builder.restart_interval(parse_secs("CAIRN_RESTART_INTERVAL", &v)?);
        }
        if let Some(v) = lookup("CAIRN_JOIN_BACKOFF_INITIAL") {
            builder = builder.join_backoff_initial(parse_secs("CAIRN_JOIN_BACKOFF_INITIAL", &v)?);
        }
        if let Some(v) = lookup("CAIRN_JOIN_BACKOFF_MAX") {
            builder = builder.join_backoff_max(parse_secs("CAIRN_JOIN_BACKOFF_MAX", &v)?);
        }
        if let Some(v) = lookup("CAIRN_CALL_TIMEOUT") {
            builder = builder.call_timeout(parse_secs("CAIRN_CALL_TIMEOUT", &v)?);
        }
        if let Some(v) = lookup("CAIRN_SHUTDOWN_GRACE") {
            builder = builder.shutdown_grace(parse_secs("CAIRN_SHUTDOWN_GRACE", &v)?);
        }
        if let Some(v) = lookup("CAIRN_JOIN_RETRIES") {
            let retries = v.trim().parse::<u32>().map_err(|e| ConfigError::InvalidValue {
                key: "CAIRN_JOIN_RETRIES".to_string(),
                value: v.clone(),
                reason: e.to_string(),
            })?;
            builder = builder.join_retries(retries);
        }
        if let Some(v) = lookup("CAIRN_ENDPOINTS") {
            builder = builder.endpoints(split_list(&v));
        }
        if let Some(v) = lookup("CAIRN_NAMESPACE") {
            builder = builder.namespace(v.trim());
        }
        if let Some(v) = lookup("CAIRN_SERVICE_NAMES") {
            builder = builder.service_names(split_list(&v));
        }

        builder.build()
    }

    /// Interval at which the local entry is marked alive
    pub fn alive_interval(&self) -> Duration {
        self.alive_interval
    }

    /// How long a node may go without a successful liveness refresh
    pub fn alive_timeout(&self) -> Duration {
        self.alive_timeout
    }

    /// Interval at which peers are enumerated and reported
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// Total registration attempts made during the join sequence
    pub fn join_retries(&self) -> u32 {
        self.join_retries
    }

    /// How long the directory keeps an entry alive without a refresh
    pub fn service_check_ttl(&self) -> Duration {
        self.service_check_ttl
    }

    /// Interval at which the backend client is recycled; `None` means never
    pub fn restart_interval(&self) -> Option<Duration> {
        self.restart_interval
    }

    pub fn join_backoff_initial(&self) -> Duration {
        self.join_backoff_initial
    }

    pub fn join_backoff_max(&self) -> Duration {
        self.join_backoff_max
    }

    /// Upper bound on a single directory call; an expired call is cancelled
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Upper bound on waiting for in-flight work during shutdown
    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn service_names(&self) -> &[String] {
        &self.service_names
    }
}

/// Builder for [`Settings`]; unset fields keep their defaults
#[derive(Debug, Clone, Default)]
pub struct SettingsBuilder {
    alive_interval: Option<Duration>,
    alive_timeout: Option<Duration>,
    refresh_interval: Option<Duration>,
    join_retries: Option<u32>,
    service_check_ttl: Option<Duration>,
    restart_interval: Option<Duration>,
    join_backoff_initial: Option<Duration>,
    join_backoff_max: Option<Duration>,
    call_timeout: Option<Duration>,
    shutdown_grace: Option<Duration>,
    endpoints: Option<Vec<String>>,
    namespace: Option<String>,
    service_names: Option<Vec<String>>,
}

impl SettingsBuilder {
    pub fn alive_interval(mut self, value: Duration) -> Self {
        self.alive_interval = Some(value);
        self
    }

    pub fn alive_timeout(mut self, value: Duration) -> Self {
        self.alive_timeout = Some(value);
        self
    }

    pub fn refresh_interval(mut self, value: Duration) -> Self {
        self.refresh_interval = Some(value);
        self
    }

    pub fn join_retries(mut self, value: u32) -> Self {
        self.join_retries = Some(value);
        self
    }

    pub fn service_check_ttl(mut self, value: Duration) -> Self {
        self.service_check_ttl = Some(value);
        self
    }

    /// A zero interval disables client restarts
    pub fn restart_interval(mut self, value: Duration) -> Self {
        self.restart_interval = Some(value);
        self
    }

    pub fn join_backoff(self, initial: Duration, max: Duration) -> Self {
        self.join_backoff_initial(initial).join_backoff_max(max)
    }

    pub fn join_backoff_initial(mut self, value: Duration) -> Self {
        self.join_backoff_initial = Some(value);
        self
    }

    pub fn join_backoff_max(mut self, value: Duration) -> Self {
        self.join_backoff_max = Some(value);
        self
    }

    pub fn call_timeout(mut self, value: Duration) -> Self {
        self.call_timeout = Some(value);
        self
    }

    pub fn shutdown_grace(mut self, value: Duration) -> Self {
        self.shutdown_grace = Some(value);
        self
    }

    pub fn endpoints<I, S>(mut self, value: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoints = Some(value.into_iter().map(Into::into).collect());
        self
    }

    pub fn namespace(mut self, value: impl Into<String>) -> Self {
        self.namespace = Some(value.into());
        self
    }

    pub fn service_names<I, S>(mut self, value: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.service_names = Some(value.into_iter().map(Into::into).collect());
        self
    }

    pub fn build(self) -> Result<Settings, ConfigError> {
        let defaults = Settings::default();

        let alive_interval = self.alive_interval.unwrap_or(defaults.alive_interval);
        let alive_timeout = self.alive_timeout.unwrap_or(defaults.alive_timeout);
        let refresh_interval = self.refresh_interval.unwrap_or(defaults.refresh_interval);
        let join_retries = self.join_retries.unwrap_or(defaults.join_retries);
        let service_check_ttl = match self.service_check_ttl {
            Some(ttl) => ttl,
            None => alive_interval.checked_mul(3).ok_or(ConfigError::OutOfRange {
                key: "alive_interval",
                requirement: "at most one year",
            })?,
        };
        let restart_interval = self.restart_interval.filter(|d| !d.is_zero());
        let join_backoff_initial = self
            .join_backoff_initial
            .unwrap_or(defaults.join_backoff_initial);
        let join_backoff_max = self.join_backoff_max.unwrap_or(defaults.join_backoff_max);
        let call_timeout = self.call_timeout.unwrap_or(defaults.call_timeout);
        let shutdown_grace = self.shutdown_grace.unwrap_or(defaults.shutdown_grace);
        let endpoints = self.endpoints.unwrap_or(defaults.endpoints);
        let namespace = self.namespace.unwrap_or(defaults.namespace);
        let service_names = self.service_names.unwrap_or(defaults.service_names);

        let durations = [
            ("alive_interval", Some(alive_interval)),
            ("alive_timeout", Some(alive_timeout)),
            ("refresh_interval", Some(refresh_interval)),
            ("service_check_ttl", Some(service_check_ttl)),
            ("restart_interval", restart_interval),
            ("join_backoff_initial", Some(join_backoff_initial)),
            ("join_backoff_max", Some(join_backoff_max)),
            ("call_timeout", Some(call_timeout)),
            ("shutdown_grace", Some(shutdown_grace)),
        ];
        for (key, value) in durations {
            if value.is_some_and(|d| d > MAX_DURATION) {
                return Err(ConfigError::OutOfRange {
                    key,
                    requirement: "at most one year",
                });
            }
        }

        if alive_interval.is_zero() {
            return Err(ConfigError::OutOfRange {
                key: "alive_interval",
                requirement: "greater than zero",
            });
        }
        if call_timeout.is_zero() {
            return Err(ConfigError::OutOfRange {
                key: "call_timeout",
                requirement: "greater than zero",
            });
        }
        if refresh_interval.is_zero() {
            return Err(ConfigError::OutOfRange {
                key: "refresh_interval",
                requirement: "greater than zero",
            });
        }
        if !(alive_interval < service_check_ttl && service_check_ttl < alive_timeout) {
            return Err(ConfigError::InvalidTiming {
                alive_interval,
                service_check_ttl,
                alive_timeout,
            });
        }
        if join_retries == 0 {
            return Err(ConfigError::OutOfRange {
                key: "join_retries",
                requirement: "at least 1",
            });
        }
        if join_backoff_initial > join_backoff_max {
            return Err(ConfigError::OutOfRange {
                key: "join_backoff_initial",
                requirement: "no greater than join_backoff_max",
            });
        }
        if endpoints.iter().all(|e| e.trim().is_empty()) {
            return Err(ConfigError::MissingField("endpoints"));
        }
        if namespace.trim().is_empty() {
            return Err(ConfigError::MissingField("namespace"));
        }
        if service_names.iter().all(|s| s.trim().is_empty()) {
            return Err(ConfigError::MissingField("service_names"));
        }

        Ok(Settings {
            alive_interval,
            alive_timeout,
            refresh_interval,
            join_retries,
            service_check_ttl,
            restart_interval,
            join_backoff_initial,
            join_backoff_max,
            call_timeout,
            shutdown_grace,
            endpoints: endpoints.into_iter().filter(|e| !e.trim().is_empty()).collect(),
            namespace,
            service_names: service_names
                .into_iter()
                .filter(|s| !s.trim().is_empty())
                .collect(),
        })
    }
}

fn parse_secs(key: &str, value: &str) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
