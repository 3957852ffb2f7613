//! Configuration management
//!
//! Values come from an optional YAML file merged with `SF_ORG_CORE_`
//! environment variables (nested keys separated by `__`, e.g.
//! `SF_ORG_CORE_CACHE__CAPACITY=500`).

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "SF_ORG_CORE_";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before resolving `${VAR}` references.
    /// Paths support ~ expansion. Later files override earlier ones.
    pub env_files: Vec<String>,
    /// Metadata cache configuration
    pub cache: CacheConfig,
    /// Retry configuration
    pub retry: RetryConfig,
    /// Session registry configuration
    pub session: SessionConfig,
    /// Platform client configuration
    pub platform: PlatformConfig,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries before LRU eviction
    pub capacity: usize,
    /// TTL used when a resource kind has no default of its own
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
    /// Interval of the optional expired-entry sweeper (`None` disables it)
    #[serde(default, with = "humantime_serde::option")]
    pub sweep_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            default_ttl: Duration::from_secs(300),
            sweep_interval: None,
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Upper bound for a single backoff delay
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Upper bound of the random jitter added to each delay
    #[serde(with = "humantime_serde")]
    pub jitter: Duration,
    /// Minimum delay after a rate-limit response
    #[serde(with = "humantime_serde")]
    pub rate_limit_min_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: Duration::from_millis(100),
            rate_limit_min_delay: Duration::from_secs(5),
        }
    }
}

/// Session registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sessions idle longer than this are removed by `evict_stale`
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Sessions older than this are marked expired on their next use
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    /// Maximum concurrently registered orgs
    pub max_sessions: usize,
    /// Consecutive failures before a session is marked invalid
    pub failure_threshold: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            max_age: Duration::from_secs(3600),
            max_sessions: 10,
            failure_threshold: 3,
        }
    }
}

/// Platform client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Timeout for every remote call
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// REST API version, without the `v` prefix
    pub api_version: String,
    /// Login endpoint for password logins
    pub login_url: String,
    /// Concurrent fetches during a bulk prefetch
    pub prefetch_concurrency: usize,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(120),
            api_version: "62.0".to_string(),
            login_url: "https://login.salesforce.com".to_string(),
            prefetch_concurrency: 8,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars()?;
        config.validate()?;

        Ok(config)
    }

    /// Reject configurations the core cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.retry.validate()?;
        self.session.validate()?;
        self.platform.validate()
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} in string values
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        self.platform.login_url = Self::expand_string(&re, &self.platform.login_url);
        self.platform.api_version = Self::expand_string(&re, &self.platform.api_version);
        Ok(())
    }

    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

impl CacheConfig {
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero capacity or TTL.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::Config("cache.capacity must be positive".into()));
        }
        if self.default_ttl.is_zero() {
            return Err(Error::Config("cache.default_ttl must be positive".into()));
        }
        if self.sweep_interval.is_some_and(|d| d.is_zero()) {
            return Err(Error::Config("cache.sweep_interval must be positive".into()));
        }
        Ok(())
    }
}

impl RetryConfig {
    /// # Errors
    ///
    /// Returns [`Error::Config`] for zero attempts or a shrinking multiplier.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::Config("retry.multiplier must be >= 1.0".into()));
        }
        if self.max_delay < self.base_delay {
            return Err(Error::Config("retry.max_delay must be >= retry.base_delay".into()));
        }
        Ok(())
    }
}

impl SessionConfig {
    /// # Errors
    ///
    /// Returns [`Error::Config`] for zero limits.
    pub fn validate(&self) -> Result<()> {
        if self.idle_timeout.is_zero() {
            return Err(Error::Config("session.idle_timeout must be positive".into()));
        }
        if self.max_age.is_zero() {
            return Err(Error::Config("session.max_age must be positive".into()));
        }
        if self.max_sessions == 0 {
            return Err(Error::Config("session.max_sessions must be positive".into()));
        }
        if self.failure_threshold == 0 {
            return Err(Error::Config("session.failure_threshold must be positive".into()));
        }
        Ok(())
    }
}

impl PlatformConfig {
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero timeout or unusable login URL.
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            return Err(Error::Config("platform.request_timeout must be positive".into()));
        }
        if self.prefetch_concurrency == 0 {
            return Err(Error::Config(
                "platform.prefetch_concurrency must be positive".into(),
            ));
        }
        url::Url::parse(&self.login_url)
            .map_err(|e| Error::Config(format!("platform.login_url is invalid: {e}")))?;
        Ok(())
    }
}

/// Human-readable serde format for Duration ("30s", "5m", "100ms")
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration as milliseconds or whole seconds
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize "30s", "5m", "1h", "100ms" or a bare number of seconds
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        // "ms" must be checked before "s" and "m"
        let (digits, unit_secs) = if let Some(ms) = s.strip_suffix("ms") {
            let millis = ms.trim().parse::<u64>().map_err(|e| format!("{s:?}: {e}"))?;
            return Ok(Duration::from_millis(millis));
        } else if let Some(secs) = s.strip_suffix('s') {
            (secs, 1)
        } else if let Some(mins) = s.strip_suffix('m') {
            (mins, 60)
        } else if let Some(hours) = s.strip_suffix('h') {
            (hours, 3600)
        } else {
            (s, 1)
        };
        let count = digits.trim().parse::<u64>().map_err(|e| format!("{s:?}: {e}"))?;
        count
            .checked_mul(unit_secs)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("{s:?}: duration out of range"))
    }

    /// Same format for `Option<Duration>`
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        /// # Errors
        ///
        /// Returns a serialization error if the serializer fails.
        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        /// # Errors
        ///
        /// Returns a deserialization error if the string cannot be parsed.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| super::parse(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
