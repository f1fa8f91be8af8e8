//! Configuration and environment selection.
//!
//! Every component takes its configuration explicitly through its constructor; nothing in
//! this crate reads process-wide state.
use serde::{Deserialize, Serialize};
use std::{fmt, path::Path, str::FromStr, time::Duration};
use thiserror::Error;

/// Hacienda environment selection for API endpoints.
/// - Sandbox: the "recepcion-sandbox" staging environment used for certification.
/// - Production: the live reception API.
/// # Examples
/// ```rust
/// use std::str::FromStr;
/// use factura_core::config::EnvironmentType;
///
/// let env = EnvironmentType::from_str("sandbox")?;
/// assert_eq!(env, EnvironmentType::Sandbox);
/// # Ok::<(), factura_core::config::EnvironmentParseError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentType {
    Sandbox,
    Production,
}

/// Error returned when parsing an [`EnvironmentType`] from a string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvironmentParseError {
    #[error("invalid environment type: {input}")]
    Invalid { input: String },
}

impl FromStr for EnvironmentType {
    type Err = EnvironmentParseError;
    fn from_str(env: &str) -> Result<EnvironmentType, EnvironmentParseError> {
        match env.to_ascii_lowercase().as_str() {
            "sandbox" | "stag" | "staging" => Ok(EnvironmentType::Sandbox),
            "production" | "prod" => Ok(EnvironmentType::Production),
            _ => Err(EnvironmentParseError::Invalid {
                input: env.to_string(),
            }),
        }
    }
}

impl EnvironmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentType::Sandbox => "sandbox",
            EnvironmentType::Production => "production",
        }
    }

    pub fn endpoint_url(&self) -> &'static str {
        match self {
            EnvironmentType::Sandbox => {
                "https://api.comprobanteselectronicos.go.cr/recepcion-sandbox/v1/"
            }
            EnvironmentType::Production => {
                "https://api.comprobanteselectronicos.go.cr/recepcion/v1/"
            }
        }
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Unable to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed configuration: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Environment(#[from] EnvironmentParseError),
}

/// HTTP Basic credentials issued by the authority's identity service.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Configuration for the submission client.
///
/// # Examples
/// ```rust
/// use std::time::Duration;
/// use factura_core::config::{Config, Credentials, EnvironmentType};
///
/// let config = Config::new(EnvironmentType::Production, Credentials::new("u", "p"))
///     .with_base_url("http://localhost:8080")
///     .with_request_timeout(Duration::from_secs(5));
/// assert_eq!(config.base_url(), "http://localhost:8080/");
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    env: EnvironmentType,
    credentials: Credentials,
    base_url: Option<String>,
    request_timeout: Duration,
}

impl Config {
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(env: EnvironmentType, credentials: Credentials) -> Self {
        Self {
            env,
            credentials,
            base_url: None,
            request_timeout: Self::DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Point the client at a different reception endpoint, e.g. a local mock.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        self.base_url = Some(base_url);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn env(&self) -> EnvironmentType {
        self.env
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.env.endpoint_url())
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

/// Token-bucket tuning shared by every submitter of a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_capacity")]
    pub capacity: f64,
    #[serde(default = "default_refill_per_second")]
    pub refill_per_second: f64,
    #[serde(default = "default_bucket_key")]
    pub bucket_key: String,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_capacity() -> f64 {
    20.0
}

fn default_refill_per_second() -> f64 {
    10.0
}

fn default_bucket_key() -> String {
    "hacienda_api".to_string()
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    2_000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_per_second: default_refill_per_second(),
            bucket_key: default_bucket_key(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RateLimitConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.capacity >= 1.0) {
            return Err(ConfigError::Invalid(
                "rate limit capacity must be at least 1".into(),
            ));
        }
        if !(self.refill_per_second > 0.0) {
            return Err(ConfigError::Invalid(
                "rate limit refill rate must be positive".into(),
            ));
        }
        if self.bucket_key.is_empty() {
            return Err(ConfigError::Invalid("rate limit bucket key is empty".into()));
        }
        Ok(())
    }
}

/// Retry/offline queue tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_batch_size() -> usize {
    50
}

fn default_retention_days() -> i64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    300
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            batch_size: default_batch_size(),
            retention_days: default_retention_days(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl QueueConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Complete settings as loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub environment: EnvironmentType,
    pub credentials: Credentials,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

fn default_timeout_secs() -> u64 {
    Config::DEFAULT_REQUEST_TIMEOUT.as_secs()
}

impl Settings {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let settings: Settings = serde_json::from_str(json)?;
        settings.rate_limit.validate()?;
        if settings.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("request timeout must be positive".into()));
        }
        Ok(settings)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Client configuration derived from these settings.
    pub fn client_config(&self) -> Config {
        let config = Config::new(self.environment, self.credentials.clone())
            .with_request_timeout(Duration::from_secs(self.request_timeout_secs));
        match &self.base_url {
            Some(url) => config.with_base_url(url.clone()),
            None => config,
        }
    }
}
