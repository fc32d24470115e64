//! Configuration types for the relay.
//!
//! Provides:
//! - Service-wide SMTP defaults ([`TransportDefaults`])
//! - Worker pool, queue and timeout settings ([`ServiceConfig`])
//! - The HTTP listener port ([`HttpConfig`])
//!
//! Both top-level configs can be loaded from the process environment,
//! optionally seeded from a `.env` file ([`load_env_file`]).

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::ConfigError;

/// Default number of delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 5;

/// Default delivery queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Default timeout for establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for a single SMTP command round trip.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Default HTTP listener port.
pub const DEFAULT_HTTP_PORT: u16 = 7979;

/// Environment variable names.
pub mod env {
    /// Default SMTP host.
    pub const SMTP_HOST: &str = "SMTP_HOST";
    /// Default SMTP port.
    pub const SMTP_PORT: &str = "SMTP_PORT";
    /// Default SMTP username.
    pub const SMTP_USER: &str = "SMTP_USER";
    /// Default SMTP password.
    pub const SMTP_PASS: &str = "SMTP_PASS";
    /// Default sender address.
    pub const SENDER_EMAIL: &str = "SENDER_EMAIL";
    /// Force implicit TLS by default.
    pub const SMTP_USE_SSL: &str = "SMTP_USE_SSL";
    /// Force STARTTLS by default.
    pub const SMTP_USE_TLS: &str = "SMTP_USE_TLS";
    /// Number of delivery workers.
    pub const EMAIL_WORKER_COUNT: &str = "EMAIL_WORKER_COUNT";
    /// Delivery queue capacity.
    pub const EMAIL_QUEUE_CAPACITY: &str = "EMAIL_QUEUE_CAPACITY";
    /// Connect timeout (humantime, e.g. `30s`).
    pub const SMTP_CONNECT_TIMEOUT: &str = "SMTP_CONNECT_TIMEOUT";
    /// Command timeout (humantime, e.g. `1m`).
    pub const SMTP_COMMAND_TIMEOUT: &str = "SMTP_COMMAND_TIMEOUT";
    /// Identity sent in EHLO/HELO.
    pub const SMTP_CLIENT_ID: &str = "SMTP_CLIENT_ID";
    /// HTTP listener port.
    pub const EMAIL_SERVICE_PORT: &str = "EMAIL_SERVICE_PORT";
    /// Deployment environment; `production` skips the `.env` file.
    pub const APP_ENV: &str = "APP_ENV";
}

/// Loads `.env` from the working directory or one of its parents into the
/// process environment, unless `APP_ENV` is `production`.
///
/// Variables already set are left alone. A missing file is not an error;
/// an unreadable or malformed one is. Returns the path that was loaded.
pub fn load_env_file() -> Result<Option<PathBuf>, ConfigError> {
    if is_production(std::env::var(env::APP_ENV).ok().as_deref()) {
        return Ok(None);
    }
    env_file_outcome(dotenvy::dotenv())
}

/// Loads a specific env file, with the same rules as [`load_env_file`].
pub fn load_env_file_from(path: impl AsRef<Path>) -> Result<Option<PathBuf>, ConfigError> {
    let path = path.as_ref();
    env_file_outcome(dotenvy::from_path(path).map(|()| path.to_path_buf()))
}

fn is_production(app_env: Option<&str>) -> bool {
    app_env.is_some_and(|value| value.trim().eq_ignore_ascii_case("production"))
}

fn env_file_outcome(result: dotenvy::Result<PathBuf>) -> Result<Option<PathBuf>, ConfigError> {
    match result {
        Ok(path) => Ok(Some(path)),
        Err(e) if e.not_found() => Ok(None),
        Err(e) => Err(ConfigError::invalid_value(".env", e.to_string())),
    }
}

/// Service-wide SMTP defaults. Read-only once the service is running.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportDefaults {
    /// SMTP server hostname.
    #[serde(default)]
    pub host: String,
    /// SMTP server port, if configured.
    #[serde(default)]
    pub port: Option<u16>,
    /// Authentication username.
    #[serde(default)]
    pub username: String,
    /// Authentication password (serialization skipped for security).
    #[serde(skip)]
    pub password: Option<SecretString>,
    /// Sender address for `From` and `MAIL FROM`.
    #[serde(default)]
    pub sender: String,
    /// Use implicit TLS unless a message says otherwise.
    #[serde(default)]
    pub use_ssl: bool,
    /// Use STARTTLS unless a message says otherwise.
    #[serde(default)]
    pub use_tls: bool,
}

/// Relay service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// SMTP defaults.
    #[serde(default)]
    pub defaults: TransportDefaults,
    /// Number of concurrent delivery workers.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Capacity of the delivery queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Connect timeout.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Command timeout.
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Client identifier for EHLO.
    pub client_id: Option<String>,
}

fn default_worker_count() -> usize { DEFAULT_WORKER_COUNT }
fn default_queue_capacity() -> usize { DEFAULT_QUEUE_CAPACITY }
fn default_connect_timeout() -> Duration { DEFAULT_CONNECT_TIMEOUT }
fn default_command_timeout() -> Duration { DEFAULT_COMMAND_TIMEOUT }

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            defaults: TransportDefaults::default(),
            worker_count: DEFAULT_WORKER_COUNT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            client_id: None,
        }
    }
}

impl ServiceConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder::default()
    }

    /// Loads the configuration from process environment variables.
    ///
    /// Unset variables keep their defaults. Empty SMTP fields are allowed:
    /// messages may carry their own server settings.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut builder = Self::builder();

        if let Some(host) = get(env::SMTP_HOST) {
            builder = builder.host(host);
        }
        if let Some(port) = get(env::SMTP_PORT) {
            builder = builder.port(parse_number(env::SMTP_PORT, &port)?);
        }
        if let Some(user) = get(env::SMTP_USER) {
            builder = builder.username(user);
        }
        if let Some(pass) = lookup(env::SMTP_PASS).filter(|v| !v.is_empty()) {
            builder = builder.password(pass);
        }
        if let Some(sender) = get(env::SENDER_EMAIL) {
            builder = builder.sender(sender);
        }
        if let Some(flag) = get(env::SMTP_USE_SSL) {
            builder = builder.use_ssl(parse_bool(env::SMTP_USE_SSL, &flag)?);
        }
        if let Some(flag) = get(env::SMTP_USE_TLS) {
            builder = builder.use_tls(parse_bool(env::SMTP_USE_TLS, &flag)?);
        }
        if let Some(count) = get(env::EMAIL_WORKER_COUNT) {
            builder = builder.worker_count(parse_number(env::EMAIL_WORKER_COUNT, &count)?);
        }
        if let Some(capacity) = get(env::EMAIL_QUEUE_CAPACITY) {
            builder = builder.queue_capacity(parse_number(env::EMAIL_QUEUE_CAPACITY, &capacity)?);
        }
        if let Some(timeout) = get(env::SMTP_CONNECT_TIMEOUT) {
            builder = builder.connect_timeout(parse_duration(env::SMTP_CONNECT_TIMEOUT, &timeout)?);
        }
        if let Some(timeout) = get(env::SMTP_COMMAND_TIMEOUT) {
            builder = builder.command_timeout(parse_duration(env::SMTP_COMMAND_TIMEOUT, &timeout)?);
        }
        if let Some(id) = get(env::SMTP_CLIENT_ID) {
            builder = builder.client_id(id);
        }

        builder.build()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker_count must be positive".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be positive".to_string()));
        }
        if self.connect_timeout.is_zero() || self.command_timeout.is_zero() {
            return Err(ConfigError::Invalid("timeouts must be non-zero".to_string()));
        }
        if self.defaults.port == Some(0) {
            return Err(ConfigError::Invalid("port must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Returns the client identifier for EHLO.
    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or("localhost")
    }
}

/// Builder for [`ServiceConfig`].
#[derive(Debug, Default)]
pub struct ServiceConfigBuilder {
    defaults: TransportDefaults,
    worker_count: Option<usize>,
    queue_capacity: Option<usize>,
    connect_timeout: Option<Duration>,
    command_timeout: Option<Duration>,
    client_id: Option<String>,
}

impl ServiceConfigBuilder {
    /// Sets the default SMTP host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.defaults.host = host.into();
        self
    }

    /// Sets the default SMTP port.
    pub fn port(mut self, port: u16) -> Self {
        self.defaults.port = Some(port);
        self
    }

    /// Sets default credentials.
    pub fn credentials(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username(username).password(password)
    }

    /// Sets the default username.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.defaults.username = username.into();
        self
    }

    /// Sets the default password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.defaults.password = Some(SecretString::new(password.into()));
        self
    }

    /// Sets the sender address.
    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.defaults.sender = sender.into();
        self
    }

    /// Uses implicit TLS by default.
    pub fn use_ssl(mut self, enabled: bool) -> Self {
        self.defaults.use_ssl = enabled;
        self
    }

    /// Uses STARTTLS by default.
    pub fn use_tls(mut self, enabled: bool) -> Self {
        self.defaults.use_tls = enabled;
        self
    }

    /// Sets the number of delivery workers.
    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = Some(count);
        self
    }

    /// Sets the queue capacity.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Sets connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets command timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Sets the client identifier for EHLO.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> Result<ServiceConfig, ConfigError> {
        let config = ServiceConfig {
            defaults: self.defaults,
            worker_count: self.worker_count.unwrap_or(DEFAULT_WORKER_COUNT),
            queue_capacity: self.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            command_timeout: self.command_timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT),
            client_id: self.client_id,
        };

        config.validate()?;
        Ok(config)
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Port to listen on, on all interfaces.
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { port: DEFAULT_HTTP_PORT }
    }
}

impl HttpConfig {
    /// Loads the listener port from `EMAIL_SERVICE_PORT`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the listener port from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        match lookup(env::EMAIL_SERVICE_PORT).map(|v| v.trim().to_string()) {
            Some(port) if !port.is_empty() => Ok(Self {
                port: parse_number(env::EMAIL_SERVICE_PORT, &port)?,
            }),
            _ => Ok(Self::default()),
        }
    }

    /// Returns the socket address to bind.
    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid_value(key, format!("{:?}: {}", value, e)))
}

/// Accepts the usual spellings: 1/0, t/f, true/false in any case.
fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" => Ok(true),
        "0" | "f" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::invalid_value(key, format!("{:?} is not a boolean", value))),
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value)
        .map_err(|e| ConfigError::invalid_value(key, format!("{:?}: {}", value, e)))
}

// Humantime serde support
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
