use std::{env, net::SocketAddr, str::FromStr};

use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid bind address: {0}")]
    InvalidBindAddr(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind_addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// URL-safe base64 encoded 32 byte ed25519 seed. An ephemeral key is
    /// generated when absent, invalidating tokens on restart.
    pub signing_key: Option<String>,
    pub ttl_hours: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signing_key: None,
            ttl_hours: 12,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub max_requests: u64,
    /// Shared counter store; counters stay in-process when unset.
    pub redis_url: Option<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 1_000,
            max_requests: 60,
            redis_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct MessagingConfig {
    pub gif_url_prefix: String,
    pub edit_window_secs: i64,
    pub max_connections: usize,
    pub outbox_capacity: usize,
    pub send_timeout_secs: u64,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            gif_url_prefix: "https://media.tenor.com/".to_string(),
            edit_window_secs: 600,
            max_connections: 1_024,
            outbox_capacity: 256,
            send_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: Option<String>,
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub metrics: MetricsConfig,
    pub session: SessionConfig,
    pub rate_limit: RateLimitConfig,
    pub messaging: MessagingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            host: "0.0.0.0".to_string(),
            port: 8080,
            log_format: LogFormat::Compact,
            database_url: None,
            metrics: MetricsConfig::default(),
            session: SessionConfig::default(),
            rate_limit: RateLimitConfig::default(),
            messaging: MessagingConfig::default(),
        }
    }
}

/// Values supplied on the command line; they win over files and environment.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind_addr: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_format: Option<LogFormat>,
    pub database_url: Option<String>,
    pub metrics_enabled: Option<bool>,
    pub metrics_bind_addr: Option<String>,
    pub session_signing_key: Option<String>,
    pub rate_limit_window_ms: Option<u64>,
    pub rate_limit_max_requests: Option<u64>,
    pub rate_limit_redis_url: Option<String>,
}

impl ServerConfig {
    const ENV_PREFIX: &'static str = "CHATROOM_SERVER";

    pub fn load() -> Result<Self, ConfigError> {
        let defaults = ServerConfig::default();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/server").required(false))
            .add_source(config::File::with_name("config/server.local").required(false))
            .add_source(
                config::Environment::with_prefix(Self::ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .set_default("host", defaults.host.clone())?
            .set_default("port", defaults.port as i64)?
            .set_default("log_format", defaults.log_format.as_str())?
            .set_default("metrics.enabled", defaults.metrics.enabled)?;

        let settings: ServerConfig = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn apply_overrides(&mut self, overrides: &CliOverrides) -> Result<(), ConfigError> {
        if let Some(bind_addr) = &overrides.bind_addr {
            self.bind_addr = Some(bind_addr.clone());
        }
        if let Some(host) = &overrides.host {
            self.host = host.clone();
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(log_format) = overrides.log_format {
            self.log_format = log_format;
        }
        if let Some(database_url) = &overrides.database_url {
            self.database_url = Some(database_url.clone());
        }
        if let Some(enabled) = overrides.metrics_enabled {
            self.metrics.enabled = enabled;
        }
        if let Some(bind_addr) = &overrides.metrics_bind_addr {
            self.metrics.bind_addr = Some(bind_addr.clone());
        }
        if let Some(key) = &overrides.session_signing_key {
            self.session.signing_key = Some(key.clone());
        }
        if let Some(window_ms) = overrides.rate_limit_window_ms {
            self.rate_limit.window_ms = window_ms;
        }
        if let Some(max_requests) = overrides.rate_limit_max_requests {
            self.rate_limit.max_requests = max_requests;
        }
        if let Some(redis_url) = &overrides.rate_limit_redis_url {
            self.rate_limit.redis_url = Some(redis_url.clone());
        }
        self.validate()
    }

    pub fn listener_addr(&self) -> Result<SocketAddr, ConfigError> {
        if let Some(addr) = &self.bind_addr {
            return addr
                .parse()
                .map_err(|_| ConfigError::InvalidBindAddr(addr.clone()));
        }

        let addr = format!("{}:{}", self.host, self.port);
        addr.parse().map_err(|_| ConfigError::InvalidBindAddr(addr))
    }

    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// `CHATROOM_SERVER__*` variables present in the process environment.
    pub fn environment_override_keys() -> Vec<String> {
        let prefix = format!("{}__", Self::ENV_PREFIX);
        let mut keys: Vec<String> = env::vars()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with(&prefix))
            .collect();
        keys.sort();
        keys
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidBindAddr("port cannot be zero".into()));
        }
        if let Some(addr) = &self.metrics.bind_addr {
            addr.parse::<SocketAddr>()
                .map_err(|_| ConfigError::InvalidBindAddr(addr.clone()))?;
        }
        if self.rate_limit.window_ms == 0 {
            return Err(ConfigError::Invalid("rate_limit.window_ms must be positive".into()));
        }
        if self.rate_limit.max_requests == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.max_requests must be positive".into(),
            ));
        }
        if let Some(url) = &self.rate_limit.redis_url {
            if !(url.starts_with("redis://") || url.starts_with("rediss://")) {
                return Err(ConfigError::Invalid(
                    "rate_limit.redis_url must use the redis:// or rediss:// scheme".into(),
                ));
            }
        }
        if self.session.ttl_hours <= 0 {
            return Err(ConfigError::Invalid("session.ttl_hours must be positive".into()));
        }
        if self.messaging.max_connections == 0 || self.messaging.outbox_capacity == 0 {
            return Err(ConfigError::Invalid(
                "messaging connection limits must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Compact => "compact",
            LogFormat::Json => "json",
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            other => Err(format!("unsupported log format '{other}'")),
        }
    }
}

impl<'de> Deserialize<'de> for LogFormat {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        LogFormat::from_str(&value).map_err(D::Error::custom)
    }
}
