use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Which provider deployment outbound calls go to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderEnvironment {
    Sandbox,
    Production,
}

impl ProviderEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" | "live" => Self::Production,
            _ => Self::Sandbox,
        }
    }

    pub const fn default_base_url(self) -> &'static str {
        match self {
            ProviderEnvironment::Sandbox => "https://api.sandbox.sumsub.com",
            ProviderEnvironment::Production => "https://api.sumsub.com",
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            ProviderEnvironment::Sandbox => "sandbox",
            ProviderEnvironment::Production => "production",
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub debug: bool,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub database: DatabaseConfig,
    pub provider: ProviderConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );
        let debug = parse_flag("APP_DEBUG")?;

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let default_level = if debug { "debug" } else { "info" };
        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| default_level.to_string());

        let database = DatabaseConfig {
            url: optional_var("DATABASE_URL"),
            max_connections: parse_number("DATABASE_MAX_CONNECTIONS", 10)?,
        };

        let provider_environment = ProviderEnvironment::from_str(
            &env::var("SUMSUB_ENV").unwrap_or_else(|_| "sandbox".to_string()),
        );
        let provider = ProviderConfig {
            environment: provider_environment,
            base_url: optional_var("SUMSUB_BASE_URL")
                .unwrap_or_else(|| provider_environment.default_base_url().to_string()),
            app_token: optional_var("SUMSUB_APP_TOKEN"),
            secret_key: optional_var("SUMSUB_SECRET_KEY"),
            level_name: optional_var("SUMSUB_LEVEL_NAME")
                .unwrap_or_else(|| "basic-kyc-level".to_string()),
            webhook_secret: optional_var("SUMSUB_WEBHOOK_SECRET"),
            timeout: Duration::from_secs(parse_number("SUMSUB_TIMEOUT_SECS", 30)?),
        };

        Ok(Self {
            environment,
            debug,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            database,
            provider,
        })
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_flag(name: &'static str) -> Result<bool, ConfigError> {
    match optional_var(name) {
        None => Ok(false),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue { name, value }),
        },
    }
}

fn parse_number<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match optional_var(name) {
        None => Ok(default),
        Some(value) => value
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Relational store settings; no URL means the in-memory store.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn require_url(&self) -> Result<&str, ConfigError> {
        self.url
            .as_deref()
            .ok_or(ConfigError::MissingVar("DATABASE_URL"))
    }
}

/// Identity-verification provider settings.
#[derive(Clone)]
pub struct ProviderConfig {
    pub environment: ProviderEnvironment,
    pub base_url: String,
    pub app_token: Option<String>,
    pub secret_key: Option<String>,
    pub level_name: String,
    pub webhook_secret: Option<String>,
    pub timeout: Duration,
}

impl ProviderConfig {
    pub fn credentials(&self) -> Result<ProviderCredentials, ConfigError> {
        let app_token = self
            .app_token
            .clone()
            .ok_or(ConfigError::MissingVar("SUMSUB_APP_TOKEN"))?;
        let secret_key = self
            .secret_key
            .clone()
            .ok_or(ConfigError::MissingVar("SUMSUB_SECRET_KEY"))?;
        Ok(ProviderCredentials {
            app_token,
            secret_key,
        })
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("environment", &self.environment)
            .field("base_url", &self.base_url)
            .field("app_token", &self.app_token.as_ref().map(|_| "<redacted>"))
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("level_name", &self.level_name)
            .field(
                "webhook_secret",
                &self.webhook_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Signing credentials for outbound provider calls.
#[derive(Clone)]
pub struct ProviderCredentials {
    pub app_token: String,
    pub secret_key: String,
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    MissingVar(&'static str),
    InvalidValue { name: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::MissingVar(name) => write!(f, "{name} must be set"),
            ConfigError::InvalidValue { name, value } => {
                write!(f, "{name} has an invalid value '{value}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            ConfigError::InvalidPort
            | ConfigError::MissingVar(_)
            | ConfigError::InvalidValue { .. } => None,
        }
    }
}
