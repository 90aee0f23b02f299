//! Client configuration
//!
//! Loaded from a TOML file. Secrets are never stored in the file; the
//! `[auth]` section names the environment variables that hold them.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Main client configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub client: ClientSection,
    pub hub: HubSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

/// Identity of this client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientSection {
    /// Client identifier (must match [a-zA-Z0-9._:-]+); used as sender and agent ID
    pub id: String,
}

/// Where the hub lives and how to trust it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubSection {
    /// Connection URL; the scheme selects the transport
    pub url: String,
    /// PEM encoded CA certificate
    pub ca_cert: Option<PathBuf>,
    #[serde(default)]
    pub disable_cert_check: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AuthSection {
    /// Environment variable containing the login password
    pub password_env: Option<String>,
    /// Environment variable containing a pre-issued token
    pub token_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutSection {
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Backoff settings for the reconnection supervisor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// 0 means retry forever
    #[serde(default)]
    pub max_attempts: u32,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            max_attempts: 0,
        }
    }
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

/// Transport selected by the hub URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    HttpSse,
    Mqtt,
    Nats,
}

impl TransportKind {
    /// Map a URL scheme to a transport.
    ///
    /// `https`/`http` use HTTP+SSE, `mqtt`/`mqtts`/`tcp`/`ssl`/`ws`/`wss` use
    /// MQTT, `nats`/`tls` use NATS.
    pub fn from_url(url: &str) -> Result<Self, ConfigError> {
        let parsed = Url::parse(url)
            .map_err(|e| ConfigError::InvalidConfig(format!("Invalid hub URL '{url}': {e}")))?;
        match parsed.scheme() {
            "https" | "http" => Ok(TransportKind::HttpSse),
            "mqtt" | "mqtts" | "tcp" | "ssl" | "ws" | "wss" => Ok(TransportKind::Mqtt),
            "nats" | "tls" => Ok(TransportKind::Nats),
            other => Err(ConfigError::InvalidConfig(format!(
                "Unsupported hub URL scheme '{other}'"
            ))),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid client ID format: {0}")]
    InvalidClientId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientConfig {
    /// Build a configuration in code with default timeouts and backoff
    pub fn new(client_id: impl Into<String>, hub_url: impl Into<String>) -> Self {
        Self {
            client: ClientSection {
                id: client_id.into(),
            },
            hub: HubSection {
                url: hub_url.into(),
                ca_cert: None,
                disable_cert_check: false,
            },
            auth: AuthSection::default(),
            timeouts: TimeoutSection::default(),
            reconnect: ReconnectSection::default(),
        }
    }

    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_client_id(&self.client.id)?;
        TransportKind::from_url(&self.hub.url)?;

        if self.timeouts.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "timeouts.request_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.reconnect.initial_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.initial_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_delay_ms must not be less than initial_delay_ms".to_string(),
            ));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.multiplier must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn transport_kind(&self) -> Result<TransportKind, ConfigError> {
        TransportKind::from_url(&self.hub.url)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.connect_timeout_ms)
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name
            .and_then(|name| std::env::var(name).ok())
            .filter(|v| !v.is_empty())
    }

    /// Get the login password from its environment variable
    pub fn get_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.auth.password_env.as_ref())
    }

    /// Get the pre-issued token from its environment variable
    pub fn get_token(&self) -> Option<String> {
        Self::get_env_var_optional(self.auth.token_env.as_ref())
    }

    /// Resolve credentials; a token is preferred over a password
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let client_id = self.client.id.clone();
        if let Some(token) = self.get_token() {
            return Ok(Credentials::Token { client_id, token });
        }
        if let Some(password) = self.get_password() {
            return Ok(Credentials::Password {
                client_id,
                password,
            });
        }
        let names: Vec<&str> = [&self.auth.token_env, &self.auth.password_env]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect();
        if names.is_empty() {
            Ok(Credentials::Anonymous { client_id })
        } else {
            Err(ConfigError::EnvVarNotFound(names.join(" or ")))
        }
    }
}

/// Credentials presented at connect time
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Password { client_id: String, password: String },
    Token { client_id: String, token: String },
    Anonymous { client_id: String },
}

impl Credentials {
    pub fn client_id(&self) -> &str {
        match self {
            Credentials::Password { client_id, .. }
            | Credentials::Token { client_id, .. }
            | Credentials::Anonymous { client_id } => client_id,
        }
    }

    pub fn token(&self) -> Option<&str> {
        match self {
            Credentials::Token { token, .. } => Some(token),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Credentials::Password { .. } => "password",
            Credentials::Token { .. } => "token",
            Credentials::Anonymous { .. } => "anonymous",
        };
        f.debug_struct("Credentials")
            .field("client_id", &self.client_id())
            .field("kind", &kind)
            .finish()
    }
}

/// Validate client ID format
pub fn validate_client_id(client_id: &str) -> Result<(), ConfigError> {
    let valid_chars = client_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ':'));

    if client_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidClientId(format!(
            "Client ID '{client_id}' must match pattern [a-zA-Z0-9._:-]+"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
[client]
id = "lamp-agent"

[hub]
url = "https://hub.local:8444/hiveot/sse"
ca_cert = "certs/caCert.pem"

[auth]
password_env = "HUBCONNECT_TEST_PW_UNSET"

[timeouts]
request_timeout_ms = 5000

[reconnect]
initial_delay_ms = 100
max_delay_ms = 2000
multiplier = 1.5
max_attempts = 4
"#;

    #[test]
    fn test_full_config() {
        let config = ClientConfig::from_toml_str(FULL).unwrap();
        assert_eq!(config.client.id, "lamp-agent");
        assert_eq!(config.hub.ca_cert, Some(PathBuf::from("certs/caCert.pem")));
        assert_eq!(config.timeouts.request_timeout_ms, 5000);
        assert_eq!(config.timeouts.connect_timeout_ms, 10_000);
        assert_eq!(config.reconnect.max_attempts, 4);
        assert_eq!(config.transport_kind().unwrap(), TransportKind::HttpSse);
    }

    #[test]
    fn test_minimal_config_defaults() {
        let toml_content = r#"
[client]
id = "c1"

[hub]
url = "mqtt://localhost:1883"
"#;
        let config = ClientConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.reconnect, ReconnectSection::default());
        assert!(!config.hub.disable_cert_check);
        assert_eq!(config.transport_kind().unwrap(), TransportKind::Mqtt);
    }

    #[test]
    fn test_transport_kind_from_url() {
        assert_eq!(
            TransportKind::from_url("https://h:8444/sse").unwrap(),
            TransportKind::HttpSse
        );
        assert_eq!(
            TransportKind::from_url("mqtts://h:8883").unwrap(),
            TransportKind::Mqtt
        );
        assert_eq!(
            TransportKind::from_url("wss://h:8884/mqtt").unwrap(),
            TransportKind::Mqtt
        );
        assert_eq!(
            TransportKind::from_url("nats://h:4222").unwrap(),
            TransportKind::Nats
        );
        assert!(TransportKind::from_url("ftp://h").is_err());
        assert!(TransportKind::from_url("not a url").is_err());
    }

    #[test]
    fn test_invalid_client_id() {
        assert!(validate_client_id("invalid@client").is_err());
        assert!(validate_client_id("").is_err());
        assert!(validate_client_id("dtw:agent-1.a_b").is_ok());
    }

    #[test]
    fn test_backoff_validation() {
        let mut config = ClientConfig::new("c1", "nats://localhost:4222");
        config.reconnect.max_delay_ms = 10;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));

        let mut config = ClientConfig::new("c1", "nats://localhost:4222");
        config.reconnect.multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_credentials_missing_env_is_error() {
        let config = ClientConfig::from_toml_str(FULL).unwrap();
        match config.credentials() {
            Err(ConfigError::EnvVarNotFound(name)) => {
                assert_eq!(name, "HUBCONNECT_TEST_PW_UNSET")
            }
            other => panic!("expected EnvVarNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_credentials_anonymous_without_auth() {
        let config = ClientConfig::new("c1", "mqtt://localhost:1883");
        assert_eq!(
            config.credentials().unwrap(),
            Credentials::Anonymous {
                client_id: "c1".to_string()
            }
        );
    }

    #[test]
    fn test_credentials_debug_hides_secret() {
        let creds = Credentials::Password {
            client_id: "c1".to_string(),
            password: "hunter2".to_string(),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("password"));
    }
}
