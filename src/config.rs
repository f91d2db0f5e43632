use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{fs, path::Path, time::Duration};
use tracing::{debug, info};

use crate::dialer::{DEFAULT_HANDSHAKE_TIMEOUT, RetryPolicy};
use crate::error::ConfigError;
use crate::listener::format_addr;

pub const CLIENT_CONFIG_FILE: &str = "client.toml";
pub const SERVER_CONFIG_FILE: &str = "server.toml";

/// Number of successive ports the server tries when `ws_port` is taken.
pub const DEFAULT_PORT_FALLBACK_TRIES: u16 = 20;

fn default_listen_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_geo_api_url() -> String {
    "https://ipapi.co".to_string()
}

const fn default_handshake_timeout_sec() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT.as_secs()
}

const fn default_port_fallback_tries() -> u16 {
    DEFAULT_PORT_FALLBACK_TRIES
}

const fn default_true() -> bool {
    true
}

/// Settings for the TCP-in, WebSocket-out face.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ClientConfig {
    pub local_port: u16,
    pub websocket_url: String,
    pub reconnect_delay_sec: u64,
    pub max_retries: u32,
    pub resolve_cdn: bool,
    #[serde(default = "default_listen_ip")]
    pub listen_ip: String,
    #[serde(default = "default_geo_api_url")]
    pub geo_api_url: String,
    #[serde(default = "default_handshake_timeout_sec")]
    pub handshake_timeout_sec: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            local_port: 25566,
            websocket_url: "ws://127.0.0.1:12381".to_string(),
            reconnect_delay_sec: 3,
            max_retries: 5,
            resolve_cdn: true,
            listen_ip: default_listen_ip(),
            geo_api_url: default_geo_api_url(),
            handshake_timeout_sec: default_handshake_timeout_sec(),
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn listen_addr(&self) -> String {
        format_addr(&self.listen_ip, self.local_port)
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_secs(self.reconnect_delay_sec),
        )
        .with_handshake_timeout(Duration::from_secs(self.handshake_timeout_sec))
    }
}

/// Settings for the WebSocket-in, TCP-out face.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServerConfig {
    pub ws_port: u16,
    pub tcp_host: String,
    pub tcp_port: u16,
    #[serde(default = "default_listen_ip")]
    pub listen_ip: String,
    #[serde(default = "default_port_fallback_tries")]
    pub port_fallback_tries: u16,
    #[serde(default = "default_true")]
    pub report_ip: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_port: 8080,
            tcp_host: "localhost".to_string(),
            tcp_port: 25565,
            listen_ip: default_listen_ip(),
            port_fallback_tries: DEFAULT_PORT_FALLBACK_TRIES,
            report_ip: true,
            tls: None,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn backend_addr(&self) -> String {
        format_addr(&self.tcp_host, self.tcp_port)
    }
}

/// A per-mode configuration file: has defaults and can check itself after parsing.
pub trait ModeConfig: Serialize + DeserializeOwned + Default {
    fn validate(&self) -> Result<(), ConfigError>;
}

impl ModeConfig for ClientConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.websocket_url.starts_with("ws://") || self.websocket_url.starts_with("wss://")) {
            return Err(ConfigError::Invalid {
                key: "websocket_url",
                reason: format!("expected ws:// or wss:// URL, got {:?}", self.websocket_url),
            });
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid {
                key: "max_retries",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.handshake_timeout_sec == 0 {
            return Err(ConfigError::Invalid {
                key: "handshake_timeout_sec",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

impl ModeConfig for ServerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.tcp_host.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "tcp_host",
                reason: "must not be empty".to_string(),
            });
        }
        if self.port_fallback_tries == 0 {
            return Err(ConfigError::Invalid {
                key: "port_fallback_tries",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Loads `path`, first writing the defaults there if the file does not exist yet.
pub fn load_or_create<T: ModeConfig>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        info!(config_file = %path.display(), "Configuration file not found, writing defaults");
        let config = T::default();
        write_default(path, &config)?;
        info!(config_file = %path.display(), "Default configuration written, edit it as needed");
        return Ok(config);
    }

    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(config_file = %path.display(), bytes = content.len(), "Read configuration file");
    parse(path, &content)
}

pub fn parse<T: ModeConfig>(path: &Path, content: &str) -> Result<T, ConfigError> {
    let config: T = toml::from_str(content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

fn write_default<T: Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let write_error = |reason: String| ConfigError::WriteDefault {
        path: path.to_path_buf(),
        reason,
    };
    let content = toml::to_string_pretty(config).map_err(|e| write_error(e.to_string()))?;
    fs::write(path, content).map_err(|e| write_error(e.to_string()))
}
