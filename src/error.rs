use std::{io, path::PathBuf};

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse {} as TOML: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to write default configuration to {}: {reason}", .path.display())]
    WriteDefault { path: PathBuf, reason: String },

    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Returned once every dial attempt allowed by the retry policy has failed.
#[derive(Debug, Error)]
#[error("gave up connecting to {url} after {attempts} attempt(s)")]
pub struct DialError {
    pub url: String,
    pub attempts: u32,
    #[source]
    pub last: Option<Box<WsError>>,
}

#[derive(Debug, Error)]
pub enum BindError {
    #[error("failed to bind {addr}: {source}")]
    Io { addr: String, source: io::Error },

    #[error("no free port among {tries} candidate(s) starting at {start}")]
    Exhausted { start: u16, tries: u16 },
}

/// A transport failure inside one relay session.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("TCP read failed: {0}")]
    TcpRead(#[source] io::Error),

    #[error("TCP write failed: {0}")]
    TcpWrite(#[source] io::Error),

    #[error("WebSocket read failed: {0}")]
    WsRead(#[source] Box<WsError>),

    #[error("WebSocket send failed: {0}")]
    WsSend(#[source] Box<WsError>),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("cannot extract host from {0}")]
    BadUrl(String),

    #[error("probe connection to {addr} failed: {source}")]
    Probe { addr: String, source: io::Error },

    #[error("probe connection to {addr} timed out")]
    ProbeTimeout { addr: String },

    #[error("geolocation request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("geolocation service refused the query: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to open {path}: {source}")]
    Open { path: String, source: io::Error },

    #[error("failed to parse {path}: {source}")]
    Pem { path: String, source: io::Error },

    #[error("no certificates found in {0}")]
    NoCertificates(String),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("invalid TLS server configuration: {0}")]
    Config(#[from] rustls::Error),
}
