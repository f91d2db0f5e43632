//! Diagnostic lookup of which IP a `ws://`/`wss://` endpoint actually lands on, plus where
//! that IP is. Nothing here feeds back into routing; every failure is logged and dropped.

use serde::Deserialize;
use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    time::Duration,
};
use tokio::{net::TcpStream, time::timeout};
use tracing::{info, warn};

use crate::error::ResolveError;
use crate::listener::format_addr;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
pub const GEO_TIMEOUT: Duration = Duration::from_secs(3);

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    #[must_use]
    pub fn addr(&self) -> String {
        format_addr(&self.host, self.port)
    }
}

/// Pulls host and port out of a WebSocket URL. Without an explicit port, `ws` means 80 and
/// `wss` means 443.
pub fn endpoint_address(url: &str) -> Result<Endpoint, ResolveError> {
    let bad_url = || ResolveError::BadUrl(url.to_string());

    let (rest, default_port) = if let Some(rest) = url.strip_prefix("wss://") {
        (rest, 443)
    } else if let Some(rest) = url.strip_prefix("ws://") {
        (rest, 80)
    } else {
        return Err(bad_url());
    };

    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    let parse_port = |port: &str| port.parse::<u16>().map_err(|_| bad_url());

    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, after) = bracketed.split_once(']').ok_or_else(bad_url)?;
        match after.strip_prefix(':') {
            Some(port) => (host, parse_port(port)?),
            None if after.is_empty() => (host, default_port),
            None => return Err(bad_url()),
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, parse_port(port)?),
            None => (authority, default_port),
        }
    };

    if host.is_empty() {
        return Err(bad_url());
    }

    Ok(Endpoint {
        host: host.to_string(),
        port,
    })
}

/// Opens and immediately drops a TCP connection to `addr`, returning the address it reached.
pub async fn probe(addr: &str, limit: Duration) -> Result<SocketAddr, ResolveError> {
    let stream = timeout(limit, TcpStream::connect(addr))
        .await
        .map_err(|_| ResolveError::ProbeTimeout {
            addr: addr.to_string(),
        })?
        .map_err(|source| ResolveError::Probe {
            addr: addr.to_string(),
            source,
        })?;

    stream.peer_addr().map_err(|source| ResolveError::Probe {
        addr: addr.to_string(),
        source,
    })
}

/// Location record as served by ipapi.co-compatible services.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct GeoInfo {
    pub city: Option<String>,
    pub region: Option<String>,
    #[serde(rename = "country_name")]
    pub country: Option<String>,
    pub org: Option<String>,
    pub asn: Option<String>,
    pub timezone: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl fmt::Display for GeoInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |field: &Option<String>| field.clone().unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "{}, {}, {} | ASN: {} | org: {} | timezone: {}",
            show(&self.country),
            show(&self.region),
            show(&self.city),
            show(&self.asn),
            show(&self.org),
            show(&self.timezone),
        )
    }
}

#[derive(Deserialize)]
struct GeoReply {
    #[serde(default)]
    error: bool,
    #[serde(default)]
    reason: Option<String>,
    #[serde(flatten)]
    info: GeoInfo,
}

/// Resolves the configured endpoint and looks up its location.
#[derive(Debug, Clone)]
pub struct CdnResolver {
    http: reqwest::Client,
    api_base: String,
    probe_timeout: Duration,
}

impl CdnResolver {
    pub fn new(api_base: &str) -> Result<Self, ResolveError> {
        Self::with_timeouts(api_base, PROBE_TIMEOUT, GEO_TIMEOUT)
    }

    pub fn with_timeouts(
        api_base: &str,
        probe_timeout: Duration,
        geo_timeout: Duration,
    ) -> Result<Self, ResolveError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(geo_timeout)
            .build()?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            probe_timeout,
        })
    }

    pub async fn resolve(&self, websocket_url: &str) -> Result<SocketAddr, ResolveError> {
        let endpoint = endpoint_address(websocket_url)?;
        probe(&endpoint.addr(), self.probe_timeout).await
    }

    pub async fn lookup(&self, ip: IpAddr) -> Result<GeoInfo, ResolveError> {
        let url = format!("{}/{ip}/json", self.api_base);
        let reply: GeoReply = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if reply.error {
            return Err(ResolveError::Rejected(
                reply.reason.unwrap_or_else(|| "no reason given".to_string()),
            ));
        }
        Ok(reply.info)
    }

    /// Logs the resolved IP and its location. Never fails.
    pub async fn report(&self, websocket_url: &str) {
        let resolved = match self.resolve(websocket_url).await {
            Ok(addr) => addr,
            Err(e) => {
                warn!(websocket_url, error = %e, "CDN endpoint probe failed");
                return;
            }
        };
        info!(websocket_url, resolved_addr = %resolved, "CDN endpoint resolved");

        match self.lookup(resolved.ip()).await {
            Ok(geo) => info!(ip = %resolved.ip(), location = %geo, "CDN endpoint location"),
            Err(e) => warn!(ip = %resolved.ip(), error = %e, "CDN geolocation lookup failed"),
        }
    }
}
