//! Startup report of the addresses a server can be reached on.

use std::{net::IpAddr, time::Duration};
use tracing::{info, warn};

pub const PUBLIC_IPV4_URL: &str = "https://api.ipify.org";
pub const PUBLIC_IPV6_URL: &str = "https://api64.ipify.org";

const PUBLIC_IP_TIMEOUT: Duration = Duration::from_secs(4);

/// Non-loopback addresses of the local interfaces, IPv4 first.
#[must_use]
pub fn local_addresses() -> Vec<IpAddr> {
    let mut addresses: Vec<IpAddr> = match get_if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces
            .into_iter()
            .filter(|iface| !iface.is_loopback())
            .map(|iface| iface.ip())
            .collect(),
        Err(e) => {
            warn!(error = %e, "Failed to list network interfaces");
            Vec::new()
        }
    };
    addresses.sort_by_key(|ip| (ip.is_ipv6(), *ip));
    addresses.dedup();
    addresses
}

/// Asks a plain-text "what is my IP" service at `url`.
pub async fn public_address(client: &reqwest::Client, url: &str) -> Result<IpAddr, String> {
    let body = client
        .get(url)
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| e.to_string())?
        .text()
        .await
        .map_err(|e| e.to_string())?;

    body.trim()
        .parse()
        .map_err(|_| format!("unexpected response {:?}", body.trim()))
}

/// Logs local and public addresses. Failures are logged and otherwise ignored.
pub async fn report() {
    for ip in local_addresses() {
        let family = if ip.is_ipv4() { "IPv4" } else { "IPv6" };
        info!(family, %ip, "Local address");
    }

    let client = match reqwest::Client::builder()
        .timeout(PUBLIC_IP_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "Cannot build HTTP client for public IP lookup");
            return;
        }
    };

    for (family, url) in [("IPv4", PUBLIC_IPV4_URL), ("IPv6", PUBLIC_IPV6_URL)] {
        match public_address(&client, url).await {
            Ok(ip) => info!(family, %ip, "Public address"),
            Err(e) => warn!(family, error = %e, "Public address lookup failed"),
        }
    }
}
