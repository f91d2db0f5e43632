use anyhow::{Context, Result};
use std::{net::SocketAddr, sync::Arc};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use crate::config::ClientConfig;
use crate::resolver::CdnResolver;
use crate::{dialer, listener, relay};

/// Binds the local TCP port and tunnels every accepted connection until the process exits.
pub async fn run(config: ClientConfig) -> Result<()> {
    let listener = listener::bind(&config.listen_ip, config.local_port)
        .await
        .context("Failed to bind local TCP port")?;

    info!(
        listen_addr = %config.listen_addr(),
        websocket_url = %config.websocket_url,
        "TCP tunnel client listening"
    );

    serve(listener, Arc::new(config)).await;
    Ok(())
}

/// Accept loop. Dialing and relaying happen in a task per connection.
pub async fn serve(listener: TcpListener, config: Arc<ClientConfig>) {
    let resolver = if config.resolve_cdn {
        match CdnResolver::new(&config.geo_api_url) {
            Ok(resolver) => Some(resolver),
            Err(e) => {
                warn!(error = %e, "CDN resolution disabled");
                None
            }
        }
    } else {
        None
    };

    loop {
        let (stream, client_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Failed to accept TCP connection");
                continue;
            }
        };
        info!(client_addr = %client_addr, "TCP client connected, opening WebSocket tunnel");

        if let Some(resolver) = resolver.clone() {
            let url = config.websocket_url.clone();
            tokio::spawn(async move { resolver.report(&url).await });
        }

        let config = config.clone();
        tokio::spawn(async move { handle_connection(stream, client_addr, &config).await });
    }
}

#[tracing::instrument(skip(stream, config), fields(client_addr = %client_addr))]
async fn handle_connection(stream: TcpStream, client_addr: SocketAddr, config: &ClientConfig) {
    let websocket = match dialer::dial(&config.websocket_url, config.retry_policy()).await {
        Ok(websocket) => websocket,
        Err(e) => {
            error!(error = %e, "All WebSocket attempts failed, dropping TCP client");
            return;
        }
    };

    info!(websocket_url = %config.websocket_url, "Tunnel established");
    let summary = relay::run(stream, websocket).await;
    relay::log_summary(&summary);
}
