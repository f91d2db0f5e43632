use anyhow::{Context, Result};
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{Request, Response},
        http::HeaderMap,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::{listener, netinfo, relay, tls};

/// Binds the WebSocket port (searching upwards if taken) and serves tunnels until the process
/// exits.
pub async fn run(config: ServerConfig) -> Result<()> {
    let acceptor = config
        .tls
        .as_ref()
        .map(tls::load_acceptor)
        .transpose()
        .context("Failed to load TLS certificate or key")?;

    if config.report_ip {
        tokio::spawn(netinfo::report());
    }

    let listener = listener::bind_with_fallback(
        &config.listen_ip,
        config.ws_port,
        config.port_fallback_tries,
    )
    .await
    .context("Failed to bind any WebSocket listen port")?;

    let port = listener
        .local_addr()
        .context("Failed to get bound listener local address")?
        .port();
    let scheme = if acceptor.is_some() { "wss" } else { "ws" };
    info!(
        listen_addr = %format!("{scheme}://{}:{port}", config.listen_ip),
        requested_port = config.ws_port,
        port,
        backend = %config.backend_addr(),
        "WebSocket tunnel server listening"
    );

    serve(listener, Arc::new(config), acceptor).await;
    Ok(())
}

/// Accept loop. Each connection gets its own task; nothing here waits on a session.
pub async fn serve(listener: TcpListener, config: Arc<ServerConfig>, acceptor: Option<TlsAcceptor>) {
    loop {
        let (stream, client_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                continue;
            }
        };

        let config = config.clone();
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, client_addr, acceptor, &config).await {
                let error = format!("{e:#}");
                error!(client_addr = %client_addr, error = %error, "Connection failed");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    client_addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    config: &ServerConfig,
) -> Result<()> {
    match acceptor {
        Some(acceptor) => {
            let stream = acceptor
                .accept(stream)
                .await
                .context("Failed to perform TLS handshake")?;
            handle_upgrade(stream, client_addr, config).await
        }
        None => handle_upgrade(stream, client_addr, config).await,
    }
}

#[tracing::instrument(skip(stream, config), fields(client_addr = %client_addr))]
async fn handle_upgrade<S>(stream: S, client_addr: SocketAddr, config: &ServerConfig) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let forwarded = Arc::new(Mutex::new(None::<String>));
    let forwarded_clone = forwarded.clone();

    let callback = move |req: &Request, response: Response| {
        if let Some(ip) = forwarded_client_ip(req.headers()) {
            if let Ok(mut guard) = forwarded_clone.lock() {
                *guard = Some(ip);
            }
        }
        Ok(response)
    };

    let mut websocket = accept_hdr_async(stream, callback)
        .await
        .context("Failed to perform WebSocket handshake")?;

    let forwarded_for = forwarded.lock().ok().and_then(|mut guard| guard.take());
    let backend = config.backend_addr();

    debug!(target_addr = %backend, "Connecting to backend");
    let tcp_stream = match TcpStream::connect(&backend).await {
        Ok(tcp_stream) => tcp_stream,
        Err(e) => {
            let frame = CloseFrame {
                code: CloseCode::Error,
                reason: close_reason(e.to_string()).into(),
            };
            if let Err(close_err) = websocket.close(Some(frame)).await {
                debug!(error = %close_err, "Failed to send close frame");
            }
            return Err(e).with_context(|| format!("Failed to connect to backend {backend}"));
        }
    };

    info!(
        target_addr = %backend,
        client_ip = forwarded_for.as_deref().unwrap_or("-"),
        "Tunnel established"
    );

    let summary = relay::run(tcp_stream, websocket).await;
    relay::log_summary(&summary);
    Ok(())
}

/// Close frame reasons are capped at 123 bytes by the protocol.
fn close_reason(mut text: String) -> String {
    const MAX_REASON_BYTES: usize = 123;
    if text.len() > MAX_REASON_BYTES {
        let mut end = MAX_REASON_BYTES;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

/// Original client IP as reported by a fronting proxy or CDN, if any.
#[must_use]
pub fn forwarded_client_ip(headers: &HeaderMap) -> Option<String> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    header("x-forwarded-for")
        .and_then(|xff| xff.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .or_else(|| header("cf-connecting-ip"))
        .or_else(|| header("x-real-ip"))
        .map(str::to_string)
}
