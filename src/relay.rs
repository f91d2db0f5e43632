//! One relay session: a TCP stream paired with a WebSocket, copied in both directions until
//! either side ends.
//!
//! A session is ESTABLISHED when [`run`] is called. The first direction to hit EOF, a close
//! frame or an error moves it to CLOSING by cancelling a shared token; the other direction
//! sees the token and stops without reporting an error of its own. `run` then closes the
//! WebSocket sink and shuts down the TCP write half, once each, and drops both transports.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::time::Duration;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{
        Error as WsError, Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RelayError;

pub const BUFFER_SIZE: usize = 8192;

/// Reason text of the close frame sent when the TCP side reaches end-of-stream.
pub const TCP_CLOSED_REASON: &str = "tcp closed";

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    TcpToWs,
    WsToTcp,
}

#[derive(Debug)]
pub enum Termination {
    /// The TCP side reached end-of-stream.
    Eof,
    /// The WebSocket peer sent a close frame or the stream ended cleanly.
    PeerClosed,
    /// The other direction finished first.
    Cancelled,
    Failed(RelayError),
}

#[derive(Debug)]
pub struct Flow {
    pub bytes: u64,
    pub termination: Termination,
}

#[derive(Debug)]
pub struct SessionSummary {
    /// The direction whose termination closed the session.
    pub first: Direction,
    pub tcp_to_ws: Flow,
    pub ws_to_tcp: Flow,
}

impl SessionSummary {
    #[must_use]
    pub fn failure(&self) -> Option<&RelayError> {
        [&self.tcp_to_ws, &self.ws_to_tcp]
            .into_iter()
            .find_map(|flow| match &flow.termination {
                Termination::Failed(e) => Some(e),
                _ => None,
            })
    }
}

/// Logs how a finished session ended.
pub fn log_summary(summary: &SessionSummary) {
    match summary.failure() {
        Some(e) => warn!(
            first = ?summary.first,
            tcp_to_ws_bytes = summary.tcp_to_ws.bytes,
            ws_to_tcp_bytes = summary.ws_to_tcp.bytes,
            error = %e,
            "Tunnel closed after transport error"
        ),
        None => info!(
            first = ?summary.first,
            tcp_to_ws_bytes = summary.tcp_to_ws.bytes,
            ws_to_tcp_bytes = summary.ws_to_tcp.bytes,
            "Tunnel closed"
        ),
    }
}

/// Relays between `tcp` and `websocket` until one direction ends, then closes both.
pub async fn run<T, S>(tcp: T, websocket: WebSocketStream<S>) -> SessionSummary
where
    T: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut tcp_reader, mut tcp_writer) = tokio::io::split(tcp);
    let (mut ws_sender, mut ws_receiver) = websocket.split();
    let closing = CancellationToken::new();

    let mut tcp_to_ws_bytes = 0;
    let mut ws_to_tcp_bytes = 0;

    let (tcp_to_ws, ws_to_tcp) = tokio::join!(
        guarded(
            &closing,
            pump_tcp_to_ws(&mut tcp_reader, &mut ws_sender, &mut tcp_to_ws_bytes),
        ),
        guarded(
            &closing,
            pump_ws_to_tcp(&mut ws_receiver, &mut tcp_writer, &mut ws_to_tcp_bytes),
        ),
    );

    match timeout(CLOSE_TIMEOUT, ws_sender.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "WebSocket close did not complete cleanly"),
        Err(_) => debug!("WebSocket close timed out"),
    }
    if let Err(e) = tcp_writer.shutdown().await {
        debug!(error = %e, "TCP shutdown did not complete cleanly");
    }

    let first = if matches!(tcp_to_ws, Termination::Cancelled) {
        Direction::WsToTcp
    } else {
        Direction::TcpToWs
    };

    SessionSummary {
        first,
        tcp_to_ws: Flow {
            bytes: tcp_to_ws_bytes,
            termination: tcp_to_ws,
        },
        ws_to_tcp: Flow {
            bytes: ws_to_tcp_bytes,
            termination: ws_to_tcp,
        },
    }
}

/// Runs one direction until it ends on its own or `closing` fires, then fires `closing`.
async fn guarded(
    closing: &CancellationToken,
    pump: impl Future<Output = Termination>,
) -> Termination {
    let termination = tokio::select! {
        biased;
        () = closing.cancelled() => Termination::Cancelled,
        end = pump => end,
    };
    closing.cancel();
    termination
}

async fn pump_tcp_to_ws<R, K>(reader: &mut R, sender: &mut K, bytes: &mut u64) -> Termination
where
    R: AsyncRead + Unpin,
    K: Sink<Message, Error = WsError> + Unpin,
{
    let mut buffer = [0u8; BUFFER_SIZE];

    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => {
                debug!("TCP end of stream, sending close frame");
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: TCP_CLOSED_REASON.into(),
                };
                if let Err(e) = sender.send(Message::Close(Some(frame))).await {
                    debug!(error = %e, "Close frame not delivered");
                }
                return Termination::Eof;
            }
            Ok(n) => {
                debug!(bytes = n, "Forwarding data from TCP to WebSocket");
                if let Err(e) = sender.send(Message::Binary(buffer[..n].to_vec().into())).await {
                    return Termination::Failed(RelayError::WsSend(Box::new(e)));
                }
                *bytes += n as u64;
            }
            Err(e) => return Termination::Failed(RelayError::TcpRead(e)),
        }
    }
}

async fn pump_ws_to_tcp<St, W>(receiver: &mut St, writer: &mut W, bytes: &mut u64) -> Termination
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(message) = receiver.next().await {
        let message = match message {
            Ok(message) => message,
            Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                return Termination::PeerClosed;
            }
            Err(e) => return Termination::Failed(RelayError::WsRead(Box::new(e))),
        };

        let data: &[u8] = match &message {
            Message::Binary(data) => data.as_ref(),
            Message::Text(text) => text.as_bytes(),
            Message::Close(frame) => {
                debug!(?frame, "WebSocket close frame received");
                return Termination::PeerClosed;
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        debug!(bytes = data.len(), "Forwarding data from WebSocket to TCP");
        if let Err(e) = writer.write_all(data).await {
            return Termination::Failed(RelayError::TcpWrite(e));
        }
        *bytes += data.len() as u64;
    }

    Termination::PeerClosed
}
