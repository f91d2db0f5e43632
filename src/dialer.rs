use std::{future::Future, io, time::Duration};

use tokio::{
    net::TcpStream,
    time::{sleep, timeout},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Error as WsError,
};
use tracing::{info, warn};

use crate::error::DialError;

pub type ClientWebSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on one connect + handshake attempt unless configured otherwise.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub handshake_timeout: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }
}

/// Opens a WebSocket to `url`, retrying per `policy`.
///
/// An attempt that has not completed the upgrade within `handshake_timeout` is abandoned and
/// counts as a failure like any other.
pub async fn dial(url: &str, policy: RetryPolicy) -> Result<ClientWebSocket, DialError> {
    dial_with(url, policy, || async {
        match timeout(policy.handshake_timeout, connect_async(url)).await {
            Ok(connected) => connected.map(|(websocket, _response)| websocket),
            Err(_) => Err(WsError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("handshake not completed within {:?}", policy.handshake_timeout),
            ))),
        }
    })
    .await
}

/// Retry loop behind [`dial`].
///
/// Attempts run one after another with a fixed `retry_delay` between them. Every error counts
/// as retryable, whether it came from DNS, TCP, TLS or the upgrade itself. The first success is
/// returned as is; once `max_retries` attempts have failed the last error is handed back inside
/// [`DialError`].
pub async fn dial_with<C, Fut, S>(
    url: &str,
    policy: RetryPolicy,
    mut connect: C,
) -> Result<S, DialError>
where
    C: FnMut() -> Fut,
    Fut: Future<Output = Result<S, WsError>>,
{
    let mut last = None;

    for attempt in 1..=policy.max_retries {
        match connect().await {
            Ok(stream) => {
                info!(url, attempt, "WebSocket connected");
                return Ok(stream);
            }
            Err(e) => {
                warn!(
                    url,
                    attempt,
                    max_retries = policy.max_retries,
                    error = %e,
                    "WebSocket connect attempt failed"
                );
                last = Some(Box::new(e));
            }
        }

        if attempt < policy.max_retries {
            sleep(policy.retry_delay).await;
        }
    }

    Err(DialError {
        url: url.to_string(),
        attempts: policy.max_retries,
        last,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            Arc,
            atomic::{AtomicU32, Ordering},
        },
        time::Instant,
    };
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    const FAST: Duration = Duration::from_millis(10);

    /// Returns a connect closure that fails until call number `succeed_on`.
    fn flaky(
        succeed_on: u32,
        calls: Arc<AtomicU32>,
    ) -> impl FnMut() -> std::future::Ready<Result<u32, WsError>> {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if n >= succeed_on {
                Ok(n)
            } else {
                Err(WsError::ConnectionClosed)
            })
        }
    }

    #[tokio::test]
    async fn first_success_stops_retrying() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = dial_with("ws://test", RetryPolicy::new(5, FAST), flaky(1, calls.clone()))
            .await
            .unwrap();

        assert_eq!(result, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = dial_with("ws://test", RetryPolicy::new(3, FAST), flaky(3, calls.clone()))
            .await
            .unwrap();

        assert_eq!(result, 3, "session must use the connection from attempt 3");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let err = dial_with("ws://test", RetryPolicy::new(3, FAST), flaky(u32::MAX, calls.clone()))
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.attempts, 3);
        assert_eq!(err.url, "ws://test");
        assert!(matches!(err.last.as_deref(), Some(WsError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn waits_between_attempts_but_not_after_the_last() {
        let delay = Duration::from_millis(50);
        let started = Instant::now();
        let calls = Arc::new(AtomicU32::new(0));

        let _ = dial_with("ws://test", RetryPolicy::new(3, delay), flaky(u32::MAX, calls)).await;

        let elapsed = started.elapsed();
        assert!(elapsed >= delay * 2, "expected two waits, took {elapsed:?}");
        assert!(elapsed < delay * 3 + Duration::from_millis(40), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn dials_real_websocket_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _websocket = accept_async(stream).await.unwrap();
        });

        let url = format!("ws://127.0.0.1:{port}/");
        assert!(dial(&url, RetryPolicy::new(1, FAST)).await.is_ok());
    }

    #[tokio::test]
    async fn unreachable_server_exhausts_budget() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let url = format!("ws://127.0.0.1:{port}/");
        let err = dial(&url, RetryPolicy::new(2, FAST)).await.unwrap_err();
        assert_eq!(err.attempts, 2);
        assert!(err.last.is_some());
    }

    #[tokio::test]
    async fn stalled_handshake_counts_as_failed_attempt() {
        // Accepts TCP and never answers the upgrade request.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicU32::new(0));
        let accepted_clone = accepted.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                accepted_clone.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });

        let url = format!("ws://127.0.0.1:{port}/");
        let policy = RetryPolicy::new(3, FAST).with_handshake_timeout(Duration::from_millis(100));
        let err = tokio::time::timeout(Duration::from_secs(5), dial(&url, policy))
            .await
            .expect("dial must give up on a silent endpoint")
            .unwrap_err();

        assert_eq!(err.attempts, 3);
        assert_eq!(accepted.load(Ordering::SeqCst), 3);
        assert!(matches!(
            err.last.as_deref(),
            Some(WsError::Io(e)) if e.kind() == io::ErrorKind::TimedOut
        ));
    }
}
