use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::error::BindError;

/// Binds `ip:port` once. The client uses this for its fixed local port.
pub async fn bind(ip: &str, port: u16) -> Result<TcpListener, BindError> {
    let addr = format_addr(ip, port);
    TcpListener::bind(&addr)
        .await
        .map_err(|source| BindError::Io { addr, source })
}

/// Tries `start`, `start + 1`, ... until a bind succeeds or `tries` ports have been attempted.
///
/// The search also stops at the top of the port range instead of wrapping around, so the error
/// may report fewer attempts than `tries`.
pub async fn bind_with_fallback(
    ip: &str,
    start: u16,
    tries: u16,
) -> Result<TcpListener, BindError> {
    let mut attempted = 0;

    for offset in 0..tries {
        let Some(port) = start.checked_add(offset) else {
            debug!(port = start, offset, "Reached the top of the port range");
            break;
        };
        attempted += 1;

        match bind(ip, port).await {
            Ok(listener) => {
                debug!(port, attempt = attempted, "Bound listen port");
                return Ok(listener);
            }
            Err(e) => {
                warn!(port, error = %e, "Port unavailable, trying the next one");
            }
        }
    }

    Err(BindError::Exhausted {
        start,
        tries: attempted,
    })
}

pub(crate) fn format_addr(ip: &str, port: u16) -> String {
    if ip.contains(':') && !ip.starts_with('[') {
        format!("[{ip}]:{port}")
    } else {
        format!("{ip}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Finds `count` consecutive free ports and returns the first one.
    async fn free_port_run(count: u16) -> u16 {
        'search: loop {
            let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let start = probe.local_addr().unwrap().port();
            drop(probe);

            if start.checked_add(count).is_none() {
                continue;
            }
            for offset in 0..count {
                if TcpListener::bind(("127.0.0.1", start + offset)).await.is_err() {
                    continue 'search;
                }
            }
            return start;
        }
    }

    async fn occupy(start: u16, count: u16) -> Vec<TcpListener> {
        let mut held = Vec::new();
        for offset in 0..count {
            held.push(TcpListener::bind(("127.0.0.1", start + offset)).await.unwrap());
        }
        held
    }

    #[tokio::test]
    async fn single_bind_reports_address() {
        let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = held.local_addr().unwrap().port();

        let err = bind("127.0.0.1", port).await.unwrap_err();
        match err {
            BindError::Io { addr, .. } => assert_eq!(addr, format!("127.0.0.1:{port}")),
            other @ BindError::Exhausted { .. } => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn uses_first_port_when_free() {
        let start = free_port_run(3).await;

        let listener = bind_with_fallback("127.0.0.1", start, 3).await.unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), start);
    }

    #[tokio::test]
    async fn skips_occupied_ports() {
        let start = free_port_run(3).await;
        let _held = occupy(start, 2).await;

        let listener = bind_with_fallback("127.0.0.1", start, 20).await.unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), start + 2);
    }

    #[tokio::test]
    async fn fails_when_every_candidate_is_taken() {
        let start = free_port_run(20).await;
        let _held = occupy(start, 20).await;

        let err = bind_with_fallback("127.0.0.1", start, 20).await.unwrap_err();
        assert!(matches!(err, BindError::Exhausted { start: s, tries: 20 } if s == start));
    }

    #[tokio::test]
    async fn stops_at_top_of_port_range() {
        let held = TcpListener::bind(("127.0.0.1", u16::MAX)).await;

        // Only 65535 itself is a candidate; the search must not wrap.
        match bind_with_fallback("127.0.0.1", u16::MAX, 5).await {
            Ok(listener) => {
                assert!(held.is_err());
                assert_eq!(listener.local_addr().unwrap().port(), u16::MAX);
            }
            Err(err) => assert!(matches!(err, BindError::Exhausted { tries: 1, .. })),
        }
    }

    #[tokio::test]
    async fn exhaustion_counts_only_ports_in_range() {
        let start = u16::MAX - 1;
        let held: Vec<_> = [start, u16::MAX]
            .into_iter()
            .filter_map(|port| std::net::TcpListener::bind(("127.0.0.1", port)).ok())
            .collect();
        if held.len() < 2 {
            // Something else owns one of the top ports; nothing to assert about the count.
            return;
        }

        let err = bind_with_fallback("127.0.0.1", start, 20).await.unwrap_err();
        assert!(matches!(err, BindError::Exhausted { start: s, tries: 2 } if s == start));
        assert!(err.to_string().contains("2 candidate(s)"));
    }

    #[test]
    fn brackets_ipv6_addresses() {
        assert_eq!(format_addr("::", 8080), "[::]:8080");
        assert_eq!(format_addr("[::1]", 8080), "[::1]:8080");
        assert_eq!(format_addr("0.0.0.0", 8080), "0.0.0.0:8080");
    }
}
