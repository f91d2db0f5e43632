//! WebSocket Tunnel
//!
//! Carries raw TCP connections over WebSocket. The client accepts local TCP connections and
//! dials a fresh WebSocket for each one; the server accepts WebSocket connections and opens a
//! TCP connection to a fixed backend for each one. Payload bytes are never inspected.

pub mod client;
pub mod config;
pub mod dialer;
pub mod error;
pub mod listener;
pub mod netinfo;
pub mod relay;
pub mod resolver;
pub mod server;
pub mod tls;

// Re-export commonly used types and functions
pub use config::{ClientConfig, ModeConfig, ServerConfig, TlsConfig, load_or_create};
pub use dialer::{RetryPolicy, dial, dial_with};
pub use error::{BindError, ConfigError, DialError, RelayError, ResolveError, TlsError};
pub use listener::{bind, bind_with_fallback};
pub use relay::{BUFFER_SIZE, Direction, SessionSummary, Termination};
pub use resolver::CdnResolver;
