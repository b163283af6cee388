//! Transports carrying the protocol envelopes
//!
//! Two interchangeable paths to a device:
//!
//! ```text
//!              ┌─► [http] POST http://{host}/config ─► device
//!  session ────┤
//!              └─► [mqtt] /appliance/{uuid}/subscribe ─► broker ─► device
//!                          ▲ correlated replies + pushes on /publish
//!                          └ [ratelimit] sliding window per identity
//! ```
//!
//! HTTP is one round trip per call. MQTT is publish/subscribe with per
//! messageId correlation and a publish rate limiter shared by every device on
//! the connection. The session layer decides which path is current and when
//! to fall back.

pub mod http;
pub mod mqtt;
pub mod ratelimit;

use std::fmt;

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Which wire a message travelled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Http,
    Mqtt,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Http => f.write_str("http"),
            TransportKind::Mqtt => f.write_str("mqtt"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("response truncated at {size} bytes")]
    Truncated { size: usize },
    #[error("publish rate limit exceeded")]
    RateLimited,
    #[error("device rejected request: {0}")]
    Rejected(String),
    #[error("connection: {0}")]
    Connection(String),
    #[error("no transport available")]
    Unavailable,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("mqtt client: {0}")]
    Mqtt(#[from] rumqttc::ClientError),
}

impl TransportError {
    /// Errors worth retrying on the alternate transport.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout
                | TransportError::RateLimited
                | TransportError::Connection(_)
                | TransportError::Unavailable
                | TransportError::Http(_)
                | TransportError::Mqtt(_)
        )
    }
}
