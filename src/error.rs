//! Crate-wide error taxonomy.
//!
//! Every component returns [`Error`] so callers embedding this library match
//! on a single enum rather than threading per-module error types through
//! the public surface.

use std::time::Duration;

/// The error kinds produced by this crate.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Hardcoded credentials without `allow_insecure`, or a missing host.
    #[error("config: {0}")]
    Config(String),

    /// Socket I/O, TLS handshake, DNS failure, or HTTP transport failure.
    #[error("transport: {0}")]
    Transport(String),

    /// Malformed length prefix, oversized word, or an unsolicited reply.
    #[error("protocol: {0}")]
    Protocol(String),

    /// Login refused, or an invalid challenge format.
    #[error("auth: {0}")]
    Auth(String),

    /// A `!trap` reply or a non-2xx REST response.
    #[error("router error ({status:?}): {detail}")]
    Router {
        detail: String,
        status: Option<u16>,
    },

    /// Rejected without attempt because the circuit breaker is OPEN.
    #[error("circuit open, retry in {0:?}")]
    CircuitOpen(Duration),

    /// A request or connect deadline was exceeded.
    #[error("timeout")]
    Timeout,

    /// A duplicate was detected but the idempotency recovery query found nothing.
    #[error("idempotency lost for key {0:?}")]
    IdempotencyLost(String),

    /// A pending operation was abandoned because the connection dropped.
    #[error("connection lost")]
    ConnectionLost,
}

impl Error {
    pub fn router(detail: impl Into<String>, status: Option<u16>) -> Self {
        Error::Router {
            detail: detail.into(),
            status,
        }
    }

    fn status(&self) -> Option<u16> {
        match self {
            Error::Router { status, .. } => *status,
            _ => None,
        }
    }

    /// `true` when the request is a candidate for a caller-driven retry.
    ///
    /// Advisory only — the core never retries on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Router { status: Some(s), .. } => matches!(s, 429 | 502 | 503 | 504),
            Error::Timeout | Error::ConnectionLost | Error::CircuitOpen(_) => true,
            _ => false,
        }
    }

    /// Semantic getters over a `Router` error's HTTP status (§4.C). All
    /// `false` for non-`Router`/socket-`!trap` errors (`status` is `None`).
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    pub fn is_auth_error(&self) -> bool {
        self.status() == Some(401)
    }

    pub fn is_permission_error(&self) -> bool {
        self.status() == Some(403)
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status() == Some(429)
    }

    /// `status = 400` and the detail text names an existing entry. A
    /// `!trap` reply (socket transport, `status = None`) is classified the
    /// same way by testing `message.contains(...)` directly rather than a
    /// status code — RouterOS traps don't carry HTTP statuses.
    pub fn is_duplicate(&self) -> bool {
        match self {
            Error::Router { status: Some(400), detail } => {
                detail.contains("already exists") || detail.contains("already have")
            }
            Error::Router { status: None, detail } => {
                detail.contains("already exists") || detail.contains("already have")
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
