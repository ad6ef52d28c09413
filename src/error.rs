//! Error types raised by the routing core.

/// Errors surfaced by pool construction and request routing.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed pool or server record. Fatal at init and reload.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Hostname resolution failed. Fatal at init, transient during retry.
    #[error("failed to resolve {0}")]
    ResolveFailed(String),

    /// All servers ejected, or the selected server is dead.
    #[error("no server available")]
    NoServerAvailable,

    /// Backend connect could not be initiated.
    #[error("connect failed")]
    ConnectFailed,

    /// Request exceeded the pool timeout.
    #[error("request timed out")]
    Timeout,

    /// Backend connection failed mid-exchange.
    #[error("transport error")]
    TransportError,

    /// The pool is draining or not yet active.
    #[error("pool unavailable")]
    PoolUnavailable,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fault classification reported by the connection layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Non-blocking connect completed with an error.
    Connect,
    /// Read or write failed on an established connection.
    Transport,
}
