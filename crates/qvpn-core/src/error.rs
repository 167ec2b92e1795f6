//! Error types for qvpn-core.

use thiserror::Error;

/// Main error type for qvpn operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("config error: {message}")]
    Config { message: String },

    /// Transport layer (QUIC/TLS) error.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// TUN device error.
    #[error("tun error: {message}")]
    Tun { message: String },

    /// CONNECT-IP protocol violation.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Codec error during capsule or datagram encoding/decoding.
    #[error("codec error: {message}")]
    Codec { message: String },

    /// The address pool has no free host address.
    #[error("no address available in pool")]
    NoAddressAvailable,

    /// Peer identity could not be established or was rejected.
    #[error("peer rejected: {message}")]
    PeerRejected { message: String },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Internal invariant violation (route table / pool inconsistency).
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Returns true if this error is peer-local and transient: the offending
    /// connection is closed but the process keeps serving other peers.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. }
                | Error::ConnectionClosed
                | Error::Timeout
                | Error::NoAddressAvailable
                | Error::PeerRejected { .. }
        )
    }

    /// Returns true if this error is fatal at startup (configuration or
    /// transport setup) and the process should exit non-zero.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config { .. } | Error::Tun { .. } | Error::Io(_))
    }

    /// Shorthand for a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    /// Shorthand for a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Error::Codec {
            message: message.into(),
        }
    }

    /// Shorthand for a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
        }
    }
}

/// Convenience result type for qvpn operations.
pub type Result<T> = std::result::Result<T, Error>;
