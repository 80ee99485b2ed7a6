//! Error types for the event socket engine.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// TCP I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame or stream desync. Fatal to the connection: frame
    /// boundaries are unreliable afterwards, so the connection is torn down
    /// rather than resynchronized.
    #[error("protocol error: {message}")]
    ProtocolError { message: String },

    /// A non-blank header line without a `:` separator.
    #[error("malformed header line: {line:?}")]
    InvalidHeader { line: String },

    /// The switch rejected the dial-out auth handshake.
    #[error("authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    /// The connection ended while a command was outstanding, or a command
    /// was issued after teardown began.
    #[error("connection closed")]
    ConnectionClosed,

    /// TCP connect (or handshake read) exceeded the configured timeout.
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// An event observer failed during dispatch. Logged by the router and
    /// never propagated past it.
    #[error("observer failed: {message}")]
    Observer { message: String },

    /// The supervisor was asked to do something its configuration does not
    /// support (e.g. `serve` on a dial-out config).
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl Error {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::ProtocolError {
            message: message.into(),
        }
    }

    pub(crate) fn observer(message: impl Into<String>) -> Self {
        Error::Observer {
            message: message.into(),
        }
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
        }
    }
}
