//! Error types for the conduit RPC mesh.

use thiserror::Error;

/// Errors surfaced to callers and handlers across the RPC core.
///
/// The taxonomy follows the propagation rules of the mesh:
///
/// - Wire errors are fatal to the connection they occurred on; every pending
///   call on that connection fails with a transport-flavoured error.
/// - Resolution and application errors travel back as error envelopes and
///   re-surface on the caller as [`RpcError::Remote`]. They never tear down
///   the connection.
/// - Discovery errors are raised before any network attempt is made.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Wire-level protocol violation (framing or envelope decode failure).
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Argument or result (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Underlying transport I/O failure.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The connection dropped before a reply arrived.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// No reply arrived within the configured call timeout.
    #[error("call timed out")]
    Timeout,

    /// No registered service implements the requested interface.
    #[error("interface not found: {0}")]
    InterfaceNotFound(String),

    /// The interface exists but does not expose the requested method.
    #[error("method not found: {interface}.{method}")]
    MethodNotFound {
        /// Interface the caller addressed.
        interface: String,
        /// Method that is missing on it.
        method: String,
    },

    /// The remote handler failed; carries the textual description it sent.
    #[error("remote call failed: {0}")]
    Remote(String),

    /// Discovery returned no nodes advertising the requested service.
    #[error("no nodes found for service {0}")]
    NoNodesFound(String),

    /// The envelope reached the transport without a destination header.
    #[error("no destination for call to {0}")]
    NoDestination(String),
}

/// Errors produced while encoding or decoding frames and envelopes.
///
/// `FrameTooLarge` and `TrailingBytes` indicate a framing desync and are
/// fatal to the stream; the other variants terminate only the current frame
/// parse.
#[derive(Debug, Error)]
pub enum WireError {
    /// Frame length prefix exceeds the sane maximum.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Claimed frame body size.
        size: usize,
        /// Configured maximum body size.
        max: usize,
    },

    /// The envelope body ended before its own length fields were satisfied.
    #[error("truncated envelope while reading {field}")]
    Truncated {
        /// Field being read when the body ran out.
        field: &'static str,
    },

    /// A string field was not valid UTF-8.
    #[error("invalid UTF-8 in {field}")]
    InvalidUtf8 {
        /// Field that failed validation.
        field: &'static str,
    },

    /// The envelope body carried bytes past its last field.
    #[error("envelope body has {extra} trailing bytes")]
    TrailingBytes {
        /// Number of unconsumed bytes.
        extra: usize,
    },
}

impl WireError {
    /// Whether this error means the byte stream can no longer be trusted.
    ///
    /// A desynced stream must be torn down; a malformed single frame only
    /// fails the call it carried.
    pub fn is_stream_fatal(&self) -> bool {
        matches!(
            self,
            WireError::FrameTooLarge { .. } | WireError::TrailingBytes { .. }
        )
    }
}
