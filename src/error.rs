//! Error types for the Gearman protocol.

use thiserror::Error;

use crate::packet::PacketType;

/// Errors arising from malformed or unroutable protocol traffic.
///
/// A protocol error is fatal to the connection it occurred on: the
/// connection is reset and every job pending on it fails. The rest of the
/// pool is unaffected.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame did not start with `\0REQ` or `\0RES`
    #[error("bad frame magic {0:02x?}")]
    BadMagic([u8; 4]),

    /// Packet-type code not defined by the protocol
    #[error("unknown packet type code {0}")]
    UnknownType(u32),

    /// Declared frame length exceeds the sanity limit
    #[error("frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Argument section did not split into the number of arguments the
    /// packet type defines
    #[error("{kind:?} carries {expected} arguments, got {got}")]
    ArgumentCount {
        kind: PacketType,
        expected: usize,
        got: usize,
    },

    /// NUL byte in an argument that is not the final one (NUL is the
    /// argument separator)
    #[error("NUL byte inside non-final argument {index} of {kind:?}")]
    EmbeddedNul { kind: PacketType, index: usize },

    /// Argument bytes were not valid for their expected type (UTF-8
    /// handle, decimal counter, ...)
    #[error("malformed argument {index} of {kind:?}")]
    MalformedArgument { kind: PacketType, index: usize },

    /// Response referenced a job handle the registry does not know
    #[error("no job known for handle {handle:?}")]
    UnknownHandle { handle: String },

    /// Two live jobs would share one handle on one connection
    #[error("duplicate job handle {handle:?}")]
    DuplicateHandle { handle: String },

    /// The server sent an ERROR packet
    #[error("server error {code}: {message}")]
    Server { code: String, message: String },

    /// Payload bytes were not valid UTF-8 under a text encoding option
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Errors in the byte transport underneath the protocol.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Dialing the server failed; the connection was never established
    #[error("dial {addr} failed: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// An established connection was lost (reset, EOF, write failure)
    #[error("connection to {addr} lost: {reason}")]
    Lost { addr: String, reason: String },

    /// The connection task has shut down and accepts no more traffic
    #[error("connection closed")]
    Closed,
}

/// Top-level error type for all client and worker operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or unroutable traffic; fatal to one connection
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Transport failure; reconnect happens lazily on next use
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Every configured job server refused the connection
    #[error("no job server available")]
    NoAvailableServer,

    /// The job reached a failure terminal while an acknowledgement was
    /// being awaited
    #[error("job failed: {0}")]
    JobFailed(crate::job::FailureReason),

    /// Invalid configuration rejected at construction
    #[error("configuration error: {0}")]
    Config(String),

    /// The client or worker owning this operation has been closed
    #[error("closed")]
    Closed,

    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenient Result type for protocol operations.
pub type Result<T> = std::result::Result<T, Error>;
