use std::{error, fmt, io, result};

use crate::Message;

/// Error names defined by the D-Bus specification that this crate puts on the
/// wire itself.
pub mod name {
    pub const NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
    pub const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
}

/// The error type for `rbus`.
///
/// The various errors that can be reported by this crate.
#[derive(Debug)]
pub enum Error {
    /// Malformed D-Bus address string.
    Address(String),
    /// Invalid or contradictory connection configuration.
    Configuration(String),
    /// I/O error on the underlying transport.
    Io(io::Error),
    /// Message (de)serialization error from the marshaller.
    Variant(zvariant::Error),
    /// The SASL handshake with the peer failed.
    Handshake(String),
    /// The peer violated the wire protocol; the connection is closed.
    Protocol(String),
    /// A header field had an unexpected value type.
    InvalidField,
    /// A reply message did not have the expected shape.
    InvalidReply,
    /// The operation is not supported by the negotiated connection (e.g. fd
    /// passing without the `unix-fd` capability).
    Unsupported,
    /// The outgoing message queue is full; retry after flushing.
    QueueFull,
    /// The connection is not (or no longer) usable.
    NotConnected,
    /// Re-entrant dispatch: `process` or `call` invoked from a callback.
    Busy,
    /// A synchronous method call hit its deadline.
    Timeout,
    /// The connection was inherited across `fork()` and may not be used from
    /// the child process.
    ChildProcess,
    /// The peer answered a method call with a D-Bus error: error name, the
    /// optional human-readable text from the body, and the full reply.
    MethodError(String, Option<String>, Message),
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Variant(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Address(e) => write!(f, "address error: {}", e),
            Error::Configuration(e) => write!(f, "configuration error: {}", e),
            Error::Io(e) => e.fmt(f),
            Error::Variant(e) => write!(f, "variant error: {}", e),
            Error::Handshake(e) => write!(f, "handshake failed: {}", e),
            Error::Protocol(e) => write!(f, "protocol violation: {}", e),
            Error::InvalidField => write!(f, "invalid message field"),
            Error::InvalidReply => write!(f, "invalid reply"),
            Error::Unsupported => write!(f, "operation not supported"),
            Error::QueueFull => write!(f, "outgoing message queue is full"),
            Error::NotConnected => write!(f, "not connected"),
            Error::Busy => write!(f, "connection is being processed"),
            Error::Timeout => write!(f, "method call timed out"),
            Error::ChildProcess => write!(f, "connection inherited across fork"),
            Error::MethodError(name, detail, _) => write!(
                f,
                "{}: {}",
                name,
                detail.as_ref().map(|s| s.as_str()).unwrap_or("no details")
            ),
        }
    }
}

impl From<io::Error> for Error {
    fn from(val: io::Error) -> Self {
        Error::Io(val)
    }
}

impl From<zvariant::Error> for Error {
    fn from(val: zvariant::Error) -> Self {
        Error::Variant(val)
    }
}

impl From<nix::Error> for Error {
    fn from(val: nix::Error) -> Self {
        let io = val
            .as_errno()
            .map(|e| io::Error::from_raw_os_error(e as i32))
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, val.to_string()));
        Error::Io(io)
    }
}

// A `MethodError` message is an error in itself.
impl From<Message> for Error {
    fn from(message: Message) -> Error {
        let (name, detail) = match message.header() {
            Ok(header) => (
                header
                    .error_name()
                    .ok()
                    .and_then(|name| name.map(String::from))
                    .unwrap_or_else(|| String::from("unspecified")),
                message.body::<String>().ok(),
            ),
            Err(_) => (String::from("unspecified"), None),
        };

        Error::MethodError(name, detail, message)
    }
}

/// Alias for a `Result` with the error type `rbus::Error`.
pub type Result<T> = result::Result<T, Error>;

impl Error {
    /// Whether this error is a transient would-block condition rather than a
    /// failure.
    pub fn would_block(&self) -> bool {
        match self {
            Error::Io(e) => e.kind() == io::ErrorKind::WouldBlock,
            _ => false,
        }
    }
}
