//! The low-level transport layer: the [`Socket`] abstraction over the actual
//! byte stream, and the framing [`Connection`] wrapper that turns it into a
//! message stream.
//!
//! [`Socket`]: trait.Socket.html
//! [`Connection`]: struct.Connection.html

mod connection;
mod socket;

pub use connection::{Connection, MAX_OUT_QUEUED};
pub use socket::Socket;
