//! This crate implements the connection core of the D-Bus protocol: the
//! long-lived state machine that owns the transport file descriptors, runs the
//! SASL authentication handshake, frames and reassembles messages, correlates
//! method calls with their replies, fires per-call timeouts and routes every
//! inbound message through a filter/match/dispatch pipeline.
//!
//! It deliberately stops there. Typed body (de)serialization is delegated to
//! [`zvariant`], and the object/vtable layer (exporting methods and properties
//! on object paths) plugs into the single [`set_object_handler`] hook. What
//! this crate gives you is a correct, non-blocking [`Connection`] that you can
//! drive from your own event loop, or from the built-in [`MainLoop`] when you
//! don't have one.
//!
//! ### Example
//!
//! ```rust,no_run
//! use rbus::Connection;
//!
//! fn main() -> rbus::Result<()> {
//!     let connection = Connection::new_session()?;
//!
//!     let reply = connection.call_method(
//!         Some("org.freedesktop.DBus"),
//!         "/org/freedesktop/DBus",
//!         Some("org.freedesktop.DBus"),
//!         "GetId",
//!         &(),
//!     )?;
//!     let id: String = reply.body()?;
//!     println!("bus id: {}", id);
//!
//!     Ok(())
//! }
//! ```
//!
//! Non-blocking use follows the usual reactor shape: poll the fd from
//! [`as_raw_fd`] with the event mask from [`events`], wake up no later than
//! [`timeout`], and call [`process`] once per wakeup.
//!
//! [`set_object_handler`]: struct.Connection.html#method.set_object_handler
//! [`as_raw_fd`]: struct.Connection.html#impl-AsRawFd
//! [`events`]: struct.Connection.html#method.events
//! [`timeout`]: struct.Connection.html#method.timeout
//! [`process`]: struct.Connection.html#method.process
//! [`Connection`]: struct.Connection.html
//! [`MainLoop`]: struct.MainLoop.html

mod error;
pub use error::*;

mod address;
pub use address::*;

mod guid;
pub use guid::*;

mod message;
pub use message::*;

mod message_header;
pub use message_header::*;

mod match_rule;
pub use match_rule::*;

mod connection;
pub use connection::*;

mod event;
pub use event::*;

mod owned_fd;
pub use owned_fd::*;

pub mod memfd;

mod utils;

pub mod handshake;

pub mod kernel;

pub mod raw;
