use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::{Duration, Instant};

use enumflags2::BitFlags;
use nix::poll::PollFlags;
use once_cell::unsync::OnceCell;
use tracing::{debug, trace, warn};

use crate::handshake::{Authenticated, ClientHandshake, ServerHandshake};
use crate::kernel;
use crate::raw::{Connection as RawConnection, Socket, MAX_OUT_QUEUED};
use crate::utils::{poll_timeout, wait_on};
use crate::{
    name, Address, Error, Guid, MatchRule, Message, MessageFlags, MessageType, OwnedFd, Result,
    Transport, PROTOCOL_VERSION,
};

/// The default deadline for method calls (and for the authentication
/// handshake).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(25);

const MAX_IN_QUEUED: usize = 128;

const SYSTEM_BUS_DEFAULT: &str = "unix:path=/run/dbus/system_bus_socket";

/// Callback invoked for inbound messages by the filter and match chains and
/// by the object-dispatch hook. Returning `Ok(true)` consumes the message.
pub type MessageHandler = Box<dyn FnMut(&Connection, &Message) -> Result<bool>>;

/// One-shot callback invoked with the reply to a method call registered via
/// [`Connection::send_with_reply`], or with the synthetic
/// `org.freedesktop.DBus.Error.NoReply` error if the call timed out.
///
/// [`Connection::send_with_reply`]: struct.Connection.html#method.send_with_reply
pub type ReplyHandler = Box<dyn FnOnce(&Connection, &Message)>;

/// Deadline selection for a method call.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Timeout {
    /// The connection default (25 s).
    Default,
    /// No deadline; wait forever.
    Infinite,
    /// A specific deadline, relative to now.
    After(Duration),
}

impl Timeout {
    fn deadline(self) -> Option<Instant> {
        match self {
            Timeout::Default => Some(Instant::now() + DEFAULT_TIMEOUT),
            Timeout::Infinite => None,
            Timeout::After(d) => Some(Instant::now() + d),
        }
    }
}

/// The lifecycle of a connection.
///
/// A connection is configured on a [`ConnectionBuilder`] and starts life in
/// `Opening`; `process` drives it forward from there. Every state except
/// `Closed` counts as open. A closed connection stays closed.
///
/// [`ConnectionBuilder`]: struct.ConnectionBuilder.html
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// The transport is being connected (or spawned).
    Opening,
    /// The SASL handshake is in progress.
    Authenticating,
    /// The HELLO call is in flight; its reply must be the next message.
    Hello,
    /// Fully established; messages flow.
    Running,
    /// Terminally shut down.
    Closed,
}

/// Identifies a registered filter, for removal.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FilterId(u64);

/// Identifies a registered match, for removal.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MatchId(u64);

struct FilterRecord {
    id: u64,
    last_iteration: u64,
    // Taken out of the slot while the callback runs.
    callback: Option<MessageHandler>,
}

struct MatchRecord {
    id: u64,
    rule: MatchRule,
    last_iteration: u64,
    callback: Option<MessageHandler>,
}

struct PendingReply {
    callback: Option<ReplyHandler>,
    deadline: Option<Instant>,
}

enum Endpoint {
    /// Non-blocking connect in flight.
    Connecting { fd: OwnedFd, tcp: bool },
    ClientAuth(ClientHandshake<Box<dyn Socket>>),
    ServerAuth(ServerHandshake<Box<dyn Socket>>),
    Stream(RawConnection<Box<dyn Socket>>),
    Kernel(kernel::Connection),
    Closed,
}

#[derive(derivative::Derivative)]
#[derivative(Debug)]
struct ConnectionInner {
    state: Cell<ConnectionState>,
    #[derivative(Debug = "ignore")]
    endpoint: RefCell<Endpoint>,

    bus_client: bool,
    server_mode: bool,
    accepts_fds: bool,
    expected_guid: Option<Guid>,

    server_guid: RefCell<Option<Guid>>,
    cap_unix_fd: Cell<bool>,
    attach_flags: Cell<BitFlags<kernel::AttachFlags>>,
    unique_name: OnceCell<String>,

    // Serial number for the next outgoing message.
    serial: Cell<u32>,
    hello_serial: Cell<Option<u32>>,

    // Owning process, for fork detection.
    pid: Cell<nix::unistd::Pid>,

    // Messages sealed before authentication finished.
    pre_queue: RefCell<VecDeque<Message>>,
    // Queue of incoming messages not yet dispatched.
    incoming_queue: RefCell<VecDeque<Message>>,

    // Pending method replies by serial, cross-linked with the deadline set.
    #[derivative(Debug = "ignore")]
    replies: RefCell<HashMap<u32, PendingReply>>,
    deadlines: RefCell<BTreeSet<(Instant, u32)>>,
    auth_deadline: Cell<Option<Instant>>,

    #[derivative(Debug = "ignore")]
    filters: RefCell<Vec<FilterRecord>>,
    filters_generation: Cell<u64>,
    #[derivative(Debug = "ignore")]
    matches: RefCell<Vec<MatchRecord>>,
    matches_generation: Cell<u64>,
    next_handler_id: Cell<u64>,
    // Dispatch pass counter, stamped into records so each callback sees a
    // given message at most once even when the list mutates under it.
    iteration: Cell<u64>,

    in_process: Cell<bool>,
    #[derivative(Debug = "ignore")]
    object_handler: RefCell<Option<MessageHandler>>,
}

/// A D-Bus connection.
///
/// A connection to a message bus (or a direct peer), over a stream socket, a
/// spawned command, or the kernel transport. Configure one on a
/// [`ConnectionBuilder`], or use the factories ([`new_system`],
/// [`new_session`], [`new_for_address`]) which block until the connection is
/// established.
///
/// `Connection` implements [`Clone`]: cloning is cheap and shares the
/// underlying connection state. Sharing across threads is not supported; a
/// connection belongs to the thread (and the event loop) that drives it.
///
/// Inbound traffic is dispatched by calling [`process`], which consumes at
/// most one message per call and routes it through, in order: reply
/// correlation, the filter chain, the match chain, the built-in
/// `org.freedesktop.DBus.Peer` interface, and the object-dispatch hook.
/// Unclaimed method calls are answered with an `UnknownObject` error
/// automatically.
///
/// [`ConnectionBuilder`]: struct.ConnectionBuilder.html
/// [`new_system`]: struct.Connection.html#method.new_system
/// [`new_session`]: struct.Connection.html#method.new_session
/// [`new_for_address`]: struct.Connection.html#method.new_for_address
/// [`process`]: struct.Connection.html#method.process
/// [`Clone`]: https://doc.rust-lang.org/std/clone/trait.Clone.html
#[derive(Debug, Clone)]
pub struct Connection(Rc<ConnectionInner>);

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        match &*self.0.endpoint.borrow() {
            Endpoint::Connecting { fd, .. } => fd.as_raw_fd(),
            Endpoint::ClientAuth(h) => h.socket().as_raw_fd(),
            Endpoint::ServerAuth(h) => h.socket().as_raw_fd(),
            Endpoint::Stream(c) => c.socket().as_raw_fd(),
            Endpoint::Kernel(k) => k.as_raw_fd(),
            Endpoint::Closed => -1,
        }
    }
}

impl Connection {
    /// Create a `Connection` to the system-wide message bus.
    ///
    /// `DBUS_SYSTEM_BUS_ADDRESS` overrides the well-known socket path.
    pub fn new_system() -> Result<Self> {
        let address = std::env::var("DBUS_SYSTEM_BUS_ADDRESS")
            .unwrap_or_else(|_| SYSTEM_BUS_DEFAULT.to_string());
        Self::new_for_address(&address, true)
    }

    /// Create a `Connection` to the session/user message bus.
    ///
    /// `DBUS_SESSION_BUS_ADDRESS` overrides the default of
    /// `$XDG_RUNTIME_DIR/bus`.
    pub fn new_session() -> Result<Self> {
        let address = match std::env::var("DBUS_SESSION_BUS_ADDRESS") {
            Ok(address) => address,
            Err(_) => {
                let runtime_dir = std::env::var("XDG_RUNTIME_DIR").map_err(|_| {
                    Error::Address("neither DBUS_SESSION_BUS_ADDRESS nor XDG_RUNTIME_DIR set".into())
                })?;
                format!("unix:path={}/bus", runtime_dir)
            }
        };
        Self::new_for_address(&address, true)
    }

    /// Create a `Connection` for the given [D-Bus address].
    ///
    /// [D-Bus address]: https://dbus.freedesktop.org/doc/dbus-specification.html#addresses
    pub fn new_for_address(address: &str, bus_connection: bool) -> Result<Self> {
        let mut builder = ConnectionBuilder::new().address(address)?;
        if bus_connection {
            builder = builder.bus_client();
        }
        builder.build()
    }

    /// Create a `Connection` to the system bus of a remote host, over an ssh
    /// pipe to its stdio bridge.
    pub fn new_system_remote(host: &str) -> Result<Self> {
        ConnectionBuilder::new()
            .addresses(vec![exec_address(
                "ssh",
                &["ssh", "-xT", host, "systemd-stdio-bridge"],
            )])
            .bus_client()
            .build()
    }

    /// Create a `Connection` to the system bus inside a local container.
    pub fn new_system_machine(machine: &str) -> Result<Self> {
        ConnectionBuilder::new()
            .addresses(vec![Address::parse(&format!(
                "x-container:machine={}",
                machine
            ))?
            .remove(0)])
            .bus_client()
            .build()
    }

    /// Create and open a D-Bus connection from a `UnixStream`.
    ///
    /// The connection may either be set up for a *bus* connection, or not
    /// (for peer-to-peer communications).
    pub fn new_unix_client(stream: UnixStream, bus_connection: bool) -> Result<Self> {
        let mut builder = ConnectionBuilder::new().unix_stream(stream);
        if bus_connection {
            builder = builder.bus_client();
        }
        builder.build()
    }

    /// Create a server `Connection` for the given `UnixStream` and the server
    /// `guid`.
    ///
    /// The connection will wait for an incoming client authentication
    /// handshake, for peer-to-peer communications.
    pub fn new_unix_server(stream: UnixStream, guid: &Guid) -> Result<Self> {
        ConnectionBuilder::new()
            .unix_stream(stream)
            .server(guid)
            .build()
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.0.state.get()
    }

    /// The server's GUID, once authentication has learned it.
    pub fn server_guid(&self) -> Option<Guid> {
        self.0.server_guid.borrow().clone()
    }

    /// The unique name as assigned by the message bus, or `None` if this is
    /// not a message bus connection (or HELLO has not completed yet).
    pub fn unique_name(&self) -> Option<&str> {
        self.0.unique_name.get().map(|s| s.as_str())
    }

    /// Whether this is a connection to a message bus, as opposed to a direct
    /// peer.
    pub fn is_bus(&self) -> bool {
        self.0.bus_client
    }

    /// Whether file descriptors can travel over this connection: negotiation
    /// was requested *and* the peer confirmed the capability.
    pub fn can_pass_fds(&self) -> bool {
        self.0.cap_unix_fd.get()
    }

    /// The metadata the kernel transport attaches to delivered messages.
    /// Always empty for stream transports.
    pub fn attach_flags(&self) -> BitFlags<kernel::AttachFlags> {
        self.0.attach_flags.get()
    }

    /// Send `msg` to the peer.
    ///
    /// The connection seals the message with the next serial number, then
    /// either writes it out right away or leaves it in the outgoing queue; a
    /// later `process` or [`flush`] completes the write. The assigned serial
    /// is returned.
    ///
    /// [`flush`]: struct.Connection.html#method.flush
    pub fn send_message(&self, msg: Message) -> Result<u32> {
        self.send_internal(msg, true)
    }

    /// Send a method call for which no reply is wanted.
    ///
    /// Sets `NoReplyExpected` on the header before sealing, permitting the
    /// peer to not answer at all.
    pub fn send_message_no_reply(&self, msg: Message) -> Result<()> {
        self.send_internal(msg, false).map(|_| ())
    }

    /// Send a method call and register `callback` for its reply.
    ///
    /// The pending-reply record is registered before the message goes out, so
    /// the reply cannot race past it. If no reply arrives before the
    /// deadline, the callback is instead invoked with a synthetic
    /// `org.freedesktop.DBus.Error.NoReply` error message during a later
    /// [`process`] call.
    ///
    /// [`process`]: struct.Connection.html#method.process
    pub fn send_with_reply<F>(&self, msg: Message, timeout: Timeout, callback: F) -> Result<u32>
    where
        F: FnOnce(&Connection, &Message) + 'static,
    {
        self.check_pid()?;
        {
            let header = msg.header()?;
            if header.message_type()? != MessageType::MethodCall {
                return Err(Error::Unsupported);
            }
            if header.flags().contains(MessageFlags::NoReplyExpected) {
                return Err(Error::Unsupported);
            }
        }

        // The serial the send below will assign; serials are monotonic so a
        // duplicate entry is impossible.
        let serial = self.0.serial.get();
        let deadline = timeout.deadline();
        self.0.replies.borrow_mut().insert(
            serial,
            PendingReply {
                callback: Some(Box::new(callback)),
                deadline,
            },
        );
        if let Some(deadline) = deadline {
            self.0.deadlines.borrow_mut().insert((deadline, serial));
        }

        match self.send_internal(msg, true) {
            Ok(sent) => {
                debug_assert_eq!(sent, serial);
                Ok(sent)
            }
            Err(e) => {
                // Roll the record back; the call never went out.
                self.0.replies.borrow_mut().remove(&serial);
                if let Some(deadline) = deadline {
                    self.0.deadlines.borrow_mut().remove(&(deadline, serial));
                }
                Err(e)
            }
        }
    }

    /// Cancel a pending reply registered with [`send_with_reply`].
    ///
    /// Returns whether a record existed. A reply that arrives after
    /// cancellation is silently discarded.
    ///
    /// [`send_with_reply`]: struct.Connection.html#method.send_with_reply
    pub fn send_with_reply_cancel(&self, serial: u32) -> bool {
        self.take_pending(serial).is_some()
    }

    /// Send a method call and block until its reply arrives.
    ///
    /// While waiting, unrelated inbound messages are moved to the receive
    /// queue in arrival order, to be dispatched by later [`process`] calls;
    /// no filters or matches run from here. The outgoing queue is flushed as
    /// a side effect.
    ///
    /// A D-Bus error reply is converted to [`Error::MethodError`]; deadline
    /// expiry to [`Error::Timeout`]. Must not be called from a dispatch
    /// callback.
    ///
    /// [`process`]: struct.Connection.html#method.process
    /// [`Error::MethodError`]: enum.Error.html#variant.MethodError
    /// [`Error::Timeout`]: enum.Error.html#variant.Timeout
    pub fn call(&self, msg: Message, timeout: Timeout) -> Result<Message> {
        self.check_pid()?;
        if self.0.in_process.get() {
            return Err(Error::Busy);
        }
        let strong = self.clone();
        let deadline = timeout.deadline();

        // Drive the connection the rest of the way up first, if needed.
        while strong.state() != ConnectionState::Running {
            if strong.state() == ConnectionState::Closed {
                return Err(Error::NotConnected);
            }
            if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                return Err(Error::Timeout);
            }
            strong.wait_until(deadline)?;
            strong.process()?;
        }

        {
            let header = msg.header()?;
            if header.message_type()? != MessageType::MethodCall {
                return Err(Error::Unsupported);
            }
            if header.flags().contains(MessageFlags::NoReplyExpected) {
                return Err(Error::Unsupported);
            }
        }
        let serial = strong.send_internal(msg, true)?;

        let mut tmp_queue: VecDeque<Message> = VecDeque::new();
        loop {
            strong.try_flush_outgoing()?;

            let received = {
                let mut endpoint = strong.0.endpoint.borrow_mut();
                match &mut *endpoint {
                    Endpoint::Stream(c) => c.try_receive_message(),
                    Endpoint::Kernel(k) => k.try_receive_message(),
                    _ => return Err(Error::NotConnected),
                }
            };
            let m = match received {
                Ok(m) => m,
                Err(e) if e.would_block() => {
                    if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                        strong.requeue(tmp_queue);
                        return Err(Error::Timeout);
                    }
                    strong.wait_for_io(deadline)?;
                    continue;
                }
                Err(e) => {
                    strong.force_close();
                    return Err(e);
                }
            };

            let is_ours = m.header()?.is_reply_to(serial)?;
            if is_ours {
                // Hand the bystanders to the receive queue first, preserving
                // their arrival order.
                strong.requeue(tmp_queue);
                return match m.message_type()? {
                    MessageType::MethodReturn => Ok(m),
                    MessageType::Error => Err(m.into()),
                    _ => Err(Error::InvalidReply),
                };
            }

            // We first push to a temporary queue as otherwise we could pick
            // the same message up again from the main queue.
            if strong.0.incoming_queue.borrow().len() + tmp_queue.len() < MAX_IN_QUEUED {
                tmp_queue.push_back(m);
            } else {
                warn!("dropping incoming message: receive queue is full");
            }
        }
    }

    /// Send a method call.
    ///
    /// Create a method-call message, send it over the connection, then wait
    /// for the reply (with the default timeout). Incoming messages observed
    /// meanwhile are queued for later dispatch.
    ///
    /// On successful reply, an `Ok(Message)` is returned. D-Bus error replies
    /// are returned as [`MethodError`].
    ///
    /// [`MethodError`]: enum.Error.html#variant.MethodError
    pub fn call_method<B>(
        &self,
        destination: Option<&str>,
        path: &str,
        iface: Option<&str>,
        method_name: &str,
        body: &B,
    ) -> Result<Message>
    where
        B: serde::ser::Serialize + zvariant::Type,
    {
        let m = Message::method(
            self.unique_name(),
            destination,
            path,
            iface,
            method_name,
            body,
        )?;

        self.call(m, Timeout::Default)
    }

    /// Emit a signal.
    ///
    /// Create a signal message, and send it over the connection.
    pub fn emit_signal<B>(
        &self,
        destination: Option<&str>,
        path: &str,
        iface: &str,
        signal_name: &str,
        body: &B,
    ) -> Result<()>
    where
        B: serde::ser::Serialize + zvariant::Type,
    {
        let m = Message::signal(
            self.unique_name(),
            destination,
            path,
            iface,
            signal_name,
            body,
        )?;

        self.send_message(m)?;

        Ok(())
    }

    /// Reply to a message.
    ///
    /// Given an existing message (likely a method call), send a reply back to
    /// the caller with the given `body`.
    ///
    /// Returns the message serial number.
    pub fn reply<B>(&self, call: &Message, body: &B) -> Result<u32>
    where
        B: serde::ser::Serialize + zvariant::Type,
    {
        let m = Message::method_reply(self.unique_name(), call, body)?;
        self.send_message(m)
    }

    /// Reply an error to a message.
    ///
    /// Given an existing message (likely a method call), send an error reply
    /// back to the caller with the given `error_name` and `body`.
    ///
    /// Returns the message serial number.
    pub fn reply_error<B>(&self, call: &Message, error_name: &str, body: &B) -> Result<u32>
    where
        B: serde::ser::Serialize + zvariant::Type,
    {
        let m = Message::method_error(self.unique_name(), call, error_name, body)?;
        self.send_message(m)
    }

    /// Register a filter callback, invoked for every inbound message.
    ///
    /// Filters run before matches and the object layer; a filter returning
    /// `Ok(true)` consumes the message. Returns an id for [`remove_filter`].
    ///
    /// [`remove_filter`]: struct.Connection.html#method.remove_filter
    pub fn add_filter<F>(&self, callback: F) -> FilterId
    where
        F: FnMut(&Connection, &Message) -> Result<bool> + 'static,
    {
        let id = self.next_handler_id();
        self.0.filters.borrow_mut().push(FilterRecord {
            id,
            last_iteration: 0,
            callback: Some(Box::new(callback)),
        });
        self.bump_generation(&self.0.filters_generation);
        FilterId(id)
    }

    /// Remove a filter. Safe to call from within the filter itself.
    pub fn remove_filter(&self, id: FilterId) -> bool {
        let mut filters = self.0.filters.borrow_mut();
        let before = filters.len();
        filters.retain(|f| f.id != id.0);
        let removed = filters.len() != before;
        drop(filters);
        if removed {
            self.bump_generation(&self.0.filters_generation);
        }
        removed
    }

    /// Register a callback for inbound messages matching `rule`.
    ///
    /// Note that on a bus connection, this only configures local delivery;
    /// subscribing with the broker (`AddMatch`) is the caller's business.
    pub fn add_match<F>(&self, rule: MatchRule, callback: F) -> MatchId
    where
        F: FnMut(&Connection, &Message) -> Result<bool> + 'static,
    {
        let id = self.next_handler_id();
        self.0.matches.borrow_mut().push(MatchRecord {
            id,
            rule,
            last_iteration: 0,
            callback: Some(Box::new(callback)),
        });
        self.bump_generation(&self.0.matches_generation);
        MatchId(id)
    }

    /// Remove a match. Safe to call from within the match callback itself.
    pub fn remove_match(&self, id: MatchId) -> bool {
        let mut matches = self.0.matches.borrow_mut();
        let before = matches.len();
        matches.retain(|m| m.id != id.0);
        let removed = matches.len() != before;
        drop(matches);
        if removed {
            self.bump_generation(&self.0.matches_generation);
        }
        removed
    }

    /// Install the object-dispatch hook, the last stop of the pipeline before
    /// the automatic `UnknownObject` reply.
    pub fn set_object_handler(&self, handler: MessageHandler) {
        self.0.object_handler.borrow_mut().replace(handler);
    }

    /// Remove the object-dispatch hook.
    pub fn reset_object_handler(&self) {
        self.0.object_handler.borrow_mut().take();
    }

    /// Drive the connection forward.
    ///
    /// Depending on the state this advances the connect/authentication
    /// handshake, or runs the dispatch pipeline over at most one inbound
    /// message. Returns whether any progress was made; `Ok(false)` means
    /// there is nothing to do until the fd is ready again (see [`events`] and
    /// [`timeout`]).
    ///
    /// Re-entrant calls (from inside a dispatch callback) fail with
    /// [`Error::Busy`].
    ///
    /// [`events`]: struct.Connection.html#method.events
    /// [`timeout`]: struct.Connection.html#method.timeout
    /// [`Error::Busy`]: enum.Error.html#variant.Busy
    pub fn process(&self) -> Result<bool> {
        self.check_pid()?;
        // A local strong reference keeps the connection alive while its own
        // callbacks run, even if they drop every other handle.
        let strong = self.clone();
        if strong.0.in_process.replace(true) {
            return Err(Error::Busy);
        }
        let _guard = ProcessGuard(&strong.0.in_process);

        match strong.state() {
            ConnectionState::Closed => Err(Error::NotConnected),
            ConnectionState::Opening => strong.drive_connect(),
            ConnectionState::Authenticating => strong.drive_auth(),
            ConnectionState::Hello | ConnectionState::Running => strong.dispatch_one(),
        }
    }

    /// Block until the connection has something to process, or `limit`
    /// elapses. Returns whether the fd became ready.
    pub fn wait(&self, limit: Option<Duration>) -> Result<bool> {
        self.check_pid()?;
        if self.state() == ConnectionState::Closed {
            return Err(Error::NotConnected);
        }
        if !self.0.incoming_queue.borrow().is_empty() {
            return Ok(true);
        }

        let now = Instant::now();
        let until_deadline = self.timeout().map(|d| d.saturating_duration_since(now));
        let effective = match (limit, until_deadline) {
            (Some(a), Some(b)) => Some(std::cmp::min(a, b)),
            (a, b) => a.or(b),
        };

        poll_timeout(self.as_raw_fd(), self.events(), effective)
    }

    /// Write out the outgoing queue completely, blocking on the fd as needed.
    ///
    /// A no-op (returning success) when nothing is queued.
    pub fn flush(&self) -> Result<()> {
        self.check_pid()?;
        if self.state() == ConnectionState::Closed {
            return Err(Error::NotConnected);
        }

        loop {
            let res = {
                let mut endpoint = self.0.endpoint.borrow_mut();
                match &mut *endpoint {
                    Endpoint::Stream(c) => c.try_flush(),
                    // Kernel sends are synchronous; nothing ever queues. The
                    // pre-authentication queue drains when auth completes.
                    _ => return Ok(()),
                }
            };
            match res {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wait_on(self.as_raw_fd(), PollFlags::POLLOUT)?;
                }
                Err(e) => {
                    self.force_close();
                    return Err(e.into());
                }
            }
        }
    }

    /// The poll events the connection currently cares about.
    pub fn events(&self) -> PollFlags {
        match self.state() {
            ConnectionState::Opening => PollFlags::POLLOUT,
            ConnectionState::Authenticating => {
                let mut flags = PollFlags::POLLIN;
                if self.auth_needs_write() {
                    flags |= PollFlags::POLLOUT;
                }
                flags
            }
            ConnectionState::Hello | ConnectionState::Running => {
                let mut flags = PollFlags::empty();
                if self.0.incoming_queue.borrow().is_empty() {
                    flags |= PollFlags::POLLIN;
                }
                if self.has_outgoing() {
                    flags |= PollFlags::POLLOUT;
                }
                flags
            }
            ConnectionState::Closed => PollFlags::empty(),
        }
    }

    /// The next instant by which [`process`] wants to be called regardless of
    /// fd readiness, or `None` for no deadline.
    ///
    /// [`process`]: struct.Connection.html#method.process
    pub fn timeout(&self) -> Option<Instant> {
        match self.state() {
            ConnectionState::Hello | ConnectionState::Running => {
                if !self.0.incoming_queue.borrow().is_empty() {
                    // Dispatchable right now.
                    return Some(Instant::now());
                }
                self.0
                    .deadlines
                    .borrow()
                    .iter()
                    .next()
                    .map(|&(deadline, _)| deadline)
            }
            ConnectionState::Authenticating => self.0.auth_deadline.get(),
            _ => None,
        }
    }

    /// Close the connection.
    ///
    /// Pending replies are dropped without their callbacks being invoked;
    /// stream fds close immediately. (The kernel transport fd lives on until
    /// the last pool-borrowed message is dropped.) Every later operation
    /// fails with [`Error::NotConnected`].
    ///
    /// [`Error::NotConnected`]: enum.Error.html#variant.NotConnected
    pub fn close(&self) -> Result<()> {
        self.check_pid()?;
        self.force_close();
        Ok(())
    }

    //
    // State machine internals.
    //

    fn drive_connect(&self) -> Result<bool> {
        let needs_convert = {
            let mut endpoint = self.0.endpoint.borrow_mut();
            match &mut *endpoint {
                Endpoint::Connecting { fd, .. } => {
                    if !poll_timeout(fd.as_raw_fd(), PollFlags::POLLOUT, Some(Duration::new(0, 0)))?
                    {
                        return Ok(false);
                    }
                    let mut so_err: i32 = 0;
                    let mut len = std::mem::size_of::<i32>() as nix::libc::socklen_t;
                    let rc = unsafe {
                        nix::libc::getsockopt(
                            fd.as_raw_fd(),
                            nix::libc::SOL_SOCKET,
                            nix::libc::SO_ERROR,
                            &mut so_err as *mut i32 as *mut nix::libc::c_void,
                            &mut len,
                        )
                    };
                    if rc != 0 {
                        drop(endpoint);
                        self.force_close();
                        return Err(Error::Io(io::Error::last_os_error()));
                    }
                    if so_err != 0 {
                        drop(endpoint);
                        self.force_close();
                        return Err(Error::Io(io::Error::from_raw_os_error(so_err)));
                    }
                    true
                }
                _ => false,
            }
        };

        if needs_convert {
            let endpoint = self.0.endpoint.replace(Endpoint::Closed);
            if let Endpoint::Connecting { fd, tcp } = endpoint {
                let socket: Box<dyn Socket> = if tcp {
                    Box::new(unsafe { TcpStream::from_raw_fd(fd.into_raw_fd()) })
                } else {
                    Box::new(unsafe { UnixStream::from_raw_fd(fd.into_raw_fd()) })
                };
                let handshake = ClientHandshake::new_with(socket, false, self.0.accepts_fds);
                *self.0.endpoint.borrow_mut() = Endpoint::ClientAuth(handshake);
            }
        }

        trace!("transport connected, starting authentication");
        self.0.state.set(ConnectionState::Authenticating);
        self.0
            .auth_deadline
            .set(Some(Instant::now() + DEFAULT_TIMEOUT));
        Ok(true)
    }

    fn drive_auth(&self) -> Result<bool> {
        let done = {
            let mut endpoint = self.0.endpoint.borrow_mut();
            match &mut *endpoint {
                Endpoint::ClientAuth(h) => match h.advance_handshake() {
                    Ok(()) => true,
                    Err(e) if e.would_block() => false,
                    Err(e) => {
                        drop(endpoint);
                        self.force_close();
                        return Err(e);
                    }
                },
                Endpoint::ServerAuth(h) => match h.advance_handshake() {
                    Ok(()) => true,
                    Err(e) if e.would_block() => false,
                    Err(e) => {
                        drop(endpoint);
                        self.force_close();
                        return Err(e);
                    }
                },
                Endpoint::Kernel(_) => true,
                _ => {
                    drop(endpoint);
                    self.force_close();
                    return Err(Error::Protocol("no transport while authenticating".into()));
                }
            }
        };

        if !done {
            if let Some(deadline) = self.0.auth_deadline.get() {
                if Instant::now() >= deadline {
                    self.force_close();
                    return Err(Error::Handshake("authentication timed out".into()));
                }
            }
            return Ok(false);
        }

        let endpoint = self.0.endpoint.replace(Endpoint::Closed);
        match endpoint {
            Endpoint::ClientAuth(h) => {
                let auth = h
                    .try_finish()
                    .map_err(|_| Error::Handshake("handshake not done".into()))?;
                self.finish_stream_auth(auth)?;
            }
            Endpoint::ServerAuth(h) => {
                let auth = h
                    .try_finish()
                    .map_err(|_| Error::Handshake("handshake not done".into()))?;
                self.finish_stream_auth(auth)?;
            }
            Endpoint::Kernel(k) => {
                self.0.cap_unix_fd.set(k.can_pass_fds() && self.0.accepts_fds);
                self.0.attach_flags.set(k.attach_flags());
                let _ = self.0.unique_name.set(k.unique_name());
                *self.0.endpoint.borrow_mut() = Endpoint::Kernel(k);
                self.0.auth_deadline.set(None);
                self.0.state.set(ConnectionState::Running);
                debug!("kernel transport attached, connection running");
            }
            _ => unreachable!("checked above"),
        }

        Ok(true)
    }

    fn finish_stream_auth(&self, auth: Authenticated<Box<dyn Socket>>) -> Result<()> {
        if let Some(expected) = &self.0.expected_guid {
            if *expected != auth.server_guid {
                self.force_close();
                return Err(Error::Handshake(format!(
                    "server GUID mismatch: expected {}, got {}",
                    expected, auth.server_guid
                )));
            }
        }
        self.0
            .server_guid
            .borrow_mut()
            .replace(auth.server_guid.clone());
        self.0
            .cap_unix_fd
            .set(auth.cap_unix_fd && self.0.accepts_fds);
        *self.0.endpoint.borrow_mut() = Endpoint::Stream(auth.conn);
        self.0.auth_deadline.set(None);
        debug!(
            "authenticated, server GUID {}, cap_unix_fd {}",
            auth.server_guid, auth.cap_unix_fd
        );

        if self.0.bus_client {
            // The HELLO must hit the wire before anything queued earlier.
            self.0.state.set(ConnectionState::Hello);
            let hello = Message::method(
                None,
                Some("org.freedesktop.DBus"),
                "/org/freedesktop/DBus",
                Some("org.freedesktop.DBus"),
                "Hello",
                &(),
            )?;
            let serial = self.send_internal(hello, true)?;
            self.0.hello_serial.set(Some(serial));
        } else {
            self.0.state.set(ConnectionState::Running);
        }

        // Anything sealed before authentication finished goes out now.
        let pre: Vec<Message> = self.0.pre_queue.borrow_mut().drain(..).collect();
        if !pre.is_empty() {
            let mut endpoint = self.0.endpoint.borrow_mut();
            if let Endpoint::Stream(c) = &mut *endpoint {
                for m in pre {
                    c.enqueue_message(m)?;
                }
            }
        }
        self.try_flush_outgoing()?;

        Ok(())
    }

    fn dispatch_one(&self) -> Result<bool> {
        // 1. Expired method-call deadlines first.
        if self.expire_one(Instant::now())? {
            return Ok(true);
        }

        // 2. Drive the write side as far as it goes.
        self.try_flush_outgoing()?;

        // 3. One inbound message.
        let msg = match self.next_incoming()? {
            Some(m) => m,
            None => return Ok(false),
        };

        // 4. The HELLO gate.
        if self.state() == ConnectionState::Hello {
            self.handle_hello(msg)?;
            return Ok(true);
        }

        self.deliver(msg)?;
        Ok(true)
    }

    fn deliver(&self, msg: Message) -> Result<()> {
        // 5. Reply correlation.
        let reply_serial = {
            let header = msg.header()?;
            match header.message_type()? {
                MessageType::MethodReturn | MessageType::Error => header.reply_serial()?,
                _ => None,
            }
        };
        if let Some(serial) = reply_serial {
            if let Some(record) = self.take_pending(serial) {
                trace!("delivering reply for serial {}", serial);
                if let Some(callback) = record.callback {
                    callback(self, &msg);
                }
                return Ok(());
            }
        }

        // 6. Filter chain.
        if self.run_filters(&msg)? {
            return Ok(());
        }

        // 7. Match chain.
        if self.run_matches(&msg)? {
            return Ok(());
        }

        // 8. Built-in peer interface.
        if self.process_peer(&msg)? {
            return Ok(());
        }

        // 9. Object dispatch.
        if self.process_object(&msg)? {
            return Ok(());
        }

        // 10. Unclaimed method calls get an automatic error reply.
        self.reply_unknown_object(&msg)
    }

    fn handle_hello(&self, msg: Message) -> Result<()> {
        let hello_serial = match self.0.hello_serial.get() {
            Some(serial) => serial,
            None => {
                self.force_close();
                return Err(Error::Protocol("no HELLO in flight".into()));
            }
        };

        let (is_reply, is_error) = {
            let header = msg.header()?;
            (
                header.is_reply_to(hello_serial)?,
                header.message_type()? == MessageType::Error,
            )
        };
        if !is_reply {
            self.force_close();
            return Err(Error::Protocol(
                "message delivered before the HELLO reply".into(),
            ));
        }
        if is_error {
            self.force_close();
            let err = Error::from(msg);
            return Err(Error::Handshake(format!("Hello failed: {}", err)));
        }

        let unique_name: String = match msg.body() {
            Ok(name) => name,
            Err(e) => {
                self.force_close();
                return Err(e);
            }
        };
        if !unique_name.starts_with(':') {
            self.force_close();
            return Err(Error::Protocol(format!(
                "malformed unique name: {}",
                unique_name
            )));
        }

        debug!("HELLO done, unique name {}", unique_name);
        self.0
            .unique_name
            .set(unique_name)
            // programmer (probably our) error if this fails.
            .expect("attempted to set unique_name twice");
        self.0.state.set(ConnectionState::Running);
        Ok(())
    }

    fn run_filters(&self, msg: &Message) -> Result<bool> {
        let iteration = self.0.iteration.get() + 1;
        self.0.iteration.set(iteration);

        'restart: loop {
            let generation = self.0.filters_generation.get();
            loop {
                let taken = {
                    let mut filters = self.0.filters.borrow_mut();
                    match filters
                        .iter_mut()
                        .find(|f| f.last_iteration != iteration && f.callback.is_some())
                    {
                        Some(record) => {
                            record.last_iteration = iteration;
                            Some((record.id, record.callback.take()))
                        }
                        None => None,
                    }
                };
                let (id, callback) = match taken {
                    Some((id, Some(callback))) => (id, callback),
                    _ => return Ok(false),
                };

                let mut callback = callback;
                let consumed = callback(self, msg);

                // Put the callback back unless the record removed itself.
                {
                    let mut filters = self.0.filters.borrow_mut();
                    if let Some(record) = filters.iter_mut().find(|f| f.id == id) {
                        record.callback = Some(callback);
                    }
                }

                if consumed? {
                    return Ok(true);
                }
                if self.0.filters_generation.get() != generation {
                    // The list changed under us; rescan. Stamped records are
                    // skipped, so nothing runs twice.
                    continue 'restart;
                }
            }
        }
    }

    fn run_matches(&self, msg: &Message) -> Result<bool> {
        let iteration = self.0.iteration.get() + 1;
        self.0.iteration.set(iteration);

        'restart: loop {
            let generation = self.0.matches_generation.get();
            loop {
                let taken = {
                    let mut matches = self.0.matches.borrow_mut();
                    let record = match matches
                        .iter_mut()
                        .find(|m| m.last_iteration != iteration && m.callback.is_some())
                    {
                        Some(record) => record,
                        None => return Ok(false),
                    };
                    record.last_iteration = iteration;
                    if record.rule.matches(msg)? {
                        Some((record.id, record.callback.take()))
                    } else {
                        None
                    }
                };
                let (id, callback) = match taken {
                    Some((id, Some(callback))) => (id, callback),
                    Some((_, None)) => continue,
                    None => continue,
                };

                let mut callback = callback;
                let consumed = callback(self, msg);

                {
                    let mut matches = self.0.matches.borrow_mut();
                    if let Some(record) = matches.iter_mut().find(|m| m.id == id) {
                        record.callback = Some(callback);
                    }
                }

                if consumed? {
                    return Ok(true);
                }
                if self.0.matches_generation.get() != generation {
                    continue 'restart;
                }
            }
        }
    }

    fn process_peer(&self, msg: &Message) -> Result<bool> {
        let (is_call, interface, member, no_reply) = {
            let header = msg.header()?;
            (
                header.message_type()? == MessageType::MethodCall,
                header.interface()?.map(String::from),
                header.member()?.map(String::from),
                header.flags().contains(MessageFlags::NoReplyExpected),
            )
        };
        if !is_call || interface.as_deref() != Some("org.freedesktop.DBus.Peer") {
            return Ok(false);
        }

        match member.as_deref() {
            Some("Ping") => {
                if !no_reply {
                    let reply = Message::method_reply(self.unique_name(), msg, &())?;
                    self.send_internal(reply, true)?;
                }
            }
            Some("GetMachineId") => {
                if !no_reply {
                    let id = machine_id()?;
                    let reply = Message::method_reply(self.unique_name(), msg, &id.as_str())?;
                    self.send_internal(reply, true)?;
                }
            }
            other => {
                if !no_reply {
                    let text = format!(
                        "Unknown method {} on org.freedesktop.DBus.Peer",
                        other.unwrap_or("<none>")
                    );
                    let reply = Message::method_error(
                        self.unique_name(),
                        msg,
                        name::UNKNOWN_METHOD,
                        &text.as_str(),
                    )?;
                    self.send_internal(reply, true)?;
                }
            }
        }

        Ok(true)
    }

    fn process_object(&self, msg: &Message) -> Result<bool> {
        let handler = self.0.object_handler.borrow_mut().take();
        let mut handler = match handler {
            Some(h) => h,
            None => return Ok(false),
        };

        let consumed = handler(self, msg);

        let mut slot = self.0.object_handler.borrow_mut();
        if slot.is_none() {
            *slot = Some(handler);
        }
        drop(slot);

        consumed
    }

    fn reply_unknown_object(&self, msg: &Message) -> Result<()> {
        let (is_call, no_reply, path) = {
            let header = msg.header()?;
            (
                header.message_type()? == MessageType::MethodCall,
                header.flags().contains(MessageFlags::NoReplyExpected),
                header.path()?.map(String::from),
            )
        };
        if !is_call || no_reply {
            return Ok(());
        }

        let text = format!(
            "Unknown object '{}'",
            path.as_deref().unwrap_or("<no path>")
        );
        let reply =
            Message::method_error(self.unique_name(), msg, name::UNKNOWN_OBJECT, &text.as_str())?;
        self.send_internal(reply, true)?;
        Ok(())
    }

    //
    // Plumbing.
    //

    fn send_internal(&self, mut msg: Message, want_serial: bool) -> Result<u32> {
        self.check_pid()?;
        let state = self.state();
        if state == ConnectionState::Closed {
            return Err(Error::NotConnected);
        }
        if msg.fd_count() > 0 && !self.can_pass_fds() {
            return Err(Error::Unsupported);
        }
        if msg.primary_header()?.protocol_version() != PROTOCOL_VERSION {
            return Err(Error::Unsupported);
        }
        if !want_serial && msg.message_type()? == MessageType::MethodCall {
            msg.set_no_reply_expected()?;
        }

        let serial = self.next_serial();
        msg.seal(serial)?;

        let mut endpoint = self.0.endpoint.borrow_mut();
        match &mut *endpoint {
            Endpoint::Stream(c) => {
                c.enqueue_message(msg)?;
                if state == ConnectionState::Hello || state == ConnectionState::Running {
                    // Opportunistic write; a partial write parks the message
                    // at the queue head with its byte position.
                    if let Err(e) = c.try_flush() {
                        if e.kind() != io::ErrorKind::WouldBlock {
                            drop(endpoint);
                            self.force_close();
                            return Err(e.into());
                        }
                    }
                }
            }
            Endpoint::Kernel(k) => {
                if let Err(e) = k.send(&msg) {
                    if !e.would_block() {
                        drop(endpoint);
                        self.force_close();
                    }
                    return Err(e);
                }
            }
            Endpoint::Connecting { .. } | Endpoint::ClientAuth(_) | Endpoint::ServerAuth(_) => {
                // Not authenticated yet; hold the sealed message until then.
                let mut pre = self.0.pre_queue.borrow_mut();
                if pre.len() >= MAX_OUT_QUEUED {
                    return Err(Error::QueueFull);
                }
                pre.push_back(msg);
            }
            Endpoint::Closed => return Err(Error::NotConnected),
        }

        Ok(serial)
    }

    fn next_serial(&self) -> u32 {
        let next = self.0.serial.get() + 1;

        self.0.serial.replace(next)
    }

    fn next_handler_id(&self) -> u64 {
        let next = self.0.next_handler_id.get() + 1;
        self.0.next_handler_id.replace(next)
    }

    fn bump_generation(&self, generation: &Cell<u64>) {
        generation.set(generation.get() + 1);
    }

    fn expire_one(&self, now: Instant) -> Result<bool> {
        let expired = {
            let deadlines = self.0.deadlines.borrow();
            match deadlines.iter().next() {
                Some(&(deadline, serial)) if deadline <= now => Some((deadline, serial)),
                _ => None,
            }
        };
        let (deadline, serial) = match expired {
            Some(e) => e,
            None => return Ok(false),
        };

        self.0.deadlines.borrow_mut().remove(&(deadline, serial));
        let record = self.0.replies.borrow_mut().remove(&serial);
        if let Some(record) = record {
            warn!("method call with serial {} timed out", serial);
            if let Some(callback) = record.callback {
                let err = Message::error_for_serial(
                    serial,
                    self.unique_name(),
                    name::NO_REPLY,
                    "Method call timed out",
                )?;
                callback(self, &err);
            }
        }
        Ok(true)
    }

    fn take_pending(&self, serial: u32) -> Option<PendingReply> {
        let record = self.0.replies.borrow_mut().remove(&serial)?;
        if let Some(deadline) = record.deadline {
            self.0.deadlines.borrow_mut().remove(&(deadline, serial));
        }
        Some(record)
    }

    fn next_incoming(&self) -> Result<Option<Message>> {
        if let Some(m) = self.0.incoming_queue.borrow_mut().pop_front() {
            return Ok(Some(m));
        }

        let received = {
            let mut endpoint = self.0.endpoint.borrow_mut();
            match &mut *endpoint {
                Endpoint::Stream(c) => c.try_receive_message(),
                Endpoint::Kernel(k) => k.try_receive_message(),
                _ => return Err(Error::NotConnected),
            }
        };
        match received {
            Ok(m) => Ok(Some(m)),
            Err(e) if e.would_block() => Ok(None),
            Err(e) => {
                self.force_close();
                Err(e)
            }
        }
    }

    fn try_flush_outgoing(&self) -> Result<()> {
        let res = {
            let mut endpoint = self.0.endpoint.borrow_mut();
            match &mut *endpoint {
                Endpoint::Stream(c) => c.try_flush(),
                _ => return Ok(()),
            }
        };
        match res {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => {
                self.force_close();
                Err(e.into())
            }
        }
    }

    fn has_outgoing(&self) -> bool {
        match &*self.0.endpoint.borrow() {
            Endpoint::Stream(c) => c.has_outgoing(),
            _ => false,
        }
    }

    fn auth_needs_write(&self) -> bool {
        match &*self.0.endpoint.borrow() {
            Endpoint::ClientAuth(h) => h.needs_write(),
            Endpoint::ServerAuth(h) => h.needs_write(),
            _ => false,
        }
    }

    fn requeue(&self, mut tmp: VecDeque<Message>) {
        self.0.incoming_queue.borrow_mut().append(&mut tmp);
    }

    fn wait_for_io(&self, deadline: Option<Instant>) -> Result<()> {
        let mut flags = PollFlags::POLLIN;
        if self.has_outgoing() {
            flags |= PollFlags::POLLOUT;
        }
        let limit = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        poll_timeout(self.as_raw_fd(), flags, limit)?;
        Ok(())
    }

    fn wait_until(&self, deadline: Option<Instant>) -> Result<()> {
        let limit = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        self.wait(limit)?;
        Ok(())
    }

    fn force_close(&self) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        debug!("closing connection");
        self.0.state.set(ConnectionState::Closed);
        let endpoint = self.0.endpoint.replace(Endpoint::Closed);
        if let Endpoint::Stream(c) = &endpoint {
            let _ = c.close();
        }
        drop(endpoint);
        // Pending callbacks are dropped, not invoked: callers observe no
        // reply, exactly as with cancellation.
        self.0.replies.borrow_mut().clear();
        self.0.deadlines.borrow_mut().clear();
        self.0.incoming_queue.borrow_mut().clear();
        self.0.pre_queue.borrow_mut().clear();
    }

    fn check_pid(&self) -> Result<()> {
        if self.0.pid.get() != nix::unistd::getpid() {
            return Err(Error::ChildProcess);
        }
        Ok(())
    }
}

struct ProcessGuard<'a>(&'a Cell<bool>);

impl Drop for ProcessGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Configures and opens a [`Connection`].
///
/// All configuration lives here: once `build` hands out a `Connection`, its
/// setup is immutable.
///
/// [`Connection`]: struct.Connection.html
pub struct ConnectionBuilder {
    target: Option<BuildTarget>,
    bus_client: bool,
    server_guid: Option<Guid>,
    accept_anonymous: bool,
    anonymous_auth: bool,
    accepts_fds: bool,
    attach_flags: BitFlags<kernel::AttachFlags>,
    expected_guid: Option<Guid>,
}

enum BuildTarget {
    Addresses(Vec<Address>),
    Unix(UnixStream),
    Tcp(TcpStream),
    Socket(Box<dyn Socket>),
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        ConnectionBuilder {
            target: None,
            bus_client: false,
            server_guid: None,
            accept_anonymous: false,
            anonymous_auth: false,
            accepts_fds: true,
            attach_flags: BitFlags::empty(),
            expected_guid: None,
        }
    }

    /// Target a D-Bus address string; entries are tried in order.
    pub fn address(mut self, address: &str) -> Result<Self> {
        self.target = Some(BuildTarget::Addresses(Address::parse(address)?));
        Ok(self)
    }

    /// Target pre-parsed addresses.
    pub fn addresses(mut self, addresses: Vec<Address>) -> Self {
        self.target = Some(BuildTarget::Addresses(addresses));
        self
    }

    /// Target an already-connected unix stream.
    pub fn unix_stream(mut self, stream: UnixStream) -> Self {
        self.target = Some(BuildTarget::Unix(stream));
        self
    }

    /// Target an already-connected TCP stream.
    pub fn tcp_stream(mut self, stream: TcpStream) -> Self {
        self.target = Some(BuildTarget::Tcp(stream));
        self
    }

    /// Target a custom [`Socket`] implementation.
    ///
    /// [`Socket`]: raw/trait.Socket.html
    pub fn socket(mut self, socket: Box<dyn Socket>) -> Self {
        self.target = Some(BuildTarget::Socket(socket));
        self
    }

    /// Make this a message-bus client connection: issue the HELLO call after
    /// authentication and gate dispatch on its reply.
    pub fn bus_client(mut self) -> Self {
        self.bus_client = true;
        self
    }

    /// Take the server role of the authentication handshake, presenting this
    /// GUID. Mutually exclusive with [`bus_client`].
    ///
    /// [`bus_client`]: struct.ConnectionBuilder.html#method.bus_client
    pub fn server(mut self, guid: &Guid) -> Self {
        self.server_guid = Some(guid.clone());
        self
    }

    /// As a server, accept `ANONYMOUS` authentication.
    pub fn allow_anonymous(mut self) -> Self {
        self.accept_anonymous = true;
        self
    }

    /// As a client, authenticate with the `ANONYMOUS` mechanism instead of
    /// `EXTERNAL`.
    pub fn anonymous_auth(mut self) -> Self {
        self.anonymous_auth = true;
        self
    }

    /// Whether to negotiate file-descriptor passing (on by default; the
    /// capability is only usable if the peer also confirms it).
    pub fn accepts_fds(mut self, accepts: bool) -> Self {
        self.accepts_fds = accepts;
        self
    }

    /// Metadata to request from the kernel transport.
    pub fn attach_flags(mut self, flags: BitFlags<kernel::AttachFlags>) -> Self {
        self.attach_flags = flags;
        self
    }

    /// Build the connection and block until it is `Running`.
    pub fn build(self) -> Result<Connection> {
        let conn = self.build_nonblocking()?;
        while conn.state() != ConnectionState::Running {
            conn.wait(None)?;
            conn.process()?;
        }
        Ok(conn)
    }

    /// Build the connection without waiting: it comes back in the `Opening`
    /// state and is driven to `Running` by [`Connection::process`], under an
    /// external event loop.
    ///
    /// [`Connection::process`]: struct.Connection.html#method.process
    pub fn build_nonblocking(self) -> Result<Connection> {
        let ConnectionBuilder {
            target,
            bus_client,
            server_guid,
            accept_anonymous,
            anonymous_auth,
            accepts_fds,
            attach_flags,
            expected_guid,
        } = self;

        if server_guid.is_some() && bus_client {
            return Err(Error::Configuration(
                "a connection cannot be both server and bus client".into(),
            ));
        }

        let target = target.ok_or_else(|| {
            Error::Configuration("no address, stream or socket configured".into())
        })?;

        let auth_endpoint = |socket: Box<dyn Socket>| -> Result<Endpoint> {
            match &server_guid {
                Some(guid) => {
                    let uid = peer_uid(socket.as_raw_fd())?;
                    Ok(Endpoint::ServerAuth(ServerHandshake::new_with(
                        socket,
                        guid.clone(),
                        uid,
                        accept_anonymous,
                    )))
                }
                None => Ok(Endpoint::ClientAuth(ClientHandshake::new_with(
                    socket,
                    anonymous_auth,
                    accepts_fds,
                ))),
            }
        };

        let mut expected_guid = expected_guid;
        let endpoint = match target {
            BuildTarget::Unix(stream) => {
                stream.set_nonblocking(true)?;
                auth_endpoint(Box::new(stream))?
            }
            BuildTarget::Tcp(stream) => {
                stream.set_nonblocking(true)?;
                auth_endpoint(Box::new(stream))?
            }
            BuildTarget::Socket(socket) => auth_endpoint(socket)?,
            BuildTarget::Addresses(addresses) => {
                if server_guid.is_some() {
                    return Err(Error::Configuration(
                        "server connections take an existing stream, not an address".into(),
                    ));
                }
                let mut last_err = None;
                let mut found = None;
                for address in addresses {
                    match connect_address(&address, attach_flags) {
                        Ok(endpoint) => {
                            expected_guid = address.guid().cloned().or(expected_guid);
                            found = Some(endpoint);
                            break;
                        }
                        Err(e) => {
                            debug!("address failed, trying next: {}", e);
                            last_err = Some(e);
                        }
                    }
                }
                match found {
                    Some(endpoint) => endpoint,
                    None => {
                        return Err(last_err
                            .unwrap_or_else(|| Error::Address("no usable address".into())))
                    }
                }
            }
        };

        let conn = Connection(Rc::new(ConnectionInner {
            state: Cell::new(ConnectionState::Opening),
            endpoint: RefCell::new(endpoint),
            bus_client,
            server_mode: server_guid.is_some(),
            accepts_fds,
            expected_guid,
            server_guid: RefCell::new(server_guid),
            cap_unix_fd: Cell::new(false),
            attach_flags: Cell::new(BitFlags::empty()),
            unique_name: OnceCell::new(),
            serial: Cell::new(1),
            hello_serial: Cell::new(None),
            pid: Cell::new(nix::unistd::getpid()),
            pre_queue: RefCell::new(VecDeque::new()),
            incoming_queue: RefCell::new(VecDeque::new()),
            replies: RefCell::new(HashMap::new()),
            deadlines: RefCell::new(BTreeSet::new()),
            auth_deadline: Cell::new(None),
            filters: RefCell::new(vec![]),
            filters_generation: Cell::new(0),
            matches: RefCell::new(vec![]),
            matches_generation: Cell::new(0),
            next_handler_id: Cell::new(0),
            iteration: Cell::new(0),
            in_process: Cell::new(false),
            object_handler: RefCell::new(None),
        }));
        Ok(conn)
    }
}

fn peer_uid(fd: RawFd) -> Result<u32> {
    use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};

    let creds = getsockopt(fd, PeerCredentials)
        .map_err(|e| Error::Handshake(format!("failed to get peer credentials: {}", e)))?;
    Ok(creds.uid())
}

fn connect_address(
    address: &Address,
    attach_flags: BitFlags<kernel::AttachFlags>,
) -> Result<Endpoint> {
    use nix::sys::socket::{AddressFamily, InetAddr, SockAddr, UnixAddr};

    match address.transport() {
        Transport::Unix { path } => {
            let addr = SockAddr::Unix(UnixAddr::new(path.as_str())?);
            start_connect(AddressFamily::Unix, &addr, false)
        }
        Transport::UnixAbstract { name } => {
            let addr = SockAddr::Unix(UnixAddr::new_abstract(name.as_bytes())?);
            start_connect(AddressFamily::Unix, &addr, false)
        }
        Transport::Tcp { host, port, family } => {
            let mut last_err = None;
            for resolved in (host.as_str(), *port).to_socket_addrs()? {
                let ok = match family {
                    Some(crate::TcpFamily::Ipv4) => resolved.is_ipv4(),
                    Some(crate::TcpFamily::Ipv6) => resolved.is_ipv6(),
                    None => true,
                };
                if !ok {
                    continue;
                }
                let family = if resolved.is_ipv4() {
                    AddressFamily::Inet
                } else {
                    AddressFamily::Inet6
                };
                let addr = SockAddr::Inet(InetAddr::from_std(&resolved));
                match start_connect(family, &addr, true) {
                    Ok(endpoint) => return Ok(endpoint),
                    Err(e) => last_err = Some(e),
                }
            }
            Err(last_err.unwrap_or_else(|| Error::Address("host did not resolve".into())))
        }
        Transport::Exec { path, argv } => {
            let stream = spawn_exec(path, argv)?;
            Ok(Endpoint::ClientAuth(ClientHandshake::new(
                Box::new(stream) as Box<dyn Socket>
            )))
        }
        Transport::Kernel { path } => Ok(Endpoint::Kernel(kernel::Connection::attach(
            path,
            attach_flags,
        )?)),
        Transport::Container { machine } => {
            // The container's system bus is reached through its stdio bridge,
            // which binds the well-known system bus socket on the inside.
            let argv = vec![
                "systemd-stdio-bridge".to_string(),
                format!("--machine={}", machine),
            ];
            let stream = spawn_exec("systemd-stdio-bridge", &argv)?;
            Ok(Endpoint::ClientAuth(ClientHandshake::new(
                Box::new(stream) as Box<dyn Socket>
            )))
        }
    }
}

/// Initiate a non-blocking connect; completion is observed from the
/// `Opening` state via POLLOUT + SO_ERROR.
fn start_connect(
    family: nix::sys::socket::AddressFamily,
    addr: &nix::sys::socket::SockAddr,
    tcp: bool,
) -> Result<Endpoint> {
    use nix::sys::socket::{connect, socket, SockFlag, SockType};

    let fd = socket(
        family,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    match connect(fd.as_raw_fd(), addr) {
        Ok(()) => Ok(Endpoint::Connecting { fd, tcp }),
        Err(nix::Error::Sys(nix::errno::Errno::EINPROGRESS))
        | Err(nix::Error::Sys(nix::errno::Errno::EAGAIN)) => Ok(Endpoint::Connecting { fd, tcp }),
        Err(e) => Err(e.into()),
    }
}

/// Spawn `path` with `argv`, its stdin/stdout wired to our end of a
/// socketpair speaking D-Bus.
///
/// The child is left to run on its own; it exits when the socket closes.
fn spawn_exec(path: &str, argv: &[String]) -> Result<UnixStream> {
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};

    let (parent_fd, child_fd) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )?;
    let parent = unsafe { UnixStream::from_raw_fd(parent_fd) };
    let child_out = nix::unistd::dup(child_fd)?;

    let mut command = Command::new(path);
    if let Some(argv0) = argv.first() {
        command.arg0(argv0);
        command.args(&argv[1..]);
    }
    command
        .stdin(unsafe { Stdio::from_raw_fd(child_fd) })
        .stdout(unsafe { Stdio::from_raw_fd(child_out) });

    command.spawn()?;
    parent.set_nonblocking(true)?;
    Ok(parent)
}

fn exec_address(path: &str, argv: &[&str]) -> Address {
    let mut descriptor = format!("unixexec:path={}", escape(path));
    for (i, arg) in argv.iter().enumerate() {
        descriptor.push_str(&format!(",argv{}={}", i, escape(arg)));
    }
    Address::parse(&descriptor)
        .ok()
        .and_then(|mut list| if list.is_empty() { None } else { Some(list.remove(0)) })
        .expect("exec address is well-formed by construction")
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z' | b'_' | b'-' | b'/' | b'.' | b'\\' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02x}", b)),
        }
    }
    out
}

pub(crate) fn machine_id() -> Result<String> {
    static MACHINE_ID: once_cell::sync::OnceCell<String> = once_cell::sync::OnceCell::new();

    MACHINE_ID
        .get_or_try_init(|| {
            let raw = std::fs::read_to_string("/etc/machine-id").or_else(|_| {
                std::fs::read_to_string("/proc/sys/kernel/random/boot_id")
            })?;
            let id: String = raw
                .trim()
                .chars()
                .filter(|c| *c != '-')
                .collect::<String>()
                .to_lowercase();
            if id.len() != 32 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(Error::Protocol(format!("malformed machine id: {}", id)));
            }
            Ok(id)
        })
        .map(|id| id.clone())
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use nix::poll::PollFlags;
    use ntest::timeout;

    use super::{Connection, ConnectionBuilder, ConnectionState, Timeout};
    use crate::handshake::ServerHandshake;
    use crate::utils::wait_on;
    use crate::{name, Error, Guid, MatchRule, Message, MessageType};

    /// An authenticated peer-to-peer pair, both ends driven from one thread.
    fn p2p_pair() -> (Connection, Connection) {
        let guid = Guid::generate();
        let (c, s) = UnixStream::pair().unwrap();
        let client = ConnectionBuilder::new()
            .unix_stream(c)
            .build_nonblocking()
            .unwrap();
        let server = ConnectionBuilder::new()
            .unix_stream(s)
            .server(&guid)
            .build_nonblocking()
            .unwrap();
        pump_until(&client, &server, |c, s| {
            c.state() == ConnectionState::Running && s.state() == ConnectionState::Running
        });
        (client, server)
    }

    fn pump_until<F>(client: &Connection, server: &Connection, cond: F)
    where
        F: Fn(&Connection, &Connection) -> bool,
    {
        for _ in 0..2000 {
            if cond(client, server) {
                return;
            }
            client.process().unwrap();
            server.process().unwrap();
            thread::sleep(Duration::from_millis(1));
        }
        panic!("condition never reached");
    }

    #[test]
    #[timeout(15000)]
    fn unix_p2p() {
        let guid = Guid::generate();

        let (p0, p1) = UnixStream::pair().unwrap();

        let server_thread = thread::spawn(move || {
            let c = Connection::new_unix_server(p0, &guid).unwrap();
            let reply = c
                .call_method(None, "/", Some("org.rbus.p2p"), "Test", &())
                .unwrap();
            assert_eq!(reply.to_string(), "Method return");
            let val: String = reply.body().unwrap();
            val
        });

        let c = Connection::new_unix_client(p1, false).unwrap();
        let done = Rc::new(Cell::new(false));
        let handler_done = done.clone();
        c.set_object_handler(Box::new(move |conn, msg| {
            assert_eq!(msg.to_string(), "Method call Test");
            conn.reply(msg, &("yay"))?;
            handler_done.set(true);
            Ok(true)
        }));

        while !done.get() {
            c.wait(Some(Duration::from_millis(100))).unwrap();
            c.process().unwrap();
        }
        c.flush().unwrap();

        let val = server_thread.join().expect("failed to join server thread");
        assert_eq!(val, "yay");
    }

    #[test]
    #[timeout(15000)]
    fn serial_monotonically_increases() {
        let (client, _server) = p2p_pair();
        let serial = client.next_serial() + 1;

        for next in serial..serial + 10 {
            assert_eq!(next, client.next_serial());
        }
    }

    #[test]
    #[timeout(15000)]
    fn hello_round_trip() {
        let (client_stream, bus_stream) = UnixStream::pair().unwrap();

        let bus_thread = thread::spawn(move || {
            bus_stream.set_nonblocking(true).unwrap();
            let uid = u32::from(nix::unistd::getuid());
            let auth = ServerHandshake::new(bus_stream, Guid::generate(), uid)
                .blocking_finish()
                .unwrap();
            let mut conn = auth.conn;

            let hello = loop {
                match conn.try_receive_message() {
                    Ok(m) => break m,
                    Err(e) if e.would_block() => {
                        wait_on(conn.socket().as_raw_fd(), PollFlags::POLLIN).unwrap()
                    }
                    Err(e) => panic!("bus read failed: {}", e),
                }
            };
            assert_eq!(hello.to_string(), "Method call Hello");
            let header = hello.header().unwrap();
            assert_eq!(header.destination().unwrap(), Some("org.freedesktop.DBus"));
            assert_eq!(header.path().unwrap(), Some("/org/freedesktop/DBus"));

            let mut reply =
                Message::method_reply(Some("org.freedesktop.DBus"), &hello, &":1.42").unwrap();
            reply.seal(1).unwrap();
            conn.enqueue_message(reply).unwrap();
            loop {
                match conn.try_flush() {
                    Ok(()) => break,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        wait_on(conn.socket().as_raw_fd(), PollFlags::POLLOUT).unwrap()
                    }
                    Err(e) => panic!("bus write failed: {}", e),
                }
            }
        });

        let c = ConnectionBuilder::new()
            .unix_stream(client_stream)
            .bus_client()
            .build()
            .unwrap();
        assert_eq!(c.state(), ConnectionState::Running);
        assert_eq!(c.unique_name(), Some(":1.42"));

        bus_thread.join().unwrap();
    }

    #[test]
    #[timeout(15000)]
    fn hello_gate_violation_closes() {
        let (client_stream, bus_stream) = UnixStream::pair().unwrap();

        let bus_thread = thread::spawn(move || {
            bus_stream.set_nonblocking(true).unwrap();
            let uid = u32::from(nix::unistd::getuid());
            let auth = ServerHandshake::new(bus_stream, Guid::generate(), uid)
                .blocking_finish()
                .unwrap();
            let mut conn = auth.conn;

            // Ignore the HELLO; barge in with a signal instead.
            let mut rogue = Message::signal(None, None, "/", "org.rbus.Rogue", "Barge", &()).unwrap();
            rogue.seal(1).unwrap();
            conn.enqueue_message(rogue).unwrap();
            loop {
                match conn.try_flush() {
                    Ok(()) => break,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        wait_on(conn.socket().as_raw_fd(), PollFlags::POLLOUT).unwrap()
                    }
                    Err(e) => panic!("bus write failed: {}", e),
                }
            }
        });

        let c = ConnectionBuilder::new()
            .unix_stream(client_stream)
            .bus_client()
            .build_nonblocking()
            .unwrap();
        let err = loop {
            match c.process() {
                Ok(_) => {
                    assert_ne!(c.state(), ConnectionState::Running);
                    let _ = c.wait(Some(Duration::from_millis(50)));
                }
                Err(e) => break e,
            }
        };
        assert!(matches!(err, Error::Protocol(_)), "got: {}", err);
        assert_eq!(c.state(), ConnectionState::Closed);

        bus_thread.join().unwrap();
    }

    #[test]
    #[timeout(15000)]
    fn ping_builtin() {
        let (client, server) = p2p_pair();

        let got: Rc<RefCell<Option<(MessageType, Option<u32>)>>> = Rc::new(RefCell::new(None));
        let stash = got.clone();
        let ping = Message::method(
            None,
            None,
            "/",
            Some("org.freedesktop.DBus.Peer"),
            "Ping",
            &(),
        )
        .unwrap();
        let serial = server
            .send_with_reply(ping, Timeout::Default, move |_, reply| {
                let header = reply.header().unwrap();
                stash.borrow_mut().replace((
                    header.message_type().unwrap(),
                    header.reply_serial().unwrap(),
                ));
                let () = reply.body().unwrap();
            })
            .unwrap();

        pump_until(&client, &server, |_, _| got.borrow().is_some());
        assert_eq!(*got.borrow(), Some((MessageType::MethodReturn, Some(serial))));
    }

    #[test]
    #[timeout(15000)]
    fn get_machine_id_builtin() {
        let (client, server) = p2p_pair();

        let got: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));
        let stash = got.clone();
        let call = Message::method(
            None,
            None,
            "/",
            Some("org.freedesktop.DBus.Peer"),
            "GetMachineId",
            &(),
        )
        .unwrap();
        server
            .send_with_reply(call, Timeout::Default, move |_, reply| {
                stash.borrow_mut().replace(reply.body().unwrap());
            })
            .unwrap();

        pump_until(&client, &server, |_, _| got.borrow().is_some());
        let id = got.borrow().clone().unwrap();
        assert_eq!(id.len(), 32);
        assert!(id
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    #[timeout(15000)]
    fn unknown_peer_member() {
        let (client, server) = p2p_pair();

        let got: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));
        let stash = got.clone();
        let call = Message::method(
            None,
            None,
            "/",
            Some("org.freedesktop.DBus.Peer"),
            "Frobnicate",
            &(),
        )
        .unwrap();
        server
            .send_with_reply(call, Timeout::Default, move |_, reply| {
                let name = reply
                    .header()
                    .unwrap()
                    .error_name()
                    .unwrap()
                    .map(String::from);
                stash.borrow_mut().replace(name.unwrap_or_default());
            })
            .unwrap();

        pump_until(&client, &server, |_, _| got.borrow().is_some());
        assert_eq!(got.borrow().as_deref(), Some(name::UNKNOWN_METHOD));
        let _ = client;
    }

    #[test]
    #[timeout(15000)]
    fn unclaimed_call_gets_unknown_object() {
        let (client, server) = p2p_pair();

        let got: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));
        let stash = got.clone();
        let call = Message::method(
            None,
            None,
            "/org/rbus/Missing",
            Some("org.rbus.Nothing"),
            "Nope",
            &(),
        )
        .unwrap();
        server
            .send_with_reply(call, Timeout::Default, move |_, reply| {
                let name = reply
                    .header()
                    .unwrap()
                    .error_name()
                    .unwrap()
                    .map(String::from);
                stash.borrow_mut().replace(name.unwrap_or_default());
            })
            .unwrap();

        pump_until(&client, &server, |_, _| got.borrow().is_some());
        assert_eq!(got.borrow().as_deref(), Some(name::UNKNOWN_OBJECT));
    }

    #[test]
    #[timeout(15000)]
    fn reply_timeout_synthesizes_no_reply() {
        let (client, server) = p2p_pair();

        // The server swallows everything, so no reply ever comes.
        server.add_filter(|_, _| Ok(true));

        let got: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));
        let stash = got.clone();
        let call = Message::method(None, None, "/", Some("org.rbus.Mute"), "Void", &()).unwrap();
        let serial = client
            .send_with_reply(call, Timeout::After(Duration::from_millis(10)), move |_, reply| {
                let name = reply
                    .header()
                    .unwrap()
                    .error_name()
                    .unwrap()
                    .map(String::from);
                stash.borrow_mut().replace(name.unwrap_or_default());
            })
            .unwrap();

        pump_until(&client, &server, |_, _| got.borrow().is_some());
        assert_eq!(got.borrow().as_deref(), Some(name::NO_REPLY));
        assert!(!client.0.replies.borrow().contains_key(&serial));
        assert!(client.0.deadlines.borrow().is_empty());
    }

    #[test]
    #[timeout(15000)]
    fn cancel_discards_late_reply() {
        let (client, server) = p2p_pair();

        let fired = Rc::new(Cell::new(false));
        let fired_flag = fired.clone();
        let ping = Message::method(
            None,
            None,
            "/",
            Some("org.freedesktop.DBus.Peer"),
            "Ping",
            &(),
        )
        .unwrap();
        let serial = client
            .send_with_reply(ping, Timeout::Default, move |_, _| fired_flag.set(true))
            .unwrap();

        assert!(client.send_with_reply_cancel(serial));
        assert!(!client.send_with_reply_cancel(serial));

        // Let the reply arrive and be dropped on the floor.
        for _ in 0..50 {
            client.process().unwrap();
            server.process().unwrap();
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!fired.get());
        assert!(client.0.replies.borrow().is_empty());
    }

    #[test]
    #[timeout(15000)]
    fn nested_dispatch_is_busy() {
        let (client, server) = p2p_pair();

        let saw_busy = Rc::new(Cell::new(false));
        let flag = saw_busy.clone();
        client.add_filter(move |conn, _| {
            match conn.process() {
                Err(Error::Busy) => flag.set(true),
                other => panic!("expected Busy, got: {:?}", other.map(|_| ())),
            }
            let call = Message::method(None, None, "/", None, "X", &())?;
            match conn.call(call, Timeout::Default) {
                Err(Error::Busy) => (),
                other => panic!("expected Busy, got: {:?}", other.map(|_| ())),
            }
            Ok(true)
        });

        server.emit_signal(None, "/", "org.rbus.Test", "Poke", &()).unwrap();
        pump_until(&client, &server, |_, _| saw_busy.get());
    }

    #[test]
    #[timeout(15000)]
    fn flush_on_idle_connection_is_noop() {
        let (client, _server) = p2p_pair();
        client.flush().unwrap();
        client.flush().unwrap();
    }

    #[test]
    #[timeout(15000)]
    fn fork_guard() {
        let (client, _server) = p2p_pair();

        client.0.pid.set(nix::unistd::Pid::from_raw(1));

        let msg = Message::signal(None, None, "/", "org.rbus.Test", "S", &()).unwrap();
        assert!(matches!(client.send_message(msg), Err(Error::ChildProcess)));
        assert!(matches!(client.process(), Err(Error::ChildProcess)));
        assert!(matches!(client.flush(), Err(Error::ChildProcess)));
        assert!(matches!(client.wait(None), Err(Error::ChildProcess)));
        assert!(matches!(client.close(), Err(Error::ChildProcess)));
        // The connection was left untouched by all of the above.
        assert_eq!(client.state(), ConnectionState::Running);

        client.0.pid.set(nix::unistd::getpid());
        client.close().unwrap();
    }

    #[test]
    fn contradictory_configuration() {
        let (c, _s) = UnixStream::pair().unwrap();
        let guid = Guid::generate();
        let err = ConnectionBuilder::new()
            .unix_stream(c)
            .server(&guid)
            .bus_client()
            .build_nonblocking()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = ConnectionBuilder::new().build_nonblocking().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    #[timeout(15000)]
    fn send_before_running_is_queued() {
        let guid = Guid::generate();
        let (c, s) = UnixStream::pair().unwrap();
        let client = ConnectionBuilder::new()
            .unix_stream(c)
            .build_nonblocking()
            .unwrap();
        let server = ConnectionBuilder::new()
            .unix_stream(s)
            .server(&guid)
            .build_nonblocking()
            .unwrap();

        // Still opening; the message must be held until authentication ends.
        assert_eq!(client.state(), ConnectionState::Opening);
        let early = Message::signal(None, None, "/", "org.rbus.Test", "Early", &()).unwrap();
        let serial = client.send_message(early).unwrap();
        assert!(serial > 0);

        let got = Rc::new(Cell::new(false));
        let flag = got.clone();
        server.add_match(
            MatchRule::new()
                .msg_type(MessageType::Signal)
                .member("Early"),
            move |_, _| {
                flag.set(true);
                Ok(true)
            },
        );

        pump_until(&client, &server, |_, _| got.get());
    }

    #[test]
    #[timeout(15000)]
    fn filter_chain_mutation() {
        let (client, server) = p2p_pair();

        let first_calls = Rc::new(Cell::new(0u32));
        let second_calls = Rc::new(Cell::new(0u32));
        let first_id: Rc<RefCell<Option<super::FilterId>>> = Rc::new(RefCell::new(None));

        let calls = first_calls.clone();
        let id_slot = first_id.clone();
        let id = client.add_filter(move |conn, _| {
            calls.set(calls.get() + 1);
            // Remove ourselves mid-dispatch; the scan restarts without
            // running anyone twice.
            if let Some(id) = id_slot.borrow_mut().take() {
                assert!(conn.remove_filter(id));
            }
            Ok(false)
        });
        first_id.borrow_mut().replace(id);

        let calls = second_calls.clone();
        client.add_filter(move |_, _| {
            calls.set(calls.get() + 1);
            Ok(false)
        });

        server.emit_signal(None, "/", "org.rbus.Test", "One", &()).unwrap();
        server.emit_signal(None, "/", "org.rbus.Test", "Two", &()).unwrap();
        pump_until(&client, &server, |_, _| second_calls.get() >= 2);

        assert_eq!(first_calls.get(), 1);
        assert_eq!(second_calls.get(), 2);
    }

    #[test]
    #[timeout(15000)]
    fn match_chain_selectivity() {
        let (client, server) = p2p_pair();

        let hits = Rc::new(Cell::new(0u32));
        let misses = Rc::new(Cell::new(0u32));

        let counter = hits.clone();
        client.add_match(
            MatchRule::new().interface("org.rbus.Wanted"),
            move |_, _| {
                counter.set(counter.get() + 1);
                Ok(true)
            },
        );
        let counter = misses.clone();
        client.add_match(
            MatchRule::new().interface("org.rbus.Other"),
            move |_, _| {
                counter.set(counter.get() + 1);
                Ok(true)
            },
        );

        server.emit_signal(None, "/", "org.rbus.Wanted", "Hit", &()).unwrap();
        server.emit_signal(None, "/", "org.rbus.Wanted", "Hit", &()).unwrap();
        pump_until(&client, &server, |_, _| hits.get() >= 2);
        assert_eq!(misses.get(), 0);
    }

    #[test]
    #[timeout(15000)]
    fn events_and_timeout_inquiries() {
        let (client, server) = p2p_pair();

        assert_eq!(client.events(), PollFlags::POLLIN);
        assert!(client.timeout().is_none());

        server.add_filter(|_, _| Ok(true));
        let call = Message::method(None, None, "/", Some("org.rbus.Mute"), "Void", &()).unwrap();
        client
            .send_with_reply(call, Timeout::After(Duration::from_secs(3600)), |_, _| {})
            .unwrap();
        assert!(client.timeout().is_some());
    }

    #[test]
    #[timeout(15000)]
    fn close_is_terminal() {
        let (client, server) = p2p_pair();

        client.close().unwrap();
        assert_eq!(client.state(), ConnectionState::Closed);

        let msg = Message::signal(None, None, "/", "org.rbus.Test", "S", &()).unwrap();
        assert!(matches!(client.send_message(msg), Err(Error::NotConnected)));
        assert!(matches!(client.process(), Err(Error::NotConnected)));
        assert!(matches!(client.flush(), Err(Error::NotConnected)));
        assert!(matches!(client.close(), Ok(())));

        let _ = server;
    }

    #[test]
    #[timeout(15000)]
    fn call_queues_bystanders_in_order() {
        let guid = Guid::generate();
        let (p0, p1) = UnixStream::pair().unwrap();
        let (tx, rx) = mpsc::channel();

        let server_thread = thread::spawn(move || {
            let c = Connection::new_unix_server(p0, &guid).unwrap();
            // Two signals first, then answer the Ping: the client's blocking
            // call must skip past the signals and still preserve their order.
            let done = Rc::new(Cell::new(false));
            let flag = done.clone();
            c.set_object_handler(Box::new(move |conn, msg| {
                conn.reply(msg, &())?;
                flag.set(true);
                Ok(true)
            }));
            c.emit_signal(None, "/", "org.rbus.Test", "First", &()).unwrap();
            c.emit_signal(None, "/", "org.rbus.Test", "Second", &()).unwrap();
            while !done.get() {
                c.wait(Some(Duration::from_millis(100))).unwrap();
                c.process().unwrap();
            }
            c.flush().unwrap();
            rx.recv().unwrap();
        });

        let c = Connection::new_unix_client(p1, false).unwrap();
        let reply = c
            .call_method(None, "/", Some("org.rbus.Test"), "Ping", &())
            .unwrap();
        assert_eq!(reply.to_string(), "Method return");

        // The two signals are now sitting in the receive queue, in order.
        let order: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(vec![]));
        let sink = order.clone();
        c.add_filter(move |_, msg| {
            sink.borrow_mut()
                .push(msg.header()?.member()?.unwrap_or("").to_string());
            Ok(true)
        });
        while order.borrow().len() < 2 {
            c.process().unwrap();
        }
        assert_eq!(*order.borrow(), vec!["First".to_string(), "Second".to_string()]);

        tx.send(()).unwrap();
        server_thread.join().unwrap();
    }
}
