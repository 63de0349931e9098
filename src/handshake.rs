//! The SASL authentication handshake that precedes the message stream on
//! every non-kernel transport.
//!
//! Both state machines here are resumable: they operate on non-blocking
//! sockets, return `WouldBlock` through [`advance_handshake`] whenever the
//! socket does, and are driven to completion either by an event loop (the
//! connection does this from its `Opening`/`Authenticating` states) or by
//! [`blocking_finish`].
//!
//! [`advance_handshake`]: struct.ClientHandshake.html#method.advance_handshake
//! [`blocking_finish`]: struct.ClientHandshake.html#method.blocking_finish

use nix::poll::PollFlags;
use tracing::trace;

use crate::raw::{Connection as RawConnection, Socket};
use crate::utils::wait_on;
use crate::{Error, Guid, Result};

/// The result of a finished handshake: the framed connection (carrying any
/// bytes read past the end of the handshake), the server GUID and the
/// negotiated unix-fd capability.
#[derive(Debug)]
pub struct Authenticated<S> {
    pub conn: RawConnection<S>,
    pub server_guid: Guid,
    pub cap_unix_fd: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum ClientHandshakeStep {
    Init,
    WaitingForOk,
    WaitingForAgreeFd,
    SendingBegin,
    Done,
}

/// A client-side SASL handshake.
#[derive(Debug)]
pub struct ClientHandshake<S> {
    socket: S,
    out_buffer: Vec<u8>,
    out_pos: usize,
    recv_buffer: Vec<u8>,
    step: ClientHandshakeStep,
    server_guid: Option<Guid>,
    cap_unix_fd: bool,
    negotiate_fds: bool,
    anonymous: bool,
}

impl<S: Socket> ClientHandshake<S> {
    /// Start a handshake on this client socket, authenticating with the
    /// `EXTERNAL` mechanism (peer credentials).
    pub fn new(socket: S) -> Self {
        Self::new_with(socket, false, true)
    }

    /// Start a handshake using the `ANONYMOUS` mechanism.
    pub fn new_anonymous(socket: S) -> Self {
        Self::new_with(socket, true, true)
    }

    pub fn new_with(socket: S, anonymous: bool, negotiate_fds: bool) -> Self {
        ClientHandshake {
            socket,
            out_buffer: vec![],
            out_pos: 0,
            recv_buffer: vec![],
            step: ClientHandshakeStep::Init,
            server_guid: None,
            cap_unix_fd: false,
            negotiate_fds,
            anonymous,
        }
    }

    /// Attempt to advance the handshake.
    ///
    /// In non-blocking mode, you need to invoke this method repeatedly until
    /// it returns `Ok(())`. Once it does, the handshake is finished and you
    /// can invoke [`try_finish`].
    ///
    /// Note that only the intended handshake status is reported in the error
    /// case: if the handshake is interrupted by `WouldBlock`, the error is
    /// transient and the same call must be retried once the socket is ready
    /// again.
    ///
    /// [`try_finish`]: struct.ClientHandshake.html#method.try_finish
    pub fn advance_handshake(&mut self) -> Result<()> {
        loop {
            self.flush_out_buffer()?;
            match self.step {
                ClientHandshakeStep::Init => {
                    let auth = if self.anonymous {
                        format!("\0AUTH ANONYMOUS {}\r\n", hex_encode(b"rbus"))
                    } else {
                        let uid = nix::unistd::getuid().to_string();
                        format!("\0AUTH EXTERNAL {}\r\n", hex_encode(uid.as_bytes()))
                    };
                    self.queue_write(auth.as_bytes());
                    self.step = ClientHandshakeStep::WaitingForOk;
                }
                ClientHandshakeStep::WaitingForOk => {
                    let line = self.read_command()?;
                    let mut words = line.split_whitespace();
                    match words.next() {
                        Some("OK") => {
                            let guid = words
                                .next()
                                .ok_or_else(|| Error::Handshake("OK without server GUID".into()))?
                                .parse::<Guid>()?;
                            self.server_guid = Some(guid);
                            if self.negotiate_fds && self.socket.can_pass_unix_fd() {
                                self.queue_write(b"NEGOTIATE_UNIX_FD\r\n");
                                self.step = ClientHandshakeStep::WaitingForAgreeFd;
                            } else {
                                self.queue_write(b"BEGIN\r\n");
                                self.step = ClientHandshakeStep::SendingBegin;
                            }
                        }
                        // The server wants a challenge round; EXTERNAL with an
                        // initial response has nothing more to say.
                        Some("DATA") => self.queue_write(b"DATA\r\n"),
                        Some("REJECTED") => {
                            return Err(Error::Handshake(format!(
                                "authentication rejected, server supports: {}",
                                words.collect::<Vec<_>>().join(" ")
                            )));
                        }
                        _ => {
                            return Err(Error::Handshake(format!(
                                "unexpected server reply: {}",
                                line
                            )));
                        }
                    }
                }
                ClientHandshakeStep::WaitingForAgreeFd => {
                    let line = self.read_command()?;
                    match line.split_whitespace().next() {
                        Some("AGREE_UNIX_FD") => self.cap_unix_fd = true,
                        Some("ERROR") => self.cap_unix_fd = false,
                        _ => {
                            return Err(Error::Handshake(format!(
                                "unexpected server reply: {}",
                                line
                            )));
                        }
                    }
                    self.queue_write(b"BEGIN\r\n");
                    self.step = ClientHandshakeStep::SendingBegin;
                }
                ClientHandshakeStep::SendingBegin => {
                    // flush_out_buffer above did the work.
                    trace!("client handshake done, cap_unix_fd: {}", self.cap_unix_fd);
                    self.step = ClientHandshakeStep::Done;
                }
                ClientHandshakeStep::Done => return Ok(()),
            }
        }
    }

    /// Attempt to finalize this handshake into an initialized connection.
    ///
    /// This method should only be called once `advance_handshake` has
    /// returned `Ok(())`; otherwise the handshake is returned back unchanged.
    pub fn try_finish(self) -> std::result::Result<Authenticated<S>, Self> {
        if self.step == ClientHandshakeStep::Done {
            let server_guid = self.server_guid.expect("server GUID not learned");
            Ok(Authenticated {
                conn: RawConnection::with_leftover(self.socket, self.recv_buffer),
                server_guid,
                cap_unix_fd: self.cap_unix_fd,
            })
        } else {
            Err(self)
        }
    }

    /// Block until the handshake is finished.
    pub fn blocking_finish(mut self) -> Result<Authenticated<S>> {
        loop {
            match self.advance_handshake() {
                Ok(()) => {
                    return self
                        .try_finish()
                        .map_err(|_| Error::Handshake("handshake not done".into()))
                }
                Err(e) if e.would_block() => {
                    let flags = if self.needs_write() {
                        PollFlags::POLLIN | PollFlags::POLLOUT
                    } else {
                        PollFlags::POLLIN
                    };
                    wait_on(self.socket.as_raw_fd(), flags)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Whether the handshake has pending bytes to write.
    pub fn needs_write(&self) -> bool {
        self.out_pos < self.out_buffer.len()
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    fn queue_write(&mut self, bytes: &[u8]) {
        self.out_buffer.extend_from_slice(bytes);
    }

    fn flush_out_buffer(&mut self) -> Result<()> {
        flush(&mut self.socket, &mut self.out_buffer, &mut self.out_pos)
    }

    fn read_command(&mut self) -> Result<String> {
        read_command(&mut self.socket, &mut self.recv_buffer)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum ServerHandshakeStep {
    WaitingForNull,
    WaitingForAuth,
    WaitingForBegin,
    Done,
}

/// A server-side SASL handshake.
///
/// Accepts `EXTERNAL` from the uid owning the other end of the socket, and
/// optionally `ANONYMOUS` from anyone.
#[derive(Debug)]
pub struct ServerHandshake<S> {
    socket: S,
    out_buffer: Vec<u8>,
    out_pos: usize,
    recv_buffer: Vec<u8>,
    step: ServerHandshakeStep,
    guid: Guid,
    client_uid: u32,
    accept_anonymous: bool,
    cap_unix_fd: bool,
}

impl<S: Socket> ServerHandshake<S> {
    pub fn new(socket: S, guid: Guid, client_uid: u32) -> Self {
        Self::new_with(socket, guid, client_uid, false)
    }

    pub fn new_with(socket: S, guid: Guid, client_uid: u32, accept_anonymous: bool) -> Self {
        ServerHandshake {
            socket,
            out_buffer: vec![],
            out_pos: 0,
            recv_buffer: vec![],
            step: ServerHandshakeStep::WaitingForNull,
            guid,
            client_uid,
            accept_anonymous,
            cap_unix_fd: false,
        }
    }

    /// Same contract as [`ClientHandshake::advance_handshake`].
    ///
    /// [`ClientHandshake::advance_handshake`]: struct.ClientHandshake.html#method.advance_handshake
    pub fn advance_handshake(&mut self) -> Result<()> {
        loop {
            flush(&mut self.socket, &mut self.out_buffer, &mut self.out_pos)?;
            match self.step {
                ServerHandshakeStep::WaitingForNull => {
                    if self.recv_buffer.is_empty() {
                        fill(&mut self.socket, &mut self.recv_buffer)?;
                    }
                    if self.recv_buffer[0] != 0 {
                        return Err(Error::Handshake(
                            "client did not start with a NUL byte".into(),
                        ));
                    }
                    self.recv_buffer.remove(0);
                    self.step = ServerHandshakeStep::WaitingForAuth;
                }
                ServerHandshakeStep::WaitingForAuth => {
                    let line = read_command(&mut self.socket, &mut self.recv_buffer)?;
                    let mut words = line.split_whitespace();
                    let ok = match (words.next(), words.next()) {
                        (Some("AUTH"), Some("EXTERNAL")) => match words.next() {
                            Some(resp) => hex_decode(resp)
                                .ok()
                                .and_then(|uid| String::from_utf8(uid).ok())
                                .and_then(|uid| uid.parse::<u32>().ok())
                                .map(|uid| uid == self.client_uid)
                                .unwrap_or(false),
                            None => false,
                        },
                        (Some("AUTH"), Some("ANONYMOUS")) => self.accept_anonymous,
                        _ => false,
                    };

                    if ok {
                        self.queue_write(format!("OK {}\r\n", self.guid).as_bytes());
                        self.step = ServerHandshakeStep::WaitingForBegin;
                    } else {
                        let mechs = if self.accept_anonymous {
                            "EXTERNAL ANONYMOUS"
                        } else {
                            "EXTERNAL"
                        };
                        self.queue_write(format!("REJECTED {}\r\n", mechs).as_bytes());
                    }
                }
                ServerHandshakeStep::WaitingForBegin => {
                    let line = read_command(&mut self.socket, &mut self.recv_buffer)?;
                    match line.split_whitespace().next() {
                        Some("BEGIN") => {
                            trace!("server handshake done, cap_unix_fd: {}", self.cap_unix_fd);
                            self.step = ServerHandshakeStep::Done;
                        }
                        Some("NEGOTIATE_UNIX_FD") => {
                            if self.socket.can_pass_unix_fd() {
                                self.cap_unix_fd = true;
                                self.queue_write(b"AGREE_UNIX_FD\r\n");
                            } else {
                                self.queue_write(b"ERROR fd passing not supported\r\n");
                            }
                        }
                        Some("CANCEL") | Some("ERROR") => {
                            self.cap_unix_fd = false;
                            let mechs = if self.accept_anonymous {
                                "EXTERNAL ANONYMOUS"
                            } else {
                                "EXTERNAL"
                            };
                            self.queue_write(format!("REJECTED {}\r\n", mechs).as_bytes());
                            self.step = ServerHandshakeStep::WaitingForAuth;
                        }
                        _ => {
                            return Err(Error::Handshake(format!(
                                "unexpected client command: {}",
                                line
                            )));
                        }
                    }
                }
                ServerHandshakeStep::Done => return Ok(()),
            }
        }
    }

    pub fn try_finish(self) -> std::result::Result<Authenticated<S>, Self> {
        if self.step == ServerHandshakeStep::Done {
            Ok(Authenticated {
                conn: RawConnection::with_leftover(self.socket, self.recv_buffer),
                server_guid: self.guid,
                cap_unix_fd: self.cap_unix_fd,
            })
        } else {
            Err(self)
        }
    }

    pub fn blocking_finish(mut self) -> Result<Authenticated<S>> {
        loop {
            match self.advance_handshake() {
                Ok(()) => {
                    return self
                        .try_finish()
                        .map_err(|_| Error::Handshake("handshake not done".into()))
                }
                Err(e) if e.would_block() => {
                    let flags = if self.needs_write() {
                        PollFlags::POLLIN | PollFlags::POLLOUT
                    } else {
                        PollFlags::POLLIN
                    };
                    wait_on(self.socket.as_raw_fd(), flags)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn needs_write(&self) -> bool {
        self.out_pos < self.out_buffer.len()
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    fn queue_write(&mut self, bytes: &[u8]) {
        self.out_buffer.extend_from_slice(bytes);
    }
}

fn flush<S: Socket>(socket: &mut S, buffer: &mut Vec<u8>, pos: &mut usize) -> Result<()> {
    while *pos < buffer.len() {
        *pos += socket.sendmsg(&buffer[*pos..], &[])?;
    }
    buffer.clear();
    *pos = 0;
    Ok(())
}

fn fill<S: Socket>(socket: &mut S, buffer: &mut Vec<u8>) -> Result<()> {
    let mut chunk = [0u8; 256];
    let (len, _fds) = socket.recvmsg(&mut chunk)?;
    if len == 0 {
        return Err(Error::Handshake("unexpected EOF during handshake".into()));
    }
    buffer.extend_from_slice(&chunk[..len]);
    Ok(())
}

/// Read one `\r\n`-terminated command line, leaving any surplus bytes in
/// `buffer` (they belong to the message stream once the handshake is over).
fn read_command<S: Socket>(socket: &mut S, buffer: &mut Vec<u8>) -> Result<String> {
    loop {
        if let Some(eol) = buffer.windows(2).position(|w| w == b"\r\n") {
            let line = buffer.drain(..eol + 2).take(eol).collect::<Vec<u8>>();
            return String::from_utf8(line)
                .map_err(|_| Error::Handshake("command line is not UTF-8".into()));
        }
        if buffer.len() > 8192 {
            return Err(Error::Handshake("command line too long".into()));
        }
        fill(socket, buffer)?;
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(Error::Handshake("odd-length hex string".into()));
    }
    s.as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = hex_digit(pair[0])?;
            let lo = hex_digit(pair[1])?;
            Ok(hi << 4 | lo)
        })
        .collect()
}

fn hex_digit(b: u8) -> Result<u8> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        _ => Err(Error::Handshake("invalid hex digit".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::{ClientHandshake, ServerHandshake};
    use crate::Guid;
    use std::os::unix::net::UnixStream;
    use test_log::test;

    #[test]
    fn client_server_roundtrip() {
        let guid = Guid::generate();
        let (client, server) = UnixStream::pair().unwrap();
        client.set_nonblocking(true).unwrap();
        server.set_nonblocking(true).unwrap();

        let mut client = ClientHandshake::new(client);
        let uid = u32::from(nix::unistd::getuid());
        let mut server = ServerHandshake::new(server, guid.clone(), uid);

        // Interleave the two non-blocking state machines until both finish.
        let mut client_done = false;
        let mut server_done = false;
        for _ in 0..100 {
            if !client_done {
                match client.advance_handshake() {
                    Ok(()) => client_done = true,
                    Err(e) => assert!(e.would_block(), "client failed: {}", e),
                }
            }
            if !server_done {
                match server.advance_handshake() {
                    Ok(()) => server_done = true,
                    Err(e) => assert!(e.would_block(), "server failed: {}", e),
                }
            }
            if client_done && server_done {
                break;
            }
        }
        assert!(client_done && server_done);

        let client = client.try_finish().unwrap();
        let server = server.try_finish().unwrap();
        assert_eq!(client.server_guid, guid);
        assert_eq!(server.server_guid, guid);
        assert!(client.cap_unix_fd);
        assert!(server.cap_unix_fd);
    }

    #[test]
    fn wrong_uid_rejected() {
        let guid = Guid::generate();
        let (client, server) = UnixStream::pair().unwrap();
        client.set_nonblocking(true).unwrap();
        server.set_nonblocking(true).unwrap();

        let mut client = ClientHandshake::new(client);
        let uid = u32::from(nix::unistd::getuid());
        let mut server = ServerHandshake::new(server, guid, uid.wrapping_add(1));

        let mut client_err = None;
        for _ in 0..100 {
            if client_err.is_none() {
                match client.advance_handshake() {
                    Ok(()) => panic!("client should have been rejected"),
                    Err(e) if e.would_block() => {}
                    Err(e) => {
                        client_err = Some(e);
                        break;
                    }
                }
            }
            match server.advance_handshake() {
                Ok(()) => panic!("server should not accept"),
                Err(e) => assert!(e.would_block(), "server failed hard: {}", e),
            }
        }
        match client_err {
            Some(crate::Error::Handshake(_)) => (),
            other => panic!("unexpected client result: {:?}", other.map(|e| e.to_string())),
        }
    }

    #[test]
    fn anonymous_accepted_when_configured() {
        let guid = Guid::generate();
        let (client, server) = UnixStream::pair().unwrap();
        client.set_nonblocking(true).unwrap();
        server.set_nonblocking(true).unwrap();

        let mut client = ClientHandshake::new_anonymous(client);
        let mut server = ServerHandshake::new_with(server, guid, 0, true);

        let mut client_done = false;
        let mut server_done = false;
        for _ in 0..100 {
            if !client_done && client.advance_handshake().is_ok() {
                client_done = true;
            }
            if !server_done && server.advance_handshake().is_ok() {
                server_done = true;
            }
            if client_done && server_done {
                break;
            }
        }
        assert!(client_done && server_done);
    }
}
