use std::collections::VecDeque;
use std::io;

use tracing::trace;

use crate::raw::Socket;
use crate::utils::padding_for_8_bytes;
use crate::{
    Error, Message, MessagePrimaryHeader, OwnedFd, Result, MAX_MESSAGE_SIZE, MIN_MESSAGE_SIZE,
};

/// Bound of the outgoing message queue.
pub const MAX_OUT_QUEUED: usize = 128;

/// A low-level representation of a D-Bus connection.
///
/// This wrapper is agnostic on the actual transport, using the [`Socket`]
/// trait to abstract it. It abstracts away the framing and buffering
/// considerations of the protocol, and allows interaction based on messages,
/// rather than bytes.
///
/// Both sides keep their partial-progress bookkeeping here: a partially read
/// frame stays in the input buffer across `WouldBlock`, and a partially
/// written message keeps its byte position until the socket accepts the rest.
///
/// [`Socket`]: trait.Socket.html
#[derive(Debug)]
pub struct Connection<S> {
    socket: S,
    raw_in_buffer: Vec<u8>,
    raw_in_pos: usize,
    raw_in_fds: Vec<OwnedFd>,
    out_pos: usize,
    out_msgs: VecDeque<Message>,
}

impl<S: Socket> Connection<S> {
    pub fn wrap(socket: S) -> Connection<S> {
        Self::with_leftover(socket, vec![])
    }

    /// Wrap a socket from which `leftover` bytes were already consumed (by the
    /// authentication handshake reading past its final line).
    pub fn with_leftover(socket: S, leftover: Vec<u8>) -> Connection<S> {
        Connection {
            socket,
            raw_in_pos: leftover.len(),
            raw_in_buffer: leftover,
            raw_in_fds: vec![],
            out_pos: 0,
            // Always room to park one partially-written message without
            // allocating.
            out_msgs: VecDeque::with_capacity(1),
        }
    }

    /// Attempt to flush the outgoing queue.
    ///
    /// This will try to write as many messages as possible from the outgoing
    /// queue into the socket, until a `WouldBlock` or an error is encountered.
    pub fn try_flush(&mut self) -> io::Result<()> {
        while let Some(msg) = self.out_msgs.front() {
            loop {
                let data = &msg.as_bytes()[self.out_pos..];
                if data.is_empty() {
                    self.out_pos = 0;
                    self.out_msgs.pop_front();
                    break;
                }
                // The fds travel with the first byte of the message.
                let fds = if self.out_pos == 0 { msg.fds() } else { vec![] };
                self.out_pos += self.socket.sendmsg(data, &fds)?;
            }
        }
        Ok(())
    }

    /// Enqueue a message to be sent out to the socket.
    ///
    /// This method will *not* write anything to the socket; call
    /// [`try_flush`] so that the message is actually sent out.
    ///
    /// [`try_flush`]: struct.Connection.html#method.try_flush
    pub fn enqueue_message(&mut self, msg: Message) -> Result<()> {
        if self.out_msgs.len() >= MAX_OUT_QUEUED {
            return Err(Error::QueueFull);
        }
        self.out_msgs.push_back(msg);
        Ok(())
    }

    pub fn has_outgoing(&self) -> bool {
        !self.out_msgs.is_empty()
    }

    /// Attempt to read a message from the socket.
    ///
    /// This methods will read from the socket until either a full D-Bus
    /// message is read or an error is encountered.
    ///
    /// If the socket is in non-blocking mode, it may read a partial message.
    /// In such case it will buffer it internally and try to complete it the
    /// next time you call `try_receive_message`.
    pub fn try_receive_message(&mut self) -> Result<Message> {
        if self.raw_in_pos < MIN_MESSAGE_SIZE {
            if self.raw_in_buffer.len() < MIN_MESSAGE_SIZE {
                self.raw_in_buffer.resize(MIN_MESSAGE_SIZE, 0);
            }
            // We don't have enough data to make a proper message header yet.
            // Some partial read may be in the buffer, so we try to complete it
            // until we have MIN_MESSAGE_SIZE bytes.
            while self.raw_in_pos < MIN_MESSAGE_SIZE {
                let (len, fds) = self
                    .socket
                    .recvmsg(&mut self.raw_in_buffer[self.raw_in_pos..])?;
                if len == 0 {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "failed to receive message",
                    )));
                }
                self.raw_in_fds.extend(fds);
                self.raw_in_pos += len;
            }
        }

        let (primary_header, fields_len) = MessagePrimaryHeader::read(&self.raw_in_buffer)?;
        let header_len = MIN_MESSAGE_SIZE + fields_len as usize;
        let body_padding = padding_for_8_bytes(header_len);
        let body_len = primary_header.body_len() as usize;
        let total_len = header_len + body_padding + body_len;
        if total_len > MAX_MESSAGE_SIZE {
            return Err(Error::Protocol(format!(
                "incoming message too large: {} bytes",
                total_len
            )));
        }

        // By this point we have a full fixed header, so we know the exact
        // length of the complete message.
        if self.raw_in_buffer.len() < total_len {
            self.raw_in_buffer.resize(total_len, 0);
        }

        // Now we have an incomplete message; read the rest.
        while self.raw_in_pos < total_len {
            let (read, fds) = self
                .socket
                .recvmsg(&mut self.raw_in_buffer[self.raw_in_pos..])?;
            if read == 0 {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "failed to receive message",
                )));
            }
            self.raw_in_fds.extend(fds);
            self.raw_in_pos += read;
        }

        // The message is complete. Bytes past `total_len` belong to the next
        // frame (a peer may pipeline); keep them for the next call.
        let mut bytes = std::mem::replace(&mut self.raw_in_buffer, vec![]);
        let fds = std::mem::replace(&mut self.raw_in_fds, vec![]);
        if self.raw_in_pos > total_len {
            self.raw_in_buffer = bytes[total_len..self.raw_in_pos].to_vec();
            bytes.truncate(total_len);
        }
        self.raw_in_pos = self.raw_in_buffer.len();
        trace!("received message: {} bytes, {} fds", bytes.len(), fds.len());
        Message::from_raw_parts(bytes, fds)
    }

    /// Close the connection.
    ///
    /// After this call, all reading and writing operations will fail.
    pub fn close(&self) -> Result<()> {
        self.socket.close().map_err(|e| e.into())
    }

    /// Access the underlying socket.
    ///
    /// This is intended for accessing properties of the socket (such as the
    /// fd to poll, or peer credentials); reading or writing through it
    /// directly may corrupt the framing state.
    pub fn socket(&self) -> &S {
        &self.socket
    }
}

#[cfg(test)]
mod tests {
    use super::Connection;
    use crate::Message;
    use std::os::unix::net::UnixStream;
    use test_log::test;

    #[test]
    fn raw_send_receive() {
        let (p0, p1) = UnixStream::pair().unwrap();

        let mut conn0 = Connection::wrap(p0);
        let mut conn1 = Connection::wrap(p1);

        let mut msg = Message::method(None, None, "/", Some("org.rbus.p2p"), "Test", &()).unwrap();
        msg.seal(1).unwrap();

        conn0.enqueue_message(msg).unwrap();
        conn0.try_flush().unwrap();

        let ret = conn1.try_receive_message().unwrap();
        assert_eq!(ret.to_string(), "Method call Test");
    }

    #[test]
    fn split_frame_reassembly() {
        // Drip-feed a message a few bytes at a time through a plain pipe-like
        // pair and make sure the framing layer stitches it back together.
        let (p0, p1) = UnixStream::pair().unwrap();

        let mut msg =
            Message::method(None, None, "/", Some("org.rbus.p2p"), "Chunky", &("payload"))
                .unwrap();
        msg.seal(1).unwrap();
        let bytes = msg.as_bytes().to_vec();

        p1.set_nonblocking(true).unwrap();
        let mut conn = Connection::wrap(p1);

        use std::io::Write;
        let mut writer = &p0;
        for chunk in bytes.chunks(7) {
            writer.write_all(chunk).unwrap();
            match conn.try_receive_message() {
                Ok(m) => {
                    assert_eq!(m.to_string(), "Method call Chunky");
                    return;
                }
                Err(e) => assert!(e.would_block(), "unexpected error: {}", e),
            }
        }
        panic!("message never completed");
    }

    #[test]
    fn queue_bound() {
        let (p0, _p1) = UnixStream::pair().unwrap();
        let mut conn = Connection::wrap(p0);

        for i in 0..super::MAX_OUT_QUEUED {
            let mut m = Message::signal(None, None, "/", "org.rbus.p2p", "Tick", &()).unwrap();
            m.seal(i as u32 + 1).unwrap();
            conn.enqueue_message(m).unwrap();
        }
        let mut m = Message::signal(None, None, "/", "org.rbus.p2p", "Tick", &()).unwrap();
        m.seal(super::MAX_OUT_QUEUED as u32 + 1).unwrap();
        assert!(matches!(
            conn.enqueue_message(m),
            Err(crate::Error::QueueFull)
        ));
    }
}
