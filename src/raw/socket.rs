use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::cmsg_space;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use nix::sys::uio::IoVec;

use crate::utils::FDS_MAX;
use crate::OwnedFd;

fn nix_to_io(err: nix::Error) -> io::Error {
    err.as_errno()
        .map(|e| io::Error::from_raw_os_error(e as i32))
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, err.to_string()))
}

fn fd_recvmsg(fd: RawFd, buffer: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    let iov = [IoVec::from_mut_slice(buffer)];
    let mut cmsgspace = cmsg_space!([RawFd; FDS_MAX]);

    match recvmsg(fd, &iov, Some(&mut cmsgspace), MsgFlags::MSG_CMSG_CLOEXEC) {
        Ok(msg) => {
            let mut fds = vec![];
            for cmsg in msg.cmsgs() {
                if let ControlMessageOwned::ScmRights(fd) = cmsg {
                    fds.extend(fd.iter().map(|&f| unsafe { OwnedFd::from_raw_fd(f) }));
                } else {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unexpected CMSG kind",
                    ));
                }
            }
            Ok((msg.bytes, fds))
        }
        Err(e) => Err(nix_to_io(e)),
    }
}

fn fd_sendmsg(fd: RawFd, buffer: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    let cmsg = if !fds.is_empty() {
        vec![ControlMessage::ScmRights(fds)]
    } else {
        vec![]
    };
    let iov = [IoVec::from_slice(buffer)];
    match sendmsg(fd, &iov, &cmsg, MsgFlags::empty(), None) {
        Ok(0) => Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "failed to write to buffer",
        )),
        Ok(n) => Ok(n),
        Err(e) => Err(nix_to_io(e)),
    }
}

/// Trait representing some transport layer over which the D-Bus protocol can
/// be used.
///
/// Both reads and writes are expected to operate non-blocking and return
/// `WouldBlock` rather than wait; readiness is the caller's problem, driven
/// through the connection's event-mask and timeout inquiries.
///
/// Implementations are provided for `UnixStream` (with file descriptor
/// passing via SCM_RIGHTS) and `TcpStream` (which rejects descriptors). You
/// can implement it manually to tunnel D-Bus over other byte streams.
pub trait Socket: std::fmt::Debug {
    /// Supports passing file descriptors.
    fn can_pass_unix_fd(&self) -> bool {
        true
    }

    /// Attempt to receive bytes from the socket.
    ///
    /// On success, returns the number of bytes read as well as any file
    /// descriptors that accompanied them.
    fn recvmsg(&mut self, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)>;

    /// Attempt to send bytes on the socket.
    ///
    /// On success, returns the number of bytes written. The write may be
    /// partial, in which case the caller resubmits the remainder (without
    /// the descriptors, which travel with the first byte).
    ///
    /// If the transport cannot carry descriptors, this returns
    /// `ErrorKind::InvalidInput`.
    fn sendmsg(&mut self, buffer: &[u8], fds: &[RawFd]) -> io::Result<usize>;

    /// Close the socket.
    ///
    /// After this call, all reading and writing operations will fail.
    fn close(&self) -> io::Result<()>;

    /// The raw file descriptor backing this transport, for polling.
    fn as_raw_fd(&self) -> RawFd;
}

impl Socket for Box<dyn Socket> {
    fn can_pass_unix_fd(&self) -> bool {
        (&**self).can_pass_unix_fd()
    }

    fn recvmsg(&mut self, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
        (&mut **self).recvmsg(buf)
    }

    fn sendmsg(&mut self, buffer: &[u8], fds: &[RawFd]) -> io::Result<usize> {
        (&mut **self).sendmsg(buffer, fds)
    }

    fn close(&self) -> io::Result<()> {
        (&**self).close()
    }

    fn as_raw_fd(&self) -> RawFd {
        (&**self).as_raw_fd()
    }
}

impl Socket for UnixStream {
    fn recvmsg(&mut self, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
        loop {
            match fd_recvmsg(std::os::unix::io::AsRawFd::as_raw_fd(self), buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                v => return v,
            }
        }
    }

    fn sendmsg(&mut self, buffer: &[u8], fds: &[RawFd]) -> io::Result<usize> {
        loop {
            match fd_sendmsg(std::os::unix::io::AsRawFd::as_raw_fd(self), buffer, fds) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                v => return v,
            }
        }
    }

    fn close(&self) -> io::Result<()> {
        self.shutdown(std::net::Shutdown::Both)
    }

    fn as_raw_fd(&self) -> RawFd {
        std::os::unix::io::AsRawFd::as_raw_fd(self)
    }
}

impl Socket for TcpStream {
    fn can_pass_unix_fd(&self) -> bool {
        false
    }

    fn recvmsg(&mut self, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
        loop {
            match self.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
                Ok(len) => return Ok((len, vec![])),
            }
        }
    }

    fn sendmsg(&mut self, buffer: &[u8], fds: &[RawFd]) -> io::Result<usize> {
        if !fds.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "fds cannot be sent over a tcp stream",
            ));
        }

        loop {
            match self.write(buffer) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                v => return v,
            }
        }
    }

    fn close(&self) -> io::Result<()> {
        self.shutdown(std::net::Shutdown::Both)
    }

    fn as_raw_fd(&self) -> RawFd {
        std::os::unix::io::AsRawFd::as_raw_fd(self)
    }
}
