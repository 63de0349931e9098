//! The kernel datagram transport.
//!
//! Unlike the stream transports, messages here are exchanged whole through
//! ioctls on a bus endpoint device: sends hand the serialized message to the
//! kernel, receives yield an offset into a connection-private memory-mapped
//! pool. There is no authentication handshake and no HELLO method call: the
//! unique name and the negotiated metadata capabilities are learned from the
//! HELLO ioctl issued on attach.
//!
//! A received message *borrows* its pool slot: the slot (and therefore the
//! endpoint fd and mapping) stays alive until the message is dropped, at
//! which point the slot is released back to the kernel with the FREE ioctl.

use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::rc::Rc;

use enumflags2::BitFlags;
use tracing::{debug, trace};

use crate::{memfd, Error, Message, OwnedFd, Result};

/// Size of the receive pool each connection maps.
const POOL_SIZE: usize = 16 * 1024 * 1024;

/// Payloads above this are staged in a memfd instead of being copied through
/// the ioctl.
const MEMFD_THRESHOLD: usize = 512 * 1024;

const IOC_MAGIC: u8 = 0x95;

/// Process metadata the kernel can attach to each delivered message.
#[repr(u64)]
#[derive(Copy, Clone, Debug, PartialEq, BitFlags)]
pub enum AttachFlags {
    Comm = 1 << 0,
    Exe = 1 << 1,
    Cmdline = 1 << 2,
    Cgroup = 1 << 3,
    Caps = 1 << 4,
    Selinux = 1 << 5,
    Audit = 1 << 6,
}

/// Endpoint capability bit reported by the HELLO ioctl.
const HELLO_ACCEPT_FD: u64 = 1 << 0;

#[repr(C)]
struct CmdHello {
    size: u64,
    flags: u64,
    attach_flags: u64,
    pool_size: u64,
    // Filled in by the kernel.
    id: u64,
    id128: [u8; 16],
}

#[repr(C)]
struct CmdSend {
    size: u64,
    flags: u64,
    msg_address: u64,
    msg_size: u64,
    memfd: i64,
}

#[repr(C)]
struct CmdRecv {
    size: u64,
    flags: u64,
    // Filled in by the kernel.
    msg_offset: u64,
    msg_size: u64,
}

#[repr(C)]
struct CmdFree {
    size: u64,
    flags: u64,
    offset: u64,
}

nix::ioctl_readwrite!(kernel_cmd_hello, IOC_MAGIC, 0x00, CmdHello);
nix::ioctl_readwrite!(kernel_cmd_send, IOC_MAGIC, 0x10, CmdSend);
nix::ioctl_readwrite!(kernel_cmd_recv, IOC_MAGIC, 0x11, CmdRecv);
nix::ioctl_write_ptr!(kernel_cmd_free, IOC_MAGIC, 0x12, CmdFree);

/// The endpoint fd together with its receive pool mapping.
///
/// Shared between the connection and every in-flight pool message, so the fd
/// outlives `close()` until the last borrowed slot is released.
#[derive(Debug)]
struct Endpoint {
    fd: OwnedFd,
    pool: *mut nix::libc::c_void,
    pool_size: usize,
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        unsafe {
            let _ = nix::sys::mman::munmap(self.pool, self.pool_size);
        }
        // The fd itself closes with OwnedFd.
    }
}

/// Keeps one received message's pool slot allocated.
#[derive(Debug)]
pub struct PoolSlot {
    endpoint: Rc<Endpoint>,
    offset: u64,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        let cmd = CmdFree {
            size: std::mem::size_of::<CmdFree>() as u64,
            flags: 0,
            offset: self.offset,
        };
        unsafe {
            let _ = kernel_cmd_free(self.endpoint.fd.as_raw_fd(), &cmd);
        }
    }
}

/// A connection to a kernel bus endpoint.
#[derive(Debug)]
pub struct Connection {
    endpoint: Rc<Endpoint>,
    unique_id: u64,
    attach_flags: BitFlags<AttachFlags>,
    can_pass_fds: bool,
}

impl Connection {
    /// Open the endpoint device, issue the HELLO ioctl and map the receive
    /// pool.
    pub fn attach(path: &str, attach_flags: BitFlags<AttachFlags>) -> Result<Self> {
        use nix::fcntl::OFlag;
        use nix::sys::stat::Mode;

        let fd = nix::fcntl::open(
            path,
            OFlag::O_RDWR | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut hello = CmdHello {
            size: std::mem::size_of::<CmdHello>() as u64,
            flags: 0,
            attach_flags: attach_flags.bits(),
            pool_size: POOL_SIZE as u64,
            id: 0,
            id128: [0; 16],
        };
        unsafe { kernel_cmd_hello(fd.as_raw_fd(), &mut hello) }?;

        let pool = unsafe {
            nix::sys::mman::mmap(
                std::ptr::null_mut(),
                POOL_SIZE,
                nix::sys::mman::ProtFlags::PROT_READ,
                nix::sys::mman::MapFlags::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        }?;

        let negotiated = BitFlags::from_bits(hello.attach_flags & !HELLO_ACCEPT_FD)
            .map_err(|_| Error::Protocol("unknown attach flags from kernel".into()))?;
        debug!(
            "attached to kernel bus, id {}, attach flags {:?}",
            hello.id, negotiated
        );

        Ok(Connection {
            endpoint: Rc::new(Endpoint {
                fd,
                pool,
                pool_size: POOL_SIZE,
            }),
            unique_id: hello.id,
            attach_flags: negotiated,
            can_pass_fds: hello.attach_flags & HELLO_ACCEPT_FD != 0,
        })
    }

    /// The unique name the kernel assigned on attach.
    pub fn unique_name(&self) -> String {
        format!(":1.{}", self.unique_id)
    }

    /// The metadata items the kernel will attach to delivered messages.
    pub fn attach_flags(&self) -> BitFlags<AttachFlags> {
        self.attach_flags
    }

    /// Whether the endpoint accepts file descriptors in messages.
    pub fn can_pass_fds(&self) -> bool {
        self.can_pass_fds
    }

    /// Hand a sealed message to the kernel. Datagram semantics: the send is
    /// complete or it failed, there are no partial writes.
    pub fn send(&self, msg: &Message) -> Result<()> {
        let bytes = msg.as_bytes();

        let mut staged = None;
        if bytes.len() > MEMFD_THRESHOLD {
            let fd = memfd::acquire()?;
            let mut written = 0;
            while written < bytes.len() {
                written += nix::unistd::write(fd.as_raw_fd(), &bytes[written..])?;
            }
            staged = Some(fd);
        }

        let mut cmd = CmdSend {
            size: std::mem::size_of::<CmdSend>() as u64,
            flags: 0,
            msg_address: if staged.is_some() {
                0
            } else {
                bytes.as_ptr() as u64
            },
            msg_size: bytes.len() as u64,
            memfd: staged.as_ref().map(|fd| fd.as_raw_fd() as i64).unwrap_or(-1),
        };
        unsafe { kernel_cmd_send(self.endpoint.fd.as_raw_fd(), &mut cmd) }?;

        if let Some(fd) = staged {
            memfd::release(fd);
        }
        trace!("kernel send: {} bytes", bytes.len());
        Ok(())
    }

    /// Attempt to receive one message from the endpoint queue.
    pub fn try_receive_message(&self) -> Result<Message> {
        let mut cmd = CmdRecv {
            size: std::mem::size_of::<CmdRecv>() as u64,
            flags: 0,
            msg_offset: 0,
            msg_size: 0,
        };
        unsafe { kernel_cmd_recv(self.endpoint.fd.as_raw_fd(), &mut cmd) }?;

        if cmd.msg_offset as usize + cmd.msg_size as usize > self.endpoint.pool_size {
            return Err(Error::Protocol("message outside receive pool".into()));
        }

        let bytes = unsafe {
            std::slice::from_raw_parts(
                (self.endpoint.pool as *const u8).add(cmd.msg_offset as usize),
                cmd.msg_size as usize,
            )
        }
        .to_vec();

        let slot = PoolSlot {
            endpoint: self.endpoint.clone(),
            offset: cmd.msg_offset,
        };

        Message::from_pool(bytes, vec![], slot)
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.endpoint.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::{CmdFree, CmdHello, CmdRecv, CmdSend};

    // The command structs cross an ABI boundary; their layout is load-bearing.
    #[test]
    fn command_sizes() {
        assert_eq!(std::mem::size_of::<CmdHello>(), 48);
        assert_eq!(std::mem::size_of::<CmdSend>(), 40);
        assert_eq!(std::mem::size_of::<CmdRecv>(), 32);
        assert_eq!(std::mem::size_of::<CmdFree>(), 24);
    }

    #[test]
    fn attach_unavailable() {
        // No kernel bus on a normal system; attach must fail cleanly.
        let err = super::Connection::attach(
            "/dev/this-bus-does-not-exist",
            enumflags2::BitFlags::empty(),
        )
        .unwrap_err();
        assert!(matches!(err, crate::Error::Io(_)));
    }
}
