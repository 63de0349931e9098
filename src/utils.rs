use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags};

use crate::{Error, Result};

/// Maximum number of file descriptors a single message may carry.
pub(crate) const FDS_MAX: usize = 16;

/// The marshalling context for the D-Bus wire format, positioned `pos` bytes
/// into the output.
pub(crate) fn dbus_context(pos: usize) -> zvariant::EncodingContext<byteorder::NativeEndian> {
    zvariant::EncodingContext::new_dbus(pos)
}

pub(crate) fn padding_for_8_bytes(value: usize) -> usize {
    padding_for_n_bytes(value, 8)
}

pub(crate) fn padding_for_n_bytes(value: usize, align: usize) -> usize {
    let len_rounded_up = value.wrapping_add(align).wrapping_sub(1) & !align.wrapping_sub(1);

    len_rounded_up.wrapping_sub(value)
}

/// Block until `fd` reports one of `flags` (or an error condition).
pub(crate) fn wait_on(fd: RawFd, flags: PollFlags) -> Result<()> {
    poll_timeout(fd, flags, None).map(|_| ())
}

/// Poll `fd` for `flags`, waiting at most `timeout`. Returns whether the fd
/// became ready. EINTR restarts the poll with the remaining time.
pub(crate) fn poll_timeout(
    fd: RawFd,
    flags: PollFlags,
    timeout: Option<Duration>,
) -> Result<bool> {
    let deadline = timeout.map(|d| Instant::now() + d);

    loop {
        let millis = match deadline {
            None => -1,
            Some(d) => {
                let remaining = d.saturating_duration_since(Instant::now());
                // Round up so we never sleep short of the deadline, and
                // saturate to poll(2)'s i32.
                let ms = (remaining.as_micros() + 999) / 1000;
                std::cmp::min(ms, i32::max_value() as u128) as i32
            }
        };

        let mut fds = [PollFd::new(fd, flags)];
        match poll(&mut fds, millis) {
            Ok(0) => return Ok(false),
            Ok(_) => return Ok(true),
            Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => continue,
            Err(e) => return Err(Error::from(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::padding_for_8_bytes;

    #[test]
    fn padding() {
        assert_eq!(padding_for_8_bytes(0), 0);
        assert_eq!(padding_for_8_bytes(8), 0);
        assert_eq!(padding_for_8_bytes(9), 7);
        assert_eq!(padding_for_8_bytes(15), 1);
        assert_eq!(padding_for_8_bytes(16), 0);
    }
}
