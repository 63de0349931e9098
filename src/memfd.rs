//! A process-wide cache of anonymous memory file descriptors.
//!
//! Marshalling large message payloads (and staging them for the kernel
//! transport) wants sealable anonymous files; creating one per message is
//! needlessly expensive. This cache hands out memfds and takes them back,
//! from any thread. It is the only cross-thread facility in the crate.

use std::ffi::CString;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::{Error, OwnedFd, Result};

const CACHE_MAX: usize = 8;

static CACHE: Lazy<Mutex<Vec<OwnedFd>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Get a memfd, either from the cache or freshly created.
///
/// The descriptor is empty, cloexec and supports sealing.
pub fn acquire() -> Result<OwnedFd> {
    if let Ok(mut cache) = CACHE.lock() {
        if let Some(fd) = cache.pop() {
            return Ok(fd);
        }
    }

    let name = CString::new("rbus-memfd").expect("static name");
    let fd = unsafe {
        nix::libc::memfd_create(
            name.as_ptr(),
            nix::libc::MFD_CLOEXEC | nix::libc::MFD_ALLOW_SEALING,
        )
    };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Return a memfd obtained from [`acquire`].
///
/// The fd is truncated back to zero length and kept for reuse; when the cache
/// is full it is simply closed.
///
/// [`acquire`]: fn.acquire.html
pub fn release(fd: OwnedFd) {
    if nix::unistd::ftruncate(fd.as_raw_fd(), 0).is_err() {
        return;
    }
    if let Ok(mut cache) = CACHE.lock() {
        if cache.len() < CACHE_MAX {
            cache.push(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{acquire, release};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn acquire_release_reuse() {
        let fd = acquire().unwrap();
        assert!(fd.as_raw_fd() >= 0);
        nix::unistd::write(fd.as_raw_fd(), b"scratch").unwrap();
        release(fd);

        // The recycled fd must come back empty.
        let fd = acquire().unwrap();
        let stat = nix::sys::stat::fstat(fd.as_raw_fd()).unwrap();
        assert_eq!(stat.st_size, 0);
    }

    #[test]
    fn usable_across_threads() {
        let handle = std::thread::spawn(|| {
            let fd = acquire().unwrap();
            nix::unistd::write(fd.as_raw_fd(), b"other thread").unwrap();
            release(fd);
        });
        handle.join().unwrap();

        let fd = acquire().unwrap();
        release(fd);
    }
}
