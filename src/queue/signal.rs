//! Signal relay.
//!
//! Posix signal handlers may only touch async-signal-safe calls, so the
//! handler writes the signal number as a single byte into a nonblocking
//! self-pipe and the queue reads it back on its own thread. Dispositions
//! are process-global: one relay fd per signal number, stored in an
//! atomic table the handler can load without locking.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

const NSIG: usize = 64;

#[allow(clippy::declare_interior_mutable_const)]
const NO_FD: AtomicI32 = AtomicI32::new(-1);
static SIG_FDS: [AtomicI32; NSIG] = [NO_FD; NSIG];

extern "C" fn relay_handler(signum: libc::c_int) {
    let idx = signum as usize;
    if idx >= NSIG {
        return;
    }
    let fd = SIG_FDS[idx].load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    // write(2) is async-signal-safe; preserve errno around it
    unsafe {
        let saved = *libc::__errno_location();
        let byte = signum as u8;
        libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        *libc::__errno_location() = saved;
    }
}

/// Nonblocking self-pipe pair. The read end is registered with the
/// queue's multiplexer, the write end is handed to the handler table.
pub(crate) struct Relay {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Relay {
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    pub(crate) fn read_fd(&self) -> RawFd { self.read_fd }

    /// Drain all pending signal bytes.
    pub(crate) fn drain(&self) -> Vec<i32> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.read_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
            out.extend(buf[..n as usize].iter().map(|b| *b as i32));
        }
        out
    }

    /// Route `signum` through this relay.
    pub(crate) fn install(&self, signum: i32) -> io::Result<()> {
        let idx = signum as usize;
        if idx == 0 || idx >= NSIG {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        SIG_FDS[idx].store(self.write_fd, Ordering::Relaxed);

        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = relay_handler as usize;
            sa.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut sa.sa_mask);
            if libc::sigaction(signum, &sa, std::ptr::null_mut()) != 0 {
                SIG_FDS[idx].store(-1, Ordering::Relaxed);
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Restore the default disposition for `signum`.
    pub(crate) fn uninstall(&self, signum: i32) {
        let idx = signum as usize;
        if idx == 0 || idx >= NSIG {
            return;
        }
        // only tear down our own routing
        if SIG_FDS[idx].swap(-1, Ordering::Relaxed) != self.write_fd {
            return;
        }
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = libc::SIG_DFL;
            libc::sigemptyset(&mut sa.sa_mask);
            libc::sigaction(signum, &sa, std::ptr::null_mut());
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}
