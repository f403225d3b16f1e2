//! Readiness multiplexer.
//!
//! Thin layer over [`polling::Poller`] that owns nothing but the poller
//! handle: fds stay owned by their registrations, so every kernel call
//! goes through a transient [`BorrowedFd`]. The poller's default mode
//! is oneshot; the queue recomputes per-fd interest before every wait,
//! which turns oneshot delivery back into level-triggered semantics.

use std::io;
use std::os::unix::io::{BorrowedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use polling::{Event as PollEvent, Events, PollMode, Poller};

pub(crate) struct Mux {
    poller: Arc<Poller>,
}

/// Interest to install for one fd, the union over its registrations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Interest {
    pub read: bool,
    pub write: bool,
    pub edge: bool,
}

impl Interest {
    pub(crate) const NONE: Self = Self {
        read: false,
        write: false,
        edge: false,
    };

    pub(crate) fn is_none(&self) -> bool { !self.read && !self.write }
}

#[inline]
fn borrow(fd: RawFd) -> BorrowedFd<'static> {
    // the queue guarantees fd outlives its registration
    unsafe { BorrowedFd::borrow_raw(fd) }
}

impl Mux {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Arc::new(Poller::new()?),
        })
    }

    pub(crate) fn poller(&self) -> Arc<Poller> { self.poller.clone() }

    /// Install or update interest for `fd`, keyed by the fd itself.
    /// `registered` says whether the fd is already known to the poller.
    pub(crate) fn arm(&self, fd: RawFd, interest: Interest, registered: bool) -> io::Result<()> {
        let mut ev = PollEvent::none(fd as usize);
        ev.readable = interest.read;
        ev.writable = interest.write;

        let mode = if interest.edge {
            PollMode::Edge
        } else {
            PollMode::Oneshot
        };

        if registered {
            self.poller.modify_with_mode(borrow(fd), ev, mode)
        } else {
            unsafe { self.poller.add_with_mode(fd, ev, mode) }
        }
    }

    pub(crate) fn remove(&self, fd: RawFd) {
        // the fd may already be gone (closed by the owner); not fatal
        if let Err(e) = self.poller.delete(borrow(fd)) {
            log::debug!("deregister fd {}: {}", fd, e);
        }
    }

    pub(crate) fn wait(
        &self,
        events: &mut Events,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        events.clear();
        match self.poller.wait(events, timeout) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }
}
