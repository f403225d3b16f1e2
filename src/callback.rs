//! Callback adaptation.
//!
//! Rust closures do not survive a trip through a C-style
//! `(fn pointer, void*)` pair, and they must not unwind across the
//! dispatch loop. This module is the single boundary where user code is
//! entered: every handler is invoked through [`guard`], which catches a
//! panic, logs it and hands the payload back to the caller for routing.
//!
//! Two ownership policies are offered for stateful callbacks:
//!
//! * **owned** ([`TimerHandler::new`] etc.): the closure captures its
//!   state and the registration owns it until removed.
//! * **bound** ([`TimerHandler::bind`] etc.): the registration keeps a
//!   [`Weak`] reference to an `Rc<RefCell<T>>` target and calls a method
//!   on it. A firing after the target was dropped is silently skipped,
//!   so no dangling-context use is possible.

use std::any::Any;
use std::cell::RefCell;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use socket2::Socket;

use crate::event::EventFlags;

/// What a panicking callback threw.
pub type PanicPayload = Box<dyn Any + Send + 'static>;

/// Run `f`, catching a panic instead of letting it unwind into the
/// dispatch loop. Returns the payload so the caller decides where it
/// goes (dropped for event handlers, forwarded to the queue sink for
/// injected tasks).
pub(crate) fn guard<F: FnOnce()>(what: &str, f: F) -> Option<PanicPayload> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => None,
        Err(payload) => {
            log::warn!("panic in {} callback caught at dispatch boundary", what);
            Some(payload)
        }
    }
}

enum Inner {
    Mut(Box<dyn FnMut(Option<RawFd>, EventFlags)>),
    Once(Option<Box<dyn FnOnce(Option<RawFd>, EventFlags)>>),
}

/// Type-erased handler slot shared between a registration and the ready
/// queue. Cloning is cheap; the closure itself is never cloned.
#[derive(Clone)]
pub(crate) struct Handler(Rc<RefCell<Inner>>);

impl Handler {
    pub(crate) fn from_mut<F>(f: F) -> Self
    where
        F: FnMut(Option<RawFd>, EventFlags) + 'static,
    {
        Self(Rc::new(RefCell::new(Inner::Mut(Box::new(f)))))
    }

    pub(crate) fn from_once<F>(f: F) -> Self
    where
        F: FnOnce(Option<RawFd>, EventFlags) + 'static,
    {
        Self(Rc::new(RefCell::new(Inner::Once(Some(Box::new(f))))))
    }

    /// Invoke under [`guard`]. A handler that re-enters itself (its
    /// own callback activating the same registration synchronously and
    /// dispatching inline) is skipped rather than aliased.
    pub(crate) fn invoke(&self, fd: Option<RawFd>, what: EventFlags) {
        let mut inner = match self.0.try_borrow_mut() {
            Ok(inner) => inner,
            Err(_) => {
                log::warn!("re-entrant activation of a running handler skipped");
                return;
            }
        };

        match &mut *inner {
            Inner::Mut(f) => {
                guard("event", || f(fd, what));
            }
            Inner::Once(slot) => {
                if let Some(f) = slot.take() {
                    guard("one-shot", || f(fd, what));
                }
            }
        }
    }
}

/// Handler for pure timers. No fd, no flags.
pub struct TimerHandler(pub(crate) Handler);

impl TimerHandler {
    /// Owned closure.
    pub fn new<F>(mut f: F) -> Self
    where
        F: FnMut() + 'static,
    {
        Self(Handler::from_mut(move |_, _| f()))
    }

    /// Borrowed context: call `method` on `target` each time the timer
    /// fires, skipping the call if the target has been dropped.
    pub fn bind<T: 'static>(target: &Rc<RefCell<T>>, method: fn(&mut T)) -> Self {
        let weak = Rc::downgrade(target);
        Self(Handler::from_mut(move |_, _| bound_call(&weak, method)))
    }
}

impl<F: FnMut() + 'static> From<F> for TimerHandler {
    fn from(f: F) -> Self { Self::new(f) }
}

/// Handler for fd and signal events. Receives the fd (or `None` for a
/// signal slot, where the flags carry the signal view) and the fired
/// flag set.
pub struct GenericHandler(pub(crate) Handler);

impl GenericHandler {
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut(Option<RawFd>, EventFlags) + 'static,
    {
        Self(Handler::from_mut(f))
    }

    pub fn bind<T: 'static>(
        target: &Rc<RefCell<T>>,
        method: fn(&mut T, Option<RawFd>, EventFlags),
    ) -> Self {
        let weak = Rc::downgrade(target);
        Self(Handler::from_mut(move |fd, flags| {
            if let Some(rc) = weak.upgrade() {
                method(&mut rc.borrow_mut(), fd, flags);
            } else {
                log::debug!("bound handler target dropped, skipping");
            }
        }))
    }
}

impl<F: FnMut(Option<RawFd>, EventFlags) + 'static> From<F> for GenericHandler {
    fn from(f: F) -> Self { Self::new(f) }
}

/// Handler for accepted connections. Receives the connected socket and
/// the peer address.
pub struct AcceptorHandler(pub(crate) Box<dyn FnMut(Socket, SocketAddr)>);

impl AcceptorHandler {
    pub fn new<F>(f: F) -> Self
    where
        F: FnMut(Socket, SocketAddr) + 'static,
    {
        Self(Box::new(f))
    }

    pub fn bind<T: 'static>(
        target: &Rc<RefCell<T>>,
        method: fn(&mut T, Socket, SocketAddr),
    ) -> Self {
        let weak = Rc::downgrade(target);
        Self(Box::new(move |sock, addr| {
            if let Some(rc) = weak.upgrade() {
                method(&mut rc.borrow_mut(), sock, addr);
            } else {
                log::debug!("bound acceptor target dropped, skipping");
            }
        }))
    }
}

impl<F: FnMut(Socket, SocketAddr) + 'static> From<F> for AcceptorHandler {
    fn from(f: F) -> Self { Self::new(f) }
}

fn bound_call<T>(weak: &Weak<RefCell<T>>, method: fn(&mut T)) {
    if let Some(rc) = weak.upgrade() {
        method(&mut rc.borrow_mut());
    } else {
        log::debug!("bound handler target dropped, skipping");
    }
}
