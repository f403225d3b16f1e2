//! Listening sockets.
//!
//! A [`Listener`] owns a bound, nonblocking TCP socket and a persistent
//! read registration on the queue. Each readiness firing drains the
//! accept backlog completely; accepted connections come out nonblocking
//! and go straight to the acceptor callback.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::callback::{AcceptorHandler, GenericHandler};
use crate::error::{Error, Result};
use crate::event::{Event, EventFlags};
use crate::queue::EventQueue;

struct ListenerInner {
    sock: Socket,
    acceptor: RefCell<AcceptorHandler>,
}

pub struct Listener {
    inner: Rc<ListenerInner>,
    event: Event,
}

impl Listener {
    /// Bind `addr`, start listening and arm the accept event. The
    /// socket gets `SO_REUSEADDR` so a restart does not trip over
    /// TIME_WAIT.
    pub fn bind(
        queue: &EventQueue,
        addr: SocketAddr,
        backlog: i32,
        acceptor: AcceptorHandler,
    ) -> Result<Self> {
        let domain = Domain::for_address(addr);
        let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| Error::init("listener socket", e))?;
        sock.set_reuse_address(true)
            .map_err(|e| Error::init("listener reuseaddr", e))?;
        sock.set_nonblocking(true)
            .map_err(|e| Error::init("listener nonblocking", e))?;
        sock.bind(&SockAddr::from(addr))
            .map_err(|e| Error::init("listener bind", e))?;
        sock.listen(backlog)
            .map_err(|e| Error::init("listener listen", e))?;

        let inner = Rc::new(ListenerInner {
            sock,
            acceptor: RefCell::new(acceptor),
        });

        let fd = {
            use std::os::unix::io::AsRawFd;
            inner.sock.as_raw_fd()
        };
        let handler = {
            let inner = inner.clone();
            GenericHandler::new(move |_, _| accept_burst(&inner))
        };
        let event = Event::new(
            queue,
            fd,
            EventFlags::READ | EventFlags::PERSIST,
            handler,
        );
        event.add()?;

        Ok(Self { inner, event })
    }

    /// Resume accepting after [`disable`](Self::disable).
    pub fn enable(&self) -> Result<()> {
        self.event.add()
    }

    /// Stop accepting; the kernel keeps queueing up to the backlog.
    pub fn disable(&self) {
        self.event.remove();
    }

    /// Release the listening socket now instead of at drop.
    pub fn close(self) {}

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let addr = self
            .inner
            .sock
            .local_addr()
            .map_err(|e| Error::io("listener local addr", e))?;
        addr.as_socket().ok_or_else(|| {
            Error::io(
                "listener local addr",
                io::Error::new(io::ErrorKind::InvalidData, "non-inet local address"),
            )
        })
    }

    /// Swap in a new acceptor for future connections.
    pub fn set_acceptor(&self, acceptor: AcceptorHandler) {
        *self.inner.acceptor.borrow_mut() = acceptor;
    }
}

/// Accept until the backlog runs dry.
fn accept_burst(inner: &Rc<ListenerInner>) {
    loop {
        let (sock, addr) = match inner.sock.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // the peer gave up while queued; not our error
            Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => continue,
            Err(e) => {
                log::error!("accept failed: {}", e);
                break;
            }
        };

        if let Err(e) = sock.set_nonblocking(true) {
            log::error!("accepted socket setup failed: {}", e);
            continue;
        }
        let Some(addr) = addr.as_socket() else {
            log::debug!("accepted non-inet peer dropped");
            continue;
        };

        (inner.acceptor.borrow_mut().0)(sock, addr);
    }
}
