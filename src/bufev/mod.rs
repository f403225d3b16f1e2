//! Buffered sockets.
//!
//! A [`BufferEvent`] owns a nonblocking socket plus an input and an
//! output buffer. The queue fills the input buffer and drains the
//! output buffer as readiness allows; user code only ever touches the
//! buffers. Progress is reported through three optional callbacks:
//!
//! * read: the input buffer grew past the low watermark
//! * write: the output buffer drained completely
//! * event: status changes as [`EventFlags`] (CONNECTED, EOF, ERROR,
//!   TIMEOUT, each paired with READING/WRITING where it applies)
//!
//! [`BufferEventRef`] is the non-owning alias handed to callbacks; it
//! shares the same state but does not close the socket on drop. The
//! owning handle derefs to it, so the full API is in one place.
//!
//! The TLS variant ([`BufferEvent::new_tls`]) keeps the identical
//! surface; encryption is a transport detail.

mod tls;

pub use tls::TlsConnector;

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::ops::Deref;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::callback::{guard, Handler};
use crate::dns::{pick_addr, Dns, Family};
use crate::error::{Error, Result, DNS_ERR_NONE, DNS_ERR_NOTEXIST};
use crate::event::EventFlags;
use crate::queue::{Core, EventQueue, Registration, SlotId};

use tls::{TlsChannel, TlsRead};

type ReadCb = Rc<RefCell<Box<dyn FnMut(&BufferEventRef)>>>;
type EventCb = Rc<RefCell<Box<dyn FnMut(&BufferEventRef, EventFlags)>>>;

const READ_CHUNK: usize = 8192;

enum Channel {
    Empty,
    Plain(Socket),
    Tls(Box<TlsChannel>),
}

impl Channel {
    fn fd(&self) -> Option<RawFd> {
        match self {
            Channel::Empty => None,
            Channel::Plain(sock) => Some(sock.as_raw_fd()),
            Channel::Tls(ch) => Some(ch.sock.as_raw_fd()),
        }
    }

    fn socket(&self) -> Option<&Socket> {
        match self {
            Channel::Empty => None,
            Channel::Plain(sock) => Some(sock),
            Channel::Tls(ch) => Some(&ch.sock),
        }
    }
}

struct TlsParams {
    connector: TlsConnector,
    server_name: String,
}

struct Inner {
    channel: Channel,
    tls: Option<TlsParams>,
    slot: Option<SlotId>,
    enabled: EventFlags,
    input: Vec<u8>,
    output: Vec<u8>,
    wm_low: usize,
    /// 0 means unlimited.
    wm_high: usize,
    timeout_read: Option<Duration>,
    timeout_write: Option<Duration>,
    /// Direction of the deadline last armed (READING, WRITING, or NONE).
    timeout_dir: EventFlags,
    connecting: bool,
    eof: bool,
    errored: bool,
    dns_code: i32,
    read_cb: Option<ReadCb>,
    write_cb: Option<ReadCb>,
    event_cb: Option<EventCb>,
}

impl Inner {
    fn fresh(tls: Option<TlsParams>) -> Self {
        Self {
            channel: Channel::Empty,
            tls,
            slot: None,
            // write is on by default, read must be enabled explicitly
            enabled: EventFlags::WRITE,
            input: Vec::new(),
            output: Vec::new(),
            wm_low: 0,
            wm_high: 0,
            timeout_read: None,
            timeout_write: None,
            timeout_dir: EventFlags::NONE,
            connecting: false,
            eof: false,
            errored: false,
            dns_code: DNS_ERR_NONE,
            read_cb: None,
            write_cb: None,
            event_cb: None,
        }
    }

    fn above_high(&self) -> bool {
        self.wm_high > 0 && self.input.len() >= self.wm_high
    }

    fn read_limit(&self) -> usize {
        if self.wm_high > 0 {
            self.wm_high
        } else {
            usize::MAX
        }
    }

    /// The nearest deadline and which direction it belongs to.
    fn next_timeout(&self) -> (Option<Duration>, EventFlags) {
        let read = (self.enabled.contains(EventFlags::READ) && !self.eof)
            .then_some(self.timeout_read)
            .flatten();
        let write = (self.connecting
            || (self.enabled.contains(EventFlags::WRITE) && !self.output.is_empty()))
        .then_some(self.timeout_write)
        .flatten();
        match (read, write) {
            (Some(r), Some(w)) if w < r => (Some(w), EventFlags::WRITING),
            (Some(r), _) => (Some(r), EventFlags::READING),
            (None, Some(w)) => (Some(w), EventFlags::WRITING),
            (None, None) => (None, EventFlags::NONE),
        }
    }
}

/// Which kernel interest the current state calls for.
fn wanted(inner: &Inner) -> (bool, bool) {
    if inner.errored {
        return (false, false);
    }
    match &inner.channel {
        Channel::Empty => (false, false),
        _ if inner.connecting => (false, true),
        Channel::Plain(_) => (
            inner.enabled.contains(EventFlags::READ) && !inner.eof && !inner.above_high(),
            inner.enabled.contains(EventFlags::WRITE) && !inner.output.is_empty(),
        ),
        Channel::Tls(ch) => {
            let read = !inner.eof
                && (ch.is_handshaking()
                    || (inner.enabled.contains(EventFlags::READ) && !inner.above_high()));
            let write = ch.wants_write()
                || (inner.enabled.contains(EventFlags::WRITE) && !inner.output.is_empty());
            (read, write)
        }
    }
}

enum Act {
    Read,
    Write,
    Event(EventFlags),
}

enum ReadEnd {
    Fine,
    Eof,
    Failed(io::Error),
}

/// Non-owning handle to a buffered socket. Clones share state; none of
/// them closes the socket on drop.
#[derive(Clone)]
pub struct BufferEventRef {
    inner: Rc<RefCell<Inner>>,
    core: Weak<Core>,
}

impl BufferEventRef {
    fn core(&self) -> Rc<Core> {
        self.core
            .upgrade()
            .expect("buffer event used after its queue was dropped")
    }

    /// Begin a nonblocking connect. Creates the socket if none exists
    /// yet; completion (or failure) is reported through the event
    /// callback as CONNECTED or ERROR.
    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            let inner = &mut *inner;

            let conn = match &inner.tls {
                Some(params) => Some(params.connector.start(&params.server_name)?),
                None => None,
            };

            let sock = match std::mem::replace(&mut inner.channel, Channel::Empty) {
                Channel::Empty => {
                    let sock = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
                        .map_err(|e| Error::io("socket", e))?;
                    sock.set_nonblocking(true)
                        .map_err(|e| Error::io("set nonblocking", e))?;
                    sock
                }
                Channel::Plain(sock) => sock,
                Channel::Tls(ch) => {
                    inner.channel = Channel::Tls(ch);
                    return Err(Error::io(
                        "connect",
                        io::Error::from(io::ErrorKind::AlreadyExists),
                    ));
                }
            };

            match sock.connect(&addr.into()) {
                Ok(()) => {}
                Err(e)
                    if e.raw_os_error() == Some(libc::EINPROGRESS)
                        || e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    inner.errored = true;
                    inner.channel = Channel::Plain(sock);
                    return Err(Error::io("connect", e));
                }
            }

            inner.connecting = true;
            inner.eof = false;
            inner.channel = match conn {
                Some(conn) => Channel::Tls(Box::new(TlsChannel::new(sock, conn))),
                None => Channel::Plain(sock),
            };
        }

        if self.inner.borrow().slot.is_none() {
            self.register();
        }
        self.refresh();
        Ok(())
    }

    /// Resolve `host` through `dns`, then connect to the first address
    /// matching `family`. Resolution failures surface through the event
    /// callback as ERROR, with the code available from
    /// [`dns_error`](Self::dns_error). For a TLS socket the server name
    /// follows the hostname.
    pub fn connect_hostname(
        &self,
        dns: &Dns,
        family: Family,
        host: &str,
        port: u16,
    ) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            if let Some(params) = &mut inner.tls {
                params.server_name = host.to_owned();
            }
            inner.dns_code = DNS_ERR_NONE;
        }

        let weak = Rc::downgrade(&self.inner);
        let core = self.core.clone();
        dns.resolve(host, move |lookup| {
            let Some(inner) = weak.upgrade() else { return };
            let href = BufferEventRef { inner, core };

            match lookup {
                Err(code) => {
                    {
                        let mut inner = href.inner.borrow_mut();
                        inner.dns_code = code;
                        inner.errored = true;
                    }
                    href.emit(EventFlags::ERROR);
                }
                Ok(addrs) => match pick_addr(&addrs, family, port) {
                    None => {
                        {
                            let mut inner = href.inner.borrow_mut();
                            inner.dns_code = DNS_ERR_NOTEXIST;
                            inner.errored = true;
                        }
                        href.emit(EventFlags::ERROR);
                    }
                    Some(addr) => {
                        if let Err(e) = href.connect(addr) {
                            log::debug!("connect after resolve failed: {}", e);
                            href.inner.borrow_mut().errored = true;
                            href.emit(EventFlags::ERROR);
                        }
                    }
                },
            }
        })
    }

    /// Install the three progress callbacks, replacing any previous
    /// set. `None` clears a callback.
    pub fn set_callbacks(
        &self,
        read: Option<Box<dyn FnMut(&BufferEventRef)>>,
        write: Option<Box<dyn FnMut(&BufferEventRef)>>,
        event: Option<Box<dyn FnMut(&BufferEventRef, EventFlags)>>,
    ) {
        let mut inner = self.inner.borrow_mut();
        inner.read_cb = read.map(|f| Rc::new(RefCell::new(f)));
        inner.write_cb = write.map(|f| Rc::new(RefCell::new(f)));
        inner.event_cb = event.map(|f| Rc::new(RefCell::new(f)));
    }

    /// Enable READ and/or WRITE. Enabling READ with enough buffered
    /// input already present delivers the read callback on the next
    /// dispatch iteration.
    pub fn enable(&self, what: EventFlags) {
        let deliver = {
            let mut inner = self.inner.borrow_mut();
            let newly_read =
                what.contains(EventFlags::READ) && !inner.enabled.contains(EventFlags::READ);
            inner.enabled |= what & (EventFlags::READ | EventFlags::WRITE);
            newly_read
                && inner.read_cb.is_some()
                && !inner.input.is_empty()
                && inner.input.len() >= inner.wm_low
        };
        self.refresh();
        if deliver {
            self.defer_read_delivery();
        }
    }

    pub fn disable(&self, what: EventFlags) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.enabled = inner.enabled.without(what);
        }
        self.refresh();
    }

    pub fn enabled(&self) -> EventFlags {
        self.inner.borrow().enabled
    }

    /// Read-direction watermarks. The read callback fires only once the
    /// input buffer holds at least `low` bytes; reading from the socket
    /// stops while it holds `high` or more (`0` = unlimited).
    pub fn set_watermark(&self, low: usize, high: usize) {
        let deliver = {
            let mut inner = self.inner.borrow_mut();
            inner.wm_low = low;
            inner.wm_high = high;
            inner.enabled.contains(EventFlags::READ)
                && inner.read_cb.is_some()
                && !inner.input.is_empty()
                && inner.input.len() >= low
        };
        self.refresh();
        if deliver {
            self.defer_read_delivery();
        }
    }

    /// Inactivity timeouts per direction. A timeout fires the event
    /// callback with TIMEOUT and disables further I/O until re-enabled.
    pub fn set_timeout(&self, read: Option<Duration>, write: Option<Duration>) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.timeout_read = read;
            inner.timeout_write = write;
        }
        self.refresh();
    }

    /// Append to the output buffer; the queue flushes it as the socket
    /// allows.
    pub fn write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.inner.borrow_mut().output.extend_from_slice(data);
        self.refresh();
    }

    /// Take the whole input buffer.
    pub fn read(&self) -> Vec<u8> {
        let out = std::mem::take(&mut self.inner.borrow_mut().input);
        self.refresh();
        out
    }

    /// Operate on the input buffer in place; parsers drain what they
    /// consume and leave the rest.
    pub fn with_input<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        let r = f(&mut self.inner.borrow_mut().input);
        self.refresh();
        r
    }

    pub fn input_len(&self) -> usize {
        self.inner.borrow().input.len()
    }

    pub fn output_len(&self) -> usize {
        self.inner.borrow().output.len()
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.inner.borrow().channel.fd()
    }

    /// DNS_ERR_* code of the last [`connect_hostname`](Self::connect_hostname)
    /// failure, or [`DNS_ERR_NONE`].
    pub fn dns_error(&self) -> i32 {
        self.inner.borrow().dns_code
    }

    fn register(&self) {
        let core = self.core();
        let fd = self
            .inner
            .borrow()
            .channel
            .fd()
            .expect("registering a buffer event without a socket");
        let href = self.clone();
        let handler = Handler::from_mut(move |_, what| pump(&href, what));
        let slot = core.insert(Registration::new(
            Some(fd),
            None,
            EventFlags::READ | EventFlags::WRITE | EventFlags::PERSIST,
            handler,
        ));
        self.inner.borrow_mut().slot = Some(slot);
    }

    /// Reconcile the registration with the current state: interest,
    /// deadline, or fully disarmed when there is nothing to wait for.
    fn refresh(&self) {
        let Some(core) = self.core.upgrade() else { return };
        let (slot, read, write, deadline) = {
            let mut inner = self.inner.borrow_mut();
            let Some(slot) = inner.slot else { return };
            let (read, write) = wanted(&inner);
            let (deadline, dir) = inner.next_timeout();
            inner.timeout_dir = dir;
            (slot, read, write, deadline)
        };

        if read || write || deadline.is_some() {
            core.set_io_interest(slot, read, write);
            if let Err(e) = core.arm(slot, deadline) {
                log::warn!("rearming buffer event failed: {}", e);
            }
        } else {
            core.disarm(slot);
        }
    }

    fn defer_read_delivery(&self) {
        let Some(core) = self.core.upgrade() else { return };
        let href = self.clone();
        core.defer_local(Box::new(move || {
            let ok = {
                let inner = href.inner.borrow();
                inner.enabled.contains(EventFlags::READ)
                    && !inner.input.is_empty()
                    && inner.input.len() >= inner.wm_low
            };
            if ok {
                let cb = href.inner.borrow().read_cb.clone();
                if let Some(cb) = cb {
                    guard("buffer read", || (cb.borrow_mut())(&href));
                }
                href.refresh();
            }
        }));
    }

    fn emit(&self, status: EventFlags) {
        let cb = self.inner.borrow().event_cb.clone();
        if let Some(cb) = cb {
            guard("buffer event", || (cb.borrow_mut())(self, status));
        }
    }

    fn dispatch(&self, acts: Vec<Act>) {
        for act in acts {
            match act {
                Act::Read => {
                    let cb = self.inner.borrow().read_cb.clone();
                    if let Some(cb) = cb {
                        guard("buffer read", || (cb.borrow_mut())(self));
                    }
                }
                Act::Write => {
                    let cb = self.inner.borrow().write_cb.clone();
                    if let Some(cb) = cb {
                        guard("buffer write", || (cb.borrow_mut())(self));
                    }
                }
                Act::Event(status) => self.emit(status),
            }
        }
    }

    fn close_internal(&self) {
        let slot = self.inner.borrow_mut().slot.take();
        if let (Some(core), Some(slot)) = (self.core.upgrade(), slot) {
            core.remove_slot(slot);
        }

        let mut inner = self.inner.borrow_mut();
        inner.connecting = false;
        let was_dirty = inner.errored || inner.eof;
        if let Channel::Tls(mut ch) = std::mem::replace(&mut inner.channel, Channel::Empty) {
            if !was_dirty {
                ch.shutdown();
            }
        }
    }
}

/// Owning handle. Closes the socket (with a TLS close_notify where it
/// applies) on drop.
pub struct BufferEvent {
    h: BufferEventRef,
}

impl Deref for BufferEvent {
    type Target = BufferEventRef;

    fn deref(&self) -> &BufferEventRef {
        &self.h
    }
}

impl BufferEvent {
    /// A socket-less buffer event; attach a socket later through
    /// [`connect`](BufferEventRef::connect) or
    /// [`connect_hostname`](BufferEventRef::connect_hostname).
    pub fn new(queue: &EventQueue) -> Self {
        Self::build(queue, None)
    }

    /// Wrap an existing socket (typically from a listener). The socket
    /// is switched to nonblocking.
    pub fn with_socket(queue: &EventQueue, socket: Socket) -> Result<Self> {
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::io("set nonblocking", e))?;
        let bev = Self::build(queue, None);
        bev.h.inner.borrow_mut().channel = Channel::Plain(socket);
        bev.h.register();
        bev.h.refresh();
        Ok(bev)
    }

    /// A TLS buffer event. `server_name` is validated here; it is
    /// replaced by the hostname when connecting through
    /// [`connect_hostname`](BufferEventRef::connect_hostname).
    pub fn new_tls(queue: &EventQueue, connector: &TlsConnector, server_name: &str) -> Result<Self> {
        // fail on a malformed name now, not at connect time
        connector.start(server_name)?;
        Ok(Self::build(
            queue,
            Some(TlsParams {
                connector: connector.clone(),
                server_name: server_name.to_owned(),
            }),
        ))
    }

    fn build(queue: &EventQueue, tls: Option<TlsParams>) -> Self {
        Self {
            h: BufferEventRef {
                inner: Rc::new(RefCell::new(Inner::fresh(tls))),
                core: Rc::downgrade(queue.core()),
            },
        }
    }

    /// A cheap non-owning alias.
    pub fn as_ref(&self) -> BufferEventRef {
        self.h.clone()
    }

    /// Detach and return the socket without shutting it down. The
    /// registration is removed; buffered input stays readable through
    /// the ref handle.
    pub fn take_socket(&self) -> Option<Socket> {
        let slot = self.h.inner.borrow_mut().slot.take();
        if let (Some(core), Some(slot)) = (self.h.core.upgrade(), slot) {
            core.remove_slot(slot);
        }
        match std::mem::replace(&mut self.h.inner.borrow_mut().channel, Channel::Empty) {
            Channel::Plain(sock) => Some(sock),
            Channel::Tls(ch) => Some(ch.sock),
            Channel::Empty => None,
        }
    }

    /// Close now instead of at drop.
    pub fn close(&self) {
        self.h.close_internal();
    }
}

impl Drop for BufferEvent {
    fn drop(&mut self) {
        self.h.close_internal();
    }
}

/// One readiness (or timeout) delivery for a buffered socket.
fn pump(href: &BufferEventRef, what: EventFlags) {
    let mut acts: Vec<Act> = Vec::new();
    {
        let mut borrow = href.inner.borrow_mut();
        let inner = &mut *borrow;

        if what.contains(EventFlags::TIMEOUT) {
            // only the direction whose deadline expired goes quiet
            let dir = if inner.timeout_dir.is_empty() {
                EventFlags::READING
            } else {
                inner.timeout_dir
            };
            if dir.contains(EventFlags::READING) {
                inner.enabled = inner.enabled.without(EventFlags::READ);
            }
            if dir.contains(EventFlags::WRITING) {
                inner.enabled = inner.enabled.without(EventFlags::WRITE);
            }
            acts.push(Act::Event(EventFlags::TIMEOUT | dir));
        } else {
            if inner.connecting && what.intersects(EventFlags::READ | EventFlags::WRITE) {
                let result = inner
                    .channel
                    .socket()
                    .map(|sock| sock.take_error())
                    .unwrap_or_else(|| Ok(None));
                match result {
                    Ok(None) => {
                        inner.connecting = false;
                        if matches!(inner.channel, Channel::Plain(_)) {
                            acts.push(Act::Event(EventFlags::CONNECTED));
                        }
                        // TLS fires CONNECTED after the handshake
                    }
                    Ok(Some(e)) | Err(e) => {
                        log::debug!("connect failed: {}", e);
                        inner.connecting = false;
                        inner.errored = true;
                        acts.push(Act::Event(EventFlags::ERROR));
                    }
                }
            }

            if !inner.connecting && !inner.errored {
                let tls_flush = matches!(&inner.channel, Channel::Tls(ch) if ch.wants_write());
                if what.contains(EventFlags::WRITE) || tls_flush {
                    pump_write(inner, &mut acts);
                }
                if what.contains(EventFlags::READ) && !inner.errored {
                    pump_read(inner, &mut acts);
                }
                if let Channel::Tls(ch) = &mut inner.channel {
                    if !ch.established && !ch.is_handshaking() {
                        ch.established = true;
                        acts.push(Act::Event(EventFlags::CONNECTED));
                    }
                }
            }
        }
    }
    href.refresh();
    href.dispatch(acts);
}

fn pump_read(inner: &mut Inner, acts: &mut Vec<Act>) {
    let limit = inner.read_limit();
    if inner.input.len() >= limit {
        return;
    }
    let before = inner.input.len();

    let end = match &mut inner.channel {
        Channel::Empty => return,
        Channel::Plain(sock) => plain_read(sock, &mut inner.input, limit),
        Channel::Tls(ch) => match ch.read_into(&mut inner.input, limit) {
            TlsRead::Progress(_) | TlsRead::Blocked => ReadEnd::Fine,
            TlsRead::Eof => ReadEnd::Eof,
            TlsRead::Failed(e) => ReadEnd::Failed(e),
        },
    };

    let progress = inner.input.len() > before;
    if progress
        && inner.enabled.contains(EventFlags::READ)
        && inner.input.len() >= inner.wm_low
        && inner.read_cb.is_some()
    {
        acts.push(Act::Read);
    }

    match end {
        ReadEnd::Fine => {}
        ReadEnd::Eof => {
            inner.eof = true;
            acts.push(Act::Event(EventFlags::EOF | EventFlags::READING));
        }
        ReadEnd::Failed(e) => {
            log::debug!("socket read failed: {}", e);
            inner.errored = true;
            acts.push(Act::Event(EventFlags::ERROR | EventFlags::READING));
        }
    }
}

fn pump_write(inner: &mut Inner, acts: &mut Vec<Act>) {
    let had_output = !inner.output.is_empty();

    let result = match &mut inner.channel {
        Channel::Empty => return,
        Channel::Plain(sock) => plain_write(sock, &mut inner.output),
        Channel::Tls(ch) => ch.write_from(&mut inner.output),
    };

    match result {
        Ok(drained) => {
            if had_output && drained && inner.write_cb.is_some() {
                acts.push(Act::Write);
            }
        }
        Err(e) => {
            log::debug!("socket write failed: {}", e);
            inner.errored = true;
            acts.push(Act::Event(EventFlags::ERROR | EventFlags::WRITING));
        }
    }
}

fn plain_read(sock: &mut Socket, input: &mut Vec<u8>, limit: usize) -> ReadEnd {
    let mut buf = [0u8; READ_CHUNK];
    while input.len() < limit {
        let want = (limit - input.len()).min(buf.len());
        match sock.read(&mut buf[..want]) {
            Ok(0) => return ReadEnd::Eof,
            Ok(n) => input.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ReadEnd::Fine,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return ReadEnd::Failed(e),
        }
    }
    ReadEnd::Fine
}

fn plain_write(sock: &mut Socket, output: &mut Vec<u8>) -> io::Result<bool> {
    while !output.is_empty() {
        match sock.write(output) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => {
                output.drain(..n);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}
