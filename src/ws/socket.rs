//! Websocket client socket.
//!
//! Drives one client connection end to end on an event queue:
//!
//! ```text
//! Idle -> Connecting -> HandshakeSent -> Open -> Closed
//!                                     \-> Rejected -> Closed
//! ```
//!
//! Transport, handshake and framing are owned here; user code sees
//! complete messages and lifecycle callbacks. The upgrade itself is an
//! HTTP exchange, so once the transport connects it is handed to an
//! [`HttpConnection`] and reclaimed through `detach()` when the server
//! switches protocols. Messages sent before the handshake finishes are
//! queued and flushed on open. A close requested while still connecting
//! wins over the connect: the socket shuts down instead of proceeding
//! to the handshake.

use std::cell::RefCell;
use std::io;
use std::rc::{Rc, Weak};

use crate::bufev::{BufferEvent, BufferEventRef, TlsConnector};
use crate::callback::guard;
use crate::dns::{Dns, Family};
use crate::error::{Error, ProtocolError, Result, DNS_ERR_NONE};
use crate::event::EventFlags;
use crate::frame::OpCode;
use crate::handshake::{Handshake, UpgradeRequest, UpgradeResponse, HTTP_SWITCH_PROTOCOLS};
use crate::http::{HttpConnection, ResponseHead};
use crate::queue::EventQueue;
use crate::uri::Uri;

use super::adapter;
use super::engine::{FrameEngine, Incoming};

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    Connecting,
    HandshakeSent,
    Open,
    /// The server answered the upgrade with a non-101 status. Observed
    /// from the error callback; the socket then settles as `Closed`.
    Rejected,
    Closed,
}

/// Per-socket options, all optional.
pub struct SocketOptions {
    /// `Sec-WebSocket-Protocol` request header.
    pub protocol: Option<String>,
    /// `Origin` request header. Nothing is sent when unset.
    pub origin: Option<String>,
    /// Address family filter for resolution.
    pub family: Family,
    /// TLS configuration; required for `wss` URIs.
    pub tls: Option<TlsConnector>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            protocol: None,
            origin: None,
            family: Family::Unspec,
            tls: None,
        }
    }
}

type OpenCb = Rc<RefCell<Box<dyn FnMut()>>>;
type MessageCb = Rc<RefCell<Box<dyn FnMut(OpCode, Vec<u8>)>>>;
type CloseCb = Rc<RefCell<Box<dyn FnMut(Option<u16>)>>>;
type ErrorCb = Rc<RefCell<Box<dyn FnMut(Error)>>>;

struct WsInner {
    state: State,
    bev: Option<BufferEvent>,
    /// Owns the transport while the upgrade exchange is in flight.
    http: Option<HttpConnection>,
    engine: FrameEngine,
    handshake: Handshake,
    opts: SocketOptions,
    host_header: String,
    path: String,
    queued: Vec<(OpCode, Vec<u8>)>,
    close_requested: bool,
    /// Close frame queued; drop the transport once output drains.
    pending_shutdown: bool,
    reject_status: Option<u16>,
    on_open: Option<OpenCb>,
    on_message: Option<MessageCb>,
    on_close: Option<CloseCb>,
    on_error: Option<ErrorCb>,
}

/// Client websocket handle. Cheap to clone; clones share one
/// connection. The connection closes when the last handle drops.
#[derive(Clone)]
pub struct Socket {
    inner: Rc<RefCell<WsInner>>,
}

impl Socket {
    pub fn new(opts: SocketOptions) -> Self {
        Self {
            inner: Rc::new(RefCell::new(WsInner {
                state: State::Idle,
                bev: None,
                http: None,
                engine: FrameEngine::new(),
                handshake: Handshake::new(),
                opts,
                host_header: String::new(),
                path: String::new(),
                queued: Vec::new(),
                close_requested: false,
                pending_shutdown: false,
                reject_status: None,
                on_open: None,
                on_message: None,
                on_close: None,
                on_error: None,
            })),
        }
    }

    pub fn on_open<F: FnMut() + 'static>(&self, f: F) {
        self.inner.borrow_mut().on_open = Some(Rc::new(RefCell::new(Box::new(f))));
    }

    /// Complete data messages: `OpCode::Text` or `OpCode::Binary` plus
    /// the reassembled payload.
    pub fn on_message<F: FnMut(OpCode, Vec<u8>) + 'static>(&self, f: F) {
        self.inner.borrow_mut().on_message = Some(Rc::new(RefCell::new(Box::new(f))));
    }

    pub fn on_close<F: FnMut(Option<u16>) + 'static>(&self, f: F) {
        self.inner.borrow_mut().on_close = Some(Rc::new(RefCell::new(Box::new(f))));
    }

    pub fn on_error<F: FnMut(Error) + 'static>(&self, f: F) {
        self.inner.borrow_mut().on_error = Some(Rc::new(RefCell::new(Box::new(f))));
    }

    /// Connect to a `ws://` or `wss://` URI and run the opening
    /// handshake. Progress is reported through the callbacks.
    pub fn open(&self, queue: &EventQueue, dns: &Dns, uri: &str) -> Result<()> {
        let uri = Uri::parse(uri)?;
        let (default_port, secure) = match uri.scheme.as_str() {
            "ws" => (80, false),
            "wss" => (443, true),
            other => {
                return Err(Error::init(
                    "websocket uri",
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("unsupported scheme {:?}", other),
                    ),
                ))
            }
        };

        {
            let inner = self.inner.borrow();
            if !matches!(inner.state, State::Idle) {
                return Err(Error::io(
                    "websocket open",
                    io::Error::from(io::ErrorKind::AlreadyExists),
                ));
            }
        }

        let bev = {
            let inner = self.inner.borrow();
            match (secure, &inner.opts.tls) {
                (false, _) => BufferEvent::new(queue),
                (true, Some(tls)) => BufferEvent::new_tls(queue, tls, &uri.host)?,
                (true, None) => {
                    return Err(Error::init(
                        "tls connector",
                        io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "wss uri without a TLS connector",
                        ),
                    ))
                }
            }
        };

        let weak = Rc::downgrade(&self.inner);
        let read_weak = weak.clone();
        let write_weak = weak.clone();
        bev.set_callbacks(
            Some(Box::new(move |b| on_readable(&read_weak, b))),
            Some(Box::new(move |b| on_drained(&write_weak, b))),
            Some(Box::new(move |b, what| on_status(&weak, b, what))),
        );

        let port = uri.port_or(default_port);
        let family = {
            let mut inner = self.inner.borrow_mut();
            inner.host_header = if port == default_port {
                uri.host.clone()
            } else {
                format!("{}:{}", uri.host, port)
            };
            inner.path = uri.full_path();
            inner.state = State::Connecting;
            inner.opts.family
        };

        bev.connect_hostname(dns, family, &uri.host, port)?;
        self.inner.borrow_mut().bev = Some(bev);
        Ok(())
    }

    pub fn send_text(&self, text: &str) {
        self.send(OpCode::Text, text.as_bytes());
    }

    pub fn send_binary(&self, data: &[u8]) {
        self.send(OpCode::Binary, data);
    }

    fn send(&self, opcode: OpCode, payload: &[u8]) {
        let mut borrow = self.inner.borrow_mut();
        let inner = &mut *borrow;
        match inner.state {
            State::Open => {
                inner.engine.queue_msg(opcode, payload);
                if let Some(bev) = &inner.bev {
                    adapter::io_update(&bev.as_ref(), &mut inner.engine);
                }
            }
            // queued until the handshake completes
            State::Idle | State::Connecting | State::HandshakeSent => {
                inner.queued.push((opcode, payload.to_vec()));
            }
            State::Rejected | State::Closed => {
                log::debug!("send on a closed websocket dropped");
            }
        }
    }

    pub fn ping(&self, payload: &[u8]) {
        let mut borrow = self.inner.borrow_mut();
        let inner = &mut *borrow;
        if inner.state == State::Open {
            inner.engine.queue_ping(payload);
            if let Some(bev) = &inner.bev {
                adapter::io_update(&bev.as_ref(), &mut inner.engine);
            }
        }
    }

    /// Start an orderly close. Before the connection is open this marks
    /// the socket for shutdown instead; the close wins over the
    /// connect.
    pub fn close(&self, code: u16, reason: &str) {
        let mut borrow = self.inner.borrow_mut();
        let inner = &mut *borrow;
        match inner.state {
            State::Open => {
                inner.engine.queue_close(code, reason.as_bytes());
                inner.pending_shutdown = true;
                if let Some(bev) = &inner.bev {
                    adapter::io_update(&bev.as_ref(), &mut inner.engine);
                }
            }
            State::Idle | State::Connecting | State::HandshakeSent => {
                inner.close_requested = true;
            }
            State::Rejected | State::Closed => {}
        }
    }

    pub fn state(&self) -> State {
        self.inner.borrow().state
    }

    /// HTTP status of a rejected upgrade.
    pub fn reject_status(&self) -> Option<u16> {
        self.inner.borrow().reject_status
    }
}

fn on_status(weak: &Weak<RefCell<WsInner>>, bev: &BufferEventRef, what: EventFlags) {
    let Some(rc) = weak.upgrade() else { return };

    if what.contains(EventFlags::CONNECTED) {
        if rc.borrow().close_requested {
            let dropped = {
                let mut inner = rc.borrow_mut();
                inner.state = State::Closed;
                (inner.bev.take(), inner.http.take())
            };
            drop(dropped);
            emit_close(&rc, None);
            return;
        }

        // hand the transport to the http layer for the upgrade
        let request = {
            let mut borrow = rc.borrow_mut();
            let inner = &mut *borrow;
            let key = inner.handshake.create_key();
            UpgradeRequest {
                path: &inner.path,
                host: &inner.host_header,
                sec_key: &key,
                protocol: inner.opts.protocol.as_deref(),
                origin: inner.opts.origin.as_deref(),
            }
            .to_request()
        };
        let conn = {
            let mut inner = rc.borrow_mut();
            match inner.bev.take() {
                Some(bev) => HttpConnection::new(bev),
                None => return,
            }
        };
        let done = weak.clone();
        conn.send_request(&request, move |result| on_upgrade_done(&done, result));
        let mut inner = rc.borrow_mut();
        inner.http = Some(conn);
        inner.state = State::HandshakeSent;
        return;
    }

    if what.intersects(EventFlags::EOF | EventFlags::ERROR | EventFlags::TIMEOUT) {
        // a settled socket ignores trailing transport noise
        let orderly = {
            let inner = rc.borrow();
            matches!(inner.state, State::Rejected | State::Closed)
                || inner.engine.close_received()
        };
        if orderly {
            let dropped = {
                let mut inner = rc.borrow_mut();
                inner.state = State::Closed;
                (inner.bev.take(), inner.http.take())
            };
            drop(dropped);
            return;
        }
        fail(&rc, transport_error(bev, what));
    }
}

/// Completion of the upgrade exchange: open the websocket on 101, reject
/// on anything else, fail on a transport error.
fn on_upgrade_done(weak: &Weak<RefCell<WsInner>>, result: Result<ResponseHead>) {
    let Some(rc) = weak.upgrade() else { return };

    let head = match result {
        Ok(head) => head,
        Err(e) => {
            fail(&rc, e);
            return;
        }
    };

    if head.status != HTTP_SWITCH_PROTOCOLS {
        let dropped = {
            let mut inner = rc.borrow_mut();
            inner.state = State::Rejected;
            inner.reject_status = Some(head.status);
            inner.http.take()
        };
        drop(dropped);
        emit_error(&rc, ProtocolError::UpgradeRejected(head.status).into());
        // exactly one notification; the rejection then settles
        rc.borrow_mut().state = State::Closed;
        return;
    }

    let resp = UpgradeResponse {
        status: head.status,
        headers: head.headers,
    };
    if !rc.borrow().handshake.accept(&resp) {
        fail(&rc, ProtocolError::BadAcceptKey.into());
        return;
    }

    let href = {
        let mut borrow = rc.borrow_mut();
        let inner = &mut *borrow;
        inner.handshake.clear();
        let Some(conn) = inner.http.take() else { return };

        // reclaim the transport; bytes past the response head stay
        // buffered and are processed below
        let bev = conn.detach();
        let read_weak = weak.clone();
        let write_weak = weak.clone();
        let event_weak = weak.clone();
        bev.set_callbacks(
            Some(Box::new(move |b| on_readable(&read_weak, b))),
            Some(Box::new(move |b| on_drained(&write_weak, b))),
            Some(Box::new(move |b, what| on_status(&event_weak, b, what))),
        );

        inner.state = State::Open;
        let queued = std::mem::take(&mut inner.queued);
        for (opcode, payload) in queued {
            inner.engine.queue_msg(opcode, &payload);
        }
        if inner.close_requested {
            inner.engine.queue_close(1000, b"");
            inner.pending_shutdown = true;
        }
        let href = bev.as_ref();
        adapter::io_update(&href, &mut inner.engine);
        inner.bev = Some(bev);
        href
    };

    let cb = rc.borrow().on_open.clone();
    if let Some(cb) = cb {
        guard("websocket open", || (cb.borrow_mut())());
    }
    // frame bytes may have arrived with the response
    process_frames(&rc, &href);
}

fn on_drained(weak: &Weak<RefCell<WsInner>>, _bev: &BufferEventRef) {
    let Some(rc) = weak.upgrade() else { return };
    let shut = rc.borrow().pending_shutdown && rc.borrow().engine.close_received();
    if shut {
        let closed = rc.borrow_mut().bev.take();
        drop(closed);
        rc.borrow_mut().state = State::Closed;
    }
}

fn on_readable(weak: &Weak<RefCell<WsInner>>, bev: &BufferEventRef) {
    let Some(rc) = weak.upgrade() else { return };
    if rc.borrow().state != State::Open {
        return;
    }
    process_frames(&rc, bev);
}

fn process_frames(rc: &Rc<RefCell<WsInner>>, bev: &BufferEventRef) {
    let stepped = {
        let mut borrow = rc.borrow_mut();
        let inner = &mut *borrow;
        let engine = &mut inner.engine;
        let res = bev.with_input(|input| engine.recv_step(input));
        if res.is_ok() {
            adapter::io_update(bev, engine);
        }
        res
    };

    match stepped {
        Err(e) => fail(rc, e.into()),
        Ok(events) => {
            for event in events {
                match event {
                    Incoming::Text(payload) => emit_message(rc, OpCode::Text, payload),
                    Incoming::Binary(payload) => emit_message(rc, OpCode::Binary, payload),
                    Incoming::Pong(_) => log::trace!("pong received"),
                    Incoming::Close(code) => {
                        {
                            let mut inner = rc.borrow_mut();
                            inner.pending_shutdown = true;
                        }
                        // the close echo flushes first; on_drained
                        // finishes the teardown
                        if bev.output_len() == 0 {
                            let closed = rc.borrow_mut().bev.take();
                            drop(closed);
                            rc.borrow_mut().state = State::Closed;
                        }
                        emit_close(rc, code);
                    }
                }
            }
        }
    }
}

fn fail(rc: &Rc<RefCell<WsInner>>, e: Error) {
    let dropped = {
        let mut inner = rc.borrow_mut();
        inner.state = State::Closed;
        (inner.bev.take(), inner.http.take())
    };
    drop(dropped);
    emit_error(rc, e);
}

fn emit_message(rc: &Rc<RefCell<WsInner>>, opcode: OpCode, payload: Vec<u8>) {
    let cb = rc.borrow().on_message.clone();
    if let Some(cb) = cb {
        guard("websocket message", || (cb.borrow_mut())(opcode, payload));
    }
}

fn emit_close(rc: &Rc<RefCell<WsInner>>, code: Option<u16>) {
    let cb = rc.borrow().on_close.clone();
    if let Some(cb) = cb {
        guard("websocket close", || (cb.borrow_mut())(code));
    }
}

fn emit_error(rc: &Rc<RefCell<WsInner>>, e: Error) {
    let cb = rc.borrow().on_error.clone();
    match cb {
        Some(cb) => {
            guard("websocket error", || (cb.borrow_mut())(e));
        }
        None => log::warn!("websocket error with no handler: {}", e),
    }
}

fn transport_error(bev: &BufferEventRef, what: EventFlags) -> Error {
    if bev.dns_error() != DNS_ERR_NONE {
        return Error::dns(bev.dns_error());
    }
    let kind = if what.contains(EventFlags::TIMEOUT) {
        io::ErrorKind::TimedOut
    } else if what.contains(EventFlags::EOF) {
        io::ErrorKind::UnexpectedEof
    } else {
        io::ErrorKind::ConnectionReset
    };
    Error::io("websocket transport", io::Error::from(kind))
}
