//! Plain HTTP/1.1 client connection.
//!
//! A thin request/response layer over a buffered socket, for endpoints
//! that speak ordinary HTTP before (or instead of) upgrading. One
//! request is in flight at a time; the completion callback receives the
//! parsed head and the body stays in the input buffer. [`detach`]
//! releases the underlying socket with buffered input intact, which is
//! how an upgraded connection changes protocol.
//!
//! [`detach`]: HttpConnection::detach

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use crate::bufev::{BufferEvent, BufferEventRef};
use crate::error::{Error, HandshakeError, Result};
use crate::event::EventFlags;
use crate::handshake::MAX_ALLOW_HEADERS;

/// An outgoing request. `Content-Length` is filled in from the body;
/// `Host` and anything else come from `headers`.
#[derive(Debug, Default)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn get(path: &str) -> Self {
        Self {
            method: "GET".to_owned(),
            path: path.to_owned(),
            ..Default::default()
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256 + self.body.len());
        buf.extend_from_slice(self.method.as_bytes());
        buf.push(0x20);
        buf.extend_from_slice(self.path.as_bytes());
        buf.extend_from_slice(b" HTTP/1.1\r\n");

        for (name, value) in &self.headers {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        if !self.body.is_empty() {
            buf.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(&self.body);
        buf
    }
}

/// Parsed response head. Header names are lowercased; the body is not
/// part of the head and stays in the connection's input buffer.
#[derive(Debug, Default)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl ResponseHead {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    pub(crate) fn decode(buf: &[u8]) -> std::result::Result<(Self, usize), HandshakeError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_ALLOW_HEADERS];
        let mut response = httparse::Response::new(&mut headers);

        let n = match response.parse(buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Err(HandshakeError::NotEnoughData),
            Err(httparse::Error::TooManyHeaders) => return Err(HandshakeError::TooManyHeaders),
            Err(e) => return Err(e.into()),
        };

        if response.version != Some(1_u8) {
            return Err(HandshakeError::HttpVersion);
        }
        let status = response.code.ok_or(HandshakeError::HttpStatusCode)?;
        let reason = response.reason.unwrap_or_default().to_owned();
        let headers = response
            .headers
            .iter()
            .map(|h| (h.name.to_ascii_lowercase(), h.value.to_vec()))
            .collect();

        Ok((
            ResponseHead {
                status,
                reason,
                headers,
            },
            n,
        ))
    }
}

type DoneCb = Rc<RefCell<Option<Box<dyn FnOnce(Result<ResponseHead>)>>>>;

pub struct HttpConnection {
    bev: BufferEvent,
}

impl HttpConnection {
    /// Take over a connected buffered socket. Its callbacks are replaced
    /// on each [`send_request`](Self::send_request).
    pub fn new(bev: BufferEvent) -> Self {
        Self { bev }
    }

    /// The underlying buffered socket, for body reads and timeouts.
    pub fn bev(&self) -> BufferEventRef {
        self.bev.as_ref()
    }

    /// Send `req` and invoke `done` exactly once: with the parsed head,
    /// or with the transport error that ended the exchange first.
    pub fn send_request<F>(&self, req: &Request, done: F)
    where
        F: FnOnce(Result<ResponseHead>) + 'static,
    {
        let done: DoneCb = Rc::new(RefCell::new(Some(Box::new(done))));
        let read_done = done.clone();
        let event_done = done;

        self.bev.set_callbacks(
            Some(Box::new(move |b: &BufferEventRef| {
                let finished = b.with_input(|input| match ResponseHead::decode(input) {
                    Ok((head, n)) => {
                        input.drain(..n);
                        Some(Ok(head))
                    }
                    Err(HandshakeError::NotEnoughData) => None,
                    Err(e) => Some(Err(Error::from(e))),
                });
                if let Some(result) = finished {
                    // the body keeps arriving; head delivery is one-shot
                    if let Some(f) = read_done.borrow_mut().take() {
                        f(result);
                    }
                }
            })),
            None,
            Some(Box::new(move |_b: &BufferEventRef, what| {
                if what.intersects(EventFlags::EOF | EventFlags::ERROR | EventFlags::TIMEOUT) {
                    let kind = if what.contains(EventFlags::TIMEOUT) {
                        io::ErrorKind::TimedOut
                    } else if what.contains(EventFlags::EOF) {
                        io::ErrorKind::UnexpectedEof
                    } else {
                        io::ErrorKind::ConnectionReset
                    };
                    if let Some(f) = event_done.borrow_mut().take() {
                        f(Err(Error::io("http response", io::Error::from(kind))));
                    }
                }
            })),
        );

        self.bev.write(&req.encode());
        self.bev.enable(EventFlags::READ);
    }

    /// Hand the transport back for a different protocol. Callbacks are
    /// cleared; input buffered past the response head stays readable.
    pub fn detach(self) -> BufferEvent {
        self.bev.set_callbacks(None, None, None);
        self.bev
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_with_body() {
        let req = Request {
            method: "POST".into(),
            path: "/submit".into(),
            headers: vec![("Host".into(), "example.com".into())],
            body: b"abc".to_vec(),
        };

        let text = String::from_utf8(req.encode()).unwrap();
        assert!(text.starts_with("POST /submit HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com\r\n"));
        assert!(text.contains("Content-Length: 3\r\n"));
        assert!(text.ends_with("\r\n\r\nabc"));
    }

    #[test]
    fn encode_get_has_no_length() {
        let text = String::from_utf8(Request::get("/").encode()).unwrap();
        assert!(!text.contains("Content-Length"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn decode_head_with_body_left_over() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let (head, n) = ResponseHead::decode(raw).unwrap();

        assert_eq!(head.status, 200);
        assert_eq!(head.reason, "OK");
        assert_eq!(head.header("content-length").unwrap(), b"5");
        assert_eq!(&raw[n..], b"hello");
    }

    #[test]
    fn decode_partial_head() {
        assert!(matches!(
            ResponseHead::decode(b"HTTP/1.1 200 OK\r\nContent-"),
            Err(HandshakeError::NotEnoughData)
        ));
    }
}
