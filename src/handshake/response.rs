//! Server upgrade response.
//!
//! The server answers the opening handshake with
//! `HTTP/1.1 101 Switching Protocols` and a `Sec-WebSocket-Accept`
//! header derived from the client key
//! ([RFC-6455 Section 4.2.2](https://datatracker.ietf.org/doc/html/rfc6455#section-4.2.2)).

use crate::error::HandshakeError;
use crate::http::ResponseHead;

/// Parsed response head. Header names are lowercased; values are owned
/// copies so the parse buffer can be drained afterwards.
#[derive(Debug, Default)]
pub struct UpgradeResponse {
    pub status: u16,
    pub headers: Vec<(String, Vec<u8>)>,
}

impl UpgradeResponse {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// Parse a response head from `buf`.
    ///
    /// Returns the response and the number of consumed bytes, or
    /// [`HandshakeError::NotEnoughData`] while the head is still
    /// incomplete.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), HandshakeError> {
        let (head, n) = ResponseHead::decode(buf)?;
        Ok((
            UpgradeResponse {
                status: head.status,
                headers: head.headers,
            },
            n,
        ))
    }
}
