//! Client upgrade request.
//!
//! From [RFC-6455 Section 4.1](https://datatracker.ietf.org/doc/html/rfc6455#section-4.1):
//!
//! Once a connection to the server has been established (including a
//! connection via a proxy or over a TLS-encrypted tunnel), the client
//! MUST send an opening handshake to the server. The handshake consists
//! of an HTTP Upgrade request, along with a list of required and
//! optional header fields.
//!
//! Example:
//!
//! ```text
//! GET /path HTTP/1.1
//! Host: www.example.com
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! Sec-WebSocket-Version: 13
//! Sec-WebSocket-Protocol: proto1
//! Origin: http://www.example.com
//! ```

use crate::http::Request;

/// Client upgrade request. All fields are caller-supplied; nothing
/// deployment-specific is baked in.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpgradeRequest<'a> {
    pub path: &'a str,
    pub host: &'a str,
    pub sec_key: &'a [u8],
    pub protocol: Option<&'a str>,
    pub origin: Option<&'a str>,
}

impl<'a> UpgradeRequest<'a> {
    /// Build the upgrade as an ordinary HTTP request, ready for an
    /// [`HttpConnection`](crate::http::HttpConnection).
    pub fn to_request(&self) -> Request {
        let key = String::from_utf8_lossy(self.sec_key);
        let mut req = Request::get(self.path)
            .header("Host", self.host)
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Sec-WebSocket-Key", &key)
            .header("Sec-WebSocket-Version", "13");

        if let Some(proto) = self.protocol {
            req = req.header("Sec-WebSocket-Protocol", proto);
        }
        if let Some(origin) = self.origin {
            req = req.header("Origin", origin);
        }
        req
    }
}
