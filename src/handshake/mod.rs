//! Websocket handshake.

pub mod key;
pub mod request;
pub mod response;

pub use key::{derive_accept_key, new_sec_key};
pub use request::UpgradeRequest;
pub use response::UpgradeResponse;

/// 32
pub const MAX_ALLOW_HEADERS: usize = 32;

/// 258EAFA5-E914-47DA-95CA-C5AB0DC85B11
pub const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// 101
pub const HTTP_SWITCH_PROTOCOLS: u16 = 101;

/// Client-side handshake state.
///
/// Holds the accept key expected from the server between sending the
/// upgrade request and validating the response; cleared after use.
#[derive(Debug, Default)]
pub struct Handshake {
    expected: Option<[u8; 28]>,
}

impl Handshake {
    pub const fn new() -> Self { Self { expected: None } }

    /// Generate a fresh client key and remember the accept key the
    /// server must answer with.
    pub fn create_key(&mut self) -> [u8; 24] {
        let sec_key = new_sec_key();
        self.expected = Some(derive_accept_key(&sec_key));
        sec_key
    }

    /// Validate the server response: status must be 101 and
    /// `Sec-WebSocket-Accept` must equal the derived key.
    pub fn accept(&self, resp: &UpgradeResponse) -> bool {
        if resp.status != HTTP_SWITCH_PROTOCOLS {
            return false;
        }

        match (&self.expected, resp.header("sec-websocket-accept")) {
            (Some(expected), Some(value)) => expected[..] == *value,
            _ => false,
        }
    }

    /// Forget the expected key.
    pub fn clear(&mut self) { self.expected = None; }
}
