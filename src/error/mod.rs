#![allow(missing_docs)]
//! Errors

mod frame;
mod handshake;

pub use frame::FrameError;
pub use handshake::HandshakeError;

use std::fmt::{Display, Formatter};

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure to create a core native resource (poller, socket, listener,
/// resolver pipe, TLS session). Always fatal to the attempted operation.
#[derive(Debug)]
pub struct InitError {
    pub what: &'static str,
    pub source: std::io::Error,
}

/// A native call failed. Carries the name of the failing operation.
#[derive(Debug)]
pub struct IoError {
    pub operation: &'static str,
    pub source: std::io::Error,
}

/// Hostname resolution failed, with a resolver error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsError {
    pub code: i32,
}

/// No error recorded.
pub const DNS_ERR_NONE: i32 = 0;
/// The name does not exist.
pub const DNS_ERR_NOTEXIST: i32 = 3;
/// The lookup timed out.
pub const DNS_ERR_TIMEOUT: i32 = 67;
/// The resolver was shut down before the lookup completed.
pub const DNS_ERR_SHUTDOWN: i32 = 68;

/// Malformed websocket handshake or frame data. The websocket socket
/// responds to any of these by closing; no retry is attempted here.
#[derive(Debug)]
pub enum ProtocolError {
    Frame(FrameError),

    Handshake(HandshakeError),

    /// The server answered the upgrade with a non-101 status.
    UpgradeRejected(u16),

    /// `Sec-WebSocket-Accept` did not match the derived key.
    BadAcceptKey,
}

#[derive(Debug)]
pub enum Error {
    Init(InitError),

    Io(IoError),

    Dns(DnsError),

    Protocol(ProtocolError),

    Uri(crate::uri::UriError),
}

impl Error {
    pub(crate) fn init(what: &'static str, source: std::io::Error) -> Self {
        Error::Init(InitError { what, source })
    }

    pub(crate) fn io(operation: &'static str, source: std::io::Error) -> Self {
        Error::Io(IoError { operation, source })
    }

    pub(crate) fn dns(code: i32) -> Self { Error::Dns(DnsError { code }) }
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self { Error::Protocol(ProtocolError::Frame(e)) }
}

impl From<HandshakeError> for Error {
    fn from(e: HandshakeError) -> Self { Error::Protocol(ProtocolError::Handshake(e)) }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self { Error::Protocol(e) }
}

impl From<crate::uri::UriError> for Error {
    fn from(e: crate::uri::UriError) -> Self { Error::Uri(e) }
}

impl Display for InitError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed: {}", self.what, self.source)
    }
}

impl Display for IoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed: {}", self.operation, self.source)
    }
}

impl Display for DnsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let what = match self.code {
            DNS_ERR_NONE => "no error",
            DNS_ERR_NOTEXIST => "name does not exist",
            DNS_ERR_TIMEOUT => "request timed out",
            DNS_ERR_SHUTDOWN => "resolver shut down",
            _ => "unknown resolver error",
        };
        write!(f, "dns error {}: {}", self.code, what)
    }
}

impl Display for ProtocolError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        use ProtocolError::*;
        match self {
            Frame(e) => write!(f, "Frame error: {}", e),
            Handshake(e) => write!(f, "Handshake error: {}", e),
            UpgradeRejected(code) => write!(f, "Upgrade rejected with status {}", code),
            BadAcceptKey => write!(f, "Bad sec-websocket-accept value"),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        use Error::*;
        match self {
            Init(e) => write!(f, "Init error: {}", e),
            Io(e) => write!(f, "Io error: {}", e),
            Dns(e) => write!(f, "Dns error: {}", e),
            Protocol(e) => write!(f, "Protocol error: {}", e),
            Uri(e) => write!(f, "Uri error: {}", e),
        }
    }
}

impl std::error::Error for InitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> { Some(&self.source) }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> { Some(&self.source) }
}

impl std::error::Error for DnsError {}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use ProtocolError::*;
        match self {
            Frame(e) => Some(e),
            Handshake(e) => Some(e),
            _ => None,
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use Error::*;
        match self {
            Init(e) => Some(e),
            Io(e) => Some(e),
            Dns(e) => Some(e),
            Protocol(e) => Some(e),
            Uri(e) => Some(e),
        }
    }
}
