//! TLS transport for buffered sockets.
//!
//! rustls runs entirely in memory; this module shuttles records between
//! a nonblocking [`Socket`] and the [`ClientConnection`], exposing the
//! same read/write shape the plain transport has. The handshake is
//! driven by ordinary readiness callbacks, no extra state machine.

use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use socket2::Socket;

use crate::error::{Error, Result};

/// Client-side TLS configuration, shared across connections.
#[derive(Clone)]
pub struct TlsConnector {
    config: Arc<ClientConfig>,
}

impl TlsConnector {
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self { config }
    }

    /// A connector trusting `roots`, with no client certificate.
    pub fn from_roots(roots: RootCertStore) -> Self {
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            config: Arc::new(config),
        }
    }

    /// Begin a client session for `server_name` (SNI and certificate
    /// verification both use it).
    pub(crate) fn start(&self, server_name: &str) -> Result<ClientConnection> {
        let name = ServerName::try_from(server_name.to_owned()).map_err(|e| {
            Error::init(
                "tls server name",
                io::Error::new(io::ErrorKind::InvalidInput, e),
            )
        })?;
        ClientConnection::new(self.config.clone(), name)
            .map_err(|e| Error::init("tls session", io::Error::new(io::ErrorKind::Other, e)))
    }
}

pub(crate) enum TlsRead {
    Progress(usize),
    Blocked,
    Eof,
    Failed(io::Error),
}

pub(crate) struct TlsChannel {
    pub(crate) sock: Socket,
    pub(crate) conn: ClientConnection,
    /// Set once the handshake finished; used to fire CONNECTED exactly
    /// once.
    pub(crate) established: bool,
    shutdown_sent: bool,
}

impl TlsChannel {
    pub(crate) fn new(sock: Socket, conn: ClientConnection) -> Self {
        Self {
            sock,
            conn,
            established: false,
            shutdown_sent: false,
        }
    }

    /// Decrypt into `input` until it reaches `limit` bytes or the
    /// socket runs dry. Already-decrypted plaintext is drained before
    /// touching the socket, so a limit hit never strands data.
    pub(crate) fn read_into(&mut self, input: &mut Vec<u8>, limit: usize) -> TlsRead {
        let mut total = 0usize;
        let mut buf = [0u8; 8192];

        loop {
            while input.len() < limit {
                let want = (limit - input.len()).min(buf.len());
                match self.conn.reader().read(&mut buf[..want]) {
                    Ok(0) => {
                        // clean close_notify
                        return if total > 0 {
                            TlsRead::Progress(total)
                        } else {
                            TlsRead::Eof
                        };
                    }
                    Ok(n) => {
                        input.extend_from_slice(&buf[..n]);
                        total += n;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return TlsRead::Failed(e),
                }
            }
            if input.len() >= limit {
                return TlsRead::Progress(total);
            }

            match self.conn.read_tls(&mut &self.sock) {
                Ok(0) => {
                    return if total > 0 {
                        TlsRead::Progress(total)
                    } else {
                        TlsRead::Eof
                    };
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return if total > 0 {
                        TlsRead::Progress(total)
                    } else {
                        TlsRead::Blocked
                    };
                }
                Err(e) => return TlsRead::Failed(e),
            }

            if let Err(e) = self.conn.process_new_packets() {
                return TlsRead::Failed(io::Error::new(io::ErrorKind::InvalidData, e));
            }
        }
    }

    /// Encrypt pending plaintext and flush records. Returns `true` when
    /// nothing is left to send.
    pub(crate) fn write_from(&mut self, output: &mut Vec<u8>) -> io::Result<bool> {
        if !output.is_empty() {
            // rustls buffers plaintext internally, during the handshake
            // included
            let n = self.conn.writer().write(output)?;
            output.drain(..n);
        }

        while self.conn.wants_write() {
            match self.conn.write_tls(&mut &self.sock) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(output.is_empty() && !self.conn.wants_write())
    }

    pub(crate) fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    pub(crate) fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    /// Send close_notify so the peer can tell an orderly close from a
    /// truncation attack. Best-effort, once.
    pub(crate) fn shutdown(&mut self) {
        if self.shutdown_sent {
            return;
        }
        self.shutdown_sent = true;
        self.conn.send_close_notify();
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut &self.sock) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }
}
