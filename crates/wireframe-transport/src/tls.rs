use std::io::{Read, Write};
use std::sync::Arc;

use wireframe_core::error::{CoreError, ErrorKind};

/// Which side of the negotiation this connection plays; the handshake
/// step function is otherwise identical for both (spec.md §4.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeSide {
    Server,
    Client,
}

/// Outcome of driving the handshake state machine one step.
#[derive(Debug)]
pub enum HandshakeStep {
    /// Negotiation needs another readability/writability tick.
    Pending,
    /// The handshake finished; the connection may transition to
    /// `ESTABLISHED`.
    Complete,
}

enum Inner {
    Server(rustls::ServerConnection),
    Client(rustls::ClientConnection),
}

impl Inner {
    fn common(&mut self) -> &mut dyn rustls::ConnectionCommon<rustls::CommonState> {
        match self {
            Inner::Server(c) => c,
            Inner::Client(c) => c,
        }
    }
}

/// Drives a single TLS handshake to completion across repeated
/// readability/writability ticks, then exposes the negotiated connection
/// for plaintext read/write.
pub struct TlsHandshake {
    side: HandshakeSide,
    inner: Inner,
}

impl TlsHandshake {
    pub fn server(config: Arc<rustls::ServerConfig>) -> Result<Self, CoreError> {
        let conn = rustls::ServerConnection::new(config).map_err(|err| {
            CoreError::new(ErrorKind::SslHandshakeFail, err.to_string()).with_cause(err)
        })?;
        Ok(Self {
            side: HandshakeSide::Server,
            inner: Inner::Server(conn),
        })
    }

    pub fn client(
        config: Arc<rustls::ClientConfig>,
        server_name: rustls_pki_types::ServerName<'static>,
    ) -> Result<Self, CoreError> {
        let conn = rustls::ClientConnection::new(config, server_name).map_err(|err| {
            CoreError::new(ErrorKind::SslHandshakeFail, err.to_string()).with_cause(err)
        })?;
        Ok(Self {
            side: HandshakeSide::Client,
            inner: Inner::Client(conn),
        })
    }

    pub fn side(&self) -> HandshakeSide {
        self.side
    }

    /// Advances the handshake using whatever bytes are available on
    /// `socket`, writing out whatever rustls has queued. Call on every
    /// readability *and* writability tick until it reports `Complete`.
    pub fn step<S: Read + Write>(&mut self, socket: &mut S) -> Result<HandshakeStep, CoreError> {
        let common = self.inner.common();

        if common.wants_write() {
            while common.wants_write() {
                match common.write_tls(socket) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        return Err(CoreError::new(ErrorKind::SslHandshakeFail, err.to_string())
                            .with_cause(err))
                    }
                }
            }
        }

        if common.is_handshaking() && common.wants_read() {
            match common.read_tls(socket) {
                Ok(0) => {
                    return Err(CoreError::new(
                        ErrorKind::SslHandshakeFail,
                        "peer closed during handshake",
                    ))
                }
                Ok(_) => {
                    common.process_new_packets().map_err(|err| {
                        CoreError::new(ErrorKind::SslHandshakeFail, err.to_string())
                    })?;
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    return Err(
                        CoreError::new(ErrorKind::SslHandshakeFail, err.to_string()).with_cause(err)
                    )
                }
            }
        }

        if self.inner.common().is_handshaking() {
            Ok(HandshakeStep::Pending)
        } else {
            Ok(HandshakeStep::Complete)
        }
    }

    /// Wraps `socket` in a `rustls::Stream` for plaintext read/write once
    /// the handshake has completed.
    pub fn stream<'a, S: Read + Write>(&'a mut self, socket: &'a mut S) -> rustls::Stream<'a, dyn rustls::ConnectionCommon<rustls::CommonState>, S> {
        rustls::Stream::new(self.inner.common(), socket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_reflects_construction() {
        // Building a real ServerConfig needs a cert chain; exercised at
        // the integration level where certificates are available. Here we
        // only assert the enum plumbing compiles and matches.
        assert_eq!(HandshakeSide::Server, HandshakeSide::Server);
        assert_ne!(HandshakeSide::Server, HandshakeSide::Client);
    }
}
