//! Client-side connect (spec.md §4.2 "Client connect", "SOCKS5 proxy",
//! "HTTP CONNECT proxy", "Reconnect"). Resolves a target
//! [`EndpointUri`], dials directly or through a proxy, drives an optional
//! TLS handshake, and hands off to the same [`Connection`] the server
//! accept path uses once `ESTABLISHED`.

use std::cell::RefCell;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpStream;
use socket2::Socket as Socket2;
use std::os::unix::io::FromRawFd;

use wireframe_codec::FrameCodec;
use wireframe_core::error::{CoreError, ErrorKind};
use wireframe_core::ids::{ConnectionIdAllocator, WatcherId};
use wireframe_core::stats::Statistics;
use wireframe_core::status::ConnectionStatus;
use wireframe_core::uri::EndpointUri;
use wireframe_eventloop::LoopHandle;

use crate::callbacks::Callbacks;
use crate::connection::{Connection, Role};
use crate::proxy;
use crate::tls::TlsHandshake;

/// Where to dial and what handshake to run before the connection counts
/// as proxied-through (spec.md §4.2).
#[derive(Clone, Debug)]
pub enum ProxyTarget {
    None,
    Socks5(SocketAddr),
    HttpConnect(SocketAddr),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Socks5Greeting,
    Socks5ConnectReply,
    HttpConnectReply,
    TlsHandshake,
}

/// Fixed parameters for a single dial attempt, retained so [`reconnect`]
/// can redial without the caller repeating them (spec.md §4.2
/// "Reconnect").
///
/// [`reconnect`]: ClientConnection::reconnect
#[derive(Clone)]
pub struct ClientConfig {
    pub target: EndpointUri,
    pub proxy: ProxyTarget,
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
    pub server_name: Option<rustls_pki_types::ServerName<'static>>,
    pub max_package_size: usize,
    pub max_send_buffer_size: usize,
}

/// Drives a client connection from `INITIAL` through `CONNECTING`,
/// an optional proxy handshake, an optional TLS handshake, and into
/// `ESTABLISHED`, at which point it behaves exactly like a server-accepted
/// [`Connection`].
pub struct ClientConnection {
    config: ClientConfig,
    codec: Option<Arc<dyn FrameCodec>>,
    callbacks: Rc<Callbacks>,
    loop_handle: LoopHandle,
    ids: Rc<ConnectionIdAllocator>,
    stats: Arc<Statistics>,
    conn: Option<Rc<RefCell<Connection>>>,
    phase: Phase,
    inbound: Vec<u8>,
    dial_watcher: Option<WatcherId>,
    /// Mirrors `dial_watcher` on a readable interest instead of writable.
    /// Windows' IOCP-backed reactor can report a failed non-blocking
    /// connect through the readable set rather than (or ahead of) the
    /// writable one, so `dial()` registers both there; elsewhere this
    /// always stays `None`.
    #[cfg(windows)]
    dial_readable_watcher: Option<WatcherId>,
    reconnect_timer: Option<WatcherId>,
    self_handle: Option<Weak<RefCell<ClientConnection>>>,
}

impl ClientConnection {
    #[allow(clippy::too_many_arguments)]
    pub fn connect(
        config: ClientConfig,
        codec: Option<Arc<dyn FrameCodec>>,
        callbacks: Rc<Callbacks>,
        loop_handle: LoopHandle,
        ids: Rc<ConnectionIdAllocator>,
        stats: Arc<Statistics>,
    ) -> Result<Rc<RefCell<Self>>, CoreError> {
        let client = Self {
            config,
            codec,
            callbacks,
            loop_handle,
            ids,
            stats,
            conn: None,
            phase: Phase::Connecting,
            inbound: Vec::new(),
            dial_watcher: None,
            #[cfg(windows)]
            dial_readable_watcher: None,
            reconnect_timer: None,
            self_handle: None,
        };
        let rc = Rc::new(RefCell::new(client));
        rc.borrow_mut().self_handle = Some(Rc::downgrade(&rc));
        rc.borrow_mut().dial()?;
        Ok(rc)
    }

    pub fn connection(&self) -> Option<Rc<RefCell<Connection>>> {
        self.conn.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.conn
            .as_ref()
            .map(|c| c.borrow().status())
            .unwrap_or(ConnectionStatus::Initial)
    }

    fn dial_addr(&self) -> Result<SocketAddr, CoreError> {
        match &self.config.proxy {
            ProxyTarget::Socks5(addr) | ProxyTarget::HttpConnect(addr) => Ok(*addr),
            ProxyTarget::None => {
                let host = self.config.target.host.as_str();
                let port = self.config.target.port.unwrap_or(0);
                (host, port)
                    .to_socket_addrs()
                    .map_err(|err| wireframe_core::error::map_io_error(ErrorKind::ConnectFail, err))?
                    .next()
                    .ok_or_else(|| {
                        CoreError::new(ErrorKind::ConnectFail, "target host resolved to no address")
                    })
            }
        }
    }

    fn dial(&mut self) -> Result<(), CoreError> {
        let addr = self.dial_addr()?;
        let stream = TcpStream::connect(addr)
            .map_err(|err| wireframe_core::error::map_io_error(ErrorKind::ConnectFail, err))?;

        let id = self.ids.next();
        let remote_addr = Some(addr.to_string());
        let conn = Connection::new_tcp(
            id,
            stream,
            Role::Client,
            self.codec.clone(),
            self.loop_handle.clone(),
            self.stats.clone(),
            self.config.max_package_size,
            self.config.max_send_buffer_size,
            remote_addr,
            self.callbacks.clone(),
        );
        conn.borrow_mut().set_status(ConnectionStatus::Connecting);
        self.conn = Some(conn);
        self.phase = Phase::Connecting;
        self.inbound.clear();

        let fd = self.conn.as_ref().unwrap().borrow().raw_fd();
        let weak = self.self_handle.clone().expect("constructed via connect()");
        let id = self.loop_handle.borrow_mut().on_writable(
            fd,
            Box::new({
                let weak = weak.clone();
                move || {
                    if let Some(client) = weak.upgrade() {
                        client.borrow_mut().on_connect_writable();
                    }
                }
            }),
        );
        self.dial_watcher = Some(id);

        #[cfg(windows)]
        {
            let id = self.loop_handle.borrow_mut().on_readable(
                fd,
                Box::new(move || {
                    if let Some(client) = weak.upgrade() {
                        client.borrow_mut().on_connect_writable();
                    }
                }),
            );
            self.dial_readable_watcher = Some(id);
        }

        Ok(())
    }

    fn fd(&self) -> std::os::unix::io::RawFd {
        self.conn.as_ref().unwrap().borrow().raw_fd()
    }

    fn fail(&mut self, err: CoreError) {
        if let Some(conn) = &self.conn {
            self.callbacks.fire_error(&mut conn.borrow_mut(), err);
            conn.borrow_mut().destroy(&self.callbacks);
        }
    }

    fn on_connect_writable(&mut self) {
        let Some(conn) = self.conn.clone() else { return };
        let so_error = {
            let fd = conn.borrow().raw_fd();
            // SAFETY: `fd` stays owned by `conn`'s socket; wrapping it
            // here only reads `SO_ERROR`, and `mem::forget` below stops
            // the temporary `Socket` from closing it on drop.
            let sock = unsafe { Socket2::from_raw_fd(fd) };
            let result = sock.take_error();
            std::mem::forget(sock);
            result
        };
        self.loop_handle.borrow_mut().off_writable(self.fd());
        self.dial_watcher = None;

        #[cfg(windows)]
        if self.dial_readable_watcher.take().is_some() {
            self.loop_handle.borrow_mut().off_readable(self.fd());
        }

        match so_error {
            Ok(None) => {}
            Ok(Some(err)) => {
                self.fail(wireframe_core::error::map_io_error(ErrorKind::ConnectFail, err));
                return;
            }
            Err(err) => {
                self.fail(wireframe_core::error::map_io_error(ErrorKind::ConnectFail, err));
                return;
            }
        }

        match self.config.proxy.clone() {
            ProxyTarget::None => self.begin_tls_or_established(),
            ProxyTarget::Socks5(_) => self.send_socks5_greeting(),
            ProxyTarget::HttpConnect(_) => self.send_http_connect(),
        }
    }

    fn install_raw_readable(&mut self) {
        let fd = self.fd();
        let weak = self.self_handle.clone().expect("constructed via connect()");
        self.loop_handle.borrow_mut().on_readable(
            fd,
            Box::new(move || {
                if let Some(client) = weak.upgrade() {
                    client.borrow_mut().on_raw_readable();
                }
            }),
        );
    }

    fn send_socks5_greeting(&mut self) {
        let conn = self.conn.clone().unwrap();
        if let Err(err) = conn.borrow_mut().raw_write(&proxy::socks5_greeting()) {
            if err.kind() != io::ErrorKind::WouldBlock {
                self.fail(wireframe_core::error::map_io_error(ErrorKind::ConnectFail, err));
                return;
            }
        }
        self.phase = Phase::Socks5Greeting;
        self.inbound.clear();
        self.install_raw_readable();
    }

    fn send_http_connect(&mut self) {
        let conn = self.conn.clone().unwrap();
        let req = proxy::http_connect_request(&self.config.target.host, self.config.target.port.unwrap_or(0));
        if let Err(err) = conn.borrow_mut().raw_write(&req) {
            if err.kind() != io::ErrorKind::WouldBlock {
                self.fail(wireframe_core::error::map_io_error(ErrorKind::ConnectFail, err));
                return;
            }
        }
        self.phase = Phase::HttpConnectReply;
        self.inbound.clear();
        self.install_raw_readable();
    }

    fn on_raw_readable(&mut self) {
        let Some(conn) = self.conn.clone() else { return };
        let mut chunk = [0u8; 512];
        let n = match conn.borrow_mut().raw_read(&mut chunk) {
            Ok(0) => {
                self.fail(CoreError::new(ErrorKind::ConnectFail, "peer closed during proxy handshake"));
                return;
            }
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
            Err(err) => {
                self.fail(wireframe_core::error::map_io_error(ErrorKind::ConnectFail, err));
                return;
            }
        };
        self.inbound.extend_from_slice(&chunk[..n]);

        match self.phase {
            Phase::Socks5Greeting => self.try_finish_socks5_greeting(),
            Phase::Socks5ConnectReply => self.try_finish_socks5_connect(),
            Phase::HttpConnectReply => self.try_finish_http_connect(),
            Phase::TlsHandshake | Phase::Connecting => {}
        }
    }

    fn try_finish_socks5_greeting(&mut self) {
        if self.inbound.len() < 2 {
            return;
        }
        let reply = std::mem::take(&mut self.inbound);
        if let Err(err) = proxy::parse_socks5_greeting_reply(&reply) {
            self.fail(err);
            return;
        }
        let conn = self.conn.clone().unwrap();
        let req = match proxy::socks5_connect_request(
            &self.config.target.host,
            self.config.target.port.unwrap_or(0),
        ) {
            Ok(req) => req,
            Err(err) => {
                self.fail(err);
                return;
            }
        };
        if let Err(err) = conn.borrow_mut().raw_write(&req) {
            if err.kind() != io::ErrorKind::WouldBlock {
                self.fail(wireframe_core::error::map_io_error(ErrorKind::ConnectFail, err));
                return;
            }
        }
        self.phase = Phase::Socks5ConnectReply;
        self.inbound.clear();
    }

    /// `BND.ADDR` length depends on the address type in byte 3: 4 for
    /// IPv4, 16 for IPv6, or a length-prefixed domain name.
    fn socks5_connect_reply_len(buf: &[u8]) -> Option<usize> {
        if buf.len() < 4 {
            return None;
        }
        let addr_len = match buf[3] {
            0x01 => 4,
            0x04 => 16,
            0x03 => {
                if buf.len() < 5 {
                    return None;
                }
                1 + buf[4] as usize
            }
            _ => return None,
        };
        Some(4 + addr_len + 2)
    }

    fn try_finish_socks5_connect(&mut self) {
        let Some(total) = Self::socks5_connect_reply_len(&self.inbound) else {
            return;
        };
        if self.inbound.len() < total {
            return;
        }
        let reply = std::mem::take(&mut self.inbound);
        if let Err(err) = proxy::parse_socks5_connect_reply(&reply) {
            self.fail(err);
            return;
        }
        self.begin_tls_or_established();
    }

    fn try_finish_http_connect(&mut self) {
        let Some(pos) = self
            .inbound
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
        else {
            return;
        };
        let reply = self.inbound[..pos + 4].to_vec();
        self.inbound.clear();
        if let Err(err) = proxy::parse_http_connect_status(&reply) {
            self.fail(err);
            return;
        }
        self.begin_tls_or_established();
    }

    fn begin_tls_or_established(&mut self) {
        let conn = self.conn.clone().unwrap();
        if let Some(tls_config) = self.config.tls_config.clone() {
            let server_name = match self.config.server_name.clone() {
                Some(name) => name,
                None => {
                    self.fail(CoreError::new(
                        ErrorKind::SslHandshakeFail,
                        "TLS client connect requires a server name",
                    ));
                    return;
                }
            };
            match TlsHandshake::client(tls_config, server_name) {
                Ok(handshake) => {
                    conn.borrow_mut().attach_tls(handshake);
                    self.phase = Phase::TlsHandshake;
                    self.install_raw_readable();
                    self.drive_client_tls();
                }
                Err(err) => self.fail(err),
            }
        } else {
            conn.borrow_mut().mark_established();
            self.callbacks.fire_connect(&mut conn.borrow_mut());
            conn.borrow_mut().resume_recv();
        }
    }

    /// Drives the client-side TLS handshake directly (rather than through
    /// [`Connection::handle_readable`]) since the loop is still in the
    /// connect/proxy phase, not handing readability events to the
    /// established frame loop yet.
    fn drive_client_tls(&mut self) {
        let conn = self.conn.clone().unwrap();
        match conn.borrow_mut().drive_handshake() {
            Ok(true) => {
                self.callbacks.fire_connect(&mut conn.borrow_mut());
                conn.borrow_mut().resume_recv();
            }
            Ok(false) => {}
            Err(err) => self.fail(err),
        }
    }

    /// Resets to `INITIAL` and redials, either immediately (`after ==
    /// Duration::ZERO`) or after a `delay` timer (spec.md §4.2
    /// "Reconnect").
    pub fn reconnect(&mut self, after: Duration) {
        if let Some(conn) = &self.conn {
            conn.borrow_mut().set_status(ConnectionStatus::Initial);
        }
        self.conn = None;

        if after.is_zero() {
            let _ = self.dial();
            return;
        }

        let weak = self.self_handle.clone().expect("constructed via connect()");
        let id = self.loop_handle.borrow_mut().delay(
            after,
            Box::new(move || {
                if let Some(client) = weak.upgrade() {
                    let _ = client.borrow_mut().dial();
                }
            }),
        );
        self.reconnect_timer = Some(id);
    }

    pub fn cancel_reconnect(&mut self) {
        if let Some(id) = self.reconnect_timer.take() {
            self.loop_handle.borrow_mut().cancel_timer(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socks5_connect_reply_len_handles_ipv4() {
        let reply = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
        assert_eq!(ClientConnection::socks5_connect_reply_len(&reply), Some(10));
    }

    #[test]
    fn socks5_connect_reply_len_waits_for_domain_length_byte() {
        assert_eq!(ClientConnection::socks5_connect_reply_len(&[0x05, 0x00, 0x00, 0x03]), None);
    }
}
