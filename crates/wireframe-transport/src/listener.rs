//! The bound transport endpoint (spec.md §3 "Entity: Listener", §4.2
//! "Server accept loop"). Binds TCP/UDP/UNIX (optionally TLS-wrapped),
//! registers a readability watcher, and turns each accepted peer into a
//! [`Connection`].

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;

use mio::net::{TcpListener as MioTcpListener, UdpSocket as MioUdpSocket, UnixListener as MioUnixListener};
use socket2::{Domain, Protocol, Socket as Socket2, Type};

use wireframe_codec::FrameCodec;
use wireframe_core::error::{CoreError, ErrorKind};
use wireframe_core::ids::{ConnectionId, ConnectionIdAllocator};
use wireframe_core::stats::Statistics;
use wireframe_eventloop::LoopHandle;

use crate::callbacks::Callbacks;
use crate::connection::{Connection, Role};

/// Accept no more than this many pending peers per readability tick, so a
/// burst of connects on one listener cannot starve other fds registered on
/// the same loop.
const ACCEPT_BATCH: usize = 64;

enum Bound {
    Tcp(MioTcpListener),
    Unix(MioUnixListener),
    /// UDP has no accept lifecycle, so there is nothing to accept a peer
    /// out of — the single long-lived [`Connection`] built at bind time
    /// both owns the socket and is the target of every `onMessage` fired
    /// from a datagram (spec.md §4.2's connection-oriented accept loop
    /// does not apply here).
    Udp(Rc<RefCell<Connection>>),
}

impl AsRawFd for Bound {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        match self {
            Bound::Tcp(l) => l.as_raw_fd(),
            Bound::Unix(l) => l.as_raw_fd(),
            Bound::Udp(conn) => conn.borrow().raw_fd(),
        }
    }
}

/// A bound transport endpoint (spec.md §3). Owned by a worker; one per
/// configured listener, possibly replicated across `reuse_port` siblings
/// within the same worker when the protocol wants parallel accept queues.
pub struct Listener {
    bound: Bound,
    codec: Option<Arc<dyn FrameCodec>>,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    max_connections: usize,
    max_package_size: usize,
    max_send_buffer_size: usize,
    callbacks: Rc<Callbacks>,
    loop_handle: LoopHandle,
    ids: Rc<ConnectionIdAllocator>,
    stats: Arc<Statistics>,
    connections: Rc<RefCell<Vec<Rc<RefCell<Connection>>>>>,
    watcher_id: Option<wireframe_core::ids::WatcherId>,
    self_handle: Option<std::rc::Weak<RefCell<Listener>>>,
}

impl Listener {
    /// Binds a TCP listener at `addr`, optionally with `SO_REUSEPORT` set
    /// before `bind` so sibling workers can share the same port.
    fn bind_tcp(addr: SocketAddr, reuse_port: bool) -> io::Result<MioTcpListener> {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket2::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        if reuse_port {
            socket.set_reuse_port(true)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;
        let std_listener = unsafe { std::net::TcpListener::from_raw_fd(socket.into_raw_fd()) };
        MioTcpListener::from_std(std_listener)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn bind_tcp_endpoint(
        addr: SocketAddr,
        reuse_port: bool,
        codec: Option<Arc<dyn FrameCodec>>,
        tls_config: Option<Arc<rustls::ServerConfig>>,
        max_connections: usize,
        max_package_size: usize,
        max_send_buffer_size: usize,
        callbacks: Rc<Callbacks>,
        loop_handle: LoopHandle,
        ids: Rc<ConnectionIdAllocator>,
        stats: Arc<Statistics>,
    ) -> Result<Rc<RefCell<Self>>, CoreError> {
        let listener = Self::bind_tcp(addr, reuse_port)
            .map_err(|err| wireframe_core::error::map_io_error(ErrorKind::ConnectFail, err))?;
        Ok(Self::wrap(
            Bound::Tcp(listener),
            codec,
            tls_config,
            max_connections,
            max_package_size,
            max_send_buffer_size,
            callbacks,
            loop_handle,
            ids,
            stats,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn bind_unix_endpoint(
        path: &std::path::Path,
        codec: Option<Arc<dyn FrameCodec>>,
        max_connections: usize,
        max_package_size: usize,
        max_send_buffer_size: usize,
        callbacks: Rc<Callbacks>,
        loop_handle: LoopHandle,
        ids: Rc<ConnectionIdAllocator>,
        stats: Arc<Statistics>,
    ) -> Result<Rc<RefCell<Self>>, CoreError> {
        // A stale socket file from a prior run would otherwise make `bind`
        // fail with `EADDRINUSE`.
        let _ = std::fs::remove_file(path);
        let listener = MioUnixListener::bind(path)
            .map_err(|err| wireframe_core::error::map_io_error(ErrorKind::ConnectFail, err))?;
        Ok(Self::wrap(
            Bound::Unix(listener),
            codec,
            None,
            max_connections,
            max_package_size,
            max_send_buffer_size,
            callbacks,
            loop_handle,
            ids,
            stats,
        ))
    }

    /// Binds a UDP socket at `addr`. No `listen`/backlog — datagram
    /// sockets have no accept queue.
    fn bind_udp(addr: SocketAddr, reuse_port: bool) -> io::Result<MioUdpSocket> {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket2::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        if reuse_port {
            socket.set_reuse_port(true)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        let std_socket = unsafe { std::net::UdpSocket::from_raw_fd(socket.into_raw_fd()) };
        MioUdpSocket::from_std(std_socket)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn bind_udp_endpoint(
        addr: SocketAddr,
        reuse_port: bool,
        codec: Option<Arc<dyn FrameCodec>>,
        max_package_size: usize,
        max_send_buffer_size: usize,
        callbacks: Rc<Callbacks>,
        loop_handle: LoopHandle,
        ids: Rc<ConnectionIdAllocator>,
        stats: Arc<Statistics>,
    ) -> Result<Rc<RefCell<Self>>, CoreError> {
        let socket = Self::bind_udp(addr, reuse_port)
            .map_err(|err| wireframe_core::error::map_io_error(ErrorKind::ConnectFail, err))?;
        Ok(Self::wrap_udp(
            socket,
            codec,
            max_package_size,
            max_send_buffer_size,
            callbacks,
            loop_handle,
            ids,
            stats,
        ))
    }

    /// UDP counterpart to [`Listener::from_inherited_tcp_fd`].
    #[allow(clippy::too_many_arguments)]
    pub fn from_inherited_udp_fd(
        fd: RawFd,
        codec: Option<Arc<dyn FrameCodec>>,
        max_package_size: usize,
        max_send_buffer_size: usize,
        callbacks: Rc<Callbacks>,
        loop_handle: LoopHandle,
        ids: Rc<ConnectionIdAllocator>,
        stats: Arc<Statistics>,
    ) -> Result<Rc<RefCell<Self>>, CoreError> {
        let std_socket = unsafe { std::net::UdpSocket::from_raw_fd(fd) };
        std_socket
            .set_nonblocking(true)
            .map_err(|err| wireframe_core::error::map_io_error(ErrorKind::ConnectFail, err))?;
        let socket = MioUdpSocket::from_std(std_socket);
        Ok(Self::wrap_udp(
            socket,
            codec,
            max_package_size,
            max_send_buffer_size,
            callbacks,
            loop_handle,
            ids,
            stats,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn wrap_udp(
        socket: MioUdpSocket,
        codec: Option<Arc<dyn FrameCodec>>,
        max_package_size: usize,
        max_send_buffer_size: usize,
        callbacks: Rc<Callbacks>,
        loop_handle: LoopHandle,
        ids: Rc<ConnectionIdAllocator>,
        stats: Arc<Statistics>,
    ) -> Rc<RefCell<Self>> {
        let id = ids.next();
        let conn = Connection::new_udp(
            id,
            socket,
            codec,
            loop_handle.clone(),
            stats.clone(),
            max_package_size,
            max_send_buffer_size,
            callbacks.clone(),
        );
        let listener = Self {
            bound: Bound::Udp(conn),
            codec: None,
            tls_config: None,
            max_connections: 0,
            max_package_size,
            max_send_buffer_size,
            callbacks,
            loop_handle,
            ids,
            stats,
            connections: Rc::new(RefCell::new(Vec::new())),
            watcher_id: None,
            self_handle: None,
        };
        let rc = Rc::new(RefCell::new(listener));
        rc.borrow_mut().self_handle = Some(Rc::downgrade(&rc));
        rc
    }

    /// Wraps an already bound-and-listening TCP socket inherited from a
    /// parent process (spec.md §4.4: "the master passes pre-bound sockets
    /// to workers pre-fork"). `fd` must outlive this call as an owned,
    /// listening descriptor; ownership transfers to the returned
    /// `Listener`.
    #[allow(clippy::too_many_arguments)]
    pub fn from_inherited_tcp_fd(
        fd: RawFd,
        codec: Option<Arc<dyn FrameCodec>>,
        tls_config: Option<Arc<rustls::ServerConfig>>,
        max_connections: usize,
        max_package_size: usize,
        max_send_buffer_size: usize,
        callbacks: Rc<Callbacks>,
        loop_handle: LoopHandle,
        ids: Rc<ConnectionIdAllocator>,
        stats: Arc<Statistics>,
    ) -> Result<Rc<RefCell<Self>>, CoreError> {
        let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
        std_listener
            .set_nonblocking(true)
            .map_err(|err| wireframe_core::error::map_io_error(ErrorKind::ConnectFail, err))?;
        let listener = MioTcpListener::from_std(std_listener);
        Ok(Self::wrap(
            Bound::Tcp(listener),
            codec,
            tls_config,
            max_connections,
            max_package_size,
            max_send_buffer_size,
            callbacks,
            loop_handle,
            ids,
            stats,
        ))
    }

    /// Unix-domain counterpart to [`Listener::from_inherited_tcp_fd`].
    #[allow(clippy::too_many_arguments)]
    pub fn from_inherited_unix_fd(
        fd: RawFd,
        codec: Option<Arc<dyn FrameCodec>>,
        max_connections: usize,
        max_package_size: usize,
        max_send_buffer_size: usize,
        callbacks: Rc<Callbacks>,
        loop_handle: LoopHandle,
        ids: Rc<ConnectionIdAllocator>,
        stats: Arc<Statistics>,
    ) -> Result<Rc<RefCell<Self>>, CoreError> {
        let std_listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd) };
        std_listener
            .set_nonblocking(true)
            .map_err(|err| wireframe_core::error::map_io_error(ErrorKind::ConnectFail, err))?;
        let listener = MioUnixListener::from_std(std_listener);
        Ok(Self::wrap(
            Bound::Unix(listener),
            codec,
            None,
            max_connections,
            max_package_size,
            max_send_buffer_size,
            callbacks,
            loop_handle,
            ids,
            stats,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn wrap(
        bound: Bound,
        codec: Option<Arc<dyn FrameCodec>>,
        tls_config: Option<Arc<rustls::ServerConfig>>,
        max_connections: usize,
        max_package_size: usize,
        max_send_buffer_size: usize,
        callbacks: Rc<Callbacks>,
        loop_handle: LoopHandle,
        ids: Rc<ConnectionIdAllocator>,
        stats: Arc<Statistics>,
    ) -> Rc<RefCell<Self>> {
        let listener = Self {
            bound,
            codec,
            tls_config,
            max_connections,
            max_package_size,
            max_send_buffer_size,
            callbacks,
            loop_handle,
            ids,
            stats,
            connections: Rc::new(RefCell::new(Vec::new())),
            watcher_id: None,
            self_handle: None,
        };
        let rc = Rc::new(RefCell::new(listener));
        rc.borrow_mut().self_handle = Some(Rc::downgrade(&rc));
        rc
    }

    /// Registers the readability watcher that drives the accept loop.
    /// Idempotent; a listener with no callback wired yet should not start
    /// accepting.
    pub fn start(&mut self) {
        if self.watcher_id.is_some() {
            return;
        }
        let fd = self.bound.as_raw_fd();
        let weak = self
            .self_handle
            .clone()
            .expect("listener must be constructed via bind_tcp_endpoint/bind_unix_endpoint/bind_udp_endpoint");
        let id = self.loop_handle.borrow_mut().on_readable(
            fd,
            Box::new(move || {
                if let Some(listener) = weak.upgrade() {
                    listener.borrow_mut().accept_batch();
                }
            }),
        );
        self.watcher_id = Some(id);
    }

    /// Deregisters the accept watcher (spec.md §4.4 shutdown step 1:
    /// "stop accepting new connections"). Already-open connections are
    /// untouched.
    pub fn stop_accepting(&mut self) {
        if self.watcher_id.take().is_some() {
            let fd = self.bound.as_raw_fd();
            self.loop_handle.borrow_mut().off_readable(fd);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .borrow()
            .iter()
            .filter(|c| c.borrow().status() != wireframe_core::status::ConnectionStatus::Closed)
            .count()
    }

    /// Iterates live connections without mutating them — used to render a
    /// `SIGQUIT` diagnostic dump.
    pub fn for_each_connection(&self, mut f: impl FnMut(&Connection)) {
        for conn in self.connections.borrow().iter() {
            f(&conn.borrow());
        }
    }

    /// Forcibly destroys every connection still open, regardless of
    /// in-flight sends (spec.md §4.4 shutdown step 4: "destroy remaining
    /// connections"). Called once a worker's `stopTimeout` elapses.
    pub fn destroy_all(&mut self) {
        for conn in self.connections.borrow().iter() {
            conn.borrow_mut().destroy(&self.callbacks);
        }
    }

    fn next_id(&self) -> ConnectionId {
        self.ids.next()
    }

    fn accept_batch(&mut self) {
        for _ in 0..ACCEPT_BATCH {
            match &self.bound {
                Bound::Tcp(listener) => match listener.accept() {
                    Ok((stream, addr)) => self.on_tcp_accepted(stream, Some(addr.to_string())),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                    Err(_) => return,
                },
                Bound::Unix(listener) => match listener.accept() {
                    Ok((stream, _addr)) => self.on_unix_accepted(stream),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                    Err(_) => return,
                },
                Bound::Udp(conn) => {
                    let conn = conn.clone();
                    let callbacks = self.callbacks.clone();
                    match conn.borrow_mut().recv_datagram(&callbacks) {
                        Ok(_) => continue,
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                        Err(_) => return,
                    }
                }
            }
        }
    }

    fn reject_over_capacity(&self) -> bool {
        self.connections
            .borrow_mut()
            .retain(|c| c.borrow().status() != wireframe_core::status::ConnectionStatus::Closed);
        self.connections.borrow().len() >= self.max_connections
    }

    fn on_tcp_accepted(&mut self, stream: mio::net::TcpStream, remote_addr: Option<String>) {
        if self.reject_over_capacity() {
            drop(stream);
            return;
        }
        let id = self.next_id();
        let conn = Connection::new_tcp(
            id,
            stream,
            Role::Server,
            self.codec.clone(),
            self.loop_handle.clone(),
            self.stats.clone(),
            self.max_package_size,
            self.max_send_buffer_size,
            remote_addr,
            self.callbacks.clone(),
        );
        self.finish_accept(conn);
    }

    fn on_unix_accepted(&mut self, stream: mio::net::UnixStream) {
        if self.reject_over_capacity() {
            drop(stream);
            return;
        }
        let id = self.next_id();
        let conn = Connection::new_unix(
            id,
            stream,
            Role::Server,
            self.codec.clone(),
            self.loop_handle.clone(),
            self.stats.clone(),
            self.max_package_size,
            self.max_send_buffer_size,
            None,
            self.callbacks.clone(),
        );
        self.finish_accept(conn);
    }

    fn finish_accept(&mut self, conn: Rc<RefCell<Connection>>) {
        self.stats.record_accept();

        if let Some(tls_config) = &self.tls_config {
            match crate::tls::TlsHandshake::server(tls_config.clone()) {
                Ok(handshake) => conn.borrow_mut().attach_tls(handshake),
                Err(err) => {
                    self.callbacks.fire_error(&mut conn.borrow_mut(), err);
                    return;
                }
            }
        } else {
            conn.borrow_mut().mark_established();
        }

        conn.borrow_mut().resume_recv();
        self.connections.borrow_mut().push(conn.clone());

        if conn.borrow().status() != wireframe_core::status::ConnectionStatus::Handshaking {
            self.callbacks.fire_connect(&mut conn.borrow_mut());
        }
    }
}
