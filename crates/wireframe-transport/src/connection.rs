use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use mio::net::{TcpStream, UdpSocket, UnixStream};

use wireframe_codec::{DecodedMessage, FrameCodec, FrameLength};
use wireframe_core::buffer::{BackpressureEdge, RecvBuffer, SendBuffer};
use wireframe_core::error::{CoreError, ErrorKind};
use wireframe_core::ids::ConnectionId;
use wireframe_core::stats::Statistics;
use wireframe_core::status::ConnectionStatus;
use wireframe_eventloop::LoopHandle;

use crate::callbacks::Callbacks;
use crate::tls::{HandshakeStep, TlsHandshake};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Whether a connection was accepted by a listener or dialed explicitly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// Outcome of [`Connection::send_raw`]/[`Connection::send_message`],
/// mirroring the three-way `true`/`null`/`false` result from spec.md §4.2.
#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Every byte reached the kernel socket buffer.
    Sent,
    /// Some or all of the payload was appended to the send buffer.
    Buffered,
    /// The connection is closed, closing, or the send buffer would
    /// overflow `maxSendBufferSize`.
    Rejected,
}

/// A UDP socket has no fixed peer, so unlike `Tcp`/`Unix`, writes through
/// the shared `Read`/`Write` plumbing ([`Connection::raw_write`]) need
/// somewhere to send to; `peer` is set by [`Connection::set_udp_peer`]
/// right before each `onMessage` dispatch, so a reply made from inside the
/// handler reaches the datagram's actual source.
const UNSPECIFIED_PEER: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));

enum Socket {
    Tcp(TcpStream),
    Unix(UnixStream),
    Udp { socket: UdpSocket, peer: SocketAddr },
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.read(buf),
            Socket::Unix(s) => s.read(buf),
            Socket::Udp { socket, .. } => socket.recv(buf),
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Socket::Tcp(s) => s.write(buf),
            Socket::Unix(s) => s.write(buf),
            Socket::Udp { socket, peer } => socket.send_to(buf, *peer),
        }
    }
    fn flush(&mut self) -> io::Result<()> {
        match self {
            Socket::Tcp(s) => s.flush(),
            Socket::Unix(s) => s.flush(),
            Socket::Udp { .. } => Ok(()),
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Socket::Tcp(s) => s.as_raw_fd(),
            Socket::Unix(s) => s.as_raw_fd(),
            Socket::Udp { socket, .. } => socket.as_raw_fd(),
        }
    }
}

/// A single peer session (spec.md §3 "Entity: Connection"). Mutated only
/// from the worker's own loop; shared across callback closures via
/// `Rc<RefCell<Connection>>` at the call site, since watcher callbacks are
/// plain `FnMut()` with no way to reach the owning table otherwise.
pub struct Connection {
    id: ConnectionId,
    socket: Socket,
    role: Role,
    status: ConnectionStatus,
    recv: RecvBuffer,
    send: SendBuffer,
    codec: Option<Arc<dyn FrameCodec>>,
    loop_handle: LoopHandle,
    readable_id: Option<wireframe_core::ids::WatcherId>,
    writable_id: Option<wireframe_core::ids::WatcherId>,
    remote_addr: Option<String>,
    stats: Arc<Statistics>,
    tls: Option<TlsHandshake>,
    pipe_target: Option<Rc<RefCell<Connection>>>,
    context: Option<Box<dyn std::any::Any>>,
    callbacks: Rc<Callbacks>,
    self_handle: Option<Weak<RefCell<Connection>>>,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub fn new_tcp(
        id: ConnectionId,
        stream: TcpStream,
        role: Role,
        codec: Option<Arc<dyn FrameCodec>>,
        loop_handle: LoopHandle,
        stats: Arc<Statistics>,
        max_package_size: usize,
        max_send_buffer_size: usize,
        remote_addr: Option<String>,
        callbacks: Rc<Callbacks>,
    ) -> Rc<RefCell<Self>> {
        let conn = Self {
            id,
            socket: Socket::Tcp(stream),
            role,
            status: ConnectionStatus::Initial,
            recv: RecvBuffer::new(max_package_size),
            send: SendBuffer::new(max_send_buffer_size),
            codec,
            loop_handle,
            readable_id: None,
            writable_id: None,
            remote_addr,
            stats,
            tls: None,
            pipe_target: None,
            context: None,
            callbacks,
            self_handle: None,
        };
        let rc = Rc::new(RefCell::new(conn));
        rc.borrow_mut().self_handle = Some(Rc::downgrade(&rc));
        rc
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_unix(
        id: ConnectionId,
        stream: UnixStream,
        role: Role,
        codec: Option<Arc<dyn FrameCodec>>,
        loop_handle: LoopHandle,
        stats: Arc<Statistics>,
        max_package_size: usize,
        max_send_buffer_size: usize,
        remote_addr: Option<String>,
        callbacks: Rc<Callbacks>,
    ) -> Rc<RefCell<Self>> {
        let conn = Self {
            id,
            socket: Socket::Unix(stream),
            role,
            status: ConnectionStatus::Initial,
            recv: RecvBuffer::new(max_package_size),
            send: SendBuffer::new(max_send_buffer_size),
            codec,
            loop_handle,
            readable_id: None,
            writable_id: None,
            remote_addr,
            stats,
            tls: None,
            pipe_target: None,
            context: None,
            callbacks,
            self_handle: None,
        };
        let rc = Rc::new(RefCell::new(conn));
        rc.borrow_mut().self_handle = Some(Rc::downgrade(&rc));
        rc
    }

    /// Wraps a bound UDP socket. Unlike [`Connection::new_tcp`]/`new_unix`,
    /// this connection is long-lived for the whole listener rather than
    /// one per peer — spec.md's UDP contract has no accept/connect
    /// lifecycle, just an independent `onMessage` per datagram. The
    /// listener drives reads directly through [`Connection::recv_datagram`]
    /// rather than installing a readability watcher here.
    #[allow(clippy::too_many_arguments)]
    pub fn new_udp(
        id: ConnectionId,
        socket: UdpSocket,
        codec: Option<Arc<dyn FrameCodec>>,
        loop_handle: LoopHandle,
        stats: Arc<Statistics>,
        max_package_size: usize,
        max_send_buffer_size: usize,
        callbacks: Rc<Callbacks>,
    ) -> Rc<RefCell<Self>> {
        let conn = Self {
            id,
            socket: Socket::Udp {
                socket,
                peer: UNSPECIFIED_PEER,
            },
            role: Role::Server,
            status: ConnectionStatus::Established,
            recv: RecvBuffer::new(max_package_size),
            send: SendBuffer::new(max_send_buffer_size),
            codec,
            loop_handle,
            readable_id: None,
            writable_id: None,
            remote_addr: None,
            stats,
            tls: None,
            pipe_target: None,
            context: None,
            callbacks,
            self_handle: None,
        };
        let rc = Rc::new(RefCell::new(conn));
        rc.borrow_mut().self_handle = Some(Rc::downgrade(&rc));
        rc
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    fn set_udp_peer(&mut self, peer: SocketAddr) {
        if let Socket::Udp { peer: slot, .. } = &mut self.socket {
            *slot = peer;
        }
        self.remote_addr = Some(peer.to_string());
    }

    pub fn bytes_read(&self) -> usize {
        self.recv.len()
    }

    pub fn set_context(&mut self, context: Box<dyn std::any::Any>) {
        self.context = Some(context);
    }

    pub fn context(&self) -> Option<&dyn std::any::Any> {
        self.context.as_deref()
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn attach_tls(&mut self, handshake: TlsHandshake) {
        self.tls = Some(handshake);
        self.status = ConnectionStatus::Handshaking;
    }

    /// Transitions a freshly accepted or dialed plaintext connection
    /// straight to `ESTABLISHED`, skipping the handshake state.
    pub fn mark_established(&mut self) {
        self.status = ConnectionStatus::Established;
    }

    /// Direct status transition for the client dial state machine
    /// (`CONNECTING`, proxy handshake phases) which precedes the codec
    /// frame loop this type otherwise drives on its own.
    pub(crate) fn set_status(&mut self, status: ConnectionStatus) {
        self.status = status;
    }

    pub fn pipe(&mut self, target: Rc<RefCell<Connection>>) {
        self.pipe_target = Some(target);
    }

    /// Drives a pending TLS handshake one step; returns `true` once it has
    /// completed and the connection transitioned to `ESTABLISHED`.
    pub fn drive_handshake(&mut self) -> Result<bool, CoreError> {
        let Some(handshake) = self.tls.as_mut() else {
            return Ok(true);
        };
        match handshake.step(&mut self.socket)? {
            HandshakeStep::Pending => Ok(false),
            HandshakeStep::Complete => {
                self.status = ConnectionStatus::Established;
                Ok(true)
            }
        }
    }

    pub(crate) fn raw_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(tls) = self.tls.as_mut() {
            tls.stream(&mut self.socket).write(buf)
        } else {
            self.socket.write(buf)
        }
    }

    pub(crate) fn raw_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(tls) = self.tls.as_mut() {
            tls.stream(&mut self.socket).read(buf)
        } else {
            self.socket.read(buf)
        }
    }

    /// Sends already-framed bytes, bypassing any attached codec.
    pub fn send_raw(&mut self, payload: &[u8], callbacks: &Callbacks) -> SendOutcome {
        self.write_bytes(payload, callbacks)
    }

    /// Encodes `message` through the attached codec (if any) and sends it.
    pub fn send_message(
        &mut self,
        message: &DecodedMessage,
        callbacks: &Callbacks,
    ) -> Result<SendOutcome, CoreError> {
        let bytes = match &self.codec {
            Some(codec) => codec.encode(message)?,
            None => return Err(CoreError::new(ErrorKind::ProtocolError, "no codec attached")),
        };
        Ok(self.write_bytes(&bytes, callbacks))
    }

    fn write_bytes(&mut self, payload: &[u8], callbacks: &Callbacks) -> SendOutcome {
        if !self.status.accepts_writes() {
            return SendOutcome::Rejected;
        }

        if self.send.is_empty() {
            match self.raw_write(payload) {
                Ok(n) if n == payload.len() => {
                    self.stats.record_write(n as u64);
                    return SendOutcome::Sent;
                }
                Ok(n) => {
                    self.stats.record_write(n as u64);
                    let edge = match self.send.push(&payload[n..]) {
                        Ok(edge) => edge,
                        Err(()) => {
                            self.stats.record_send_failure();
                            return SendOutcome::Rejected;
                        }
                    };
                    self.install_writable();
                    self.fire_backpressure(edge, callbacks);
                    return SendOutcome::Buffered;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => {
                    self.stats.record_send_failure();
                    return SendOutcome::Rejected;
                }
            }
        }

        match self.send.push(payload) {
            Ok(edge) => {
                self.install_writable();
                self.fire_backpressure(edge, callbacks);
                SendOutcome::Buffered
            }
            Err(()) => {
                self.stats.record_send_failure();
                SendOutcome::Rejected
            }
        }
    }

    fn fire_backpressure(&mut self, edge: BackpressureEdge, callbacks: &Callbacks) {
        match edge {
            BackpressureEdge::BecameFull => callbacks.fire_buffer_full(self),
            BackpressureEdge::Drained => callbacks.fire_buffer_drain(self),
            BackpressureEdge::None => {}
        }
    }

    fn install_writable(&mut self) {
        if self.writable_id.is_some() {
            return;
        }
        let fd = self.raw_fd();
        let weak = self
            .self_handle
            .clone()
            .expect("connection must be constructed via new_tcp/new_unix");
        let callbacks = self.callbacks.clone();
        let mut lp = self.loop_handle.borrow_mut();
        let id = lp.on_writable(
            fd,
            Box::new(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.borrow_mut().handle_writable(&callbacks);
                }
            }),
        );
        self.writable_id = Some(id);
    }

    fn uninstall_writable(&mut self) {
        if let Some(_id) = self.writable_id.take() {
            let fd = self.raw_fd();
            self.loop_handle.borrow_mut().off_writable(fd);
        }
    }

    /// Drains as much of the send buffer as the kernel will accept; call
    /// on a writability tick.
    pub fn handle_writable(&mut self, callbacks: &Callbacks) {
        loop {
            if self.send.is_empty() {
                break;
            }
            match self.raw_write(self.send.as_slice()) {
                Ok(0) => break,
                Ok(n) => {
                    self.stats.record_write(n as u64);
                    let edge = self.send.consume(n);
                    self.fire_backpressure(edge, callbacks);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.stats.record_send_failure();
                    self.destroy(callbacks);
                    return;
                }
            }
        }
        if self.send.is_empty() {
            self.uninstall_writable();
            if self.status == ConnectionStatus::Closing {
                self.destroy(callbacks);
            }
        }
    }

    /// Removes the readability watcher without discarding buffered bytes.
    pub fn pause_recv(&mut self) {
        if let Some(_id) = self.readable_id.take() {
            let fd = self.raw_fd();
            self.loop_handle.borrow_mut().off_readable(fd);
        }
    }

    /// Re-installs the readability watcher after [`Connection::pause_recv`].
    pub fn resume_recv(&mut self) {
        if self.readable_id.is_some() {
            return;
        }
        let fd = self.raw_fd();
        let weak = self
            .self_handle
            .clone()
            .expect("connection must be constructed via new_tcp/new_unix");
        let callbacks = self.callbacks.clone();
        let id = self.loop_handle.borrow_mut().on_readable(
            fd,
            Box::new(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.borrow_mut().handle_readable(&callbacks);
                }
            }),
        );
        self.readable_id = Some(id);
    }

    /// Reads up to [`READ_BUFFER_SIZE`] bytes and runs the frame loop,
    /// dispatching `onMessage` for each complete frame (spec.md §4.2).
    pub fn handle_readable(&mut self, callbacks: &Callbacks) {
        if self.status == ConnectionStatus::Handshaking {
            match self.drive_handshake() {
                Ok(true) => callbacks.fire_connect(self),
                Ok(false) => return,
                Err(err) => {
                    callbacks.fire_error(self, err);
                    self.destroy_inner();
                    return;
                }
            }
        }

        let mut chunk = [0u8; READ_BUFFER_SIZE];
        let n = match self.raw_read(&mut chunk) {
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
            Err(err) => {
                callbacks.fire_error(self, wireframe_core::error::map_io_error(ErrorKind::ReadFail, err));
                self.destroy_inner();
                callbacks.fire_close(self);
                return;
            }
        };

        if n == 0 {
            self.status = ConnectionStatus::Closing;
            if self.send.is_empty() {
                self.destroy_inner();
                callbacks.fire_close(self);
            } else {
                // Peer is gone but our send buffer hasn't drained yet;
                // `handle_writable` finishes the destroy once it does.
                // Nothing left to read, so stop waking up on EOF.
                self.pause_recv();
            }
            return;
        }

        self.stats.record_read(n as u64);
        if let Err(err) = self.recv.extend(&chunk[..n]) {
            callbacks.fire_error(self, err);
            self.destroy_inner();
            callbacks.fire_close(self);
            return;
        }

        self.run_frame_loop(callbacks);
    }

    /// Reads and dispatches exactly one UDP datagram, decoding it and
    /// firing `onMessage` with the source address attached, independent of
    /// any other datagram (spec.md's UDP contract: no accept loop, no
    /// framing/codec state machine carried across calls). Returns `Ok`
    /// with whether a datagram was actually read, or the underlying I/O
    /// error (including `WouldBlock` once the socket is drained) so the
    /// owning [`crate::Listener`] can decide whether to keep looping.
    pub(crate) fn recv_datagram(&mut self, callbacks: &Callbacks) -> io::Result<bool> {
        let mut chunk = [0u8; READ_BUFFER_SIZE];
        let (n, peer) = match &self.socket {
            Socket::Udp { socket, .. } => socket.recv_from(&mut chunk)?,
            _ => return Ok(false),
        };
        self.stats.record_read(n as u64);
        self.set_udp_peer(peer);

        let payload = &chunk[..n];
        if payload.len() > self.recv.max_package_size() {
            callbacks.fire_error(
                self,
                CoreError::new(ErrorKind::PackageTooBig, "datagram exceeds max package size"),
            );
            return Ok(true);
        }

        let message: DecodedMessage = match &self.codec {
            Some(codec) => match codec.decode(payload) {
                Ok(message) => message,
                Err(err) => {
                    callbacks.fire_error(self, err);
                    return Ok(true);
                }
            },
            None => Box::new(payload.to_vec()),
        };
        callbacks.fire_message(self, message);
        Ok(true)
    }

    fn run_frame_loop(&mut self, callbacks: &Callbacks) {
        let Some(codec) = self.codec.clone() else {
            if !self.recv.is_empty() {
                let raw = self.recv.take_frame(self.recv.len());
                if let Some(target) = self.pipe_target.clone() {
                    target.borrow_mut().send_raw(&raw, callbacks);
                } else {
                    let message: DecodedMessage = Box::new(raw.to_vec());
                    callbacks.fire_message(self, message);
                }
            }
            return;
        };

        loop {
            if self.recv.is_empty() {
                break;
            }
            match codec.input(self.recv.as_slice()) {
                FrameLength::Incomplete => break,
                FrameLength::Fatal => {
                    callbacks.fire_error(
                        self,
                        CoreError::new(ErrorKind::ProtocolError, "codec rejected frame"),
                    );
                    self.destroy_inner();
                    callbacks.fire_close(self);
                    return;
                }
                FrameLength::Complete(n) if n > self.recv.max_package_size() => {
                    callbacks.fire_error(
                        self,
                        CoreError::new(ErrorKind::PackageTooBig, "frame exceeds max package size"),
                    );
                    self.destroy_inner();
                    callbacks.fire_close(self);
                    return;
                }
                FrameLength::Complete(n) => {
                    let frame = self.recv.take_frame(n);
                    match codec.decode(&frame) {
                        Ok(message) => {
                            if let Some(target) = self.pipe_target.clone() {
                                if let Ok(bytes) = codec.encode(&message) {
                                    target.borrow_mut().send_raw(&bytes, callbacks);
                                }
                            } else {
                                callbacks.fire_message(self, message);
                            }
                        }
                        Err(err) => {
                            callbacks.fire_error(self, err);
                            self.destroy_inner();
                            callbacks.fire_close(self);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Sends `payload` if given, transitions to `CLOSING`, and destroys
    /// the connection once the send buffer drains.
    pub fn close(&mut self, payload: Option<&[u8]>, callbacks: &Callbacks) {
        if let Some(payload) = payload {
            self.write_bytes(payload, callbacks);
        }
        self.status = ConnectionStatus::Closing;
        if self.send.is_empty() {
            self.destroy(callbacks);
        }
    }

    /// Immediate close: deregisters watchers, clears buffers, fires
    /// `onClose`, and decrements the connection count.
    pub fn destroy(&mut self, callbacks: &Callbacks) {
        if self.status == ConnectionStatus::Closed {
            return;
        }
        self.destroy_inner();
        callbacks.fire_close(self);
    }

    fn destroy_inner(&mut self) {
        if self.status == ConnectionStatus::Closed {
            return;
        }
        self.pause_recv();
        self.uninstall_writable();
        self.recv.clear();
        self.status = ConnectionStatus::Closed;
        self.stats.record_close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream as StdUnixStream;

    use wireframe_core::ids::ConnectionIdAllocator;
    use wireframe_eventloop::poll_backend::{PollEventLoop, PollFlavor};
    use wireframe_eventloop::EventLoop;

    /// End-to-end check that a raw (no codec) connection delivers bytes
    /// written by its peer through `onMessage`, then fires `onClose` on
    /// EOF — exercising the watcher-registration closures installed by
    /// `resume_recv`/`install_writable`, not just the buffering logic.
    #[test]
    fn raw_bytes_are_delivered_and_close_fires_on_eof() {
        let (mut peer, ours) = StdUnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let mio_stream = UnixStream::from_std(ours);

        let lp: LoopHandle = Rc::new(RefCell::new(PollEventLoop::new(PollFlavor::Select).unwrap()));
        let ids = ConnectionIdAllocator::new();
        let stats = Arc::new(Statistics::new());

        let received = Rc::new(RefCell::new(Vec::new()));
        let closed = Rc::new(RefCell::new(false));
        let received2 = received.clone();
        let closed2 = closed.clone();
        let lp_for_close = lp.clone();

        let mut callbacks = Callbacks::new();
        callbacks.on_message = Some(Box::new(move |_conn, msg| {
            if let Ok(bytes) = msg.downcast::<Vec<u8>>() {
                received2.borrow_mut().extend_from_slice(&bytes);
            }
        }));
        callbacks.on_close = Some(Box::new(move |_conn| {
            *closed2.borrow_mut() = true;
            lp_for_close.borrow_mut().stop();
        }));
        let callbacks = Rc::new(callbacks);

        let conn = Connection::new_unix(
            ids.next(),
            mio_stream,
            Role::Server,
            None,
            lp.clone(),
            stats,
            1024,
            1024,
            None,
            callbacks,
        );
        conn.borrow_mut().mark_established();
        conn.borrow_mut().resume_recv();

        peer.write_all(b"hello").unwrap();
        drop(peer);

        lp.borrow_mut().run();

        assert_eq!(*received.borrow(), b"hello");
        assert!(*closed.borrow());
    }
}
