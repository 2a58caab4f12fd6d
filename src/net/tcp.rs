//! Tcp client and listener handlers.

use std::{
    io::{Error, ErrorKind, Result},
    mem::size_of,
    net::SocketAddr,
    os::fd::RawFd,
    sync::{Arc, Mutex},
};

use errno::{errno, set_errno};
use libc::c_int;
use os_socketaddr::OsSocketAddr;

use crate::handler::{ConnectionState, SocketHandler};
use crate::poller::Poller;

#[cfg(target_os = "linux")]
const SEND_FLAGS: c_int = libc::MSG_NOSIGNAL;

#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: c_int = 0;

const RECV_BUFF_LEN: usize = 4096;

/// Protocol layer driven by a [`TcpSocketHandler`].
///
/// Framing and parsing live behind this seam; the handler only moves bytes.
/// Outbound replies are appended to the handler's output buffer passed as
/// `out`; the handler watches for writability while it is non-empty.
pub trait TcpProtocol: Send {
    /// The connection completed.
    fn on_connected(&mut self, _out: &mut Vec<u8>) {}

    /// Bytes arrived off the wire.
    fn on_data(&mut self, out: &mut Vec<u8>, data: &[u8]);

    /// The connection closed: orderly peer or local closure (`None`), or a
    /// fatal io error (`Some`).
    fn on_closed(&mut self, _err: Option<Error>) {}
}

/// Tcp connection handler with non-blocking connect and buffered writes.
///
/// Construct it, register it with the [`Poller`], then call
/// [`connect`](SocketHandler::connect); the handshake completes on the first
/// writable dispatch. Accepted connections are wrapped with
/// [`accepted`](TcpSocketHandler::accepted) instead and start out connected.
pub struct TcpSocketHandler<P: TcpProtocol> {
    poller: Poller,
    fd: RawFd,
    remote: SocketAddr,
    state: ConnectionState,
    out_buf: Vec<u8>,
    proto: P,
}

impl<P: TcpProtocol> TcpSocketHandler<P> {
    /// Create a handler with a fresh non-blocking socket for `remote`'s
    /// address family.
    pub fn new(poller: Poller, remote: SocketAddr, proto: P) -> Result<Self> {
        let fd = crate::net::stream_socket(&remote)?;

        log::debug!("create tcp socket({})", fd);

        Ok(Self {
            poller,
            fd,
            remote,
            state: ConnectionState::Disconnected,
            out_buf: vec![],
            proto,
        })
    }

    /// Wrap an already-established descriptor, e.g. one returned by `accept`.
    /// The handler starts out connected and fires the protocol's
    /// `on_connected` hook immediately.
    pub fn accepted(poller: Poller, fd: RawFd, remote: SocketAddr, mut proto: P) -> Self {
        log::debug!("socket({}) connected to {} (accepted)", fd, remote);

        let mut out_buf = vec![];

        proto.on_connected(&mut out_buf);

        Self {
            poller,
            fd,
            remote,
            state: ConnectionState::Connected,
            out_buf,
            proto,
        }
    }

    /// The remote endpoint this handler connects to.
    pub fn remote(&self) -> &SocketAddr {
        &self.remote
    }

    /// Local address bound to the handled socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        crate::net::socket_addr_of(self.fd)
    }

    /// True while outbound data is queued.
    pub fn has_pending_output(&self) -> bool {
        !self.out_buf.is_empty()
    }

    /// Queue outbound bytes.
    ///
    /// Data queued before the connection completes is flushed right after the
    /// handshake. Queueing on a closed handler is rejected with
    /// [`ErrorKind::NotConnected`].
    pub fn send_data(&mut self, data: &[u8]) -> Result<()> {
        match self.state {
            ConnectionState::Closed => Err(Error::new(
                ErrorKind::NotConnected,
                format!("socket({}) is closed", self.fd),
            )),
            ConnectionState::Connected => {
                self.out_buf.extend_from_slice(data);

                self.poller.watch_send_events(self.fd)
            }
            // Queued until the connection completes.
            _ => {
                self.out_buf.extend_from_slice(data);

                Ok(())
            }
        }
    }

    /// Close the connection, deregister from the poller and release the
    /// descriptor.
    pub fn close(&mut self) {
        self.closed(None);
    }

    fn established(&mut self) {
        log::debug!("socket({}) connected to {}", self.fd, self.remote);

        self.state = ConnectionState::Connected;

        self.proto.on_connected(&mut self.out_buf);
    }

    /// Resolve the pending handshake, transitioning to connected or closed.
    fn complete_connect(&mut self) -> bool {
        use libc::*;

        let mut err_no: c_int = 0;

        let mut len = size_of::<c_int>() as socklen_t;

        if unsafe {
            getsockopt(
                self.fd,
                SOL_SOCKET,
                SO_ERROR,
                &mut err_no as *mut c_int as *mut c_void,
                &mut len as *mut socklen_t,
            )
        } < 0
        {
            self.closed(Some(Error::last_os_error()));

            return false;
        }

        if err_no != 0 {
            self.closed(Some(Error::from_raw_os_error(err_no)));

            return false;
        }

        self.established();

        true
    }

    fn flush(&mut self) {
        use libc::*;

        while !self.out_buf.is_empty() {
            let len = unsafe {
                send(
                    self.fd,
                    self.out_buf.as_ptr() as *const c_void,
                    self.out_buf.len(),
                    SEND_FLAGS,
                )
            };

            if len < 0 {
                let e = errno();

                set_errno(e);

                if e.0 == EAGAIN || e.0 == EWOULDBLOCK {
                    // Partial flush, the poller keeps watching for
                    // writability.
                    return;
                }

                if e.0 == EINTR {
                    continue;
                }

                self.closed(Some(Error::from_raw_os_error(e.0)));

                return;
            }

            log::trace!("socket({}) sent bytes({})", self.fd, len);

            self.out_buf.drain(..len as usize);
        }

        _ = self.poller.stop_watching_send_events(self.fd);
    }

    fn closed(&mut self, err: Option<Error>) {
        if self.state == ConnectionState::Closed {
            return;
        }

        match err {
            Some(ref err) => log::debug!("socket({}) closed: {}", self.fd, err),
            None => log::debug!("socket({}) closed", self.fd),
        }

        self.state = ConnectionState::Closed;

        self.out_buf.clear();

        _ = self.poller.remove_socket_handler(self.fd);

        unsafe { libc::close(self.fd) };

        self.proto.on_closed(err);
    }
}

impl<P: TcpProtocol> SocketHandler for TcpSocketHandler<P> {
    fn socket(&self) -> RawFd {
        self.fd
    }

    fn connect(&mut self) -> Result<()> {
        if self.state != ConnectionState::Disconnected {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("connect() called in state {}", self.state),
            ));
        }

        log::debug!("socket({}) connecting to {}", self.fd, self.remote);

        let remote: OsSocketAddr = self.remote.into();

        let ret = unsafe { libc::connect(self.fd, remote.as_ptr(), remote.len()) };

        if ret < 0 {
            let e = errno();

            set_errno(e);

            match e.0 {
                libc::EAGAIN | libc::EWOULDBLOCK | libc::EINPROGRESS => {
                    self.poller.watch_send_events(self.fd)?;

                    self.state = ConnectionState::Connecting;

                    return Ok(());
                }
                libc::EISCONN => {}
                _ => {
                    self.closed(Some(Error::from_raw_os_error(e.0)));

                    return Err(Error::from_raw_os_error(e.0));
                }
            }
        }

        self.established();

        if !self.out_buf.is_empty() {
            self.poller.watch_send_events(self.fd)?;
        }

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    fn on_recv(&mut self) {
        use libc::*;

        if self.state == ConnectionState::Connecting && !self.complete_connect() {
            return;
        }

        if self.state != ConnectionState::Connected {
            log::trace!(
                "socket({}) spurious recv event in state {}",
                self.fd,
                self.state
            );

            return;
        }

        let mut buff = [0u8; RECV_BUFF_LEN];

        loop {
            let len = unsafe { recv(self.fd, buff.as_mut_ptr() as *mut c_void, buff.len(), 0) };

            if len > 0 {
                log::trace!("socket({}) read bytes({})", self.fd, len);

                self.proto.on_data(&mut self.out_buf, &buff[..len as usize]);

                continue;
            }

            if len == 0 {
                log::debug!("socket({}) closed by peer", self.fd);

                self.closed(None);

                return;
            }

            let e = errno();

            set_errno(e);

            if e.0 == EAGAIN || e.0 == EWOULDBLOCK {
                break;
            }

            if e.0 == EINTR {
                continue;
            }

            self.closed(Some(Error::from_raw_os_error(e.0)));

            return;
        }

        if !self.out_buf.is_empty() {
            _ = self.poller.watch_send_events(self.fd);
        }
    }

    fn on_send(&mut self) {
        match self.state {
            ConnectionState::Connecting => {
                if self.complete_connect() {
                    self.flush();
                }
            }
            ConnectionState::Connected => self.flush(),
            ConnectionState::Disconnected | ConnectionState::Closed => {
                log::trace!(
                    "socket({}) spurious send event in state {}",
                    self.fd,
                    self.state
                );
            }
        }
    }
}

impl<P: TcpProtocol> Drop for TcpSocketHandler<P> {
    fn drop(&mut self) {
        if self.state != ConnectionState::Closed {
            log::debug!("close tcp socket({})", self.fd);

            _ = self.poller.remove_socket_handler(self.fd);

            unsafe { libc::close(self.fd) };
        }
    }
}

/// Tcp acceptor handler.
///
/// `connect()` binds and starts listening; every readable dispatch accepts
/// until would-block and registers a new [`TcpSocketHandler`] per connection,
/// built from the per-connection protocol factory.
pub struct TcpListenerHandler<P: TcpProtocol> {
    poller: Poller,
    fd: RawFd,
    bind_addr: SocketAddr,
    state: ConnectionState,
    factory: Box<dyn FnMut(SocketAddr) -> P + Send>,
}

impl<P: TcpProtocol + 'static> TcpListenerHandler<P> {
    /// Create a listener handler with a fresh non-blocking socket for
    /// `bind_addr`'s address family.
    pub fn new(
        poller: Poller,
        bind_addr: SocketAddr,
        factory: impl FnMut(SocketAddr) -> P + Send + 'static,
    ) -> Result<Self> {
        let fd = crate::net::stream_socket(&bind_addr)?;

        log::debug!("create tcp listener socket({})", fd);

        Ok(Self {
            poller,
            fd,
            bind_addr,
            state: ConnectionState::Disconnected,
            factory: Box::new(factory),
        })
    }

    /// Actual bound address, resolving a zero port after `connect()`.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        crate::net::socket_addr_of(self.fd)
    }

    /// Stop listening, deregister from the poller and release the descriptor.
    pub fn close(&mut self) {
        self.closed();
    }

    fn bind_and_listen(&mut self) -> Result<()> {
        use libc::*;

        unsafe {
            let one: c_int = 1;

            if setsockopt(
                self.fd,
                SOL_SOCKET,
                SO_REUSEADDR,
                &one as *const c_int as *const c_void,
                size_of::<c_int>() as socklen_t,
            ) < 0
            {
                return Err(Error::last_os_error());
            }

            let addr: OsSocketAddr = self.bind_addr.into();

            if bind(self.fd, addr.as_ptr(), addr.len()) < 0 {
                return Err(Error::last_os_error());
            }

            if listen(self.fd, SOMAXCONN) < 0 {
                return Err(Error::last_os_error());
            }
        }

        Ok(())
    }

    fn accepted(&mut self, conn_fd: RawFd, peer: Option<SocketAddr>) -> Result<()> {
        if let Err(err) = crate::net::nonblocking(conn_fd) {
            unsafe { libc::close(conn_fd) };

            return Err(err);
        }

        let Some(peer) = peer else {
            unsafe { libc::close(conn_fd) };

            return Err(Error::new(
                ErrorKind::InvalidData,
                "unsupported peer address family",
            ));
        };

        log::debug!(
            "listener({}) accepted connection({}) from {}",
            self.fd,
            conn_fd,
            peer
        );

        let handler =
            TcpSocketHandler::accepted(self.poller.clone(), conn_fd, peer, (self.factory)(peer));

        let pending = handler.has_pending_output();

        self.poller
            .add_socket_handler(Arc::new(Mutex::new(handler)))?;

        if pending {
            self.poller.watch_send_events(conn_fd)?;
        }

        Ok(())
    }

    fn closed(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }

        log::debug!("listener({}) closed", self.fd);

        self.state = ConnectionState::Closed;

        _ = self.poller.remove_socket_handler(self.fd);

        unsafe { libc::close(self.fd) };
    }
}

impl<P: TcpProtocol + 'static> SocketHandler for TcpListenerHandler<P> {
    fn socket(&self) -> RawFd {
        self.fd
    }

    fn connect(&mut self) -> Result<()> {
        if self.state != ConnectionState::Disconnected {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("connect() called in state {}", self.state),
            ));
        }

        if let Err(err) = self.bind_and_listen() {
            self.closed();

            return Err(err);
        }

        self.state = ConnectionState::Connected;

        log::debug!("listener({}) listening on {}", self.fd, self.bind_addr);

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    fn on_recv(&mut self) {
        use libc::*;

        if self.state != ConnectionState::Connected {
            log::trace!(
                "listener({}) spurious recv event in state {}",
                self.fd,
                self.state
            );

            return;
        }

        loop {
            let mut remote = [0u8; size_of::<sockaddr_in6>()];

            let mut len = remote.len() as socklen_t;

            let conn_fd = unsafe {
                accept(
                    self.fd,
                    remote.as_mut_ptr() as *mut sockaddr,
                    &mut len as *mut socklen_t,
                )
            };

            if conn_fd < 0 {
                let e = errno();

                set_errno(e);

                if e.0 == EAGAIN || e.0 == EWOULDBLOCK {
                    return;
                }

                if e.0 == EINTR || e.0 == ECONNABORTED {
                    continue;
                }

                log::debug!(
                    "listener({}) accept error: {}",
                    self.fd,
                    Error::from_raw_os_error(e.0)
                );

                self.closed();

                return;
            }

            let peer = unsafe {
                OsSocketAddr::copy_from_raw(remote.as_mut_ptr() as *mut sockaddr, len)
            }
            .into_addr();

            if let Err(err) = self.accepted(conn_fd, peer) {
                log::debug!(
                    "listener({}) failed to register connection({}): {}",
                    self.fd,
                    conn_fd,
                    err
                );
            }
        }
    }

    fn on_send(&mut self) {
        log::trace!(
            "listener({}) spurious send event in state {}",
            self.fd,
            self.state
        );
    }
}

impl<P: TcpProtocol> Drop for TcpListenerHandler<P> {
    fn drop(&mut self) {
        if self.state != ConnectionState::Closed {
            log::debug!("close tcp listener socket({})", self.fd);

            _ = self.poller.remove_socket_handler(self.fd);

            unsafe { libc::close(self.fd) };
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{ErrorKind, Read, Write};
    use std::net::TcpListener as StdTcpListener;
    use std::net::TcpStream as StdTcpStream;
    use std::os::fd::IntoRawFd;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;

    struct Probe {
        data: Arc<Mutex<Vec<u8>>>,
        closed: Arc<Mutex<bool>>,
    }

    impl Probe {
        fn new() -> (Self, Arc<Mutex<Vec<u8>>>, Arc<Mutex<bool>>) {
            let data = Arc::new(Mutex::new(vec![]));
            let closed = Arc::new(Mutex::new(false));

            (
                Self {
                    data: data.clone(),
                    closed: closed.clone(),
                },
                data,
                closed,
            )
        }
    }

    impl TcpProtocol for Probe {
        fn on_data(&mut self, _out: &mut Vec<u8>, data: &[u8]) {
            self.data.lock().unwrap().extend_from_slice(data);
        }

        fn on_closed(&mut self, _err: Option<Error>) {
            *self.closed.lock().unwrap() = true;
        }
    }

    fn poll_until(poller: &Poller, mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }

            poller.poll_once(Duration::from_millis(50)).unwrap();
        }

        panic!("timeout waiting for condition");
    }

    #[test]
    fn test_connect_scenario() {
        _ = pretty_env_logger::try_init();

        let std_listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = std_listener.local_addr().unwrap();

        let poller = Poller::new().unwrap();

        let (probe, received, _closed) = Probe::new();

        let handler = Arc::new(Mutex::new(
            TcpSocketHandler::new(poller.clone(), addr, probe).unwrap(),
        ));

        let fd = handler.lock().unwrap().socket();

        poller.add_socket_handler(handler.clone()).unwrap();

        assert!(!handler.lock().unwrap().is_connected());

        handler.lock().unwrap().connect().unwrap();

        poll_until(&poller, || handler.lock().unwrap().is_connected());

        // Descriptor stays stable across the whole lifetime.
        assert_eq!(handler.lock().unwrap().socket(), fd);

        // connect() is valid exactly once.
        assert_eq!(
            handler.lock().unwrap().connect().unwrap_err().kind(),
            ErrorKind::InvalidInput
        );

        let (mut server_stream, _) = std_listener.accept().unwrap();

        handler.lock().unwrap().send_data(b"hello world").unwrap();

        server_stream
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();

        let mut buff = [0u8; 11];

        loop {
            poller.poll_once(Duration::from_millis(50)).unwrap();

            match server_stream.read_exact(&mut buff) {
                Ok(()) => break,
                Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
                Err(err) if err.kind() == ErrorKind::TimedOut => continue,
                Err(err) => panic!("{}", err),
            }
        }

        assert_eq!(&buff, b"hello world");

        server_stream.write_all(b"pong").unwrap();

        poll_until(&poller, || *received.lock().unwrap() == b"pong");

        // Orderly peer closure reaches the closed state and deregisters.
        drop(server_stream);

        poll_until(&poller, || !poller.is_registered(fd));

        assert!(!handler.lock().unwrap().is_connected());
        assert_eq!(handler.lock().unwrap().socket(), fd);
    }

    #[test]
    fn test_peer_close_reaches_closed_state() {
        _ = pretty_env_logger::try_init();

        let std_listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = std_listener.local_addr().unwrap();

        let client = StdTcpStream::connect(addr).unwrap();

        let (server_stream, peer) = std_listener.accept().unwrap();

        let fd = server_stream.into_raw_fd();

        crate::net::nonblocking(fd).unwrap();

        let poller = Poller::new().unwrap();

        let (probe, _received, closed) = Probe::new();

        let handler = Arc::new(Mutex::new(TcpSocketHandler::accepted(
            poller.clone(),
            fd,
            peer,
            probe,
        )));

        assert!(handler.lock().unwrap().is_connected());

        poller.add_socket_handler(handler.clone()).unwrap();

        drop(client);

        poll_until(&poller, || *closed.lock().unwrap());

        assert!(!handler.lock().unwrap().is_connected());
        assert!(!poller.is_registered(fd));

        assert_eq!(
            handler.lock().unwrap().send_data(b"x").unwrap_err().kind(),
            ErrorKind::NotConnected
        );
    }

    #[test]
    fn test_dispatch_in_disconnected_state_is_noop() {
        _ = pretty_env_logger::try_init();

        let poller = Poller::new().unwrap();

        let (probe, received, closed) = Probe::new();

        let mut handler =
            TcpSocketHandler::new(poller.clone(), "127.0.0.1:1".parse().unwrap(), probe).unwrap();

        handler.on_recv();
        handler.on_send();

        assert!(!handler.is_connected());
        assert!(received.lock().unwrap().is_empty());
        assert!(!*closed.lock().unwrap());
    }

    #[test]
    fn test_listener_connect_is_valid_once() {
        _ = pretty_env_logger::try_init();

        let poller = Poller::new().unwrap();

        let mut listener = TcpListenerHandler::new(
            poller.clone(),
            "127.0.0.1:0".parse().unwrap(),
            |_peer| Probe::new().0,
        )
        .unwrap();

        assert!(!listener.is_connected());

        listener.connect().unwrap();

        assert!(listener.is_connected());
        assert_ne!(listener.local_addr().unwrap().port(), 0);

        assert_eq!(
            listener.connect().unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }
}
