//! Socket handler contract shared by every transport variant.

use std::fmt::Display;
use std::io::Result;
use std::os::fd::RawFd;

/// Connection lifecycle of a socket handler.
///
/// `connect()` is the only transition out of [`Disconnected`](Self::Disconnected).
/// [`Closed`](Self::Closed) is terminal and reachable from both
/// [`Connecting`](Self::Connecting) and [`Connected`](Self::Connected).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// One non-blocking socket driven by a [`Poller`](crate::poller::Poller).
///
/// The poller keys its registry on [`socket`](SocketHandler::socket) and
/// invokes [`on_recv`](SocketHandler::on_recv)/[`on_send`](SocketHandler::on_send)
/// when the descriptor becomes readable/writable. Callbacks run on the
/// polling thread and must only perform bounded non-blocking I/O.
///
/// Handlers keep a clone of their `Poller` and use it to request
/// readiness-set changes (watch/stop watching send events) and to deregister
/// themselves once the connection is closed. I/O failures never cross the
/// dispatch boundary as error values; they transition the handler to the
/// closed state, observable through [`is_connected`](SocketHandler::is_connected).
pub trait SocketHandler: Send {
    /// The handled descriptor. Stable for the handler's entire registered
    /// lifetime; the poller indexes its readiness tracking by this value.
    fn socket(&self) -> RawFd;

    /// Begin establishing the underlying connection, without blocking.
    ///
    /// Valid exactly once, from the disconnected state; any other state is
    /// rejected with [`ErrorKind::InvalidInput`](std::io::ErrorKind::InvalidInput).
    /// Completion is observed through later dispatches or
    /// [`is_connected`](SocketHandler::is_connected).
    fn connect(&mut self) -> Result<()>;

    /// True while the handler is in the connected state. Pure query; returns
    /// false before `connect()` completes and false after any closure.
    fn is_connected(&self) -> bool;

    /// The descriptor became readable. A single call need not drain all
    /// available data; would-block ends the attempt silently and a zero-byte
    /// read is orderly peer closure.
    fn on_recv(&mut self);

    /// The descriptor became writable. Flushes as much pending output as one
    /// non-blocking write permits, preserving the remainder.
    fn on_send(&mut self);
}
