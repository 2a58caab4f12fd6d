//! Readiness polling and handler dispatch.

use std::{
    collections::{HashMap, HashSet},
    fmt::Display,
    io::{Error, ErrorKind, Result},
    os::fd::RawFd,
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::handler::SocketHandler;

#[cfg_attr(any(target_os = "linux", target_os = "android"), path = "epoll.rs")]
#[cfg_attr(
    any(target_os = "macos", target_os = "ios", target_os = "freebsd"),
    path = "kqueue.rs"
)]
mod sys;

pub use sys::SysPoller;

/// Readiness interest raised for one registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    Read,
    Write,
}

/// Readiness event fired by the system poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Event(pub RawFd, pub EventName);

impl Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.1 {
            EventName::Read => {
                write!(f, "Event readable({})", self.0)
            }
            EventName::Write => {
                write!(f, "Event writable({})", self.0)
            }
        }
    }
}

#[derive(Default)]
struct Registry {
    handlers: HashMap<RawFd, Arc<Mutex<dyn SocketHandler>>>,
    watch_send: HashSet<RawFd>,
}

/// Multiplexes readiness across registered socket handlers and dispatches
/// their callbacks from a single polling thread.
///
/// Clones share one registry and one system backend. Handlers keep a clone to
/// request readiness-set changes and to deregister themselves; only the
/// poller's own interface mutates the registry. Every registered descriptor
/// is watched for readability; writability is watched on request through
/// [`watch_send_events`](Poller::watch_send_events).
#[derive(Clone)]
pub struct Poller {
    registry: Arc<Mutex<Registry>>,
    sys: SysPoller,
}

impl Poller {
    /// Create a poller backed by the platform io multiplexer.
    pub fn new() -> Result<Self> {
        Ok(Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            sys: SysPoller::new()?,
        })
    }

    /// Register a handler under its descriptor.
    ///
    /// No two simultaneously registered handlers may share a descriptor
    /// value; a duplicate is rejected with [`ErrorKind::AlreadyExists`].
    pub fn add_socket_handler(&self, handler: Arc<Mutex<dyn SocketHandler>>) -> Result<()> {
        let fd = handler.lock().unwrap().socket();

        if fd < 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("invalid descriptor({})", fd),
            ));
        }

        let mut registry = self.registry.lock().unwrap();

        if registry.handlers.contains_key(&fd) {
            return Err(Error::new(
                ErrorKind::AlreadyExists,
                format!("descriptor({}) is already registered", fd),
            ));
        }

        self.sys.add_fd(fd)?;

        registry.handlers.insert(fd, handler);

        log::debug!("register handler for socket({})", fd);

        Ok(())
    }

    /// Deregister the handler owning `fd`.
    ///
    /// After this returns no further dispatch is delivered for `fd`, even for
    /// events already harvested in the current poll batch. Handlers call this
    /// through their shared poller clone once they reach the closed state.
    pub fn remove_socket_handler(&self, fd: RawFd) -> Result<()> {
        let (removed, result) = {
            let mut registry = self.registry.lock().unwrap();

            let Some(handler) = registry.handlers.remove(&fd) else {
                return Err(Error::new(
                    ErrorKind::NotFound,
                    format!("descriptor({}) is not registered", fd),
                ));
            };

            registry.watch_send.remove(&fd);

            (handler, self.sys.remove_fd(fd))
        };

        // The handler may be dropped here; its Drop must not run under the
        // registry lock.
        drop(removed);

        result?;

        log::debug!("deregister handler for socket({})", fd);

        Ok(())
    }

    /// Start watching `fd` for writability. Idempotent.
    pub fn watch_send_events(&self, fd: RawFd) -> Result<()> {
        let mut registry = self.registry.lock().unwrap();

        if !registry.handlers.contains_key(&fd) {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("descriptor({}) is not registered", fd),
            ));
        }

        if registry.watch_send.insert(fd) {
            log::trace!("watch send events on socket({})", fd);

            self.sys.set_write_interest(fd, true)?;
        }

        Ok(())
    }

    /// Stop watching `fd` for writability. Idempotent.
    pub fn stop_watching_send_events(&self, fd: RawFd) -> Result<()> {
        let mut registry = self.registry.lock().unwrap();

        if !registry.handlers.contains_key(&fd) {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("descriptor({}) is not registered", fd),
            ));
        }

        if registry.watch_send.remove(&fd) {
            log::trace!("stop watching send events on socket({})", fd);

            self.sys.set_write_interest(fd, false)?;
        }

        Ok(())
    }

    /// True if a handler is currently registered under `fd`.
    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.registry.lock().unwrap().handlers.contains_key(&fd)
    }

    /// Count of registered handlers.
    pub fn len(&self) -> usize {
        self.registry.lock().unwrap().handlers.len()
    }

    /// True if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Harvest readiness once and dispatch callbacks on the owning handlers.
    ///
    /// Blocks the calling thread for at most `timeout`, or not at all when
    /// nothing is registered. Returns the number of dispatched callbacks.
    /// Dispatch is synchronous and sequential; a callback may re-enter this
    /// poller's interface, including deregistering its own handler, in which
    /// case the remaining events of the batch for that descriptor are
    /// discarded.
    pub fn poll_once(&self, timeout: Duration) -> Result<usize> {
        let capacity = self.registry.lock().unwrap().handlers.len();

        if capacity == 0 {
            return Ok(0);
        }

        let events = self.sys.poll_once(capacity, timeout)?;

        let mut dispatched = 0;

        for event in events {
            let Event(fd, name) = event;

            let handler = self.registry.lock().unwrap().handlers.get(&fd).cloned();

            let Some(handler) = handler else {
                log::trace!("skip {}, descriptor deregistered", event);

                continue;
            };

            {
                let mut handler = handler.lock().unwrap();

                match name {
                    EventName::Read => handler.on_recv(),
                    EventName::Write => handler.on_send(),
                }
            }

            dispatched += 1;
        }

        log::trace!("poll_once dispatched({})", dispatched);

        Ok(dispatched)
    }
}
