use std::{
    io::{Error, Result},
    os::fd::RawFd,
    ptr::null_mut,
    sync::Arc,
    time::Duration,
};

use errno::{errno, set_errno};
use libc::*;

use super::{Event, EventName};

/// Readiness backend over epoll.
#[derive(Clone, Debug)]
pub struct SysPoller {
    handle: Arc<i32>,
}

impl Drop for SysPoller {
    fn drop(&mut self) {
        if Arc::strong_count(&self.handle) == 1 {
            log::debug!("close epoll handle({})", *self.handle);
            unsafe { close(*self.handle) };
        }
    }
}

impl SysPoller {
    pub fn new() -> Result<Self> {
        let handle = unsafe { epoll_create(1) };

        if -1 == handle {
            return Err(Error::last_os_error());
        }

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    /// Start watching `fd` for readability. Writability is added later via
    /// [`set_write_interest`](SysPoller::set_write_interest).
    pub fn add_fd(&self, fd: RawFd) -> Result<()> {
        let event = epoll_event {
            events: EPOLLIN as u32,
            u64: fd as u64,
        };

        let ret = unsafe {
            epoll_ctl(
                *self.handle,
                EPOLL_CTL_ADD,
                fd,
                [event].as_ptr() as *mut epoll_event,
            )
        };

        if ret == -1 {
            return Err(Error::last_os_error());
        }

        Ok(())
    }

    pub fn set_write_interest(&self, fd: RawFd, enabled: bool) -> Result<()> {
        let events = if enabled { EPOLLIN | EPOLLOUT } else { EPOLLIN };

        let event = epoll_event {
            events: events as u32,
            u64: fd as u64,
        };

        let ret = unsafe {
            epoll_ctl(
                *self.handle,
                EPOLL_CTL_MOD,
                fd,
                [event].as_ptr() as *mut epoll_event,
            )
        };

        if ret == -1 {
            return Err(Error::last_os_error());
        }

        Ok(())
    }

    pub fn remove_fd(&self, fd: RawFd) -> Result<()> {
        let ret = unsafe { epoll_ctl(*self.handle, EPOLL_CTL_DEL, fd, null_mut()) };

        if ret == -1 {
            return Err(Error::last_os_error());
        }

        Ok(())
    }

    pub fn poll_once(&self, capacity: usize, timeout: Duration) -> Result<Vec<Event>> {
        let mut fired_events: Vec<epoll_event> =
            vec![unsafe { std::mem::zeroed() }; capacity.max(1)];

        let fired = unsafe {
            epoll_wait(
                *self.handle,
                fired_events.as_mut_ptr(),
                fired_events.len() as i32,
                timeout.as_millis() as i32,
            )
        };

        if fired < 0 {
            let e = errno();

            set_errno(e);

            if e.0 == EINTR {
                return Ok(vec![]);
            }

            log::debug!("epoll_wait error({})", e);

            return Err(Error::last_os_error());
        }

        let mut events = Vec::with_capacity(fired as usize);

        for i in 0..fired {
            let event = &fired_events[i as usize];

            // Hangup and error conditions surface through the next read
            // attempt on the handler.
            if event.events & (EPOLLIN | EPOLLERR | EPOLLHUP) as u32 != 0 {
                events.push(Event(event.u64 as RawFd, EventName::Read));
            }

            if event.events & EPOLLOUT as u32 != 0 {
                events.push(Event(event.u64 as RawFd, EventName::Write));
            }
        }

        log::trace!("raised {:?}", events);

        Ok(events)
    }
}
