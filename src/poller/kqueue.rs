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

/// Readiness backend over kqueue.
#[derive(Clone, Debug)]
pub struct SysPoller {
    handle: Arc<i32>,
}

impl Drop for SysPoller {
    fn drop(&mut self) {
        if Arc::strong_count(&self.handle) == 1 {
            log::debug!("close kqueue handle({})", *self.handle);
            unsafe { close(*self.handle) };
        }
    }
}

impl SysPoller {
    pub fn new() -> Result<Self> {
        let handle = unsafe { kqueue() };

        if -1 == handle {
            return Err(Error::last_os_error());
        }

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    fn change(&self, fd: RawFd, filter: i16, flags: u16) -> Result<()> {
        let mut evts = [kevent {
            ident: fd as usize,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: null_mut(),
        }];

        let ret = unsafe { kevent(*self.handle, evts.as_mut_ptr(), 1, null_mut(), 0, null_mut()) };

        if ret < 0 {
            let e = errno();

            set_errno(e);

            // Deleting a filter that was never added is not a failure.
            if e.0 == ENOENT && flags & EV_DELETE != 0 {
                return Ok(());
            }

            return Err(Error::from_raw_os_error(e.0));
        }

        Ok(())
    }

    /// Start watching `fd` for readability. Writability is added later via
    /// [`set_write_interest`](SysPoller::set_write_interest).
    pub fn add_fd(&self, fd: RawFd) -> Result<()> {
        self.change(fd, EVFILT_READ, EV_ADD)
    }

    pub fn set_write_interest(&self, fd: RawFd, enabled: bool) -> Result<()> {
        if enabled {
            self.change(fd, EVFILT_WRITE, EV_ADD)
        } else {
            self.change(fd, EVFILT_WRITE, EV_DELETE)
        }
    }

    pub fn remove_fd(&self, fd: RawFd) -> Result<()> {
        self.change(fd, EVFILT_WRITE, EV_DELETE)?;
        self.change(fd, EVFILT_READ, EV_DELETE)
    }

    pub fn poll_once(&self, capacity: usize, timeout: Duration) -> Result<Vec<Event>> {
        let mut fired_events: Vec<kevent> = vec![unsafe { std::mem::zeroed() }; capacity.max(1)];

        let timeout = timespec {
            tv_sec: timeout.as_secs() as i64,
            tv_nsec: timeout.subsec_nanos() as i64,
        };

        let fired = unsafe {
            kevent(
                *self.handle,
                null_mut(),
                0,
                fired_events.as_mut_ptr(),
                fired_events.len() as i32,
                &timeout,
            )
        };

        if fired < 0 {
            let e = errno();

            set_errno(e);

            if e.0 == EINTR {
                return Ok(vec![]);
            }

            log::debug!("kevent error({})", e);

            return Err(Error::from_raw_os_error(e.0));
        }

        let mut events = Vec::with_capacity(fired as usize);

        for i in 0..fired {
            let event = &fired_events[i as usize];

            // EV_EOF and EV_ERROR surface through the next io attempt on the
            // handler.
            match event.filter {
                EVFILT_READ => {
                    events.push(Event(event.ident as RawFd, EventName::Read));
                }
                EVFILT_WRITE => {
                    events.push(Event(event.ident as RawFd, EventName::Write));
                }
                _ => {
                    continue;
                }
            }
        }

        log::trace!("raised {:?}", events);

        Ok(events)
    }
}
