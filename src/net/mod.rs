//! Concrete tcp transports implementing [`SocketHandler`](crate::SocketHandler).

use std::{
    io::{Error, ErrorKind, Result},
    mem::size_of,
    net::SocketAddr,
    os::fd::RawFd,
};

use os_socketaddr::OsSocketAddr;

pub mod tcp;

pub use tcp::{TcpListenerHandler, TcpProtocol, TcpSocketHandler};

/// Set O_NONBLOCK on `fd`.
pub(crate) fn nonblocking(fd: RawFd) -> Result<()> {
    use libc::*;

    unsafe {
        let flags = fcntl(fd, F_GETFL);

        if flags < 0 {
            return Err(Error::last_os_error());
        }

        if fcntl(fd, F_SETFL, flags | O_NONBLOCK) < 0 {
            return Err(Error::last_os_error());
        }
    }

    Ok(())
}

/// Create a non-blocking stream socket for the address family of `addr`.
pub(crate) fn stream_socket(addr: &SocketAddr) -> Result<RawFd> {
    use libc::*;

    let fd = unsafe {
        match addr {
            SocketAddr::V4(_) => socket(AF_INET, SOCK_STREAM, 0),
            SocketAddr::V6(_) => socket(AF_INET6, SOCK_STREAM, 0),
        }
    };

    if fd < 0 {
        return Err(Error::last_os_error());
    }

    if let Err(err) = nonblocking(fd) {
        unsafe { close(fd) };

        return Err(err);
    }

    Ok(fd)
}

/// Local address bound to `fd`.
pub(crate) fn socket_addr_of(fd: RawFd) -> Result<SocketAddr> {
    use libc::*;

    unsafe {
        let mut buff = [0u8; size_of::<sockaddr_in6>()];

        let mut len = buff.len() as socklen_t;

        if getsockname(fd, buff.as_mut_ptr() as *mut sockaddr, &mut len as *mut socklen_t) < 0 {
            return Err(Error::last_os_error());
        }

        OsSocketAddr::copy_from_raw(buff.as_mut_ptr() as *mut sockaddr, len)
            .into_addr()
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, "unsupported socket address family"))
    }
}
