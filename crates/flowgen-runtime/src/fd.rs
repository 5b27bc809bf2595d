//! Thin safe wrapper over raw AF_INET stream sockets.
//!
//! All kernel-stack plumbing goes through `FileDesc`: non-blocking
//! socket creation, bind/connect/listen/accept, partial reads and
//! writes, and the SO_ERROR query that resolves an async connect
//! handshake. Errors come back as `io::Error`; `WouldBlock` is the
//! only error the callers treat as non-exceptional.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;

pub(crate) struct FileDesc {
    fd: RawFd,
}

impl FileDesc {
    /// Non-blocking, close-on-exec TCP socket.
    pub fn socket_stream() -> io::Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    pub(crate) fn from_raw(fd: RawFd) -> Self {
        Self { fd }
    }

    #[inline]
    pub fn raw(&self) -> RawFd {
        self.fd
    }

    pub fn set_no_delay(&self, on: bool) -> io::Result<()> {
        let opt: libc::c_int = on as libc::c_int;
        self.setsockopt(libc::IPPROTO_TCP, libc::TCP_NODELAY, opt)
    }

    /// SO_REUSEADDR + SO_REUSEPORT, for listeners.
    pub fn set_reuse(&self) -> io::Result<()> {
        self.setsockopt(libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
        self.setsockopt(libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)
    }

    pub fn bind(&self, addr: SocketAddrV4) -> io::Result<()> {
        let sa = sockaddr_of(addr);
        let rc = unsafe {
            libc::bind(
                self.fd,
                &sa as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Start a non-blocking connect. `EINPROGRESS` is the expected
    /// outcome and reported as success; the handshake result arrives
    /// through readiness + `take_error`.
    pub fn connect(&self, addr: SocketAddrV4) -> io::Result<()> {
        let sa = sockaddr_of(addr);
        let rc = unsafe {
            libc::connect(
                self.fd,
                &sa as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        let rc = unsafe { libc::listen(self.fd, backlog) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Accept one pending connection. `None` when the backlog is
    /// drained.
    pub fn accept(&self) -> io::Result<Option<(FileDesc, SocketAddrV4, SocketAddrV4)>> {
        let mut peer: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept4(
                self.fd,
                &mut peer as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(None),
                _ => Err(err),
            };
        }
        let cfd = FileDesc::from_raw(fd);
        let local = cfd.local_addr()?;
        Ok(Some((cfd, local, addr_of_sockaddr(&peer))))
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let rc = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return Err(io::ErrorKind::WouldBlock.into()),
                _ => return Err(err),
            }
        }
    }

    /// `send` with MSG_NOSIGNAL so a dead peer surfaces as EPIPE
    /// instead of killing the process.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        loop {
            let rc = unsafe {
                libc::send(
                    self.fd,
                    data.as_ptr() as *const libc::c_void,
                    data.len(),
                    libc::MSG_NOSIGNAL,
                )
            };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return Err(io::ErrorKind::WouldBlock.into()),
                _ => return Err(err),
            }
        }
    }

    /// Pending socket error, i.e. the async connect result.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        if err == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(err)))
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddrV4> {
        let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(self.fd, &mut sa as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(addr_of_sockaddr(&sa))
    }

    fn setsockopt(&self, level: libc::c_int, name: libc::c_int, val: libc::c_int) -> io::Result<()> {
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                level,
                name,
                &val as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for FileDesc {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }
}

pub(crate) fn sockaddr_of(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = addr.port().to_be();
    sa.sin_addr.s_addr = u32::from(*addr.ip()).to_be();
    sa
}

pub(crate) fn addr_of_sockaddr(sa: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr)),
        u16::from_be(sa.sin_port),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_roundtrip() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 7), 4242);
        let sa = sockaddr_of(addr);
        assert_eq!(addr_of_sockaddr(&sa), addr);
    }

    #[test]
    fn test_take_error_on_fresh_socket() {
        let fd = FileDesc::socket_stream().unwrap();
        assert!(fd.take_error().unwrap().is_none());
    }
}
