//! Thin libc socket wrappers.
//!
//! No interesting state lives here: creation, bind/listen/accept,
//! option setters and address lookups, each a direct syscall with the
//! runtime's error policy applied (fatal where the server cannot
//! continue, logged where the kernel may legitimately refuse).

use muxr_core::error::{last_errno, MuxError, Result};
use muxr_core::{merror, mfatal};
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;

fn storage_from_addr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*v4.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn addr_from_storage(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Nonblocking, close-on-exec stream socket for `addr`'s family.
/// Resource exhaustion here is not survivable for a server: fatal.
pub fn create_nonblocking(addr: &SocketAddr) -> RawFd {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP,
        )
    };
    if fd < 0 {
        mfatal!("socket creation failed: errno {}", last_errno());
    }
    fd
}

pub fn local_addr(fd: RawFd) -> Option<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if rc < 0 {
        merror!("getsockname fd {} failed: errno {}", fd, last_errno());
        return None;
    }
    addr_from_storage(&storage)
}

pub fn peer_addr(fd: RawFd) -> Option<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if rc < 0 {
        merror!("getpeername fd {} failed: errno {}", fd, last_errno());
        return None;
    }
    addr_from_storage(&storage)
}

/// Pending error on the socket, via `SO_ERROR`.
pub fn socket_error(fd: RawFd) -> i32 {
    let mut optval: libc::c_int = 0;
    let mut optlen = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut optval as *mut _ as *mut libc::c_void,
            &mut optlen,
        )
    };
    if rc < 0 {
        last_errno()
    } else {
        optval
    }
}

fn set_flag(fd: RawFd, level: libc::c_int, opt: libc::c_int, on: bool, what: &str) {
    let optval: libc::c_int = if on { 1 } else { 0 };
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &optval as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        merror!("setsockopt {} fd {} failed: errno {}", what, fd, last_errno());
    }
}

/// RAII stream socket: owns the fd, closes on drop.
pub struct Socket {
    fd: RawFd,
}

impl Socket {
    /// Adopt an already-open descriptor (e.g. one accept returned).
    pub fn from_fd(fd: RawFd) -> Self {
        Self { fd }
    }

    /// Fresh nonblocking listening-capable socket for `addr`'s family.
    pub fn new_nonblocking(addr: &SocketAddr) -> Self {
        Self {
            fd: create_nonblocking(addr),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Bind failure means a dead server; fatal.
    pub fn bind(&self, addr: &SocketAddr) {
        let (storage, len) = storage_from_addr(addr);
        let rc = unsafe {
            libc::bind(self.fd, &storage as *const _ as *const libc::sockaddr, len)
        };
        if rc < 0 {
            mfatal!("bind {} on fd {} failed: errno {}", addr, self.fd, last_errno());
        }
    }

    pub fn listen(&self) {
        let rc = unsafe { libc::listen(self.fd, libc::SOMAXCONN) };
        if rc < 0 {
            mfatal!("listen on fd {} failed: errno {}", self.fd, last_errno());
        }
    }

    /// Accept one connection, nonblocking + cloexec. Errors (including
    /// would-block) are returned for the acceptor to classify.
    pub fn accept(&self) -> Result<(RawFd, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept4(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(MuxError::Accept(last_errno()));
        }
        let peer = addr_from_storage(&storage)
            .unwrap_or_else(|| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)));
        Ok((fd, peer))
    }

    /// Close only the write direction; reads stay open.
    pub fn shutdown_write(&self) {
        let rc = unsafe { libc::shutdown(self.fd, libc::SHUT_WR) };
        if rc < 0 {
            merror!("shutdown(WR) fd {} failed: errno {}", self.fd, last_errno());
        }
    }

    pub fn set_reuse_addr(&self, on: bool) {
        set_flag(self.fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on, "SO_REUSEADDR");
    }

    pub fn set_reuse_port(&self, on: bool) {
        set_flag(self.fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, on, "SO_REUSEPORT");
    }

    pub fn set_keep_alive(&self, on: bool) {
        set_flag(self.fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on, "SO_KEEPALIVE");
    }

    pub fn set_tcp_nodelay(&self, on: bool) {
        set_flag(self.fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on, "TCP_NODELAY");
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_round_trip_v4_and_v6() {
        let v4: SocketAddr = "192.168.7.9:4242".parse().unwrap();
        let (storage, _) = storage_from_addr(&v4);
        assert_eq!(addr_from_storage(&storage), Some(v4));

        let v6: SocketAddr = "[2001:db8::1]:8080".parse().unwrap();
        let (storage, _) = storage_from_addr(&v6);
        assert_eq!(addr_from_storage(&storage), Some(v6));
    }

    #[test]
    fn bind_listen_accept_would_block() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let sock = Socket::new_nonblocking(&addr);
        sock.set_reuse_addr(true);
        sock.bind(&addr);
        sock.listen();

        let bound = local_addr(sock.fd()).unwrap();
        assert_ne!(bound.port(), 0);

        // Nobody is connecting: would-block, not an error class.
        match sock.accept() {
            Err(e) => assert_eq!(e.errno(), libc::EAGAIN),
            Ok(_) => panic!("accept on idle listener cannot succeed"),
        }
        assert_eq!(socket_error(sock.fd()), 0);
    }
}
