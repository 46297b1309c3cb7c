//! Thin non-blocking socket shims. Each function is a direct syscall
//! wrapper; the state machine above this module decides what to do with
//! the results.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

pub const LISTEN_BACKLOG: i32 = 1024;

/// An owned, non-blocking, close-on-exec TCP socket.
pub struct Socket {
    fd: OwnedFd,
}

impl Socket {
    /// Creates a non-blocking listening socket bound to `addr`.
    pub fn new_listener(addr: SocketAddr, reuse_port: bool) -> io::Result<Socket> {
        let domain = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
        let fd = syscall!(socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0
        ))?;
        let socket = Socket {
            // SAFETY: socket() just returned a freshly owned fd.
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        };
        socket.set_reuseaddr(true)?;
        if reuse_port {
            socket.set_reuseport(true)?;
        }
        socket.bind(addr)?;
        socket.listen(LISTEN_BACKLOG)?;
        Ok(socket)
    }

    /// Wraps an already-accepted connection descriptor.
    ///
    /// # Safety
    /// `fd` must be a valid, open, otherwise-unowned socket descriptor.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Socket {
        Socket {
            fd: OwnedFd::from_raw_fd(fd),
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }

    fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        let (raw_addr, len) = socket_addr_to_raw(addr);
        syscall!(bind(self.fd.as_raw_fd(), &raw_addr as *const _ as *const libc::sockaddr, len))?;
        Ok(())
    }

    fn listen(&self, backlog: i32) -> io::Result<()> {
        syscall!(listen(self.fd.as_raw_fd(), backlog))?;
        Ok(())
    }

    /// Accepts one pending connection with `accept4`, setting
    /// non-blocking and close-on-exec atomically on the new descriptor.
    /// Returns `Ok(None)` on `EAGAIN`/`EWOULDBLOCK`.
    pub fn accept(&self) -> io::Result<Option<(Socket, SocketAddr)>> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let result = syscall!(accept4(
            self.fd.as_raw_fd(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC
        ));
        match result {
            Ok(fd) => {
                let addr = raw_to_socket_addr(&storage)?;
                Ok(Some((
                    Socket {
                        // SAFETY: accept4 just returned a freshly owned fd.
                        fd: unsafe { OwnedFd::from_raw_fd(fd) },
                    },
                    addr,
                )))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getsockname(
            self.fd.as_raw_fd(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len
        ))?;
        raw_to_socket_addr(&storage)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getpeername(
            self.fd.as_raw_fd(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len
        ))?;
        raw_to_socket_addr(&storage)
    }

    fn set_reuseaddr(&self, on: bool) -> io::Result<()> {
        self.set_bool_opt(libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
    }

    fn set_reuseport(&self, on: bool) -> io::Result<()> {
        self.set_bool_opt(libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
    }

    pub fn set_keepalive(&self, on: bool) -> io::Result<()> {
        self.set_bool_opt(libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
    }

    pub fn set_nodelay(&self, on: bool) -> io::Result<()> {
        self.set_bool_opt(libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
    }

    fn set_bool_opt(&self, level: i32, name: i32, on: bool) -> io::Result<()> {
        let value: libc::c_int = on as libc::c_int;
        syscall!(setsockopt(
            self.fd.as_raw_fd(),
            level,
            name,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t
        ))?;
        Ok(())
    }

    /// Half-closes the write direction. The peer still sees a clean EOF
    /// after draining whatever was already queued.
    pub fn shutdown_write(&self) -> io::Result<()> {
        syscall!(shutdown(self.fd.as_raw_fd(), libc::SHUT_WR))?;
        Ok(())
    }

    /// Reads the pending `SO_ERROR` value, clearing it. Used after an
    /// `EPOLLERR` notification to find out what actually went wrong.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut value: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        syscall!(getsockopt(
            self.fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut value as *mut _ as *mut libc::c_void,
            &mut len
        ))?;
        if value == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(value)))
        }
    }
}

fn socket_addr_to_raw(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let raw = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, raw);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let raw = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, raw);
            }
            (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

fn raw_to_socket_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            let raw = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(raw.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::new(ip.into(), u16::from_be(raw.sin_port)))
        }
        libc::AF_INET6 => {
            let raw = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(raw.sin6_addr.s6_addr);
            Ok(SocketAddr::new(ip.into(), u16::from_be(raw.sin6_port)))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported address family {family}"),
        )),
    }
}
