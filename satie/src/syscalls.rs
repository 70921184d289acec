// src/syscalls.rs
use crate::error::SatieResult;
use libc::{c_int, c_void, socklen_t};
use std::ffi::CString;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

// ---- Socket Operations ----

/// Create a non-blocking TCP listen socket.
///
/// Linux-specific optimizations: SOCK_NONBLOCK (atomic), TCP_NODELAY on the
/// listener (inherited by all accepted sockets), TCP_DEFER_ACCEPT so the
/// kernel holds a connection until data arrives.
pub fn create_listen_socket(host: &str, port: u16) -> SatieResult<c_int> {
    let addr_str = format!("{}:{}", host, port);
    let addr: SocketAddr = addr_str
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Invalid address"))?;

    let domain = if addr.is_ipv6() {
        libc::AF_INET6
    } else {
        libc::AF_INET
    };

    unsafe {
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let one: c_int = 1;

        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        // TCP_NODELAY on the listener is inherited by accepted sockets,
        // eliminating a per-accept setsockopt.
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        let defer_secs: c_int = 1;
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_DEFER_ACCEPT,
            &defer_secs as *const _ as *const c_void,
            mem::size_of_val(&defer_secs) as socklen_t,
        );

        bind_addr(fd, &addr)?;

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

/// Bind a socket to an address.
fn bind_addr(fd: c_int, addr: &SocketAddr) -> SatieResult<()> {
    unsafe {
        match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                if libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                ) < 0
                {
                    let err = io::Error::last_os_error();
                    libc::close(fd);
                    return Err(err.into());
                }
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                if libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                ) < 0
                {
                    let err = io::Error::last_os_error();
                    libc::close(fd);
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }
}

/// Local port a socket ended up bound to (resolves port 0 binds).
pub fn local_port(fd: c_int) -> SatieResult<u16> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        match sockaddr_to_rust(&storage) {
            Some(addr) => Ok(addr.port()),
            None => Err(io::Error::new(io::ErrorKind::Other, "unknown address family").into()),
        }
    }
}

/// Peer address of a connected socket, if still retrievable.
pub fn peer_addr(fd: c_int) -> Option<SocketAddr> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        if libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return None;
        }
        sockaddr_to_rust(&storage)
    }
}

unsafe fn sockaddr_to_rust(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = &*(storage as *const _ as *const libc::sockaddr_in);
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 = &*(storage as *const _ as *const libc::sockaddr_in6);
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port)))
        }
        _ => None,
    }
}

/// Accept a non-blocking connection.
pub fn accept_connection(listen_fd: c_int) -> SatieResult<Option<c_int>> {
    unsafe {
        let fd = libc::accept4(
            listen_fd,
            ptr::null_mut(),
            ptr::null_mut(),
            libc::SOCK_NONBLOCK,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            // TCP_NODELAY is inherited from the listener socket
            Ok(Some(fd))
        }
    }
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Epoll Operations ----

/// Readiness interest for the read side of a connection: edge-triggered.
pub const READ_EVENTS: u32 =
    (libc::EPOLLIN | libc::EPOLLRDHUP | libc::EPOLLERR) as u32 | libc::EPOLLET as u32;

/// Readiness interest for the write side: level-triggered, so a suspended
/// writer is resumed as long as the socket stays writable.
pub const WRITE_EVENTS: u32 = (libc::EPOLLOUT | libc::EPOLLRDHUP | libc::EPOLLERR) as u32;

pub const HANGUP_EVENTS: u32 = (libc::EPOLLRDHUP | libc::EPOLLHUP) as u32;

pub use libc::epoll_event;

/// Create a bare epoll fd. The caller owns it; closing it while a worker
/// waits on it is the shutdown signal.
pub fn epoll_create() -> SatieResult<c_int> {
    unsafe {
        let fd = libc::epoll_create1(0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(fd)
    }
}

pub struct Epoll {
    pub fd: c_int,
    owned: bool,
}

impl Epoll {
    pub fn new() -> SatieResult<Self> {
        Ok(Self {
            fd: epoll_create()?,
            owned: true,
        })
    }

    /// Wrap an epoll fd owned elsewhere (the server owns worker epoll fds
    /// so it can close them to signal shutdown).
    pub fn from_raw(fd: c_int) -> Self {
        Self { fd, owned: false }
    }

    pub fn add(&self, fd: c_int, token: u64, events: u32) -> SatieResult<()> {
        let mut event = epoll_event { events, u64: token };

        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn modify(&self, fd: c_int, token: u64, events: u32) -> SatieResult<()> {
        let mut event = epoll_event { events, u64: token };

        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    /// Wait for events. Interrupted waits are restarted so a signal never
    /// masquerades as a timeout; EBADF/EINVAL (the fd was closed under
    /// us) surface as Err so the worker can exit.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> Result<usize, io::Error> {
        loop {
            let res = unsafe {
                libc::epoll_wait(
                    self.fd,
                    events.as_mut_ptr(),
                    events.len() as c_int,
                    timeout_ms,
                )
            };

            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }

            return Ok(res as usize);
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        if self.owned {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

// ---- Non-blocking I/O ----

/// Read without blocking. `None` means the socket has no data yet
/// (EAGAIN); `Some(0)` is end-of-stream.
pub fn read_nonblocking(fd: c_int, buf: &mut [u8]) -> SatieResult<Option<usize>> {
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

/// Write without blocking. `None` means the socket buffer is full.
pub fn write_nonblocking(fd: c_int, buf: &[u8]) -> SatieResult<Option<usize>> {
    unsafe {
        let res = libc::send(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        );
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

/// Write headers that will be immediately followed by a zero-copy body;
/// MSG_MORE lets the kernel coalesce them into full segments.
pub fn send_with_more(fd: c_int, buf: &[u8]) -> SatieResult<Option<usize>> {
    unsafe {
        let res = libc::send(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_MORE | libc::MSG_NOSIGNAL,
        );
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

/// Vectored write: multiple buffers in a single syscall (scatter-gather I/O).
pub fn writev_nonblocking(fd: c_int, bufs: &[&[u8]]) -> SatieResult<Option<usize>> {
    if bufs.is_empty() {
        return Ok(Some(0));
    }

    // Build iovec array on stack (max 8 segments)
    let mut iovecs: [libc::iovec; 8] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(8);

    for i in 0..iov_count {
        iovecs[i] = libc::iovec {
            iov_base: bufs[i].as_ptr() as *mut c_void,
            iov_len: bufs[i].len(),
        };
    }

    unsafe {
        let res = libc::writev(fd, iovecs.as_ptr(), iov_count as c_int);
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

/// Zero-copy file-to-socket transfer. `offset` is advanced by the kernel.
/// `None` means the socket buffer is full; retry after write readiness.
pub fn sendfile(
    out_fd: c_int,
    in_fd: c_int,
    offset: &mut i64,
    count: usize,
) -> SatieResult<Option<usize>> {
    unsafe {
        let res = libc::sendfile(out_fd, in_fd, offset as *mut libc::off_t, count);
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

// ---- Root-relative file operations ----

fn path_to_cstring(path: &Path) -> io::Result<CString> {
    let bytes = path.as_os_str().as_bytes();
    let effective: &[u8] = if bytes.is_empty() { b"." } else { bytes };
    CString::new(effective).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in path"))
}

/// Open a directory for use as the pinned serving root. O_NOATIME is
/// attempted first and silently dropped where the filesystem refuses it.
pub fn open_root(path: &Path) -> SatieResult<(c_int, c_int)> {
    let c_path = path_to_cstring(path)?;
    unsafe {
        let mut extra_modes = libc::O_NOATIME;
        let mut fd = libc::open(c_path.as_ptr(), libc::O_RDONLY | libc::O_DIRECTORY | extra_modes);
        if fd < 0 {
            extra_modes = 0;
            fd = libc::open(c_path.as_ptr(), libc::O_RDONLY | libc::O_DIRECTORY);
        }
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok((fd, extra_modes))
    }
}

/// openat(2) relative to the root fd. Returns the raw errno on failure so
/// callers can map EACCES/ENFILE/EMFILE to distinct HTTP statuses.
pub fn openat(dir_fd: c_int, rel: &Path, flags: c_int) -> Result<c_int, c_int> {
    let c_path = match path_to_cstring(rel) {
        Ok(p) => p,
        Err(_) => return Err(libc::ENOENT),
    };
    unsafe {
        let fd = libc::openat(dir_fd, c_path.as_ptr(), libc::O_RDONLY | flags);
        if fd < 0 {
            Err(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
        } else {
            Ok(fd)
        }
    }
}

/// fstatat(2) relative to the root fd.
pub fn fstatat(dir_fd: c_int, rel: &Path) -> Option<libc::stat> {
    let c_path = path_to_cstring(rel).ok()?;
    unsafe {
        let mut st: libc::stat = mem::zeroed();
        if libc::fstatat(dir_fd, c_path.as_ptr(), &mut st, 0) < 0 {
            None
        } else {
            Some(st)
        }
    }
}

// ---- Accept-Distribute Pipe Operations ----

/// Create a Unix pipe with a non-blocking read end. Returns (read_fd, write_fd).
pub fn create_pipe() -> SatieResult<(c_int, c_int)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe(fds.as_mut_ptr()) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let flags = libc::fcntl(fds[0], libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fds[0]);
            libc::close(fds[1]);
            return Err(err.into());
        }
    }
    Ok((fds[0], fds[1]))
}

/// Send a client fd over a pipe (blocking write of 4 bytes).
pub fn send_fd_over_pipe(pipe_write_fd: c_int, client_fd: c_int) -> SatieResult<()> {
    let bytes = client_fd.to_ne_bytes();
    unsafe {
        let n = libc::write(pipe_write_fd, bytes.as_ptr() as *const c_void, 4);
        if n < 0 {
            Err(io::Error::last_os_error().into())
        } else {
            Ok(())
        }
    }
}

/// Receive a client fd from a pipe (non-blocking read of 4 bytes).
pub fn recv_fd_from_pipe(pipe_read_fd: c_int) -> SatieResult<Option<c_int>> {
    let mut buf = [0u8; 4];
    unsafe {
        let n = libc::read(pipe_read_fd, buf.as_mut_ptr() as *mut c_void, 4);
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else if n == 4 {
            Ok(Some(c_int::from_ne_bytes(buf)))
        } else {
            Ok(None) // Partial read, unlikely with 4 bytes
        }
    }
}
