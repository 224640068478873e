//! Network stack boundary
//!
//! A [`NetworkStack`] hands out listening and connected sockets whose data
//! moves through the buffered streams. [`PosixStack`] is the kernel TCP
//! stack: non-blocking sockets parked on the shard's epoll set until ready.
//! Other stacks plug in by implementing the three traits below.

use crate::platform_linux::{check, last_os_error};
use crate::shard;
use crate::stream::{FdSink, FdSource, InputStream, OutputStream, PollableFd, DEFAULT_BUFFER_SIZE};
use reactor_core::{Deferred, ReactorError, Result};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;

#[derive(Debug, Clone, Copy)]
pub struct ListenOptions {
    pub reuse_address: bool,
    /// SO_REUSEPORT, so every shard can listen on the same port
    pub reuse_port: bool,
    pub backlog: i32,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self { reuse_address: true, reuse_port: false, backlog: 1024 }
    }
}

impl ListenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reuse_address(mut self, enable: bool) -> Self {
        self.reuse_address = enable;
        self
    }

    pub fn reuse_port(mut self, enable: bool) -> Self {
        self.reuse_port = enable;
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog.max(1);
        self
    }
}

pub trait NetworkStack {
    fn listen(&self, addr: SocketAddr, opts: ListenOptions) -> Result<ServerSocket>;
    fn connect(&self, addr: SocketAddr) -> Deferred<ConnectedSocket>;
}

pub trait ServerSocketImpl {
    fn accept(&self) -> Deferred<(ConnectedSocket, SocketAddr)>;
    fn local_addr(&self) -> Result<SocketAddr>;
}

pub trait ConnectedSocketImpl {
    fn input(&self) -> InputStream;
    fn output(&self) -> OutputStream;
    fn shutdown_input(&self) -> Result<()>;
    fn shutdown_output(&self) -> Result<()>;
    fn set_nodelay(&self, enable: bool) -> Result<()>;
    fn peer_addr(&self) -> Result<SocketAddr>;
}

pub struct ServerSocket {
    inner: Box<dyn ServerSocketImpl>,
}

impl ServerSocket {
    pub fn new(inner: impl ServerSocketImpl + 'static) -> Self {
        Self { inner: Box::new(inner) }
    }

    /// Next incoming connection and its peer address.
    pub fn accept(&self) -> Deferred<(ConnectedSocket, SocketAddr)> {
        self.inner.accept()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr()
    }
}

pub struct ConnectedSocket {
    inner: Box<dyn ConnectedSocketImpl>,
}

impl ConnectedSocket {
    pub fn new(inner: impl ConnectedSocketImpl + 'static) -> Self {
        Self { inner: Box::new(inner) }
    }

    /// A fresh input stream over the socket.
    pub fn input(&self) -> InputStream {
        self.inner.input()
    }

    /// A fresh output stream over the socket. Closing it shuts down the
    /// write side.
    pub fn output(&self) -> OutputStream {
        self.inner.output()
    }

    pub fn shutdown_input(&self) -> Result<()> {
        self.inner.shutdown_input()
    }

    pub fn shutdown_output(&self) -> Result<()> {
        self.inner.shutdown_output()
    }

    pub fn set_nodelay(&self, enable: bool) -> Result<()> {
        self.inner.set_nodelay(enable)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.inner.peer_addr()
    }
}

impl std::fmt::Debug for ConnectedSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectedSocket").field("peer", &self.peer_addr().ok()).finish()
    }
}

// ============================================================================
// Kernel stack
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct PosixStack;

impl PosixStack {
    pub fn new() -> Self {
        PosixStack
    }
}

impl NetworkStack for PosixStack {
    fn listen(&self, addr: SocketAddr, opts: ListenOptions) -> Result<ServerSocket> {
        let fd = new_socket(&addr)?;
        let raw = raw_of(&fd);
        if opts.reuse_address {
            set_int_opt(raw, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;
        }
        if opts.reuse_port {
            set_int_opt(raw, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1)?;
        }
        let (storage, len) = to_sockaddr(&addr);
        // SAFETY: storage holds a sockaddr of `len` bytes.
        check(unsafe { libc::bind(raw, std::ptr::addr_of!(storage).cast(), len) })?;
        // SAFETY: plain syscall on our socket.
        check(unsafe { libc::listen(raw, opts.backlog) })?;
        let fd = PollableFd::socket(fd)?;
        reactor_core::kdebug!("listening on {}", addr);
        Ok(ServerSocket::new(PosixServerSocket { fd }))
    }

    fn connect(&self, addr: SocketAddr) -> Deferred<ConnectedSocket> {
        let fd = match new_socket(&addr).and_then(PollableFd::socket) {
            Ok(fd) => fd,
            Err(e) => return Deferred::failed(e),
        };
        let (storage, len) = to_sockaddr(&addr);
        // SAFETY: storage holds a sockaddr of `len` bytes.
        let r = unsafe { libc::connect(fd.raw(), std::ptr::addr_of!(storage).cast(), len) };
        if r == 0 {
            return Deferred::ready(PosixConnectedSocket::wrap(fd));
        }
        match last_os_error() {
            ReactorError::Os(libc::EINPROGRESS) => {}
            e => return Deferred::failed(e),
        }
        shard::local().writeable(fd.raw()).then(move |()| {
            let mut err: libc::c_int = 0;
            let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
            // SAFETY: err and len are valid out-parameters.
            let r = unsafe {
                libc::getsockopt(fd.raw(), libc::SOL_SOCKET, libc::SO_ERROR, std::ptr::addr_of_mut!(err).cast(), &mut len)
            };
            if r < 0 {
                return Deferred::failed(last_os_error());
            }
            if err != 0 {
                return Deferred::failed(ReactorError::Os(err));
            }
            Deferred::ready(PosixConnectedSocket::wrap(fd))
        })
    }
}

struct PosixServerSocket {
    fd: Rc<PollableFd>,
}

impl PosixServerSocket {
    fn accept_on(fd: Rc<PollableFd>) -> Deferred<(ConnectedSocket, SocketAddr)> {
        loop {
            // SAFETY: zeroed storage is a valid out-parameter.
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            // SAFETY: storage and len describe a writable buffer.
            let r = unsafe {
                libc::accept4(
                    fd.raw(),
                    std::ptr::addr_of_mut!(storage).cast(),
                    &mut len,
                    libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                )
            };
            if r >= 0 {
                // SAFETY: accept4 returned a fresh descriptor we own.
                let owned = unsafe { OwnedFd::from_raw_fd(r) };
                let peer = match from_sockaddr(&storage) {
                    Some(a) => a,
                    None => return Deferred::failed(ReactorError::InvalidArgument("unknown address family")),
                };
                return match PollableFd::socket(owned) {
                    Ok(conn) => {
                        let sock = PosixConnectedSocket::wrap(conn);
                        let _ = sock.set_nodelay(true);
                        Deferred::ready((sock, peer))
                    }
                    Err(e) => Deferred::failed(e),
                };
            }
            match last_os_error() {
                ReactorError::Os(libc::EINTR) | ReactorError::Os(libc::ECONNABORTED) => continue,
                ReactorError::Os(libc::EAGAIN) => {
                    let again = fd.clone();
                    return shard::local().readable(fd.raw()).then(move |()| Self::accept_on(again));
                }
                e => return Deferred::failed(e),
            }
        }
    }
}

impl ServerSocketImpl for PosixServerSocket {
    fn accept(&self) -> Deferred<(ConnectedSocket, SocketAddr)> {
        Self::accept_on(self.fd.clone())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        socket_name(self.fd.raw(), libc::getsockname)
    }
}

struct PosixConnectedSocket {
    fd: Rc<PollableFd>,
}

impl PosixConnectedSocket {
    fn wrap(fd: Rc<PollableFd>) -> ConnectedSocket {
        ConnectedSocket::new(PosixConnectedSocket { fd })
    }
}

impl ConnectedSocketImpl for PosixConnectedSocket {
    fn input(&self) -> InputStream {
        InputStream::new(FdSource::new(self.fd.clone()))
    }

    fn output(&self) -> OutputStream {
        OutputStream::new(FdSink::new(self.fd.clone()).with_buffer_size(DEFAULT_BUFFER_SIZE))
    }

    fn shutdown_input(&self) -> Result<()> {
        self.fd.shutdown(libc::SHUT_RD)
    }

    fn shutdown_output(&self) -> Result<()> {
        self.fd.shutdown(libc::SHUT_WR)
    }

    fn set_nodelay(&self, enable: bool) -> Result<()> {
        set_int_opt(self.fd.raw(), libc::IPPROTO_TCP, libc::TCP_NODELAY, enable as libc::c_int)
    }

    fn peer_addr(&self) -> Result<SocketAddr> {
        socket_name(self.fd.raw(), libc::getpeername)
    }
}

fn new_socket(addr: &SocketAddr) -> Result<OwnedFd> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    // SAFETY: plain syscall; the result is checked before use.
    let fd = check(unsafe { libc::socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK, 0) })?;
    // SAFETY: socket returned a fresh descriptor we own.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn raw_of(fd: &OwnedFd) -> RawFd {
    use std::os::unix::io::AsRawFd;
    fd.as_raw_fd()
}

fn set_int_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> Result<()> {
    // SAFETY: value outlives the call and its size is passed.
    check(unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            std::ptr::addr_of!(value).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

type NameFn = unsafe extern "C" fn(libc::c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> libc::c_int;

fn socket_name(fd: RawFd, f: NameFn) -> Result<SocketAddr> {
    // SAFETY: zeroed storage is a valid out-parameter.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    // SAFETY: storage and len describe a writable buffer.
    check(unsafe { f(fd, std::ptr::addr_of_mut!(storage).cast(), &mut len) })?;
    from_sockaddr(&storage).ok_or(ReactorError::InvalidArgument("unknown address family"))
}

fn to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: all-zero is a valid sockaddr_storage.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            // SAFETY: sockaddr_storage is large and aligned enough for sockaddr_in.
            let sin = unsafe { &mut *std::ptr::addr_of_mut!(storage).cast::<libc::sockaddr_in>() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = a.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(a.ip().octets());
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            // SAFETY: sockaddr_storage is large and aligned enough for sockaddr_in6.
            let sin6 = unsafe { &mut *std::ptr::addr_of_mut!(storage).cast::<libc::sockaddr_in6>() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = a.port().to_be();
            sin6.sin6_flowinfo = a.flowinfo();
            sin6.sin6_addr.s6_addr = a.ip().octets();
            sin6.sin6_scope_id = a.scope_id();
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn from_sockaddr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            // SAFETY: the family says this is a sockaddr_in.
            let sin = unsafe { &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>() };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            // SAFETY: the family says this is a sockaddr_in6.
            let sin6 = unsafe { &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in6>() };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smp::run_test;

    #[test]
    fn test_sockaddr_conversion() {
        for addr in ["127.0.0.1:8080", "[::1]:443", "10.1.2.3:0"] {
            let addr: SocketAddr = addr.parse().unwrap();
            let (storage, _) = to_sockaddr(&addr);
            assert_eq!(from_sockaddr(&storage), Some(addr));
        }
    }

    #[test]
    fn test_listen_options_builder() {
        let o = ListenOptions::new().reuse_port(true).backlog(0);
        assert!(o.reuse_address);
        assert!(o.reuse_port);
        assert_eq!(o.backlog, 1);
    }

    #[test]
    fn test_echo_over_loopback() {
        let code = run_test(1, || {
            let stack = PosixStack::new();
            let server = match stack.listen("127.0.0.1:0".parse().unwrap(), ListenOptions::new()) {
                Ok(s) => Rc::new(s),
                Err(_) => return Deferred::ready(10),
            };
            let Ok(addr) = server.local_addr() else {
                return Deferred::ready(11);
            };
            // Server side: read one line worth of bytes and echo it back.
            let serving = server.accept().then(|(conn, _peer)| {
                let input = Rc::new(conn.input());
                let out = Rc::new(conn.output());
                let o = out.clone();
                input
                    .read_exactly(5)
                    .then(move |msg| out.write(&msg))
                    .then(move |()| o.close())
                    .map(move |()| drop(conn))
            });
            let client = stack.connect(addr).then(|conn| {
                let out = Rc::new(conn.output());
                let input = Rc::new(conn.input());
                let o = out.clone();
                out.write(b"hello")
                    .then(move |()| o.flush())
                    .then(move |()| input.read_exactly(5).map(move |b| (b, input)))
                    .map(move |(b, _input)| {
                        drop(out);
                        drop(conn);
                        if &b[..] == b"hello" {
                            0
                        } else {
                            1
                        }
                    })
            });
            reactor_core::join(serving, client).map(move |((), code)| {
                drop(server);
                code
            })
        });
        assert_eq!(code, 0);
    }
}
