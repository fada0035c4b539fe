//! Address scheme parsing and raw socket plumbing.
//!
//! Addresses take the form `<proto>://<addr>` with proto one of `tcp`,
//! `tcp4`, `tcp6`, `udp`, `udp4`, `udp6`, `unix`. An empty address after a
//! valid scheme binds an ephemeral port on all interfaces.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::os::fd::RawFd;
use std::path::PathBuf;

use crate::error::Error;

/// Transport protocol parsed from the address scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
    Unix,
}

impl Protocol {
    fn parse(s: &str) -> Option<Protocol> {
        match s {
            "tcp" => Some(Protocol::Tcp),
            "tcp4" => Some(Protocol::Tcp4),
            "tcp6" => Some(Protocol::Tcp6),
            "udp" => Some(Protocol::Udp),
            "udp4" => Some(Protocol::Udp4),
            "udp6" => Some(Protocol::Udp6),
            "unix" => Some(Protocol::Unix),
            _ => None,
        }
    }

    /// Connection-oriented transports go through the acceptor loop.
    pub fn is_stream(self) -> bool {
        !matches!(self, Protocol::Udp | Protocol::Udp4 | Protocol::Udp6)
    }

    fn prefers_v6(self) -> bool {
        matches!(self, Protocol::Tcp6 | Protocol::Udp6)
    }
}

/// A bound or peer address: inet or unix-domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetAddr {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl NetAddr {
    /// The inet form, if this is not a unix address.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            NetAddr::Inet(sa) => Some(*sa),
            NetAddr::Unix(_) => None,
        }
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetAddr::Inet(sa) => write!(f, "{sa}"),
            NetAddr::Unix(p) => write!(f, "{}", p.display()),
        }
    }
}

/// Split `proto://addr` into its parts. Any scheme outside the supported
/// set fails with `UnsupportedProtocol`, as does a missing scheme.
pub(crate) fn split_proto_addr(proto_addr: &str) -> Result<(Protocol, &str), Error> {
    let (scheme, rest) = proto_addr
        .split_once("://")
        .ok_or_else(|| Error::UnsupportedProtocol(proto_addr.to_string()))?;
    let proto = Protocol::parse(scheme)
        .ok_or_else(|| Error::UnsupportedProtocol(proto_addr.to_string()))?;
    Ok((proto, rest))
}

/// Resolve the textual address part to a concrete inet address.
///
/// `""` binds an ephemeral port on all interfaces; `":9991"` binds port
/// 9991 on all interfaces.
pub(crate) fn resolve_inet(addr: &str, proto: Protocol) -> Result<SocketAddr, Error> {
    let wildcard: SocketAddr = if proto.prefers_v6() {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    };
    if addr.is_empty() {
        return Ok(wildcard);
    }
    if let Some(port) = addr.strip_prefix(':') {
        let port: u16 = port
            .parse()
            .map_err(|_| Error::Bind(io::Error::new(io::ErrorKind::InvalidInput, "bad port")))?;
        let mut sa = wildcard;
        sa.set_port(port);
        return Ok(sa);
    }
    addr.to_socket_addrs()
        .map_err(Error::Bind)?
        .find(|sa| match proto {
            Protocol::Tcp4 | Protocol::Udp4 => sa.is_ipv4(),
            Protocol::Tcp6 | Protocol::Udp6 => sa.is_ipv6(),
            _ => true,
        })
        .ok_or_else(|| Error::Bind(io::Error::new(io::ErrorKind::AddrNotAvailable, "unresolvable")))
}

/// Create a non-blocking TCP listener with SO_REUSEADDR (and optionally
/// SO_REUSEPORT for kernel port-sharing across co-bound instances).
pub(crate) fn create_stream_listener(
    addr: SocketAddr,
    reuse_port: bool,
    backlog: i32,
) -> Result<RawFd, Error> {
    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };
    let fd = unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(Error::Bind(io::Error::last_os_error()));
    }

    set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1);
    if reuse_port {
        set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1);
    }

    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let addr_len = socket_addr_to_sockaddr(addr, &mut storage);
    let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, addr_len) };
    if ret < 0 {
        return Err(close_on(fd, Error::Bind(io::Error::last_os_error())));
    }
    let ret = unsafe { libc::listen(fd, backlog) };
    if ret < 0 {
        return Err(close_on(fd, Error::Bind(io::Error::last_os_error())));
    }
    Ok(fd)
}

/// Create a non-blocking unix-domain stream listener, unlinking any stale
/// socket file first.
pub(crate) fn create_unix_listener(path: &str, backlog: i32) -> Result<RawFd, Error> {
    let fd = unsafe {
        libc::socket(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(Error::Bind(io::Error::last_os_error()));
    }

    let _ = std::fs::remove_file(path);

    let mut storage: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    let len = fill_sockaddr_un(&mut storage, path)
        .map_err(|e| close_on(fd, Error::Bind(e)))?;
    let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if ret < 0 {
        return Err(close_on(fd, Error::Bind(io::Error::last_os_error())));
    }
    let ret = unsafe { libc::listen(fd, backlog) };
    if ret < 0 {
        return Err(close_on(fd, Error::Bind(io::Error::last_os_error())));
    }
    Ok(fd)
}

/// Create and bind a non-blocking UDP socket.
pub(crate) fn create_udp_socket(addr: SocketAddr, reuse_port: bool) -> Result<RawFd, Error> {
    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };
    let fd = unsafe {
        libc::socket(
            domain,
            libc::SOCK_DGRAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(Error::Bind(io::Error::last_os_error()));
    }
    set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1);
    if reuse_port {
        set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1);
    }
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let addr_len = socket_addr_to_sockaddr(addr, &mut storage);
    let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, addr_len) };
    if ret < 0 {
        return Err(close_on(fd, Error::Bind(io::Error::last_os_error())));
    }
    Ok(fd)
}

/// Begin a non-blocking outbound connect. Returns `(fd, established)`;
/// `established == false` means EINPROGRESS and writability signals the
/// outcome (check SO_ERROR then).
pub(crate) fn start_connect(addr: &NetAddr) -> io::Result<(RawFd, bool)> {
    match addr {
        NetAddr::Inet(sa) => {
            let domain = if sa.is_ipv4() {
                libc::AF_INET
            } else {
                libc::AF_INET6
            };
            let fd = unsafe {
                libc::socket(
                    domain,
                    libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                    0,
                )
            };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let addr_len = socket_addr_to_sockaddr(*sa, &mut storage);
            let ret = unsafe {
                libc::connect(fd, &storage as *const _ as *const libc::sockaddr, addr_len)
            };
            finish_connect_start(fd, ret)
        }
        NetAddr::Unix(path) => {
            let fd = unsafe {
                libc::socket(
                    libc::AF_UNIX,
                    libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                    0,
                )
            };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            let mut storage: libc::sockaddr_un = unsafe { std::mem::zeroed() };
            let path = path.to_str().unwrap_or_default();
            let len = match fill_sockaddr_un(&mut storage, path) {
                Ok(len) => len,
                Err(e) => {
                    unsafe { libc::close(fd) };
                    return Err(e);
                }
            };
            let ret =
                unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
            finish_connect_start(fd, ret)
        }
    }
}

fn finish_connect_start(fd: RawFd, ret: libc::c_int) -> io::Result<(RawFd, bool)> {
    if ret == 0 {
        return Ok((fd, true));
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINPROGRESS) | Some(libc::EAGAIN) => Ok((fd, false)),
        _ => {
            unsafe { libc::close(fd) };
            Err(err)
        }
    }
}

/// Read and clear SO_ERROR after a deferred connect.
pub(crate) fn take_socket_error(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }
    Ok(())
}

/// Enable TCP keepalive with the given idle/probe interval in seconds.
pub(crate) fn set_keepalive(fd: RawFd, secs: u32) {
    set_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1);
    set_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, secs as libc::c_int);
    set_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, secs as libc::c_int);
}

/// Disable Nagle's algorithm.
pub(crate) fn set_nodelay(fd: RawFd) {
    set_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1);
}

fn set_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) {
    unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

fn close_on(fd: RawFd, err: Error) -> Error {
    unsafe { libc::close(fd) };
    err
}

/// The address this socket is bound to.
pub(crate) fn local_addr_of(fd: RawFd) -> Option<NetAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret =
        unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if ret < 0 {
        return None;
    }
    storage_to_net_addr(&storage)
}

/// The address of the connected peer.
pub(crate) fn peer_addr_of(fd: RawFd) -> Option<NetAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret =
        unsafe { libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if ret < 0 {
        return None;
    }
    storage_to_net_addr(&storage)
}

fn storage_to_net_addr(storage: &libc::sockaddr_storage) -> Option<NetAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET | libc::AF_INET6 => sockaddr_to_socket_addr(storage).map(NetAddr::Inet),
        libc::AF_UNIX => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_un) };
            let bytes: Vec<u8> = sa
                .sun_path
                .iter()
                .take_while(|&&c| c != 0)
                .map(|&c| c as u8)
                .collect();
            Some(NetAddr::Unix(PathBuf::from(
                String::from_utf8_lossy(&bytes).into_owned(),
            )))
        }
        _ => None,
    }
}

/// Convert a `sockaddr_storage` filled by the kernel to a `SocketAddr`.
pub(crate) fn sockaddr_to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            let port = u16::from_be(sa.sin_port);
            Some(SocketAddr::from((ip, port)))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sa.sin6_addr.s6_addr);
            let port = u16::from_be(sa.sin6_port);
            Some(SocketAddr::from((ip, port)))
        }
        _ => None,
    }
}

/// Write a `SocketAddr` into a `sockaddr_storage`, returning the length.
pub(crate) fn socket_addr_to_sockaddr(
    addr: SocketAddr,
    storage: &mut libc::sockaddr_storage,
) -> libc::socklen_t {
    match addr {
        SocketAddr::V4(v4) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    }
}

fn fill_sockaddr_un(storage: &mut libc::sockaddr_un, path: &str) -> io::Result<libc::socklen_t> {
    let bytes = path.as_bytes();
    if bytes.is_empty() || bytes.len() >= storage.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "unix socket path length out of range",
        ));
    }
    storage.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (dst, src) in storage.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    let base = std::mem::size_of::<libc::sa_family_t>();
    Ok((base + bytes.len() + 1) as libc::socklen_t)
}
