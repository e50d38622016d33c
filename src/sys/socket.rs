use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::unix::io::FromRawFd;
use std::ptr;

use libc::{c_int, c_void, socklen_t};

fn family(addr: &SocketAddr) -> c_int {
    match addr {
        SocketAddr::V4(..) => libc::AF_INET,
        SocketAddr::V6(..) => libc::AF_INET6,
    }
}

fn sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*a.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            mem::size_of::<libc::sockaddr_in>()
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
            unsafe {
                ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };

    (storage, len as socklen_t)
}

fn set_reuseaddr(fd: c_int) -> io::Result<()> {
    let one: c_int = 1;
    syscall!(setsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_REUSEADDR,
        &one as *const _ as *const c_void,
        mem::size_of::<c_int>() as socklen_t
    ))?;
    Ok(())
}

/// Creates a non-blocking TCP listener bound to `addr`.
pub fn nonblocking_listener(addr: &SocketAddr) -> io::Result<TcpListener> {
    let fd = syscall!(socket(
        family(addr),
        libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
        0
    ))?;

    // wrap first so the fd is closed if any of the following steps fail
    let listener = unsafe { TcpListener::from_raw_fd(fd) };

    set_reuseaddr(fd)?;

    let (storage, len) = sockaddr(addr);
    syscall!(bind(fd, &storage as *const _ as *const libc::sockaddr, len))?;
    syscall!(listen(fd, 128))?;

    Ok(listener)
}

/// Starts a non-blocking connect toward `addr`.
///
/// The connect is in flight when this returns; the socket reports writable
/// once it settles, and `SO_ERROR` tells whether it succeeded.
pub fn connect_stream(addr: &SocketAddr) -> io::Result<TcpStream> {
    let fd = syscall!(socket(
        family(addr),
        libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
        0
    ))?;

    let stream = unsafe { TcpStream::from_raw_fd(fd) };

    let (storage, len) = sockaddr(addr);
    match syscall!(connect(fd, &storage as *const _ as *const libc::sockaddr, len)) {
        Ok(_) => {}
        Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(e),
    }

    Ok(stream)
}

/// UDP socket for sending multicast beacons.
pub fn multicast_sender() -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.set_nonblocking(true)?;
    socket.set_multicast_loop_v4(true)?;
    Ok(socket)
}

/// UDP socket joined to `group`, receiving on `port`.
///
/// `SO_REUSEADDR` is set before binding so several listeners on one host can
/// share the group, which is also what the tests rely on.
pub fn multicast_listener(group: Ipv4Addr, port: u16) -> io::Result<UdpSocket> {
    let fd = syscall!(socket(
        libc::AF_INET,
        libc::SOCK_DGRAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
        0
    ))?;

    let socket = unsafe { UdpSocket::from_raw_fd(fd) };

    set_reuseaddr(fd)?;

    let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let (storage, len) = sockaddr(&bind_addr);
    syscall!(bind(fd, &storage as *const _ as *const libc::sockaddr, len))?;

    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;

    Ok(socket)
}
