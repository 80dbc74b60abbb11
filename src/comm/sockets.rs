//! Raw socket construction.
//!
//! std's net types cannot bind a local address before connecting or set
//! SO_REUSEADDR before bind, so the few places that need that go through
//! nix and hand the finished descriptor back to std ownership.

use crate::config::types::{Result, SandboxError};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::{
    bind, connect, getsockopt, listen, setsockopt, socket, sockopt, AddressFamily, SockFlag,
    SockType, SockaddrIn,
};
use nix::unistd::close;
use std::net::{SocketAddrV4, TcpListener, TcpStream, UdpSocket};
use std::os::unix::io::{FromRawFd, RawFd};
use std::time::Duration;

fn sock_err(context: &str, err: impl std::fmt::Display) -> SandboxError {
    SandboxError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("{}: {}", context, err),
    ))
}

fn new_socket(kind: SockType) -> Result<RawFd> {
    let fd = socket(AddressFamily::Inet, kind, SockFlag::empty(), None)
        .map_err(|e| sock_err("socket", e))?;
    if let Err(e) = setsockopt(fd, sockopt::ReuseAddr, &true) {
        let _ = close(fd);
        return Err(sock_err("setsockopt(SO_REUSEADDR)", e));
    }
    Ok(fd)
}

fn bind_or_close(fd: RawFd, local: SocketAddrV4) -> Result<()> {
    if let Err(e) = bind(fd, &SockaddrIn::from(local)) {
        let _ = close(fd);
        return Err(sock_err("bind", e));
    }
    Ok(())
}

fn set_nonblocking(fd: RawFd, nonblocking: bool) -> nix::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    let flags = if nonblocking {
        flags | OFlag::O_NONBLOCK
    } else {
        flags & !OFlag::O_NONBLOCK
    };
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// A datagram socket, optionally bound to a local endpoint.
pub(crate) fn bind_udp(local: Option<SocketAddrV4>) -> Result<UdpSocket> {
    let fd = new_socket(SockType::Datagram)?;
    let local = local.unwrap_or_else(|| SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0));
    bind_or_close(fd, local)?;
    Ok(unsafe { UdpSocket::from_raw_fd(fd) })
}

/// A stream listener bound to a local endpoint.
pub(crate) fn bind_listener(local: SocketAddrV4) -> Result<TcpListener> {
    let fd = new_socket(SockType::Stream)?;
    bind_or_close(fd, local)?;
    if let Err(e) = listen(fd, 5) {
        let _ = close(fd);
        return Err(sock_err("listen", e));
    }
    Ok(unsafe { TcpListener::from_raw_fd(fd) })
}

/// Connect a stream socket, optionally from a caller-chosen local endpoint,
/// within `timeout`. The connect runs nonblocking and is waited on with
/// poll so the timeout bounds the whole operation.
pub(crate) fn connect_stream(
    dest: SocketAddrV4,
    local: Option<SocketAddrV4>,
    timeout: Duration,
) -> Result<TcpStream> {
    let fd = new_socket(SockType::Stream)?;
    if let Some(local) = local {
        bind_or_close(fd, local)?;
    }
    if let Err(e) = set_nonblocking(fd, true) {
        let _ = close(fd);
        return Err(sock_err("fcntl(O_NONBLOCK)", e));
    }

    match connect(fd, &SockaddrIn::from(dest)) {
        Ok(()) => {}
        Err(Errno::EINPROGRESS) => {
            if let Err(e) = await_writable(fd, timeout) {
                let _ = close(fd);
                return Err(e);
            }
        }
        Err(e) => {
            let _ = close(fd);
            return Err(sock_err("connect", e));
        }
    }

    if let Err(e) = set_nonblocking(fd, false) {
        let _ = close(fd);
        return Err(sock_err("fcntl(restore blocking)", e));
    }
    Ok(unsafe { TcpStream::from_raw_fd(fd) })
}

fn await_writable(fd: RawFd, timeout: Duration) -> Result<()> {
    let mut fds = [PollFd::new(fd, PollFlags::POLLOUT)];
    let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
    let ready = poll(&mut fds, millis).map_err(|e| sock_err("poll(connect)", e))?;
    if ready == 0 {
        return Err(SandboxError::Timeout(
            "connection attempt timed out".to_string(),
        ));
    }
    // The poll can report writability for a failed connect; SO_ERROR holds
    // the verdict.
    let pending = getsockopt(fd, sockopt::SocketError).map_err(|e| sock_err("SO_ERROR", e))?;
    if pending != 0 {
        return Err(SandboxError::Io(std::io::Error::from_raw_os_error(pending)));
    }
    Ok(())
}
