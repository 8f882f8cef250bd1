//! Thin wrappers around the socket syscalls.
//!
//! Everything here is deliberately boring: create, bind, listen, accept,
//! set an option, shut a half down. The interesting policy (what to do on
//! EAGAIN, EMFILE and friends) lives with the callers; this module only
//! makes the calls and owns the descriptors.

use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{
    self, sockopt, AddressFamily, Backlog, SetSockOpt, Shutdown, SockFlag, SockProtocol,
    SockType, SockaddrIn,
};
use tracing::{debug, error};

use crate::addr::InetAddress;
use crate::error::{fatal, Result};

/// An owned TCP socket.
///
/// Closes the descriptor exactly once, on drop. The channel watching the
/// descriptor only ever borrows the raw fd and never owns it.
#[derive(Debug)]
pub struct Socket {
    fd: OwnedFd,
}

impl Socket {
    /// A fresh nonblocking, close-on-exec TCP socket.
    pub fn nonblocking() -> Result<Socket> {
        let fd = socket::socket(
            AddressFamily::Inet,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            SockProtocol::Tcp,
        )?;
        Ok(Socket { fd })
    }

    /// Adopt an already-open descriptor (an accepted connection).
    pub fn from_owned(fd: OwnedFd) -> Socket {
        Socket { fd }
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Bind to a local address. Failing to bind is unrecoverable for a
    /// server, so this doesn't return, it dies.
    pub fn bind_addr(&self, addr: &InetAddress) {
        if let Err(e) = socket::bind(self.fd.as_raw_fd(), &addr.sockaddr()) {
            fatal!(fd = self.fd(), addr = %addr, errno = %e, "bind failed");
        }
    }

    /// Start listening. Same deal as [`bind_addr`](Socket::bind_addr).
    pub fn listen(&self) {
        let backlog = Backlog::new(1024).unwrap_or(Backlog::MAXCONN);
        if let Err(e) = socket::listen(&self.fd, backlog) {
            fatal!(fd = self.fd(), errno = %e, "listen failed");
        }
    }

    /// Accept one pending connection, nonblocking and close-on-exec.
    ///
    /// The errno comes back raw so the acceptor can tell EAGAIN from EMFILE
    /// from everything else.
    pub fn accept(&self) -> std::result::Result<(OwnedFd, InetAddress), Errno> {
        let conn = socket::accept4(
            self.fd.as_raw_fd(),
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        )?;
        // SAFETY: accept4 just handed this fd to us, nobody else owns it
        let conn = unsafe { OwnedFd::from_raw_fd(conn) };
        let peer = match socket::getpeername::<SockaddrIn>(conn.as_raw_fd()) {
            Ok(sa) => InetAddress::from_sockaddr(sa),
            Err(e) => {
                // The peer can be gone before we even ask who it was. The
                // first read on the connection will surface that; report a
                // placeholder address meanwhile.
                debug!(errno = %e, "getpeername on a fresh connection failed");
                InetAddress::any(0)
            },
        };
        Ok((conn, peer))
    }

    /// Write some bytes. Partial writes and EAGAIN are the caller's business.
    pub fn write(&self, data: &[u8]) -> std::result::Result<usize, Errno> {
        // SAFETY: writes from a live slice of the stated length
        let n = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                data.as_ptr() as *const libc::c_void,
                data.len(),
            )
        };
        if n < 0 {
            return Err(Errno::last());
        }
        Ok(n as usize)
    }

    /// Close the write half, letting the peer read an EOF after draining.
    pub fn shutdown_write(&self) {
        if let Err(e) = socket::shutdown(self.fd.as_raw_fd(), Shutdown::Write) {
            error!(fd = self.fd(), errno = %e, "shutdown(WR) failed");
        }
    }

    /// The locally bound address (useful after binding port 0).
    pub fn local_addr(&self) -> InetAddress {
        match socket::getsockname::<SockaddrIn>(self.fd.as_raw_fd()) {
            Ok(sa) => InetAddress::from_sockaddr(sa),
            Err(e) => {
                error!(fd = self.fd(), errno = %e, "getsockname failed");
                InetAddress::any(0)
            },
        }
    }

    /// Disable Nagle's algorithm, for latency-sensitive traffic.
    pub fn set_tcp_nodelay(&self, on: bool) {
        self.set_bool(sockopt::TcpNoDelay, on, "TCP_NODELAY");
    }

    /// Allow rebinding an address still in TIME_WAIT.
    pub fn set_reuse_addr(&self, on: bool) {
        self.set_bool(sockopt::ReuseAddr, on, "SO_REUSEADDR");
    }

    /// Allow several sockets to bind the same address and port.
    pub fn set_reuse_port(&self, on: bool) {
        self.set_bool(sockopt::ReusePort, on, "SO_REUSEPORT");
    }

    /// Kernel-level liveness probes on an idle connection.
    pub fn set_keep_alive(&self, on: bool) {
        self.set_bool(sockopt::KeepAlive, on, "SO_KEEPALIVE");
    }

    fn set_bool<O: SetSockOpt<Val = bool>>(&self, opt: O, on: bool, name: &str) {
        if let Err(e) = socket::setsockopt(&self.fd, opt, &on) {
            error!(fd = self.fd(), option = name, errno = %e, "setsockopt failed");
        }
    }

    /// The pending socket error, if any (SO_ERROR).
    pub fn take_error(&self) -> Option<Errno> {
        match socket::getsockopt(&self.fd, sockopt::SocketError) {
            Ok(0) => None,
            Ok(raw) => Some(Errno::from_raw(raw)),
            Err(e) => Some(e),
        }
    }
}

impl AsFd for Socket {
    fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// A spare descriptor to sacrifice when the process runs out of fds.
///
/// The acceptor holds one of these; see the EMFILE handling there.
pub fn open_idle_fd() -> OwnedFd {
    // SAFETY: plain open(2) with a static path, we own the result
    let fd = unsafe {
        libc::open(
            b"/dev/null\0".as_ptr() as *const libc::c_char,
            libc::O_RDONLY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        fatal!(errno = %Errno::last(), "can't open /dev/null");
    }
    // SAFETY: just opened, ours
    unsafe { OwnedFd::from_raw_fd(fd) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_listen_accept_nothing() {
        let socket = Socket::nonblocking().unwrap();
        socket.set_reuse_addr(true);
        socket.bind_addr(&InetAddress::loopback(0));
        socket.listen();
        let addr = socket.local_addr();
        assert_ne!(0, addr.port());
        // Nonblocking listener with no client must report EAGAIN
        assert_eq!(Err(Errno::EAGAIN), socket.accept().map(|(_, a)| a));
    }

    #[test]
    fn options_do_not_blow_up() {
        let socket = Socket::nonblocking().unwrap();
        socket.set_tcp_nodelay(true);
        socket.set_keep_alive(true);
        socket.set_reuse_addr(true);
        socket.set_reuse_port(true);
        assert_eq!(None, socket.take_error());
    }
}
