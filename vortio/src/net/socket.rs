//! A thin fd-owning socket facade over the operation descriptors.

use crate::op::single::{
    AcceptOp, CloseOp, ConnectOp, ReadOp, RecvOp, SendOp, ShutdownOp, WriteOp,
};
use crate::op::{Op, parse};
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::{IntoRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Which direction(s) of a connection to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Read,
    Write,
    Both,
}

impl Shutdown {
    fn how(self) -> i32 {
        match self {
            Shutdown::Read => libc::SHUT_RD,
            Shutdown::Write => libc::SHUT_WR,
            Shutdown::Both => libc::SHUT_RDWR,
        }
    }
}

/// An owned socket. Async operations go through the runtime's per-worker
/// ring; option accessors and address queries are plain syscalls. The
/// destructor closes the descriptor synchronously.
#[derive(Debug)]
pub struct Socket {
    fd: RawFd,
}

impl Socket {
    /// Creates a socket with a blocking `socket(2)` call.
    pub fn build(domain: i32, ty: i32, protocol: i32) -> io::Result<Socket> {
        let fd = unsafe { libc::socket(domain, ty | libc::SOCK_CLOEXEC, protocol) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Socket { fd })
    }

    /// Takes ownership of a raw descriptor.
    pub fn from_fd(fd: RawFd) -> Socket {
        Socket { fd }
    }

    pub fn from_owned(fd: OwnedFd) -> Socket {
        Socket {
            fd: fd.into_raw_fd(),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn read<'a>(&self, buf: &'a mut [u8]) -> Op<ReadOp<'a>> {
        Op::new(ReadOp::new(self.fd, buf, 0))
    }

    pub fn write<'a>(&self, buf: &'a [u8]) -> Op<WriteOp<'a>> {
        Op::new(WriteOp::new(self.fd, buf, 0))
    }

    pub fn recv<'a>(&self, buf: &'a mut [u8]) -> Op<RecvOp<'a>> {
        Op::new(RecvOp::new(self.fd, buf, 0))
    }

    pub fn send<'a>(&self, buf: &'a [u8]) -> Op<SendOp<'a>> {
        Op::new(SendOp::new(self.fd, buf, libc::MSG_NOSIGNAL))
    }

    pub fn accept(&self) -> Op<AcceptOp> {
        Op::new(AcceptOp::new(self.fd, 0))
    }

    pub fn connect(&self, addr: SocketAddr) -> Op<ConnectOp> {
        Op::new(ConnectOp::new(self.fd, &addr))
    }

    /// Closes the descriptor through the ring, consuming the socket. The
    /// destructor will not close it again.
    pub fn close(mut self) -> Op<CloseOp> {
        let fd = mem::replace(&mut self.fd, -1);
        Op::new(CloseOp::new(fd))
    }

    /// Shuts down one or both directions through the ring.
    pub fn shutdown_async(&self, how: Shutdown) -> Op<ShutdownOp> {
        Op::new(ShutdownOp::new(self.fd, how.how()))
    }

    pub fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        let (c_addr, len) = parse::socket_addr_to_c(&addr);
        syscall_result(unsafe { libc::bind(self.fd, c_addr.as_ptr(), len) }).map(|_| ())
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        syscall_result(unsafe { libc::listen(self.fd, backlog) }).map(|_| ())
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        syscall_result(unsafe { libc::shutdown(self.fd, how.how()) }).map(|_| ())
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.addr_with(|fd, addr, len| unsafe { libc::getsockname(fd, addr, len) })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.addr_with(|fd, addr, len| unsafe { libc::getpeername(fd, addr, len) })
    }

    fn addr_with(
        &self,
        f: impl FnOnce(RawFd, *mut libc::sockaddr, *mut libc::socklen_t) -> i32,
    ) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall_result(f(
            self.fd,
            std::ptr::from_mut(&mut storage).cast(),
            &mut len,
        ))?;
        unsafe { parse::socket_addr_from_c(&storage, len as usize) }
    }

    pub fn set_reuseaddr(&self, on: bool) -> io::Result<()> {
        self.set_sock_opt(libc::SOL_SOCKET, libc::SO_REUSEADDR, &i32::from(on))
    }

    pub fn reuseaddr(&self) -> io::Result<bool> {
        self.get_sock_opt::<i32>(libc::SOL_SOCKET, libc::SO_REUSEADDR)
            .map(|v| v != 0)
    }

    pub fn set_reuseport(&self, on: bool) -> io::Result<()> {
        self.set_sock_opt(libc::SOL_SOCKET, libc::SO_REUSEPORT, &i32::from(on))
    }

    pub fn reuseport(&self) -> io::Result<bool> {
        self.get_sock_opt::<i32>(libc::SOL_SOCKET, libc::SO_REUSEPORT)
            .map(|v| v != 0)
    }

    pub fn set_ttl(&self, ttl: u32) -> io::Result<()> {
        self.set_sock_opt(libc::IPPROTO_IP, libc::IP_TTL, &ttl)
    }

    pub fn ttl(&self) -> io::Result<u32> {
        self.get_sock_opt(libc::IPPROTO_IP, libc::IP_TTL)
    }

    pub fn set_nodelay(&self, on: bool) -> io::Result<()> {
        self.set_sock_opt(libc::IPPROTO_TCP, libc::TCP_NODELAY, &i32::from(on))
    }

    pub fn nodelay(&self) -> io::Result<bool> {
        self.get_sock_opt::<i32>(libc::IPPROTO_TCP, libc::TCP_NODELAY)
            .map(|v| v != 0)
    }

    pub fn set_keepalive(&self, on: bool) -> io::Result<()> {
        self.set_sock_opt(libc::SOL_SOCKET, libc::SO_KEEPALIVE, &i32::from(on))
    }

    pub fn keepalive(&self) -> io::Result<bool> {
        self.get_sock_opt::<i32>(libc::SOL_SOCKET, libc::SO_KEEPALIVE)
            .map(|v| v != 0)
    }

    pub fn set_linger(&self, duration: Option<Duration>) -> io::Result<()> {
        let linger = libc::linger {
            l_onoff: i32::from(duration.is_some()),
            l_linger: duration.map_or(0, |d| d.as_secs() as i32),
        };
        self.set_sock_opt(libc::SOL_SOCKET, libc::SO_LINGER, &linger)
    }

    pub fn linger(&self) -> io::Result<Option<Duration>> {
        let linger: libc::linger = self.get_sock_opt(libc::SOL_SOCKET, libc::SO_LINGER)?;
        if linger.l_onoff == 0 {
            Ok(None)
        } else {
            Ok(Some(Duration::from_secs(linger.l_linger as u64)))
        }
    }

    fn set_sock_opt<T>(&self, level: i32, optname: i32, optval: &T) -> io::Result<()> {
        syscall_result(unsafe {
            libc::setsockopt(
                self.fd,
                level,
                optname,
                std::ptr::from_ref(optval).cast(),
                mem::size_of::<T>() as libc::socklen_t,
            )
        })
        .map(|_| ())
    }

    fn get_sock_opt<T: Copy>(&self, level: i32, optname: i32) -> io::Result<T> {
        let mut optval = mem::MaybeUninit::<T>::uninit();
        let mut optlen = mem::size_of::<T>() as libc::socklen_t;
        syscall_result(unsafe {
            libc::getsockopt(
                self.fd,
                level,
                optname,
                optval.as_mut_ptr().cast(),
                &mut optlen,
            )
        })?;
        Ok(unsafe { optval.assume_init() })
    }

    fn sync_close(fd: RawFd) {
        let mut retries = 3;
        loop {
            if unsafe { libc::close(fd) } == 0 {
                return;
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) || retries == 0 {
                tracing::error!(fd, %err, "closing socket failed");
                return;
            }
            retries -= 1;
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if self.fd >= 0 {
            Self::sync_close(self.fd);
        }
    }
}

fn syscall_result(res: i32) -> io::Result<i32> {
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn tcp_socket() -> Socket {
        Socket::build(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap()
    }

    #[test]
    fn test_option_round_trips() {
        let socket = tcp_socket();

        socket.set_reuseaddr(true).unwrap();
        assert!(socket.reuseaddr().unwrap());

        socket.set_nodelay(true).unwrap();
        assert!(socket.nodelay().unwrap());

        socket.set_ttl(42).unwrap();
        assert_eq!(socket.ttl().unwrap(), 42);

        assert_eq!(socket.linger().unwrap(), None);
        socket.set_linger(Some(Duration::from_secs(3))).unwrap();
        assert_eq!(socket.linger().unwrap(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_bind_listen_and_local_addr() {
        let socket = tcp_socket();
        socket
            .bind("127.0.0.1:0".parse().unwrap())
            .unwrap();
        socket.listen(16).unwrap();

        let addr = socket.local_addr().unwrap();
        assert_eq!(addr.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_shutdown_reports_not_connected() {
        let socket = tcp_socket();
        let err = socket.shutdown(Shutdown::Both).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOTCONN));
    }
}
