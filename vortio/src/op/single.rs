//! One-shot operation payloads.
//!
//! Uniform descriptors over `io_uring` opcodes: each captures its prepared
//! arguments, keeps kernel-visible storage alive while in flight, and
//! interprets the raw completion result.

use crate::op::{IoError, OpPayload, parse};
use io_uring::opcode;
use io_uring::squeue::Entry;
use io_uring::types::{Fd, Timespec};
use nix::sys::socket::{AddressFamily, SockProtocol, SockType};
use pin_project::pin_project;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::time::Duration;

///
/// === Nop ===
///
#[derive(Debug, Default)]
pub struct NopOp;

impl OpPayload for NopOp {
    type Output = ();

    fn create_entry(self: Pin<&mut Self>) -> Entry {
        opcode::Nop::new().build()
    }

    fn into_output(
        self: Pin<&mut Self>,
        result: Result<i32, IoError>,
    ) -> Result<Self::Output, IoError> {
        result.map(|_| ())
    }
}

///
/// === Timeout ===
///
/// The timespec lives in the payload because the kernel reads it through a
/// pointer for the lifetime of the operation.
#[pin_project]
pub struct TimeoutOp {
    #[pin]
    timespec: Timespec,
}

impl TimeoutOp {
    pub fn new(after: Duration) -> Self {
        Self {
            timespec: Timespec::from(after),
        }
    }
}

impl OpPayload for TimeoutOp {
    type Output = ();

    fn create_entry(self: Pin<&mut Self>) -> Entry {
        let this = self.project();
        opcode::Timeout::new(std::ptr::from_ref(&*this.timespec))
            .count(1)
            .build()
    }

    fn into_output(
        self: Pin<&mut Self>,
        result: Result<i32, IoError>,
    ) -> Result<Self::Output, IoError> {
        match result {
            Ok(_) => Ok(()),
            // An elapsed timeout completes with -ETIME; that is success here.
            Err(err) if err.raw_os_error() == Some(libc::ETIME) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

///
/// === Read / Write ===
///
pub struct ReadOp<'a> {
    fd: RawFd,
    buf: &'a mut [u8],
    offset: u64,
}

impl<'a> ReadOp<'a> {
    pub fn new(fd: RawFd, buf: &'a mut [u8], offset: u64) -> Self {
        Self { fd, buf, offset }
    }
}

impl OpPayload for ReadOp<'_> {
    type Output = usize;

    fn create_entry(self: Pin<&mut Self>) -> Entry {
        let this = self.get_mut();
        opcode::Read::new(Fd(this.fd), this.buf.as_mut_ptr(), this.buf.len() as u32)
            .offset(this.offset)
            .build()
    }

    fn into_output(
        self: Pin<&mut Self>,
        result: Result<i32, IoError>,
    ) -> Result<Self::Output, IoError> {
        result.map(|n| n as usize)
    }
}

pub struct WriteOp<'a> {
    fd: RawFd,
    buf: &'a [u8],
    offset: u64,
}

impl<'a> WriteOp<'a> {
    pub fn new(fd: RawFd, buf: &'a [u8], offset: u64) -> Self {
        Self { fd, buf, offset }
    }
}

impl OpPayload for WriteOp<'_> {
    type Output = usize;

    fn create_entry(self: Pin<&mut Self>) -> Entry {
        let this = self.get_mut();
        opcode::Write::new(Fd(this.fd), this.buf.as_ptr(), this.buf.len() as u32)
            .offset(this.offset)
            .build()
    }

    fn into_output(
        self: Pin<&mut Self>,
        result: Result<i32, IoError>,
    ) -> Result<Self::Output, IoError> {
        result.map(|n| n as usize)
    }
}

///
/// === Recv / Send ===
///
pub struct RecvOp<'a> {
    fd: RawFd,
    buf: &'a mut [u8],
    flags: i32,
}

impl<'a> RecvOp<'a> {
    pub fn new(fd: RawFd, buf: &'a mut [u8], flags: i32) -> Self {
        Self { fd, buf, flags }
    }
}

impl OpPayload for RecvOp<'_> {
    type Output = usize;

    fn create_entry(self: Pin<&mut Self>) -> Entry {
        let this = self.get_mut();
        opcode::Recv::new(Fd(this.fd), this.buf.as_mut_ptr(), this.buf.len() as u32)
            .flags(this.flags)
            .build()
    }

    fn into_output(
        self: Pin<&mut Self>,
        result: Result<i32, IoError>,
    ) -> Result<Self::Output, IoError> {
        result.map(|n| n as usize)
    }
}

pub struct SendOp<'a> {
    fd: RawFd,
    buf: &'a [u8],
    flags: i32,
}

impl<'a> SendOp<'a> {
    pub fn new(fd: RawFd, buf: &'a [u8], flags: i32) -> Self {
        Self { fd, buf, flags }
    }
}

impl OpPayload for SendOp<'_> {
    type Output = usize;

    fn create_entry(self: Pin<&mut Self>) -> Entry {
        let this = self.get_mut();
        opcode::Send::new(Fd(this.fd), this.buf.as_ptr(), this.buf.len() as u32)
            .flags(this.flags)
            .build()
    }

    fn into_output(
        self: Pin<&mut Self>,
        result: Result<i32, IoError>,
    ) -> Result<Self::Output, IoError> {
        result.map(|n| n as usize)
    }
}

///
/// === Accept ===
///
/// Owns the peer-address output storage for the lifetime of the operation.
#[pin_project]
pub struct AcceptOp {
    fd: RawFd,
    flags: i32,

    #[pin]
    addr: MaybeUninit<libc::sockaddr_storage>,

    #[pin]
    addrlen: libc::socklen_t,
}

impl AcceptOp {
    pub fn new(fd: RawFd, flags: i32) -> Self {
        Self {
            fd,
            flags: flags | libc::SOCK_CLOEXEC,
            addr: MaybeUninit::uninit(),
            addrlen: std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        }
    }
}

impl OpPayload for AcceptOp {
    type Output = (RawFd, Option<SocketAddr>);

    fn create_entry(self: Pin<&mut Self>) -> Entry {
        let this = self.project();
        opcode::Accept::new(
            Fd(*this.fd),
            this.addr.get_mut().as_mut_ptr().cast(),
            std::ptr::from_mut(this.addrlen.get_mut()),
        )
        .flags(*this.flags)
        .build()
    }

    fn into_output(
        self: Pin<&mut Self>,
        result: Result<i32, IoError>,
    ) -> Result<Self::Output, IoError> {
        let this = self.project();
        let fd = result?;

        // A successful accept initialized the storage up to addrlen.
        let addr = unsafe {
            parse::socket_addr_from_c(this.addr.as_ptr(), *this.addrlen as usize).ok()
        };
        Ok((fd, addr))
    }
}

///
/// === Connect ===
///
#[pin_project]
pub struct ConnectOp {
    fd: RawFd,

    #[pin]
    addr: parse::SocketAddrCRepr,
    addrlen: libc::socklen_t,
}

impl ConnectOp {
    pub fn new(fd: RawFd, addr: &SocketAddr) -> Self {
        let (addr, addrlen) = parse::socket_addr_to_c(addr);
        Self { fd, addr, addrlen }
    }
}

impl OpPayload for ConnectOp {
    type Output = ();

    fn create_entry(self: Pin<&mut Self>) -> Entry {
        let this = self.project();
        opcode::Connect::new(Fd(*this.fd), this.addr.as_ptr(), *this.addrlen).build()
    }

    fn into_output(
        self: Pin<&mut Self>,
        result: Result<i32, IoError>,
    ) -> Result<Self::Output, IoError> {
        result.map(|_| ())
    }
}

///
/// === Socket ===
///
#[derive(Debug)]
pub struct SocketOp {
    domain: AddressFamily,
    ty: SockType,
    protocol: SockProtocol,
}

impl SocketOp {
    pub fn new(domain: AddressFamily, ty: SockType, protocol: SockProtocol) -> Self {
        Self {
            domain,
            ty,
            protocol,
        }
    }
}

impl OpPayload for SocketOp {
    type Output = RawFd;

    fn create_entry(self: Pin<&mut Self>) -> Entry {
        opcode::Socket::new(self.domain as i32, self.ty as i32, self.protocol as i32).build()
    }

    fn into_output(
        self: Pin<&mut Self>,
        result: Result<i32, IoError>,
    ) -> Result<Self::Output, IoError> {
        result
    }
}

///
/// === Shutdown ===
///
#[derive(Debug)]
pub struct ShutdownOp {
    fd: RawFd,
    how: i32,
}

impl ShutdownOp {
    pub fn new(fd: RawFd, how: i32) -> Self {
        Self { fd, how }
    }
}

impl OpPayload for ShutdownOp {
    type Output = ();

    fn create_entry(self: Pin<&mut Self>) -> Entry {
        opcode::Shutdown::new(Fd(self.fd), self.how).build()
    }

    fn into_output(
        self: Pin<&mut Self>,
        result: Result<i32, IoError>,
    ) -> Result<Self::Output, IoError> {
        result.map(|_| ())
    }
}

///
/// === Close ===
///
#[derive(Debug)]
pub struct CloseOp {
    fd: RawFd,
}

impl CloseOp {
    pub fn new(fd: RawFd) -> Self {
        Self { fd }
    }
}

impl OpPayload for CloseOp {
    type Output = ();

    fn create_entry(self: Pin<&mut Self>) -> Entry {
        opcode::Close::new(Fd(self.fd)).build()
    }

    fn into_output(
        self: Pin<&mut Self>,
        result: Result<i32, IoError>,
    ) -> Result<Self::Output, IoError> {
        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::Op;
    use crate::{self as vortio};
    use nix::sys::socket::SockFlag;
    use std::net::{IpAddr, Ipv4Addr};

    const LOCALHOST: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);

    #[vortio::test]
    async fn test_nop_resolves() {
        assert!(Op::new(NopOp).await.is_ok());
    }

    #[vortio::test]
    async fn test_timeout_elapses_as_success() {
        let start = std::time::Instant::now();
        let res = Op::new(TimeoutOp::new(Duration::from_millis(20))).await;
        assert!(res.is_ok());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[vortio::test]
    async fn test_read_bad_fd_surfaces_raw_errno() {
        let mut buf = [0u8; 4];
        let res = Op::new(ReadOp::new(-42, &mut buf, 0)).await;
        assert_eq!(res.unwrap_err().raw_os_error(), Some(libc::EBADF));
    }

    #[vortio::test]
    async fn test_accept_error_does_not_parse_addr() {
        let res = Op::new(AcceptOp::new(1234, 0)).await;
        assert!(res.is_err());
    }

    #[vortio::test]
    async fn test_socket_bind_listen_accept_connect() {
        let listener = Op::new(SocketOp::new(
            AddressFamily::Inet,
            SockType::Stream,
            SockProtocol::Tcp,
        ))
        .await
        .expect("server socket creation failed");

        let socket = crate::net::Socket::from_fd(listener);
        socket.bind(LOCALHOST).unwrap();
        socket.listen(128).unwrap();
        let bound = socket.local_addr().unwrap();

        let client = vortio::spawn(async move {
            let fd = Op::new(SocketOp::new(
                AddressFamily::Inet,
                SockType::Stream,
                SockProtocol::Tcp,
            ))
            .await
            .expect("client socket creation failed");
            let client = crate::net::Socket::from_fd(fd);
            client.connect(bound).await.expect("connect failed");
            client
        });

        let (fd, peer) = socket.accept().await.expect("accept failed");
        assert!(fd > 0);
        let peer = peer.expect("accept should capture the peer address");
        assert_eq!(peer.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));

        // Close the accepted fd; the sockets close in their destructors.
        let accepted = crate::net::Socket::from_fd(fd);
        accepted.close().await.unwrap();

        client.await.unwrap();
    }

    #[vortio::test]
    async fn test_send_then_recv_on_socketpair() {
        let (a, b) = nix::sys::socket::socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .unwrap();
        let a = crate::net::Socket::from_owned(a);
        let b = crate::net::Socket::from_owned(b);

        let sent = Op::new(SendOp::new(a.fd(), b"ping", 0)).await.unwrap();
        assert_eq!(sent, 4);

        let mut buf = [0u8; 8];
        let received = Op::new(RecvOp::new(b.fd(), &mut buf, 0)).await.unwrap();
        assert_eq!(&buf[..received], b"ping");
    }
}
