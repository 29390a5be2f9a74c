//! `std::net::SocketAddr` ⇄ C sockaddr conversions for the socket payloads.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// C representation big enough for either address family, kept alive in the
/// payload while the kernel reads it.
#[repr(C)]
pub(crate) union SocketAddrCRepr {
    v4: libc::sockaddr_in,
    v6: libc::sockaddr_in6,
}

impl SocketAddrCRepr {
    pub(crate) fn as_ptr(&self) -> *const libc::sockaddr {
        std::ptr::from_ref(self).cast()
    }
}

pub(crate) fn socket_addr_to_c(addr: &SocketAddr) -> (SocketAddrCRepr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            (
                SocketAddrCRepr { v4: sin },
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
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
            (
                SocketAddrCRepr { v6: sin6 },
                mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

/// Interprets kernel-written sockaddr storage.
///
/// # Safety
///
/// `storage` must point to at least `len` initialized bytes of sockaddr data.
pub(crate) unsafe fn socket_addr_from_c(
    storage: *const libc::sockaddr_storage,
    len: usize,
) -> io::Result<SocketAddr> {
    let family = unsafe { (*storage).ss_family };
    match i32::from(family) {
        libc::AF_INET => {
            if len < mem::size_of::<libc::sockaddr_in>() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "short AF_INET sockaddr",
                ));
            }
            let sin = unsafe { *storage.cast::<libc::sockaddr_in>() };
            Ok(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            if len < mem::size_of::<libc::sockaddr_in6>() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "short AF_INET6 sockaddr",
                ));
            }
            let sin6 = unsafe { *storage.cast::<libc::sockaddr_in6>() };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported address family: {family}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::v4("127.0.0.1:8080".parse().unwrap())]
    #[case::v4_ephemeral("10.1.2.3:0".parse().unwrap())]
    #[case::v6("[::1]:443".parse().unwrap())]
    fn test_round_trip(#[case] addr: SocketAddr) {
        let (c_repr, len) = socket_addr_to_c(&addr);

        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        unsafe {
            std::ptr::copy_nonoverlapping(
                c_repr.as_ptr().cast::<u8>(),
                std::ptr::from_mut(&mut storage).cast(),
                len as usize,
            );
        }

        let back = unsafe { socket_addr_from_c(&storage, len as usize) }.unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn test_unknown_family_is_rejected() {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        storage.ss_family = libc::AF_UNIX as libc::sa_family_t;
        let res = unsafe { socket_addr_from_c(&storage, mem::size_of_val(&storage)) };
        assert!(res.is_err());
    }
}
