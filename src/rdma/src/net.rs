//! Conversions between `std::net` addresses and their C representation.
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use nix::sys::socket::{AddressFamily, SockaddrLike, SockaddrStorage};

use crate::ffi;

pub(crate) trait IntoInner<T> {
    fn into_inner(self) -> T;
}

impl IntoInner<ffi::in_addr> for Ipv4Addr {
    #[inline]
    fn into_inner(self) -> ffi::in_addr {
        // `s_addr` is big endian and so is `octets()`, keep the byte order as is.
        ffi::in_addr {
            s_addr: u32::from_ne_bytes(self.octets()),
        }
    }
}

impl IntoInner<ffi::in6_addr> for Ipv6Addr {
    #[inline]
    fn into_inner(self) -> ffi::in6_addr {
        ffi::in6_addr {
            __in6_u: ffi::in6_addr__bindgen_ty_1 {
                __u6_addr8: self.octets(),
            },
        }
    }
}

impl IntoInner<ffi::sockaddr_in> for SocketAddrV4 {
    #[inline]
    fn into_inner(self) -> ffi::sockaddr_in {
        ffi::sockaddr_in {
            sin_family: ffi::AF_INET as ffi::sa_family_t,
            sin_port: self.port().to_be(),
            sin_addr: self.ip().into_inner(),
            ..unsafe { mem::zeroed() }
        }
    }
}

impl IntoInner<ffi::sockaddr_in6> for SocketAddrV6 {
    #[inline]
    fn into_inner(self) -> ffi::sockaddr_in6 {
        ffi::sockaddr_in6 {
            sin6_family: ffi::AF_INET6 as ffi::sa_family_t,
            sin6_port: self.port().to_be(),
            sin6_addr: self.ip().into_inner(),
            sin6_flowinfo: self.flowinfo(),
            sin6_scope_id: self.scope_id(),
        }
    }
}

/// Storage large enough for either address family, passed to the CM as a `sockaddr`.
#[repr(C)]
pub(crate) union SocketAddrCRepr {
    v4: ffi::sockaddr_in,
    v6: ffi::sockaddr_in6,
}

impl SocketAddrCRepr {
    #[inline]
    pub(crate) fn as_mut_ptr(&mut self) -> *mut ffi::sockaddr {
        self as *mut _ as *mut ffi::sockaddr
    }
}

impl<'a> IntoInner<SocketAddrCRepr> for &'a SocketAddr {
    #[inline]
    fn into_inner(self) -> SocketAddrCRepr {
        match *self {
            SocketAddr::V4(a) => SocketAddrCRepr { v4: a.into_inner() },
            SocketAddr::V6(a) => SocketAddrCRepr { v6: a.into_inner() },
        }
    }
}

/// Reads a socket address the CM filled in. Returns `None` for an unset or non-IP address.
///
/// # Safety
///
/// `addr` must point to storage at least as large as a `sockaddr_in6`.
pub(crate) unsafe fn socket_addr_from_raw(addr: *const ffi::sockaddr) -> Option<SocketAddr> {
    let ss = SockaddrStorage::from_raw(addr as *const libc::sockaddr, None)?;
    match ss.family()? {
        AddressFamily::Inet => ss
            .as_sockaddr_in()
            .map(|sin| SocketAddr::V4(SocketAddrV4::from(*sin))),
        AddressFamily::Inet6 => ss
            .as_sockaddr_in6()
            .map(|sin6| SocketAddr::V6(SocketAddrV6::from(*sin6))),
        _ => None,
    }
}
