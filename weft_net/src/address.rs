//! Address value objects, grounded in
//! `original_source/ljrServer/address.{h,cpp}`'s `Address`/`IPv4Address`/
//! `IPv6Address`/`UnixAddress` hierarchy, collapsed into a single enum
//! (idiomatic Rust favors a closed sum type here over a virtual base
//! class with one implementation per family).

use std::ffi::CString;
use std::net::{SocketAddrV4, SocketAddrV6};
use std::path::PathBuf;

/// Offset of `sun_path` within `struct sockaddr_un` on Linux: two bytes
/// of `sun_family` precede it.
const SUN_PATH_OFFSET: usize = 2;

/// A bindable/connectable network endpoint: IPv4, IPv6, or a Unix-domain
/// socket path (optionally abstract, Linux's leading-NUL convention).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    V4(SocketAddrV4),
    V6(SocketAddrV6),
    Unix { path: PathBuf, abstract_ns: bool },
}

impl Address {
    pub fn family(&self) -> i32 {
        match self {
            Address::V4(_) => libc::AF_INET,
            Address::V6(_) => libc::AF_INET6,
            Address::Unix { .. } => libc::AF_UNIX,
        }
    }

    /// A Unix-domain address, flagged abstract (Linux-only, leading NUL,
    /// no filesystem entry) or path-backed.
    pub fn unix(path: impl Into<PathBuf>, abstract_ns: bool) -> Self {
        Address::Unix {
            path: path.into(),
            abstract_ns,
        }
    }

    /// Encodes this address into a raw `sockaddr` buffer suitable for
    /// `bind(2)`/`connect(2)`, returning the buffer and its valid length.
    ///
    /// The `UnixAddress` length follows
    /// `offsetof(sun_path) + strlen(path) + (abstract ? 0 : 1)` per
    /// spec.md §9 (the original's own comments disagreed with its code
    /// here; this is the standard formula, not the original's).
    pub fn to_raw(&self) -> (Vec<u8>, libc::socklen_t) {
        match self {
            Address::V4(addr) => {
                // Safety: `sockaddr_in` is a plain-old-data struct; an
                // all-zero bit pattern is a valid value for it.
                let mut raw: libc::sockaddr_in = unsafe { std::mem::zeroed() };
                raw.sin_family = libc::AF_INET as libc::sa_family_t;
                raw.sin_port = addr.port().to_be();
                raw.sin_addr.s_addr = u32::from_ne_bytes(addr.ip().octets());
                // Safety: `raw` is a live, fully-initialized local of
                // exactly this size; the borrow does not outlive it.
                let bytes = unsafe {
                    std::slice::from_raw_parts(
                        (&raw as *const libc::sockaddr_in).cast::<u8>(),
                        std::mem::size_of::<libc::sockaddr_in>(),
                    )
                }
                .to_vec();
                (bytes, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
            }
            Address::V6(addr) => {
                // Safety: `sockaddr_in6` is a plain-old-data struct; an
                // all-zero bit pattern is a valid value for it.
                let mut raw: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
                raw.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                raw.sin6_port = addr.port().to_be();
                raw.sin6_addr.s6_addr = addr.ip().octets();
                raw.sin6_flowinfo = addr.flowinfo();
                raw.sin6_scope_id = addr.scope_id();
                // Safety: `raw` is a live, fully-initialized local of
                // exactly this size; the borrow does not outlive it.
                let bytes = unsafe {
                    std::slice::from_raw_parts(
                        (&raw as *const libc::sockaddr_in6).cast::<u8>(),
                        std::mem::size_of::<libc::sockaddr_in6>(),
                    )
                }
                .to_vec();
                (bytes, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
            }
            Address::Unix { path, abstract_ns } => {
                let path_bytes = path.as_os_str().as_encoded_bytes();
                // Safety: `sockaddr_un` is a plain-old-data struct; an
                // all-zero bit pattern is a valid value for it.
                let mut raw: libc::sockaddr_un = unsafe { std::mem::zeroed() };
                raw.sun_family = libc::AF_UNIX as libc::sa_family_t;

                let start = if *abstract_ns { 1 } else { 0 };
                let copy_len = path_bytes.len().min(raw.sun_path.len() - start);
                for (i, b) in path_bytes[..copy_len].iter().enumerate() {
                    raw.sun_path[start + i] = *b as libc::c_char;
                }

                let name_len = start + copy_len;
                let total_len = SUN_PATH_OFFSET + name_len + usize::from(!abstract_ns);

                // Safety: `raw` is a live, fully-initialized local of
                // exactly this size; the borrow does not outlive it.
                let bytes = unsafe {
                    std::slice::from_raw_parts(
                        (&raw as *const libc::sockaddr_un).cast::<u8>(),
                        std::mem::size_of::<libc::sockaddr_un>(),
                    )
                }
                .to_vec();
                (bytes, total_len as libc::socklen_t)
            }
        }
    }

    /// Decodes a `sockaddr` returned by `accept(2)`/`getsockname(2)`.
    ///
    /// # Safety
    /// `addr` must point to at least `len` readable bytes forming a
    /// valid `sockaddr` of the family it claims.
    pub unsafe fn from_raw(addr: *const libc::sockaddr, len: libc::socklen_t) -> Option<Self> {
        if addr.is_null() {
            return None;
        }
        // Safety: caller guarantees `addr` points to a valid `sockaddr`.
        let family = unsafe { (*addr).sa_family as i32 };
        match family {
            libc::AF_INET => {
                // Safety: `family` just confirmed this is `AF_INET`,
                // and the caller guarantees `len` bytes are valid.
                let raw = unsafe { &*addr.cast::<libc::sockaddr_in>() };
                let ip = u32::from_ne_bytes(raw.sin_addr.s_addr.to_ne_bytes());
                Some(Address::V4(SocketAddrV4::new(
                    ip.into(),
                    u16::from_be(raw.sin_port),
                )))
            }
            libc::AF_INET6 => {
                // Safety: `family` just confirmed this is `AF_INET6`,
                // and the caller guarantees `len` bytes are valid.
                let raw = unsafe { &*addr.cast::<libc::sockaddr_in6>() };
                Some(Address::V6(SocketAddrV6::new(
                    raw.sin6_addr.s6_addr.into(),
                    u16::from_be(raw.sin6_port),
                    raw.sin6_flowinfo,
                    raw.sin6_scope_id,
                )))
            }
            libc::AF_UNIX => {
                // Safety: `family` just confirmed this is `AF_UNIX`,
                // and the caller guarantees `len` bytes are valid.
                let raw = unsafe { &*addr.cast::<libc::sockaddr_un>() };
                let name_len = (len as usize).saturating_sub(SUN_PATH_OFFSET);
                if name_len == 0 {
                    return Some(Address::Unix {
                        path: PathBuf::new(),
                        abstract_ns: false,
                    });
                }
                let abstract_ns = raw.sun_path[0] == 0;
                let start = usize::from(abstract_ns);
                let bytes: Vec<u8> = raw.sun_path[start..name_len]
                    .iter()
                    .take_while(|b| abstract_ns || **b != 0)
                    .map(|b| *b as u8)
                    .collect();
                let path = CString::new(bytes.clone())
                    .map(|_| PathBuf::from(String::from_utf8_lossy(&bytes).into_owned()))
                    .unwrap_or_else(|_| PathBuf::from(String::from_utf8_lossy(&bytes).into_owned()));
                Some(Address::Unix { path, abstract_ns })
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::V4(a) => write!(f, "{a}"),
            Address::V6(a) => write!(f, "{a}"),
            Address::Unix { path, abstract_ns: true } => write!(f, "unix:@{}", path.display()),
            Address::Unix { path, abstract_ns: false } => write!(f, "unix:{}", path.display()),
        }
    }
}

impl From<std::net::SocketAddr> for Address {
    fn from(a: std::net::SocketAddr) -> Self {
        match a {
            std::net::SocketAddr::V4(v4) => Address::V4(v4),
            std::net::SocketAddr::V6(v6) => Address::V6(v6),
        }
    }
}

/// Resolves `host[:port]` to every matching [`Address`], grounded in
/// `Address::Lookup`. DNS resolution is delegated to
/// [`std::net::ToSocketAddrs`] (blocking); callers on a scheduled task
/// should only use this before entering the reactor-managed phase of
/// startup, matching how the original's `TcpServer::bind` resolves
/// configured listen addresses once at startup.
pub fn lookup(host_port: &str) -> std::io::Result<Vec<Address>> {
    use std::net::ToSocketAddrs;
    Ok(host_port
        .to_socket_addrs()?
        .map(Address::from)
        .collect())
}

/// Like [`lookup`] but errors if no address matched, grounded in
/// `Address::LookupAny`.
pub fn lookup_any(host_port: &str) -> std::io::Result<Address> {
    lookup(host_port)?
        .into_iter()
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_round_trips_through_raw_sockaddr() {
        let addr = Address::V4("127.0.0.1:8080".parse().unwrap());
        let (bytes, len) = addr.to_raw();
        // Safety: `bytes`/`len` were just produced by `to_raw` above.
        let decoded = unsafe { Address::from_raw(bytes.as_ptr().cast(), len) }.unwrap();
        assert_eq!(addr, decoded);
    }

    #[test]
    fn unix_path_length_matches_offsetof_formula() {
        let addr = Address::unix("/tmp/weft.sock", false);
        let (_, len) = addr.to_raw();
        // offsetof(sun_path) + strlen(path) + 1 (trailing NUL for a
        // path-backed, non-abstract socket).
        assert_eq!(len as usize, SUN_PATH_OFFSET + "/tmp/weft.sock".len() + 1);
    }

    #[test]
    fn abstract_unix_path_has_no_trailing_nul_byte() {
        let addr = Address::unix("weft-abstract", true);
        let (_, len) = addr.to_raw();
        // +1 for the leading NUL that marks the abstract namespace, +0
        // trailing (abstract sockets are not NUL-terminated).
        assert_eq!(len as usize, SUN_PATH_OFFSET + 1 + "weft-abstract".len());
    }

    #[test]
    fn display_formats_each_variant() {
        assert_eq!(
            Address::V4("127.0.0.1:80".parse().unwrap()).to_string(),
            "127.0.0.1:80"
        );
        assert_eq!(Address::unix("/tmp/a.sock", false).to_string(), "unix:/tmp/a.sock");
    }
}
