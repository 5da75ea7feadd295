//! Socket wrapper, grounded in `original_source/ljrServer/socket.{h,cpp}`.
//!
//! Every blocking-shaped call goes through [`weft_core::shim`] rather
//! than `std::net`, so a `Socket` used from inside a scheduled task
//! cooperatively suspends on the reactor instead of blocking its
//! worker thread — the same contract the original gets from hooking
//! libc, reached here through the shim's explicit API instead.

use crate::address::Address;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;
use weft_core::fd_registry::TimeoutDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Tcp,
    Udp,
}

impl Type {
    fn raw(self) -> i32 {
        match self {
            Type::Tcp => libc::SOCK_STREAM,
            Type::Udp => libc::SOCK_DGRAM,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Inet,
    Inet6,
    Unix,
}

impl Family {
    fn raw(self) -> i32 {
        match self {
            Family::Inet => libc::AF_INET,
            Family::Inet6 => libc::AF_INET6,
            Family::Unix => libc::AF_UNIX,
        }
    }
}

/// An owned socket file descriptor. The descriptor is closed through
/// [`weft_core::shim::close`] on drop, which also cancels any pending
/// reactor registrations for it.
#[derive(Debug)]
pub struct Socket {
    fd: RawFd,
    family: Family,
    ty: Type,
    connected: bool,
}

impl Socket {
    pub fn new(family: Family, ty: Type) -> io::Result<Self> {
        let fd = weft_core::shim::socket(family.raw(), ty.raw(), 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Socket {
            fd,
            family,
            ty,
            connected: false,
        })
    }

    pub fn create_tcp(address: &Address) -> io::Result<Self> {
        let family = match address {
            Address::V4(_) => Family::Inet,
            Address::V6(_) => Family::Inet6,
            Address::Unix { .. } => Family::Unix,
        };
        Self::new(family, Type::Tcp)
    }

    pub fn create_udp(address: &Address) -> io::Result<Self> {
        let family = match address {
            Address::V4(_) => Family::Inet,
            Address::V6(_) => Family::Inet6,
            Address::Unix { .. } => Family::Unix,
        };
        Self::new(family, Type::Udp)
    }

    /// Wraps an already-open fd, e.g. one returned by [`Socket::accept`].
    fn from_raw(fd: RawFd, family: Family, ty: Type, connected: bool) -> Self {
        Socket {
            fd,
            family,
            ty,
            connected,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn kind(&self) -> Type {
        self.ty
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn bind(&self, addr: &Address) -> io::Result<()> {
        let (buf, len) = addr.to_raw();
        // Safety: `buf` holds a `len`-byte `sockaddr` built by `Address::to_raw`.
        let rc = unsafe { libc::bind(self.fd, buf.as_ptr().cast(), len) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        // Safety: `self.fd` is owned by this socket and open.
        let rc = unsafe { libc::listen(self.fd, backlog) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Suspends the current task until a connection arrives, then
    /// returns the accepted peer as a new connected [`Socket`].
    pub fn accept(&self) -> io::Result<Socket> {
        // Safety: `sockaddr_storage` is a plain-old-data struct; an
        // all-zero bit pattern is a valid value for it.
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = weft_core::shim::accept(
            self.fd,
            std::ptr::addr_of_mut!(storage).cast(),
            &mut len,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Socket::from_raw(fd, self.family, self.ty, true))
    }

    /// Suspends the current task until the connection completes or
    /// `tcp.connect.timeout` elapses.
    pub fn connect(&mut self, addr: &Address) -> io::Result<()> {
        let (buf, len) = addr.to_raw();
        let rc = weft_core::shim::connect(self.fd, buf.as_ptr().cast(), len);
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        self.connected = true;
        Ok(())
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let n = weft_core::shim::send(self.fd, buf, 0);
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = weft_core::shim::recv(self.fd, buf, 0);
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub fn send_timeout(&self) -> Duration {
        let tv = weft_core::shim::getsockopt_timeout(self.fd, TimeoutDir::Send);
        Duration::new(tv.tv_sec.max(0) as u64, (tv.tv_usec.max(0) as u32) * 1000)
    }

    pub fn set_send_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.set_timeout(TimeoutDir::Send, timeout)
    }

    pub fn recv_timeout(&self) -> Duration {
        let tv = weft_core::shim::getsockopt_timeout(self.fd, TimeoutDir::Recv);
        Duration::new(tv.tv_sec.max(0) as u64, (tv.tv_usec.max(0) as u32) * 1000)
    }

    pub fn set_recv_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.set_timeout(TimeoutDir::Recv, timeout)
    }

    fn set_timeout(&self, dir: TimeoutDir, timeout: Duration) -> io::Result<()> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let rc = weft_core::shim::setsockopt_timeout(self.fd, dir, tv);
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn local_address(&self) -> io::Result<Address> {
        // Safety: `sockaddr_storage` is a plain-old-data struct; an
        // all-zero bit pattern is a valid value for it.
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        // Safety: `storage`/`len` are valid out-parameters for `getsockname(2)`.
        let rc = unsafe {
            libc::getsockname(self.fd, std::ptr::addr_of_mut!(storage).cast(), &mut len)
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: the kernel just populated `storage` with `len` valid bytes.
        unsafe { Address::from_raw(std::ptr::addr_of!(storage).cast(), len) }
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "unsupported address family"))
    }

    pub fn remote_address(&self) -> io::Result<Address> {
        // Safety: `sockaddr_storage` is a plain-old-data struct; an
        // all-zero bit pattern is a valid value for it.
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        // Safety: `storage`/`len` are valid out-parameters for `getpeername(2)`.
        let rc = unsafe {
            libc::getpeername(self.fd, std::ptr::addr_of_mut!(storage).cast(), &mut len)
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: the kernel just populated `storage` with `len` valid bytes.
        unsafe { Address::from_raw(std::ptr::addr_of!(storage).cast(), len) }
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "unsupported address family"))
    }

    pub fn error(&self) -> i32 {
        let mut err: i32 = 0;
        let mut len = std::mem::size_of::<i32>() as libc::socklen_t;
        // Safety: `err`/`len` are a valid out-parameter pair for `SO_ERROR`.
        unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                std::ptr::addr_of_mut!(err).cast(),
                &mut len,
            );
        }
        err
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if self.fd >= 0 {
            weft_core::shim::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_socket_binds_to_loopback_ephemeral_port() {
        let sock = Socket::new(Family::Inet, Type::Tcp).unwrap();
        let addr = Address::V4("127.0.0.1:0".parse().unwrap());
        sock.bind(&addr).unwrap();
        sock.listen(16).unwrap();
        let local = sock.local_address().unwrap();
        match local {
            Address::V4(a) => assert_ne!(a.port(), 0),
            other => panic!("unexpected address kind: {other:?}"),
        }
    }

    #[test]
    fn send_and_recv_timeout_round_trip_through_shim() {
        let sock = Socket::new(Family::Inet, Type::Udp).unwrap();
        let timeout = Duration::from_millis(250);
        sock.set_recv_timeout(timeout).unwrap();
        let got = sock.recv_timeout();
        assert_eq!(got.as_millis(), 250);
    }
}
