//! Process-wide table of file-descriptor metadata, grounded in
//! `original_source/ljrServer/fd_manager.{h,cpp}`'s `FdCtx`/`FdManager`.
//!
//! The shim consults this table to decide whether a descriptor is a
//! socket worth intercepting and whether the caller has opted the fd
//! back into blocking semantics via `fcntl(F_SETFL)`.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Sentinel for "no timeout configured", matching the original's `-1`
/// cast to `uint64_t`.
pub const NO_TIMEOUT: u64 = u64::MAX;

/// Per-descriptor bookkeeping the shim needs to fake blocking semantics
/// on a reactor-driven nonblocking fd.
pub struct FdMeta {
    fd: i32,
    is_socket: bool,
    /// True once the caller has asked (via `fcntl`) for blocking
    /// behaviour again; the shim then skips interception for this fd.
    user_nonblock: AtomicU64,
    /// True if the fd itself carries `O_NONBLOCK` at the kernel level.
    sys_nonblock: AtomicU64,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl std::fmt::Debug for FdMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdMeta")
            .field("fd", &self.fd)
            .field("is_socket", &self.is_socket)
            .field("user_nonblock", &self.user_nonblock())
            .finish()
    }
}

impl FdMeta {
    fn new(fd: i32) -> Self {
        let mut is_socket = false;
        let mut sys_nonblock = false;

        // Safety: `libc::stat` is a plain-old-data struct; an all-zero
        // bit pattern is a valid value for it.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        // Safety: `fd` is a valid descriptor owned by the caller for the
        // duration of this call; `stat` is fully zeroed before use.
        let rc = unsafe { libc::fstat(fd, &mut stat) };
        if rc == 0 {
            is_socket = (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK;
        }

        if is_socket {
            // Safety: `fd` is valid; `F_GETFL` takes no further args.
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                // Safety: `fd` is valid; we only add `O_NONBLOCK` to the
                // flags just read, leaving every other bit untouched.
                unsafe {
                    libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                }
            }
            sys_nonblock = true;
        }

        Self {
            fd,
            is_socket,
            user_nonblock: AtomicU64::new(0),
            sys_nonblock: AtomicU64::new(sys_nonblock as u64),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        }
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire) != 0
    }

    pub fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v as u64, Ordering::Release);
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire) != 0
    }

    pub fn set_sys_nonblock(&self, v: bool) {
        self.sys_nonblock.store(v as u64, Ordering::Release);
    }

    /// Direction of a `SO_RCVTIMEO`/`SO_SNDTIMEO`-style timeout.
    pub fn timeout_ms(&self, dir: TimeoutDir) -> u64 {
        match dir {
            TimeoutDir::Recv => self.recv_timeout_ms.load(Ordering::Acquire),
            TimeoutDir::Send => self.send_timeout_ms.load(Ordering::Acquire),
        }
    }

    pub fn set_timeout_ms(&self, dir: TimeoutDir, ms: u64) {
        match dir {
            TimeoutDir::Recv => self.recv_timeout_ms.store(ms, Ordering::Release),
            TimeoutDir::Send => self.send_timeout_ms.store(ms, Ordering::Release),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TimeoutDir {
    Recv,
    Send,
}

/// The global fd table. Indexed by descriptor number, growing 1.5x like
/// the original's `std::vector<FdCtx::ptr>`.
pub struct FdRegistry {
    slots: RwLock<Vec<Option<Arc<FdMeta>>>>,
}

impl FdRegistry {
    const INITIAL_CAPACITY: usize = 64;

    fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::with_capacity(Self::INITIAL_CAPACITY)),
        }
    }

    /// Returns the metadata for `fd`, creating it (and probing the fd
    /// via `fstat`/`fcntl`) on first access when `auto_create` is set.
    pub fn get(&self, fd: i32, auto_create: bool) -> Option<Arc<FdMeta>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;

        {
            let slots = self.slots.read();
            if idx < slots.len() {
                if let Some(existing) = &slots[idx] {
                    return Some(existing.clone());
                }
                if !auto_create {
                    return None;
                }
            } else if !auto_create {
                return None;
            }
        }

        let mut slots = self.slots.write();
        if idx < slots.len() {
            if let Some(existing) = &slots[idx] {
                return Some(existing.clone());
            }
        } else {
            let new_len = ((idx + 1) as f64 * 1.5) as usize;
            slots.resize(new_len.max(idx + 1), None);
        }

        let meta = Arc::new(FdMeta::new(fd));
        slots[idx] = Some(meta.clone());
        Some(meta)
    }

    /// Drops the table's entry for `fd`, e.g. once `close(2)` has run.
    pub fn remove(&self, fd: i32) {
        if fd < 0 {
            return;
        }
        let idx = fd as usize;
        let mut slots = self.slots.write();
        if idx < slots.len() {
            slots[idx] = None;
        }
    }
}

static REGISTRY: std::sync::OnceLock<FdRegistry> = std::sync::OnceLock::new();

/// The process-wide fd registry, analogous to the original's
/// `Singleton<FdManager>`.
pub fn global() -> &'static FdRegistry {
    REGISTRY.get_or_init(FdRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn pipe_fd_is_not_a_socket() {
        let (r, _w) = {
            let mut fds = [0i32; 2];
            // Safety: `fds` is a valid two-element buffer for `pipe(2)`.
            unsafe { libc::pipe(fds.as_mut_ptr()) };
            (fds[0], fds[1])
        };
        let registry = FdRegistry::new();
        let meta = registry.get(r, true).unwrap();
        assert!(!meta.is_socket());
        assert_eq!(meta.timeout_ms(TimeoutDir::Recv), NO_TIMEOUT);
        // Safety: both fds are owned exclusively by this test.
        unsafe {
            libc::close(r);
            libc::close(_w);
        }
    }

    #[test]
    fn tcp_socket_is_flagged_and_nonblocking() {
        let sock = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = sock.as_raw_fd();
        let registry = FdRegistry::new();
        let meta = registry.get(fd, true).unwrap();
        assert!(meta.is_socket());
        assert!(meta.sys_nonblock());
    }

    #[test]
    fn missing_entry_without_auto_create_is_none() {
        let registry = FdRegistry::new();
        assert!(registry.get(999, false).is_none());
    }

    #[test]
    fn remove_clears_the_slot() {
        let sock = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = sock.as_raw_fd();
        let registry = FdRegistry::new();
        registry.get(fd, true).unwrap();
        registry.remove(fd);
        assert!(registry.get(fd, false).is_none());
    }
}
