//! Transparent blocking-syscall-to-cooperative-suspension shim, grounded
//! in `original_source/ljrServer/hook.{h,cpp}`.
//!
//! The original hooks libc symbols via `dlsym(RTLD_NEXT, ...)` so that
//! *any* code calling `read`/`write`/etc. from inside a scheduled fiber
//! is transparently redirected through the reactor. Symbol interposition
//! has no idiomatic Rust equivalent, so this module instead exposes an
//! explicit API: `weft_net`'s socket types call these functions directly
//! rather than `std::net`/raw `libc`. The observable contract the spec
//! cares about — a call that *looks* synchronous inside a task, but
//! cooperatively suspends instead of blocking the worker thread — is
//! unchanged; only the interception mechanism differs.
//!
//! [`scheduler::shim_enabled`] is the thread-local gate from spec.md
//! §4.6: off by default, turned on for the lifetime of a worker's
//! dispatch loop.

use crate::fd_registry::{self, TimeoutDir, NO_TIMEOUT};
use crate::reactor::{Reactor, EVENT_READ, EVENT_WRITE};
use crate::scheduler;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

static REACTOR: OnceLock<Weak<Reactor>> = OnceLock::new();

/// Binds the shim to the process's reactor. Must be called once during
/// runtime bring-up, before any worker thread starts dispatching tasks.
pub fn attach_reactor(reactor: &Arc<Reactor>) {
    let _ = REACTOR.set(Arc::downgrade(reactor));
}

fn try_reactor() -> Option<Arc<Reactor>> {
    REACTOR.get().and_then(Weak::upgrade)
}

fn reactor() -> Arc<Reactor> {
    try_reactor().expect("shim used before weft_core::shim::attach_reactor was called")
}

/// `tcp.connect.timeout` in milliseconds, default 5000. Lazily bound to
/// the `tcp.connect.timeout` config var on first use, mirroring the
/// original's file-static `g_tcp_connect_timeout = Config::Lookup(...)`
/// in `hook.cpp`; [`set_connect_timeout_ms`] remains for tests and for
/// callers that want to bypass the config layer entirely.
static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(5_000);

pub fn set_connect_timeout_ms(ms: u64) {
    CONNECT_TIMEOUT_MS.store(ms, Ordering::Relaxed);
}

fn connect_timeout_ms() -> u64 {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let var = weft_config::Config::lookup(
            "tcp.connect.timeout",
            5_000i32,
            "connect() timeout in milliseconds when the syscall shim is active",
        );
        CONNECT_TIMEOUT_MS.store(var.get().max(0) as u64, Ordering::Relaxed);
        var.add_listener(|_old, new| {
            CONNECT_TIMEOUT_MS.store((*new).max(0) as u64, Ordering::Relaxed);
        });
    });
    CONNECT_TIMEOUT_MS.load(Ordering::Relaxed)
}

fn set_errno(errno: i32) {
    // Safety: `__errno_location` returns a pointer to this thread's own
    // errno cell; writing it does not alias any other thread's state.
    unsafe {
        *libc::__errno_location() = errno;
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Generic retry-on-EAGAIN-via-reactor-suspension decision tree shared
/// by every intercepted read/write-shaped call. `syscall` must return a
/// libc-style result: `>= 0` on success, `-1` with `errno` set on error.
fn do_io(fd: i32, dir: TimeoutDir, mut syscall: impl FnMut() -> isize) -> isize {
    if !scheduler::shim_enabled() {
        return syscall();
    }
    let meta = match fd_registry::global().get(fd, false) {
        Some(m) => m,
        None => return syscall(),
    };
    if !meta.is_socket() || meta.user_nonblock() {
        return syscall();
    }
    let timeout_ms = meta.timeout_ms(dir);
    let event = match dir {
        TimeoutDir::Recv => EVENT_READ,
        TimeoutDir::Send => EVENT_WRITE,
    };

    loop {
        let n = syscall();
        if n >= 0 {
            return n;
        }
        let errno = last_errno();
        if errno == libc::EINTR {
            continue;
        }
        if errno != libc::EAGAIN && errno != libc::EWOULDBLOCK {
            return n;
        }

        let reactor = self::reactor();
        let cancelled = Arc::new(AtomicBool::new(false));
        let timer = if timeout_ms != NO_TIMEOUT {
            let weak_cancelled = Arc::downgrade(&cancelled);
            let cancelled_for_cb = cancelled.clone();
            let reactor_for_timer = reactor.clone();
            Some(reactor.add_conditional(
                timeout_ms,
                move || {
                    cancelled_for_cb.store(true, Ordering::SeqCst);
                    reactor_for_timer.cancel_event(fd, event);
                },
                weak_cancelled,
                false,
            ))
        } else {
            None
        };

        if reactor.add_event(fd, event, None).is_err() {
            if let Some(t) = timer {
                t.cancel();
            }
            return n;
        }

        crate::fiber::yield_hold();

        if cancelled.load(Ordering::SeqCst) {
            set_errno(libc::ETIMEDOUT);
            return -1;
        }
        if let Some(t) = timer {
            t.cancel();
        }
    }
}

fn sleep_ms(ms: u64) {
    if !scheduler::shim_enabled() {
        std::thread::sleep(Duration::from_millis(ms));
        return;
    }
    let fiber = match scheduler::current_fiber() {
        Some(f) => f,
        None => {
            std::thread::sleep(Duration::from_millis(ms));
            return;
        }
    };
    let reactor = self::reactor();
    let reactor_for_timer = reactor.clone();
    reactor.add_timer(ms, move || reactor_for_timer.reschedule_fiber(fiber), false);
    crate::fiber::yield_hold();
}

pub fn sleep(seconds: u32) -> u32 {
    sleep_ms(u64::from(seconds) * 1000);
    0
}

pub fn usleep(microseconds: u32) -> i32 {
    sleep_ms(u64::from(microseconds) / 1000);
    0
}

pub fn nanosleep(req: &libc::timespec) -> i32 {
    let ms = (req.tv_sec.max(0) as u64) * 1000 + (req.tv_nsec.max(0) as u64) / 1_000_000;
    sleep_ms(ms);
    0
}

pub fn socket(domain: i32, ty: i32, protocol: i32) -> i32 {
    // Safety: pass-through to libc with caller-supplied arguments; the
    // resulting fd, if any, is owned by the caller.
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd >= 0 {
        fd_registry::global().get(fd, true);
    }
    fd
}

pub fn close(fd: i32) -> i32 {
    if let Some(reactor) = try_reactor() {
        reactor.cancel_all(fd);
    }
    fd_registry::global().remove(fd);
    // Safety: `fd` is caller-owned; this is the only place it is closed.
    unsafe { libc::close(fd) }
}

pub fn accept(fd: i32, addr: *mut libc::sockaddr, addrlen: *mut libc::socklen_t) -> i32 {
    // Safety: `addr`/`addrlen` follow `accept(2)`'s contract; the caller
    // guarantees they are valid for the kernel to write through.
    let rc = do_io(fd, TimeoutDir::Recv, || unsafe {
        libc::accept(fd, addr, addrlen) as isize
    });
    if rc >= 0 {
        fd_registry::global().get(rc as i32, true);
    }
    rc as i32
}

pub fn connect(fd: i32, addr: *const libc::sockaddr, len: libc::socklen_t) -> i32 {
    // Safety: `addr` is valid for `len` bytes per `connect(2)`'s contract.
    let rc = unsafe { libc::connect(fd, addr, len) };
    if rc == 0 || !scheduler::shim_enabled() {
        return rc;
    }
    if last_errno() != libc::EINPROGRESS {
        return rc;
    }
    let meta = match fd_registry::global().get(fd, false) {
        Some(m) if m.is_socket() && !m.user_nonblock() => m,
        _ => return rc,
    };
    drop(meta);

    let reactor = self::reactor();
    let cancelled = Arc::new(AtomicBool::new(false));
    let weak_cancelled = Arc::downgrade(&cancelled);
    let cancelled_for_cb = cancelled.clone();
    let reactor_for_timer = reactor.clone();
    let timer = reactor.add_conditional(
        connect_timeout_ms(),
        move || {
            cancelled_for_cb.store(true, Ordering::SeqCst);
            reactor_for_timer.cancel_event(fd, EVENT_WRITE);
        },
        weak_cancelled,
        false,
    );

    if reactor.add_event(fd, EVENT_WRITE, None).is_err() {
        timer.cancel();
        return rc;
    }
    crate::fiber::yield_hold();

    if cancelled.load(Ordering::SeqCst) {
        set_errno(libc::ETIMEDOUT);
        return -1;
    }
    timer.cancel();

    let mut err: i32 = 0;
    let mut errlen = std::mem::size_of::<i32>() as libc::socklen_t;
    // Safety: `err`/`errlen` are valid stack-local buffers sized for the
    // `SO_ERROR` option per `getsockopt(2)`.
    unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            std::ptr::addr_of_mut!(err).cast(),
            &mut errlen,
        );
    }
    if err != 0 {
        set_errno(err);
        return -1;
    }
    0
}

pub fn read(fd: i32, buf: &mut [u8]) -> isize {
    do_io(fd, TimeoutDir::Recv, || {
        // Safety: `buf` is a valid, caller-owned buffer for the duration
        // of this call.
        unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) as isize }
    })
}

pub fn recv(fd: i32, buf: &mut [u8], flags: i32) -> isize {
    do_io(fd, TimeoutDir::Recv, || {
        // Safety: `buf` is a valid, caller-owned buffer for the duration
        // of this call.
        unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), flags) as isize }
    })
}

pub fn recvfrom(
    fd: i32,
    buf: &mut [u8],
    flags: i32,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> isize {
    do_io(fd, TimeoutDir::Recv, || {
        // Safety: `buf`/`src_addr`/`addrlen` follow `recvfrom(2)`'s
        // contract; the caller guarantees their validity.
        unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr().cast(),
                buf.len(),
                flags,
                src_addr,
                addrlen,
            ) as isize
        }
    })
}

pub fn recvmsg(fd: i32, msg: &mut libc::msghdr, flags: i32) -> isize {
    do_io(fd, TimeoutDir::Recv, || {
        // Safety: `msg` follows `recvmsg(2)`'s contract; the caller
        // guarantees its `iov`/`name` buffers are valid.
        unsafe { libc::recvmsg(fd, msg, flags) as isize }
    })
}

pub fn readv(fd: i32, iov: &[libc::iovec]) -> isize {
    do_io(fd, TimeoutDir::Recv, || {
        // Safety: `iov` follows `readv(2)`'s contract; the caller
        // guarantees each buffer it describes is valid.
        unsafe { libc::readv(fd, iov.as_ptr(), iov.len() as i32) as isize }
    })
}

pub fn write(fd: i32, buf: &[u8]) -> isize {
    do_io(fd, TimeoutDir::Send, || {
        // Safety: `buf` is a valid, caller-owned buffer for the duration
        // of this call.
        unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) as isize }
    })
}

pub fn send(fd: i32, buf: &[u8], flags: i32) -> isize {
    do_io(fd, TimeoutDir::Send, || {
        // Safety: `buf` is a valid, caller-owned buffer for the duration
        // of this call.
        unsafe { libc::send(fd, buf.as_ptr().cast(), buf.len(), flags) as isize }
    })
}

pub fn sendto(
    fd: i32,
    buf: &[u8],
    flags: i32,
    dest_addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> isize {
    do_io(fd, TimeoutDir::Send, || {
        // Safety: `buf`/`dest_addr` follow `sendto(2)`'s contract; the
        // caller guarantees their validity.
        unsafe {
            libc::sendto(
                fd,
                buf.as_ptr().cast(),
                buf.len(),
                flags,
                dest_addr,
                addrlen,
            ) as isize
        }
    })
}

pub fn sendmsg(fd: i32, msg: &libc::msghdr, flags: i32) -> isize {
    do_io(fd, TimeoutDir::Send, || {
        // Safety: `msg` follows `sendmsg(2)`'s contract; the caller
        // guarantees its `iov`/`name` buffers are valid.
        unsafe { libc::sendmsg(fd, msg, flags) as isize }
    })
}

pub fn writev(fd: i32, iov: &[libc::iovec]) -> isize {
    do_io(fd, TimeoutDir::Send, || {
        // Safety: `iov` follows `writev(2)`'s contract; the caller
        // guarantees each buffer it describes is valid.
        unsafe { libc::writev(fd, iov.as_ptr(), iov.len() as i32) as isize }
    })
}

/// `fcntl(fd, F_SETFL, flags)` through the shim: the kernel always keeps
/// `O_NONBLOCK` set on a registered socket, while `user_nonblock` tracks
/// what the caller asked for.
pub fn fcntl_setfl(fd: i32, flags: i32) -> i32 {
    if let Some(meta) = fd_registry::global().get(fd, false) {
        if meta.is_socket() {
            meta.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
            let kernel_flags = flags | libc::O_NONBLOCK;
            // Safety: `fd` is caller-owned and valid.
            return unsafe { libc::fcntl(fd, libc::F_SETFL, kernel_flags) };
        }
    }
    // Safety: `fd` is caller-owned and valid.
    unsafe { libc::fcntl(fd, libc::F_SETFL, flags) }
}

/// `fcntl(fd, F_GETFL)` through the shim: reports `user_nonblock`, not
/// the kernel's always-on `O_NONBLOCK`, for a registered socket.
pub fn fcntl_getfl(fd: i32) -> i32 {
    // Safety: `fd` is caller-owned and valid.
    let kernel_flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if kernel_flags < 0 {
        return kernel_flags;
    }
    match fd_registry::global().get(fd, false) {
        Some(meta) if meta.is_socket() => {
            if meta.user_nonblock() {
                kernel_flags | libc::O_NONBLOCK
            } else {
                kernel_flags & !libc::O_NONBLOCK
            }
        }
        _ => kernel_flags,
    }
}

/// `ioctl(fd, FIONBIO, &value)` through the shim: tracked the same way
/// as `fcntl(F_SETFL, O_NONBLOCK)`, per spec.md §4.5.
pub fn ioctl_fionbio(fd: i32, value: i32) -> i32 {
    if let Some(meta) = fd_registry::global().get(fd, false) {
        if meta.is_socket() {
            meta.set_user_nonblock(value != 0);
            return 0;
        }
    }
    let mut v = value;
    // Safety: `fd` is caller-owned; `v` is a valid `int*` for FIONBIO.
    unsafe { libc::ioctl(fd, libc::FIONBIO, &mut v) }
}

/// `setsockopt(fd, SOL_SOCKET, SO_RCVTIMEO|SO_SNDTIMEO, ...)` through the
/// shim: updates the registry so `do_io` picks up the new timeout, and
/// still calls through to the OS so native blocking calls see it too.
pub fn setsockopt_timeout(fd: i32, dir: TimeoutDir, timeout: libc::timeval) -> i32 {
    let ms = (timeout.tv_sec.max(0) as u64) * 1000 + (timeout.tv_usec.max(0) as u64) / 1000;
    if let Some(meta) = fd_registry::global().get(fd, true) {
        meta.set_timeout_ms(dir, if ms == 0 { NO_TIMEOUT } else { ms });
    }
    let opt = match dir {
        TimeoutDir::Recv => libc::SO_RCVTIMEO,
        TimeoutDir::Send => libc::SO_SNDTIMEO,
    };
    // Safety: `fd` is caller-owned; `timeout` lives on this stack frame
    // for the duration of the call, matching `setsockopt(2)`'s contract.
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            std::ptr::addr_of!(timeout).cast(),
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    }
}

/// `getsockopt(fd, SOL_SOCKET, SO_RCVTIMEO|SO_SNDTIMEO, ...)` through the
/// shim: returns the registry's view, which always reflects the last
/// `setsockopt_timeout` call.
pub fn getsockopt_timeout(fd: i32, dir: TimeoutDir) -> libc::timeval {
    let ms = fd_registry::global()
        .get(fd, false)
        .map(|m| m.timeout_ms(dir))
        .filter(|ms| *ms != NO_TIMEOUT)
        .unwrap_or(0);
    libc::timeval {
        tv_sec: (ms / 1000) as libc::time_t,
        tv_usec: ((ms % 1000) * 1000) as libc::suseconds_t,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shim_off_outside_a_worker_delegates_immediately() {
        assert!(!scheduler::shim_enabled());
        let mut buf = [0u8; 1];
        let (r, w) = {
            let mut fds = [0i32; 2];
            // Safety: `fds` is a valid two-element buffer for `pipe(2)`.
            unsafe { libc::pipe(fds.as_mut_ptr()) };
            (fds[0], fds[1])
        };
        // Safety: `w` was just created above and is written exactly once.
        unsafe {
            libc::write(w, b"x".as_ptr().cast(), 1);
        }
        let n = read(r, &mut buf);
        assert_eq!(n, 1);
        assert_eq!(buf[0], b'x');
        // Safety: both fds are owned exclusively by this test.
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn setsockopt_then_getsockopt_round_trips_through_the_registry() {
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);
        let timeout = libc::timeval { tv_sec: 2, tv_usec: 500_000 };
        assert_eq!(setsockopt_timeout(fd, TimeoutDir::Recv, timeout), 0);
        let got = getsockopt_timeout(fd, TimeoutDir::Recv);
        assert_eq!(got.tv_sec, 2);
        assert_eq!(got.tv_usec, 500_000);
        close(fd);
    }

    #[test]
    fn fcntl_getfl_reports_user_intent_not_kernel_flags() {
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);
        assert_eq!(fcntl_setfl(fd, libc::O_NONBLOCK), 0);
        assert_ne!(fcntl_getfl(fd) & libc::O_NONBLOCK, 0);
        assert_eq!(fcntl_setfl(fd, 0), 0);
        assert_eq!(fcntl_getfl(fd) & libc::O_NONBLOCK, 0);
        // Safety: `fd` is caller-owned by this test; kernel-level flags
        // still carry O_NONBLOCK even though user intent now says "off".
        let kernel_flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert_ne!(kernel_flags & libc::O_NONBLOCK, 0);
        close(fd);
    }
}
