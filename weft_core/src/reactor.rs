//! Edge-triggered epoll reactor, grounded in
//! `original_source/ljrServer/iomanager.{h,cpp}`'s `IOManager`.
//!
//! The reactor is the scheduler's idle task (see [`crate::scheduler`]):
//! whenever a worker finds the shared queue empty, it resumes the
//! reactor's loop instead of spinning. A single [`Reactor`] is shared by
//! every worker thread, matching the original's single `m_epollfd`
//! polled from whichever worker thread happens to go idle.
//!
//! Departure from the original: `delEvent` there calls `triggerEvent`
//! despite its doc comment promising it would not; [`Reactor::del_event`]
//! here genuinely does not trigger, while [`Reactor::cancel_event`] does.
//! Both still clear the kernel registration and the slot.

use crate::scheduler::{current_fiber, Scheduler, WorkItem};
use crate::timer::{TimerHandle, TimerSet};
use log::warn;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Readiness bit for "ready to read", matching `EPOLLIN`.
pub const EVENT_READ: u32 = libc::EPOLLIN as u32;
/// Readiness bit for "ready to write", matching `EPOLLOUT`.
pub const EVENT_WRITE: u32 = libc::EPOLLOUT as u32;

const HARD_MAX_TIMEOUT_MS: i32 = 5000;
const MAX_EVENTS_PER_WAIT: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error("fd {0} already has event {1:#x} registered")]
    AlreadyRegistered(i32, u32),
    #[error("epoll_ctl failed: {0}")]
    EpollCtl(#[source] std::io::Error),
    #[error("add_event with no callback called outside a running task")]
    NoCurrentTask,
}

enum EventAction {
    Fiber(Arc<crate::fiber::Fiber>),
    Closure(Box<dyn FnOnce() + Send>),
}

#[derive(Default)]
struct EventSlot {
    action: Option<EventAction>,
}

struct FdContextInner {
    events: u32,
    read: EventSlot,
    write: EventSlot,
}

struct FdContextState {
    inner: Mutex<FdContextInner>,
}

/// Single-epoll-instance reactor shared by every worker of a [`Scheduler`].
pub struct Reactor {
    epoll_fd: i32,
    tickle_r: i32,
    tickle_w: i32,
    fd_contexts: RwLock<Vec<Option<Arc<FdContextState>>>>,
    pending_event_count: AtomicUsize,
    timers: Mutex<TimerSet>,
    scheduler: OnceLock<Weak<Scheduler>>,
}

impl Reactor {
    /// Creates the epoll instance and its self-pipe tickle primitive.
    ///
    /// The returned reactor is not yet usable for event dispatch until
    /// [`Reactor::attach_scheduler`] is called, since triggered events
    /// are rescheduled through that scheduler.
    pub fn new() -> Arc<Self> {
        // Safety: `epoll_create1` has no preconditions; the returned fd
        // is owned exclusively by this reactor and closed in `Drop`.
        let epoll_fd = unsafe { libc::epoll_create1(0) };
        assert!(
            epoll_fd >= 0,
            "epoll_create1 failed: {}",
            std::io::Error::last_os_error()
        );

        let mut fds = [0i32; 2];
        // Safety: `fds` is a valid two-element buffer for `pipe(2)`.
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert!(rc == 0, "pipe() failed: {}", std::io::Error::last_os_error());
        let (tickle_r, tickle_w) = (fds[0], fds[1]);

        // Safety: `tickle_r` was just created above and is not shared
        // with any other code yet.
        let flags = unsafe { libc::fcntl(tickle_r, libc::F_GETFL, 0) };
        // Safety: only the `O_NONBLOCK` bit is added to flags just read.
        unsafe {
            libc::fcntl(tickle_r, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }

        let mut reg_event = libc::epoll_event {
            events: EVENT_READ | libc::EPOLLET as u32,
            u64: tickle_r as u64,
        };
        // Safety: `epoll_fd` and `tickle_r` are both freshly created,
        // valid descriptors; `reg_event` lives for the duration of the
        // call.
        let rc = unsafe {
            libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, tickle_r, &mut reg_event)
        };
        assert!(
            rc == 0,
            "epoll_ctl(tickle) failed: {}",
            std::io::Error::last_os_error()
        );

        Arc::new_cyclic(|weak: &Weak<Reactor>| {
            let weak_for_timer = weak.clone();
            Reactor {
                epoll_fd,
                tickle_r,
                tickle_w,
                fd_contexts: RwLock::new(Vec::new()),
                pending_event_count: AtomicUsize::new(0),
                timers: Mutex::new(TimerSet::new(move || {
                    if let Some(r) = weak_for_timer.upgrade() {
                        r.tickle();
                    }
                })),
                scheduler: OnceLock::new(),
            }
        })
    }

    /// Binds this reactor to the scheduler whose idle task it serves.
    /// Must be called before any event fires.
    pub fn attach_scheduler(&self, scheduler: Weak<Scheduler>) {
        let _ = self.scheduler.set(scheduler);
    }

    fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler
            .get()
            .expect("reactor used before attach_scheduler")
            .upgrade()
            .expect("scheduler dropped while reactor still alive")
    }

    /// Writes one byte to the self-pipe, waking an `epoll_wait` blocked
    /// in the idle loop. Safe to call from any thread.
    pub fn tickle(&self) {
        let byte = [b'T'];
        // Safety: `tickle_w` is a valid pipe write end for the reactor's
        // lifetime; a short write of one byte cannot partially fail.
        unsafe {
            libc::write(self.tickle_w, byte.as_ptr().cast(), 1);
        }
    }

    fn drain_tickle(&self) {
        let mut buf = [0u8; 1];
        loop {
            // Safety: `tickle_r` is nonblocking; EAGAIN/short read ends
            // the loop instead of blocking.
            let rc = unsafe { libc::read(self.tickle_r, buf.as_mut_ptr().cast(), 1) };
            if rc != 1 {
                break;
            }
        }
    }

    fn get_fd_context(&self, fd: i32) -> Option<Arc<FdContextState>> {
        if fd < 0 {
            return None;
        }
        let contexts = self.fd_contexts.read();
        contexts.get(fd as usize).and_then(|c| c.clone())
    }

    fn get_or_create_fd_context(&self, fd: i32) -> Arc<FdContextState> {
        let idx = fd as usize;
        if let Some(ctx) = self.get_fd_context(fd) {
            return ctx;
        }

        let mut contexts = self.fd_contexts.write();
        if idx >= contexts.len() {
            let new_len = ((idx + 1) as f64 * 1.5) as usize;
            contexts.resize_with(new_len.max(idx + 1), || None);
        }
        contexts[idx]
            .get_or_insert_with(|| {
                Arc::new(FdContextState {
                    inner: Mutex::new(FdContextInner {
                        events: 0,
                        read: EventSlot::default(),
                        write: EventSlot::default(),
                    }),
                })
            })
            .clone()
    }

    /// Registers interest in `event` (exactly one of [`EVENT_READ`] or
    /// [`EVENT_WRITE`]) on `fd`. With `cb = None`, the currently running
    /// task is captured and re-enqueued when the event fires; the
    /// caller must yield-hold immediately afterward.
    pub fn add_event(
        &self,
        fd: i32,
        event: u32,
        cb: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<(), ReactorError> {
        debug_assert!(
            event == EVENT_READ || event == EVENT_WRITE,
            "add_event takes exactly one of EVENT_READ/EVENT_WRITE"
        );

        let action = match cb {
            Some(cb) => EventAction::Closure(cb),
            None => EventAction::Fiber(current_fiber().ok_or(ReactorError::NoCurrentTask)?),
        };

        let ctx = self.get_or_create_fd_context(fd);
        let mut inner = ctx.inner.lock();
        if inner.events & event != 0 {
            return Err(ReactorError::AlreadyRegistered(fd, event));
        }

        let op = if inner.events != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let new_mask = inner.events | event;
        let mut epevent = libc::epoll_event {
            events: new_mask | libc::EPOLLET as u32,
            u64: fd as u64,
        };
        // Safety: `fd` is caller-owned and valid for the call's
        // duration; `epevent` lives on this stack frame.
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut epevent) };
        if rc != 0 {
            return Err(ReactorError::EpollCtl(std::io::Error::last_os_error()));
        }

        inner.events = new_mask;
        if event == EVENT_READ {
            inner.read.action = Some(action);
        } else {
            inner.write.action = Some(action);
        }
        drop(inner);
        self.pending_event_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn remove_event(&self, fd: i32, event: u32, trigger: bool) -> bool {
        let ctx = match self.get_fd_context(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let action = {
            let mut inner = ctx.inner.lock();
            if inner.events & event == 0 {
                return false;
            }

            let new_mask = inner.events & !event;
            let op = if new_mask != 0 {
                libc::EPOLL_CTL_MOD
            } else {
                libc::EPOLL_CTL_DEL
            };
            let mut epevent = libc::epoll_event {
                events: new_mask | libc::EPOLLET as u32,
                u64: fd as u64,
            };
            // Safety: `fd` was already registered with this epoll
            // instance; `epevent` lives on this stack frame.
            let rc = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut epevent) };
            if rc != 0 {
                warn!(
                    "epoll_ctl failed removing fd {fd} event {event:#x}: {}",
                    std::io::Error::last_os_error()
                );
                return false;
            }
            inner.events = new_mask;
            if event == EVENT_READ {
                inner.read.action.take()
            } else {
                inner.write.action.take()
            }
        };

        self.pending_event_count.fetch_sub(1, Ordering::AcqRel);
        if trigger {
            if let Some(action) = action {
                self.dispatch_action(action);
            }
        }
        true
    }

    /// Removes `event` from `fd`'s kernel registration without
    /// triggering the pending waiter's continuation.
    pub fn del_event(&self, fd: i32, event: u32) -> bool {
        self.remove_event(fd, event, false)
    }

    /// Like [`Reactor::del_event`] but also triggers the pending
    /// waiter, as though the event had actually fired.
    pub fn cancel_event(&self, fd: i32, event: u32) -> bool {
        self.remove_event(fd, event, true)
    }

    /// Cancels both directions registered on `fd`, triggering both
    /// pending waiters, and removes the kernel registration entirely.
    pub fn cancel_all(&self, fd: i32) -> bool {
        let ctx = match self.get_fd_context(fd) {
            Some(ctx) => ctx,
            None => return false,
        };

        let (read_action, write_action, had_any) = {
            let mut inner = ctx.inner.lock();
            if inner.events == 0 {
                return false;
            }
            let mut epevent = libc::epoll_event { events: 0, u64: fd as u64 };
            // Safety: `fd` is registered (non-zero events checked
            // above); `epevent` lives on this stack frame.
            let rc = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, &mut epevent) };
            if rc != 0 {
                warn!(
                    "epoll_ctl failed cancelling fd {fd}: {}",
                    std::io::Error::last_os_error()
                );
                return false;
            }
            let read_action = if inner.events & EVENT_READ != 0 {
                inner.read.action.take()
            } else {
                None
            };
            let write_action = if inner.events & EVENT_WRITE != 0 {
                inner.write.action.take()
            } else {
                None
            };
            inner.events = 0;
            (read_action, write_action, true)
        };

        let mut fired = 0;
        if let Some(action) = read_action {
            self.dispatch_action(action);
            fired += 1;
        }
        if let Some(action) = write_action {
            self.dispatch_action(action);
            fired += 1;
        }
        self.pending_event_count.fetch_sub(fired, Ordering::AcqRel);
        had_any
    }

    /// Re-enqueues `fiber` on the attached scheduler. Used by the
    /// syscall shim's `sleep`/`usleep`/`nanosleep` to resume a task from
    /// a plain timer, with no fd or event involved.
    pub fn reschedule_fiber(&self, fiber: Arc<crate::fiber::Fiber>) {
        self.scheduler().schedule_fiber(fiber, None);
    }

    fn dispatch_action(&self, action: EventAction) {
        let scheduler = self.scheduler();
        match action {
            EventAction::Fiber(fiber) => scheduler.schedule_fiber(fiber, None),
            EventAction::Closure(cb) => scheduler.schedule_closure(cb, None),
        }
    }

    /// Number of event registrations still awaiting a wakeup; part of
    /// the scheduler's stopping condition.
    pub fn pending_event_count(&self) -> usize {
        self.pending_event_count.load(Ordering::Acquire)
    }

    /// Schedules `cb` to run `ms` milliseconds from now.
    pub fn add_timer(
        &self,
        ms: u64,
        cb: impl FnOnce() + Send + 'static,
        recurring: bool,
    ) -> TimerHandle {
        self.timers.lock().add_timer(ms, cb, recurring)
    }

    /// Like [`Reactor::add_timer`] but the callback is skipped if
    /// `condition` no longer upgrades at fire time.
    pub fn add_conditional<T: Send + Sync + 'static>(
        &self,
        ms: u64,
        cb: impl FnOnce() + Send + 'static,
        condition: Weak<T>,
        recurring: bool,
    ) -> TimerHandle {
        self.timers.lock().add_conditional(ms, cb, condition, recurring)
    }

    /// Recomputes `handle`'s deadline; see [`TimerHandle::reset`].
    pub fn reset_timer(&self, handle: &TimerHandle, ms: u64, from_now: bool) -> bool {
        handle.reset(&mut self.timers.lock(), ms, from_now)
    }

    /// The reactor's idle-task loop, run once per worker that goes
    /// idle. Blocks in `epoll_wait` up to `min(next_timer, HARD_MAX)`
    /// milliseconds, fires expired timers and ready fd events, then
    /// yields back to the scheduler.
    pub(crate) fn run_idle_loop(&self) {
        // Safety: `libc::epoll_event` is a plain-old-data struct of
        // integers; the all-zero bit pattern is a valid instance.
        let mut events_buf: Vec<libc::epoll_event> =
            vec![unsafe { std::mem::zeroed() }; MAX_EVENTS_PER_WAIT];
        let scheduler = self.scheduler();

        loop {
            let next_timeout = self.timers.lock().next_timeout();
            let pending = self.pending_event_count() > 0;
            if scheduler.is_stopping() && next_timeout.is_none() && !pending {
                break;
            }

            let timeout_ms = match next_timeout {
                Some(ms) => ms.min(HARD_MAX_TIMEOUT_MS as u64) as i32,
                None => HARD_MAX_TIMEOUT_MS,
            };

            let n = loop {
                // Safety: `events_buf` has `MAX_EVENTS_PER_WAIT`
                // capacity, matching the length passed below.
                let rc = unsafe {
                    libc::epoll_wait(
                        self.epoll_fd,
                        events_buf.as_mut_ptr(),
                        events_buf.len() as i32,
                        timeout_ms,
                    )
                };
                if rc < 0 {
                    let err = std::io::Error::last_os_error();
                    if err.kind() == std::io::ErrorKind::Interrupted {
                        continue;
                    }
                    warn!("epoll_wait failed: {err}");
                    break 0;
                }
                break rc;
            };

            let expired = self.timers.lock().collect_expired();
            if !expired.is_empty() {
                scheduler.schedule_batch(expired.into_iter().map(WorkItem::Closure), None);
            }

            for event in &events_buf[..n as usize] {
                let fd = event.u64 as i32;
                if fd == self.tickle_r {
                    self.drain_tickle();
                    continue;
                }
                self.handle_ready_fd(fd, event.events);
            }

            crate::fiber::yield_hold();
        }
    }

    fn handle_ready_fd(&self, fd: i32, kernel_events: u32) {
        let ctx = match self.get_fd_context(fd) {
            Some(ctx) => ctx,
            None => return,
        };

        let mut kernel_events = kernel_events;
        if kernel_events & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0 {
            kernel_events |= libc::EPOLLIN as u32 | libc::EPOLLOUT as u32;
        }

        let (actions, remaining) = {
            let mut inner = ctx.inner.lock();
            let mut real = 0u32;
            if kernel_events & libc::EPOLLIN as u32 != 0 {
                real |= EVENT_READ;
            }
            if kernel_events & libc::EPOLLOUT as u32 != 0 {
                real |= EVENT_WRITE;
            }
            real &= inner.events;
            if real == 0 {
                return;
            }

            let remaining = inner.events & !real;
            let op = if remaining != 0 {
                libc::EPOLL_CTL_MOD
            } else {
                libc::EPOLL_CTL_DEL
            };
            let mut epevent = libc::epoll_event {
                events: remaining | libc::EPOLLET as u32,
                u64: fd as u64,
            };
            // Safety: `fd` is registered with this epoll instance
            // (`real != 0` was just checked); `epevent` is stack-local.
            let rc = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut epevent) };
            if rc != 0 {
                warn!(
                    "epoll_ctl failed clearing fd {fd}: {}",
                    std::io::Error::last_os_error()
                );
                return;
            }
            inner.events = remaining;

            let mut actions = Vec::with_capacity(2);
            if real & EVENT_READ != 0 {
                if let Some(a) = inner.read.action.take() {
                    actions.push(a);
                }
            }
            if real & EVENT_WRITE != 0 {
                if let Some(a) = inner.write.action.take() {
                    actions.push(a);
                }
            }
            (actions, remaining)
        };
        let _ = remaining;

        let fired = actions.len();
        for action in actions {
            self.dispatch_action(action);
        }
        self.pending_event_count.fetch_sub(fired, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("epoll_fd", &self.epoll_fd)
            .field("pending_events", &self.pending_event_count())
            .finish()
    }
}

impl std::fmt::Debug for ReactorIdle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorIdle").finish()
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        // Safety: all three descriptors are owned exclusively by this
        // reactor and not referenced after this point.
        unsafe {
            libc::close(self.epoll_fd);
            libc::close(self.tickle_r);
            libc::close(self.tickle_w);
        }
    }
}

/// Adapts a shared [`Reactor`] into the [`crate::scheduler::IdleTask`]
/// every worker parks on when the run queue is empty.
pub struct ReactorIdle {
    reactor: Arc<Reactor>,
}

impl ReactorIdle {
    pub fn new(reactor: Arc<Reactor>) -> Self {
        Self { reactor }
    }
}

impl crate::scheduler::IdleTask for ReactorIdle {
    fn run(&self) {
        self.reactor.run_idle_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::os::unix::io::AsRawFd;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn build(
        workers: usize,
    ) -> (Arc<Reactor>, Arc<Scheduler>) {
        let reactor = Reactor::new();
        let reactor_for_tickle = reactor.clone();
        let reactor_for_idle = reactor.clone();
        let scheduler = Arc::new(Scheduler::new(
            workers,
            false,
            move || reactor_for_tickle.tickle(),
            move |_| Box::new(ReactorIdle::new(reactor_for_idle.clone())),
        ));
        reactor.attach_scheduler(Arc::downgrade(&scheduler));
        scheduler.start();
        (reactor, scheduler)
    }

    #[test]
    fn socket_becomes_readable_after_peer_write() {
        let (reactor, scheduler) = build(1);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_thread = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            std::thread::sleep(Duration::from_millis(20));
            use std::io::Write;
            sock.write_all(b"hi").unwrap();
        });

        let client = std::net::TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        let fd = client.as_raw_fd();

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        reactor
            .add_event(
                fd,
                EVENT_READ,
                Some(Box::new(move || {
                    fired2.store(true, Ordering::SeqCst);
                })),
            )
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !fired.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(fired.load(Ordering::SeqCst));

        accept_thread.join().unwrap();
        scheduler.stop();
    }

    #[test]
    fn cancel_event_triggers_immediately() {
        let (reactor, scheduler) = build(1);

        let (r, _w) = {
            let mut raw = [0i32; 2];
            // Safety: `raw` is a valid two-element buffer for `pipe(2)`.
            unsafe { libc::pipe(raw.as_mut_ptr()) };
            (raw[0], raw[1])
        };

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        reactor
            .add_event(
                r,
                EVENT_READ,
                Some(Box::new(move || {
                    fired2.store(true, Ordering::SeqCst);
                })),
            )
            .unwrap();

        assert!(reactor.cancel_event(r, EVENT_READ));

        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while !fired.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(fired.load(Ordering::SeqCst));

        scheduler.stop();
        // Safety: both fds are owned exclusively by this test.
        unsafe {
            libc::close(r);
            libc::close(_w);
        }
    }

    #[test]
    fn del_event_does_not_trigger() {
        let (reactor, scheduler) = build(1);

        let (r, _w) = {
            let mut raw = [0i32; 2];
            // Safety: `raw` is a valid two-element buffer for `pipe(2)`.
            unsafe { libc::pipe(raw.as_mut_ptr()) };
            (raw[0], raw[1])
        };

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        reactor
            .add_event(
                r,
                EVENT_READ,
                Some(Box::new(move || {
                    fired2.store(true, Ordering::SeqCst);
                })),
            )
            .unwrap();

        assert!(reactor.del_event(r, EVENT_READ));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!fired.load(Ordering::SeqCst));

        scheduler.stop();
        // Safety: both fds are owned exclusively by this test.
        unsafe {
            libc::close(r);
            libc::close(_w);
        }
    }
}
