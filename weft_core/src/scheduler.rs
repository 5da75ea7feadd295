//! N-thread x M-task cooperative scheduler.
//!
//! Grounded in `original_source/ljrServer/scheduler.{h,cpp}`'s `Scheduler`
//! class, generalized from a single FIFO `std::list<FiberAndThread>` into
//! a `parking_lot`-guarded `VecDeque`. The worker-thread bring-up and
//! per-worker "callback fiber" reuse pattern is grounded in
//! `modules/fimo_tasks/src/worker_pool.rs`'s `TaskWorker`.
//!
//! This scheduler deliberately does *not* work-steal: dispatch is a
//! single shared FIFO scanned from the head, matching the original's
//! `scheduleNoLock`/`run` loop.
//!
//! Fibers travel through the queue as `Arc<Fiber>` rather than `Box`,
//! mirroring the original's `Fiber::ptr` (a `shared_ptr`): the reactor
//! keeps its own clone of a parked task's handle in its `FdContext` so
//! it can re-enqueue the same fiber once its event fires, the same way
//! `IOManager::FdContext::EventContext` holds a second `shared_ptr` to
//! the waiting fiber.

use crate::fiber::{configured_stack_size, Fiber, TaskState};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Implemented by the idle task a scheduler runs when its queue is
/// empty. The reactor (§4.4) is the production implementation; tests use
/// a no-op that yields-hold until stopping.
pub trait IdleTask: Send + 'static {
    /// Runs once per worker thread, parked as that worker's dedicated
    /// idle fiber. Must itself loop internally, yielding-hold between
    /// iterations, and return only once the scheduler is stopping and
    /// has no other work left.
    fn run(&self);
}

/// An `IdleTask` that simply parks until the scheduler is stopping,
/// matching the base `Scheduler::idle` in the original.
pub struct NoopIdle {
    stopping: Arc<AtomicBool>,
}

impl NoopIdle {
    pub fn new(stopping: Arc<AtomicBool>) -> Self {
        Self { stopping }
    }
}

impl IdleTask for NoopIdle {
    fn run(&self) {
        while !self.stopping.load(Ordering::Acquire) {
            crate::fiber::yield_hold();
        }
    }
}

/// A unit of schedulable work: either a fiber parked mid-execution or a
/// bare closure to be run on a recycled "callback fiber".
pub enum WorkItem {
    Fiber(Arc<Fiber>),
    Closure(Box<dyn FnOnce() + Send>),
}

struct QueueEntry {
    item: WorkItem,
    /// `None` means runnable on any worker.
    pinned_worker: Option<usize>,
}

/// Worker identity, stable for the lifetime of a [`Scheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub usize);

struct Shared {
    queue: Mutex<std::collections::VecDeque<QueueEntry>>,
    active_workers: AtomicUsize,
    idle_workers: AtomicUsize,
    stopping: AtomicBool,
    auto_stop: AtomicBool,
    worker_count: usize,
    /// Hook invoked whenever the queue transitions empty -> non-empty
    /// while at least one worker is idle. The reactor wires this to its
    /// self-pipe write; tests can use a no-op.
    tickle: Box<dyn Fn() + Send + Sync>,
    idle_factory: Box<dyn Fn(WorkerId) -> Box<dyn IdleTask> + Send + Sync>,
}

impl Shared {
    fn has_idle_threads(&self) -> bool {
        self.idle_workers.load(Ordering::Acquire) > 0
    }

    fn stopping(&self) -> bool {
        self.auto_stop.load(Ordering::Acquire)
            && self.stopping.load(Ordering::Acquire)
            && self.queue.lock().is_empty()
            && self.active_workers.load(Ordering::Acquire) == 0
    }
}

/// Owns worker threads and a shared FIFO task queue, per spec.md's
/// cooperative N-thread x M-task scheduling model.
pub struct Scheduler {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// Present only in `use_caller` mode: the calling thread's own
    /// dispatch loop, run explicitly by `start`/`stop` rather than on a
    /// spawned `JoinHandle`.
    caller_worker: Option<WorkerId>,
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<WorkerId>> = const { RefCell::new(None) };
    /// The `Arc<Fiber>` the calling thread is currently resuming, if any.
    /// The shim/reactor clone this to park a task on an fd or timer
    /// without needing the fiber to know about its own wrapper.
    static CURRENT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    /// Whether `weft_core::shim` should intercept blocking calls on this
    /// thread. Off by default; a worker's `dispatch_loop` turns it on for
    /// its entire lifetime, per spec.md's syscall-shim design.
    static SHIM_ENABLED: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// The fiber the calling thread's dispatch loop is currently resuming,
/// if called from within one. Used by the reactor and syscall shim to
/// capture a handle to the parked task before yielding-hold.
pub fn current_fiber() -> Option<Arc<Fiber>> {
    CURRENT_FIBER.with(|c| c.borrow().clone())
}

/// Whether the calling thread is a scheduler worker with the syscall
/// shim active. `weft_core::shim` consults this before ever attempting
/// to suspend a blocking call.
pub fn shim_enabled() -> bool {
    SHIM_ENABLED.with(|c| c.get())
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("worker_count", &self.shared.worker_count)
            .field("stopping", &self.shared.stopping())
            .field("caller_worker", &self.caller_worker)
            .finish()
    }
}

impl Scheduler {
    /// Builds a scheduler with `worker_count` total workers. If
    /// `use_caller`, the constructing thread is recruited as worker 0
    /// and must later call [`Scheduler::run_caller_loop`] itself (the
    /// constructor does not spawn a thread for it).
    ///
    /// `idle_factory` builds a fresh [`IdleTask`] per worker; `tickle`
    /// wakes a sleeping worker (or the reactor's epoll_wait) when new
    /// work appears.
    pub fn new(
        worker_count: usize,
        use_caller: bool,
        tickle: impl Fn() + Send + Sync + 'static,
        idle_factory: impl Fn(WorkerId) -> Box<dyn IdleTask> + Send + Sync + 'static,
    ) -> Self {
        assert!(worker_count > 0, "scheduler needs at least one worker");
        let shared = Arc::new(Shared {
            queue: Mutex::new(std::collections::VecDeque::new()),
            active_workers: AtomicUsize::new(0),
            idle_workers: AtomicUsize::new(0),
            stopping: AtomicBool::new(true),
            auto_stop: AtomicBool::new(false),
            worker_count,
            tickle: Box::new(tickle),
            idle_factory: Box::new(idle_factory),
        });
        Self {
            shared,
            threads: Mutex::new(Vec::new()),
            caller_worker: use_caller.then_some(WorkerId(0)),
        }
    }

    /// The worker this thread's dispatch loop is running as, if any.
    pub fn current_worker() -> Option<WorkerId> {
        CURRENT_WORKER.with(|c| *c.borrow())
    }

    /// Number of workers to use when a config or caller leaves the
    /// worker count unspecified: the host's logical CPU count, clamped
    /// to at least one.
    pub fn default_worker_count() -> usize {
        num_cpus::get().max(1)
    }

    fn spawned_count(&self) -> usize {
        self.shared.worker_count - self.caller_worker.map_or(0, |_| 1)
    }

    /// Spawns the non-caller worker threads. Idempotent.
    pub fn start(&self) {
        let was_stopping = self.shared.stopping.swap(false, Ordering::AcqRel);
        if !was_stopping {
            return;
        }

        let mut threads = self.threads.lock();
        debug_assert!(threads.is_empty());

        let start_id = self.caller_worker.map_or(0, |_| 1);
        for offset in 0..self.spawned_count() {
            let id = WorkerId(start_id + offset);
            let shared = self.shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("weft-worker-{}", id.0))
                .spawn(move || dispatch_loop(shared, id))
                .expect("failed to spawn scheduler worker thread");
            threads.push(handle);
        }
        trace!("scheduler started {} worker thread(s)", threads.len());
    }

    /// Enqueues a fiber or closure. `thread` pins it to a specific
    /// worker; `None` means any worker may pick it up.
    pub fn schedule(&self, item: WorkItem, thread: Option<WorkerId>) {
        self.schedule_batch(std::iter::once(item), thread);
    }

    pub fn schedule_fiber(&self, fiber: Arc<Fiber>, thread: Option<WorkerId>) {
        self.schedule(WorkItem::Fiber(fiber), thread);
    }

    pub fn schedule_closure(
        &self,
        cb: impl FnOnce() + Send + 'static,
        thread: Option<WorkerId>,
    ) {
        self.schedule(WorkItem::Closure(Box::new(cb)), thread);
    }

    /// Atomically enqueues every item in `items`, tickling at most once.
    pub fn schedule_batch(
        &self,
        items: impl IntoIterator<Item = WorkItem>,
        thread: Option<WorkerId>,
    ) {
        let mut need_tickle;
        {
            let mut queue = self.shared.queue.lock();
            need_tickle = queue.is_empty();
            for item in items {
                queue.push_back(QueueEntry {
                    item,
                    pinned_worker: thread.map(|w| w.0),
                });
            }
        }
        need_tickle &= self.shared.has_idle_threads();
        if need_tickle {
            (self.shared.tickle)();
        }
    }

    fn tickle(&self) {
        (self.shared.tickle)();
    }

    /// Signals stop, wakes every worker (and the caller loop, if any),
    /// joins spawned threads. In `use_caller` mode the caller must still
    /// call [`Scheduler::run_caller_loop`] to drain its own dispatch
    /// loop; this method does not do it on the caller's behalf.
    pub fn stop(&self) {
        self.shared.auto_stop.store(true, Ordering::Release);
        self.shared.stopping.store(true, Ordering::Release);

        for _ in 0..self.spawned_count() {
            self.tickle();
        }
        if self.caller_worker.is_some() {
            self.tickle();
        }

        let threads = {
            let mut guard = self.threads.lock();
            std::mem::take(&mut *guard)
        };
        for handle in threads {
            let _ = handle.join();
        }
    }

    /// Runs the dispatch loop on the calling thread. Only valid in
    /// `use_caller` mode; blocks until the scheduler is stopping and
    /// drained.
    pub fn run_caller_loop(&self) {
        let id = self
            .caller_worker
            .expect("run_caller_loop called without use_caller");
        dispatch_loop(self.shared.clone(), id);
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopping()
    }
}

fn dispatch_loop(shared: Arc<Shared>, id: WorkerId) {
    CURRENT_WORKER.with(|c| *c.borrow_mut() = Some(id));
    SHIM_ENABLED.with(|c| c.set(true));

    let idle_task = (shared.idle_factory)(id);
    let idle_fiber = Arc::new(
        Fiber::spawn(
            {
                let idle_task = std::cell::RefCell::new(Some(idle_task));
                move || {
                    if let Some(task) = idle_task.borrow_mut().take() {
                        task.run();
                    }
                }
            },
            configured_stack_size(),
        )
        .expect("failed to allocate idle fiber stack"),
    );

    let mut cb_fiber: Option<Arc<Fiber>> = None;

    loop {
        let mut tickle_me = false;
        let mut picked: Option<WorkItem> = None;

        {
            let mut queue = shared.queue.lock();
            let mut idx = 0;
            while idx < queue.len() {
                let pinned_to_other = queue[idx].pinned_worker.is_some_and(|w| w != id.0);
                if pinned_to_other {
                    tickle_me = true;
                    idx += 1;
                    continue;
                }
                if let WorkItem::Fiber(f) = &queue[idx].item {
                    if f.state() == TaskState::Running {
                        idx += 1;
                        continue;
                    }
                }
                let entry = queue.remove(idx).expect("index was just validated");
                shared.active_workers.fetch_add(1, Ordering::AcqRel);
                picked = Some(entry.item);
                break;
            }
        }

        if tickle_me {
            (shared.tickle)();
        }

        match picked {
            Some(WorkItem::Fiber(fiber)) => {
                resume_tracked(&fiber);
                shared.active_workers.fetch_sub(1, Ordering::AcqRel);
                if fiber.state() == TaskState::Ready {
                    enqueue_internal(&shared, WorkItem::Fiber(fiber), None);
                }
                // Hold: ownership now rests solely with whoever captured
                // `current_fiber()` before yielding (reactor/timer); if
                // nobody did, the Arc simply drops and its stack leaks
                // per `Fiber`'s drop-time debug assertion.
            }
            Some(WorkItem::Closure(cb)) => {
                let fiber = match cb_fiber.take() {
                    Some(mut f) => {
                        Arc::get_mut(&mut f)
                            .expect("callback fiber had outstanding references")
                            .reset(cb);
                        f
                    }
                    None => Arc::new(
                        Fiber::spawn(cb, configured_stack_size())
                            .expect("failed to allocate callback fiber stack"),
                    ),
                };
                resume_tracked(&fiber);
                shared.active_workers.fetch_sub(1, Ordering::AcqRel);
                match fiber.state() {
                    TaskState::Ready => {
                        enqueue_internal(&shared, WorkItem::Fiber(fiber), None);
                    }
                    TaskState::Terminated | TaskState::Failed => {
                        cb_fiber = Some(fiber);
                    }
                    _ => {
                        // Parked on an fd/timer; the reactor/shim holds
                        // the only other reference now, so this worker
                        // must not reuse the slot for the next closure.
                    }
                }
            }
            None => {
                if shared.stopping() {
                    break;
                }
                if idle_fiber.is_finished() {
                    warn!("worker {}: idle fiber terminated, exiting", id.0);
                    break;
                }
                shared.idle_workers.fetch_add(1, Ordering::AcqRel);
                resume_tracked(&idle_fiber);
                shared.idle_workers.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    debug!("worker {} exiting dispatch loop", id.0);
    CURRENT_WORKER.with(|c| *c.borrow_mut() = None);
    SHIM_ENABLED.with(|c| c.set(false));
}

fn resume_tracked(fiber: &Arc<Fiber>) {
    CURRENT_FIBER.with(|c| *c.borrow_mut() = Some(fiber.clone()));
    fiber.resume();
    CURRENT_FIBER.with(|c| *c.borrow_mut() = None);
}

fn enqueue_internal(shared: &Arc<Shared>, item: WorkItem, thread: Option<WorkerId>) {
    let mut need_tickle;
    {
        let mut queue = shared.queue.lock();
        need_tickle = queue.is_empty();
        queue.push_back(QueueEntry {
            item,
            pinned_worker: thread.map(|w| w.0),
        });
    }
    need_tickle &= shared.has_idle_threads();
    if need_tickle {
        (shared.tickle)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn unused_tickle() -> impl Fn() + Send + Sync + 'static {
        || {}
    }

    fn noop_idle_factory(
        stopping: Arc<AtomicBool>,
    ) -> impl Fn(WorkerId) -> Box<dyn IdleTask> + Send + Sync + 'static {
        move |_| Box::new(NoopIdle::new(stopping.clone()))
    }

    #[test]
    fn runs_closures_across_worker_threads() {
        let stopping = Arc::new(AtomicBool::new(false));
        let scheduler = Arc::new(Scheduler::new(
            2,
            false,
            unused_tickle(),
            noop_idle_factory(stopping.clone()),
        ));
        scheduler.start();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let counter = counter.clone();
            scheduler.schedule_closure(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                None,
            );
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) < 50 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 50);

        stopping.store(true, Ordering::SeqCst);
        scheduler.stop();
    }

    #[test]
    fn pinned_closure_runs_on_named_worker() {
        let stopping = Arc::new(AtomicBool::new(false));
        let scheduler = Arc::new(Scheduler::new(
            2,
            false,
            unused_tickle(),
            noop_idle_factory(stopping.clone()),
        ));
        scheduler.start();

        let seen_worker = Arc::new(Mutex::new(None));
        let seen_worker2 = seen_worker.clone();
        scheduler.schedule_closure(
            move || {
                *seen_worker2.lock() = Scheduler::current_worker();
            },
            Some(WorkerId(0)),
        );

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while seen_worker.lock().is_none() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*seen_worker.lock(), Some(WorkerId(0)));

        stopping.store(true, Ordering::SeqCst);
        scheduler.stop();
    }
}
