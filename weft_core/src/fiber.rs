//! Stackful task primitive.
//!
//! A [`Fiber`] is a coroutine with its own stack, context-switched with
//! [`context::Context`] (the same crate `modules/fimo_tasks` uses for its
//! `RawTaskInner`/`TaskWorker` machinery). Unlike `fimo_tasks`, a `Fiber`
//! here is a free-standing primitive: it does not know about schedulers,
//! fd contexts, or runtimes, only about running a closure on a separate
//! stack and suspending back to whoever resumed it.

use context::stack::ProtectedFixedSizeStack;
use context::{Context, Transfer};
use std::any::Any;
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

/// Compiled-in default stack size for a task; also the default handed to
/// [`Config::lookup`](weft_config::Config::lookup) for `fiber.stack_size`.
pub const DEFAULT_STACK_SIZE: usize = 131_072;

/// Current value of the `fiber.stack_size` config knob, used by the
/// scheduler for its per-worker idle/callback fibers and available to
/// any caller that wants the configured default instead of a fixed size.
pub fn configured_stack_size() -> usize {
    static VAR: OnceLock<Arc<weft_config::ConfigVar<u32>>> = OnceLock::new();
    let var = VAR.get_or_init(|| {
        weft_config::Config::lookup(
            "fiber.stack_size",
            DEFAULT_STACK_SIZE as u32,
            "default stack size in bytes for a newly spawned task",
        )
    });
    var.get() as usize
}

/// Lifecycle state of a [`Fiber`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Allocated but never resumed.
    Init = 0,
    /// Queued, waiting to be resumed.
    Ready = 1,
    /// Currently executing on some worker thread.
    Running = 2,
    /// Suspended on I/O, a timer, or an explicit yield.
    Hold = 3,
    /// Returned normally from its entry closure.
    Terminated = 4,
    /// Unwound via a panic.
    Failed = 5,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Init,
            1 => Self::Ready,
            2 => Self::Running,
            3 => Self::Hold,
            4 => Self::Terminated,
            _ => Self::Failed,
        }
    }
}

/// Monotonically assigned task identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw numeric value, useful for logging and arena keys.
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Sentinel `data` value the trampoline hands back on its final yield.
/// Any other value is an ordinary suspend.
const DONE_SENTINEL: usize = usize::MAX;

struct FiberState {
    id: TaskId,
    state: AtomicU8,
    /// `None` once the fiber has terminated and its stack has been
    /// reclaimed or is pending reclamation.
    stack: Option<ProtectedFixedSizeStack>,
    /// The fiber's own suspended continuation; taken by [`Fiber::resume`]
    /// and restored once the fiber yields back.
    context: Cell<Option<Context>>,
    /// Payload captured by a panicking entry closure, read back by the
    /// scheduler's trampoline handler.
    panic_payload: Cell<Option<Box<dyn Any + Send>>>,
    /// Whether this fiber has ever been resumed.
    started: Cell<bool>,
    /// Boxed `TrampolineArgs<F>` pointer consumed by the first `resume()`.
    pending_entry: Cell<Option<*mut ()>>,
}

/// A stackful coroutine.
///
/// `Fiber` is `!Send`/`!Sync` in spirit (it is only ever touched from the
/// worker thread that owns it at any instant) but the scheduler needs to
/// move ownership between its own bookkeeping structures, so the unsafe
/// [`Send`] impl is confined to this module and documented at each call
/// site in `scheduler.rs`.
pub struct Fiber {
    inner: Box<FiberState>,
}

// Safety: a Fiber is only ever resumed by the single worker thread that
// currently owns it (enforced by the scheduler's dispatch-loop locking);
// no two threads ever call `resume` on the same Fiber concurrently.
unsafe impl Send for Fiber {}

// Safety: the scheduler hands a `Fiber` between threads as an `Arc`
// (parked on a reactor fd context while another thread later resumes
// it), but the cooperative dispatch discipline still guarantees no two
// threads ever call a `&self` method on the same Fiber at once.
unsafe impl Sync for Fiber {}

thread_local! {
    static CURRENT: Cell<Option<NonNull<FiberState>>> = const { Cell::new(None) };
    static RETURN_CONTEXT: Cell<Option<Context>> = const { Cell::new(None) };
}

struct TrampolineArgs<F> {
    closure: F,
    fiber: NonNull<FiberState>,
}

impl Fiber {
    /// Allocates a stack and returns a fiber in [`TaskState::Init`].
    ///
    /// `entry` runs on the new stack the first time the fiber is resumed.
    /// Panics inside `entry` are caught; the fiber moves to
    /// [`TaskState::Failed`] instead of unwinding into the caller.
    pub fn spawn<F>(entry: F, stack_size: usize) -> std::io::Result<Self>
    where
        F: FnOnce() + 'static,
    {
        let stack = ProtectedFixedSizeStack::new(stack_size)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        // Safety: `stack` was just allocated above and outlives `context`
        // (both are stored in the `FiberState` this constructor returns).
        let context = unsafe { Context::new(&stack, trampoline::<F>) };

        let inner = Box::new(FiberState {
            id: TaskId::next(),
            state: AtomicU8::new(TaskState::Init as u8),
            stack: Some(stack),
            context: Cell::new(Some(context)),
            panic_payload: Cell::new(None),
            started: Cell::new(false),
            pending_entry: Cell::new(None),
        });

        let fiber_ptr = NonNull::from(inner.as_ref());
        let args = Box::new(TrampolineArgs {
            closure: entry,
            fiber: fiber_ptr,
        });
        inner.pending_entry.set(Some(Box::into_raw(args).cast::<()>()));

        Ok(Fiber { inner })
    }

    /// The task's identity.
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: TaskState) {
        self.inner.state.store(s as u8, Ordering::Release);
    }

    /// Resumes a suspended fiber from outside its stack (i.e. from the
    /// scheduler's dispatch loop or a thread's bootstrap task).
    ///
    /// # Panics
    /// Panics if `state` is not one of `Init`/`Ready`/`Hold`.
    pub fn resume(&self) {
        let state = self.state();
        assert!(
            matches!(state, TaskState::Init | TaskState::Ready | TaskState::Hold),
            "resume called on a fiber in state {state:?}"
        );
        self.set_state(TaskState::Running);

        let fiber_ptr = NonNull::from(self.inner.as_ref());
        CURRENT.with(|c| c.set(Some(fiber_ptr)));

        let ctx = self
            .inner
            .context
            .take()
            .expect("fiber context missing while not terminated");

        let data = if self.inner.started.replace(true) {
            0
        } else {
            self.inner
                .pending_entry
                .take()
                .expect("first resume must carry the boxed entry pointer") as usize
        };

        // Safety: `ctx` was created for this fiber's stack (or is its
        // suspended continuation) and is resumed from the thread that
        // currently owns the fiber, per the scheduler's locking discipline.
        let Transfer { context, data } = unsafe { ctx.resume(data) };

        CURRENT.with(|c| c.set(None));

        if data == DONE_SENTINEL {
            // The trampoline already set Terminated/Failed before its
            // final yield; the stack may now be reclaimed by the caller.
            self.inner.context.set(None);
        } else {
            self.inner.context.set(Some(context));
        }
    }

    /// Whether the fiber has returned or panicked and can no longer be
    /// resumed.
    pub fn is_finished(&self) -> bool {
        matches!(self.state(), TaskState::Terminated | TaskState::Failed)
    }

    /// Takes the panic payload left behind by a `Failed` fiber, if any.
    pub fn take_panic(&self) -> Option<Box<dyn Any + Send>> {
        self.inner.panic_payload.take()
    }

    /// Reuses this fiber's stack for a fresh entry closure.
    ///
    /// This is the "callback task" pattern the scheduler's dispatch loop
    /// uses for bare closures: rather than allocate a new stack per
    /// closure, one fiber per worker is recycled via `reset`.
    ///
    /// # Panics
    /// Panics unless `state` is `Init`, `Terminated`, or `Failed`.
    pub fn reset<F>(&mut self, entry: F)
    where
        F: FnOnce() + 'static,
    {
        let state = self.state();
        assert!(
            matches!(
                state,
                TaskState::Init | TaskState::Terminated | TaskState::Failed
            ),
            "reset called on a fiber in state {state:?}"
        );
        let stack = self
            .inner
            .stack
            .as_ref()
            .expect("reset on a fiber whose stack was already reclaimed");
        // Safety: `stack` is owned by `self.inner` and outlives `context`,
        // which is stored back into `self.inner.context` below.
        let context = unsafe { Context::new(stack, trampoline::<F>) };

        let fiber_ptr = NonNull::from(self.inner.as_ref());
        let args = Box::new(TrampolineArgs {
            closure: entry,
            fiber: fiber_ptr,
        });
        self.inner
            .pending_entry
            .set(Some(Box::into_raw(args).cast::<()>()));
        self.inner.context.set(Some(context));
        self.inner.started.set(false);
        self.inner.panic_payload.set(None);
        self.set_state(TaskState::Init);
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        debug_assert!(
            self.inner.context.take().is_none() || self.is_finished(),
            "dropping a fiber that never reached Terminated/Failed leaks its stack"
        );
    }
}

/// Suspends the calling fiber, transitioning it to [`TaskState::Ready`]
/// and swapping back to the resumer (scheduler dispatch loop or a
/// thread's bootstrap task).
///
/// # Panics
/// Panics if called from outside a running fiber.
pub fn yield_ready() {
    do_yield(TaskState::Ready);
}

/// Suspends the calling fiber, transitioning it to [`TaskState::Hold`].
/// Used by the reactor/shim/timer set to park a task until an event,
/// timeout, or explicit reschedule wakes it back up.
///
/// # Panics
/// Panics if called from outside a running fiber.
pub fn yield_hold() {
    do_yield(TaskState::Hold);
}

fn do_yield(next_state: TaskState) {
    let fiber = CURRENT
        .with(|c| c.get())
        .expect("yield called outside a running fiber");
    // Safety: `fiber` was set by `Fiber::resume` immediately before
    // transferring onto this stack, and remains valid until we transfer
    // back out below; no other thread can mutate it concurrently because
    // only the thread currently running this fiber holds the pointer.
    unsafe { fiber.as_ref() }
        .state
        .store(next_state as u8, Ordering::Release);

    let parent = RETURN_CONTEXT
        .with(|c| c.take())
        .expect("no parent context recorded for this fiber");

    // Safety: `parent` is the continuation handed to us by the resumer on
    // entry (or by the previous yield), valid for exactly one resume.
    let Transfer { context, data: _ } = unsafe { parent.resume(0) };
    RETURN_CONTEXT.with(|c| c.set(Some(context)));

    // Safety: same fiber pointer as above; we are back on our own stack.
    unsafe { fiber.as_ref() }
        .state
        .store(TaskState::Running as u8, Ordering::Release);
}

extern "C" fn trampoline<F>(t: Transfer) -> !
where
    F: FnOnce() + 'static,
{
    // Safety: the pointer was boxed by `Fiber::spawn` and handed through
    // as the first `resume()`'s `data` argument unchanged.
    let args = unsafe { Box::from_raw(t.data as *mut TrampolineArgs<F>) };
    let TrampolineArgs { closure, fiber } = *args;

    RETURN_CONTEXT.with(|c| c.set(Some(t.context)));
    // Safety: `fiber` outlives this call: the owning `Fiber` cannot be
    // dropped while its stack is executing (the scheduler holds it until
    // `resume()` observes termination).
    unsafe { fiber.as_ref() }
        .state
        .store(TaskState::Running as u8, Ordering::Release);

    let result = catch_unwind(AssertUnwindSafe(closure));

    let final_state = match result {
        Ok(()) => TaskState::Terminated,
        Err(payload) => {
            // Safety: `fiber` outlives this call, as established above.
            log::error!(
                "task {} panicked: {}\n{}",
                unsafe { fiber.as_ref() }.id.raw(),
                describe_panic(&payload),
                std::backtrace::Backtrace::capture()
            );
            // Safety: `fiber` outlives this call, as established above.
            unsafe { fiber.as_ref() }.panic_payload.set(Some(payload));
            TaskState::Failed
        }
    };
    // Safety: `fiber` outlives this call, as established above.
    unsafe { fiber.as_ref() }
        .state
        .store(final_state as u8, Ordering::Release);

    let parent = RETURN_CONTEXT
        .with(|c| c.take())
        .expect("trampoline has no parent context");
    // Safety: final handoff; this fiber's stack is never resumed again
    // once the scheduler observes `DONE_SENTINEL`.
    let _ = unsafe { parent.resume(DONE_SENTINEL) };

    // A correctly behaving scheduler never resumes a terminated fiber's
    // stack again, so this is unreachable in practice.
    unreachable!("terminated fiber was resumed again");
}

fn describe_panic(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const TEST_STACK: usize = DEFAULT_STACK_SIZE;

    #[test]
    fn runs_to_completion_and_reports_terminated() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let fiber = Fiber::spawn(
            move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            },
            TEST_STACK,
        )
        .unwrap();

        assert_eq!(fiber.state(), TaskState::Init);
        fiber.resume();
        assert_eq!(fiber.state(), TaskState::Terminated);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(fiber.is_finished());
    }

    #[test]
    fn yield_hold_round_trips_back_to_resumer() {
        let fiber = Fiber::spawn(
            || {
                yield_hold();
                yield_hold();
            },
            TEST_STACK,
        )
        .unwrap();

        fiber.resume();
        assert_eq!(fiber.state(), TaskState::Hold);
        fiber.resume();
        assert_eq!(fiber.state(), TaskState::Hold);
        fiber.resume();
        assert_eq!(fiber.state(), TaskState::Terminated);
    }

    #[test]
    fn yield_ready_reports_ready_state() {
        let fiber = Fiber::spawn(
            || {
                yield_ready();
            },
            TEST_STACK,
        )
        .unwrap();

        fiber.resume();
        assert_eq!(fiber.state(), TaskState::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), TaskState::Terminated);
    }

    #[test]
    fn panic_inside_entry_moves_to_failed_without_unwinding_caller() {
        let fiber = Fiber::spawn(
            || {
                panic!("boom");
            },
            TEST_STACK,
        )
        .unwrap();

        fiber.resume();
        assert_eq!(fiber.state(), TaskState::Failed);
        assert!(fiber.is_finished());
        let payload = fiber.take_panic().expect("panic payload recorded");
        assert_eq!(describe_panic(payload.as_ref()), "boom");
    }

    #[test]
    #[should_panic(expected = "resume called on a fiber in state")]
    fn resuming_a_terminated_fiber_panics() {
        let fiber = Fiber::spawn(|| {}, TEST_STACK).unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), TaskState::Terminated);
        fiber.resume();
    }

    #[test]
    fn reset_reuses_the_stack_for_a_fresh_entry() {
        let mut fiber = Fiber::spawn(|| {}, TEST_STACK).unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), TaskState::Terminated);

        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        fiber.reset(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fiber.state(), TaskState::Init);

        fiber.resume();
        assert_eq!(fiber.state(), TaskState::Terminated);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "yield called outside a running fiber")]
    fn yield_outside_a_fiber_panics() {
        yield_hold();
    }
}
