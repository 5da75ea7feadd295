//! Stackful-coroutine scheduler, hierarchical timer set and
//! edge-triggered epoll reactor, plus the syscall shim that lets code
//! running on a scheduled task make what looks like a blocking call
//! without blocking its worker thread.
//!
//! Grounded throughout in `original_source/ljrServer` (a C++ coroutine
//! server framework); module-by-module provenance is recorded in
//! `DESIGN.md` at the workspace root.

#![warn(rust_2018_idioms, missing_debug_implementations)]

pub mod error;
pub mod fd_registry;
pub mod fiber;
pub mod reactor;
pub mod scheduler;
pub mod shim;
pub mod time;
pub mod timer;

pub use error::ReactorError;
pub use fiber::{Fiber, TaskId, TaskState};
pub use reactor::{Reactor, ReactorIdle, EVENT_READ, EVENT_WRITE};
pub use scheduler::{IdleTask, NoopIdle, Scheduler, WorkItem, WorkerId};
pub use timer::{TimerHandle, TimerSet};

/// Wires a freshly built [`Reactor`] and [`Scheduler`] together: attaches
/// the reactor to the scheduler (so triggered events/timers can
/// re-enqueue fibers) and binds the syscall shim to the same reactor (so
/// `weft_core::shim` calls have somewhere to register interest).
///
/// Callers still choose worker count / `use_caller` themselves via
/// [`Scheduler::new`]; this only performs the cross-wiring every
/// deployment needs.
pub fn attach(reactor: &std::sync::Arc<Reactor>, scheduler: &std::sync::Arc<Scheduler>) {
    reactor.attach_scheduler(std::sync::Arc::downgrade(scheduler));
    shim::attach_reactor(reactor);
}
