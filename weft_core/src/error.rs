//! Crate-wide error re-exports.
//!
//! Per spec.md §7: local errno-style failures are modeled as
//! [`std::io::Error`] (already what [`crate::fiber::Fiber::spawn`] and
//! the reactor's `epoll_ctl` wrapper return), so there is little to add
//! here beyond the one genuinely structured error type, [`ReactorError`].
//! Programmer-contract violations use `assert!`/`panic!` rather than a
//! `Result`, matching the original's abort-on-invariant-violation style.

pub use crate::reactor::ReactorError;
