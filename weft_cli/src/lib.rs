//! The `weft` binary's supporting modules: argument parsing, logging
//! bring-up, process supervision and the top-level application wiring
//! that ties config, the scheduler/reactor pair and the configured
//! HTTP servers together.
//!
//! Grounded in `original_source/ljrServer`'s `env`/`daemon`/
//! `application` trio; module-by-module provenance is recorded in
//! `DESIGN.md` at the workspace root.

#![warn(rust_2018_idioms, missing_debug_implementations)]

pub mod app;
pub mod cli;
pub mod daemon;
pub mod logging;

pub use app::Application;
pub use cli::Cli;
