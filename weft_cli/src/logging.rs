//! Logging bring-up. `weft_core`/`weft_net` log through the `log` facade
//! (panics at the fiber trampoline, accept/bind errors, reactor
//! warnings, ...); this installs the one subscriber a binary needs, in
//! `env_logger`'s usual "set `RUST_LOG` or take the default" shape.

/// Installs an `env_logger` subscriber, defaulting to `info` when
/// `RUST_LOG` is unset. Safe to call more than once: later calls are
/// no-ops, matching `env_logger::Builder::try_init`'s contract.
pub fn init() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}
