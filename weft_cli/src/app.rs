//! Wires config load, logging, daemonization and server bring-up into a
//! single runnable entry point, grounded in
//! `original_source/ljrServer/application.{h,cpp}`'s `Application`
//! singleton (`init` -> `run` -> `main` -> `run_fiber`).
//!
//! Rust has no ambient global `Application::s_instance`; callers build
//! an [`Application`] value and keep it (or an `Arc` of it) for as long
//! as the process runs instead.

use crate::cli::Cli;
use crate::daemon;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use weft_config::Config;
use weft_core::{Reactor, ReactorIdle, Scheduler};
use weft_net::http::HttpServer;

/// One configured HTTP listener, grounded in `application.cpp`'s
/// `HttpServerConf` and the `http_servers` config key from spec.md §6.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpServerConf {
    /// `host:port` strings resolved at startup via
    /// [`weft_net::address::lookup_any`].
    #[serde(default)]
    pub address: Vec<String>,
    #[serde(default)]
    pub name: String,
}

impl HttpServerConf {
    fn is_valid(&self) -> bool {
        !self.address.is_empty()
    }
}

/// `server.work_path`/`server.pid_file` together name the pidfile this
/// process writes once it has its configured listeners up, grounded in
/// `Application::main`'s pidfile guard.
fn pidfile_path() -> std::path::PathBuf {
    let work_path = Config::lookup(
        "server.work_path",
        "/var/run/weft".to_string(),
        "server work directory",
    )
    .get();
    let pid_file = Config::lookup(
        "server.pid_file",
        "weft.pid".to_string(),
        "server pid file name",
    )
    .get();
    std::path::Path::new(&work_path).join(pid_file)
}

/// Drives the whole process from parsed arguments to exit code,
/// mirroring `Application::init` + `Application::run`.
#[derive(Debug)]
pub struct Application {
    cli: Cli,
}

impl Application {
    pub fn new(cli: Cli) -> Self {
        Application { cli }
    }

    /// Loads config (if `--config`/`WEFT_CONFIG` was given), then hands
    /// off to the daemon supervisor (`-d`) or runs in the foreground
    /// (`-s`). Returns the process exit code.
    pub fn run(self) -> i32 {
        if !self.cli.has_run_mode() {
            log::error!("pass -s to run in the foreground or -d to run as a daemon");
            return 1;
        }

        if let Some(path) = &self.cli.config {
            log::info!("loading config from {}", path.display());
            if let Err(e) = Config::load_yaml_file(path) {
                log::error!("failed to load config {}: {e}", path.display());
                return 1;
            }
        } else {
            log::warn!("no --config/WEFT_CONFIG given, running with compiled-in defaults");
        }

        let is_daemon = self.cli.daemon;
        daemon::start_daemon(is_daemon, move || Self::main())
    }

    /// The worker process body: writes the pidfile, brings up the
    /// reactor/scheduler pair, and starts every configured HTTP server,
    /// mirroring `Application::main` + `Application::run_fiber`.
    fn main() -> i32 {
        log::info!("weft worker starting, pid={}", std::process::id());

        let pidfile = pidfile_path();
        if let Some(parent) = pidfile.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                log::error!("failed to create work path {}: {e}", parent.display());
                return 1;
            }
        }
        if let Err(e) = std::fs::write(&pidfile, std::process::id().to_string()) {
            log::error!("failed to write pidfile {}: {e}", pidfile.display());
            return 1;
        }

        let worker_count = Scheduler::default_worker_count();
        let reactor = Reactor::new();
        let reactor_for_tickle = reactor.clone();
        let reactor_for_idle = reactor.clone();
        let scheduler = Arc::new(Scheduler::new(
            worker_count,
            true,
            move || reactor_for_tickle.tickle(),
            move |_| Box::new(ReactorIdle::new(reactor_for_idle.clone())),
        ));
        weft_core::attach(&reactor, &scheduler);
        scheduler.start();

        let servers = match Self::bring_up_http_servers(&scheduler) {
            Ok(servers) => servers,
            Err(()) => {
                scheduler.stop();
                return 1;
            }
        };
        if servers.is_empty() {
            log::warn!("no valid `http_servers` entries configured; idling");
        }

        scheduler.run_caller_loop();
        0
    }

    /// Resolves and binds every configured `http_servers` entry,
    /// mirroring `Application::run_fiber`'s address-resolution loop.
    /// `_exit(0)`-on-failure in the original becomes a plain `Err`
    /// here; the caller decides how to shut down.
    fn bring_up_http_servers(scheduler: &Arc<Scheduler>) -> Result<Vec<Arc<HttpServer>>, ()> {
        let confs = Config::lookup(
            "http_servers",
            Vec::<HttpServerConf>::new(),
            "configured HTTP server listeners",
        )
        .get();

        let mut servers = Vec::new();
        for conf in confs {
            if !conf.is_valid() {
                log::error!("http_servers entry {conf:?} has no address, skipping");
                continue;
            }

            let mut addresses = Vec::with_capacity(conf.address.len());
            for addr in &conf.address {
                match weft_net::address::lookup_any(addr) {
                    Ok(resolved) => addresses.push(resolved),
                    Err(e) => {
                        log::error!("invalid address {addr:?}: {e}");
                        return Err(());
                    }
                }
            }

            let server = Arc::new(HttpServer::new(scheduler.clone()));
            let (ok, fails) = server.bind(&addresses);
            if !ok {
                for addr in &fails {
                    log::error!("bind address fail: {addr}");
                }
                return Err(());
            }
            server.start();
            log::info!("http server {:?} listening on {:?}", conf.name, conf.address);
            servers.push(server);
        }
        Ok(servers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_http_server_conf_has_no_address() {
        let conf = HttpServerConf::default();
        assert!(!conf.is_valid());
    }

    #[test]
    fn pidfile_path_joins_work_path_and_file_name() {
        let path = pidfile_path();
        assert!(path.file_name().is_some());
    }
}
