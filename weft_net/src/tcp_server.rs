//! TCP server scaffold, grounded in
//! `original_source/ljrServer/tcp_server.{h,cpp}`.
//!
//! The original is a virtual base class meant to be subclassed
//! (`HttpServer : public TcpServer` overrides `handleClient`). Rust has
//! no inheritance, so `TcpServer` instead holds a client handler as a
//! boxed closure; `http::HttpServer` composes a `TcpServer` and passes
//! its own dispatch function in as that handler.

use crate::address::Address;
use crate::socket::{Family, Socket, Type};
use log::{error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use weft_core::{Scheduler, WorkerId};

/// Invoked once per accepted connection, on a worker-scheduled task so
/// it may freely call any `weft_net`/`weft_core::shim` blocking-shaped
/// API without stalling its worker thread.
pub type ClientHandler = Arc<dyn Fn(Socket) + Send + Sync>;

fn default_handler() -> ClientHandler {
    Arc::new(|socket: Socket| {
        info!("handleClient: fd={} (no handler installed)", socket.fd());
    })
}

/// Listens on one or more bound addresses and dispatches each accepted
/// connection to a [`ClientHandler`], grounded in the original's
/// `TcpServer::bind`/`start`/`startAccept`/`handleClient` split.
pub struct TcpServer {
    scheduler: Arc<Scheduler>,
    socks: parking_lot::Mutex<Vec<Arc<Socket>>>,
    recv_timeout: Duration,
    name: String,
    stopped: Arc<AtomicBool>,
    handler: parking_lot::Mutex<ClientHandler>,
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("name", &self.name)
            .field("stopped", &self.stopped.load(Ordering::Acquire))
            .finish()
    }
}

impl TcpServer {
    /// `tcp_server.read_timeout` defaults to two minutes, matching the
    /// original's `g_tcp_server_read_timeout`.
    const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(120);

    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        let recv_timeout_ms = weft_config::Config::lookup(
            "tcp_server.read_timeout",
            Self::DEFAULT_RECV_TIMEOUT.as_millis() as u64,
            "tcp server read timeout",
        )
        .get();
        TcpServer {
            scheduler,
            socks: parking_lot::Mutex::new(Vec::new()),
            recv_timeout: Duration::from_millis(recv_timeout_ms),
            name: "weft/1.0.0".to_string(),
            stopped: Arc::new(AtomicBool::new(true)),
            handler: parking_lot::Mutex::new(default_handler()),
        }
    }

    pub fn set_handler(&self, handler: ClientHandler) {
        *self.handler.lock() = handler;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn bind_one(&self, addr: &Address) -> Result<(), Address> {
        let (ok, mut fails) = self.bind(std::slice::from_ref(addr));
        if ok {
            Ok(())
        } else {
            Err(fails.remove(0))
        }
    }

    /// Binds every address in `addrs`, listening on each. If any single
    /// bind/listen fails, none of the addresses end up registered (the
    /// original's "one failure clears the whole batch" behavior).
    pub fn bind(&self, addrs: &[Address]) -> (bool, Vec<Address>) {
        let mut socks = Vec::with_capacity(addrs.len());
        let mut fails = Vec::new();

        for addr in addrs {
            let sock = match Socket::create_tcp(addr) {
                Ok(s) => s,
                Err(e) => {
                    error!("bind fail: create socket for {addr}: {e}");
                    fails.push(addr.clone());
                    continue;
                }
            };
            if let Err(e) = sock.bind(addr) {
                error!("bind fail: {addr}: {e}");
                fails.push(addr.clone());
                continue;
            }
            if let Err(e) = sock.listen(libc::SOMAXCONN) {
                error!("listen fail: {addr}: {e}");
                fails.push(addr.clone());
                continue;
            }
            socks.push(Arc::new(sock));
        }

        if !fails.is_empty() {
            return (false, fails);
        }

        for sock in &socks {
            info!("server bind success: fd={} family={:?}", sock.fd(), sock.family());
        }
        *self.socks.lock() = socks;
        (true, fails)
    }

    /// Spawns an accept loop per listening socket. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if !self.stopped.swap(false, Ordering::AcqRel) {
            return;
        }
        let socks = self.socks.lock().clone();
        for sock in socks {
            let this = self.clone();
            self.scheduler
                .schedule_closure(move || this.accept_loop(sock), None);
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let mut socks = self.socks.lock();
        socks.clear();
    }

    fn accept_loop(self: Arc<Self>, listener: Arc<Socket>) {
        while !self.stopped.load(Ordering::Acquire) {
            match listener.accept() {
                Ok(client) => {
                    let _ = client.set_recv_timeout(self.recv_timeout);
                    let this = self.clone();
                    let handler = self.handler.lock().clone();
                    self.scheduler.schedule_closure(
                        move || {
                            let _ = &this;
                            handler(client);
                        },
                        None,
                    );
                }
                Err(e) => {
                    error!("accept error: {e}");
                }
            }
        }
    }

    /// Schedules a closure onto this server's worker, pinned nowhere.
    pub fn schedule(&self, cb: impl FnOnce() + Send + 'static, worker: Option<WorkerId>) {
        self.scheduler.schedule_closure(cb, worker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_to_ephemeral_loopback_port_succeeds() {
        let stopping = Arc::new(AtomicBool::new(false));
        let scheduler = Arc::new(Scheduler::new(
            1,
            false,
            || {},
            move |_| Box::new(weft_core::NoopIdle::new(stopping.clone())),
        ));
        let server = Arc::new(TcpServer::new(scheduler));
        let addr = Address::V4("127.0.0.1:0".parse().unwrap());
        let (ok, fails) = server.bind(&[addr]);
        assert!(ok, "bind should succeed: {fails:?}");
    }

    #[test]
    fn binding_one_bad_address_clears_the_whole_batch() {
        let stopping = Arc::new(AtomicBool::new(false));
        let scheduler = Arc::new(Scheduler::new(
            1,
            false,
            || {},
            move |_| Box::new(weft_core::NoopIdle::new(stopping.clone())),
        ));
        let server = Arc::new(TcpServer::new(scheduler));
        let good = Address::V4("127.0.0.1:0".parse().unwrap());
        let bad = Address::unix("/this/path/does/not/exist/weft.sock", false);
        let (ok, fails) = server.bind(&[good, bad]);
        assert!(!ok);
        assert_eq!(fails.len(), 1);
    }
}
